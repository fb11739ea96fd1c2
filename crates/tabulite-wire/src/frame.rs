//! Frame headers and command codes.
//!
//! Every request travels as a fixed header followed by the command's
//! payload. Recovery traffic always sets [`FLAG_URGENT`] so the transport
//! can bypass request throttling.

use bytes::BytesMut;

use crate::serial::{get_u16, put_u16};
use crate::{Result, WireError};

/// Transport hint: deliver ahead of throttled traffic.
pub const FLAG_URGENT: u16 = 0x0001;

/// Recovery protocol commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandCode {
    PhantomReceive = 1,
    ReplayFragments = 2,
    PhantomUpdate = 3,
    ReplayComplete = 4,
    PhantomPrepareRanges = 5,
    PhantomPrepareComplete = 6,
    PhantomCommitRanges = 7,
    PhantomCommitComplete = 8,
    AcknowledgeLoad = 9,
}

impl CommandCode {
    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            1 => Ok(Self::PhantomReceive),
            2 => Ok(Self::ReplayFragments),
            3 => Ok(Self::PhantomUpdate),
            4 => Ok(Self::ReplayComplete),
            5 => Ok(Self::PhantomPrepareRanges),
            6 => Ok(Self::PhantomPrepareComplete),
            7 => Ok(Self::PhantomCommitRanges),
            8 => Ok(Self::PhantomCommitComplete),
            9 => Ok(Self::AcknowledgeLoad),
            other => Err(WireError::UnknownCommand(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PhantomReceive => "phantom receive",
            Self::ReplayFragments => "replay fragments",
            Self::PhantomUpdate => "phantom update",
            Self::ReplayComplete => "replay complete",
            Self::PhantomPrepareRanges => "phantom prepare ranges",
            Self::PhantomPrepareComplete => "phantom prepare complete",
            Self::PhantomCommitRanges => "phantom commit ranges",
            Self::PhantomCommitComplete => "phantom commit complete",
            Self::AcknowledgeLoad => "acknowledge load",
        }
    }
}

/// Fixed per-frame header preceding every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: CommandCode,
    pub flags: u16,
}

impl FrameHeader {
    /// Recovery frames are always urgent.
    pub fn urgent(command: CommandCode) -> Self {
        Self {
            command,
            flags: FLAG_URGENT,
        }
    }

    pub fn is_urgent(self) -> bool {
        self.flags & FLAG_URGENT != 0
    }

    pub fn encode(self, buf: &mut BytesMut) {
        put_u16(buf, self.command as u16);
        put_u16(buf, self.flags);
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let command = CommandCode::from_u16(get_u16(input)?)?;
        let flags = get_u16(input)?;
        Ok(Self { command, flags })
    }
}

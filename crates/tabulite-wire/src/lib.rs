//! Wire serialization for Tabulite recovery messages.
//!
//! The recovery protocol is a fixed byte format: length-prefixed frames
//! with a small header, payloads built from variable-length integers
//! (`vi32`/`vi64`), length-prefixed strings (`vstr`) and a handful of
//! fixed-width fields. This crate provides:
//!
//! - The serialization primitives ([`serial`])
//! - Frame headers and command codes ([`frame`])
//! - Typed request/response payloads for every recovery command
//!   ([`message`])
//!
//! Decoders take `&mut &[u8]` and consume what they parse, so composite
//! payloads decode by chaining. Truncated or malformed input surfaces as
//! [`WireError`], never a panic.

pub mod frame;
pub mod message;
pub mod serial;

mod error;

pub use error::{Result, WireError};
pub use frame::{CommandCode, FrameHeader, FLAG_URGENT};

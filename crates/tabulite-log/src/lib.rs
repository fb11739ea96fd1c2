//! Commit-log fragments and durable meta-logs.
//!
//! Two append-only on-disk formats live here:
//!
//! - **Commit-log fragments** ([`fragment`]): the units of a range
//!   server's write-ahead log. A fragment is a file of framed,
//!   checksummed, optionally block-compressed cell batches. Fragments are
//!   independent and replayable in any order; recovery enumerates a dead
//!   server's fragments by listing its log directory.
//! - **Meta-logs** ([`metalog`]): append-only streams of length-framed,
//!   type-tagged, checksummed records. The master meta-log records
//!   recovery state transitions; each range server's meta-log records its
//!   live ranges ([`rsml`]).
//!
//! Block compression ([`codec`]) follows the registry pattern used by the
//! rest of the storage stack: LZ4 for the hot path, Zstandard for colder
//! data, passthrough for tiny payloads.

pub mod codec;
pub mod fragment;
pub mod metalog;
pub mod rsml;

mod error;

pub use codec::{Codec, CodecRegistry, CompressionKind};
pub use error::{LogError, Result};

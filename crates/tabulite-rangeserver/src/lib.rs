//! Range-server side of failure recovery.
//!
//! When the master recovers a dead peer, every surviving range server
//! can be pressed into two roles:
//!
//! - **Receiver**: will own some of the recovered ranges. Buffers
//!   replayed cells per range in a [`PhantomRange`], a range being
//!   resurrected that is invisible to clients, then merges, stages and finally
//!   flips it live on the master's command.
//! - **Player**: reads some of the dead server's log fragments from
//!   shared storage and routes each cell to the receiver that will own
//!   its row ([`ReplayPlayer`]).
//!
//! [`RangeServerState`] wires the per-command handlers to one server's
//! phantom map, meta-log and on-disk layout.

pub mod fragment_data;
pub mod handlers;
pub mod phantom;
pub mod phantom_map;
pub mod player;
pub mod range;
pub mod replay_buffer;
pub mod schema;

mod error;

pub use error::{RangeServerError, Result};
pub use fragment_data::FragmentData;
pub use handlers::RangeServerState;
pub use phantom::{PhantomRange, PhantomState};
pub use phantom_map::PhantomRangeMap;
pub use player::ReplayPlayer;
pub use range::Range;
pub use replay_buffer::{RangeReplayBuffer, ReplayBuffer, UpdateSender};
pub use schema::{Schema, SchemaRegistry};

//! Outbound RPC seam for the recovery coordinator.
//!
//! The generic transport lives outside this repository; the coordinator
//! only needs these five sends. Sends are synchronous up to transport
//! acceptance: `phantom_receive` and `acknowledge_load` carry their reply
//! inline, while the three fan-out phases complete asynchronously through
//! the completion reports the context dispatches to the installed
//! trackers.

use tabulite_types::Location;
use tabulite_wire::message::{
    AcknowledgeLoad, AcknowledgeLoadResponse, PhantomRangesRequest, PhantomReceive,
    ReplayFragments,
};

use crate::Result;

/// The recovery coordinator's view of the range-server RPC surface.
pub trait RecoveryRpc: Send + Sync {
    /// Tells a receiver to allocate phantom buffers for its assigned
    /// ranges.
    fn phantom_receive(&self, dest: &Location, req: PhantomReceive) -> Result<()>;

    /// Kicks off fragment replay on a player. Completion arrives as a
    /// replay-complete report.
    fn replay_fragments(&self, player: &Location, req: ReplayFragments) -> Result<()>;

    /// Tells a receiver to merge its buffered fragments and stage its
    /// phantom ranges. Completion arrives as a prepare report.
    fn phantom_prepare_ranges(&self, dest: &Location, req: PhantomRangesRequest) -> Result<()>;

    /// Tells a receiver to durably flip its phantom ranges live.
    /// Completion arrives as a commit report.
    fn phantom_commit_ranges(&self, dest: &Location, req: PhantomRangesRequest) -> Result<()>;

    /// Tells a receiver the master has recorded the commit; the receiver
    /// retires its phantom entries.
    fn acknowledge_load(
        &self,
        dest: &Location,
        req: AcknowledgeLoad,
    ) -> Result<AcknowledgeLoadResponse>;
}

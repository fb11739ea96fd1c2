//! Recovery plan tables.
//!
//! A recovery attempt is described by two assignments:
//!
//! - the [`ReceiverPlan`]: which surviving server will own each recovered
//!   range, queryable by range (for routing a `(table, row)` to its
//!   destination) and by location (for enumerating a destination's work)
//! - the [`ReplayPlan`]: which surviving server replays each log fragment,
//!   queryable by fragment and by location
//!
//! [`RecoveryPlan`] bundles both together with the range group the plan
//! covers. Plans are encodable for durable persistence in the master
//! meta-log and for shipment to players inside replay-fragments requests;
//! encoding is deterministic (location order, then key order) so a plan
//! round-trips byte-for-byte.

mod receiver;
mod replay;

pub use receiver::ReceiverPlan;
pub use replay::ReplayPlan;

use bytes::BytesMut;
use tabulite_types::RangeGroup;
use tabulite_wire::serial::{get_i32, put_i32};
use tabulite_wire::Result;

/// The full assignment for one recovery attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryPlan {
    /// Group this plan covers; `None` until the plan is first built.
    pub group: Option<RangeGroup>,
    pub receiver_plan: ReceiverPlan,
    pub replay_plan: ReplayPlan,
}

impl RecoveryPlan {
    pub fn new(group: RangeGroup) -> Self {
        Self {
            group: Some(group),
            receiver_plan: ReceiverPlan::default(),
            replay_plan: ReplayPlan::default(),
        }
    }

    /// A plan is unbuilt until its group tag is set.
    pub fn is_unknown(&self) -> bool {
        self.group.is_none()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_i32(buf, self.group.map_or(0, RangeGroup::as_i32));
        self.receiver_plan.encode(buf);
        self.replay_plan.encode(buf);
    }

    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let group = RangeGroup::from_i32(get_i32(input)?);
        let receiver_plan = ReceiverPlan::decode(input)?;
        let replay_plan = ReplayPlan::decode(input)?;
        Ok(Self {
            group,
            receiver_plan,
            replay_plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tabulite_types::{Location, QualifiedRangeSpec, RangeSpec, RangeState, TableId};

    fn qrs(table: &str, start: &str, end: &str) -> QualifiedRangeSpec {
        QualifiedRangeSpec::new(
            TableId::new(table, 1),
            RangeSpec::new(start.as_bytes().to_vec(), end.as_bytes().to_vec()),
        )
    }

    fn arbitrary_plan() -> impl Strategy<Value = RecoveryPlan> {
        let entry = (
            "[a-d]{1,4}",
            "[a-z]{0,6}",
            "[a-z]{1,6}",
            prop::sample::select(vec!["rs1", "rs2", "rs3"]),
        );
        let fragment = (0u32..1000, prop::sample::select(vec!["rs1", "rs2", "rs3"]));
        (
            proptest::collection::vec(entry, 0..8),
            proptest::collection::vec(fragment, 0..8),
        )
            .prop_map(|(ranges, fragments)| {
                let mut plan = RecoveryPlan::new(RangeGroup::User);
                for (table, start, end, location) in ranges {
                    plan.receiver_plan.insert(
                        Location::from(location),
                        qrs(&table, &start, &end),
                        RangeState::SteadyState,
                    );
                }
                for (fragment, location) in fragments {
                    plan.replay_plan.insert(Location::from(location), fragment);
                }
                plan
            })
    }

    proptest! {
        #[test]
        fn plan_encoding_round_trips_exactly(plan in arbitrary_plan()) {
            let mut first = BytesMut::new();
            plan.encode(&mut first);
            let decoded = RecoveryPlan::decode(&mut &first[..]).unwrap();
            prop_assert_eq!(&decoded, &plan);

            let mut second = BytesMut::new();
            decoded.encode(&mut second);
            prop_assert_eq!(first, second);
        }
    }

    #[test]
    fn unknown_plan_round_trips() {
        let plan = RecoveryPlan::default();
        assert!(plan.is_unknown());
        let mut buf = BytesMut::new();
        plan.encode(&mut buf);
        let decoded = RecoveryPlan::decode(&mut &buf[..]).unwrap();
        assert!(decoded.is_unknown());
    }
}

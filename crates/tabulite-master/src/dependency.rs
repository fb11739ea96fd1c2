//! Dependency names shared between recovery operations.
//!
//! Operations declare sets of these names as dependencies (what must be
//! quiet before they run) and obstructions (what they keep busy while
//! alive). The strict group ordering (root before metadata before
//! system before user) is encoded entirely through these edges.

use tabulite_types::{Location, RangeGroup};

pub const ROOT: &str = "ROOT";
pub const METADATA: &str = "METADATA";
pub const SYSTEM: &str = "SYSTEM";
pub const RECOVER_SERVER: &str = "RECOVER_SERVER";

/// Sentinel for one failed server's user-range recovery.
pub fn user_group(location: &Location) -> String {
    format!("{location}-user")
}

/// The sentinel a recover-ranges operation of `group` keeps busy.
pub fn group_obstruction(group: RangeGroup, location: &Location) -> String {
    match group {
        RangeGroup::Root => ROOT.to_string(),
        RangeGroup::Metadata => METADATA.to_string(),
        RangeGroup::System => SYSTEM.to_string(),
        RangeGroup::User => user_group(location),
    }
}

/// The sentinels a recover-ranges operation of `group` waits on.
pub fn group_dependencies(group: RangeGroup) -> Vec<String> {
    match group {
        RangeGroup::Root => vec![],
        RangeGroup::Metadata => vec![ROOT.to_string()],
        RangeGroup::System => vec![ROOT.to_string(), METADATA.to_string()],
        RangeGroup::User => vec![
            ROOT.to_string(),
            METADATA.to_string(),
            SYSTEM.to_string(),
        ],
    }
}

//! In-memory range object.

use std::collections::BTreeMap;

use bytes::Bytes;
use tabulite_types::{CellKey, QualifiedRangeSpec, RangeState};

/// A range's in-memory cell store.
///
/// One value per row, resolved by cell revision: a write only lands if
/// its revision exceeds the stored one, which is how mutations replayed
/// out of order across fragments converge to the same result.
#[derive(Debug)]
pub struct Range {
    spec: QualifiedRangeSpec,
    state: RangeState,
    cells: BTreeMap<Bytes, (i64, Bytes)>,
}

impl Range {
    pub fn new(spec: QualifiedRangeSpec, state: RangeState) -> Self {
        Self {
            spec,
            state,
            cells: BTreeMap::new(),
        }
    }

    pub fn spec(&self) -> &QualifiedRangeSpec {
        &self.spec
    }

    pub fn state(&self) -> RangeState {
        self.state
    }

    pub fn set_state(&mut self, state: RangeState) {
        self.state = state;
    }

    /// Applies one cell mutation under the revision tie-break.
    pub fn add(&mut self, key: &CellKey, value: Bytes) {
        match self.cells.get(&key.row) {
            Some((revision, _)) if *revision >= key.revision => {}
            _ => {
                self.cells
                    .insert(key.row.clone(), (key.revision, value));
            }
        }
    }

    pub fn get(&self, row: &[u8]) -> Option<&Bytes> {
        self.cells.get(row).map(|(_, value)| value)
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabulite_types::{RangeSpec, TableId};

    fn range() -> Range {
        Range::new(
            QualifiedRangeSpec::new(
                TableId::new("7", 1),
                RangeSpec::new(&b"a"[..], &b"m"[..]),
            ),
            RangeState::Phantom,
        )
    }

    #[test]
    fn higher_revision_wins_regardless_of_arrival_order() {
        let mut range = range();
        range.add(&CellKey::new(&b"b"[..], 5), Bytes::from_static(b"new"));
        range.add(&CellKey::new(&b"b"[..], 3), Bytes::from_static(b"old"));
        assert_eq!(range.get(b"b").unwrap().as_ref(), b"new");

        range.add(&CellKey::new(&b"b"[..], 9), Bytes::from_static(b"newest"));
        assert_eq!(range.get(b"b").unwrap().as_ref(), b"newest");
        assert_eq!(range.cell_count(), 1);
    }

    #[test]
    fn equal_revision_keeps_first_value() {
        let mut range = range();
        range.add(&CellKey::new(&b"b"[..], 5), Bytes::from_static(b"first"));
        range.add(&CellKey::new(&b"b"[..], 5), Bytes::from_static(b"second"));
        assert_eq!(range.get(b"b").unwrap().as_ref(), b"first");
    }
}

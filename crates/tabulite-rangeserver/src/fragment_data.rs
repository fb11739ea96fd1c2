//! Buffered fragment payloads on a receiver.

use bytes::{Bytes, BytesMut};
use tabulite_wire::serial::get_cell_block;

use crate::range::Range;
use crate::Result;

/// The phantom-update payloads received so far for one fragment of one
/// phantom range.
#[derive(Debug, Default)]
pub struct FragmentData {
    events: Vec<Bytes>,
    done: bool,
}

impl FragmentData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers one phantom-update payload; `more = false` marks the
    /// fragment complete.
    pub fn add(&mut self, more: bool, payload: Bytes) {
        self.events.push(payload);
        if !more {
            self.done = true;
        }
    }

    /// True once the final (`more = false`) payload arrived.
    pub fn complete(&self) -> bool {
        self.done
    }

    /// Merges every buffered cell into `range` and appends the raw
    /// payload bytes to `concat` (the future transfer-log block).
    /// Returns the latest revision seen, or `i64::MIN` if no cells were
    /// buffered.
    pub fn merge(&self, range: &mut Range, concat: &mut BytesMut) -> Result<i64> {
        let mut latest_revision = i64::MIN;
        for event in &self.events {
            for (key, value) in get_cell_block(event)? {
                if key.revision > latest_revision {
                    latest_revision = key.revision;
                }
                range.add(&key, value);
            }
            concat.extend_from_slice(event);
        }
        Ok(latest_revision)
    }

    /// Frees the buffered events of a completed fragment.
    ///
    /// # Panics
    ///
    /// Clearing an incomplete fragment is a programmer error.
    pub fn clear(&mut self) {
        assert!(self.done, "clearing incomplete fragment data");
        self.events.clear();
    }

    /// Drops buffered events without completing the fragment; used when
    /// a receiver abandons a replay attempt.
    pub(crate) fn discard_events(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tabulite_types::{CellKey, QualifiedRangeSpec, RangeSpec, RangeState, TableId};
    use tabulite_wire::serial::put_cell;

    fn payload(cells: &[(&str, i64, &str)]) -> Bytes {
        let mut buf = BytesMut::new();
        for (row, revision, value) in cells {
            put_cell(
                &mut buf,
                &CellKey::new(row.as_bytes().to_vec(), *revision),
                value.as_bytes(),
            );
        }
        buf.freeze()
    }

    fn test_range() -> Range {
        Range::new(
            QualifiedRangeSpec::new(
                TableId::new("7", 1),
                RangeSpec::new(&b""[..], &b"zzz"[..]),
            ),
            RangeState::Phantom,
        )
    }

    #[test]
    fn merge_applies_cells_and_concatenates_payloads() {
        let mut data = FragmentData::new();
        data.add(true, payload(&[("row1", 3, "a"), ("row2", 7, "b")]));
        data.add(false, payload(&[("row1", 5, "c")]));
        assert!(data.complete());

        let mut range = test_range();
        let mut concat = BytesMut::new();
        let latest = data.merge(&mut range, &mut concat).unwrap();

        assert_eq!(latest, 7);
        assert_eq!(range.get(b"row1").unwrap().as_ref(), b"c");
        assert_eq!(range.get(b"row2").unwrap().as_ref(), b"b");
        assert!(!concat.is_empty());
    }

    #[test]
    #[should_panic(expected = "clearing incomplete fragment")]
    fn clear_on_incomplete_fragment_panics() {
        let mut data = FragmentData::new();
        data.add(true, payload(&[("row", 1, "v")]));
        data.clear();
    }

    #[test]
    fn clear_after_completion_frees_events() {
        let mut data = FragmentData::new();
        data.add(false, payload(&[("row", 1, "v")]));
        data.clear();
        let mut range = test_range();
        let mut concat = BytesMut::new();
        assert_eq!(data.merge(&mut range, &mut concat).unwrap(), i64::MIN);
    }
}

//! Thread-safe map of phantom ranges on one destination.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tabulite_types::{QualifiedRangeSpec, RangeState};

use crate::phantom::PhantomRange;
use crate::schema::Schema;

/// The phantom ranges a destination is currently resurrecting, keyed by
/// qualified range spec.
#[derive(Debug, Default)]
pub struct PhantomRangeMap {
    map: Mutex<BTreeMap<QualifiedRangeSpec, Arc<PhantomRange>>>,
}

impl PhantomRangeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh phantom range.
    ///
    /// # Panics
    ///
    /// The range must not already be present; phantom-receive goes
    /// through [`get_or_create`](Self::get_or_create) instead.
    pub fn insert(&self, phantom: Arc<PhantomRange>) {
        let prior = self
            .map
            .lock()
            .unwrap()
            .insert(phantom.spec().clone(), phantom);
        assert!(prior.is_none(), "phantom range already present");
    }

    pub fn get(&self, spec: &QualifiedRangeSpec) -> Option<Arc<PhantomRange>> {
        self.map.lock().unwrap().get(spec).cloned()
    }

    /// The existing phantom for `spec`, or a fresh one expecting
    /// `fragments`.
    pub fn get_or_create(
        &self,
        spec: &QualifiedRangeSpec,
        initial_state: RangeState,
        schema: Arc<Schema>,
        fragments: &[u32],
    ) -> Arc<PhantomRange> {
        self.map
            .lock()
            .unwrap()
            .entry(spec.clone())
            .or_insert_with(|| {
                Arc::new(PhantomRange::new(
                    spec.clone(),
                    initial_state,
                    schema,
                    fragments,
                ))
            })
            .clone()
    }

    pub fn remove(&self, spec: &QualifiedRangeSpec) -> Option<Arc<PhantomRange>> {
        self.map.lock().unwrap().remove(spec)
    }

    pub fn get_all(&self) -> Vec<Arc<PhantomRange>> {
        self.map.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabulite_types::{RangeSpec, TableId};

    fn spec(start: &str) -> QualifiedRangeSpec {
        QualifiedRangeSpec::new(
            TableId::new("7", 1),
            RangeSpec::new(start.as_bytes().to_vec(), &b"zzz"[..]),
        )
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(&TableId::new("7", 1), vec!["cf".to_string()]))
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let map = PhantomRangeMap::new();
        let first = map.get_or_create(&spec("a"), RangeState::SteadyState, schema(), &[1, 2]);
        let second = map.get_or_create(&spec("a"), RangeState::SteadyState, schema(), &[1, 2]);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_then_get_misses() {
        let map = PhantomRangeMap::new();
        map.get_or_create(&spec("a"), RangeState::SteadyState, schema(), &[1]);
        assert!(map.remove(&spec("a")).is_some());
        assert!(map.get(&spec("a")).is_none());
        assert!(map.is_empty());
    }

    #[test]
    #[should_panic(expected = "already present")]
    fn double_insert_is_fatal() {
        let map = PhantomRangeMap::new();
        let phantom = Arc::new(PhantomRange::new(
            spec("a"),
            RangeState::SteadyState,
            schema(),
            &[1],
        ));
        map.insert(phantom.clone());
        map.insert(phantom);
    }
}

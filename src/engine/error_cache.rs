//! Deferred error cache.
//!
//! The designated sink for faults that should not halt execution. Entries
//! accumulate in insertion order until an epoch boundary, a `PURGE_EPOCH`
//! instruction, or a `NULLIFY` command drains them in one batch. Fatal
//! faults bypass this cache entirely.

/// One deferred fault record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Identifies the faulting signal or opcode context; unique per cache.
    pub key: String,
    /// Symbolic error code, e.g. `#EID:22FC`.
    pub glyph: String,
    /// Epoch at which the fault was (last) raised.
    pub epoch_raised: u64,
}

/// Keyed, insertion-ordered cache of deferred faults.
#[derive(Debug, Default)]
pub struct DeferredErrorCache {
    entries: Vec<ErrorEntry>,
}

impl DeferredErrorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a fault. Never raises to the caller.
    ///
    /// Re-deferring an existing key refreshes `epoch_raised` but keeps the
    /// original glyph: repeated identical faults must not mask the
    /// originating condition.
    pub fn defer(&mut self, key: &str, glyph: &str, epoch: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.epoch_raised = epoch;
            return;
        }
        self.entries.push(ErrorEntry {
            key: key.to_string(),
            glyph: glyph.to_string(),
            epoch_raised: epoch,
        });
    }

    /// Atomically empties the cache, returning the removed entries in
    /// insertion order so the front-end can display them before they
    /// vanish.
    pub fn purge(&mut self) -> Vec<ErrorEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Read-only view of the pending entries, in insertion order.
    pub fn peek(&self) -> &[ErrorEntry] {
        &self.entries
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Glyphs of the pending entries, for snapshots.
    pub fn glyphs(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.glyph.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defer_and_peek() {
        let mut cache = DeferredErrorCache::new();
        cache.defer("pulse:r20", "#EID:0R16", 1);
        cache.defer("drift", "#EID:22FC", 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.peek()[0].key, "pulse:r20");
        assert_eq!(cache.peek()[1].epoch_raised, 2);
    }

    #[test]
    fn same_key_keeps_first_glyph_and_latest_epoch() {
        let mut cache = DeferredErrorCache::new();
        cache.defer("drift", "#EID:22FC", 1);
        cache.defer("drift", "#EID:FFFF", 5);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek()[0].glyph, "#EID:22FC");
        assert_eq!(cache.peek()[0].epoch_raised, 5);
    }

    #[test]
    fn purge_drains_in_insertion_order() {
        let mut cache = DeferredErrorCache::new();
        cache.defer("a", "#EID:000A", 1);
        cache.defer("b", "#EID:000B", 1);
        let removed = cache.purge();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].key, "a");
        assert_eq!(removed[1].key, "b");
        assert!(cache.is_empty());
        assert!(cache.purge().is_empty());
    }

    #[test]
    fn glyphs_follow_insertion_order() {
        let mut cache = DeferredErrorCache::new();
        cache.defer("a", "#EID:000A", 1);
        cache.defer("b", "#EID:000B", 1);
        assert_eq!(cache.glyphs(), vec!["#EID:000A", "#EID:000B"]);
    }
}

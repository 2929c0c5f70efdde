//! The shared watched-address set (spec §5, "Shared mutable state").
//!
//! Maps a scriptPubKey to the intent id it is assigned to. Populated from
//! `listAssignedAddresses()` at startup and mutated by `ensureAssigned` (add)
//! and intent confirmation (remove). All accesses are guarded by a single
//! lock, held only for set operations and never across an `.await` point
//! (spec §5).

use std::collections::HashMap;
use std::sync::Mutex;

use bitcoin::ScriptBuf;

use crate::model::IntentId;

/// In-process index from scriptPubKey to the intent currently watching it.
#[derive(Debug, Default)]
pub struct WatchedAddressSet {
    inner: Mutex<HashMap<ScriptBuf, IntentId>>,
}

impl WatchedAddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the set from storage at startup, e.g. via
    /// `listAssignedAddresses()`.
    pub fn seed<I: IntoIterator<Item = (ScriptBuf, IntentId)>>(&self, entries: I) {
        let mut guard = self.inner.lock().unwrap();
        guard.clear();
        guard.extend(entries);
    }

    /// Adds a single watched address, called by `ensureAssigned`.
    pub fn insert(&self, script_pubkey: ScriptBuf, intent_id: IntentId) {
        self.inner.lock().unwrap().insert(script_pubkey, intent_id);
    }

    /// Removes a watched address, called once an intent is confirmed (it no
    /// longer needs to be watched for new activity).
    pub fn remove(&self, script_pubkey: &ScriptBuf) {
        self.inner.lock().unwrap().remove(script_pubkey);
    }

    /// Looks up the intent watching `script_pubkey`, if any.
    pub fn lookup(&self, script_pubkey: &ScriptBuf) -> Option<IntentId> {
        self.inner.lock().unwrap().get(script_pubkey).copied()
    }

    /// Whether `script_pubkey` is currently watched, independent of which
    /// intent owns it.
    pub fn contains(&self, script_pubkey: &ScriptBuf) -> bool {
        self.inner.lock().unwrap().contains_key(script_pubkey)
    }

    /// Number of addresses currently watched. Used for diagnostics.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clears the set entirely, called by `stopWatcher` (spec §5).
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::ScriptBuf;

    fn spk(n: u8) -> ScriptBuf {
        ScriptBuf::from_bytes(vec![n; 5])
    }

    #[test]
    fn insert_lookup_remove() {
        let set = WatchedAddressSet::new();
        let intent = IntentId::new_v4();
        assert!(set.lookup(&spk(1)).is_none());
        set.insert(spk(1), intent);
        assert_eq!(set.lookup(&spk(1)), Some(intent));
        set.remove(&spk(1));
        assert!(set.lookup(&spk(1)).is_none());
    }

    #[test]
    fn seed_replaces_contents() {
        let set = WatchedAddressSet::new();
        let i1 = IntentId::new_v4();
        let i2 = IntentId::new_v4();
        set.insert(spk(9), i1);
        set.seed(vec![(spk(1), i2)]);
        assert!(set.lookup(&spk(9)).is_none());
        assert_eq!(set.lookup(&spk(1)), Some(i2));
    }
}

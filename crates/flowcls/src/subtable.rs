//! Subtables: the set of rules sharing one exact mask.
//!
//! Reads go through epoch-pinned guards and never block; rule mutation is
//! serialized by a per-subtable mutex with a bounded critical section.
//! Storage for removed rules is reclaimed only after every in-flight
//! reader has released its guard.

use crate::error::{ClassifierError, Result};
use crate::key::{FlowKey, Mask, MaskedKey};
use crate::lookup::{self, LookupImpl, LookupPolicy};
use crate::rule::RuleHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub(crate) struct Subtable {
    mask: Arc<Mask>,
    /// Flattened mask words, bitmap order. Saves re-walking the mask's
    /// buffer on every probe.
    mask_words: Box<[u64]>,
    unit_counts: (u8, u8),
    lookup: LookupImpl,
    rules: flurry::HashMap<MaskedKey, RuleHandle>,
    /// Serializes rule mutation. Lookups never take it.
    write_lock: Mutex<()>,
    /// Matches in the current optimization interval. Relaxed adds only;
    /// feeds the advisory reordering pass, never correctness.
    hit_cnt: AtomicU64,
}

impl Subtable {
    pub(crate) fn new(mask: Arc<Mask>, policy: LookupPolicy) -> Subtable {
        let unit_counts = mask.unit_counts();
        let lookup = lookup::select(unit_counts, policy);
        tracing::debug!(
            shape = ?unit_counts,
            lookup = lookup.name(),
            "subtable created"
        );

        Subtable {
            mask_words: mask.flatten(),
            mask,
            unit_counts,
            lookup,
            rules: flurry::HashMap::new(),
            write_lock: Mutex::new(()),
            hit_cnt: AtomicU64::new(0),
        }
    }

    #[inline(always)]
    pub(crate) fn mask(&self) -> &Mask {
        &self.mask
    }

    pub(crate) fn mask_arc(&self) -> Arc<Mask> {
        Arc::clone(&self.mask)
    }

    #[inline(always)]
    pub(crate) fn mask_words(&self) -> &[u64] {
        &self.mask_words
    }

    pub(crate) fn unit_counts(&self) -> (u8, u8) {
        self.unit_counts
    }

    #[inline(always)]
    pub(crate) fn lookup_impl(&self) -> LookupImpl {
        self.lookup
    }

    #[inline(always)]
    pub(crate) fn rules(&self) -> &flurry::HashMap<MaskedKey, RuleHandle> {
        &self.rules
    }

    /// Insert a rule. The rule's masked key must be unique within the
    /// subtable; a duplicate is rejected, never overwritten.
    pub(crate) fn insert(&self, rule: RuleHandle) -> Result<()> {
        let _write = self.write_lock.lock();
        let rules = self.rules.pin();
        if rules.contains_key(rule.masked_key()) {
            return Err(ClassifierError::DuplicateRule);
        }
        rules.insert(rule.masked_key().clone(), rule);
        Ok(())
    }

    /// Remove `rule`, if it is the rule installed under its masked key.
    /// A stale handle whose pattern was since re-installed by a different
    /// rule removes nothing. Readers still holding the rule keep a valid
    /// reference until they drop it.
    pub(crate) fn remove(&self, rule: &RuleHandle) -> Option<RuleHandle> {
        let _write = self.write_lock.lock();
        let rules = self.rules.pin();
        let stored = rules.get(rule.masked_key())?;
        if !Arc::ptr_eq(stored, rule) {
            return None;
        }
        rules.remove(rule.masked_key()).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.rules.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Probe with every key whose bit is set in `keys_map`; see
    /// [`lookup::lookup_batch`].
    #[inline]
    pub(crate) fn lookup_batch(
        &self,
        keys: &[FlowKey],
        keys_map: u32,
        results: &mut [Option<RuleHandle>],
    ) -> u32 {
        lookup::lookup_batch(self, keys, keys_map, results)
    }

    #[inline(always)]
    pub(crate) fn add_hits(&self, n: u64) {
        self.hit_cnt.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn hits(&self) -> u64 {
        self.hit_cnt.load(Ordering::Relaxed)
    }

    /// Read and reset the interval hit count, for the reordering pass.
    pub(crate) fn take_hits(&self) -> u64 {
        self.hit_cnt.swap(0, Ordering::Relaxed)
    }
}

//! The classifier: subtable set, batch lookup, advisory reordering.

use crate::error::{ClassifierError, Result};
use crate::key::{FlowKey, Mask};
use crate::lookup::LookupPolicy;
use crate::rule::{Rule, RuleHandle};
use crate::stats::{ClassifierStats, StatsSnapshot};
use crate::subtable::Subtable;
use crate::MAX_BATCH;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Classifier configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifierConfig {
    /// Which lookup routines subtables may select.
    pub lookup_policy: LookupPolicy,
}

/// Per-subtable view for debugging and introspection.
#[derive(Debug, Clone, Serialize)]
pub struct SubtableInfo {
    /// The subtable's mask as `(field id, care-bits)` pairs.
    pub mask: Vec<(u8, u64)>,
    /// Words populated in each bitmap unit.
    pub shape: (u8, u8),
    /// Name of the selected lookup routine.
    pub lookup: &'static str,
    /// Installed rules.
    pub rules: usize,
    /// Hits in the current optimization interval.
    pub hits: u64,
}

/// Multi-subtable wildcard classifier.
///
/// Owns one subtable per distinct mask and probes them, for each lookup
/// batch, in an adaptively tuned order. Lookups are lock-free and may run
/// from any number of threads concurrently with rule insertion and
/// removal.
///
/// # Probe order is advisory
///
/// When subtables with overlapping masks both match a key, the first
/// subtable in the current probe order wins, and [`rebalance`] reorders
/// subtables by recent hit counts. Callers that need a deterministic
/// winner among overlapping rules must arrange that themselves; the
/// classifier resolves overlap by cost, not priority.
///
/// [`rebalance`]: Classifier::rebalance
pub struct Classifier {
    /// Current probe order. Swapped atomically; lookups iterate a
    /// snapshot and never block.
    subtables: ArcSwap<Vec<Arc<Subtable>>>,
    /// Structural state: the mask-to-subtable index. Guards subtable
    /// creation/destruction and serializes rule mutation at the
    /// classifier level.
    inner: Mutex<HashMap<Arc<Mask>, Arc<Subtable>>>,
    config: ClassifierConfig,
    stats: ClassifierStats,
}

impl Classifier {
    /// Create an empty classifier with the default configuration.
    pub fn new() -> Classifier {
        Classifier::with_config(ClassifierConfig::default())
    }

    /// Create an empty classifier.
    pub fn with_config(config: ClassifierConfig) -> Classifier {
        Classifier {
            subtables: ArcSwap::from_pointee(Vec::new()),
            inner: Mutex::new(HashMap::new()),
            config,
            stats: ClassifierStats::default(),
        }
    }

    /// Install a rule matching `key` under `mask`.
    ///
    /// The subtable for `mask` is created on first use. The new rule is
    /// matchable by every lookup that starts after this returns.
    ///
    /// Returns [`ClassifierError::DuplicateRule`] if the subtable already
    /// holds a rule with the same masked key.
    ///
    /// # Panics
    ///
    /// Panics if `key` does not populate every field `mask` constrains.
    pub fn insert(&self, mask: &Mask, key: &FlowKey) -> Result<RuleHandle> {
        assert!(
            key.map().is_superset_of(mask.map()),
            "rule key does not populate every field its mask constrains"
        );

        let mut inner = self.inner.lock();
        let subtable = match inner.get(mask) {
            Some(st) => Arc::clone(st),
            None => {
                let st = Arc::new(Subtable::new(
                    Arc::new(mask.clone()),
                    self.config.lookup_policy,
                ));
                inner.insert(st.mask_arc(), Arc::clone(&st));

                // Publish before the first rule lands; lookups seeing an
                // empty subtable is fine.
                let mut order = (**self.subtables.load()).clone();
                order.push(Arc::clone(&st));
                self.subtables.store(Arc::new(order));
                self.stats.record_subtable_created();
                st
            }
        };

        let rule = Arc::new(Rule::new(subtable.mask().apply(key), subtable.mask_arc()));
        subtable.insert(Arc::clone(&rule))?;
        self.stats.record_insert();
        Ok(rule)
    }

    /// Remove an installed rule.
    ///
    /// The rule stops matching for every lookup that starts after this
    /// returns; lookups already in flight may still return it. Removing
    /// a subtable's last rule destroys the subtable.
    ///
    /// Returns [`ClassifierError::RuleNotFound`] if the handle does not
    /// name an installed rule, e.g. it was already removed. Removal goes
    /// by rule identity: a stale handle never removes a later rule that
    /// happens to share its pattern.
    pub fn remove(&self, handle: &RuleHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let subtable = inner
            .get(handle.mask())
            .cloned()
            .ok_or(ClassifierError::RuleNotFound)?;

        subtable
            .remove(handle)
            .ok_or(ClassifierError::RuleNotFound)?;
        self.stats.record_remove();

        if subtable.is_empty() {
            inner.remove(handle.mask());
            let order: Vec<Arc<Subtable>> = self
                .subtables
                .load()
                .iter()
                .filter(|st| !Arc::ptr_eq(st, &subtable))
                .cloned()
                .collect();
            self.subtables.store(Arc::new(order));
            self.stats.record_subtable_destroyed();
            tracing::debug!("empty subtable destroyed");
        }

        Ok(())
    }

    /// Classify a batch of at most [`MAX_BATCH`] keys.
    ///
    /// For each `keys[i]` that matches, `results[i]` is set to the
    /// matching rule's handle; bit `i` of the returned miss map is set
    /// for keys that matched nothing. A miss is a normal outcome, not an
    /// error; slow-path resolution is the caller's business.
    ///
    /// # Panics
    ///
    /// Panics if the batch exceeds [`MAX_BATCH`] keys or `results` is
    /// shorter than `keys`.
    pub fn lookup_batch(
        &self,
        keys: &[FlowKey],
        results: &mut [Option<RuleHandle>],
    ) -> u32 {
        assert!(keys.len() <= MAX_BATCH, "batch exceeds MAX_BATCH keys");
        assert!(results.len() >= keys.len(), "results slice too short");

        for slot in results[..keys.len()].iter_mut() {
            *slot = None;
        }
        self.stats.record_batch(keys.len() as u64);

        let mut active = if keys.len() == MAX_BATCH {
            u32::MAX
        } else {
            (1u32 << keys.len()) - 1
        };

        let order = self.subtables.load();
        for subtable in order.iter() {
            if active == 0 {
                break;
            }
            self.stats.record_subtable_probe();

            let found = subtable.lookup_batch(keys, active, results);
            if found != 0 {
                let hits = found.count_ones() as u64;
                subtable.add_hits(hits);
                self.stats.record_hits(hits);
                active &= !found;
            }
        }

        self.stats.record_misses(active.count_ones() as u64);
        active
    }

    /// Classify a single key.
    pub fn lookup(&self, key: &FlowKey) -> Option<RuleHandle> {
        let mut results: [Option<RuleHandle>; 1] = [None];
        let miss = self.lookup_batch(std::slice::from_ref(key), &mut results);
        if miss == 0 {
            results[0].take()
        } else {
            None
        }
    }

    /// Re-sort the probe order by descending hit count and reset the
    /// interval counters.
    ///
    /// Frequently matching subtables move to the front, cutting the
    /// average number of probes per key. Never changes *whether* a key
    /// matches, only how quickly the match is found. Triggering this
    /// periodically is the caller's business.
    pub fn rebalance(&self) {
        let _inner = self.inner.lock();

        let mut scored: Vec<(u64, Arc<Subtable>)> = self
            .subtables
            .load()
            .iter()
            .map(|st| (st.take_hits(), Arc::clone(st)))
            .collect();
        // Stable: ties keep their previous relative order.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let order: Vec<Arc<Subtable>> = scored.into_iter().map(|(_, st)| st).collect();
        tracing::debug!(subtables = order.len(), "probe order rebalanced");
        self.subtables.store(Arc::new(order));
    }

    /// Total number of installed rules.
    pub fn len(&self) -> usize {
        self.subtables.load().iter().map(|st| st.len()).sum()
    }

    /// Is no rule installed?
    pub fn is_empty(&self) -> bool {
        self.subtables.load().is_empty()
    }

    /// Number of live subtables (distinct masks).
    pub fn subtable_count(&self) -> usize {
        self.subtables.load().len()
    }

    /// Per-subtable introspection, in current probe order.
    pub fn subtable_info(&self) -> Vec<SubtableInfo> {
        self.subtables
            .load()
            .iter()
            .map(|st| SubtableInfo {
                mask: st.mask().map().iter().zip(st.mask().words().iter()).map(|(f, &w)| (f as u8, w)).collect(),
                shape: st.unit_counts(),
                lookup: st.lookup_impl().name(),
                rules: st.len(),
                hits: st.hits(),
            })
            .collect()
    }

    /// Point-in-time counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for Classifier {
    fn default() -> Classifier {
        Classifier::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove() {
        let cls = Classifier::new();
        let rule = cls
            .insert(&Mask::exact([1]), &FlowKey::from_fields([(1, 5)]))
            .unwrap();
        assert_eq!(cls.len(), 1);
        assert_eq!(cls.subtable_count(), 1);

        let hit = cls.lookup(&FlowKey::from_fields([(1, 5), (2, 9)])).unwrap();
        assert!(Arc::ptr_eq(&hit, &rule));
        assert!(cls.lookup(&FlowKey::from_fields([(1, 6)])).is_none());

        cls.remove(&rule).unwrap();
        assert!(cls.lookup(&FlowKey::from_fields([(1, 5), (2, 9)])).is_none());
        assert!(cls.is_empty());
        // Subtable went away with its last rule.
        assert_eq!(cls.subtable_count(), 0);
    }

    #[test]
    fn one_subtable_per_mask() {
        let cls = Classifier::new();
        cls.insert(&Mask::exact([1]), &FlowKey::from_fields([(1, 5)]))
            .unwrap();
        cls.insert(&Mask::exact([1]), &FlowKey::from_fields([(1, 6)]))
            .unwrap();
        cls.insert(&Mask::exact([1, 2]), &FlowKey::from_fields([(1, 1), (2, 2)]))
            .unwrap();

        assert_eq!(cls.subtable_count(), 2);
        assert_eq!(cls.len(), 3);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let cls = Classifier::new();
        let mask = Mask::from_fields([(1, 0xff)]);
        cls.insert(&mask, &FlowKey::from_fields([(1, 0x105)])).unwrap();
        // 0x205 masks to the same 0x05.
        let err = cls
            .insert(&mask, &FlowKey::from_fields([(1, 0x205)]))
            .unwrap_err();
        assert_eq!(err, ClassifierError::DuplicateRule);
    }

    #[test]
    fn remove_twice_fails() {
        let cls = Classifier::new();
        let rule = cls
            .insert(&Mask::exact([1]), &FlowKey::from_fields([(1, 5)]))
            .unwrap();
        cls.remove(&rule).unwrap();
        assert_eq!(cls.remove(&rule).unwrap_err(), ClassifierError::RuleNotFound);
    }

    #[test]
    fn stale_handle_cannot_remove_reinstalled_rule() {
        let cls = Classifier::new();
        let mask = Mask::exact([1]);
        let key = FlowKey::from_fields([(1, 5)]);

        let old = cls.insert(&mask, &key).unwrap();
        cls.remove(&old).unwrap();
        let fresh = cls.insert(&mask, &key).unwrap();

        assert_eq!(cls.remove(&old).unwrap_err(), ClassifierError::RuleNotFound);
        let hit = cls.lookup(&key).unwrap();
        assert!(Arc::ptr_eq(&hit, &fresh));
    }

    #[test]
    #[should_panic(expected = "does not populate")]
    fn insert_key_missing_mask_field_panics() {
        let cls = Classifier::new();
        cls.insert(&Mask::exact([1, 2]), &FlowKey::from_fields([(1, 5)]))
            .ok();
    }

    #[test]
    fn batch_lookup_miss_map() {
        let cls = Classifier::new();
        let rx = cls
            .insert(&Mask::exact([1]), &FlowKey::from_fields([(1, 10)]))
            .unwrap();
        let ry = cls
            .insert(&Mask::exact([2]), &FlowKey::from_fields([(2, 20)]))
            .unwrap();

        let keys = vec![
            FlowKey::from_fields([(1, 10)]),
            FlowKey::from_fields([(2, 20)]),
            FlowKey::from_fields([(1, 10), (3, 3)]),
            FlowKey::from_fields([(4, 4)]),
        ];
        let mut results: Vec<Option<RuleHandle>> = vec![None; 4];
        let miss = cls.lookup_batch(&keys, &mut results);

        assert_eq!(miss, 0b1000);
        assert!(Arc::ptr_eq(results[0].as_ref().unwrap(), &rx));
        assert!(Arc::ptr_eq(results[1].as_ref().unwrap(), &ry));
        assert!(Arc::ptr_eq(results[2].as_ref().unwrap(), &rx));
        assert!(results[3].is_none());
    }

    #[test]
    fn rebalance_reorders_without_changing_matches() {
        let cls = Classifier::new();
        cls.insert(&Mask::exact([1]), &FlowKey::from_fields([(1, 1)]))
            .unwrap();
        cls.insert(&Mask::exact([2]), &FlowKey::from_fields([(2, 2)]))
            .unwrap();

        // Drive hits to the second subtable only.
        let key = FlowKey::from_fields([(2, 2)]);
        for _ in 0..16 {
            cls.lookup(&key).unwrap();
        }

        let before: Vec<_> = {
            let keys = [FlowKey::from_fields([(1, 1)]), FlowKey::from_fields([(2, 2)])];
            keys.iter().map(|k| cls.lookup(k).map(|r| Arc::as_ptr(&r))).collect()
        };

        cls.rebalance();
        let info = cls.subtable_info();
        // Hot subtable (mask on field 2) now probes first.
        assert_eq!(info[0].mask[0].0, 2);

        let after: Vec<_> = {
            let keys = [FlowKey::from_fields([(1, 1)]), FlowKey::from_fields([(2, 2)])];
            keys.iter().map(|k| cls.lookup(k).map(|r| Arc::as_ptr(&r))).collect()
        };
        assert_eq!(before, after);
    }

    #[test]
    fn stats_track_lookups() {
        let cls = Classifier::new();
        cls.insert(&Mask::exact([1]), &FlowKey::from_fields([(1, 1)]))
            .unwrap();
        cls.lookup(&FlowKey::from_fields([(1, 1)]));
        cls.lookup(&FlowKey::from_fields([(1, 9)]));

        let snap = cls.stats();
        assert_eq!(snap.batches, 2);
        assert_eq!(snap.keys, 2);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.rule_inserts, 1);
        assert_eq!(snap.subtables_created, 1);
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let cls = Classifier::new();
        let mut results: Vec<Option<RuleHandle>> = Vec::new();
        assert_eq!(cls.lookup_batch(&[], &mut results), 0);
    }

    #[test]
    fn generic_only_policy_matches_default() {
        let generic = Classifier::with_config(ClassifierConfig {
            lookup_policy: LookupPolicy::GenericOnly,
        });
        let auto = Classifier::new();

        for cls in [&generic, &auto] {
            cls.insert(&Mask::exact([1, 2]), &FlowKey::from_fields([(1, 1), (2, 2)]))
                .unwrap();
        }
        let key = FlowKey::from_fields([(1, 1), (2, 2), (3, 3)]);
        assert!(generic.lookup(&key).is_some());
        assert!(auto.lookup(&key).is_some());
    }
}

//! Installed rules.

use crate::key::{FlowKey, Mask, MaskedKey};
use std::fmt;
use std::sync::Arc;

/// A rule installed in the classifier.
///
/// Holds the rule's match value restricted to the owning subtable's mask,
/// plus a shared reference to that mask. Fields outside the mask are
/// irrelevant: matching compares only masked bits.
pub struct Rule {
    key: MaskedKey,
    mask: Arc<Mask>,
}

/// Shared handle to an installed rule.
///
/// Returned by insert, reported by lookups, and passed back to remove.
/// Lookups running concurrently with a removal may still hold the handle;
/// the rule's storage outlives them all.
pub type RuleHandle = Arc<Rule>;

impl Rule {
    pub(crate) fn new(key: MaskedKey, mask: Arc<Mask>) -> Rule {
        Rule { key, mask }
    }

    /// The owning subtable's mask.
    #[inline(always)]
    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    pub(crate) fn mask_arc(&self) -> &Arc<Mask> {
        &self.mask
    }

    /// The rule's match value, restricted to the mask.
    #[inline(always)]
    pub fn masked_key(&self) -> &MaskedKey {
        &self.key
    }

    /// Does `key` match this rule?
    ///
    /// True iff `key` populates every field the rule's mask constrains
    /// and, for each of those fields, `key.word & mask.word` equals the
    /// rule's stored word. A key lacking a required field never matches.
    ///
    /// The batch lookup path reaches the same decision through hashed
    /// probes; this direct comparison is the reference predicate, used by
    /// revalidation paths and tests.
    pub fn matches(&self, key: &FlowKey) -> bool {
        if !key.map().is_superset_of(self.mask.map()) {
            return false;
        }

        self.mask
            .map()
            .iter()
            .zip(self.mask.words().iter())
            .zip(self.key.words().iter())
            .all(|((field, &mask_word), &rule_word)| {
                // Superset holds, so the unwrap cannot fire.
                key.word(field).unwrap() & mask_word == rule_word
            })
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("mask", &self.mask)
            .field("key", &self.key)
            .finish()
    }
}

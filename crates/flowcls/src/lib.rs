//! Multi-subtable wildcard flow classifier for software fast paths.
//!
//! Given a packet's extracted header fields, the classifier finds which
//! installed forwarding rule (if any) matches, where every rule carries its
//! own wildcard mask: some fields fixed, others "don't care". Rules sharing
//! a bitwise-identical mask live in one *subtable*; a lookup probes the
//! subtables in an adaptively tuned order until a match is found.
//!
//! # Architecture
//!
//! ```text
//!   batch of FlowKeys (≤32)
//!          │
//!          ▼
//!   ┌─────────────────────────────────────────────┐
//!   │ Classifier                                  │
//!   │   subtable order (atomic snapshot)          │
//!   │   ┌───────────┐  ┌───────────┐              │
//!   │   │ Subtable  │  │ Subtable  │  ...         │
//!   │   │ mask M0   │  │ mask M1   │              │
//!   │   │ rule map  │  │ rule map  │              │
//!   │   │ (lock-    │  │ (lock-    │              │
//!   │   │  free rd) │  │  free rd) │              │
//!   │   └───────────┘  └───────────┘              │
//!   └─────────────────────────────────────────────┘
//!          │
//!          ▼
//!   per key: matched RuleHandle, or miss
//! ```
//!
//! # Concurrency
//!
//! The lookup path takes no locks: the subtable order is an atomically
//! swapped snapshot, rule maps are read through epoch-pinned guards, and
//! subtable hit counters are relaxed atomic adds. Rule and subtable
//! mutation happens under short mutex-protected critical sections, and
//! storage for removed rules is reclaimed only after every reader that
//! could still see it has moved on.
//!
//! # Ordering is advisory only
//!
//! When two subtables both match a key, the first subtable in the current
//! probe order wins. [`Classifier::rebalance`] reorders subtables by recent
//! hit counts, so callers installing overlapping masks must not rely on
//! which of the overlapping rules is returned. Rebalancing never changes
//! whether a key matches, only the cost of finding the match.

#![warn(missing_docs)]

pub mod classifier;
pub mod error;
pub mod key;
pub mod lookup;
pub mod rule;
pub mod stats;

mod subtable;

pub use classifier::{Classifier, ClassifierConfig, SubtableInfo};
pub use error::{ClassifierError, Result};
pub use key::{FieldMap, FlowKey, Mask, MaskedKey};
pub use lookup::LookupPolicy;
pub use rule::{Rule, RuleHandle};
pub use stats::{ClassifierStats, StatsSnapshot};

/// Number of addressable field slots in a flow key.
///
/// The presence bitmap is split into [`key::MAP_UNITS`] 64-bit units, so
/// field ids range over `0..FIELD_SLOTS`.
pub const FIELD_SLOTS: usize = 128;

/// Maximum number of keys in one lookup batch.
///
/// Batches are tracked with `u32` bitmaps: one bit per key, bit `i` for
/// `keys[i]`.
pub const MAX_BATCH: usize = 32;

//! Lookup-function dispatch.
//!
//! The routine used to probe a subtable's rules is chosen once, at
//! subtable creation time, from the shape of the subtable's mask: how many
//! 64-bit words are populated in each of the two bitmap units. Masks of up
//! to four total words get an unrolled routine monomorphized on the shape;
//! everything else falls back to the generic routine. Selection is purely
//! a performance decision: every specialized routine builds the same
//! probe key, byte for byte, as the generic one.

use crate::key::{FieldMap, FlowKey, MaskedKey, MAP_UNITS};
use crate::rule::RuleHandle;
use crate::subtable::Subtable;
use crate::{FIELD_SLOTS, MAX_BATCH};
use std::sync::Arc;

/// Policy governing which lookup routines subtables may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupPolicy {
    /// Specialized routines where the mask shape supports one, generic
    /// otherwise.
    #[default]
    Auto,
    /// Generic routine everywhere. Useful for isolating a suspected
    /// specialization bug in the field.
    GenericOnly,
    /// Run both routines and panic on any divergence. Test configs only;
    /// every lookup does double work.
    Validate,
}

/// The routine a subtable selected for its mask shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupImpl {
    /// Handles any shape.
    Generic,
    /// Unrolled for `u0` words in unit 0 and `u1` words in unit 1.
    Fixed { u0: u8, u1: u8 },
    /// Runs `Fixed` and `Generic`, asserting they agree.
    Validate { u0: u8, u1: u8 },
}

impl LookupImpl {
    /// Short name for logs and info dumps.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            LookupImpl::Generic => "generic",
            LookupImpl::Fixed { .. } => "fixed",
            LookupImpl::Validate { .. } => "autovalidator",
        }
    }
}

/// Select a lookup routine for a mask shape under `policy`.
pub(crate) fn select(unit_counts: (u8, u8), policy: LookupPolicy) -> LookupImpl {
    let (u0, u1) = unit_counts;
    let specializable = (1..=4).contains(&(u0 + u1));

    match policy {
        LookupPolicy::GenericOnly => LookupImpl::Generic,
        LookupPolicy::Auto if specializable => LookupImpl::Fixed { u0, u1 },
        LookupPolicy::Validate if specializable => LookupImpl::Validate { u0, u1 },
        _ => LookupImpl::Generic,
    }
}

/// Probe `subtable` with every key whose bit is set in `keys_map`.
///
/// Matched keys get their handle written to `results` and their bit set in
/// the returned map.
pub(crate) fn lookup_batch(
    subtable: &Subtable,
    keys: &[FlowKey],
    keys_map: u32,
    results: &mut [Option<RuleHandle>],
) -> u32 {
    match subtable.lookup_impl() {
        LookupImpl::Generic => lookup_generic(subtable, keys, keys_map, results),
        LookupImpl::Fixed { u0, u1 } => {
            lookup_fixed(u0, u1, subtable, keys, keys_map, results)
        }
        LookupImpl::Validate { u0, u1 } => {
            let mut shadow: [Option<RuleHandle>; MAX_BATCH] =
                std::array::from_fn(|_| None);
            let want = lookup_generic(subtable, keys, keys_map, &mut shadow);
            let got = lookup_fixed(u0, u1, subtable, keys, keys_map, results);

            assert_eq!(
                got, want,
                "specialized lookup ({}, {}) diverged from generic",
                u0, u1
            );
            // Compare only the keys probed here. Inactive result slots
            // belong to earlier subtables in the same batch.
            let mut check = keys_map;
            while check != 0 {
                let i = check.trailing_zeros() as usize;
                check &= check - 1;
                let agree = match (&results[i], &shadow[i]) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                };
                assert!(agree, "specialized lookup matched a different rule at {}", i);
            }
            got
        }
    }
}

/// Generic routine: handles any mask shape.
pub(crate) fn lookup_generic(
    subtable: &Subtable,
    keys: &[FlowKey],
    keys_map: u32,
    results: &mut [Option<RuleHandle>],
) -> u32 {
    let mask_map = *subtable.mask().map();
    let mask_words = subtable.mask_words();
    run(subtable, keys, keys_map, results, |key| {
        flatten_generic(key, &mask_map, mask_words)
    })
}

/// Dispatch to the unrolled routine for the given shape.
fn lookup_fixed(
    u0: u8,
    u1: u8,
    st: &Subtable,
    keys: &[FlowKey],
    keys_map: u32,
    results: &mut [Option<RuleHandle>],
) -> u32 {
    match (u0, u1) {
        (1, 0) => run_fixed::<1, 0>(st, keys, keys_map, results),
        (0, 1) => run_fixed::<0, 1>(st, keys, keys_map, results),
        (2, 0) => run_fixed::<2, 0>(st, keys, keys_map, results),
        (1, 1) => run_fixed::<1, 1>(st, keys, keys_map, results),
        (0, 2) => run_fixed::<0, 2>(st, keys, keys_map, results),
        (3, 0) => run_fixed::<3, 0>(st, keys, keys_map, results),
        (2, 1) => run_fixed::<2, 1>(st, keys, keys_map, results),
        (1, 2) => run_fixed::<1, 2>(st, keys, keys_map, results),
        (0, 3) => run_fixed::<0, 3>(st, keys, keys_map, results),
        (4, 0) => run_fixed::<4, 0>(st, keys, keys_map, results),
        (3, 1) => run_fixed::<3, 1>(st, keys, keys_map, results),
        (2, 2) => run_fixed::<2, 2>(st, keys, keys_map, results),
        (1, 3) => run_fixed::<1, 3>(st, keys, keys_map, results),
        (0, 4) => run_fixed::<0, 4>(st, keys, keys_map, results),
        // Selection only hands shapes of 1..=4 words to this path.
        _ => lookup_generic(st, keys, keys_map, results),
    }
}

fn run_fixed<const U0: usize, const U1: usize>(
    st: &Subtable,
    keys: &[FlowKey],
    keys_map: u32,
    results: &mut [Option<RuleHandle>],
) -> u32 {
    let mask_map = *st.mask().map();
    let mask_words = st.mask_words();
    run(st, keys, keys_map, results, |key| {
        flatten_fixed::<U0, U1>(key, &mask_map, mask_words)
    })
}

/// Shared batch driver: superset check, probe build, hashed probe.
#[inline(always)]
fn run<F>(
    subtable: &Subtable,
    keys: &[FlowKey],
    keys_map: u32,
    results: &mut [Option<RuleHandle>],
    flatten: F,
) -> u32
where
    F: Fn(&FlowKey) -> MaskedKey,
{
    let rules = subtable.rules().pin();
    let mask_map = subtable.mask().map();

    let mut found = 0u32;
    let mut active = keys_map;
    while active != 0 {
        let i = active.trailing_zeros() as usize;
        active &= active - 1;

        let key = &keys[i];
        // A key lacking a field the mask requires cannot match here.
        if !key.map().is_superset_of(mask_map) {
            continue;
        }

        let probe = flatten(key);
        if let Some(rule) = rules.get(&probe) {
            results[i] = Some(rule.clone());
            found |= 1 << i;
        }
    }
    found
}

/// Gather and mask the key words the mask selects, in bitmap order.
///
/// Precondition (checked by the driver): the key's map is a superset of
/// `mask_map`.
fn flatten_generic(key: &FlowKey, mask_map: &FieldMap, mask_words: &[u64]) -> MaskedKey {
    let mut buf = [0u64; FIELD_SLOTS];
    let key_words = key.words();
    let mut widx = 0;
    let mut base = 0;

    for u in 0..MAP_UNITS {
        let kbits = key.map().unit(u);
        let mut mbits = mask_map.unit(u);
        while mbits != 0 {
            let bit = mbits.trailing_zeros();
            mbits &= mbits - 1;
            let kidx = base + (kbits & ((1u64 << bit) - 1)).count_ones() as usize;
            buf[widx] = key_words[kidx] & mask_words[widx];
            widx += 1;
        }
        base += kbits.count_ones() as usize;
    }

    MaskedKey::from_parts(*mask_map, buf)
}

/// Same gather as [`flatten_generic`], with both unit loops unrolled to
/// their constant trip counts.
fn flatten_fixed<const U0: usize, const U1: usize>(
    key: &FlowKey,
    mask_map: &FieldMap,
    mask_words: &[u64],
) -> MaskedKey {
    let mut buf = [0u64; FIELD_SLOTS];
    let key_words = key.words();

    let k0 = key.map().unit(0);
    flatten_unit::<U0>(k0, mask_map.unit(0), key_words, 0, mask_words, 0, &mut buf);
    flatten_unit::<U1>(
        key.map().unit(1),
        mask_map.unit(1),
        key_words,
        k0.count_ones() as usize,
        mask_words,
        U0,
        &mut buf,
    );

    MaskedKey::from_parts(*mask_map, buf)
}

#[inline(always)]
fn flatten_unit<const N: usize>(
    kbits: u64,
    mut mbits: u64,
    key_words: &[u64],
    base: usize,
    mask_words: &[u64],
    out_base: usize,
    buf: &mut [u64; FIELD_SLOTS],
) {
    for i in 0..N {
        let bit = mbits.trailing_zeros();
        mbits &= mbits.wrapping_sub(1);
        let kidx = base + (kbits & ((1u64 << bit) - 1)).count_ones() as usize;
        buf[out_base + i] = key_words[kidx] & mask_words[out_base + i];
    }
}

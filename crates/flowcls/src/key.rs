//! Flow key and mask representation.
//!
//! A [`FlowKey`] is a packed, order-independent encoding of a packet's
//! relevant header and metadata fields: a presence bitmap split into two
//! 64-bit units plus an inline buffer holding only the populated 64-bit
//! words, in ascending field-id order. Absent fields consume no buffer
//! space. The same representation doubles as a [`Mask`], whose populated
//! words carry the per-field care-bits of a rule's wildcard pattern.

use crate::FIELD_SLOTS;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Number of 64-bit units in the presence bitmap.
pub const MAP_UNITS: usize = 2;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Mix one 64-bit word into an FNV-1a state.
#[inline(always)]
fn fnv1a_word(mut h: u64, word: u64) -> u64 {
    for byte in word.to_ne_bytes() {
        h ^= byte as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// Fold a 64-bit FNV state down to the 32-bit hash used throughout the
/// classifier.
#[inline(always)]
fn fold32(h: u64) -> u32 {
    (h ^ (h >> 32)) as u32
}

/// Hash a run of packed words.
#[inline]
pub(crate) fn hash_words(words: &[u64]) -> u32 {
    let mut h = FNV_OFFSET;
    for &w in words {
        h = fnv1a_word(h, w);
    }
    fold32(h)
}

/// Hash a full key: bitmap units first, then the populated words.
#[inline]
fn hash_key(map: &FieldMap, words: &[u64]) -> u32 {
    let mut h = FNV_OFFSET;
    for &unit in &map.units {
        h = fnv1a_word(h, unit);
    }
    for &w in words {
        h = fnv1a_word(h, w);
    }
    fold32(h)
}

/// Presence bitmap over [`FIELD_SLOTS`] field slots.
///
/// Split into [`MAP_UNITS`] 64-bit units; each unit independently records
/// which of its 64 slots hold a populated word.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FieldMap {
    units: [u64; MAP_UNITS],
}

impl FieldMap {
    /// Mark `field` as populated.
    ///
    /// # Panics
    ///
    /// Panics if `field >= FIELD_SLOTS`.
    #[inline]
    pub fn set(&mut self, field: usize) {
        assert!(field < FIELD_SLOTS, "field id {} out of range", field);
        self.units[field / 64] |= 1u64 << (field % 64);
    }

    /// Is `field` populated?
    #[inline(always)]
    pub fn contains(&self, field: usize) -> bool {
        field < FIELD_SLOTS && self.units[field / 64] & (1u64 << (field % 64)) != 0
    }

    /// Total number of populated fields.
    #[inline(always)]
    pub fn count(&self) -> usize {
        self.units.iter().map(|u| u.count_ones() as usize).sum()
    }

    /// Per-unit population counts, (unit 0, unit 1).
    #[inline(always)]
    pub fn unit_counts(&self) -> (u8, u8) {
        (self.units[0].count_ones() as u8, self.units[1].count_ones() as u8)
    }

    /// Raw bits of one unit.
    #[inline(always)]
    pub(crate) fn unit(&self, i: usize) -> u64 {
        self.units[i]
    }

    /// Does `self` contain every field `other` contains?
    #[inline(always)]
    pub fn is_superset_of(&self, other: &FieldMap) -> bool {
        self.units
            .iter()
            .zip(other.units.iter())
            .all(|(a, b)| a & b == *b)
    }

    /// Buffer index of `field`: the number of populated fields below it.
    ///
    /// Only meaningful when [`FieldMap::contains`] holds for `field`.
    #[inline(always)]
    pub fn index_of(&self, field: usize) -> usize {
        let unit = field / 64;
        let below = self.units[unit] & ((1u64 << (field % 64)) - 1);
        let mut idx = below.count_ones() as usize;
        for u in 0..unit {
            idx += self.units[u].count_ones() as usize;
        }
        idx
    }

    /// Iterate populated field ids in ascending order.
    pub fn iter(&self) -> FieldMapIter {
        FieldMapIter { units: self.units, unit: 0 }
    }
}

impl fmt::Debug for FieldMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Iterator over the populated field ids of a [`FieldMap`].
pub struct FieldMapIter {
    units: [u64; MAP_UNITS],
    unit: usize,
}

impl Iterator for FieldMapIter {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        while self.unit < MAP_UNITS {
            let bits = self.units[self.unit];
            if bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                self.units[self.unit] = bits & (bits - 1);
                return Some(self.unit * 64 + bit);
            }
            self.unit += 1;
        }
        None
    }
}

/// Packed representation of a packet's relevant fields.
///
/// Built per packet for lookup, or once per rule at installation time.
/// The bitmap and word buffer always agree: iterating the bitmap's set
/// bits yields exactly the buffered words, in the same order.
#[derive(Clone)]
pub struct FlowKey {
    hash: u32,
    map: FieldMap,
    buf: [u64; FIELD_SLOTS],
}

impl FlowKey {
    /// Build a key from a sparse set of `(field id, value)` pairs.
    ///
    /// Deterministic: the same set of pairs produces an identical key
    /// regardless of iteration order.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range or duplicate field id; either would
    /// corrupt the hashing and masking invariants, so neither is ever
    /// silently tolerated.
    pub fn from_fields<I>(fields: I) -> FlowKey
    where
        I: IntoIterator<Item = (u8, u64)>,
    {
        let mut map = FieldMap::default();
        let mut by_slot = [0u64; FIELD_SLOTS];

        for (id, value) in fields {
            let id = id as usize;
            assert!(!map.contains(id), "duplicate field id {}", id);
            map.set(id);
            by_slot[id] = value;
        }

        // Compact into bitmap order.
        let mut buf = [0u64; FIELD_SLOTS];
        for (idx, field) in map.iter().enumerate() {
            buf[idx] = by_slot[field];
        }

        let hash = hash_key(&map, &buf[..map.count()]);
        FlowKey { hash, map, buf }
    }

    /// The key's 32-bit hash.
    ///
    /// Derived from the full field set at build time; callers with a
    /// better source (e.g. NIC RSS) may override it with
    /// [`FlowKey::with_hash`].
    #[inline(always)]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Replace the key's hash, e.g. with a hardware-computed one.
    #[must_use]
    pub fn with_hash(mut self, hash: u32) -> FlowKey {
        self.hash = hash;
        self
    }

    /// The presence bitmap.
    #[inline(always)]
    pub fn map(&self) -> &FieldMap {
        &self.map
    }

    /// Number of populated 64-bit words.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.map.count()
    }

    /// Does this key populate no fields at all?
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.map == FieldMap::default()
    }

    /// The packed words, one per populated field, in field-id order.
    #[inline(always)]
    pub fn words(&self) -> &[u64] {
        &self.buf[..self.map.count()]
    }

    /// The value of `field`, if populated.
    #[inline]
    pub fn word(&self, field: usize) -> Option<u64> {
        if self.map.contains(field) {
            Some(self.buf[self.map.index_of(field)])
        } else {
            None
        }
    }

    /// Unpack into `(field id, value)` pairs, ascending by field id.
    ///
    /// The exact inverse of [`FlowKey::from_fields`].
    pub fn fields(&self) -> impl Iterator<Item = (u8, u64)> + '_ {
        self.map
            .iter()
            .zip(self.words().iter())
            .map(|(field, &word)| (field as u8, word))
    }
}

impl PartialEq for FlowKey {
    fn eq(&self, other: &FlowKey) -> bool {
        self.map == other.map && self.words() == other.words()
    }
}

impl Eq for FlowKey {}

impl fmt::Debug for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.fields()).finish()
    }
}

/// A flow key used structurally: which fields a rule constrains, and
/// which bits of each constrained field matter.
///
/// Two rules with bitwise-identical masks share one subtable; the mask's
/// presence bitmap and words are the subtable's identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Mask {
    key: FlowKey,
}

impl Mask {
    /// Wrap a flow key as a mask.
    ///
    /// # Panics
    ///
    /// Panics if any populated mask word is all-zero: a field that is
    /// present but fully wildcarded must simply be left out of the mask.
    pub fn new(key: FlowKey) -> Mask {
        for (field, word) in key.fields() {
            assert!(word != 0, "mask word for field {} is zero", field);
        }
        Mask { key }
    }

    /// Build a mask directly from `(field id, care-bits)` pairs.
    pub fn from_fields<I>(fields: I) -> Mask
    where
        I: IntoIterator<Item = (u8, u64)>,
    {
        Mask::new(FlowKey::from_fields(fields))
    }

    /// Build a mask matching the given fields exactly (all-ones words).
    pub fn exact<I>(fields: I) -> Mask
    where
        I: IntoIterator<Item = u8>,
    {
        Mask::from_fields(fields.into_iter().map(|f| (f, u64::MAX)))
    }

    /// The mask's presence bitmap.
    #[inline(always)]
    pub fn map(&self) -> &FieldMap {
        &self.key.map
    }

    /// Mask-derived hash, the subtable's identity hash.
    #[inline(always)]
    pub fn hash(&self) -> u32 {
        self.key.hash
    }

    /// Per-unit counts of constrained fields.
    #[inline(always)]
    pub fn unit_counts(&self) -> (u8, u8) {
        self.key.map.unit_counts()
    }

    /// The mask's care-bit words, one per constrained field.
    #[inline(always)]
    pub fn words(&self) -> &[u64] {
        self.key.words()
    }

    /// Flatten the mask's words into a dense cache for bulk AND
    /// operations in the lookup paths.
    pub fn flatten(&self) -> Box<[u64]> {
        self.key.words().into()
    }

    /// Restrict `key` to this mask, producing the probe / stored shape.
    ///
    /// # Panics
    ///
    /// Panics unless `key` populates every field the mask constrains.
    pub fn apply(&self, key: &FlowKey) -> MaskedKey {
        assert!(
            key.map().is_superset_of(self.map()),
            "key does not populate every field the mask constrains"
        );

        let mut buf = [0u64; FIELD_SLOTS];
        for (idx, field) in self.key.map.iter().enumerate() {
            let kidx = key.map.index_of(field);
            buf[idx] = key.buf[kidx] & self.key.buf[idx];
        }
        MaskedKey::from_parts(self.key.map, buf)
    }
}

impl Hash for Mask {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.key.hash);
    }
}

impl fmt::Debug for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Mask").field(&self.key).finish()
    }
}

/// A flow key already restricted to a subtable's mask.
///
/// This is both the stored shape of a rule's match value and the probe
/// built per packet during lookup. Its hash is computed over the masked
/// words only, so a probe and a stored rule with equal masked bits always
/// land in the same bucket.
#[derive(Clone)]
pub struct MaskedKey {
    hash: u32,
    map: FieldMap,
    buf: [u64; FIELD_SLOTS],
}

impl MaskedKey {
    #[inline]
    pub(crate) fn from_parts(map: FieldMap, buf: [u64; FIELD_SLOTS]) -> MaskedKey {
        let hash = hash_words(&buf[..map.count()]);
        MaskedKey { hash, map, buf }
    }

    /// The masked words, in field-id order.
    #[inline(always)]
    pub fn words(&self) -> &[u64] {
        &self.buf[..self.map.count()]
    }

    /// The mask's presence bitmap this key was restricted to.
    #[inline(always)]
    pub fn map(&self) -> &FieldMap {
        &self.map
    }

    /// The 32-bit hash over the masked words.
    #[inline(always)]
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

impl PartialEq for MaskedKey {
    #[inline]
    fn eq(&self, other: &MaskedKey) -> bool {
        self.hash == other.hash && self.map == other.map && self.words() == other.words()
    }
}

impl Eq for MaskedKey {}

impl PartialOrd for MaskedKey {
    #[inline]
    fn partial_cmp(&self, other: &MaskedKey) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MaskedKey {
    #[inline]
    fn cmp(&self, other: &MaskedKey) -> std::cmp::Ordering {
        self.hash
            .cmp(&other.hash)
            .then_with(|| self.map.cmp(&other.map))
            .then_with(|| self.words().cmp(other.words()))
    }
}

impl Hash for MaskedKey {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

impl fmt::Debug for MaskedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.map.iter().zip(self.words().iter()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn build_is_order_independent() {
        let a = FlowKey::from_fields([(3, 30), (1, 10), (7, 70)]);
        let b = FlowKey::from_fields([(7, 70), (3, 30), (1, 10)]);
        assert_eq!(a, b);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.words(), &[10, 30, 70]);
    }

    #[test]
    fn bitmap_and_buffer_agree() {
        let key = FlowKey::from_fields([(0, 1), (63, 2), (64, 3), (127, 4)]);
        assert_eq!(key.len(), 4);
        assert_eq!(key.map().unit_counts(), (2, 2));
        let unpacked: Vec<_> = key.fields().collect();
        assert_eq!(unpacked, vec![(0, 1), (63, 2), (64, 3), (127, 4)]);
    }

    #[test]
    fn word_access() {
        let key = FlowKey::from_fields([(2, 22), (90, 99)]);
        assert_eq!(key.word(2), Some(22));
        assert_eq!(key.word(90), Some(99));
        assert_eq!(key.word(3), None);
    }

    #[test]
    #[should_panic(expected = "duplicate field id")]
    fn duplicate_field_panics() {
        FlowKey::from_fields([(5, 1), (5, 2)]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_field_panics() {
        let mut map = FieldMap::default();
        map.set(FIELD_SLOTS);
    }

    #[test]
    #[should_panic(expected = "mask word")]
    fn zero_mask_word_panics() {
        Mask::from_fields([(1, 0)]);
    }

    #[test]
    fn superset() {
        let small = FlowKey::from_fields([(1, 1)]);
        let big = FlowKey::from_fields([(1, 1), (64, 2)]);
        assert!(big.map().is_superset_of(small.map()));
        assert!(!small.map().is_superset_of(big.map()));
    }

    #[test]
    fn apply_masks_bits() {
        let mask = Mask::from_fields([(1, 0xff00)]);
        let key = FlowKey::from_fields([(1, 0x1234), (2, 99)]);
        let masked = mask.apply(&key);
        assert_eq!(masked.words(), &[0x1200]);
    }

    #[test]
    fn apply_hash_matches_word_hash() {
        let mask = Mask::exact([1, 2]);
        let key = FlowKey::from_fields([(1, 5), (2, 6), (9, 7)]);
        let masked = mask.apply(&key);
        assert_eq!(masked.hash(), hash_words(&[5, 6]));
    }

    #[test]
    #[should_panic(expected = "does not populate")]
    fn apply_requires_superset() {
        let mask = Mask::exact([1, 2]);
        let key = FlowKey::from_fields([(1, 5)]);
        mask.apply(&key);
    }

    #[test]
    fn field_map_index_of_crosses_units() {
        let mut map = FieldMap::default();
        map.set(3);
        map.set(70);
        map.set(100);
        assert_eq!(map.index_of(3), 0);
        assert_eq!(map.index_of(70), 1);
        assert_eq!(map.index_of(100), 2);
    }

    proptest! {
        #[test]
        fn roundtrip(fields in proptest::collection::btree_map(0u8..128, any::<u64>(), 0..16)) {
            let pairs: Vec<(u8, u64)> = fields.iter().map(|(&k, &v)| (k, v)).collect();
            let key = FlowKey::from_fields(pairs.clone());
            let unpacked: Vec<(u8, u64)> = key.fields().collect();
            prop_assert_eq!(unpacked, pairs);
        }

        #[test]
        fn shuffled_build_is_identical(
            fields in proptest::collection::btree_map(0u8..128, any::<u64>(), 1..16),
        ) {
            let fwd: Vec<(u8, u64)> = fields.iter().map(|(&k, &v)| (k, v)).collect();
            let rev: Vec<(u8, u64)> = fwd.iter().rev().cloned().collect();
            let a = FlowKey::from_fields(fwd);
            let b = FlowKey::from_fields(rev);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.hash(), b.hash());
        }
    }
}

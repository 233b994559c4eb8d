//! Set-associative cache with CLOCK second-chance eviction.
//!
//! The cache is a fixed grid of `sets x WAYS` slots. A key's hash selects
//! one set; lookups scan only that set's ways. Each slot carries a small
//! tag (a hash fingerprint that short-circuits most key comparisons) and a
//! small counter (its CLOCK age). Each set carries a clock hand.
//!
//! - A slot is occupied iff its counter is nonzero; tags and values of
//!   unoccupied slots are meaningless.
//! - `get` increments the counter (saturating), so recently read entries
//!   survive eviction sweeps.
//! - `put` of an absent key sweeps from the clock hand, decrementing
//!   counters; the first slot to reach zero is the victim.
//!
//! Once constructed, the cache never allocates, never fails, and performs
//! no I/O; every operation is a bounded number of array accesses. The
//! cache is single-owner and single-threaded; wrap it in an actor if a
//! threaded embedding is ever needed.

use std::marker::PhantomData;
use std::mem::size_of;

use crate::packed::PackedIntArray;

// ============================================================================
// Context & tags
// ============================================================================

/// Binds a cache to its key and value types.
///
/// Values embed their keys: the cache derives the key with
/// [`CacheContext::key_from_value`] rather than storing it twice.
pub trait CacheContext {
    /// The lookup key.
    type Key: Copy + Eq;
    /// The cached value. `Default` provides the placeholder for slots that
    /// have never been occupied; occupancy itself is tracked by counters.
    type Value: Copy + Default;

    /// Extracts the key embedded in a value.
    fn key_from_value(value: &Self::Value) -> Self::Key;

    /// Hashes a key. All 64 bits are consumed: the low bits select the
    /// set, the bits above feed the tag.
    fn hash(key: Self::Key) -> u64;
}

/// A slot tag: a short fingerprint of the key's hash.
///
/// Tags are 8 or 16 bits. Where tags differ, the full key comparison is
/// skipped; equal tags still require a key comparison, since distinct keys
/// may share a tag.
pub trait Tag: Copy + Eq + Default {
    /// Width of the tag in bits.
    const BITS: usize;

    /// Truncates hash entropy down to the tag width.
    fn truncate(entropy: u64) -> Self;
}

impl Tag for u8 {
    const BITS: usize = 8;

    fn truncate(entropy: u64) -> Self {
        entropy as u8
    }
}

impl Tag for u16 {
    const BITS: usize = 16;

    fn truncate(entropy: u64) -> Self {
        entropy as u16
    }
}

// ============================================================================
// Results & metrics
// ============================================================================

/// Whether a [`SetAssociativeCache::put`] updated an existing slot or
/// inserted into a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutKind {
    /// The key was present; its value was overwritten in place.
    Update,
    /// The key was absent; a slot was claimed (possibly by eviction).
    Insert,
}

/// The outcome of a [`SetAssociativeCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutResult<V> {
    /// The slot index now holding the value.
    pub index: usize,
    /// Update or insert.
    pub kind: PutKind,
    /// The value displaced: the previous value on update, the evicted
    /// value if an occupied slot was claimed, `None` otherwise.
    pub evicted: Option<V>,
}

/// Lookup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Metrics {
    hits: u64,
    misses: u64,
}

impl Metrics {
    /// Returns the number of lookup hits.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Returns the number of lookup misses.
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

// ============================================================================
// SetAssociativeCache
// ============================================================================

/// A fixed-capacity set-associative cache.
///
/// Layout parameters:
///
/// - `WAYS`: slots per set (2, 4, or 16)
/// - `T`: tag type (`u8` or `u16`)
/// - `CLOCK_BITS`: counter width (1, 2, or 4); the maximum age is
///   `2^CLOCK_BITS - 1`
/// - `CLOCK_HAND_BITS`: clock hand width; must satisfy
///   `2^CLOCK_HAND_BITS == WAYS`
/// - `CACHE_LINE_SIZE`: the line size the arrays are sized against
///
/// All layout constraints are checked at construction; a violation is a
/// configuration bug and panics. After construction no operation fails.
pub struct SetAssociativeCache<
    C,
    T = u8,
    const WAYS: usize = 16,
    const CLOCK_BITS: usize = 2,
    const CLOCK_HAND_BITS: usize = 4,
    const CACHE_LINE_SIZE: usize = 64,
> where
    C: CacheContext,
    T: Tag,
{
    sets: usize,
    /// Right-shift that discards the set-index bits of a hash.
    set_shift: u32,
    /// One tag per slot; meaningful only while the slot's count is nonzero.
    tags: Vec<T>,
    /// One value per slot; meaningful only while the slot's count is nonzero.
    values: Vec<C::Value>,
    /// One CLOCK counter per slot. Zero means empty/evictable.
    counts: PackedIntArray<CLOCK_BITS>,
    /// One sweep hand per set.
    clocks: PackedIntArray<CLOCK_HAND_BITS>,
    metrics: Metrics,
    _context: PhantomData<C>,
}

impl<
        C,
        T,
        const WAYS: usize,
        const CLOCK_BITS: usize,
        const CLOCK_HAND_BITS: usize,
        const CACHE_LINE_SIZE: usize,
    > SetAssociativeCache<C, T, WAYS, CLOCK_BITS, CLOCK_HAND_BITS, CACHE_LINE_SIZE>
where
    C: CacheContext,
    T: Tag,
{
    /// Maximum counter value: `2^CLOCK_BITS - 1`.
    const COUNT_MAX: u8 = ((1u16 << CLOCK_BITS) - 1) as u8;

    /// Creates a cache with room for `value_count_max` values.
    ///
    /// # Panics
    ///
    /// Panics if any layout constraint is violated; see the type docs.
    #[must_use]
    pub fn new(value_count_max: usize) -> Self {
        assert!(matches!(WAYS, 2 | 4 | 16), "ways must be 2, 4, or 16");
        assert!(matches!(T::BITS, 8 | 16), "tag must be 8 or 16 bits");
        assert!(
            matches!(CLOCK_BITS, 1 | 2 | 4),
            "clock counter must be 1, 2, or 4 bits"
        );
        assert!(
            1usize << CLOCK_HAND_BITS == WAYS,
            "clock hand must be exactly log2(ways) bits"
        );
        assert!(CACHE_LINE_SIZE.is_power_of_two());

        let key_size = size_of::<C::Key>();
        let value_size = size_of::<C::Value>();
        assert!(key_size.is_power_of_two());
        assert!(value_size.is_power_of_two());
        assert!(key_size <= value_size);
        assert!(key_size < CACHE_LINE_SIZE);
        assert!(CACHE_LINE_SIZE % key_size == 0);
        if CACHE_LINE_SIZE > value_size {
            assert!(CACHE_LINE_SIZE % value_size == 0);
        } else {
            assert!(value_size % CACHE_LINE_SIZE == 0);
        }

        assert!(value_count_max > 0);
        assert!(value_count_max.is_power_of_two());
        assert!(value_count_max >= WAYS);
        assert!(value_count_max % WAYS == 0);

        let values_size = value_count_max * value_size;
        assert!(values_size >= CACHE_LINE_SIZE);
        assert!(values_size % CACHE_LINE_SIZE == 0);

        let tags_size = value_count_max * T::BITS / 8;
        assert!(tags_size >= CACHE_LINE_SIZE);
        assert!(tags_size % CACHE_LINE_SIZE == 0);

        let counts_bits = value_count_max * CLOCK_BITS;
        assert!(counts_bits % 8 == 0);
        let counts_size = counts_bits / 8;
        assert!(counts_size >= CACHE_LINE_SIZE);
        assert!(counts_size % CACHE_LINE_SIZE == 0);

        let sets = value_count_max / WAYS;

        Self {
            sets,
            set_shift: sets.trailing_zeros(),
            tags: vec![T::default(); value_count_max],
            values: vec![C::Value::default(); value_count_max],
            counts: PackedIntArray::new_zeroed(value_count_max),
            // Sized to its own minimum: one hand per set, not per slot.
            clocks: PackedIntArray::new_zeroed(sets),
            metrics: Metrics::default(),
            _context: PhantomData,
        }
    }

    /// Returns the number of sets.
    #[must_use]
    pub fn sets(&self) -> usize {
        self.sets
    }

    /// Returns the total slot capacity.
    #[must_use]
    pub fn value_count_max(&self) -> usize {
        self.values.len()
    }

    /// Returns the lookup counters.
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    /// Empties the cache in O(sets): tags, counts, clock hands, and
    /// metrics are zeroed. Values are left in place; they are unreachable
    /// once their counts are zero.
    pub fn reset(&mut self) {
        self.tags.fill(T::default());
        self.counts.clear();
        self.clocks.clear();
        self.metrics.reset();
    }

    /// Looks up `key`, returning the slot index on a hit.
    ///
    /// A hit increments the slot's counter, saturating at the maximum age,
    /// so the entry survives that many eviction sweeps.
    pub fn get_index(&mut self, key: C::Key) -> Option<usize> {
        let lookup = self.associate(key);
        if let Some(way) = self.search(&lookup, key) {
            self.metrics.hits += 1;
            let index = lookup.offset + way;
            let count = self.counts.get(index);
            if count < Self::COUNT_MAX {
                self.counts.set(index, count + 1);
            }
            Some(index)
        } else {
            self.metrics.misses += 1;
            None
        }
    }

    /// Looks up `key`, returning a reference to the cached value.
    ///
    /// The reference is valid until the next mutating call.
    pub fn get(&mut self, key: C::Key) -> Option<&C::Value> {
        let index = self.get_index(key)?;
        Some(&self.values[index])
    }

    /// Upserts `value`, keyed by the key it embeds.
    ///
    /// If the key is present, the value is overwritten in place and the
    /// slot's age is unchanged (freshness comes from `get`). Otherwise a
    /// slot is claimed by CLOCK second-chance: sweeping from the set's
    /// hand, occupied slots lose one age point each pass, and the first
    /// slot to reach zero is the victim. The new entry starts at age 1 and
    /// the hand parks one past the victim.
    pub fn put(&mut self, value: C::Value) -> PutResult<C::Value> {
        let key = C::key_from_value(&value);
        let lookup = self.associate(key);

        if let Some(way) = self.search(&lookup, key) {
            let index = lookup.offset + way;
            let replaced = self.values[index];
            self.values[index] = value;
            return PutResult {
                index,
                kind: PutKind::Update,
                evicted: Some(replaced),
            };
        }

        let set_index = lookup.offset / WAYS;
        let mut way = self.clocks.get(set_index) as usize;
        debug_assert!(way < WAYS);

        // Each occupied slot survives at most COUNT_MAX passes, so the
        // sweep terminates within WAYS * COUNT_MAX iterations.
        let iterations_max = WAYS * Self::COUNT_MAX as usize;
        let mut iterations = 0;

        let mut evicted = None;
        loop {
            let index = lookup.offset + way;
            let count = self.counts.get(index);
            if count == 0 {
                // The way is already free.
                break;
            }
            self.counts.set(index, count - 1);
            if count == 1 {
                // The way has just become free: this is the victim.
                evicted = Some(self.values[index]);
                break;
            }
            way = (way + 1) % WAYS;
            iterations += 1;
            assert!(iterations <= iterations_max, "clock sweep did not terminate");
        }

        let index = lookup.offset + way;
        debug_assert_eq!(self.counts.get(index), 0);
        self.tags[index] = lookup.tag;
        self.values[index] = value;
        self.counts.set(index, 1);
        self.clocks.set(set_index, ((way + 1) % WAYS) as u8);

        PutResult {
            index,
            kind: PutKind::Insert,
            evicted,
        }
    }

    /// Removes `key` if present, returning its value.
    pub fn remove(&mut self, key: C::Key) -> Option<C::Value> {
        let lookup = self.associate(key);
        let way = self.search(&lookup, key)?;
        let index = lookup.offset + way;
        let removed = self.values[index];
        self.counts.set(index, 0);
        Some(removed)
    }

    /// Hints that `key` is unlikely to be accessed again: drops its age to
    /// 1 so it is first in line for eviction.
    pub fn demote(&mut self, key: C::Key) {
        let lookup = self.associate(key);
        let Some(way) = self.search(&lookup, key) else {
            return;
        };
        self.counts.set(lookup.offset + way, 1);
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Maps a key to its set and tag.
    fn associate(&self, key: C::Key) -> Lookup<T> {
        let entropy = C::hash(key);
        // sets is a power of two: the low bits select the set and the
        // remaining entropy above them feeds the tag.
        let set_index = (entropy % self.sets as u64) as usize;
        let tag = T::truncate(entropy >> self.set_shift);
        Lookup {
            tag,
            offset: set_index * WAYS,
        }
    }

    /// Scans the set's ways for `key`. A slot matches iff its tag matches,
    /// it is occupied, and the full keys compare equal.
    fn search(&self, lookup: &Lookup<T>, key: C::Key) -> Option<usize> {
        (0..WAYS).find(|&way| {
            let index = lookup.offset + way;
            self.tags[index] == lookup.tag
                && self.counts.get(index) > 0
                && C::key_from_value(&self.values[index]) == key
        })
    }

    #[cfg(test)]
    fn count_at(&self, index: usize) -> u8 {
        self.counts.get(index)
    }

    #[cfg(test)]
    fn clock_at(&self, set_index: usize) -> u8 {
        self.clocks.get(set_index)
    }

    #[cfg(test)]
    fn occupied_in_set(&self, set_index: usize) -> usize {
        (0..WAYS)
            .filter(|&way| self.counts.get(set_index * WAYS + way) > 0)
            .count()
    }
}

impl<
        C,
        T,
        const WAYS: usize,
        const CLOCK_BITS: usize,
        const CLOCK_HAND_BITS: usize,
        const CACHE_LINE_SIZE: usize,
    > std::fmt::Debug
    for SetAssociativeCache<C, T, WAYS, CLOCK_BITS, CLOCK_HAND_BITS, CACHE_LINE_SIZE>
where
    C: CacheContext,
    T: Tag,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetAssociativeCache")
            .field("sets", &self.sets)
            .field("ways", &WAYS)
            .field("value_count_max", &self.values.len())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// The set and tag a key hashes to.
struct Lookup<T> {
    tag: T,
    /// First slot index of the set: `set_index * WAYS`.
    offset: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Keys are values; the hash is the key itself, so `key * sets`
    /// collides into set 0 with tag `key`.
    struct IdentityContext;

    impl CacheContext for IdentityContext {
        type Key = u64;
        type Value = u64;

        fn key_from_value(value: &u64) -> u64 {
            *value
        }

        fn hash(key: u64) -> u64 {
            key
        }
    }

    /// Pathological hash: every key collides into set 0 with tag 0, so
    /// only full key comparisons can tell entries apart.
    struct CollidingContext;

    impl CacheContext for CollidingContext {
        type Key = u64;
        type Value = u64;

        fn key_from_value(value: &u64) -> u64 {
            *value
        }

        fn hash(_key: u64) -> u64 {
            0
        }
    }

    type DefaultCache<C> = SetAssociativeCache<C, u8, 16, 2, 4, 64>;

    const VALUE_COUNT_MAX: usize = 16 * 16 * 8;

    fn run_eviction_test<C: CacheContext<Key = u64, Value = u64>>() {
        let mut cache = DefaultCache::<C>::new(VALUE_COUNT_MAX);
        let sets = cache.sets() as u64;

        // Fill the first set entirely; each insert advances the hand.
        for way in 0..16usize {
            assert_eq!(cache.clock_at(0), way as u8);

            let key = way as u64 * sets;
            let result = cache.put(key);
            assert_eq!(result.kind, PutKind::Insert);
            assert_eq!(result.evicted, None);
            assert_eq!(cache.count_at(way), 1);

            // A read promotes the entry.
            assert_eq!(cache.get(key), Some(&key));
            assert_eq!(cache.count_at(way), 2);
        }
        assert_eq!(cache.clock_at(0), 0);

        // A 17th key sweeps the set once and evicts the slot at the hand.
        {
            let key = 16 * sets;
            let result = cache.put(key);
            assert_eq!(result.kind, PutKind::Insert);
            assert_eq!(result.evicted, Some(0));
            assert_eq!(result.index, 0);
            assert_eq!(cache.count_at(0), 1);
            assert!(cache.clock_at(0) >= 1);

            assert_eq!(cache.get(key), Some(&key));
            assert_eq!(cache.count_at(0), 2);
            assert_eq!(cache.get(0), None);

            // Every survivor paid one age point to the sweep.
            for way in 1..16usize {
                assert_eq!(cache.count_at(way), 1);
            }
        }

        // Removal frees the slot immediately.
        {
            let key = 5 * sets;
            assert_eq!(cache.remove(key), Some(key));
            assert_eq!(cache.get(key), None);
            assert_eq!(cache.count_at(5), 0);
            assert_eq!(cache.remove(key), None);
        }

        cache.reset();
        assert_eq!(cache.clock_at(0), 0);
        assert_eq!(cache.metrics(), Metrics::default());
        assert_eq!(cache.get(16 * sets), None);
    }

    #[test]
    fn eviction_with_distinct_tags() {
        run_eviction_test::<IdentityContext>();
    }

    #[test]
    fn eviction_with_colliding_tags() {
        run_eviction_test::<CollidingContext>();
    }

    #[test]
    fn round_trip_at_capacity() {
        let mut cache = DefaultCache::<IdentityContext>::new(VALUE_COUNT_MAX);

        // Identity hashing spreads 0..capacity evenly: exactly `ways` keys
        // per set, so nothing is evicted and everything is retrievable.
        for key in 0..VALUE_COUNT_MAX as u64 {
            let result = cache.put(key);
            assert_eq!(result.kind, PutKind::Insert);
            assert_eq!(result.evicted, None);
        }
        for key in 0..VALUE_COUNT_MAX as u64 {
            assert_eq!(cache.get(key), Some(&key));
        }
        assert_eq!(cache.metrics().hits(), VALUE_COUNT_MAX as u64);
        assert_eq!(cache.metrics().misses(), 0);
    }

    #[test]
    fn update_overwrites_in_place_without_aging() {
        let mut cache = DefaultCache::<IdentityContext>::new(VALUE_COUNT_MAX);

        let first = cache.put(42);
        assert_eq!(first.kind, PutKind::Insert);

        let second = cache.put(42);
        assert_eq!(second.kind, PutKind::Update);
        assert_eq!(second.index, first.index);
        assert_eq!(second.evicted, Some(42));

        // Still exactly one slot occupied in the target set, at age 1:
        // updates do not promote.
        assert_eq!(cache.count_at(first.index), 1);
        assert_eq!(cache.occupied_in_set(first.index / 16), 1);

        assert_eq!(cache.get(42), Some(&42));
        assert_eq!(cache.count_at(first.index), 2);
    }

    #[test]
    fn overflow_bounds_a_set_to_its_ways() {
        let mut cache = DefaultCache::<IdentityContext>::new(VALUE_COUNT_MAX);
        let sets = cache.sets() as u64;

        // Twice as many distinct keys as the set has ways.
        let keys: Vec<u64> = (0..32).map(|i| i * sets).collect();
        for &key in &keys {
            cache.put(key);
        }

        let retrievable = keys.iter().filter(|&&key| cache.get(key).is_some()).count();
        assert!(retrievable >= 1);
        assert!(retrievable <= 16);
        assert_eq!(cache.occupied_in_set(0), 16);
    }

    #[test]
    fn get_saturates_at_count_max() {
        let mut cache = DefaultCache::<IdentityContext>::new(VALUE_COUNT_MAX);
        cache.put(7);

        // CLOCK_BITS = 2: ages saturate at 3.
        for _ in 0..10 {
            assert_eq!(cache.get(7), Some(&7));
        }
        let index = cache.get_index(7).unwrap();
        assert_eq!(cache.count_at(index), 3);
    }

    #[test]
    fn demote_marks_for_eviction() {
        let mut cache = DefaultCache::<IdentityContext>::new(VALUE_COUNT_MAX);
        cache.put(7);
        cache.get(7);
        cache.get(7);
        let index = cache.get_index(7).unwrap();
        assert_eq!(cache.count_at(index), 3);

        cache.demote(7);
        assert_eq!(cache.count_at(index), 1);

        // Demoting an absent key is a no-op.
        cache.demote(999_999);
    }

    #[test]
    fn metrics_count_hits_and_misses() {
        let mut cache = DefaultCache::<IdentityContext>::new(VALUE_COUNT_MAX);
        cache.put(1);

        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());

        assert_eq!(cache.metrics().hits(), 2);
        assert_eq!(cache.metrics().misses(), 1);
    }

    #[test]
    fn alternate_layout_round_trips() {
        // 4 ways, 4-bit counters, 2-bit hands.
        let mut cache = SetAssociativeCache::<IdentityContext, u16, 4, 4, 2, 64>::new(512);
        for key in 0..512u64 {
            cache.put(key);
        }
        for key in 0..512u64 {
            assert_eq!(cache.get(key), Some(&key));
        }
    }

    #[test]
    #[should_panic(expected = "ways must be 2, 4, or 16")]
    fn unsupported_ways_panics() {
        let _ = SetAssociativeCache::<IdentityContext, u8, 8, 2, 3, 64>::new(2048);
    }

    #[test]
    #[should_panic(expected = "clock hand")]
    fn mismatched_hand_width_panics() {
        let _ = SetAssociativeCache::<IdentityContext, u8, 16, 2, 2, 64>::new(2048);
    }

    #[test]
    #[should_panic(expected = "power_of_two")]
    fn non_power_of_two_capacity_panics() {
        let _ = DefaultCache::<IdentityContext>::new(2048 + 16);
    }
}

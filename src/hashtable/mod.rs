//! Generic open-addressing hash table engine.
//!
//! Parameterized over an [`ElementClass`] rather than a vtable of
//! function pointers (see SPEC_FULL.md Design Notes) — row-class and
//! table-class dispatch are both monomorphized instantiations of the
//! same probe/search/delete algorithm. No caller of this module ever
//! touches a slot's fields directly; everything goes through the trait.
use std::fmt;

/// The operations the engine needs from a slot type to search, insert,
/// and delete without knowing what a slot actually contains.
pub trait ElementClass {
    type Slot: Copy;
    type Key;

    /// A slot is either empty or valid; this must be a pure function of
    /// the slot's bytes (§3, invariant 1).
    fn is_valid(slot: &Self::Slot) -> bool;

    /// Does this valid slot match `key`?
    fn is_target(slot: &Self::Slot, key: &Self::Key) -> bool;

    /// The natural probe index for `key`, already reduced mod `capacity`.
    fn index_of_key(key: &Self::Key, capacity: u64) -> u64;

    /// The natural probe index for a slot already stored in the table,
    /// recomputed from its own content. Used by delete-rebalance to
    /// decide whether a slot may move into a freshly vacated index.
    fn index_of_slot(slot: &Self::Slot, capacity: u64) -> u64;

    /// Reset a slot to empty.
    fn clear(slot: &mut Self::Slot);
}

/// Outcome of probing for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    /// A valid slot matching the key already exists at this index.
    Locked(u64),
    /// No matching slot exists; an insert should write at this index.
    Empty(u64),
    /// The probe wrapped all the way around without finding either —
    /// the table is full (should not happen given the reserved
    /// terminator slot, §3 invariant 5, but is handled defensively).
    OutOfMemory,
}

impl fmt::Display for SearchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchResult::Locked(i) => write!(f, "locked at {i}"),
            SearchResult::Empty(i) => write!(f, "empty at {i}"),
            SearchResult::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

#[inline]
pub fn next_index(idx: u64, capacity: u64) -> u64 {
    let n = idx + 1;
    if n == capacity {
        0
    } else {
        n
    }
}

#[inline]
pub fn prev_index(idx: u64, capacity: u64) -> u64 {
    if idx == 0 {
        capacity - 1
    } else {
        idx - 1
    }
}

/// Probe `slots` (linear probing, starting at the key's natural hash)
/// for `key`. Never mutates.
pub fn search<C: ElementClass>(slots: &[C::Slot], capacity: u64, key: &C::Key) -> SearchResult {
    let hash = C::index_of_key(key, capacity);
    let mut idx = hash;

    loop {
        let slot = &slots[idx as usize];
        if !C::is_valid(slot) {
            return SearchResult::Empty(idx);
        }
        if C::is_target(slot, key) {
            return SearchResult::Locked(idx);
        }
        idx = next_index(idx, capacity);
        if idx == hash {
            return SearchResult::OutOfMemory;
        }
    }
}

/// Walk forward from `idx_del` until an empty slot is found, returning
/// that index. This is the `idx_end` boundary `delete` expects:
/// "the index just past the last valid slot of the chain" (§4.1).
pub fn chain_end<C: ElementClass>(slots: &[C::Slot], capacity: u64, idx_del: u64) -> u64 {
    let mut idx = next_index(idx_del, capacity);
    while C::is_valid(&slots[idx as usize]) {
        idx = next_index(idx, capacity);
    }
    idx
}

/// Delete the slot at `idx_del`, backward-shifting later entries in its
/// probe chain so no valid slot becomes unreachable (§4.1).
///
/// `idx_end` must be the chain-end index, typically obtained via
/// [`chain_end`]. Expressed as an iterative loop (rather than true
/// recursion) so stack usage doesn't scale with `capacity` (see
/// SPEC_FULL.md Design Notes, "Recursive delete").
pub fn delete<C: ElementClass>(slots: &mut [C::Slot], capacity: u64, idx_del0: u64, idx_end: u64) {
    delete_with_hook::<C>(slots, capacity, idx_del0, idx_end, |_src, _dst| {});
}

/// As [`delete`], but `on_move(src, dst)` is called every time a slot is
/// shifted from `src` to `dst` during rebalancing, and the index that
/// ends up cleared (holding no valid slot) is returned. Lets a caller
/// keep a parallel array (e.g. the Table Class's cached-rowid aux
/// array, §4.3) in sync with slot movement without the engine needing
/// to know it exists: replay the same moves, then clear the returned index.
pub fn delete_with_hook<C: ElementClass>(
    slots: &mut [C::Slot],
    capacity: u64,
    idx_del0: u64,
    idx_end: u64,
    mut on_move: impl FnMut(u64, u64),
) -> u64 {
    debug_assert!(C::is_valid(&slots[idx_del0 as usize]));

    // idx_start is found once and held fixed across every shift below:
    // the region below it is never touched by a shift (the chain only
    // ever loses members, never gains them, while deletion runs).
    let idx_start = {
        let mut s = prev_index(idx_del0, capacity);
        while C::is_valid(&slots[s as usize]) {
            if s == idx_end {
                break;
            }
            s = prev_index(s, capacity);
        }
        next_index(s, capacity)
    };

    let mut idx_del = idx_del0;
    loop {
        // Topology of (idx_start, idx_del, idx_end) on the circular
        // array. idx_del moves every iteration, so this is re-evaluated
        // each time; idx_start/idx_end are fixed for the whole deletion.
        let no_wrap = (idx_start <= idx_del && idx_del <= idx_end)
            || (idx_end <= idx_start && idx_start <= idx_del);

        // Scan backward from idx_end toward idx_del for the first slot
        // whose natural hash still falls within [idx_start, idx_del].
        let mut idx = idx_end;
        let mut candidate = None;
        while idx != idx_del {
            let h = C::index_of_slot(&slots[idx as usize], capacity);
            let acceptable = if no_wrap {
                idx_start <= h && h <= idx_del
            } else {
                h <= idx_del || idx_start <= h
            };
            if acceptable {
                candidate = Some(idx);
                break;
            }
            idx = prev_index(idx, capacity);
        }

        match candidate {
            None => {
                C::clear(&mut slots[idx_del as usize]);
                return idx_del;
            }
            Some(src) => {
                slots[idx_del as usize] = slots[src as usize];
                on_move(src, idx_del);
                idx_del = src;
            }
        }
    }
}

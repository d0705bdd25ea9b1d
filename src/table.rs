//! Table Class: lock registry keyed by `(table_id, owner)`, carrying an
//! auxiliary cached-rowid allocator parallel to the slot array.
use std::io;

use crate::hashtable::ElementClass;
use crate::platform::mapping::SegmentHeader;
use crate::platform::mutex::RawMutex;

const HASH_MULTIPLIER: u64 = 0x9e3779b1;

#[repr(C)]
pub struct TableHeader {
    magic: [u8; 8],
    initialized: u32,
    _pad: u32,
    pub capacity: u64,
    pub count: u64,
    pub mutex: RawMutex,
    // Followed in the mapping by: [TableSlot; capacity], then
    // [CachedRowid; capacity] at the same index as its table slot.
}

unsafe impl SegmentHeader for TableHeader {
    const MAGIC: [u8; 8] = *b"RLK_TBLS";

    fn is_initialized(&self) -> bool {
        self.initialized == 1 && self.magic == Self::MAGIC
    }

    unsafe fn initialize(this: *mut Self, capacity: u64) -> io::Result<()> {
        (*this).magic = Self::MAGIC;
        (*this).capacity = capacity;
        (*this).count = 0;
        (*this).mutex.init()?;
        (*this).initialized = 1;
        Ok(())
    }
}

/// Lock strength, ordered `NONE < READ < WRITE < EXCLUSIVE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockMode {
    None = 0,
    Read = 1,
    Write = 2,
    Exclusive = 3,
}

impl LockMode {
    fn from_u8(v: u8) -> LockMode {
        match v {
            0 => LockMode::None,
            1 => LockMode::Read,
            2 => LockMode::Write,
            _ => LockMode::Exclusive,
        }
    }

    /// Is a lock of `self` held by one owner compatible with a
    /// concurrently-requested lock of `other` held by a *different*
    /// owner? (Same-owner requests always go through upgrade, not this
    /// check — see `TableClass`'s insert-time promotion.)
    ///
    /// Exactly three rules, no others: `READ`/`READ` is compatible,
    /// anything paired with `EXCLUSIVE` is not, and `WRITE`/`WRITE`
    /// across owners is not. `READ`/`WRITE` is therefore compatible.
    pub fn compatible_with(self, other: LockMode) -> bool {
        if self == LockMode::Exclusive || other == LockMode::Exclusive {
            return false;
        }
        if self == LockMode::Write && other == LockMode::Write {
            return false;
        }
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct TableSlot {
    pub table_id: i64,
    pub mode: u8,
    pub(crate) _pad: [u8; 7],
    pub owner: u64,
}

impl TableSlot {
    pub const EMPTY: TableSlot = TableSlot {
        table_id: 0,
        mode: 0,
        _pad: [0; 7],
        owner: 0,
    };

    pub fn lock_mode(&self) -> LockMode {
        LockMode::from_u8(self.mode)
    }
}

/// Auxiliary record parallel to a `TableSlot` at the same index: the
/// highest rowid this slot's owner has reserved on this table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct CachedRowid {
    pub owner: u64,
    pub rowid: i64,
}

impl CachedRowid {
    pub const EMPTY: CachedRowid = CachedRowid { owner: 0, rowid: 0 };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub table_id: i64,
    pub owner: u64,
}

pub struct TableClass;

impl ElementClass for TableClass {
    type Slot = TableSlot;
    type Key = TableKey;

    fn is_valid(slot: &Self::Slot) -> bool {
        slot.owner != 0
    }

    fn is_target(slot: &Self::Slot, key: &Self::Key) -> bool {
        slot.owner != 0 && slot.table_id == key.table_id && slot.owner == key.owner
    }

    fn index_of_key(key: &Self::Key, capacity: u64) -> u64 {
        table_hash(key.table_id, capacity)
    }

    fn index_of_slot(slot: &Self::Slot, capacity: u64) -> u64 {
        table_hash(slot.table_id, capacity)
    }

    fn clear(slot: &mut Self::Slot) {
        *slot = TableSlot::EMPTY;
    }
}

fn table_hash(table_id: i64, capacity: u64) -> u64 {
    let mut h: u64 = 0;
    for &byte in table_id.to_be_bytes().iter() {
        h = (h.wrapping_add(byte as u64)).wrapping_mul(HASH_MULTIPLIER);
    }
    h % capacity
}

/// Strongest mode across every valid slot sharing `table_id`, scanning
/// the whole slot array (table-class lookups are single-key; querying
/// "the mode of this table across all owners" is inherently a scan,
/// not a probe).
pub fn query_strongest_mode(slots: &[TableSlot], table_id: i64) -> LockMode {
    slots
        .iter()
        .filter(|s| TableClass::is_valid(s) && s.table_id == table_id)
        .map(|s| s.lock_mode())
        .max()
        .unwrap_or(LockMode::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatibility_matrix_matches_spec() {
        assert!(LockMode::Read.compatible_with(LockMode::Read));
        assert!(LockMode::None.compatible_with(LockMode::Exclusive));
        assert!(LockMode::Read.compatible_with(LockMode::Write));
        assert!(LockMode::Write.compatible_with(LockMode::Read));
        assert!(!LockMode::Write.compatible_with(LockMode::Write));
        assert!(!LockMode::Write.compatible_with(LockMode::Exclusive));
        assert!(!LockMode::Exclusive.compatible_with(LockMode::Read));
        assert!(!LockMode::Exclusive.compatible_with(LockMode::Exclusive));
    }

    #[test]
    fn query_strongest_mode_across_owners() {
        let slots = vec![
            TableSlot {
                table_id: 9,
                mode: LockMode::Read as u8,
                _pad: [0; 7],
                owner: 1,
            },
            TableSlot {
                table_id: 9,
                mode: LockMode::Write as u8,
                _pad: [0; 7],
                owner: 2,
            },
            TableSlot {
                table_id: 4,
                mode: LockMode::Exclusive as u8,
                _pad: [0; 7],
                owner: 3,
            },
        ];
        assert_eq!(query_strongest_mode(&slots, 9), LockMode::Write);
        assert_eq!(query_strongest_mode(&slots, 4), LockMode::Exclusive);
        assert_eq!(query_strongest_mode(&slots, 1), LockMode::None);
    }
}

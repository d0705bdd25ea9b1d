//! Registry Facade (§4.4): the public API this crate exists to expose.
use std::mem::size_of;

use log::{debug, error, trace, warn};

use crate::error::{Result, RowlockError};
use crate::handle::{Owner, RegistryHandle};
use crate::hashtable::{self, SearchResult};
use crate::platform::mapping::ShmMapping;
use crate::platform::mutex::MutexGuard;
use crate::platform::path;
use crate::row::{RowClass, RowHeader, RowKey, RowSlot};
use crate::sweep;
use crate::table::{CachedRowid, LockMode, TableClass, TableHeader, TableKey, TableSlot};

/// Derive row-class capacity from a byte budget (§3: `N = floor((bytes -
/// sizeof(header)) / sizeof(slot))`), clamped so at least one real slot
/// plus the reserved terminator (§3.5) fit.
fn row_capacity_for_bytes(bytes: u64) -> u64 {
    let header = size_of::<RowHeader>() as u64;
    let slot = size_of::<RowSlot>() as u64;
    (bytes.saturating_sub(header) / slot).max(2)
}

/// Table-class capacity accounts for the parallel cached-rowid array
/// (§3, Table metadata header) living alongside the slot array.
fn table_capacity_for_bytes(bytes: u64) -> u64 {
    let header = size_of::<TableHeader>() as u64;
    let per_slot = (size_of::<TableSlot>() + size_of::<CachedRowid>()) as u64;
    (bytes.saturating_sub(header) / per_slot).max(2)
}

/// # Safety
/// Caller must hold the row mutex.
unsafe fn row_slots_mut<'a>(mapping: &'a ShmMapping<RowHeader>) -> &'a mut [RowSlot] {
    let cap = mapping.header().capacity as usize;
    let ptr = mapping.base_mut_ptr().add(size_of::<RowHeader>()) as *mut RowSlot;
    std::slice::from_raw_parts_mut(ptr, cap)
}

unsafe fn table_slots<'a>(mapping: &'a ShmMapping<TableHeader>) -> &'a [TableSlot] {
    let cap = mapping.header().capacity as usize;
    let ptr = mapping.base_ptr().add(size_of::<TableHeader>()) as *const TableSlot;
    std::slice::from_raw_parts(ptr, cap)
}

/// # Safety
/// Caller must hold the table mutex.
unsafe fn table_slots_mut<'a>(mapping: &'a ShmMapping<TableHeader>) -> &'a mut [TableSlot] {
    let cap = mapping.header().capacity as usize;
    let ptr = mapping.base_mut_ptr().add(size_of::<TableHeader>()) as *mut TableSlot;
    std::slice::from_raw_parts_mut(ptr, cap)
}

/// # Safety
/// Caller must hold the table mutex.
unsafe fn cached_rowids_mut<'a>(mapping: &'a ShmMapping<TableHeader>) -> &'a mut [CachedRowid] {
    let cap = mapping.header().capacity as usize;
    let ptr = mapping
        .base_mut_ptr()
        .add(size_of::<TableHeader>() + cap * size_of::<TableSlot>()) as *mut CachedRowid;
    std::slice::from_raw_parts_mut(ptr, cap)
}

unsafe fn cached_rowids<'a>(mapping: &'a ShmMapping<TableHeader>) -> &'a [CachedRowid] {
    let cap = mapping.header().capacity as usize;
    let ptr = mapping
        .base_ptr()
        .add(size_of::<TableHeader>() + cap * size_of::<TableSlot>()) as *const CachedRowid;
    std::slice::from_raw_parts(ptr, cap)
}

/// Open (creating if necessary) the row- and table-lock mappings for
/// `name` and bind a fresh [`Owner`] to the returned handle.
pub fn init(name: &str, row_bytes: u64, table_bytes: u64) -> Result<RegistryHandle> {
    init_with_owner(name, row_bytes, table_bytes, Owner::new())
}

/// As [`init`], but with an explicit owner — used by tests and by
/// callers that need to reconstruct a handle with a previously-issued
/// owner tag (e.g. the Recovery Sweeper's sentinel checks).
pub fn init_with_owner(
    name: &str,
    row_bytes: u64,
    table_bytes: u64,
    owner: Owner,
) -> Result<RegistryHandle> {
    let absolute = path::resolve_absolute(name).map_err(|source| RowlockError::CantOpen {
        path: name.into(),
        source,
    })?;

    let row_path = path::row_map_path(&absolute);
    let table_path = path::table_map_path(&absolute);

    let row_capacity = row_capacity_for_bytes(row_bytes);
    let table_capacity = table_capacity_for_bytes(table_bytes);

    let rows = ShmMapping::<RowHeader>::create_or_open(row_path, row_bytes, row_capacity)?;
    let tables = match ShmMapping::<TableHeader>::create_or_open(table_path, table_bytes, table_capacity) {
        Ok(t) => t,
        Err(e) => {
            // `rows` is dropped here, releasing (and possibly garbage
            // collecting) what we just opened — partial-failure unwind
            // via RAII rather than manual cleanup (§5, Resource discipline).
            drop(rows);
            return Err(e);
        }
    };

    debug!("registry init: owner={:?} row_capacity={row_capacity} table_capacity={table_capacity}", owner);

    Ok(RegistryHandle {
        owner,
        rows,
        tables,
        finished: false,
    })
}

/// Acquire a row-mutex guard, sweeping dead owners' slots first if the
/// previous holder died while holding it (§5, Crash resilience).
fn enter_rows(handle: &RegistryHandle) -> MutexGuard<'_> {
    let guard = unsafe { MutexGuard::acquire(&handle.rows.header().mutex) };
    if guard.owner_died {
        warn!("row mutex reports dead previous holder; sweeping unreachable owners");
        let slots = unsafe { row_slots_mut(&handle.rows) };
        sweep::reclaim_dead_row_owners(slots, handle.rows.header().capacity);
    }
    guard
}

fn enter_tables(handle: &RegistryHandle) -> MutexGuard<'_> {
    let guard = unsafe { MutexGuard::acquire(&handle.tables.header().mutex) };
    if guard.owner_died {
        warn!("table mutex reports dead previous holder; sweeping unreachable owners");
        let slots = unsafe { table_slots_mut(&handle.tables) };
        let rowids = unsafe { cached_rowids_mut(&handle.tables) };
        sweep::reclaim_dead_table_owners(slots, rowids, handle.tables.header().capacity);
    }
    guard
}

/// Acquire the row lock on `(table_id, row_id)` for `handle`'s owner.
pub fn lock_record(handle: &RegistryHandle, table_id: i64, row_id: i64) -> Result<()> {
    let _guard = enter_rows(handle);
    let capacity = handle.rows.header().capacity;
    let key = RowKey { table_id, row_id };
    let slots = unsafe { row_slots_mut(&handle.rows) };

    trace!("lock_record({table_id}, {row_id}) owner={:?}", handle.owner);
    match hashtable::search::<RowClass>(slots, capacity, &key) {
        SearchResult::Locked(idx) => {
            if slots[idx as usize].owner == handle.owner.raw() {
                Ok(())
            } else {
                Err(RowlockError::Locked)
            }
        }
        SearchResult::Empty(idx) => {
            slots[idx as usize] = RowSlot {
                table_id,
                row_id,
                owner: handle.owner.raw(),
            };
            let header = unsafe { handle.rows.header_mut() };
            header.count += 1;
            Ok(())
        }
        SearchResult::OutOfMemory => Err(RowlockError::OutOfMemory),
    }
}

/// Release the row lock on `(table_id, row_id)` if `handle`'s owner
/// holds it. A no-op otherwise (§4.4).
pub fn unlock_record(handle: &RegistryHandle, table_id: i64, row_id: i64) {
    let _guard = enter_rows(handle);
    let capacity = handle.rows.header().capacity;
    let key = RowKey { table_id, row_id };
    let slots = unsafe { row_slots_mut(&handle.rows) };

    trace!("unlock_record({table_id}, {row_id}) owner={:?}", handle.owner);
    if let SearchResult::Locked(idx) = hashtable::search::<RowClass>(slots, capacity, &key) {
        if slots[idx as usize].owner == handle.owner.raw() {
            let idx_end = hashtable::chain_end::<RowClass>(slots, capacity, idx);
            hashtable::delete::<RowClass>(slots, capacity, idx, idx_end);
            let header = unsafe { handle.rows.header_mut() };
            header.count = header.count.saturating_sub(1);
        }
    }
}

/// Acquire (or upgrade) a table lock. Returns the mode `handle`'s owner
/// held before this call (`NONE` if it held nothing).
pub fn lock_table(handle: &RegistryHandle, table_id: i64, mode: LockMode) -> Result<LockMode> {
    let _guard = enter_tables(handle);
    let capacity = handle.tables.header().capacity;
    let key = TableKey {
        table_id,
        owner: handle.owner.raw(),
    };
    let slots = unsafe { table_slots_mut(&handle.tables) };

    trace!("lock_table({table_id}, {mode:?}) owner={:?}", handle.owner);

    let conflicts = slots.iter().any(|s| {
        TableClass::is_valid(s)
            && s.table_id == table_id
            && s.owner != handle.owner.raw()
            && !s.lock_mode().compatible_with(mode)
    });
    if conflicts {
        return Err(RowlockError::Locked);
    }

    match hashtable::search::<TableClass>(slots, capacity, &key) {
        SearchResult::Locked(idx) => {
            let previous = slots[idx as usize].lock_mode();
            let promoted = previous.max(mode);
            slots[idx as usize].mode = promoted as u8;
            Ok(previous)
        }
        SearchResult::Empty(idx) => {
            slots[idx as usize] = TableSlot {
                table_id,
                mode: mode as u8,
                owner: handle.owner.raw(),
                ..TableSlot::EMPTY
            };
            let header = unsafe { handle.tables.header_mut() };
            header.count += 1;
            Ok(LockMode::None)
        }
        SearchResult::OutOfMemory => Err(RowlockError::OutOfMemory),
    }
}

/// Strongest mode held on `table_id` across every owner.
pub fn query_table_lock(handle: &RegistryHandle, table_id: i64) -> LockMode {
    let _guard = enter_tables(handle);
    let slots = unsafe { table_slots(&handle.tables) };
    crate::table::query_strongest_mode(slots, table_id)
}

/// Release `handle`'s owner's table lock on `table_id`, if any.
pub fn unlock_table(handle: &RegistryHandle, table_id: i64) {
    let _guard = enter_tables(handle);
    let capacity = handle.tables.header().capacity;
    let key = TableKey {
        table_id,
        owner: handle.owner.raw(),
    };
    let slots = unsafe { table_slots_mut(&handle.tables) };

    trace!("unlock_table({table_id}) owner={:?}", handle.owner);
    if let SearchResult::Locked(idx) = hashtable::search::<TableClass>(slots, capacity, &key) {
        let idx_end = hashtable::chain_end::<TableClass>(slots, capacity, idx);
        delete_table_slot(slots, unsafe { cached_rowids_mut(&handle.tables) }, capacity, idx, idx_end);
        let header = unsafe { handle.tables.header_mut() };
        header.count = header.count.saturating_sub(1);
    }
}

/// Delete the table-class slot at `idx_del` via backward-shift rebalance
/// (§4.1), replaying every slot move onto the parallel cached-rowid
/// array so it stays indexed identically to its table slot (§4.3).
pub(crate) fn delete_table_slot(
    slots: &mut [TableSlot],
    rowids: &mut [CachedRowid],
    capacity: u64,
    idx_del: u64,
    idx_end: u64,
) {
    let cleared = hashtable::delete_with_hook::<TableClass>(slots, capacity, idx_del, idx_end, |src, dst| {
        rowids[dst as usize] = rowids[src as usize];
    });
    rowids[cleared as usize] = CachedRowid::EMPTY;
}

/// The highest rowid `handle`'s owner has reserved on `table_id`, if it
/// currently holds a table-class slot for it (§4.3, Cached-rowid).
pub fn cached_rowid(handle: &RegistryHandle, table_id: i64) -> Option<i64> {
    let _guard = enter_tables(handle);
    let capacity = handle.tables.header().capacity;
    let key = TableKey {
        table_id,
        owner: handle.owner.raw(),
    };
    let slots = unsafe { table_slots(&handle.tables) };
    match hashtable::search::<TableClass>(slots, capacity, &key) {
        SearchResult::Locked(idx) => Some(unsafe { cached_rowids(&handle.tables) }[idx as usize].rowid),
        _ => None,
    }
}

/// Record `rowid` as the cached rowid for `handle`'s owner's existing
/// table-class slot on `table_id`. Requires the caller to already hold
/// a table lock there via [`lock_table`]; returns `Internal` otherwise.
pub fn set_cached_rowid(handle: &RegistryHandle, table_id: i64, rowid: i64) -> Result<()> {
    let _guard = enter_tables(handle);
    let capacity = handle.tables.header().capacity;
    let key = TableKey {
        table_id,
        owner: handle.owner.raw(),
    };
    let slots = unsafe { table_slots(&handle.tables) };
    match hashtable::search::<TableClass>(slots, capacity, &key) {
        SearchResult::Locked(idx) => {
            unsafe { cached_rowids_mut(&handle.tables) }[idx as usize] = CachedRowid {
                owner: handle.owner.raw(),
                rowid,
            };
            Ok(())
        }
        _ => {
            let msg = "set_cached_rowid called without a held table lock";
            error!("{msg}: owner={:?} table_id={table_id}", handle.owner);
            Err(RowlockError::Internal(msg))
        }
    }
}

/// Release every slot (both classes) owned by `handle`'s owner and
/// unmap. Idempotent.
pub fn finish(handle: &mut RegistryHandle) {
    if handle.finished {
        return;
    }
    debug!("finish: owner={:?}", handle.owner);
    sweep::unlock_record_proc(handle, sweep::SweepTarget::SelfOwner);
    sweep::unlock_tables_proc(handle, sweep::SweepTarget::SelfOwner);
    handle.finished = true;
}

impl Drop for RegistryHandle {
    fn drop(&mut self) {
        finish(self);
    }
}

//! Recovery Sweeper (§4.4, §5): bulk unlock entry points used both by
//! `finish` and by an external cleanup tool acting on a dead process's
//! leftover slots.
use log::{debug, trace, warn};

use crate::handle::RegistryHandle;
use crate::hashtable;
use crate::platform::mutex::MutexGuard;
use crate::registry::delete_table_slot;
use crate::row::{RowClass, RowSlot};
use crate::table::{CachedRowid, TableClass, TableSlot};

/// `true` if a process with this pid still exists, via `kill(pid, 0)`.
/// `EPERM` still means "exists" (just not signalable by us); any other
/// error (notably `ESRCH`) means it's gone.
fn process_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn pid_of(owner_raw: u64) -> u32 {
    (owner_raw >> 32) as u32
}

/// Remove every row-class slot whose owning process no longer exists.
/// Called with the row mutex already held, immediately after observing
/// `owner_died` on acquisition (§5, Crash resilience). Returns the
/// number of slots removed.
pub(crate) fn reclaim_dead_row_owners(slots: &mut [RowSlot], capacity: u64) -> u64 {
    let mut removed = 0;
    loop {
        let dead = slots
            .iter()
            .enumerate()
            .find(|(_, s)| RowClass::is_valid(s) && !process_alive(pid_of(s.owner)))
            .map(|(i, _)| i as u64);
        let Some(idx) = dead else { break };
        let idx_end = hashtable::chain_end::<RowClass>(slots, capacity, idx);
        hashtable::delete::<RowClass>(slots, capacity, idx, idx_end);
        removed += 1;
    }
    removed
}

/// As [`reclaim_dead_row_owners`], for the table class and its parallel
/// cached-rowid array.
pub(crate) fn reclaim_dead_table_owners(
    slots: &mut [TableSlot],
    rowids: &mut [CachedRowid],
    capacity: u64,
) -> u64 {
    let mut removed = 0;
    loop {
        let dead = slots
            .iter()
            .enumerate()
            .find(|(_, s)| TableClass::is_valid(s) && !process_alive(pid_of(s.owner)))
            .map(|(i, _)| i as u64);
        let Some(idx) = dead else { break };
        let idx_end = hashtable::chain_end::<TableClass>(slots, capacity, idx);
        delete_table_slot(slots, rowids, capacity, idx, idx_end);
        removed += 1;
    }
    removed
}

/// Which owners' slots a bulk sweep should target.
pub enum SweepTarget<'a> {
    /// The calling handle's own owner (used to model "this process is
    /// exiting" without an external process lookup).
    SelfOwner,
    /// Every owner tag whose folded-in pid matches a process named
    /// `name`, resolved via `pgrep -x` (mirrors the `fuser` lookup
    /// already used for mapping presence, see `platform::mapping`).
    ProcessName(&'a str),
}

fn matching_pids(name: &str) -> Vec<u32> {
    let output = match std::process::Command::new("pgrep").arg("-x").arg(name).output() {
        Ok(o) => o,
        Err(e) => {
            warn!("pgrep lookup for {name:?} failed: {e}");
            return Vec::new();
        }
    };
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .filter_map(|tok| tok.parse::<u32>().ok())
        .collect()
}

/// Sweep every row-class slot belonging to `target`'s owners (§4.4,
/// `unlock_record_proc`).
pub fn unlock_record_proc(handle: &RegistryHandle, target: SweepTarget<'_>) {
    trace!("unlock_record_proc enter owner={:?}", handle.owner);
    let guard = unsafe { MutexGuard::acquire(&handle.rows.header().mutex) };
    if guard.owner_died {
        warn!("row mutex reports dead previous holder during unlock_record_proc");
    }

    let capacity = handle.rows.header().capacity;
    let cap = capacity as usize;
    let slots = unsafe {
        std::slice::from_raw_parts_mut(
            handle.rows.base_mut_ptr().add(std::mem::size_of::<crate::row::RowHeader>())
                as *mut RowSlot,
            cap,
        )
    };
    let matches: Box<dyn Fn(u64) -> bool> = match target {
        SweepTarget::SelfOwner => {
            let me = handle.owner.raw();
            Box::new(move |owner| owner == me)
        }
        SweepTarget::ProcessName(name) => {
            let pids = matching_pids(name);
            Box::new(move |owner| pids.contains(&pid_of(owner)))
        }
    };

    let mut removed = 0u64;
    loop {
        let found = slots
            .iter()
            .enumerate()
            .find(|(_, s)| RowClass::is_valid(s) && matches(s.owner))
            .map(|(i, _)| i as u64);
        let Some(idx) = found else { break };
        let idx_end = hashtable::chain_end::<RowClass>(slots, capacity, idx);
        hashtable::delete::<RowClass>(slots, capacity, idx, idx_end);
        removed += 1;
    }
    if removed > 0 {
        let header = unsafe { handle.rows.header_mut() };
        header.count = header.count.saturating_sub(removed);
    }
    drop(guard);
    debug!("unlock_record_proc exit owner={:?} removed={removed}", handle.owner);
}

/// As [`unlock_record_proc`], for the table class.
pub fn unlock_tables_proc(handle: &RegistryHandle, target: SweepTarget<'_>) {
    trace!("unlock_tables_proc enter owner={:?}", handle.owner);
    let guard = unsafe { MutexGuard::acquire(&handle.tables.header().mutex) };
    if guard.owner_died {
        warn!("table mutex reports dead previous holder during unlock_tables_proc");
    }

    let capacity = handle.tables.header().capacity;
    let cap = capacity as usize;
    let slots = unsafe {
        std::slice::from_raw_parts_mut(
            handle
                .tables
                .base_mut_ptr()
                .add(std::mem::size_of::<crate::table::TableHeader>()) as *mut TableSlot,
            cap,
        )
    };
    let rowids = unsafe {
        std::slice::from_raw_parts_mut(
            handle
                .tables
                .base_mut_ptr()
                .add(std::mem::size_of::<crate::table::TableHeader>() + cap * std::mem::size_of::<TableSlot>())
                as *mut CachedRowid,
            cap,
        )
    };
    let matches: Box<dyn Fn(u64) -> bool> = match target {
        SweepTarget::SelfOwner => {
            let me = handle.owner.raw();
            Box::new(move |owner| owner == me)
        }
        SweepTarget::ProcessName(name) => {
            let pids = matching_pids(name);
            Box::new(move |owner| pids.contains(&pid_of(owner)))
        }
    };

    let mut removed = 0u64;
    loop {
        let found = slots
            .iter()
            .enumerate()
            .find(|(_, s)| TableClass::is_valid(s) && matches(s.owner))
            .map(|(i, _)| i as u64);
        let Some(idx) = found else { break };
        let idx_end = hashtable::chain_end::<TableClass>(slots, capacity, idx);
        delete_table_slot(slots, rowids, capacity, idx, idx_end);
        removed += 1;
    }
    if removed > 0 {
        let header = unsafe { handle.tables.header_mut() };
        header.count = header.count.saturating_sub(removed);
    }
    drop(guard);
    debug!("unlock_tables_proc exit owner={:?} removed={removed}", handle.owner);
}

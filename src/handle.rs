//! Owner identity and the opaque handle bound to one `init` call.
use std::sync::atomic::{AtomicU64, Ordering};

use crate::platform::mapping::ShmMapping;
use crate::row::RowHeader;
use crate::table::TableHeader;

static NEXT_INTRA_PROCESS_TAG: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a (process, thread, intra-process object)
/// triple. Guaranteed non-zero so a zeroed slot unambiguously means
/// "empty" (§3, Row slot / Table slot).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Owner(u64);

impl Owner {
    /// Derive a fresh owner tag unique within this process, folding in
    /// the OS process id so two processes racing to pick "the same"
    /// intra-process counter value still disagree in the high bits.
    pub fn new() -> Owner {
        let pid = std::process::id() as u64;
        let tag = NEXT_INTRA_PROCESS_TAG.fetch_add(1, Ordering::Relaxed);
        Owner((pid << 32) | (tag & 0xFFFF_FFFF))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// The process-id component folded into this owner's tag. Used by
    /// the Recovery Sweeper to match slots against a process name/pid.
    pub fn pid_component(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn from_raw(raw: u64) -> Owner {
        Owner(raw)
    }
}

impl Default for Owner {
    fn default() -> Self {
        Owner::new()
    }
}

/// A bound session against one database's lock registry. Carries both
/// class mappings and the owner identity used for every lock/unlock
/// call made through it.
pub struct RegistryHandle {
    pub(crate) owner: Owner,
    pub(crate) rows: ShmMapping<RowHeader>,
    pub(crate) tables: ShmMapping<TableHeader>,
    pub(crate) finished: bool,
}

impl RegistryHandle {
    pub fn owner(&self) -> Owner {
        self.owner
    }
}

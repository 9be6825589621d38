//! Memory subsystem façade: a configuration-selected strategy behind one trait,
//! not two alternative builds (spec.md §9 "Design Notes").

mod contiguous;
mod paged;

pub use contiguous::ContiguousAllocator;
pub use paged::{PagedMemoryManager, ReplacementPolicy};

use thiserror::Error;

use crate::process::Process;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("process {pid} accessed address {addr:#x}, outside its address space")]
    AccessViolation { pid: u64, addr: u32 },
    #[error("allocation failed: no fit for process")]
    AllocationFailed,
    #[error("backing store I/O error: {0}")]
    BackingStoreIo(#[from] std::io::Error),
}

/// A snapshot of memory utilisation, used by the reporter's vmstat view.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub pages_paged_in: u64,
    pub pages_paged_out: u64,
}

/// Common operations both memory strategies expose to the scheduler and
/// interpreter. Implementations serialise their own internal state.
pub trait MemoryBackend: Send + Sync {
    /// Ensure the process's memory is resident before it runs a slice. A no-op
    /// for the paged backend, since paging is lazy (spec.md §4.F step 2).
    fn ensure_resident(&self, process: &Process) -> Result<bool, MemoryError>;

    /// Release a process's memory on retirement.
    fn release(&self, process_name: &str);

    /// Service one READ (`is_write = false`) or WRITE (`is_write = true`).
    /// `value` is the value to write, or ignored for reads.
    fn access(&self, pid: u64, mem_size: u32, address: u32, is_write: bool, value: u16) -> Result<u16, MemoryError>;

    /// Periodic snapshot hook (contiguous: writes a stamp file; paged: no-op).
    fn snapshot(&self);

    fn stats(&self) -> MemoryStats;
}

#[cfg(test)]
pub(crate) mod shared_tests {
    use super::*;
    use crate::instruction::Instruction;

    pub fn sample_process(pid: u64, name: &str, mem_size: u32) -> Process {
        Process::new(pid, name.to_string(), mem_size, Vec::<Instruction>::new(), 0)
    }
}

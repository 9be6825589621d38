//! First-fit contiguous memory allocator with external-fragmentation accounting.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use super::{MemoryBackend, MemoryError, MemoryStats};
use crate::process::Process;

/// One allocated block on the byte address line.
#[derive(Debug, Clone)]
struct Block {
    start: u64,
    end: u64,
    owner: String,
}

struct State {
    blocks: Vec<Block>, // kept in ascending `start` order
    stamp_counter: u32,
    // The contiguous mode has no page table to hang word storage off, so
    // READ/WRITE target this map directly, keyed by (pid, address).
    words: HashMap<(u64, u32), u16>,
}

/// Contiguous first-fit allocator. Block boundaries are multiples of `frame_size`.
pub struct ContiguousAllocator {
    max_overall_mem: u64,
    frame_size: u64,
    state: Mutex<State>,
    pages_paged_in: AtomicU32,
    pages_paged_out: AtomicU32,
    stamp_dir: std::path::PathBuf,
}

impl ContiguousAllocator {
    pub fn new(max_overall_mem: u64, frame_size: u64, stamp_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            max_overall_mem,
            frame_size,
            state: Mutex::new(State { blocks: Vec::new(), stamp_counter: 0, words: HashMap::new() }),
            pages_paged_in: AtomicU32::new(0),
            pages_paged_out: AtomicU32::new(0),
            stamp_dir: stamp_dir.into(),
        }
    }

    fn round_up_to_frame(&self, bytes: u64) -> u64 {
        let f = self.frame_size;
        (bytes + f - 1) / f * f
    }

    /// First-fit placement; returns true and inserts the block on success.
    fn allocate(&self, name: &str, bytes: u64) -> bool {
        let size = self.round_up_to_frame(bytes);
        let mut state = self.state.lock();

        if state.blocks.iter().any(|b| b.owner == name) {
            return true; // already resident
        }

        let mut insert_at = 0usize;
        let mut candidate_start = 0u64;
        let mut found = false;

        for (i, block) in state.blocks.iter().enumerate() {
            if candidate_start + size <= block.start {
                insert_at = i;
                found = true;
                break;
            }
            candidate_start = self.round_up_to_frame(block.end);
        }

        if !found {
            if candidate_start + size <= self.max_overall_mem {
                insert_at = state.blocks.len();
                found = true;
            }
        }

        if !found {
            return false;
        }

        state.blocks.insert(
            insert_at,
            Block { start: candidate_start, end: candidate_start + size, owner: name.to_string() },
        );
        true
    }

    fn deallocate(&self, name: &str) {
        let mut state = self.state.lock();
        state.blocks.retain(|b| b.owner != name);
    }
}

impl MemoryBackend for ContiguousAllocator {
    fn ensure_resident(&self, process: &Process) -> Result<bool, MemoryError> {
        Ok(self.allocate(&process.name, process.mem_size as u64))
    }

    fn release(&self, process_name: &str) {
        self.deallocate(process_name);
    }

    fn access(&self, pid: u64, mem_size: u32, address: u32, is_write: bool, value: u16) -> Result<u16, MemoryError> {
        // The contiguous mode has no page table; it still enforces the
        // address-space bound named in spec.md §4.D.
        if address as u64 >= mem_size as u64 {
            return Err(MemoryError::AccessViolation { pid, addr: address });
        }
        let mut state = self.state.lock();
        if is_write {
            state.words.insert((pid, address), value);
            Ok(value)
        } else {
            Ok(*state.words.get(&(pid, address)).unwrap_or(&0))
        }
    }

    /// Writes `memory_stamp_<nn>.txt` per spec.md §4.C. The counter wraps at 100
    /// (zero-padded to width 2), matching the original's quantum-cycle rollover.
    fn snapshot(&self) {
        let (contents, idx) = {
            let mut state = self.state.lock();
            let idx = state.stamp_counter;
            state.stamp_counter = (state.stamp_counter + 1) % 100;

            let mut frag: u64 = 0;
            let mut prev_end = 0u64;
            for block in &state.blocks {
                frag += block.start.saturating_sub(prev_end);
                prev_end = block.end;
            }
            frag += self.max_overall_mem.saturating_sub(prev_end);

            let mut out = String::new();
            out.push_str(&format!("Timestamp: {}\n", Utc::now().format("%m/%d/%Y %I:%M:%S%p")));
            out.push_str(&format!("Number of processes in memory: {}\n", state.blocks.len()));
            out.push_str(&format!("Total external fragmentation in KB: {}\n\n", frag / 1024));
            for block in state.blocks.iter().rev() {
                out.push_str(&format!("{}\n{}\n{}\n\n", block.end, block.owner, block.start));
            }
            (out, idx)
        };

        if let Err(e) = self.write_stamp(idx, &contents) {
            log::error!("failed to write memory stamp: {e}");
        }
    }

    fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        let used: u64 = state.blocks.iter().map(|b| b.end - b.start).sum();
        MemoryStats {
            total_bytes: self.max_overall_mem,
            used_bytes: used,
            pages_paged_in: self.pages_paged_in.load(Ordering::Relaxed) as u64,
            pages_paged_out: self.pages_paged_out.load(Ordering::Relaxed) as u64,
        }
    }
}

impl ContiguousAllocator {
    fn write_stamp(&self, idx: u32, contents: &str) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.stamp_dir)?;
        let path = self.stamp_dir.join(format!("memory_stamp_{idx:02}.txt"));
        let mut f = File::create(path)?;
        f.write_all(contents.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::shared_tests::sample_process;

    #[test]
    fn first_fit_places_in_gap() {
        let alloc = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-test-1"));
        assert!(alloc.allocate("a", 128));
        assert!(alloc.allocate("b", 128));
        alloc.deallocate("a");
        // Gap at [0,128) should be reused before appending after b.
        assert!(alloc.allocate("c", 64));
        let state = alloc.state.lock();
        assert_eq!(state.blocks[0].owner, "c");
        assert_eq!(state.blocks[0].start, 0);
    }

    #[test]
    fn allocation_fails_when_full() {
        let alloc = ContiguousAllocator::new(128, 64, std::env::temp_dir().join("coresim-test-2"));
        assert!(alloc.allocate("a", 128));
        assert!(!alloc.allocate("b", 64));
    }

    #[test]
    fn blocks_never_overlap_and_stay_frame_aligned() {
        let alloc = ContiguousAllocator::new(4096, 64, std::env::temp_dir().join("coresim-test-3"));
        for i in 0..10 {
            alloc.allocate(&format!("p{i}"), 100 + i as u64);
        }
        let state = alloc.state.lock();
        for w in state.blocks.windows(2) {
            assert!(w[0].end <= w[1].start);
        }
        for b in state.blocks.iter() {
            assert_eq!(b.start % 64, 0);
            assert_eq!(b.end % 64, 0);
        }
    }

    #[test]
    fn access_checks_bounds() {
        let alloc = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-test-4"));
        let p = sample_process(1, "p", 128);
        assert!(alloc.access(p.pid, p.mem_size, 0x7f, false, 0).is_ok());
        assert!(alloc.access(p.pid, p.mem_size, 0x80, false, 0).is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let alloc = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-test-5"));
        let p = sample_process(1, "p", 128);
        alloc.access(p.pid, p.mem_size, 0x0, true, 10).unwrap();
        let v = alloc.access(p.pid, p.mem_size, 0x0, false, 0).unwrap();
        assert_eq!(v, 10);
    }
}

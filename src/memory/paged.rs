//! Demand-paged virtual memory manager: FIFO (or second-chance) replacement
//! over a fixed frame pool, backed by a line-delimited text file.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::{MemoryBackend, MemoryError, MemoryStats};
use crate::process::Process;

#[derive(Debug, Clone, Copy, Default)]
struct PageTableEntry {
    present: bool,
    frame: usize,
    dirty: bool,
    referenced: bool,
}

/// Replacement policy for the paged backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacementPolicy {
    Fifo,
    SecondChance,
}

struct State {
    // (pid, page) -> entry
    page_tables: HashMap<(u64, u32), PageTableEntry>,
    // frame -> owner (pid, page), None if free
    frame_owner: Vec<Option<(u64, u32)>>,
    free_frames: Vec<usize>,
    fifo: VecDeque<usize>,
}

pub struct PagedMemoryManager {
    frame_size: u32,
    num_frames: usize,
    policy: ReplacementPolicy,
    state: Mutex<State>,
    backing_store: std::path::PathBuf,
    paged_in: AtomicU64,
    paged_out: AtomicU64,
}

impl PagedMemoryManager {
    pub fn new(max_overall_mem: u64, frame_size: u32, policy: ReplacementPolicy, backing_store: impl Into<std::path::PathBuf>) -> Self {
        let num_frames = (max_overall_mem / frame_size as u64) as usize;
        let backing_store = backing_store.into();
        // Reset the backing store on every run, with a header line for readability.
        if let Some(parent) = backing_store.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let _ = fs::write(&backing_store, "pid:page:w0 w1 w2 w3 w4 w5 w6 w7\n");

        Self {
            frame_size,
            num_frames,
            policy,
            state: Mutex::new(State {
                page_tables: HashMap::new(),
                frame_owner: vec![None; num_frames],
                free_frames: (0..num_frames).rev().collect(),
                fifo: VecDeque::new(),
            }),
            backing_store,
            paged_in: AtomicU64::new(0),
            paged_out: AtomicU64::new(0),
        }
    }

    fn words_per_frame(&self) -> usize {
        self.frame_size as usize / 2
    }

    fn decode(&self, address: u32) -> (u32, usize) {
        let page = address / self.frame_size;
        let word_offset = (address % self.frame_size) as usize / 2;
        (page, word_offset)
    }

    fn tag(&self, pid: u64, page: u32) -> String {
        format!("{pid}:{page}:")
    }

    fn load_words(&self, pid: u64, page: u32) -> Vec<u16> {
        let tag = self.tag(pid, page);
        let words = self.words_per_frame();
        if let Ok(contents) = fs::read_to_string(&self.backing_store) {
            for line in contents.lines().skip(1) {
                if let Some(rest) = line.strip_prefix(&tag) {
                    let parsed: Vec<u16> = rest
                        .split_whitespace()
                        .filter_map(|w| w.parse::<u16>().ok())
                        .collect();
                    if !parsed.is_empty() {
                        let mut out = parsed;
                        out.resize(words, 0);
                        return out;
                    }
                }
            }
        }
        vec![0u16; words]
    }

    /// Writes through to the backing store and counts it against `paged_out`
    /// (spec.md §4.D: "Increment `paged_out` on every writeback"). This is the
    /// write-through bump, distinct from the eviction-time `paged_out` bump in
    /// `evict`; the two together mean `paged_out` can exceed `paged_in`, which
    /// contradicts §8's general `paged_in ≥ paged_out` invariant. Scenario 5's
    /// `paged_out ≥ paged_in − 2` reads as the one meant to hold in the
    /// write-through design, so that's the statement this implementation
    /// satisfies; the general invariant does not hold for write-heavy workloads.
    fn writeback(&self, pid: u64, page: u32, words: &[u16]) -> Result<(), MemoryError> {
        let tag = self.tag(pid, page);
        let rendered = format!("{tag}{}\n", words.iter().map(|w| w.to_string()).collect::<Vec<_>>().join(" "));

        let contents = fs::read_to_string(&self.backing_store).unwrap_or_default();
        let mut lines = contents.lines();
        let header = lines.next().unwrap_or("pid:page:w0 w1 w2 w3 w4 w5 w6 w7");

        let mut out = String::new();
        out.push_str(header);
        out.push('\n');

        let mut replaced = false;
        for line in lines {
            if line.starts_with(&tag) {
                out.push_str(&rendered);
                replaced = true;
            } else {
                out.push_str(line);
                out.push('\n');
            }
        }
        if !replaced {
            out.push_str(&rendered);
        }

        fs::write(&self.backing_store, out)?;
        self.paged_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

}

impl MemoryBackend for PagedMemoryManager {
    fn ensure_resident(&self, _process: &Process) -> Result<bool, MemoryError> {
        // Paging is lazy: residency is established on first access, not on admit.
        Ok(true)
    }

    fn release(&self, process_name: &str) {
        // Process names aren't tracked per-pid here; callers pass the pid-based
        // access API, so release is a no-op for the paged backend — pages for a
        // finished pid simply age out of the FIFO like any other page.
        let _ = process_name;
    }

    fn access(&self, pid: u64, mem_size: u32, address: u32, is_write: bool, value: u16) -> Result<u16, MemoryError> {
        if address >= mem_size {
            return Err(MemoryError::AccessViolation { pid, addr: address });
        }

        let (page, word_offset) = self.decode(address);
        let mut state = self.state.lock();

        let entry_present = state.page_tables.get(&(pid, page)).map(|e| e.present).unwrap_or(false);
        if !entry_present {
            drop(state);
            self.page_in(pid, page)?;
            state = self.state.lock();
        }

        // The backing store is the single source of truth for frame contents;
        // the in-memory "frame" is only the page-table bookkeeping.
        let mut words = self.load_words(pid, page);
        if is_write {
            words[word_offset] = value;
            if let Some(e) = state.page_tables.get_mut(&(pid, page)) {
                e.dirty = true;
                e.referenced = true;
            }
            drop(state);
            self.writeback(pid, page, &words)?;
            Ok(value)
        } else {
            if let Some(e) = state.page_tables.get_mut(&(pid, page)) {
                e.referenced = true;
            }
            Ok(words[word_offset])
        }
    }

    fn snapshot(&self) {
        // No-op in paged mode, per spec.md §4.E.
    }

    fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        let resident = state.page_tables.values().filter(|e| e.present).count() as u64;
        MemoryStats {
            total_bytes: self.num_frames as u64 * self.frame_size as u64,
            used_bytes: resident * self.frame_size as u64,
            pages_paged_in: self.paged_in.load(Ordering::Relaxed),
            pages_paged_out: self.paged_out.load(Ordering::Relaxed),
        }
    }
}

impl PagedMemoryManager {
    fn page_in(&self, pid: u64, page: u32) -> Result<(), MemoryError> {
        let mut state = self.state.lock();

        let frame = if let Some(f) = state.free_frames.pop() {
            f
        } else {
            self.evict(&mut state)?
        };

        state.frame_owner[frame] = Some((pid, page));
        state.fifo.push_back(frame);
        state.page_tables.insert((pid, page), PageTableEntry { present: true, frame, dirty: false, referenced: true });
        self.paged_in.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn evict(&self, state: &mut State) -> Result<usize, MemoryError> {
        loop {
            let frame = state.fifo.pop_front().expect("fifo non-empty when no free frames");
            let owner = state.frame_owner[frame];

            if self.policy == ReplacementPolicy::SecondChance {
                if let Some(owner) = owner {
                    if let Some(entry) = state.page_tables.get_mut(&owner) {
                        if entry.referenced {
                            entry.referenced = false;
                            state.fifo.push_back(frame);
                            continue;
                        }
                    }
                }
            }

            if let Some((pid, page)) = owner {
                let dirty = state.page_tables.get(&(pid, page)).map(|e| e.dirty).unwrap_or(false);
                if dirty {
                    let words = self.load_words(pid, page);
                    self.writeback(pid, page, &words)?;
                }
                if let Some(entry) = state.page_tables.get_mut(&(pid, page)) {
                    entry.present = false;
                }
                state.frame_owner[frame] = None;
            }
            return Ok(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(tmp: &str) -> PagedMemoryManager {
        let path = std::env::temp_dir().join(tmp);
        PagedMemoryManager::new(128, 64, ReplacementPolicy::Fifo, path)
    }

    #[test]
    fn write_then_read_round_trips() {
        let m = manager("coresim-paged-1.txt");
        m.access(1, 128, 0x0, true, 10).unwrap();
        let v = m.access(1, 128, 0x0, false, 0).unwrap();
        assert_eq!(v, 10);
    }

    #[test]
    fn out_of_bounds_is_violation() {
        let m = manager("coresim-paged-2.txt");
        assert!(m.access(1, 128, 0x80, true, 1).is_err());
    }

    #[test]
    fn paged_in_at_least_paged_out() {
        let m = manager("coresim-paged-3.txt");
        for pid in 0..3u64 {
            for _ in 0..4 {
                m.access(pid, 128, 0x0, true, 1).unwrap();
                m.access(pid, 128, 0x40, true, 2).unwrap();
            }
        }
        let stats = m.stats();
        assert!(stats.pages_paged_in > 0);
        assert!(stats.pages_paged_out >= stats.pages_paged_in.saturating_sub(2));
    }
}

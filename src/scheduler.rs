//! Worker pool and ready queue: the scheduling core described in spec.md §4.F.
//!
//! Grounded on `nvm::hypervisor::core::Hypervisor`'s lifecycle (start/stop,
//! `Arc<AtomicBool>` shutdown flag, worker `JoinHandle`s joined on drop) and on
//! `examples/original_source/MO1 - The Trinity Test/Scheduler.cpp`'s three-list
//! admit/retire model.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::interpreter::{self, StepContext, StepOutcome};
use crate::memory::MemoryBackend;
use crate::process::Process;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler has not been initialised; run `initialize` first")]
    NotInitialised,
    #[error("process not found: {0}")]
    ProcessNotFound(String),
    #[error("a process named {0} already exists")]
    DuplicateName(String),
    #[error("the batch generator is already running")]
    AlreadyRunning,
}

/// Scheduling policy, selected once at `initialize` time. Round-robin's slice
/// length and the memory-snapshot cadence share the same `quantum-cycles`
/// config value (spec.md §4.E, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Fcfs,
    RoundRobin,
}

struct Lists {
    ready: VecDeque<Process>,
    running: Vec<Process>,
    /// Finished processes paired with the core id that retired them.
    finished: Vec<(Process, usize)>,
}

struct Inner {
    lists: Mutex<Lists>,
    not_empty: Condvar,
    shutdown: AtomicBool,
    num_cpu: usize,
    policy: Policy,
    delays_per_exec: u64,
    quantum_cycles: u32,

    cores_in_use: AtomicU64,
    idle_cpu_ticks: AtomicU64,
    active_cpu_ticks: AtomicU64,
    cur_quantum_cycle: AtomicU64,

    pub(crate) attached_pid: Arc<AtomicI64>,
    stdout_lock: Arc<Mutex<()>>,
    memory: Arc<dyn MemoryBackend>,
    log_dir: std::path::PathBuf,
}

/// A read-only, lock-free copy of the three process lists for reporting.
pub struct SchedulerSnapshot {
    pub ready: Vec<Process>,
    pub running: Vec<Process>,
    pub finished: Vec<(Process, usize)>,
    pub cores_in_use: u64,
    pub idle_cpu_ticks: u64,
    pub active_cpu_ticks: u64,
    pub num_cpu: usize,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        num_cpu: usize,
        policy: Policy,
        delays_per_exec: u64,
        quantum_cycles: u32,
        memory: Arc<dyn MemoryBackend>,
        log_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        let inner = Arc::new(Inner {
            lists: Mutex::new(Lists { ready: VecDeque::new(), running: Vec::new(), finished: Vec::new() }),
            not_empty: Condvar::new(),
            shutdown: AtomicBool::new(false),
            num_cpu,
            policy,
            delays_per_exec,
            quantum_cycles,
            cores_in_use: AtomicU64::new(0),
            idle_cpu_ticks: AtomicU64::new(0),
            active_cpu_ticks: AtomicU64::new(0),
            cur_quantum_cycle: AtomicU64::new(0),
            attached_pid: Arc::new(AtomicI64::new(-1)),
            stdout_lock: Arc::new(Mutex::new(())),
            memory,
            log_dir: log_dir.into(),
        });

        let mut workers = Vec::with_capacity(num_cpu);
        for core_id in 0..num_cpu {
            let inner = inner.clone();
            workers.push(std::thread::spawn(move || worker_loop(inner, core_id)));
        }

        Self { inner, workers }
    }

    pub fn attached_pid(&self) -> Arc<AtomicI64> {
        self.inner.attached_pid.clone()
    }

    /// Admit a process to the back of the ready queue (spec.md §4.F, strict FIFO).
    pub fn add_process(&self, process: Process) {
        let mut lists = self.inner.lists.lock();
        lists.ready.push_back(process);
        self.inner.not_empty.notify_one();
    }

    pub fn name_exists(&self, name: &str) -> bool {
        let lists = self.inner.lists.lock();
        lists.ready.iter().any(|p| p.name == name)
            || lists.running.iter().any(|p| p.name == name)
            || lists.finished.iter().any(|(p, _)| p.name == name)
    }

    /// Deep copy of the process with the given name from running, ready, or
    /// finished, in that order (spec.md §4.F).
    pub fn snapshot(&self, name: &str) -> Result<Process, SchedulerError> {
        let lists = self.inner.lists.lock();
        lists
            .running
            .iter()
            .find(|p| p.name == name)
            .or_else(|| lists.ready.iter().find(|p| p.name == name))
            .or_else(|| lists.finished.iter().map(|(p, _)| p).find(|p| p.name == name))
            .cloned()
            .ok_or_else(|| SchedulerError::ProcessNotFound(name.to_string()))
    }

    pub fn snapshot_all(&self) -> SchedulerSnapshot {
        let lists = self.inner.lists.lock();
        SchedulerSnapshot {
            ready: lists.ready.iter().cloned().collect(),
            running: lists.running.clone(),
            finished: lists.finished.clone(),
            cores_in_use: self.inner.cores_in_use.load(Ordering::Relaxed),
            idle_cpu_ticks: self.inner.idle_cpu_ticks.load(Ordering::Relaxed),
            active_cpu_ticks: self.inner.active_cpu_ticks.load(Ordering::Relaxed),
            num_cpu: self.inner.num_cpu,
        }
    }

    pub fn memory_stats(&self) -> crate::memory::MemoryStats {
        self.inner.memory.stats()
    }

    /// Signal shutdown and join every worker. Idempotent.
    pub fn stop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.not_empty.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn slice_budget(policy: Policy, quantum_cycles: u32) -> Option<u32> {
    match policy {
        Policy::Fcfs => None,
        Policy::RoundRobin => Some(quantum_cycles.max(1)),
    }
}

fn worker_loop(inner: Arc<Inner>, core_id: usize) {
    loop {
        let mut process = {
            let mut lists = inner.lists.lock();
            loop {
                if let Some(p) = lists.ready.pop_front() {
                    break p;
                }
                if inner.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                inner.idle_cpu_ticks.fetch_add(1, Ordering::Relaxed);
                inner.not_empty.wait_for(&mut lists, Duration::from_millis(inner.delays_per_exec.max(1)));
                if inner.shutdown.load(Ordering::SeqCst) && lists.ready.is_empty() {
                    return;
                }
            }
        };

        if !matches!(inner.memory.ensure_resident(&process), Ok(true)) {
            // Allocation failed: non-fatal, requeue at the back (spec.md §7).
            let mut lists = inner.lists.lock();
            lists.ready.push_back(process);
            inner.not_empty.notify_one();
            continue;
        }

        process.core = Some(core_id);
        {
            let mut lists = inner.lists.lock();
            lists.running.push(process);
            inner.cores_in_use.fetch_add(1, Ordering::Relaxed);
        }
        // Step 4 (spec.md §4.F): release the lock for the whole slice. The
        // process is moved out of `running` and into this worker's sole
        // ownership so `interpreter::step` — which sleeps `delays_per_exec` ms
        // per tick — never holds `lists` and so never blocks `add_process`,
        // snapshots, or the other cores.
        let mut process = {
            let mut lists = inner.lists.lock();
            let idx = lists.running.iter().position(|p| p.core == Some(core_id)).unwrap();
            lists.running.remove(idx)
        };

        let ctx = StepContext {
            core: core_id,
            delays_per_exec: inner.delays_per_exec,
            attached_pid: inner.attached_pid.clone(),
            stdout_lock: inner.stdout_lock.clone(),
        };

        let budget = slice_budget(inner.policy, inner.quantum_cycles);
        let mut ticks_this_slice: u32 = 0;
        let mut outcome;
        loop {
            outcome = interpreter::step(&mut process, &*inner.memory, &ctx);
            inner.active_cpu_ticks.fetch_add(1, Ordering::Relaxed);
            ticks_this_slice += 1;

            let cycle = inner.cur_quantum_cycle.fetch_add(1, Ordering::Relaxed) + 1;
            if cycle % inner.quantum_cycles.max(1) as u64 == 0 {
                inner.memory.snapshot();
            }

            if !matches!(outcome, StepOutcome::Continue) {
                break;
            }
            if let Some(budget) = budget {
                if ticks_this_slice >= budget {
                    break;
                }
            }
        }

        // Step 6: the slice has ended. `lists` is only touched again below, to
        // route the process to `finished` or back to `ready`.
        inner.cores_in_use.fetch_sub(1, Ordering::Relaxed);
        process.core = None;
        flush_process_log(&inner.log_dir, &mut process);

        let retire = matches!(outcome, StepOutcome::Finished | StepOutcome::Violation) || process.program_complete();
        if retire {
            process.finished = true;
            inner.memory.release(&process.name);
            let mut lists = inner.lists.lock();
            lists.finished.push((process, core_id));
        } else {
            let mut lists = inner.lists.lock();
            lists.ready.push_back(process);
            inner.not_empty.notify_one();
        }
        inner.not_empty.notify_all();
    }
}

/// Append every log line accumulated since the last flush, then drain the
/// buffer — "flushed to a file on every core release" (spec.md §3).
fn flush_process_log(dir: &std::path::Path, process: &mut Process) {
    use std::io::Write as _;
    if process.log.is_empty() {
        return;
    }
    if let Err(e) = std::fs::create_dir_all(dir) {
        log::error!("failed to create log dir {}: {e}", dir.display());
        return;
    }
    let path = dir.join(format!("{}.txt", process.name));
    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(mut f) => {
            for line in process.log.drain(..) {
                let _ = writeln!(f, "{}", line.render());
            }
        }
        Err(e) => log::error!("failed to open {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, Operand};
    use crate::memory::ContiguousAllocator;

    fn mk_memory(dir: &str) -> Arc<dyn MemoryBackend> {
        Arc::new(ContiguousAllocator::new(1 << 20, 64, std::env::temp_dir().join(dir)))
    }

    #[test]
    fn fcfs_runs_processes_to_completion_in_order() {
        let mem = mk_memory("coresim-sched-1");
        let log_dir = std::env::temp_dir().join("coresim-sched-1-logs");
        let mut sched = Scheduler::new(1, Policy::Fcfs, 0, 10_000, mem, log_dir);

        for i in 0..3u64 {
            let program = vec![Instruction::Declare { name: "x".into(), value: i as u16 }];
            sched.add_process(Process::new(i, format!("p{i}"), 64, program, 1));
        }

        // Give the single worker time to drain the queue.
        std::thread::sleep(Duration::from_millis(200));
        sched.stop();

        let snap = sched.snapshot_all();
        assert_eq!(snap.finished.len(), 3);
        let order: Vec<String> = snap.finished.iter().map(|(p, _)| p.name.clone()).collect();
        assert_eq!(order, vec!["p0", "p1", "p2"]);
    }

    #[test]
    fn round_robin_requeues_unfinished_processes() {
        let mem = mk_memory("coresim-sched-2");
        let log_dir = std::env::temp_dir().join("coresim-sched-2-logs");
        let mut sched = Scheduler::new(1, Policy::RoundRobin, 0, 2, mem, log_dir);

        let program: Vec<Instruction> = (0..6)
            .map(|_| Instruction::Add { dest: "x".into(), lhs: Operand::Var("x".into()), rhs: Operand::Lit(1) })
            .collect();
        sched.add_process(Process::new(1, "p1".into(), 64, program, 6));

        std::thread::sleep(Duration::from_millis(200));
        sched.stop();

        let snap = sched.snapshot_all();
        assert_eq!(snap.finished.len(), 1);
        assert_eq!(snap.finished[0].0.get_var("x"), 6);
    }
}

//! Batch generator: periodically synthesises random processes and admits them
//! (spec.md §4.G).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::instruction::{logical_size, Instruction, Operand};
use crate::process::Process;
use crate::scheduler::Scheduler;

pub struct BatchConfig {
    pub batch_process_freq: u64,
    pub delays_per_exec: u64,
    pub min_ins: u32,
    pub max_ins: u32,
    pub mem_per_proc: u32,
}

pub struct BatchGenerator {
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl BatchGenerator {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start generating, or do nothing (reported by the caller) if already running.
    pub fn start(scheduler: Arc<Scheduler>, cfg: BatchConfig, next_pid: Arc<AtomicU64>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let running_flag = running.clone();
        let interval = Duration::from_millis(cfg.batch_process_freq * (cfg.delays_per_exec + 1));

        let handle = std::thread::spawn(move || {
            let mut rng = rand::thread_rng();
            while running_flag.load(Ordering::SeqCst) {
                std::thread::sleep(interval);
                if !running_flag.load(Ordering::SeqCst) {
                    break;
                }

                let pid = next_pid.fetch_add(1, Ordering::SeqCst);
                let mut name = format!("process{pid}");
                let mut candidate_pid = pid;
                while scheduler.name_exists(&name) {
                    candidate_pid = next_pid.fetch_add(1, Ordering::SeqCst);
                    name = format!("process{candidate_pid}");
                }

                let program = synthesize_program(&mut rng, cfg.min_ins, cfg.max_ins, 0);
                let total_line = logical_size(&program);
                scheduler.add_process(Process::new(candidate_pid, name, cfg.mem_per_proc, program, total_line));
            }
        });

        Self { running, handle: Some(handle) }
    }

    /// Signal the generator to stop and join it.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for BatchGenerator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Synthesize a random instruction count in `[min_ins, max_ins]`, with an
/// occasional nested FOR up to depth 3. Also used by `screen -s` (spec.md §4.A:
/// "values are constructed by the batch generator or by `screen -s`").
pub(crate) fn synthesize_program(rng: &mut impl Rng, min_ins: u32, max_ins: u32, depth: usize) -> Vec<Instruction> {
    let count = if min_ins >= max_ins { min_ins } else { rng.gen_range(min_ins..=max_ins) };
    let mut program = Vec::with_capacity(count as usize);
    for i in 0..count {
        program.push(synthesize_instruction(rng, i, depth));
    }
    program
}

fn synthesize_instruction(rng: &mut impl Rng, i: u32, depth: usize) -> Instruction {
    let var = format!("v{}", i % 4);
    let allow_for = depth < 3;
    let roll = rng.gen_range(0..if allow_for { 6 } else { 5 });
    match roll {
        0 => Instruction::Declare { name: var, value: rng.gen_range(0..100) },
        1 => Instruction::Add { dest: var.clone(), lhs: Operand::Var(var), rhs: Operand::Lit(rng.gen_range(0..10)) },
        2 => Instruction::Subtract { dest: var.clone(), lhs: Operand::Var(var), rhs: Operand::Lit(rng.gen_range(0..10)) },
        3 => Instruction::Print { prefix: format!("{var}="), var: Some(var) },
        4 => Instruction::Sleep { ticks: rng.gen_range(0..5) },
        _ => Instruction::For(crate::instruction::ForBody {
            body: synthesize_program(rng, 1, 3, depth + 1),
            repeats: rng.gen_range(1..4),
        }),
    }
}

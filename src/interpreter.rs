//! Executes one instruction of a process per call, advancing its program
//! counter and expanding FOR bodies inline (spec.md §4.E).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::instruction::{clamp16, Instruction, Operand};
use crate::memory::MemoryBackend;
use crate::process::{LoopFrame, Process, MAX_LOOP_DEPTH};

/// What happened after one call to `step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The slice may continue; the caller should keep calling `step`.
    Continue,
    /// The slice ends here (SLEEP pending, quantum-aligned SLEEP dispatch).
    SliceEnd,
    /// The process ran off the end of its program with no pending sleep.
    Finished,
    /// A memory access violation retired the process.
    Violation,
}

/// Shared context a worker passes into every `step` call for one slice.
pub struct StepContext {
    pub core: usize,
    pub delays_per_exec: u64,
    pub attached_pid: Arc<AtomicI64>,
    pub stdout_lock: Arc<Mutex<()>>,
}

fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(s)
}

fn resolve(process: &Process, operand: &Operand) -> u16 {
    match operand {
        Operand::Var(name) => process.get_var(name),
        Operand::Lit(v) => *v,
    }
}

fn flush_to_shell(ctx: &StepContext, process: &Process, message: &str) {
    if ctx.attached_pid.load(Ordering::Relaxed) == process.pid as i64 {
        let _guard = ctx.stdout_lock.lock();
        println!("{message}");
    }
}

/// Run the loop-accounting pass named in §4.E: pop or rewind any loop frames
/// whose body the program counter has walked past. May cascade across nested
/// frames that close on the same instruction.
fn settle_loop_stack(process: &mut Process) {
    loop {
        let Some(top) = process.loop_stack.last().copied() else { break };
        if process.current_line <= top.end {
            break;
        }
        if top.remaining > 0 {
            let mut frame = process.loop_stack.pop().unwrap();
            frame.remaining -= 1;
            process.current_line = frame.start;
            process.loop_stack.push(frame);
            break; // rewound into the body; further popping happens on future passes
        } else {
            process.loop_stack.pop();
        }
    }
}

pub fn step(process: &mut Process, memory: &dyn MemoryBackend, ctx: &StepContext) -> StepOutcome {
    if ctx.delays_per_exec > 0 {
        std::thread::sleep(Duration::from_millis(ctx.delays_per_exec));
    }

    if process.sleep_ticks > 0 {
        process.sleep_ticks -= 1;
        return StepOutcome::SliceEnd;
    }

    if process.program_complete() {
        return StepOutcome::Finished;
    }

    let instr = process.program[process.current_line].clone();

    match instr {
        Instruction::Print { prefix, var } => {
            let text = strip_quotes(&prefix);
            let message = match &var {
                Some(name) => format!("{text}+{name}: {}", process.get_var(name)),
                None => text.to_string(),
            };
            process.push_log(ctx.core, process.loop_stack.len(), message.clone());
            flush_to_shell(ctx, process, &message);
            advance(process);
        }
        Instruction::Declare { name, value } => {
            process.set_var(&name, value);
            advance(process);
        }
        Instruction::Add { dest, lhs, rhs } => {
            let a = resolve(process, &lhs) as u32;
            let b = resolve(process, &rhs) as u32;
            let result = clamp16(a + b);
            process.set_var(&dest, result);
            advance(process);
        }
        Instruction::Subtract { dest, lhs, rhs } => {
            let a = resolve(process, &lhs) as i32;
            let b = resolve(process, &rhs) as i32;
            let result = (a - b).max(0) as u16;
            process.set_var(&dest, result);
            advance(process);
        }
        Instruction::Sleep { ticks } => {
            process.sleep_ticks = ticks.saturating_sub(1);
            process.push_log(ctx.core, process.loop_stack.len(), format!("sleeping {ticks} ticks"));
            process.current_line += 1;
            process.bump_executed();
            return StepOutcome::SliceEnd;
        }
        Instruction::For(for_body) => {
            let depth_ok = process.loop_stack.len() < MAX_LOOP_DEPTH;
            let body_ok = !for_body.body.is_empty() && for_body.repeats > 0;
            if depth_ok && body_ok {
                let insert_at = process.current_line + 1;
                let body_size = for_body.body.len();

                for frame in process.loop_stack.iter_mut() {
                    if frame.end >= insert_at {
                        frame.end += body_size;
                    }
                }

                process.program.splice(insert_at..insert_at, for_body.body.into_iter());
                process.loop_stack.push(LoopFrame {
                    start: insert_at,
                    end: insert_at + body_size - 1,
                    remaining: for_body.repeats - 1,
                    indent: process.loop_stack.len(),
                });
            }
            // FOR with depth > 3, reps = 0, or an empty body is ignored entirely
            // (spec.md §8 boundary behaviour) — it still counts as one executed line.
            advance(process);
        }
        Instruction::Read { dest, address } => {
            match memory.access(process.pid, process.mem_size, address, false, 0) {
                Ok(value) => {
                    process.set_var(&dest, value);
                    advance(process);
                }
                Err(_) => return violation(process, ctx, address),
            }
        }
        Instruction::Write { address, value } => {
            let v = resolve(process, &value);
            match memory.access(process.pid, process.mem_size, address, true, v) {
                Ok(_) => advance(process),
                Err(_) => return violation(process, ctx, address),
            }
        }
    }

    StepOutcome::Continue
}

fn advance(process: &mut Process) {
    process.current_line += 1;
    process.bump_executed();
    settle_loop_stack(process);
}

fn violation(process: &mut Process, ctx: &StepContext, address: u32) -> StepOutcome {
    let now = chrono::Utc::now();
    let message = format!(
        "Process {} shut down due to memory access violation error that occurred at {}, {:#x} invalid.",
        process.name,
        now.format("%H:%M:%S%.3f"),
        address
    );
    process.finished = true;
    process.violation = Some(message.clone());
    process.push_log(ctx.core, process.loop_stack.len(), message.clone());
    flush_to_shell(ctx, process, &message);
    StepOutcome::Violation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::ForBody;
    use crate::memory::ContiguousAllocator;

    fn ctx() -> StepContext {
        StepContext {
            core: 0,
            delays_per_exec: 0,
            attached_pid: Arc::new(AtomicI64::new(-1)),
            stdout_lock: Arc::new(Mutex::new(())),
        }
    }

    fn run_to_completion(process: &mut Process, memory: &dyn MemoryBackend) {
        let c = ctx();
        loop {
            match step(process, memory, &c) {
                StepOutcome::Finished | StepOutcome::Violation => break,
                _ => {}
            }
        }
    }

    #[test]
    fn scenario_declare_add_print() {
        let mem = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-interp-1"));
        let mut p = Process::new(
            1,
            "p1".into(),
            64,
            vec![
                Instruction::Declare { name: "x".into(), value: 10 },
                Instruction::Add { dest: "x".into(), lhs: Operand::Var("x".into()), rhs: Operand::Lit(5) },
                Instruction::Print { prefix: "v=".into(), var: Some("x".into()) },
            ],
            3,
        );
        run_to_completion(&mut p, &mem);
        assert_eq!(p.get_var("x"), 15);
        assert_eq!(p.log.last().unwrap().message, "v=+x: 15");
    }

    #[test]
    fn for_loop_unrolls_inline() {
        let mem = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-interp-2"));
        let mut p = Process::new(
            1,
            "p1".into(),
            64,
            vec![
                Instruction::Declare { name: "x".into(), value: 0 },
                Instruction::For(ForBody {
                    body: vec![Instruction::Add { dest: "x".into(), lhs: Operand::Var("x".into()), rhs: Operand::Lit(1) }],
                    repeats: 3,
                }),
            ],
            5,
        );
        run_to_completion(&mut p, &mem);
        assert_eq!(p.get_var("x"), 3);
        // DECLARE + FOR header + 3 leaf ADDs = 5
        assert_eq!(p.executed_lines, 5);
    }

    #[test]
    fn subtract_saturates_at_zero() {
        let mem = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-interp-3"));
        let mut p = Process::new(
            1,
            "p1".into(),
            64,
            vec![
                Instruction::Declare { name: "x".into(), value: 3 },
                Instruction::Subtract { dest: "x".into(), lhs: Operand::Var("x".into()), rhs: Operand::Lit(10) },
            ],
            2,
        );
        run_to_completion(&mut p, &mem);
        assert_eq!(p.get_var("x"), 0);
    }

    #[test]
    fn add_saturates_at_max() {
        let mem = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-interp-4"));
        let mut p = Process::new(
            1,
            "p1".into(),
            64,
            vec![
                Instruction::Declare { name: "x".into(), value: 65000 },
                Instruction::Add { dest: "x".into(), lhs: Operand::Var("x".into()), rhs: Operand::Lit(1000) },
            ],
            2,
        );
        run_to_completion(&mut p, &mem);
        assert_eq!(p.get_var("x"), 65535);
    }

    #[test]
    fn write_then_read_round_trip() {
        let mem = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-interp-5"));
        let mut p = Process::new(
            1,
            "p1".into(),
            128,
            vec![
                Instruction::Write { address: 0x0, value: Operand::Lit(10) },
                Instruction::Read { dest: "y".into(), address: 0x0 },
            ],
            2,
        );
        run_to_completion(&mut p, &mem);
        assert_eq!(p.get_var("y"), 10);
    }

    #[test]
    fn out_of_bounds_write_is_a_violation() {
        let mem = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-interp-6"));
        let mut p = Process::new(1, "p1".into(), 128, vec![Instruction::Write { address: 0x80, value: Operand::Lit(1) }], 1);
        run_to_completion(&mut p, &mem);
        assert!(p.finished);
        assert!(p.violation.as_ref().unwrap().contains("0x80 invalid"));
    }

    #[test]
    fn for_beyond_depth_three_is_ignored() {
        let mem = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-interp-7"));
        let nested = |n: u32, inner: Instruction| Instruction::For(ForBody { body: vec![inner], repeats: n });
        let program = vec![nested(2, nested(2, nested(2, nested(2, Instruction::Declare { name: "never".into(), value: 1 }))))];
        let mut p = Process::new(1, "p1".into(), 64, program, 1);
        run_to_completion(&mut p, &mem);
        assert_eq!(p.get_var("never"), 0);
    }

    #[test]
    fn sleep_zero_is_single_tick_noop() {
        let mem = ContiguousAllocator::new(1024, 64, std::env::temp_dir().join("coresim-interp-8"));
        let mut p = Process::new(1, "p1".into(), 64, vec![Instruction::Sleep { ticks: 0 }], 1);
        let c = ctx();
        let outcome = step(&mut p, &mem, &c);
        assert_eq!(outcome, StepOutcome::SliceEnd);
        assert_eq!(p.current_line, 1);
        assert_eq!(p.sleep_ticks, 0);
    }
}

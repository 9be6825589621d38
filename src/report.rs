//! Stateless reporting functions over a scheduler snapshot (spec.md §4.H).
//!
//! Grounded on `nvm::cli::output::OutputFormatter`'s pattern of pure formatting
//! functions taking a data snapshot rather than talking to the scheduler directly.

use crate::memory::MemoryStats;
use crate::process::Process;
use crate::scheduler::SchedulerSnapshot;

pub fn utilisation_string(snapshot: &SchedulerSnapshot) -> String {
    let pct = if snapshot.num_cpu == 0 {
        0.0
    } else {
        100.0 * snapshot.cores_in_use as f64 / snapshot.num_cpu as f64
    };
    format!(
        "CPU utilization: {pct:.1}%\nCores used: {}\nCores available: {}",
        snapshot.cores_in_use,
        snapshot.num_cpu as u64 - snapshot.cores_in_use
    )
}

fn progress(p: &Process) -> String {
    format!("{} / {}", p.executed_lines, p.total_line)
}

/// The `screen -ls` / `report-util` listing: utilisation block plus the three
/// process lists (spec.md §4.H).
pub fn render_listing(snapshot: &SchedulerSnapshot) -> String {
    let mut out = String::new();
    out.push_str(&utilisation_string(snapshot));
    out.push_str("\n\n");

    out.push_str("Waiting processes:\n");
    for p in &snapshot.ready {
        out.push_str(&format!(
            "{:<12} ({})  Core: N/A  {}\n",
            p.name,
            p.created_at.format("%m/%d/%Y %I:%M:%S%p"),
            progress(p)
        ));
    }

    out.push_str("\nRunning processes:\n");
    for p in &snapshot.running {
        out.push_str(&format!(
            "{:<12} ({})  Core: {}  {}\n",
            p.name,
            p.created_at.format("%m/%d/%Y %I:%M:%S%p"),
            p.core.map(|c| c.to_string()).unwrap_or_else(|| "N/A".into()),
            progress(p)
        ));
    }

    out.push_str("\nFinished processes:\n");
    for (p, core) in &snapshot.finished {
        out.push_str(&format!(
            "{:<12} ({})  Core: {}  {} / {}\n",
            p.name,
            p.created_at.format("%m/%d/%Y %I:%M:%S%p"),
            core,
            p.total_line,
            p.total_line
        ));
    }

    out
}

pub fn vmstat_string(snapshot: &SchedulerSnapshot, mem: &MemoryStats) -> String {
    format!(
        "total memory: {} bytes\nused memory: {} bytes\nfree memory: {} bytes\nidle cpu ticks: {}\nactive cpu ticks: {}\ntotal cpu ticks: {}\npages paged in: {}\npages paged out: {}",
        mem.total_bytes,
        mem.used_bytes,
        mem.total_bytes.saturating_sub(mem.used_bytes),
        snapshot.idle_cpu_ticks,
        snapshot.active_cpu_ticks,
        snapshot.idle_cpu_ticks + snapshot.active_cpu_ticks,
        mem.pages_paged_in,
        mem.pages_paged_out,
    )
}

/// `process-smi` output: a fixed border plus labelled fields (spec.md §6).
pub fn render_process_card(p: &Process) -> String {
    let core = p.core.map(|c| c.to_string()).unwrap_or_else(|| "N/A".into());
    let status = p.status();
    format!(
        "----------------------------------------\n\
Name: {}\n\
PID: {}\n\
Assigned Core: {core}\n\
Progress: {} / {}\n\
Status: {status}\n\
----------------------------------------",
        p.name, p.pid, p.executed_lines, p.total_line
    )
}

/// Recovered from `examples/original_source`'s `process-smi`-style inner
/// screen: idempotent when no ticks elapse between two calls (spec.md §8).
#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;

    #[test]
    fn process_card_is_idempotent() {
        let p = Process::new(1, "p1".into(), 64, Vec::<Instruction>::new(), 5);
        assert_eq!(render_process_card(&p), render_process_card(&p));
    }

    #[test]
    fn utilisation_percentage() {
        let snap = SchedulerSnapshot {
            ready: vec![],
            running: vec![],
            finished: vec![],
            cores_in_use: 1,
            idle_cpu_ticks: 0,
            active_cpu_ticks: 0,
            num_cpu: 4,
        };
        assert!(utilisation_string(&snap).contains("25.0%"));
    }
}

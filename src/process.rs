//! A single synthetic process: its program, variables, loop stack and output log.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::instruction::Instruction;

/// Maximum number of variables a process may hold (DECLARE beyond this is ignored).
pub const MAX_VARIABLES: usize = 32;
/// Maximum nesting depth of active FOR frames.
pub const MAX_LOOP_DEPTH: usize = 3;

/// One active FOR loop frame spliced into the running program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopFrame {
    pub start: usize,
    pub end: usize,
    pub remaining: u32,
    pub indent: usize,
}

/// One line of a process's per-process output log.
#[derive(Debug, Clone)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub core: usize,
    pub executed_lines: u64,
    pub indent: usize,
    pub message: String,
}

impl LogLine {
    pub fn render(&self) -> String {
        format!(
            "({}) Core:{} \"{}{}\"",
            self.timestamp.format("%m/%d/%Y %I:%M:%S%p"),
            self.core,
            "  ".repeat(self.indent),
            self.message
        )
    }
}

/// Execution status, derived from `finished` and whether the process has a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Waiting,
    Running,
    Finished,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Waiting => write!(f, "Waiting"),
            Status::Running => write!(f, "Running"),
            Status::Finished => write!(f, "Finished"),
        }
    }
}

/// One synthetic process carrying a program in the embedded instruction language.
#[derive(Debug, Clone)]
pub struct Process {
    pub pid: u64,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub mem_size: u32,
    pub program: Vec<Instruction>,
    pub variables: HashMap<String, u16>,
    pub loop_stack: Vec<LoopFrame>,
    pub sleep_ticks: u8,
    pub current_line: usize,
    pub executed_lines: u64,
    pub total_line: u64,
    pub core: Option<usize>,
    pub finished: bool,
    pub violation: Option<String>,
    pub log: Vec<LogLine>,
}

impl Process {
    pub fn new(pid: u64, name: String, mem_size: u32, program: Vec<Instruction>, total_line: u64) -> Self {
        debug_assert!(mem_size.is_power_of_two() && (64..=65536).contains(&mem_size));
        Self {
            pid,
            name,
            created_at: Utc::now(),
            mem_size,
            program,
            variables: HashMap::new(),
            loop_stack: Vec::new(),
            sleep_ticks: 0,
            current_line: 0,
            executed_lines: 0,
            total_line,
            core: None,
            finished: false,
            violation: None,
            log: Vec::new(),
        }
    }

    pub fn status(&self) -> Status {
        if self.finished {
            Status::Finished
        } else if self.core.is_some() {
            Status::Running
        } else {
            Status::Waiting
        }
    }

    /// Read a variable, defaulting missing ones to zero (per §4.E operand resolution).
    pub fn get_var(&self, name: &str) -> u16 {
        *self.variables.get(name).unwrap_or(&0)
    }

    /// Insert or update a variable, enforcing the 32-entry cap on new insertions.
    pub fn set_var(&mut self, name: &str, value: u16) {
        if self.variables.contains_key(name) || self.variables.len() < MAX_VARIABLES {
            self.variables.insert(name.to_string(), value);
        }
    }

    pub fn push_log(&mut self, core: usize, indent: usize, message: String) {
        self.log.push(LogLine {
            timestamp: Utc::now(),
            core,
            executed_lines: self.executed_lines,
            indent,
            message,
        });
    }

    pub fn bump_executed(&mut self) {
        self.executed_lines += 1;
        if self.executed_lines > self.total_line {
            self.total_line = self.executed_lines;
        }
    }

    /// Whether the process has run off the end of its (possibly inlined) program
    /// with no pending sleep — the natural-completion condition from §4.F step 6.
    pub fn program_complete(&self) -> bool {
        self.current_line >= self.program.len() && self.sleep_ticks == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank() -> Process {
        Process::new(1, "p1".into(), 64, Vec::new(), 0)
    }

    #[test]
    fn declare_cap_is_silent() {
        let mut p = blank();
        for i in 0..40 {
            p.set_var(&format!("v{i}"), i as u16);
        }
        assert_eq!(p.variables.len(), MAX_VARIABLES);
    }

    #[test]
    fn missing_variable_reads_zero() {
        let p = blank();
        assert_eq!(p.get_var("nope"), 0);
    }

    #[test]
    fn status_transitions() {
        let mut p = blank();
        assert_eq!(p.status(), Status::Waiting);
        p.core = Some(0);
        assert_eq!(p.status(), Status::Running);
        p.finished = true;
        assert_eq!(p.status(), Status::Finished);
    }
}

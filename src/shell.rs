//! Interactive command shell: the façade named in spec.md §9 that holds a
//! reference to the scheduler and to the reporter, composed rather than
//! inherited.
//!
//! Grounded almost verbatim on `nvm::cli::shell::Shell::run`/`execute`'s
//! read-line loop and `match`-on-first-token dispatch.

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::batch::{BatchConfig, BatchGenerator};
use crate::config::Config;
use crate::instruction::logical_size;
use crate::memory::{ContiguousAllocator, MemoryBackend, PagedMemoryManager, ReplacementPolicy};
use crate::process::Process;
use crate::report;
use crate::scheduler::Scheduler;

/// Selects which memory backend `initialize` builds — not a spec.md concept by
/// itself, just how this crate's config maps onto the §9 façade: the source's
/// two inconsistent memory subsystems are one configuration-selected strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemMode {
    Contiguous,
    Paged(ReplacementPolicy),
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("scheduler has not been initialised; run `initialize` first")]
    NotInitialised,
    #[error("process not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Scheduler(#[from] crate::scheduler::SchedulerError),
}

pub type CliResult<T> = Result<T, CliError>;

struct Session {
    scheduler: Arc<Scheduler>,
    config: Config,
    batch: Option<BatchGenerator>,
    next_pid: Arc<AtomicU64>,
}

pub struct Shell {
    session: Option<Session>,
    mem_mode: MemMode,
    config_path: std::path::PathBuf,
    log_dir: std::path::PathBuf,
    backing_store: std::path::PathBuf,
}

impl Shell {
    pub fn new(config_path: impl Into<std::path::PathBuf>, mem_mode: MemMode) -> Self {
        Self {
            session: None,
            mem_mode,
            config_path: config_path.into(),
            log_dir: std::path::PathBuf::from("."),
            backing_store: std::path::PathBuf::from("csopesy-backing-store.txt"),
        }
    }

    pub fn run(&mut self) -> CliResult<()> {
        println!("coresim — multi-core process scheduling emulator");
        println!("Type 'initialize' to load config.txt, 'exit' to quit.\n");

        let interrupted = Arc::new(AtomicBool::new(false));
        let handler_flag = interrupted.clone();
        // A plain Ctrl-C kill would leave worker threads mid-slice and the
        // backing-store file half-written; flag it and let the read loop exit
        // through the normal drop path instead.
        let _ = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst));

        let stdin = io::stdin();
        let mut stdout = io::stdout();

        loop {
            if interrupted.load(Ordering::SeqCst) {
                println!("\nInterrupted, shutting down.");
                break;
            }

            print!("coresim> ");
            stdout.flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match self.execute(line) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => println!("{e}"),
            }
        }

        if let Some(session) = self.session.as_mut() {
            if let Some(batch) = session.batch.as_mut() {
                batch.stop();
            }
        }
        Ok(())
    }

    fn execute(&mut self, line: &str) -> CliResult<bool> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let cmd = parts[0];
        let args = &parts[1..];

        match cmd {
            "exit" => return Ok(true),
            "clear" => {
                print!("\x1B[2J\x1B[1;1H");
                println!("coresim — multi-core process scheduling emulator");
            }
            "initialize" => self.initialize()?,
            "screen" => self.handle_screen(args)?,
            "scheduler-start" => self.scheduler_start()?,
            "scheduler-stop" => self.scheduler_stop()?,
            "report-util" => self.report_util()?,
            "vmstat" => self.vmstat()?,
            _ => println!("Unknown command: {cmd}. Type 'help' for available commands."),
        }
        Ok(false)
    }

    fn session(&self) -> CliResult<&Session> {
        self.session.as_ref().ok_or(CliError::NotInitialised)
    }

    fn initialize(&mut self) -> CliResult<()> {
        let config = Config::load(&self.config_path)?;

        let memory: Arc<dyn MemoryBackend> = match self.mem_mode {
            MemMode::Contiguous => Arc::new(ContiguousAllocator::new(config.max_overall_mem, config.mem_per_frame as u64, ".")),
            MemMode::Paged(policy) => {
                Arc::new(PagedMemoryManager::new(config.max_overall_mem, config.mem_per_frame, policy, &self.backing_store))
            }
        };

        let scheduler = Arc::new(Scheduler::new(
            config.num_cpu,
            config.policy,
            config.delays_per_exec,
            config.quantum_cycles,
            memory,
            &self.log_dir,
        ));

        let num_cpu = config.num_cpu;
        self.session = Some(Session { scheduler, config, batch: None, next_pid: Arc::new(AtomicU64::new(1)) });
        println!("Scheduler initialised: {num_cpu} core(s).");
        Ok(())
    }

    fn handle_screen(&mut self, args: &[&str]) -> CliResult<()> {
        match args {
            ["-s", name] => self.screen_start(name),
            ["-r", name] => self.screen_resume(name),
            ["-ls"] => {
                let session = self.session()?;
                println!("{}", report::render_listing(&session.scheduler.snapshot_all()));
                Ok(())
            }
            _ => Err(CliError::InvalidArg("usage: screen -s <name> | -r <name> | -ls".into())),
        }
    }

    fn screen_start(&mut self, name: &str) -> CliResult<()> {
        let session = self.session.as_ref().ok_or(CliError::NotInitialised)?;
        if session.scheduler.name_exists(name) {
            return Err(CliError::InvalidArg(format!("a process named {name} already exists")));
        }
        let pid = session.next_pid.fetch_add(1, Ordering::SeqCst);
        let mut rng = rand::thread_rng();
        let program = crate::batch::synthesize_program(&mut rng, session.config.min_ins, session.config.max_ins, 0);
        let total_line = logical_size(&program);
        session.scheduler.add_process(Process::new(pid, name.to_string(), session.config.mem_per_proc, program, total_line));
        self.inner_screen(name)
    }

    fn screen_resume(&mut self, name: &str) -> CliResult<()> {
        self.inner_screen(name)
    }

    /// The inner `process-smi`/`exit` prompt attached to one named process.
    fn inner_screen(&mut self, name: &str) -> CliResult<()> {
        let pid = {
            let session = self.session()?;
            let process = session.scheduler.snapshot(name)?;
            session.scheduler.attached_pid().store(process.pid as i64, Ordering::SeqCst);
            process.pid
        };
        println!("{}", report::render_process_card(&self.session()?.scheduler.snapshot(name)?));

        let stdin = io::stdin();
        loop {
            print!("{name}> ");
            io::stdout().flush()?;
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            match line.trim() {
                "process-smi" => {
                    let process = self.session()?.scheduler.snapshot(name)?;
                    println!("{}", report::render_process_card(&process));
                }
                "exit" => break,
                "" => {}
                other => println!("Unknown command: {other}."),
            }
        }

        if let Some(session) = self.session.as_ref() {
            if session.scheduler.attached_pid().load(Ordering::SeqCst) == pid as i64 {
                session.scheduler.attached_pid().store(-1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    fn scheduler_start(&mut self) -> CliResult<()> {
        let config = self.session()?.config.clone();
        let scheduler = self.session()?.scheduler.clone();
        let next_pid = self.session()?.next_pid.clone();
        let session = self.session.as_mut().ok_or(CliError::NotInitialised)?;

        if session.batch.as_ref().map(|b| b.is_running()).unwrap_or(false) {
            println!("scheduler-start: batch generation is already running.");
            return Ok(());
        }

        let batch_cfg = BatchConfig {
            batch_process_freq: config.batch_process_freq,
            delays_per_exec: config.delays_per_exec,
            min_ins: config.min_ins,
            max_ins: config.max_ins,
            mem_per_proc: config.mem_per_proc,
        };
        session.batch = Some(BatchGenerator::start(scheduler, batch_cfg, next_pid));
        Ok(())
    }

    fn scheduler_stop(&mut self) -> CliResult<()> {
        let session = self.session.as_mut().ok_or(CliError::NotInitialised)?;
        match session.batch.as_mut() {
            Some(batch) => batch.stop(),
            None => println!("scheduler-stop: batch generation was not running."),
        }
        Ok(())
    }

    fn report_util(&mut self) -> CliResult<()> {
        let session = self.session()?;
        let listing = report::render_listing(&session.scheduler.snapshot_all());
        std::fs::write("csopesy-log.txt", &listing)?;
        println!("Report generated at csopesy-log.txt!");
        Ok(())
    }

    fn vmstat(&mut self) -> CliResult<()> {
        let session = self.session()?;
        let snap = session.scheduler.snapshot_all();
        let mem = session.scheduler.memory_stats();
        println!("{}", report::vmstat_string(&snap, &mem));
        Ok(())
    }
}

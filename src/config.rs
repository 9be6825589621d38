//! Flat key/value configuration file reader (spec.md §6).
//!
//! Grounded on `examples/original_source/Config.h` for the key set and on
//! `nvm::cli::config::configure`'s hand-rolled `match`-over-normalized-key
//! style (the teacher reaches for `toml`/`serde_yaml` for its own YAML files,
//! but this wire format is the bespoke `key value` text format named in the
//! spec, which none of those crates parse out of the box).

use std::path::Path;

use thiserror::Error;

use crate::scheduler::Policy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("missing required key: {0}")]
    MissingKey(&'static str),
    #[error("key {0} has an invalid value {1:?}")]
    InvalidValue(&'static str, String),
    #[error("key {0} is out of range: {1:?}")]
    OutOfRange(&'static str, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub num_cpu: usize,
    pub policy: Policy,
    pub quantum_cycles: u32,
    pub batch_process_freq: u64,
    pub min_ins: u32,
    pub max_ins: u32,
    pub delays_per_exec: u64,
    pub max_overall_mem: u64,
    pub mem_per_frame: u32,
    pub mem_per_proc: u32,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut raw: std::collections::HashMap<String, String> = std::collections::HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once(char::is_whitespace) {
                raw.insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }

        let num_cpu = match raw.get("num-cpu") {
            Some(_) => parse_range(&raw, "num-cpu", 1, usize::MAX)?,
            None => num_cpus::get(),
        };
        let policy = parse_policy(&raw)?;
        let quantum_cycles = parse_range(&raw, "quantum-cycles", 1, u32::MAX)?;
        let batch_process_freq = parse_range(&raw, "batch-process-freq", 1, u64::MAX)?;
        let min_ins = parse_range(&raw, "min-ins", 0, u32::MAX)?;
        let max_ins = parse_range(&raw, "max-ins", 0, u32::MAX)?;
        if min_ins > max_ins {
            return Err(ConfigError::OutOfRange("min-ins/max-ins", format!("{min_ins} > {max_ins}")));
        }
        // "one is added on load" per spec.md §6.
        let delays_per_exec = parse_range::<u64>(&raw, "delays-per-exec", 0, u64::MAX)? + 1;
        let mem_per_frame = parse_power_of_two(&raw, "mem-per-frame")?;
        let max_overall_mem = parse_range::<u64>(&raw, "max-overall-mem", 1, u64::MAX)?;
        if max_overall_mem % mem_per_frame as u64 != 0 {
            return Err(ConfigError::OutOfRange("max-overall-mem", "must be a multiple of mem-per-frame".into()));
        }
        let mem_per_proc = parse_power_of_two(&raw, "mem-per-proc")?;
        if !(64..=65536).contains(&mem_per_proc) {
            return Err(ConfigError::OutOfRange("mem-per-proc", mem_per_proc.to_string()));
        }

        Ok(Config {
            num_cpu,
            policy,
            quantum_cycles,
            batch_process_freq,
            min_ins,
            max_ins,
            delays_per_exec,
            max_overall_mem,
            mem_per_frame,
            mem_per_proc,
        })
    }
}

fn get<'a>(raw: &'a std::collections::HashMap<String, String>, key: &'static str) -> Result<&'a str, ConfigError> {
    raw.get(key).map(|s| s.as_str()).ok_or(ConfigError::MissingKey(key))
}

fn parse_range<T>(raw: &std::collections::HashMap<String, String>, key: &'static str, min: T, max: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialOrd + std::fmt::Display,
{
    let raw_value = get(raw, key)?;
    let value: T = raw_value.parse().map_err(|_| ConfigError::InvalidValue(key, raw_value.to_string()))?;
    if value < min || value > max {
        return Err(ConfigError::OutOfRange(key, raw_value.to_string()));
    }
    Ok(value)
}

fn parse_power_of_two(raw: &std::collections::HashMap<String, String>, key: &'static str) -> Result<u32, ConfigError> {
    let raw_value = get(raw, key)?;
    let value: u32 = raw_value.parse().map_err(|_| ConfigError::InvalidValue(key, raw_value.to_string()))?;
    if !value.is_power_of_two() {
        return Err(ConfigError::OutOfRange(key, raw_value.to_string()));
    }
    Ok(value)
}

fn parse_policy(raw: &std::collections::HashMap<String, String>) -> Result<Policy, ConfigError> {
    let raw_value = get(raw, "scheduler")?;
    match raw_value.to_lowercase().as_str() {
        "fcfs" => Ok(Policy::Fcfs),
        "rr" => Ok(Policy::RoundRobin),
        other => Err(ConfigError::InvalidValue("scheduler", other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
num-cpu 4
scheduler rr
quantum-cycles 5
batch-process-freq 1
min-ins 1
max-ins 10
delays-per-exec 0
max-overall-mem 16384
mem-per-frame 16
mem-per-proc 4096
unknown-key ignored-please
";

    #[test]
    fn parses_sample_config() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.num_cpu, 4);
        assert_eq!(cfg.policy, Policy::RoundRobin);
        assert_eq!(cfg.delays_per_exec, 1); // one is added on load
        assert_eq!(cfg.max_overall_mem, 16384);
    }

    #[test]
    fn rejects_non_multiple_frame_size() {
        let bad = SAMPLE.replace("max-overall-mem 16384", "max-overall-mem 16000");
        assert!(Config::parse(&bad).is_err());
    }

    #[test]
    fn rejects_unknown_scheduler() {
        let bad = SAMPLE.replace("scheduler rr", "scheduler round-robin");
        assert!(Config::parse(&bad).is_err());
    }

    #[test]
    fn rejects_inverted_ins_range() {
        let bad = SAMPLE.replace("min-ins 1\nmax-ins 10", "min-ins 10\nmax-ins 1");
        assert!(Config::parse(&bad).is_err());
    }
}

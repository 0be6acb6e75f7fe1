pub mod cpu;
pub mod disk;
pub mod memory;
pub mod network;
pub mod processes;
pub mod strategy;
pub mod thermal;
pub mod throttle;
pub mod uptime;

use crate::platform::PlatformFacts;
use crate::state::SnapshotStore;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::{task, time};

/// Hard limit for any external command or sensor query.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(2000);

#[async_trait]
pub trait MetricCollector: Send {
    /// name of the collector as used in logs and metrics
    fn name(&self) -> &'static str;

    /// Currently active strategy, e.g. `sysinfo` or `proc`.
    fn strategy(&self) -> &'static str;

    /// Samples once and writes the owned field group. An error means nothing
    /// was written and the previous value stays in the snapshot.
    async fn collect(&mut self) -> Result<(), CollectorError>;
}

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse {field} from {source_name}: {raw}")]
    Parse {
        source_name: String,
        field: String,
        raw: String,
    },

    #[error("command {program} failed: {message}")]
    Command { program: String, message: String },

    #[error("command {program} timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },

    #[error("{0} not available")]
    Unavailable(&'static str),

    #[error("no native strategy on this platform")]
    Unsupported,
}

impl CollectorError {
    pub fn parse(source_name: &str, field: &str, raw: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.to_string(),
            field: field.to_string(),
            raw: raw.into(),
        }
    }
}

/// Builds the fast collectors: CPU load, memory and network throughput.
pub fn light_set(facts: &PlatformFacts, store: &Arc<SnapshotStore>) -> Vec<Box<dyn MetricCollector>> {
    vec![
        Box::new(cpu::CpuLoadCollector::new(facts, store.writer())),
        Box::new(memory::MemoryCollector::new(facts, store.writer())),
        Box::new(network::ThroughputCollector::new(
            facts,
            store.writer(),
        )),
    ]
}

/// Builds the slow collectors. Throttling is only registered on ARM-class
/// boards, the process list only when `top_processes > 0`.
pub fn heavy_set(
    facts: &PlatformFacts,
    store: &Arc<SnapshotStore>,
    top_processes: usize,
) -> Vec<Box<dyn MetricCollector>> {
    let mut set: Vec<Box<dyn MetricCollector>> = vec![
        Box::new(thermal::TemperatureCollector::new(facts, store.writer())),
        Box::new(disk::DiskCollector::new(facts, store.writer())),
        Box::new(uptime::UptimeCollector::new(facts, store.writer())),
        Box::new(network::InterfaceCollector::new(facts, store.writer())),
    ];
    if facts.is_arm_class {
        set.push(Box::new(throttle::ThrottleCollector::new(store.writer())));
    }
    if top_processes > 0 {
        set.push(Box::new(processes::ProcessCollector::new(
            top_processes,
            store.writer(),
        )));
    }
    set
}

/// Runs a command with [`COMMAND_TIMEOUT`] and returns decoded stdout.
/// The child is killed when the timeout fires.
pub async fn run_command(program: &str, args: &[&str]) -> Result<String, CollectorError> {
    run_command_with_timeout(program, args, COMMAND_TIMEOUT).await
}

pub async fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, CollectorError> {
    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = match time::timeout(timeout, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return Err(CollectorError::Command {
                program: program.to_string(),
                message: err.to_string(),
            })
        }
        Err(_elapsed) => {
            return Err(CollectorError::Timeout {
                program: program.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    };

    if !output.status.success() {
        return Err(CollectorError::Command {
            program: program.to_string(),
            message: format!(
                "exit status {}: {}",
                output.status,
                decode_cmd_stdout(&output.stderr).trim()
            ),
        });
    }

    Ok(decode_cmd_stdout(&output.stdout))
}

/// Runs a blocking library call on the blocking pool. The call is abandoned,
/// not cancelled, when `timeout` fires.
pub async fn run_blocking_with_timeout<T, F>(
    what: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, CollectorError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CollectorError> + Send + 'static,
{
    match time::timeout(timeout, task::spawn_blocking(call)).await {
        Ok(Ok(result)) => result,
        Ok(Err(_join)) => Err(CollectorError::Unavailable(what)),
        Err(_elapsed) => Err(CollectorError::Timeout {
            program: what.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Windows tools may answer in UTF-16LE.
pub fn decode_cmd_stdout(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return utf8.to_string();
    }

    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let u16buf: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&u16buf) {
            return s;
        }
    }

    String::from_utf8_lossy(bytes).to_string()
}

/// Accepts `12.5`, `12,5` and values with units glued on (`48.3'C`).
pub fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || *c == '-')
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}

use super::strategy::Strategy;
use super::{run_command, CollectorError, MetricCollector};
use crate::platform::{OsFamily, PlatformFacts};
use crate::state::{CpuLoad, GroupWriter};
use async_trait::async_trait;
use sysinfo::{CpuExt, System, SystemExt};
use tokio::fs;

const NAME: &str = "cpu_load";
const PROC_STAT: &str = "/proc/stat";

/// Aggregate and per-core CPU load.
///
/// Library path: sysinfo usage counters. Native path: `/proc/stat` tick
/// deltas on Linux, `typeperf` processor counters on Windows.
pub struct CpuLoadCollector {
    strategy: Strategy<System>,
    native: NativeCpu,
    writer: GroupWriter<CpuLoad>,
}

enum NativeCpu {
    ProcStat(CpuUsageBaseline),
    Typeperf,
    Unsupported,
}

impl CpuLoadCollector {
    pub fn new(facts: &PlatformFacts, writer: GroupWriter<CpuLoad>) -> Self {
        let strategy = if System::IS_SUPPORTED {
            Strategy::Accelerated(System::new())
        } else {
            Strategy::Native
        };
        let native = match facts.os_family {
            OsFamily::Linux => NativeCpu::ProcStat(CpuUsageBaseline::default()),
            OsFamily::Windows => NativeCpu::Typeperf,
            OsFamily::Other => NativeCpu::Unsupported,
        };
        Self {
            strategy,
            native,
            writer,
        }
    }
}

#[async_trait]
impl MetricCollector for CpuLoadCollector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn strategy(&self) -> &'static str {
        let native = match self.native {
            NativeCpu::ProcStat(_) => "proc",
            NativeCpu::Typeperf => "typeperf",
            NativeCpu::Unsupported => "none",
        };
        self.strategy.label("sysinfo", native)
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        if let Some(system) = self.strategy.library_mut() {
            match sample_library(system) {
                Ok(load) => {
                    self.writer.write(load).await;
                    return Ok(());
                }
                Err(err) => self.strategy.degrade(NAME, &err),
            }
        }

        let load = match &mut self.native {
            NativeCpu::ProcStat(baseline) => {
                let content =
                    fs::read_to_string(PROC_STAT)
                        .await
                        .map_err(|source| CollectorError::Read {
                            path: PROC_STAT.into(),
                            source,
                        })?;
                baseline.update(parse_proc_stat(&content)?)
            }
            NativeCpu::Typeperf => {
                let text =
                    run_command("typeperf", &["\\Processor(*)\\% Processor Time", "-sc", "1"])
                        .await?;
                parse_typeperf_processor(&text)?
            }
            NativeCpu::Unsupported => return Err(CollectorError::Unsupported),
        };
        self.writer.write(load).await;
        Ok(())
    }
}

fn sample_library(system: &mut System) -> Result<CpuLoad, CollectorError> {
    system.refresh_cpu();
    let cpus = system.cpus();
    if cpus.is_empty() {
        return Err(CollectorError::Unavailable("sysinfo cpu list"));
    }

    let per_core: Vec<f64> = cpus.iter().map(|c| c.cpu_usage() as f64).collect();
    if let Some(bad) = per_core.iter().find(|v| !v.is_finite()) {
        return Err(CollectorError::parse("sysinfo", "cpu_usage", bad.to_string()));
    }
    let total = per_core.iter().sum::<f64>() / per_core.len() as f64;

    Ok(CpuLoad {
        total_percent: total,
        per_core_percent: per_core,
    })
}

/// Idle and total jiffies of one `cpu` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoreTicks {
    pub idle: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcStat {
    pub aggregate: CoreTicks,
    pub cores: Vec<CoreTicks>,
}

/// Last `/proc/stat` sample; the first update has nothing to diff against
/// and reports zero load.
#[derive(Debug, Default)]
pub struct CpuUsageBaseline {
    prev: Option<ProcStat>,
}

impl CpuUsageBaseline {
    pub fn update(&mut self, current: ProcStat) -> CpuLoad {
        let load = match &self.prev {
            Some(prev) if prev.cores.len() == current.cores.len() => CpuLoad {
                total_percent: usage_between(prev.aggregate, current.aggregate),
                per_core_percent: prev
                    .cores
                    .iter()
                    .zip(&current.cores)
                    .map(|(p, c)| usage_between(*p, *c))
                    .collect(),
            },
            // first sample, or the core set changed (hotplug)
            _ => CpuLoad {
                total_percent: 0.0,
                per_core_percent: vec![0.0; current.cores.len()],
            },
        };
        self.prev = Some(current);
        load
    }
}

pub fn usage_between(prev: CoreTicks, current: CoreTicks) -> f64 {
    let total_delta = current.total.saturating_sub(prev.total);
    if total_delta == 0 {
        return 0.0;
    }
    let idle_delta = current.idle.saturating_sub(prev.idle).min(total_delta);
    100.0 - 100.0 * (idle_delta as f64 / total_delta as f64)
}

pub fn parse_proc_stat(content: &str) -> Result<ProcStat, CollectorError> {
    let mut aggregate = None;
    let mut cores = Vec::new();

    for line in content.lines() {
        let Some(label) = line.split_whitespace().next() else {
            continue;
        };
        if !label.starts_with("cpu") {
            continue;
        }
        let ticks = parse_cpu_line(line)?;
        if label == "cpu" {
            aggregate = Some(ticks);
        } else {
            cores.push(ticks);
        }
    }

    let aggregate =
        aggregate.ok_or_else(|| CollectorError::parse(PROC_STAT, "cpu", "no aggregate line"))?;
    Ok(ProcStat { aggregate, cores })
}

fn parse_cpu_line(line: &str) -> Result<CoreTicks, CollectorError> {
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| CollectorError::parse(PROC_STAT, "cpu", line))?;
    if fields.len() < 4 {
        return Err(CollectorError::parse(PROC_STAT, "cpu", line));
    }

    // user nice system idle iowait irq softirq steal [guest guest_nice]
    // guest time is already included in user/nice
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().take(8).sum();
    Ok(CoreTicks { idle, total })
}

/// Parses `typeperf "\Processor(*)\% Processor Time" -sc 1` CSV output.
pub fn parse_typeperf_processor(text: &str) -> Result<CpuLoad, CollectorError> {
    let mut rows = text
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('"'))
        .map(split_csv_row);

    let header = rows
        .next()
        .ok_or_else(|| CollectorError::parse("typeperf", "header", text))?;
    let values = rows
        .next()
        .ok_or_else(|| CollectorError::parse("typeperf", "sample", text))?;

    let mut total = None;
    let mut per_core = Vec::new();
    for (column, raw) in header.iter().zip(values.iter()).skip(1) {
        let Some(v) = super::parse_f64_loose(raw) else {
            return Err(CollectorError::parse("typeperf", column, raw.clone()));
        };
        if column.contains("(_Total)") {
            total = Some(v);
        } else {
            per_core.push(v);
        }
    }

    let total_percent = match total {
        Some(v) => v,
        None if !per_core.is_empty() => per_core.iter().sum::<f64>() / per_core.len() as f64,
        None => return Err(CollectorError::parse("typeperf", "_Total", text)),
    };
    Ok(CpuLoad {
        total_percent,
        per_core_percent: per_core,
    })
}

fn split_csv_row(line: &str) -> Vec<String> {
    line.split("\",\"")
        .map(|v| v.trim_matches('"').to_string())
        .collect()
}

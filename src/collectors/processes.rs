use super::{CollectorError, MetricCollector};
use crate::state::{GroupWriter, ProcessStat, TopProcesses};
use async_trait::async_trait;
use sysinfo::{ProcessExt, System, SystemExt};

const NAME: &str = "processes";

/// The busiest processes by CPU share. sysinfo only, no native fallback.
pub struct ProcessCollector {
    limit: usize,
    system: System,
    writer: GroupWriter<TopProcesses>,
}

impl ProcessCollector {
    pub fn new(limit: usize, writer: GroupWriter<TopProcesses>) -> Self {
        Self {
            limit,
            system: System::new(),
            writer,
        }
    }
}

#[async_trait]
impl MetricCollector for ProcessCollector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn strategy(&self) -> &'static str {
        "sysinfo"
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        if !System::IS_SUPPORTED {
            return Err(CollectorError::Unsupported);
        }
        self.system.refresh_cpu();
        self.system.refresh_processes();

        let cores = self.system.cpus().len().max(1) as f64;
        let sampled: Vec<ProcessStat> = self
            .system
            .processes()
            .values()
            .map(|p| ProcessStat {
                name: p.name().to_string(),
                // sysinfo reports per-core percent, up to 100 * cores
                cpu_percent: p.cpu_usage() as f64 / cores,
            })
            .collect();
        if sampled.is_empty() {
            return Err(CollectorError::Unavailable("process list"));
        }

        self.writer
            .write(TopProcesses(top_by_cpu(sampled, self.limit)))
            .await;
        Ok(())
    }
}

pub fn top_by_cpu(mut processes: Vec<ProcessStat>, limit: usize) -> Vec<ProcessStat> {
    processes.retain(|p| p.cpu_percent.is_finite());
    processes.sort_by(|a, b| {
        b.cpu_percent
            .total_cmp(&a.cpu_percent)
            .then_with(|| a.name.cmp(&b.name))
    });
    processes.truncate(limit);
    processes
}

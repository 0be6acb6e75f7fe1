use super::strategy::Strategy;
use super::{CollectorError, MetricCollector};
use crate::platform::{OsFamily, PlatformFacts};
use crate::state::{GroupWriter, MemoryUsage};
use async_trait::async_trait;
use sysinfo::{System, SystemExt};
use tokio::fs;

const NAME: &str = "memory";
const PROC_MEMINFO: &str = "/proc/meminfo";

pub struct MemoryCollector {
    strategy: Strategy<System>,
    has_meminfo: bool,
    writer: GroupWriter<MemoryUsage>,
}

impl MemoryCollector {
    pub fn new(facts: &PlatformFacts, writer: GroupWriter<MemoryUsage>) -> Self {
        let strategy = if System::IS_SUPPORTED {
            Strategy::Accelerated(System::new())
        } else {
            Strategy::Native
        };
        Self {
            strategy,
            has_meminfo: facts.os_family == OsFamily::Linux,
            writer,
        }
    }
}

#[async_trait]
impl MetricCollector for MemoryCollector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn strategy(&self) -> &'static str {
        self.strategy
            .label("sysinfo", if self.has_meminfo { "proc" } else { "none" })
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        if let Some(system) = self.strategy.library_mut() {
            system.refresh_memory();
            let usage = MemoryUsage {
                used_bytes: system.used_memory(),
                total_bytes: system.total_memory(),
            };
            if usage.total_bytes > 0 {
                self.writer.write(usage).await;
                return Ok(());
            }
            self.strategy
                .degrade(NAME, &CollectorError::Unavailable("sysinfo total memory"));
        }

        if !self.has_meminfo {
            return Err(CollectorError::Unsupported);
        }
        let content = fs::read_to_string(PROC_MEMINFO)
            .await
            .map_err(|source| CollectorError::Read {
                path: PROC_MEMINFO.into(),
                source,
            })?;
        self.writer.write(parse_meminfo(&content)?).await;
        Ok(())
    }
}

/// Used memory is `MemTotal - MemAvailable`; kernels before 3.14 lack
/// `MemAvailable`, there `MemFree + Buffers + Cached` stands in.
pub fn parse_meminfo(content: &str) -> Result<MemoryUsage, CollectorError> {
    let field = |key: &str| -> Option<u64> {
        content
            .lines()
            .find(|l| l.starts_with(key) && l[key.len()..].starts_with(':'))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse::<u64>().ok())
            .map(|kib| kib * 1024)
    };

    let total = field("MemTotal")
        .filter(|v| *v > 0)
        .ok_or_else(|| CollectorError::parse(PROC_MEMINFO, "MemTotal", content))?;
    let available = match field("MemAvailable") {
        Some(v) => v,
        None => {
            field("MemFree").unwrap_or(0)
                + field("Buffers").unwrap_or(0)
                + field("Cached").unwrap_or(0)
        }
    };

    Ok(MemoryUsage {
        used_bytes: total.saturating_sub(available),
        total_bytes: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_with_available() {
        let content = "\
MemTotal:        4000000 kB
MemFree:          500000 kB
MemAvailable:    3000000 kB
Buffers:          100000 kB
Cached:          1000000 kB";
        let usage = parse_meminfo(content).unwrap();
        assert_eq!(usage.total_bytes, 4_000_000 * 1024);
        assert_eq!(usage.used_bytes, 1_000_000 * 1024);
    }

    #[test]
    fn meminfo_old_kernel_fallback() {
        let content = "\
MemTotal:        1000 kB
MemFree:          200 kB
Buffers:          100 kB
Cached:           100 kB";
        let usage = parse_meminfo(content).unwrap();
        assert_eq!(usage.used_bytes, 600 * 1024);
    }

    #[test]
    fn meminfo_without_total_fails() {
        assert!(parse_meminfo("MemFree: 1 kB").is_err());
    }

    #[tokio::test]
    async fn library_sample_writes_memory() {
        let store = crate::state::SnapshotStore::new(
            PlatformFacts::for_tests(OsFamily::Linux, false).identity(),
            crate::state::InterfaceAddress::unknown(),
        );
        let facts = PlatformFacts::for_tests(OsFamily::from_os(std::env::consts::OS), false);
        let mut collector = MemoryCollector::new(&facts, store.writer());
        if collector.collect().await.is_ok() {
            let snap = store.read().await;
            assert!(snap.mem_total_bytes > 0);
            assert!((0.0..=100.0).contains(&snap.mem_percent));
        }
    }
}

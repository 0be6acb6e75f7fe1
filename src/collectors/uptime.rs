use super::strategy::Strategy;
use super::{run_command, CollectorError, MetricCollector};
use crate::platform::{OsFamily, PlatformFacts};
use crate::state::{GroupWriter, Uptime};
use async_trait::async_trait;
use sysinfo::{System, SystemExt};
use tokio::fs;

const NAME: &str = "uptime";
const PROC_UPTIME: &str = "/proc/uptime";

pub struct UptimeCollector {
    strategy: Strategy<System>,
    os_family: OsFamily,
    writer: GroupWriter<Uptime>,
}

impl UptimeCollector {
    pub fn new(facts: &PlatformFacts, writer: GroupWriter<Uptime>) -> Self {
        let strategy = if System::IS_SUPPORTED {
            Strategy::Accelerated(System::new())
        } else {
            Strategy::Native
        };
        Self {
            strategy,
            os_family: facts.os_family,
            writer,
        }
    }

    async fn native_uptime(&self) -> Result<u64, CollectorError> {
        match self.os_family {
            OsFamily::Linux => {
                let content = fs::read_to_string(PROC_UPTIME)
                    .await
                    .map_err(|source| CollectorError::Read {
                        path: PROC_UPTIME.into(),
                        source,
                    })?;
                parse_proc_uptime(&content)
            }
            OsFamily::Windows => {
                let text = run_command(
                    "powershell",
                    &[
                        "-NoProfile",
                        "-Command",
                        "[int64]((Get-Date) - (Get-CimInstance Win32_OperatingSystem).LastBootUpTime).TotalSeconds",
                    ],
                )
                .await?;
                text.trim()
                    .parse::<u64>()
                    .map_err(|_| CollectorError::parse("Win32_OperatingSystem", "LastBootUpTime", text))
            }
            OsFamily::Other => Err(CollectorError::Unsupported),
        }
    }
}

#[async_trait]
impl MetricCollector for UptimeCollector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn strategy(&self) -> &'static str {
        let native = match self.os_family {
            OsFamily::Linux => "proc",
            OsFamily::Windows => "cim",
            OsFamily::Other => "none",
        };
        self.strategy.label("sysinfo", native)
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        if let Some(system) = self.strategy.library_mut() {
            let secs = system.uptime();
            if secs > 0 {
                self.writer.write(Uptime(secs)).await;
                return Ok(());
            }
            self.strategy
                .degrade(NAME, &CollectorError::Unavailable("sysinfo uptime"));
        }

        let secs = self.native_uptime().await?;
        self.writer.write(Uptime(secs)).await;
        Ok(())
    }
}

/// First field of `/proc/uptime`, fractional seconds truncated.
pub fn parse_proc_uptime(content: &str) -> Result<u64, CollectorError> {
    content
        .split_whitespace()
        .next()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| v as u64)
        .ok_or_else(|| CollectorError::parse(PROC_UPTIME, "uptime", content))
}

use super::strategy::Strategy;
use super::{run_command, CollectorError, MetricCollector};
use crate::platform::{OsFamily, PlatformFacts};
use crate::state::{DiskUsage, GroupWriter};
use async_trait::async_trait;
use sysinfo::{DiskExt, System, SystemExt};

const NAME: &str = "disk";

/// Usage of the system drive: `C:` on Windows, `/` elsewhere, the first
/// reported filesystem when neither is listed.
pub struct DiskCollector {
    strategy: Strategy<System>,
    os_family: OsFamily,
    writer: GroupWriter<DiskUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub mount: String,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl DiskCollector {
    pub fn new(facts: &PlatformFacts, writer: GroupWriter<DiskUsage>) -> Self {
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

    async fn native_entries(&self) -> Result<Vec<DiskEntry>, CollectorError> {
        match self.os_family {
            OsFamily::Windows => {
                let text = run_command(
                    "powershell",
                    &[
                        "-NoProfile",
                        "-Command",
                        "Get-CimInstance Win32_LogicalDisk -Filter 'DriveType=3' | ForEach-Object { \"$($_.DeviceID)|$($_.Size)|$($_.FreeSpace)\" }",
                    ],
                )
                .await?;
                Ok(parse_logical_disks(&text))
            }
            OsFamily::Linux | OsFamily::Other => {
                let text = run_command("df", &["-kP"]).await?;
                parse_df(&text)
            }
        }
    }
}

#[async_trait]
impl MetricCollector for DiskCollector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn strategy(&self) -> &'static str {
        let native = match self.os_family {
            OsFamily::Windows => "cim",
            _ => "df",
        };
        self.strategy.label("sysinfo", native)
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        if let Some(system) = self.strategy.library_mut() {
            let entries = library_entries(system);
            if entries.is_empty() {
                self.strategy
                    .degrade(NAME, &CollectorError::Unavailable("sysinfo disk list"));
            } else {
                let Some(disk) = select_system_disk(&entries, self.os_family) else {
                    return Err(CollectorError::Unavailable("system disk"));
                };
                self.writer.write(disk.into()).await;
                return Ok(());
            }
        }

        let entries = self.native_entries().await?;
        let disk = select_system_disk(&entries, self.os_family)
            .ok_or(CollectorError::Unavailable("system disk"))?;
        self.writer.write(disk.into()).await;
        Ok(())
    }
}

impl From<&DiskEntry> for DiskUsage {
    fn from(d: &DiskEntry) -> Self {
        DiskUsage {
            used_bytes: d.used_bytes,
            total_bytes: d.total_bytes,
        }
    }
}

fn library_entries(system: &mut System) -> Vec<DiskEntry> {
    if system.disks().is_empty() {
        system.refresh_disks_list();
    } else {
        system.refresh_disks();
    }
    system
        .disks()
        .iter()
        .map(|d| {
            let total = d.total_space();
            DiskEntry {
                mount: d.mount_point().to_string_lossy().to_string(),
                used_bytes: total.saturating_sub(d.available_space()),
                total_bytes: total,
            }
        })
        .collect()
}

pub fn select_system_disk(entries: &[DiskEntry], os_family: OsFamily) -> Option<&DiskEntry> {
    let is_system = |mount: &str| match os_family {
        OsFamily::Windows => mount.trim_end_matches('\\').eq_ignore_ascii_case("c:"),
        _ => mount == "/",
    };
    entries
        .iter()
        .find(|d| is_system(&d.mount))
        .or_else(|| entries.first())
}

/// POSIX `df -kP` output, sizes in KiB.
pub fn parse_df(text: &str) -> Result<Vec<DiskEntry>, CollectorError> {
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| CollectorError::parse("df", "header", text))?;
    if !header.starts_with("Filesystem") {
        return Err(CollectorError::parse("df", "header", header));
    }

    let mut out = Vec::new();
    for line in lines {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 {
            continue;
        }
        let (Ok(total_kib), Ok(used_kib)) = (parts[1].parse::<u64>(), parts[2].parse::<u64>())
        else {
            continue;
        };
        out.push(DiskEntry {
            mount: parts[5..].join(" "),
            used_bytes: used_kib * 1024,
            total_bytes: total_kib * 1024,
        });
    }
    Ok(out)
}

/// `DeviceID|Size|FreeSpace` lines.
pub fn parse_logical_disks(text: &str) -> Vec<DiskEntry> {
    text.lines()
        .filter_map(|line| {
            let mut parts = line.trim().split('|');
            let mount = parts.next()?.trim();
            let total = parts.next()?.trim().parse::<u64>().ok()?;
            let free = parts.next()?.trim().parse::<u64>().ok()?;
            if mount.is_empty() {
                return None;
            }
            Some(DiskEntry {
                mount: mount.to_string(),
                used_bytes: total.saturating_sub(free),
                total_bytes: total,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mount: &str, used: u64, total: u64) -> DiskEntry {
        DiskEntry {
            mount: mount.to_string(),
            used_bytes: used,
            total_bytes: total,
        }
    }

    #[test]
    fn root_mount_is_preferred() {
        let entries = vec![entry("/boot", 1, 2), entry("/", 5, 10)];
        assert_eq!(
            select_system_disk(&entries, OsFamily::Linux).unwrap().mount,
            "/"
        );
    }

    #[test]
    fn falls_back_to_first_filesystem_without_root() {
        let entries = vec![entry("/data", 1, 2), entry("/mnt/usb", 5, 10)];
        assert_eq!(
            select_system_disk(&entries, OsFamily::Linux).unwrap().mount,
            "/data"
        );
        assert!(select_system_disk(&[], OsFamily::Linux).is_none());
    }

    #[test]
    fn windows_system_drive() {
        let entries = vec![entry("D:\\", 1, 2), entry("C:\\", 5, 10)];
        assert_eq!(
            select_system_disk(&entries, OsFamily::Windows).unwrap().mount,
            "C:\\"
        );
    }

    #[test]
    fn df_output() {
        let text = "\
Filesystem     1024-blocks     Used Available Capacity Mounted on
/dev/root         30358348 10511076  18556464      37% /
/dev/mmcblk0p1      261108    51240    209868      20% /boot/firmware
tmpfs               -        -         -         -   /weird";
        let entries = parse_df(text).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mount, "/");
        assert_eq!(entries[0].total_bytes, 30358348 * 1024);
        assert_eq!(entries[0].used_bytes, 10511076 * 1024);
        assert_eq!(entries[1].mount, "/boot/firmware");
    }

    #[test]
    fn df_rejects_unexpected_output() {
        assert!(parse_df("").is_err());
        assert!(parse_df("df: invalid option").is_err());
    }

    #[test]
    fn cim_logical_disks() {
        let text = "C:|512000000000|128000000000\r\nD:|1000|\r\n";
        let entries = parse_logical_disks(text);
        assert_eq!(entries, vec![entry("C:", 384000000000, 512000000000)]);
    }
}

use super::strategy::Strategy;
use super::{
    parse_f64_loose, run_blocking_with_timeout, run_command, CollectorError, MetricCollector,
    COMMAND_TIMEOUT,
};
use crate::platform::{OsFamily, PlatformFacts};
use crate::state::{GroupWriter, Temperature};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use sysinfo::{ComponentExt, System, SystemExt};
use tokio::fs;
use tracing::debug;

const NAME: &str = "cpu_temp";
const THERMAL_ROOT: &str = "/sys/class/thermal";

const CPU_MARKERS: [&str; 9] = [
    "cpu",
    "package",
    "tctl",
    "tdie",
    "coretemp",
    "k10temp",
    "x86_pkg_temp",
    "soc",
    "core",
];
const GPU_MARKERS: [&str; 4] = ["gpu", "nvidia", "amdgpu", "radeon"];

pub struct TemperatureCollector {
    /// The handle lives behind a mutex so the blocking sensor refresh can run
    /// off the async worker.
    strategy: Strategy<Arc<Mutex<System>>>,
    native: NativeThermal,
    writer: GroupWriter<Temperature>,
}

enum NativeThermal {
    /// Raspberry-style boards: firmware query, thermal zones as backup.
    Firmware { zones: PathBuf },
    ThermalZones { zones: PathBuf },
    Wmi,
    Unsupported,
}

impl TemperatureCollector {
    pub fn new(facts: &PlatformFacts, writer: GroupWriter<Temperature>) -> Self {
        let strategy = if System::IS_SUPPORTED {
            Strategy::Accelerated(Arc::new(Mutex::new(System::new())))
        } else {
            Strategy::Native
        };
        let zones = PathBuf::from(THERMAL_ROOT);
        let native = match (facts.os_family, facts.is_arm_class) {
            (OsFamily::Linux, true) => NativeThermal::Firmware { zones },
            (OsFamily::Linux, false) => NativeThermal::ThermalZones { zones },
            (OsFamily::Windows, _) => NativeThermal::Wmi,
            (OsFamily::Other, _) => NativeThermal::Unsupported,
        };
        Self {
            strategy,
            native,
            writer,
        }
    }
}

#[async_trait]
impl MetricCollector for TemperatureCollector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn strategy(&self) -> &'static str {
        let native = match self.native {
            NativeThermal::Firmware { .. } => "vcgencmd",
            NativeThermal::ThermalZones { .. } => "thermal_zone",
            NativeThermal::Wmi => "wmi",
            NativeThermal::Unsupported => "none",
        };
        self.strategy.label("sysinfo", native)
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        if let Some(system) = self.strategy.library_mut() {
            match sample_library(Arc::clone(system)).await {
                Ok(reading) => {
                    self.writer.write(reading).await;
                    return Ok(());
                }
                Err(err) => self.strategy.degrade(NAME, &err),
            }
        }

        let package_celsius = match &self.native {
            NativeThermal::Firmware { zones } => match firmware_temperature().await {
                Ok(v) => v,
                Err(err) => {
                    debug!(error = %err, "vcgencmd temperature failed, trying thermal zones");
                    thermal_zone_temperature(zones).await?
                }
            },
            NativeThermal::ThermalZones { zones } => thermal_zone_temperature(zones).await?,
            NativeThermal::Wmi => wmi_temperature().await?,
            NativeThermal::Unsupported => return Err(CollectorError::Unsupported),
        };

        self.writer
            .write(Temperature {
                package_celsius,
                cores_celsius: Vec::new(),
            })
            .await;
        Ok(())
    }
}

/// A usable reading is strictly inside (0, 150) °C. Anything else means
/// "no sensor", never a clamped value.
pub fn valid_celsius(v: f64) -> Option<f64> {
    (v.is_finite() && v > 0.0 && v < 150.0).then_some(v)
}

/// WMI thermal zones report tenths of Kelvin.
pub fn tenths_kelvin_to_celsius(raw: f64) -> Option<f64> {
    if !raw.is_finite() || raw <= 0.0 {
        return None;
    }
    valid_celsius(raw / 10.0 - 273.15)
}

/// Component refresh can block for a long time (WMI on Windows), so it runs
/// on the blocking pool under [`COMMAND_TIMEOUT`]. A timeout counts as a
/// library failure.
async fn sample_library(system: Arc<Mutex<System>>) -> Result<Temperature, CollectorError> {
    run_blocking_with_timeout("sysinfo components", COMMAND_TIMEOUT, move || {
        let mut system = system
            .lock()
            .map_err(|_| CollectorError::Unavailable("sysinfo components"))?;
        read_components(&mut system)
    })
    .await
}

fn read_components(system: &mut System) -> Result<Temperature, CollectorError> {
    if system.components().is_empty() {
        system.refresh_components_list();
    } else {
        system.refresh_components();
    }
    if system.cpus().is_empty() {
        system.refresh_cpu();
    }

    let readings: Vec<(String, f64)> = system
        .components()
        .iter()
        .map(|c| (c.label().to_string(), c.temperature() as f64))
        .collect();
    if readings.is_empty() {
        return Err(CollectorError::Unavailable("sysinfo components"));
    }

    let package_celsius =
        pick_cpu_temperature(&readings).ok_or(CollectorError::Unavailable("cpu sensor"))?;
    Ok(Temperature {
        package_celsius,
        cores_celsius: per_core_temperatures(&readings, system.cpus().len()),
    })
}

/// Hottest valid CPU-looking sensor, then hottest valid non-GPU sensor.
pub fn pick_cpu_temperature(readings: &[(String, f64)]) -> Option<f64> {
    let candidates = || {
        readings.iter().filter_map(|(label, v)| {
            let label = label.to_lowercase();
            let is_gpu = GPU_MARKERS.iter().any(|m| label.contains(m));
            valid_celsius(*v).filter(|_| !is_gpu).map(|v| (label, v))
        })
    };

    let primary = candidates()
        .filter(|(label, _)| CPU_MARKERS.iter().any(|m| label.contains(m)))
        .map(|(_, v)| v)
        .max_by(|a, b| a.total_cmp(b));
    if primary.is_some() {
        return primary;
    }

    candidates().map(|(_, v)| v).max_by(|a, b| a.total_cmp(b))
}

/// Per-core readings from `... Core N` sensors, in logical CPU order.
///
/// `N` is a physical core id: ids may skip numbers and hyperthreaded CPUs
/// have fewer sensors than logical CPUs. Readings are only attached when
/// there is exactly one sensor per logical CPU; otherwise every core gets
/// `None`.
pub fn per_core_temperatures(readings: &[(String, f64)], logical_cpus: usize) -> Vec<Option<f64>> {
    let mut cores: Vec<(usize, Option<f64>)> = readings
        .iter()
        .filter_map(|(label, v)| core_index(label).map(|idx| (idx, valid_celsius(*v))))
        .collect();
    if cores.is_empty() || cores.len() != logical_cpus {
        return Vec::new();
    }
    cores.sort_by_key(|(idx, _)| *idx);
    cores.into_iter().map(|(_, v)| v).collect()
}

fn core_index(label: &str) -> Option<usize> {
    let pos = label.find("Core ")?;
    let digits: String = label[pos + 5..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

async fn firmware_temperature() -> Result<f64, CollectorError> {
    let out = run_command("vcgencmd", &["measure_temp"]).await?;
    parse_vcgencmd_temp(&out)
}

/// `temp=48.3'C`
pub fn parse_vcgencmd_temp(out: &str) -> Result<f64, CollectorError> {
    let raw = out
        .trim()
        .strip_prefix("temp=")
        .ok_or_else(|| CollectorError::parse("vcgencmd", "temp", out.trim()))?;
    parse_f64_loose(raw)
        .and_then(valid_celsius)
        .ok_or_else(|| CollectorError::parse("vcgencmd", "temp", raw))
}

pub async fn thermal_zone_temperature(root: &Path) -> Result<f64, CollectorError> {
    let mut entries = fs::read_dir(root)
        .await
        .map_err(|source| CollectorError::Read {
            path: root.display().to_string(),
            source,
        })?;

    let mut zones = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
            continue;
        };
        if !name.starts_with("thermal_zone") {
            continue;
        }

        let Ok(temp_raw) = fs::read_to_string(path.join("temp")).await else {
            continue;
        };
        let typ = fs::read_to_string(path.join("type"))
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| name.to_string());
        let Ok(v) = temp_raw.trim().parse::<f64>() else {
            continue;
        };
        // millidegrees on every modern kernel
        let celsius = if v.abs() > 1000.0 { v / 1000.0 } else { v };
        zones.push((typ, celsius));
    }
    zones.sort_by(|a, b| a.0.cmp(&b.0));

    pick_cpu_temperature(&zones).ok_or(CollectorError::Unavailable("thermal zone"))
}

async fn wmi_temperature() -> Result<f64, CollectorError> {
    match run_command(
        "wmic",
        &[
            "/namespace:\\\\root\\wmi",
            "PATH",
            "MSAcpi_ThermalZoneTemperature",
            "get",
            "CurrentTemperature,InstanceName",
            "/format:csv",
        ],
    )
    .await
    {
        Ok(text) => parse_wmic_thermal_csv(&text),
        Err(err) => {
            debug!(error = %err, "wmic thermal query failed, trying CIM");
            let text = run_command(
                "powershell",
                &[
                    "-NoProfile",
                    "-Command",
                    "Get-CimInstance -Namespace root/wmi -ClassName MSAcpi_ThermalZoneTemperature -ErrorAction SilentlyContinue | ForEach-Object { $_.CurrentTemperature }",
                ],
            )
            .await?;
            text.lines()
                .filter_map(parse_f64_loose)
                .filter_map(tenths_kelvin_to_celsius)
                .max_by(|a, b| a.total_cmp(b))
                .ok_or(CollectorError::Unavailable("wmi thermal zone"))
        }
    }
}

/// `wmic ... /format:csv` output: `Node,CurrentTemperature,InstanceName`.
pub fn parse_wmic_thermal_csv(text: &str) -> Result<f64, CollectorError> {
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
    let header = lines
        .next()
        .ok_or_else(|| CollectorError::parse("wmic", "header", text))?;
    let column = header
        .split(',')
        .position(|h| h.trim().eq_ignore_ascii_case("CurrentTemperature"))
        .ok_or_else(|| CollectorError::parse("wmic", "CurrentTemperature", header))?;

    lines
        .filter_map(|line| line.split(',').nth(column))
        .filter_map(parse_f64_loose)
        .filter_map(tenths_kelvin_to_celsius)
        .max_by(|a, b| a.total_cmp(b))
        .ok_or(CollectorError::Unavailable("wmi thermal zone"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs as stdfs;

    #[test]
    fn kelvin_conversion_and_band() {
        let c = tenths_kelvin_to_celsius(3232.0).unwrap();
        assert!((c - 50.05).abs() < 1e-9);
        // below freezing is not a plausible CPU reading
        assert_eq!(tenths_kelvin_to_celsius(2731.0), None);
        assert_eq!(tenths_kelvin_to_celsius(5000.0), None);
        assert_eq!(tenths_kelvin_to_celsius(0.0), None);
    }

    #[test]
    fn out_of_band_is_rejected_not_clamped() {
        assert_eq!(valid_celsius(150.0), None);
        assert_eq!(valid_celsius(0.0), None);
        assert_eq!(valid_celsius(-5.0), None);
        assert_eq!(valid_celsius(149.9), Some(149.9));
    }

    #[test]
    fn vcgencmd_output() {
        assert_eq!(parse_vcgencmd_temp("temp=48.3'C\n").unwrap(), 48.3);
        assert!(parse_vcgencmd_temp("error=1 error_msg=\"Command not registered\"").is_err());
    }

    #[test]
    fn wmic_csv_output() {
        let text = "\r\nNode,CurrentTemperature,InstanceName\r\nPC,3132,ACPI\\ThermalZone\\TZ00_0\r\nPC,3232,ACPI\\ThermalZone\\CPUZ_0\r\n";
        let c = parse_wmic_thermal_csv(text).unwrap();
        assert!((c - 50.05).abs() < 1e-9);
    }

    #[test]
    fn cpu_sensor_preferred_over_others() {
        let readings = vec![
            ("nvme Composite".to_string(), 60.0),
            ("amdgpu edge".to_string(), 80.0),
            ("k10temp Tctl".to_string(), 55.0),
        ];
        assert_eq!(pick_cpu_temperature(&readings), Some(55.0));

        let no_cpu = vec![("acpitz".to_string(), 40.0), ("amdgpu".to_string(), 70.0)];
        assert_eq!(pick_cpu_temperature(&no_cpu), Some(40.0));

        let invalid = vec![("cpu_thermal".to_string(), 0.0)];
        assert_eq!(pick_cpu_temperature(&invalid), None);
    }

    #[test]
    fn per_core_readings_follow_sensor_order() {
        // physical ids skip numbers on some parts
        let readings = vec![
            ("coretemp Package id 0".to_string(), 50.0),
            ("coretemp Core 8".to_string(), 49.0),
            ("coretemp Core 0".to_string(), 45.0),
            ("coretemp Core 4".to_string(), 47.0),
            ("coretemp Core 12".to_string(), 200.0),
        ];
        assert_eq!(
            per_core_temperatures(&readings, 4),
            vec![Some(45.0), Some(47.0), Some(49.0), None]
        );
    }

    #[test]
    fn hyperthreaded_cpus_get_no_per_core_readings() {
        let readings = vec![
            ("coretemp Core 0".to_string(), 45.0),
            ("coretemp Core 1".to_string(), 47.0),
        ];
        // two physical cores, four logical CPUs
        assert!(per_core_temperatures(&readings, 4).is_empty());
        assert!(per_core_temperatures(&[("cpu_thermal".to_string(), 50.0)], 1).is_empty());
    }

    #[tokio::test]
    async fn thermal_zone_reads_millidegrees() {
        let dir = tempfile::tempdir().unwrap();
        let z0 = dir.path().join("thermal_zone0");
        stdfs::create_dir(&z0).unwrap();
        stdfs::write(z0.join("type"), "cpu-thermal\n").unwrap();
        stdfs::write(z0.join("temp"), "48312\n").unwrap();
        let z1 = dir.path().join("thermal_zone1");
        stdfs::create_dir(&z1).unwrap();
        stdfs::write(z1.join("type"), "gpu-thermal\n").unwrap();
        stdfs::write(z1.join("temp"), "70000\n").unwrap();
        stdfs::create_dir(dir.path().join("cooling_device0")).unwrap();

        let c = thermal_zone_temperature(dir.path()).await.unwrap();
        assert!((c - 48.312).abs() < 1e-9);
    }

    #[tokio::test]
    async fn thermal_zone_without_sensors_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = thermal_zone_temperature(dir.path()).await.unwrap_err();
        assert!(matches!(err, CollectorError::Unavailable(_)));
    }
}

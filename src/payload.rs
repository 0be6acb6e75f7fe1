use crate::state::Snapshot;
use serde::Serialize;

pub const MESSAGE_TYPE: &str = "SYSINFO";

/// Value sent as `cpuTemp` when no sensor reading is available.
pub const NO_SENSOR: i32 = -1;

#[derive(Debug, Clone, Serialize)]
pub struct SysinfoMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub value: SysinfoValue,
}

/// Wire shape consumed by the overlay. Percentages and temperatures are
/// text with one decimal digit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SysinfoValue {
    pub platform: String,
    pub distro: String,
    pub hostname: String,
    pub uptime: u64,
    pub cpu_load: String,
    pub cpus: Vec<WireCore>,
    pub cpu_temp: WireTemp,
    pub mem_used: u64,
    pub mem_total: u64,
    pub mem_percent: String,
    pub disk_used: u64,
    pub disk_total: u64,
    pub disk_percent: String,
    pub net_iface: String,
    pub net_ip: String,
    pub net_rx: u64,
    pub net_tx: u64,
    pub throttled: bool,
    pub processes: Vec<WireProcess>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireCore {
    pub load: String,
    pub temp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireProcess {
    pub name: String,
    pub cpu: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WireTemp {
    Unavailable(i32),
    Celsius(String),
}

impl From<Option<f64>> for WireTemp {
    fn from(value: Option<f64>) -> Self {
        match value {
            Some(v) => WireTemp::Celsius(one_decimal(v)),
            None => WireTemp::Unavailable(NO_SENSOR),
        }
    }
}

impl From<&Snapshot> for SysinfoValue {
    fn from(s: &Snapshot) -> Self {
        let cpus = s
            .per_core_load_percent
            .iter()
            .enumerate()
            .map(|(idx, load)| WireCore {
                load: one_decimal(*load),
                temp: s
                    .core_temps_celsius
                    .get(idx)
                    .copied()
                    .flatten()
                    .map(one_decimal),
            })
            .collect();

        Self {
            platform: s.platform.clone(),
            distro: s.distro.clone(),
            hostname: s.hostname.clone(),
            uptime: s.uptime_seconds,
            cpu_load: one_decimal(s.cpu_load_percent),
            cpus,
            cpu_temp: s.cpu_temp_celsius.into(),
            mem_used: s.mem_used_bytes,
            mem_total: s.mem_total_bytes,
            mem_percent: one_decimal(s.mem_percent),
            disk_used: s.disk_used_bytes,
            disk_total: s.disk_total_bytes,
            disk_percent: one_decimal(s.disk_percent),
            net_iface: s.net_iface.clone(),
            net_ip: s.net_ip.clone(),
            net_rx: s.net_rx_bytes_per_sec,
            net_tx: s.net_tx_bytes_per_sec,
            throttled: s.throttled,
            processes: s
                .processes
                .iter()
                .map(|p| WireProcess {
                    name: p.name.clone(),
                    cpu: one_decimal(p.cpu_percent),
                })
                .collect(),
        }
    }
}

impl SysinfoMessage {
    pub fn from_snapshot(snapshot: &Snapshot) -> Self {
        Self {
            kind: MESSAGE_TYPE,
            value: snapshot.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub fn one_decimal(v: f64) -> String {
    if !v.is_finite() {
        return "0.0".to_string();
    }
    let s = format!("{v:.1}");
    // "-0.0" shows up for tiny negative noise
    if s == "-0.0" {
        "0.0".to_string()
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProcessStat;
    use serde_json::Value;

    fn sample() -> Snapshot {
        Snapshot {
            platform: "linux".to_string(),
            hostname: "rpi".to_string(),
            cpu_load_percent: 12.345,
            per_core_load_percent: vec![10.0, 14.69],
            core_temps_celsius: vec![Some(41.26)],
            mem_percent: 50.0,
            processes: vec![ProcessStat {
                name: "node".to_string(),
                cpu_percent: 3.14,
            }],
            ..Snapshot::default()
        }
    }

    #[test]
    fn message_uses_type_discriminator_and_camel_case() {
        let json = SysinfoMessage::from_snapshot(&sample()).to_json().unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["type"], "SYSINFO");
        assert_eq!(v["value"]["cpuLoad"], "12.3");
        assert_eq!(v["value"]["memPercent"], "50.0");
        assert_eq!(v["value"]["netIface"], "-");
        assert_eq!(v["value"]["processes"][0]["cpu"], "3.1");
        assert!(v["value"]["netRx"].is_u64());
    }

    #[test]
    fn missing_sensor_is_minus_one_and_null() {
        let json = SysinfoMessage::from_snapshot(&sample()).to_json().unwrap();
        let v: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["value"]["cpuTemp"], -1);
        assert_eq!(v["value"]["cpus"][0]["temp"], "41.3");
        assert!(v["value"]["cpus"][1]["temp"].is_null());
        assert_eq!(v["value"]["cpus"][1]["load"], "14.7");
    }

    #[test]
    fn valid_temperature_is_text() {
        let mut snap = sample();
        snap.cpu_temp_celsius = Some(48.31);
        let value = SysinfoValue::from(&snap);
        assert_eq!(value.cpu_temp, WireTemp::Celsius("48.3".to_string()));
    }

    #[test]
    fn one_decimal_formatting() {
        assert_eq!(one_decimal(0.0), "0.0");
        assert_eq!(one_decimal(-0.01), "0.0");
        assert_eq!(one_decimal(99.96), "100.0");
        assert_eq!(one_decimal(f64::NAN), "0.0");
    }
}

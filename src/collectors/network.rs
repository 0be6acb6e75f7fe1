use super::strategy::Strategy;
use super::{run_command, CollectorError, MetricCollector};
use crate::platform::{OsFamily, PlatformFacts};
use crate::state::{GroupWriter, InterfaceAddress, Throughput, UNKNOWN};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Instant;
use sysinfo::{NetworkExt, NetworksExt, System, SystemExt};
use tokio::fs;

const THROUGHPUT: &str = "net_throughput";
const INTERFACE: &str = "net_iface";
const PROC_NET_DEV: &str = "/proc/net/dev";

/// rx/tx bytes per second on the publishing interface, derived from
/// cumulative counters.
pub struct ThroughputCollector {
    strategy: Strategy<System>,
    iface: Option<String>,
    has_proc: bool,
    baseline: NetworkBaseline,
    writer: GroupWriter<Throughput>,
}

/// Where a pair of cumulative counters came from. Totals from different
/// sources are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterSource {
    Interface,
    NonLoopbackSum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSample {
    pub source: CounterSource,
    pub rx_total: u64,
    pub tx_total: u64,
}

/// Previous cumulative counters. The first sample only primes the baseline,
/// so boot-time totals never show up as a spike. A change of counter source
/// primes it again.
#[derive(Debug, Default)]
pub struct NetworkBaseline {
    prev: Option<(CounterSample, Instant)>,
}

impl NetworkBaseline {
    pub fn rate(&mut self, sample: CounterSample, now: Instant) -> Throughput {
        let idle = Throughput {
            rx_bytes_per_sec: 0,
            tx_bytes_per_sec: 0,
        };
        let rate = match self.prev {
            Some((prev, at)) if prev.source == sample.source => {
                let secs = now.saturating_duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    Throughput {
                        rx_bytes_per_sec: (sample.rx_total.saturating_sub(prev.rx_total) as f64
                            / secs) as u64,
                        tx_bytes_per_sec: (sample.tx_total.saturating_sub(prev.tx_total) as f64
                            / secs) as u64,
                    }
                } else {
                    idle
                }
            }
            _ => idle,
        };
        self.prev = Some((sample, now));
        rate
    }
}

impl ThroughputCollector {
    pub fn new(facts: &PlatformFacts, writer: GroupWriter<Throughput>) -> Self {
        let strategy = if System::IS_SUPPORTED {
            Strategy::Accelerated(System::new())
        } else {
            Strategy::Native
        };
        let iface = facts
            .default_interface
            .is_known()
            .then(|| facts.default_interface.iface.clone());
        Self {
            strategy,
            iface,
            has_proc: facts.os_family == OsFamily::Linux,
            baseline: NetworkBaseline::default(),
            writer,
        }
    }
}

#[async_trait]
impl MetricCollector for ThroughputCollector {
    fn name(&self) -> &'static str {
        THROUGHPUT
    }

    fn strategy(&self) -> &'static str {
        self.strategy
            .label("sysinfo", if self.has_proc { "proc" } else { "none" })
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let counters = match self.strategy.library_mut() {
            Some(system) => {
                let counters = library_counters(system);
                if counters.is_empty() {
                    self.strategy
                        .degrade(THROUGHPUT, &CollectorError::Unavailable("sysinfo networks"));
                    None
                } else {
                    Some(counters)
                }
            }
            None => None,
        };

        let counters = match counters {
            Some(c) => c,
            None if self.has_proc => {
                let content = fs::read_to_string(PROC_NET_DEV).await.map_err(|source| {
                    CollectorError::Read {
                        path: PROC_NET_DEV.into(),
                        source,
                    }
                })?;
                parse_proc_net_dev(&content)?
            }
            None => return Err(CollectorError::Unsupported),
        };

        let sample = pick_counters(&counters, self.iface.as_deref())
            .ok_or(CollectorError::Unavailable("network interface counters"))?;
        let rate = self.baseline.rate(sample, Instant::now());
        self.writer.write(rate).await;
        Ok(())
    }
}

fn library_counters(system: &mut System) -> Vec<(String, u64, u64)> {
    if system.networks().iter().next().is_none() {
        system.refresh_networks_list();
    } else {
        system.refresh_networks();
    }
    system
        .networks()
        .iter()
        .map(|(name, data)| (name.clone(), data.total_received(), data.total_transmitted()))
        .collect()
}

/// Counters of `iface` when listed, otherwise the sum over non-loopback
/// interfaces.
pub fn pick_counters(counters: &[(String, u64, u64)], iface: Option<&str>) -> Option<CounterSample> {
    if counters.is_empty() {
        return None;
    }
    if let Some(name) = iface {
        if let Some((_, rx, tx)) = counters.iter().find(|(n, _, _)| n == name) {
            return Some(CounterSample {
                source: CounterSource::Interface,
                rx_total: *rx,
                tx_total: *tx,
            });
        }
    }
    let (rx_total, tx_total) = counters
        .iter()
        .filter(|(n, _, _)| !is_loopback_name(n))
        .fold((0_u64, 0_u64), |(rx, tx), (_, r, t)| {
            (rx.saturating_add(*r), tx.saturating_add(*t))
        });
    Some(CounterSample {
        source: CounterSource::NonLoopbackSum,
        rx_total,
        tx_total,
    })
}

pub fn parse_proc_net_dev(content: &str) -> Result<Vec<(String, u64, u64)>, CollectorError> {
    let mut out = Vec::new();
    // two header lines
    for line in content.lines().skip(2) {
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        if fields.len() < 9 {
            return Err(CollectorError::parse(PROC_NET_DEV, name.trim(), line));
        }
        let rx = fields[0]
            .parse::<u64>()
            .map_err(|_| CollectorError::parse(PROC_NET_DEV, "rx_bytes", fields[0]))?;
        let tx = fields[8]
            .parse::<u64>()
            .map_err(|_| CollectorError::parse(PROC_NET_DEV, "tx_bytes", fields[8]))?;
        out.push((name.trim().to_string(), rx, tx));
    }
    Ok(out)
}

fn is_loopback_name(name: &str) -> bool {
    name == "lo" || name.to_ascii_lowercase().starts_with("loopback")
}

/// Re-resolves the publishing interface and its IPv4 on the heavy cycle.
pub struct InterfaceCollector {
    os_family: OsFamily,
    writer: GroupWriter<InterfaceAddress>,
}

impl InterfaceCollector {
    pub fn new(facts: &PlatformFacts, writer: GroupWriter<InterfaceAddress>) -> Self {
        Self {
            os_family: facts.os_family,
            writer,
        }
    }
}

#[async_trait]
impl MetricCollector for InterfaceCollector {
    fn name(&self) -> &'static str {
        INTERFACE
    }

    fn strategy(&self) -> &'static str {
        match self.os_family {
            OsFamily::Linux => "ip",
            OsFamily::Windows => "cim",
            OsFamily::Other => "none",
        }
    }

    async fn collect(&mut self) -> Result<(), CollectorError> {
        let iface = discover_interface(self.os_family).await?;
        self.writer.write(iface).await;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCandidate {
    pub name: String,
    pub ipv4: Option<Ipv4Addr>,
}

impl InterfaceCandidate {
    fn is_internal(&self) -> bool {
        is_loopback_name(&self.name) || self.ipv4.is_some_and(|ip| ip.is_loopback())
    }
}

/// Finds the interface used for outbound traffic. An undetermined result is
/// an error so the caller keeps whatever it had before.
pub async fn discover_interface(os_family: OsFamily) -> Result<InterfaceAddress, CollectorError> {
    let candidates = match os_family {
        OsFamily::Linux => parse_ip_addr(&run_command("ip", &["-o", "-4", "addr", "show"]).await?),
        OsFamily::Windows => parse_net_ip_address(
            &run_command(
                "powershell",
                &[
                    "-NoProfile",
                    "-Command",
                    "Get-NetIPAddress -AddressFamily IPv4 | ForEach-Object { \"$($_.InterfaceAlias)|$($_.IPAddress)\" }",
                ],
            )
            .await?,
        ),
        OsFamily::Other => return Err(CollectorError::Unsupported),
    };

    let selected = select_interface(&candidates, outbound_ipv4());
    if selected.is_known() {
        Ok(selected)
    } else {
        Err(CollectorError::Unavailable("network interface"))
    }
}

/// Source address the OS would pick for the default route. Connecting a UDP
/// socket sends nothing on the wire.
fn outbound_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

pub fn select_interface(
    candidates: &[InterfaceCandidate],
    default_ip: Option<Ipv4Addr>,
) -> InterfaceAddress {
    let as_address = |c: &InterfaceCandidate| InterfaceAddress {
        iface: c.name.clone(),
        ip: c
            .ipv4
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string()),
    };

    let default_route = default_ip.and_then(|ip| {
        candidates
            .iter()
            .find(|c| c.ipv4 == Some(ip) && !c.is_internal())
    });
    let first_external = || {
        candidates
            .iter()
            .find(|c| c.ipv4.is_some() && !c.is_internal())
    };
    let first_with_ipv4 = || candidates.iter().find(|c| c.ipv4.is_some());

    default_route
        .or_else(first_external)
        .or_else(first_with_ipv4)
        .map(as_address)
        .unwrap_or_else(InterfaceAddress::unknown)
}

/// `ip -o -4 addr show` lines:
/// `2: eth0    inet 192.168.1.23/24 brd 192.168.1.255 scope global eth0 ...`
pub fn parse_ip_addr(text: &str) -> Vec<InterfaceCandidate> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            let name = parts.get(1)?.split('@').next()?.to_string();
            let inet = parts.iter().position(|p| *p == "inet")?;
            let ipv4 = parts
                .get(inet + 1)
                .and_then(|cidr| cidr.split('/').next())
                .and_then(|ip| ip.parse::<Ipv4Addr>().ok());
            Some(InterfaceCandidate { name, ipv4 })
        })
        .collect()
}

/// `InterfaceAlias|IPAddress` lines.
pub fn parse_net_ip_address(text: &str) -> Vec<InterfaceCandidate> {
    text.lines()
        .filter_map(|line| {
            let (name, ip) = line.trim().rsplit_once('|')?;
            if name.is_empty() {
                return None;
            }
            Some(InterfaceCandidate {
                name: name.to_string(),
                ipv4: ip.trim().parse().ok(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cand(name: &str, ip: Option<&str>) -> InterfaceCandidate {
        InterfaceCandidate {
            name: name.to_string(),
            ipv4: ip.map(|v| v.parse().unwrap()),
        }
    }

    fn iface(rx: u64, tx: u64) -> CounterSample {
        CounterSample {
            source: CounterSource::Interface,
            rx_total: rx,
            tx_total: tx,
        }
    }

    #[test]
    fn first_sample_has_no_spike() {
        let mut baseline = NetworkBaseline::default();
        let t0 = Instant::now();
        let first = baseline.rate(iface(9_000_000_000, 1_000_000_000), t0);
        assert_eq!(first.rx_bytes_per_sec, 0);
        assert_eq!(first.tx_bytes_per_sec, 0);

        let second = baseline.rate(
            iface(9_000_002_000, 1_000_000_500),
            t0 + Duration::from_secs(2),
        );
        assert_eq!(second.rx_bytes_per_sec, 1000);
        assert_eq!(second.tx_bytes_per_sec, 250);
    }

    #[test]
    fn counter_wrap_reports_zero() {
        let mut baseline = NetworkBaseline::default();
        let t0 = Instant::now();
        baseline.rate(iface(5000, 5000), t0);
        let r = baseline.rate(iface(10, 10), t0 + Duration::from_secs(1));
        assert_eq!((r.rx_bytes_per_sec, r.tx_bytes_per_sec), (0, 0));
    }

    #[test]
    fn interface_vanishing_from_listing_does_not_spike() {
        let mut baseline = NetworkBaseline::default();
        let t0 = Instant::now();
        let with_eth0 = vec![("eth0".to_string(), 1000, 1000)];
        let without_eth0 = vec![("docker0".to_string(), 4_000_000_000, 4_000_000_000)];

        let first = pick_counters(&with_eth0, Some("eth0")).unwrap();
        baseline.rate(first, t0);

        let fallback = pick_counters(&without_eth0, Some("eth0")).unwrap();
        assert_eq!(fallback.source, CounterSource::NonLoopbackSum);
        let r = baseline.rate(fallback, t0 + Duration::from_secs(1));
        assert_eq!((r.rx_bytes_per_sec, r.tx_bytes_per_sec), (0, 0));

        // back on the named interface: primed again, still no spike
        let back = pick_counters(&[("eth0".to_string(), 3000, 1500)], Some("eth0")).unwrap();
        let r = baseline.rate(back, t0 + Duration::from_secs(2));
        assert_eq!((r.rx_bytes_per_sec, r.tx_bytes_per_sec), (0, 0));

        let next = pick_counters(&[("eth0".to_string(), 5000, 2500)], Some("eth0")).unwrap();
        let r = baseline.rate(next, t0 + Duration::from_secs(3));
        assert_eq!((r.rx_bytes_per_sec, r.tx_bytes_per_sec), (2000, 1000));
    }

    #[test]
    fn proc_net_dev_parsing() {
        let content = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  123456     100    0    0    0     0          0         0   123456     100    0    0    0     0       0          0
  eth0: 9876543    5000    0    0    0     0          0         0  1234567    4000    0    0    0     0       0          0";
        let counters = parse_proc_net_dev(content).unwrap();
        assert_eq!(counters.len(), 2);
        assert_eq!(counters[1], ("eth0".to_string(), 9876543, 1234567));
    }

    #[test]
    fn counters_for_named_interface_or_sum() {
        let counters = vec![
            ("lo".to_string(), 100, 100),
            ("eth0".to_string(), 10, 20),
            ("wlan0".to_string(), 1, 2),
        ];
        assert_eq!(pick_counters(&counters, Some("wlan0")), Some(iface(1, 2)));
        let sum = CounterSample {
            source: CounterSource::NonLoopbackSum,
            rx_total: 11,
            tx_total: 22,
        };
        assert_eq!(pick_counters(&counters, Some("gone0")), Some(sum));
        assert_eq!(pick_counters(&counters, None), Some(sum));
        assert_eq!(pick_counters(&[], None), None);
    }

    #[test]
    fn ip_addr_output() {
        let text = "1: lo    inet 127.0.0.1/8 scope host lo\\       valid_lft forever preferred_lft forever
2: eth0    inet 192.168.1.23/24 brd 192.168.1.255 scope global dynamic eth0\\       valid_lft 8000sec
5: veth1@if4    inet 172.17.0.1/16 scope global veth1";
        let c = parse_ip_addr(text);
        assert_eq!(c.len(), 3);
        assert_eq!(c[1], cand("eth0", Some("192.168.1.23")));
        assert_eq!(c[2].name, "veth1");
    }

    #[test]
    fn default_route_interface_wins() {
        let c = vec![
            cand("lo", Some("127.0.0.1")),
            cand("docker0", Some("172.17.0.1")),
            cand("wlan0", Some("192.168.1.50")),
        ];
        let picked = select_interface(&c, Some("192.168.1.50".parse().unwrap()));
        assert_eq!(picked.iface, "wlan0");
        assert_eq!(picked.ip, "192.168.1.50");
    }

    #[test]
    fn falls_back_to_first_external_then_any_ipv4() {
        let c = vec![cand("lo", Some("127.0.0.1")), cand("eth0", Some("10.0.0.2"))];
        assert_eq!(select_interface(&c, None).iface, "eth0");

        let only_lo = vec![cand("eth0", None), cand("lo", Some("127.0.0.1"))];
        assert_eq!(select_interface(&only_lo, None).iface, "lo");

        let nothing = vec![cand("eth0", None)];
        assert_eq!(select_interface(&nothing, None), InterfaceAddress::unknown());
    }

    #[test]
    fn windows_ip_address_lines() {
        let text = "Ethernet|192.168.0.10\r\nLoopback Pseudo-Interface 1|127.0.0.1\r\n";
        let c = parse_net_ip_address(text);
        assert_eq!(c[0], cand("Ethernet", Some("192.168.0.10")));
        assert!(c[1].is_internal());
    }
}

use crate::collectors::network;
use crate::state::{Identity, InterfaceAddress, UNKNOWN};
use std::fs;
use sysinfo::{System, SystemExt};
use tracing::{info, warn};

const BOARD_MODEL_PATH: &str = "/proc/device-tree/model";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    Windows,
    Other,
}

impl OsFamily {
    pub fn from_os(os: &str) -> Self {
        match os {
            "linux" => OsFamily::Linux,
            "windows" => OsFamily::Windows,
            _ => OsFamily::Other,
        }
    }
}

/// Facts detected once at startup and never changed afterwards.
#[derive(Debug, Clone)]
pub struct PlatformFacts {
    pub os_family: OsFamily,
    pub is_arm_class: bool,
    pub platform: String,
    pub hostname: String,
    pub distro_label: String,
    pub default_interface: InterfaceAddress,
}

impl PlatformFacts {
    pub fn identity(&self) -> Identity {
        Identity {
            platform: self.platform.clone(),
            distro: self.distro_label.clone(),
            hostname: self.hostname.clone(),
        }
    }

    #[cfg(test)]
    pub fn for_tests(os_family: OsFamily, is_arm_class: bool) -> Self {
        Self {
            os_family,
            is_arm_class,
            platform: "test".to_string(),
            hostname: "test-host".to_string(),
            distro_label: UNKNOWN.to_string(),
            default_interface: InterfaceAddress::unknown(),
        }
    }
}

/// Runs every detection step. A failing step only leaves its placeholder.
pub async fn detect() -> PlatformFacts {
    let os = std::env::consts::OS;
    let os_family = OsFamily::from_os(os);
    let system = System::new();

    let hostname = system.host_name().unwrap_or_else(|| {
        warn!("не удалось определить имя хоста");
        UNKNOWN.to_string()
    });

    let distro_label = match (system.name(), system.os_version()) {
        (Some(name), Some(version)) => format!("{name} {version}"),
        (Some(name), None) => name,
        _ => {
            warn!("не удалось определить дистрибутив");
            UNKNOWN.to_string()
        }
    };

    let board_model = fs::read_to_string(BOARD_MODEL_PATH).ok();
    let is_arm_class = is_arm_class(std::env::consts::ARCH, board_model.as_deref());

    let default_interface = match network::discover_interface(os_family).await {
        Ok(iface) => iface,
        Err(err) => {
            warn!(error = %err, "не удалось определить сетевой интерфейс");
            InterfaceAddress::unknown()
        }
    };

    let facts = PlatformFacts {
        os_family,
        is_arm_class,
        platform: os.to_string(),
        hostname,
        distro_label,
        default_interface,
    };
    info!(
        platform = %facts.platform,
        distro = %facts.distro_label,
        arm = facts.is_arm_class,
        iface = %facts.default_interface.iface,
        "платформа определена"
    );
    facts
}

pub fn is_arm_class(arch: &str, board_model: Option<&str>) -> bool {
    let arch = arch.to_ascii_lowercase();
    if arch.contains("arm") || arch.contains("aarch64") {
        return true;
    }
    board_model.is_some_and(|m| m.contains("Raspberry"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_family_from_runtime_identifier() {
        assert_eq!(OsFamily::from_os("linux"), OsFamily::Linux);
        assert_eq!(OsFamily::from_os("windows"), OsFamily::Windows);
        assert_eq!(OsFamily::from_os("macos"), OsFamily::Other);
    }

    #[test]
    fn arm_detection() {
        assert!(is_arm_class("aarch64", None));
        assert!(is_arm_class("arm", None));
        assert!(!is_arm_class("x86_64", None));
        assert!(is_arm_class(
            "x86_64",
            Some("Raspberry Pi 4 Model B Rev 1.4\0")
        ));
    }

    #[tokio::test]
    async fn detection_never_fails() {
        let facts = detect().await;
        assert!(!facts.platform.is_empty());
        assert!(!facts.hostname.is_empty());
        assert!(!facts.default_interface.iface.is_empty());
    }
}

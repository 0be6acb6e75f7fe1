use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const LIGHT_INTERVAL_MIN_MS: u64 = 250;
pub const LIGHT_INTERVAL_MAX_MS: u64 = 60_000;
pub const TOP_PROCESSES_MAX: usize = 20;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    #[serde(default = "default_light_interval_ms")]
    pub light_interval_ms: u64,
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Display hint passed through to the status API, no access control.
    #[serde(default)]
    pub restrict_to_admin: bool,
    #[serde(default = "default_top_processes")]
    pub top_processes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            light_interval_ms: default_light_interval_ms(),
            listen: default_listen(),
            restrict_to_admin: false,
            top_processes: default_top_processes(),
        }
    }
}

/// What `load_or_create` did with the file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFile {
    Existing,
    Created,
    Merged,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("не удалось записать файл конфигурации {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = read_text(path_ref)?;
        Self::from_yaml(&text, path_ref)
    }

    /// Loads `path`, writing the defaults there first when it does not exist
    /// yet. An existing file that lacks some keys is rewritten with the
    /// defaults merged in, so operators see every available setting.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<(Self, ConfigFile), ConfigError> {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            let cfg = Config::default();
            cfg.write_to_file(path_ref)?;
            return Ok((cfg, ConfigFile::Created));
        }

        let text = read_text(path_ref)?;
        let cfg = Self::from_yaml(&text, path_ref)?;
        if has_missing_keys(&text) {
            cfg.write_to_file(path_ref)?;
            return Ok((cfg, ConfigFile::Merged));
        }
        Ok((cfg, ConfigFile::Existing))
    }

    fn from_yaml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn write_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_yaml::to_string(self).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker_url()?;

        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }
        if !(LIGHT_INTERVAL_MIN_MS..=LIGHT_INTERVAL_MAX_MS).contains(&self.light_interval_ms) {
            return Err(ConfigError::Validation(format!(
                "light_interval_ms должно быть в диапазоне {LIGHT_INTERVAL_MIN_MS}..={LIGHT_INTERVAL_MAX_MS}"
            )));
        }
        if self.top_processes > TOP_PROCESSES_MAX {
            return Err(ConfigError::Validation(format!(
                "top_processes должно быть <= {TOP_PROCESSES_MAX}"
            )));
        }

        Ok(())
    }

    pub fn broker_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(self.broker_url.trim()).map_err(|err| {
            ConfigError::Validation(format!("broker_url не является URL: {err}"))
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ConfigError::Validation(format!(
                "broker_url должен использовать схему ws или wss, указана {other}"
            ))),
        }
    }

    pub fn light_interval(&self) -> Duration {
        Duration::from_millis(self.light_interval_ms)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn read_text(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })
}

fn has_missing_keys(text: &str) -> bool {
    let Ok(Value::Mapping(present)) = serde_yaml::from_str::<Value>(text) else {
        return true;
    };
    let Ok(Value::Mapping(defaults)) = serde_yaml::to_value(Config::default()) else {
        return false;
    };
    defaults.keys().any(|key| !present.contains_key(key))
}

fn default_broker_url() -> String {
    "ws://127.0.0.1:8080/data_plugins".to_string()
}

const fn default_light_interval_ms() -> u64 {
    1000
}

fn default_listen() -> String {
    "127.0.0.1:9109".to_string()
}

const fn default_top_processes() -> usize {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("конфигурация по умолчанию валидна");
        assert_eq!(cfg.light_interval(), Duration::from_millis(1000));
        assert_eq!(cfg.broker_url().unwrap().path(), "/data_plugins");
    }

    #[test]
    fn example_yaml_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn missing_keys_take_defaults() {
        let cfg: Config = serde_yaml::from_str("restrict_to_admin: true\n").unwrap();
        assert!(cfg.restrict_to_admin);
        assert_eq!(cfg.light_interval_ms, 1000);
        assert_eq!(cfg.top_processes, 3);
    }

    #[test]
    fn rejects_non_websocket_broker() {
        let cfg = Config {
            broker_url: "http://127.0.0.1:8080/".to_string(),
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_out_of_range_interval() {
        let cfg = Config {
            light_interval_ms: 10,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = Config {
            top_processes: 100,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn creates_missing_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostpulse.yaml");

        let (cfg, file) = Config::load_or_create(&path).unwrap();
        assert_eq!(file, ConfigFile::Created);
        assert_eq!(cfg.listen, "127.0.0.1:9109");
        assert!(path.exists());

        let (again, file) = Config::load_or_create(&path).unwrap();
        assert_eq!(file, ConfigFile::Existing);
        assert_eq!(again.broker_url, cfg.broker_url);
    }

    #[test]
    fn existing_file_gets_missing_keys_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostpulse.yaml");
        fs::write(&path, "restrict_to_admin: true\nlight_interval_ms: 2000\n").unwrap();

        let (cfg, file) = Config::load_or_create(&path).unwrap();
        assert_eq!(file, ConfigFile::Merged);
        assert!(cfg.restrict_to_admin);
        assert_eq!(cfg.light_interval_ms, 2000);

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("top_processes"));
        assert!(text.contains("broker_url"));
        assert!(text.contains("light_interval_ms: 2000"));

        let (_, file) = Config::load_or_create(&path).unwrap();
        assert_eq!(file, ConfigFile::Existing);
    }

    #[test]
    fn broken_yaml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "light_interval_ms: [oops").unwrap();
        assert!(matches!(
            Config::load_from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}

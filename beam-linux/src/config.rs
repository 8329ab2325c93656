//! Load config from file and environment.

use std::path::{Path, PathBuf};

use beam_core::identity::generate_device_id;
use beam_core::{DeviceIdentity, DISCOVERY_PORT, TRANSPORT_PORT};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/beam/config.toml or /etc/beam/config.toml.
/// Env overrides: BEAM_DISCOVERY_PORT, BEAM_TRANSPORT_PORT, BEAM_DOWNLOAD_DIR,
/// BEAM_DEVICE_NAME, BEAM_DEVICE_ID.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Discovery UDP port (default 8888).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Transport TCP port (default 8081).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Where received files land (default ~/Downloads/Beam).
    #[serde(default)]
    pub download_dir: Option<PathBuf>,
    /// Display name sent in `identify` (default: host name).
    #[serde(default)]
    pub device_name: Option<String>,
    /// Fixed device ID; otherwise one is generated once and persisted.
    #[serde(default)]
    pub device_id: Option<String>,
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}
fn default_transport_port() -> u16 {
    TRANSPORT_PORT
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            download_dir: None,
            device_name: None,
            device_id: None,
        }
    }
}

/// Everything the daemon needs once defaults are filled in.
#[derive(Debug, Clone)]
pub struct Settings {
    pub discovery_port: u16,
    pub transport_port: u16,
    pub download_dir: PathBuf,
    pub identity: DeviceIdentity,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("device id file {path}: {source}")]
    DeviceId {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Load config: default, then config file (explicit path or the first that
/// exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |var| std::env::var(var).ok())?;
    Ok(c)
}

fn config_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config/beam"))
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(dir) = config_dir() {
        out.push(dir.join("config.toml"));
    }
    out.push(PathBuf::from("/etc/beam/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

/// Overlay environment variables; `lookup` is `std::env::var` outside tests.
pub fn apply_env<F>(c: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
{
    let port = |var: &'static str| -> Result<Option<u16>, ConfigError> {
        match lookup(var) {
            Some(value) => value
                .parse::<u16>()
                .map(Some)
                .map_err(|_| ConfigError::Env { var, value }),
            None => Ok(None),
        }
    };
    if let Some(p) = port("BEAM_DISCOVERY_PORT")? {
        c.discovery_port = p;
    }
    if let Some(p) = port("BEAM_TRANSPORT_PORT")? {
        c.transport_port = p;
    }
    if let Some(dir) = lookup("BEAM_DOWNLOAD_DIR") {
        c.download_dir = Some(PathBuf::from(dir));
    }
    if let Some(name) = lookup("BEAM_DEVICE_NAME") {
        c.device_name = Some(name);
    }
    if let Some(id) = lookup("BEAM_DEVICE_ID") {
        c.device_id = Some(id);
    }
    Ok(())
}

impl Config {
    /// Fill in defaults. The device ID falls back to the one persisted under
    /// ~/.config/beam, created on first use.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let download_dir = self.download_dir.unwrap_or_else(|| match &home {
            Some(h) => h.join("Downloads").join("Beam"),
            None => PathBuf::from("Beam"),
        });
        let device_name = self.device_name.unwrap_or_else(default_device_name);
        let device_id = match self.device_id {
            Some(id) => id,
            None => match config_dir() {
                Some(dir) => load_or_create_device_id(&dir.join("device-id"), &device_name)?,
                None => generate_device_id(&device_name),
            },
        };
        Ok(Settings {
            discovery_port: self.discovery_port,
            transport_port: self.transport_port,
            download_dir,
            identity: DeviceIdentity::new(device_id, device_name),
        })
    }
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "beam".to_string())
}

/// Read the stored device ID, or generate and store one.
pub fn load_or_create_device_id(path: &Path, device_name: &str) -> Result<String, ConfigError> {
    let err = |source| ConfigError::DeviceId {
        path: path.to_path_buf(),
        source,
    };
    match std::fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => return Ok(s.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(err(e)),
    }
    let id = generate_device_id(device_name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(err)?;
    }
    std::fs::write(path, format!("{}\n", id)).map_err(err)?;
    Ok(id)
}

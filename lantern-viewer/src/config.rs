//! Load viewer config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Viewer configuration. File: ~/.config/lantern/config.toml or
/// /etc/lantern/config.toml. Env overrides: LANTERN_LISTEN_PORT,
/// LANTERN_DISCOVERY_PORT, LANTERN_ADVERTISE, LANTERN_SERVICE_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Stream listen port (default 50000).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Discovery UDP port (default 50505).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Announce this viewer over multicast (default true).
    #[serde(default = "default_advertise")]
    pub advertise: bool,
    /// Service identifier clients browse for.
    #[serde(default = "default_service_id")]
    pub service_id: String,
    /// Human-readable service name shown to browsers.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_listen_port() -> u16 {
    50000
}
fn default_discovery_port() -> u16 {
    50505
}
fn default_advertise() -> bool {
    true
}
fn default_service_id() -> String {
    "lantern".to_string()
}
fn default_service_name() -> String {
    "Lantern viewer".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            discovery_port: default_discovery_port(),
            advertise: default_advertise(),
            service_id: default_service_id(),
            service_name: default_service_name(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_else(Config::default);
    if let Ok(s) = std::env::var("LANTERN_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("LANTERN_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Ok(s) = std::env::var("LANTERN_ADVERTISE") {
        if let Ok(b) = s.parse::<bool>() {
            c.advertise = b;
        }
    }
    if let Ok(s) = std::env::var("LANTERN_SERVICE_NAME") {
        if !s.is_empty() {
            c.service_name = s;
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lantern/config.toml"));
    }
    out.push(PathBuf::from("/etc/lantern/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}

//! Daemon configuration.
//!
//! A single JSON file; rate limits accept `"512K"`-style strings parsed by
//! the rate meter, `"0"`/`"off"` meaning unlimited.

use std::path::{Path, PathBuf};

use ratemeter::parse_rate;
use serde::Deserialize;

fn default_nick() -> String {
    "http://www.hydranode.com".into()
}

const fn default_tcp_port() -> u16 {
    4662
}

const fn default_udp_port() -> u16 {
    4672
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_incoming_dir() -> PathBuf {
    PathBuf::from("incoming")
}

fn default_limit() -> String {
    "0".into()
}

const fn default_conn_limit() -> usize {
    500
}

const fn default_half_open() -> usize {
    20
}

const fn default_upload_slots() -> usize {
    4
}

const fn default_workers() -> usize {
    3
}

const fn default_find_servers() -> bool {
    true
}

/// The `hydranode.json` schema.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Nickname shown to peers.
    #[serde(default = "default_nick")]
    pub nick: String,
    /// TCP listen port.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// UDP port.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    /// Part files and engine state live here.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Completed downloads move here.
    #[serde(default = "default_incoming_dir")]
    pub incoming_dir: PathBuf,
    /// Upload limit (`"512K"`, `"2M"`, bytes/sec, or `"off"`).
    #[serde(default = "default_limit")]
    pub upload_limit: String,
    /// Download limit.
    #[serde(default = "default_limit")]
    pub download_limit: String,
    /// Maximum open connections.
    #[serde(default = "default_conn_limit")]
    pub connection_limit: usize,
    /// Maximum half-open connections.
    #[serde(default = "default_half_open")]
    pub half_open_limit: usize,
    /// Simultaneous upload slots.
    #[serde(default = "default_upload_slots")]
    pub upload_slots: usize,
    /// Worker threads for hashing/allocation/connects.
    #[serde(default = "default_workers")]
    pub worker_threads: usize,
    /// Learn new servers from the network.
    #[serde(default = "default_find_servers")]
    pub find_servers: bool,
    /// Directories whose files are hashed and shared at startup.
    #[serde(default)]
    pub shared_dirs: Vec<PathBuf>,
}

impl Config {
    /// Loads the configuration; a missing file yields the defaults.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                serde_json::from_str("{}")
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }
            Err(e) => Err(e),
        }
    }

    /// Parsed upload limit in bytes/sec.
    pub fn up_limit(&self) -> std::io::Result<Option<u64>> {
        parse_rate(&self.upload_limit)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Parsed download limit in bytes/sec.
    pub fn down_limit(&self) -> std::io::Result<Option<u64>> {
        parse_rate(&self.download_limit)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.tcp_port, 4662);
        assert_eq!(config.udp_port, 4672);
        assert_eq!(config.upload_slots, 4);
        assert_eq!(config.up_limit().unwrap(), None);
        assert!(config.find_servers);
    }

    #[test]
    fn limits_parse_suffixes() {
        let config: Config = serde_json::from_str(
            r#"{"upload_limit": "64K", "download_limit": "2M"}"#,
        )
        .unwrap();
        assert_eq!(config.up_limit().unwrap(), Some(64 * 1024));
        assert_eq!(config.down_limit().unwrap(), Some(2 * 1024 * 1024));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"typo_field": 1}"#).is_err());
    }

    #[test]
    fn bad_limit_surfaces_as_error() {
        let config: Config =
            serde_json::from_str(r#"{"upload_limit": "fast"}"#).unwrap();
        assert!(config.up_limit().is_err());
    }
}

//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;
use treemesh_core::MeshConfig;

/// Daemon configuration. File: ~/.config/treemesh/config.toml or /etc/treemesh/config.toml.
/// Env overrides: TREEMESH_NODE_ID, TREEMESH_LISTEN_PORT, TREEMESH_ROOT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Fixed node id. Derived from the first hardware address when unset.
    #[serde(default)]
    pub node_id: Option<u32>,
    /// TCP port peers connect to (default 5555).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// `host:port` of peers to keep a link to.
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub root: bool,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_hardware")]
    pub hardware: String,
    /// Directory of `firmware_<hardware>_<role>.bin` images to distribute.
    #[serde(default)]
    pub firmware_dir: Option<PathBuf>,
    /// Record of the committed firmware.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Where received images are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default)]
    pub mesh: MeshConfig,
}

fn default_listen_port() -> u16 {
    5555
}
fn default_role() -> String {
    "node".to_string()
}
fn default_hardware() -> String {
    "linux".to_string()
}
fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/treemesh/firmware.json")
}
fn default_download_dir() -> PathBuf {
    PathBuf::from("/var/lib/treemesh/firmware")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_port: default_listen_port(),
            peers: Vec::new(),
            root: false,
            role: default_role(),
            hardware: default_hardware(),
            firmware_dir: None,
            state_file: default_state_file(),
            download_dir: default_download_dir(),
            mesh: MeshConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("TREEMESH_NODE_ID") {
        match s.parse::<u32>() {
            Ok(0) => warn!("TREEMESH_NODE_ID=0 is the broadcast id, ignored"),
            Ok(id) => c.node_id = Some(id),
            Err(_) => warn!(value = %s, "TREEMESH_NODE_ID is not a number, ignored"),
        }
    }
    if let Ok(s) = std::env::var("TREEMESH_LISTEN_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.listen_port = p;
        }
    }
    if let Ok(s) = std::env::var("TREEMESH_ROOT") {
        c.root = matches!(s.as_str(), "1" | "true" | "yes");
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/treemesh/config.toml"));
    }
    out.push(PathBuf::from("/etc/treemesh/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match parse(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "bad config file, using defaults"),
                },
                Err(e) => warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

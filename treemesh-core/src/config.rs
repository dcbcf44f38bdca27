//! Protocol tuning knobs. Every field has a default so a partial `[mesh]` table works.

use serde::{Deserialize, Serialize};

use crate::tree::RootTieBreak;
use crate::wire::DEFAULT_MAX_FRAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeshConfig {
    /// Period of the node sync sent to every neighbour (default 3 s).
    #[serde(default = "default_node_sync_interval_ms")]
    pub node_sync_interval_ms: u64,
    /// A link silent for this long is closed (default 10 s).
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    #[serde(default = "default_time_sync_timeout_ms")]
    pub time_sync_timeout_ms: u64,
    /// Period at which the time reference on each link re-runs the offset handshake.
    #[serde(default = "default_time_sync_interval_ms")]
    pub time_sync_interval_ms: u64,
    #[serde(default = "default_ota_retry_interval_ms")]
    pub ota_retry_interval_ms: u64,
    /// Re-sends of one data request before the update is abandoned.
    #[serde(default = "default_ota_max_retries")]
    pub ota_max_retries: u32,
    /// Grace period between commit and restart.
    #[serde(default = "default_ota_restart_delay_ms")]
    pub ota_restart_delay_ms: u64,
    #[serde(default = "default_ota_part_size")]
    pub ota_part_size: usize,
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    /// Periodic announces ask the root to pull and flood chunks.
    #[serde(default)]
    pub announce_broadcasted: bool,
    #[serde(default)]
    pub root_tie_break: RootTieBreak,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

fn default_node_sync_interval_ms() -> u64 {
    3_000
}
fn default_node_timeout_ms() -> u64 {
    10_000
}
fn default_time_sync_timeout_ms() -> u64 {
    5_000
}
fn default_time_sync_interval_ms() -> u64 {
    60_000
}
fn default_ota_retry_interval_ms() -> u64 {
    30_000
}
fn default_ota_max_retries() -> u32 {
    10
}
fn default_ota_restart_delay_ms() -> u64 {
    2_000
}
fn default_ota_part_size() -> usize {
    1024
}
fn default_announce_interval_ms() -> u64 {
    60_000
}
fn default_max_frame_len() -> usize {
    DEFAULT_MAX_FRAME_LEN
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            node_sync_interval_ms: default_node_sync_interval_ms(),
            node_timeout_ms: default_node_timeout_ms(),
            time_sync_timeout_ms: default_time_sync_timeout_ms(),
            time_sync_interval_ms: default_time_sync_interval_ms(),
            ota_retry_interval_ms: default_ota_retry_interval_ms(),
            ota_max_retries: default_ota_max_retries(),
            ota_restart_delay_ms: default_ota_restart_delay_ms(),
            ota_part_size: default_ota_part_size(),
            announce_interval_ms: default_announce_interval_ms(),
            announce_broadcasted: false,
            root_tie_break: RootTieBreak::default(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// Milliseconds to the microsecond clock the core runs on.
pub(crate) fn us(ms: u64) -> u64 {
    ms.saturating_mul(1_000)
}

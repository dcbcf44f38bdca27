// TreeMesh Linux: TCP links, file-backed firmware store and OTA distribution.

mod config;
mod storage;
mod transport;

use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use treemesh_core::{MeshNode, NodeId, OtaDistributor, OtaReceiver};

use crate::config::Config;
use crate::storage::{FileSink, FileStore};
use crate::transport::Input;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("treemesh-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    let node_id = cfg.node_id.map(NodeId).unwrap_or_else(pick_node_id);
    info!(%node_id, root = cfg.root, role = %cfg.role, hardware = %cfg.hardware, "starting");

    let mut node = MeshNode::new(node_id, cfg.mesh.clone());
    node.set_root(cfg.root);
    node.enable_ota_receiver(OtaReceiver::new(
        &cfg.hardware,
        &cfg.role,
        Box::new(FileSink::new(cfg.download_dir.clone(), &cfg.hardware, &cfg.role)),
        Box::new(FileStore::new(cfg.state_file.clone())),
        cfg.mesh.ota_retry_interval_ms.saturating_mul(1_000),
        cfg.mesh.ota_max_retries,
    ));
    let distributor = match &cfg.firmware_dir {
        Some(dir) => {
            let lib = storage::load_library(dir, cfg.mesh.ota_part_size)
                .with_context(|| format!("reading firmware dir {}", dir.display()))?;
            info!(images = lib.len(), "distributing firmware");
            Some(OtaDistributor::new(Box::new(lib)))
        }
        None => None,
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg, node, distributor))
}

async fn run(cfg: Config, node: MeshNode, distributor: Option<OtaDistributor>) -> anyhow::Result<()> {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let restart = Arc::new(Notify::new());

    tokio::spawn(transport::run_worker(node, distributor, input_rx, restart.clone()));
    let listener = tokio::spawn(transport::run_transport(
        cfg.listen_port,
        cfg.peers.clone(),
        input_tx.clone(),
    ));
    tokio::spawn(read_commands(input_tx));

    tokio::select! {
        res = shutdown_signal() => res?,
        _ = restart.notified() => info!("new firmware committed, exiting for restart"),
        res = listener => {
            res?.with_context(|| format!("listening on port {}", cfg.listen_port))?;
        }
    }
    Ok(())
}

/// Operator commands, one per line on stdin.
async fn read_commands(inputs: mpsc::UnboundedSender<Input>) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match transport::parse_command(&line) {
            Some(cmd) => {
                if inputs.send(Input::Command(cmd)).is_err() {
                    break;
                }
            }
            None => warn!(%line, "unknown command (send <id> <text> | bcast <text> | delay <id> | nodes)"),
        }
    }
}

/// Node id from the first hardware address, else random.
fn pick_node_id() -> NodeId {
    if let Some(mac) = first_mac() {
        return NodeId::from_mac(&mac);
    }
    warn!("no hardware address found, using a random node id");
    loop {
        let id: u32 = rand::random();
        if id != 0 {
            return NodeId(id);
        }
    }
}

fn first_mac() -> Option<[u8; 6]> {
    let mut names: Vec<_> = std::fs::read_dir("/sys/class/net")
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name())
        .filter(|n| n.to_str() != Some("lo"))
        .collect();
    names.sort();
    names.into_iter().find_map(|name| {
        let path = std::path::Path::new("/sys/class/net").join(name).join("address");
        let text = std::fs::read_to_string(path).ok()?;
        parse_mac(&text).filter(|m| m.iter().any(|b| *b != 0))
    })
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.trim().split(':');
    for b in out.iter_mut() {
        *b = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parsing() {
        assert_eq!(
            parse_mac("de:ad:be:ef:00:01\n"),
            Some([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01])
        );
        assert_eq!(parse_mac("de:ad:be:ef:00"), None);
        assert_eq!(parse_mac("de:ad:be:ef:00:01:02"), None);
        assert_eq!(parse_mac("zz:ad:be:ef:00:01"), None);
    }
}

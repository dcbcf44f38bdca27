//! TCP links and the worker that owns the mesh node.
//!
//! Connection tasks only move bytes. Everything that touches protocol state goes through
//! one channel into [`run_worker`], which also fires the node's timers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use treemesh_core::{Delivery, LinkId, MeshNode, NodeId, OtaDistributor, OutboundAction, SendError};

const READ_BUF: usize = 4096;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Upper bound on worker sleep when no timer is armed.
const IDLE: Duration = Duration::from_secs(1);

/// Operator request read from stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Single(NodeId, String),
    Broadcast(String),
    Delay(NodeId),
    Nodes,
}

/// `send <id> <text>`, `bcast <text>`, `delay <id>`, `nodes`.
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim_start();
    match verb {
        "send" => {
            let (id, text) = rest.split_once(' ')?;
            Some(Command::Single(NodeId(id.parse().ok()?), text.to_string()))
        }
        "bcast" if !rest.is_empty() => Some(Command::Broadcast(rest.to_string())),
        "delay" => Some(Command::Delay(NodeId(rest.parse().ok()?))),
        "nodes" => Some(Command::Nodes),
        _ => None,
    }
}

/// Everything the worker reacts to besides its own timers.
pub enum Input {
    Opened {
        link: LinkId,
        peer: SocketAddr,
        tx: mpsc::UnboundedSender<Vec<u8>>,
        close: Arc<Notify>,
    },
    Bytes(LinkId, Vec<u8>),
    Closed(LinkId),
    Command(Command),
}

struct LinkHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    close: Arc<Notify>,
}

/// Monotonic microsecond clock the core runs on.
struct Clock {
    start: Instant,
}

impl Clock {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn instant_at(&self, us: u64) -> Instant {
        self.start + Duration::from_micros(us)
    }
}

/// Own `node` until the input channel closes. Notifies `restart` when new firmware is committed.
pub async fn run_worker(
    mut node: MeshNode,
    distributor: Option<OtaDistributor>,
    mut inputs: mpsc::UnboundedReceiver<Input>,
    restart: Arc<Notify>,
) {
    let clock = Clock::new();
    let mut links: HashMap<LinkId, LinkHandle> = HashMap::new();
    if let Some(d) = distributor {
        let actions = node.enable_ota_distributor(d, clock.now_us());
        dispatch(actions, &mut links, &restart);
    }
    loop {
        let deadline = node
            .next_deadline()
            .map(|us| clock.instant_at(us))
            .unwrap_or_else(|| Instant::now() + IDLE);
        let actions = tokio::select! {
            input = inputs.recv() => match input {
                Some(input) => handle_input(&mut node, input, &mut links, clock.now_us()),
                None => break,
            },
            _ = tokio::time::sleep_until(deadline) => node.tick(clock.now_us()),
        };
        dispatch(actions, &mut links, &restart);
    }
}

fn handle_input(
    node: &mut MeshNode,
    input: Input,
    links: &mut HashMap<LinkId, LinkHandle>,
    now_us: u64,
) -> Vec<OutboundAction> {
    match input {
        Input::Opened {
            link,
            peer,
            tx,
            close,
        } => {
            info!(%link, %peer, "link up");
            links.insert(link, LinkHandle { tx, close });
            node.on_link_opened(link, now_us)
        }
        Input::Bytes(link, bytes) => node.on_bytes_received(link, &bytes, now_us),
        Input::Closed(link) => {
            if links.remove(&link).is_some() {
                info!(%link, "link down");
            }
            node.on_link_closed(link, now_us)
        }
        Input::Command(cmd) => run_command(node, cmd, now_us),
    }
}

fn run_command(node: &mut MeshNode, cmd: Command, now_us: u64) -> Vec<OutboundAction> {
    let sent: Result<Vec<OutboundAction>, SendError> = match cmd {
        Command::Single(dest, text) => node.send_single(dest, text),
        Command::Broadcast(text) => node.send_broadcast(text),
        Command::Delay(dest) => node.start_delay_measurement(dest, now_us),
        Command::Nodes => {
            let nodes: Vec<String> = node.node_list(true).iter().map(|n| n.to_string()).collect();
            info!(root = node.is_root(), nodes = %nodes.join(","), tree = %node.tree_json(), "mesh");
            Ok(Vec::new())
        }
    };
    sent.unwrap_or_else(|e| {
        warn!(error = %e, "command failed");
        Vec::new()
    })
}

fn dispatch(actions: Vec<OutboundAction>, links: &mut HashMap<LinkId, LinkHandle>, restart: &Notify) {
    for action in actions {
        match action {
            OutboundAction::Send(link, bytes) => {
                if let Some(h) = links.get(&link) {
                    let _ = h.tx.send(bytes);
                }
            }
            OutboundAction::Deliver(Delivery::Single { from, msg }) => {
                info!(%from, %msg, "single message");
            }
            OutboundAction::Deliver(Delivery::Broadcast { from, msg }) => {
                info!(%from, %msg, "broadcast message");
            }
            OutboundAction::Deliver(Delivery::Custom(env)) => {
                info!(tag = env.type_tag(), from = %env.from(), "custom message");
            }
            OutboundAction::Event(event) => info!(?event, "mesh event"),
            OutboundAction::CloseLink(link) => {
                if let Some(h) = links.remove(&link) {
                    h.close.notify_one();
                }
            }
            OutboundAction::Restart => restart.notify_one(),
        }
    }
}

/// Accept peers on `port` and keep a link to each of `peers`.
pub async fn run_transport(
    port: u16,
    peers: Vec<String>,
    inputs: mpsc::UnboundedSender<Input>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening for peers");
    let next_link = Arc::new(AtomicU64::new(1));

    for addr in peers {
        let inputs = inputs.clone();
        let next_link = next_link.clone();
        tokio::spawn(async move {
            loop {
                match TcpStream::connect(addr.as_str()).await {
                    Ok(stream) => run_connection(stream, &next_link, &inputs).await,
                    Err(e) => debug!(peer = %addr, error = %e, "connect failed"),
                }
                if inputs.is_closed() {
                    break;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
    }

    loop {
        let (stream, _) = listener.accept().await?;
        let inputs = inputs.clone();
        let next_link = next_link.clone();
        tokio::spawn(async move {
            run_connection(stream, &next_link, &inputs).await;
        });
    }
}

async fn run_connection(stream: TcpStream, next_link: &AtomicU64, inputs: &mpsc::UnboundedSender<Input>) {
    let Ok(peer) = stream.peer_addr() else {
        return;
    };
    let _ = stream.set_nodelay(true);
    let link = LinkId(next_link.fetch_add(1, Ordering::Relaxed));
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let close = Arc::new(Notify::new());
    let opened = Input::Opened {
        link,
        peer,
        tx,
        close: close.clone(),
    };
    if inputs.send(opened).is_err() {
        return;
    }
    let (mut reader, mut writer) = stream.into_split();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });
    let mut buf = vec![0u8; READ_BUF];
    loop {
        tokio::select! {
            _ = close.notified() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    if inputs.send(Input::Bytes(link, buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(%link, error = %e, "read failed");
                    break;
                }
            },
        }
    }
    writer_task.abort();
    let _ = inputs.send(Input::Closed(link));
}

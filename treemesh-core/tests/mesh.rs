//! Several nodes wired through an in-process link simulator.

use std::collections::{HashMap, VecDeque};

use treemesh_core::firmware::{MemorySink, MemoryStore};
use treemesh_core::{
    Delivery, FirmwareImage, ImageLibrary, LinkId, MeshConfig, MeshEvent, MeshNode, NodeId,
    OtaDistributor, OtaReceiver, OutboundAction,
};

const STEP_US: u64 = 100_000;
const BASE_US: u64 = 100_000_000;

/// Links deliver instantly and in order. Each node may run its clock `skew` µs off.
struct Sim {
    nodes: Vec<MeshNode>,
    skew: Vec<i64>,
    wires: HashMap<LinkId, (usize, usize)>,
    next_link: u64,
    now: u64,
    delivered: Vec<Vec<Delivery>>,
    events: Vec<Vec<MeshEvent>>,
    restarts: Vec<usize>,
}

impl Sim {
    fn new(ids: &[(u32, i64)]) -> Self {
        let nodes = ids
            .iter()
            .map(|(id, _)| MeshNode::new(NodeId(*id), MeshConfig::default()))
            .collect();
        Self {
            nodes,
            skew: ids.iter().map(|(_, s)| *s).collect(),
            wires: HashMap::new(),
            next_link: 1,
            now: BASE_US,
            delivered: vec![Vec::new(); ids.len()],
            events: vec![Vec::new(); ids.len()],
            restarts: Vec::new(),
        }
    }

    fn local_now(&self, i: usize) -> u64 {
        (self.now as i64 + self.skew[i]) as u64
    }

    fn act(&mut self, i: usize, f: impl FnOnce(&mut MeshNode, u64) -> Vec<OutboundAction>) {
        let now = self.local_now(i);
        let actions = f(&mut self.nodes[i], now);
        self.pump(i, actions);
    }

    fn connect(&mut self, a: usize, b: usize) -> LinkId {
        let link = LinkId(self.next_link);
        self.next_link += 1;
        self.wires.insert(link, (a, b));
        let (now_a, now_b) = (self.local_now(a), self.local_now(b));
        let out_a = self.nodes[a].on_link_opened(link, now_a);
        let out_b = self.nodes[b].on_link_opened(link, now_b);
        self.pump(a, out_a);
        self.pump(b, out_b);
        link
    }

    fn cut(&mut self, link: LinkId) {
        if let Some((a, b)) = self.wires.remove(&link) {
            self.act(a, |n, now| n.on_link_closed(link, now));
            self.act(b, |n, now| n.on_link_closed(link, now));
        }
    }

    fn pump(&mut self, origin: usize, actions: Vec<OutboundAction>) {
        let mut queue: VecDeque<(usize, OutboundAction)> =
            actions.into_iter().map(|a| (origin, a)).collect();
        let mut steps = 0;
        while let Some((i, action)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 100_000, "message storm");
            match action {
                OutboundAction::Send(link, bytes) => {
                    let Some(&(a, b)) = self.wires.get(&link) else {
                        continue;
                    };
                    let peer = if a == i { b } else { a };
                    let now = self.local_now(peer);
                    let out = self.nodes[peer].on_bytes_received(link, &bytes, now);
                    queue.extend(out.into_iter().map(|a| (peer, a)));
                }
                OutboundAction::CloseLink(link) => {
                    if let Some((a, b)) = self.wires.remove(&link) {
                        let peer = if a == i { b } else { a };
                        let now = self.local_now(peer);
                        let out = self.nodes[peer].on_link_closed(link, now);
                        queue.extend(out.into_iter().map(|a| (peer, a)));
                    }
                }
                OutboundAction::Deliver(d) => self.delivered[i].push(d),
                OutboundAction::Event(e) => self.events[i].push(e),
                OutboundAction::Restart => self.restarts.push(i),
            }
        }
    }

    fn advance(&mut self, us: u64) {
        let end = self.now + us;
        while self.now < end {
            self.now += STEP_US;
            for i in 0..self.nodes.len() {
                self.act(i, |n, now| n.tick(now));
            }
        }
    }

    fn ids(&self, i: usize) -> Vec<u32> {
        let mut v: Vec<u32> = self.nodes[i].node_list(true).iter().map(|n| n.as_u32()).collect();
        v.sort();
        v
    }

    fn clock_gap(&self, a: usize, b: usize) -> i32 {
        let ta = self.nodes[a].node_time(self.local_now(a));
        let tb = self.nodes[b].node_time(self.local_now(b));
        ta.wrapping_sub(tb) as i32
    }
}

/// 1 - 2 - 3 and 2 - 4.
fn star() -> Sim {
    let mut sim = Sim::new(&[(1, 0), (2, 0), (3, 0), (4, 0)]);
    sim.connect(0, 1);
    sim.connect(1, 2);
    sim.connect(1, 3);
    sim
}

#[test]
fn topology_converges_everywhere() {
    let mut sim = star();
    sim.advance(1_000_000);
    for i in 0..4 {
        assert_eq!(sim.ids(i), vec![1, 2, 3, 4], "node index {}", i);
    }
    assert!(sim.nodes[2].is_connected(NodeId(4)));
    assert!(sim.events[0].contains(&MeshEvent::NewConnection(NodeId(2))));
    assert!(sim.events[0].contains(&MeshEvent::ChangedConnections));
    assert!(sim.nodes[0].tree_json().contains("\"nodeId\":1"));
}

#[test]
fn lost_link_prunes_the_subtree() {
    let mut sim = star();
    sim.advance(500_000);
    sim.cut(LinkId(2));
    assert_eq!(sim.ids(0), vec![1, 2, 4]);
    assert_eq!(sim.ids(2), vec![3]);
    assert!(sim.events[1].contains(&MeshEvent::DroppedConnection(NodeId(3))));
    assert!(sim.events[0].contains(&MeshEvent::ChangedConnections));
}

#[test]
fn redundant_link_is_closed_as_a_loop() {
    let mut sim = star();
    sim.advance(500_000);
    let extra = sim.connect(2, 3);
    sim.advance(500_000);
    assert!(!sim.wires.contains_key(&extra));
    for i in 0..4 {
        assert_eq!(sim.ids(i), vec![1, 2, 3, 4]);
    }
}

#[test]
fn single_and_broadcast_cross_hops() {
    let mut sim = star();
    sim.advance(500_000);

    sim.act(0, |n, _| n.send_single(NodeId(3), "to three").unwrap());
    assert_eq!(
        sim.delivered[2],
        vec![Delivery::Single {
            from: NodeId(1),
            msg: "to three".into()
        }]
    );
    assert!(sim.delivered[1].is_empty(), "relay does not deliver");

    sim.act(2, |n, _| n.send_broadcast("hello all").unwrap());
    let hello = Delivery::Broadcast {
        from: NodeId(3),
        msg: "hello all".into(),
    };
    for i in [0, 1, 3] {
        assert_eq!(sim.delivered[i].last(), Some(&hello), "node index {}", i);
    }
    assert_eq!(sim.delivered[2].len(), 1, "sender gets no copy of its broadcast");
}

#[test]
fn root_election_prefers_lowest_declared_id() {
    let mut sim = Sim::new(&[(5, 0), (6, 0), (7, 0)]);
    sim.nodes[1].set_root(true);
    sim.nodes[2].set_root(true);
    sim.connect(0, 1);
    sim.connect(0, 2);
    sim.advance(1_000_000);
    assert!(sim.nodes[1].is_root());
    assert!(!sim.nodes[2].is_root());
    assert!(!sim.nodes[0].is_root());
}

#[test]
fn clocks_follow_the_root() {
    let mut sim = Sim::new(&[(1, 0), (2, 5_000_000), (3, -3_000_000)]);
    sim.nodes[0].set_root(true);
    sim.connect(0, 1);
    sim.advance(200_000);
    assert_eq!(sim.clock_gap(0, 1), 0);

    sim.connect(1, 2);
    sim.advance(200_000);
    assert_eq!(sim.clock_gap(0, 2), 0);
    assert!(sim.events[2]
        .iter()
        .any(|e| matches!(e, MeshEvent::TimeAdjusted { offset } if *offset != 0)));
    assert!(sim.events[0]
        .iter()
        .all(|e| !matches!(e, MeshEvent::TimeAdjusted { .. })));
}

#[test]
fn drifted_clock_is_corrected_at_next_resync() {
    let mut sim = Sim::new(&[(1, 0), (2, 0)]);
    sim.nodes[0].set_root(true);
    sim.connect(0, 1);
    sim.advance(200_000);
    assert_eq!(sim.clock_gap(0, 1), 0);

    sim.skew[1] += 700_000;
    assert_eq!(sim.clock_gap(0, 1), -700_000);
    sim.advance(61_000_000);
    assert_eq!(sim.clock_gap(0, 1), 0);
}

#[test]
fn delay_is_measured_across_a_relay() {
    let mut sim = star();
    sim.advance(500_000);
    sim.act(0, |n, now| n.start_delay_measurement(NodeId(3), now).unwrap());
    assert!(sim.events[2].contains(&MeshEvent::NodeDelay {
        node: NodeId(1),
        delay_us: 0
    }));
}

fn image() -> Vec<u8> {
    (0..5000u32).map(|i| (i * 7 % 251) as u8).collect()
}

fn receiver(hw: &str, role: &str) -> (OtaReceiver, MemorySink, MemoryStore) {
    let sink = MemorySink::new();
    let store = MemoryStore::new(None);
    let rx = OtaReceiver::new(
        hw,
        role,
        Box::new(sink.clone()),
        Box::new(store.clone()),
        30_000_000,
        10,
    );
    (rx, sink, store)
}

#[test]
fn firmware_reaches_a_node_two_hops_away() {
    let mut sim = star();
    let (rx3, sink3, store3) = receiver("ESP32", "node");
    let (rx2, sink2, _) = receiver("ESP32", "bridge");
    sim.nodes[2].enable_ota_receiver(rx3);
    sim.nodes[1].enable_ota_receiver(rx2);
    sim.advance(500_000);

    let mut lib = ImageLibrary::new();
    let fw = FirmwareImage::new("ESP32", "node", image(), 1024);
    let md5 = fw.id().md5.clone();
    lib.insert(fw);
    sim.act(0, |n, now| n.enable_ota_distributor(OtaDistributor::new(Box::new(lib)), now));

    assert_eq!(sink3.flash().lock().unwrap().committed.as_deref(), Some(&image()[..]));
    assert_eq!(store3.current().map(|r| r.md5), Some(md5.clone()));
    assert!(sim.events[2].contains(&MeshEvent::OtaCommitted { md5 }));
    let progress = sim.events[2]
        .iter()
        .filter(|e| matches!(e, MeshEvent::OtaProgress { no_part: 5, .. }))
        .count();
    assert_eq!(progress, 5);
    assert_eq!(sink2.flash().lock().unwrap().begun, 0, "other roles ignore the build");

    assert!(sim.restarts.is_empty());
    sim.advance(2_000_000);
    assert_eq!(sim.restarts, vec![2]);
}

#[test]
fn broadcasted_firmware_is_pulled_by_root_and_observed_by_others() {
    // 1 (root, receiver) - 2 (distributor) - 3 (receiver)
    let mut sim = Sim::new(&[(1, 0), (2, 0), (3, 0)]);
    let config = MeshConfig {
        announce_broadcasted: true,
        ..MeshConfig::default()
    };
    sim.nodes[1] = MeshNode::new(NodeId(2), config);
    sim.nodes[0].set_root(true);
    let (rx1, sink1, _) = receiver("ESP32", "node");
    let (rx3, sink3, _) = receiver("ESP32", "node");
    sim.nodes[0].enable_ota_receiver(rx1);
    sim.nodes[2].enable_ota_receiver(rx3);
    sim.connect(0, 1);
    sim.connect(1, 2);
    sim.advance(500_000);

    let mut lib = ImageLibrary::new();
    lib.insert(FirmwareImage::new("ESP32", "node", image(), 1024));
    sim.act(1, |n, now| n.enable_ota_distributor(OtaDistributor::new(Box::new(lib)), now));

    assert_eq!(sink1.flash().lock().unwrap().committed.as_deref(), Some(&image()[..]));
    assert_eq!(sink3.flash().lock().unwrap().committed.as_deref(), Some(&image()[..]));
    assert!(sim.nodes[2].ota_receiver().unwrap().pending().is_none());
}

#[test]
fn silent_distributor_exhausts_retries() {
    let mut sim = Sim::new(&[(1, 0), (2, 0)]);
    let (rx, sink, _) = receiver("ESP32", "node");
    sim.nodes[1].enable_ota_receiver(rx);
    sim.connect(0, 1);
    sim.advance(200_000);

    // Node 1 announces a build it cannot serve.
    let ann = FirmwareImage::new("ESP32", "node", image(), 1024).announce(NodeId(1), false, false);
    sim.act(0, |n, _| n.announce(ann).unwrap());
    assert!(sim.nodes[1].ota_receiver().unwrap().pending().is_some());

    sim.advance(11 * 30_000_000);
    assert!(sim.nodes[1].ota_receiver().unwrap().pending().is_none());
    assert!(sim.events[1]
        .iter()
        .any(|e| matches!(e, MeshEvent::OtaAborted { .. })));
    assert_eq!(sink.flash().lock().unwrap().begun, 0);
}

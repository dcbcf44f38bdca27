//! Topology: this node's view of the spanning tree, per-link subtrees, root election
//! and the routing table derived from them.

use serde::{Deserialize, Serialize};

use crate::identity::{LinkId, NodeId};
use crate::protocol::NodeTree;

impl NodeTree {
    /// Number of nodes in this tree, itself included.
    pub fn size(&self) -> usize {
        1 + self.subs.iter().map(NodeTree::size).sum::<usize>()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node_id == id || self.subs.iter().any(|s| s.contains(id))
    }

    pub fn contains_root(&self) -> bool {
        self.root || self.subs.iter().any(NodeTree::contains_root)
    }

    /// Node IDs in pre-order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.size());
        self.collect_ids(&mut out);
        out
    }

    /// IDs of every node flagged as root.
    pub fn roots(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_roots(&mut out);
        out
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn collect_ids(&self, out: &mut Vec<NodeId>) {
        out.push(self.node_id);
        for s in &self.subs {
            s.collect_ids(out);
        }
    }

    fn collect_roots(&self, out: &mut Vec<NodeId>) {
        if self.root {
            out.push(self.node_id);
        }
        for s in &self.subs {
            s.collect_roots(out);
        }
    }
}

/// Which self-declared root wins when several are visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootTieBreak {
    #[default]
    LowestId,
    HighestId,
}

impl RootTieBreak {
    /// True if `other` outranks `me` as root.
    pub fn outranks(self, other: NodeId, me: NodeId) -> bool {
        match self {
            RootTieBreak::LowestId => other < me,
            RootTieBreak::HighestId => other > me,
        }
    }
}

struct Link {
    id: LinkId,
    /// Learned from the first sync over this link.
    subtree: Option<NodeTree>,
    last_sync_us: u64,
}

/// Result of replacing a neighbour's subtree.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// The stored subtree differed from the new one.
    pub changed: bool,
    /// First sync over this link: the neighbour's node ID.
    pub new_connection: Option<NodeId>,
    pub joined: Vec<NodeId>,
    pub left: Vec<NodeId>,
    /// The neighbour advertised a tree containing this node.
    pub loop_detected: bool,
}

/// Neighbour lost through a closed link.
#[derive(Debug, PartialEq, Eq)]
pub struct DroppedLink {
    pub node: Option<NodeId>,
    pub lost: Vec<NodeId>,
}

pub struct Topology {
    node_id: NodeId,
    wants_root: bool,
    tie_break: RootTieBreak,
    /// Insertion order is preserved; it becomes the order of `subs`.
    links: Vec<Link>,
}

impl Topology {
    pub fn new(node_id: NodeId, wants_root: bool, tie_break: RootTieBreak) -> Self {
        Self {
            node_id,
            wants_root,
            tie_break,
            links: Vec::new(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Declare (or stop declaring) this node as root.
    pub fn set_root(&mut self, wants_root: bool) {
        self.wants_root = wants_root;
    }

    /// True iff this node declares itself root and no visible root outranks it.
    pub fn is_root(&self) -> bool {
        if !self.wants_root {
            return false;
        }
        let me = self.node_id;
        !self
            .subtrees()
            .flat_map(NodeTree::roots)
            .any(|other| other != me && self.tie_break.outranks(other, me))
    }

    /// Whether a root is known anywhere in the mesh.
    pub fn has_root(&self) -> bool {
        self.is_root() || self.subtrees().any(NodeTree::contains_root)
    }

    pub fn open_link(&mut self, link: LinkId, now_us: u64) {
        if self.links.iter().any(|l| l.id == link) {
            return;
        }
        self.links.push(Link {
            id: link,
            subtree: None,
            last_sync_us: now_us,
        });
    }

    pub fn close_link(&mut self, link: LinkId) -> Option<DroppedLink> {
        let pos = self.links.iter().position(|l| l.id == link)?;
        let removed = self.links.remove(pos);
        Some(DroppedLink {
            node: removed.subtree.as_ref().map(|t| t.node_id),
            lost: removed.subtree.map(|t| t.node_ids()).unwrap_or_default(),
        })
    }

    pub fn links(&self) -> Vec<LinkId> {
        self.links.iter().map(|l| l.id).collect()
    }

    pub fn has_link(&self, link: LinkId) -> bool {
        self.links.iter().any(|l| l.id == link)
    }

    /// Replace a neighbour's subtree wholesale.
    pub fn apply_sync(&mut self, link: LinkId, tree: NodeTree, now_us: u64) -> SyncOutcome {
        let before = self.node_list(false);
        let me = self.node_id;
        let Some(entry) = self.links.iter_mut().find(|l| l.id == link) else {
            return SyncOutcome::default();
        };
        entry.last_sync_us = now_us;
        // A tree that already holds us is never stored.
        if tree.contains(me) {
            return SyncOutcome {
                loop_detected: true,
                ..SyncOutcome::default()
            };
        }
        let mut outcome = SyncOutcome::default();
        if entry.subtree.is_none() {
            outcome.new_connection = Some(tree.node_id);
        }
        if entry.subtree.as_ref() == Some(&tree) {
            return outcome;
        }
        entry.subtree = Some(tree);
        outcome.changed = true;
        let after = self.node_list(false);
        outcome.joined = after.iter().filter(|n| !before.contains(n)).copied().collect();
        outcome.left = before.iter().filter(|n| !after.contains(n)).copied().collect();
        outcome
    }

    /// Full tree rooted at this node.
    pub fn tree(&self) -> NodeTree {
        NodeTree {
            node_id: self.node_id,
            root: self.is_root(),
            subs: self.subtrees().cloned().collect(),
        }
    }

    /// What we advertise to `link`: everything except the subtree behind it.
    pub fn tree_excluding(&self, link: LinkId) -> NodeTree {
        NodeTree {
            node_id: self.node_id,
            root: self.is_root(),
            subs: self
                .links
                .iter()
                .filter(|l| l.id != link)
                .filter_map(|l| l.subtree.clone())
                .collect(),
        }
    }

    pub fn subtree(&self, link: LinkId) -> Option<&NodeTree> {
        self.links
            .iter()
            .find(|l| l.id == link)
            .and_then(|l| l.subtree.as_ref())
    }

    /// Neighbour node on a link, once known.
    pub fn neighbour(&self, link: LinkId) -> Option<NodeId> {
        self.subtree(link).map(|t| t.node_id)
    }

    /// Link to forward a message for `dest` on.
    pub fn route(&self, dest: NodeId) -> Option<LinkId> {
        self.links
            .iter()
            .find(|l| l.subtree.as_ref().is_some_and(|t| t.contains(dest)))
            .map(|l| l.id)
    }

    pub fn node_list(&self, include_self: bool) -> Vec<NodeId> {
        let mut out = Vec::new();
        if include_self {
            out.push(self.node_id);
        }
        for t in self.subtrees() {
            out.extend(t.node_ids());
        }
        out
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        node == self.node_id || self.route(node).is_some()
    }

    /// Links with no sync since `now_us - timeout_us`.
    pub fn stale_links(&self, now_us: u64, timeout_us: u64) -> Vec<LinkId> {
        self.links
            .iter()
            .filter(|l| now_us.saturating_sub(l.last_sync_us) > timeout_us)
            .map(|l| l.id)
            .collect()
    }

    fn subtrees(&self) -> impl Iterator<Item = &NodeTree> {
        self.links.iter().filter_map(|l| l.subtree.as_ref())
    }
}

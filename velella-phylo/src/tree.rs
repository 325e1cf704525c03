//! The rooted tree and its branch segments.
//!
//! Uses arena-style storage: nodes and branch segments live in flat
//! vectors and are referenced by [`NodeId`] / [`BranchId`] indices, so the
//! node ↔ branch ↔ alignment references of the sampler never form owning
//! cycles. Each input edge is subdivided into segments no longer than the
//! configured maximum; every segment carries one substitution record per
//! domain and alignment column.

use velella_core::{Result, Summarizable, VelellaError, Xorshift64};

use crate::rate_vector::RvId;
use crate::states::{StateCode, GAP};

/// Index into the tree's node arena.
pub type NodeId = usize;

/// Index into the tree's branch-segment arena.
pub type BranchId = usize;

/// A raw input tree: `(name, distance, children)`, as produced by an
/// external parser. Rooted; at most two children per node; a unary chain is
/// permitted.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawTree {
    pub name: String,
    pub distance: f64,
    pub children: Vec<RawTree>,
}

impl RawTree {
    pub fn leaf(name: &str, distance: f64) -> Self {
        Self {
            name: name.to_string(),
            distance,
            children: Vec::new(),
        }
    }

    pub fn node(name: &str, distance: f64, children: Vec<RawTree>) -> Self {
        Self {
            name: name.to_string(),
            distance,
            children,
        }
    }
}

/// How an input edge is divided into segments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SplitPolicy {
    /// `ceil(d / max_seg_len)` segments of equal length.
    #[default]
    Uniform,
}

impl SplitPolicy {
    fn segment_lengths(self, distance: f64, max_seg_len: f64) -> Vec<f64> {
        match self {
            SplitPolicy::Uniform => {
                if distance <= max_seg_len {
                    return vec![distance];
                }
                let n = (distance / max_seg_len).ceil() as usize;
                vec![distance / n as f64; n]
            }
        }
    }
}

/// One substitution record: what happened to a single column of a single
/// domain along a branch segment. `dec == GAP` marks a gapped position with
/// no record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Substitution {
    /// True when an event (real or virtual self-event) lies on the segment.
    pub occurred: bool,
    pub anc: StateCode,
    pub dec: StateCode,
    pub rate_vector: Option<RvId>,
}

impl Substitution {
    /// The empty record used for gapped positions.
    pub fn null() -> Self {
        Self {
            occurred: false,
            anc: GAP,
            dec: GAP,
            rate_vector: None,
        }
    }

    pub fn is_gap(&self) -> bool {
        self.dec == GAP
    }
}

/// A segment of a phylogenetic edge.
#[derive(Debug, Clone)]
pub struct BranchSegment {
    pub id: BranchId,
    /// Segment length `t_b`.
    pub length: f64,
    pub ancestral: NodeId,
    pub descendant: NodeId,
    /// `records[domain][pos]`, sized by `Tree::allocate_records`.
    pub records: Vec<Vec<Substitution>>,
    /// The rate vector bound at `rates[domain][pos]` (keyed by the
    /// ancestral extended state there).
    pub rates: Vec<Vec<Option<RvId>>>,
}

impl BranchSegment {
    /// The record for one domain/column.
    pub fn record(&self, domain: usize, pos: usize) -> Substitution {
        self.records[domain][pos]
    }
}

/// A node of the tree. Tips have neither left nor right branch; a unary
/// internal node (created by segment splitting) has only a left branch.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub id: NodeId,
    pub name: String,
    pub up: Option<BranchId>,
    pub left: Option<BranchId>,
    pub right: Option<BranchId>,
}

impl TreeNode {
    pub fn is_tip(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

/// The rooted tree: owns all nodes and branch segments.
#[derive(Debug, Clone)]
pub struct Tree {
    pub(crate) nodes: Vec<TreeNode>,
    pub(crate) branches: Vec<BranchSegment>,
    root: NodeId,
    /// Fixed post-order (children before parents); the reverse is used for
    /// top-down passes.
    post_order: Vec<NodeId>,
}

impl Tree {
    /// Build the internal structure from a raw tree, splitting edges
    /// longer than `max_seg_len`.
    pub fn build(raw: &RawTree, max_seg_len: f64, policy: SplitPolicy) -> Result<Self> {
        if max_seg_len <= 0.0 {
            return Err(VelellaError::Config(
                "maximum segment length must be greater than 0".into(),
            ));
        }
        let mut tree = Tree {
            nodes: Vec::new(),
            branches: Vec::new(),
            root: 0,
            post_order: Vec::new(),
        };
        let mut synth = 0usize;
        // Root distance is ignored: the root has no up-branch.
        let root = tree.create_node(&raw.name, &mut synth);
        tree.root = root;
        tree.attach_children(raw, root, max_seg_len, policy, &mut synth)?;
        tree.check_unique_names()?;
        tree.post_order = tree.compute_post_order();
        Ok(tree)
    }

    fn create_node(&mut self, name: &str, synth: &mut usize) -> NodeId {
        let name = if name.is_empty() {
            let n = format!("Node{}", *synth);
            *synth += 1;
            n
        } else {
            name.to_string()
        };
        let id = self.nodes.len();
        self.nodes.push(TreeNode {
            id,
            name,
            up: None,
            left: None,
            right: None,
        });
        id
    }

    fn attach_children(
        &mut self,
        raw: &RawTree,
        parent: NodeId,
        max_seg_len: f64,
        policy: SplitPolicy,
        synth: &mut usize,
    ) -> Result<()> {
        if raw.children.len() > 2 {
            return Err(VelellaError::Graph(format!(
                "node \"{}\" has {} children; the tree must be binary",
                self.nodes[parent].name,
                raw.children.len()
            )));
        }
        for child in &raw.children {
            let lengths = policy.segment_lengths(child.distance, max_seg_len);
            let mut anc = parent;
            for (i, &len) in lengths.iter().enumerate() {
                let dec = if i + 1 == lengths.len() {
                    self.create_node(&child.name, synth)
                } else {
                    // Intermediate node introduced by the split.
                    self.create_node("", synth)
                };
                self.connect(anc, dec, len)?;
                anc = dec;
            }
            self.attach_children(child, anc, max_seg_len, policy, synth)?;
        }
        Ok(())
    }

    fn connect(&mut self, ancestral: NodeId, descendant: NodeId, length: f64) -> Result<()> {
        if length < 0.0 {
            return Err(VelellaError::Graph(format!(
                "negative branch length {length} above \"{}\"",
                self.nodes[descendant].name
            )));
        }
        let id = self.branches.len();
        self.branches.push(BranchSegment {
            id,
            length,
            ancestral,
            descendant,
            records: Vec::new(),
            rates: Vec::new(),
        });
        self.nodes[descendant].up = Some(id);
        if self.nodes[ancestral].left.is_none() {
            self.nodes[ancestral].left = Some(id);
        } else if self.nodes[ancestral].right.is_none() {
            self.nodes[ancestral].right = Some(id);
        } else {
            return Err(VelellaError::Graph(format!(
                "node \"{}\" already has two children",
                self.nodes[ancestral].name
            )));
        }
        Ok(())
    }

    fn check_unique_names(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(VelellaError::Schema(format!(
                    "duplicate node name \"{}\" in tree",
                    node.name
                )));
            }
        }
        Ok(())
    }

    fn compute_post_order(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            order.push(id);
            let node = &self.nodes[id];
            for branch in [node.left, node.right].into_iter().flatten() {
                stack.push(self.branches[branch].descendant);
            }
        }
        order.reverse();
        order
    }

    /// Size every segment's record arrays for the alignment shape.
    pub fn allocate_records(&mut self, n_domains: usize, n_columns: usize) {
        for branch in &mut self.branches {
            branch.records = vec![vec![Substitution::null(); n_columns]; n_domains];
            branch.rates = vec![vec![None; n_columns]; n_domains];
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Node ids in the stored post-order (children before parents).
    pub fn nodes(&self) -> &[NodeId] {
        &self.post_order
    }

    pub fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }

    pub fn branch(&self, id: BranchId) -> &BranchSegment {
        &self.branches[id]
    }

    pub fn n_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn n_branches(&self) -> usize {
        self.branches.len()
    }

    /// All segments, in creation order (stable across a run).
    pub fn branches(&self) -> impl Iterator<Item = &BranchSegment> {
        self.branches.iter()
    }

    /// Distinct view for record refreshes: immutable nodes, mutable
    /// segments.
    pub(crate) fn split_mut(&mut self) -> (&[TreeNode], &mut [BranchSegment]) {
        (&self.nodes, &mut self.branches)
    }

    /// The parent node, if any.
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].up.map(|b| self.branches[b].ancestral)
    }

    /// The left/right child nodes, if any.
    pub fn child_left(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].left.map(|b| self.branches[b].descendant)
    }

    pub fn child_right(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].right.map(|b| self.branches[b].descendant)
    }

    /// Pick a node uniformly (tips included).
    pub fn rand_node(&self, rng: &mut Xorshift64) -> NodeId {
        self.post_order[rng.index(self.post_order.len())]
    }

    /// A traversal order that starts at `start` and expands outward, so
    /// every visited node except the start has at least one
    /// already-visited neighbour.
    pub fn recursion_path(&self, start: NodeId) -> Vec<NodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut path = Vec::with_capacity(self.nodes.len());
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(start);
        visited[start] = true;
        while let Some(id) = queue.pop_front() {
            path.push(id);
            let node = &self.nodes[id];
            let mut neighbours = Vec::with_capacity(3);
            if let Some(up) = node.up {
                neighbours.push(self.branches[up].ancestral);
            }
            for branch in [node.left, node.right].into_iter().flatten() {
                neighbours.push(self.branches[branch].descendant);
            }
            for n in neighbours {
                if !visited[n] {
                    visited[n] = true;
                    queue.push_back(n);
                }
            }
        }
        path
    }

    /// The lengths of all segments, in branch order.
    pub fn branch_lengths(&self) -> Vec<f64> {
        self.branches.iter().map(|b| b.length).collect()
    }
}

impl Summarizable for Tree {
    fn summary(&self) -> String {
        let tips = self.nodes.iter().filter(|n| n.is_tip()).count();
        format!(
            "Tree: {} nodes ({} tips), {} branch segments",
            self.nodes.len(),
            tips,
            self.branches.len()
        )
    }
}

//! The substitution-model parameter graph.
//!
//! Rate cells are live values: each is a node in a DAG supporting
//! `get`, `refresh`, dependency declaration, and accept/reject. Nodes come
//! in three kinds — fixed constants, sampleable random-walk floats, and
//! derived virtual-substitution rates (`u - sum of the other rates` of the
//! hosting vector). Nodes are addressed by [`ValueId`] handles and the
//! dependency graph is an adjacency list over handles, refreshed in
//! dependency order when a value moves.

use velella_core::{Result, VelellaError, Xorshift64};

/// Handle into the parameter graph.
pub type ValueId = usize;

#[derive(Debug, Clone)]
enum ValueKind {
    /// A constant; never proposed.
    Fixed,
    /// Sampleable by a symmetric uniform random-walk step, reflected off
    /// the bounds. Proposals are Metropolis-flagged.
    RandomWalk { window: f64, lower: f64, upper: f64 },
    /// Derived virtual-substitution rate: `u - sum(deps)`, constrained to
    /// [0, 1].
    VirtualRate { u: f64, deps: Vec<ValueId> },
}

#[derive(Debug, Clone)]
struct ValueNode {
    name: String,
    value: f64,
    kind: ValueKind,
}

/// Outcome of a parameter proposal.
#[derive(Debug, Clone)]
pub struct Proposal {
    /// True when the move must pass a Metropolis-Hastings acceptance test;
    /// false for Gibbs-flagged moves that are always accepted.
    pub metropolis: bool,
    /// Every value that changed: the perturbed parameter plus all derived
    /// rates refreshed from it.
    pub changed: Vec<ValueId>,
}

/// The DAG of named value nodes.
#[derive(Debug, Clone, Default)]
pub struct ParameterGraph {
    nodes: Vec<ValueNode>,
    /// value -> derived nodes that must refresh when it changes.
    dependents: Vec<Vec<ValueId>>,
    sampleable: Vec<ValueId>,
    cursor: usize,
    /// (id, previous value) pairs restorable by `reject`.
    pending: Vec<(ValueId, f64)>,
}

impl ParameterGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, node: ValueNode) -> ValueId {
        let id = self.nodes.len();
        self.nodes.push(node);
        self.dependents.push(Vec::new());
        id
    }

    /// Add a constant value.
    pub fn add_fixed(&mut self, name: &str, value: f64) -> ValueId {
        self.push(ValueNode {
            name: name.to_string(),
            value,
            kind: ValueKind::Fixed,
        })
    }

    /// Add a sampleable value with a random-walk proposal window and hard
    /// bounds.
    pub fn add_random_walk(
        &mut self,
        name: &str,
        value: f64,
        window: f64,
        lower: f64,
        upper: f64,
    ) -> ValueId {
        let id = self.push(ValueNode {
            name: name.to_string(),
            value,
            kind: ValueKind::RandomWalk {
                window,
                lower,
                upper,
            },
        });
        self.sampleable.push(id);
        id
    }

    /// Add a derived virtual-substitution rate with uniformization constant
    /// `u`. Dependencies are declared afterwards with
    /// [`declare_rate_dependency`](Self::declare_rate_dependency); call
    /// [`refresh`](Self::refresh) once all are in place.
    pub fn add_virtual_rate(&mut self, name: &str, u: f64) -> ValueId {
        self.push(ValueNode {
            name: name.to_string(),
            value: u,
            kind: ValueKind::VirtualRate {
                u,
                deps: Vec::new(),
            },
        })
    }

    /// Declare that `virtual_id` is derived from `dep_id`.
    pub fn declare_rate_dependency(&mut self, virtual_id: ValueId, dep_id: ValueId) -> Result<()> {
        match self.nodes.get_mut(virtual_id).map(|n| &mut n.kind) {
            Some(ValueKind::VirtualRate { deps, .. }) => {
                deps.push(dep_id);
                self.dependents[dep_id].push(virtual_id);
                Ok(())
            }
            _ => Err(VelellaError::Graph(format!(
                "value {virtual_id} is not a virtual rate"
            ))),
        }
    }

    pub fn get(&self, id: ValueId) -> f64 {
        self.nodes[id].value
    }

    pub fn name(&self, id: ValueId) -> &str {
        &self.nodes[id].name
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of sampleable parameters.
    pub fn n_sampleable(&self) -> usize {
        self.sampleable.len()
    }

    /// Recompute a derived value from its dependencies.
    ///
    /// # Errors
    ///
    /// `Numeric` if the recomputed virtual rate leaves [0, 1].
    pub fn refresh(&mut self, id: ValueId) -> Result<()> {
        let (total, u) = match &self.nodes[id].kind {
            ValueKind::VirtualRate { u, deps } => {
                let total: f64 = deps.iter().map(|&d| self.nodes[d].value).sum();
                (total, *u)
            }
            _ => return Ok(()),
        };
        let value = u - total;
        if !(0.0..=1.0).contains(&value) {
            return Err(VelellaError::Numeric(format!(
                "virtual substitution rate \"{}\" out of bounds: {value}",
                self.nodes[id].name
            )));
        }
        self.nodes[id].value = value;
        Ok(())
    }

    /// Refresh every node derived (transitively) from `start`, recording
    /// old values in the pending list. Returns the refreshed ids in order.
    fn refresh_dependents(&mut self, start: ValueId) -> Result<Vec<ValueId>> {
        let mut queue = self.dependents[start].clone();
        let mut refreshed = Vec::new();
        let mut i = 0;
        while i < queue.len() {
            let id = queue[i];
            i += 1;
            if refreshed.contains(&id) {
                continue;
            }
            self.pending.push((id, self.nodes[id].value));
            self.refresh(id)?;
            refreshed.push(id);
            queue.extend(self.dependents[id].iter().copied());
        }
        Ok(refreshed)
    }

    /// Set a value directly and refresh everything derived from it.
    ///
    /// Used by hosts wiring the graph and by tests; on error the graph is
    /// restored to its previous state.
    pub fn set_value(&mut self, id: ValueId, value: f64) -> Result<Vec<ValueId>> {
        self.pending.push((id, self.nodes[id].value));
        self.nodes[id].value = value;
        match self.refresh_dependents(id) {
            Ok(mut refreshed) => {
                self.pending.clear();
                refreshed.insert(0, id);
                Ok(refreshed)
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Propose a move on the next sampleable parameter (round-robin),
    /// refreshing derived values.
    ///
    /// On success the graph holds the proposed state; the caller must
    /// finish the move with [`accept`](Self::accept) or
    /// [`reject`](Self::reject). A `Numeric` failure (derived rate out of
    /// bounds) rolls the graph back internally and should be treated as an
    /// ordinary rejection by the driver.
    pub fn propose(&mut self, rng: &mut Xorshift64) -> Result<Proposal> {
        if self.sampleable.is_empty() {
            return Err(VelellaError::Config(
                "parameter graph has no sampleable values".into(),
            ));
        }
        debug_assert!(self.pending.is_empty(), "unresolved previous proposal");

        let id = self.sampleable[self.cursor];
        self.cursor = (self.cursor + 1) % self.sampleable.len();

        let old = self.nodes[id].value;
        let new = match &self.nodes[id].kind {
            &ValueKind::RandomWalk {
                window,
                lower,
                upper,
            } => {
                let mut v = old + (rng.next_f64() - 0.5) * window;
                // Reflect off the bounds; the walk stays symmetric.
                if v < lower {
                    v = 2.0 * lower - v;
                }
                if v > upper {
                    v = 2.0 * upper - v;
                }
                v.clamp(lower, upper)
            }
            _ => old,
        };

        self.pending.push((id, old));
        self.nodes[id].value = new;

        match self.refresh_dependents(id) {
            Ok(refreshed) => {
                let mut changed = vec![id];
                changed.extend(refreshed);
                Ok(Proposal {
                    metropolis: true,
                    changed,
                })
            }
            Err(e) => {
                self.rollback();
                Err(e)
            }
        }
    }

    /// Commit the outstanding proposal.
    pub fn accept(&mut self) {
        self.pending.clear();
    }

    /// Undo the outstanding proposal, restoring every changed value.
    pub fn reject(&mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        while let Some((id, old)) = self.pending.pop() {
            self.nodes[id].value = old;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Four-state vector: virtual slot plus three off-diagonal rates.
    fn four_state_graph() -> (ParameterGraph, ValueId, [ValueId; 3]) {
        let mut graph = ParameterGraph::new();
        let virt = graph.add_virtual_rate("rv0-virtual", 0.3);
        let mut offs = [0; 3];
        for (i, off) in offs.iter_mut().enumerate() {
            let id = graph.add_random_walk(&format!("rv0-{i}"), 0.05, 0.02, 0.0, 1.0);
            graph.declare_rate_dependency(virt, id).unwrap();
            *off = id;
        }
        graph.refresh(virt).unwrap();
        (graph, virt, offs)
    }

    #[test]
    fn virtual_rate_is_u_minus_total() {
        let (graph, virt, _) = four_state_graph();
        assert!((graph.get(virt) - 0.15).abs() < 1e-12);
    }

    #[test]
    fn out_of_bounds_step_is_rejected() {
        let (mut graph, virt, offs) = four_state_graph();
        let err = graph.set_value(offs[0], 0.4).unwrap_err();
        assert!(matches!(err, VelellaError::Numeric(_)));
        // Graph restored.
        assert!((graph.get(offs[0]) - 0.05).abs() < 1e-12);
        assert!((graph.get(virt) - 0.15).abs() < 1e-12);
    }

    #[test]
    fn set_value_refreshes_dependents() {
        let (mut graph, virt, offs) = four_state_graph();
        let changed = graph.set_value(offs[1], 0.1).unwrap();
        assert!(changed.contains(&offs[1]));
        assert!(changed.contains(&virt));
        assert!((graph.get(virt) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn propose_then_reject_restores_state() {
        let (mut graph, virt, offs) = four_state_graph();
        let before: Vec<f64> = (0..graph.len()).map(|i| graph.get(i)).collect();
        let mut rng = Xorshift64::new(42);
        let proposal = graph.propose(&mut rng).unwrap();
        assert!(proposal.metropolis);
        assert!(proposal.changed.contains(&virt) || !proposal.changed.is_empty());
        graph.reject();
        for (i, &v) in before.iter().enumerate() {
            assert!((graph.get(i) - v).abs() < 1e-12, "value {i} not restored");
        }
        let _ = offs;
    }

    #[test]
    fn propose_then_accept_keeps_state() {
        let (mut graph, _, _) = four_state_graph();
        let mut rng = Xorshift64::new(42);
        let proposal = graph.propose(&mut rng).unwrap();
        let moved = graph.get(proposal.changed[0]);
        graph.accept();
        assert!((graph.get(proposal.changed[0]) - moved).abs() < 1e-15);
    }

    #[test]
    fn propose_steps_round_robin() {
        let (mut graph, _, offs) = four_state_graph();
        let mut rng = Xorshift64::new(1);
        let mut seen = Vec::new();
        for _ in 0..3 {
            let p = graph.propose(&mut rng).unwrap();
            seen.push(p.changed[0]);
            graph.accept();
        }
        assert_eq!(seen, offs.to_vec());
    }

    #[test]
    fn proposals_stay_in_bounds() {
        let mut graph = ParameterGraph::new();
        let id = graph.add_random_walk("p", 0.01, 0.5, 0.0, 1.0);
        let mut rng = Xorshift64::new(9);
        for _ in 0..500 {
            graph.propose(&mut rng).unwrap();
            let v = graph.get(id);
            assert!((0.0..=1.0).contains(&v), "value {v} escaped bounds");
            graph.accept();
        }
    }

    #[test]
    fn fixed_values_never_move() {
        let mut graph = ParameterGraph::new();
        graph.add_fixed("c", 0.25);
        let mut rng = Xorshift64::new(3);
        assert!(matches!(
            graph.propose(&mut rng),
            Err(VelellaError::Config(_))
        ));
    }
}

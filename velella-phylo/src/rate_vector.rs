//! Rate vectors and the store that organizes them for O(1) selection.
//!
//! A [`RateVector`] holds one live rate cell per state of its domain; the
//! cell at index = ancestral state is the derived virtual-substitution
//! rate. The [`RateVectorSet`] owns every vector and keys them by extended
//! state (the joint state across all registered domains, in registration
//! order), so a lookup during sampling is a single hash probe. It also
//! maintains the reverse indexes the delta-likelihood pass walks: which
//! vectors host a given parameter, and which branch positions currently
//! use a given vector.

use std::collections::HashMap;

use velella_core::{Result, VelellaError};

use crate::params::{ParameterGraph, ValueId};
use crate::states::{DomainId, StateCode};
use crate::tree::BranchId;

/// Handle into the rate-vector store.
pub type RvId = usize;

/// A branch position currently bound to a rate vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RvUse {
    pub branch: BranchId,
    pub domain: DomainId,
    pub pos: usize,
}

/// One rate vector: the leaving rates from `anc_state` of `domain`.
#[derive(Debug, Clone)]
pub struct RateVector {
    pub name: String,
    pub domain: DomainId,
    /// The ancestral state this vector applies to; also the index of the
    /// virtual-substitution slot in `rates`.
    pub anc_state: StateCode,
    /// One live value handle per destination state.
    pub rates: Vec<ValueId>,
}

impl RateVector {
    pub fn new(name: &str, domain: DomainId, anc_state: StateCode, rates: Vec<ValueId>) -> Self {
        Self {
            name: name.to_string(),
            domain,
            anc_state,
            rates,
        }
    }

    /// Number of destination states.
    pub fn size(&self) -> usize {
        self.rates.len()
    }
}

/// Owns all rate vectors and their selection hash.
#[derive(Debug, Clone)]
pub struct RateVectorSet {
    vectors: Vec<RateVector>,
    n_domains: usize,
    /// Per domain: extended state (one code per domain, registration
    /// order) -> rate vector.
    by_context: Vec<HashMap<Vec<StateCode>, RvId>>,
    /// Parameter -> vectors hosting it. Built by `organize`.
    param_hosts: HashMap<ValueId, Vec<RvId>>,
    /// Vector -> branch positions currently bound to it.
    usage: Vec<Vec<RvUse>>,
}

impl RateVectorSet {
    pub fn new(n_domains: usize) -> Self {
        Self {
            vectors: Vec::new(),
            n_domains,
            by_context: vec![HashMap::new(); n_domains],
            param_hosts: HashMap::new(),
            usage: Vec::new(),
        }
    }

    /// Add a vector to the store. Contexts are bound separately with
    /// [`bind`](Self::bind).
    pub fn add(&mut self, vector: RateVector) -> Result<RvId> {
        if vector.domain >= self.n_domains {
            return Err(VelellaError::Graph(format!(
                "rate vector \"{}\" names unregistered domain {}",
                vector.name, vector.domain
            )));
        }
        if (vector.anc_state as usize) >= vector.size() {
            return Err(VelellaError::Graph(format!(
                "rate vector \"{}\" has ancestral state {} outside its {} slots",
                vector.name,
                vector.anc_state,
                vector.size()
            )));
        }
        let id = self.vectors.len();
        self.vectors.push(vector);
        self.usage.push(Vec::new());
        Ok(id)
    }

    /// Bind a vector to one extended state it applies to.
    ///
    /// The key must carry exactly one code per registered domain and must
    /// agree with the vector's own ancestral state in its own domain.
    pub fn bind(&mut self, id: RvId, ex_state: Vec<StateCode>) -> Result<()> {
        let vector = self
            .vectors
            .get(id)
            .ok_or_else(|| VelellaError::Graph(format!("unknown rate vector {id}")))?;
        if ex_state.len() != self.n_domains {
            return Err(VelellaError::Graph(format!(
                "extended state for \"{}\" has {} entries, expected {}",
                vector.name,
                ex_state.len(),
                self.n_domains
            )));
        }
        if ex_state[vector.domain] != vector.anc_state {
            return Err(VelellaError::Graph(format!(
                "extended state disagrees with the ancestral state of \"{}\"",
                vector.name
            )));
        }
        let domain = vector.domain;
        if let Some(prev) = self.by_context[domain].insert(ex_state, id) {
            return Err(VelellaError::Graph(format!(
                "extended state already bound to \"{}\"",
                self.vectors[prev].name
            )));
        }
        Ok(())
    }

    /// Build the parameter -> host-vector index. Call once after all
    /// vectors are added and bound.
    pub fn organize(&mut self) {
        self.param_hosts.clear();
        for (id, vector) in self.vectors.iter().enumerate() {
            for &vid in &vector.rates {
                let hosts = self.param_hosts.entry(vid).or_default();
                if !hosts.contains(&id) {
                    hosts.push(id);
                }
            }
        }
    }

    /// Select the vector for `domain` under the given extended state.
    ///
    /// Failure is fatal: the store must be configured so that every
    /// reachable context has a vector.
    pub fn select(&self, domain: DomainId, ex_state: &[StateCode]) -> Result<RvId> {
        self.by_context[domain].get(ex_state).copied().ok_or_else(|| {
            VelellaError::Graph(format!(
                "no rate vector for domain {domain} in context {ex_state:?}"
            ))
        })
    }

    pub fn get(&self, id: RvId) -> &RateVector {
        &self.vectors[id]
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RvId, &RateVector)> {
        self.vectors.iter().enumerate()
    }

    /// Vectors hosting a parameter (empty if the value is in no vector).
    pub fn hosts(&self, value: ValueId) -> &[RvId] {
        self.param_hosts
            .get(&value)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Branch positions currently bound to a vector.
    pub fn usage(&self, id: RvId) -> &[RvUse] {
        &self.usage[id]
    }

    /// Forget all branch bindings (before a record refresh).
    pub fn clear_usage(&mut self) {
        for u in &mut self.usage {
            u.clear();
        }
    }

    /// Record that a branch position is bound to a vector.
    pub fn push_usage(&mut self, id: RvId, at: RvUse) {
        self.usage[id].push(at);
    }

    /// Current rate values of a vector, in slot order.
    pub fn values(&self, id: RvId, params: &ParameterGraph) -> Vec<f64> {
        self.vectors[id].rates.iter().map(|&v| params.get(v)).collect()
    }
}

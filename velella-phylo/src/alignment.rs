//! Sequence alignments and the Gibbs samplers over ancestral states.
//!
//! One [`SequenceAlignment`] exists per state domain. It owns the encoded
//! tip and internal sequences, the per-site prior and marginal state
//! distributions, and the gap masks, and implements the recursion
//! algorithms that resample ancestral states at each site:
//!
//! 1. **Upward** ([`SequenceAlignment::reverse_recursion`]) — post-order;
//!    tips reset to their priors, internal marginals are computed from
//!    child contributions only.
//! 2. **Downward** ([`SequenceAlignment::downward_pass`]) — pre-order;
//!    each non-root marginal is multiplied by the contribution from its
//!    parent and renormalised, yielding the full per-site posterior.
//! 3. **Outward resampling** — from a random start node, marginals are
//!    recomputed against already-sampled neighbours and one state per site
//!    is drawn by inverse CDF, collapsing the marginal to one-hot.
//!
//! Branch probabilities use the uniformization kernels
//! [`substitution_prob`] / [`no_substitution_prob`]; contributions from
//! non-focal domains are read off the branch segments' recorded events.

use std::collections::{BTreeMap, HashMap};

use velella_core::{Result, Summarizable, VelellaError, Xorshift64};

use crate::params::ParameterGraph;
use crate::rate_vector::{RateVector, RateVectorSet};
use crate::states::{DomainId, StateCode, StateDomain, GAP};
use crate::tree::{BranchSegment, NodeId, Tree};

/// One weighted state observation at one alignment position.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StateFreq {
    pub state: String,
    pub freq: f64,
}

/// A raw input sequence: per-position weighted state records summing to
/// 1.0. A gap is the single record `-` with frequency 1.0.
pub type FreqSequence = Vec<Vec<StateFreq>>;

/// A raw multiple sequence alignment, as supplied by an external parser.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RawMsa {
    pub seqs: BTreeMap<String, FreqSequence>,
}

impl RawMsa {
    /// Build a certain (frequency 1.0) alignment from plain strings, one
    /// symbol per character.
    pub fn from_strings(seqs: &[(&str, &str)]) -> Self {
        let mut out = BTreeMap::new();
        for (name, seq) in seqs {
            let fs: FreqSequence = seq
                .chars()
                .map(|c| {
                    vec![StateFreq {
                        state: c.to_string(),
                        freq: 1.0,
                    }]
                })
                .collect();
            out.insert(name.to_string(), fs);
        }
        Self { seqs: out }
    }
}

/// A contiguous per-node probability matrix (`n_columns` rows of
/// `n_states` values), indexed arithmetically.
#[derive(Debug, Clone)]
pub struct ProbMatrix {
    n_states: usize,
    data: Vec<f64>,
}

impl ProbMatrix {
    fn new(n_columns: usize, n_states: usize) -> Self {
        Self {
            n_states,
            data: vec![0.0; n_columns * n_states],
        }
    }

    pub fn row(&self, pos: usize) -> &[f64] {
        &self.data[pos * self.n_states..(pos + 1) * self.n_states]
    }

    pub fn row_mut(&mut self, pos: usize) -> &mut [f64] {
        &mut self.data[pos * self.n_states..(pos + 1) * self.n_states]
    }
}

/// Whether an alignment's ancestral states participate in MCMC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentTag {
    /// Ancestral states are resampled every tree-sample step.
    Dynamic,
    /// Columns are constant across taxa and never change; the alignment
    /// contributes only context to other domains.
    SiteStatic,
}

/// Substitution probability under uniformization: an `i -> j` event on a
/// segment of length `t_b` with rate `r` and uniformization constant `u`.
pub fn substitution_prob(rate: f64, t_b: f64, u: f64) -> f64 {
    (rate * t_b) / (1.0 + u * t_b)
}

/// No-substitution probability, allowing a virtual self-event.
pub fn no_substitution_prob(rate: f64, t_b: f64, u: f64) -> f64 {
    let prob_virtual = 1.0 - (1.0 / (1.0 + rate * t_b));
    let denom = 1.0 / (1.0 + u * t_b);
    prob_virtual * (rate * t_b) * denom + (1.0 - prob_virtual) * denom
}

/// Everything the recursion algorithms read while one alignment is being
/// mutated: the tree, the rate-vector store, the live parameter values,
/// and which domains are static. Built by the model for each sampling
/// pass.
pub struct SamplerContext<'a> {
    pub tree: &'a Tree,
    pub store: &'a RateVectorSet,
    pub params: &'a ParameterGraph,
    /// Uniformization constant.
    pub u: f64,
    /// Per [`DomainId`]: true when the domain is SITE_STATIC.
    pub is_static: &'a [bool],
}

impl SamplerContext<'_> {
    fn rate(&self, value: crate::params::ValueId) -> f64 {
        self.params.get(value)
    }

    /// Select the rate vector that would apply on `branch` at `pos` for
    /// `domain`, under the branch's recorded ancestral extended state with
    /// the given overrides applied.
    pub fn hypothetical_rate_vector(
        &self,
        branch: &BranchSegment,
        pos: usize,
        domain: DomainId,
        overrides: &[(DomainId, StateCode)],
    ) -> Result<&RateVector> {
        let n_domains = self.is_static.len();
        let mut ex = Vec::with_capacity(n_domains);
        for d in 0..n_domains {
            let code = overrides
                .iter()
                .find(|(k, _)| *k == d)
                .map(|&(_, v)| v)
                .unwrap_or_else(|| branch.records[d][pos].anc);
            ex.push(code);
        }
        let id = self.store.select(domain, &ex)?;
        Ok(self.store.get(id))
    }
}

/// The alignment for one state domain.
#[derive(Debug, Clone)]
pub struct SequenceAlignment {
    domain_id: DomainId,
    domain: StateDomain,
    tag: AlignmentTag,
    n_columns: usize,
    sequences: BTreeMap<String, Vec<StateCode>>,
    gaps: BTreeMap<String, Vec<bool>>,
    /// Fixed from the input MSA; tips only.
    priors: BTreeMap<String, ProbMatrix>,
    /// Scratch space, overwritten on every sampling pass; all nodes.
    marginals: BTreeMap<String, ProbMatrix>,
}

impl SequenceAlignment {
    /// Build a DYNAMIC alignment from a raw MSA.
    pub fn dynamic(domain_id: DomainId, domain: StateDomain, raw: &RawMsa) -> Result<Self> {
        Self::initialize(domain_id, domain, raw, AlignmentTag::Dynamic)
    }

    /// Build a SITE_STATIC alignment, validating that every column is
    /// constant across taxa with certain priors.
    pub fn site_static(domain_id: DomainId, domain: StateDomain, raw: &RawMsa) -> Result<Self> {
        let aln = Self::initialize(domain_id, domain, raw, AlignmentTag::SiteStatic)?;
        aln.validate_site_static()?;
        Ok(aln)
    }

    fn initialize(
        domain_id: DomainId,
        domain: StateDomain,
        raw: &RawMsa,
        tag: AlignmentTag,
    ) -> Result<Self> {
        if raw.seqs.is_empty() {
            return Err(VelellaError::Schema(format!(
                "alignment for domain \"{}\" has no sequences",
                domain.name()
            )));
        }
        let mut aln = Self {
            domain_id,
            domain,
            tag,
            n_columns: 0,
            sequences: BTreeMap::new(),
            gaps: BTreeMap::new(),
            priors: BTreeMap::new(),
            marginals: BTreeMap::new(),
        };
        for (name, fs) in &raw.seqs {
            aln.add_base(name, fs)?;
        }
        Ok(aln)
    }

    /// Add one observed (tip) sequence with its prior distribution.
    fn add_base(&mut self, name: &str, fs: &FreqSequence) -> Result<()> {
        if self.n_columns == 0 {
            self.n_columns = fs.len();
        } else if fs.len() != self.n_columns {
            return Err(VelellaError::Schema(format!(
                "sequence \"{name}\" has {} columns, expected {}",
                fs.len(),
                self.n_columns
            )));
        }
        let n_states = self.domain.n_states();
        let mut prior = ProbMatrix::new(self.n_columns, n_states);
        let mut seq = Vec::with_capacity(self.n_columns);
        for (pos, records) in fs.iter().enumerate() {
            if records.is_empty() {
                return Err(VelellaError::Schema(format!(
                    "sequence \"{name}\" has no state record at position {pos}"
                )));
            }
            let mut best: Option<(StateCode, f64)> = None;
            for record in records {
                let code = self.domain.encode(&record.state)?;
                if code == GAP {
                    if record.freq != 1.0 {
                        return Err(VelellaError::Schema(format!(
                            "sequence \"{name}\" position {pos}: gap must have frequency 1.0"
                        )));
                    }
                } else {
                    prior.row_mut(pos)[code as usize] = record.freq;
                }
                if best.map_or(true, |(_, f)| record.freq > f) {
                    best = Some((code, record.freq));
                }
            }
            seq.push(best.map(|(c, _)| c).unwrap_or(GAP));
        }
        let gaps: Vec<bool> = seq.iter().map(|&c| c == GAP).collect();
        self.sequences.insert(name.to_string(), seq);
        self.gaps.insert(name.to_string(), gaps);
        self.priors.insert(name.to_string(), prior);
        Ok(())
    }

    /// Add an all-gap internal sequence that will be sampled during MCMC.
    fn add_internal(&mut self, name: &str) {
        self.sequences
            .insert(name.to_string(), vec![GAP; self.n_columns]);
        self.gaps.insert(name.to_string(), vec![true; self.n_columns]);
    }

    fn validate_site_static(&self) -> Result<()> {
        let mut column_states = vec![GAP; self.n_columns];
        for (name, seq) in &self.sequences {
            for (pos, &state) in seq.iter().enumerate() {
                if column_states[pos] == GAP {
                    column_states[pos] = state;
                }
                if state != GAP && state != column_states[pos] {
                    return Err(VelellaError::Schema(format!(
                        "SITE_STATIC domain \"{}\": column {pos} is not constant",
                        self.domain.name()
                    )));
                }
                let prior = &self.priors[name];
                for &p in prior.row(pos) {
                    if p != 0.0 && p != 1.0 {
                        return Err(VelellaError::Schema(format!(
                            "uncertain state in SITE_STATIC state domain \"{}\"",
                            self.domain.name()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    pub fn domain(&self) -> &StateDomain {
        &self.domain
    }

    pub fn tag(&self) -> AlignmentTag {
        self.tag
    }

    pub fn is_dynamic(&self) -> bool {
        self.tag == AlignmentTag::Dynamic
    }

    pub fn n_cols(&self) -> usize {
        self.n_columns
    }

    pub fn sequence(&self, name: &str) -> Option<&[StateCode]> {
        self.sequences.get(name).map(|s| s.as_slice())
    }

    pub fn gap_mask(&self, name: &str) -> Option<&[bool]> {
        self.gaps.get(name).map(|g| g.as_slice())
    }

    /// All sequences in name order (the order every output uses).
    pub fn sequences(&self) -> impl Iterator<Item = (&str, &[StateCode])> {
        self.sequences.iter().map(|(n, s)| (n.as_str(), s.as_slice()))
    }

    /// The current marginal distribution at one node/position.
    pub fn marginal_row(&self, name: &str, pos: usize) -> Option<&[f64]> {
        self.marginals.get(name).map(|m| m.row(pos))
    }

    /// Attach the alignment to a tree: create marginal scratch space for
    /// every node, add internal sequences, propagate gap masks, and seed
    /// ancestral states by the clade-majority scheme.
    ///
    /// # Errors
    ///
    /// `Graph` if a tip has no sequence in the MSA.
    pub fn sync_with_tree(&mut self, tree: &Tree) -> Result<()> {
        log::debug!(
            "attaching \"{}\" states to tree ({} columns)",
            self.domain.name(),
            self.n_columns
        );
        for &id in tree.nodes() {
            let node = tree.node(id);
            self.marginals.insert(
                node.name.clone(),
                ProbMatrix::new(self.n_columns, self.domain.n_states()),
            );
            if !self.sequences.contains_key(&node.name) {
                if node.is_tip() {
                    return Err(VelellaError::Graph(format!(
                        "missing sequence for \"{}\" in domain \"{}\"",
                        node.name,
                        self.domain.name()
                    )));
                }
                self.add_internal(&node.name);
            }
        }

        // Gap masks for internal nodes, children first.
        for &id in tree.nodes() {
            let node = tree.node(id);
            if node.is_tip() {
                continue;
            }
            let left = tree.child_left(id).ok_or_else(|| {
                VelellaError::Graph(format!(
                    "internal node \"{}\" has no left child",
                    node.name
                ))
            })?;
            let left_mask = self.gaps[&tree.node(left).name].clone();
            let mask = match tree.child_right(id) {
                None => left_mask,
                Some(right) => {
                    let right_mask = &self.gaps[&tree.node(right).name];
                    left_mask
                        .iter()
                        .zip(right_mask.iter())
                        .map(|(&l, &r)| l && r)
                        .collect()
                }
            };
            self.gaps.insert(node.name.clone(), mask);
        }

        // Seed internal states.
        for pos in 0..self.n_columns {
            self.find_parsimony_by_position(tree, pos)?;
        }
        Ok(())
    }

    /// Greedy clade-majority seeding of ancestral states at one position.
    fn find_parsimony_by_position(&mut self, tree: &Tree, pos: usize) -> Result<()> {
        // Bottom up: the multiset of tip states observed below each node.
        let mut clade_states: HashMap<NodeId, Vec<StateCode>> = HashMap::new();
        for &id in tree.nodes() {
            let node = tree.node(id);
            if self.gaps[&node.name][pos] {
                continue;
            }
            let mut states = if node.is_tip() {
                vec![self.sequences[&node.name][pos]]
            } else {
                Vec::new()
            };
            for child in [tree.child_left(id), tree.child_right(id)].into_iter().flatten() {
                if let Some(cs) = clade_states.get(&child) {
                    states.extend_from_slice(cs);
                }
            }
            clade_states.insert(id, states);
        }

        // Top down: most frequent clade state, ties broken toward the
        // parent's state.
        for &id in tree.nodes().iter().rev() {
            let node = tree.node(id);
            if node.is_tip() || self.gaps[&node.name][pos] {
                continue;
            }
            let above = match tree.parent(id) {
                None => GAP,
                Some(p) => self.sequences[&tree.node(p).name][pos],
            };
            let state = pick_most_frequent_state(&clade_states[&id], above);
            self.sequence_mut(&node.name)?[pos] = state;
        }
        Ok(())
    }

    /// Check that every tree taxon has a sequence and that gap masks agree
    /// with every other domain's alignment at all shared names.
    pub fn validate(&self, tree: &Tree, others: &[&SequenceAlignment]) -> Result<()> {
        for &id in tree.nodes() {
            let name = &tree.node(id).name;
            if !self.sequences.contains_key(name) {
                return Err(VelellaError::Graph(format!(
                    "alignment \"{}\" is missing sequence for \"{name}\"",
                    self.domain.name()
                )));
            }
        }
        for other in others {
            if other.n_columns != self.n_columns {
                return Err(VelellaError::Schema(format!(
                    "alignments \"{}\" and \"{}\" have different column counts",
                    self.domain.name(),
                    other.domain.name()
                )));
            }
            for &id in tree.nodes() {
                let name = &tree.node(id).name;
                let (Some(mine), Some(theirs)) = (self.gaps.get(name), other.gaps.get(name))
                else {
                    continue;
                };
                if mine != theirs {
                    return Err(VelellaError::Schema(format!(
                        "pattern of gaps does not match between domains \"{}\" and \"{}\" for sequence \"{name}\"",
                        self.domain.name(),
                        other.domain.name()
                    )));
                }
            }
        }
        Ok(())
    }

    // --- marginal computation ---

    /// Mutable access to a node's marginal matrix; a missing node is a
    /// `Graph` error (the alignment was never attached to its tree).
    fn marginal_mut(&mut self, name: &str) -> Result<&mut ProbMatrix> {
        self.marginals.get_mut(name).ok_or_else(|| {
            VelellaError::Graph(format!("no marginal distribution for \"{name}\""))
        })
    }

    /// Mutable access to a node's sequence, failing with a `Graph` error.
    fn sequence_mut(&mut self, name: &str) -> Result<&mut Vec<StateCode>> {
        self.sequences
            .get_mut(name)
            .ok_or_else(|| VelellaError::Graph(format!("no sequence for \"{name}\"")))
    }

    fn normalize_row(&mut self, name: &str, pos: usize) -> Result<()> {
        let row = self.marginal_mut(name)?.row_mut(pos);
        let total: f64 = row.iter().sum();
        if total != 0.0 {
            for p in row {
                *p /= total;
            }
        }
        Ok(())
    }

    /// Reset marginals to the prior distribution (tips).
    fn reset_to_base(&mut self, name: &str, positions: &[usize]) -> Result<()> {
        let prior = &self.priors[name];
        let mut rows: Vec<(usize, Vec<f64>)> = Vec::with_capacity(positions.len());
        for &pos in positions {
            rows.push((pos, prior.row(pos).to_vec()));
        }
        let marginal = self.marginal_mut(name)?;
        for (pos, row) in rows {
            marginal.row_mut(pos).copy_from_slice(&row);
        }
        Ok(())
    }

    /// Probability that this node holds `state_i`, given the marginal of
    /// the descendant across `branch`. `focal_rv` is the focal-domain rate
    /// vector under the candidate ancestral context.
    fn state_prob_given_dec_branch(
        &self,
        ctx: &SamplerContext<'_>,
        branch: &BranchSegment,
        state_i: StateCode,
        dec_name: &str,
        focal_rv: &RateVector,
        pos: usize,
    ) -> Result<f64> {
        let t_b = branch.length;
        let dec_probs = self.marginals[dec_name].row(pos);
        let mut prob = 0.0;
        for (j, &state_prob) in dec_probs.iter().enumerate() {
            if state_prob == 0.0 {
                continue;
            }
            let state_j = j as StateCode;
            let rate = ctx.rate(focal_rv.rates[j]);
            let focal = if state_i != state_j {
                substitution_prob(rate, t_b, ctx.u)
            } else {
                no_substitution_prob(rate, t_b, ctx.u)
            };
            let alt = self.alt_domain_prob(ctx, branch, state_i, pos)?;
            prob += state_prob * focal * alt;
        }
        Ok(prob)
    }

    /// Probability that this node holds `state_j`, given the marginal of
    /// the ancestor across `branch`.
    fn state_prob_given_anc_branch(
        &self,
        ctx: &SamplerContext<'_>,
        branch: &BranchSegment,
        state_j: StateCode,
        anc_name: &str,
        pos: usize,
    ) -> Result<f64> {
        let t_b = branch.length;
        let anc_probs = self.marginals[anc_name].row(pos);
        let mut prob = 0.0;
        for (i, &state_prob) in anc_probs.iter().enumerate() {
            if state_prob == 0.0 {
                continue;
            }
            let state_i = i as StateCode;
            let focal_rv = ctx.hypothetical_rate_vector(
                branch,
                pos,
                self.domain_id,
                &[(self.domain_id, state_i)],
            )?;
            let rate = ctx.rate(focal_rv.rates[state_j as usize]);
            let focal = if state_i != state_j {
                substitution_prob(rate, t_b, ctx.u)
            } else {
                no_substitution_prob(rate, t_b, ctx.u)
            };
            let alt = self.alt_domain_prob(ctx, branch, state_i, pos)?;
            prob += state_prob * focal * alt;
        }
        Ok(prob)
    }

    /// Likelihood contribution of the recorded events of every non-focal,
    /// non-static domain on `branch` at `pos`, under a candidate focal
    /// state for the ancestral node.
    fn alt_domain_prob(
        &self,
        ctx: &SamplerContext<'_>,
        branch: &BranchSegment,
        focal_anc_state: StateCode,
        pos: usize,
    ) -> Result<f64> {
        let t_b = branch.length;
        let mut alt = 1.0;
        for domain in 0..ctx.is_static.len() {
            if domain == self.domain_id || ctx.is_static[domain] {
                continue;
            }
            let sub = branch.record(domain, pos);
            if sub.is_gap() {
                continue;
            }
            let rv = ctx.hypothetical_rate_vector(
                branch,
                pos,
                domain,
                &[(domain, sub.anc), (self.domain_id, focal_anc_state)],
            )?;
            alt *= if sub.occurred && sub.anc != sub.dec {
                substitution_prob(ctx.rate(rv.rates[sub.dec as usize]), t_b, ctx.u)
            } else {
                no_substitution_prob(ctx.rate(rv.rates[sub.anc as usize]), t_b, ctx.u)
            };
        }
        Ok(alt)
    }

    /// Compute the (unnormalised) marginal distribution for `node` at
    /// `pos` from the given neighbours. A zero factor zeroes the candidate
    /// state and moves on.
    fn compute_marginal_row(
        &self,
        ctx: &SamplerContext<'_>,
        node: NodeId,
        pos: usize,
        left: Option<NodeId>,
        right: Option<NodeId>,
        up: Option<NodeId>,
    ) -> Result<Vec<f64>> {
        let n_states = self.domain.n_states();
        let tree = ctx.tree;
        let mut row = vec![0.0; n_states];
        'states: for i in 0..n_states {
            let state_i = i as StateCode;
            let mut total = 1.0;

            // Up contribution first: most likely to be zero.
            if let Some(up_node) = up {
                let up_name = &tree.node(up_node).name;
                if !self.gaps[up_name][pos] {
                    let branch = tree.branch(up_branch_of(tree, node)?);
                    let up_prob =
                        self.state_prob_given_anc_branch(ctx, branch, state_i, up_name, pos)?;
                    if up_prob == 0.0 {
                        continue 'states;
                    }
                    total *= up_prob;
                }
            }

            for child in [left, right].into_iter().flatten() {
                let child_name = &tree.node(child).name;
                if self.gaps[child_name][pos] {
                    continue;
                }
                let branch = tree.branch(up_branch_of(tree, child)?);
                let focal_rv = ctx.hypothetical_rate_vector(
                    branch,
                    pos,
                    self.domain_id,
                    &[(self.domain_id, state_i)],
                )?;
                let child_prob = self.state_prob_given_dec_branch(
                    ctx, branch, state_i, child_name, focal_rv, pos,
                )?;
                if child_prob == 0.0 {
                    continue 'states;
                }
                total *= child_prob;
            }
            row[i] = total;
        }
        Ok(row)
    }

    /// Marginals for an internal node using only information from below
    /// (the upward pass).
    fn find_state_probs_dec_only(
        &mut self,
        ctx: &SamplerContext<'_>,
        node: NodeId,
        positions: &[usize],
    ) -> Result<()> {
        let name = ctx.tree.node(node).name.clone();
        let gaps = self.gaps[&name].clone();
        let left = ctx.tree.child_left(node);
        let right = ctx.tree.child_right(node);
        for &pos in positions {
            if gaps[pos] {
                continue;
            }
            let row = self.compute_marginal_row(ctx, node, pos, left, right, None)?;
            self.marginal_mut(&name)?.row_mut(pos).copy_from_slice(&row);
            self.normalize_row(&name, pos)?;
        }
        Ok(())
    }

    /// Marginals for an internal node using all three neighbours.
    fn find_state_probs_all(
        &mut self,
        ctx: &SamplerContext<'_>,
        node: NodeId,
        positions: &[usize],
    ) -> Result<()> {
        let name = ctx.tree.node(node).name.clone();
        let gaps = self.gaps[&name].clone();
        let left = ctx.tree.child_left(node);
        let right = ctx.tree.child_right(node);
        let up = ctx.tree.parent(node);
        for &pos in positions {
            if gaps[pos] {
                continue;
            }
            let row = self.compute_marginal_row(ctx, node, pos, left, right, up)?;
            self.marginal_mut(&name)?.row_mut(pos).copy_from_slice(&row);
            self.normalize_row(&name, pos)?;
        }
        Ok(())
    }

    /// Fold the contribution from the parent into an existing
    /// below-marginal (the downward pass).
    fn update_state_probs(
        &mut self,
        ctx: &SamplerContext<'_>,
        node: NodeId,
        pos: usize,
        up_node: NodeId,
    ) -> Result<()> {
        let name = ctx.tree.node(node).name.clone();
        let up_name = &ctx.tree.node(up_node).name;
        let branch = ctx.tree.branch(up_branch_of(ctx.tree, node)?);
        let current = self.marginals[&name].row(pos).to_vec();
        let mut updated = current.clone();
        for (j, &p) in current.iter().enumerate() {
            if p != 0.0 {
                updated[j] = p
                    * self.state_prob_given_anc_branch(
                        ctx,
                        branch,
                        j as StateCode,
                        up_name,
                        pos,
                    )?;
            }
        }
        self.marginal_mut(&name)?.row_mut(pos).copy_from_slice(&updated);
        Ok(())
    }

    /// Tip-only shortcut for the third recursion: prior times the
    /// contribution from the parent.
    fn fast_update_state_probs_tip(
        &mut self,
        ctx: &SamplerContext<'_>,
        node: NodeId,
        pos: usize,
        up_node: NodeId,
    ) -> Result<()> {
        let name = ctx.tree.node(node).name.clone();
        let up_name = &ctx.tree.node(up_node).name;
        let branch = ctx.tree.branch(up_branch_of(ctx.tree, node)?);
        let base = self.priors[&name].row(pos).to_vec();
        let mut updated = vec![0.0; base.len()];
        for (j, &p) in base.iter().enumerate() {
            if p != 0.0 {
                updated[j] = p
                    * self.state_prob_given_anc_branch(
                        ctx,
                        branch,
                        j as StateCode,
                        up_name,
                        pos,
                    )?;
            }
        }
        self.marginal_mut(&name)?.row_mut(pos).copy_from_slice(&updated);
        Ok(())
    }

    // --- drawing states ---

    /// Draw one state from the marginal by inverse CDF and collapse the
    /// marginal to one-hot at the drawn state. When rounding leaves the
    /// accumulated mass below the draw, the last non-zero state is taken.
    fn pick_state_from_probabilities(
        &mut self,
        rng: &mut Xorshift64,
        name: &str,
        pos: usize,
    ) -> Result<StateCode> {
        let row = self.marginal_mut(name)?.row_mut(pos);
        let r = rng.next_f64();
        let mut acc = 0.0;
        let mut selected: Option<usize> = None;
        let mut last_nonzero: Option<usize> = None;
        for (i, &p) in row.iter().enumerate() {
            if p > 0.0 {
                last_nonzero = Some(i);
            }
            acc += p;
            if selected.is_none() && r < acc {
                selected = Some(i);
            }
        }
        let chosen = selected.or(last_nonzero).ok_or_else(|| {
            VelellaError::Numeric(format!(
                "unable to select a state for \"{name}\" at position {pos}"
            ))
        })?;
        for (i, p) in row.iter_mut().enumerate() {
            *p = if i == chosen { 1.0 } else { 0.0 };
        }
        Ok(chosen as StateCode)
    }

    /// Store drawn states for every non-gap scheduled position of a node.
    fn pick_states_for_node(
        &mut self,
        rng: &mut Xorshift64,
        name: &str,
        positions: &[usize],
    ) -> Result<()> {
        let gaps = self.gaps[name].clone();
        for &pos in positions {
            let state = if gaps[pos] {
                GAP
            } else {
                self.pick_state_from_probabilities(rng, name, pos)?
            };
            self.sequence_mut(name)?[pos] = state;
        }
        Ok(())
    }

    // --- the recursions ---

    /// Upward pass: establish the message from below at every node.
    pub fn reverse_recursion(
        &mut self,
        ctx: &SamplerContext<'_>,
        positions: &[usize],
    ) -> Result<()> {
        for &node in ctx.tree.nodes() {
            if ctx.tree.node(node).is_tip() {
                // States at tips can be uncertain; start from the prior.
                let name = ctx.tree.node(node).name.clone();
                self.reset_to_base(&name, positions)?;
            } else {
                self.find_state_probs_dec_only(ctx, node, positions)?;
            }
        }
        Ok(())
    }

    /// Downward pass: fold in each parent's message, making every marginal
    /// the full per-site posterior. The root is skipped.
    pub fn downward_pass(&mut self, ctx: &SamplerContext<'_>, positions: &[usize]) -> Result<()> {
        for &node in ctx.tree.nodes().iter().rev() {
            let Some(up_node) = ctx.tree.parent(node) else {
                continue;
            };
            let gaps = self.gaps[&ctx.tree.node(node).name].clone();
            for &pos in positions {
                if gaps[pos] {
                    continue;
                }
                self.update_state_probs(ctx, node, pos, up_node)?;
                self.normalize_row(&ctx.tree.node(node).name.clone(), pos)?;
            }
        }
        Ok(())
    }

    /// Two-recursion Gibbs sampler: upward pass, then sample each node in
    /// pre-order from its updated marginal.
    pub fn sample_with_double_recursion(
        &mut self,
        ctx: &SamplerContext<'_>,
        rng: &mut Xorshift64,
        positions: &[usize],
    ) -> Result<()> {
        self.reverse_recursion(ctx, positions)?;
        for &node in ctx.tree.nodes().iter().rev() {
            let name = ctx.tree.node(node).name.clone();
            let up_node = ctx.tree.parent(node);
            if let Some(up_node) = up_node {
                let gaps = self.gaps[&name].clone();
                for &pos in positions {
                    if gaps[pos] {
                        continue;
                    }
                    self.update_state_probs(ctx, node, pos, up_node)?;
                    self.normalize_row(&name, pos)?;
                }
            }
            self.pick_states_for_node(rng, &name, positions)?;
        }
        Ok(())
    }

    /// Three-recursion Gibbs sampler: upward and downward passes, then an
    /// outward resampling walk from a random start node.
    pub fn sample_with_triple_recursion(
        &mut self,
        ctx: &SamplerContext<'_>,
        rng: &mut Xorshift64,
        positions: &[usize],
    ) -> Result<()> {
        self.reverse_recursion(ctx, positions)?;
        self.downward_pass(ctx, positions)?;
        let path = ctx.tree.recursion_path(ctx.tree.rand_node(rng));
        self.reconstruct_expand(ctx, rng, &path, positions)
    }

    /// Third recursion: revisit nodes outward from the start, recomputing
    /// each marginal against now-sampled neighbours before drawing.
    fn reconstruct_expand(
        &mut self,
        ctx: &SamplerContext<'_>,
        rng: &mut Xorshift64,
        path: &[NodeId],
        positions: &[usize],
    ) -> Result<()> {
        for &node in path {
            let name = ctx.tree.node(node).name.clone();
            if ctx.tree.node(node).is_tip() {
                if let Some(up_node) = ctx.tree.parent(node) {
                    let gaps = self.gaps[&name].clone();
                    for &pos in positions {
                        if gaps[pos] {
                            continue;
                        }
                        self.fast_update_state_probs_tip(ctx, node, pos, up_node)?;
                        self.normalize_row(&name, pos)?;
                    }
                } else {
                    // Single-node tree: the prior is the posterior.
                    self.reset_to_base(&name, positions)?;
                }
            } else {
                self.find_state_probs_all(ctx, node, positions)?;
            }
            self.pick_states_for_node(rng, &name, positions)?;
        }
        Ok(())
    }
}

impl Summarizable for SequenceAlignment {
    fn summary(&self) -> String {
        format!(
            "SequenceAlignment[{}]: {} sequences x {} columns ({})",
            self.domain.name(),
            self.sequences.len(),
            self.n_columns,
            match self.tag {
                AlignmentTag::Dynamic => "dynamic",
                AlignmentTag::SiteStatic => "site-static",
            }
        )
    }
}

/// The up-branch of a node; a missing one is a `Graph` error (the caller
/// established the node is not the root).
fn up_branch_of(tree: &Tree, node: NodeId) -> Result<crate::tree::BranchId> {
    tree.node(node).up.ok_or_else(|| {
        VelellaError::Graph(format!(
            "node \"{}\" has no up branch",
            tree.node(node).name
        ))
    })
}

/// The most frequent state in a clade multiset; equal counts prefer the
/// parent's state when one is given.
fn pick_most_frequent_state(clade_states: &[StateCode], above: StateCode) -> StateCode {
    let mut counts: BTreeMap<StateCode, usize> = BTreeMap::new();
    for &s in clade_states {
        *counts.entry(s).or_insert(0) += 1;
    }
    let mut most_frequent = 0;
    let mut highest = 0;
    for (&state, &count) in &counts {
        if count > highest || (count == highest && state == above && above != GAP) {
            most_frequent = state;
            highest = count;
        }
    }
    most_frequent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::StateDomain;
    use crate::tree::{RawTree, SplitPolicy};

    fn two_state_domain() -> StateDomain {
        StateDomain::new("toy", &["A", "B"]).unwrap()
    }

    fn empty_ctx<'a>(
        tree: &'a Tree,
        store: &'a RateVectorSet,
        params: &'a ParameterGraph,
        is_static: &'a [bool],
    ) -> SamplerContext<'a> {
        SamplerContext {
            tree,
            store,
            params,
            u: 0.2,
            is_static,
        }
    }

    #[test]
    fn substitution_prob_matches_formula() {
        let p = substitution_prob(0.1, 1.0, 0.2);
        assert!((p - 0.1 / 1.2).abs() < 1e-12);
    }

    #[test]
    fn no_substitution_prob_matches_formula() {
        // p_virt = 1 - 1/1.1, D = 1/1.2
        let p = no_substitution_prob(0.1, 1.0, 0.2);
        let p_virt = 1.0 - 1.0 / 1.1;
        let expected = p_virt * 0.1 / 1.2 + (1.0 - p_virt) / 1.2;
        assert!((p - expected).abs() < 1e-12);
    }

    #[test]
    fn event_and_no_event_probabilities_complete() {
        // Jump-chain completeness: all event targets (virtual slot
        // included) plus the no-event weight sum to one when the total
        // rate equals u.
        let rates = [0.05, 0.05, 0.05, 0.15];
        let u: f64 = rates.iter().sum();
        for &t in &[0.01, 0.5, 1.0, 10.0] {
            let events: f64 = rates.iter().map(|&r| substitution_prob(r, t, u)).sum();
            let no_event = 1.0 / (1.0 + u * t);
            assert!((events + no_event - 1.0).abs() < 1e-12, "t = {t}");
        }
    }

    #[test]
    fn priors_load_frequencies() {
        let mut raw = RawMsa::from_strings(&[("x", "AB")]);
        // Make position 0 uncertain: A 0.7 / B 0.3.
        raw.seqs.get_mut("x").unwrap()[0] = vec![
            StateFreq {
                state: "A".into(),
                freq: 0.7,
            },
            StateFreq {
                state: "B".into(),
                freq: 0.3,
            },
        ];
        let aln = SequenceAlignment::dynamic(0, two_state_domain(), &raw).unwrap();
        // Highest-frequency state becomes the working sequence.
        assert_eq!(aln.sequence("x").unwrap(), &[0, 1]);
        let prior = &aln.priors["x"];
        assert!((prior.row(0)[0] - 0.7).abs() < 1e-12);
        assert!((prior.row(0)[1] - 0.3).abs() < 1e-12);
        assert!((prior.row(1)[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn gap_requires_full_frequency() {
        let mut raw = RawMsa::from_strings(&[("x", "A-")]);
        raw.seqs.get_mut("x").unwrap()[1] = vec![StateFreq {
            state: "-".into(),
            freq: 0.5,
        }];
        assert!(matches!(
            SequenceAlignment::dynamic(0, two_state_domain(), &raw),
            Err(VelellaError::Schema(_))
        ));
    }

    #[test]
    fn unknown_symbol_is_schema_error() {
        let raw = RawMsa::from_strings(&[("x", "AZ")]);
        assert!(matches!(
            SequenceAlignment::dynamic(0, two_state_domain(), &raw),
            Err(VelellaError::Schema(_))
        ));
    }

    #[test]
    fn ragged_alignment_rejected() {
        let raw = RawMsa::from_strings(&[("x", "AA"), ("y", "A")]);
        assert!(SequenceAlignment::dynamic(0, two_state_domain(), &raw).is_err());
    }

    #[test]
    fn missing_tip_sequence_is_graph_error() {
        let raw = RawMsa::from_strings(&[("a", "AA")]);
        let mut aln = SequenceAlignment::dynamic(0, two_state_domain(), &raw).unwrap();
        let tree = Tree::build(
            &RawTree::node(
                "root",
                0.0,
                vec![RawTree::leaf("a", 1.0), RawTree::leaf("b", 1.0)],
            ),
            10.0,
            SplitPolicy::Uniform,
        )
        .unwrap();
        assert!(matches!(
            aln.sync_with_tree(&tree),
            Err(VelellaError::Graph(_))
        ));
    }

    #[test]
    fn gap_propagation_through_tree() {
        // ((a:1,b:1)ab:1,c:1)root with a = "A-": one gapped child leaves
        // the parent ungapped.
        let raw = RawMsa::from_strings(&[("a", "A-"), ("b", "AA"), ("c", "AA")]);
        let mut aln = SequenceAlignment::dynamic(0, two_state_domain(), &raw).unwrap();
        let tree = Tree::build(
            &RawTree::node(
                "root",
                0.0,
                vec![
                    RawTree::node(
                        "ab",
                        1.0,
                        vec![RawTree::leaf("a", 1.0), RawTree::leaf("b", 1.0)],
                    ),
                    RawTree::leaf("c", 1.0),
                ],
            ),
            10.0,
            SplitPolicy::Uniform,
        )
        .unwrap();
        aln.sync_with_tree(&tree).unwrap();
        assert_eq!(aln.gap_mask("ab").unwrap(), &[false, false]);
        assert_eq!(aln.gap_mask("root").unwrap(), &[false, false]);
    }

    #[test]
    fn both_children_gapped_propagates_gap() {
        let raw = RawMsa::from_strings(&[("a", "A-"), ("b", "A-"), ("c", "AA")]);
        let mut aln = SequenceAlignment::dynamic(0, two_state_domain(), &raw).unwrap();
        let tree = Tree::build(
            &RawTree::node(
                "root",
                0.0,
                vec![
                    RawTree::node(
                        "ab",
                        1.0,
                        vec![RawTree::leaf("a", 1.0), RawTree::leaf("b", 1.0)],
                    ),
                    RawTree::leaf("c", 1.0),
                ],
            ),
            10.0,
            SplitPolicy::Uniform,
        )
        .unwrap();
        aln.sync_with_tree(&tree).unwrap();
        assert_eq!(aln.gap_mask("ab").unwrap(), &[false, true]);
        assert_eq!(aln.gap_mask("root").unwrap(), &[false, false]);
    }

    #[test]
    fn site_static_rejects_varying_columns() {
        let raw = RawMsa::from_strings(&[("x", "AA"), ("y", "AB")]);
        assert!(matches!(
            SequenceAlignment::site_static(0, two_state_domain(), &raw),
            Err(VelellaError::Schema(_))
        ));
    }

    #[test]
    fn site_static_accepts_constant_columns() {
        let raw = RawMsa::from_strings(&[("x", "AA"), ("y", "AA")]);
        let aln = SequenceAlignment::site_static(0, two_state_domain(), &raw).unwrap();
        assert_eq!(aln.tag(), AlignmentTag::SiteStatic);
    }

    #[test]
    fn site_static_rejects_uncertain_priors() {
        let mut raw = RawMsa::from_strings(&[("x", "AA"), ("y", "AA")]);
        raw.seqs.get_mut("x").unwrap()[0] = vec![
            StateFreq {
                state: "A".into(),
                freq: 0.5,
            },
            StateFreq {
                state: "B".into(),
                freq: 0.5,
            },
        ];
        assert!(matches!(
            SequenceAlignment::site_static(0, two_state_domain(), &raw),
            Err(VelellaError::Schema(_))
        ));
    }

    #[test]
    fn parsimony_seeds_clade_majorities() {
        // ((t1,t2)L,(t3,t4)R)root with tip states (A,A,B,B).
        let raw = RawMsa::from_strings(&[("t1", "A"), ("t2", "A"), ("t3", "B"), ("t4", "B")]);
        let mut aln = SequenceAlignment::dynamic(0, two_state_domain(), &raw).unwrap();
        let tree = Tree::build(
            &RawTree::node(
                "root",
                0.0,
                vec![
                    RawTree::node(
                        "L",
                        1.0,
                        vec![RawTree::leaf("t1", 1.0), RawTree::leaf("t2", 1.0)],
                    ),
                    RawTree::node(
                        "R",
                        1.0,
                        vec![RawTree::leaf("t3", 1.0), RawTree::leaf("t4", 1.0)],
                    ),
                ],
            ),
            10.0,
            SplitPolicy::Uniform,
        )
        .unwrap();
        aln.sync_with_tree(&tree).unwrap();
        assert_eq!(aln.sequence("L").unwrap(), &[0]); // A
        assert_eq!(aln.sequence("R").unwrap(), &[1]); // B
        assert_eq!(aln.sequence("root").unwrap(), &[0]); // deterministic tie-break
    }

    #[test]
    fn parsimony_tie_breaks_toward_parent() {
        assert_eq!(pick_most_frequent_state(&[0, 1], 1), 1);
        assert_eq!(pick_most_frequent_state(&[0, 1], GAP), 0);
        assert_eq!(pick_most_frequent_state(&[1, 1, 0], 0), 1);
    }

    #[test]
    fn single_tip_upward_pass_reproduces_prior() {
        let mut raw = RawMsa::from_strings(&[("only", "A")]);
        raw.seqs.get_mut("only").unwrap()[0] = vec![
            StateFreq {
                state: "A".into(),
                freq: 0.6,
            },
            StateFreq {
                state: "B".into(),
                freq: 0.4,
            },
        ];
        let mut aln = SequenceAlignment::dynamic(0, two_state_domain(), &raw).unwrap();
        let tree = Tree::build(&RawTree::leaf("only", 0.0), 10.0, SplitPolicy::Uniform).unwrap();
        aln.sync_with_tree(&tree).unwrap();

        let store = RateVectorSet::new(1);
        let params = ParameterGraph::new();
        let is_static = [false];
        let ctx = empty_ctx(&tree, &store, &params, &is_static);
        aln.reverse_recursion(&ctx, &[0]).unwrap();
        aln.downward_pass(&ctx, &[0]).unwrap();
        let row = aln.marginal_row("only", 0).unwrap();
        assert!((row[0] - 0.6).abs() < 1e-12);
        assert!((row[1] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn pick_state_collapses_to_one_hot() {
        let raw = RawMsa::from_strings(&[("x", "A")]);
        let mut aln = SequenceAlignment::dynamic(0, two_state_domain(), &raw).unwrap();
        let tree = Tree::build(&RawTree::leaf("x", 0.0), 10.0, SplitPolicy::Uniform).unwrap();
        aln.sync_with_tree(&tree).unwrap();
        aln.marginals.get_mut("x").unwrap().row_mut(0).copy_from_slice(&[0.3, 0.7]);
        let mut rng = Xorshift64::new(42);
        let state = aln.pick_state_from_probabilities(&mut rng, "x", 0).unwrap();
        let row = aln.marginal_row("x", 0).unwrap();
        assert_eq!(row[state as usize], 1.0);
        assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-15);
    }

    #[test]
    fn pick_state_rounding_falls_back_to_last_nonzero() {
        let raw = RawMsa::from_strings(&[("x", "A")]);
        let mut aln = SequenceAlignment::dynamic(0, two_state_domain(), &raw).unwrap();
        let tree = Tree::build(&RawTree::leaf("x", 0.0), 10.0, SplitPolicy::Uniform).unwrap();
        aln.sync_with_tree(&tree).unwrap();
        // Mass deliberately short of 1: draws beyond it take state 0.
        aln.marginals.get_mut("x").unwrap().row_mut(0).copy_from_slice(&[1e-12, 0.0]);
        let mut rng = Xorshift64::new(1);
        let state = aln.pick_state_from_probabilities(&mut rng, "x", 0).unwrap();
        assert_eq!(state, 0);
    }

    #[test]
    fn pick_state_all_zero_is_numeric_error() {
        let raw = RawMsa::from_strings(&[("x", "A")]);
        let mut aln = SequenceAlignment::dynamic(0, two_state_domain(), &raw).unwrap();
        let tree = Tree::build(&RawTree::leaf("x", 0.0), 10.0, SplitPolicy::Uniform).unwrap();
        aln.sync_with_tree(&tree).unwrap();
        aln.marginals.get_mut("x").unwrap().row_mut(0).copy_from_slice(&[0.0, 0.0]);
        let mut rng = Xorshift64::new(1);
        assert!(matches!(
            aln.pick_state_from_probabilities(&mut rng, "x", 0),
            Err(VelellaError::Numeric(_))
        ));
    }

    #[test]
    fn validate_catches_gap_mismatch() {
        let tree = Tree::build(
            &RawTree::node(
                "root",
                0.0,
                vec![RawTree::leaf("a", 1.0), RawTree::leaf("b", 1.0)],
            ),
            10.0,
            SplitPolicy::Uniform,
        )
        .unwrap();
        let raw_a = RawMsa::from_strings(&[("a", "A-"), ("b", "AA")]);
        let raw_b = RawMsa::from_strings(&[("a", "AA"), ("b", "AA")]);
        let mut aln_a = SequenceAlignment::dynamic(0, two_state_domain(), &raw_a).unwrap();
        let mut aln_b = SequenceAlignment::dynamic(1, two_state_domain(), &raw_b).unwrap();
        aln_a.sync_with_tree(&tree).unwrap();
        aln_b.sync_with_tree(&tree).unwrap();
        assert!(matches!(
            aln_a.validate(&tree, &[&aln_b]),
            Err(VelellaError::Schema(_))
        ));
    }

    #[test]
    fn validate_accepts_matching_masks() {
        let tree = Tree::build(
            &RawTree::node(
                "root",
                0.0,
                vec![RawTree::leaf("a", 1.0), RawTree::leaf("b", 1.0)],
            ),
            10.0,
            SplitPolicy::Uniform,
        )
        .unwrap();
        let raw = RawMsa::from_strings(&[("a", "A-"), ("b", "AA")]);
        let mut aln_a = SequenceAlignment::dynamic(0, two_state_domain(), &raw).unwrap();
        let mut aln_b = SequenceAlignment::dynamic(1, two_state_domain(), &raw).unwrap();
        aln_a.sync_with_tree(&tree).unwrap();
        aln_b.sync_with_tree(&tree).unwrap();
        aln_a.validate(&tree, &[&aln_b]).unwrap();
    }

    mod kernel_laws {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn completeness_holds_for_any_split(
                r1 in 1e-6f64..0.5,
                r2 in 1e-6f64..0.5,
                r3 in 1e-6f64..0.5,
                t in 1e-3f64..100.0,
            ) {
                // u set to the total leaving rate: events + no-event = 1.
                let virt = 0.1;
                let u = r1 + r2 + r3 + virt;
                prop_assume!(u * t < 1e6);
                let events: f64 = [r1, r2, r3, virt]
                    .iter()
                    .map(|&r| substitution_prob(r, t, u))
                    .sum();
                let no_event = 1.0 / (1.0 + u * t);
                prop_assert!((events + no_event - 1.0).abs() < 1e-9);
            }

            #[test]
            fn kernels_stay_in_unit_interval(
                r in 0.0f64..1.0,
                t in 0.0f64..100.0,
                extra in 0.0f64..1.0,
            ) {
                let u = r + extra;
                let ps = substitution_prob(r, t, u);
                let pn = no_substitution_prob(r, t, u);
                prop_assert!((0.0..=1.0).contains(&ps));
                prop_assert!((0.0..=1.0).contains(&pn));
            }
        }
    }
}

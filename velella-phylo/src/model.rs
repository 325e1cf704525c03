//! The substitution model: every component wired together.
//!
//! [`Model`] owns the domain registry, the parameter graph, the
//! rate-vector store, the tree, and one alignment per domain — all
//! cross-references between them are ids or names, so ownership stays
//! acyclic. It provides the likelihood machinery the MCMC driver drives:
//! a full recompute over all branch records, a delta pass that touches
//! only the positions bound to changed rate vectors, and the Gibbs tree
//! step that resamples ancestral sequences and refreshes the per-segment
//! substitution records.

use std::collections::BTreeSet;

use velella_core::{Result, VelellaError, Xorshift64};

use crate::alignment::{substitution_prob, SamplerContext, SequenceAlignment};
use crate::mcmc::EngineOptions;
use crate::params::{ParameterGraph, Proposal, ValueId};
use crate::rate_vector::{RateVectorSet, RvUse};
use crate::states::{DomainRegistry, StateCode, GAP};
use crate::tree::{RawTree, SplitPolicy, Substitution, Tree};

/// Cyclic window over alignment columns: each tree-sample step visits the
/// next `n_sample` positions, wrapping at the end.
#[derive(Debug, Clone)]
pub(crate) struct PositionSchedule {
    loc: usize,
    n_sample: usize,
    n_cols: usize,
}

impl PositionSchedule {
    fn new(n_sample: usize, n_cols: usize, rng: &mut Xorshift64) -> Result<Self> {
        if n_sample < 1 {
            return Err(VelellaError::Config(
                "MCMC.position_sample_count must be greater than 0".into(),
            ));
        }
        if n_sample > n_cols {
            return Err(VelellaError::Config(format!(
                "cannot sample {n_sample} positions from an alignment with {n_cols} columns; \
                 maximum value of MCMC.position_sample_count is {n_cols}"
            )));
        }
        let loc = if n_sample == n_cols {
            0
        } else {
            rng.index(n_cols)
        };
        Ok(Self {
            loc,
            n_sample,
            n_cols,
        })
    }

    fn next(&mut self) -> Vec<usize> {
        let mut positions = Vec::with_capacity(self.n_sample);
        while positions.len() < self.n_sample {
            positions.push(self.loc);
            self.loc = (self.loc + 1) % self.n_cols;
        }
        positions
    }
}

/// The assembled model.
pub struct Model {
    registry: DomainRegistry,
    pub(crate) params: ParameterGraph,
    store: RateVectorSet,
    tree: Tree,
    alignments: Vec<SequenceAlignment>,
    /// Per domain: true when the alignment is SITE_STATIC.
    is_static: Vec<bool>,
    /// One schedule per dynamic alignment, `None` for static domains.
    schedules: Vec<Option<PositionSchedule>>,
    u: f64,
    triple_recursion: bool,
    n_columns: usize,
    /// Cached ln-terms, one per (branch, domain, column).
    terms: Vec<f64>,
    lnl: f64,
    /// `(index, previous term)` pairs restorable on rejection.
    pending_terms: Vec<(usize, f64)>,
}

impl Model {
    /// Wire every component together and prepare for sampling: build the
    /// tree, attach the alignments, validate gap masks across domains,
    /// seed the branch records, and compute the starting likelihood.
    pub fn assemble(
        registry: DomainRegistry,
        params: ParameterGraph,
        mut store: RateVectorSet,
        mut alignments: Vec<SequenceAlignment>,
        raw_tree: &RawTree,
        options: &EngineOptions,
        rng: &mut Xorshift64,
    ) -> Result<Self> {
        options.validate()?;
        let n_domains = registry.len();
        if alignments.len() != n_domains {
            return Err(VelellaError::Schema(format!(
                "{} alignments supplied for {} registered domains",
                alignments.len(),
                n_domains
            )));
        }
        for (i, aln) in alignments.iter().enumerate() {
            if aln.domain_id() != i {
                return Err(VelellaError::Schema(format!(
                    "alignment \"{}\" is out of registration order",
                    aln.domain().name()
                )));
            }
        }
        let n_columns = alignments[0].n_cols();
        for aln in &alignments {
            if aln.n_cols() != n_columns {
                return Err(VelellaError::Schema(format!(
                    "alignment \"{}\" has {} columns, expected {n_columns}",
                    aln.domain().name(),
                    aln.n_cols()
                )));
            }
        }

        let mut tree = Tree::build(raw_tree, options.max_segment_length, SplitPolicy::Uniform)?;
        tree.allocate_records(n_domains, n_columns);

        for aln in &mut alignments {
            aln.sync_with_tree(&tree)?;
        }
        for (i, aln) in alignments.iter().enumerate() {
            let others: Vec<&SequenceAlignment> = alignments
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != i)
                .map(|(_, a)| a)
                .collect();
            aln.validate(&tree, &others)?;
        }

        let is_static: Vec<bool> = alignments.iter().map(|a| !a.is_dynamic()).collect();
        let mut schedules = Vec::with_capacity(n_domains);
        for aln in &alignments {
            schedules.push(if aln.is_dynamic() {
                Some(PositionSchedule::new(
                    options.position_sample_count,
                    n_columns,
                    rng,
                )?)
            } else {
                None
            });
        }

        store.organize();

        let n_terms = tree.n_branches() * n_domains * n_columns;
        let mut model = Self {
            registry,
            params,
            store,
            tree,
            alignments,
            is_static,
            schedules,
            u: options.uniformization_constant,
            triple_recursion: options.triple_recursion,
            n_columns,
            terms: vec![0.0; n_terms],
            lnl: 0.0,
            pending_terms: Vec::new(),
        };
        model.update_branch_records(rng)?;
        model.log_likelihood()?;
        log::info!(
            "model assembled: {} domains, {} columns, {} branch segments, lnL {:.6}",
            model.registry.len(),
            n_columns,
            model.tree.n_branches(),
            model.lnl
        );
        Ok(model)
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn store(&self) -> &RateVectorSet {
        &self.store
    }

    pub fn params(&self) -> &ParameterGraph {
        &self.params
    }

    pub fn alignments(&self) -> &[SequenceAlignment] {
        &self.alignments
    }

    pub fn alignment(&self, domain: usize) -> &SequenceAlignment {
        &self.alignments[domain]
    }

    pub fn n_cols(&self) -> usize {
        self.n_columns
    }

    pub fn uniformization_constant(&self) -> f64 {
        self.u
    }

    /// The current cached log-likelihood.
    pub fn current_log_likelihood(&self) -> f64 {
        self.lnl
    }

    fn term_index(&self, branch: usize, domain: usize, pos: usize) -> usize {
        (branch * self.is_static.len() + domain) * self.n_columns + pos
    }

    /// Recompute the full log-likelihood from the branch records,
    /// refreshing the term cache.
    pub fn log_likelihood(&mut self) -> Result<f64> {
        let mut total = 0.0;
        for branch in 0..self.tree.n_branches() {
            for domain in 0..self.is_static.len() {
                for pos in 0..self.n_columns {
                    let term = self.compute_term(branch, domain, pos)?;
                    let idx = self.term_index(branch, domain, pos);
                    self.terms[idx] = term;
                    total += term;
                }
            }
        }
        self.lnl = total;
        Ok(total)
    }

    /// The ln-probability of the recorded event at one branch position.
    ///
    /// An occurred event (real or virtual) contributes
    /// `ln(r * t / (1 + u * t))`; no event contributes
    /// `ln(1 / (1 + u * t))`; gapped positions and static domains
    /// contribute nothing.
    fn compute_term(&self, branch: usize, domain: usize, pos: usize) -> Result<f64> {
        if self.is_static[domain] {
            return Ok(0.0);
        }
        let segment = self.tree.branch(branch);
        let rec = segment.record(domain, pos);
        if rec.is_gap() {
            return Ok(0.0);
        }
        if !rec.occurred {
            return Ok(-(1.0 + self.u * segment.length).ln());
        }
        let rv = rec.rate_vector.ok_or_else(|| {
            VelellaError::Graph(format!(
                "substitution record at branch {branch} position {pos} has no rate vector"
            ))
        })?;
        let rate = self.params.get(self.store.get(rv).rates[rec.dec as usize]);
        Ok(substitution_prob(rate, segment.length, self.u).ln())
    }

    /// Propose a move on the substitution-model parameters.
    ///
    /// A `Numeric` error means the proposal pushed a derived rate out of
    /// bounds; the graph has already rolled itself back and the driver
    /// should count a rejection.
    pub fn propose_parameter(&mut self, rng: &mut Xorshift64) -> Result<Proposal> {
        self.params.propose(rng)
    }

    /// Delta-likelihood after a parameter move: recompute only the cached
    /// terms bound to rate vectors hosting a changed value.
    pub fn update_likelihood(&mut self, changed: &[ValueId]) -> Result<f64> {
        self.pending_terms.clear();
        let mut seen = BTreeSet::new();
        let mut touched = Vec::new();
        for &vid in changed {
            for &rv in self.store.hosts(vid) {
                for &RvUse {
                    branch,
                    domain,
                    pos,
                } in self.store.usage(rv)
                {
                    let idx = self.term_index(branch, domain, pos);
                    if seen.insert(idx) {
                        touched.push((branch, domain, pos, idx));
                    }
                }
            }
        }
        for (branch, domain, pos, idx) in touched {
            let new = self.compute_term(branch, domain, pos)?;
            self.pending_terms.push((idx, self.terms[idx]));
            self.lnl += new - self.terms[idx];
            self.terms[idx] = new;
        }
        Ok(self.lnl)
    }

    /// Commit the outstanding parameter move.
    pub fn accept_parameter(&mut self) {
        self.params.accept();
        self.pending_terms.clear();
    }

    /// Roll back the outstanding parameter move and its likelihood terms.
    pub fn reject_parameter(&mut self) {
        self.params.reject();
        while let Some((idx, old)) = self.pending_terms.pop() {
            self.lnl += old - self.terms[idx];
            self.terms[idx] = old;
        }
    }

    /// One Gibbs tree step: resample ancestral states of every dynamic
    /// alignment over its scheduled positions, then refresh the branch
    /// records. The caller recomputes the likelihood from scratch.
    pub fn sample_tree(&mut self, rng: &mut Xorshift64) -> Result<()> {
        let Model {
            tree,
            store,
            params,
            alignments,
            schedules,
            is_static,
            u,
            triple_recursion,
            ..
        } = self;
        for (aln, schedule) in alignments.iter_mut().zip(schedules.iter_mut()) {
            let Some(schedule) = schedule.as_mut() else {
                continue;
            };
            let positions = schedule.next();
            let ctx = SamplerContext {
                tree: &*tree,
                store: &*store,
                params: &*params,
                u: *u,
                is_static: is_static.as_slice(),
            };
            if *triple_recursion {
                aln.sample_with_triple_recursion(&ctx, rng, &positions)?;
            } else {
                aln.sample_with_double_recursion(&ctx, rng, &positions)?;
            }
        }
        self.update_branch_records(rng)
    }

    /// Rebuild every segment's substitution records from the current
    /// sequences: real events where ancestor and descendant differ,
    /// virtual self-events drawn with the uniformized odds, and the rate
    /// vector binding keyed by the ancestral extended state.
    pub fn update_branch_records(&mut self, rng: &mut Xorshift64) -> Result<()> {
        let Model {
            tree,
            store,
            params,
            alignments,
            is_static,
            u,
            n_columns,
            ..
        } = self;
        let n_domains = alignments.len();
        store.clear_usage();
        let (nodes, branches) = tree.split_mut();
        for branch in branches.iter_mut() {
            let anc_name = &nodes[branch.ancestral].name;
            let dec_name = &nodes[branch.descendant].name;
            let anc_seqs = sequences_for(alignments, anc_name)?;
            let dec_seqs = sequences_for(alignments, dec_name)?;
            let t_b = branch.length;
            for pos in 0..*n_columns {
                let ex: Vec<StateCode> = anc_seqs.iter().map(|s| s[pos]).collect();
                for domain in 0..n_domains {
                    let dec = dec_seqs[domain][pos];
                    if dec == GAP {
                        branch.records[domain][pos] = Substitution::null();
                        branch.rates[domain][pos] = None;
                        continue;
                    }
                    let anc = ex[domain];
                    let rv = store.select(domain, &ex)?;
                    let occurred = if anc != dec {
                        true
                    } else if is_static[domain] {
                        false
                    } else {
                        let rate = params.get(store.get(rv).rates[anc as usize]);
                        virtual_event(rng, rate, t_b, *u)
                    };
                    branch.records[domain][pos] = Substitution {
                        occurred,
                        anc,
                        dec,
                        rate_vector: Some(rv),
                    };
                    branch.rates[domain][pos] = Some(rv);
                    store.push_usage(
                        rv,
                        RvUse {
                            branch: branch.id,
                            domain,
                            pos,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

fn sequences_for<'a>(
    alignments: &'a [SequenceAlignment],
    name: &str,
) -> Result<Vec<&'a [StateCode]>> {
    alignments
        .iter()
        .map(|a| {
            a.sequence(name).ok_or_else(|| {
                VelellaError::Graph(format!(
                    "alignment \"{}\" has no sequence for \"{name}\"",
                    a.domain().name()
                ))
            })
        })
        .collect()
}

/// Decide whether a self-transition carries a virtual event, with odds
/// `P_sub : P_nosub` from the uniformized jump process.
fn virtual_event(rng: &mut Xorshift64, rate: f64, t_b: f64, u: f64) -> bool {
    let no_sub = 1.0 / (1.0 + u * t_b);
    let sub = (rate * t_b) / (1.0 + u * t_b);
    let total = sub + no_sub;
    total > 0.0 && rng.next_f64() < sub / total
}

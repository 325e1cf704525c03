//! Phylogenetic MCMC over fixed topologies for the velella engine.
//!
//! Jointly infers ancestral sequences, substitution rates, and per-site
//! evolutionary histories on a rooted tree whose topology never changes.
//! Branch processes use the Rao-Teh uniformization approximation: each
//! edge is subdivided into segments and every per-site history is a
//! sequence of real and virtual jump events with constant total rate `u`.
//!
//! The pieces, leaves first:
//!
//! - [`states`] — symbol alphabets and their integer encodings
//! - [`params`] — the live parameter graph behind every rate cell
//! - [`rate_vector`] — rate vectors keyed by extended state
//! - [`tree`] — the segmented tree and its substitution records
//! - [`alignment`] — per-domain sequences, marginals, and the Gibbs
//!   recursion samplers
//! - [`model`] — everything wired together, with full and delta
//!   likelihood
//! - [`mcmc`] — the generation loop
//! - [`counts`], [`record`] — substitution tallies and sample output
//!
//! # Quick start
//!
//! Hosts register domains, build the parameter graph and rate vectors,
//! assemble a [`Model`] from raw inputs, and hand it to [`Mcmc`]:
//!
//! ```no_run
//! use velella_core::Xorshift64;
//! use velella_phylo::{
//!     record, DomainRegistry, EngineOptions, Mcmc, Model, ParameterGraph, RateVector,
//!     RateVectorSet, RawMsa, RawTree, SequenceAlignment, StateDomain,
//! };
//!
//! let options = EngineOptions::default();
//! let mut registry = DomainRegistry::new();
//! let domain = registry.register(StateDomain::nucleotides().unwrap()).unwrap();
//!
//! // One rate vector per ancestral state, each with a virtual slot.
//! let mut params = ParameterGraph::new();
//! let mut store = RateVectorSet::new(registry.len());
//! for anc in 0..4i8 {
//!     let virt = params.add_virtual_rate(&format!("rv{anc}-virtual"), 1.0);
//!     let rates: Vec<_> = (0..4i8)
//!         .map(|dec| {
//!             if dec == anc {
//!                 virt
//!             } else {
//!                 let off = params.add_random_walk(&format!("rv{anc}-{dec}"), 0.2, 0.05, 0.0, 1.0);
//!                 params.declare_rate_dependency(virt, off).unwrap();
//!                 off
//!             }
//!         })
//!         .collect();
//!     params.refresh(virt).unwrap();
//!     let id = store
//!         .add(RateVector::new(&format!("rv{anc}"), domain, anc, rates))
//!         .unwrap();
//!     store.bind(id, vec![anc]).unwrap();
//! }
//!
//! let msa = RawMsa::from_strings(&[("x", "ACGT"), ("y", "ACGA")]);
//! let aln = SequenceAlignment::dynamic(domain, StateDomain::nucleotides().unwrap(), &msa).unwrap();
//! let raw_tree = RawTree::node(
//!     "root",
//!     0.0,
//!     vec![RawTree::leaf("x", 0.3), RawTree::leaf("y", 0.4)],
//! );
//!
//! let mut rng = Xorshift64::new(options.seed);
//! let mut model = Model::assemble(
//!     registry, params, store, vec![aln], &raw_tree, &options, &mut rng,
//! )
//! .unwrap();
//! let mut recorder = record::in_memory(1);
//! let mut mcmc = Mcmc::initialize(&mut model, &mut recorder, &options).unwrap();
//! mcmc.run(&mut model, &mut recorder, &mut rng, &options).unwrap();
//! ```

pub mod alignment;
pub mod counts;
pub mod mcmc;
pub mod model;
pub mod params;
pub mod rate_vector;
pub mod record;
pub mod states;
pub mod tree;

pub use alignment::{
    no_substitution_prob, substitution_prob, AlignmentTag, FreqSequence, RawMsa, SamplerContext,
    SequenceAlignment, StateFreq,
};
pub use counts::{BranchTally, SubstitutionCounts};
pub use mcmc::{EngineOptions, Mcmc};
pub use model::Model;
pub use params::{ParameterGraph, Proposal, ValueId};
pub use rate_vector::{RateVector, RateVectorSet, RvId, RvUse};
pub use record::{DomainPaths, OutputPaths, Recorder};
pub use states::{DomainId, DomainRegistry, StateCode, StateDomain, GAP};
pub use tree::{BranchId, BranchSegment, NodeId, RawTree, SplitPolicy, Substitution, Tree, TreeNode};

//! The MCMC driver: generations, acceptance rules, and recording cadence.
//!
//! Every `tree_sample_frequency`-th iteration is a Gibbs tree step —
//! ancestral sequences are resampled, the likelihood is recomputed from
//! scratch, and the move is always accepted. Other iterations propose a
//! substitution-model parameter move, evaluate the likelihood delta, and
//! accept by Metropolis-Hastings (`ln u <= newLnL - lnL`) or
//! unconditionally for Gibbs-flagged proposals, rolling the parameters
//! back on rejection. A NaN likelihood aborts the run.

use std::io::Write;

use velella_core::{Result, VelellaError, Xorshift64};

use crate::counts::SubstitutionCounts;
use crate::model::Model;
use crate::record::Recorder;

/// The recognised engine options.
///
/// Loading these from a file or command line is the host's concern; the
/// engine validates and consumes the typed values.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineOptions {
    /// `MCMC.generations`
    pub generations: u64,
    /// `MCMC.output_frequency`
    pub output_frequency: u64,
    /// `MCMC.print_frequency`
    pub print_frequency: u64,
    /// `MCMC.tree_sample_frequency`
    pub tree_sample_frequency: u64,
    /// `MCMC.position_sample_count`
    pub position_sample_count: usize,
    /// `MCMC.triple_recursion`
    pub triple_recursion: bool,
    /// `TREE.max_segment_length`
    pub max_segment_length: f64,
    /// `MODEL.uniformization_constant`
    pub uniformization_constant: f64,
    /// `MCMC.seed`
    pub seed: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            generations: 10_000,
            output_frequency: 100,
            print_frequency: 100,
            tree_sample_frequency: 5,
            position_sample_count: 1,
            triple_recursion: true,
            max_segment_length: 1.0,
            uniformization_constant: 1.0,
            seed: 42,
        }
    }
}

impl EngineOptions {
    /// Check every option that does not need the alignment shape.
    pub fn validate(&self) -> Result<()> {
        if self.generations == 0 {
            return Err(VelellaError::Config(
                "MCMC.generations must be greater than 0".into(),
            ));
        }
        if self.output_frequency == 0 {
            return Err(VelellaError::Config(
                "MCMC.output_frequency must be greater than 0".into(),
            ));
        }
        if self.print_frequency == 0 {
            return Err(VelellaError::Config(
                "MCMC.print_frequency must be greater than 0".into(),
            ));
        }
        if self.tree_sample_frequency == 0 {
            return Err(VelellaError::Config(
                "MCMC.tree_sample_frequency must be greater than 0".into(),
            ));
        }
        if self.position_sample_count == 0 {
            return Err(VelellaError::Config(
                "MCMC.position_sample_count must be greater than 0".into(),
            ));
        }
        if self.max_segment_length <= 0.0 {
            return Err(VelellaError::Config(
                "TREE.max_segment_length must be greater than 0".into(),
            ));
        }
        if self.uniformization_constant <= 0.0 {
            return Err(VelellaError::Config(
                "MODEL.uniformization_constant must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Metropolis-Hastings acceptance: draw `v ~ Uniform(0,1)` and accept iff
/// `ln v <= newLnL - lnL`.
fn metropolis_accept(rng: &mut Xorshift64, new_lnl: f64, lnl: f64) -> bool {
    rng.next_f64().ln() <= new_lnl - lnl
}

/// The sampler driver.
pub struct Mcmc {
    gen: u64,
    lnl: f64,
    save_count: u64,
    /// Steps since the last tree sample.
    step_index: u64,
    counts: SubstitutionCounts,
}

impl Mcmc {
    /// Initialize against an assembled model: compute the starting
    /// likelihood, write the output headers, and record generation zero.
    pub fn initialize<W: Write>(
        model: &mut Model,
        recorder: &mut Recorder<W>,
        options: &EngineOptions,
    ) -> Result<Self> {
        options.validate()?;
        log::info!("initializing MCMC");
        let lnl = model.log_likelihood()?;
        let mut mcmc = Self {
            gen: 0,
            lnl,
            save_count: 0,
            step_index: 1,
            counts: SubstitutionCounts::new(),
        };
        recorder.write_headers(model)?;
        mcmc.record_state(model, recorder)?;
        mcmc.save_count = 1;
        Ok(mcmc)
    }

    /// The current log-likelihood.
    pub fn log_likelihood(&self) -> f64 {
        self.lnl
    }

    /// The last completed generation.
    pub fn generation(&self) -> u64 {
        self.gen
    }

    /// One iteration: a Gibbs tree sample every `tree_sample_frequency`
    /// steps, a parameter move otherwise.
    fn sample(
        &mut self,
        model: &mut Model,
        rng: &mut Xorshift64,
        options: &EngineOptions,
    ) -> Result<()> {
        if self.step_index % options.tree_sample_frequency == 0 {
            // All tree sampling is Gibbs: always accepted.
            model.sample_tree(rng)?;
            self.lnl = model.log_likelihood()?;
            self.step_index = 0;
        } else {
            match model.propose_parameter(rng) {
                Ok(proposal) => {
                    let new_lnl = model.update_likelihood(&proposal.changed)?;
                    let accept = if proposal.metropolis {
                        metropolis_accept(rng, new_lnl, self.lnl)
                    } else {
                        // Gibbs-flagged move.
                        true
                    };
                    if accept {
                        self.lnl = new_lnl;
                        model.accept_parameter();
                    } else {
                        model.reject_parameter();
                    }
                }
                // A proposal that pushed a derived rate out of bounds has
                // already rolled itself back: an ordinary rejection.
                Err(VelellaError::Numeric(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.step_index += 1;
        Ok(())
    }

    /// Run the configured number of generations.
    pub fn run<W: Write>(
        &mut self,
        model: &mut Model,
        recorder: &mut Recorder<W>,
        rng: &mut Xorshift64,
        options: &EngineOptions,
    ) -> Result<()> {
        log::info!("starting MCMC: {} generations", options.generations);
        for gen in 1..=options.generations {
            self.gen = gen;
            self.sample(model, rng, options)?;

            if self.lnl.is_nan() {
                return Err(VelellaError::Numeric("log-likelihood is NaN".into()));
            }
            if gen % options.print_frequency == 0 {
                log::info!("generation {gen}: likelihood {:.6}", self.lnl);
            }
            if gen % options.output_frequency == 0 {
                self.record_state(model, recorder)?;
                self.save_count += 1;
            }
        }
        recorder.finish()
    }

    fn record_state<W: Write>(
        &mut self,
        model: &Model,
        recorder: &mut Recorder<W>,
    ) -> Result<()> {
        self.counts.refresh(model);
        recorder.record_sample(self.save_count, self.gen, self.lnl, model, &self.counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::{RawMsa, SequenceAlignment};
    use crate::params::ParameterGraph;
    use crate::rate_vector::{RateVector, RateVectorSet};
    use crate::record;
    use crate::states::{DomainRegistry, StateDomain};
    use crate::tree::RawTree;

    fn small_options() -> EngineOptions {
        EngineOptions {
            generations: 60,
            output_frequency: 10,
            print_frequency: 50,
            tree_sample_frequency: 3,
            position_sample_count: 4,
            triple_recursion: true,
            max_segment_length: 10.0,
            uniformization_constant: 0.3,
            seed: 42,
        }
    }

    fn small_engine(options: &EngineOptions) -> (Model, Xorshift64) {
        let mut registry = DomainRegistry::new();
        registry
            .register(StateDomain::new("toy", &["A", "B"]).unwrap())
            .unwrap();
        let mut params = ParameterGraph::new();
        let mut store = RateVectorSet::new(1);
        for anc in 0..2i8 {
            let virt = params.add_virtual_rate(&format!("rv{anc}-virtual"), 0.3);
            let off = params.add_random_walk(&format!("rv{anc}-off"), 0.1, 0.02, 0.0, 1.0);
            params.declare_rate_dependency(virt, off).unwrap();
            params.refresh(virt).unwrap();
            let rates = if anc == 0 {
                vec![virt, off]
            } else {
                vec![off, virt]
            };
            let id = store
                .add(RateVector::new(&format!("rv{anc}"), 0, anc, rates))
                .unwrap();
            store.bind(id, vec![anc]).unwrap();
        }
        let raw = RawMsa::from_strings(&[
            ("t1", "AABA"),
            ("t2", "AABA"),
            ("t3", "BBBA"),
            ("t4", "BABA"),
        ]);
        let aln = SequenceAlignment::dynamic(
            0,
            StateDomain::new("toy", &["A", "B"]).unwrap(),
            &raw,
        )
        .unwrap();
        let raw_tree = RawTree::node(
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
        );
        let mut rng = Xorshift64::new(options.seed);
        let model = Model::assemble(
            registry,
            params,
            store,
            vec![aln],
            &raw_tree,
            options,
            &mut rng,
        )
        .unwrap();
        (model, rng)
    }

    #[test]
    fn metropolis_accepts_equal_likelihoods() {
        // With newLnL == lnL, ln(u) <= 0 for every u in [0, 1).
        let mut rng = Xorshift64::new(42);
        let accepted = (0..10_000)
            .filter(|_| metropolis_accept(&mut rng, -123.4, -123.4))
            .count();
        assert!(accepted >= 9_990, "accepted only {accepted} of 10000");
    }

    #[test]
    fn metropolis_rejects_large_drops() {
        let mut rng = Xorshift64::new(42);
        let accepted = (0..10_000)
            .filter(|_| metropolis_accept(&mut rng, -200.0, -100.0))
            .count();
        assert_eq!(accepted, 0);
    }

    #[test]
    fn metropolis_always_accepts_improvements() {
        let mut rng = Xorshift64::new(42);
        assert!((0..1000).all(|_| metropolis_accept(&mut rng, -90.0, -100.0)));
    }

    #[test]
    fn run_completes_and_records() {
        let options = small_options();
        let (mut model, mut rng) = small_engine(&options);
        let mut recorder = record::in_memory(1);
        let mut mcmc = Mcmc::initialize(&mut model, &mut recorder, &options).unwrap();
        mcmc.run(&mut model, &mut recorder, &mut rng, &options)
            .unwrap();

        assert_eq!(mcmc.generation(), 60);
        assert!(mcmc.log_likelihood().is_finite());

        let (likelihoods, rate_vectors, counts, domains) = recorder.sinks();
        let lnl_text = String::from_utf8(likelihoods.clone()).unwrap();
        let mut lines = lnl_text.lines();
        assert_eq!(lines.next(), Some("I,GEN,LogL"));
        // Generation 0 plus one row per output_frequency generations.
        assert_eq!(lines.count(), 1 + 60 / 10);

        let rv_text = String::from_utf8(rate_vectors.clone()).unwrap();
        assert!(rv_text.starts_with("I,GEN,LogL,NAME,ANC,A,B\n"));
        assert!(rv_text.contains("rv0,0,"));

        let counts_text = String::from_utf8(counts.clone()).unwrap();
        assert!(counts_text.starts_with("RateVector,State,A,B\n"));

        let (sequences, substitutions) = &domains[0];
        let seq_text = String::from_utf8((*sequences).clone()).unwrap();
        assert!(seq_text.starts_with("#0:0:"));
        assert!(seq_text.contains(">t1\nAABA"));
        assert!(seq_text.contains(">root\n"));

        let subs_text = String::from_utf8((*substitutions).clone()).unwrap();
        assert!(subs_text.starts_with("I,GEN,LogL,Ancestral,Decendant,Substitutions\n"));
        assert!(subs_text.contains(",root,L,[ "));
    }

    #[test]
    fn run_is_reproducible_for_a_seed() {
        let options = small_options();
        let run = || {
            let (mut model, mut rng) = small_engine(&options);
            let mut recorder = record::in_memory(1);
            let mut mcmc = Mcmc::initialize(&mut model, &mut recorder, &options).unwrap();
            mcmc.run(&mut model, &mut recorder, &mut rng, &options)
                .unwrap();
            let (likelihoods, ..) = recorder.sinks();
            likelihoods.clone()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn options_validation_names_the_key() {
        let options = EngineOptions {
            generations: 0,
            ..EngineOptions::default()
        };
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("MCMC.generations"));

        let options = EngineOptions {
            tree_sample_frequency: 0,
            ..EngineOptions::default()
        };
        assert!(options
            .validate()
            .unwrap_err()
            .to_string()
            .contains("MCMC.tree_sample_frequency"));
    }

    #[test]
    fn double_recursion_run_completes() {
        let options = EngineOptions {
            triple_recursion: false,
            ..small_options()
        };
        let (mut model, mut rng) = small_engine(&options);
        let mut recorder = record::in_memory(1);
        let mut mcmc = Mcmc::initialize(&mut model, &mut recorder, &options).unwrap();
        mcmc.run(&mut model, &mut recorder, &mut rng, &options)
            .unwrap();
        assert!(mcmc.log_likelihood().is_finite());
    }
}

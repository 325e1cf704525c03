//! The sample recorder: serializes MCMC state to the output files.
//!
//! A [`Recorder`] owns every output sink for a run: the likelihood trace,
//! per-domain sequence blocks and substitution CSVs, the rate-vector
//! trace, and the substitution-counts CSV. Sinks are generic over
//! [`Write`] so tests capture output in memory while
//! [`Recorder::from_paths`] opens buffered files; file handles acquired
//! there are released when the recorder drops, on every exit path.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use velella_core::Result;

use crate::counts::SubstitutionCounts;
use crate::model::Model;

/// Output locations for one state domain.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DomainPaths {
    pub domain: String,
    pub sequences_file: PathBuf,
    pub substitutions_file: PathBuf,
}

/// Output locations for a run.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutputPaths {
    pub likelihood_file: PathBuf,
    pub rate_vector_file: PathBuf,
    pub counts_file: PathBuf,
    /// One entry per registered domain, in registration order.
    pub domains: Vec<DomainPaths>,
}

struct DomainSinks<W> {
    sequences: W,
    substitutions: W,
}

/// Serializes samples to the run's output sinks.
pub struct Recorder<W: Write> {
    likelihoods: W,
    rate_vectors: W,
    counts: W,
    domains: Vec<DomainSinks<W>>,
}

impl Recorder<BufWriter<File>> {
    /// Open buffered file sinks for every output path.
    pub fn from_paths(paths: &OutputPaths) -> Result<Self> {
        let open = |p: &PathBuf| -> Result<BufWriter<File>> {
            Ok(BufWriter::new(File::create(p)?))
        };
        let mut domains = Vec::with_capacity(paths.domains.len());
        for d in &paths.domains {
            domains.push(DomainSinks {
                sequences: open(&d.sequences_file)?,
                substitutions: open(&d.substitutions_file)?,
            });
        }
        Ok(Self {
            likelihoods: open(&paths.likelihood_file)?,
            rate_vectors: open(&paths.rate_vector_file)?,
            counts: open(&paths.counts_file)?,
            domains,
        })
    }
}

impl<W: Write> Recorder<W> {
    /// Build a recorder over caller-supplied sinks; `domains` are
    /// `(sequences, substitutions)` pairs in domain registration order.
    pub fn new(likelihoods: W, rate_vectors: W, counts: W, domains: Vec<(W, W)>) -> Self {
        Self {
            likelihoods,
            rate_vectors,
            counts,
            domains: domains
                .into_iter()
                .map(|(sequences, substitutions)| DomainSinks {
                    sequences,
                    substitutions,
                })
                .collect(),
        }
    }

    /// Write the CSV headers. State columns use the first dynamic
    /// domain's symbols.
    pub fn write_headers(&mut self, model: &Model) -> Result<()> {
        writeln!(self.likelihoods, "I,GEN,LogL")?;
        for sinks in &mut self.domains {
            writeln!(
                sinks.substitutions,
                "I,GEN,LogL,Ancestral,Decendant,Substitutions"
            )?;
        }
        let symbols = model
            .alignments()
            .iter()
            .find(|a| a.is_dynamic())
            .map(|a| a.domain().symbols())
            .unwrap_or(&[]);
        write!(self.rate_vectors, "I,GEN,LogL,NAME,ANC")?;
        for sym in symbols {
            write!(self.rate_vectors, ",{sym}")?;
        }
        writeln!(self.rate_vectors)?;
        write!(self.counts, "RateVector,State")?;
        for sym in symbols {
            write!(self.counts, ",{sym}")?;
        }
        writeln!(self.counts)?;
        Ok(())
    }

    /// Serialize one recorded sample.
    pub fn record_sample(
        &mut self,
        i: u64,
        gen: u64,
        lnl: f64,
        model: &Model,
        counts: &SubstitutionCounts,
    ) -> Result<()> {
        writeln!(self.likelihoods, "{i},{gen},{lnl}")?;
        self.record_sequences(i, gen, lnl, model)?;
        self.record_substitutions(i, gen, lnl, model)?;
        self.record_rate_vectors(i, gen, lnl, model)?;
        self.record_counts(model, counts)?;
        Ok(())
    }

    fn record_sequences(&mut self, i: u64, gen: u64, lnl: f64, model: &Model) -> Result<()> {
        for (aln, sinks) in model.alignments().iter().zip(self.domains.iter_mut()) {
            writeln!(sinks.sequences, "#{i}:{gen}:{lnl}")?;
            for (name, seq) in aln.sequences() {
                writeln!(
                    sinks.sequences,
                    ">{name}\n{}",
                    aln.domain().decode_sequence(seq)?
                )?;
            }
        }
        Ok(())
    }

    fn record_substitutions(&mut self, i: u64, gen: u64, lnl: f64, model: &Model) -> Result<()> {
        let tree = model.tree();
        for (domain, (aln, sinks)) in model
            .alignments()
            .iter()
            .zip(self.domains.iter_mut())
            .enumerate()
        {
            for branch in tree.branches() {
                write!(
                    sinks.substitutions,
                    "{i},{gen},{lnl},{},{},[ ",
                    tree.node(branch.ancestral).name,
                    tree.node(branch.descendant).name
                )?;
                for pos in 0..aln.n_cols() {
                    let rec = branch.record(domain, pos);
                    if rec.occurred {
                        // Virtual self-substitutions included.
                        write!(
                            sinks.substitutions,
                            "{}{pos}{} ",
                            aln.domain().decode(rec.anc)?,
                            aln.domain().decode(rec.dec)?
                        )?;
                    }
                }
                writeln!(sinks.substitutions, "]")?;
            }
        }
        Ok(())
    }

    fn record_rate_vectors(&mut self, i: u64, gen: u64, lnl: f64, model: &Model) -> Result<()> {
        for (id, rv) in model.store().iter() {
            write!(
                self.rate_vectors,
                "{i},{gen},{lnl},{},{}",
                rv.name, rv.anc_state
            )?;
            for value in model.store().values(id, model.params()) {
                write!(self.rate_vectors, ",{value}")?;
            }
            writeln!(self.rate_vectors)?;
        }
        Ok(())
    }

    fn record_counts(&mut self, model: &Model, counts: &SubstitutionCounts) -> Result<()> {
        for (id, rv) in model.store().iter() {
            write!(self.counts, "{},{}", rv.name, rv.anc_state)?;
            for c in counts.rate_vector_counts(id) {
                write!(self.counts, ",{c}")?;
            }
            writeln!(self.counts)?;
        }
        Ok(())
    }

    /// Flush every sink.
    pub fn finish(&mut self) -> Result<()> {
        self.likelihoods.flush()?;
        self.rate_vectors.flush()?;
        self.counts.flush()?;
        for sinks in &mut self.domains {
            sinks.sequences.flush()?;
            sinks.substitutions.flush()?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn sinks(&self) -> (&W, &W, &W, Vec<(&W, &W)>) {
        (
            &self.likelihoods,
            &self.rate_vectors,
            &self.counts,
            self.domains
                .iter()
                .map(|d| (&d.sequences, &d.substitutions))
                .collect(),
        )
    }
}

/// An in-memory recorder with one `(sequences, substitutions)` sink pair
/// per domain.
pub fn in_memory(n_domains: usize) -> Recorder<Vec<u8>> {
    Recorder::new(
        Vec::new(),
        Vec::new(),
        Vec::new(),
        (0..n_domains).map(|_| (Vec::new(), Vec::new())).collect(),
    )
}

//! Substitution tallies over the current per-site histories.
//!
//! Rebuilt from the tree's branch records after each tree sample: how many
//! events (virtual self-events included) each rate vector produced per
//! descendant state, and how many event/no-event positions each distinct
//! branch length carries.

use std::collections::BTreeMap;

use velella_core::Summarizable;

use crate::model::Model;
use crate::rate_vector::RvId;

/// Event / no-event totals for one distinct branch length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchTally {
    pub num_0_subs: u64,
    pub num_1_subs: u64,
}

/// Substitution counts by rate vector and by branch length.
#[derive(Debug, Clone, Default)]
pub struct SubstitutionCounts {
    /// Per rate vector: events by descendant state.
    by_rate_vector: Vec<Vec<u64>>,
    /// Keyed by the branch length's bit pattern (lengths are exact copies
    /// of segment lengths, never arithmetic results).
    by_branch_length: BTreeMap<u64, (f64, BranchTally)>,
}

impl SubstitutionCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the tallies from the model's current branch records.
    pub fn refresh(&mut self, model: &Model) {
        let store = model.store();
        self.by_rate_vector = (0..store.len())
            .map(|id| vec![0; store.get(id).size()])
            .collect();
        self.by_branch_length.clear();
        for branch in model.tree().branches() {
            let entry = self
                .by_branch_length
                .entry(branch.length.to_bits())
                .or_insert((branch.length, BranchTally::default()));
            for records in &branch.records {
                for rec in records {
                    if rec.is_gap() {
                        continue;
                    }
                    if rec.occurred {
                        entry.1.num_1_subs += 1;
                        if let Some(rv) = rec.rate_vector {
                            self.by_rate_vector[rv][rec.dec as usize] += 1;
                        }
                    } else {
                        entry.1.num_0_subs += 1;
                    }
                }
            }
        }
    }

    /// Event counts by descendant state for one rate vector.
    pub fn rate_vector_counts(&self, rv: RvId) -> &[u64] {
        &self.by_rate_vector[rv]
    }

    pub fn n_rate_vectors(&self) -> usize {
        self.by_rate_vector.len()
    }

    /// Tallies per distinct branch length, ascending by bit pattern.
    pub fn branch_tallies(&self) -> impl Iterator<Item = (f64, BranchTally)> + '_ {
        self.by_branch_length.values().copied()
    }
}

impl Summarizable for SubstitutionCounts {
    fn summary(&self) -> String {
        let events: u64 = self
            .by_rate_vector
            .iter()
            .flat_map(|c| c.iter())
            .sum();
        format!(
            "SubstitutionCounts: {events} events over {} rate vectors, {} branch lengths",
            self.by_rate_vector.len(),
            self.by_branch_length.len()
        )
    }
}

//! State domains: finite symbol alphabets and their integer encodings.
//!
//! A [`StateDomain`] is an immutable value object mapping symbols to small
//! integer codes. Codes are `0..N-1` with `N <= 127`; the gap symbol `-`
//! maps to the reserved code [`GAP`]. There is no global domain: every
//! alignment and rate vector carries the [`DomainId`] of the domain it was
//! built against.

use std::collections::HashMap;

use velella_core::{Result, VelellaError};

/// Encoded state: one symbol of a domain, or [`GAP`].
pub type StateCode = i8;

/// The reserved code for the alignment gap symbol `-`.
pub const GAP: StateCode = -1;

/// Index into the [`DomainRegistry`].
pub type DomainId = usize;

/// An ordered symbol alphabet with encode/decode tables.
#[derive(Debug, Clone)]
pub struct StateDomain {
    name: String,
    symbols: Vec<String>,
    encode: HashMap<String, StateCode>,
}

impl StateDomain {
    /// Build a domain from an ordered list of symbols.
    ///
    /// # Errors
    ///
    /// Fails with a `Schema` error if the alphabet is empty, larger than
    /// 127 symbols, contains duplicates, or claims the reserved gap `-`.
    pub fn new(name: &str, symbols: &[&str]) -> Result<Self> {
        if symbols.is_empty() {
            return Err(VelellaError::Schema(format!(
                "state domain \"{name}\" has no symbols"
            )));
        }
        if symbols.len() > 127 {
            return Err(VelellaError::Schema(format!(
                "state domain \"{name}\" has {} symbols (maximum is 127)",
                symbols.len()
            )));
        }
        let mut encode = HashMap::with_capacity(symbols.len());
        for (code, sym) in symbols.iter().enumerate() {
            if *sym == "-" {
                return Err(VelellaError::Schema(format!(
                    "state domain \"{name}\" may not register the gap symbol \"-\""
                )));
            }
            if encode.insert(sym.to_string(), code as StateCode).is_some() {
                return Err(VelellaError::Schema(format!(
                    "state domain \"{name}\" has duplicate symbol \"{sym}\""
                )));
            }
        }
        Ok(Self {
            name: name.to_string(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            encode,
        })
    }

    /// The twenty amino acids in the conventional order.
    pub fn amino_acids() -> Result<Self> {
        Self::new(
            "AA",
            &[
                "A", "R", "N", "D", "C", "E", "Q", "G", "H", "I", "L", "K", "M", "F", "P", "S",
                "T", "W", "Y", "V",
            ],
        )
    }

    /// The four nucleotides.
    pub fn nucleotides() -> Result<Self> {
        Self::new("NUC", &["A", "T", "C", "G"])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of non-gap states.
    pub fn n_states(&self) -> usize {
        self.symbols.len()
    }

    /// The ordered symbol list (gap excluded).
    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Encode a symbol; `-` maps to [`GAP`].
    pub fn encode(&self, symbol: &str) -> Result<StateCode> {
        if symbol == "-" {
            return Ok(GAP);
        }
        self.encode.get(symbol).copied().ok_or_else(|| {
            VelellaError::Schema(format!(
                "state \"{symbol}\" is not recognised in domain \"{}\"",
                self.name
            ))
        })
    }

    /// Decode a code back to its symbol; [`GAP`] maps to `-`.
    pub fn decode(&self, code: StateCode) -> Result<&str> {
        if code == GAP {
            return Ok("-");
        }
        self.symbols
            .get(code as usize)
            .map(|s| s.as_str())
            .ok_or_else(|| {
                VelellaError::Schema(format!(
                    "state code {code} is out of range for domain \"{}\"",
                    self.name
                ))
            })
    }

    /// Decode a whole encoded sequence to its string form.
    pub fn decode_sequence(&self, seq: &[StateCode]) -> Result<String> {
        let mut out = String::with_capacity(seq.len());
        for &code in seq {
            out.push_str(self.decode(code)?);
        }
        Ok(out)
    }
}

/// The ordered set of registered state domains.
///
/// Registration order defines [`DomainId`]s and the layout of extended-state
/// keys, so it must be identical between the rate-vector store and the
/// alignments.
#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    domains: Vec<StateDomain>,
    by_name: HashMap<String, DomainId>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a domain and return its id.
    pub fn register(&mut self, domain: StateDomain) -> Result<DomainId> {
        if self.by_name.contains_key(domain.name()) {
            return Err(VelellaError::Schema(format!(
                "state domain \"{}\" is already registered",
                domain.name()
            )));
        }
        let id = self.domains.len();
        self.by_name.insert(domain.name().to_string(), id);
        self.domains.push(domain);
        Ok(id)
    }

    pub fn get(&self, id: DomainId) -> Option<&StateDomain> {
        self.domains.get(id)
    }

    pub fn lookup(&self, name: &str) -> Result<DomainId> {
        self.by_name.get(name).copied().ok_or_else(|| {
            VelellaError::Graph(format!("state domain \"{name}\" is not registered"))
        })
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateDomain> {
        self.domains.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let domain = StateDomain::amino_acids().unwrap();
        for sym in domain.symbols().to_vec() {
            let code = domain.encode(&sym).unwrap();
            assert_eq!(domain.decode(code).unwrap(), sym);
        }
    }

    #[test]
    fn gap_is_reserved() {
        let domain = StateDomain::nucleotides().unwrap();
        assert_eq!(domain.encode("-").unwrap(), GAP);
        assert_eq!(domain.decode(GAP).unwrap(), "-");
    }

    #[test]
    fn unknown_symbol_fails() {
        let domain = StateDomain::nucleotides().unwrap();
        assert!(matches!(
            domain.encode("J"),
            Err(VelellaError::Schema(_))
        ));
        assert!(domain.decode(99).is_err());
    }

    #[test]
    fn codes_are_dense() {
        let domain = StateDomain::new("toy", &["A", "B", "C"]).unwrap();
        assert_eq!(domain.encode("A").unwrap(), 0);
        assert_eq!(domain.encode("B").unwrap(), 1);
        assert_eq!(domain.encode("C").unwrap(), 2);
    }

    #[test]
    fn rejects_oversized_alphabet() {
        let symbols: Vec<String> = (0..128).map(|i| format!("s{i}")).collect();
        let refs: Vec<&str> = symbols.iter().map(|s| s.as_str()).collect();
        assert!(StateDomain::new("big", &refs).is_err());
    }

    #[test]
    fn rejects_duplicates_and_gap() {
        assert!(StateDomain::new("dup", &["A", "A"]).is_err());
        assert!(StateDomain::new("gap", &["A", "-"]).is_err());
    }

    #[test]
    fn registry_orders_domains() {
        let mut reg = DomainRegistry::new();
        let aa = reg.register(StateDomain::amino_acids().unwrap()).unwrap();
        let nuc = reg.register(StateDomain::nucleotides().unwrap()).unwrap();
        assert_eq!(aa, 0);
        assert_eq!(nuc, 1);
        assert_eq!(reg.lookup("NUC").unwrap(), 1);
        assert!(reg.lookup("missing").is_err());
        assert!(reg.register(StateDomain::nucleotides().unwrap()).is_err());
    }

    #[test]
    fn decode_sequence_with_gaps() {
        let domain = StateDomain::nucleotides().unwrap();
        assert_eq!(domain.decode_sequence(&[0, GAP, 3]).unwrap(), "A-G");
    }
}

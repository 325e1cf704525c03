//! Shared primitives for the velella phylogenetic MCMC engine.
//!
//! `velella-core` provides the foundation the engine crates build on:
//!
//! - **Error types** — [`VelellaError`] and [`Result`] for structured error
//!   handling
//! - **Randomness** — [`Xorshift64`], the single deterministic random source
//!   threaded through every sampling component
//! - **Traits** — [`Summarizable`] for one-line diagnostics

pub mod error;
pub mod rng;
pub mod traits;

pub use error::{Result, VelellaError};
pub use rng::Xorshift64;
pub use traits::Summarizable;

//! Bitvector reasoning core for a lazy-SMT (DPLL(T)) search.
//!
//! The crate maintains conservative numeric bounds over fixed-width unsigned
//! bitvectors represented as vectors of boolean literals, together with order
//! comparisons (against constants or other bitvectors) and addition
//! constraints. It propagates incrementally under chronological backtracking
//! and produces clausal justifications for every fact it derives.
//!
//! The main entry point is [`theory::BvTheory`], which talks to the host SAT
//! engine through the [`theory::SatEngine`] trait. A minimal self-contained
//! host, [`theory::BvSolver`], is provided for tests and standalone use.

pub mod backtrack;
pub mod collections;
pub mod core;
pub mod num;
pub mod theory;

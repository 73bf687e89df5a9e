//! Lazily propagating bitvector theory.
//!
//! Bitvectors are fixed-width unsigned integers represented as vectors of
//! boolean literals (least significant bit first). The theory maintains, for
//! each bitvector, a conservative `[under, over]` interval consistent with the
//! current partial assignment, registered order comparisons and addition
//! constraints. Propagation runs a work-queue fixpoint over dirty bitvectors;
//! every derived fact carries a [`cause::Cause`] from which a clausal
//! justification can be rebuilt on demand, at any later point of the search.

mod bounds;
pub mod cause;
mod explain;
mod propagate;
mod solver;
mod theory;

pub use solver::BvSolver;
pub use theory::BvTheory;

use crate::core::{Lit, Var};
use crate::create_ref_type;

create_ref_type!(BvRef);
create_ref_type!(CmpRef);

/// Opaque token identifying a class of theory-propagated literals to the host.
///
/// The host hands it back to [`BvTheory::explain`] when it needs the reason
/// for a propagation made under this marker.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ReasonRef(pub u32);

/// Direction of an order comparison.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum CmpOp {
    Lt,
    Leq,
    Gt,
    Geq,
}

impl CmpOp {
    /// Logical negation: `!(x < w)` is `x >= w`.
    pub fn negated(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Geq,
            CmpOp::Leq => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Leq,
            CmpOp::Geq => CmpOp::Lt,
        }
    }

    /// Operand swap: `x < y` iff `y > x`.
    pub fn swapped(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Leq => CmpOp::Geq,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Geq => CmpOp::Leq,
        }
    }

    pub fn apply<W: Ord>(self, lhs: &W, rhs: &W) -> bool {
        match self {
            CmpOp::Lt => lhs < rhs,
            CmpOp::Leq => lhs <= rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Geq => lhs >= rhs,
        }
    }
}

impl std::fmt::Display for CmpOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmpOp::Lt => "<",
            CmpOp::Leq => "<=",
            CmpOp::Gt => ">",
            CmpOp::Geq => ">=",
        };
        write!(f, "{s}")
    }
}

/// The services the theory consumes from the host SAT engine.
///
/// All variables and literals crossing this boundary use the host's own
/// numbering; the theory keeps a private mapping to its internal variables.
///
/// Contract: the host calls [`crate::backtrack::Backtrack::save_state`] on the
/// theory before enqueuing assignments of a new decision level, echoes every
/// assignment of a theory-registered variable through
/// [`BvTheory::on_assignment`], and resolves reason markers by calling
/// [`BvTheory::explain`].
pub trait SatEngine {
    fn new_var(&mut self) -> Var;

    /// Registers a fresh reason marker, later handed back through `enqueue`.
    fn new_reason_marker(&mut self) -> ReasonRef;

    fn add_clause(&mut self, clause: &[Lit]);

    /// Unit-propagates `lit` with an opaque reason. Returns false if the
    /// literal is already false in the host.
    fn enqueue(&mut self, lit: Lit, reason: ReasonRef) -> bool;

    fn value(&self, lit: Lit) -> Option<bool>;
}

/// A learned clause, in host numbering. Its negation is a subset of the
/// currently-true literals responsible for the inconsistency.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Conflict(pub Vec<Lit>);

#[derive(Clone, Debug)]
pub struct BvConfig {
    /// When false, propagation only detects conflicts and does not enqueue
    /// implied literals into the host.
    pub propagate_literals: bool,
    /// Name used when reporting statistics.
    pub label: String,
}

impl Default for BvConfig {
    fn default() -> Self {
        BvConfig {
            propagate_literals: true,
            label: "bv".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub propagations: u64,
    pub propagations_skipped: u64,
    pub refreshes: u64,
    pub enqueued: u64,
    pub bit_conflicts: u64,
    pub addition_conflicts: u64,
    pub comparison_conflicts: u64,
    pub bv_comparison_conflicts: u64,
    pub explanations: u64,
    pub consts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmp_op_tables() {
        use CmpOp::*;
        assert_eq!(Lt.negated(), Geq);
        assert_eq!(Leq.negated(), Gt);
        assert_eq!(Gt.negated(), Leq);
        assert_eq!(Geq.negated(), Lt);

        assert_eq!(Lt.swapped(), Gt);
        assert_eq!(Leq.swapped(), Geq);
        assert_eq!(Gt.swapped(), Lt);
        assert_eq!(Geq.swapped(), Leq);

        for op in [Lt, Leq, Gt, Geq] {
            assert_eq!(op.negated().negated(), op);
            assert_eq!(op.swapped().swapped(), op);
            for (a, b) in [(1i64, 2), (2, 2), (3, 2)] {
                assert_eq!(op.apply(&a, &b), !op.negated().apply(&a, &b));
                assert_eq!(op.apply(&a, &b), op.swapped().apply(&b, &a));
            }
        }
    }
}

//! A minimal assignment core and a harness tying it to the theory.
//!
//! [`SatCore`] implements just enough of the host side of [`SatEngine`] to
//! drive the theory: variable allocation, an assignment trail with decision
//! levels, clause storage with root-level unit assignment, and an echo queue
//! of assignments not yet forwarded to the theory. It performs no clause
//! propagation of its own.
//!
//! [`BvSolver`] owns a core and a theory and keeps the two in sync: decisions
//! and unit clauses flow from the core to the theory, propagated literals and
//! conflicts flow back.

use tracing::trace;

use crate::backtrack::{Backtrack, DecLvl};
use crate::collections::ref_store::{RefMap, RefVec};
use crate::core::{Lit, Var};
use crate::num::Weight;
use crate::theory::{BvConfig, BvRef, BvTheory, CmpOp, Conflict, ReasonRef, SatEngine};

pub struct SatCore {
    values: RefVec<Var, Option<bool>>,
    /// Reason marker of each theory-propagated variable.
    reasons: RefMap<Var, ReasonRef>,
    trail: Vec<Lit>,
    /// Trail length at each saved decision level.
    lim: Vec<usize>,
    /// Assignments not yet echoed to the theory, in chronological order.
    pending: Vec<Lit>,
    clauses: Vec<Vec<Lit>>,
    next_marker: u32,
    unsat: bool,
}

impl SatCore {
    pub fn new() -> SatCore {
        SatCore {
            values: RefVec::new(),
            reasons: RefMap::new(),
            trail: Vec::new(),
            lim: Vec::new(),
            pending: Vec::new(),
            clauses: Vec::new(),
            next_marker: 0,
            unsat: false,
        }
    }

    fn assign(&mut self, l: Lit) {
        debug_assert!(self.values[l.var()].is_none());
        self.values[l.var()] = Some(l.is_positive());
        self.trail.push(l);
        self.pending.push(l);
    }

    /// Assigns an unassigned literal without a reason. Returns whether the
    /// literal holds afterwards.
    pub fn assume(&mut self, l: Lit) -> bool {
        match self.value(l) {
            Some(b) => b,
            None => {
                self.assign(l);
                true
            }
        }
    }

    /// A root-level inconsistency was recorded through unit clauses.
    pub fn is_unsat(&self) -> bool {
        self.unsat
    }

    pub fn num_assigned(&self) -> usize {
        self.trail.len()
    }

    /// Theory-propagated literals currently on the trail, with their markers.
    pub fn propagated(&self) -> Vec<(Lit, ReasonRef)> {
        self.trail
            .iter()
            .filter_map(|&l| self.reasons.get(l.var()).map(|&m| (l, m)))
            .collect()
    }

    pub fn reason(&self, v: Var) -> Option<ReasonRef> {
        self.reasons.get(v).copied()
    }

    fn take_pending(&mut self) -> Vec<Lit> {
        std::mem::take(&mut self.pending)
    }
}

impl Default for SatCore {
    fn default() -> Self {
        Self::new()
    }
}

impl SatEngine for SatCore {
    fn new_var(&mut self) -> Var {
        self.values.push(None)
    }

    fn new_reason_marker(&mut self) -> ReasonRef {
        let m = ReasonRef(self.next_marker);
        self.next_marker += 1;
        m
    }

    fn add_clause(&mut self, clause: &[Lit]) {
        if let [l] = *clause {
            match self.value(l) {
                Some(true) => {}
                Some(false) => self.unsat = true,
                None => self.assign(l),
            }
        }
        self.clauses.push(clause.to_vec());
    }

    fn enqueue(&mut self, lit: Lit, reason: ReasonRef) -> bool {
        match self.value(lit) {
            Some(b) => b,
            None => {
                self.reasons.insert(lit.var(), reason);
                self.assign(lit);
                true
            }
        }
    }

    fn value(&self, lit: Lit) -> Option<bool> {
        self.values[lit.var()].map(|b| lit.value_given(b))
    }
}

impl Backtrack for SatCore {
    fn save_state(&mut self) -> DecLvl {
        self.lim.push(self.trail.len());
        self.current_decision_level()
    }

    fn num_saved(&self) -> u32 {
        self.lim.len() as u32
    }

    fn restore_last(&mut self) {
        let to = self.lim.pop().expect("no backtrack point left");
        for i in (to..self.trail.len()).rev() {
            let l = self.trail[i];
            self.values[l.var()] = None;
            self.reasons.remove(l.var());
        }
        self.trail.truncate(to);
        let values = &self.values;
        self.pending.retain(|l| values[l.var()].is_some());
    }
}

/// A self-contained solver over one bitvector theory.
///
/// This is the crate's top-level entry point for direct use and the harness
/// the tests are written against. A host with its own SAT engine wires
/// [`BvTheory`] to it directly instead.
pub struct BvSolver<W> {
    pub core: SatCore,
    pub theory: BvTheory<W>,
}

impl<W: Weight> BvSolver<W> {
    pub fn new() -> Self {
        Self::with_config(BvConfig::default())
    }

    pub fn with_config(config: BvConfig) -> Self {
        let mut core = SatCore::new();
        let theory = BvTheory::new(&mut core, config);
        BvSolver { core, theory }
    }

    pub fn new_bitvector(&mut self, width: u32) -> anyhow::Result<BvRef> {
        self.theory.new_bitvector(&mut self.core, width)
    }

    pub fn new_addition(&mut self, sum: BvRef, a: BvRef, b: BvRef) -> anyhow::Result<()> {
        self.theory.new_addition(sum, a, b)
    }

    pub fn comparison(&mut self, op: CmpOp, bv: BvRef, to: W) -> anyhow::Result<Lit> {
        self.theory.comparison(&mut self.core, op, bv, to)
    }

    pub fn comparison_bv(&mut self, op: CmpOp, a: BvRef, b: BvRef) -> anyhow::Result<Lit> {
        self.theory.comparison_bv(&mut self.core, op, a, b)
    }

    pub fn assert_const(&mut self, bv: BvRef, value: W) -> anyhow::Result<()> {
        self.theory.assert_const(&mut self.core, bv, value)
    }

    /// Asserts a literal as a permanent fact.
    pub fn assert_at_root(&mut self, l: Lit) {
        self.core.add_clause(&[l]);
    }

    /// Opens a new decision level and assumes the literal, unless it is
    /// already assigned. Returns whether the literal holds.
    pub fn decide(&mut self, l: Lit) -> bool {
        match self.core.value(l) {
            Some(b) => b,
            None => {
                self.save_state();
                trace!(lit = ?l, level = ?self.current_decision_level(), "decide");
                self.core.assume(l)
            }
        }
    }

    pub fn value(&self, l: Lit) -> Option<bool> {
        self.core.value(l)
    }

    /// Hands every assignment still buffered in the core to the theory.
    fn flush_assignments(&mut self) {
        for l in self.core.take_pending() {
            self.theory.on_assignment(l);
        }
    }

    /// Echoes pending assignments to the theory and runs theory propagation,
    /// looping until no new literal is produced.
    pub fn propagate(&mut self) -> Result<(), Conflict> {
        if self.core.is_unsat() {
            return Err(Conflict(Vec::new()));
        }
        loop {
            self.flush_assignments();
            self.theory.propagate(&mut self.core)?;
            if self.core.pending.is_empty() {
                return Ok(());
            }
        }
    }

    /// The reason clause for a theory-propagated literal.
    pub fn explain(&mut self, l: Lit) -> Vec<Lit> {
        let marker = self.core.reasons[l.var()];
        let mut clause = Vec::new();
        self.theory.explain(l, marker, &mut clause);
        clause
    }
}

impl<W: Weight> Default for BvSolver<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Weight> Backtrack for BvSolver<W> {
    fn save_state(&mut self) -> DecLvl {
        // Assignments still in flight belong to the level being closed; echo
        // them now so the theory records them below the new checkpoint.
        self.flush_assignments();
        self.core.save_state();
        self.theory.save_state()
    }

    fn num_saved(&self) -> u32 {
        debug_assert_eq!(self.core.num_saved(), self.theory.num_saved());
        self.theory.num_saved()
    }

    fn restore_last(&mut self) {
        self.core.restore_last();
        self.theory.restore_last();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    type Solver = BvSolver<i64>;

    /// All literals of a reason or conflict clause, except the propagated
    /// literal itself, must currently be false.
    fn assert_support_false(s: &Solver, clause: &[Lit], except: Option<Lit>) {
        for &l in clause {
            if Some(l) != except {
                assert_eq!(s.value(l), Some(false), "support literal {l:?} is not false");
            }
        }
    }

    #[test]
    fn test_bits_force_registered_comparison() {
        let mut s = Solver::new();
        let bv = s.new_bitvector(4).unwrap();
        let bits = s.theory.bit_lits(bv);
        let geq2 = s.comparison(CmpOp::Geq, bv, 2).unwrap();

        s.assert_at_root(!bits[3]);
        s.assert_at_root(!bits[2]);
        s.propagate().unwrap();
        assert_eq!(s.theory.bounds(bv), (0, 3));
        assert_eq!(s.value(geq2), None);

        s.assert_at_root(bits[1]);
        s.propagate().unwrap();
        assert_eq!(s.theory.bounds(bv), (2, 3));
        assert_eq!(s.value(geq2), Some(true));

        let reason = s.explain(geq2);
        assert!(reason.contains(&geq2));
        assert_support_false(&s, &reason, Some(geq2));
    }

    #[test]
    fn test_addition_overflow_is_a_conflict() {
        let mut s = Solver::new();
        let a = s.new_bitvector(2).unwrap();
        let b = s.new_bitvector(2).unwrap();
        let sum = s.new_bitvector(2).unwrap();
        s.assert_const(a, 3).unwrap();
        s.assert_const(b, 2).unwrap();
        s.propagate().unwrap();

        // 3 + 2 exceeds the 2-bit range of the sum.
        s.new_addition(sum, a, b).unwrap();
        let conflict = s.propagate().unwrap_err();
        assert_support_false(&s, &conflict.0, None);
        assert!(s.theory.stats().addition_conflicts >= 1);
    }

    #[test]
    fn test_addition_conflict_from_decisions() {
        let mut s = Solver::new();
        let a = s.new_bitvector(2).unwrap();
        let b = s.new_bitvector(2).unwrap();
        let sum = s.new_bitvector(2).unwrap();
        s.new_addition(sum, a, b).unwrap();
        s.propagate().unwrap();

        let a_bits = s.theory.bit_lits(a);
        let b_bits = s.theory.bit_lits(b);
        s.decide(a_bits[0]);
        s.decide(a_bits[1]);
        s.decide(b_bits[1]);
        let conflict = s.propagate().unwrap_err();
        assert!(!conflict.0.is_empty());
        assert_support_false(&s, &conflict.0, None);

        // After backtracking past the offending decision the theory recovers.
        self::Backtrack::restore(&mut s, DecLvl::new(2));
        s.propagate().unwrap();
        assert!(s.theory.bounds(sum).0 >= 3);
    }

    #[test]
    fn test_theory_records_assignments_at_their_decision_level() {
        let mut s = Solver::new();
        let bv = s.new_bitvector(2).unwrap();
        let bits = s.theory.bit_lits(bv);
        s.decide(bits[0]);
        s.decide(bits[1]);
        s.propagate().unwrap();
        assert_eq!(s.theory.bounds(bv), (3, 3));

        // Undoing the second decision must keep the first one's effect.
        self::Backtrack::restore(&mut s, DecLvl::new(1));
        s.propagate().unwrap();
        assert_eq!(s.value(bits[0]), Some(true));
        assert_eq!(s.value(bits[1]), None);
        assert_eq!(s.theory.bounds(bv), (1, 3));
    }

    #[test]
    fn test_asserting_impossible_bv_comparison_conflicts() {
        let mut s = Solver::new();
        let x = s.new_bitvector(3).unwrap();
        let z = s.new_bitvector(3).unwrap();
        let lt = s.comparison_bv(CmpOp::Lt, x, z).unwrap();
        s.assert_const(z, 0).unwrap();

        // Nothing is below zero, so x < z cannot hold.
        assert!(s.decide(lt));
        let conflict = s.propagate().unwrap_err();
        assert!(conflict.0.contains(&!lt));
        assert_support_false(&s, &conflict.0, None);
        // Classified on the bitvector-comparison path, not elsewhere.
        assert_eq!(s.theory.stats().bv_comparison_conflicts, 1);
        assert_eq!(s.theory.stats().comparison_conflicts, 0);
        assert_eq!(s.theory.stats().bit_conflicts, 0);
    }

    #[test]
    fn test_comparison_registration_is_deduplicated() {
        let mut s = Solver::new();
        let a = s.new_bitvector(4).unwrap();
        let b = s.new_bitvector(4).unwrap();

        let l1 = s.comparison(CmpOp::Leq, a, 9).unwrap();
        let l2 = s.comparison(CmpOp::Leq, a, 9).unwrap();
        assert_eq!(l1, l2);
        let l3 = s.comparison(CmpOp::Lt, a, 9).unwrap();
        assert_ne!(l1, l3);

        let c1 = s.comparison_bv(CmpOp::Lt, a, b).unwrap();
        let c2 = s.comparison_bv(CmpOp::Lt, a, b).unwrap();
        let c3 = s.comparison_bv(CmpOp::Gt, b, a).unwrap();
        assert_eq!(c1, c2);
        assert_eq!(c1, c3);
    }

    #[test]
    fn test_assert_const_fixes_every_value() {
        for width in 1..=3u32 {
            for value in 0..(1i64 << width) {
                let mut s = Solver::new();
                let bv = s.new_bitvector(width).unwrap();
                s.assert_const(bv, value).unwrap();
                s.propagate().unwrap();
                assert_eq!(s.theory.bounds(bv), (value, value));
                assert!(s.theory.is_const(bv));
            }
        }
    }

    #[test]
    fn test_forced_bits_are_explained_by_the_comparison() {
        let mut s = Solver::new();
        let bv = s.new_bitvector(2).unwrap();
        let bits = s.theory.bit_lits(bv);
        let geq3 = s.comparison(CmpOp::Geq, bv, 3).unwrap();
        s.propagate().unwrap();

        assert!(s.decide(geq3));
        s.propagate().unwrap();
        assert_eq!(s.value(bits[0]), Some(true));
        assert_eq!(s.value(bits[1]), Some(true));

        let reason = s.explain(bits[1]);
        assert!(reason.contains(&bits[1]));
        assert!(reason.contains(&!geq3));
        assert_support_false(&s, &reason, Some(bits[1]));
    }

    #[test]
    fn test_refined_bound_is_explained_by_bits_and_comparison() {
        let mut s = Solver::new();
        let bv = s.new_bitvector(3).unwrap();
        let bits = s.theory.bit_lits(bv);
        let g3 = s.comparison(CmpOp::Geq, bv, 3).unwrap();
        let g4 = s.comparison(CmpOp::Geq, bv, 4).unwrap();
        s.propagate().unwrap();

        assert!(s.decide(!bits[0]));
        s.propagate().unwrap();
        assert!(s.decide(g3));
        s.propagate().unwrap();

        // An even value that is >= 3 is >= 4.
        assert_eq!(s.theory.bounds(bv).0, 4);
        assert_eq!(s.value(g4), Some(true));
        let reason = s.explain(g4);
        assert!(reason.contains(&g4));
        assert!(reason.contains(&bits[0]), "refining bit missing from {reason:?}");
        assert!(reason.contains(&!g3), "triggering comparison missing from {reason:?}");
        assert_support_false(&s, &reason, Some(g4));
    }

    #[test]
    fn test_backtrack_to_level_is_idempotent() {
        let mut s = Solver::new();
        let bv = s.new_bitvector(4).unwrap();
        let bits = s.theory.bit_lits(bv);
        s.propagate().unwrap();

        s.decide(bits[3]);
        s.propagate().unwrap();
        let lvl = s.current_decision_level();
        s.decide(bits[1]);
        s.decide(!bits[0]);
        s.propagate().unwrap();

        self::Backtrack::restore(&mut s, lvl);
        let bounds = s.theory.bounds(bv);
        assert_eq!(s.num_saved(), lvl.to_int());
        self::Backtrack::restore(&mut s, lvl);
        assert_eq!(s.theory.bounds(bv), bounds);
        assert_eq!(s.num_saved(), lvl.to_int());
        assert_eq!(bounds, (8, 15));
    }

    #[test]
    fn test_bounds_sound_against_enumeration() {
        let ops = [CmpOp::Lt, CmpOp::Leq, CmpOp::Gt, CmpOp::Geq];
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        for _ in 0..80 {
            let mut s = Solver::new();
            let width = rng.random_range(1..=5u32);
            let bv = s.new_bitvector(width).unwrap();
            let bits = s.theory.bit_lits(bv);
            let mut cmps = Vec::new();
            for _ in 0..3 {
                let op = ops[rng.random_range(0..4)];
                let to = rng.random_range(0..(1i64 << width));
                cmps.push((op, to, s.comparison(op, bv, to).unwrap()));
            }
            if s.propagate().is_err() {
                continue;
            }

            let mut conflicted = false;
            for _ in 0..width {
                let i = rng.random_range(0..width as usize);
                let l = if rng.random_bool(0.5) { bits[i] } else { !bits[i] };
                if s.value(l).is_some() {
                    continue;
                }
                s.decide(l);
                if s.propagate().is_err() {
                    conflicted = true;
                    break;
                }
            }
            if conflicted {
                continue;
            }

            let (under, over) = s.theory.bounds(bv);
            let (under0, over0) = s.theory.root_bounds(bv);
            assert!(under0 <= under && under <= over && over <= over0);
            let mut feasible = Vec::new();
            for val in 0..(1i64 << width) {
                let bits_ok = (0..width as usize).all(|i| match s.value(bits[i]) {
                    Some(b) => (val >> i) & 1 == b as i64,
                    None => true,
                });
                let cmps_ok = cmps.iter().all(|&(op, to, l)| match s.value(l) {
                    Some(true) => op.apply(&val, &to),
                    Some(false) => op.negated().apply(&val, &to),
                    None => true,
                });
                if bits_ok && cmps_ok {
                    feasible.push(val);
                }
            }
            // The maintained interval is exactly the feasible hull.
            if let (Some(&min), Some(&max)) = (feasible.first(), feasible.last()) {
                assert_eq!((under, over), (min, max), "bounds are not the feasible hull");
            }
        }
    }

    #[test]
    fn test_addition_conflicts_sound_against_enumeration() {
        let mut rng = SmallRng::seed_from_u64(0xadd);
        for _ in 0..60 {
            let mut s = Solver::new();
            let width = rng.random_range(1..=3u32);
            let a = s.new_bitvector(width).unwrap();
            let b = s.new_bitvector(width).unwrap();
            let sum = s.new_bitvector(width).unwrap();
            s.new_addition(sum, a, b).unwrap();
            let all_bits: Vec<Lit> = [a, b, sum]
                .iter()
                .flat_map(|&x| s.theory.bit_lits(x))
                .collect();
            if s.propagate().is_err() {
                continue;
            }

            let mut conflicted = false;
            for _ in 0..2 * width {
                let i = rng.random_range(0..all_bits.len());
                let l = if rng.random_bool(0.5) {
                    all_bits[i]
                } else {
                    !all_bits[i]
                };
                if s.value(l).is_some() {
                    continue;
                }
                s.decide(l);
                if s.propagate().is_err() {
                    conflicted = true;
                    break;
                }
            }

            let feasible = |s: &Solver| {
                let w = width as usize;
                let fits = |x: BvRef, val: i64| {
                    let bits = s.theory.bit_lits(x);
                    (0..w).all(|i| match s.value(bits[i]) {
                        Some(bit) => (val >> i) & 1 == bit as i64,
                        None => true,
                    })
                };
                let max = 1i64 << width;
                (0..max).any(|va| {
                    (0..max).any(|vb| {
                        va + vb < max && fits(a, va) && fits(b, vb) && fits(sum, va + vb)
                    })
                })
            };
            if conflicted {
                // A reported conflict must reflect a real infeasibility.
                assert!(!feasible(&s), "conflict on a feasible assignment");
            } else {
                assert!(feasible(&s), "no conflict on an infeasible assignment");
            }
        }
    }

    #[test]
    fn test_every_propagation_has_a_false_support() {
        let mut rng = SmallRng::seed_from_u64(0xfa15e);
        for _ in 0..40 {
            let mut s = Solver::new();
            let width = rng.random_range(2..=5u32);
            let bv = s.new_bitvector(width).unwrap();
            let bits = s.theory.bit_lits(bv);
            let mut lits = bits.clone();
            for _ in 0..3 {
                let ops = [CmpOp::Lt, CmpOp::Leq, CmpOp::Gt, CmpOp::Geq];
                let op = ops[rng.random_range(0..4)];
                let to = rng.random_range(0..(1i64 << width));
                lits.push(s.comparison(op, bv, to).unwrap());
            }
            if s.propagate().is_err() {
                continue;
            }

            for _ in 0..width + 2 {
                let i = rng.random_range(0..lits.len());
                let l = if rng.random_bool(0.5) { lits[i] } else { !lits[i] };
                if s.value(l).is_some() {
                    continue;
                }
                s.decide(l);
                if s.propagate().is_err() {
                    break;
                }
                for (p, _) in s.core.propagated() {
                    let reason = s.explain(p);
                    assert!(reason.contains(&p));
                    assert_support_false(&s, &reason, Some(p));
                }
            }
        }
    }

    #[test]
    fn test_rational_weights_propagate_without_bit_refinement() {
        use num_rational::Ratio;
        type Q = Ratio<i64>;
        let mut s: BvSolver<Q> = BvSolver::new();
        let bv = s.new_bitvector(3).unwrap();
        let bits = s.theory.bit_lits(bv);
        let half = Ratio::new(1, 2);
        let lt = s.comparison(CmpOp::Lt, bv, half).unwrap();
        s.propagate().unwrap();

        // Below one half means zero.
        assert!(s.decide(lt));
        s.propagate().unwrap();
        assert_eq!(s.theory.bounds(bv), (Q::ZERO, Q::ZERO));
        for &b in &bits {
            assert_eq!(s.value(b), Some(false));
        }
    }

    #[test]
    fn test_fractional_strict_bounds_round_to_integers() {
        use num_rational::Ratio;
        type Q = Ratio<i64>;
        let mut s: BvSolver<Q> = BvSolver::new();
        let bv = s.new_bitvector(3).unwrap();
        let gt = s.comparison(CmpOp::Gt, bv, Ratio::new(1, 2)).unwrap();
        let lt = s.comparison(CmpOp::Lt, bv, Ratio::new(5, 2)).unwrap();
        s.propagate().unwrap();

        // Values are integral: above 1/2 means at least 1, below 5/2 at most 2.
        assert!(s.decide(gt));
        assert!(s.decide(lt));
        s.propagate().unwrap();
        assert_eq!(
            s.theory.bounds(bv),
            (Ratio::from_integer(1), Ratio::from_integer(2))
        );
    }
}

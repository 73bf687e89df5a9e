//! The propagation fixpoint: drains the dirty stack, refreshing bounds,
//! forcing bit and comparison literals, cascading across the addition graph
//! and failing fast on the first conflict.

use itertools::Itertools;
use tracing::debug;

use crate::core::Lit;
use crate::num::Weight;
use crate::theory::theory::CmpRhs;
use crate::theory::{BvRef, BvTheory, CmpOp, Conflict, SatEngine};

impl<W: Weight> BvTheory<W> {
    /// Runs propagation to a global fixpoint, or returns the first conflict
    /// found. The conflict clause is in host numbering. After a conflict the
    /// theory stays usable; the host is expected to backtrack.
    pub fn propagate(&mut self, sat: &mut impl SatEngine) -> Result<(), Conflict> {
        self.stats.propagations += 1;
        if !self.requires_propagation {
            self.stats.propagations_skipped += 1;
            return Ok(());
        }
        self.fast_forward();
        let propagate_lits = self.config.propagate_literals;

        while let Some(bv) = self.altered.pop() {
            debug_assert!(self.altered_set.contains(usize::from(bv)));
            self.refresh(bv);

            // Scan bits from most significant, tracking the partial sum of
            // decided bits against the freshly computed interval.
            let width = self.bvs[bv].bits.len();
            let mut under = W::ZERO;
            let mut over = W::max_value(width as u32);
            for i in (0..width).rev() {
                let l = self.bvs[bv].bits[i];
                let bit = W::bit(i as u32);
                match self.value(l) {
                    Some(true) => {
                        under += bit;
                        if under > self.bvs[bv].over {
                            self.stats.bit_conflicts += 1;
                            let mut conflict = Vec::new();
                            for j in (i..width).rev() {
                                let bj = self.bvs[bv].bits[j];
                                if self.value(bj) == Some(true) {
                                    conflict.push(!bj);
                                }
                            }
                            let over_cur = self.bvs[bv].over;
                            let limit = self.trail.len();
                            self.build_value_reason(CmpOp::Leq, bv, over_cur, &mut conflict, limit);
                            return Err(self.conflict_to_solver(bv, conflict));
                        }
                    }
                    Some(false) => {
                        over -= bit;
                        if over < self.bvs[bv].under {
                            self.stats.bit_conflicts += 1;
                            let mut conflict = Vec::new();
                            for j in (i..width).rev() {
                                let bj = self.bvs[bv].bits[j];
                                if self.value(bj) == Some(false) {
                                    conflict.push(bj);
                                }
                            }
                            let under_cur = self.bvs[bv].under;
                            let limit = self.trail.len();
                            self.build_value_reason(CmpOp::Geq, bv, under_cur, &mut conflict, limit);
                            return Err(self.conflict_to_solver(bv, conflict));
                        }
                    }
                    None if propagate_lits => {
                        if over - bit < self.bvs[bv].under {
                            self.enqueue_lit(sat, l, self.bit_marker);
                            under += bit;
                        } else if under + bit > self.bvs[bv].over {
                            self.enqueue_lit(sat, !l, self.bit_marker);
                            over -= bit;
                        }
                    }
                    None => {}
                }
            }

            // Bit assignments made above can tighten the interval further.
            self.refresh(bv);

            if let Err(c) = self.check_addition_result(bv) {
                return Err(c);
            }
            if let Err(c) = self.check_addition_args(bv) {
                return Err(c);
            }
            if let Err(c) = self.scan_const_compares(sat, bv, propagate_lits) {
                return Err(c);
            }
            if let Err(c) = self.scan_bv_compares(sat, bv, propagate_lits) {
                return Err(c);
            }

            if propagate_lits && self.bvs[bv].watched {
                self.bound_updates.push(bv);
            }

            self.altered_set.remove(usize::from(bv));
        }

        self.requires_propagation = false;
        Ok(())
    }

    /// If `bv` is defined as `a + b`, checks the interval consistency of the
    /// sum and re-dirties whichever operand a tighter bound is now derivable
    /// for.
    fn check_addition_result(&mut self, bv: BvRef) -> Result<(), Conflict> {
        let Some(add) = self.bvs[bv].addition else {
            return Ok(());
        };
        let (a, b) = (add.a, add.b);
        // The derived interval is deliberately not clamped to the width: a
        // derived lower bound past the maximum is a conflict with the clamped
        // interval of the sum, not a wrap-around.
        let under = self.bvs[a].under + self.bvs[b].under;
        let over = self.bvs[a].over + self.bvs[b].over;
        let under_cur = self.bvs[bv].under;
        let over_cur = self.bvs[bv].over;
        if under_cur > over || over_cur < under {
            self.stats.addition_conflicts += 1;
            let mut conflict = Vec::new();
            let limit = self.trail.len();
            self.build_addition_reason(bv, &mut conflict, limit);
            return Err(self.conflict_to_solver(bv, conflict));
        }
        if under_cur - self.bvs[b].over > self.bvs[a].under
            || over_cur - self.bvs[b].under < self.bvs[a].over
        {
            self.mark_altered(a);
        }
        if under_cur - self.bvs[a].over > self.bvs[b].under
            || over_cur - self.bvs[a].under < self.bvs[b].over
        {
            self.mark_altered(b);
        }
        Ok(())
    }

    /// Symmetric checks for every addition `bv` participates in as an operand.
    fn check_addition_args(&mut self, bv: BvRef) -> Result<(), Conflict> {
        for i in 0..self.bvs[bv].arg_of.len() {
            let arg = self.bvs[bv].arg_of[i];
            let under = self.bvs[arg.sum].under - self.bvs[arg.other].over;
            let over = self.bvs[arg.sum].over - self.bvs[arg.other].under;
            let under_cur = self.bvs[bv].under;
            let over_cur = self.bvs[bv].over;
            if under_cur > over || over_cur < under {
                self.stats.addition_conflicts += 1;
                let mut conflict = Vec::new();
                let limit = self.trail.len();
                self.build_addition_arg_reason(bv, i, &mut conflict, limit);
                return Err(self.conflict_to_solver(bv, conflict));
            }
            if under_cur + self.bvs[arg.other].under > self.bvs[arg.sum].under
                || over_cur + self.bvs[arg.other].over < self.bvs[arg.sum].over
            {
                self.mark_altered(arg.sum);
            }
            if self.bvs[arg.sum].under - over_cur > self.bvs[arg.other].under
                || self.bvs[arg.sum].over - under_cur < self.bvs[arg.other].over
            {
                self.mark_altered(arg.other);
            }
        }
        Ok(())
    }

    /// Forces or refutes constant-target comparison literals decided by the
    /// current interval.
    fn scan_const_compares(
        &mut self,
        sat: &mut impl SatEngine,
        bv: BvRef,
        propagate_lits: bool,
    ) -> Result<(), Conflict> {
        // Over side, smallest constant first.
        for i in 0..self.bvs[bv].compares.len() {
            let cid = self.bvs[bv].compares[i];
            let c = self.comparisons[cid];
            let CmpRhs::Const(to) = c.rhs else { continue };
            let over = self.bvs[bv].over;
            let l = c.lit;
            if (c.op == CmpOp::Lt && over < to) || (c.op == CmpOp::Leq && over <= to) {
                match self.value(l) {
                    Some(true) => {}
                    Some(false) => {
                        return Err(self.comparison_conflict(l, c.op, bv, to));
                    }
                    None if propagate_lits => {
                        self.enqueue_lit(sat, l, self.cmp_marker);
                    }
                    None => {}
                }
            } else if (c.op == CmpOp::Gt && over <= to) || (c.op == CmpOp::Geq && over < to) {
                match self.value(l) {
                    Some(true) => {
                        return Err(self.comparison_conflict(!l, c.op.negated(), bv, to));
                    }
                    Some(false) => {}
                    None if propagate_lits => {
                        self.enqueue_lit(sat, !l, self.cmp_marker);
                    }
                    None => {}
                }
            }
        }
        // Under side, largest constant first.
        for i in (0..self.bvs[bv].compares.len()).rev() {
            let cid = self.bvs[bv].compares[i];
            let c = self.comparisons[cid];
            let CmpRhs::Const(to) = c.rhs else { continue };
            let under = self.bvs[bv].under;
            let l = c.lit;
            if (c.op == CmpOp::Lt && under >= to) || (c.op == CmpOp::Leq && under > to) {
                match self.value(l) {
                    Some(true) => {
                        return Err(self.comparison_conflict(!l, c.op.negated(), bv, to));
                    }
                    Some(false) => {}
                    None if propagate_lits => {
                        self.enqueue_lit(sat, !l, self.cmp_marker);
                    }
                    None => {}
                }
            } else if (c.op == CmpOp::Gt && under > to) || (c.op == CmpOp::Geq && under >= to) {
                match self.value(l) {
                    Some(true) => {}
                    Some(false) => {
                        return Err(self.comparison_conflict(l, c.op, bv, to));
                    }
                    None if propagate_lits => {
                        self.enqueue_lit(sat, l, self.cmp_marker);
                    }
                    None => {}
                }
            }
        }
        Ok(())
    }

    fn comparison_conflict(&mut self, push: Lit, op: CmpOp, bv: BvRef, to: W) -> Conflict {
        self.stats.comparison_conflicts += 1;
        let mut conflict = vec![push];
        let limit = self.trail.len();
        self.build_value_reason(op, bv, to, &mut conflict, limit);
        self.conflict_to_solver(bv, conflict)
    }

    /// Forces or refutes bitvector-target comparison literals, and re-dirties
    /// the other operand when an asserted comparison newly tightens it.
    fn scan_bv_compares(
        &mut self,
        sat: &mut impl SatEngine,
        bv: BvRef,
        propagate_lits: bool,
    ) -> Result<(), Conflict> {
        // Over side against the other operand's under bound.
        for i in 0..self.bvs[bv].bv_compares.len() {
            let cid = self.bvs[bv].bv_compares[i];
            let c = self.comparisons[cid];
            let CmpRhs::Bv(other) = c.rhs else { continue };
            // Normalize to the asserted (or still open) direction.
            let (l, op) = if self.value(c.lit) == Some(false) {
                (!c.lit, c.op.negated())
            } else {
                (c.lit, c.op)
            };
            let over = self.bvs[bv].over;
            let under = self.bvs[bv].under;
            let under_comp = self.bvs[other].under;
            if (op == CmpOp::Lt && over < under_comp) || (op == CmpOp::Leq && over <= under_comp) {
                if self.value(l).is_none() && propagate_lits {
                    self.enqueue_lit(sat, l, self.cmp_marker);
                }
            } else if (op == CmpOp::Gt && over <= under_comp)
                || (op == CmpOp::Geq && over < under_comp)
            {
                if self.value(l) == Some(true) {
                    self.stats.bv_comparison_conflicts += 1;
                    let mut conflict = vec![!l];
                    let limit = self.trail.len();
                    self.build_value_reason_bv(op.negated(), bv, other, &mut conflict, limit);
                    return Err(self.conflict_to_solver(bv, conflict));
                } else if self.value(l).is_none() && propagate_lits {
                    self.enqueue_lit(sat, !l, self.cmp_marker);
                }
            }
            if self.value(l) == Some(true)
                && ((op == CmpOp::Lt && under >= under_comp)
                    || (op == CmpOp::Leq && under > under_comp))
            {
                self.mark_altered(other);
            }
        }
        // Under side against the other operand's over bound.
        for i in (0..self.bvs[bv].bv_compares.len()).rev() {
            let cid = self.bvs[bv].bv_compares[i];
            let c = self.comparisons[cid];
            let CmpRhs::Bv(other) = c.rhs else { continue };
            let (l, op) = if self.value(c.lit) == Some(false) {
                (!c.lit, c.op.negated())
            } else {
                (c.lit, c.op)
            };
            let over = self.bvs[bv].over;
            let under = self.bvs[bv].under;
            let over_comp = self.bvs[other].over;
            if (op == CmpOp::Lt && under >= over_comp) || (op == CmpOp::Leq && under > over_comp) {
                if self.value(l) == Some(true) {
                    self.stats.bv_comparison_conflicts += 1;
                    let mut conflict = vec![!l];
                    let limit = self.trail.len();
                    self.build_value_reason_bv(op.negated(), bv, other, &mut conflict, limit);
                    return Err(self.conflict_to_solver(bv, conflict));
                } else if self.value(l).is_none() && propagate_lits {
                    self.enqueue_lit(sat, !l, self.cmp_marker);
                }
            } else if (op == CmpOp::Gt && under > over_comp)
                || (op == CmpOp::Geq && under >= over_comp)
            {
                if self.value(l).is_none() && propagate_lits {
                    self.enqueue_lit(sat, l, self.cmp_marker);
                }
            }
            if self.value(l) == Some(true)
                && ((op == CmpOp::Gt && over <= over_comp) || (op == CmpOp::Geq && over < over_comp))
            {
                self.mark_altered(other);
            }
        }
        Ok(())
    }

    /// Translates a conflict to host numbering and restores the live view.
    /// The conflicting bitvector goes back on the dirty stack so that it is
    /// reprocessed after the host backtracks.
    pub(crate) fn conflict_to_solver(&mut self, bv: BvRef, lits: Vec<Lit>) -> Conflict {
        self.fast_forward();
        self.altered.push(bv);
        debug_assert!(self.altered_set.contains(usize::from(bv)));
        let clause: Vec<_> = lits
            .into_iter()
            .unique()
            .map(|l| self.to_solver_lit(l))
            .collect();
        debug!(bv = ?bv, clause = ?clause, "conflict");
        Conflict(clause)
    }
}

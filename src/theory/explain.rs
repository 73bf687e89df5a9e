//! On-demand construction of clausal justifications.
//!
//! Every reason is rebuilt against the state the solver was in when the fact
//! was derived: the builder rewinds the analysis view of the trail (bounds,
//! causes, and a position-bounded view of assignments) to just after the
//! fact's own entry, dispatches on the recorded cause, and fast-forwards
//! before returning. The live state is never mutated.
//!
//! Recursion follows recorded causes, which always point at strictly older
//! derivations, so every justification chain is finite.

use itertools::Itertools;
use tracing::trace;

use crate::core::Lit;
use crate::num::Weight;
use crate::theory::cause::CauseSource;
use crate::theory::theory::{CmpRhs, VarKind};
use crate::theory::{BvRef, BvTheory, CmpOp, ReasonRef};

impl<W: Weight> BvTheory<W> {
    /// Builds into `out` the reason clause for a literal previously enqueued
    /// under `marker`. Both the literal and the produced clause are in host
    /// numbering; the literal itself is included in the clause.
    pub fn explain(&mut self, solver_lit: Lit, marker: ReasonRef, out: &mut Vec<Lit>) {
        self.stats.explanations += 1;
        let v = self.solver_vars[solver_lit.var()];
        let p = Lit::new(v, solver_lit.is_positive());
        debug_assert_ne!(self.value(p), Some(false));

        // View the state as of the fact's own assignment.
        let limit = match self.vars[v].trail_index {
            Some(idx) if self.vars[v].value == Some(p.is_positive()) => usize::from(idx) + 1,
            _ => self.trail.len(),
        };
        self.rewind_to(limit);
        self.analysis_value_limit = limit;

        out.clear();
        out.push(p);
        if marker == self.cmp_marker {
            let VarKind::Cmp(cid) = self.vars[v].kind else {
                unreachable!("comparison reason requested for a bit variable");
            };
            let c = self.comparisons[cid];
            let op = if p.is_negative() { c.op.negated() } else { c.op };
            match c.rhs {
                CmpRhs::Const(w) => self.build_value_reason(op, c.bv, w, out, limit),
                CmpRhs::Bv(other) => self.build_value_reason_bv(op, c.bv, other, out, limit),
            }
        } else if marker == self.bit_marker {
            let VarKind::Bit(bv) = self.vars[v].kind else {
                unreachable!("bit reason requested for a comparison variable");
            };
            // The bit was forced because flipping it would cross the interval;
            // justify both sides of the interval as it stood.
            let under = self.bvs[bv].under;
            let over = self.bvs[bv].over;
            self.build_value_reason(CmpOp::Leq, bv, over, out, limit);
            self.build_value_reason(CmpOp::Geq, bv, under, out, limit);
        } else {
            unreachable!("unknown reason marker {marker:?}");
        }

        let deduped: Vec<Lit> = out.drain(..).unique().map(|l| self.to_solver_lit(l)).collect();
        out.extend(deduped);
        trace!(lit = ?solver_lit, clause = ?out, "explanation built");

        self.analysis_value_limit = usize::MAX;
        self.fast_forward();
    }

    /// Justifies `bv op to` as of the first `limit` trail entries, pushing the
    /// required false literals onto `out`.
    pub(crate) fn build_value_reason(
        &mut self,
        op: CmpOp,
        bv: BvRef,
        to: W,
        out: &mut Vec<Lit>,
        limit: usize,
    ) {
        if self.bvs[bv].is_const {
            return;
        }
        self.rewind_to(limit);
        // Drop every event that is not needed for the bound to hold; children
        // explain their own facts from the resulting position.
        let next = self.rewind_until(bv, op, to);

        let compare_over = matches!(op, CmpOp::Lt | CmpOp::Leq);
        let under_cur = self.bvs[bv].under;
        let over_cur = self.bvs[bv].over;
        debug_assert!(if compare_over {
            op.apply(&over_cur, &to)
        } else {
            op.apply(&under_cur, &to)
        });

        // Bounds at their level-0 value are permanent facts.
        if !compare_over && under_cur <= self.bvs[bv].under0 {
            return;
        }
        if compare_over && over_cur >= self.bvs[bv].over0 {
            return;
        }

        let cause = if compare_over {
            self.bvs[bv].over_cause
        } else {
            self.bvs[bv].under_cause
        };
        debug_assert!(cause.has_cause());

        if cause.refined {
            // Refinement depends on the whole bit assignment; include the
            // pinned bits and keep looking for the underlying cause.
            let width = self.bvs[bv].bits.len();
            for i in 0..width {
                let bl = self.bvs[bv].bits[i];
                if compare_over {
                    if self.analysis_value(bl) == Some(true) {
                        out.push(!bl);
                    }
                } else if self.analysis_value(bl) == Some(false) {
                    out.push(bl);
                }
            }
        }

        match cause.source {
            CauseSource::Bits if compare_over => {
                // A false bit may be omitted when the bound would hold even
                // with that bit true; level-0 bits are permanent.
                let mut over = over_cur;
                let width = self.bvs[bv].bits.len();
                for i in 0..width {
                    let bl = self.bvs[bv].bits[i];
                    if self.analysis_value(bl) == Some(false) {
                        let bit = W::bit(i as u32);
                        if op.apply(&(over + bit), &to) && self.level_of(bl.var()) > 0 {
                            over += bit;
                        } else {
                            out.push(bl);
                        }
                    }
                }
            }
            CauseSource::Bits => {
                let mut under = under_cur;
                let width = self.bvs[bv].bits.len();
                for i in 0..width {
                    let bl = self.bvs[bv].bits[i];
                    if self.analysis_value(bl) == Some(true) {
                        let bit = W::bit(i as u32);
                        if op.apply(&(under - bit), &to) && self.level_of(bl.var()) > 0 {
                            under -= bit;
                        } else {
                            out.push(!bl);
                        }
                    }
                }
            }
            CauseSource::Addition => {
                let add = self.bvs[bv].addition.unwrap_or_else(|| {
                    unreachable!("addition cause on a bitvector without a defining addition")
                });
                // Split the threshold between the operands using their bounds
                // as of this position.
                if compare_over {
                    let (over_a, over_b) = (self.bvs[add.a].over, self.bvs[add.b].over);
                    self.build_value_reason(op, add.a, to - over_b, out, next);
                    self.build_value_reason(op, add.b, to - over_a, out, next);
                } else {
                    let (under_a, under_b) = (self.bvs[add.a].under, self.bvs[add.b].under);
                    self.build_value_reason(op, add.a, to - under_b, out, next);
                    self.build_value_reason(op, add.b, to - under_a, out, next);
                }
            }
            CauseSource::AdditionArg(i) => {
                // bv = sum - other: an upper bound on bv needs an upper bound
                // on the sum and a lower bound on the other operand.
                let arg = self.bvs[bv].arg_of[i];
                if compare_over {
                    let under_other = self.bvs[arg.other].under;
                    self.build_value_reason(op, arg.sum, to + under_other, out, next);
                    self.build_value_reason(CmpOp::Geq, arg.other, under_other, out, next);
                } else {
                    let over_other = self.bvs[arg.other].over;
                    self.build_value_reason(op, arg.sum, to + over_other, out, next);
                    self.build_value_reason(CmpOp::Leq, arg.other, over_other, out, next);
                }
            }
            CauseSource::Comparison(cid) => {
                let c = self.comparisons[cid];
                if self.analysis_value(c.lit) == Some(true) {
                    out.push(!c.lit);
                } else {
                    out.push(c.lit);
                }
                if let CmpRhs::Bv(other) = c.rhs {
                    if compare_over {
                        let over_other = self.bvs[other].over;
                        self.build_value_reason(CmpOp::Leq, other, over_other, out, next);
                    } else {
                        let under_other = self.bvs[other].under;
                        self.build_value_reason(CmpOp::Geq, other, under_other, out, next);
                    }
                }
            }
            CauseSource::None => {
                debug_assert!(cause.refined, "bound has no recorded cause");
            }
        }
    }

    /// Justifies `bv op other` where both sides are bitvectors, bisecting on a
    /// weight between their relevant bounds so each side reduces to an
    /// independently justifiable value fact.
    pub(crate) fn build_value_reason_bv(
        &mut self,
        op: CmpOp,
        bv: BvRef,
        other: BvRef,
        out: &mut Vec<Lit>,
        limit: usize,
    ) {
        self.rewind_to(limit);
        let next = limit;
        let under_cur = self.bvs[bv].under;
        let over_cur = self.bvs[bv].over;
        let under_comp = self.bvs[other].under;
        let over_comp = self.bvs[other].over;
        debug_assert!(match op {
            CmpOp::Lt => over_cur < under_comp,
            CmpOp::Leq => over_cur <= under_comp,
            CmpOp::Geq => under_cur >= over_comp,
            CmpOp::Gt => under_cur > over_comp,
        });

        if self.bvs[bv].is_const && self.bvs[other].is_const {
            return;
        }
        if self.bvs[other].is_const {
            debug_assert_eq!(under_comp, over_comp);
            self.build_value_reason(op, bv, under_comp, out, next);
        } else if self.bvs[bv].is_const {
            debug_assert_eq!(under_cur, over_cur);
            self.build_value_reason(op.swapped(), other, over_cur, out, next);
        } else {
            let (midval, c_op) = match op {
                CmpOp::Lt | CmpOp::Leq => {
                    ((under_comp - over_cur).half_ceil() + over_cur, CmpOp::Geq)
                }
                CmpOp::Gt | CmpOp::Geq => {
                    ((under_cur - over_comp).half_floor() + over_comp, CmpOp::Leq)
                }
            };
            self.build_value_reason(op, bv, midval, out, next);
            self.build_value_reason(c_op, other, midval, out, next);
        }
    }

    /// Conflict reason for an inconsistent defining addition `bv = a + b`.
    pub(crate) fn build_addition_reason(&mut self, bv: BvRef, out: &mut Vec<Lit>, limit: usize) {
        self.rewind_to(limit);
        let next = limit;
        let add = self.bvs[bv].addition.unwrap_or_else(|| {
            unreachable!("addition conflict on a bitvector without a defining addition")
        });
        let (a, b) = (add.a, add.b);
        // Unclamped, mirroring the conflict check.
        let under_add = self.bvs[a].under + self.bvs[b].under;
        let over_add = self.bvs[a].over + self.bvs[b].over;
        let (under_a, over_a) = (self.bvs[a].under, self.bvs[a].over);
        let (under_b, over_b) = (self.bvs[b].under, self.bvs[b].over);

        if self.bvs[bv].under > over_add {
            self.build_value_reason(CmpOp::Gt, bv, over_add, out, next);
            self.build_value_reason(CmpOp::Leq, a, over_a, out, next);
            self.build_value_reason(CmpOp::Leq, b, over_b, out, next);
        } else {
            debug_assert!(self.bvs[bv].over < under_add);
            self.build_value_reason(CmpOp::Lt, bv, under_add, out, next);
            self.build_value_reason(CmpOp::Geq, a, under_a, out, next);
            self.build_value_reason(CmpOp::Geq, b, under_b, out, next);
        }
    }

    /// Conflict reason for an addition `sum = bv + other`, seen from the
    /// operand side.
    pub(crate) fn build_addition_arg_reason(
        &mut self,
        bv: BvRef,
        argindex: usize,
        out: &mut Vec<Lit>,
        limit: usize,
    ) {
        self.rewind_to(limit);
        let next = limit;
        let arg = self.bvs[bv].arg_of[argindex];
        let under_add = self.bvs[arg.sum].under - self.bvs[arg.other].over;
        let over_add = self.bvs[arg.sum].over - self.bvs[arg.other].under;
        let (under_other, over_other) = (self.bvs[arg.other].under, self.bvs[arg.other].over);
        let (under_sum, over_sum) = (self.bvs[arg.sum].under, self.bvs[arg.sum].over);

        if self.bvs[bv].under > over_add {
            self.build_value_reason(CmpOp::Leq, arg.sum, over_sum, out, next);
            self.build_value_reason(CmpOp::Geq, arg.other, under_other, out, next);
            self.build_value_reason(CmpOp::Gt, bv, over_add, out, next);
        } else {
            debug_assert!(self.bvs[bv].over < under_add);
            self.build_value_reason(CmpOp::Geq, arg.sum, under_sum, out, next);
            self.build_value_reason(CmpOp::Leq, arg.other, over_other, out, next);
            self.build_value_reason(CmpOp::Lt, bv, under_add, out, next);
        }
    }
}

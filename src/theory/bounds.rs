//! Bound maintenance: per-bitvector recomputation of the tightest derivable
//! `[under, over]` interval, with the tightening source recorded as the cause.

use tracing::trace;

use crate::backtrack::Backtrack;
use crate::num::Weight;
use crate::theory::cause::{Cause, CauseSource};
use crate::theory::theory::CmpRhs;
use crate::theory::{BvRef, BvTheory, CmpOp};

impl<W: Weight> BvTheory<W> {
    /// Recomputes `bv`'s bounds from scratch as the intersection of its bits,
    /// its defining addition, the additions it is an operand of, and its
    /// asserted comparisons, then applies bit-level refinement and clamps the
    /// result into the level-0 window. Returns whether either bound changed.
    pub(crate) fn refresh(&mut self, bv: BvRef) -> bool {
        if self.bvs[bv].is_const {
            return false;
        }
        debug_assert_eq!(self.analysis_pos, self.trail.len());
        self.stats.refreshes += 1;
        let width = self.bvs[bv].width();
        let prev = self.snapshot(bv);
        let under0 = self.bvs[bv].under0;
        let over0 = self.bvs[bv].over0;

        let mut under_new = W::ZERO;
        let mut over_new = W::ZERO;
        let mut under_cause = Cause::NONE;
        let mut over_cause = Cause::NONE;

        for i in 0..width as usize {
            let bit = W::bit(i as u32);
            match self.value(self.bvs[bv].bits[i]) {
                Some(true) => {
                    under_new += bit;
                    over_new += bit;
                    under_cause = Cause::from_source(CauseSource::Bits);
                }
                Some(false) => {
                    over_cause = Cause::from_source(CauseSource::Bits);
                }
                None => {
                    over_new += bit;
                }
            }
        }

        if let Some(add) = self.bvs[bv].addition {
            let under = self.bvs[add.a].under + self.bvs[add.b].under;
            let over = self.bvs[add.a].over + self.bvs[add.b].over;
            if under > under_new {
                under_new = under;
                under_cause = Cause::from_source(CauseSource::Addition);
            }
            if over < over_new {
                over_new = over;
                over_cause = Cause::from_source(CauseSource::Addition);
            }
        }

        for i in 0..self.bvs[bv].arg_of.len() {
            let arg = self.bvs[bv].arg_of[i];
            let under = self.bvs[arg.sum].under - self.bvs[arg.other].over;
            let over = self.bvs[arg.sum].over - self.bvs[arg.other].under;
            if under > under_new {
                under_new = under;
                under_cause = Cause::from_source(CauseSource::AdditionArg(i));
            }
            if over < over_new {
                over_new = over;
                over_cause = Cause::from_source(CauseSource::AdditionArg(i));
            }
        }

        // Over side: comparisons asserted true for {<,<=}, false for {>,>=}.
        for i in (0..self.bvs[bv].compares.len()).rev() {
            let cid = self.bvs[bv].compares[i];
            let c = self.comparisons[cid];
            let CmpRhs::Const(w) = c.rhs else { continue };
            if let Some(clamped) = clamp_over(c.op, self.value(c.lit), over_new, w, under0) {
                over_new = clamped;
                over_cause = Cause::from_source(CauseSource::Comparison(cid));
            }
        }
        // Under side: the duals.
        for i in 0..self.bvs[bv].compares.len() {
            let cid = self.bvs[bv].compares[i];
            let c = self.comparisons[cid];
            let CmpRhs::Const(w) = c.rhs else { continue };
            if let Some(clamped) = clamp_under(c.op, self.value(c.lit), under_new, w, over0, false) {
                under_new = clamped;
                under_cause = Cause::from_source(CauseSource::Comparison(cid));
            }
        }

        // Comparisons against other bitvectors: same tables, with the
        // constant replaced by the other operand's matching bound.
        for i in (0..self.bvs[bv].bv_compares.len()).rev() {
            let cid = self.bvs[bv].bv_compares[i];
            let c = self.comparisons[cid];
            let CmpRhs::Bv(other) = c.rhs else { continue };
            let w = self.bvs[other].over;
            if let Some(clamped) = clamp_over(c.op, self.value(c.lit), over_new, w, under0) {
                over_new = clamped;
                over_cause = Cause::from_source(CauseSource::Comparison(cid));
            }
        }
        for i in 0..self.bvs[bv].bv_compares.len() {
            let cid = self.bvs[bv].bv_compares[i];
            let c = self.comparisons[cid];
            let CmpRhs::Bv(other) = c.rhs else { continue };
            let w = self.bvs[other].under;
            if let Some(clamped) = clamp_under(c.op, self.value(c.lit), under_new, w, over0, true) {
                under_new = clamped;
                under_cause = Cause::from_source(CauseSource::Comparison(cid));
            }
        }

        if W::BIT_REFINEMENT {
            if let Some(refined) = self.refine_lbound(bv, over_new) {
                if refined < over_new {
                    trace!(bv = ?bv, from = %over_new, to = %refined, "refined over bound");
                    over_new = refined;
                    over_cause.refined = true;
                }
            }
            if let Some(refined) = self.refine_ubound(bv, under_new) {
                if refined > under_new {
                    trace!(bv = ?bv, from = %under_new, to = %refined, "refined under bound");
                    under_new = refined;
                    under_cause.refined = true;
                }
            }
        }

        if under_new > over0 {
            under_new = over0;
        }
        if over_new > over0 {
            over_new = over0;
        }
        if under_new < under0 {
            under_new = under0;
        }
        if over_new < under0 {
            over_new = under0;
        }

        {
            let b = &mut self.bvs[bv];
            b.under = under_new;
            b.over = over_new;
            b.under_cause = under_cause;
            b.over_cause = over_cause;
        }
        let new = self.snapshot(bv);
        if new != prev {
            self.record_bound_change(bv, prev, new);
        }

        if self.trail.num_saved() == 0 {
            let b = &mut self.bvs[bv];
            b.under0 = under_new;
            b.over0 = over_new;
            if under_new == over_new {
                debug_assert!(!b.is_const);
                b.is_const = true;
                self.stats.consts += 1;
            }
        }

        let changed = prev.under != under_new || prev.over != over_new;
        if changed {
            trace!(bv = ?bv, under = %under_new, over = %over_new, "bounds refreshed");
        }
        changed
    }

    /// Smallest value of `bv` under the current bit assignment: the sum of its
    /// true bits.
    pub(crate) fn lowest(&self, bv: BvRef) -> W {
        let mut v = W::ZERO;
        for (i, &l) in self.bvs[bv].bits.iter().enumerate() {
            if self.value(l) == Some(true) {
                v += W::bit(i as u32);
            }
        }
        v
    }

    /// Largest value of `bv` under the current bit assignment: the sum of its
    /// non-false bits.
    pub(crate) fn highest(&self, bv: BvRef) -> W {
        let mut v = W::ZERO;
        for (i, &l) in self.bvs[bv].bits.iter().enumerate() {
            if self.value(l) != Some(false) {
                v += W::bit(i as u32);
            }
        }
        v
    }

    /// The lowest value achievable under the current partial bit assignment
    /// that is `>= bound`, or None if no assigned-bit completion reaches
    /// `bound`.
    ///
    /// The naive under approximation assumes every unknown bit can be zero,
    /// which may be unachievable once high true bits force a carry pattern;
    /// this searches, most significant bit first, for the cheapest set of
    /// unknown bits that closes the gap.
    pub(crate) fn refine_ubound(&self, bv: BvRef, bound: W) -> Option<W> {
        debug_assert!(W::BIT_REFINEMENT);
        let n = self.bvs[bv].bits.len();
        if bound > W::max_value(n as u32) {
            return None;
        }
        let bound = if bound < W::ZERO { W::ZERO } else { bound };
        let bit_val = |i: i64| self.value(self.bvs[bv].bits[i as usize]);
        let bound_bit = |i: i64| bound.test_bit(i as u32);

        let mut done = false;
        let mut last_set_x: i64 = -1;
        let mut j: i64 = n as i64 - 1;
        let mut proposed = W::ZERO;

        let mut i: i64 = n as i64 - 1;
        'outer: while i >= 0 && !done {
            if bit_val(i) != Some(true) && bound_bit(i) {
                let mut found = false;
                while j >= i {
                    if bit_val(j).is_none() && !proposed.test_bit(j as u32) {
                        last_set_x = j;
                    } else if !bound_bit(j)
                        && (bit_val(j) == Some(true) || proposed.test_bit(j as u32))
                    {
                        found = true;
                        last_set_x = -1;
                        if j > i {
                            done = true;
                            break;
                        }
                    }
                    j -= 1;
                }
                if last_set_x > -1 {
                    found = true;
                    let x = last_set_x;
                    // Consumed; the rescan must pick a fresh candidate.
                    last_set_x = -1;
                    debug_assert!(!proposed.test_bit(x as u32));
                    proposed = proposed.with_bit(x as u32);
                    if x > i {
                        break 'outer;
                    } else {
                        debug_assert_eq!(x, i);
                        j = n as i64 - 1;
                    }
                }
                if !found {
                    return None;
                }
            }
            i -= 1;
        }

        let mut refined = self.lowest(bv);
        let mut j: i64 = n as i64 - 1;
        while j >= 0 {
            if proposed.test_bit(j as u32) {
                debug_assert!(!refined.test_bit(j as u32));
                refined = refined.with_bit(j as u32);
                if !bound_bit(j) {
                    break;
                }
            }
            j -= 1;
        }

        if refined < bound {
            return None;
        }
        Some(refined)
    }

    /// The highest value achievable under the current partial bit assignment
    /// that is `<= obound`, or None if every completion exceeds it.
    ///
    /// Runs the same search as [`BvTheory::refine_ubound`] on the bitwise
    /// complement: false bits of the vector play the role of true bits, and
    /// the result is complemented back at the end.
    pub(crate) fn refine_lbound(&self, bv: BvRef, obound: W) -> Option<W> {
        debug_assert!(W::BIT_REFINEMENT);
        let n = self.bvs[bv].bits.len();
        if obound < W::ZERO {
            return None;
        }
        let max = W::max_value(n as u32);
        let obound = if obound > max { max } else { obound };
        let bit_val = |i: i64| self.value(self.bvs[bv].bits[i as usize]);
        let bound_bit = |i: i64| !obound.test_bit(i as u32);

        let mut done = false;
        let mut last_set_x: i64 = -1;
        let mut j: i64 = n as i64 - 1;
        let mut proposed = W::ZERO;

        let mut i: i64 = n as i64 - 1;
        'outer: while i >= 0 && !done {
            if bit_val(i) != Some(false) && bound_bit(i) {
                let mut found = false;
                while j >= i {
                    if bit_val(j).is_none() && !proposed.test_bit(j as u32) {
                        last_set_x = j;
                    } else if !bound_bit(j)
                        && (bit_val(j) == Some(false) || proposed.test_bit(j as u32))
                    {
                        found = true;
                        last_set_x = -1;
                        if j > i {
                            done = true;
                            break;
                        }
                    }
                    j -= 1;
                }
                if last_set_x > -1 {
                    found = true;
                    let x = last_set_x;
                    last_set_x = -1;
                    debug_assert!(!proposed.test_bit(x as u32));
                    proposed = proposed.with_bit(x as u32);
                    if x > i {
                        break 'outer;
                    } else {
                        debug_assert_eq!(x, i);
                        j = n as i64 - 1;
                    }
                }
                if !found {
                    return None;
                }
            }
            i -= 1;
        }

        // Base: the complemented vector's fixed ones are this vector's false
        // bits.
        let mut complement = W::ZERO;
        for i in 0..n {
            if bit_val(i as i64) == Some(false) {
                complement += W::bit(i as u32);
            }
        }
        let mut j: i64 = n as i64 - 1;
        while j >= 0 {
            if proposed.test_bit(j as u32) {
                debug_assert!(!complement.test_bit(j as u32));
                complement = complement.with_bit(j as u32);
                if !bound_bit(j) {
                    break;
                }
            }
            j -= 1;
        }

        let refined = max - complement;
        if refined > obound {
            return None;
        }
        Some(refined)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    use crate::theory::BvSolver;

    /// A forced low bit makes the all-zero completion unreachable; both
    /// searches must step over it instead of reusing a spent candidate.
    #[test]
    fn test_refinement_with_a_forced_low_bit() {
        let mut s: BvSolver<i64> = BvSolver::new();
        let bv = s.new_bitvector(2).unwrap();
        let bits = s.theory.bit_lits(bv);
        s.propagate().unwrap();
        assert!(s.decide(bits[0]));
        s.propagate().unwrap();

        // Reachable values are 1 and 3.
        assert_eq!(s.theory.refine_lbound(bv, 0), None);
        assert_eq!(s.theory.refine_lbound(bv, 2), Some(1));
        assert_eq!(s.theory.refine_ubound(bv, 2), Some(3));
        assert_eq!(s.theory.refine_ubound(bv, 1), Some(1));
    }

    /// The refinement search must agree with plain enumeration of the values
    /// reachable under the current partial bit assignment.
    #[test]
    fn test_refinement_matches_enumeration() {
        let mut rng = SmallRng::seed_from_u64(0xb17);
        for _ in 0..120 {
            let mut s: BvSolver<i64> = BvSolver::new();
            let width = rng.random_range(1..=8u32);
            let bv = s.new_bitvector(width).unwrap();
            let bits = s.theory.bit_lits(bv);
            s.propagate().unwrap();
            for i in 0..width as usize {
                match rng.random_range(0..3) {
                    0 => assert!(s.decide(bits[i])),
                    1 => assert!(s.decide(!bits[i])),
                    _ => {}
                }
            }
            // No constraint is registered, so this can only record the bits.
            s.propagate().unwrap();

            let reachable: Vec<i64> = (0..(1i64 << width))
                .filter(|&val| {
                    (0..width as usize).all(|i| match s.value(bits[i]) {
                        Some(b) => (val >> i) & 1 == b as i64,
                        None => true,
                    })
                })
                .collect();
            for bound in 0..(1i64 << width) {
                let expected_up = reachable.iter().copied().find(|&v| v >= bound);
                assert_eq!(
                    s.theory.refine_ubound(bv, bound),
                    expected_up,
                    "refine_ubound({bound}) with bits {:?}",
                    (0..width as usize).map(|i| s.value(bits[i])).collect::<Vec<_>>()
                );
                let expected_down = reachable.iter().copied().rev().find(|&v| v <= bound);
                assert_eq!(
                    s.theory.refine_lbound(bv, bound),
                    expected_down,
                    "refine_lbound({bound}) with bits {:?}",
                    (0..width as usize).map(|i| s.value(bits[i])).collect::<Vec<_>>()
                );
            }
        }
    }
}

/// One step of the over-bound clamp table. Returns the clamped value when the
/// comparison's literal truth tightens the over bound, respecting the level-0
/// floor.
fn clamp_over<W: Weight>(
    op: CmpOp,
    value: Option<bool>,
    over_new: W,
    w: W,
    under0: W,
) -> Option<W> {
    match op {
        // A strict bound clamps to the largest attainable value below the
        // threshold, which rounds a fractional threshold down.
        CmpOp::Lt if value == Some(true) => {
            let p = w.pred();
            if over_new > p && p >= under0 {
                Some(p)
            } else {
                None
            }
        }
        CmpOp::Leq if value == Some(true) && over_new > w && w >= under0 => Some(w),
        CmpOp::Gt if value == Some(false) && over_new > w && w >= under0 => Some(w),
        CmpOp::Geq if value == Some(false) => {
            let p = w.pred();
            if over_new > p && p >= under0 {
                Some(p)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// One step of the under-bound clamp table, the dual of [`clamp_over`].
fn clamp_under<W: Weight>(
    op: CmpOp,
    value: Option<bool>,
    under_new: W,
    w: W,
    over0: W,
    strict_leq_guard: bool,
) -> Option<W> {
    match op {
        CmpOp::Lt if value == Some(false) && under_new < w && w <= over0 => Some(w),
        CmpOp::Leq if value == Some(false) => {
            let s = w.succ();
            let guard = if strict_leq_guard { s <= over0 } else { w <= over0 };
            if under_new < s && guard {
                Some(s)
            } else {
                None
            }
        }
        CmpOp::Gt if value == Some(true) => {
            let s = w.succ();
            if under_new < s && s <= over0 {
                Some(s)
            } else {
                None
            }
        }
        CmpOp::Geq if value == Some(true) && under_new < w && w <= over0 => Some(w),
        _ => None,
    }
}

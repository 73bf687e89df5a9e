use anyhow::{bail, ensure};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::backtrack::{Backtrack, BacktrackWith, DecLvl, EventIndex, Trail};
use crate::collections::ref_store::{RefMap, RefVec};
use crate::core::{Lit, Var};
use crate::num::Weight;
use crate::theory::cause::Cause;
use crate::theory::{BvConfig, BvRef, CmpOp, CmpRef, ReasonRef, SatEngine, Stats};

/// What a theory variable stands for.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum VarKind {
    /// A bit of the given bitvector.
    Bit(BvRef),
    /// The truth value of the given comparison.
    Cmp(CmpRef),
}

pub(crate) struct VarData {
    pub solver_var: Var,
    pub kind: VarKind,
    pub value: Option<bool>,
    pub trail_index: Option<EventIndex>,
}

/// The defining addition of a bitvector: `owner = a + b`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct Addition {
    pub a: BvRef,
    pub b: BvRef,
}

/// Back-link from an operand of an addition to the sum and the other operand.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct SumArg {
    pub sum: BvRef,
    pub other: BvRef,
}

pub(crate) struct Bv<W> {
    /// Bit literals, least significant first. Immutable after creation.
    pub bits: Vec<Lit>,
    pub under: W,
    pub over: W,
    /// Level-0 window; bounds never escape `[under0, over0]`.
    pub under0: W,
    pub over0: W,
    pub under_cause: Cause,
    pub over_cause: Cause,
    /// Comparisons against constants, sorted by constant.
    pub compares: Vec<CmpRef>,
    /// Comparisons against other bitvectors, sorted by the other operand's id.
    pub bv_compares: Vec<CmpRef>,
    pub addition: Option<Addition>,
    pub arg_of: SmallVec<[SumArg; 2]>,
    /// Permanently fixed to a single value at level 0.
    pub is_const: bool,
    pub watched: bool,
}

impl<W> Bv<W> {
    pub fn width(&self) -> u32 {
        self.bits.len() as u32
    }
}

/// The right-hand side of a comparison.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum CmpRhs<W> {
    Const(W),
    Bv(BvRef),
}

/// One comparison record. A bitvector-vs-bitvector comparison is stored as two
/// records sharing the same literal, one on each operand with swapped
/// direction; the literal's variable is attached to the first.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct Comparison<W> {
    pub op: CmpOp,
    pub bv: BvRef,
    pub rhs: CmpRhs<W>,
    pub lit: Lit,
}

/// Bounds and causes of one bitvector at one point in time.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct BoundsSnapshot<W> {
    pub under: W,
    pub over: W,
    pub under_cause: Cause,
    pub over_cause: Cause,
}

/// One event on the theory trail.
///
/// Bound events are exact diffs written by the refresh that produced them, so
/// undoing any suffix of the trail restores precisely the earlier state; no
/// recomputation is needed on backtrack.
#[derive(Copy, Clone, Debug)]
pub(crate) enum TrailEvent<W> {
    /// A theory variable was assigned.
    Assign { var: Var, value: bool, owner: BvRef },
    /// A refresh changed the bounds or causes of a bitvector.
    Bound {
        bv: BvRef,
        prev: BoundsSnapshot<W>,
        new: BoundsSnapshot<W>,
    },
}

/// The bitvector theory. Generic over the numeric type bounds are computed in.
pub struct BvTheory<W> {
    pub(crate) config: BvConfig,
    pub(crate) stats: Stats,
    pub(crate) vars: RefVec<Var, VarData>,
    /// Host variable to theory variable.
    pub(crate) solver_vars: RefMap<Var, Var>,
    pub(crate) bvs: RefVec<BvRef, Bv<W>>,
    pub(crate) comparisons: RefVec<CmpRef, Comparison<W>>,
    pub(crate) trail: Trail<TrailEvent<W>>,
    /// Number of trail entries applied to the bound state. Equal to the trail
    /// length except while the explanation builder has rewound the view.
    pub(crate) analysis_pos: usize,
    /// Assignments recorded at trail index `>= limit` are hidden from
    /// [`BvTheory::analysis_value`].
    pub(crate) analysis_value_limit: usize,
    /// Dirty stack driving the propagation fixpoint.
    pub(crate) altered: Vec<BvRef>,
    pub(crate) altered_set: bit_set::BitSet,
    pub(crate) requires_propagation: bool,
    /// Refreshed watched bitvectors, drained by layered plugins.
    pub(crate) bound_updates: Vec<BvRef>,
    pub(crate) bit_marker: ReasonRef,
    pub(crate) cmp_marker: ReasonRef,
}

impl<W: Weight> BvTheory<W> {
    pub fn new(sat: &mut impl SatEngine, config: BvConfig) -> Self {
        BvTheory {
            config,
            stats: Stats::default(),
            vars: RefVec::new(),
            solver_vars: RefMap::new(),
            bvs: RefVec::new(),
            comparisons: RefVec::new(),
            trail: Trail::new(),
            analysis_pos: 0,
            analysis_value_limit: usize::MAX,
            altered: Vec::new(),
            altered_set: bit_set::BitSet::new(),
            requires_propagation: false,
            bound_updates: Vec::new(),
            bit_marker: sat.new_reason_marker(),
            cmp_marker: sat.new_reason_marker(),
        }
    }

    // ===== registration =====

    /// Creates a bitvector of the given width over fresh host variables.
    pub fn new_bitvector(&mut self, sat: &mut impl SatEngine, width: u32) -> anyhow::Result<BvRef> {
        ensure!(width > 0, "bitvector width must be positive");
        ensure!(
            width <= W::MAX_WIDTH,
            "bitvector width {width} exceeds the maximum {} of the weight type",
            W::MAX_WIDTH
        );
        let vars: Vec<Var> = (0..width).map(|_| sat.new_var()).collect();
        self.new_bitvector_from_vars(&vars)
    }

    /// Creates a bitvector over existing host variables, least significant
    /// first.
    pub fn new_bitvector_from_vars(&mut self, solver_vars: &[Var]) -> anyhow::Result<BvRef> {
        let width = solver_vars.len() as u32;
        ensure!(width > 0, "bitvector width must be positive");
        ensure!(
            width <= W::MAX_WIDTH,
            "bitvector width {width} exceeds the maximum {} of the weight type",
            W::MAX_WIDTH
        );
        let id = self.bvs.next_key();
        let mut bits = Vec::with_capacity(solver_vars.len());
        for &sv in solver_vars {
            if self.solver_vars.contains(sv) {
                bail!("variable {sv:?} is already attached to the theory");
            }
            let v = self.attach_var(sv, VarKind::Bit(id));
            bits.push(Lit::positive(v));
        }
        let max = W::max_value(width);
        self.bvs.push(Bv {
            bits,
            under: W::ZERO,
            over: max,
            under0: W::ZERO,
            over0: max,
            under_cause: Cause::NONE,
            over_cause: Cause::NONE,
            compares: Vec::new(),
            bv_compares: Vec::new(),
            addition: None,
            arg_of: SmallVec::new(),
            is_const: false,
            watched: false,
        });
        self.mark_altered(id);
        self.requires_propagation = true;
        Ok(id)
    }

    /// Registers `sum = a + b`. The operands must precede the sum and have the
    /// same width, and a bitvector can be defined by at most one addition.
    pub fn new_addition(&mut self, sum: BvRef, a: BvRef, b: BvRef) -> anyhow::Result<()> {
        ensure!(
            self.bvs.contains(sum) && self.bvs.contains(a) && self.bvs.contains(b),
            "undefined bitvector in addition {sum:?} = {a:?} + {b:?}"
        );
        ensure!(
            a < sum && b < sum,
            "addition result {sum:?} must have a greater id than its operands {a:?}, {b:?}"
        );
        ensure!(
            self.bvs[sum].width() == self.bvs[a].width() && self.bvs[sum].width() == self.bvs[b].width(),
            "bit widths must match in addition {sum:?} = {a:?} + {b:?}"
        );
        ensure!(
            self.bvs[sum].addition.is_none(),
            "bitvector {sum:?} is already the result of an addition"
        );
        self.bvs[sum].addition = Some(Addition { a, b });
        self.bvs[a].arg_of.push(SumArg { sum, other: b });
        self.bvs[b].arg_of.push(SumArg { sum, other: a });
        self.mark_altered(sum);
        self.mark_altered(a);
        self.mark_altered(b);
        self.requires_propagation = true;
        Ok(())
    }

    /// Registers (or reuses) the literal standing for `bv op to`.
    ///
    /// Returns the host literal. If the current bounds already decide the
    /// comparison, the literal is enqueued into the host immediately.
    pub fn comparison(
        &mut self,
        sat: &mut impl SatEngine,
        op: CmpOp,
        bv: BvRef,
        to: W,
    ) -> anyhow::Result<Lit> {
        ensure!(self.bvs.contains(bv), "undefined bitvector {bv:?}");
        for &cid in &self.bvs[bv].compares {
            let c = &self.comparisons[cid];
            if c.op == op && c.rhs == CmpRhs::Const(to) {
                return Ok(self.to_solver_lit(c.lit));
            }
        }
        let cid = self.comparisons.next_key();
        let sv = sat.new_var();
        let v = self.attach_var(sv, VarKind::Cmp(cid));
        let l = Lit::positive(v);

        self.refresh(bv);
        self.comparisons.push(Comparison {
            op,
            bv,
            rhs: CmpRhs::Const(to),
            lit: l,
        });
        let pos = self.bvs[bv]
            .compares
            .iter()
            .position(|&c| match self.comparisons[c].rhs {
                CmpRhs::Const(w) => w >= to,
                CmpRhs::Bv(_) => true,
            })
            .unwrap_or(self.bvs[bv].compares.len());
        self.bvs[bv].compares.insert(pos, cid);
        self.mark_altered(bv);
        self.requires_propagation = true;

        let (under, over) = (self.bvs[bv].under, self.bvs[bv].over);
        match cmp_decided(op, under, over, to, to) {
            Some(true) if self.value(l).is_none() => {
                self.enqueue_lit(sat, l, self.cmp_marker);
            }
            Some(false) if self.value(l).is_none() => {
                self.enqueue_lit(sat, !l, self.cmp_marker);
            }
            _ => {}
        }
        Ok(self.to_solver_lit(l))
    }

    /// Registers (or reuses) the literal standing for `a op b` where both
    /// sides are bitvectors. The record is installed on both operands, with
    /// the direction swapped on the second.
    pub fn comparison_bv(
        &mut self,
        sat: &mut impl SatEngine,
        op: CmpOp,
        a: BvRef,
        b: BvRef,
    ) -> anyhow::Result<Lit> {
        ensure!(a != b, "comparison between {a:?} and itself");
        if a < b {
            return self.comparison_bv(sat, op.swapped(), b, a);
        }
        ensure!(
            self.bvs.contains(a) && self.bvs.contains(b),
            "undefined bitvector in comparison {a:?} {op} {b:?}"
        );
        for &cid in &self.bvs[a].bv_compares {
            let c = &self.comparisons[cid];
            if c.op == op && c.rhs == CmpRhs::Bv(b) {
                return Ok(self.to_solver_lit(c.lit));
            }
        }
        let cid = self.comparisons.next_key();
        let sv = sat.new_var();
        let v = self.attach_var(sv, VarKind::Cmp(cid));
        let l = Lit::positive(v);

        self.refresh(a);
        self.refresh(b);
        self.comparisons.push(Comparison {
            op,
            bv: a,
            rhs: CmpRhs::Bv(b),
            lit: l,
        });
        self.insert_bv_compare(a, cid, b);
        let mirror = self.comparisons.push(Comparison {
            op: op.swapped(),
            bv: b,
            rhs: CmpRhs::Bv(a),
            lit: l,
        });
        self.insert_bv_compare(b, mirror, a);
        self.mark_altered(a);
        self.mark_altered(b);
        self.requires_propagation = true;

        let (under, over) = (self.bvs[a].under, self.bvs[a].over);
        let (under_b, over_b) = (self.bvs[b].under, self.bvs[b].over);
        match cmp_decided(op, under, over, under_b, over_b) {
            Some(true) if self.value(l).is_none() => {
                self.enqueue_lit(sat, l, self.cmp_marker);
            }
            Some(false) if self.value(l).is_none() => {
                self.enqueue_lit(sat, !l, self.cmp_marker);
            }
            _ => {}
        }
        Ok(self.to_solver_lit(l))
    }

    fn insert_bv_compare(&mut self, bv: BvRef, cid: CmpRef, other: BvRef) {
        let pos = self.bvs[bv]
            .bv_compares
            .iter()
            .position(|&c| match self.comparisons[c].rhs {
                CmpRhs::Bv(o) => o >= other,
                CmpRhs::Const(_) => false,
            })
            .unwrap_or(self.bvs[bv].bv_compares.len());
        self.bvs[bv].bv_compares.insert(pos, cid);
    }

    /// Fixes a bitvector to a constant by emitting one unit clause per bit.
    pub fn assert_const(
        &mut self,
        sat: &mut impl SatEngine,
        bv: BvRef,
        value: W,
    ) -> anyhow::Result<()> {
        ensure!(self.bvs.contains(bv), "undefined bitvector {bv:?}");
        let width = self.bvs[bv].width();
        ensure!(
            value >= W::ZERO && value <= W::max_value(width),
            "constant {value} does not fit in {width} bits"
        );
        let mut rest = value;
        for i in (0..width).rev() {
            let w = W::bit(i);
            let l = self.to_solver_lit(self.bvs[bv].bits[i as usize]);
            if rest >= w {
                rest -= w;
                sat.add_clause(&[l]);
            } else {
                sat.add_clause(&[!l]);
            }
        }
        Ok(())
    }

    fn attach_var(&mut self, solver_var: Var, kind: VarKind) -> Var {
        let v = self.vars.push(VarData {
            solver_var,
            kind,
            value: None,
            trail_index: None,
        });
        self.solver_vars.insert(solver_var, v);
        v
    }

    // ===== search-time interface =====

    /// Records an assignment made by the host. A no-op for variables the
    /// theory does not know, or for echoes of its own propagations.
    pub fn on_assignment(&mut self, solver_lit: Lit) {
        let Some(&v) = self.solver_vars.get(solver_lit.var()) else {
            return;
        };
        self.fast_forward();
        let l = Lit::new(v, solver_lit.is_positive());
        if self.vars[v].value.is_some() {
            debug_assert_eq!(self.vars[v].value, Some(l.is_positive()));
            return;
        }
        self.record_assignment(l);
    }

    /// Registers `bv` for bound-update notifications, drained through
    /// [`BvTheory::take_bound_updates`].
    pub fn watch(&mut self, bv: BvRef) {
        self.bvs[bv].watched = true;
    }

    /// Watched bitvectors whose bounds were refreshed since the last call, in
    /// refresh order.
    pub fn take_bound_updates(&mut self) -> Vec<BvRef> {
        std::mem::take(&mut self.bound_updates)
    }

    pub(crate) fn record_assignment(&mut self, l: Lit) {
        debug_assert_eq!(self.analysis_pos, self.trail.len());
        let v = l.var();
        debug_assert!(self.vars[v].value.is_none());
        let owner = self.owner_of(v);
        let idx = self.trail.push(TrailEvent::Assign {
            var: v,
            value: l.is_positive(),
            owner,
        });
        self.analysis_pos = self.trail.len();
        self.vars[v].value = Some(l.is_positive());
        self.vars[v].trail_index = Some(idx);
        self.requires_propagation = true;
        self.mark_altered(owner);
        trace!(lit = ?l, owner = ?owner, "assignment recorded");
    }

    /// Logs a bound diff produced by a refresh. Root-level changes are
    /// permanent and are not logged.
    pub(crate) fn record_bound_change(
        &mut self,
        bv: BvRef,
        prev: BoundsSnapshot<W>,
        new: BoundsSnapshot<W>,
    ) {
        debug_assert_eq!(self.analysis_pos, self.trail.len());
        if self.trail.num_saved() == 0 {
            return;
        }
        self.trail.push(TrailEvent::Bound { bv, prev, new });
        self.analysis_pos = self.trail.len();
    }

    /// Records the assignment internally, then hands the literal to the host.
    pub(crate) fn enqueue_lit(&mut self, sat: &mut impl SatEngine, l: Lit, marker: ReasonRef) {
        self.record_assignment(l);
        self.stats.enqueued += 1;
        let _ = sat.enqueue(self.to_solver_lit(l), marker);
    }

    // ===== state access =====

    pub(crate) fn owner_of(&self, v: Var) -> BvRef {
        match self.vars[v].kind {
            VarKind::Bit(bv) => bv,
            VarKind::Cmp(c) => self.comparisons[c].bv,
        }
    }

    pub(crate) fn snapshot(&self, bv: BvRef) -> BoundsSnapshot<W> {
        let b = &self.bvs[bv];
        BoundsSnapshot {
            under: b.under,
            over: b.over,
            under_cause: b.under_cause,
            over_cause: b.over_cause,
        }
    }

    /// Truth value of a theory literal under the live assignment.
    pub(crate) fn value(&self, l: Lit) -> Option<bool> {
        self.vars[l.var()].value.map(|v| l.value_given(v))
    }

    /// Truth value of a theory literal, restricted to assignments recorded
    /// before the analysis limit. Used by the explanation builder.
    pub(crate) fn analysis_value(&self, l: Lit) -> Option<bool> {
        let data = &self.vars[l.var()];
        match (data.value, data.trail_index) {
            (Some(v), Some(idx)) if usize::from(idx) < self.analysis_value_limit => {
                Some(l.value_given(v))
            }
            _ => None,
        }
    }

    /// Decision level at which an assigned variable was recorded.
    pub(crate) fn level_of(&self, v: Var) -> u32 {
        match self.vars[v].trail_index {
            Some(idx) => self.trail.decision_level(idx).to_int(),
            None => 0,
        }
    }

    pub(crate) fn to_solver_lit(&self, l: Lit) -> Lit {
        Lit::new(self.vars[l.var()].solver_var, l.is_positive())
    }

    pub(crate) fn mark_altered(&mut self, bv: BvRef) {
        if self.altered_set.insert(usize::from(bv)) {
            self.altered.push(bv);
        }
    }

    // ===== analysis rewind =====

    /// Moves the analysis view so that exactly the first `n` trail events are
    /// applied to the bound state. Assignments themselves are not touched.
    pub(crate) fn rewind_to(&mut self, n: usize) {
        debug_assert!(n <= self.trail.len());
        while self.analysis_pos < n {
            if let TrailEvent::Bound { bv, new, .. } = self.trail.events()[self.analysis_pos] {
                self.apply_snapshot(bv, new);
            }
            self.analysis_pos += 1;
        }
        while self.analysis_pos > n {
            self.analysis_pos -= 1;
            if let TrailEvent::Bound { bv, prev, .. } = self.trail.events()[self.analysis_pos] {
                self.apply_snapshot(bv, prev);
            }
        }
    }

    /// Rewinds until undoing one more event would make `bv`'s bound stop
    /// satisfying `op to`. Returns the resulting analysis position.
    pub(crate) fn rewind_until(&mut self, bv: BvRef, op: CmpOp, to: W) -> usize {
        while self.analysis_pos > 0 {
            if let TrailEvent::Bound { bv: owner, prev, .. } =
                self.trail.events()[self.analysis_pos - 1]
            {
                if owner == bv {
                    let stop = match op {
                        CmpOp::Lt => prev.over >= to,
                        CmpOp::Leq => prev.over > to,
                        CmpOp::Gt => prev.under <= to,
                        CmpOp::Geq => prev.under < to,
                    };
                    if stop {
                        break;
                    }
                }
                self.apply_snapshot(owner, prev);
            }
            self.analysis_pos -= 1;
        }
        self.analysis_pos
    }

    pub(crate) fn fast_forward(&mut self) {
        self.rewind_to(self.trail.len());
    }

    fn apply_snapshot(&mut self, bv: BvRef, snap: BoundsSnapshot<W>) {
        let b = &mut self.bvs[bv];
        b.under = snap.under;
        b.over = snap.over;
        b.under_cause = snap.under_cause;
        b.over_cause = snap.over_cause;
    }

    // ===== accessors =====

    pub fn width(&self, bv: BvRef) -> u32 {
        self.bvs[bv].width()
    }

    /// Current `[under, over]` interval.
    pub fn bounds(&self, bv: BvRef) -> (W, W) {
        (self.bvs[bv].under, self.bvs[bv].over)
    }

    /// The permanent level-0 window.
    pub fn root_bounds(&self, bv: BvRef) -> (W, W) {
        (self.bvs[bv].under0, self.bvs[bv].over0)
    }

    pub fn is_const(&self, bv: BvRef) -> bool {
        self.bvs[bv].is_const
    }

    /// The bit literals of `bv` in host numbering, least significant first.
    pub fn bit_lits(&self, bv: BvRef) -> Vec<Lit> {
        self.bvs[bv].bits.iter().map(|&l| self.to_solver_lit(l)).collect()
    }

    /// Truth value the theory currently records for a host literal, if the
    /// literal belongs to the theory.
    pub fn value_of(&self, solver_lit: Lit) -> Option<bool> {
        let &v = self.solver_vars.get(solver_lit.var())?;
        self.value(Lit::new(v, solver_lit.is_positive()))
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn print_stats(&self) {
        let s = &self.stats;
        println!("[{}] propagations: {} ({} skipped)", self.config.label, s.propagations, s.propagations_skipped);
        println!("[{}] bound refreshes: {}", self.config.label, s.refreshes);
        println!("[{}] literals enqueued: {}", self.config.label, s.enqueued);
        println!(
            "[{}] conflicts: {} bit, {} addition, {} comparison, {} bv-comparison",
            self.config.label, s.bit_conflicts, s.addition_conflicts, s.comparison_conflicts, s.bv_comparison_conflicts
        );
        println!("[{}] explanations built: {}", self.config.label, s.explanations);
        println!("[{}] constant bitvectors: {}", self.config.label, s.consts);
    }

    /// Writes one satisfying value per bitvector, as currently bounded.
    pub fn write_witness(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        for (id, bv) in self.bvs.entries() {
            writeln!(out, "bv{} := {}", id.to_u32(), bv.under)?;
        }
        Ok(())
    }
}

impl<W: Weight> Backtrack for BvTheory<W> {
    fn save_state(&mut self) -> DecLvl {
        self.fast_forward();
        self.trail.save_state()
    }

    fn num_saved(&self) -> u32 {
        self.trail.num_saved()
    }

    fn restore_last(&mut self) {
        self.fast_forward();
        let bvs = &mut self.bvs;
        let vars = &mut self.vars;
        let altered = &mut self.altered;
        let altered_set = &mut self.altered_set;
        self.trail.restore_last_with(|e| {
            let touched = match *e {
                TrailEvent::Assign { var, value, owner } => {
                    debug_assert_eq!(vars[var].value, Some(value));
                    vars[var].value = None;
                    vars[var].trail_index = None;
                    owner
                }
                TrailEvent::Bound { bv, prev, .. } => {
                    let b = &mut bvs[bv];
                    b.under = prev.under;
                    b.over = prev.over;
                    b.under_cause = prev.under_cause;
                    b.over_cause = prev.over_cause;
                    bv
                }
            };
            if altered_set.insert(usize::from(touched)) {
                altered.push(touched);
            }
        });
        self.analysis_pos = self.trail.len();
        if !self.altered.is_empty() {
            self.requires_propagation = true;
        }
        debug!(level = ?self.trail.current_decision_level(), "backtracked");
    }
}

/// Whether the interval `[under, over]` already decides `op` against a target
/// whose own interval is `[w_low, w_high]` (a constant has `w_low == w_high`).
fn cmp_decided<W: Weight>(op: CmpOp, under: W, over: W, w_low: W, w_high: W) -> Option<bool> {
    let truth = |op: CmpOp| match op {
        CmpOp::Lt => over < w_low,
        CmpOp::Leq => over <= w_low,
        CmpOp::Gt => under > w_high,
        CmpOp::Geq => under >= w_high,
    };
    if truth(op) {
        Some(true)
    } else if truth(op.negated()) {
        Some(false)
    } else {
        None
    }
}

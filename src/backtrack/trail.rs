use crate::backtrack::{Backtrack, BacktrackWith};
use std::num::NonZeroU32;

/// Represents a decision level.
///
/// The ROOT is the level at which no decision has been made.
/// Each time a decision is made, the decision level increases.
///
/// As a layout optimization, the internal representation disallows the 0
/// value, which lets the compiler fit an `Option<DecLvl>` in 32 bits.
#[derive(Copy, Clone, Ord, PartialOrd, PartialEq, Eq, Hash)]
pub struct DecLvl(NonZeroU32);

impl DecLvl {
    /// The root decision level, at which no decision has been taken yet.
    pub const ROOT: DecLvl = Self::new(0);

    pub const fn new(num_saved: u32) -> Self {
        match NonZeroU32::new(num_saved + 1) {
            Some(n) => DecLvl(n),
            None => panic!("decision level overflow"),
        }
    }

    /// Integer representation of the decision level. 0 represents the ROOT.
    pub fn to_int(self) -> u32 {
        self.0.get() - 1
    }
}

impl Default for DecLvl {
    fn default() -> Self {
        Self::ROOT
    }
}

impl std::ops::Add<i32> for DecLvl {
    type Output = DecLvl;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Self::new(((self.to_int() as i32) + rhs) as u32)
    }
}

impl std::ops::Sub<i32> for DecLvl {
    type Output = DecLvl;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        self + (-rhs)
    }
}

impl From<u32> for DecLvl {
    fn from(u: u32) -> Self {
        DecLvl::new(u)
    }
}
impl From<DecLvl> for usize {
    fn from(dl: DecLvl) -> Self {
        dl.to_int() as usize
    }
}

impl std::fmt::Debug for DecLvl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dl({})", self.to_int())
    }
}

/// Index of an event in a [Trail].
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct EventIndex(NonZeroU32);

impl EventIndex {
    pub fn new(index: usize) -> Self {
        EventIndex(NonZeroU32::new(index as u32 + 1).expect("event index overflow"))
    }
}
impl From<EventIndex> for usize {
    fn from(ei: EventIndex) -> Self {
        (ei.0.get() - 1) as usize
    }
}
impl From<usize> for EventIndex {
    fn from(u: usize) -> Self {
        Self::new(u)
    }
}

impl<T> std::ops::Index<EventIndex> for Vec<T> {
    type Output = T;

    fn index(&self, index: EventIndex) -> &Self::Output {
        &self[usize::from(index)]
    }
}

/// An event log with decision-level checkpoints.
///
/// Events are pushed in chronological order. [Backtrack::save_state] records a
/// checkpoint; [BacktrackWith::restore_last_with] pops every event after the
/// last checkpoint, invoking a callback on each in anti-chronological order.
#[derive(Clone)]
pub struct Trail<V> {
    events: Vec<V>,
    /// Maps each decision level to the index of its first event.
    backtrack_points: Vec<EventIndex>,
}

impl<V> Default for Trail<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Trail<V> {
    pub fn new() -> Self {
        Trail {
            events: Vec::new(),
            backtrack_points: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_slot(&self) -> EventIndex {
        EventIndex::new(self.events.len())
    }

    pub fn push(&mut self, value: V) -> EventIndex {
        let id = self.next_slot();
        self.events.push(value);
        id
    }

    pub fn peek(&self) -> Option<&V> {
        self.events.last()
    }

    pub fn get_event(&self, id: EventIndex) -> &V {
        &self.events[id]
    }

    /// All events, in chronological order.
    pub fn events(&self) -> &[V] {
        &self.events
    }

    /// The decision level at which the given event was pushed.
    pub fn decision_level(&self, id: EventIndex) -> DecLvl {
        let idx = self.backtrack_points.partition_point(|ev| *ev <= id);
        DecLvl::new(idx as u32)
    }

    fn backtrack_with_callback(&mut self, mut f: impl FnMut(&V)) {
        let after_last = self.backtrack_points.pop().expect("no backtrack point left");
        let id = usize::from(after_last);
        for ev in self.events[id..].iter().rev() {
            f(ev)
        }
        self.events.truncate(id);
    }
}

impl<V> Backtrack for Trail<V> {
    fn save_state(&mut self) -> DecLvl {
        self.backtrack_points.push(EventIndex::new(self.events.len()));
        self.current_decision_level()
    }

    fn num_saved(&self) -> u32 {
        self.backtrack_points.len() as u32
    }

    fn restore_last(&mut self) {
        self.backtrack_with_callback(|_| ())
    }
}

impl<V> BacktrackWith for Trail<V> {
    type Event = V;

    fn restore_last_with<F: FnMut(&Self::Event)>(&mut self, callback: F) {
        self.backtrack_with_callback(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtracks() {
        let mut q = Trail::new();
        q.push(1);
        q.push(2);
        q.save_state();
        q.push(3);
        q.push(4);
        assert_eq!(q.len(), 4);

        let mut undone = Vec::new();
        q.restore_last_with(|&ev| undone.push(ev));
        assert_eq!(undone, vec![4, 3]);
        assert_eq!(q.events(), &[1, 2]);
        assert_eq!(q.current_decision_level(), DecLvl::ROOT);
    }

    #[test]
    fn test_decision_levels() {
        let mut trail = Trail::new();
        assert_eq!(trail.current_decision_level(), DecLvl::ROOT);
        let ia = trail.push("a");
        trail.save_state();
        let ib = trail.push("b");
        trail.save_state();
        trail.save_state();
        let ic = trail.push("c");

        assert_eq!(trail.decision_level(ia), DecLvl::ROOT);
        assert_eq!(trail.decision_level(ib), DecLvl::new(1));
        assert_eq!(trail.decision_level(ic), DecLvl::new(3));
    }

    #[test]
    fn test_restore_to_level() {
        let mut q = Trail::new();
        q.push(0);
        let lvl = q.save_state();
        q.push(1);
        q.save_state();
        q.push(2);
        q.restore(lvl);
        assert_eq!(q.events(), &[0, 1]);
        assert_eq!(q.num_saved(), 1);
    }
}

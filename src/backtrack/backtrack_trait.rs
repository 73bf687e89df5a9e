use crate::backtrack::DecLvl;

/// Trait for structures that can save and restore their state, by maintaining
/// a stack of backtrack points.
pub trait Backtrack {
    /// Records a new backtrack point and returns the corresponding decision level.
    fn save_state(&mut self) -> DecLvl;

    /// Number of saved backtrack points.
    fn num_saved(&self) -> u32;

    /// The current decision level: the number of saved backtrack points.
    fn current_decision_level(&self) -> DecLvl {
        DecLvl::new(self.num_saved())
    }

    /// Undoes everything since the last backtrack point and removes it.
    fn restore_last(&mut self);

    /// Restores the state as it was when the given decision level was the
    /// current one.
    fn restore(&mut self, saved_id: DecLvl) {
        while self.current_decision_level() > saved_id {
            self.restore_last();
        }
    }

    /// Resets the structure to its root state, removing all backtrack points.
    fn reset(&mut self) {
        self.restore(DecLvl::ROOT);
    }
}

/// A [Backtrack] structure that, upon restoration, can notify the caller of
/// each undone event in anti-chronological order.
pub trait BacktrackWith: Backtrack {
    type Event;

    fn restore_last_with<F: FnMut(&Self::Event)>(&mut self, callback: F);

    fn restore_with<F: FnMut(&Self::Event)>(&mut self, saved_id: DecLvl, mut callback: F) {
        while self.current_decision_level() > saved_id {
            self.restore_last_with(&mut callback);
        }
    }
}

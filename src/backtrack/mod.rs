mod backtrack_trait;
mod trail;

pub use backtrack_trait::{Backtrack, BacktrackWith};
pub use trail::{DecLvl, EventIndex, Trail};

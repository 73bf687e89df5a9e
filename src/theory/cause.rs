//! Cause tags recording why a bound currently has its value.

use crate::theory::CmpRef;

/// The constraint a bound was last tightened by.
///
/// The explanation builder dispatches on this in a fixed precedence order:
/// the [`Cause::refined`] flag first (falling through), then bits, addition,
/// addition argument and comparison.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum CauseSource {
    /// The bound is at its unconstrained extremum.
    #[default]
    None,
    /// The sum of the owner's assigned bits.
    Bits,
    /// The defining addition of the owner, `owner = a + b`.
    Addition,
    /// An addition the owner is an operand of; the index selects the entry in
    /// the owner's back-link list.
    AdditionArg(usize),
    /// An asserted comparison literal.
    Comparison(CmpRef),
}

/// Why the current value of a bound holds.
///
/// `refined` records that bit-level refinement tightened the bound past the
/// value derived from `source`; it can co-occur with any source.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Cause {
    pub refined: bool,
    pub source: CauseSource,
}

impl Cause {
    pub const NONE: Cause = Cause {
        refined: false,
        source: CauseSource::None,
    };

    pub fn from_source(source: CauseSource) -> Cause {
        Cause {
            refined: false,
            source,
        }
    }

    pub fn has_cause(&self) -> bool {
        self.refined || self.source != CauseSource::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_flags() {
        let none = Cause::NONE;
        assert!(!none.has_cause());
        assert_eq!(none, Cause::default());

        let bits = Cause::from_source(CauseSource::Bits);
        assert!(bits.has_cause());

        let refined_only = Cause {
            refined: true,
            source: CauseSource::None,
        };
        assert!(refined_only.has_cause());
    }
}

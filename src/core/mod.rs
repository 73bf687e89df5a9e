//! Boolean variables and literals, in the internal numbering of the theory.

use crate::create_ref_type;

create_ref_type!(Var);

/// A boolean literal: a [Var] together with a polarity.
///
/// Representation: `var << 1 | sign`, where sign 0 is the positive literal.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lit(u32);

impl Lit {
    pub fn new(var: Var, positive: bool) -> Lit {
        Lit(var.to_u32() << 1 | (!positive as u32))
    }

    pub fn positive(var: Var) -> Lit {
        Lit::new(var, true)
    }

    pub fn negative(var: Var) -> Lit {
        Lit::new(var, false)
    }

    pub fn var(self) -> Var {
        Var::new(self.0 >> 1)
    }

    pub fn is_positive(self) -> bool {
        self.0 & 1 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 & 1 == 1
    }

    /// The truth value of this literal given the value of its variable.
    pub fn value_given(self, var_value: bool) -> bool {
        var_value == self.is_positive()
    }
}

impl std::ops::Not for Lit {
    type Output = Lit;

    fn not(self) -> Self::Output {
        Lit(self.0 ^ 1)
    }
}

impl std::fmt::Debug for Lit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_negative() {
            write!(f, "!v{}", self.var().to_u32())
        } else {
            write!(f, "v{}", self.var().to_u32())
        }
    }
}

impl std::fmt::Display for Lit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literals() {
        let v = Var::new(3);
        let l = Lit::positive(v);
        assert_eq!(l.var(), v);
        assert!(l.is_positive());
        assert!((!l).is_negative());
        assert_eq!(!!l, l);
        assert_ne!(l, !l);
        assert!(l.value_given(true));
        assert!(!l.value_given(false));
        assert!((!l).value_given(false));
        assert_eq!(Lit::negative(v), !Lit::positive(v));
    }
}

//! Build-time ownership tracking for object handles.
//!
//! An `Owned` stands for one reference the generated code holds at the current program
//! point. It cannot be cloned and must be consumed: handed to the stack or a local,
//! stolen by a call, or released through the translator. Forgetting one is a compiler
//! warning (`#[must_use]`); duplicating one requires going through `diverge`, which is
//! only sound when the two halves end up on mutually exclusive paths.

use crate::ir::Operand;

#[must_use = "an owned reference must be pushed, stored, stolen or released"]
#[derive(Debug, PartialEq, Eq)]
pub struct Owned {
    op: Operand,
    nullable: bool,
    absent: bool,
}

impl Owned {
    /// A reference known to be non-null.
    pub fn new(op: Operand) -> Self {
        Self {
            op,
            nullable: false,
            absent: false,
        }
    }

    /// A reference that may be null at run time (released with `XDecRef`).
    pub fn nullable(op: Operand) -> Self {
        Self {
            op,
            nullable: true,
            absent: false,
        }
    }

    /// The statically missing operand (an omitted slice bound or raise argument).
    pub fn absent() -> Self {
        Self {
            op: Operand::Null,
            nullable: true,
            absent: true,
        }
    }

    /// Borrow the operand without consuming the reference.
    pub fn operand(&self) -> Operand {
        self.op
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_absent(&self) -> bool {
        self.absent
    }

    /// Split into two handles for two mutually exclusive control paths.
    pub fn diverge(self) -> (Owned, Owned) {
        let twin = Owned {
            op: self.op,
            nullable: self.nullable,
            absent: self.absent,
        };
        (self, twin)
    }

    /// Give the reference away (to the stack, a slot, or a stealing call).
    pub fn transfer(self) -> Operand {
        self.op
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ValueId;

    #[test]
    fn test_absent_is_null_and_nullable() {
        let absent = Owned::absent();
        assert!(absent.is_absent());
        assert!(absent.is_nullable());
        assert_eq!(absent.transfer(), Operand::Null);
    }

    #[test]
    fn test_diverge_keeps_flags() {
        let value = Owned::nullable(Operand::Value(ValueId(3)));
        let (a, b) = value.diverge();
        assert_eq!(a, b);
        assert!(a.is_nullable());
        let _ = a.transfer();
        let _ = b.transfer();
    }
}

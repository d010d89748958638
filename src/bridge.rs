// This module is the runtime call bridge table. Every semantic operation the generated
// code cannot perform inline (arithmetic, comparison, attribute and subscript access,
// global lookup, iteration, slicing, container construction, calls, raises, deallocation)
// is a call to one named host entry point with a fixed signature. The host signals
// failure differently per entry point: most return a null object, the mutation helpers
// return a non-zero int, the truth/containment/exception-match helpers return a negative
// int, and _PyEval_UnpackIterable alone returns non-zero on *success*. That convention is
// part of the external contract, so it is recorded here once per symbol as a
// FailurePolicy and consumed by a single checking routine in the translator rather than
// re-derived at each call site. Host data symbols (singletons, the debug reference total
// and the StopIteration type) are listed in HostGlobal.

//! Host entry points, their signatures and failure conventions.

use crate::ir::{Signature, Ty};
use std::fmt;

/// How an entry point reports failure through its return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePolicy {
    /// Returns an object; null means failure.
    NullOnFailure,
    /// Returns an int; anything other than zero means failure.
    NonZeroOnFailure,
    /// Returns a tri-state int; negative means failure.
    NegativeOnFailure,
    /// Returns an int; zero means failure.
    NonZeroOnSuccess,
    /// Cannot fail, or its result is not a failure signal.
    Infallible,
}

impl FailurePolicy {
    /// A return value this policy treats as failure, if one exists.
    pub fn failure_value(self) -> Option<i64> {
        match self {
            FailurePolicy::NullOnFailure | FailurePolicy::NonZeroOnSuccess => Some(0),
            FailurePolicy::NonZeroOnFailure | FailurePolicy::NegativeOnFailure => Some(-1),
            FailurePolicy::Infallible => None,
        }
    }

    /// Whether `value` (sign-extended) signals failure under this policy.
    pub fn is_failure(self, value: i64) -> bool {
        match self {
            FailurePolicy::NullOnFailure | FailurePolicy::NonZeroOnSuccess => value == 0,
            FailurePolicy::NonZeroOnFailure => value != 0,
            FailurePolicy::NegativeOnFailure => value < 0,
            FailurePolicy::Infallible => false,
        }
    }
}

/// Static description of one entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPointDesc {
    pub name: &'static str,
    pub params: &'static [Ty],
    pub ret: Option<Ty>,
    pub policy: FailurePolicy,
}

impl EntryPointDesc {
    pub fn signature(&self) -> Signature {
        Signature::new(self.params, self.ret)
    }
}

macro_rules! entry_points {
    (@ret void) => { None };
    (@ret $ty:ident) => { Some(Ty::$ty) };
    ($( $variant:ident => $name:literal ( $($param:ident),* ) -> $ret:tt , $policy:ident ; )*) => {
        /// Closed set of host entry points called by generated code.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum EntryPoint {
            $( $variant, )*
        }

        impl EntryPoint {
            pub const ALL: &'static [EntryPoint] = &[ $( EntryPoint::$variant, )* ];

            pub const fn desc(self) -> EntryPointDesc {
                match self {
                    $( EntryPoint::$variant => EntryPointDesc {
                        name: $name,
                        params: &[ $( Ty::$param ),* ],
                        ret: entry_points!(@ret $ret),
                        policy: FailurePolicy::$policy,
                    }, )*
                }
            }
        }
    };
}

entry_points! {
    // Binary number protocol.
    NumberAdd => "PyNumber_Add"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberSubtract => "PyNumber_Subtract"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberMultiply => "PyNumber_Multiply"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberDivide => "PyNumber_Divide"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberTrueDivide => "PyNumber_TrueDivide"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberFloorDivide => "PyNumber_FloorDivide"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberRemainder => "PyNumber_Remainder"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberLshift => "PyNumber_Lshift"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberRshift => "PyNumber_Rshift"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberAnd => "PyNumber_And"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberXor => "PyNumber_Xor"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberOr => "PyNumber_Or"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberPower => "PyNumber_Power"(Ptr, Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceAdd => "PyNumber_InPlaceAdd"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceSubtract => "PyNumber_InPlaceSubtract"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceMultiply => "PyNumber_InPlaceMultiply"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceDivide => "PyNumber_InPlaceDivide"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceTrueDivide => "PyNumber_InPlaceTrueDivide"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceFloorDivide => "PyNumber_InPlaceFloorDivide"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceRemainder => "PyNumber_InPlaceRemainder"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceLshift => "PyNumber_InPlaceLshift"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceRshift => "PyNumber_InPlaceRshift"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceAnd => "PyNumber_InPlaceAnd"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceXor => "PyNumber_InPlaceXor"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlaceOr => "PyNumber_InPlaceOr"(Ptr, Ptr) -> Ptr, NullOnFailure;
    NumberInPlacePower => "PyNumber_InPlacePower"(Ptr, Ptr, Ptr) -> Ptr, NullOnFailure;

    // Unary protocol.
    ObjectRepr => "PyObject_Repr"(Ptr) -> Ptr, NullOnFailure;
    NumberInvert => "PyNumber_Invert"(Ptr) -> Ptr, NullOnFailure;
    NumberPositive => "PyNumber_Positive"(Ptr) -> Ptr, NullOnFailure;
    NumberNegative => "PyNumber_Negative"(Ptr) -> Ptr, NullOnFailure;
    ObjectIsTrue => "PyObject_IsTrue"(Ptr) -> I32, NegativeOnFailure;

    // Comparison.
    ObjectRichCompare => "PyObject_RichCompare"(Ptr, Ptr, I32) -> Ptr, NullOnFailure;
    SequenceContains => "PySequence_Contains"(Ptr, Ptr) -> I32, NegativeOnFailure;
    CheckedExceptionMatches => "_PyEval_CheckedExceptionMatches"(Ptr, Ptr) -> I32, NegativeOnFailure;

    // Attributes and subscripts.
    ObjectGetAttr => "PyObject_GetAttr"(Ptr, Ptr) -> Ptr, NullOnFailure;
    ObjectSetAttr => "PyObject_SetAttr"(Ptr, Ptr, Ptr) -> I32, NonZeroOnFailure;
    ObjectGetItem => "PyObject_GetItem"(Ptr, Ptr) -> Ptr, NullOnFailure;
    ObjectSetItem => "PyObject_SetItem"(Ptr, Ptr, Ptr) -> I32, NonZeroOnFailure;
    ObjectDelItem => "PyObject_DelItem"(Ptr, Ptr) -> I32, NonZeroOnFailure;

    // Mappings and globals.
    DictGetItem => "PyDict_GetItem"(Ptr, Ptr) -> Ptr, Infallible;
    DictSetItem => "PyDict_SetItem"(Ptr, Ptr, Ptr) -> I32, NonZeroOnFailure;
    DictDelItem => "PyDict_DelItem"(Ptr, Ptr) -> I32, NonZeroOnFailure;
    DictNewPresized => "_PyDict_NewPresized"(I64) -> Ptr, NullOnFailure;

    // Sequences.
    ListNew => "PyList_New"(I64) -> Ptr, NullOnFailure;
    TupleNew => "PyTuple_New"(I64) -> Ptr, NullOnFailure;
    ListAppend => "PyList_Append"(Ptr, Ptr) -> I32, NonZeroOnFailure;
    UnpackIterable => "_PyEval_UnpackIterable"(Ptr, I32, Ptr) -> I32, NonZeroOnSuccess;

    // Iteration.
    ObjectGetIter => "PyObject_GetIter"(Ptr) -> Ptr, NullOnFailure;

    // Slicing.
    SliceNew => "PySlice_New"(Ptr, Ptr, Ptr) -> Ptr, NullOnFailure;
    ApplySlice => "_PyEval_ApplySlice"(Ptr, Ptr, Ptr) -> Ptr, NullOnFailure;
    AssignSlice => "_PyEval_AssignSlice"(Ptr, Ptr, Ptr, Ptr) -> I32, NonZeroOnFailure;

    // Cells.
    CellGet => "PyCell_Get"(Ptr) -> Ptr, Infallible;
    CellSet => "PyCell_Set"(Ptr, Ptr) -> I32, NonZeroOnFailure;

    // Calls; both take the address of the stack pointer slot.
    CallFunction => "_PyEval_CallFunction"(Ptr, I32) -> Ptr, NullOnFailure;
    CallFunctionVarKw => "_PyEval_CallFunctionVarKw"(Ptr, I32) -> I32, NonZeroOnFailure;

    // Error state.
    ErrOccurred => "PyErr_Occurred"() -> Ptr, Infallible;
    ErrExceptionMatches => "PyErr_ExceptionMatches"(Ptr) -> I32, Infallible;
    ErrClear => "PyErr_Clear"() -> void, Infallible;
    RaiseForGlobalNameError => "_PyEval_RaiseForGlobalNameError"(Ptr, Ptr) -> void, Infallible;
    RaiseForUnboundLocal => "_PyEval_RaiseForUnboundLocal"(Ptr, I32) -> void, Infallible;
    RaiseForUnboundFreeVar => "_PyEval_RaiseForUnboundFreeVar"(Ptr, I32) -> void, Infallible;
    DoRaise => "_PyEval_DoRaise"(Ptr, Ptr, Ptr) -> void, Infallible;

    // Reference counting.
    WrapDealloc => "_PyLlvm_WrapDealloc"(Ptr) -> void, Infallible;
    NegativeRefcount => "_Py_NegativeRefcount"(Ptr, I32, Ptr) -> void, Infallible;
}

impl EntryPoint {
    pub fn name(self) -> &'static str {
        self.desc().name
    }

    pub fn policy(self) -> FailurePolicy {
        self.desc().policy
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|ep| ep.name() == name)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host data symbols referenced by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostGlobal {
    /// `Py_ssize_t` total of all reference counts (debug builds).
    RefTotal,
    NoneStruct,
    TrueStruct,
    /// The `False` singleton.
    ZeroStruct,
    /// A `PyObject *` variable holding the StopIteration type.
    StopIteration,
}

impl HostGlobal {
    pub const ALL: &'static [HostGlobal] = &[
        HostGlobal::RefTotal,
        HostGlobal::NoneStruct,
        HostGlobal::TrueStruct,
        HostGlobal::ZeroStruct,
        HostGlobal::StopIteration,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            HostGlobal::RefTotal => "_Py_RefTotal",
            HostGlobal::NoneStruct => "_Py_NoneStruct",
            HostGlobal::TrueStruct => "_Py_TrueStruct",
            HostGlobal::ZeroStruct => "_Py_ZeroStruct",
            HostGlobal::StopIteration => "PyExc_StopIteration",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|g| g.name() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_unique() {
        for (i, a) in EntryPoint::ALL.iter().enumerate() {
            for b in &EntryPoint::ALL[i + 1..] {
                assert_ne!(a.name(), b.name());
            }
            assert_eq!(EntryPoint::from_name(a.name()), Some(*a));
        }
    }

    #[test]
    fn test_exactly_one_inverted_convention() {
        let inverted: Vec<_> = EntryPoint::ALL
            .iter()
            .filter(|ep| ep.policy() == FailurePolicy::NonZeroOnSuccess)
            .collect();
        assert_eq!(inverted, vec![&EntryPoint::UnpackIterable]);
    }

    #[test]
    fn test_policy_matches_return_type() {
        for ep in EntryPoint::ALL {
            let desc = ep.desc();
            match desc.policy {
                FailurePolicy::NullOnFailure => assert_eq!(desc.ret, Some(Ty::Ptr), "{}", ep),
                FailurePolicy::NonZeroOnFailure
                | FailurePolicy::NegativeOnFailure
                | FailurePolicy::NonZeroOnSuccess => assert_eq!(desc.ret, Some(Ty::I32), "{}", ep),
                FailurePolicy::Infallible => {}
            }
        }
    }

    #[test]
    fn test_failure_values() {
        for policy in [
            FailurePolicy::NullOnFailure,
            FailurePolicy::NonZeroOnFailure,
            FailurePolicy::NegativeOnFailure,
            FailurePolicy::NonZeroOnSuccess,
        ] {
            let value = policy.failure_value().unwrap();
            assert!(policy.is_failure(value), "{:?}", policy);
        }
        assert!(!FailurePolicy::NonZeroOnSuccess.is_failure(1));
        assert!(FailurePolicy::NonZeroOnFailure.is_failure(1));
        assert!(!FailurePolicy::NegativeOnFailure.is_failure(0));
        assert_eq!(FailurePolicy::Infallible.failure_value(), None);
    }
}

//! The bridge entry points as implemented by the simulated host.
//!
//! Operations that can raise return `SimResult<Option<T>>`: `None` means an exception
//! was set in the pending-error slot, and `dispatch` turns that into the entry point's
//! own failure value. `SimError` is reserved for contract violations by the caller.

use super::{
    Builtin, ExcKind, Payload, PendingError, SimError, SimResult, SimRuntime, ITERNEXT_RAISING,
    ITERNEXT_SEQUENCE,
};
use crate::bridge::EntryPoint;
use std::cmp::Ordering;

const FAILED: u64 = -1i64 as u64;

/// Longest sequence a repetition may produce.
const MAX_REPEAT: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NumOp {
    Add,
    Sub,
    Mul,
    Div,
    TrueDiv,
    FloorDiv,
    Rem,
    Lshift,
    Rshift,
    And,
    Xor,
    Or,
    Pow,
}

impl NumOp {
    fn symbol(self) -> &'static str {
        match self {
            NumOp::Add => "+",
            NumOp::Sub => "-",
            NumOp::Mul => "*",
            NumOp::Div | NumOp::TrueDiv => "/",
            NumOp::FloorDiv => "//",
            NumOp::Rem => "%",
            NumOp::Lshift => "<<",
            NumOp::Rshift => ">>",
            NumOp::And => "&",
            NumOp::Xor => "^",
            NumOp::Or => "|",
            NumOp::Pow => "** or pow()",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnaryOp {
    Positive,
    Negative,
    Invert,
}

/// Coarse classification used to pick an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    None,
    Int(i64),
    Str,
    Tuple,
    List,
    Dict,
    Slice,
    Iter,
    ExcType,
    Namespace,
    Builtin(Builtin),
    Other,
}

fn object(result: Option<u64>) -> u64 {
    result.unwrap_or(0)
}

fn status(result: Option<()>) -> u64 {
    match result {
        Some(()) => 0,
        None => FAILED,
    }
}

fn tri_state(result: Option<bool>) -> u64 {
    match result {
        Some(value) => value as u64,
        None => FAILED,
    }
}

fn floor_div(x: i64, y: i64) -> Option<i64> {
    let q = x.checked_div(y)?;
    if x % y != 0 && ((x < 0) != (y < 0)) {
        Some(q - 1)
    } else {
        Some(q)
    }
}

fn py_mod(x: i64, y: i64) -> Option<i64> {
    let r = x.checked_rem(y)?;
    if r != 0 && ((r < 0) != (y < 0)) {
        Some(r + y)
    } else {
        Some(r)
    }
}

/// Indices selected by `[start:stop:step]` on a sequence of `len` items.
fn slice_indices(len: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let resolve = |v: Option<i64>, default: i64, lo: i64, hi: i64| match v {
        None => default,
        Some(v) => {
            let v = if v < 0 { v + len } else { v };
            v.clamp(lo, hi)
        }
    };
    let mut out = Vec::new();
    if step > 0 {
        let (mut i, end) = (resolve(start, 0, 0, len), resolve(stop, len, 0, len));
        while i < end {
            out.push(i as usize);
            i += step;
        }
    } else {
        let (mut i, end) = (resolve(start, len - 1, -1, len - 1), resolve(stop, -1, -1, len - 1));
        while i > end {
            out.push(i as usize);
            i += step;
        }
    }
    out
}

impl SimRuntime {
    pub(super) fn dispatch(&mut self, ep: EntryPoint, args: &[u64]) -> SimResult<u64> {
        let expected = ep.desc().params.len();
        if args.len() != expected {
            return Err(SimError::ArgumentCount {
                what: ep.name().to_string(),
                expected,
                given: args.len(),
            });
        }

        use EntryPoint::*;
        let injected = self.take_fault(ep.name());
        if injected {
            log::debug!("sim: injecting failure into {}", ep.name());
            match ep {
                // These pop their operands whether or not the call succeeds.
                CallFunction | CallFunctionVarKw => {}
                // Absent, with no error set.
                DictGetItem => return Ok(0),
                _ => {
                    self.set_error(
                        ExcKind::SimulatedFailure,
                        format!("injected failure in {}", ep.name()),
                    );
                    return Ok(ep.policy().failure_value().unwrap_or(0) as u64);
                }
            }
        }

        let a = args;
        Ok(match ep {
            NumberAdd | NumberInPlaceAdd => object(self.number_binary(NumOp::Add, a[0], a[1])?),
            NumberSubtract | NumberInPlaceSubtract => {
                object(self.number_binary(NumOp::Sub, a[0], a[1])?)
            }
            NumberMultiply | NumberInPlaceMultiply => {
                object(self.number_binary(NumOp::Mul, a[0], a[1])?)
            }
            NumberDivide | NumberInPlaceDivide => object(self.number_binary(NumOp::Div, a[0], a[1])?),
            NumberTrueDivide | NumberInPlaceTrueDivide => {
                object(self.number_binary(NumOp::TrueDiv, a[0], a[1])?)
            }
            NumberFloorDivide | NumberInPlaceFloorDivide => {
                object(self.number_binary(NumOp::FloorDiv, a[0], a[1])?)
            }
            NumberRemainder | NumberInPlaceRemainder => {
                object(self.number_binary(NumOp::Rem, a[0], a[1])?)
            }
            NumberLshift | NumberInPlaceLshift => object(self.number_binary(NumOp::Lshift, a[0], a[1])?),
            NumberRshift | NumberInPlaceRshift => object(self.number_binary(NumOp::Rshift, a[0], a[1])?),
            NumberAnd | NumberInPlaceAnd => object(self.number_binary(NumOp::And, a[0], a[1])?),
            NumberXor | NumberInPlaceXor => object(self.number_binary(NumOp::Xor, a[0], a[1])?),
            NumberOr | NumberInPlaceOr => object(self.number_binary(NumOp::Or, a[0], a[1])?),
            NumberPower | NumberInPlacePower => object(self.number_power(a[0], a[1], a[2])?),

            ObjectRepr => {
                let text = self.repr(a[0])?;
                self.new_str(&text)?
            }
            NumberInvert => object(self.number_unary(UnaryOp::Invert, a[0])?),
            NumberPositive => object(self.number_unary(UnaryOp::Positive, a[0])?),
            NumberNegative => object(self.number_unary(UnaryOp::Negative, a[0])?),
            ObjectIsTrue => tri_state(Some(self.is_true(a[0])?)),

            ObjectRichCompare => object(self.rich_compare(a[0], a[1], a[2] as i32)?),
            SequenceContains => tri_state(self.contains(a[0], a[1])?),
            CheckedExceptionMatches => tri_state(self.exception_matches(a[0], a[1])?),

            ObjectGetAttr => object(self.get_attr(a[0], a[1])?),
            ObjectSetAttr => status(self.set_attr(a[0], a[1], a[2])?),
            ObjectGetItem => object(self.get_item(a[0], a[1])?),
            ObjectSetItem => status(self.set_item(a[0], a[1], a[2])?),
            ObjectDelItem => status(self.del_item(a[0], a[1])?),

            DictGetItem => self.dict_get(a[0], a[1])?.unwrap_or(0),
            DictSetItem => status(self.dict_set(a[0], a[1], a[2])?),
            DictDelItem => status(self.dict_del(a[0], a[1])?),
            DictNewPresized => self.new_dict()?,

            ListNew => object(self.new_sized(a[0] as i64, false)?),
            TupleNew => object(self.new_sized(a[0] as i64, true)?),
            ListAppend => status(self.list_append(a[0], a[1])?),
            UnpackIterable => match self.unpack(a[0], a[1] as i32, a[2])? {
                Some(()) => 1,
                None => 0,
            },

            ObjectGetIter => object(self.get_iter(a[0])?),

            SliceNew => self.slice_new(a[0], a[1], a[2])?,
            ApplySlice => object(self.apply_slice(a[0], a[1], a[2])?),
            AssignSlice => status(self.assign_slice(a[0], a[1], a[2], a[3])?),

            CellGet => self.cell_get(a[0])?,
            CellSet => status(self.cell_set(a[0], a[1])?),

            CallFunction => self.call_function(a[0], a[1] as i32, injected)?,
            CallFunctionVarKw => self.call_function_var_kw(a[0], a[1] as i32, injected)?,

            ErrOccurred => self.pending.as_ref().map_or(0, |p| p.exc_type),
            ErrExceptionMatches => self.pending.as_ref().is_some_and(|p| p.exc_type == a[0]) as u64,
            ErrClear => {
                self.pending = None;
                0
            }
            RaiseForGlobalNameError => {
                let name = self.display(a[1])?;
                self.set_error(ExcKind::NameError, format!("global name '{}' is not defined", name));
                0
            }
            RaiseForUnboundLocal => {
                self.raise_unbound_local(a[0], a[1] as i32)?;
                0
            }
            RaiseForUnboundFreeVar => {
                self.raise_unbound_free(a[0], a[1] as i32)?;
                0
            }
            DoRaise => {
                self.do_raise(a[0], a[1], a[2])?;
                0
            }

            WrapDealloc => {
                self.dealloc(a[0])?;
                0
            }
            NegativeRefcount => {
                let err = SimError::NegativeRefcount {
                    function: self.memory.read_cstr(a[0])?,
                    offset: a[1] as i32,
                    addr: a[2],
                };
                log::warn!("sim: {}", err);
                self.violations.push(err);
                0
            }
        })
    }

    /// The `tp_iternext` slot of both iterator types.
    pub(super) fn iternext(&mut self, addr: u64, args: &[u64]) -> SimResult<u64> {
        if addr != ITERNEXT_SEQUENCE && addr != ITERNEXT_RAISING {
            return Err(SimError::UnknownSymbol(format!("function at {:#x}", addr)));
        }
        let [iter] = args else {
            return Err(SimError::ArgumentCount {
                what: "tp_iternext".to_string(),
                expected: 1,
                given: args.len(),
            });
        };
        if self.take_fault("tp_iternext") {
            self.set_error(ExcKind::SimulatedFailure, "injected failure in tp_iternext");
            return Ok(0);
        }
        let raise_stop = match self.payload(*iter)? {
            Payload::Iter { raise_stop, .. } => *raise_stop,
            _ => {
                return Err(SimError::NotAnObject {
                    addr: *iter,
                    context: "tp_iternext on a non-iterator".to_string(),
                })
            }
        };
        match self.iter_step(*iter)? {
            Some(item) => Ok(item),
            None => {
                if raise_stop {
                    self.set_error(ExcKind::StopIteration, "");
                }
                Ok(0)
            }
        }
    }

    fn kind(&self, addr: u64) -> SimResult<Kind> {
        Ok(match self.payload(addr)? {
            Payload::None => Kind::None,
            Payload::Int(v) => Kind::Int(*v),
            Payload::Bool(b) => Kind::Int(*b as i64),
            Payload::Str(_) => Kind::Str,
            Payload::Tuple => Kind::Tuple,
            Payload::List => Kind::List,
            Payload::Dict(_) => Kind::Dict,
            Payload::Slice { .. } => Kind::Slice,
            Payload::Iter { .. } => Kind::Iter,
            Payload::Type { exc: Some(_), .. } => Kind::ExcType,
            Payload::Namespace { .. } => Kind::Namespace,
            Payload::Builtin(b) => Kind::Builtin(*b),
            _ => Kind::Other,
        })
    }

    fn str_value(&self, addr: u64) -> SimResult<Option<String>> {
        Ok(match self.payload(addr)? {
            Payload::Str(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn items(&self, addr: u64) -> SimResult<Vec<u64>> {
        Ok(self.seq_items(addr)?.unwrap_or_default())
    }

    /// New references to each of `items`.
    fn owned(&mut self, items: &[u64]) -> SimResult<Vec<u64>> {
        for &item in items {
            self.incref(item)?;
        }
        Ok(items.to_vec())
    }

    fn new_seq(&mut self, tuple: bool, items: Vec<u64>) -> SimResult<u64> {
        if tuple {
            self.new_tuple(items)
        } else {
            self.new_list(items)
        }
    }

    fn seq_len(&self, addr: u64) -> SimResult<Option<usize>> {
        Ok(match self.payload(addr)? {
            Payload::Tuple | Payload::List => self.seq_slots(addr)?.map(|(_, len)| len),
            Payload::Str(s) => Some(s.chars().count()),
            Payload::Dict(entries) => Some(entries.len()),
            _ => None,
        })
    }

    // Numbers.

    fn number_binary(&mut self, op: NumOp, a: u64, b: u64) -> SimResult<Option<u64>> {
        let (ka, kb) = (self.kind(a)?, self.kind(b)?);
        match (op, ka, kb) {
            (_, Kind::Int(x), Kind::Int(y)) => self.int_arith(op, x, y),
            (NumOp::Add, Kind::Str, Kind::Str) => {
                let joined = format!(
                    "{}{}",
                    self.str_value(a)?.unwrap_or_default(),
                    self.str_value(b)?.unwrap_or_default()
                );
                Ok(Some(self.new_str(&joined)?))
            }
            (NumOp::Add, Kind::Tuple, Kind::Tuple) | (NumOp::Add, Kind::List, Kind::List) => {
                let mut items = self.items(a)?;
                items.extend(self.items(b)?);
                let items = self.owned(&items)?;
                Ok(Some(self.new_seq(ka == Kind::Tuple, items)?))
            }
            (NumOp::Mul, seq, Kind::Int(n)) | (NumOp::Mul, Kind::Int(n), seq)
                if matches!(seq, Kind::Str | Kind::Tuple | Kind::List) =>
            {
                let target = if seq == ka { a } else { b };
                self.repeat(target, seq, n)
            }
            _ => {
                let message = format!(
                    "unsupported operand type(s) for {}: '{}' and '{}'",
                    op.symbol(),
                    self.type_name(a)?,
                    self.type_name(b)?
                );
                self.raise(ExcKind::TypeError, message)
            }
        }
    }

    fn repeat(&mut self, seq: u64, kind: Kind, times: i64) -> SimResult<Option<u64>> {
        let times = times.max(0) as usize;
        let len = self.seq_len(seq)?.unwrap_or(0);
        if len.saturating_mul(times) > MAX_REPEAT {
            return self.raise(ExcKind::OverflowError, "repeated sequence is too long");
        }
        if kind == Kind::Str {
            let text = self.str_value(seq)?.unwrap_or_default().repeat(times);
            return Ok(Some(self.new_str(&text)?));
        }
        let items = self.items(seq)?;
        let mut repeated = Vec::with_capacity(len * times);
        for _ in 0..times {
            repeated.extend(self.owned(&items)?);
        }
        Ok(Some(self.new_seq(kind == Kind::Tuple, repeated)?))
    }

    fn int_arith(&mut self, op: NumOp, x: i64, y: i64) -> SimResult<Option<u64>> {
        let divides = matches!(op, NumOp::Div | NumOp::TrueDiv | NumOp::FloorDiv | NumOp::Rem);
        if divides && y == 0 {
            return self.raise(ExcKind::ZeroDivisionError, "integer division or modulo by zero");
        }
        let value = match op {
            NumOp::Add => x.checked_add(y),
            NumOp::Sub => x.checked_sub(y),
            NumOp::Mul => x.checked_mul(y),
            NumOp::Div | NumOp::FloorDiv => floor_div(x, y),
            NumOp::TrueDiv => {
                if x % y != 0 {
                    return self.raise(
                        ExcKind::TypeError,
                        "true division with a fractional result is not supported",
                    );
                }
                x.checked_div(y)
            }
            NumOp::Rem => py_mod(x, y),
            NumOp::Lshift | NumOp::Rshift if y < 0 => {
                return self.raise(ExcKind::ValueError, "negative shift count");
            }
            NumOp::Lshift => {
                if y >= 64 {
                    (x == 0).then_some(0)
                } else {
                    let shifted = x << y;
                    (shifted >> y == x).then_some(shifted)
                }
            }
            NumOp::Rshift => Some(if y >= 64 { x >> 63 } else { x >> y }),
            NumOp::And => Some(x & y),
            NumOp::Xor => Some(x ^ y),
            NumOp::Or => Some(x | y),
            NumOp::Pow => {
                if y < 0 {
                    return self.raise(ExcKind::ValueError, "negative exponents are not supported");
                }
                u32::try_from(y).ok().and_then(|e| x.checked_pow(e))
            }
        };
        match value {
            Some(v) => Ok(Some(self.new_int(v)?)),
            None => self.raise(ExcKind::OverflowError, "integer result out of range"),
        }
    }

    fn number_power(&mut self, base: u64, exponent: u64, modulus: u64) -> SimResult<Option<u64>> {
        if modulus != 0 && self.kind(modulus)? != Kind::None {
            return self.raise(ExcKind::TypeError, "pow() 3rd argument not supported");
        }
        self.number_binary(NumOp::Pow, base, exponent)
    }

    fn number_unary(&mut self, op: UnaryOp, a: u64) -> SimResult<Option<u64>> {
        let Kind::Int(v) = self.kind(a)? else {
            let symbol = match op {
                UnaryOp::Positive => "+",
                UnaryOp::Negative => "-",
                UnaryOp::Invert => "~",
            };
            let message = format!("bad operand type for unary {}: '{}'", symbol, self.type_name(a)?);
            return self.raise(ExcKind::TypeError, message);
        };
        let value = match op {
            UnaryOp::Positive => Some(v),
            UnaryOp::Negative => v.checked_neg(),
            UnaryOp::Invert => Some(!v),
        };
        match value {
            Some(v) => Ok(Some(self.new_int(v)?)),
            None => self.raise(ExcKind::OverflowError, "integer result out of range"),
        }
    }

    fn is_true(&self, a: u64) -> SimResult<bool> {
        Ok(match self.kind(a)? {
            Kind::None => false,
            Kind::Int(v) => v != 0,
            Kind::Str | Kind::Tuple | Kind::List | Kind::Dict => self.seq_len(a)?.unwrap_or(0) > 0,
            _ => true,
        })
    }

    // Comparison.

    fn equal(&self, a: u64, b: u64) -> SimResult<bool> {
        if a == b {
            return Ok(true);
        }
        Ok(match (self.kind(a)?, self.kind(b)?) {
            (Kind::Int(x), Kind::Int(y)) => x == y,
            (Kind::Str, Kind::Str) => self.str_value(a)? == self.str_value(b)?,
            (Kind::Tuple, Kind::Tuple) | (Kind::List, Kind::List) => {
                let (xs, ys) = (self.items(a)?, self.items(b)?);
                if xs.len() != ys.len() {
                    return Ok(false);
                }
                for (x, y) in xs.into_iter().zip(ys) {
                    if !self.equal(x, y)? {
                        return Ok(false);
                    }
                }
                true
            }
            _ => false,
        })
    }

    fn order(&self, a: u64, b: u64) -> SimResult<Option<Ordering>> {
        Ok(match (self.kind(a)?, self.kind(b)?) {
            (Kind::Int(x), Kind::Int(y)) => Some(x.cmp(&y)),
            (Kind::Str, Kind::Str) => Some(self.str_value(a)?.cmp(&self.str_value(b)?)),
            (Kind::Tuple, Kind::Tuple) | (Kind::List, Kind::List) => {
                let (xs, ys) = (self.items(a)?, self.items(b)?);
                for (&x, &y) in xs.iter().zip(&ys) {
                    if !self.equal(x, y)? {
                        return self.order(x, y);
                    }
                }
                Some(xs.len().cmp(&ys.len()))
            }
            _ => None,
        })
    }

    /// `PyObject_RichCompare` with the host's operator numbering (`<` is 0, `>=` is 5).
    fn rich_compare(&mut self, a: u64, b: u64, op: i32) -> SimResult<Option<u64>> {
        let outcome = match op {
            2 => Some(self.equal(a, b)?),
            3 => Some(!self.equal(a, b)?),
            0 | 1 | 4 | 5 => self.order(a, b)?.map(|ord| match op {
                0 => ord.is_lt(),
                1 => ord.is_le(),
                4 => ord.is_gt(),
                _ => ord.is_ge(),
            }),
            _ => return self.raise(ExcKind::RuntimeError, format!("bad comparison operator {}", op)),
        };
        match outcome {
            Some(result) => Ok(Some(self.new_bool(result)?)),
            None => {
                let message = format!(
                    "unorderable types: {}() and {}()",
                    self.type_name(a)?,
                    self.type_name(b)?
                );
                self.raise(ExcKind::TypeError, message)
            }
        }
    }

    fn contains(&mut self, container: u64, item: u64) -> SimResult<Option<bool>> {
        match self.kind(container)? {
            Kind::Tuple | Kind::List => {
                for x in self.items(container)? {
                    if self.equal(x, item)? {
                        return Ok(Some(true));
                    }
                }
                Ok(Some(false))
            }
            Kind::Str => match self.str_value(item)? {
                Some(needle) => {
                    let haystack = self.str_value(container)?.unwrap_or_default();
                    Ok(Some(haystack.contains(&needle)))
                }
                None => self.raise(ExcKind::TypeError, "'in <string>' requires string as left operand"),
            },
            Kind::Dict => {
                if !self.hashable(item)? {
                    return self.raise_unhashable(item);
                }
                Ok(Some(self.dict_find(container, item)?.is_some()))
            }
            _ => {
                let message = format!("argument of type '{}' is not iterable", self.type_name(container)?);
                self.raise(ExcKind::TypeError, message)
            }
        }
    }

    /// Whether the in-flight exception `err` is `exc` or one of a tuple of types.
    fn exception_matches(&mut self, err: u64, exc: u64) -> SimResult<Option<bool>> {
        match self.kind(exc)? {
            Kind::ExcType => Ok(Some(err == exc)),
            Kind::Tuple => {
                for candidate in self.items(exc)? {
                    match self.exception_matches(err, candidate)? {
                        Some(false) => {}
                        other => return Ok(other),
                    }
                }
                Ok(Some(false))
            }
            _ => self.raise(
                ExcKind::TypeError,
                "catching classes that do not inherit from BaseException is not allowed",
            ),
        }
    }

    // Attributes.

    fn attr_name(&mut self, name: u64) -> SimResult<Option<String>> {
        match self.str_value(name)? {
            Some(name) => Ok(Some(name)),
            None => self.raise(ExcKind::TypeError, "attribute name must be string"),
        }
    }

    fn raise_no_attr<T>(&mut self, obj: u64, name: &str) -> SimResult<Option<T>> {
        let message = format!("'{}' object has no attribute '{}'", self.type_name(obj)?, name);
        self.raise(ExcKind::AttributeError, message)
    }

    fn get_attr(&mut self, obj: u64, name: u64) -> SimResult<Option<u64>> {
        let Some(name) = self.attr_name(name)? else {
            return Ok(None);
        };
        let found = match self.payload(obj)? {
            Payload::Namespace { attrs, .. } => attrs.iter().find(|(n, _)| *n == name).map(|&(_, v)| v),
            Payload::Type { name: type_name, .. } if name == "__name__" => {
                let type_name = type_name.clone();
                return Ok(Some(self.new_str(&type_name)?));
            }
            _ => None,
        };
        match found {
            Some(value) => {
                self.incref(value)?;
                Ok(Some(value))
            }
            None => self.raise_no_attr(obj, &name),
        }
    }

    /// Set, or delete when `value` is null.
    fn set_attr(&mut self, obj: u64, name: u64, value: u64) -> SimResult<Option<()>> {
        let Some(name) = self.attr_name(name)? else {
            return Ok(None);
        };
        if self.kind(obj)? != Kind::Namespace {
            return self.raise_no_attr(obj, &name);
        }
        if value != 0 {
            self.incref(value)?;
        }
        let replaced = match self.payload_mut(obj)? {
            Payload::Namespace { attrs, .. } => match attrs.iter().position(|(n, _)| *n == name) {
                Some(i) if value == 0 => Some(attrs.remove(i).1),
                Some(i) => Some(std::mem::replace(&mut attrs[i].1, value)),
                None if value == 0 => None,
                None => {
                    attrs.push((name.clone(), value));
                    Some(0)
                }
            },
            _ => None,
        };
        match replaced {
            Some(old) => {
                self.xrelease(old)?;
                Ok(Some(()))
            }
            None => self.raise_no_attr(obj, &name),
        }
    }

    // Subscripts.

    /// Resolve a possibly negative index against `len`.
    fn resolve_index(len: usize, index: i64) -> Option<usize> {
        let index = if index < 0 { index + len as i64 } else { index };
        (0..len as i64).contains(&index).then_some(index as usize)
    }

    fn seq_index(&mut self, seq: u64, index: i64) -> SimResult<Option<u64>> {
        let len = self.seq_len(seq)?.unwrap_or(0);
        let kind = self.kind(seq)?;
        let Some(i) = Self::resolve_index(len, index) else {
            let what = match kind {
                Kind::Str => "string",
                Kind::Tuple => "tuple",
                _ => "list",
            };
            return self.raise(ExcKind::IndexError, format!("{} index out of range", what));
        };
        if kind == Kind::Str {
            let text = self.str_value(seq)?.unwrap_or_default();
            let c = text.chars().nth(i).map(String::from).unwrap_or_default();
            return Ok(Some(self.new_str(&c)?));
        }
        let item = self.items(seq)?[i];
        self.incref(item)?;
        Ok(Some(item))
    }

    /// A slice bound: null or None is missing, an int is present. The outer `None`
    /// means an error was raised.
    fn slice_bound(&mut self, bound: u64) -> SimResult<Option<Option<i64>>> {
        if bound == 0 {
            return Ok(Some(None));
        }
        match self.kind(bound)? {
            Kind::None => Ok(Some(None)),
            Kind::Int(v) => Ok(Some(Some(v))),
            _ => self.raise(ExcKind::TypeError, "slice indices must be integers or None"),
        }
    }

    fn slice_of(&mut self, seq: u64, start: Option<i64>, stop: Option<i64>, step: i64) -> SimResult<Option<u64>> {
        if step == 0 {
            return self.raise(ExcKind::ValueError, "slice step cannot be zero");
        }
        let len = self.seq_len(seq)?.unwrap_or(0);
        let indices = slice_indices(len, start, stop, step);
        match self.kind(seq)? {
            Kind::Str => {
                let chars: Vec<char> = self.str_value(seq)?.unwrap_or_default().chars().collect();
                let text: String = indices.iter().map(|&i| chars[i]).collect();
                Ok(Some(self.new_str(&text)?))
            }
            kind => {
                let items = self.items(seq)?;
                let picked: Vec<u64> = indices.iter().map(|&i| items[i]).collect();
                let picked = self.owned(&picked)?;
                Ok(Some(self.new_seq(kind == Kind::Tuple, picked)?))
            }
        }
    }

    fn get_item(&mut self, obj: u64, key: u64) -> SimResult<Option<u64>> {
        match self.kind(obj)? {
            Kind::Tuple | Kind::List | Kind::Str => match self.kind(key)? {
                Kind::Int(index) => self.seq_index(obj, index),
                Kind::Slice => {
                    let Payload::Slice { start, stop, step } = self.payload(key)?.clone() else {
                        return Ok(None);
                    };
                    let Some(start) = self.slice_bound(start)? else { return Ok(None) };
                    let Some(stop) = self.slice_bound(stop)? else { return Ok(None) };
                    let Some(step) = self.slice_bound(step)? else { return Ok(None) };
                    self.slice_of(obj, start, stop, step.unwrap_or(1))
                }
                _ => {
                    let message = format!(
                        "{} indices must be integers, not {}",
                        self.type_name(obj)?,
                        self.type_name(key)?
                    );
                    self.raise(ExcKind::TypeError, message)
                }
            },
            Kind::Dict => {
                if !self.hashable(key)? {
                    return self.raise_unhashable(key);
                }
                match self.dict_get(obj, key)? {
                    Some(value) => {
                        self.incref(value)?;
                        Ok(Some(value))
                    }
                    None => {
                        let message = self.repr(key)?;
                        self.raise(ExcKind::KeyError, message)
                    }
                }
            }
            _ => {
                let message = format!("'{}' object is not subscriptable", self.type_name(obj)?);
                self.raise(ExcKind::TypeError, message)
            }
        }
    }

    fn set_item(&mut self, obj: u64, key: u64, value: u64) -> SimResult<Option<()>> {
        match (self.kind(obj)?, self.kind(key)?) {
            (Kind::List, Kind::Int(index)) => {
                let Some((base, len)) = self.seq_slots(obj)? else {
                    return Ok(None);
                };
                let Some(i) = Self::resolve_index(len, index) else {
                    return self.raise(ExcKind::IndexError, "list assignment index out of range");
                };
                self.incref(value)?;
                let slot = base + 8 * i as u64;
                let old = self.memory.read_u64(slot)?;
                self.memory.write_u64(slot, value)?;
                self.xrelease(old)?;
                Ok(Some(()))
            }
            (Kind::List, _) => {
                let message = format!("list indices must be integers, not {}", self.type_name(key)?);
                self.raise(ExcKind::TypeError, message)
            }
            (Kind::Dict, _) => self.dict_set(obj, key, value),
            _ => {
                let message = format!("'{}' object does not support item assignment", self.type_name(obj)?);
                self.raise(ExcKind::TypeError, message)
            }
        }
    }

    fn del_item(&mut self, obj: u64, key: u64) -> SimResult<Option<()>> {
        match (self.kind(obj)?, self.kind(key)?) {
            (Kind::List, Kind::Int(index)) => {
                let mut items = self.items(obj)?;
                let Some(i) = Self::resolve_index(items.len(), index) else {
                    return self.raise(ExcKind::IndexError, "list assignment index out of range");
                };
                let removed = items.remove(i);
                self.list_store(obj, &items)?;
                self.xrelease(removed)?;
                Ok(Some(()))
            }
            (Kind::Dict, _) => self.dict_del(obj, key),
            _ => {
                let message = format!("'{}' object doesn't support item deletion", self.type_name(obj)?);
                self.raise(ExcKind::TypeError, message)
            }
        }
    }

    // Dicts.

    fn hashable(&self, key: u64) -> SimResult<bool> {
        match self.kind(key)? {
            Kind::List | Kind::Dict => Ok(false),
            Kind::Tuple => {
                for item in self.items(key)? {
                    if !self.hashable(item)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => Ok(true),
        }
    }

    fn raise_unhashable<T>(&mut self, key: u64) -> SimResult<Option<T>> {
        let message = format!("unhashable type: '{}'", self.type_name(key)?);
        self.raise(ExcKind::TypeError, message)
    }

    fn dict_find(&self, dict: u64, key: u64) -> SimResult<Option<usize>> {
        let keys: Vec<u64> = match self.payload(dict)? {
            Payload::Dict(entries) => entries.iter().map(|&(k, _)| k).collect(),
            _ => return Ok(None),
        };
        for (i, k) in keys.into_iter().enumerate() {
            if self.equal(k, key)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }

    /// Borrowed lookup; absent keys and unhashable keys both yield `None`.
    pub(super) fn dict_get(&self, dict: u64, key: u64) -> SimResult<Option<u64>> {
        if self.kind(dict)? != Kind::Dict || !self.hashable(key)? {
            return Ok(None);
        }
        let Some(i) = self.dict_find(dict, key)? else {
            return Ok(None);
        };
        Ok(match self.payload(dict)? {
            Payload::Dict(entries) => entries.get(i).map(|&(_, v)| v),
            _ => None,
        })
    }

    /// Insert or replace; key and value are borrowed.
    pub(super) fn dict_set(&mut self, dict: u64, key: u64, value: u64) -> SimResult<Option<()>> {
        if self.kind(dict)? != Kind::Dict {
            return self.raise(ExcKind::TypeError, "bad argument to internal function");
        }
        if !self.hashable(key)? {
            return self.raise_unhashable(key);
        }
        self.incref(value)?;
        let existing = self.dict_find(dict, key)?;
        if existing.is_none() {
            self.incref(key)?;
        }
        let old = match self.payload_mut(dict)? {
            Payload::Dict(entries) => match existing {
                Some(i) => Some(std::mem::replace(&mut entries[i].1, value)),
                None => {
                    entries.push((key, value));
                    None
                }
            },
            _ => None,
        };
        if let Some(old) = old {
            self.release(old)?;
        }
        Ok(Some(()))
    }

    fn dict_del(&mut self, dict: u64, key: u64) -> SimResult<Option<()>> {
        let removed = match self.dict_find(dict, key)? {
            Some(i) => match self.payload_mut(dict)? {
                Payload::Dict(entries) => Some(entries.remove(i)),
                _ => None,
            },
            None => None,
        };
        match removed {
            Some((k, v)) => {
                self.release(k)?;
                self.release(v)?;
                Ok(Some(()))
            }
            None => {
                let message = self.repr(key)?;
                self.raise(ExcKind::KeyError, message)
            }
        }
    }

    // Sequences.

    /// `PyTuple_New`/`PyList_New`: `n` null slots for the caller to fill.
    fn new_sized(&mut self, n: i64, tuple: bool) -> SimResult<Option<u64>> {
        if n < 0 || n as usize > MAX_REPEAT {
            return self.raise(ExcKind::RuntimeError, format!("bad sequence size {}", n));
        }
        Ok(Some(self.new_seq(tuple, vec![0; n as usize])?))
    }

    fn list_append(&mut self, list: u64, item: u64) -> SimResult<Option<()>> {
        if self.kind(list)? != Kind::List {
            return self.raise(ExcKind::TypeError, "bad argument to internal function");
        }
        self.incref(item)?;
        let allocated = self.memory.read_u64(list + self.layout.list_allocated)? as usize;
        let Some((base, len)) = self.seq_slots(list)? else {
            return Ok(None);
        };
        if len < allocated {
            self.memory.write_u64(base + 8 * len as u64, item)?;
            self.memory
                .write_u64(list + self.layout.ob_size, len as u64 + 1)?;
        } else {
            let mut items = self.items(list)?;
            items.push(item);
            self.list_store(list, &items)?;
        }
        Ok(Some(()))
    }

    /// New references to every item `obj` iterates over.
    fn collect_items(&mut self, obj: u64) -> SimResult<Option<Vec<u64>>> {
        match self.kind(obj)? {
            Kind::Tuple | Kind::List => {
                let items = self.items(obj)?;
                Ok(Some(self.owned(&items)?))
            }
            Kind::Str => {
                let text = self.str_value(obj)?.unwrap_or_default();
                let mut items = Vec::new();
                for c in text.chars() {
                    items.push(self.new_str(&c.to_string())?);
                }
                Ok(Some(items))
            }
            Kind::Dict => {
                let keys: Vec<u64> = match self.payload(obj)? {
                    Payload::Dict(entries) => entries.iter().map(|&(k, _)| k).collect(),
                    _ => Vec::new(),
                };
                Ok(Some(self.owned(&keys)?))
            }
            Kind::Iter => {
                let mut items = Vec::new();
                while let Some(item) = self.iter_step(obj)? {
                    items.push(item);
                }
                Ok(Some(items))
            }
            _ => {
                let message = format!("'{}' object is not iterable", self.type_name(obj)?);
                self.raise(ExcKind::TypeError, message)
            }
        }
    }

    /// `_PyEval_UnpackIterable`: exactly `count` items written downward from `dst`.
    fn unpack(&mut self, iterable: u64, count: i32, dst: u64) -> SimResult<Option<()>> {
        let Some(items) = self.collect_items(iterable)? else {
            return Ok(None);
        };
        let count = count.max(0) as usize;
        if items.len() != count {
            let found = items.len();
            for item in items {
                self.release(item)?;
            }
            let message = if found < count {
                format!(
                    "need more than {} value{} to unpack",
                    found,
                    if found == 1 { "" } else { "s" }
                )
            } else {
                "too many values to unpack".to_string()
            };
            return self.raise(ExcKind::ValueError, message);
        }
        for (i, &item) in items.iter().enumerate() {
            self.memory.write_u64(dst - 8 * (i as u64 + 1), item)?;
        }
        Ok(Some(()))
    }

    // Iteration.

    fn get_iter(&mut self, obj: u64) -> SimResult<Option<u64>> {
        match self.kind(obj)? {
            Kind::Iter => {
                self.incref(obj)?;
                Ok(Some(obj))
            }
            Kind::Tuple | Kind::List | Kind::Str | Kind::Dict => Ok(Some(self.new_iter(obj, false)?)),
            _ => {
                let message = format!("'{}' object is not iterable", self.type_name(obj)?);
                self.raise(ExcKind::TypeError, message)
            }
        }
    }

    /// Advance an iterator; `None` once exhausted, without touching the error state.
    fn iter_step(&mut self, iter: u64) -> SimResult<Option<u64>> {
        let (seq, index) = match self.payload(iter)? {
            Payload::Iter { seq, index, .. } => (*seq, *index),
            _ => return Ok(None),
        };
        let item = match self.kind(seq)? {
            Kind::Tuple | Kind::List => self.items(seq)?.get(index).copied(),
            Kind::Dict => match self.payload(seq)? {
                Payload::Dict(entries) => entries.get(index).map(|&(k, _)| k),
                _ => None,
            },
            Kind::Str => {
                let text = self.str_value(seq)?.unwrap_or_default();
                match text.chars().nth(index) {
                    Some(c) => {
                        let item = self.new_str(&c.to_string())?;
                        self.advance(iter)?;
                        return Ok(Some(item));
                    }
                    None => None,
                }
            }
            _ => None,
        };
        match item {
            Some(item) if item != 0 => {
                self.incref(item)?;
                self.advance(iter)?;
                Ok(Some(item))
            }
            _ => Ok(None),
        }
    }

    fn advance(&mut self, iter: u64) -> SimResult<()> {
        if let Payload::Iter { index, .. } = self.payload_mut(iter)? {
            *index += 1;
        }
        Ok(())
    }

    // Slices.

    /// New reference to `bound`, with null standing for None.
    fn bound_or_none(&mut self, bound: u64) -> SimResult<u64> {
        if bound == 0 {
            return self.new_none();
        }
        self.incref(bound)?;
        Ok(bound)
    }

    fn slice_new(&mut self, start: u64, stop: u64, step: u64) -> SimResult<u64> {
        let payload = Payload::Slice {
            start: self.bound_or_none(start)?,
            stop: self.bound_or_none(stop)?,
            step: self.bound_or_none(step)?,
        };
        self.alloc_object(payload, 0)
    }

    fn apply_slice(&mut self, seq: u64, start: u64, stop: u64) -> SimResult<Option<u64>> {
        if !matches!(self.kind(seq)?, Kind::Tuple | Kind::List | Kind::Str) {
            let message = format!("'{}' object is unsliceable", self.type_name(seq)?);
            return self.raise(ExcKind::TypeError, message);
        }
        let Some(start) = self.slice_bound(start)? else { return Ok(None) };
        let Some(stop) = self.slice_bound(stop)? else { return Ok(None) };
        self.slice_of(seq, start, stop, 1)
    }

    /// Replace `seq[start:stop]` with the items of `value`, or delete it when null.
    fn assign_slice(&mut self, seq: u64, start: u64, stop: u64, value: u64) -> SimResult<Option<()>> {
        if self.kind(seq)? != Kind::List {
            let message = format!("'{}' object does not support slice assignment", self.type_name(seq)?);
            return self.raise(ExcKind::TypeError, message);
        }
        let Some(start) = self.slice_bound(start)? else { return Ok(None) };
        let Some(stop) = self.slice_bound(stop)? else { return Ok(None) };

        let replacement = if value == 0 {
            Vec::new()
        } else {
            match self.collect_items(value)? {
                Some(items) => items,
                None => return Ok(None),
            }
        };
        let items = self.items(seq)?;
        let len = items.len() as i64;
        let clamp = |v: Option<i64>, default: i64| match v {
            None => default,
            Some(v) if v < 0 => (v + len).max(0),
            Some(v) => v.min(len),
        };
        let lo = clamp(start, 0) as usize;
        let hi = (clamp(stop, len) as usize).max(lo);

        let mut updated = items[..lo].to_vec();
        updated.extend(&replacement);
        updated.extend(&items[hi..]);
        self.list_store(seq, &updated)?;
        for &removed in &items[lo..hi] {
            self.xrelease(removed)?;
        }
        Ok(Some(()))
    }

    // Cells.

    fn cell_content(&self, cell: u64) -> SimResult<Option<u64>> {
        match self.payload(cell)? {
            Payload::Cell(content) => Ok(*content),
            _ => Err(SimError::NotAnObject {
                addr: cell,
                context: "expected a cell".to_string(),
            }),
        }
    }

    /// New reference to the cell's content, or null when empty (no error set).
    fn cell_get(&mut self, cell: u64) -> SimResult<u64> {
        match self.cell_content(cell)? {
            Some(value) => {
                self.incref(value)?;
                Ok(value)
            }
            None => Ok(0),
        }
    }

    fn cell_set(&mut self, cell: u64, value: u64) -> SimResult<Option<()>> {
        let old = self.cell_content(cell)?;
        if value != 0 {
            self.incref(value)?;
        }
        if let Payload::Cell(content) = self.payload_mut(cell)? {
            *content = (value != 0).then_some(value);
        }
        if let Some(old) = old {
            self.release(old)?;
        }
        Ok(Some(()))
    }

    // Calls.

    /// Read the `count` topmost stack slots and lower the stack pointer past them.
    fn pop_call_slots(&mut self, sp_addr: u64, count: u64) -> SimResult<(u64, Vec<u64>)> {
        let sp = self.memory.read_u64(sp_addr)?;
        let base = sp
            .checked_sub(8 * count)
            .ok_or(SimError::Memory(crate::exec::ExecError::BadAddress {
                addr: sp,
                size: 8 * count,
            }))?;
        let mut slots = Vec::with_capacity(count as usize);
        for i in 0..count {
            slots.push(self.memory.read_u64(base + 8 * i)?);
        }
        self.memory.write_u64(sp_addr, base)?;
        Ok((base, slots))
    }

    /// `_PyEval_CallFunction`: callable, positional arguments and keyword pairs are
    /// popped and released whether or not the call succeeds.
    fn call_function(&mut self, sp_addr: u64, oparg: i32, injected: bool) -> SimResult<u64> {
        let npos = (oparg & 0xff) as usize;
        let nkw = ((oparg >> 8) & 0xff) as usize;
        let (_, slots) = self.pop_call_slots(sp_addr, (1 + npos + 2 * nkw) as u64)?;

        let result = if injected {
            self.set_error(ExcKind::SimulatedFailure, "injected failure in _PyEval_CallFunction");
            None
        } else {
            let kwargs: Vec<(u64, u64)> = slots[1 + npos..].chunks(2).map(|kv| (kv[0], kv[1])).collect();
            self.call_object(slots[0], &slots[1..=npos], &kwargs)?
        };
        for slot in slots {
            self.xrelease(slot)?;
        }
        Ok(object(result))
    }

    /// `_PyEval_CallFunctionVarKw`: like a plain call plus a trailing `*args` sequence
    /// and `**kwargs` dict; the result is pushed by the helper itself.
    fn call_function_var_kw(&mut self, sp_addr: u64, oparg: i32, injected: bool) -> SimResult<u64> {
        let npos = (oparg & 0xff) as usize;
        let nkw = ((oparg >> 8) & 0xff) as usize;
        let (base, slots) = self.pop_call_slots(sp_addr, (3 + npos + 2 * nkw) as u64)?;

        let result = if injected {
            self.set_error(
                ExcKind::SimulatedFailure,
                "injected failure in _PyEval_CallFunctionVarKw",
            );
            None
        } else {
            self.call_var_kw(&slots, npos, nkw)?
        };
        for &slot in &slots {
            self.xrelease(slot)?;
        }
        match result {
            Some(value) => {
                self.memory.write_u64(base, value)?;
                self.memory.write_u64(sp_addr, base + 8)?;
                Ok(0)
            }
            None => Ok(FAILED),
        }
    }

    fn call_var_kw(&mut self, slots: &[u64], npos: usize, nkw: usize) -> SimResult<Option<u64>> {
        let varargs = slots[1 + npos + 2 * nkw];
        let kwdict = slots[2 + npos + 2 * nkw];

        let mut args = slots[1..=npos].to_vec();
        match self.kind(varargs)? {
            Kind::Tuple | Kind::List => args.extend(self.items(varargs)?),
            _ => {
                let message = format!("argument after * must be a sequence, not {}", self.type_name(varargs)?);
                return self.raise(ExcKind::TypeError, message);
            }
        }
        let mut kwargs: Vec<(u64, u64)> = slots[1 + npos..1 + npos + 2 * nkw]
            .chunks(2)
            .map(|kv| (kv[0], kv[1]))
            .collect();
        match self.payload(kwdict)? {
            Payload::Dict(entries) => kwargs.extend(entries.iter().copied()),
            _ => {
                let message = format!("argument after ** must be a mapping, not {}", self.type_name(kwdict)?);
                return self.raise(ExcKind::TypeError, message);
            }
        }
        self.call_object(slots[0], &args, &kwargs)
    }

    /// Call `func` with borrowed arguments.
    fn call_object(&mut self, func: u64, args: &[u64], kwargs: &[(u64, u64)]) -> SimResult<Option<u64>> {
        let Kind::Builtin(builtin) = self.kind(func)? else {
            let message = format!("'{}' object is not callable", self.type_name(func)?);
            return self.raise(ExcKind::TypeError, message);
        };
        log::trace!("sim: calling {} with {} args", builtin.name(), args.len());
        if !kwargs.is_empty() {
            return self.raise(
                ExcKind::TypeError,
                format!("{}() takes no keyword arguments", builtin.name()),
            );
        }
        let expected = match builtin {
            Builtin::Tick => 0,
            Builtin::Len | Builtin::Abs => 1,
        };
        if args.len() != expected {
            return self.raise(
                ExcKind::TypeError,
                format!(
                    "{}() takes exactly {} argument{} ({} given)",
                    builtin.name(),
                    expected,
                    if expected == 1 { "" } else { "s" },
                    args.len()
                ),
            );
        }

        match builtin {
            Builtin::Tick => {
                self.ticks += 1;
                Ok(Some(self.new_none()?))
            }
            Builtin::Len => match self.seq_len(args[0])? {
                Some(len) => Ok(Some(self.new_int(len as i64)?)),
                None => {
                    let message = format!("object of type '{}' has no len()", self.type_name(args[0])?);
                    self.raise(ExcKind::TypeError, message)
                }
            },
            Builtin::Abs => match self.kind(args[0])? {
                Kind::Int(v) => match v.checked_abs() {
                    Some(v) => Ok(Some(self.new_int(v)?)),
                    None => self.raise(ExcKind::OverflowError, "integer result out of range"),
                },
                _ => {
                    let message = format!("bad operand type for abs(): '{}'", self.type_name(args[0])?);
                    self.raise(ExcKind::TypeError, message)
                }
            },
        }
    }

    // Raising.

    /// Name at `index` of the code tuple at `field` of the frame's code object.
    fn code_name_at(&self, frame: u64, field: u64, index: usize) -> SimResult<Option<String>> {
        let code = self.memory.read_u64(frame + self.layout.frame_code)?;
        let tuple = self.memory.read_u64(code + field)?;
        match self.items(tuple)?.get(index) {
            Some(&name) => Ok(Some(self.display(name)?)),
            None => Ok(None),
        }
    }

    fn raise_unbound_local(&mut self, frame: u64, index: i32) -> SimResult<()> {
        let name = self
            .code_name_at(frame, self.layout.code_varnames, index.max(0) as usize)?
            .unwrap_or_else(|| format!("#{}", index));
        self.set_error(
            ExcKind::UnboundLocalError,
            format!("local variable '{}' referenced before assignment", name),
        );
        Ok(())
    }

    fn raise_unbound_free(&mut self, frame: u64, index: i32) -> SimResult<()> {
        let index = index.max(0) as usize;
        let code = self.memory.read_u64(frame + self.layout.frame_code)?;
        let cellvars = self.memory.read_u64(code + self.layout.code_cellvars)?;
        let ncells = self.items(cellvars)?.len();
        if index < ncells {
            let name = self
                .code_name_at(frame, self.layout.code_cellvars, index)?
                .unwrap_or_default();
            self.set_error(
                ExcKind::UnboundLocalError,
                format!("local variable '{}' referenced before assignment", name),
            );
        } else {
            let name = self
                .code_name_at(frame, self.layout.code_freevars, index - ncells)?
                .unwrap_or_else(|| format!("#{}", index));
            self.set_error(
                ExcKind::NameError,
                format!(
                    "free variable '{}' referenced before assignment in enclosing scope",
                    name
                ),
            );
        }
        Ok(())
    }

    /// `_PyEval_DoRaise` steals all three references; any may be null.
    fn do_raise(&mut self, exc_type: u64, value: u64, traceback: u64) -> SimResult<()> {
        let raised = if exc_type == 0 {
            Err("NoneType")
        } else {
            match self.payload(exc_type)? {
                Payload::Type { name, exc: Some(_) } => Ok(name.clone()),
                other => Err(other.type_name()),
            }
        };
        let message = if value != 0 && self.kind(value)? != Kind::None {
            self.display(value)?
        } else {
            String::new()
        };
        match raised {
            Ok(name) => {
                log::debug!("sim: raising {}: {}", name, message);
                self.pending = Some(PendingError {
                    exc_type,
                    name,
                    message,
                });
            }
            Err(type_name) => self.set_error(
                ExcKind::TypeError,
                format!(
                    "exceptions must be old-style classes or derived from BaseException, not {}",
                    type_name
                ),
            ),
        }
        self.xrelease(exc_type)?;
        self.xrelease(value)?;
        self.xrelease(traceback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TranslatorConfig;
    use crate::exec::Host;

    fn sim() -> SimRuntime {
        SimRuntime::new(&TranslatorConfig::default()).unwrap()
    }

    #[test]
    fn test_slice_indices() {
        assert_eq!(slice_indices(5, None, None, 1), vec![0, 1, 2, 3, 4]);
        assert_eq!(slice_indices(5, Some(1), Some(-1), 1), vec![1, 2, 3]);
        assert_eq!(slice_indices(5, None, None, -2), vec![4, 2, 0]);
        assert_eq!(slice_indices(3, Some(10), None, 1), Vec::<usize>::new());
        assert_eq!(slice_indices(4, Some(-10), Some(2), 1), vec![0, 1]);
    }

    #[test]
    fn test_python_division_semantics() {
        assert_eq!(floor_div(-7, 2), Some(-4));
        assert_eq!(floor_div(7, 2), Some(3));
        assert_eq!(py_mod(-7, 2), Some(1));
        assert_eq!(py_mod(7, -2), Some(-1));
        assert_eq!(floor_div(i64::MIN, -1), None);
    }

    #[test]
    fn test_int_add_and_type_error() {
        let mut sim = sim();
        let a = sim.new_int(2).unwrap();
        let b = sim.new_int(40).unwrap();
        let sum = sim.dispatch(EntryPoint::NumberAdd, &[a, b]).unwrap();
        assert_eq!(sim.int_value(sum).unwrap(), Some(42));

        let s = sim.new_str("x").unwrap();
        let failed = sim.dispatch(EntryPoint::NumberSubtract, &[a, s]).unwrap();
        assert_eq!(failed, 0);
        let err = sim.take_error().unwrap();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "unsupported operand type(s) for -: 'int' and 'str'");
    }

    #[test]
    fn test_injected_failure_uses_convention() {
        let mut sim = sim();
        let list = sim.new_list(vec![]).unwrap();
        let item = sim.new_int(1).unwrap();
        sim.fail_next("PyList_Append").unwrap();
        assert_eq!(sim.dispatch(EntryPoint::ListAppend, &[list, item]).unwrap(), FAILED);
        assert!(sim.pending_error().is_some());
        assert_eq!(sim.refcount(item).unwrap(), 1);

        sim.take_error();
        assert_eq!(sim.dispatch(EntryPoint::ListAppend, &[list, item]).unwrap(), 0);
        assert_eq!(sim.repr(list).unwrap(), "[1]");
    }

    #[test]
    fn test_unpack_writes_downward() {
        let mut sim = sim();
        let a = sim.new_int(1).unwrap();
        let b = sim.new_int(2).unwrap();
        let t = sim.new_tuple(vec![a, b]).unwrap();
        let stack = sim.memory_mut().alloc(16, 8);
        let ok = sim.dispatch(EntryPoint::UnpackIterable, &[t, 2, stack + 16]).unwrap();
        assert_eq!(ok, 1);
        // First item on top.
        assert_eq!(sim.memory().read_u64(stack + 8).unwrap(), a);
        assert_eq!(sim.memory().read_u64(stack).unwrap(), b);

        let short = sim.dispatch(EntryPoint::UnpackIterable, &[t, 3, stack + 24]).unwrap();
        assert_eq!(short, 0);
        assert_eq!(sim.take_error().unwrap().message, "need more than 2 values to unpack");
    }

    #[test]
    fn test_dict_roundtrip_by_value() {
        let mut sim = sim();
        let dict = sim.new_dict().unwrap();
        let v = sim.new_int(5).unwrap();
        sim.dict_set_str(dict, "k", v).unwrap();
        let key = sim.new_str("k").unwrap();
        assert_eq!(sim.dict_get(dict, key).unwrap(), Some(v));
        assert_eq!(sim.refcount(v).unwrap(), 2);
        assert_eq!(sim.dispatch(EntryPoint::DictDelItem, &[dict, key]).unwrap(), 0);
        assert_eq!(sim.refcount(v).unwrap(), 1);
        assert_eq!(sim.dispatch(EntryPoint::DictDelItem, &[dict, key]).unwrap(), FAILED);
        assert_eq!(sim.take_error().unwrap().name, "KeyError");
    }
}

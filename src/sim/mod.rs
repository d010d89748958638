// This module is a simulated host runtime used to execute translated code under test.
// Objects live in the interpreter's byte-addressed Memory and are laid out with the
// same HostLayout the translator emits offsets from: the reference count and type
// pointer sit in the object header, tuples carry their items inline, lists point at a
// separately allocated item array, type objects expose tp_iternext, and code and frame
// objects hold exactly the fields the generated prologue reads. Everything the generated
// code never touches directly (integer values, string contents, dict entries, cell
// contents, attributes) is kept in a side table keyed by object address. Deallocation
// marks records dead instead of reusing memory, so a second free or any bridge call on a
// freed object is caught. A pending-error slot mirrors the host's thread state, and
// fault injection makes the next call to a named entry point fail using that entry
// point's own convention.

//! Simulated host runtime.

mod entry;
mod harness;
mod snapshot;

pub use harness::RunOutcome;
pub use snapshot::{BalanceReport, RefSnapshot};

use crate::bridge::{EntryPoint, FailurePolicy, HostGlobal};
use crate::core::TranslatorConfig;
use crate::exec::{ExecError, ExecResult, Host, Memory};
use crate::ir::Ty;
use crate::layout::HostLayout;
use crate::lower::{CodeUnit, Const};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use thiserror::Error;

/// Fake code address of the sequence iterator's `tp_iternext`.
pub const ITERNEXT_SEQUENCE: u64 = 0x7f00_0000_0010;
/// Fake code address of the StopIteration-raising iterator's `tp_iternext`.
pub const ITERNEXT_RAISING: u64 = 0x7f00_0000_0020;

/// Violations of the host's object contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error(transparent)]
    Memory(#[from] ExecError),

    #[error("{addr:#x} is not an object ({context})")]
    NotAnObject { addr: u64, context: String },

    #[error("use of freed object {addr:#x} ({context})")]
    UseAfterFree { addr: u64, context: String },

    #[error("object {addr:#x} deallocated twice")]
    DoubleFree { addr: u64 },

    #[error("object {addr:#x} deallocated with reference count {refcnt}")]
    LiveDealloc { addr: u64, refcnt: i64 },

    #[error("negative reference count on {addr:#x} in {function} at offset {offset}")]
    NegativeRefcount {
        function: String,
        offset: i32,
        addr: u64,
    },

    #[error("{what}: expected {expected}, given {given}")]
    ArgumentCount {
        what: String,
        expected: usize,
        given: usize,
    },

    #[error("`{0}` cannot be made to fail")]
    NotInjectable(String),

    #[error("unknown host symbol `{0}`")]
    UnknownSymbol(String),
}

pub type SimResult<T> = Result<T, SimError>;

macro_rules! exception_kinds {
    ($( $variant:ident ),* $(,)?) => {
        /// Exception types known to the simulated host.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ExcKind {
            $( $variant, )*
        }

        impl ExcKind {
            pub const ALL: &'static [ExcKind] = &[ $( ExcKind::$variant, )* ];

            pub const fn name(self) -> &'static str {
                match self {
                    $( ExcKind::$variant => stringify!($variant), )*
                }
            }
        }
    };
}

exception_kinds! {
    TypeError,
    NameError,
    UnboundLocalError,
    AttributeError,
    KeyError,
    IndexError,
    ValueError,
    ZeroDivisionError,
    OverflowError,
    RuntimeError,
    StopIteration,
    SimulatedFailure,
}

/// Builtin callables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Len,
    /// Counts its calls; returns None.
    Tick,
    Abs,
}

impl Builtin {
    pub const ALL: &'static [Builtin] = &[Builtin::Len, Builtin::Tick, Builtin::Abs];

    pub const fn name(self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Tick => "tick",
            Builtin::Abs => "abs",
        }
    }
}

/// Side-table contents of one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Type { name: String, exc: Option<ExcKind> },
    None,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Items inline after the header.
    Tuple,
    /// Items in a separately allocated array.
    List,
    Dict(Vec<(u64, u64)>),
    Cell(Option<u64>),
    Slice { start: u64, stop: u64, step: u64 },
    Iter { seq: u64, index: usize, raise_stop: bool },
    Namespace { name: String, attrs: Vec<(String, u64)> },
    Builtin(Builtin),
    Code,
    Frame { slots: usize },
}

impl Payload {
    fn type_name(&self) -> &'static str {
        match self {
            Payload::Type { .. } => "type",
            Payload::None => "NoneType",
            Payload::Bool(_) => "bool",
            Payload::Int(_) => "int",
            Payload::Str(_) => "str",
            Payload::Tuple => "tuple",
            Payload::List => "list",
            Payload::Dict(_) => "dict",
            Payload::Cell(_) => "cell",
            Payload::Slice { .. } => "slice",
            Payload::Iter { raise_stop: false, .. } => "listiterator",
            Payload::Iter { raise_stop: true, .. } => "raisingiterator",
            Payload::Namespace { .. } => "namespace",
            Payload::Builtin(_) => "builtin_function_or_method",
            Payload::Code => "code",
            Payload::Frame { .. } => "frame",
        }
    }
}

const TYPE_NAMES: &[&str] = &[
    "type",
    "NoneType",
    "bool",
    "int",
    "str",
    "tuple",
    "list",
    "dict",
    "cell",
    "slice",
    "listiterator",
    "raisingiterator",
    "namespace",
    "builtin_function_or_method",
    "code",
    "frame",
];

#[derive(Debug, Clone)]
struct ObjRecord {
    payload: Payload,
    alive: bool,
}

/// The exception currently in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingError {
    pub exc_type: u64,
    pub name: String,
    pub message: String,
}

impl fmt::Display for PendingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

pub struct SimRuntime {
    layout: HostLayout,
    ref_debug: bool,
    memory: Memory,
    objects: BTreeMap<u64, ObjRecord>,
    types: Vec<(&'static str, u64)>,
    exc_types: Vec<u64>,
    builtins: Vec<u64>,
    none: u64,
    true_obj: u64,
    false_obj: u64,
    ref_total_addr: u64,
    stop_iteration_addr: u64,
    pending: Option<PendingError>,
    faults: HashSet<String>,
    violations: Vec<SimError>,
    calls: BTreeMap<String, usize>,
    ticks: u64,
}

impl SimRuntime {
    /// A host whose object layout matches `config`.
    pub fn new(config: &TranslatorConfig) -> SimResult<Self> {
        let mut memory = Memory::new();
        let ref_total_addr = memory.alloc(8, 8);
        let stop_iteration_addr = memory.alloc(8, 8);

        let mut sim = Self {
            layout: HostLayout::new(config.layout_options()),
            ref_debug: config.ref_debug,
            memory,
            objects: BTreeMap::new(),
            types: Vec::new(),
            exc_types: Vec::new(),
            builtins: Vec::new(),
            none: 0,
            true_obj: 0,
            false_obj: 0,
            ref_total_addr,
            stop_iteration_addr,
            pending: None,
            faults: HashSet::new(),
            violations: Vec::new(),
            calls: BTreeMap::new(),
            ticks: 0,
        };

        for &name in TYPE_NAMES {
            let iternext = match name {
                "listiterator" => ITERNEXT_SEQUENCE,
                "raisingiterator" => ITERNEXT_RAISING,
                _ => 0,
            };
            let addr = sim.new_type(name, None, iternext)?;
            sim.types.push((name, addr));
        }
        // The metatype is its own type.
        let metatype = sim.type_object("type");
        sim.memory.write_u64(metatype + sim.layout.ob_type, metatype)?;

        sim.none = sim.alloc_object(Payload::None, 0)?;
        sim.true_obj = sim.alloc_object(Payload::Bool(true), 0)?;
        sim.false_obj = sim.alloc_object(Payload::Bool(false), 0)?;

        for &kind in ExcKind::ALL {
            let addr = sim.new_type(kind.name(), Some(kind), 0)?;
            sim.exc_types.push(addr);
        }
        let stop = sim.exception_type(ExcKind::StopIteration);
        sim.memory.write_u64(stop_iteration_addr, stop)?;

        for &builtin in Builtin::ALL {
            let addr = sim.alloc_object(Payload::Builtin(builtin), 0)?;
            sim.builtins.push(addr);
        }

        log::debug!(
            "sim: host ready with layout {}, {} bytes in use",
            sim.layout.version,
            sim.memory.used()
        );
        Ok(sim)
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    fn new_type(&mut self, name: &str, exc: Option<ExcKind>, iternext: u64) -> SimResult<u64> {
        let payload = Payload::Type {
            name: name.to_string(),
            exc,
        };
        let addr = self.alloc_object(payload, self.layout.type_object.size)?;
        let tp_name = self.memory.alloc_cstr(name);
        self.memory.write_u64(addr + self.layout.tp_name, tp_name)?;
        self.memory.write_u64(addr + self.layout.tp_iternext, iternext)?;
        Ok(addr)
    }

    fn type_object(&self, name: &str) -> u64 {
        self.types
            .iter()
            .find(|(n, _)| *n == name)
            .map_or(0, |&(_, addr)| addr)
    }

    /// Allocate an object with refcount 1. `size` below the header size is rounded up.
    fn alloc_object(&mut self, payload: Payload, size: u64) -> SimResult<u64> {
        let type_addr = self.type_object(payload.type_name());
        let addr = self.memory.alloc(size.max(self.layout.header.size), 8);
        self.memory.write_u64(addr + self.layout.ob_refcnt, 1)?;
        self.memory.write_u64(addr + self.layout.ob_type, type_addr)?;
        self.objects.insert(addr, ObjRecord { payload, alive: true });
        self.adjust_total(1)?;
        Ok(addr)
    }

    fn adjust_total(&mut self, delta: i64) -> SimResult<()> {
        let total = self.memory.read_i64(self.ref_total_addr)?;
        self.memory.write_u64(self.ref_total_addr, (total + delta) as u64)?;
        Ok(())
    }

    /// `_Py_RefTotal` as the generated code sees it.
    pub fn ref_total(&self) -> SimResult<i64> {
        Ok(self.memory.read_i64(self.ref_total_addr)?)
    }

    fn record(&self, addr: u64, context: &str) -> SimResult<&ObjRecord> {
        match self.objects.get(&addr) {
            Some(record) if record.alive => Ok(record),
            Some(_) => Err(SimError::UseAfterFree {
                addr,
                context: context.to_string(),
            }),
            None => Err(SimError::NotAnObject {
                addr,
                context: context.to_string(),
            }),
        }
    }

    pub fn payload(&self, addr: u64) -> SimResult<&Payload> {
        Ok(&self.record(addr, "payload")?.payload)
    }

    fn payload_mut(&mut self, addr: u64) -> SimResult<&mut Payload> {
        self.record(addr, "payload")?;
        match self.objects.get_mut(&addr) {
            Some(record) => Ok(&mut record.payload),
            None => Err(SimError::NotAnObject {
                addr,
                context: "payload".to_string(),
            }),
        }
    }

    pub fn is_alive(&self, addr: u64) -> bool {
        self.objects.get(&addr).is_some_and(|r| r.alive)
    }

    pub fn refcount(&self, addr: u64) -> SimResult<i64> {
        self.record(addr, "refcount")?;
        Ok(self.memory.read_i64(addr + self.layout.ob_refcnt)?)
    }

    pub fn type_name(&self, addr: u64) -> SimResult<&'static str> {
        Ok(self.payload(addr)?.type_name())
    }

    pub fn incref(&mut self, addr: u64) -> SimResult<()> {
        self.record(addr, "incref")?;
        let at = addr + self.layout.ob_refcnt;
        let count = self.memory.read_i64(at)?;
        self.memory.write_u64(at, (count + 1) as u64)?;
        self.adjust_total(1)
    }

    /// Drop one reference, deallocating at zero.
    pub fn release(&mut self, addr: u64) -> SimResult<()> {
        self.record(addr, "release")?;
        let at = addr + self.layout.ob_refcnt;
        let count = self.memory.read_i64(at)? - 1;
        self.memory.write_u64(at, count as u64)?;
        self.adjust_total(-1)?;
        match count {
            0 => self.dealloc(addr),
            c if c < 0 => {
                let err = SimError::NegativeRefcount {
                    function: "<host>".to_string(),
                    offset: -1,
                    addr,
                };
                log::warn!("sim: {}", err);
                self.violations.push(err);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Like [`release`](Self::release), ignoring null.
    pub fn xrelease(&mut self, addr: u64) -> SimResult<()> {
        if addr == 0 {
            return Ok(());
        }
        self.release(addr)
    }

    fn dealloc(&mut self, addr: u64) -> SimResult<()> {
        let payload = match self.objects.get(&addr) {
            None => {
                return Err(SimError::NotAnObject {
                    addr,
                    context: "dealloc".to_string(),
                })
            }
            Some(record) if !record.alive => {
                let err = SimError::DoubleFree { addr };
                self.violations.push(err.clone());
                return Err(err);
            }
            Some(record) => record.payload.clone(),
        };
        let refcnt = self.memory.read_i64(addr + self.layout.ob_refcnt)?;
        if refcnt != 0 {
            let err = SimError::LiveDealloc { addr, refcnt };
            self.violations.push(err.clone());
            return Err(err);
        }

        let children = self.children(addr, &payload)?;
        if let Some(record) = self.objects.get_mut(&addr) {
            record.alive = false;
        }
        log::trace!("sim: dealloc {:#x} ({})", addr, payload.type_name());
        for child in children {
            self.xrelease(child)?;
        }
        Ok(())
    }

    /// References owned by an object, released when it dies.
    fn children(&self, addr: u64, payload: &Payload) -> SimResult<Vec<u64>> {
        Ok(match payload {
            Payload::Tuple | Payload::List => self.seq_items(addr)?.unwrap_or_default(),
            Payload::Dict(entries) => entries.iter().flat_map(|&(k, v)| [k, v]).collect(),
            Payload::Cell(content) => content.iter().copied().collect(),
            Payload::Slice { start, stop, step } => vec![*start, *stop, *step],
            Payload::Iter { seq, .. } => vec![*seq],
            Payload::Namespace { attrs, .. } => attrs.iter().map(|&(_, v)| v).collect(),
            Payload::Code => {
                let layout = &self.layout;
                let mut fields = Vec::new();
                for offset in [
                    layout.code_consts,
                    layout.code_names,
                    layout.code_varnames,
                    layout.code_cellvars,
                    layout.code_freevars,
                    layout.code_name,
                ] {
                    fields.push(self.memory.read_u64(addr + offset)?);
                }
                fields
            }
            Payload::Frame { slots } => {
                let layout = &self.layout;
                let mut refs = Vec::with_capacity(slots + 3);
                for offset in [layout.frame_code, layout.frame_globals, layout.frame_builtins] {
                    refs.push(self.memory.read_u64(addr + offset)?);
                }
                let locals = addr + layout.frame_localsplus;
                for i in 0..*slots as u64 {
                    refs.push(self.memory.read_u64(locals + 8 * i)?);
                }
                refs
            }
            Payload::Type { .. }
            | Payload::None
            | Payload::Bool(_)
            | Payload::Int(_)
            | Payload::Str(_)
            | Payload::Builtin(_) => Vec::new(),
        })
    }

    /// Base address and length of a tuple's or list's item array.
    fn seq_slots(&self, addr: u64) -> SimResult<Option<(u64, usize)>> {
        let base = match self.payload(addr)? {
            Payload::Tuple => addr + self.layout.tuple_item,
            Payload::List => self.memory.read_u64(addr + self.layout.list_item)?,
            _ => return Ok(None),
        };
        let len = self.memory.read_i64(addr + self.layout.ob_size)?.max(0) as usize;
        Ok(Some((base, len)))
    }

    /// Borrowed items of a tuple or list; slots may be null while it is being filled.
    pub fn seq_items(&self, addr: u64) -> SimResult<Option<Vec<u64>>> {
        let Some((base, len)) = self.seq_slots(addr)? else {
            return Ok(None);
        };
        let mut items = Vec::with_capacity(len);
        for i in 0..len as u64 {
            items.push(self.memory.read_u64(base + 8 * i)?);
        }
        Ok(Some(items))
    }

    // Constructors. Functions taking item vectors steal those references.

    pub fn none(&self) -> u64 {
        self.none
    }

    pub fn true_obj(&self) -> u64 {
        self.true_obj
    }

    pub fn false_obj(&self) -> u64 {
        self.false_obj
    }

    pub fn exception_type(&self, kind: ExcKind) -> u64 {
        self.exc_types[kind as usize]
    }

    pub fn builtin(&self, builtin: Builtin) -> u64 {
        self.builtins[builtin as usize]
    }

    /// New reference to the True or False singleton.
    pub fn new_bool(&mut self, value: bool) -> SimResult<u64> {
        let addr = if value { self.true_obj } else { self.false_obj };
        self.incref(addr)?;
        Ok(addr)
    }

    /// New reference to None.
    pub fn new_none(&mut self) -> SimResult<u64> {
        self.incref(self.none)?;
        Ok(self.none)
    }

    pub fn new_int(&mut self, value: i64) -> SimResult<u64> {
        self.alloc_object(Payload::Int(value), 0)
    }

    pub fn new_str(&mut self, value: &str) -> SimResult<u64> {
        self.alloc_object(Payload::Str(value.to_string()), self.layout.var_header.size)
    }

    pub fn new_tuple(&mut self, items: Vec<u64>) -> SimResult<u64> {
        let tuple = self.alloc_object(Payload::Tuple, self.layout.tuple_size(items.len()))?;
        self.memory
            .write_u64(tuple + self.layout.ob_size, items.len() as u64)?;
        let base = tuple + self.layout.tuple_item;
        for (i, &item) in items.iter().enumerate() {
            self.memory.write_u64(base + 8 * i as u64, item)?;
        }
        Ok(tuple)
    }

    pub fn new_list(&mut self, items: Vec<u64>) -> SimResult<u64> {
        let list = self.alloc_object(Payload::List, self.layout.list.size)?;
        self.list_store(list, &items)?;
        Ok(list)
    }

    /// Replace a list's item array wholesale; ownership of `items` moves into the list.
    fn list_store(&mut self, list: u64, items: &[u64]) -> SimResult<()> {
        let capacity = items.len().max(4);
        let array = self.memory.alloc(8 * capacity as u64, 8);
        for (i, &item) in items.iter().enumerate() {
            self.memory.write_u64(array + 8 * i as u64, item)?;
        }
        self.memory.write_u64(list + self.layout.list_item, array)?;
        self.memory
            .write_u64(list + self.layout.ob_size, items.len() as u64)?;
        self.memory
            .write_u64(list + self.layout.list_allocated, capacity as u64)?;
        Ok(())
    }

    pub fn new_dict(&mut self) -> SimResult<u64> {
        self.alloc_object(Payload::Dict(Vec::new()), 0)
    }

    /// Bind `key` to `value` in `dict`; both references are borrowed.
    pub fn dict_set_str(&mut self, dict: u64, key: &str, value: u64) -> SimResult<()> {
        let key = self.new_str(key)?;
        self.dict_set(dict, key, value)?;
        self.release(key)
    }

    /// A builtins dict holding the builtin callables and every exception type.
    pub fn new_builtins_dict(&mut self) -> SimResult<u64> {
        let dict = self.new_dict()?;
        for &builtin in Builtin::ALL {
            self.dict_set_str(dict, builtin.name(), self.builtin(builtin))?;
        }
        for &kind in ExcKind::ALL {
            self.dict_set_str(dict, kind.name(), self.exception_type(kind))?;
        }
        Ok(dict)
    }

    pub fn new_cell(&mut self, content: Option<u64>) -> SimResult<u64> {
        self.alloc_object(Payload::Cell(content), 0)
    }

    pub fn new_namespace(&mut self, name: &str) -> SimResult<u64> {
        let payload = Payload::Namespace {
            name: name.to_string(),
            attrs: Vec::new(),
        };
        self.alloc_object(payload, 0)
    }

    /// Iterator over a tuple, list, str or dict; the iterator holds its own reference.
    pub fn new_iter(&mut self, seq: u64, raise_stop: bool) -> SimResult<u64> {
        self.incref(seq)?;
        let payload = Payload::Iter {
            seq,
            index: 0,
            raise_stop,
        };
        self.alloc_object(payload, 0)
    }

    pub fn object_from_const(&mut self, value: &Const) -> SimResult<u64> {
        match value {
            Const::None => self.new_none(),
            Const::True => self.new_bool(true),
            Const::False => self.new_bool(false),
            Const::Int(v) => self.new_int(*v),
            Const::Str(s) => self.new_str(s),
            Const::Tuple(items) => {
                let items = items
                    .iter()
                    .map(|item| self.object_from_const(item))
                    .collect::<SimResult<Vec<_>>>()?;
                self.new_tuple(items)
            }
        }
    }

    fn str_tuple(&mut self, strings: &[String]) -> SimResult<u64> {
        let items = strings
            .iter()
            .map(|s| self.new_str(s))
            .collect::<SimResult<Vec<_>>>()?;
        self.new_tuple(items)
    }

    /// A code object carrying the pools of `unit`.
    pub fn new_code(&mut self, unit: &CodeUnit) -> SimResult<u64> {
        let consts = unit
            .consts
            .iter()
            .map(|c| self.object_from_const(c))
            .collect::<SimResult<Vec<_>>>()?;
        let consts = self.new_tuple(consts)?;
        let names = self.str_tuple(&unit.names)?;
        let varnames = self.str_tuple(&unit.varnames)?;
        let cellvars = self.str_tuple(&unit.cellvars)?;
        let freevars = self.str_tuple(&unit.freevars)?;
        let name = self.new_str(&unit.name)?;

        let code = self.alloc_object(Payload::Code, self.layout.code.size)?;
        let layout = &self.layout;
        let fields = [
            (layout.code_consts, consts),
            (layout.code_names, names),
            (layout.code_varnames, varnames),
            (layout.code_cellvars, cellvars),
            (layout.code_freevars, freevars),
            (layout.code_name, name),
        ];
        let (argcount_at, nlocals_at) = (layout.code_argcount, layout.code_nlocals);
        for (offset, value) in fields {
            self.memory.write_u64(code + offset, value)?;
        }
        self.memory
            .write(code + argcount_at, Ty::I32, unit.argcount as u64)?;
        self.memory
            .write(code + nlocals_at, Ty::I32, unit.nlocals() as u64)?;
        Ok(code)
    }

    /// A frame ready to run `unit`. Globals, builtins, arguments and closure cells are
    /// borrowed; the frame takes its own references.
    pub fn new_frame(
        &mut self,
        unit: &CodeUnit,
        globals: u64,
        builtins: u64,
        args: &[u64],
        closure: &[u64],
    ) -> SimResult<u64> {
        if args.len() != unit.argcount {
            return Err(SimError::ArgumentCount {
                what: format!("arguments to {}", unit.name),
                expected: unit.argcount,
                given: args.len(),
            });
        }
        if closure.len() != unit.freevars.len() {
            return Err(SimError::ArgumentCount {
                what: format!("closure cells of {}", unit.name),
                expected: unit.freevars.len(),
                given: closure.len(),
            });
        }

        let stack = unit
            .static_depths()
            .map(|depths| depths.max_depth)
            .unwrap_or(0)
            .max(unit.stacksize);
        let nlocals = unit.nlocals();
        let slots = nlocals + unit.ncells();

        let code = self.new_code(unit)?;
        let size = self.layout.frame_localsplus + 8 * (slots + stack) as u64;
        let frame = self.alloc_object(Payload::Frame { slots }, size)?;
        self.incref(globals)?;
        self.incref(builtins)?;
        self.memory.write_u64(frame + self.layout.frame_code, code)?;
        self.memory.write_u64(frame + self.layout.frame_globals, globals)?;
        self.memory
            .write_u64(frame + self.layout.frame_builtins, builtins)?;

        let locals = frame + self.layout.frame_localsplus;
        for (i, &arg) in args.iter().enumerate() {
            self.incref(arg)?;
            self.memory.write_u64(locals + 8 * i as u64, arg)?;
        }
        for (i, name) in unit.cellvars.iter().enumerate() {
            // A cell named after a parameter starts out holding the argument.
            let initial = unit
                .varnames
                .iter()
                .take(unit.argcount)
                .position(|v| v == name)
                .map(|j| args[j]);
            if let Some(value) = initial {
                self.incref(value)?;
            }
            let cell = self.new_cell(initial)?;
            self.memory
                .write_u64(locals + 8 * (nlocals + i) as u64, cell)?;
        }
        for (i, &cell) in closure.iter().enumerate() {
            self.incref(cell)?;
            let slot = nlocals + unit.cellvars.len() + i;
            self.memory.write_u64(locals + 8 * slot as u64, cell)?;
        }

        let valuestack = locals + 8 * slots as u64;
        self.memory
            .write_u64(frame + self.layout.frame_valuestack, valuestack)?;
        self.memory
            .write_u64(frame + self.layout.frame_stacktop, valuestack)?;
        log::debug!("sim: frame {:#x} for {} with {} stack slots", frame, unit.name, stack);
        Ok(frame)
    }

    /// Current content of local `index` of `frame` (borrowed, possibly null).
    pub fn frame_local(&self, frame: u64, index: usize) -> SimResult<u64> {
        self.record(frame, "frame_local")?;
        let addr = frame + self.layout.frame_localsplus + 8 * index as u64;
        Ok(self.memory.read_u64(addr)?)
    }

    // Error state.

    fn set_error(&mut self, kind: ExcKind, message: impl Into<String>) {
        let message = message.into();
        log::debug!("sim: raising {}: {}", kind.name(), message);
        self.pending = Some(PendingError {
            exc_type: self.exception_type(kind),
            name: kind.name().to_string(),
            message,
        });
    }

    /// Set a pending error and report the operation as failed.
    fn raise<T>(&mut self, kind: ExcKind, message: impl Into<String>) -> SimResult<Option<T>> {
        self.set_error(kind, message);
        Ok(None)
    }

    pub fn pending_error(&self) -> Option<&PendingError> {
        self.pending.as_ref()
    }

    pub fn take_error(&mut self) -> Option<PendingError> {
        self.pending.take()
    }

    /// Make the next call of `name` fail. `tp_iternext` names the iterator slot.
    pub fn fail_next(&mut self, name: &str) -> SimResult<()> {
        let injectable = name == "tp_iternext"
            || EntryPoint::from_name(name).is_some_and(|ep| {
                ep.policy() != FailurePolicy::Infallible
                    || matches!(ep, EntryPoint::DictGetItem | EntryPoint::CellGet)
            });
        if !injectable {
            return Err(SimError::NotInjectable(name.to_string()));
        }
        self.faults.insert(name.to_string());
        Ok(())
    }

    fn take_fault(&mut self, name: &str) -> bool {
        self.faults.remove(name)
    }

    /// Contract violations observed so far.
    pub fn violations(&self) -> &[SimError] {
        &self.violations
    }

    /// Number of calls made to the entry point `name`.
    pub fn call_count(&self, name: &str) -> usize {
        self.calls.get(name).copied().unwrap_or(0)
    }

    /// Calls made to the `tick` builtin.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn repr(&self, addr: u64) -> SimResult<String> {
        if addr == 0 {
            return Ok("NULL".to_string());
        }
        Ok(match self.payload(addr)? {
            Payload::Type { name, .. } => format!("<type '{}'>", name),
            Payload::None => "None".to_string(),
            Payload::Bool(true) => "True".to_string(),
            Payload::Bool(false) => "False".to_string(),
            Payload::Int(v) => v.to_string(),
            Payload::Str(s) => str_repr(s),
            Payload::Tuple | Payload::List => {
                let is_tuple = matches!(self.payload(addr)?, Payload::Tuple);
                let items = self.seq_items(addr)?.unwrap_or_default();
                let mut parts = Vec::with_capacity(items.len());
                for item in &items {
                    parts.push(self.repr(*item)?);
                }
                match (is_tuple, parts.len()) {
                    (true, 1) => format!("({},)", parts[0]),
                    (true, _) => format!("({})", parts.join(", ")),
                    (false, _) => format!("[{}]", parts.join(", ")),
                }
            }
            Payload::Dict(entries) => {
                let mut parts = Vec::with_capacity(entries.len());
                for &(k, v) in entries {
                    parts.push(format!("{}: {}", self.repr(k)?, self.repr(v)?));
                }
                format!("{{{}}}", parts.join(", "))
            }
            Payload::Slice { start, stop, step } => format!(
                "slice({}, {}, {})",
                self.repr(*start)?,
                self.repr(*stop)?,
                self.repr(*step)?
            ),
            Payload::Namespace { name, .. } => format!("<namespace {}>", name),
            Payload::Builtin(b) => format!("<built-in function {}>", b.name()),
            other => format!("<{} object at {:#x}>", other.type_name(), addr),
        })
    }

    /// `str()` of an object: strings unquoted, everything else as `repr`.
    pub fn display(&self, addr: u64) -> SimResult<String> {
        match self.payload(addr)? {
            Payload::Str(s) => Ok(s.clone()),
            _ => self.repr(addr),
        }
    }

    pub fn int_value(&self, addr: u64) -> SimResult<Option<i64>> {
        Ok(match self.payload(addr)? {
            Payload::Int(v) => Some(*v),
            Payload::Bool(b) => Some(*b as i64),
            _ => None,
        })
    }

    fn host_error(&mut self, symbol: &str, err: SimError) -> ExecError {
        if !matches!(err, SimError::Memory(_)) && !self.violations.contains(&err) {
            self.violations.push(err.clone());
        }
        match err {
            SimError::Memory(inner) => inner,
            other => ExecError::Host {
                symbol: symbol.to_string(),
                message: other.to_string(),
            },
        }
    }
}

fn str_repr(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

impl Host for SimRuntime {
    fn memory(&self) -> &Memory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    fn global_address(&mut self, name: &str) -> ExecResult<u64> {
        match HostGlobal::from_name(name) {
            Some(HostGlobal::RefTotal) => Ok(self.ref_total_addr),
            Some(HostGlobal::NoneStruct) => Ok(self.none),
            Some(HostGlobal::TrueStruct) => Ok(self.true_obj),
            Some(HostGlobal::ZeroStruct) => Ok(self.false_obj),
            Some(HostGlobal::StopIteration) => Ok(self.stop_iteration_addr),
            None => Err(self.host_error(name, SimError::UnknownSymbol(name.to_string()))),
        }
    }

    fn call_extern(&mut self, name: &str, args: &[u64]) -> ExecResult<u64> {
        let Some(ep) = EntryPoint::from_name(name) else {
            return Err(self.host_error(name, SimError::UnknownSymbol(name.to_string())));
        };
        *self.calls.entry(name.to_string()).or_insert(0) += 1;
        log::trace!("sim: {}({:x?})", name, args);
        match self.dispatch(ep, args) {
            Ok(result) => Ok(result),
            Err(err) => Err(self.host_error(name, err)),
        }
    }

    fn call_pointer(&mut self, addr: u64, args: &[u64]) -> ExecResult<u64> {
        *self.calls.entry("tp_iternext".to_string()).or_insert(0) += 1;
        match self.iternext(addr, args) {
            Ok(result) => Ok(result),
            Err(err) => Err(self.host_error("tp_iternext", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim() -> SimRuntime {
        SimRuntime::new(&TranslatorConfig::default().with_ref_debug(true)).unwrap()
    }

    #[test]
    fn test_header_matches_layout() {
        let mut sim = sim();
        let v = sim.new_int(7).unwrap();
        let layout = sim.layout().clone();
        assert_eq!(sim.memory().read_i64(v + layout.ob_refcnt).unwrap(), 1);
        let ty = sim.memory().read_u64(v + layout.ob_type).unwrap();
        assert_eq!(sim.repr(ty).unwrap(), "<type 'int'>");
    }

    #[test]
    fn test_release_deallocates_children() {
        let mut sim = sim();
        let a = sim.new_int(1).unwrap();
        let b = sim.new_str("x").unwrap();
        let t = sim.new_tuple(vec![a, b]).unwrap();
        assert_eq!(sim.repr(t).unwrap(), "(1, 'x')");
        sim.release(t).unwrap();
        assert!(!sim.is_alive(t));
        assert!(!sim.is_alive(a));
        assert!(!sim.is_alive(b));
    }

    #[test]
    fn test_double_free_detected() {
        let mut sim = sim();
        let a = sim.new_int(1).unwrap();
        sim.release(a).unwrap();
        assert!(matches!(sim.dealloc(a), Err(SimError::DoubleFree { .. })));
        assert!(matches!(sim.incref(a), Err(SimError::UseAfterFree { .. })));
    }

    #[test]
    fn test_ref_total_tracks_counts() {
        let mut sim = sim();
        let before = sim.ref_total().unwrap();
        let a = sim.new_int(1).unwrap();
        sim.incref(a).unwrap();
        assert_eq!(sim.ref_total().unwrap(), before + 2);
        sim.release(a).unwrap();
        sim.release(a).unwrap();
        assert_eq!(sim.ref_total().unwrap(), before);
    }

    #[test]
    fn test_fail_next_rejects_uncheckable() {
        let mut sim = sim();
        assert!(sim.fail_next("PyNumber_Add").is_ok());
        assert!(sim.fail_next("tp_iternext").is_ok());
        assert!(sim.fail_next("PyDict_GetItem").is_ok());
        assert!(matches!(sim.fail_next("PyErr_Clear"), Err(SimError::NotInjectable(_))));
        assert!(matches!(sim.fail_next("nonsense"), Err(SimError::NotInjectable(_))));
    }

    #[test]
    fn test_str_repr_quoting() {
        assert_eq!(str_repr("ab"), "'ab'");
        assert_eq!(str_repr("it's"), "\"it's\"");
        assert_eq!(str_repr("a\nb"), "'a\\nb'");
    }
}

// This module is the object-model descriptor: a static, versioned description of the
// host runtime's object layouts, used only to compute field offsets. Each host struct is
// written down as an ordered list of fields (pointer-sized integers, C ints, longs,
// pointers, fixed arrays, nested records and one trailing flexible array) and laid out
// with natural alignment for a 64-bit host. The optional debug-build fields are part of
// the description: trace-refs builds prepend two link words to every object header and
// count-allocs builds append statistics slots to type objects, so one LayoutOptions value
// selects the variant. HostLayout resolves every offset the translator emits, tags it
// with a LayoutVersion, and can be validated once at startup against a LayoutProbe
// reported by the real host. A mismatch is reported as TranslateError::LayoutMismatch
// naming the first divergent field instead of silently corrupting memory later.

//! Versioned host object layouts.

use crate::core::{TranslateError, TranslateResult};
use std::fmt;

/// Maximum nesting of try blocks recorded in a frame.
pub const CO_MAXBLOCKS: usize = 20;

/// Scalar field types of the host structs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    /// `Py_ssize_t`.
    Ssize,
    /// C `int`.
    Int,
    /// C `unsigned int`.
    UInt,
    /// C `long`.
    Long,
    /// Any data or function pointer.
    Ptr,
}

impl Scalar {
    pub const fn size(self) -> u64 {
        match self {
            Scalar::Int | Scalar::UInt => 4,
            Scalar::Ssize | Scalar::Long | Scalar::Ptr => 8,
        }
    }

    pub const fn align(self) -> u64 {
        self.size()
    }
}

/// Shape of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(Scalar),
    Record(Box<StructDesc>, usize),
    /// Trailing variable-length array; contributes no size.
    Flexible(Scalar),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDesc {
    pub name: &'static str,
    pub kind: FieldKind,
}

/// Ordered field list of a host struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructDesc {
    pub name: &'static str,
    pub fields: Vec<FieldDesc>,
}

impl StructDesc {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            fields: Vec::new(),
        }
    }

    fn field(mut self, name: &'static str, scalar: Scalar) -> Self {
        self.fields.push(FieldDesc {
            name,
            kind: FieldKind::Scalar(scalar),
        });
        self
    }

    fn fields(mut self, names: &[&'static str], scalar: Scalar) -> Self {
        for name in names {
            self = self.field(name, scalar);
        }
        self
    }

    fn records(mut self, name: &'static str, record: StructDesc, len: usize) -> Self {
        self.fields.push(FieldDesc {
            name,
            kind: FieldKind::Record(Box::new(record), len),
        });
        self
    }

    fn flexible(mut self, name: &'static str, scalar: Scalar) -> Self {
        self.fields.push(FieldDesc {
            name,
            kind: FieldKind::Flexible(scalar),
        });
        self
    }

    fn extend(mut self, base: &StructDesc) -> Self {
        self.fields.extend(base.fields.iter().cloned());
        self
    }

    /// Compute offsets with natural alignment.
    pub fn layout(&self) -> StructLayout {
        let mut offset = 0u64;
        let mut align = 1u64;
        let mut offsets = Vec::with_capacity(self.fields.len());

        for field in &self.fields {
            let (size, field_align) = match &field.kind {
                FieldKind::Scalar(s) => (s.size(), s.align()),
                FieldKind::Record(desc, len) => {
                    let inner = desc.layout();
                    (inner.size * *len as u64, inner.align)
                }
                FieldKind::Flexible(s) => (0, s.align()),
            };
            offset = align_to(offset, field_align);
            align = align.max(field_align);
            offsets.push((field.name, offset));
            offset += size;
        }

        StructLayout {
            name: self.name,
            size: align_to(offset, align),
            align,
            offsets,
        }
    }
}

fn align_to(offset: u64, align: u64) -> u64 {
    offset.div_ceil(align) * align
}

/// Resolved offsets of one host struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: &'static str,
    pub size: u64,
    pub align: u64,
    pub offsets: Vec<(&'static str, u64)>,
}

impl StructLayout {
    pub fn offset_of(&self, field: &str) -> Option<u64> {
        self.offsets
            .iter()
            .find(|(name, _)| *name == field)
            .map(|&(_, offset)| offset)
    }

    fn require(&self, field: &'static str) -> u64 {
        match self.offset_of(field) {
            Some(offset) => offset,
            None => panic!("layout descriptor {} lacks field {}", self.name, field),
        }
    }
}

/// Build-mode variant of the host layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LayoutOptions {
    pub trace_refs: bool,
    pub count_allocs: bool,
}

/// Identifies which descriptor set produced a `HostLayout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutVersion {
    pub major: u8,
    pub minor: u8,
    pub options: LayoutOptions,
}

impl LayoutVersion {
    pub const MAJOR: u8 = 2;
    pub const MINOR: u8 = 6;
}

impl fmt::Display for LayoutVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if self.options.trace_refs {
            write!(f, "+trace-refs")?;
        }
        if self.options.count_allocs {
            write!(f, "+count-allocs")?;
        }
        Ok(())
    }
}

/// `PyObject_HEAD`.
pub fn object_header(options: LayoutOptions) -> StructDesc {
    let mut desc = StructDesc::new("PyObject");
    if options.trace_refs {
        desc = desc.fields(&["_ob_next", "_ob_prev"], Scalar::Ptr);
    }
    desc.field("ob_refcnt", Scalar::Ssize)
        .field("ob_type", Scalar::Ptr)
}

/// `PyObject_VAR_HEAD`.
pub fn var_header(options: LayoutOptions) -> StructDesc {
    StructDesc::new("PyVarObject")
        .extend(&object_header(options))
        .field("ob_size", Scalar::Ssize)
}

pub fn tuple_object(options: LayoutOptions) -> StructDesc {
    StructDesc::new("PyTupleObject")
        .extend(&var_header(options))
        .flexible("ob_item", Scalar::Ptr)
}

pub fn list_object(options: LayoutOptions) -> StructDesc {
    StructDesc::new("PyListObject")
        .extend(&var_header(options))
        .field("ob_item", Scalar::Ptr)
        .field("allocated", Scalar::Ssize)
}

pub fn type_object(options: LayoutOptions) -> StructDesc {
    let desc = StructDesc::new("PyTypeObject")
        .extend(&var_header(options))
        .field("tp_name", Scalar::Ptr)
        .fields(&["tp_basicsize", "tp_itemsize"], Scalar::Ssize)
        .fields(
            &[
                "tp_dealloc",
                "tp_print",
                "tp_getattr",
                "tp_setattr",
                "tp_compare",
                "tp_repr",
                "tp_as_number",
                "tp_as_sequence",
                "tp_as_mapping",
                "tp_hash",
                "tp_call",
                "tp_str",
                "tp_getattro",
                "tp_setattro",
                "tp_as_buffer",
            ],
            Scalar::Ptr,
        )
        .field("tp_flags", Scalar::Long)
        .fields(&["tp_doc", "tp_traverse", "tp_clear", "tp_richcompare"], Scalar::Ptr)
        .field("tp_weaklistoffset", Scalar::Ssize)
        .fields(
            &[
                "tp_iter",
                "tp_iternext",
                "tp_methods",
                "tp_members",
                "tp_getset",
                "tp_base",
                "tp_dict",
                "tp_descr_get",
                "tp_descr_set",
            ],
            Scalar::Ptr,
        )
        .field("tp_dictoffset", Scalar::Ssize)
        .fields(
            &[
                "tp_init",
                "tp_alloc",
                "tp_new",
                "tp_free",
                "tp_is_gc",
                "tp_bases",
                "tp_mro",
                "tp_cache",
                "tp_subclasses",
                "tp_weaklist",
                "tp_del",
            ],
            Scalar::Ptr,
        )
        .field("tp_version_tag", Scalar::UInt);

    if options.count_allocs {
        desc.fields(&["tp_allocs", "tp_frees", "tp_maxalloc"], Scalar::Ssize)
            .fields(&["tp_prev", "tp_next"], Scalar::Ptr)
    } else {
        desc
    }
}

pub fn code_object(options: LayoutOptions) -> StructDesc {
    StructDesc::new("PyCodeObject")
        .extend(&object_header(options))
        .fields(
            &["co_argcount", "co_nlocals", "co_stacksize", "co_flags"],
            Scalar::Int,
        )
        .fields(
            &[
                "co_code",
                "co_consts",
                "co_names",
                "co_varnames",
                "co_freevars",
                "co_cellvars",
                "co_filename",
                "co_name",
            ],
            Scalar::Ptr,
        )
        .field("co_firstlineno", Scalar::Int)
        .fields(&["co_lnotab", "co_zombieframe", "co_weakreflist"], Scalar::Ptr)
}

pub fn try_block() -> StructDesc {
    StructDesc::new("PyTryBlock").fields(&["b_type", "b_handler", "b_level"], Scalar::Int)
}

pub fn frame_object(options: LayoutOptions) -> StructDesc {
    StructDesc::new("PyFrameObject")
        .extend(&var_header(options))
        .fields(
            &[
                "f_back",
                "f_code",
                "f_builtins",
                "f_globals",
                "f_locals",
                "f_valuestack",
                "f_stacktop",
                "f_trace",
                "f_exc_type",
                "f_exc_value",
                "f_exc_traceback",
                "f_tstate",
            ],
            Scalar::Ptr,
        )
        .fields(&["f_lasti", "f_lineno", "f_iblock"], Scalar::Int)
        .records("f_blockstack", try_block(), CO_MAXBLOCKS)
        .flexible("f_localsplus", Scalar::Ptr)
}

/// Every offset the translator and the simulated host rely on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub version: LayoutVersion,

    pub header: StructLayout,
    pub var_header: StructLayout,
    pub tuple: StructLayout,
    pub list: StructLayout,
    pub type_object: StructLayout,
    pub code: StructLayout,
    pub try_block: StructLayout,
    pub frame: StructLayout,

    pub ob_refcnt: u64,
    pub ob_type: u64,
    pub ob_size: u64,
    pub tuple_item: u64,
    pub list_item: u64,
    pub list_allocated: u64,
    pub tp_name: u64,
    pub tp_iternext: u64,
    pub code_argcount: u64,
    pub code_nlocals: u64,
    pub code_consts: u64,
    pub code_names: u64,
    pub code_varnames: u64,
    pub code_freevars: u64,
    pub code_cellvars: u64,
    pub code_name: u64,
    pub frame_code: u64,
    pub frame_builtins: u64,
    pub frame_globals: u64,
    pub frame_valuestack: u64,
    pub frame_stacktop: u64,
    pub frame_localsplus: u64,
}

impl HostLayout {
    pub fn new(options: LayoutOptions) -> Self {
        let header = object_header(options).layout();
        let var_header = var_header(options).layout();
        let tuple = tuple_object(options).layout();
        let list = list_object(options).layout();
        let type_object = type_object(options).layout();
        let code = code_object(options).layout();
        let try_block = try_block().layout();
        let frame = frame_object(options).layout();

        Self {
            version: LayoutVersion {
                major: LayoutVersion::MAJOR,
                minor: LayoutVersion::MINOR,
                options,
            },
            ob_refcnt: header.require("ob_refcnt"),
            ob_type: header.require("ob_type"),
            ob_size: var_header.require("ob_size"),
            tuple_item: tuple.require("ob_item"),
            list_item: list.require("ob_item"),
            list_allocated: list.require("allocated"),
            tp_name: type_object.require("tp_name"),
            tp_iternext: type_object.require("tp_iternext"),
            code_argcount: code.require("co_argcount"),
            code_nlocals: code.require("co_nlocals"),
            code_consts: code.require("co_consts"),
            code_names: code.require("co_names"),
            code_varnames: code.require("co_varnames"),
            code_freevars: code.require("co_freevars"),
            code_cellvars: code.require("co_cellvars"),
            code_name: code.require("co_name"),
            frame_code: frame.require("f_code"),
            frame_builtins: frame.require("f_builtins"),
            frame_globals: frame.require("f_globals"),
            frame_valuestack: frame.require("f_valuestack"),
            frame_stacktop: frame.require("f_stacktop"),
            frame_localsplus: frame.require("f_localsplus"),
            header,
            var_header,
            tuple,
            list,
            type_object,
            code,
            try_block,
            frame,
        }
    }

    /// The (name, value) pairs checked by [`HostLayout::validate`], in check order.
    pub fn checked_fields(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("sizeof(PyObject)", self.header.size),
            ("PyObject.ob_refcnt", self.ob_refcnt),
            ("PyObject.ob_type", self.ob_type),
            ("PyVarObject.ob_size", self.ob_size),
            ("PyTupleObject.ob_item", self.tuple_item),
            ("PyListObject.ob_item", self.list_item),
            ("sizeof(PyTypeObject)", self.type_object.size),
            ("PyTypeObject.tp_iternext", self.tp_iternext),
            ("PyCodeObject.co_nlocals", self.code_nlocals),
            ("PyCodeObject.co_consts", self.code_consts),
            ("PyCodeObject.co_names", self.code_names),
            ("PyCodeObject.co_varnames", self.code_varnames),
            ("sizeof(PyTryBlock)", self.try_block.size),
            ("PyFrameObject.f_code", self.frame_code),
            ("PyFrameObject.f_builtins", self.frame_builtins),
            ("PyFrameObject.f_globals", self.frame_globals),
            ("PyFrameObject.f_valuestack", self.frame_valuestack),
            ("PyFrameObject.f_stacktop", self.frame_stacktop),
            ("PyFrameObject.f_localsplus", self.frame_localsplus),
        ]
    }

    /// Compare against what the running host reports.
    ///
    /// Fields the probe does not mention are not checked.
    pub fn validate(&self, probe: &LayoutProbe) -> TranslateResult<()> {
        for (field, expected) in self.checked_fields() {
            if let Some(actual) = probe.get(field) {
                if actual != expected {
                    log::warn!(
                        "layout {} disagrees with host on {}: {} vs {}",
                        self.version,
                        field,
                        expected,
                        actual
                    );
                    return Err(TranslateError::LayoutMismatch {
                        field,
                        expected,
                        actual,
                    });
                }
            }
        }
        log::debug!("layout {} validated against host probe", self.version);
        Ok(())
    }

    /// Byte size of a tuple holding `len` items.
    pub fn tuple_size(&self, len: usize) -> u64 {
        self.tuple_item + 8 * len as u64
    }
}

impl Default for HostLayout {
    fn default() -> Self {
        Self::new(LayoutOptions::default())
    }
}

impl fmt::Display for HostLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "host layout {}", self.version)?;
        for layout in [
            &self.header,
            &self.var_header,
            &self.tuple,
            &self.list,
            &self.type_object,
            &self.code,
            &self.try_block,
            &self.frame,
        ] {
            writeln!(f, "  {} (size {}, align {})", layout.name, layout.size, layout.align)?;
            for (name, offset) in &layout.offsets {
                writeln!(f, "    {:>4}  {}", offset, name)?;
            }
        }
        Ok(())
    }
}

/// Offsets as reported by the running host, keyed like [`HostLayout::checked_fields`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutProbe {
    entries: Vec<(String, u64)>,
}

impl LayoutProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe reporting exactly the values of `layout`.
    pub fn from_layout(layout: &HostLayout) -> Self {
        let mut probe = Self::new();
        for (field, value) in layout.checked_fields() {
            probe.set(field, value);
        }
        probe
    }

    pub fn set(&mut self, field: &str, value: u64) {
        match self.entries.iter_mut().find(|(name, _)| name == field) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((field.to_string(), value)),
        }
    }

    pub fn get(&self, field: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|(name, _)| name == field)
            .map(|&(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_offsets() {
        let layout = HostLayout::default();
        assert_eq!(layout.ob_refcnt, 0);
        assert_eq!(layout.ob_type, 8);
        assert_eq!(layout.header.size, 16);
        assert_eq!(layout.tuple_item, 24);
        assert_eq!(layout.list_item, 24);
        assert_eq!(layout.tp_iternext, 224);
        assert_eq!(layout.code_nlocals, 20);
        assert_eq!(layout.code_consts, 40);
        assert_eq!(layout.code_names, 48);
    }

    #[test]
    fn test_frame_offsets() {
        let layout = HostLayout::default();
        assert_eq!(layout.frame_code, 32);
        assert_eq!(layout.frame_builtins, 40);
        assert_eq!(layout.frame_globals, 48);
        assert_eq!(layout.frame_valuestack, 64);
        assert_eq!(layout.frame_stacktop, 72);
        assert_eq!(layout.try_block.size, 12);
        // f_iblock ends at 132, the block stack adds 240 bytes, then pointer alignment.
        assert_eq!(layout.frame_localsplus, 376);
    }

    #[test]
    fn test_trace_refs_shifts_everything() {
        let plain = HostLayout::default();
        let traced = HostLayout::new(LayoutOptions {
            trace_refs: true,
            count_allocs: false,
        });
        assert_eq!(traced.ob_refcnt, 16);
        assert_eq!(traced.ob_type, 24);
        assert_eq!(traced.tuple_item, plain.tuple_item + 16);
        assert_eq!(traced.tp_iternext, plain.tp_iternext + 16);
        assert_eq!(traced.frame_localsplus, plain.frame_localsplus + 16);
        assert_eq!(traced.version.to_string(), "2.6+trace-refs");
    }

    #[test]
    fn test_count_allocs_grows_type_object() {
        let plain = HostLayout::default();
        let counted = HostLayout::new(LayoutOptions {
            trace_refs: false,
            count_allocs: true,
        });
        assert_eq!(counted.tp_iternext, plain.tp_iternext);
        assert_eq!(counted.type_object.size, plain.type_object.size + 40);
    }

    #[test]
    fn test_validate_reports_first_mismatch() {
        let layout = HostLayout::default();
        let mut probe = LayoutProbe::from_layout(&layout);
        assert!(layout.validate(&probe).is_ok());

        probe.set("PyFrameObject.f_stacktop", 80);
        probe.set("PyFrameObject.f_localsplus", 400);
        let err = layout.validate(&probe).unwrap_err();
        assert_eq!(
            err,
            TranslateError::LayoutMismatch {
                field: "PyFrameObject.f_stacktop",
                expected: 72,
                actual: 80,
            }
        );
    }

    #[test]
    fn test_partial_probe() {
        let layout = HostLayout::default();
        let mut probe = LayoutProbe::new();
        probe.set("PyObject.ob_refcnt", 0);
        assert!(layout.validate(&probe).is_ok());
    }
}

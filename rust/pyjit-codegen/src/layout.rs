//! Layout Registry: native field offsets of the runtime structures that
//! generated code reads and writes directly.
//!
//! The field lists below are a frozen contract with the runtime's headers.
//! Nothing here can check them against the runtime actually loaded; a
//! divergence shows up as memory corruption at execution time. Offsets follow
//! the C ABI: natural alignment, struct size rounded up to its alignment, and
//! a trailing flexible array contributes alignment but no size.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::{EnumIter, IntoEnumIterator};
use target_lexicon::{OperatingSystem, Triple};

use crate::emit::CodegenError;

/// Number of entries in a frame's block stack.
pub const MAX_BLOCKS: u32 = 20;

/// Scalar widths of the compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetDataLayout {
    pub pointer_bytes: u32,
    pub long_bytes: u32,
}

impl TargetDataLayout {
    pub fn from_triple(triple: &Triple) -> Result<Self, CodegenError> {
        let width = triple
            .pointer_width()
            .map_err(|()| CodegenError::Target(format!("unknown pointer width for {triple}")))?;
        let pointer_bytes = u32::from(width.bytes());
        // LLP64: `long` stays 32-bit on 64-bit Windows.
        let long_bytes = match triple.operating_system {
            OperatingSystem::Windows => 4,
            _ => pointer_bytes,
        };
        Ok(Self {
            pointer_bytes,
            long_bytes,
        })
    }

    pub fn host() -> Result<Self, CodegenError> {
        Self::from_triple(&Triple::host())
    }
}

/// Build options of the runtime that change its structure layouts or its
/// reference-counting contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeFeatures {
    /// Every object carries `_ob_next`/`_ob_prev` ahead of its header.
    pub trace_refs: bool,
    /// Type objects carry allocation counters.
    pub count_allocs: bool,
    /// Global reference total and negative-count diagnostics.
    pub ref_debug: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter)]
pub enum StructKind {
    Object,
    Tuple,
    List,
    Type,
    Code,
    TryBlock,
    Frame,
}

impl StructKind {
    /// Stable name under which the structure is registered.
    pub fn type_name(self) -> &'static str {
        match self {
            StructKind::Object => "__pyobject",
            StructKind::Tuple => "__pytupleobject",
            StructKind::List => "__pylistobject",
            StructKind::Type => "__pytypeobject",
            StructKind::Code => "__pycodeobject",
            StructKind::TryBlock => "__pytryblock",
            StructKind::Frame => "__pyframeobject",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// `Py_ssize_t`, pointer-sized.
    Ssize,
    Int,
    UInt,
    Long,
    /// Untyped data pointer (`char *`, `void *`, `PyObject **`).
    Ptr,
    FnPtr,
    PtrTo(StructKind),
    /// Embedded by value.
    Struct(StructKind),
    Array(Box<FieldType>, u32),
    /// Trailing variable-length array.
    FlexArray(Box<FieldType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub ty: FieldType,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub kind: StructKind,
    pub fields: Vec<Field>,
    pub size: u32,
    pub align: u32,
}

impl StructLayout {
    pub fn name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn field(&self, name: &str) -> Result<&Field, CodegenError> {
        self.fields.iter().find(|f| f.name == name).ok_or_else(|| {
            CodegenError::Layout(format!("{} has no field `{name}`", self.name()))
        })
    }

    pub fn offset(&self, name: &str) -> Result<u32, CodegenError> {
        Ok(self.field(name)?.offset)
    }

    /// Offset as a Cranelift memory-access immediate.
    pub fn imm(&self, name: &str) -> Result<i32, CodegenError> {
        let offset = self.offset(name)?;
        i32::try_from(offset).map_err(|_| {
            CodegenError::Layout(format!("{}.{name} offset {offset} out of range", self.name()))
        })
    }
}

enum Slot {
    /// Declared, fields still being laid out.
    Opaque,
    Complete(Arc<StructLayout>),
}

/// Memoized layouts for one compilation target and runtime build.
pub struct LayoutRegistry {
    target: TargetDataLayout,
    features: RuntimeFeatures,
    slots: HashMap<StructKind, Slot>,
}

impl LayoutRegistry {
    pub fn new(target: TargetDataLayout, features: RuntimeFeatures) -> Self {
        Self {
            target,
            features,
            slots: HashMap::new(),
        }
    }

    pub fn target(&self) -> TargetDataLayout {
        self.target
    }

    pub fn features(&self) -> RuntimeFeatures {
        self.features
    }

    /// Lay out `kind`, reusing the result of any earlier request.
    ///
    /// A structure is registered as opaque before its fields are laid out,
    /// so pointers back to it resolve while it is incomplete. Embedding an
    /// incomplete structure by value is a malformed declaration.
    pub fn resolve(&mut self, kind: StructKind) -> Result<Arc<StructLayout>, CodegenError> {
        match self.slots.get(&kind) {
            Some(Slot::Complete(layout)) => return Ok(Arc::clone(layout)),
            Some(Slot::Opaque) => {
                return Err(CodegenError::Layout(format!(
                    "{} contains itself by value",
                    kind.type_name()
                )))
            }
            None => {}
        }

        self.slots.insert(kind, Slot::Opaque);
        match self.lay_out(kind) {
            Ok(layout) => {
                let layout = Arc::new(layout);
                self.slots.insert(kind, Slot::Complete(Arc::clone(&layout)));
                Ok(layout)
            }
            Err(e) => {
                self.slots.remove(&kind);
                Err(e)
            }
        }
    }

    /// Every structure the generated code may touch.
    pub fn resolve_all(&mut self) -> Result<Vec<Arc<StructLayout>>, CodegenError> {
        StructKind::iter().map(|kind| self.resolve(kind)).collect()
    }

    /// A previously resolved structure, looked up by its registered name.
    pub fn by_name(&self, name: &str) -> Option<Arc<StructLayout>> {
        self.slots.iter().find_map(|(kind, slot)| match slot {
            Slot::Complete(layout) if kind.type_name() == name => Some(Arc::clone(layout)),
            _ => None,
        })
    }

    fn lay_out(&mut self, kind: StructKind) -> Result<StructLayout, CodegenError> {
        let declared = declare(kind, self.features);
        let count = declared.len();
        let mut fields = Vec::with_capacity(count);
        let mut cursor = 0u32;
        let mut align = 1u32;

        for (index, (name, ty)) in declared.into_iter().enumerate() {
            if matches!(ty, FieldType::FlexArray(_)) && index + 1 != count {
                return Err(CodegenError::Layout(format!(
                    "{}.{name}: flexible array must be the last field",
                    kind.type_name()
                )));
            }
            let (size, field_align) = self.size_align(&ty)?;
            let offset = align_to(cursor, field_align);
            cursor = offset.checked_add(size).ok_or_else(|| {
                CodegenError::Layout(format!("{} is too large", kind.type_name()))
            })?;
            align = align.max(field_align);
            fields.push(Field {
                name,
                ty,
                offset,
                size,
            });
        }

        Ok(StructLayout {
            kind,
            fields,
            size: align_to(cursor, align),
            align,
        })
    }

    fn size_align(&mut self, ty: &FieldType) -> Result<(u32, u32), CodegenError> {
        let pointer = self.target.pointer_bytes;
        Ok(match ty {
            FieldType::Ssize | FieldType::Ptr | FieldType::FnPtr | FieldType::PtrTo(_) => {
                (pointer, pointer)
            }
            FieldType::Int | FieldType::UInt => (4, 4),
            FieldType::Long => (self.target.long_bytes, self.target.long_bytes),
            FieldType::Struct(kind) => {
                let inner = self.resolve(*kind)?;
                (inner.size, inner.align)
            }
            FieldType::Array(elem, len) => {
                let (size, align) = self.size_align(elem)?;
                let total = size
                    .checked_mul(*len)
                    .ok_or_else(|| CodegenError::Layout("array too large".into()))?;
                (total, align)
            }
            FieldType::FlexArray(elem) => {
                let (_, align) = self.size_align(elem)?;
                (0, align)
            }
        })
    }
}

fn align_to(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

fn object_ptr() -> FieldType {
    FieldType::PtrTo(StructKind::Object)
}

/// Field lists, in runtime header order.
fn declare(kind: StructKind, features: RuntimeFeatures) -> Vec<(&'static str, FieldType)> {
    use FieldType::*;

    let var_head = || {
        vec![
            ("ob_base", Struct(StructKind::Object)),
            ("ob_size", Ssize),
        ]
    };

    match kind {
        StructKind::Object => {
            let mut fields = Vec::new();
            if features.trace_refs {
                fields.push(("_ob_next", object_ptr()));
                fields.push(("_ob_prev", object_ptr()));
            }
            fields.push(("ob_refcnt", Ssize));
            fields.push(("ob_type", PtrTo(StructKind::Type)));
            fields
        }
        StructKind::Tuple => {
            let mut fields = var_head();
            fields.push(("ob_item", FlexArray(Box::new(object_ptr()))));
            fields
        }
        StructKind::List => {
            let mut fields = var_head();
            fields.push(("ob_item", Ptr));
            fields.push(("allocated", Ssize));
            fields
        }
        StructKind::Type => {
            let mut fields = var_head();
            fields.extend([
                ("tp_name", Ptr),
                ("tp_basicsize", Ssize),
                ("tp_itemsize", Ssize),
                ("tp_dealloc", FnPtr),
                ("tp_print", FnPtr),
                ("tp_getattr", FnPtr),
                ("tp_setattr", FnPtr),
                ("tp_compare", FnPtr),
                ("tp_repr", FnPtr),
                ("tp_as_number", Ptr),
                ("tp_as_sequence", Ptr),
                ("tp_as_mapping", Ptr),
                ("tp_hash", FnPtr),
                ("tp_call", FnPtr),
                ("tp_str", FnPtr),
                ("tp_getattro", FnPtr),
                ("tp_setattro", FnPtr),
                ("tp_as_buffer", Ptr),
                ("tp_flags", Long),
                ("tp_doc", Ptr),
                ("tp_traverse", FnPtr),
                ("tp_clear", FnPtr),
                ("tp_richcompare", FnPtr),
                ("tp_weaklistoffset", Ssize),
                ("tp_iter", FnPtr),
                ("tp_iternext", FnPtr),
                ("tp_methods", Ptr),
                ("tp_members", Ptr),
                ("tp_getset", Ptr),
                ("tp_base", PtrTo(StructKind::Type)),
                ("tp_dict", object_ptr()),
                ("tp_descr_get", FnPtr),
                ("tp_descr_set", FnPtr),
                ("tp_dictoffset", Ssize),
                ("tp_init", FnPtr),
                ("tp_alloc", FnPtr),
                ("tp_new", FnPtr),
                ("tp_free", FnPtr),
                ("tp_is_gc", FnPtr),
                ("tp_bases", object_ptr()),
                ("tp_mro", object_ptr()),
                ("tp_cache", object_ptr()),
                ("tp_subclasses", object_ptr()),
                ("tp_weaklist", object_ptr()),
                ("tp_del", FnPtr),
                ("tp_version_tag", UInt),
            ]);
            if features.count_allocs {
                fields.extend([
                    ("tp_allocs", Ssize),
                    ("tp_frees", Ssize),
                    ("tp_maxalloc", Ssize),
                    ("tp_prev", PtrTo(StructKind::Type)),
                    ("tp_next", PtrTo(StructKind::Type)),
                ]);
            }
            fields
        }
        StructKind::Code => vec![
            ("ob_base", Struct(StructKind::Object)),
            ("co_argcount", Int),
            ("co_nlocals", Int),
            ("co_stacksize", Int),
            ("co_flags", Int),
            ("co_code", object_ptr()),
            ("co_consts", PtrTo(StructKind::Tuple)),
            ("co_names", PtrTo(StructKind::Tuple)),
            ("co_varnames", object_ptr()),
            ("co_freevars", object_ptr()),
            ("co_cellvars", object_ptr()),
            ("co_tcode", Ptr),
            ("co_filename", object_ptr()),
            ("co_name", object_ptr()),
            ("co_firstlineno", Int),
            ("co_lnotab", object_ptr()),
            ("co_zombieframe", Ptr),
            ("co_llvm_function", object_ptr()),
        ],
        StructKind::TryBlock => vec![("b_type", Int), ("b_handler", Int), ("b_level", Int)],
        StructKind::Frame => {
            let mut fields = var_head();
            fields.extend([
                ("f_back", PtrTo(StructKind::Frame)),
                ("f_code", PtrTo(StructKind::Code)),
                ("f_builtins", object_ptr()),
                ("f_globals", object_ptr()),
                ("f_locals", object_ptr()),
                ("f_valuestack", Ptr),
                ("f_stacktop", Ptr),
                ("f_trace", object_ptr()),
                ("f_exc_type", object_ptr()),
                ("f_exc_value", object_ptr()),
                ("f_exc_traceback", object_ptr()),
                ("f_tstate", Ptr),
                ("f_lasti", Int),
                ("f_lineno", Int),
                ("f_iblock", Int),
                (
                    "f_blockstack",
                    Array(Box::new(Struct(StructKind::TryBlock)), MAX_BLOCKS),
                ),
                ("f_localsplus", FlexArray(Box::new(object_ptr()))),
            ]);
            fields
        }
    }
}

/// The offsets lowering rules actually use, resolved once per compilation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOffsets {
    pub ob_refcnt: i32,
    pub ob_type: i32,
    pub tuple_item: i32,
    pub list_item: i32,
    pub tp_iternext: i32,
    pub code_nlocals: i32,
    pub code_consts: i32,
    pub code_names: i32,
    pub frame_code: i32,
    pub frame_builtins: i32,
    pub frame_globals: i32,
    pub frame_valuestack: i32,
    pub frame_stacktop: i32,
    pub frame_localsplus: i32,
}

impl RuntimeOffsets {
    pub fn resolve(registry: &mut LayoutRegistry) -> Result<Self, CodegenError> {
        let object = registry.resolve(StructKind::Object)?;
        let tuple = registry.resolve(StructKind::Tuple)?;
        let list = registry.resolve(StructKind::List)?;
        let ty = registry.resolve(StructKind::Type)?;
        let code = registry.resolve(StructKind::Code)?;
        let frame = registry.resolve(StructKind::Frame)?;
        Ok(Self {
            ob_refcnt: object.imm("ob_refcnt")?,
            ob_type: object.imm("ob_type")?,
            tuple_item: tuple.imm("ob_item")?,
            list_item: list.imm("ob_item")?,
            tp_iternext: ty.imm("tp_iternext")?,
            code_nlocals: code.imm("co_nlocals")?,
            code_consts: code.imm("co_consts")?,
            code_names: code.imm("co_names")?,
            frame_code: frame.imm("f_code")?,
            frame_builtins: frame.imm("f_builtins")?,
            frame_globals: frame.imm("f_globals")?,
            frame_valuestack: frame.imm("f_valuestack")?,
            frame_stacktop: frame.imm("f_stacktop")?,
            frame_localsplus: frame.imm("f_localsplus")?,
        })
    }
}

//! The runtime contract: every external function and global the generated
//! code may reference, with its C signature.
//!
//! Declarations are made lazily, once per module, and cached in
//! [`RuntimeImports`]. A signature here that disagrees with the runtime is
//! not detected by anything; the linker only matches names.

use std::collections::{BTreeMap, HashMap};

use cranelift_codegen::ir::{types, AbiParam, Signature, Type as ClifType};
use cranelift_codegen::isa::CallConv;
use cranelift_module::{DataDescription, DataId, FuncId, Linkage, Module};
use strum::{EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::emit::CodegenError;

/// C parameter and return kinds used by the runtime's entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiKind {
    /// Any data pointer: objects, frames, stack slots, C strings.
    Ptr,
    /// C `int`.
    Int,
    /// `Py_ssize_t`.
    Ssize,
}

impl AbiKind {
    pub fn clif_type(self, pointer: ClifType) -> ClifType {
        match self {
            AbiKind::Ptr | AbiKind::Ssize => pointer,
            AbiKind::Int => types::I32,
        }
    }

    fn abi_param(self, pointer: ClifType) -> AbiParam {
        match self {
            AbiKind::Int => AbiParam::new(types::I32).sext(),
            _ => AbiParam::new(self.clif_type(pointer)),
        }
    }

    fn c_name(self) -> &'static str {
        match self {
            AbiKind::Ptr => "void *",
            AbiKind::Int => "int",
            AbiKind::Ssize => "Py_ssize_t",
        }
    }
}

use AbiKind::{Int, Ptr, Ssize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, IntoStaticStr)]
pub enum RuntimeFn {
    #[strum(serialize = "PyDict_GetItem")]
    DictGetItem,
    #[strum(serialize = "PyDict_SetItem")]
    DictSetItem,
    #[strum(serialize = "PyDict_DelItem")]
    DictDelItem,
    #[strum(serialize = "_PyDict_NewPresized")]
    DictNewPresized,
    #[strum(serialize = "PyObject_GetAttr")]
    GetAttr,
    #[strum(serialize = "PyObject_SetAttr")]
    SetAttr,
    #[strum(serialize = "PyObject_GetItem")]
    GetItem,
    #[strum(serialize = "PyObject_SetItem")]
    SetItem,
    #[strum(serialize = "PyObject_DelItem")]
    DelItem,
    #[strum(serialize = "PyObject_GetIter")]
    GetIter,
    #[strum(serialize = "PyObject_IsTrue")]
    IsTrue,
    #[strum(serialize = "PyObject_RichCompare")]
    RichCompare,
    #[strum(serialize = "PyObject_Repr")]
    Repr,
    #[strum(serialize = "PySequence_Contains")]
    SequenceContains,
    #[strum(serialize = "PyList_New")]
    ListNew,
    #[strum(serialize = "PyList_Append")]
    ListAppend,
    #[strum(serialize = "PyTuple_New")]
    TupleNew,
    #[strum(serialize = "PySlice_New")]
    SliceNew,
    #[strum(serialize = "PyCell_Get")]
    CellGet,
    #[strum(serialize = "PyCell_Set")]
    CellSet,

    #[strum(serialize = "PyNumber_Add")]
    NumberAdd,
    #[strum(serialize = "PyNumber_Subtract")]
    NumberSubtract,
    #[strum(serialize = "PyNumber_Multiply")]
    NumberMultiply,
    #[strum(serialize = "PyNumber_Divide")]
    NumberDivide,
    #[strum(serialize = "PyNumber_TrueDivide")]
    NumberTrueDivide,
    #[strum(serialize = "PyNumber_FloorDivide")]
    NumberFloorDivide,
    #[strum(serialize = "PyNumber_Remainder")]
    NumberRemainder,
    #[strum(serialize = "PyNumber_Power")]
    NumberPower,
    #[strum(serialize = "PyNumber_Lshift")]
    NumberLshift,
    #[strum(serialize = "PyNumber_Rshift")]
    NumberRshift,
    #[strum(serialize = "PyNumber_And")]
    NumberAnd,
    #[strum(serialize = "PyNumber_Xor")]
    NumberXor,
    #[strum(serialize = "PyNumber_Or")]
    NumberOr,
    #[strum(serialize = "PyNumber_InPlaceAdd")]
    InPlaceAdd,
    #[strum(serialize = "PyNumber_InPlaceSubtract")]
    InPlaceSubtract,
    #[strum(serialize = "PyNumber_InPlaceMultiply")]
    InPlaceMultiply,
    #[strum(serialize = "PyNumber_InPlaceDivide")]
    InPlaceDivide,
    #[strum(serialize = "PyNumber_InPlaceTrueDivide")]
    InPlaceTrueDivide,
    #[strum(serialize = "PyNumber_InPlaceFloorDivide")]
    InPlaceFloorDivide,
    #[strum(serialize = "PyNumber_InPlaceRemainder")]
    InPlaceRemainder,
    #[strum(serialize = "PyNumber_InPlacePower")]
    InPlacePower,
    #[strum(serialize = "PyNumber_InPlaceLshift")]
    InPlaceLshift,
    #[strum(serialize = "PyNumber_InPlaceRshift")]
    InPlaceRshift,
    #[strum(serialize = "PyNumber_InPlaceAnd")]
    InPlaceAnd,
    #[strum(serialize = "PyNumber_InPlaceXor")]
    InPlaceXor,
    #[strum(serialize = "PyNumber_InPlaceOr")]
    InPlaceOr,
    #[strum(serialize = "PyNumber_Invert")]
    NumberInvert,
    #[strum(serialize = "PyNumber_Positive")]
    NumberPositive,
    #[strum(serialize = "PyNumber_Negative")]
    NumberNegative,

    #[strum(serialize = "PyErr_Occurred")]
    ErrOccurred,
    #[strum(serialize = "PyErr_ExceptionMatches")]
    ErrExceptionMatches,
    #[strum(serialize = "PyErr_Clear")]
    ErrClear,

    #[strum(serialize = "_PyEval_RaiseForGlobalNameError")]
    RaiseForGlobalNameError,
    #[strum(serialize = "_PyEval_RaiseForUnboundLocal")]
    RaiseForUnboundLocal,
    #[strum(serialize = "_PyEval_CallFunction")]
    CallFunction,
    #[strum(serialize = "_PyEval_CallFunctionVarKw")]
    CallFunctionVarKw,
    #[strum(serialize = "_PyEval_DoRaise")]
    DoRaise,
    #[strum(serialize = "_PyEval_CheckedExceptionMatches")]
    CheckedExceptionMatches,
    #[strum(serialize = "_PyEval_ApplySlice")]
    ApplySlice,
    #[strum(serialize = "_PyEval_AssignSlice")]
    AssignSlice,
    #[strum(serialize = "_PyEval_UnpackIterable")]
    UnpackIterable,

    #[strum(serialize = "_PyLlvm_WrapDealloc")]
    WrapDealloc,
    #[strum(serialize = "_Py_NegativeRefcount")]
    NegativeRefcount,
    #[strum(serialize = "puts")]
    Puts,
    #[strum(serialize = "abort")]
    Abort,
}

impl RuntimeFn {
    pub fn name(self) -> &'static str {
        self.into()
    }

    pub fn params(self) -> &'static [AbiKind] {
        use RuntimeFn::*;
        match self {
            DictGetItem | DictDelItem | GetAttr | GetItem | DelItem | SequenceContains
            | ListAppend | CellSet | CheckedExceptionMatches | RaiseForGlobalNameError => {
                &[Ptr, Ptr]
            }
            DictSetItem | SetAttr | SetItem | SliceNew | ApplySlice | DoRaise | NumberPower
            | InPlacePower => &[Ptr, Ptr, Ptr],
            DictNewPresized | ListNew | TupleNew => &[Ssize],
            GetIter | IsTrue | Repr | CellGet | NumberInvert | NumberPositive
            | NumberNegative | ErrExceptionMatches | WrapDealloc | Puts => &[Ptr],
            RichCompare => &[Ptr, Ptr, Int],
            NumberAdd | NumberSubtract | NumberMultiply | NumberDivide | NumberTrueDivide
            | NumberFloorDivide | NumberRemainder | NumberLshift | NumberRshift | NumberAnd
            | NumberXor | NumberOr | InPlaceAdd | InPlaceSubtract | InPlaceMultiply
            | InPlaceDivide | InPlaceTrueDivide | InPlaceFloorDivide | InPlaceRemainder
            | InPlaceLshift | InPlaceRshift | InPlaceAnd | InPlaceXor | InPlaceOr => &[Ptr, Ptr],
            ErrOccurred | ErrClear | Abort => &[],
            RaiseForUnboundLocal | CallFunction | CallFunctionVarKw => &[Ptr, Int],
            AssignSlice => &[Ptr, Ptr, Ptr, Ptr],
            UnpackIterable => &[Ptr, Int, Ptr],
            NegativeRefcount => &[Ptr, Int, Ptr],
        }
    }

    /// `None` for `void` functions.
    pub fn returns(self) -> Option<AbiKind> {
        use RuntimeFn::*;
        match self {
            DictSetItem | DictDelItem | SetAttr | SetItem | DelItem | IsTrue
            | SequenceContains | ListAppend | CellSet | ErrExceptionMatches
            | CallFunctionVarKw | CheckedExceptionMatches | AssignSlice | UnpackIterable
            | Puts => Some(Int),
            ErrClear | RaiseForGlobalNameError | RaiseForUnboundLocal | DoRaise | WrapDealloc
            | NegativeRefcount | Abort => None,
            _ => Some(Ptr),
        }
    }

    pub fn signature(self, call_conv: CallConv, pointer: ClifType) -> Signature {
        let mut sig = Signature::new(call_conv);
        sig.params
            .extend(self.params().iter().map(|kind| kind.abi_param(pointer)));
        if let Some(ret) = self.returns() {
            sig.returns.push(ret.abi_param(pointer));
        }
        sig
    }

    /// C declaration, e.g. `void *PyDict_GetItem(void *, void *)`.
    pub fn prototype(self) -> String {
        let ret = self.returns().map(AbiKind::c_name).unwrap_or("void");
        let params: Vec<_> = self.params().iter().map(|k| k.c_name()).collect();
        let params = if params.is_empty() {
            "void".to_string()
        } else {
            params.join(", ")
        };
        let sep = if ret.ends_with('*') { "" } else { " " };
        format!("{ret}{sep}{}({params})", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, IntoStaticStr)]
pub enum RuntimeGlobal {
    #[strum(serialize = "_Py_NoneStruct")]
    None,
    #[strum(serialize = "_Py_TrueStruct")]
    True,
    #[strum(serialize = "_Py_ZeroStruct")]
    False,
    /// A variable holding a pointer to the exception class, not the class.
    #[strum(serialize = "PyExc_StopIteration")]
    StopIteration,
    #[strum(serialize = "_Py_RefTotal")]
    RefTotal,
}

impl RuntimeGlobal {
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Generated code stores to it.
    pub fn writable(self) -> bool {
        matches!(self, RuntimeGlobal::RefTotal)
    }

    pub fn description(self) -> &'static str {
        match self {
            RuntimeGlobal::None | RuntimeGlobal::True | RuntimeGlobal::False => "PyObject",
            RuntimeGlobal::StopIteration => "PyObject *",
            RuntimeGlobal::RefTotal => "Py_ssize_t",
        }
    }
}

fn module_error(what: &str, e: impl std::fmt::Display) -> CodegenError {
    CodegenError::Lowering(format!("{what}: {e}"))
}

/// Module-level declarations of runtime entry points, globals and string
/// constants. Shared by every function lowered into the same module.
#[derive(Debug, Default)]
pub struct RuntimeImports {
    functions: HashMap<RuntimeFn, FuncId>,
    globals: HashMap<RuntimeGlobal, DataId>,
    strings: HashMap<String, DataId>,
}

impl RuntimeImports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function<M: Module + ?Sized>(
        &mut self,
        module: &mut M,
        function: RuntimeFn,
    ) -> Result<FuncId, CodegenError> {
        if let Some(id) = self.functions.get(&function) {
            return Ok(*id);
        }
        let sig = function.signature(
            module.isa().default_call_conv(),
            module.target_config().pointer_type(),
        );
        let id = module
            .declare_function(function.name(), Linkage::Import, &sig)
            .map_err(|e| module_error(function.name(), e))?;
        self.functions.insert(function, id);
        Ok(id)
    }

    pub fn global<M: Module + ?Sized>(
        &mut self,
        module: &mut M,
        global: RuntimeGlobal,
    ) -> Result<DataId, CodegenError> {
        if let Some(id) = self.globals.get(&global) {
            return Ok(*id);
        }
        let id = module
            .declare_data(global.name(), Linkage::Import, global.writable(), false)
            .map_err(|e| module_error(global.name(), e))?;
        self.globals.insert(global, id);
        Ok(id)
    }

    /// A NUL-terminated, read-only copy of `text` in the module.
    pub fn c_string<M: Module + ?Sized>(
        &mut self,
        module: &mut M,
        text: &str,
    ) -> Result<DataId, CodegenError> {
        if let Some(id) = self.strings.get(text) {
            return Ok(*id);
        }
        let id = module
            .declare_anonymous_data(false, false)
            .map_err(|e| module_error("string constant", e))?;
        let mut bytes = Vec::with_capacity(text.len() + 1);
        bytes.extend_from_slice(text.as_bytes());
        bytes.push(0);
        let mut desc = DataDescription::new();
        desc.define(bytes.into_boxed_slice());
        module
            .define_data(id, &desc)
            .map_err(|e| module_error("string constant", e))?;
        self.strings.insert(text.to_string(), id);
        Ok(id)
    }

    pub fn declared_functions(&self) -> usize {
        self.functions.len()
    }

    pub fn declared_globals(&self) -> usize {
        self.globals.len()
    }

    /// Symbol names of every imported function and global, sorted.
    pub fn imported_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .functions
            .keys()
            .map(|f| f.name())
            .chain(self.globals.keys().map(|g| g.name()))
            .collect();
        names.sort_unstable();
        names
    }
}

/// Process addresses of runtime symbols, for JIT linking.
///
/// Every imported name must be registered here except `puts` and `abort`,
/// which the JIT resolves from the host process.
#[derive(Debug, Clone, Default)]
pub struct RuntimeSymbols {
    addresses: BTreeMap<String, *const u8>,
}

impl RuntimeSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, address: *const u8) {
        self.addresses.insert(name.into(), address);
    }

    pub fn with_function(mut self, function: RuntimeFn, address: *const u8) -> Self {
        self.insert(function.name(), address);
        self
    }

    pub fn with_global(mut self, global: RuntimeGlobal, address: *const u8) -> Self {
        self.insert(global.name(), address);
        self
    }

    pub fn get(&self, name: &str) -> Option<*const u8> {
        self.addresses.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, *const u8)> {
        self.addresses.iter().map(|(name, addr)| (name.as_str(), *addr))
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Catalog names with no registered address.
    pub fn missing(&self) -> Vec<&'static str> {
        RuntimeFn::iter()
            .map(RuntimeFn::name)
            .chain(RuntimeGlobal::iter().map(RuntimeGlobal::name))
            .filter(|name| !self.addresses.contains_key(*name))
            .collect()
    }
}

//! A small in-process object runtime that generated code can run against.
//!
//! Structures are `#[repr(C)]` prefixes of the runtime headers the Layout
//! Registry describes; `layout_matches_registry` in `jit_exec.rs` keeps them
//! honest. Objects are integers, strings, tuples, lists, dictionaries,
//! closure cells and sequence iterators. Dictionaries double as objects
//! whose attributes are their string keys. State lives in a thread-local [`Runtime`], so every
//! test (one thread each) gets its own singletons and error indicator.

#![allow(dead_code)]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::Cell;
use std::ffi::c_void;
use std::mem::size_of;
use std::ptr;

use pyjit_codegen::{CompiledEntry, RuntimeFn, RuntimeGlobal, RuntimeSymbols};
use strum::IntoEnumIterator;

pub type IterNext = unsafe extern "C" fn(*mut Object) -> *mut Object;

// ===========================================================================
// Object layouts
// ===========================================================================

#[repr(C)]
pub struct Object {
    pub ob_refcnt: isize,
    pub ob_type: *mut TypeObject,
}

#[repr(C)]
pub struct TypeObject {
    pub ob_base: Object,
    pub ob_size: isize,
    pub tp_name: *const u8,
    /// `tp_basicsize` through `tp_iter`.
    pub tp_unused: [usize; 24],
    pub tp_iternext: Option<IterNext>,
}

#[repr(C)]
pub struct IntObject {
    pub ob_base: Object,
    pub value: i64,
}

#[repr(C)]
pub struct StrObject {
    pub ob_base: Object,
    pub text: &'static str,
}

#[repr(C)]
pub struct TupleObject {
    pub ob_base: Object,
    pub ob_size: isize,
    pub ob_item: [*mut Object; 0],
}

#[repr(C)]
pub struct ListObject {
    pub ob_base: Object,
    pub ob_size: isize,
    pub ob_item: *mut *mut Object,
    pub allocated: isize,
}

#[repr(C)]
pub struct DictObject {
    pub ob_base: Object,
    pub entries: Vec<(*mut Object, *mut Object)>,
}

#[repr(C)]
pub struct IterObject {
    pub ob_base: Object,
    pub seq: *mut Object,
    pub index: isize,
    /// Index at which `fail_with` is raised instead of yielding; -1 never.
    pub fail_at: isize,
    pub fail_with: *mut Object,
    /// Signal exhaustion with a pending `StopIteration` instead of a bare null.
    pub raise_stop: bool,
}

#[repr(C)]
pub struct CellObject {
    pub ob_base: Object,
    /// Null while the cell is empty.
    pub ob_ref: *mut Object,
}

#[repr(C)]
pub struct CodeObject {
    pub ob_base: Object,
    pub co_argcount: i32,
    pub co_nlocals: i32,
    pub co_stacksize: i32,
    pub co_flags: i32,
    pub co_code: *mut Object,
    pub co_consts: *mut TupleObject,
    pub co_names: *mut TupleObject,
}

#[repr(C)]
pub struct TryBlock {
    pub b_type: i32,
    pub b_handler: i32,
    pub b_level: i32,
}

#[repr(C)]
pub struct FrameObject {
    pub ob_base: Object,
    pub ob_size: isize,
    pub f_back: *mut FrameObject,
    pub f_code: *mut CodeObject,
    pub f_builtins: *mut Object,
    pub f_globals: *mut Object,
    pub f_locals: *mut Object,
    pub f_valuestack: *mut *mut Object,
    pub f_stacktop: *mut *mut Object,
    pub f_trace: *mut Object,
    pub f_exc_type: *mut Object,
    pub f_exc_value: *mut Object,
    pub f_exc_traceback: *mut Object,
    pub f_tstate: *mut c_void,
    pub f_lasti: i32,
    pub f_lineno: i32,
    pub f_iblock: i32,
    pub f_blockstack: [TryBlock; 20],
    pub f_localsplus: [*mut Object; 0],
}

// ===========================================================================
// Runtime state
// ===========================================================================

/// Immortal objects never reach zero in a test.
const IMMORTAL: isize = 1 << 20;

pub struct Runtime {
    pub none: *mut Object,
    pub py_true: *mut Object,
    pub py_false: *mut Object,
    pub stop_iteration: *mut Object,
    pub type_error: *mut Object,
    pub value_error: *mut Object,
    pub name_error: *mut Object,
    pub key_error: *mut Object,
    pub attribute_error: *mut Object,
    /// `PyExc_StopIteration`: a variable holding the class.
    stop_iteration_var: Box<*mut Object>,
    ref_total: Box<isize>,
    int_type: *mut TypeObject,
    str_type: *mut TypeObject,
    tuple_type: *mut TypeObject,
    list_type: *mut TypeObject,
    dict_type: *mut TypeObject,
    iter_type: *mut TypeObject,
    cell_type: *mut TypeObject,
    singleton_type: *mut TypeObject,
    error: Cell<*mut Object>,
    deallocations: Cell<usize>,
    truth_tests: Cell<usize>,
}

thread_local! {
    static CURRENT: Cell<*const Runtime> = const { Cell::new(ptr::null()) };
}

fn rt() -> &'static Runtime {
    let current = CURRENT.with(Cell::get);
    assert!(!current.is_null(), "no runtime installed on this thread");
    // SAFETY: installed by `Runtime::install` and cleared when it drops.
    unsafe { &*current }
}

fn leak<T>(value: T) -> *mut T {
    Box::into_raw(Box::new(value))
}

fn new_type(name: &'static str, iternext: Option<IterNext>) -> *mut TypeObject {
    leak(TypeObject {
        ob_base: Object {
            ob_refcnt: IMMORTAL,
            ob_type: ptr::null_mut(),
        },
        ob_size: 0,
        tp_name: name.as_ptr(),
        tp_unused: [0; 24],
        tp_iternext: iternext,
    })
}

impl Runtime {
    /// Create a runtime and make it current for this thread.
    pub fn install() -> Box<Runtime> {
        let singleton_type = new_type("singleton\0", None);
        let singleton = || {
            leak(Object {
                ob_refcnt: IMMORTAL,
                ob_type: singleton_type,
            })
        };
        let stop_iteration = singleton();
        let runtime = Box::new(Runtime {
            none: singleton(),
            py_true: singleton(),
            py_false: singleton(),
            stop_iteration,
            type_error: singleton(),
            value_error: singleton(),
            name_error: singleton(),
            key_error: singleton(),
            attribute_error: singleton(),
            stop_iteration_var: Box::new(stop_iteration),
            ref_total: Box::new(0),
            int_type: new_type("int\0", None),
            str_type: new_type("str\0", None),
            tuple_type: new_type("tuple\0", None),
            list_type: new_type("list\0", None),
            dict_type: new_type("dict\0", None),
            iter_type: new_type("iterator\0", Some(iter_next)),
            cell_type: new_type("cell\0", None),
            singleton_type,
            error: Cell::new(ptr::null_mut()),
            deallocations: Cell::new(0),
            truth_tests: Cell::new(0),
        });
        CURRENT.with(|c| c.set(&*runtime));
        runtime
    }

    /// Addresses for every catalog name. Entry points this runtime does not
    /// implement abort if called.
    pub fn symbols(&self) -> RuntimeSymbols {
        let mut symbols = RuntimeSymbols::new();
        for function in RuntimeFn::iter() {
            if !matches!(function, RuntimeFn::Puts | RuntimeFn::Abort) {
                symbols.insert(function.name(), unimplemented_entry as *const u8);
            }
        }
        let implemented: [(RuntimeFn, *const u8); 37] = [
            (RuntimeFn::DictGetItem, dict_get_item as *const u8),
            (RuntimeFn::DictSetItem, dict_set_item as *const u8),
            (RuntimeFn::DictDelItem, dict_del_item as *const u8),
            (RuntimeFn::DictNewPresized, dict_new_presized as *const u8),
            (RuntimeFn::GetAttr, get_attr as *const u8),
            (RuntimeFn::SetAttr, set_attr as *const u8),
            (RuntimeFn::SetItem, set_item as *const u8),
            (RuntimeFn::DelItem, del_item as *const u8),
            (RuntimeFn::ApplySlice, apply_slice as *const u8),
            (RuntimeFn::AssignSlice, assign_slice as *const u8),
            (RuntimeFn::CellGet, cell_get as *const u8),
            (RuntimeFn::CellSet, cell_set as *const u8),
            (RuntimeFn::NumberAdd, number_add as *const u8),
            (RuntimeFn::InPlaceAdd, number_add as *const u8),
            (RuntimeFn::NumberSubtract, number_subtract as *const u8),
            (RuntimeFn::InPlaceSubtract, number_subtract as *const u8),
            (RuntimeFn::NumberMultiply, number_multiply as *const u8),
            (RuntimeFn::NumberNegative, number_negative as *const u8),
            (RuntimeFn::IsTrue, object_is_true as *const u8),
            (RuntimeFn::RichCompare, rich_compare as *const u8),
            (RuntimeFn::SequenceContains, sequence_contains as *const u8),
            (RuntimeFn::TupleNew, tuple_new as *const u8),
            (RuntimeFn::ListNew, list_new as *const u8),
            (RuntimeFn::ListAppend, list_append as *const u8),
            (RuntimeFn::GetItem, get_item as *const u8),
            (RuntimeFn::GetIter, get_iter as *const u8),
            (RuntimeFn::UnpackIterable, unpack_iterable as *const u8),
            (RuntimeFn::ErrOccurred, err_occurred as *const u8),
            (RuntimeFn::ErrExceptionMatches, err_exception_matches as *const u8),
            (RuntimeFn::ErrClear, err_clear as *const u8),
            (RuntimeFn::RaiseForUnboundLocal, raise_unbound_local as *const u8),
            (RuntimeFn::RaiseForGlobalNameError, raise_global_name_error as *const u8),
            (RuntimeFn::DoRaise, do_raise as *const u8),
            (RuntimeFn::WrapDealloc, wrap_dealloc as *const u8),
            (RuntimeFn::NegativeRefcount, negative_refcount as *const u8),
            (RuntimeFn::CallFunction, call_function as *const u8),
            (RuntimeFn::CallFunctionVarKw, call_function_var_kw as *const u8),
        ];
        for (function, address) in implemented {
            symbols.insert(function.name(), address);
        }
        symbols
            .with_global(RuntimeGlobal::None, self.none as *const u8)
            .with_global(RuntimeGlobal::True, self.py_true as *const u8)
            .with_global(RuntimeGlobal::False, self.py_false as *const u8)
            .with_global(
                RuntimeGlobal::StopIteration,
                &*self.stop_iteration_var as *const *mut Object as *const u8,
            )
            .with_global(RuntimeGlobal::RefTotal, &*self.ref_total as *const isize as *const u8)
    }

    // -----------------------------------------------------------------------
    // Observations
    // -----------------------------------------------------------------------

    pub fn error(&self) -> *mut Object {
        self.error.get()
    }

    pub fn set_error(&self, exc: *mut Object) {
        self.error.set(exc);
    }

    pub fn clear_error(&self) {
        self.error.set(ptr::null_mut());
    }

    pub fn deallocations(&self) -> usize {
        self.deallocations.get()
    }

    pub fn truth_tests(&self) -> usize {
        self.truth_tests.get()
    }

    pub fn ref_total(&self) -> isize {
        *self.ref_total
    }

    // -----------------------------------------------------------------------
    // Constructors, each returning a new reference
    // -----------------------------------------------------------------------

    pub fn int(&self, value: i64) -> *mut Object {
        leak(IntObject {
            ob_base: Object {
                ob_refcnt: 1,
                ob_type: self.int_type,
            },
            value,
        })
        .cast()
    }

    pub fn str(&self, text: &'static str) -> *mut Object {
        leak(StrObject {
            ob_base: Object {
                ob_refcnt: 1,
                ob_type: self.str_type,
            },
            text,
        })
        .cast()
    }

    /// Steals `items`.
    pub fn tuple(&self, items: &[*mut Object]) -> *mut Object {
        let tuple = tuple_alloc(items.len());
        for (i, item) in items.iter().enumerate() {
            // SAFETY: `tuple_alloc` reserved `items.len()` slots.
            unsafe { *tuple_items(tuple).add(i) = *item };
        }
        tuple
    }

    /// Steals `items`.
    pub fn list(&self, items: &[*mut Object]) -> *mut Object {
        let list = list_alloc(items.len());
        for (i, item) in items.iter().enumerate() {
            // SAFETY: `list_alloc` reserved `items.len()` slots.
            unsafe { *(*list.cast::<ListObject>()).ob_item.add(i) = *item };
        }
        list
    }

    /// Steals `entries`.
    pub fn dict(&self, entries: &[(*mut Object, *mut Object)]) -> *mut Object {
        leak(DictObject {
            ob_base: Object {
                ob_refcnt: 1,
                ob_type: self.dict_type,
            },
            entries: entries.to_vec(),
        })
        .cast()
    }

    /// A closure cell holding `value` (stolen), or an empty one for null.
    pub fn cell(&self, value: *mut Object) -> *mut Object {
        leak(CellObject {
            ob_base: Object {
                ob_refcnt: 1,
                ob_type: self.cell_type,
            },
            ob_ref: value,
        })
        .cast()
    }

    /// An iterator over `seq` (stolen) that raises `exc` instead of
    /// producing item `fail_at`.
    pub fn failing_iter(&self, seq: *mut Object, fail_at: isize, exc: *mut Object) -> *mut Object {
        let iter = new_iter(seq);
        // SAFETY: freshly allocated iterator.
        unsafe {
            (*iter.cast::<IterObject>()).fail_at = fail_at;
            (*iter.cast::<IterObject>()).fail_with = exc;
        }
        iter
    }

    /// An iterator over `seq` (stolen) that ends with a pending `StopIteration`.
    pub fn stop_raising_iter(&self, seq: *mut Object) -> *mut Object {
        let iter = new_iter(seq);
        // SAFETY: freshly allocated iterator.
        unsafe { (*iter.cast::<IterObject>()).raise_stop = true };
        iter
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(ptr::null()));
    }
}

// ===========================================================================
// Inspection helpers
// ===========================================================================

pub fn refcnt(obj: *mut Object) -> isize {
    // SAFETY: tests only inspect objects they still own a reference to.
    unsafe { (*obj).ob_refcnt }
}

pub fn incref(obj: *mut Object) -> *mut Object {
    // SAFETY: as above.
    unsafe { (*obj).ob_refcnt += 1 };
    obj
}

pub fn decref(obj: *mut Object) {
    // SAFETY: as above.
    unsafe {
        (*obj).ob_refcnt -= 1;
        if (*obj).ob_refcnt == 0 {
            wrap_dealloc(obj);
        }
    }
}

fn is_type(obj: *mut Object, ty: *mut TypeObject) -> bool {
    // SAFETY: every object carries a header.
    !obj.is_null() && unsafe { (*obj).ob_type } == ty
}

pub fn int_value(obj: *mut Object) -> Option<i64> {
    if is_type(obj, rt().int_type) {
        // SAFETY: checked type.
        Some(unsafe { (*obj.cast::<IntObject>()).value })
    } else {
        None
    }
}

/// Items of a tuple or list, borrowed.
pub fn items(obj: *mut Object) -> Option<Vec<*mut Object>> {
    let runtime = rt();
    // SAFETY: checked type; both store `ob_size` items.
    unsafe {
        if is_type(obj, runtime.tuple_type) {
            let len = (*obj.cast::<TupleObject>()).ob_size as usize;
            Some(std::slice::from_raw_parts(tuple_items(obj), len).to_vec())
        } else if is_type(obj, runtime.list_type) {
            let list = &*obj.cast::<ListObject>();
            Some(std::slice::from_raw_parts(list.ob_item, list.ob_size as usize).to_vec())
        } else {
            None
        }
    }
}

pub fn int_items(obj: *mut Object) -> Option<Vec<i64>> {
    items(obj)?.into_iter().map(int_value).collect()
}

/// Borrowed value stored under the string key `key`, possibly null.
pub fn dict_value(dict: *mut Object, key: &str) -> *mut Object {
    assert!(is_type(dict, rt().dict_type));
    // SAFETY: checked type; keys are live objects.
    unsafe {
        (*dict.cast::<DictObject>())
            .entries
            .iter()
            .find(|(k, _)| is_type(*k, rt().str_type) && (*k.cast::<StrObject>()).text == key)
            .map_or(ptr::null_mut(), |(_, v)| *v)
    }
}

pub fn dict_len(dict: *mut Object) -> usize {
    assert!(is_type(dict, rt().dict_type));
    // SAFETY: checked type.
    unsafe { (*dict.cast::<DictObject>()).entries.len() }
}

/// Borrowed contents of a cell, possibly null.
pub fn cell_contents(cell: *mut Object) -> *mut Object {
    assert!(is_type(cell, rt().cell_type));
    // SAFETY: checked type.
    unsafe { (*cell.cast::<CellObject>()).ob_ref }
}

// ===========================================================================
// Frames
// ===========================================================================

/// A heap frame with `nlocals` fast locals and room for `stack_size`
/// values, over a code object holding `consts` and `names`.
pub struct Frame {
    raw: *mut FrameObject,
    layout: Layout,
    nlocals: usize,
    ncells: usize,
}

impl Frame {
    /// Steals `consts`, `names`, `globals` and `builtins`.
    pub fn new(
        runtime: &Runtime,
        nlocals: usize,
        stack_size: usize,
        consts: &[*mut Object],
        names: &[*mut Object],
        globals: *mut Object,
        builtins: *mut Object,
    ) -> Self {
        Frame::with_cells(runtime, nlocals, &[], stack_size, consts, names, globals, builtins)
    }

    /// Like [`Frame::new`], with `cells` (stolen) stored after the fast
    /// locals where free variables live.
    #[allow(clippy::too_many_arguments)]
    pub fn with_cells(
        runtime: &Runtime,
        nlocals: usize,
        cells: &[*mut Object],
        stack_size: usize,
        consts: &[*mut Object],
        names: &[*mut Object],
        globals: *mut Object,
        builtins: *mut Object,
    ) -> Self {
        let ncells = cells.len();
        let slots = nlocals + ncells + stack_size;
        let layout = Layout::from_size_align(
            size_of::<FrameObject>() + slots * size_of::<*mut Object>(),
            std::mem::align_of::<FrameObject>(),
        )
        .expect("frame layout");
        let code = leak(CodeObject {
            ob_base: Object {
                ob_refcnt: 1,
                ob_type: runtime.singleton_type,
            },
            co_argcount: 0,
            co_nlocals: i32::try_from(nlocals).expect("local count"),
            co_stacksize: i32::try_from(stack_size).expect("stack size"),
            co_flags: 0,
            co_code: ptr::null_mut(),
            co_consts: runtime.tuple(consts).cast(),
            co_names: runtime.tuple(names).cast(),
        });
        // SAFETY: zeroed memory is a valid frame: null pointers, zero counts.
        unsafe {
            let raw = alloc_zeroed(layout).cast::<FrameObject>();
            assert!(!raw.is_null(), "frame allocation failed");
            (*raw).ob_base.ob_refcnt = 1;
            (*raw).f_code = code;
            (*raw).f_globals = globals;
            (*raw).f_builtins = builtins;
            let localsplus = ptr::addr_of_mut!((*raw).f_localsplus).cast::<*mut Object>();
            for (i, cell) in cells.iter().enumerate() {
                *localsplus.add(nlocals + i) = *cell;
            }
            (*raw).f_valuestack = localsplus.add(nlocals + ncells);
            (*raw).f_stacktop = localsplus.add(nlocals + ncells);
            Frame {
                raw,
                layout,
                nlocals,
                ncells,
            }
        }
    }

    /// A frame with no names and empty namespaces.
    pub fn simple(runtime: &Runtime, nlocals: usize, consts: &[*mut Object]) -> Self {
        let globals = runtime.dict(&[]);
        let builtins = runtime.dict(&[]);
        Frame::new(runtime, nlocals, 16, consts, &[], globals, builtins)
    }

    fn locals(&self) -> *mut *mut Object {
        // SAFETY: `raw` is a live frame.
        unsafe { ptr::addr_of_mut!((*self.raw).f_localsplus).cast() }
    }

    /// Borrowed value of local `index`, possibly null.
    pub fn local(&self, index: usize) -> *mut Object {
        assert!(index < self.nlocals);
        // SAFETY: in bounds.
        unsafe { *self.locals().add(index) }
    }

    /// Steals `value`, releasing the previous occupant.
    pub fn set_local(&mut self, index: usize, value: *mut Object) {
        assert!(index < self.nlocals);
        let previous = self.local(index);
        // SAFETY: in bounds.
        unsafe { *self.locals().add(index) = value };
        if !previous.is_null() {
            decref(previous);
        }
    }

    /// Borrowed cell of free variable `index`.
    pub fn cell(&self, index: usize) -> *mut Object {
        assert!(index < self.ncells);
        // SAFETY: in bounds; cells follow the locals.
        unsafe { *self.locals().add(self.nlocals + index) }
    }

    pub fn const_at(&self, index: usize) -> *mut Object {
        // SAFETY: the code object outlives the frame.
        unsafe { *tuple_items((*(*self.raw).f_code).co_consts.cast()).add(index) }
    }

    /// Run `entry` on this frame.
    pub fn run(&mut self, entry: CompiledEntry) -> *mut Object {
        // SAFETY: `entry` was compiled for frames of this layout.
        unsafe { entry(self.raw.cast()).cast() }
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        for index in 0..self.nlocals {
            self.set_local(index, ptr::null_mut());
        }
        for index in 0..self.ncells {
            decref(self.cell(index));
        }
        // SAFETY: the frame and its code object were allocated in `new`.
        unsafe {
            let code = (*self.raw).f_code;
            decref((*code).co_consts.cast());
            decref((*code).co_names.cast());
            drop(Box::from_raw(code));
            decref((*self.raw).f_globals);
            decref((*self.raw).f_builtins);
            dealloc(self.raw.cast(), self.layout);
        }
    }
}

// ===========================================================================
// Allocation
// ===========================================================================

fn tuple_layout(len: usize) -> Layout {
    Layout::from_size_align(
        size_of::<TupleObject>() + len * size_of::<*mut Object>(),
        std::mem::align_of::<TupleObject>(),
    )
    .expect("tuple layout")
}

fn tuple_items(tuple: *mut Object) -> *mut *mut Object {
    // SAFETY: callers pass tuples.
    unsafe { ptr::addr_of_mut!((*tuple.cast::<TupleObject>()).ob_item).cast() }
}

fn tuple_alloc(len: usize) -> *mut Object {
    // SAFETY: zeroed items are null slots.
    unsafe {
        let tuple = alloc_zeroed(tuple_layout(len)).cast::<TupleObject>();
        assert!(!tuple.is_null(), "tuple allocation failed");
        (*tuple).ob_base = Object {
            ob_refcnt: 1,
            ob_type: rt().tuple_type,
        };
        (*tuple).ob_size = len as isize;
        tuple.cast()
    }
}

fn list_alloc(len: usize) -> *mut Object {
    let storage = Box::into_raw(vec![ptr::null_mut::<Object>(); len].into_boxed_slice());
    leak(ListObject {
        ob_base: Object {
            ob_refcnt: 1,
            ob_type: rt().list_type,
        },
        ob_size: len as isize,
        ob_item: storage.cast(),
        allocated: len as isize,
    })
    .cast()
}

fn new_iter(seq: *mut Object) -> *mut Object {
    leak(IterObject {
        ob_base: Object {
            ob_refcnt: 1,
            ob_type: rt().iter_type,
        },
        seq,
        index: 0,
        fail_at: -1,
        fail_with: ptr::null_mut(),
        raise_stop: false,
    })
    .cast()
}

fn new_bool(flag: bool) -> *mut Object {
    let runtime = rt();
    incref(if flag { runtime.py_true } else { runtime.py_false })
}

// ===========================================================================
// Entry points
// ===========================================================================

unsafe extern "C" fn unimplemented_entry() {
    eprintln!("generated code called a runtime entry point the test runtime lacks");
    std::process::abort();
}

unsafe extern "C" fn wrap_dealloc(obj: *mut Object) {
    let runtime = rt();
    runtime.deallocations.set(runtime.deallocations.get() + 1);
    let ty = (*obj).ob_type;
    if ty == runtime.int_type {
        drop(Box::from_raw(obj.cast::<IntObject>()));
    } else if ty == runtime.str_type {
        drop(Box::from_raw(obj.cast::<StrObject>()));
    } else if ty == runtime.tuple_type {
        let len = (*obj.cast::<TupleObject>()).ob_size as usize;
        for i in 0..len {
            let item = *tuple_items(obj).add(i);
            if !item.is_null() {
                decref(item);
            }
        }
        dealloc(obj.cast(), tuple_layout(len));
    } else if ty == runtime.list_type {
        let list = Box::from_raw(obj.cast::<ListObject>());
        for i in 0..list.ob_size as usize {
            let item = *list.ob_item.add(i);
            if !item.is_null() {
                decref(item);
            }
        }
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
            list.ob_item,
            list.allocated as usize,
        )));
    } else if ty == runtime.dict_type {
        let dict = Box::from_raw(obj.cast::<DictObject>());
        for (key, value) in &dict.entries {
            decref(*key);
            decref(*value);
        }
    } else if ty == runtime.iter_type {
        let iter = Box::from_raw(obj.cast::<IterObject>());
        decref(iter.seq);
    } else if ty == runtime.cell_type {
        let cell = Box::from_raw(obj.cast::<CellObject>());
        if !cell.ob_ref.is_null() {
            decref(cell.ob_ref);
        }
    } else {
        eprintln!("deallocated an immortal object");
        std::process::abort();
    }
}

unsafe extern "C" fn negative_refcount(_function: *const u8, _pc: i32, _obj: *mut Object) {
    eprintln!("negative reference count");
    std::process::abort();
}

unsafe extern "C" fn err_occurred() -> *mut Object {
    rt().error()
}

unsafe extern "C" fn err_exception_matches(exc: *mut Object) -> i32 {
    i32::from(rt().error() == exc)
}

unsafe extern "C" fn err_clear() {
    rt().clear_error();
}

unsafe extern "C" fn raise_unbound_local(_frame: *mut FrameObject, _index: i32) {
    let runtime = rt();
    runtime.set_error(runtime.name_error);
}

unsafe extern "C" fn raise_global_name_error(_name: *mut Object, _format: *const u8) {
    let runtime = rt();
    runtime.set_error(runtime.name_error);
}

/// Steals all three operands; only the type is recorded.
unsafe extern "C" fn do_raise(exc_type: *mut Object, value: *mut Object, tb: *mut Object) {
    let runtime = rt();
    runtime.set_error(if exc_type.is_null() {
        runtime.type_error
    } else {
        exc_type
    });
    for obj in [exc_type, value, tb] {
        if !obj.is_null() {
            decref(obj);
        }
    }
}

fn key_eq(a: *mut Object, b: *mut Object) -> bool {
    if a == b {
        return true;
    }
    let runtime = rt();
    if is_type(a, runtime.str_type) && is_type(b, runtime.str_type) {
        // SAFETY: checked type.
        return unsafe { (*a.cast::<StrObject>()).text == (*b.cast::<StrObject>()).text };
    }
    matches!((int_value(a), int_value(b)), (Some(x), Some(y)) if x == y)
}

unsafe extern "C" fn dict_get_item(dict: *mut Object, key: *mut Object) -> *mut Object {
    let dict = &*dict.cast::<DictObject>();
    dict.entries
        .iter()
        .find(|(k, _)| key_eq(*k, key))
        .map_or(ptr::null_mut(), |(_, v)| *v)
}

unsafe extern "C" fn dict_set_item(dict: *mut Object, key: *mut Object, value: *mut Object) -> i32 {
    let dict = &mut *dict.cast::<DictObject>();
    incref(value);
    match dict.entries.iter().position(|(k, _)| key_eq(*k, key)) {
        Some(index) => {
            let previous = std::mem::replace(&mut dict.entries[index].1, value);
            decref(previous);
        }
        None => dict.entries.push((incref(key), value)),
    }
    0
}

unsafe extern "C" fn dict_del_item(dict: *mut Object, key: *mut Object) -> i32 {
    let dict = &mut *dict.cast::<DictObject>();
    match dict.entries.iter().position(|(k, _)| key_eq(*k, key)) {
        Some(index) => {
            let (k, v) = dict.entries.remove(index);
            decref(k);
            decref(v);
            0
        }
        None => {
            let runtime = rt();
            runtime.set_error(runtime.key_error);
            -1
        }
    }
}

fn int_binary(a: *mut Object, b: *mut Object, op: fn(i64, i64) -> i64) -> *mut Object {
    let runtime = rt();
    match (int_value(a), int_value(b)) {
        (Some(x), Some(y)) => runtime.int(op(x, y)),
        _ => {
            runtime.set_error(runtime.type_error);
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn number_add(a: *mut Object, b: *mut Object) -> *mut Object {
    int_binary(a, b, i64::wrapping_add)
}

unsafe extern "C" fn number_subtract(a: *mut Object, b: *mut Object) -> *mut Object {
    int_binary(a, b, i64::wrapping_sub)
}

unsafe extern "C" fn number_multiply(a: *mut Object, b: *mut Object) -> *mut Object {
    int_binary(a, b, i64::wrapping_mul)
}

unsafe extern "C" fn number_negative(a: *mut Object) -> *mut Object {
    int_binary(a, a, |x, _| x.wrapping_neg())
}

unsafe extern "C" fn object_is_true(obj: *mut Object) -> i32 {
    let runtime = rt();
    runtime.truth_tests.set(runtime.truth_tests.get() + 1);
    if let Some(value) = int_value(obj) {
        return i32::from(value != 0);
    }
    if let Some(items) = items(obj) {
        return i32::from(!items.is_empty());
    }
    if obj == runtime.none {
        return 0;
    }
    runtime.set_error(runtime.type_error);
    -1
}

unsafe extern "C" fn rich_compare(a: *mut Object, b: *mut Object, op: i32) -> *mut Object {
    let runtime = rt();
    let (Some(x), Some(y)) = (int_value(a), int_value(b)) else {
        runtime.set_error(runtime.type_error);
        return ptr::null_mut();
    };
    let result = match op {
        0 => x < y,
        1 => x <= y,
        2 => x == y,
        3 => x != y,
        4 => x > y,
        5 => x >= y,
        _ => {
            runtime.set_error(runtime.value_error);
            return ptr::null_mut();
        }
    };
    new_bool(result)
}

unsafe extern "C" fn sequence_contains(container: *mut Object, item: *mut Object) -> i32 {
    match items(container) {
        Some(items) => i32::from(items.iter().any(|x| key_eq(*x, item))),
        None => {
            let runtime = rt();
            runtime.set_error(runtime.type_error);
            -1
        }
    }
}

unsafe extern "C" fn tuple_new(len: isize) -> *mut Object {
    tuple_alloc(len as usize)
}

unsafe extern "C" fn list_new(len: isize) -> *mut Object {
    list_alloc(len as usize)
}

unsafe extern "C" fn list_append(list: *mut Object, item: *mut Object) -> i32 {
    let list = &mut *list.cast::<ListObject>();
    if list.ob_size == list.allocated {
        let mut grown = vec![ptr::null_mut::<Object>(); (list.allocated as usize + 1) * 2];
        grown[..list.ob_size as usize]
            .copy_from_slice(std::slice::from_raw_parts(list.ob_item, list.ob_size as usize));
        drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
            list.ob_item,
            list.allocated as usize,
        )));
        list.allocated = grown.len() as isize;
        list.ob_item = Box::into_raw(grown.into_boxed_slice()).cast();
    }
    *list.ob_item.add(list.ob_size as usize) = incref(item);
    list.ob_size += 1;
    0
}

unsafe extern "C" fn get_item(container: *mut Object, key: *mut Object) -> *mut Object {
    let runtime = rt();
    if is_type(container, runtime.dict_type) {
        let found = dict_get_item(container, key);
        if found.is_null() {
            runtime.set_error(runtime.key_error);
            return ptr::null_mut();
        }
        return incref(found);
    }
    let (Some(items), Some(index)) = (items(container), int_value(key)) else {
        runtime.set_error(runtime.type_error);
        return ptr::null_mut();
    };
    match usize::try_from(index).ok().and_then(|i| items.get(i)) {
        Some(item) => incref(*item),
        None => {
            runtime.set_error(runtime.value_error);
            ptr::null_mut()
        }
    }
}

unsafe extern "C" fn get_iter(obj: *mut Object) -> *mut Object {
    let runtime = rt();
    if is_type(obj, runtime.iter_type) {
        return incref(obj);
    }
    if items(obj).is_none() {
        runtime.set_error(runtime.type_error);
        return ptr::null_mut();
    }
    new_iter(incref(obj))
}

unsafe extern "C" fn iter_next(obj: *mut Object) -> *mut Object {
    let runtime = rt();
    let iter = &mut *obj.cast::<IterObject>();
    if iter.index == iter.fail_at {
        runtime.set_error(iter.fail_with);
        return ptr::null_mut();
    }
    let items = items(iter.seq).unwrap_or_default();
    match items.get(iter.index as usize) {
        Some(item) => {
            iter.index += 1;
            incref(*item)
        }
        None => {
            if iter.raise_stop {
                runtime.set_error(runtime.stop_iteration);
            }
            ptr::null_mut()
        }
    }
}

/// Writes the items downwards from `sp`, first item on top. Nonzero is success.
unsafe extern "C" fn unpack_iterable(seq: *mut Object, count: i32, sp: *mut *mut Object) -> i32 {
    let runtime = rt();
    match items(seq) {
        Some(items) if items.len() == count as usize => {
            for (i, item) in items.iter().enumerate() {
                *sp.sub(i + 1) = incref(*item);
            }
            1
        }
        _ => {
            runtime.set_error(runtime.value_error);
            0
        }
    }
}

/// Calls a callable that is a tuple `(int)`: returns the sum of the integer
/// positional arguments and the tuple's element. Consumes the callable and
/// its arguments and moves `*sp` down past them.
unsafe extern "C" fn call_function(sp: *mut *mut *mut Object, oparg: i32) -> *mut Object {
    let runtime = rt();
    let positional = (oparg & 0xff) as usize;
    let keyword = ((oparg >> 8) & 0xff) as usize;
    let consumed = positional + 2 * keyword + 1;
    let base = (*sp).sub(consumed);
    let callable = *base;
    let mut total = items(callable)
        .and_then(|items| items.first().copied())
        .and_then(int_value);
    for i in 0..positional {
        total = total.zip(int_value(*base.add(1 + i))).map(|(a, b)| a + b);
    }
    for i in 0..consumed {
        decref(*base.add(i));
    }
    *sp = base;
    match total {
        Some(total) if keyword == 0 => runtime.int(total),
        _ => {
            runtime.set_error(runtime.type_error);
            ptr::null_mut()
        }
    }
}

/// Like `call_function`, with an extra positional tuple and a keyword
/// dictionary on top of the explicit arguments: sums the callable's element,
/// the positional arguments, the tuple's items and the dictionary's values.
/// Leaves the result in the callable's slot and reports failure as nonzero.
unsafe extern "C" fn call_function_var_kw(sp: *mut *mut *mut Object, oparg: i32) -> i32 {
    let runtime = rt();
    let positional = (oparg & 0xff) as usize;
    let keyword = ((oparg >> 8) & 0xff) as usize;
    let consumed = positional + 2 * keyword + 3;
    let base = (*sp).sub(consumed);
    let star_args = *base.add(consumed - 2);
    let star_kwargs = *base.add(consumed - 1);

    let mut total = items(*base)
        .and_then(|items| items.first().copied())
        .and_then(int_value);
    for i in 0..positional {
        total = total.zip(int_value(*base.add(1 + i))).map(|(a, b)| a + b);
    }
    if is_type(star_args, runtime.tuple_type) {
        for item in items(star_args).unwrap_or_default() {
            total = total.zip(int_value(item)).map(|(a, b)| a + b);
        }
    } else {
        total = None;
    }
    if is_type(star_kwargs, runtime.dict_type) {
        for (_, value) in &(*star_kwargs.cast::<DictObject>()).entries {
            total = total.zip(int_value(*value)).map(|(a, b)| a + b);
        }
    } else {
        total = None;
    }

    for i in 0..consumed {
        decref(*base.add(i));
    }
    match total {
        Some(total) if keyword == 0 => {
            *base = runtime.int(total);
            *sp = base.add(1);
            0
        }
        _ => {
            *sp = base;
            runtime.set_error(runtime.type_error);
            -1
        }
    }
}

unsafe extern "C" fn dict_new_presized(_size: isize) -> *mut Object {
    rt().dict(&[])
}

/// Attributes of a dictionary are its string-keyed entries.
unsafe extern "C" fn get_attr(obj: *mut Object, name: *mut Object) -> *mut Object {
    let runtime = rt();
    if is_type(obj, runtime.dict_type) {
        let found = dict_get_item(obj, name);
        if !found.is_null() {
            return incref(found);
        }
    }
    runtime.set_error(runtime.attribute_error);
    ptr::null_mut()
}

/// A null `value` deletes the attribute.
unsafe extern "C" fn set_attr(obj: *mut Object, name: *mut Object, value: *mut Object) -> i32 {
    let runtime = rt();
    if !is_type(obj, runtime.dict_type) {
        runtime.set_error(runtime.attribute_error);
        return -1;
    }
    if !value.is_null() {
        return dict_set_item(obj, name, value);
    }
    if dict_get_item(obj, name).is_null() {
        runtime.set_error(runtime.attribute_error);
        return -1;
    }
    dict_del_item(obj, name)
}

/// Index of `key` into a list, if it is an in-range integer.
fn list_index(list: *mut Object, key: *mut Object) -> Option<usize> {
    if !is_type(list, rt().list_type) {
        return None;
    }
    let len = items(list)?.len();
    usize::try_from(int_value(key)?).ok().filter(|i| *i < len)
}

unsafe extern "C" fn set_item(obj: *mut Object, key: *mut Object, value: *mut Object) -> i32 {
    let runtime = rt();
    if is_type(obj, runtime.dict_type) {
        return dict_set_item(obj, key, value);
    }
    let Some(index) = list_index(obj, key) else {
        runtime.set_error(runtime.type_error);
        return -1;
    };
    let slot = (*obj.cast::<ListObject>()).ob_item.add(index);
    let previous = std::mem::replace(&mut *slot, incref(value));
    decref(previous);
    0
}

unsafe extern "C" fn del_item(obj: *mut Object, key: *mut Object) -> i32 {
    let runtime = rt();
    if is_type(obj, runtime.dict_type) {
        return dict_del_item(obj, key);
    }
    let Some(index) = list_index(obj, key) else {
        runtime.set_error(runtime.type_error);
        return -1;
    };
    list_splice(obj, index, index + 1, &[]);
    0
}

/// `seq[start:stop]` bounds, clamped; null bounds are open.
fn slice_range(len: usize, start: *mut Object, stop: *mut Object) -> Option<(usize, usize)> {
    let bound = |obj: *mut Object, default: usize| -> Option<usize> {
        if obj.is_null() {
            return Some(default);
        }
        let value = int_value(obj)?;
        let len = len as i64;
        let clamped = if value < 0 { value + len } else { value }.clamp(0, len);
        Some(clamped as usize)
    };
    let start = bound(start, 0)?;
    let stop = bound(stop, len)?;
    Some((start, stop.max(start)))
}

/// Replaces `list[lo..hi]` with new references to `replacement`.
unsafe fn list_splice(list: *mut Object, lo: usize, hi: usize, replacement: &[*mut Object]) {
    let list = &mut *list.cast::<ListObject>();
    let mut current = std::slice::from_raw_parts(list.ob_item, list.ob_size as usize).to_vec();
    let removed: Vec<*mut Object> = current
        .splice(lo..hi, replacement.iter().map(|item| incref(*item)))
        .collect();
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
        list.ob_item,
        list.allocated as usize,
    )));
    list.ob_size = current.len() as isize;
    list.allocated = current.len() as isize;
    list.ob_item = Box::into_raw(current.into_boxed_slice()).cast();
    for item in removed {
        decref(item);
    }
}

/// A new tuple or list, matching `seq`.
unsafe extern "C" fn apply_slice(
    seq: *mut Object,
    start: *mut Object,
    stop: *mut Object,
) -> *mut Object {
    let runtime = rt();
    let Some(items) = items(seq) else {
        runtime.set_error(runtime.type_error);
        return ptr::null_mut();
    };
    let Some((lo, hi)) = slice_range(items.len(), start, stop) else {
        runtime.set_error(runtime.type_error);
        return ptr::null_mut();
    };
    let taken: Vec<*mut Object> = items[lo..hi].iter().map(|item| incref(*item)).collect();
    if is_type(seq, runtime.list_type) {
        runtime.list(&taken)
    } else {
        runtime.tuple(&taken)
    }
}

/// Lists only; a null `source` deletes the slice.
unsafe extern "C" fn assign_slice(
    seq: *mut Object,
    start: *mut Object,
    stop: *mut Object,
    source: *mut Object,
) -> i32 {
    let runtime = rt();
    let replacement = if source.is_null() {
        Some(Vec::new())
    } else {
        items(source)
    };
    let bounds = items(seq).and_then(|items| slice_range(items.len(), start, stop));
    match (is_type(seq, runtime.list_type), bounds, replacement) {
        (true, Some((lo, hi)), Some(replacement)) => {
            list_splice(seq, lo, hi, &replacement);
            0
        }
        _ => {
            runtime.set_error(runtime.type_error);
            -1
        }
    }
}

/// Null without an error for an empty cell.
unsafe extern "C" fn cell_get(cell: *mut Object) -> *mut Object {
    let contents = (*cell.cast::<CellObject>()).ob_ref;
    if contents.is_null() {
        ptr::null_mut()
    } else {
        incref(contents)
    }
}

unsafe extern "C" fn cell_set(cell: *mut Object, value: *mut Object) -> i32 {
    let cell = &mut *cell.cast::<CellObject>();
    if !value.is_null() {
        incref(value);
    }
    let previous = std::mem::replace(&mut cell.ob_ref, value);
    if !previous.is_null() {
        decref(previous);
    }
    0
}

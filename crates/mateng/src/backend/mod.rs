//! The native-call boundary
//!
//! The bridge talks to the engine through a handful of C entry points:
//! an array allocator (`mx*`) and a process controller (`eng*`). This
//! module describes that surface as two traits so the session and array
//! layers do not care whether they are driving the real engine libraries
//! ([`native::NativeBackend`]) or the in-process emulator
//! (`sim::SimBackend`, feature `sim`).
//!
//! Failures are reported the way the C API reports them: integer status
//! codes (0 is success) and null handles. The layers above turn those into
//! [`crate::MatError`] values.

pub mod native;

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::class::MxClass;
use crate::error::StartFailure;

/// Opaque handle to an engine-allocated array (`mxArray*`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawArray(NonNull<c_void>);

impl RawArray {
    /// Wrap a pointer returned by the engine library; null yields `None`.
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(RawArray)
    }

    /// The raw pointer
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

impl fmt::Debug for RawArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawArray({:p})", self.0)
    }
}

/// Opaque handle to a running engine process (`Engine*`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct RawEngine(NonNull<c_void>);

impl RawEngine {
    /// Wrap a pointer returned by the engine library; null yields `None`.
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(RawEngine)
    }

    /// The raw pointer
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

impl fmt::Debug for RawEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawEngine({:p})", self.0)
    }
}

/// Array allocator and accessors of the engine library.
///
/// Every `unsafe` method has the same contract: each handle passed in must
/// be live (not yet destroyed) and must have been produced by this same
/// backend.
pub trait MxApi: Send + Sync {
    /// Allocate a zero-filled array with a flat data buffer
    /// (numeric, logical or char class).
    fn create_numeric(&self, class: MxClass, dims: &[usize]) -> Option<RawArray>;

    /// Allocate a cell array whose elements are all empty.
    fn create_cell(&self, dims: &[usize]) -> Option<RawArray>;

    /// Allocate a struct array with the given field names, all fields empty.
    fn create_struct(&self, dims: &[usize], fields: &[&str]) -> Option<RawArray>;

    /// Free an array and everything it contains.
    ///
    /// # Safety
    ///
    /// See the trait contract. The handle is dead afterwards.
    unsafe fn destroy(&self, array: RawArray);

    /// Deep copy.
    ///
    /// # Safety
    ///
    /// See the trait contract.
    unsafe fn duplicate(&self, array: RawArray) -> Option<RawArray>;

    /// Class id of the array.
    ///
    /// # Safety
    ///
    /// See the trait contract.
    unsafe fn class_of(&self, array: RawArray) -> MxClass;

    /// Dimensions (always at least two entries).
    ///
    /// # Safety
    ///
    /// See the trait contract.
    unsafe fn dims(&self, array: RawArray) -> Vec<usize>;

    /// Pointer to the first element of the flat data buffer, or null for
    /// containers and empty arrays.
    ///
    /// # Safety
    ///
    /// See the trait contract. The pointer lives as long as the array.
    unsafe fn data(&self, array: RawArray) -> *mut c_void;

    /// Element `index` of a cell array. The returned handle is borrowed
    /// from the container and must not be destroyed.
    ///
    /// # Safety
    ///
    /// See the trait contract.
    unsafe fn cell(&self, array: RawArray, index: usize) -> Option<RawArray>;

    /// Store `value` as element `index` of a cell array. The container takes
    /// ownership of `value` and frees the element it replaces.
    ///
    /// # Safety
    ///
    /// See the trait contract; `value` must be owned by the caller and not
    /// be contained in another array.
    unsafe fn set_cell(&self, array: RawArray, index: usize, value: RawArray);

    /// Field names of a struct array in declaration order.
    ///
    /// # Safety
    ///
    /// See the trait contract.
    unsafe fn field_names(&self, array: RawArray) -> Vec<String>;

    /// Field `name` of struct element `index`, borrowed from the container.
    ///
    /// # Safety
    ///
    /// See the trait contract.
    unsafe fn field(&self, array: RawArray, index: usize, name: &str) -> Option<RawArray>;

    /// Store `value` in field `name` of struct element `index`. The
    /// container takes ownership of `value` and frees what it replaces.
    ///
    /// # Safety
    ///
    /// Same as [`MxApi::set_cell`]; the field must exist.
    unsafe fn set_field(&self, array: RawArray, index: usize, name: &str, value: RawArray);
}

/// Process control entry points of the engine library.
///
/// The `unsafe` methods require a handle returned by [`EngineApi::open`] on
/// this backend that has not been passed to [`EngineApi::close`] yet.
pub trait EngineApi: Send + Sync {
    /// Spawn or attach an engine process with the given startup command.
    fn open(&self, command: &str) -> Result<RawEngine, StartFailure>;

    /// Shut the engine down. Returns the native status code.
    ///
    /// # Safety
    ///
    /// See the trait contract. The handle is dead afterwards.
    unsafe fn close(&self, engine: RawEngine) -> i32;

    /// Evaluate one statement synchronously. Returns the native status
    /// code; errors raised by the engine language itself do not make the
    /// status non-zero.
    ///
    /// # Safety
    ///
    /// See the trait contract.
    unsafe fn eval_string(&self, engine: RawEngine, statement: &str) -> i32;

    /// Register (or, with a null pointer, unregister) the buffer that
    /// receives the text output of each evaluation. The engine writes a
    /// NUL-terminated string that fits within `len` bytes.
    ///
    /// # Safety
    ///
    /// See the trait contract; `buffer` must stay valid for `len` bytes
    /// until it is unregistered or the engine is closed.
    unsafe fn output_buffer(&self, engine: RawEngine, buffer: *mut u8, len: usize) -> i32;

    /// Bind `value` to `name` in the engine namespace. On status 0 the
    /// backend has taken responsibility for `value`; on failure the caller
    /// still owns it.
    ///
    /// # Safety
    ///
    /// See the trait contract; `value` must be an owned array of this
    /// backend.
    unsafe fn put_variable(&self, engine: RawEngine, name: &str, value: RawArray) -> i32;

    /// Fetch a fresh copy of the value bound to `name`, owned by the caller.
    ///
    /// # Safety
    ///
    /// See the trait contract.
    unsafe fn get_variable(&self, engine: RawEngine, name: &str) -> Option<RawArray>;
}

/// A complete engine binding.
pub trait Backend: MxApi + EngineApi {
    /// Short name used in log output.
    fn name(&self) -> &str;
}

/// Shared handle to a backend. Arrays and sessions keep one so the
/// libraries outlive every handle they allocated.
pub type BackendRef = Arc<dyn Backend>;

/// Check whether two handles point at the same backend instance.
pub(crate) fn same_backend(a: &BackendRef, b: &BackendRef) -> bool {
    // Data pointers only; vtable pointers are not unique.
    Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
}

//! In-process engine emulator
//!
//! [`SimBackend`] implements the same raw-pointer boundary as the native
//! libraries, so sessions, arrays and conversions run unchanged against it.
//! It is what the test suite drives and what `SessionRegistry` users can
//! swap in when no engine is installed.
//!
//! ## What it emulates
//!
//! - Array allocation with the engine's ownership rules: containers own
//!   their elements, `put_variable` takes the array, `get_variable` hands
//!   back a fresh copy.
//! - One namespace per opened engine.
//! - A small statement language: assignments (including `[a, b] = f(...)`
//!   and `s.field = ...`), `clear`, matrix literals, arithmetic, a handful
//!   of builtins, `error(...)` and `MException.last`.
//! - Evaluation output written into the registered output buffer.
//!
//! ## Test hooks
//!
//! [`SimBackend::live_arrays`] counts arrays that are owned by the host
//! side, which lets tests check that every allocation is eventually freed.
//! [`SimBackend::define_function`] registers host closures callable from
//! statements, [`SimBackend::crash_all`] makes every open engine fail at
//! the native level and [`SimBackend::refuse_start`] makes `open` fail.

mod interp;
mod parse;
mod value;

pub use value::SimArray;

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::backend::{Backend, BackendRef, EngineApi, MxApi, RawArray, RawEngine};
use crate::class::MxClass;
use crate::error::StartFailure;

use interp::Workspace;

/// An error raised inside the simulated engine language.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{identifier}: {message}")]
pub struct SimError {
    /// Identifier such as `MATLAB:UndefinedFunction`; empty when the
    /// statement raised a bare message
    pub identifier: String,
    /// Message text
    pub message: String,
}

impl SimError {
    /// Create an error
    pub fn new(identifier: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            message: message.into(),
        }
    }
}

/// Host function callable from simulated statements.
///
/// Receives the evaluated arguments and the number of requested outputs
/// (0 for a bare statement) and returns the outputs.
pub type SimFunction =
    Arc<dyn Fn(&[SimArray], usize) -> Result<Vec<SimArray>, SimError> + Send + Sync>;

struct OutputBuffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the buffer is only written while the engine table lock is held,
// and the registering session guarantees it outlives the registration.
unsafe impl Send for OutputBuffer {}

#[derive(Default)]
struct EngineState {
    workspace: Workspace,
    output: Option<OutputBuffer>,
    crashed: bool,
}

impl EngineState {
    fn write_output(&self, text: &str) {
        let Some(buffer) = &self.output else {
            return;
        };
        if buffer.ptr.is_null() || buffer.len == 0 {
            return;
        }
        let bytes = text.as_bytes();
        let n = bytes.len().min(buffer.len - 1);
        // SAFETY: the registration contract keeps `ptr` valid for `len`
        // bytes and `n < len`.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), buffer.ptr, n);
            *buffer.ptr.add(n) = 0;
        }
    }
}

struct Inner {
    engines: Mutex<HashMap<usize, EngineState>>,
    functions: RwLock<HashMap<String, SimFunction>>,
    next_engine: AtomicUsize,
    live: AtomicUsize,
    refuse: Mutex<Option<StartFailure>>,
    commands: Mutex<Vec<String>>,
}

/// The in-process engine emulator. Cloning yields another handle to the
/// same emulator.
#[derive(Clone)]
pub struct SimBackend {
    inner: Arc<Inner>,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    /// Create an emulator with no engines and no host functions.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                engines: Mutex::new(HashMap::new()),
                functions: RwLock::new(HashMap::new()),
                next_engine: AtomicUsize::new(1),
                live: AtomicUsize::new(0),
                refuse: Mutex::new(None),
                commands: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Shared trait-object handle for sessions and arrays.
    pub fn into_ref(self) -> BackendRef {
        Arc::new(self)
    }

    /// Number of arrays currently owned by the host side.
    pub fn live_arrays(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Number of open engines
    pub fn open_engines(&self) -> usize {
        self.inner.engines.lock().len()
    }

    /// Startup commands passed to `open`, oldest first
    pub fn startup_commands(&self) -> Vec<String> {
        self.inner.commands.lock().clone()
    }

    /// Make every open engine fail at the native level from now on.
    pub fn crash_all(&self) {
        for state in self.inner.engines.lock().values_mut() {
            state.crashed = true;
        }
    }

    /// Make subsequent `open` calls fail with `reason`; `None` restores
    /// normal behaviour.
    pub fn refuse_start(&self, reason: Option<StartFailure>) {
        *self.inner.refuse.lock() = reason;
    }

    /// Register a host function under `name`.
    pub fn define_function<F>(&self, name: &str, f: F)
    where
        F: Fn(&[SimArray], usize) -> Result<Vec<SimArray>, SimError> + Send + Sync + 'static,
    {
        self.inner.functions.write().insert(name.to_string(), Arc::new(f));
    }

    fn track_new(&self, array: SimArray) -> Option<RawArray> {
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        RawArray::from_ptr(Box::into_raw(Box::new(array)).cast::<c_void>())
    }

    fn untrack(&self) {
        self.inner.live.fetch_sub(1, Ordering::SeqCst);
    }

    fn engine_id(engine: RawEngine) -> usize {
        engine.as_ptr() as usize
    }
}

/// # Safety
///
/// `array` must be a live handle produced by a `SimBackend`.
unsafe fn sim_ref<'a>(array: RawArray) -> &'a SimArray {
    &*array.as_ptr().cast::<SimArray>()
}

/// # Safety
///
/// Same as [`sim_ref`], with no other reference to the array alive.
unsafe fn sim_mut<'a>(array: RawArray) -> &'a mut SimArray {
    &mut *array.as_ptr().cast::<SimArray>()
}

/// # Safety
///
/// `array` must be an owned handle produced by a `SimBackend`; it is dead
/// afterwards.
unsafe fn sim_take(array: RawArray) -> SimArray {
    *Box::from_raw(array.as_ptr().cast::<SimArray>())
}

fn borrowed(element: &SimArray) -> Option<RawArray> {
    RawArray::from_ptr((element as *const SimArray).cast_mut().cast::<c_void>())
}

impl MxApi for SimBackend {
    fn create_numeric(&self, class: MxClass, dims: &[usize]) -> Option<RawArray> {
        if !class.has_flat_data() || value::checked_numel(class, dims).is_err() {
            return None;
        }
        self.track_new(SimArray::zeros(class, dims))
    }

    fn create_cell(&self, dims: &[usize]) -> Option<RawArray> {
        value::checked_numel(MxClass::Cell, dims).ok()?;
        self.track_new(SimArray::cell(dims))
    }

    fn create_struct(&self, dims: &[usize], fields: &[&str]) -> Option<RawArray> {
        let numel = value::checked_numel(MxClass::Struct, dims).ok()?;
        numel.checked_mul(fields.len())?;
        self.track_new(SimArray::structure(dims, fields))
    }

    unsafe fn destroy(&self, array: RawArray) {
        drop(sim_take(array));
        self.untrack();
    }

    unsafe fn duplicate(&self, array: RawArray) -> Option<RawArray> {
        self.track_new(sim_ref(array).clone())
    }

    unsafe fn class_of(&self, array: RawArray) -> MxClass {
        sim_ref(array).class()
    }

    unsafe fn dims(&self, array: RawArray) -> Vec<usize> {
        sim_ref(array).dims().to_vec()
    }

    unsafe fn data(&self, array: RawArray) -> *mut c_void {
        sim_mut(array).data_ptr().cast::<c_void>()
    }

    unsafe fn cell(&self, array: RawArray, index: usize) -> Option<RawArray> {
        match &sim_ref(array).payload {
            value::Payload::Cells(cells) => cells.get(index)?.as_deref().and_then(borrowed),
            _ => None,
        }
    }

    unsafe fn set_cell(&self, array: RawArray, index: usize, element: RawArray) {
        let element = sim_take(element);
        self.untrack();
        if let Some(slot) = sim_mut(array).cell_slot(index) {
            *slot = Some(Box::new(element));
        }
    }

    unsafe fn field_names(&self, array: RawArray) -> Vec<String> {
        match &sim_ref(array).payload {
            value::Payload::Fields { names, .. } => names.clone(),
            _ => Vec::new(),
        }
    }

    unsafe fn field(&self, array: RawArray, index: usize, name: &str) -> Option<RawArray> {
        sim_ref(array).field(index, name).and_then(borrowed)
    }

    unsafe fn set_field(&self, array: RawArray, index: usize, name: &str, element: RawArray) {
        let element = sim_take(element);
        self.untrack();
        if let Some(slot) = sim_mut(array).field_slot(index, name) {
            *slot = Some(Box::new(element));
        }
    }
}

impl EngineApi for SimBackend {
    fn open(&self, command: &str) -> Result<RawEngine, StartFailure> {
        self.inner.commands.lock().push(command.to_string());
        if let Some(reason) = self.inner.refuse.lock().clone() {
            return Err(reason);
        }
        let id = self.inner.next_engine.fetch_add(1, Ordering::SeqCst);
        let engine = RawEngine::from_ptr(id as *mut c_void).ok_or(StartFailure::Unknown)?;
        self.inner.engines.lock().insert(id, EngineState::default());
        Ok(engine)
    }

    unsafe fn close(&self, engine: RawEngine) -> i32 {
        match self.inner.engines.lock().remove(&Self::engine_id(engine)) {
            Some(state) if state.crashed => 1,
            Some(_) => 0,
            None => 1,
        }
    }

    unsafe fn eval_string(&self, engine: RawEngine, statement: &str) -> i32 {
        let functions = self.inner.functions.read().clone();
        let mut engines = self.inner.engines.lock();
        let Some(state) = engines.get_mut(&Self::engine_id(engine)) else {
            return 1;
        };
        if state.crashed {
            return 1;
        }
        let output = state.workspace.run(&functions, statement);
        state.write_output(&output);
        0
    }

    unsafe fn output_buffer(&self, engine: RawEngine, buffer: *mut u8, len: usize) -> i32 {
        let mut engines = self.inner.engines.lock();
        let Some(state) = engines.get_mut(&Self::engine_id(engine)) else {
            return 1;
        };
        state.output = (!buffer.is_null()).then_some(OutputBuffer { ptr: buffer, len });
        0
    }

    unsafe fn put_variable(&self, engine: RawEngine, name: &str, value: RawArray) -> i32 {
        let mut engines = self.inner.engines.lock();
        let Some(state) = engines.get_mut(&Self::engine_id(engine)) else {
            return 1;
        };
        if state.crashed || !interp::is_identifier(name) {
            return 1;
        }
        let value = sim_take(value);
        self.untrack();
        state.workspace.vars.insert(name.into(), value);
        0
    }

    unsafe fn get_variable(&self, engine: RawEngine, name: &str) -> Option<RawArray> {
        let copy = {
            let engines = self.inner.engines.lock();
            let state = engines.get(&Self::engine_id(engine))?;
            if state.crashed {
                return None;
            }
            state.workspace.vars.get(name)?.clone()
        };
        self.track_new(copy)
    }
}

impl Backend for SimBackend {
    fn name(&self) -> &str {
        "sim"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn eval(sim: &SimBackend, engine: RawEngine, stmt: &str) -> String {
        let mut buf = vec![0u8; 4096];
        unsafe {
            assert_eq!(sim.output_buffer(engine, buf.as_mut_ptr(), buf.len()), 0);
            assert_eq!(sim.eval_string(engine, stmt), 0);
            sim.output_buffer(engine, std::ptr::null_mut(), 0);
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    }

    fn scalar(sim: &SimBackend, engine: RawEngine, name: &str) -> f64 {
        unsafe {
            let raw = sim.get_variable(engine, name).unwrap();
            let v = sim_ref(raw).get(0);
            sim.destroy(raw);
            v
        }
    }

    #[test]
    fn test_namespaces_are_per_engine() {
        let sim = SimBackend::new();
        let a = sim.open("sim").unwrap();
        let b = sim.open("sim").unwrap();
        eval(&sim, a, "x = 1;");
        unsafe {
            assert!(sim.get_variable(a, "x").map(|r| sim.destroy(r)).is_some());
            assert!(sim.get_variable(b, "x").is_none());
            assert_eq!(sim.close(a), 0);
            assert_eq!(sim.close(b), 0);
        }
        assert_eq!(sim.open_engines(), 0);
        assert_eq!(sim.live_arrays(), 0);
    }

    #[test]
    fn test_put_moves_array() {
        let sim = SimBackend::new();
        let e = sim.open("sim").unwrap();
        let raw = sim.create_numeric(MxClass::Double, &[1, 1]).unwrap();
        assert_eq!(sim.live_arrays(), 1);
        unsafe {
            assert_eq!(sim.put_variable(e, "v", raw), 0);
        }
        assert_eq!(sim.live_arrays(), 0);
        assert_eq!(scalar(&sim, e, "v"), 0.0);
        assert_eq!(sim.live_arrays(), 0);
    }

    #[test]
    fn test_put_rejects_bad_name() {
        let sim = SimBackend::new();
        let e = sim.open("sim").unwrap();
        let raw = sim.create_numeric(MxClass::Double, &[1, 1]).unwrap();
        unsafe {
            assert_eq!(sim.put_variable(e, "1bad", raw), 1);
            sim.destroy(raw);
        }
        assert_eq!(sim.live_arrays(), 0);
    }

    #[test]
    fn test_output_is_truncated_and_terminated() {
        let sim = SimBackend::new();
        let e = sim.open("sim").unwrap();
        let mut buf = vec![0xffu8; 4];
        unsafe {
            sim.output_buffer(e, buf.as_mut_ptr(), buf.len());
            sim.eval_string(e, "disp('hello')");
            sim.output_buffer(e, std::ptr::null_mut(), 0);
        }
        assert_eq!(&buf, b"hel\0");
    }

    #[test]
    fn test_language_errors_keep_status_zero() {
        let sim = SimBackend::new();
        let e = sim.open("sim").unwrap();
        let out = eval(&sim, e, "error('MyErr:bad', 'oops')");
        assert_eq!(out, "Error: oops\n");
        eval(&sim, e, "m = MException.last.message;");
        let raw = unsafe { sim.get_variable(e, "m") }.unwrap();
        assert_eq!(unsafe { sim_ref(raw) }.as_string().as_deref(), Some("oops"));
        unsafe { sim.destroy(raw) };
    }

    #[test]
    fn test_crash() {
        let sim = SimBackend::new();
        let e = sim.open("sim").unwrap();
        sim.crash_all();
        unsafe {
            assert_eq!(sim.eval_string(e, "x = 1;"), 1);
            assert_eq!(sim.close(e), 1);
        }
        assert_eq!(sim.open_engines(), 0);
    }

    #[test]
    fn test_refuse_start() {
        let sim = SimBackend::new();
        sim.refuse_start(Some(StartFailure::HelperShellMissing));
        assert_eq!(sim.open("matlab -nosplash").unwrap_err(), StartFailure::HelperShellMissing);
        sim.refuse_start(None);
        assert!(sim.open("matlab -nosplash").is_ok());
        assert_eq!(sim.startup_commands().len(), 2);
    }

    #[test]
    fn test_host_function() {
        let sim = SimBackend::new();
        sim.define_function("twice", |args, _| Ok(vec![SimArray::scalar(args[0].get(0) * 2.0)]));
        let e = sim.open("sim").unwrap();
        eval(&sim, e, "y = twice(21);");
        assert_eq!(scalar(&sim, e, "y"), 42.0);
    }

    #[test]
    fn test_container_ownership() {
        let sim = SimBackend::new();
        let cell = sim.create_cell(&[1, 2]).unwrap();
        let elem = sim.create_numeric(MxClass::Double, &[1, 1]).unwrap();
        assert_eq!(sim.live_arrays(), 2);
        unsafe {
            sim.set_cell(cell, 1, elem);
            assert_eq!(sim.live_arrays(), 1);
            assert!(sim.cell(cell, 0).is_none());
            let borrowed = sim.cell(cell, 1).unwrap();
            assert_eq!(sim.class_of(borrowed), MxClass::Double);
            sim.destroy(cell);
        }
        assert_eq!(sim.live_arrays(), 0);
    }
}

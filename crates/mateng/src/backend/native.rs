//! Binding to the engine's shared libraries
//!
//! `libeng` provides process control and `libmx` the array allocator. Both
//! are loaded at runtime with `libloading`, so the crate builds and its
//! tests run on machines without the engine installed. Locating an
//! installation is left to the caller: pass explicit library paths, or let
//! the platform loader resolve the default library names.
//!
//! The array entry points use the large-array-dims ABI (`_730` suffix),
//! where `mwSize`/`mwIndex` are `size_t`.

use std::ffi::{c_void, CStr, CString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libc::{c_char, c_int, size_t};
use libloading::Library;
use tracing::debug;

use super::{Backend, BackendRef, EngineApi, MxApi, RawArray, RawEngine};
use crate::class::MxClass;
use crate::error::{MatError, MatResult, StartFailure};

type EngOpenFn = unsafe extern "C" fn(*const c_char) -> *mut c_void;
type EngCloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type EngEvalStringFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> c_int;
type EngOutputBufferFn = unsafe extern "C" fn(*mut c_void, *mut c_char, c_int) -> c_int;
type EngPutVariableFn = unsafe extern "C" fn(*mut c_void, *const c_char, *const c_void) -> c_int;
type EngGetVariableFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;

type MxCreateNumericFn = unsafe extern "C" fn(size_t, *const size_t, c_int, c_int) -> *mut c_void;
type MxCreateDimsFn = unsafe extern "C" fn(size_t, *const size_t) -> *mut c_void;
type MxCreateStructFn =
    unsafe extern "C" fn(size_t, *const size_t, c_int, *const *const c_char) -> *mut c_void;
type MxDestroyFn = unsafe extern "C" fn(*mut c_void);
type MxDuplicateFn = unsafe extern "C" fn(*const c_void) -> *mut c_void;
type MxClassIdFn = unsafe extern "C" fn(*const c_void) -> c_int;
type MxNumDimsFn = unsafe extern "C" fn(*const c_void) -> size_t;
type MxDimsFn = unsafe extern "C" fn(*const c_void) -> *const size_t;
type MxDataFn = unsafe extern "C" fn(*const c_void) -> *mut c_void;
type MxGetCellFn = unsafe extern "C" fn(*const c_void, size_t) -> *mut c_void;
type MxSetCellFn = unsafe extern "C" fn(*mut c_void, size_t, *mut c_void);
type MxNumFieldsFn = unsafe extern "C" fn(*const c_void) -> c_int;
type MxFieldNameFn = unsafe extern "C" fn(*const c_void, c_int) -> *const c_char;
type MxGetFieldFn = unsafe extern "C" fn(*const c_void, size_t, *const c_char) -> *mut c_void;
type MxSetFieldFn = unsafe extern "C" fn(*mut c_void, size_t, *const c_char, *mut c_void);

/// `mxREAL`
const MX_REAL: c_int = 0;

struct EngFns {
    open: EngOpenFn,
    close: EngCloseFn,
    eval_string: EngEvalStringFn,
    output_buffer: EngOutputBufferFn,
    put_variable: EngPutVariableFn,
    get_variable: EngGetVariableFn,
}

struct MxFns {
    create_numeric: MxCreateNumericFn,
    create_logical: MxCreateDimsFn,
    create_char: MxCreateDimsFn,
    create_cell: MxCreateDimsFn,
    create_struct: MxCreateStructFn,
    destroy: MxDestroyFn,
    duplicate: MxDuplicateFn,
    class_id: MxClassIdFn,
    num_dims: MxNumDimsFn,
    dims: MxDimsFn,
    data: MxDataFn,
    get_cell: MxGetCellFn,
    set_cell: MxSetCellFn,
    num_fields: MxNumFieldsFn,
    field_name: MxFieldNameFn,
    get_field: MxGetFieldFn,
    set_field: MxSetFieldFn,
}

/// Engine binding backed by the real `libeng` / `libmx`.
pub struct NativeBackend {
    eng: EngFns,
    mx: MxFns,
    // Kept alive for the function pointers above; dropped last.
    _eng_lib: Library,
    _mx_lib: Library,
}

/// Resolve a symbol and copy the function pointer out of the library.
fn symbol<T: Copy>(lib: &Library, library: &str, name: &str) -> MatResult<T> {
    let mut cname = name.as_bytes().to_vec();
    cname.push(0);
    // SAFETY: `T` is one of the function pointer aliases above, matching the
    // C prototype of `name` in the engine's public headers.
    let sym = unsafe { lib.get::<T>(&cname) }
        .map_err(|e| MatError::library_load(library, format!("symbol {}: {}", name, e)))?;
    Ok(*sym)
}

fn open_library(path: &Path) -> MatResult<Library> {
    // SAFETY: loading the engine libraries runs their initialisers; they have
    // no preconditions beyond being the vendor's libraries.
    unsafe { Library::new(path) }.map_err(|e| MatError::library_load(path.display().to_string(), e))
}

fn lib_file(stem: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("lib{}.dll", stem)
    } else if cfg!(target_os = "macos") {
        format!("lib{}.dylib", stem)
    } else {
        format!("lib{}.so", stem)
    }
}

impl NativeBackend {
    /// Load the libraries by their platform default names, leaving the
    /// search to the dynamic loader.
    pub fn load_default() -> MatResult<Self> {
        Self::load(Path::new(&lib_file("eng")), Path::new(&lib_file("mx")))
    }

    /// Load the libraries from an installation's library directory.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> MatResult<Self> {
        let dir = dir.as_ref();
        Self::load(&dir.join(lib_file("eng")), &dir.join(lib_file("mx")))
    }

    /// Load the libraries from explicit paths.
    pub fn load(eng_path: &Path, mx_path: &Path) -> MatResult<Self> {
        let mx_lib = open_library(mx_path)?;
        let eng_lib = open_library(eng_path)?;
        let e = eng_path.display().to_string();
        let m = mx_path.display().to_string();

        let eng = EngFns {
            open: symbol(&eng_lib, &e, "engOpen")?,
            close: symbol(&eng_lib, &e, "engClose")?,
            eval_string: symbol(&eng_lib, &e, "engEvalString")?,
            output_buffer: symbol(&eng_lib, &e, "engOutputBuffer")?,
            put_variable: symbol(&eng_lib, &e, "engPutVariable")?,
            get_variable: symbol(&eng_lib, &e, "engGetVariable")?,
        };
        let mx = MxFns {
            create_numeric: symbol(&mx_lib, &m, "mxCreateNumericArray_730")?,
            create_logical: symbol(&mx_lib, &m, "mxCreateLogicalArray_730")?,
            create_char: symbol(&mx_lib, &m, "mxCreateCharArray_730")?,
            create_cell: symbol(&mx_lib, &m, "mxCreateCellArray_730")?,
            create_struct: symbol(&mx_lib, &m, "mxCreateStructArray_730")?,
            destroy: symbol(&mx_lib, &m, "mxDestroyArray")?,
            duplicate: symbol(&mx_lib, &m, "mxDuplicateArray")?,
            class_id: symbol(&mx_lib, &m, "mxGetClassID")?,
            num_dims: symbol(&mx_lib, &m, "mxGetNumberOfDimensions_730")?,
            dims: symbol(&mx_lib, &m, "mxGetDimensions_730")?,
            data: symbol(&mx_lib, &m, "mxGetData")?,
            get_cell: symbol(&mx_lib, &m, "mxGetCell_730")?,
            set_cell: symbol(&mx_lib, &m, "mxSetCell_730")?,
            num_fields: symbol(&mx_lib, &m, "mxGetNumberOfFields")?,
            field_name: symbol(&mx_lib, &m, "mxGetFieldNameByNumber")?,
            get_field: symbol(&mx_lib, &m, "mxGetField_730")?,
            set_field: symbol(&mx_lib, &m, "mxSetField_730")?,
        };

        debug!("loaded engine libraries {} and {}", e, m);
        Ok(Self {
            eng,
            mx,
            _eng_lib: eng_lib,
            _mx_lib: mx_lib,
        })
    }

    /// Share the binding with sessions and arrays.
    pub fn into_ref(self) -> BackendRef {
        Arc::new(self)
    }
}

/// Best guess at why `engOpen` returned null.
fn diagnose_start_failure(command: &str) -> StartFailure {
    if cfg!(target_os = "windows") {
        return StartFailure::ServerRegistration;
    }
    if !Path::new("/bin/csh").exists() && find_on_path("csh").is_none() {
        return StartFailure::HelperShellMissing;
    }
    let executable = command.split_whitespace().next().unwrap_or_default();
    let found = if executable.contains(std::path::MAIN_SEPARATOR) {
        Path::new(executable).exists()
    } else {
        find_on_path(executable).is_some()
    };
    if !found {
        return StartFailure::ExecutableNotFound {
            executable: executable.to_string(),
        };
    }
    StartFailure::Unknown
}

fn find_on_path(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

impl MxApi for NativeBackend {
    fn create_numeric(&self, class: MxClass, dims: &[usize]) -> Option<RawArray> {
        // SAFETY: `dims` is a valid buffer of `dims.len()` sizes.
        let ptr = unsafe {
            match class {
                MxClass::Logical => (self.mx.create_logical)(dims.len(), dims.as_ptr()),
                MxClass::Char => (self.mx.create_char)(dims.len(), dims.as_ptr()),
                _ => (self.mx.create_numeric)(dims.len(), dims.as_ptr(), class.id(), MX_REAL),
            }
        };
        RawArray::from_ptr(ptr)
    }

    fn create_cell(&self, dims: &[usize]) -> Option<RawArray> {
        // SAFETY: `dims` is a valid buffer of `dims.len()` sizes.
        RawArray::from_ptr(unsafe { (self.mx.create_cell)(dims.len(), dims.as_ptr()) })
    }

    fn create_struct(&self, dims: &[usize], fields: &[&str]) -> Option<RawArray> {
        let names: Vec<CString> = fields
            .iter()
            .map(|f| CString::new(*f))
            .collect::<Result<_, _>>()
            .ok()?;
        let ptrs: Vec<*const c_char> = names.iter().map(|n| n.as_ptr()).collect();
        // SAFETY: both buffers outlive the call; the library copies the names.
        let ptr = unsafe {
            (self.mx.create_struct)(dims.len(), dims.as_ptr(), ptrs.len() as c_int, ptrs.as_ptr())
        };
        RawArray::from_ptr(ptr)
    }

    unsafe fn destroy(&self, array: RawArray) {
        (self.mx.destroy)(array.as_ptr())
    }

    unsafe fn duplicate(&self, array: RawArray) -> Option<RawArray> {
        RawArray::from_ptr((self.mx.duplicate)(array.as_ptr()))
    }

    unsafe fn class_of(&self, array: RawArray) -> MxClass {
        MxClass::from_id((self.mx.class_id)(array.as_ptr()))
    }

    unsafe fn dims(&self, array: RawArray) -> Vec<usize> {
        let n = (self.mx.num_dims)(array.as_ptr());
        let ptr = (self.mx.dims)(array.as_ptr());
        if ptr.is_null() {
            return vec![0, 0];
        }
        std::slice::from_raw_parts(ptr, n).to_vec()
    }

    unsafe fn data(&self, array: RawArray) -> *mut c_void {
        (self.mx.data)(array.as_ptr())
    }

    unsafe fn cell(&self, array: RawArray, index: usize) -> Option<RawArray> {
        RawArray::from_ptr((self.mx.get_cell)(array.as_ptr(), index))
    }

    unsafe fn set_cell(&self, array: RawArray, index: usize, value: RawArray) {
        let old = (self.mx.get_cell)(array.as_ptr(), index);
        (self.mx.set_cell)(array.as_ptr(), index, value.as_ptr());
        if !old.is_null() {
            (self.mx.destroy)(old);
        }
    }

    unsafe fn field_names(&self, array: RawArray) -> Vec<String> {
        let n = (self.mx.num_fields)(array.as_ptr()).max(0);
        (0..n)
            .filter_map(|i| {
                let p = (self.mx.field_name)(array.as_ptr(), i);
                (!p.is_null()).then(|| CStr::from_ptr(p).to_string_lossy().into_owned())
            })
            .collect()
    }

    unsafe fn field(&self, array: RawArray, index: usize, name: &str) -> Option<RawArray> {
        let cname = CString::new(name).ok()?;
        RawArray::from_ptr((self.mx.get_field)(array.as_ptr(), index, cname.as_ptr()))
    }

    unsafe fn set_field(&self, array: RawArray, index: usize, name: &str, value: RawArray) {
        let Ok(cname) = CString::new(name) else {
            (self.mx.destroy)(value.as_ptr());
            return;
        };
        let old = (self.mx.get_field)(array.as_ptr(), index, cname.as_ptr());
        (self.mx.set_field)(array.as_ptr(), index, cname.as_ptr(), value.as_ptr());
        if !old.is_null() {
            (self.mx.destroy)(old);
        }
    }
}

/// Status reported for strings the C API cannot carry (interior NUL).
const STATUS_BAD_STRING: i32 = -1;

impl EngineApi for NativeBackend {
    fn open(&self, command: &str) -> Result<RawEngine, StartFailure> {
        let Ok(ccommand) = CString::new(command) else {
            return Err(StartFailure::Unknown);
        };
        // SAFETY: `ccommand` is a valid NUL-terminated string for the call.
        let ptr = unsafe { (self.eng.open)(ccommand.as_ptr()) };
        RawEngine::from_ptr(ptr).ok_or_else(|| diagnose_start_failure(command))
    }

    unsafe fn close(&self, engine: RawEngine) -> i32 {
        (self.eng.close)(engine.as_ptr())
    }

    unsafe fn eval_string(&self, engine: RawEngine, statement: &str) -> i32 {
        match CString::new(statement) {
            Ok(s) => (self.eng.eval_string)(engine.as_ptr(), s.as_ptr()),
            Err(_) => STATUS_BAD_STRING,
        }
    }

    unsafe fn output_buffer(&self, engine: RawEngine, buffer: *mut u8, len: usize) -> i32 {
        let len = c_int::try_from(len).unwrap_or(c_int::MAX);
        (self.eng.output_buffer)(engine.as_ptr(), buffer.cast(), len)
    }

    unsafe fn put_variable(&self, engine: RawEngine, name: &str, value: RawArray) -> i32 {
        let Ok(cname) = CString::new(name) else {
            return STATUS_BAD_STRING;
        };
        let status = (self.eng.put_variable)(engine.as_ptr(), cname.as_ptr(), value.as_ptr());
        if status == 0 {
            // The engine keeps its own copy; the host block is ours to free.
            (self.mx.destroy)(value.as_ptr());
        }
        status
    }

    unsafe fn get_variable(&self, engine: RawEngine, name: &str) -> Option<RawArray> {
        let cname = CString::new(name).ok()?;
        RawArray::from_ptr((self.eng.get_variable)(engine.as_ptr(), cname.as_ptr()))
    }
}

impl Backend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_names() {
        let name = lib_file("eng");
        assert!(name.starts_with("libeng."));
    }

    #[test]
    fn test_missing_library_is_reported() {
        let result = NativeBackend::load_from_dir("/nonexistent/engine/bin");
        assert!(matches!(result, Err(MatError::LibraryLoad { .. })));
    }

    #[test]
    fn test_find_on_path_rejects_empty() {
        assert!(find_on_path("").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_diagnose_missing_executable() {
        // Only meaningful where the helper shell exists.
        if Path::new("/bin/csh").exists() || find_on_path("csh").is_some() {
            let reason = diagnose_start_failure("definitely-not-an-engine-binary -nosplash");
            assert_eq!(
                reason,
                StartFailure::ExecutableNotFound {
                    executable: "definitely-not-an-engine-binary".to_string()
                }
            );
        }
    }
}

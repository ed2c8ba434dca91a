//! Engine sessions
//!
//! A [`Session`] owns one engine process, its namespace and its output
//! buffer.
//!
//! ## Lifecycle
//!
//! `open` → open session → `close` (terminal). Closing is idempotent and
//! also happens on drop. Every operation on a closed session fails with
//! [`MatError::SessionClosed`].
//!
//! ## Evaluation
//!
//! [`Session::eval_string`] runs one statement synchronously. Text the
//! engine printed is drained from the output buffer and written to the
//! session's output sink (standard output by default) right after the
//! call returns. When exception checking is on, the session then runs a
//! fixed statement that reads and resets the engine's last-error record and
//! turns a non-empty identifier into [`MatError::RemoteComputation`].
//! That statement and the other internal ones go through a plumbing path
//! that is never checked itself.
//!
//! ## Blocking
//!
//! Every call blocks the calling thread until the engine replies. The
//! engine protocol has no cancellation or timeout: a statement that never
//! finishes blocks its caller forever. One session serves one caller at a
//! time; use separate sessions (or `SessionRegistry`'s shared handle) for
//! concurrent work.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::array::MxArray;
use crate::backend::{same_backend, BackendRef, RawEngine};
use crate::config::SessionOptions;
use crate::conversion::{FromMxArray, ToMxArray};
use crate::error::{MatError, MatResult};
use crate::value::HostValue;

const EXCEPTION_MESSAGE_VAR: &str = "mateng_exception_message";
const EXCEPTION_IDENTIFIER_VAR: &str = "mateng_exception_identifier";

const EXCEPTION_CHECK: &str = "mateng_exception_message = MException.last.message; \
mateng_exception_identifier = MException.last.identifier; \
MException.last('reset');";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Check that `name` is a valid engine variable or field name: an ASCII
/// letter followed by ASCII letters, digits or underscores.
pub(crate) fn validate_name(name: &str) -> MatResult<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MatError::invalid_name(name))
    }
}

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A running engine and its namespace.
pub struct Session {
    id: SessionId,
    backend: BackendRef,
    engine: Option<RawEngine>,
    // Mirrors `engine.is_some()` for observers that must not lock the session.
    open: Arc<AtomicBool>,
    buffer: Box<[u8]>,
    check_exceptions: bool,
    sink: Box<dyn Write + Send>,
    last_output: String,
}

// SAFETY: the engine handle is only used through `&mut self`, and the
// output buffer is a heap block owned by the session whose address does not
// change when the session moves.
unsafe impl Send for Session {}

impl Session {
    /// Start an engine with `options`.
    pub fn open(backend: &BackendRef, options: &SessionOptions) -> MatResult<Self> {
        let command = options.startup_command();
        let engine = backend
            .open(&command)
            .map_err(|reason| MatError::engine_start(command.clone(), reason))?;

        let mut session = Session {
            id: SessionId::next(),
            backend: backend.clone(),
            engine: Some(engine),
            open: Arc::new(AtomicBool::new(true)),
            buffer: vec![0u8; options.buffer_size].into_boxed_slice(),
            check_exceptions: options.check_exceptions,
            sink: Box::new(io::stdout()),
            last_output: String::new(),
        };

        if !session.buffer.is_empty() {
            // SAFETY: `engine` is open; the buffer lives until `close`
            // unregisters it.
            let status = unsafe {
                backend.output_buffer(engine, session.buffer.as_mut_ptr(), session.buffer.len())
            };
            if status != 0 {
                // Drop closes the engine.
                drop(session);
                return Err(MatError::engine("engOutputBuffer", status));
            }
        }

        info!(
            session = %session.id,
            backend = backend.name(),
            command = %command,
            buffer_size = options.buffer_size,
            "engine session opened"
        );
        Ok(session)
    }

    /// Shut the engine down. Idempotent; the session is closed afterwards
    /// even when the native call reports a failure.
    pub fn close(&mut self) -> MatResult<()> {
        let Some(engine) = self.engine.take() else {
            return Ok(());
        };
        self.open.store(false, Ordering::SeqCst);
        // SAFETY: `engine` was open until the `take` above; nothing else
        // refers to it now.
        let status = unsafe {
            if !self.buffer.is_empty() {
                self.backend.output_buffer(engine, std::ptr::null_mut(), 0);
            }
            self.backend.close(engine)
        };
        info!(session = %self.id, status, "engine session closed");
        if status != 0 {
            return Err(MatError::engine("engClose", status));
        }
        Ok(())
    }

    /// Session identifier
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Check if the engine is still attached
    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }

    /// Flag that stays `true` until the session is closed, readable
    /// without access to the session itself.
    pub(crate) fn open_flag(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }

    /// The backend driving this session
    pub fn backend(&self) -> &BackendRef {
        &self.backend
    }

    /// Output capture buffer size in bytes
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Whether every public evaluation is followed by the exception check
    pub fn check_exceptions(&self) -> bool {
        self.check_exceptions
    }

    /// Turn the exception check on or off.
    pub fn set_check_exceptions(&mut self, enabled: bool) {
        self.check_exceptions = enabled;
    }

    /// Replace the writer that receives engine output.
    pub fn set_output_sink<W: Write + Send + 'static>(&mut self, sink: W) {
        self.sink = Box::new(sink);
    }

    /// Text printed by the most recent public evaluation
    pub fn last_output(&self) -> &str {
        &self.last_output
    }

    fn engine(&self) -> MatResult<RawEngine> {
        self.engine.ok_or(MatError::SessionClosed)
    }

    /// Evaluate without forwarding output or probing for exceptions.
    /// Returns the native status and the captured text.
    fn eval_captured(&mut self, statement: &str) -> MatResult<(i32, String)> {
        let engine = self.engine()?;
        if let Some(first) = self.buffer.first_mut() {
            *first = 0;
        }
        // SAFETY: `engine` is open.
        let status = unsafe { self.backend.eval_string(engine, statement) };
        let end = self.buffer.iter().position(|&b| b == 0).unwrap_or(self.buffer.len());
        let text = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
        Ok((status, text))
    }

    /// Internal statements: cleanup, exception checks.
    pub(crate) fn eval_plumbing(&mut self, statement: &str) -> MatResult<()> {
        let (status, text) = self.eval_captured(statement)?;
        if !text.is_empty() {
            debug!(session = %self.id, output = %text, "plumbing statement printed output");
        }
        if status != 0 {
            return Err(MatError::engine("engEvalString", status));
        }
        Ok(())
    }

    /// Evaluate one statement, forward its output and, when enabled, raise
    /// any error the engine recorded while running it.
    pub fn eval_string(&mut self, statement: &str) -> MatResult<()> {
        debug!(session = %self.id, statement, "eval");
        let (status, text) = self.eval_captured(statement)?;
        self.forward(text)?;
        if status != 0 {
            return Err(MatError::engine("engEvalString", status));
        }
        if self.check_exceptions {
            self.check_and_clear_exception()?;
        }
        Ok(())
    }

    fn forward(&mut self, text: String) -> MatResult<()> {
        if !text.is_empty() {
            self.sink.write_all(text.as_bytes())?;
            self.sink.flush()?;
        }
        self.last_output = text;
        Ok(())
    }

    /// Read and reset the engine's last-error record. A non-empty
    /// identifier becomes [`MatError::RemoteComputation`].
    pub fn check_and_clear_exception(&mut self) -> MatResult<()> {
        self.eval_plumbing(EXCEPTION_CHECK)?;
        let identifier = self.get_variable(EXCEPTION_IDENTIFIER_VAR).and_then(|a| a.string_value());
        let message = self.get_variable(EXCEPTION_MESSAGE_VAR).and_then(|a| a.string_value());
        self.eval_plumbing(&format!("clear {} {};", EXCEPTION_IDENTIFIER_VAR, EXCEPTION_MESSAGE_VAR))?;

        let identifier = identifier?;
        if identifier.is_empty() {
            return Ok(());
        }
        let message = message?;
        debug!(session = %self.id, identifier = %identifier, message = %message, "engine raised");
        Err(MatError::remote(identifier, message))
    }

    /// Bind `value` to `name`. On success the engine owns the data and
    /// `value` is left transferred; releasing it is a no-op.
    pub fn put_variable(&mut self, name: &str, value: &mut MxArray) -> MatResult<()> {
        validate_name(name)?;
        let engine = self.engine()?;
        if !same_backend(&self.backend, value.backend()) {
            return Err(MatError::InvalidHandle);
        }
        let raw = value.raw()?;
        // SAFETY: `engine` is open and `raw` is a live array this backend
        // allocated and `value` owns.
        let status = unsafe { self.backend.put_variable(engine, name, raw) };
        if status != 0 {
            return Err(MatError::engine("engPutVariable", status));
        }
        value.mark_transferred();
        debug!(session = %self.id, name, "put variable");
        Ok(())
    }

    /// Convert a host value and bind it to `name`.
    pub fn put<T: ToMxArray + ?Sized>(&mut self, name: &str, value: &T) -> MatResult<()> {
        validate_name(name)?;
        let mut array = value.to_mxarray(&self.backend)?;
        self.put_variable(name, &mut array)
    }

    /// Bind several host values.
    pub fn put_all(&mut self, values: &[(&str, &dyn ToMxArray)]) -> MatResult<()> {
        for (name, value) in values {
            self.put(name, *value)?;
        }
        Ok(())
    }

    /// Fresh copy of the value bound to `name`.
    pub fn get_variable(&mut self, name: &str) -> MatResult<MxArray> {
        validate_name(name)?;
        let engine = self.engine()?;
        // SAFETY: `engine` is open.
        let raw = unsafe { self.backend.get_variable(engine, name) }
            .ok_or_else(|| MatError::variable_not_found(name))?;
        debug!(session = %self.id, name, "get variable");
        Ok(MxArray::from_raw(self.backend.clone(), raw))
    }

    /// Read `name` as a host value of type `T`.
    pub fn get<T: FromMxArray>(&mut self, name: &str) -> MatResult<T> {
        T::from_mxarray(&self.get_variable(name)?)
    }

    /// Read several variables with the default host mapping.
    pub fn get_all(&mut self, names: &[&str]) -> MatResult<IndexMap<String, HostValue>> {
        names
            .iter()
            .map(|name| Ok((name.to_string(), self.get::<HostValue>(name)?)))
            .collect()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(session = %self.id, error = %err, "failed to close engine session");
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("open", &self.is_open())
            .field("buffer_size", &self.buffer.len())
            .field("check_exceptions", &self.check_exceptions)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;
    use crate::StartFailure;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn open(sim: &SimBackend) -> Session {
        let mut session = Session::open(&sim.clone().into_ref(), &SessionOptions::default()).unwrap();
        session.set_output_sink(io::sink());
        session
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("x").is_ok());
        assert!(validate_name("mx_f_arg_in_1").is_ok());
        assert!(matches!(validate_name("_x"), Err(MatError::InvalidName { .. })));
        assert!(validate_name("").is_err());
        assert!(validate_name("a-b").is_err());
        assert!(validate_name("1a").is_err());
    }

    #[test]
    fn test_ids_are_unique() {
        let sim = SimBackend::new();
        let a = open(&sim);
        let b = open(&sim);
        assert_ne!(a.id(), b.id());
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_startup_command_is_passed() {
        let sim = SimBackend::new();
        let options = SessionOptions::new().flag_tokens(["-nosplash", "-nojvm"]);
        let _session = Session::open(&sim.clone().into_ref(), &options).unwrap();
        assert_eq!(sim.startup_commands(), vec!["matlab -nosplash -nojvm".to_string()]);
    }

    #[test]
    fn test_start_failure() {
        let sim = SimBackend::new();
        sim.refuse_start(Some(StartFailure::HelperShellMissing));
        let err = Session::open(&sim.into_ref(), &SessionOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            MatError::EngineStart {
                reason: StartFailure::HelperShellMissing,
                ..
            }
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let sim = SimBackend::new();
        let mut session = open(&sim);
        session.close().unwrap();
        session.close().unwrap();
        assert!(!session.is_open());
        assert_eq!(sim.open_engines(), 0);
        assert!(matches!(session.eval_string("x = 1;"), Err(MatError::SessionClosed)));
        assert!(matches!(session.get_variable("x"), Err(MatError::SessionClosed)));
    }

    #[test]
    fn test_close_surfaces_status() {
        let sim = SimBackend::new();
        let mut session = open(&sim);
        sim.crash_all();
        assert!(matches!(
            session.close(),
            Err(MatError::Engine {
                operation: "engClose",
                code: 1
            })
        ));
        assert!(!session.is_open());
    }

    #[test]
    fn test_drop_closes() {
        let sim = SimBackend::new();
        {
            let _session = open(&sim);
            assert_eq!(sim.open_engines(), 1);
        }
        assert_eq!(sim.open_engines(), 0);
    }

    #[test]
    fn test_output_is_forwarded() {
        let sim = SimBackend::new();
        let mut session = open(&sim);
        let capture = Capture::default();
        session.set_output_sink(capture.clone());
        session.eval_string("disp('hello')").unwrap();
        assert_eq!(capture.text(), "hello\n");
        assert_eq!(session.last_output(), "hello\n");
    }

    #[test]
    fn test_output_forwarded_before_exception() {
        let sim = SimBackend::new();
        let mut session = open(&sim);
        let capture = Capture::default();
        session.set_output_sink(capture.clone());
        let err = session.eval_string("disp('before'); error('A:b', 'late')").unwrap_err();
        assert!(err.is_remote());
        assert_eq!(capture.text(), "before\nError: late\n");
    }

    #[test]
    fn test_zero_buffer_disables_capture() {
        let sim = SimBackend::new();
        let options = SessionOptions::new().buffer_size(0);
        let mut session = Session::open(&sim.into_ref(), &options).unwrap();
        let capture = Capture::default();
        session.set_output_sink(capture.clone());
        session.eval_string("disp('hidden')").unwrap();
        assert_eq!(capture.text(), "");
        assert_eq!(session.buffer_size(), 0);
    }

    #[test]
    fn test_exception_check_variables_are_removed() {
        let sim = SimBackend::new();
        let mut session = open(&sim);
        session.eval_string("x = 1;").unwrap();
        assert!(matches!(
            session.get_variable(EXCEPTION_MESSAGE_VAR),
            Err(MatError::VariableNotFound { .. })
        ));
        assert!(matches!(
            session.get_variable(EXCEPTION_IDENTIFIER_VAR),
            Err(MatError::VariableNotFound { .. })
        ));
    }

    #[test]
    fn test_native_eval_failure() {
        let sim = SimBackend::new();
        let mut session = open(&sim);
        sim.crash_all();
        assert!(matches!(
            session.eval_string("x = 1;"),
            Err(MatError::Engine {
                operation: "engEvalString",
                code: 1
            })
        ));
    }

    #[test]
    fn test_put_get() {
        let sim = SimBackend::new();
        let mut session = open(&sim);
        session.put("a", &3.0f64).unwrap();
        session.put("s", "text").unwrap();
        session.eval_string("b = a * 2;").unwrap();
        assert_eq!(session.get::<f64>("b").unwrap(), 6.0);
        assert_eq!(session.get::<String>("s").unwrap(), "text");
        assert!(matches!(session.get::<f64>("zz"), Err(MatError::VariableNotFound { .. })));
        assert!(matches!(session.put("bad name", &1.0f64), Err(MatError::InvalidName { .. })));
    }

    #[test]
    fn test_put_all_get_all() {
        let sim = SimBackend::new();
        let mut session = open(&sim);
        session.put_all(&[("x", &1.5f64), ("name", &"ab")]).unwrap();
        let values = session.get_all(&["x", "name"]).unwrap();
        assert_eq!(values["x"], HostValue::from(1.5));
        assert_eq!(values["name"], HostValue::from("ab"));
    }

    #[test]
    fn test_put_rejects_foreign_array() {
        let sim = SimBackend::new();
        let other = SimBackend::new().into_ref();
        let mut session = open(&sim);
        let mut value = 1.0f64.to_mxarray(&other).unwrap();
        assert!(matches!(
            session.put_variable("x", &mut value),
            Err(MatError::InvalidHandle)
        ));
        assert!(value.is_live());
    }
}

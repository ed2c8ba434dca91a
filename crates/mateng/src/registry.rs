//! Default-session registry
//!
//! Code that does not want to thread a [`Session`] through every call uses
//! a [`SessionRegistry`]: it holds at most one default session, opens it
//! lazily on first use and replaces it when it has been closed.
//!
//! The registry is an ordinary value; create one per application (or per
//! test) and share it by reference. Lazy creation runs under the slot lock,
//! so concurrent first callers all end up with the same session.
//!
//! ## Locking
//!
//! `get_default` and `has_default` never lock the session; they read a
//! flag the session clears when it closes. They can be called while any
//! thread, including the caller, holds the session's guard. The
//! passthroughs (`eval_string`, `put`, ...) and `restart_default` /
//! `close_default` do lock the session, so calling them while holding its
//! guard on the same thread deadlocks. The slot lock is always taken
//! before a session lock, never after.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::array::MxArray;
use crate::backend::BackendRef;
use crate::call::{mxcall, CallOutput};
use crate::config::SessionOptions;
use crate::conversion::ToMxArray;
use crate::error::MatResult;
use crate::session::Session;

/// A session shared between threads; lock it for each operation.
pub type SharedSession = Arc<Mutex<Session>>;

struct DefaultSession {
    session: SharedSession,
    open: Arc<AtomicBool>,
}

impl DefaultSession {
    fn new(session: Session) -> Self {
        Self {
            open: session.open_flag(),
            session: Arc::new(Mutex::new(session)),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Holder of the lazily created default session.
pub struct SessionRegistry {
    backend: BackendRef,
    options: SessionOptions,
    slot: Mutex<Option<DefaultSession>>,
}

impl SessionRegistry {
    /// A registry that opens sessions on `backend` with `options`.
    pub fn new(backend: BackendRef, options: SessionOptions) -> Self {
        Self {
            backend,
            options,
            slot: Mutex::new(None),
        }
    }

    /// Options used for new default sessions
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// The default session, opened now if there is none or the current one
    /// was closed.
    pub fn get_default(&self) -> MatResult<SharedSession> {
        let mut slot = self.slot.lock();
        if let Some(current) = slot.as_ref().filter(|d| d.is_open()) {
            return Ok(current.session.clone());
        }
        let session = Session::open(&self.backend, &self.options)?;
        info!(session = %session.id(), "default session created");
        let current = DefaultSession::new(session);
        let shared = current.session.clone();
        *slot = Some(current);
        Ok(shared)
    }

    /// Close the current default session (if any) and open a replacement
    /// with the given output buffer size.
    pub fn restart_default(&self, buffer_size: usize) -> MatResult<SharedSession> {
        let mut slot = self.slot.lock();
        if let Some(old) = slot.take() {
            old.session.lock().close()?;
        }
        let options = self.options.clone().buffer_size(buffer_size);
        let session = Session::open(&self.backend, &options)?;
        info!(session = %session.id(), buffer_size, "default session restarted");
        let current = DefaultSession::new(session);
        let shared = current.session.clone();
        *slot = Some(current);
        Ok(shared)
    }

    /// Close the default session. A no-op when there is none.
    pub fn close_default(&self) -> MatResult<()> {
        let Some(current) = self.slot.lock().take() else {
            return Ok(());
        };
        let mut session = current.session.lock();
        info!(session = %session.id(), "closing default session");
        session.close()
    }

    /// Check whether a default session currently exists and is open
    pub fn has_default(&self) -> bool {
        self.slot.lock().as_ref().is_some_and(DefaultSession::is_open)
    }

    /// [`Session::eval_string`] on the default session
    pub fn eval_string(&self, statement: &str) -> MatResult<()> {
        self.get_default()?.lock().eval_string(statement)
    }

    /// [`Session::put`] on the default session
    pub fn put<T: ToMxArray + ?Sized>(&self, name: &str, value: &T) -> MatResult<()> {
        self.get_default()?.lock().put(name, value)
    }

    /// [`Session::get_variable`] on the default session
    pub fn get_variable(&self, name: &str) -> MatResult<MxArray> {
        self.get_default()?.lock().get_variable(name)
    }

    /// [`mxcall`] on the default session
    pub fn call(&self, function: &str, nout: usize, args: &[&dyn ToMxArray]) -> MatResult<CallOutput> {
        let session = self.get_default()?;
        let mut session = session.lock();
        mxcall(&mut session, function, nout, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;
    use crate::MatError;

    fn registry(sim: &SimBackend) -> SessionRegistry {
        SessionRegistry::new(sim.clone().into_ref(), SessionOptions::default())
    }

    #[test]
    fn test_lazy_creation() {
        let sim = SimBackend::new();
        let reg = registry(&sim);
        assert!(!reg.has_default());
        assert_eq!(sim.open_engines(), 0);
        let a = reg.get_default().unwrap();
        let b = reg.get_default().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sim.open_engines(), 1);
    }

    #[test]
    fn test_close_then_get_creates_new_session() {
        let sim = SimBackend::new();
        let reg = registry(&sim);
        let first = reg.get_default().unwrap().lock().id();
        reg.close_default().unwrap();
        assert!(!reg.has_default());
        let second = reg.get_default().unwrap().lock().id();
        assert_ne!(first, second);
    }

    #[test]
    fn test_closed_session_is_replaced() {
        let sim = SimBackend::new();
        let reg = registry(&sim);
        let session = reg.get_default().unwrap();
        let first = session.lock().id();
        session.lock().close().unwrap();
        let second = reg.get_default().unwrap().lock().id();
        assert_ne!(first, second);
    }

    #[test]
    fn test_close_default_without_session() {
        let sim = SimBackend::new();
        let reg = registry(&sim);
        reg.close_default().unwrap();
        reg.close_default().unwrap();
    }

    #[test]
    fn test_restart_default() {
        let sim = SimBackend::new();
        let reg = registry(&sim);
        let old = reg.get_default().unwrap();
        let new = reg.restart_default(128).unwrap();
        assert!(!old.lock().is_open());
        assert_eq!(new.lock().buffer_size(), 128);
        assert_eq!(sim.open_engines(), 1);
    }

    #[test]
    fn test_passthroughs() {
        let sim = SimBackend::new();
        let reg = registry(&sim);
        reg.get_default().unwrap().lock().set_output_sink(std::io::sink());
        reg.put("x", &4.0f64).unwrap();
        reg.eval_string("y = x + 1;").unwrap();
        assert_eq!(reg.get_variable("y").unwrap().to_scalar::<f64>().unwrap(), 5.0);
        let err = reg.eval_string("error('R:x', 'bad')").unwrap_err();
        assert!(matches!(err, MatError::RemoteComputation { .. }));
    }

    #[test]
    fn test_lookup_does_not_lock_the_session() {
        let sim = SimBackend::new();
        let reg = registry(&sim);
        let session = reg.get_default().unwrap();
        let mut guard = session.lock();
        assert!(reg.has_default());
        assert!(Arc::ptr_eq(&reg.get_default().unwrap(), &session));

        guard.close().unwrap();
        assert!(!reg.has_default());
        let replacement = reg.get_default().unwrap();
        assert!(!Arc::ptr_eq(&replacement, &session));
        assert_ne!(replacement.lock().id(), guard.id());
    }

    #[test]
    fn test_lookup_while_another_thread_holds_the_session() {
        let sim = SimBackend::new();
        let reg = Arc::new(registry(&sim));
        let session = reg.get_default().unwrap();
        let guard = session.lock();
        let lookup = {
            let reg = reg.clone();
            std::thread::spawn(move || (reg.has_default(), reg.get_default().unwrap()))
        };
        let (has_default, shared) = lookup.join().unwrap();
        assert!(has_default);
        assert!(Arc::ptr_eq(&shared, &session));
        drop(guard);
    }

    #[test]
    fn test_concurrent_first_access_shares_one_session() {
        let sim = SimBackend::new();
        let reg = Arc::new(registry(&sim));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || reg.get_default().unwrap().lock().id())
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(sim.open_engines(), 1);
    }
}

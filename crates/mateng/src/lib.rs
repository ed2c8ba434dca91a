//! # mateng
//!
//! Drive a MATLAB-compatible numerical engine from Rust through its C
//! engine API.
//!
//! ## Overview
//!
//! - Engine arrays with explicit ownership (`MxArray`)
//! - Zero-copy `ndarray` views and deep-copy conversions (`ToMxArray`,
//!   `FromMxArray`, `HostValue`)
//! - Sessions that evaluate statements, capture output and surface engine
//!   errors (`Session`)
//! - A lazily created default session (`SessionRegistry`)
//! - Remote function calls through temporary bindings (`mxcall`)
//!
//! ## Backends
//!
//! The native engine libraries are loaded at runtime
//! ([`backend::native::NativeBackend`]). An in-process emulator
//! (`sim::SimBackend`, behind the `sim` feature) implements the same
//! boundary for tests and for machines without the engine.
//!
//! ## Example
//!
//! ```ignore
//! use mateng::{NativeBackend, Session, SessionOptions};
//!
//! let backend = NativeBackend::load_default()?.into_ref();
//! let mut session = Session::open(&backend, &SessionOptions::default())?;
//! session.put("x", &[1.0, 2.0, 3.0][..])?;
//! session.eval_string("y = sum(x);")?;
//! let y: f64 = session.get("y")?;
//! ```
//!
//! ## Module Structure
//!
//! - [`class`]: engine element classes
//! - [`array`]: engine-allocated arrays and ownership
//! - [`conversion`]: host ↔ engine conversions
//! - [`value`]: default host mapping
//! - [`session`]: engine sessions
//! - [`registry`]: default-session registry
//! - [`call`]: remote function calls
//! - [`script`]: put / evaluate / get in one step
//! - [`config`]: startup options
//! - [`backend`]: the native-call boundary
//! - `sim`: in-process engine emulator (feature `sim`)
//! - [`error`]: error types

pub mod array;
pub mod backend;
pub mod call;
pub mod class;
pub mod config;
pub mod conversion;
pub mod error;
pub mod registry;
pub mod script;
pub mod session;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod value;

// Re-export main types for convenience
pub use array::{MxArray, Ownership};
pub use backend::native::NativeBackend;
pub use backend::{Backend, BackendRef};
pub use call::{call_as, mxcall, temp_name, ArgDirection, CallOutput};
pub use class::MxClass;
pub use config::{SessionOptions, StartupFlags, DEFAULT_BUFFER_SIZE};
pub use conversion::{Element, FromMxArray, ToMxArray};
pub use error::{MatError, MatResult, StartFailure};
pub use registry::{SessionRegistry, SharedSession};
pub use script::Script;
pub use session::{Session, SessionId};
#[cfg(any(test, feature = "sim"))]
pub use sim::{SimArray, SimBackend, SimError};
pub use value::{HostArray, HostValue, Scalar};

//! Put / evaluate / get in one step
//!
//! ```ignore
//! let out = Script::new("z = x + y;")
//!     .input("x", &1.0)
//!     .input("y", &2.0)
//!     .output("z")
//!     .run(&mut session)?;
//! assert_eq!(out["z"].as_f64(), Some(3.0));
//! ```

use indexmap::IndexMap;

use crate::conversion::ToMxArray;
use crate::error::MatResult;
use crate::session::Session;
use crate::value::HostValue;

/// A statement together with the variables it reads and writes.
pub struct Script<'a> {
    statement: String,
    inputs: Vec<(String, &'a dyn ToMxArray)>,
    outputs: Vec<String>,
}

impl<'a> Script<'a> {
    /// Start a script around `statement`.
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Bind `value` to `name` before the statement runs.
    pub fn input(mut self, name: impl Into<String>, value: &'a dyn ToMxArray) -> Self {
        self.inputs.push((name.into(), value));
        self
    }

    /// Read `name` after the statement ran.
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    /// The statement text
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// Put the inputs, evaluate the statement (exception checked when the
    /// session checks) and read the outputs in the order they were
    /// declared.
    pub fn run(&self, session: &mut Session) -> MatResult<IndexMap<String, HostValue>> {
        for (name, value) in &self.inputs {
            session.put(name, *value)?;
        }
        session.eval_string(&self.statement)?;
        self.outputs
            .iter()
            .map(|name| Ok((name.clone(), session.get::<HostValue>(name)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOptions;
    use crate::sim::SimBackend;
    use crate::MatError;
    use pretty_assertions::assert_eq;

    fn open() -> Session {
        let mut session = Session::open(&SimBackend::new().into_ref(), &SessionOptions::default()).unwrap();
        session.set_output_sink(std::io::sink());
        session
    }

    #[test]
    fn test_run() {
        let mut session = open();
        let out = Script::new("z = x + y; w = class(z);")
            .input("x", &1.0f64)
            .input("y", &2.0f64)
            .output("z")
            .output("w")
            .run(&mut session)
            .unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["z", "w"]);
        assert_eq!(out["z"].as_f64(), Some(3.0));
        assert_eq!(out["w"].as_str(), Some("double"));
    }

    #[test]
    fn test_error_propagates() {
        let mut session = open();
        let err = Script::new("z = nosuch(x);")
            .input("x", &1.0f64)
            .output("z")
            .run(&mut session)
            .unwrap_err();
        assert!(matches!(err, MatError::RemoteComputation { .. }));
    }

    #[test]
    fn test_missing_output() {
        let mut session = open();
        let err = Script::new("a = 1;").output("b").run(&mut session).unwrap_err();
        assert!(matches!(err, MatError::VariableNotFound { .. }));
    }
}

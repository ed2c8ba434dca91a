//! Remote function calls
//!
//! [`mxcall`] calls an engine function with host arguments:
//!
//! 1. every argument is copied into the namespace under a temporary name,
//! 2. one statement `[o1, o2] = f(i1, i2);` runs through the public eval
//!    path (so engine errors surface as [`MatError::RemoteComputation`]),
//! 3. the outputs are read back with the default host mapping,
//! 4. every temporary, inputs and outputs alike, is cleared.
//!
//! Temporary names are `mx_<function>_arg_<in|out>_<n>` (1-based), so the
//! cleanup statement can be rebuilt from the call alone even after a
//! partial failure. Cleanup failures are logged and never replace the
//! error that made the call fail.
//!
//! Calls on one session are sequential; two calls of the same function
//! must not interleave on a shared namespace.

use tracing::{debug, warn};

use crate::conversion::{FromMxArray, ToMxArray};
use crate::error::{MatError, MatResult};
use crate::session::Session;
use crate::value::HostValue;

/// Direction of a temporary binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgDirection {
    In,
    Out,
}

impl ArgDirection {
    fn as_str(self) -> &'static str {
        match self {
            ArgDirection::In => "in",
            ArgDirection::Out => "out",
        }
    }
}

/// Temporary variable name for argument `index` (1-based) of `function`.
pub fn temp_name(function: &str, direction: ArgDirection, index: usize) -> String {
    let sanitized: String = function
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("mx_{}_arg_{}_{}", sanitized, direction.as_str(), index)
}

/// Result of a remote call
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutput {
    /// Zero outputs requested
    None,
    /// One output
    Single(HostValue),
    /// Two or more outputs, in order
    Multiple(Vec<HostValue>),
}

impl CallOutput {
    fn from_values(mut values: Vec<HostValue>) -> Self {
        match values.len() {
            0 => CallOutput::None,
            1 => CallOutput::Single(values.remove(0)),
            _ => CallOutput::Multiple(values),
        }
    }

    /// Number of values
    pub fn len(&self) -> usize {
        match self {
            CallOutput::None => 0,
            CallOutput::Single(_) => 1,
            CallOutput::Multiple(values) => values.len(),
        }
    }

    /// Check if the call produced nothing
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The single output
    pub fn single(&self) -> Option<&HostValue> {
        match self {
            CallOutput::Single(value) => Some(value),
            _ => None,
        }
    }

    /// All outputs as a list
    pub fn into_vec(self) -> Vec<HostValue> {
        match self {
            CallOutput::None => Vec::new(),
            CallOutput::Single(value) => vec![value],
            CallOutput::Multiple(values) => values,
        }
    }
}

/// The statement that calls `function` on the given temporaries.
fn call_statement(function: &str, inputs: &[String], outputs: &[String]) -> String {
    let call = format!("{}({})", function, inputs.join(", "));
    match outputs {
        [] => format!("{};", call),
        [one] => format!("{} = {};", one, call),
        many => format!("[{}] = {};", many.join(", "), call),
    }
}

/// Call `function` with `args` and read back `nout` outputs.
pub fn mxcall(session: &mut Session, function: &str, nout: usize, args: &[&dyn ToMxArray]) -> MatResult<CallOutput> {
    let values = call_raw(session, function, nout, args, |session, name| session.get::<HostValue>(name))?;
    Ok(CallOutput::from_values(values))
}

/// Call a one-output function and convert the result to `T`.
pub fn call_as<T: FromMxArray>(session: &mut Session, function: &str, args: &[&dyn ToMxArray]) -> MatResult<T> {
    let mut values = call_raw(session, function, 1, args, |session, name| session.get::<T>(name))?;
    values.pop().ok_or_else(|| MatError::variable_not_found(temp_name(function, ArgDirection::Out, 1)))
}

fn call_raw<T>(
    session: &mut Session,
    function: &str,
    nout: usize,
    args: &[&dyn ToMxArray],
    read: impl Fn(&mut Session, &str) -> MatResult<T>,
) -> MatResult<Vec<T>> {
    if function.is_empty() {
        return Err(MatError::invalid_name(function));
    }
    let inputs: Vec<String> = (1..=args.len())
        .map(|i| temp_name(function, ArgDirection::In, i))
        .collect();
    let outputs: Vec<String> = (1..=nout)
        .map(|i| temp_name(function, ArgDirection::Out, i))
        .collect();

    let result = (|| {
        for (name, value) in inputs.iter().zip(args) {
            session.put(name, *value)?;
        }
        let statement = call_statement(function, &inputs, &outputs);
        debug!(function, nargs = args.len(), nout, "remote call");
        session.eval_string(&statement)?;
        outputs.iter().map(|name| read(session, name)).collect::<MatResult<Vec<T>>>()
    })();

    let temporaries: Vec<&str> = inputs.iter().chain(&outputs).map(String::as_str).collect();
    if !temporaries.is_empty() && session.is_open() {
        if let Err(err) = session.eval_plumbing(&format!("clear {};", temporaries.join(" "))) {
            warn!(function, error = %err, "failed to clear call temporaries");
        }
    }
    result
}

impl Session {
    /// [`mxcall`] on this session
    pub fn call(&mut self, function: &str, nout: usize, args: &[&dyn ToMxArray]) -> MatResult<CallOutput> {
        mxcall(self, function, nout, args)
    }

    /// [`call_as`] on this session
    pub fn call_as<T: FromMxArray>(&mut self, function: &str, args: &[&dyn ToMxArray]) -> MatResult<T> {
        call_as(self, function, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOptions;
    use crate::sim::{SimArray, SimBackend};
    use pretty_assertions::assert_eq;

    fn open(sim: &SimBackend) -> Session {
        let mut session = Session::open(&sim.clone().into_ref(), &SessionOptions::default()).unwrap();
        session.set_output_sink(std::io::sink());
        session
    }

    #[test]
    fn test_temp_names() {
        assert_eq!(temp_name("double", ArgDirection::In, 1), "mx_double_arg_in_1");
        assert_eq!(temp_name("pkg.fn", ArgDirection::Out, 2), "mx_pkg_fn_arg_out_2");
    }

    #[test]
    fn test_statement_shapes() {
        let ins = vec!["a".to_string(), "b".to_string()];
        let outs = vec!["x".to_string(), "y".to_string()];
        assert_eq!(call_statement("f", &ins, &[]), "f(a, b);");
        assert_eq!(call_statement("f", &ins, &outs[..1]), "x = f(a, b);");
        assert_eq!(call_statement("f", &ins, &outs), "[x, y] = f(a, b);");
        assert_eq!(call_statement("g", &[], &[]), "g();");
    }

    #[test]
    fn test_single_output() {
        let sim = SimBackend::new();
        let mut session = open(&sim);
        let out = session.call("sqrt", 1, &[&16.0f64]).unwrap();
        assert_eq!(out, CallOutput::Single(HostValue::from(4.0)));
        assert_eq!(session.call_as::<f64>("abs", &[&-2.5f64]).unwrap(), 2.5);
    }

    #[test]
    fn test_zero_outputs() {
        let sim = SimBackend::new();
        let mut session = open(&sim);
        let out = session.call("disp", 0, &[&"hi"]).unwrap();
        assert!(out.is_empty());
        assert_eq!(session.last_output(), "hi\n");
    }

    #[test]
    fn test_remote_error_still_cleans_up() {
        let sim = SimBackend::new();
        sim.define_function("boom", |_, _| Err(crate::sim::SimError::new("Boom:x", "exploded")));
        let mut session = open(&sim);
        let err = session.call("boom", 1, &[&1.0f64]).unwrap_err();
        assert!(matches!(err, MatError::RemoteComputation { ref identifier, .. } if identifier == "Boom:x"));
        assert!(matches!(
            session.get_variable(&temp_name("boom", ArgDirection::In, 1)),
            Err(MatError::VariableNotFound { .. })
        ));
    }

    #[test]
    fn test_multiple_outputs() {
        let sim = SimBackend::new();
        sim.define_function("pair", |args, _| Ok(vec![args[0].clone(), SimArray::string("second")]));
        let mut session = open(&sim);
        let out = session.call("pair", 2, &[&7.0f64]).unwrap();
        assert_eq!(
            out.into_vec(),
            vec![HostValue::from(7.0), HostValue::from("second")]
        );
    }
}

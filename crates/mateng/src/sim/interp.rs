//! Statement evaluation for the simulated engine

use std::collections::HashMap;
use std::fmt::Write as _;

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::class::MxClass;

use super::parse::{parse, BinOp, Expr, Stmt};
use super::value::{checked_numel, format_number};
use super::{SimArray, SimError, SimFunction};

pub(crate) type FunctionTable = HashMap<String, SimFunction>;

/// Check that `name` is a valid variable name.
pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// One engine namespace plus the last raised error.
#[derive(Debug, Default)]
pub(crate) struct Workspace {
    pub(crate) vars: IndexMap<SmolStr, SimArray>,
    pub(crate) last_error: Option<SimError>,
}

impl Workspace {
    /// Run `src`, returning the text it printed. Execution stops at the
    /// first error, which is recorded as the last error.
    pub(crate) fn run(&mut self, functions: &FunctionTable, src: &str) -> String {
        let mut out = String::new();
        let result = parse(src).and_then(|stmts| {
            let mut interp = Interp {
                ws: &mut *self,
                functions,
                out: &mut out,
            };
            stmts.iter().try_for_each(|stmt| interp.exec(stmt))
        });
        if let Err(err) = result {
            let _ = writeln!(out, "Error: {}", err.message);
            self.last_error = Some(err);
        }
        out
    }
}

fn undefined(name: &str) -> SimError {
    SimError::new(
        "MATLAB:UndefinedFunction",
        format!("Undefined function or variable '{}'.", name),
    )
}

fn too_many_outputs() -> SimError {
    SimError::new("MATLAB:TooManyOutputs", "Too many output arguments.")
}

fn not_enough_inputs() -> SimError {
    SimError::new("MATLAB:minrhs", "Not enough input arguments.")
}

fn too_many_inputs() -> SimError {
    SimError::new("MATLAB:TooManyInputs", "Too many input arguments.")
}

fn dim_mismatch() -> SimError {
    SimError::new("MATLAB:dimagree", "Matrix dimensions must agree.")
}

fn unsupported(what: impl std::fmt::Display) -> SimError {
    SimError::new("SimEngine:unsupported", format!("{} is not supported.", what))
}

fn arity(args: &[SimArray], min: usize, max: usize) -> Result<(), SimError> {
    if args.len() < min {
        return Err(not_enough_inputs());
    }
    if args.len() > max {
        return Err(too_many_inputs());
    }
    Ok(())
}

fn require_flat(a: &SimArray, op: &str) -> Result<(), SimError> {
    if a.is_flat() {
        return Ok(());
    }
    Err(SimError::new(
        "MATLAB:UndefinedFunction",
        format!("Undefined operator '{}' for input arguments of type '{}'.", op, a.class()),
    ))
}

fn walk_fields<'v>(mut value: &'v SimArray, fields: &[String]) -> Result<&'v SimArray, SimError> {
    for name in fields {
        if value.class() != MxClass::Struct {
            return Err(SimError::new(
                "MATLAB:structRefFromNonStruct",
                "Dot indexing is not supported for variables of this type.",
            ));
        }
        value = value.field(0, name).ok_or_else(|| {
            SimError::new(
                "MATLAB:nonExistentField",
                format!("Unrecognized field name \"{}\".", name),
            )
        })?;
    }
    Ok(value)
}

fn assign_path(target: &mut SimArray, path: &[String], value: SimArray) -> Result<(), SimError> {
    let Some((first, rest)) = path.split_first() else {
        *target = value;
        return Ok(());
    };
    if target.class() != MxClass::Struct {
        if target.numel() != 0 {
            return Err(SimError::new(
                "MATLAB:heterogeneousStrucAssignment",
                "Field assignment to a non-structure array object.",
            ));
        }
        *target = SimArray::structure(&[1, 1], &[]);
    }
    if rest.is_empty() {
        target.set_field(first, value);
        return Ok(());
    }
    let mut child = target
        .field(0, first)
        .cloned()
        .unwrap_or_else(|| SimArray::structure(&[1, 1], &[]));
    assign_path(&mut child, rest, value)?;
    target.set_field(first, child);
    Ok(())
}

struct Interp<'a> {
    ws: &'a mut Workspace,
    functions: &'a FunctionTable,
    out: &'a mut String,
}

impl Interp<'_> {
    fn exec(&mut self, stmt: &Stmt) -> Result<(), SimError> {
        match stmt {
            Stmt::Clear(names) => {
                if names.is_empty() {
                    self.ws.vars.clear();
                }
                for name in names {
                    self.ws.vars.shift_remove(name.as_str());
                }
            }
            Stmt::Assign { target, expr, display } => {
                let value = self.eval1(expr)?;
                let root = SmolStr::from(target[0].as_str());
                if target.len() == 1 {
                    self.ws.vars.insert(root.clone(), value);
                } else {
                    let slot = self
                        .ws
                        .vars
                        .entry(root.clone())
                        .or_insert_with(|| SimArray::structure(&[1, 1], &[]));
                    assign_path(slot, &target[1..], value)?;
                }
                if *display {
                    self.show(&root);
                }
            }
            Stmt::MultiAssign { targets, expr, display } => {
                let values = self.eval_multi(expr, targets.len())?;
                if values.len() < targets.len() {
                    return Err(too_many_outputs());
                }
                for (target, value) in targets.iter().zip(values) {
                    if let Some(name) = target {
                        let name = SmolStr::from(name.as_str());
                        self.ws.vars.insert(name.clone(), value);
                        if *display {
                            self.show(&name);
                        }
                    }
                }
            }
            Stmt::Expr { expr, display } => {
                if let Expr::Path(path) = expr {
                    if path.len() == 1 && self.ws.vars.contains_key(path[0].as_str()) {
                        if *display {
                            self.show(&path[0]);
                        }
                        return Ok(());
                    }
                }
                let values = self.eval_multi(expr, 0)?;
                if let Some(value) = values.into_iter().next() {
                    self.ws.vars.insert(SmolStr::new_inline("ans"), value);
                    if *display {
                        self.show("ans");
                    }
                }
            }
        }
        Ok(())
    }

    fn show(&mut self, name: &str) {
        if let Some(value) = self.ws.vars.get(name) {
            self.out.push_str(&value.display(name));
        }
    }

    fn eval_multi(&mut self, expr: &Expr, nargout: usize) -> Result<Vec<SimArray>, SimError> {
        match expr {
            Expr::Call(path, args) => self.call(path, args, nargout),
            Expr::Path(path) => self.call(path, &[], nargout),
            other => Ok(vec![self.eval1(other)?]),
        }
    }

    fn eval1(&mut self, expr: &Expr) -> Result<SimArray, SimError> {
        match expr {
            Expr::Num(v) => Ok(SimArray::scalar(*v)),
            Expr::Str(s) => Ok(SimArray::string(s)),
            Expr::Path(_) | Expr::Call(..) => self
                .eval_multi(expr, 1)?
                .into_iter()
                .next()
                .ok_or_else(too_many_outputs),
            Expr::Matrix(rows) => {
                let mut evaluated = Vec::with_capacity(rows.len());
                for row in rows {
                    let items = row.iter().map(|e| self.eval1(e)).collect::<Result<Vec<_>, _>>()?;
                    evaluated.push(items);
                }
                concat(evaluated)
            }
            Expr::Neg(inner) => {
                let v = self.eval1(inner)?;
                require_flat(&v, "-")?;
                let mut out = SimArray::zeros(v.class(), v.dims());
                for i in 0..v.numel() {
                    out.set(i, -v.get(i));
                }
                Ok(out)
            }
            Expr::Binary(op, lhs, rhs) => {
                let a = self.eval1(lhs)?;
                let b = self.eval1(rhs)?;
                binary(*op, &a, &b)
            }
        }
    }

    fn call(&mut self, path: &[String], args: &[Expr], nargout: usize) -> Result<Vec<SimArray>, SimError> {
        let head = path[0].as_str();

        if self.ws.vars.contains_key(head) {
            let indices = args.iter().map(|e| self.eval1(e)).collect::<Result<Vec<_>, _>>()?;
            let var = &self.ws.vars[head];
            let value = walk_fields(var, &path[1..])?;
            if indices.is_empty() {
                return Ok(vec![value.clone()]);
            }
            return index(value, &indices).map(|v| vec![v]);
        }

        if head == "MException" && path.get(1).map(String::as_str) == Some("last") {
            let args = args.iter().map(|e| self.eval1(e)).collect::<Result<Vec<_>, _>>()?;
            if let Some(arg) = args.first() {
                if path.len() > 2 || arg.as_string().as_deref() != Some("reset") {
                    return Err(unsupported("This use of MException.last"));
                }
                self.ws.last_error = None;
                return Ok(Vec::new());
            }
            let (identifier, message) = self
                .ws
                .last_error
                .as_ref()
                .map(|e| (e.identifier.as_str(), e.message.as_str()))
                .unwrap_or(("", ""));
            let mut last = SimArray::structure(&[1, 1], &["identifier", "message"]);
            last.set_field("identifier", SimArray::string(identifier));
            last.set_field("message", SimArray::string(message));
            return Ok(vec![walk_fields(&last, &path[2..])?.clone()]);
        }

        if path.len() > 1 {
            return Err(undefined(&path.join(".")));
        }

        let args = args.iter().map(|e| self.eval1(e)).collect::<Result<Vec<_>, _>>()?;
        if let Some(f) = self.functions.get(head) {
            return f(&args, nargout);
        }
        builtin(head, &args, nargout, &mut *self.out)?.ok_or_else(|| undefined(head))
    }
}

/// Result class of an arithmetic operation.
fn result_class(a: MxClass, b: MxClass) -> Result<MxClass, SimError> {
    match (a.is_integer(), b.is_integer()) {
        (true, true) if a != b => Err(SimError::new(
            "MATLAB:mixedClasses",
            "Integers can only be combined with integers of the same class, or scalar doubles.",
        )),
        (true, _) => Ok(a),
        (_, true) => Ok(b),
        _ if a == MxClass::Single || b == MxClass::Single => Ok(MxClass::Single),
        _ => Ok(MxClass::Double),
    }
}

fn elementwise(a: &SimArray, b: &SimArray, f: impl Fn(f64, f64) -> f64) -> Result<SimArray, SimError> {
    let class = result_class(a.class(), b.class())?;
    let dims = if a.is_scalar() {
        b.dims()
    } else if b.is_scalar() || a.dims() == b.dims() {
        a.dims()
    } else {
        return Err(dim_mismatch());
    };
    let mut out = SimArray::zeros(class, dims);
    for i in 0..out.numel() {
        let x = if a.is_scalar() { a.get(0) } else { a.get(i) };
        let y = if b.is_scalar() { b.get(0) } else { b.get(i) };
        out.set(i, f(x, y));
    }
    Ok(out)
}

fn matmul(a: &SimArray, b: &SimArray) -> Result<SimArray, SimError> {
    if a.dims().len() > 2 || b.dims().len() > 2 {
        return Err(unsupported("N-dimensional matrix multiplication"));
    }
    let (n, k) = (a.dims()[0], a.dims()[1]);
    let (k2, m) = (b.dims()[0], b.dims()[1]);
    if k != k2 {
        return Err(SimError::new("MATLAB:innerdim", "Inner matrix dimensions must agree."));
    }
    let class = result_class(a.class(), b.class())?;
    let mut out = SimArray::zeros(class, &[n, m]);
    for j in 0..m {
        for i in 0..n {
            let acc: f64 = (0..k).map(|p| a.get(p * n + i) * b.get(j * k + p)).sum();
            out.set(j * n + i, acc);
        }
    }
    Ok(out)
}

fn binary(op: BinOp, a: &SimArray, b: &SimArray) -> Result<SimArray, SimError> {
    let symbol = match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::MatMul => "*",
        BinOp::Div => "/",
        BinOp::Pow => "^",
        BinOp::Mul => ".*",
        BinOp::ElemDiv => "./",
        BinOp::ElemPow => ".^",
    };
    require_flat(a, symbol)?;
    require_flat(b, symbol)?;
    let scalar_operand = a.is_scalar() || b.is_scalar();
    match op {
        BinOp::Add => elementwise(a, b, |x, y| x + y),
        BinOp::Sub => elementwise(a, b, |x, y| x - y),
        BinOp::Mul => elementwise(a, b, |x, y| x * y),
        BinOp::ElemDiv => elementwise(a, b, |x, y| x / y),
        BinOp::ElemPow => elementwise(a, b, f64::powf),
        BinOp::MatMul if scalar_operand => elementwise(a, b, |x, y| x * y),
        BinOp::MatMul => matmul(a, b),
        BinOp::Div if b.is_scalar() => elementwise(a, b, |x, y| x / y),
        BinOp::Pow if a.is_scalar() && b.is_scalar() => elementwise(a, b, f64::powf),
        BinOp::Div | BinOp::Pow => Err(unsupported(format!("Matrix operator '{}'", symbol))),
    }
}

/// Element `index` (1-based) of a flat array, or the elements at a vector
/// of indices. Two scalar subscripts address row and column.
fn index(value: &SimArray, indices: &[SimArray]) -> Result<SimArray, SimError> {
    require_flat(value, "()")?;
    let bad = |i: f64| {
        SimError::new(
            "MATLAB:badsubscript",
            format!("Index {} is out of range for an array of {} elements.", format_number(i), value.numel()),
        )
    };
    let to_linear = |i: f64, limit: usize| -> Result<usize, SimError> {
        if i < 1.0 || i.fract() != 0.0 || i as usize > limit {
            return Err(bad(i));
        }
        Ok(i as usize - 1)
    };
    let picks: Vec<usize> = match indices {
        [linear] => linear
            .to_f64_vec()
            .into_iter()
            .map(|i| to_linear(i, value.numel()))
            .collect::<Result<_, _>>()?,
        [row, col] if row.is_scalar() && col.is_scalar() && value.dims().len() == 2 => {
            let rows = value.dims()[0];
            let r = to_linear(row.get(0), rows)?;
            let c = to_linear(col.get(0), value.dims()[1])?;
            vec![c * rows + r]
        }
        _ => return Err(unsupported("This indexing expression")),
    };
    let dims = if value.dims()[0] == 1 || picks.len() == 1 {
        [1, picks.len()]
    } else {
        [picks.len(), 1]
    };
    let mut out = SimArray::zeros(value.class(), &dims);
    for (k, &i) in picks.iter().enumerate() {
        out.set(k, value.get(i));
    }
    Ok(out)
}

fn concat_class(items: &[&SimArray]) -> Result<MxClass, SimError> {
    if items.iter().any(|a| a.class() == MxClass::Char) {
        return Ok(MxClass::Char);
    }
    if !items.is_empty() && items.iter().all(|a| a.class() == MxClass::Logical) {
        return Ok(MxClass::Logical);
    }
    items.iter().try_fold(MxClass::Double, |acc, a| result_class(acc, a.class()))
}

/// `[a b; c d]`
fn concat(rows: Vec<Vec<SimArray>>) -> Result<SimArray, SimError> {
    let inconsistent = || {
        SimError::new(
            "MATLAB:catenate:dimensionMismatch",
            "Dimensions of arrays being concatenated are not consistent.",
        )
    };
    for item in rows.iter().flatten() {
        if !item.is_flat() {
            return Err(unsupported("Concatenating cell or struct arrays"));
        }
        if item.dims().len() > 2 {
            return Err(unsupported("Concatenating N-dimensional arrays"));
        }
    }
    let all: Vec<&SimArray> = rows.iter().flatten().filter(|a| a.numel() > 0).collect();
    let class = concat_class(&all)?;

    // Horizontal pass: column-major data of a row block is the plain
    // concatenation of its parts.
    let mut blocks: Vec<(usize, usize, Vec<f64>)> = Vec::new();
    for row in &rows {
        let parts: Vec<&SimArray> = row.iter().filter(|a| a.numel() > 0).collect();
        let Some(first) = parts.first() else {
            continue;
        };
        let height = first.dims()[0];
        let mut width = 0;
        let mut data = Vec::new();
        for part in parts {
            if part.dims()[0] != height {
                return Err(inconsistent());
            }
            width += part.dims()[1];
            data.extend(part.to_f64_vec());
        }
        blocks.push((height, width, data));
    }

    let Some(&(_, width, _)) = blocks.first() else {
        return Ok(SimArray::zeros(MxClass::Double, &[0, 0]));
    };
    if blocks.iter().any(|&(_, w, _)| w != width) {
        return Err(inconsistent());
    }
    let height: usize = blocks.iter().map(|(h, _, _)| h).sum();
    let mut out = SimArray::zeros(class, &[height, width]);
    let mut top = 0;
    for (h, _, data) in &blocks {
        for c in 0..width {
            for r in 0..*h {
                out.set(c * height + top + r, data[c * h + r]);
            }
        }
        top += h;
    }
    Ok(out)
}

fn scalar_arg(a: &SimArray) -> Result<f64, SimError> {
    a.scalar_value()
        .ok_or_else(|| SimError::new("MATLAB:expectedScalar", "Expected a scalar argument."))
}

fn string_arg(a: &SimArray) -> Result<String, SimError> {
    a.as_string()
        .ok_or_else(|| SimError::new("MATLAB:expectedString", "Expected a character vector argument."))
}

/// Shape (and optional trailing class name) arguments of `zeros`, `ones`
/// and `cell`.
fn shape_args(args: &[SimArray]) -> Result<(Vec<usize>, MxClass), SimError> {
    let (args, class) = match args.split_last() {
        Some((last, rest)) if last.class() == MxClass::Char => {
            let name = string_arg(last)?;
            let class = MxClass::from_name(&name)
                .filter(|c| c.has_flat_data())
                .ok_or_else(|| SimError::new("MATLAB:invalidClass", format!("Invalid class name '{}'.", name)))?;
            (rest, class)
        }
        _ => (args, MxClass::Double),
    };
    let as_dim = |v: f64| v.max(0.0) as usize;
    let dims = match args {
        [] => vec![1, 1],
        [only] if only.is_scalar() => {
            let n = as_dim(scalar_arg(only)?);
            vec![n, n]
        }
        [only] => only.to_f64_vec().into_iter().map(as_dim).collect(),
        many => many
            .iter()
            .map(|a| scalar_arg(a).map(as_dim))
            .collect::<Result<_, _>>()?,
    };
    checked_numel(class, &dims)?;
    Ok((dims, class))
}

/// printf-style formatting of `%d`, `%i`, `%g`, `%f`, `%s` and `%%`.
fn format_message(template: &str, args: &[SimArray]) -> String {
    let mut out = String::new();
    let mut values = args.iter();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '%' => match chars.next() {
                Some('%') => out.push('%'),
                Some(spec @ ('d' | 'i' | 'g' | 'f' | 's')) => match values.next() {
                    Some(v) if spec == 's' || v.class() == MxClass::Char => {
                        out.push_str(&v.as_string().unwrap_or_else(|| format_number(v.get(0))))
                    }
                    Some(v) if spec == 'f' => {
                        let _ = write!(out, "{:.6}", v.get(0));
                    }
                    Some(v) => out.push_str(&format_number(v.get(0))),
                    None => {}
                },
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            },
            '\\' if chars.peek() == Some(&'n') => {
                chars.next();
                out.push('\n');
            }
            _ => out.push(c),
        }
    }
    out
}

fn map_elements(a: &SimArray, name: &str, f: impl Fn(f64) -> f64) -> Result<SimArray, SimError> {
    require_flat(a, name)?;
    let class = match a.class() {
        MxClass::Char | MxClass::Logical => MxClass::Double,
        other => other,
    };
    let mut out = SimArray::zeros(class, a.dims());
    for i in 0..a.numel() {
        out.set(i, f(a.get(i)));
    }
    Ok(out)
}

/// Built-in functions. `Ok(None)` means `name` is not a builtin.
fn builtin(name: &str, args: &[SimArray], nargout: usize, out: &mut String) -> Result<Option<Vec<SimArray>>, SimError> {
    let one = |v: SimArray| Ok(Some(vec![v]));
    match name {
        "pi" => {
            arity(args, 0, 0)?;
            one(SimArray::scalar(std::f64::consts::PI))
        }
        "zeros" | "ones" => {
            let (dims, class) = shape_args(args)?;
            let mut a = SimArray::zeros(class, &dims);
            if name == "ones" {
                for i in 0..a.numel() {
                    a.set(i, 1.0);
                }
            }
            one(a)
        }
        "cell" => {
            let (dims, _) = shape_args(args)?;
            one(SimArray::cell(&dims))
        }
        "struct" => {
            if args.len() % 2 != 0 {
                return Err(SimError::new("MATLAB:struct:FieldValuePairs", "Field and value input arguments must come in pairs."));
            }
            let mut s = SimArray::structure(&[1, 1], &[]);
            for pair in args.chunks(2) {
                let field = string_arg(&pair[0])?;
                if !is_identifier(&field) {
                    return Err(SimError::new("MATLAB:Cell2Struct:InvalidFieldName", format!("Invalid field name '{}'.", field)));
                }
                s.set_field(&field, pair[1].clone());
            }
            one(s)
        }
        "size" => {
            arity(args, 1, 2)?;
            let dims = args[0].dims();
            if let Some(d) = args.get(1) {
                let d = scalar_arg(d)? as usize;
                let n = if d == 0 { 0 } else { dims.get(d - 1).copied().unwrap_or(1) };
                return one(SimArray::scalar(n as f64));
            }
            if nargout <= 1 {
                let values: Vec<f64> = dims.iter().map(|&d| d as f64).collect();
                return one(SimArray::from_f64(&[1, values.len()], &values));
            }
            let mut outs: Vec<SimArray> = (0..nargout)
                .map(|i| SimArray::scalar(dims.get(i).copied().unwrap_or(1) as f64))
                .collect();
            // The last output absorbs the remaining dimensions.
            let tail: usize = dims.iter().skip(nargout - 1).product();
            if let Some(last) = outs.last_mut() {
                *last = SimArray::scalar(tail as f64);
            }
            Ok(Some(outs))
        }
        "numel" => {
            arity(args, 1, 1)?;
            one(SimArray::scalar(args[0].numel() as f64))
        }
        "length" => {
            arity(args, 1, 1)?;
            let n = if args[0].numel() == 0 { 0 } else { args[0].dims().iter().copied().max().unwrap_or(0) };
            one(SimArray::scalar(n as f64))
        }
        "isempty" => {
            arity(args, 1, 1)?;
            one(SimArray::logical(args[0].numel() == 0))
        }
        "class" => {
            arity(args, 1, 1)?;
            one(SimArray::string(args[0].class().name()))
        }
        "disp" => {
            arity(args, 1, 1)?;
            match args[0].as_string() {
                Some(text) => {
                    out.push_str(&text);
                    out.push('\n');
                }
                None => out.push_str(&args[0].display_body()),
            }
            Ok(Some(Vec::new()))
        }
        "sprintf" => {
            arity(args, 1, usize::MAX)?;
            one(SimArray::string(&format_message(&string_arg(&args[0])?, &args[1..])))
        }
        "error" => {
            arity(args, 1, usize::MAX)?;
            let first = string_arg(&args[0])?;
            let err = if args.len() == 1 {
                SimError::new("", first)
            } else {
                SimError::new(first, format_message(&string_arg(&args[1])?, &args[2..]))
            };
            Err(err)
        }
        "sum" => {
            arity(args, 1, 1)?;
            let a = &args[0];
            require_flat(a, "sum")?;
            let dims = a.dims();
            let class = if a.class().is_numeric() { a.class() } else { MxClass::Double };
            if dims[0] == 1 || dims[1..].iter().all(|&d| d == 1) {
                let mut s = SimArray::zeros(class, &[1, 1]);
                s.set(0, a.to_f64_vec().iter().sum());
                return one(s);
            }
            let rows = dims[0];
            let cols = a.numel() / rows.max(1);
            let mut s = SimArray::zeros(class, &[1, cols]);
            for c in 0..cols {
                s.set(c, (0..rows).map(|r| a.get(c * rows + r)).sum());
            }
            one(s)
        }
        "sqrt" => {
            arity(args, 1, 1)?;
            if args[0].class().is_integer() {
                return Err(SimError::new("MATLAB:UndefinedFunction", format!("Check for incorrect argument data type in call to function 'sqrt'. Argument is of type '{}'.", args[0].class())));
            }
            one(map_elements(&args[0], name, f64::sqrt)?)
        }
        "floor" => {
            arity(args, 1, 1)?;
            one(map_elements(&args[0], name, f64::floor)?)
        }
        "abs" => {
            arity(args, 1, 1)?;
            one(map_elements(&args[0], name, f64::abs)?)
        }
        "mod" => {
            arity(args, 2, 2)?;
            require_flat(&args[0], "mod")?;
            require_flat(&args[1], "mod")?;
            one(elementwise(&args[0], &args[1], |x, y| if y == 0.0 { x } else { x - (x / y).floor() * y })?)
        }
        _ => match MxClass::from_name(name).filter(|c| c.has_flat_data()) {
            Some(class) => {
                arity(args, 1, 1)?;
                one(args[0].cast(class)?)
            }
            None => Ok(None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(ws: &mut Workspace, src: &str) -> String {
        ws.run(&FunctionTable::new(), src)
    }

    fn var(ws: &Workspace, name: &str) -> Vec<f64> {
        ws.vars[name].to_f64_vec()
    }

    #[test]
    fn test_arithmetic() {
        let mut ws = Workspace::default();
        run(&mut ws, "a = 2 + 3 * 4; b = (2 + 3) * 4; c = -2 ^ 2; d = [1 2 3] .* 2;");
        assert_eq!(ws.last_error, None);
        assert_eq!(var(&ws, "a"), vec![14.0]);
        assert_eq!(var(&ws, "b"), vec![20.0]);
        assert_eq!(var(&ws, "c"), vec![-4.0]);
        assert_eq!(var(&ws, "d"), vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_matmul_and_concat() {
        let mut ws = Workspace::default();
        run(&mut ws, "m = [1 2; 3 4]; v = m * [1; 1];");
        assert_eq!(ws.vars["m"].dims(), &[2, 2]);
        assert_eq!(var(&ws, "m"), vec![1.0, 3.0, 2.0, 4.0]);
        assert_eq!(var(&ws, "v"), vec![3.0, 7.0]);
    }

    #[test]
    fn test_integer_class_rules() {
        let mut ws = Workspace::default();
        run(&mut ws, "x = int32(7) / 2;");
        assert_eq!(ws.vars["x"].class(), MxClass::Int32);
        assert_eq!(var(&ws, "x"), vec![4.0]);
        run(&mut ws, "y = int8(1) + int16(1);");
        assert_eq!(ws.last_error.as_ref().map(|e| e.identifier.as_str()), Some("MATLAB:mixedClasses"));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut ws = Workspace::default();
        let out = run(&mut ws, "z = [1 2] + [1 2 3];");
        assert_eq!(out, "Error: Matrix dimensions must agree.\n");
        assert!(!ws.vars.contains_key("z"));
    }

    #[test]
    fn test_error_and_last_exception() {
        let mut ws = Workspace::default();
        run(&mut ws, "error('MyErr:bad', 'value %d too big', 5)");
        let err = ws.last_error.clone().unwrap();
        assert_eq!(err.identifier, "MyErr:bad");
        assert_eq!(err.message, "value 5 too big");

        run(&mut ws, "id = MException.last.identifier; MException.last('reset');");
        assert_eq!(ws.vars["id"].as_string().as_deref(), Some("MyErr:bad"));
        assert_eq!(ws.last_error, None);

        run(&mut ws, "error('oops')");
        assert_eq!(ws.last_error, Some(SimError::new("", "oops")));
    }

    #[test]
    fn test_execution_stops_at_first_error() {
        let mut ws = Workspace::default();
        run(&mut ws, "a = 1; b = nosuch(2); c = 3;");
        assert!(ws.vars.contains_key("a"));
        assert!(!ws.vars.contains_key("c"));
        assert_eq!(ws.last_error.map(|e| e.identifier), Some("MATLAB:UndefinedFunction".to_string()));
    }

    #[test]
    fn test_display() {
        let mut ws = Workspace::default();
        let shown = run(&mut ws, "x = 5");
        assert!(shown.starts_with("x =\n\n"));
        assert_eq!(shown.trim(), "x =\n\n         5");
        assert_eq!(run(&mut ws, "x;"), "");
        assert_eq!(run(&mut ws, "3 + 4;"), "");
        assert_eq!(var(&ws, "ans"), vec![7.0]);
    }

    #[test]
    fn test_struct_fields() {
        let mut ws = Workspace::default();
        run(&mut ws, "s.a = 1; s.b.c = 'hi'; v = s.b.c;");
        assert_eq!(ws.last_error, None);
        assert_eq!(ws.vars["v"].as_string().as_deref(), Some("hi"));
        run(&mut ws, "w = s.missing;");
        assert_eq!(ws.last_error.map(|e| e.identifier), Some("MATLAB:nonExistentField".to_string()));
    }

    #[test]
    fn test_multi_output() {
        let mut ws = Workspace::default();
        run(&mut ws, "m = zeros(2, 3); [r, c] = size(m);");
        assert_eq!(var(&ws, "r"), vec![2.0]);
        assert_eq!(var(&ws, "c"), vec![3.0]);
        run(&mut ws, "[a, b] = numel(m);");
        assert_eq!(ws.last_error.map(|e| e.identifier), Some("MATLAB:TooManyOutputs".to_string()));
    }

    #[test]
    fn test_indexing() {
        let mut ws = Workspace::default();
        run(&mut ws, "m = [1 2; 3 4]; a = m(3); b = m(2, 1); c = m([1 4]);");
        assert_eq!(var(&ws, "a"), vec![2.0]);
        assert_eq!(var(&ws, "b"), vec![3.0]);
        assert_eq!(var(&ws, "c"), vec![1.0, 4.0]);
        run(&mut ws, "d = m(5);");
        assert_eq!(ws.last_error.map(|e| e.identifier), Some("MATLAB:badsubscript".to_string()));
    }

    #[test]
    fn test_oversized_arrays_are_engine_errors() {
        let mut ws = Workspace::default();
        let out = run(&mut ws, "y = zeros(1e20);");
        assert!(out.starts_with("Error: "));
        assert!(!ws.vars.contains_key("y"));
        assert_eq!(
            ws.last_error.take().map(|e| e.identifier),
            Some("MATLAB:array:SizeLimitExceeded".to_string())
        );
        run(&mut ws, "c = cell(1e10, 1e10);");
        assert_eq!(
            ws.last_error.take().map(|e| e.identifier),
            Some("MATLAB:array:SizeLimitExceeded".to_string())
        );
        run(&mut ws, "z = zeros(0, 1e20);");
        assert_eq!(ws.vars["z"].numel(), 0);
    }

    #[test]
    fn test_clear() {
        let mut ws = Workspace::default();
        run(&mut ws, "a = 1; b = 2; c = 3; clear a b;");
        assert_eq!(ws.vars.keys().map(|k| k.as_str()).collect::<Vec<_>>(), vec!["c"]);
        run(&mut ws, "clear");
        assert!(ws.vars.is_empty());
    }

    #[test]
    fn test_mod_and_casts() {
        let mut ws = Workspace::default();
        run(&mut ws, "a = mod(-7, 3); b = uint8(300); c = class(b); d = floor(7 / 2);");
        assert_eq!(var(&ws, "a"), vec![2.0]);
        assert_eq!(var(&ws, "b"), vec![255.0]);
        assert_eq!(ws.vars["c"].as_string().as_deref(), Some("uint8"));
        assert_eq!(var(&ws, "d"), vec![3.0]);
    }

    #[test]
    fn test_identifier() {
        assert!(is_identifier("x_1"));
        assert!(!is_identifier("_x"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier(""));
    }
}

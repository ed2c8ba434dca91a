//! Values held by the simulated engine

use std::fmt::{self, Write as _};

use crate::array::normalize_dims;
use crate::class::MxClass;

use super::SimError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Payload {
    /// Flat column-major buffer; `u64` words keep every element type aligned
    Flat(Vec<u64>),
    Cells(Vec<Option<Box<SimArray>>>),
    Fields {
        names: Vec<String>,
        /// `numel * names.len()` slots, element-major
        values: Vec<Option<Box<SimArray>>>,
    },
}

/// An array as stored by the simulated engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SimArray {
    class: MxClass,
    dims: Vec<usize>,
    pub(crate) payload: Payload,
}

/// Largest allocation the emulator accepts for one array, in bytes.
pub(crate) const MAX_ARRAY_BYTES: usize = 1 << 32;

/// Element count of `dims`, or `SizeLimitExceeded` when the count
/// overflows or the block would exceed [`MAX_ARRAY_BYTES`].
pub(crate) fn checked_numel(class: MxClass, dims: &[usize]) -> Result<usize, SimError> {
    let too_large = || {
        SimError::new(
            "MATLAB:array:SizeLimitExceeded",
            "Requested array exceeds the maximum possible variable size.",
        )
    };
    let numel = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(too_large)?;
    match numel.checked_mul(class.element_size().max(1)) {
        Some(bytes) if bytes <= MAX_ARRAY_BYTES => Ok(numel),
        _ => Err(too_large()),
    }
}

fn words_for(class: MxClass, numel: usize) -> usize {
    (numel * class.element_size()).div_ceil(8)
}

impl SimArray {
    /// Zero-filled array of a flat class.
    pub fn zeros(class: MxClass, dims: &[usize]) -> Self {
        let dims = normalize_dims(dims);
        let numel = dims.iter().product();
        Self {
            class,
            payload: Payload::Flat(vec![0; words_for(class, numel)]),
            dims,
        }
    }

    /// Cell array with every element unset.
    pub fn cell(dims: &[usize]) -> Self {
        let dims = normalize_dims(dims);
        let numel = dims.iter().product();
        Self {
            class: MxClass::Cell,
            payload: Payload::Cells(vec![None; numel]),
            dims,
        }
    }

    /// Struct array with every field unset.
    pub fn structure(dims: &[usize], fields: &[&str]) -> Self {
        let dims = normalize_dims(dims);
        let numel: usize = dims.iter().product();
        Self {
            class: MxClass::Struct,
            payload: Payload::Fields {
                names: fields.iter().map(|f| f.to_string()).collect(),
                values: vec![None; numel * fields.len()],
            },
            dims,
        }
    }

    /// 1-by-1 double.
    pub fn scalar(value: f64) -> Self {
        let mut arr = Self::zeros(MxClass::Double, &[1, 1]);
        arr.set(0, value);
        arr
    }

    /// 1-by-1 logical.
    pub fn logical(value: bool) -> Self {
        let mut arr = Self::zeros(MxClass::Logical, &[1, 1]);
        arr.set(0, if value { 1.0 } else { 0.0 });
        arr
    }

    /// Double array from column-major data.
    pub fn from_f64(dims: &[usize], data: &[f64]) -> Self {
        let mut arr = Self::zeros(MxClass::Double, dims);
        for (i, &v) in data.iter().enumerate().take(arr.numel()) {
            arr.set(i, v);
        }
        arr
    }

    /// Row char array.
    pub fn string(s: &str) -> Self {
        let units: Vec<u16> = s.encode_utf16().collect();
        let dims = if units.is_empty() { [0, 0] } else { [1, units.len()] };
        let mut arr = Self::zeros(MxClass::Char, &dims);
        for (i, u) in units.into_iter().enumerate() {
            arr.set(i, f64::from(u));
        }
        arr
    }

    /// Element class
    pub fn class(&self) -> MxClass {
        self.class
    }

    /// Dimensions
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Check if the array is 1-by-1
    pub fn is_scalar(&self) -> bool {
        self.numel() == 1
    }

    pub(crate) fn is_flat(&self) -> bool {
        matches!(self.payload, Payload::Flat(_))
    }

    pub(crate) fn data_ptr(&mut self) -> *mut u64 {
        match &mut self.payload {
            Payload::Flat(words) if !words.is_empty() => words.as_mut_ptr(),
            _ => std::ptr::null_mut(),
        }
    }

    /// Element `i` widened to `f64`; 0 for containers or out of range.
    pub fn get(&self, i: usize) -> f64 {
        let Payload::Flat(words) = &self.payload else {
            return 0.0;
        };
        if i >= self.numel() {
            return 0.0;
        }
        let p = words.as_ptr().cast::<u8>();
        // SAFETY: `words` holds at least `numel * element_size` bytes, `i` is
        // in range, and the u64 backing keeps every element type aligned.
        unsafe {
            match self.class {
                MxClass::Double => *p.cast::<f64>().add(i),
                MxClass::Single => f64::from(*p.cast::<f32>().add(i)),
                MxClass::Int8 => f64::from(*p.cast::<i8>().add(i)),
                MxClass::UInt8 | MxClass::Logical => f64::from(*p.add(i)),
                MxClass::Int16 => f64::from(*p.cast::<i16>().add(i)),
                MxClass::UInt16 | MxClass::Char => f64::from(*p.cast::<u16>().add(i)),
                MxClass::Int32 => f64::from(*p.cast::<i32>().add(i)),
                MxClass::UInt32 => f64::from(*p.cast::<u32>().add(i)),
                MxClass::Int64 => *p.cast::<i64>().add(i) as f64,
                MxClass::UInt64 => *p.cast::<u64>().add(i) as f64,
                _ => 0.0,
            }
        }
    }

    /// Store `value` at element `i`, rounding and saturating for integer
    /// classes the way the engine does.
    pub fn set(&mut self, i: usize, value: f64) {
        let numel = self.numel();
        let class = self.class;
        let Payload::Flat(words) = &mut self.payload else {
            return;
        };
        if i >= numel {
            return;
        }
        let p = words.as_mut_ptr().cast::<u8>();
        let r = value.round();
        // SAFETY: see `get`; float-to-int `as` casts saturate and map NaN to 0.
        unsafe {
            match class {
                MxClass::Double => *p.cast::<f64>().add(i) = value,
                MxClass::Single => *p.cast::<f32>().add(i) = value as f32,
                MxClass::Logical => *p.add(i) = u8::from(value != 0.0),
                MxClass::Int8 => *p.cast::<i8>().add(i) = r as i8,
                MxClass::UInt8 => *p.add(i) = r as u8,
                MxClass::Int16 => *p.cast::<i16>().add(i) = r as i16,
                MxClass::UInt16 | MxClass::Char => *p.cast::<u16>().add(i) = r as u16,
                MxClass::Int32 => *p.cast::<i32>().add(i) = r as i32,
                MxClass::UInt32 => *p.cast::<u32>().add(i) = r as u32,
                MxClass::Int64 => *p.cast::<i64>().add(i) = r as i64,
                MxClass::UInt64 => *p.cast::<u64>().add(i) = r as u64,
                _ => {}
            }
        }
    }

    /// All elements widened to `f64`
    pub fn to_f64_vec(&self) -> Vec<f64> {
        (0..self.numel()).map(|i| self.get(i)).collect()
    }

    /// The single element of a 1-by-1 flat array
    pub fn scalar_value(&self) -> Option<f64> {
        (self.is_flat() && self.is_scalar()).then(|| self.get(0))
    }

    /// Text of a char array
    pub fn as_string(&self) -> Option<String> {
        if self.class != MxClass::Char {
            return None;
        }
        let units: Vec<u16> = (0..self.numel()).map(|i| self.get(i) as u16).collect();
        Some(String::from_utf16_lossy(&units))
    }

    /// Copy converted to another flat class
    pub fn cast(&self, class: MxClass) -> Result<Self, SimError> {
        if !self.is_flat() || !class.has_flat_data() {
            return Err(SimError::new(
                "MATLAB:invalidConversion",
                format!("Conversion to {} from {} is not possible.", class, self.class),
            ));
        }
        let mut out = Self::zeros(class, &self.dims);
        for i in 0..self.numel() {
            out.set(i, self.get(i));
        }
        Ok(out)
    }

    pub(crate) fn field_index(&self, name: &str) -> Option<usize> {
        match &self.payload {
            Payload::Fields { names, .. } => names.iter().position(|n| n == name),
            _ => None,
        }
    }

    /// Field `name` of element `index`
    pub fn field(&self, index: usize, name: &str) -> Option<&SimArray> {
        let f = self.field_index(name)?;
        match &self.payload {
            Payload::Fields { names, values } => {
                values.get(index * names.len() + f)?.as_deref()
            }
            _ => None,
        }
    }

    pub(crate) fn field_slot(&mut self, index: usize, name: &str) -> Option<&mut Option<Box<SimArray>>> {
        let f = self.field_index(name)?;
        match &mut self.payload {
            Payload::Fields { names, values } => values.get_mut(index * names.len() + f),
            _ => None,
        }
    }

    pub(crate) fn cell_slot(&mut self, index: usize) -> Option<&mut Option<Box<SimArray>>> {
        match &mut self.payload {
            Payload::Cells(cells) => cells.get_mut(index),
            _ => None,
        }
    }

    /// Store a field value, adding the field if needed (1-by-1 structs).
    pub fn set_field(&mut self, name: &str, value: SimArray) {
        if self.field_index(name).is_none() {
            if let Payload::Fields { names, values } = &mut self.payload {
                let old = names.len();
                let numel = values.len().checked_div(old).unwrap_or(1).max(1);
                let mut grown = Vec::with_capacity(numel * (old + 1));
                for e in 0..numel {
                    grown.extend(values[e * old..(e + 1) * old].iter().cloned());
                    grown.push(None);
                }
                names.push(name.to_string());
                *values = grown;
            }
        }
        if let Some(slot) = self.field_slot(0, name) {
            *slot = Some(Box::new(value));
        }
    }

    /// Text the engine prints for `name = value`.
    pub(crate) fn display(&self, name: &str) -> String {
        format!("{} =\n\n{}\n", name, self.display_body())
    }

    pub(crate) fn display_body(&self) -> String {
        let mut out = String::new();
        match &self.payload {
            _ if self.class == MxClass::Char => {
                let _ = writeln!(out, "    '{}'", self.as_string().unwrap_or_default());
            }
            Payload::Flat(_) if self.numel() == 0 => {
                let _ = writeln!(out, "     []");
            }
            Payload::Flat(_) => {
                let rows = self.dims[0];
                let cols = self.numel() / rows.max(1);
                for r in 0..rows {
                    out.push_str("   ");
                    for c in 0..cols {
                        let _ = write!(out, " {:>6}", format_number(self.get(c * rows + r)));
                    }
                    out.push('\n');
                }
            }
            Payload::Cells(cells) => {
                let _ = writeln!(out, "  {{{} cell}}", cells.len());
            }
            Payload::Fields { names, .. } => {
                for n in names {
                    let v = self.field(0, n).map(|v| v.summary()).unwrap_or_default();
                    let _ = writeln!(out, "    {}: {}", n, v);
                }
            }
        }
        out
    }

    fn summary(&self) -> String {
        match self.scalar_value() {
            Some(v) if self.class != MxClass::Char => format_number(v),
            _ if self.class == MxClass::Char => format!("'{}'", self.as_string().unwrap_or_default()),
            _ => format!("[{} {}]", dims_text(&self.dims), self.class),
        }
    }
}

fn dims_text(dims: &[usize]) -> String {
    dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join("x")
}

pub(crate) fn format_number(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{:.4}", v)
    }
}

impl fmt::Display for SimArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_set_rounds_and_saturates() {
        let mut a = SimArray::zeros(MxClass::Int8, &[1, 3]);
        a.set(0, 2.5);
        a.set(1, 1000.0);
        a.set(2, -1000.0);
        assert_eq!(a.to_f64_vec(), vec![3.0, 127.0, -128.0]);
    }

    #[test]
    fn test_string_round_trip() {
        let s = SimArray::string("abc");
        assert_eq!(s.dims(), &[1, 3]);
        assert_eq!(s.as_string().as_deref(), Some("abc"));
    }

    #[test]
    fn test_cast() {
        let a = SimArray::from_f64(&[1, 2], &[1.6, -2.0]);
        let b = a.cast(MxClass::UInt8).unwrap();
        assert_eq!(b.to_f64_vec(), vec![2.0, 0.0]);
        assert!(SimArray::cell(&[1, 1]).cast(MxClass::Double).is_err());
    }

    #[test]
    fn test_struct_grows_fields() {
        let mut s = SimArray::structure(&[1, 1], &["a"]);
        s.set_field("a", SimArray::scalar(1.0));
        s.set_field("b", SimArray::scalar(2.0));
        assert_eq!(s.field(0, "a").and_then(|v| v.scalar_value()), Some(1.0));
        assert_eq!(s.field(0, "b").and_then(|v| v.scalar_value()), Some(2.0));
    }

    #[test]
    fn test_checked_numel() {
        assert_eq!(checked_numel(MxClass::Double, &[2, 3]), Ok(6));
        assert_eq!(checked_numel(MxClass::Double, &[0, usize::MAX]), Ok(0));
        let err = checked_numel(MxClass::Double, &[usize::MAX, usize::MAX]).unwrap_err();
        assert_eq!(err.identifier, "MATLAB:array:SizeLimitExceeded");
        assert!(checked_numel(MxClass::UInt8, &[1, MAX_ARRAY_BYTES + 1]).is_err());
    }

    #[test]
    fn test_display() {
        let a = SimArray::from_f64(&[2, 2], &[1.0, 3.0, 2.0, 4.5]);
        let text = a.display("x");
        assert!(text.starts_with("x =\n\n"));
        assert!(text.contains("4.5000"));
    }
}

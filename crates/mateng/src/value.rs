//! Default host-native mapping
//!
//! [`HostValue`] is what the call dispatcher and the script layer hand back
//! when the caller has not asked for a specific host type. The mapping:
//!
//! | engine value                 | host value                |
//! |------------------------------|---------------------------|
//! | 1-by-1 numeric or logical    | [`HostValue::Scalar`]     |
//! | other numeric or logical     | [`HostValue::Array`]      |
//! | char row                     | [`HostValue::String`]     |
//! | other char arrays            | [`HostValue::CharArray`]  |
//! | cell array                   | [`HostValue::Cell`]       |
//! | 1-by-1 struct                | [`HostValue::Struct`]     |
//! | other struct arrays          | [`HostValue::StructArray`]|
//!
//! Converting back reproduces the same class and shape, so a 1-by-1
//! array read as `Scalar` goes back as a 1-by-1 array.

use std::fmt;

use indexmap::IndexMap;
use ndarray::{ArrayD, Axis, IxDyn, ShapeBuilder};

use crate::array::MxArray;
use crate::backend::BackendRef;
use crate::class::MxClass;
use crate::conversion::{FromMxArray, ToMxArray};
use crate::error::{MatError, MatResult};

/// A single element of any host-convertible class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Double(f64),
    Single(f32),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Logical(bool),
}

impl Scalar {
    /// Engine class of this element
    pub fn class(&self) -> MxClass {
        match self {
            Scalar::Double(_) => MxClass::Double,
            Scalar::Single(_) => MxClass::Single,
            Scalar::Int8(_) => MxClass::Int8,
            Scalar::UInt8(_) => MxClass::UInt8,
            Scalar::Int16(_) => MxClass::Int16,
            Scalar::UInt16(_) => MxClass::UInt16,
            Scalar::Int32(_) => MxClass::Int32,
            Scalar::UInt32(_) => MxClass::UInt32,
            Scalar::Int64(_) => MxClass::Int64,
            Scalar::UInt64(_) => MxClass::UInt64,
            Scalar::Logical(_) => MxClass::Logical,
        }
    }

    /// Value widened to `f64` (64-bit integers may lose precision)
    pub fn as_f64(&self) -> f64 {
        match *self {
            Scalar::Double(v) => v,
            Scalar::Single(v) => f64::from(v),
            Scalar::Int8(v) => f64::from(v),
            Scalar::UInt8(v) => f64::from(v),
            Scalar::Int16(v) => f64::from(v),
            Scalar::UInt16(v) => f64::from(v),
            Scalar::Int32(v) => f64::from(v),
            Scalar::UInt32(v) => f64::from(v),
            Scalar::Int64(v) => v as f64,
            Scalar::UInt64(v) => v as f64,
            Scalar::Logical(v) => f64::from(u8::from(v)),
        }
    }

    fn read(array: &MxArray) -> MatResult<Self> {
        Ok(match array.class()? {
            MxClass::Double => Scalar::Double(array.to_scalar()?),
            MxClass::Single => Scalar::Single(array.to_scalar()?),
            MxClass::Int8 => Scalar::Int8(array.to_scalar()?),
            MxClass::UInt8 => Scalar::UInt8(array.to_scalar()?),
            MxClass::Int16 => Scalar::Int16(array.to_scalar()?),
            MxClass::UInt16 => Scalar::UInt16(array.to_scalar()?),
            MxClass::Int32 => Scalar::Int32(array.to_scalar()?),
            MxClass::UInt32 => Scalar::UInt32(array.to_scalar()?),
            MxClass::Int64 => Scalar::Int64(array.to_scalar()?),
            MxClass::UInt64 => Scalar::UInt64(array.to_scalar()?),
            MxClass::Logical => Scalar::Logical(array.to_scalar()?),
            class => return Err(MatError::UnsupportedElementType { class }),
        })
    }
}

impl ToMxArray for Scalar {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        match self {
            Scalar::Double(v) => v.to_mxarray(backend),
            Scalar::Single(v) => v.to_mxarray(backend),
            Scalar::Int8(v) => v.to_mxarray(backend),
            Scalar::UInt8(v) => v.to_mxarray(backend),
            Scalar::Int16(v) => v.to_mxarray(backend),
            Scalar::UInt16(v) => v.to_mxarray(backend),
            Scalar::Int32(v) => v.to_mxarray(backend),
            Scalar::UInt32(v) => v.to_mxarray(backend),
            Scalar::Int64(v) => v.to_mxarray(backend),
            Scalar::UInt64(v) => v.to_mxarray(backend),
            Scalar::Logical(v) => v.to_mxarray(backend),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Logical(v) => write!(f, "{}", v),
            Scalar::Double(v) => write!(f, "{}", v),
            Scalar::Single(v) => write!(f, "{}", v),
            other => write!(f, "{}", other.as_f64()),
        }
    }
}

/// An owned column-major copy of a numeric or logical array.
#[derive(Debug, Clone, PartialEq)]
pub enum HostArray {
    Double(ArrayD<f64>),
    Single(ArrayD<f32>),
    Int8(ArrayD<i8>),
    UInt8(ArrayD<u8>),
    Int16(ArrayD<i16>),
    UInt16(ArrayD<u16>),
    Int32(ArrayD<i32>),
    UInt32(ArrayD<u32>),
    Int64(ArrayD<i64>),
    UInt64(ArrayD<u64>),
    Logical(ArrayD<bool>),
}

impl HostArray {
    /// Engine class of the elements
    pub fn class(&self) -> MxClass {
        match self {
            HostArray::Double(_) => MxClass::Double,
            HostArray::Single(_) => MxClass::Single,
            HostArray::Int8(_) => MxClass::Int8,
            HostArray::UInt8(_) => MxClass::UInt8,
            HostArray::Int16(_) => MxClass::Int16,
            HostArray::UInt16(_) => MxClass::UInt16,
            HostArray::Int32(_) => MxClass::Int32,
            HostArray::UInt32(_) => MxClass::UInt32,
            HostArray::Int64(_) => MxClass::Int64,
            HostArray::UInt64(_) => MxClass::UInt64,
            HostArray::Logical(_) => MxClass::Logical,
        }
    }

    /// Dimensions
    pub fn shape(&self) -> &[usize] {
        match self {
            HostArray::Double(a) => a.shape(),
            HostArray::Single(a) => a.shape(),
            HostArray::Int8(a) => a.shape(),
            HostArray::UInt8(a) => a.shape(),
            HostArray::Int16(a) => a.shape(),
            HostArray::UInt16(a) => a.shape(),
            HostArray::Int32(a) => a.shape(),
            HostArray::UInt32(a) => a.shape(),
            HostArray::Int64(a) => a.shape(),
            HostArray::UInt64(a) => a.shape(),
            HostArray::Logical(a) => a.shape(),
        }
    }

    /// Copy with every element widened to `f64`
    pub fn to_f64(&self) -> ArrayD<f64> {
        match self {
            HostArray::Double(a) => a.clone(),
            HostArray::Single(a) => a.mapv(f64::from),
            HostArray::Int8(a) => a.mapv(f64::from),
            HostArray::UInt8(a) => a.mapv(f64::from),
            HostArray::Int16(a) => a.mapv(f64::from),
            HostArray::UInt16(a) => a.mapv(f64::from),
            HostArray::Int32(a) => a.mapv(f64::from),
            HostArray::UInt32(a) => a.mapv(f64::from),
            HostArray::Int64(a) => a.mapv(|v| v as f64),
            HostArray::UInt64(a) => a.mapv(|v| v as f64),
            HostArray::Logical(a) => a.mapv(|v| f64::from(u8::from(v))),
        }
    }

    fn read(array: &MxArray) -> MatResult<Self> {
        Ok(match array.class()? {
            MxClass::Double => HostArray::Double(array.to_ndarray()?),
            MxClass::Single => HostArray::Single(array.to_ndarray()?),
            MxClass::Int8 => HostArray::Int8(array.to_ndarray()?),
            MxClass::UInt8 => HostArray::UInt8(array.to_ndarray()?),
            MxClass::Int16 => HostArray::Int16(array.to_ndarray()?),
            MxClass::UInt16 => HostArray::UInt16(array.to_ndarray()?),
            MxClass::Int32 => HostArray::Int32(array.to_ndarray()?),
            MxClass::UInt32 => HostArray::UInt32(array.to_ndarray()?),
            MxClass::Int64 => HostArray::Int64(array.to_ndarray()?),
            MxClass::UInt64 => HostArray::UInt64(array.to_ndarray()?),
            MxClass::Logical => HostArray::Logical(array.to_ndarray()?),
            class => return Err(MatError::UnsupportedElementType { class }),
        })
    }
}

impl ToMxArray for HostArray {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        match self {
            HostArray::Double(a) => a.to_mxarray(backend),
            HostArray::Single(a) => a.to_mxarray(backend),
            HostArray::Int8(a) => a.to_mxarray(backend),
            HostArray::UInt8(a) => a.to_mxarray(backend),
            HostArray::Int16(a) => a.to_mxarray(backend),
            HostArray::UInt16(a) => a.to_mxarray(backend),
            HostArray::Int32(a) => a.to_mxarray(backend),
            HostArray::UInt32(a) => a.to_mxarray(backend),
            HostArray::Int64(a) => a.to_mxarray(backend),
            HostArray::UInt64(a) => a.to_mxarray(backend),
            HostArray::Logical(a) => a.to_mxarray(backend),
        }
    }
}

/// A host copy of any engine value this crate understands.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    /// 1-by-1 numeric or logical
    Scalar(Scalar),
    /// Any other numeric or logical array
    Array(HostArray),
    /// Char row
    String(String),
    /// Char array of any other shape, as UTF-16 code units
    CharArray(ArrayD<u16>),
    /// Cell array; `items` in column-major order
    Cell {
        dims: Vec<usize>,
        items: Vec<HostValue>,
    },
    /// 1-by-1 struct, fields in declaration order
    Struct(IndexMap<String, HostValue>),
    /// Struct array; `elements` in column-major order
    StructArray {
        dims: Vec<usize>,
        elements: Vec<IndexMap<String, HostValue>>,
    },
}

impl HostValue {
    /// Numeric value of a scalar
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            HostValue::Scalar(s) => Some(s.as_f64()),
            _ => None,
        }
    }

    /// Value of a logical scalar
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Scalar(Scalar::Logical(b)) => Some(*b),
            _ => None,
        }
    }

    /// Text of a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Rows of a 2-D char array as strings
    pub fn char_rows(&self) -> Option<Vec<String>> {
        match self {
            HostValue::CharArray(a) if a.ndim() == 2 => Some(
                a.axis_iter(Axis(0))
                    .map(|row| String::from_utf16_lossy(&row.iter().copied().collect::<Vec<u16>>()))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Numeric array
    pub fn as_array(&self) -> Option<&HostArray> {
        match self {
            HostValue::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Fields of a 1-by-1 struct
    pub fn as_struct(&self) -> Option<&IndexMap<String, HostValue>> {
        match self {
            HostValue::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Items of a cell array
    pub fn as_cell(&self) -> Option<&[HostValue]> {
        match self {
            HostValue::Cell { items, .. } => Some(items),
            _ => None,
        }
    }

    /// Field `name` of a 1-by-1 struct
    pub fn field(&self, name: &str) -> Option<&HostValue> {
        self.as_struct()?.get(name)
    }

    /// Engine class this value converts to
    pub fn class(&self) -> MxClass {
        match self {
            HostValue::Scalar(s) => s.class(),
            HostValue::Array(a) => a.class(),
            HostValue::String(_) | HostValue::CharArray(_) => MxClass::Char,
            HostValue::Cell { .. } => MxClass::Cell,
            HostValue::Struct(_) | HostValue::StructArray { .. } => MxClass::Struct,
        }
    }
}

fn read_fields(array: &MxArray, names: &[String], index: usize) -> MatResult<IndexMap<String, HostValue>> {
    names
        .iter()
        .map(|name| Ok((name.clone(), HostValue::from_mxarray(&array.get_field(name, index)?)?)))
        .collect()
}

impl FromMxArray for HostValue {
    fn from_mxarray(array: &MxArray) -> MatResult<Self> {
        let class = array.class()?;
        let dims = array.dims()?;
        let len = array.len()?;
        match class {
            MxClass::Char if is_char_row(&dims, len) => Ok(HostValue::String(array.string_value()?)),
            MxClass::Char => Ok(HostValue::CharArray(read_char_array(array, &dims)?)),
            MxClass::Cell => {
                let items = (0..len)
                    .map(|i| HostValue::from_mxarray(&array.get_cell(i)?))
                    .collect::<MatResult<_>>()?;
                Ok(HostValue::Cell { dims, items })
            }
            MxClass::Struct => {
                let names = array.field_names()?;
                if len == 1 {
                    return Ok(HostValue::Struct(read_fields(array, &names, 0)?));
                }
                let elements = (0..len)
                    .map(|i| read_fields(array, &names, i))
                    .collect::<MatResult<_>>()?;
                Ok(HostValue::StructArray { dims, elements })
            }
            c if c.is_numeric() || c == MxClass::Logical => {
                if len == 1 {
                    Ok(HostValue::Scalar(Scalar::read(array)?))
                } else {
                    Ok(HostValue::Array(HostArray::read(array)?))
                }
            }
            class => Err(MatError::UnsupportedElementType { class }),
        }
    }
}

fn is_char_row(dims: &[usize], len: usize) -> bool {
    dims.len() == 2 && (dims[0] == 1 || len == 0)
}

fn read_char_array(array: &MxArray, dims: &[usize]) -> MatResult<ArrayD<u16>> {
    let units = array.data::<u16>()?.to_vec();
    ArrayD::from_shape_vec(IxDyn(dims).f(), units).map_err(|_| MatError::shape_mismatch("a char array", dims))
}

/// Build a 1-by-1 struct from a field map.
fn struct_from_map(backend: &BackendRef, fields: &IndexMap<String, HostValue>) -> MatResult<MxArray> {
    let names: Vec<&str> = fields.keys().map(String::as_str).collect();
    let mut array = MxArray::struct_array(backend, &[1, 1], &names)?;
    for (name, value) in fields {
        array.set_field(name, 0, value.to_mxarray(backend)?)?;
    }
    Ok(array)
}

impl ToMxArray for IndexMap<String, HostValue> {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        struct_from_map(backend, self)
    }
}

impl ToMxArray for HostValue {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        match self {
            HostValue::Scalar(s) => s.to_mxarray(backend),
            HostValue::Array(a) => a.to_mxarray(backend),
            HostValue::String(s) => MxArray::string(backend, s),
            HostValue::CharArray(a) => {
                let mut array = MxArray::zeros(backend, MxClass::Char, a.shape())?;
                for (dst, src) in array.data_mut::<u16>()?.iter_mut().zip(a.t().iter()) {
                    *dst = *src;
                }
                Ok(array)
            }
            HostValue::Cell { dims, items } => {
                let mut cell = MxArray::cell_array(backend, dims)?;
                if cell.len()? != items.len() {
                    return Err(MatError::shape_mismatch(
                        format!("{} cell elements", items.len()),
                        dims,
                    ));
                }
                for (i, item) in items.iter().enumerate() {
                    cell.set_cell(i, item.to_mxarray(backend)?)?;
                }
                Ok(cell)
            }
            HostValue::Struct(fields) => struct_from_map(backend, fields),
            HostValue::StructArray { dims, elements } => {
                let names: Vec<&str> = elements
                    .first()
                    .map(|e| e.keys().map(String::as_str).collect())
                    .unwrap_or_default();
                let mut array = MxArray::struct_array(backend, dims, &names)?;
                if array.len()? != elements.len() {
                    return Err(MatError::shape_mismatch(
                        format!("{} struct elements", elements.len()),
                        dims,
                    ));
                }
                for (i, element) in elements.iter().enumerate() {
                    for (name, value) in element {
                        array.set_field(name, i, value.to_mxarray(backend)?)?;
                    }
                }
                Ok(array)
            }
        }
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        HostValue::Scalar(Scalar::Double(v))
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        HostValue::Scalar(Scalar::Logical(v))
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<ArrayD<f64>> for HostValue {
    fn from(a: ArrayD<f64>) -> Self {
        HostValue::Array(HostArray::Double(a))
    }
}

impl From<IndexMap<String, HostValue>> for HostValue {
    fn from(fields: IndexMap<String, HostValue>) -> Self {
        HostValue::Struct(fields)
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Scalar(s) => write!(f, "{}", s),
            HostValue::String(s) => write!(f, "'{}'", s),
            HostValue::Array(a) => write!(f, "[{:?} {}]", a.shape(), a.class()),
            HostValue::CharArray(a) => write!(f, "[{:?} char]", a.shape()),
            HostValue::Cell { dims, .. } => write!(f, "{{{:?} cell}}", dims),
            HostValue::Struct(fields) => {
                write!(f, "struct(")?;
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, value)?;
                }
                write!(f, ")")
            }
            HostValue::StructArray { dims, .. } => write!(f, "[{:?} struct]", dims),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;
    use ndarray::arr2;
    use pretty_assertions::assert_eq;

    fn backend() -> BackendRef {
        SimBackend::new().into_ref()
    }

    fn round_trip(b: &BackendRef, value: &HostValue) -> HostValue {
        let mx = value.to_mxarray(b).unwrap();
        HostValue::from_mxarray(&mx).unwrap()
    }

    #[test]
    fn test_one_by_one_maps_to_scalar() {
        let b = backend();
        let v = HostValue::from_mxarray(&7i32.to_mxarray(&b).unwrap()).unwrap();
        assert_eq!(v, HostValue::Scalar(Scalar::Int32(7)));
        assert_eq!(v.as_f64(), Some(7.0));
    }

    #[test]
    fn test_matrix_maps_to_array() {
        let b = backend();
        let host = arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn();
        let v = round_trip(&b, &HostValue::from(host.clone()));
        assert_eq!(v, HostValue::Array(HostArray::Double(host)));
    }

    #[test]
    fn test_nested_containers() {
        let b = backend();
        let mut inner = IndexMap::new();
        inner.insert("name".to_string(), HostValue::from("x"));
        inner.insert("flag".to_string(), HostValue::from(true));
        let value = HostValue::Cell {
            dims: vec![1, 2],
            items: vec![HostValue::from(1.5), HostValue::Struct(inner)],
        };
        assert_eq!(round_trip(&b, &value), value);
    }

    #[test]
    fn test_char_matrix_maps_to_char_array() {
        let b = backend();
        let rows = ndarray::arr2(&[[97u16, 98], [99, 100]]).into_dyn();
        let value = round_trip(&b, &HostValue::CharArray(rows.clone()));
        assert_eq!(value, HostValue::CharArray(rows));
        assert_eq!(value.class(), MxClass::Char);
        assert_eq!(value.char_rows(), Some(vec!["ab".to_string(), "cd".to_string()]));
        assert_eq!(round_trip(&b, &HostValue::from("ab")), HostValue::from("ab"));
    }

    #[test]
    fn test_struct_array() {
        let b = backend();
        let element = |v: f64| {
            let mut m = IndexMap::new();
            m.insert("v".to_string(), HostValue::from(v));
            m
        };
        let value = HostValue::StructArray {
            dims: vec![1, 2],
            elements: vec![element(1.0), element(2.0)],
        };
        assert_eq!(round_trip(&b, &value), value);
    }

    #[test]
    fn test_cell_count_must_match_dims() {
        let b = backend();
        let value = HostValue::Cell {
            dims: vec![2, 2],
            items: vec![HostValue::from(1.0)],
        };
        assert!(matches!(value.to_mxarray(&b).unwrap_err(), MatError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_accessors() {
        let v = HostValue::from("abc");
        assert_eq!(v.as_str(), Some("abc"));
        assert_eq!(v.as_f64(), None);
        assert_eq!(v.class(), MxClass::Char);
        assert_eq!(v.to_string(), "'abc'");
    }
}

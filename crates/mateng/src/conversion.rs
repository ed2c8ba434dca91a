//! Host-Native Conversions
//!
//! Moving values between host arrays and engine arrays.
//!
//! ## Directions
//!
//! - Engine → host, borrowed: [`MxArray::as_view`] and
//!   [`MxArray::as_vector_view`] reinterpret the engine buffer as an
//!   `ndarray` view without copying. Engine arrays are column-major, so the
//!   views are built with Fortran strides.
//! - Engine → host, owned: [`MxArray::to_scalar`], [`MxArray::to_ndarray`],
//!   [`MxArray::to_vec`], [`MxArray::string_value`] and the [`FromMxArray`]
//!   trait.
//! - Host → engine: [`ToMxArray`], always a deep copy into fresh engine
//!   memory.
//!
//! ## Element Types
//!
//! Only classes with a direct host equivalent convert ([`Element`]). No
//! implicit widening or narrowing happens: asking for `f32` from a double
//! array is a [`MatError::ClassMismatch`]. A 1-by-1 array converts both
//! through `to_scalar` and through `as_view`; which one the caller wants is
//! the caller's decision.

use ndarray::{ArrayBase, ArrayD, ArrayView1, ArrayViewD, Data, Dimension, IxDyn, ShapeBuilder};

use crate::array::MxArray;
use crate::backend::BackendRef;
use crate::class::MxClass;
use crate::error::{MatError, MatResult};

mod sealed {
    pub trait Sealed {}
}

// ============================================================================
// Element Types
// ============================================================================

/// A host type whose memory layout matches an engine element class.
///
/// Sealed; implemented for `f64 f32 i8 i16 i32 i64 u8 u16 u32 u64 bool`.
pub trait Element: sealed::Sealed + Copy + PartialEq + std::fmt::Debug + 'static {
    /// The engine class with this layout
    const CLASS: MxClass;
}

macro_rules! impl_element {
    ($($ty:ty => $class:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const CLASS: MxClass = MxClass::$class;
            }

            impl ToMxArray for $ty {
                fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
                    let mut array = MxArray::zeros(backend, MxClass::$class, &[1, 1])?;
                    array.data_mut::<$ty>()?[0] = *self;
                    Ok(array)
                }
            }

            impl FromMxArray for $ty {
                fn from_mxarray(array: &MxArray) -> MatResult<Self> {
                    array.to_scalar::<$ty>()
                }
            }
        )*
    };
}

impl_element! {
    f64 => Double,
    f32 => Single,
    i8 => Int8,
    u8 => UInt8,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    // logical arrays hold one byte per element, 0 or 1
    bool => Logical,
}

/// Check that `array` holds elements of type `T`.
fn check_element<T: Element>(array: &MxArray) -> MatResult<()> {
    let actual = array.class()?;
    if !actual.has_flat_data() || actual == MxClass::Char {
        return Err(MatError::UnsupportedElementType { class: actual });
    }
    if actual != T::CLASS {
        return Err(MatError::ClassMismatch {
            expected: T::CLASS,
            actual,
        });
    }
    Ok(())
}

fn is_vector(dims: &[usize]) -> bool {
    dims.len() == 2 && (dims[0] == 1 || dims[1] == 1)
}

// ============================================================================
// Engine → Host
// ============================================================================

impl MxArray {
    /// Borrow the data as an N-dimensional column-major view.
    pub fn as_view<T: Element>(&self) -> MatResult<ArrayViewD<'_, T>> {
        check_element::<T>(self)?;
        let dims = self.dims()?;
        let data = self.data::<T>()?;
        ArrayViewD::from_shape(IxDyn(&dims).f(), data)
            .map_err(|_| MatError::shape_mismatch("a buffer matching the dimensions", &dims))
    }

    /// Borrow the data of a single row or single column as a 1-D view.
    pub fn as_vector_view<T: Element>(&self) -> MatResult<ArrayView1<'_, T>> {
        check_element::<T>(self)?;
        let dims = self.dims()?;
        if !is_vector(&dims) {
            return Err(MatError::shape_mismatch("a single row or column", &dims));
        }
        Ok(ArrayView1::from(self.data::<T>()?))
    }

    /// The single element of a 1-by-1 array.
    pub fn to_scalar<T: Element>(&self) -> MatResult<T> {
        check_element::<T>(self)?;
        match self.data::<T>()? {
            [value] => Ok(*value),
            _ => Err(MatError::shape_mismatch("exactly one element", &self.dims()?)),
        }
    }

    /// Owned N-dimensional copy.
    pub fn to_ndarray<T: Element>(&self) -> MatResult<ArrayD<T>> {
        Ok(self.as_view::<T>()?.to_owned())
    }

    /// Owned copy of the elements in column-major order.
    pub fn to_vec<T: Element>(&self) -> MatResult<Vec<T>> {
        check_element::<T>(self)?;
        Ok(self.data::<T>()?.to_vec())
    }

    /// Text of a char row (1-by-N, or 0-by-0 for the empty string).
    pub fn string_value(&self) -> MatResult<String> {
        let class = self.class()?;
        if class != MxClass::Char {
            return Err(MatError::ClassMismatch {
                expected: MxClass::Char,
                actual: class,
            });
        }
        let dims = self.dims()?;
        let is_row = dims.len() == 2 && (dims[0] == 1 || dims.iter().product::<usize>() == 0);
        if !is_row {
            return Err(MatError::shape_mismatch("a 1-by-N char row", &dims));
        }
        Ok(String::from_utf16_lossy(self.data::<u16>()?))
    }
}

/// Conversion from an engine array into an owned host value.
pub trait FromMxArray: Sized {
    /// Copy `array` into a host value.
    fn from_mxarray(array: &MxArray) -> MatResult<Self>;
}

impl FromMxArray for String {
    fn from_mxarray(array: &MxArray) -> MatResult<Self> {
        array.string_value()
    }
}

impl<T: Element> FromMxArray for Vec<T> {
    fn from_mxarray(array: &MxArray) -> MatResult<Self> {
        array.to_vec()
    }
}

impl<T: Element> FromMxArray for ArrayD<T> {
    fn from_mxarray(array: &MxArray) -> MatResult<Self> {
        array.to_ndarray()
    }
}

// ============================================================================
// Host → Engine
// ============================================================================

/// Conversion from a host value into freshly allocated engine memory.
///
/// Object safe, so mixed argument lists can be passed as
/// `&[&dyn ToMxArray]`.
pub trait ToMxArray {
    /// Deep-copy `self` into a new array owned by the caller.
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray>;
}

impl<T: ToMxArray + ?Sized> ToMxArray for &T {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        (**self).to_mxarray(backend)
    }
}

impl ToMxArray for str {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        MxArray::string(backend, self)
    }
}

impl ToMxArray for String {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        MxArray::string(backend, self)
    }
}

/// Slices become n-by-1 columns.
impl<T: Element> ToMxArray for [T] {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        let mut array = MxArray::zeros(backend, T::CLASS, &[self.len(), 1])?;
        array.data_mut::<T>()?.copy_from_slice(self);
        Ok(array)
    }
}

impl<T: Element> ToMxArray for Vec<T> {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        self.as_slice().to_mxarray(backend)
    }
}

/// A list of strings becomes a 1-by-n cell array of char rows.
impl ToMxArray for [String] {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        let mut cell = MxArray::cell_array(backend, &[1, self.len()])?;
        for (i, s) in self.iter().enumerate() {
            cell.set_cell(i, MxArray::string(backend, s)?)?;
        }
        Ok(cell)
    }
}

impl ToMxArray for Vec<String> {
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        self.as_slice().to_mxarray(backend)
    }
}

/// `ndarray` arrays of any dimension keep their shape; 0-d arrays become
/// 1-by-1 and 1-d arrays become columns.
impl<T, S, D> ToMxArray for ArrayBase<S, D>
where
    T: Element,
    S: Data<Elem = T>,
    D: Dimension,
{
    fn to_mxarray(&self, backend: &BackendRef) -> MatResult<MxArray> {
        let mut array = MxArray::zeros(backend, T::CLASS, self.shape())?;
        // Row-major iteration of the transpose visits the original in
        // column-major order.
        for (dst, src) in array.data_mut::<T>()?.iter_mut().zip(self.t().iter()) {
            *dst = *src;
        }
        Ok(array)
    }
}

impl MxArray {
    /// Deep copy of a host value into engine memory.
    pub fn from_host<T: ToMxArray + ?Sized>(backend: &BackendRef, value: &T) -> MatResult<Self> {
        value.to_mxarray(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;
    use ndarray::{arr2, Array3};
    use pretty_assertions::assert_eq;

    fn backend() -> BackendRef {
        SimBackend::new().into_ref()
    }

    #[test]
    fn test_matrix_is_column_major() {
        let b = backend();
        let host = arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn();
        let mx = host.to_mxarray(&b).unwrap();
        assert_eq!(mx.dims().unwrap(), vec![2, 3]);
        assert_eq!(mx.to_vec::<f64>().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(mx.as_view::<f64>().unwrap(), host.view());
    }

    #[test]
    fn test_round_trip_three_dims() {
        let b = backend();
        let host = Array3::from_shape_fn((2, 3, 4), |(i, j, k)| (i * 100 + j * 10 + k) as i32).into_dyn();
        let mx = host.to_mxarray(&b).unwrap();
        assert_eq!(mx.class().unwrap(), MxClass::Int32);
        assert_eq!(mx.to_ndarray::<i32>().unwrap(), host);
    }

    #[test]
    fn test_one_by_one_is_both_scalar_and_matrix() {
        let b = backend();
        let mx = 2.5f64.to_mxarray(&b).unwrap();
        assert_eq!(mx.to_scalar::<f64>().unwrap(), 2.5);
        let view = mx.as_view::<f64>().unwrap();
        assert_eq!(view.shape(), &[1, 1]);
        assert_eq!(view.iter().copied().collect::<Vec<_>>(), vec![2.5]);
    }

    #[test]
    fn test_scalar_requires_one_element() {
        let b = backend();
        let mx = vec![1.0f64, 2.0].to_mxarray(&b).unwrap();
        let err = mx.to_scalar::<f64>().unwrap_err();
        assert!(matches!(err, MatError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_no_implicit_widening() {
        let b = backend();
        let mx = 3i16.to_mxarray(&b).unwrap();
        let err = mx.to_scalar::<i32>().unwrap_err();
        assert!(matches!(
            err,
            MatError::ClassMismatch {
                expected: MxClass::Int32,
                actual: MxClass::Int16
            }
        ));
        assert_eq!(mx.to_scalar::<i16>().unwrap(), 3);
    }

    #[test]
    fn test_char_and_cells_have_no_element_type() {
        let b = backend();
        let s = "abc".to_mxarray(&b).unwrap();
        assert!(matches!(
            s.as_view::<u16>().unwrap_err(),
            MatError::UnsupportedElementType { class: MxClass::Char }
        ));
        let c = MxArray::cell_array(&b, &[1, 2]).unwrap();
        assert!(c.to_vec::<f64>().unwrap_err().is_conversion_error());
    }

    #[test]
    fn test_vector_view() {
        let b = backend();
        let col = vec![1u8, 2, 3].to_mxarray(&b).unwrap();
        assert_eq!(col.dims().unwrap(), vec![3, 1]);
        assert_eq!(col.as_vector_view::<u8>().unwrap().to_vec(), vec![1, 2, 3]);

        let m = arr2(&[[1u8, 2], [3, 4]]).to_mxarray(&b).unwrap();
        assert!(matches!(
            m.as_vector_view::<u8>().unwrap_err(),
            MatError::ShapeMismatch { .. }
        ));
    }

    #[test]
    fn test_logical() {
        let b = backend();
        let mx = vec![true, false, true].to_mxarray(&b).unwrap();
        assert!(mx.is_logical().unwrap());
        assert_eq!(Vec::<bool>::from_mxarray(&mx).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_strings() {
        let b = backend();
        let mx = MxArray::from_host(&b, "héllo").unwrap();
        assert_eq!(String::from_mxarray(&mx).unwrap(), "héllo");
        let empty = String::new().to_mxarray(&b).unwrap();
        assert_eq!(empty.string_value().unwrap(), "");
        let number = 1.0f64.to_mxarray(&b).unwrap();
        assert!(matches!(number.string_value().unwrap_err(), MatError::ClassMismatch { .. }));
    }

    #[test]
    fn test_string_list_is_cell_row() {
        let b = backend();
        let names = vec!["a".to_string(), "bc".to_string()];
        let cell = names.to_mxarray(&b).unwrap();
        assert!(cell.is_cell().unwrap());
        assert_eq!(cell.dims().unwrap(), vec![1, 2]);
        assert_eq!(cell.get_cell(1).unwrap().string_value().unwrap(), "bc");
    }

    #[test]
    fn test_views_fail_after_transfer() {
        let b = backend();
        let mut mx = 1.0f64.to_mxarray(&b).unwrap();
        mx.release();
        assert!(matches!(mx.as_view::<f64>().unwrap_err(), MatError::InvalidHandle));
    }
}

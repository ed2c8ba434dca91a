//! Engine-allocated arrays
//!
//! An [`MxArray`] wraps a handle to memory allocated by the engine library
//! together with an explicit ownership state:
//!
//! - `Owned`: the wrapper frees the block when released or dropped
//! - `Transferred`: the value was handed to a session's namespace; the
//!   engine's own memory manager is responsible for it now
//! - `Released`: the block was freed
//!
//! Only `Owned` arrays hold a live handle. Every accessor on a transferred
//! or released array fails with [`MatError::InvalidHandle`], and releasing
//! it again is a no-op.
//!
//! Engine arrays are column-major and always have at least two dimensions.

use std::ffi::c_void;
use std::fmt;

use crate::backend::{same_backend, BackendRef, RawArray};
use crate::class::MxClass;
use crate::error::{MatError, MatResult};

/// Who is responsible for freeing an array's memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The wrapper owns the block
    Owned,
    /// Handed to a session namespace
    Transferred,
    /// Freed
    Released,
}

/// Handle to an engine-allocated array.
pub struct MxArray {
    raw: Option<RawArray>,
    backend: BackendRef,
    ownership: Ownership,
}

// SAFETY: the handle is only dereferenced through `&self`/`&mut self`, and
// `MxArray` is not `Sync`, so at most one thread touches the block at a time.
unsafe impl Send for MxArray {}

/// Pad a shape to the engine's minimum of two dimensions.
pub(crate) fn normalize_dims(dims: &[usize]) -> Vec<usize> {
    let mut dims = dims.to_vec();
    while dims.len() < 2 {
        dims.push(1);
    }
    dims
}

impl MxArray {
    /// Wrap a handle the caller owns.
    pub(crate) fn from_raw(backend: BackendRef, raw: RawArray) -> Self {
        Self {
            raw: Some(raw),
            backend,
            ownership: Ownership::Owned,
        }
    }

    /// Allocate a zero-filled array of a class with a flat data buffer.
    ///
    /// Shapes with fewer than two dimensions are padded with 1s, so `[n]`
    /// becomes an `n`-by-1 column.
    pub fn zeros(backend: &BackendRef, class: MxClass, dims: &[usize]) -> MatResult<Self> {
        if !class.has_flat_data() {
            return Err(MatError::UnsupportedElementType { class });
        }
        let dims = normalize_dims(dims);
        let raw = backend
            .create_numeric(class, &dims)
            .ok_or_else(|| MatError::allocation_failed(format!("{} array {:?}", class, dims)))?;
        Ok(Self::from_raw(backend.clone(), raw))
    }

    /// A 0-by-0 double array.
    pub fn empty(backend: &BackendRef) -> MatResult<Self> {
        Self::zeros(backend, MxClass::Double, &[0, 0])
    }

    /// A 1-by-N char array holding `s` as UTF-16 code units.
    pub fn string(backend: &BackendRef, s: &str) -> MatResult<Self> {
        let units: Vec<u16> = s.encode_utf16().collect();
        let dims = if units.is_empty() { [0, 0] } else { [1, units.len()] };
        let mut arr = Self::zeros(backend, MxClass::Char, &dims)?;
        arr.data_mut::<u16>()?.copy_from_slice(&units);
        Ok(arr)
    }

    /// A cell array whose elements are all empty.
    pub fn cell_array(backend: &BackendRef, dims: &[usize]) -> MatResult<Self> {
        let dims = normalize_dims(dims);
        let raw = backend
            .create_cell(&dims)
            .ok_or_else(|| MatError::allocation_failed(format!("cell array {:?}", dims)))?;
        Ok(Self::from_raw(backend.clone(), raw))
    }

    /// A struct array with the given fields, all empty.
    pub fn struct_array(backend: &BackendRef, dims: &[usize], fields: &[&str]) -> MatResult<Self> {
        for field in fields {
            crate::session::validate_name(field)?;
        }
        let dims = normalize_dims(dims);
        let raw = backend
            .create_struct(&dims, fields)
            .ok_or_else(|| MatError::allocation_failed(format!("struct array {:?}", dims)))?;
        Ok(Self::from_raw(backend.clone(), raw))
    }

    /// The live handle, or `InvalidHandle`.
    pub fn raw(&self) -> MatResult<RawArray> {
        self.raw.ok_or(MatError::InvalidHandle)
    }

    /// The backend that allocated this array
    pub fn backend(&self) -> &BackendRef {
        &self.backend
    }

    /// Current ownership state
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    /// Check if the handle is still usable
    pub fn is_live(&self) -> bool {
        self.raw.is_some()
    }

    /// Free the block if this wrapper still owns it. Safe to call any
    /// number of times; a no-op once released or transferred.
    pub fn release(&mut self) {
        if let (Some(raw), Ownership::Owned) = (self.raw.take(), self.ownership) {
            // SAFETY: the handle is live and owned by this wrapper; `take`
            // guarantees it is destroyed at most once.
            unsafe { self.backend.destroy(raw) };
            self.ownership = Ownership::Released;
        }
    }

    /// Record that the engine took responsibility for the block.
    pub(crate) fn mark_transferred(&mut self) {
        self.raw = None;
        self.ownership = Ownership::Transferred;
    }

    /// Deep copy, owned by the caller.
    pub fn duplicate(&self) -> MatResult<Self> {
        let raw = self.raw()?;
        // SAFETY: `raw` is live and belongs to `self.backend`.
        let copy = unsafe { self.backend.duplicate(raw) }
            .ok_or_else(|| MatError::allocation_failed("duplicate"))?;
        Ok(Self::from_raw(self.backend.clone(), copy))
    }

    /// Element type tag
    pub fn class(&self) -> MatResult<MxClass> {
        let raw = self.raw()?;
        // SAFETY: `raw` is live and belongs to `self.backend`.
        Ok(unsafe { self.backend.class_of(raw) })
    }

    /// Full shape
    pub fn dims(&self) -> MatResult<Vec<usize>> {
        let raw = self.raw()?;
        // SAFETY: `raw` is live and belongs to `self.backend`.
        Ok(unsafe { self.backend.dims(raw) })
    }

    /// Number of dimensions (at least 2)
    pub fn ndims(&self) -> MatResult<usize> {
        Ok(self.dims()?.len())
    }

    /// Size along dimension `d` (0-based); trailing dimensions are 1.
    pub fn dim(&self, d: usize) -> MatResult<usize> {
        Ok(self.dims()?.get(d).copied().unwrap_or(1))
    }

    /// Size of the first dimension
    pub fn rows(&self) -> MatResult<usize> {
        self.dim(0)
    }

    /// Product of all dimensions after the first
    pub fn cols(&self) -> MatResult<usize> {
        Ok(self.dims()?.iter().skip(1).product())
    }

    /// Total number of elements
    pub fn len(&self) -> MatResult<usize> {
        Ok(self.dims()?.iter().product())
    }

    /// Check if the array has no elements
    pub fn is_empty(&self) -> MatResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Bytes per element
    pub fn element_size(&self) -> MatResult<usize> {
        Ok(self.class()?.element_size())
    }

    /// Raw pointer to the first element.
    ///
    /// Valid only while this wrapper owns the block; it must not be used
    /// after the array is put into a session or released.
    pub fn data_ptr(&self) -> MatResult<*mut c_void> {
        let raw = self.raw()?;
        // SAFETY: `raw` is live and belongs to `self.backend`.
        Ok(unsafe { self.backend.data(raw) })
    }

    /// Check if the array is numeric
    pub fn is_numeric(&self) -> MatResult<bool> {
        Ok(self.class()?.is_numeric())
    }

    /// Check if the array is of class double
    pub fn is_double(&self) -> MatResult<bool> {
        Ok(self.class()? == MxClass::Double)
    }

    /// Check if the array is logical
    pub fn is_logical(&self) -> MatResult<bool> {
        Ok(self.class()? == MxClass::Logical)
    }

    /// Check if the array is a char array
    pub fn is_char(&self) -> MatResult<bool> {
        Ok(self.class()? == MxClass::Char)
    }

    /// Check if the array is a cell array
    pub fn is_cell(&self) -> MatResult<bool> {
        Ok(self.class()? == MxClass::Cell)
    }

    /// Check if the array is a struct array
    pub fn is_struct(&self) -> MatResult<bool> {
        Ok(self.class()? == MxClass::Struct)
    }

    /// Typed slice over the flat data buffer, column-major.
    ///
    /// The caller is responsible for `T` matching the element size; the
    /// typed entry points in [`crate::conversion`] check the class first.
    pub(crate) fn data<T: Copy>(&self) -> MatResult<&[T]> {
        let len = self.len()?;
        let ptr = self.data_ptr()?;
        if len == 0 || ptr.is_null() {
            return Ok(&[]);
        }
        // SAFETY: the block holds `len` elements of the array's class and
        // stays alive while `self` is borrowed; callers pick `T` to match.
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const T, len) })
    }

    /// Mutable typed slice over the flat data buffer.
    pub(crate) fn data_mut<T: Copy>(&mut self) -> MatResult<&mut [T]> {
        let len = self.len()?;
        let ptr = self.data_ptr()?;
        if len == 0 || ptr.is_null() {
            return Ok(&mut []);
        }
        // SAFETY: as in `data`, and `&mut self` makes the borrow exclusive.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr as *mut T, len) })
    }

    fn expect_class(&self, class: MxClass) -> MatResult<RawArray> {
        let actual = self.class()?;
        if actual != class {
            return Err(MatError::ClassMismatch {
                expected: class,
                actual,
            });
        }
        self.raw()
    }

    fn check_index(&self, index: usize) -> MatResult<()> {
        let len = self.len()?;
        if index >= len {
            return Err(MatError::IndexOutOfBounds { index, len });
        }
        Ok(())
    }

    /// Copy of cell element `index` (column-major linear index).
    ///
    /// Unset elements come back as 0-by-0 doubles.
    pub fn get_cell(&self, index: usize) -> MatResult<MxArray> {
        let raw = self.expect_class(MxClass::Cell)?;
        self.check_index(index)?;
        // SAFETY: `raw` is a live cell array of this backend and `index` is
        // in range.
        match unsafe { self.backend.cell(raw, index) } {
            Some(element) => {
                // SAFETY: `element` is borrowed from the live container.
                let copy = unsafe { self.backend.duplicate(element) }
                    .ok_or_else(|| MatError::allocation_failed("cell element"))?;
                Ok(Self::from_raw(self.backend.clone(), copy))
            }
            None => Self::empty(&self.backend),
        }
    }

    /// Store `value` as cell element `index`. The container takes
    /// ownership; `value` is left transferred.
    pub fn set_cell(&mut self, index: usize, mut value: MxArray) -> MatResult<()> {
        let raw = self.expect_class(MxClass::Cell)?;
        self.check_index(index)?;
        let element = self.adopt(&mut value)?;
        // SAFETY: both handles are live; `element` is owned and moves into
        // the container.
        unsafe { self.backend.set_cell(raw, index, element) };
        value.mark_transferred();
        Ok(())
    }

    /// Number of fields of a struct array
    pub fn field_count(&self) -> MatResult<usize> {
        Ok(self.field_names()?.len())
    }

    /// Field names of a struct array in declaration order
    pub fn field_names(&self) -> MatResult<Vec<String>> {
        let raw = self.expect_class(MxClass::Struct)?;
        // SAFETY: `raw` is a live struct array of this backend.
        Ok(unsafe { self.backend.field_names(raw) })
    }

    fn check_field(&self, name: &str) -> MatResult<RawArray> {
        if !self.field_names()?.iter().any(|f| f == name) {
            return Err(MatError::FieldNotFound {
                field: name.to_string(),
            });
        }
        self.raw()
    }

    /// Copy of field `name` of struct element `index`.
    pub fn get_field(&self, name: &str, index: usize) -> MatResult<MxArray> {
        let raw = self.check_field(name)?;
        self.check_index(index)?;
        // SAFETY: `raw` is a live struct array and the field exists.
        match unsafe { self.backend.field(raw, index, name) } {
            Some(element) => {
                // SAFETY: `element` is borrowed from the live container.
                let copy = unsafe { self.backend.duplicate(element) }
                    .ok_or_else(|| MatError::allocation_failed("struct field"))?;
                Ok(Self::from_raw(self.backend.clone(), copy))
            }
            None => Self::empty(&self.backend),
        }
    }

    /// Store `value` in field `name` of struct element `index`. The
    /// container takes ownership; `value` is left transferred.
    pub fn set_field(&mut self, name: &str, index: usize, mut value: MxArray) -> MatResult<()> {
        let raw = self.check_field(name)?;
        self.check_index(index)?;
        let element = self.adopt(&mut value)?;
        // SAFETY: both handles are live; the field exists and `element` is
        // owned.
        unsafe { self.backend.set_field(raw, index, name, element) };
        value.mark_transferred();
        Ok(())
    }

    /// Make sure `value` can move into one of our containers.
    fn adopt(&self, value: &mut MxArray) -> MatResult<RawArray> {
        if same_backend(&self.backend, &value.backend) {
            return value.raw();
        }
        Err(MatError::InvalidHandle)
    }
}

impl Drop for MxArray {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MxArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.class(), self.dims()) {
            (Ok(class), Ok(dims)) => f
                .debug_struct("MxArray")
                .field("class", &class)
                .field("dims", &dims)
                .finish(),
            _ => f
                .debug_struct("MxArray")
                .field("ownership", &self.ownership)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBackend;

    fn backend() -> BackendRef {
        SimBackend::new().into_ref()
    }

    #[test]
    fn test_zeros_metadata() {
        let b = backend();
        let arr = MxArray::zeros(&b, MxClass::Double, &[3, 4]).unwrap();

        assert_eq!(arr.class().unwrap(), MxClass::Double);
        assert_eq!(arr.dims().unwrap(), vec![3, 4]);
        assert_eq!(arr.rows().unwrap(), 3);
        assert_eq!(arr.cols().unwrap(), 4);
        assert_eq!(arr.len().unwrap(), 12);
        assert_eq!(arr.ndims().unwrap(), 2);
        assert_eq!(arr.dim(5).unwrap(), 1);
        assert_eq!(arr.element_size().unwrap(), 8);
        assert!(arr.data::<f64>().unwrap().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_cols_collapse_trailing_dims() {
        let b = backend();
        let arr = MxArray::zeros(&b, MxClass::Int32, &[2, 3, 4]).unwrap();
        assert_eq!(arr.cols().unwrap(), 12);
        assert_eq!(arr.ndims().unwrap(), 3);
    }

    #[test]
    fn test_one_dimensional_shape_is_padded() {
        let b = backend();
        let arr = MxArray::zeros(&b, MxClass::Single, &[5]).unwrap();
        assert_eq!(arr.dims().unwrap(), vec![5, 1]);
    }

    #[test]
    fn test_zeros_rejects_containers() {
        let b = backend();
        let err = MxArray::zeros(&b, MxClass::Cell, &[1, 1]).unwrap_err();
        assert!(matches!(err, MatError::UnsupportedElementType { class: MxClass::Cell }));
    }

    #[test]
    fn test_release_is_idempotent() {
        let sim = SimBackend::new();
        let b = sim.clone().into_ref();
        let before = sim.live_arrays();

        let mut arr = MxArray::zeros(&b, MxClass::Double, &[2, 2]).unwrap();
        assert_eq!(sim.live_arrays(), before + 1);

        arr.release();
        arr.release();
        assert_eq!(sim.live_arrays(), before);
        assert_eq!(arr.ownership(), Ownership::Released);
        assert!(matches!(arr.dims(), Err(MatError::InvalidHandle)));
        assert!(matches!(arr.data_ptr(), Err(MatError::InvalidHandle)));
    }

    #[test]
    fn test_drop_releases() {
        let sim = SimBackend::new();
        let b = sim.clone().into_ref();
        let before = sim.live_arrays();
        {
            let _arr = MxArray::zeros(&b, MxClass::UInt8, &[10, 10]).unwrap();
        }
        assert_eq!(sim.live_arrays(), before);
    }

    #[test]
    fn test_duplicate_is_independent() {
        let b = backend();
        let mut arr = MxArray::zeros(&b, MxClass::Double, &[2, 1]).unwrap();
        arr.data_mut::<f64>().unwrap()[0] = 7.0;

        let copy = arr.duplicate().unwrap();
        arr.data_mut::<f64>().unwrap()[0] = 1.0;

        assert_eq!(copy.data::<f64>().unwrap(), &[7.0, 0.0]);
    }

    #[test]
    fn test_string_is_utf16_row() {
        let b = backend();
        let s = MxArray::string(&b, "héllo").unwrap();
        assert_eq!(s.class().unwrap(), MxClass::Char);
        assert_eq!(s.dims().unwrap(), vec![1, 5]);

        let empty = MxArray::string(&b, "").unwrap();
        assert_eq!(empty.dims().unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_cell_elements() {
        let sim = SimBackend::new();
        let b = sim.clone().into_ref();
        let before = sim.live_arrays();
        {
            let mut cell = MxArray::cell_array(&b, &[1, 2]).unwrap();
            let mut item = MxArray::zeros(&b, MxClass::Double, &[1, 1]).unwrap();
            item.data_mut::<f64>().unwrap()[0] = 4.5;

            cell.set_cell(1, item).unwrap();
            let got = cell.get_cell(1).unwrap();
            assert_eq!(got.data::<f64>().unwrap(), &[4.5]);

            let unset = cell.get_cell(0).unwrap();
            assert!(unset.is_empty().unwrap());

            let oob = cell.get_cell(2).unwrap_err();
            assert!(matches!(oob, MatError::IndexOutOfBounds { index: 2, len: 2 }));
        }
        assert_eq!(sim.live_arrays(), before);
    }

    #[test]
    fn test_struct_fields() {
        let b = backend();
        let mut s = MxArray::struct_array(&b, &[1, 1], &["alpha", "beta"]).unwrap();
        assert_eq!(s.field_count().unwrap(), 2);
        assert_eq!(s.field_names().unwrap(), vec!["alpha", "beta"]);

        let value = MxArray::string(&b, "x").unwrap();
        s.set_field("beta", 0, value).unwrap();
        assert!(s.get_field("beta", 0).unwrap().is_char().unwrap());
        assert!(s.get_field("alpha", 0).unwrap().is_empty().unwrap());

        let missing = s.get_field("gamma", 0).unwrap_err();
        assert!(matches!(missing, MatError::FieldNotFound { .. }));
    }

    #[test]
    fn test_container_accessors_check_class() {
        let b = backend();
        let arr = MxArray::zeros(&b, MxClass::Double, &[1, 1]).unwrap();
        assert!(matches!(
            arr.get_cell(0),
            Err(MatError::ClassMismatch { expected: MxClass::Cell, .. })
        ));
        assert!(matches!(arr.field_names(), Err(MatError::ClassMismatch { .. })));
    }
}

//! Typed buffers bound to operators.
//!
//! A [`Buffer`] is a cheap, cloneable handle: the caller keeps one handle to
//! fill inputs and read results, the operator keeps another for the lifetime
//! of the binding. Storage is guarded by a reader/writer lock so the operator
//! only borrows access for the duration of one execution.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use ndarray::{Array4, ArrayView4};

use super::dtype::DType;
use super::layout::Layout;

/// Shape, layout and element kind of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDesc {
    pub dims: Vec<usize>,
    pub layout: Layout,
    pub dtype: DType,
}

impl MemoryDesc {
    /// Number of logical elements.
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of physical elements, including blocked-layout padding.
    pub fn physical_len(&self) -> usize {
        self.layout.physical_len(&self.dims)
    }

    pub fn size_in_bytes(&self) -> usize {
        self.dtype.buffer_size(self.physical_len())
    }
}

/// Owned storage of a buffer, one variant per element kind.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferData {
    U8(Vec<u8>),
    S8(Vec<i8>),
    S32(Vec<i32>),
    F32(Vec<f32>),
}

impl BufferData {
    fn zeros(dtype: DType, len: usize) -> Result<Self> {
        match dtype {
            DType::U8 => Ok(BufferData::U8(vec![0; len])),
            DType::S8 => Ok(BufferData::S8(vec![0; len])),
            DType::S32 => Ok(BufferData::S32(vec![0; len])),
            DType::F32 => Ok(BufferData::F32(vec![0.0; len])),
            DType::Undef => Err(anyhow!("Cannot allocate storage for an undefined element kind")),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            BufferData::U8(_) => DType::U8,
            BufferData::S8(_) => DType::S8,
            BufferData::S32(_) => DType::S32,
            BufferData::F32(_) => DType::F32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BufferData::U8(v) => v.len(),
            BufferData::S8(v) => v.len(),
            BufferData::S32(v) => v.len(),
            BufferData::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw little-endian bytes of the storage.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            BufferData::U8(v) => v,
            BufferData::S8(v) => bytemuck::cast_slice(v),
            BufferData::S32(v) => bytemuck::cast_slice(v),
            BufferData::F32(v) => bytemuck::cast_slice(v),
        }
    }

    /// Typed view of the storage, `None` if `T` is not the stored kind.
    pub fn as_slice<T: Element>(&self) -> Option<&[T]> {
        T::view(self)
    }

    pub fn as_slice_mut<T: Element>(&mut self) -> Option<&mut [T]> {
        T::view_mut(self)
    }
}

/// Rust scalar types that can back a [`Buffer`].
pub trait Element: bytemuck::Pod + Default + Send + Sync + 'static {
    const DTYPE: DType;

    fn view(data: &BufferData) -> Option<&[Self]>;
    fn view_mut(data: &mut BufferData) -> Option<&mut [Self]>;
    fn wrap(values: Vec<Self>) -> BufferData;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn view(data: &BufferData) -> Option<&[Self]> {
                match data {
                    BufferData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn view_mut(data: &mut BufferData) -> Option<&mut [Self]> {
                match data {
                    BufferData::$variant(v) => Some(v),
                    _ => None,
                }
            }

            fn wrap(values: Vec<Self>) -> BufferData {
                BufferData::$variant(values)
            }
        }
    };
}

impl_element!(u8, U8);
impl_element!(i8, S8);
impl_element!(i32, S32);
impl_element!(f32, F32);

/// A described multi-dimensional array with shared, lock-guarded storage.
#[derive(Debug, Clone)]
pub struct Buffer {
    desc: MemoryDesc,
    data: Arc<RwLock<BufferData>>,
}

impl Buffer {
    /// Allocates a zero-filled buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `dims` does not match the layout's rank or the
    /// element kind is `Undef`.
    pub fn new(dims: &[usize], layout: Layout, dtype: DType) -> Result<Self> {
        if dims.len() != layout.rank() {
            return Err(anyhow!(
                "Layout {:?} expects {} dimensions, got {:?}",
                layout,
                layout.rank(),
                dims
            ));
        }
        let desc = MemoryDesc {
            dims: dims.to_vec(),
            layout,
            dtype,
        };
        let data = BufferData::zeros(dtype, desc.physical_len())?;
        Ok(Self {
            desc,
            data: Arc::new(RwLock::new(data)),
        })
    }

    /// Creates a channel-last activation buffer `[n, c, h, w]`.
    pub fn nhwc(dims: [usize; 4], dtype: DType) -> Result<Self> {
        Self::new(&dims, Layout::Nhwc, dtype)
    }

    /// Zero-filled u8 activations, for operator-owned intermediates.
    pub(crate) fn nhwc_u8(dims: [usize; 4]) -> Self {
        let desc = MemoryDesc {
            dims: dims.to_vec(),
            layout: Layout::Nhwc,
            dtype: DType::U8,
        };
        let data = BufferData::U8(vec![0; desc.len()]);
        Self {
            desc,
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Creates a blocked weight buffer `[o, i, kh, kw]`.
    pub fn blocked_weights(dims: [usize; 4], dtype: DType) -> Result<Self> {
        Self::new(&dims, Layout::OIhw4i16o4i, dtype)
    }

    /// Creates a bias vector holding `values`.
    pub fn from_vec<T: Element>(values: Vec<T>) -> Self {
        let desc = MemoryDesc {
            dims: vec![values.len()],
            layout: Layout::X,
            dtype: T::DTYPE,
        };
        Self {
            desc,
            data: Arc::new(RwLock::new(T::wrap(values))),
        }
    }

    /// Creates a 4-D buffer in `layout` from a logically ordered array.
    ///
    /// `array` is indexed `[n, c, h, w]` (or `[o, i, kh, kw]` for weights)
    /// regardless of the target layout; values are reordered on copy.
    pub fn from_array<T: Element>(array: ArrayView4<'_, T>, layout: Layout) -> Result<Self> {
        let buffer = Self::new(array.shape(), layout, T::DTYPE)?;
        buffer.copy_from_array(array)?;
        Ok(buffer)
    }

    /// Overwrites the contents from a logically ordered array of the same shape.
    pub fn copy_from_array<T: Element>(&self, array: ArrayView4<'_, T>) -> Result<()> {
        if array.shape() != self.desc.dims.as_slice() {
            return Err(anyhow!(
                "Shape mismatch: buffer {:?} vs array {:?}",
                self.desc.dims,
                array.shape()
            ));
        }
        let dims = self.desc.dims.clone();
        let layout = self.desc.layout;
        let mut guard = self.write();
        let out = guard
            .as_slice_mut::<T>()
            .ok_or_else(|| anyhow!("Buffer holds {}, not {}", self.desc.dtype, T::DTYPE))?;
        for ((n, c, h, w), &v) in array.indexed_iter() {
            out[layout.offset(&dims, &[n, c, h, w])] = v;
        }
        Ok(())
    }

    /// Copies the contents out into a logically ordered array.
    pub fn to_array<T: Element>(&self) -> Result<Array4<T>> {
        if self.desc.dims.len() != 4 {
            return Err(anyhow!("Buffer {:?} is not 4-dimensional", self.desc.dims));
        }
        let dims = &self.desc.dims;
        let layout = self.desc.layout;
        let guard = self.read();
        let data = guard
            .as_slice::<T>()
            .ok_or_else(|| anyhow!("Buffer holds {}, not {}", self.desc.dtype, T::DTYPE))?;
        Ok(Array4::from_shape_fn(
            (dims[0], dims[1], dims[2], dims[3]),
            |(n, c, h, w)| data[layout.offset(dims, &[n, c, h, w])],
        ))
    }

    /// Copies the physical storage out as a flat vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let guard = self.read();
        guard
            .as_slice::<T>()
            .map(|s| s.to_vec())
            .ok_or_else(|| anyhow!("Buffer holds {}, not {}", self.desc.dtype, T::DTYPE))
    }

    /// Fills the physical storage with `f(i)` for each physical index `i`.
    pub fn fill_with<T: Element>(&self, mut f: impl FnMut(usize) -> T) -> Result<()> {
        let mut guard = self.write();
        let data = guard
            .as_slice_mut::<T>()
            .ok_or_else(|| anyhow!("Buffer holds {}, not {}", self.desc.dtype, T::DTYPE))?;
        for (i, v) in data.iter_mut().enumerate() {
            *v = f(i);
        }
        Ok(())
    }

    pub fn desc(&self) -> &MemoryDesc {
        &self.desc
    }

    pub fn dims(&self) -> &[usize] {
        &self.desc.dims
    }

    pub fn layout(&self) -> Layout {
        self.desc.layout
    }

    pub fn dtype(&self) -> DType {
        self.desc.dtype
    }

    /// Number of logical elements.
    pub fn len(&self) -> usize {
        self.desc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.desc.is_empty()
    }

    /// Storage size in bytes, including blocked-layout padding.
    pub fn size_in_bytes(&self) -> usize {
        self.desc.size_in_bytes()
    }

    /// Whether two handles refer to the same storage.
    pub fn same_storage(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Shared read access. A poisoned lock is recovered: the data is plain
    /// numbers and stays structurally valid.
    pub fn read(&self) -> RwLockReadGuard<'_, BufferData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, BufferData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

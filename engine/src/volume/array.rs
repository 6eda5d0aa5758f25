//! Dense C-ordered 3-D arrays.
//!
//! Axis 0 is Z (slices), axis 1 is Y (rows), axis 2 is X (columns). Element
//! `(z, y, x)` lives at `z * Y * X + y * X + x`.

use crate::errors::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Element types carried by arrays on the wire and on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    I8,
    U16,
    I32,
    F32,
}

impl ElementType {
    /// Size of one element in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 => 2,
            ElementType::I32 | ElementType::F32 => 4,
        }
    }
}

/// Scalar types an [`Array3`] can hold.
pub trait Element:
    Copy + Default + PartialEq + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
    const TYPE: ElementType;
}

impl Element for u8 {
    const TYPE: ElementType = ElementType::U8;
}

impl Element for i8 {
    const TYPE: ElementType = ElementType::I8;
}

impl Element for u16 {
    const TYPE: ElementType = ElementType::U16;
}

impl Element for i32 {
    const TYPE: ElementType = ElementType::I32;
}

impl Element for f32 {
    const TYPE: ElementType = ElementType::F32;
}

/// A dense 3-D array in C order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Array3<T> {
    data: Vec<T>,
    shape: [usize; 3],
}

impl<T: Element> Array3<T> {
    /// Create a new array with the given data and shape
    ///
    /// # Panics
    /// Panics if the data length doesn't match the product of the shape dimensions.
    pub fn new(data: Vec<T>, shape: [usize; 3]) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape product {}",
            data.len(),
            expected_len
        );
        Self { data, shape }
    }

    /// Fallible constructor for data received from peers or files
    pub fn from_vec(data: Vec<T>, shape: [usize; 3]) -> Result<Self> {
        let expected_len: usize = shape.iter().product();
        if data.len() != expected_len {
            return Err(EngineError::Shape(format!(
                "data length {} doesn't match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self { data, shape })
    }

    /// Create an array filled with `T::default()`
    pub fn zeros(shape: [usize; 3]) -> Self {
        Self::filled(shape, T::default())
    }

    /// Create an array filled with a constant value
    pub fn filled(shape: [usize; 3], value: T) -> Self {
        let len: usize = shape.iter().product();
        Self {
            data: vec![value; len],
            shape,
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Elements per Z-plane
    pub fn plane_len(&self) -> usize {
        self.shape[1] * self.shape[2]
    }

    /// Size of the payload in bytes
    pub fn nbytes(&self) -> usize {
        self.data.len() * T::TYPE.size_bytes()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    #[inline]
    pub fn offset(&self, z: usize, y: usize, x: usize) -> usize {
        (z * self.shape[1] + y) * self.shape[2] + x
    }

    #[inline]
    pub fn get(&self, z: usize, y: usize, x: usize) -> T {
        self.data[self.offset(z, y, x)]
    }

    #[inline]
    pub fn set(&mut self, z: usize, y: usize, x: usize, value: T) {
        let idx = self.offset(z, y, x);
        self.data[idx] = value;
    }

    /// One Z-plane as a flat slice
    pub fn plane(&self, z: usize) -> &[T] {
        let n = self.plane_len();
        &self.data[z * n..(z + 1) * n]
    }

    /// Copy the half-open box `[start, end)` into a new array
    pub fn crop(&self, start: [usize; 3], end: [usize; 3]) -> Result<Self> {
        for axis in 0..3 {
            if start[axis] > end[axis] || end[axis] > self.shape[axis] {
                return Err(EngineError::Shape(format!(
                    "crop [{:?}, {:?}) outside array of shape {:?}",
                    start, end, self.shape
                )));
            }
        }
        let shape = [end[0] - start[0], end[1] - start[1], end[2] - start[2]];
        let mut data = Vec::with_capacity(shape.iter().product());
        for z in start[0]..end[0] {
            for y in start[1]..end[1] {
                let row = self.offset(z, y, 0);
                data.extend_from_slice(&self.data[row + start[2]..row + end[2]]);
            }
        }
        Ok(Self { data, shape })
    }

    /// Copy `src` into this array with its origin at `offset`
    pub fn paste(&mut self, src: &Array3<T>, offset: [usize; 3]) -> Result<()> {
        for axis in 0..3 {
            if offset[axis] + src.shape[axis] > self.shape[axis] {
                return Err(EngineError::Shape(format!(
                    "paste of {:?} at {:?} exceeds array of shape {:?}",
                    src.shape, offset, self.shape
                )));
            }
        }
        let row_len = src.shape[2];
        for z in 0..src.shape[0] {
            for y in 0..src.shape[1] {
                let from = src.offset(z, y, 0);
                let to = self.offset(offset[0] + z, offset[1] + y, offset[2]);
                self.data[to..to + row_len].copy_from_slice(&src.data[from..from + row_len]);
            }
        }
        Ok(())
    }

    /// Surround the array with `n` voxels of `T::default()` on every side
    pub fn pad(&self, n: usize) -> Self {
        let shape = [
            self.shape[0] + 2 * n,
            self.shape[1] + 2 * n,
            self.shape[2] + 2 * n,
        ];
        let mut out = Self::zeros(shape);
        // Cannot fail: the padded array is larger on every axis.
        let _ = out.paste(self, [n, n, n]);
        out
    }

    /// Strip `n` voxels from every side
    pub fn unpad(&self, n: usize) -> Result<Self> {
        if self.shape.iter().any(|&d| d < 2 * n) {
            return Err(EngineError::Shape(format!(
                "cannot strip {} voxels from shape {:?}",
                n, self.shape
            )));
        }
        self.crop(
            [n, n, n],
            [
                self.shape[0] - n,
                self.shape[1] - n,
                self.shape[2] - n,
            ],
        )
    }

    /// Planes `[z0, z1)` as a new array
    pub fn slab(&self, z0: usize, z1: usize) -> Result<Self> {
        self.crop([z0, 0, 0], [z1, self.shape[1], self.shape[2]])
    }

    /// Concatenate arrays along Z in the given order
    pub fn concat_z(parts: Vec<Array3<T>>) -> Result<Self> {
        let first = parts
            .first()
            .ok_or_else(|| EngineError::Shape("nothing to concatenate".into()))?;
        let (dy, dx) = (first.shape[1], first.shape[2]);
        let mut dz = 0;
        for p in &parts {
            if p.shape[1] != dy || p.shape[2] != dx {
                return Err(EngineError::Shape(format!(
                    "cannot concatenate {:?} with planes of {}x{}",
                    p.shape, dy, dx
                )));
            }
            dz += p.shape[0];
        }
        let mut data = Vec::with_capacity(dz * dy * dx);
        for p in parts {
            data.extend(p.data);
        }
        Ok(Self {
            data,
            shape: [dz, dy, dx],
        })
    }

    /// Reorder axes: axis `d` of the result is axis `axes[d]` of `self`.
    pub fn permute(&self, axes: [usize; 3]) -> Self {
        let shape = [
            self.shape[axes[0]],
            self.shape[axes[1]],
            self.shape[axes[2]],
        ];
        let mut data = Vec::with_capacity(self.data.len());
        let mut src = [0usize; 3];
        for i in 0..shape[0] {
            src[axes[0]] = i;
            for j in 0..shape[1] {
                src[axes[1]] = j;
                for k in 0..shape[2] {
                    src[axes[2]] = k;
                    data.push(self.get(src[0], src[1], src[2]));
                }
            }
        }
        Self { data, shape }
    }

    /// Elementwise conversion into another element type
    pub fn map<U: Element>(&self, f: impl Fn(T) -> U) -> Array3<U> {
        Array3 {
            data: self.data.iter().map(|&v| f(v)).collect(),
            shape: self.shape,
        }
    }
}

impl Array3<f32> {
    /// Element-wise in-place sum
    ///
    /// # Errors
    /// Returns an error if the arrays have different shapes.
    pub fn add_assign(&mut self, other: &Array3<f32>) -> Result<()> {
        if self.shape != other.shape {
            return Err(EngineError::Shape(format!(
                "Array shape mismatch: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }
}

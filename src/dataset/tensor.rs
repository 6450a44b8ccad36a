//! Strided tensor views over raw torch storages.

use serde::Serialize;

use crate::error::DecodeError;

/// Element type of a torch storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DType {
    F64,
    F32,
    BF16,
    I64,
    I32,
    I16,
    I8,
    U8,
    Bool,
}

impl DType {
    /// Maps a legacy storage class name (`torch.LongStorage`, ...) to its dtype.
    pub fn from_storage_class(name: &str) -> Result<Self, DecodeError> {
        match name {
            "DoubleStorage" => Ok(DType::F64),
            "FloatStorage" => Ok(DType::F32),
            "BFloat16Storage" => Ok(DType::BF16),
            "LongStorage" => Ok(DType::I64),
            "IntStorage" => Ok(DType::I32),
            "ShortStorage" => Ok(DType::I16),
            "CharStorage" => Ok(DType::I8),
            "ByteStorage" => Ok(DType::U8),
            "BoolStorage" => Ok(DType::Bool),
            other => Err(DecodeError::UnsupportedDtype(other.to_string())),
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::F64 | DType::I64 => 8,
            DType::F32 | DType::I32 => 4,
            DType::BF16 | DType::I16 => 2,
            DType::I8 | DType::U8 | DType::Bool => 1,
        }
    }

    pub fn is_integral(self) -> bool {
        !matches!(self, DType::F64 | DType::F32 | DType::BF16)
    }
}

/// A persistent storage reference found in the pickle stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRef {
    pub dtype: DType,
    pub key: String,
    pub numel: usize,
}

/// A tensor as described by a `_rebuild_tensor_v2` call, before its
/// storage bytes are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRef {
    pub storage: StorageRef,
    pub offset: usize,
    pub shape: Vec<usize>,
    pub stride: Vec<usize>,
}

impl TensorRef {
    /// Element count of the view, or `None` if it overflows `usize`.
    pub fn numel(&self) -> Option<usize> {
        self.shape
            .iter()
            .try_fold(1usize, |acc, dim| acc.checked_mul(*dim))
    }

    /// Leading dimension, or `None` for scalars.
    pub fn dim0(&self) -> Option<usize> {
        self.shape.first().copied()
    }
}

/// A read-only strided view borrowing a storage blob.
#[derive(Debug, Clone)]
pub struct Tensor<'a> {
    dtype: DType,
    data: &'a [u8],
    big_endian: bool,
    offset: usize,
    shape: Vec<usize>,
    stride: Vec<usize>,
}

impl<'a> Tensor<'a> {
    /// Builds a view and checks that every addressable element lies inside
    /// the storage.
    pub fn new(tref: &TensorRef, data: &'a [u8], big_endian: bool) -> Result<Self, DecodeError> {
        if tref.shape.len() != tref.stride.len() {
            return Err(bounds(format!(
                "shape {:?} and stride {:?} differ in rank",
                tref.shape, tref.stride
            )));
        }

        let dtype = tref.storage.dtype;
        let available = data.len() / dtype.size();

        let numel = tref
            .numel()
            .ok_or_else(|| bounds(format!("shape {:?} overflows", tref.shape)))?;
        // a view never reads more elements than its storage holds
        if numel > available {
            return Err(bounds(format!(
                "view of {} elements over storage {:?} holding {}",
                numel, tref.storage.key, available
            )));
        }

        if numel > 0 {
            let last = tref
                .shape
                .iter()
                .zip(&tref.stride)
                .try_fold(tref.offset, |acc, (dim, stride)| {
                    (dim - 1).checked_mul(*stride)?.checked_add(acc)
                })
                .ok_or_else(|| {
                    bounds(format!(
                        "offset {} with stride {:?} overflows",
                        tref.offset, tref.stride
                    ))
                })?;
            if last >= available {
                return Err(bounds(format!(
                    "element {} requested from storage {:?} holding {} elements",
                    last, tref.storage.key, available
                )));
            }
        }

        Ok(Tensor {
            dtype,
            data,
            big_endian,
            offset: tref.offset,
            shape: tref.shape.clone(),
            stride: tref.stride.clone(),
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Removes every dimension of size one.
    pub fn squeeze(&self) -> Tensor<'a> {
        let (shape, stride) = self
            .shape
            .iter()
            .zip(&self.stride)
            .filter(|(dim, _)| **dim != 1)
            .map(|(dim, stride)| (*dim, *stride))
            .unzip();

        Tensor {
            shape,
            stride,
            ..self.clone()
        }
    }

    /// Reads one element as `f64`.
    pub fn get_f64(&self, index: &[usize]) -> Result<f64, DecodeError> {
        let linear = self.linear_index(index)?;
        Ok(self.read_f64(linear))
    }

    /// Reads one element as `i64`. Only integral and bool tensors qualify.
    pub fn get_i64(&self, index: &[usize]) -> Result<i64, DecodeError> {
        self.require_integral()?;
        let linear = self.linear_index(index)?;
        Ok(self.read_i64(linear))
    }

    /// All elements in row-major order as `i64`.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>, DecodeError> {
        self.require_integral()?;
        Ok(self
            .linear_indices()
            .into_iter()
            .map(|i| self.read_i64(i))
            .collect())
    }

    /// One row of a 2-D tensor.
    pub fn row(&self, row: usize) -> Result<Vec<f64>, DecodeError> {
        let (rows, cols) = self.matrix_dims()?;
        if row >= rows {
            return Err(DecodeError::TensorBounds(format!(
                "row {row} of a tensor with {rows} rows"
            )));
        }
        (0..cols).map(|col| self.get_f64(&[row, col])).collect()
    }

    /// One column of a 2-D tensor.
    pub fn column(&self, col: usize) -> Result<Vec<f64>, DecodeError> {
        let (rows, cols) = self.matrix_dims()?;
        if col >= cols {
            return Err(DecodeError::TensorBounds(format!(
                "column {col} of a tensor with {cols} columns"
            )));
        }
        (0..rows).map(|row| self.get_f64(&[row, col])).collect()
    }

    fn matrix_dims(&self) -> Result<(usize, usize), DecodeError> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((*rows, *cols)),
            other => Err(DecodeError::TensorBounds(format!(
                "expected a 2-D tensor, got shape {other:?}"
            ))),
        }
    }

    fn require_integral(&self) -> Result<(), DecodeError> {
        if self.dtype.is_integral() {
            Ok(())
        } else {
            Err(DecodeError::UnsupportedDtype(format!(
                "{:?} read as integer",
                self.dtype
            )))
        }
    }

    fn linear_index(&self, index: &[usize]) -> Result<usize, DecodeError> {
        if index.len() != self.shape.len() {
            return Err(DecodeError::TensorBounds(format!(
                "index {:?} for shape {:?}",
                index, self.shape
            )));
        }
        let mut linear = self.offset;
        for ((i, dim), stride) in index.iter().zip(&self.shape).zip(&self.stride) {
            if i >= dim {
                return Err(DecodeError::TensorBounds(format!(
                    "index {:?} for shape {:?}",
                    index, self.shape
                )));
            }
            linear += i * stride;
        }
        Ok(linear)
    }

    fn linear_indices(&self) -> Vec<usize> {
        let numel = self.numel();
        let mut out = Vec::with_capacity(numel);
        if numel == 0 {
            return out;
        }

        let mut counter = vec![0usize; self.shape.len()];
        loop {
            let linear = self.offset
                + counter
                    .iter()
                    .zip(&self.stride)
                    .map(|(i, stride)| i * stride)
                    .sum::<usize>();
            out.push(linear);

            // odometer increment, last dimension fastest
            let mut dim = self.shape.len();
            loop {
                if dim == 0 {
                    return out;
                }
                dim -= 1;
                counter[dim] += 1;
                if counter[dim] < self.shape[dim] {
                    break;
                }
                counter[dim] = 0;
            }
        }
    }

    fn bytes<const N: usize>(&self, linear: usize) -> [u8; N] {
        let start = linear * N;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[start..start + N]);
        if self.big_endian {
            out.reverse();
        }
        out
    }

    fn read_f64(&self, linear: usize) -> f64 {
        match self.dtype {
            DType::F64 => f64::from_le_bytes(self.bytes(linear)),
            DType::F32 => f32::from_le_bytes(self.bytes(linear)) as f64,
            DType::BF16 => {
                let bits = u16::from_le_bytes(self.bytes(linear));
                f32::from_bits((bits as u32) << 16) as f64
            }
            _ => self.read_i64(linear) as f64,
        }
    }

    fn read_i64(&self, linear: usize) -> i64 {
        match self.dtype {
            DType::I64 => i64::from_le_bytes(self.bytes(linear)),
            DType::I32 => i32::from_le_bytes(self.bytes(linear)) as i64,
            DType::I16 => i16::from_le_bytes(self.bytes(linear)) as i64,
            DType::I8 => i8::from_le_bytes(self.bytes(linear)) as i64,
            DType::U8 => u8::from_le_bytes(self.bytes(linear)) as i64,
            DType::Bool => (self.bytes::<1>(linear)[0] != 0) as i64,
            DType::F64 | DType::F32 | DType::BF16 => self.read_f64(linear) as i64,
        }
    }
}

fn bounds(msg: String) -> DecodeError {
    DecodeError::TensorBounds(msg)
}

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, ensure, Result};
use bytes::Bytes;
use smallvec::SmallVec;

use crate::{Error, IOName};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    I64,
    I32,
    U8,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::I32 => 4,
            DType::U8 => 1,
        }
    }

    /// ONNX `TensorProto.DataType` code.
    pub fn onnx_code(self) -> i32 {
        match self {
            DType::F32 => 1,
            DType::U8 => 2,
            DType::I32 => 6,
            DType::I64 => 7,
            DType::F16 => 10,
        }
    }

    pub fn from_onnx_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(DType::F32),
            2 => Some(DType::U8),
            6 => Some(DType::I32),
            7 => Some(DType::I64),
            10 => Some(DType::F16),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "FLOAT",
            DType::F16 => "FLOAT16",
            DType::I64 => "INT64",
            DType::I32 => "INT32",
            DType::U8 => "UINT8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FLOAT" | "FLOAT32" | "F32" => Ok(DType::F32),
            "FLOAT16" | "F16" => Ok(DType::F16),
            "INT64" | "I64" => Ok(DType::I64),
            "INT32" | "I32" => Ok(DType::I32),
            "UINT8" | "U8" => Ok(DType::U8),
            _ => Err(Error::InvalidConfiguration(format!(
                "unknown element type `{s}`"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn scalar() -> Self {
        Self(SmallVec::new())
    }

    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Product of the dims; a rank-0 shape holds one element. Saturates at
    /// `usize::MAX`, see [`Shape::checked_numel`].
    pub fn numel(&self) -> usize {
        self.checked_numel().unwrap_or(usize::MAX)
    }

    /// `None` when the element count does not fit in `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    pub fn leading(&self) -> Option<usize> {
        self.0.first().copied()
    }

    /// Same shape with the leading dim replaced.
    pub fn with_leading(&self, leading: usize) -> Self {
        let mut dims = self.0.clone();
        if let Some(first) = dims.first_mut() {
            *first = leading;
        }
        Self(dims)
    }

    /// Same shape with `outer` inserted in front.
    pub fn prepend(&self, outer: usize) -> Self {
        let mut dims = SmallVec::with_capacity(self.rank() + 1);
        dims.push(outer);
        dims.extend(self.0.iter().copied());
        Self(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

/// Element type and shape of a tensor. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorInfo {
    dtype: DType,
    shape: Shape,
}

impl TensorInfo {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn f32(dims: &[usize]) -> Self {
        Self::new(DType::F32, Shape::from_slice(dims))
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn nbytes(&self) -> usize {
        self.checked_nbytes().unwrap_or(usize::MAX)
    }

    pub fn checked_nbytes(&self) -> Option<usize> {
        self.shape.checked_numel()?.checked_mul(self.dtype.byte_size())
    }

    /// Checks that `tensor` has exactly this dtype and shape and carries a
    /// payload of the matching size.
    pub fn validate(&self, name: &IOName, tensor: &Tensor) -> crate::Result<()> {
        if tensor.info != *self || Some(tensor.data.len()) != self.checked_nbytes() {
            return Err(Error::ShapeMismatch {
                name: name.clone(),
                expected: self.to_string(),
                actual: format!("{} ({} bytes)", tensor.info, tensor.data.len()),
            });
        }
        Ok(())
    }
}

impl fmt::Display for TensorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// A host tensor: descriptor plus a little-endian, row-major payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    pub info: TensorInfo,
    pub data: Bytes,
}

impl Tensor {
    pub fn from_cpu_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        Self {
            info: TensorInfo::new(dtype, shape),
            data: bytes,
        }
    }

    pub fn from_f32(shape: Shape, values: &[f32]) -> Self {
        Self::from_cpu_bytes(DType::F32, shape, bytes_from_f32(values))
    }

    pub fn from_i32(shape: Shape, values: &[i32]) -> Self {
        let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_cpu_bytes(DType::I32, shape, Bytes::from(data))
    }

    pub fn zeros(info: &TensorInfo) -> Self {
        Self {
            info: info.clone(),
            data: Bytes::from(vec![0u8; info.nbytes()]),
        }
    }

    pub fn dtype(&self) -> DType {
        self.info.dtype()
    }

    pub fn shape(&self) -> &Shape {
        self.info.shape()
    }

    pub fn to_f32(&self) -> Result<Vec<f32>> {
        ensure!(
            self.dtype() == DType::F32,
            "expected a FLOAT tensor, got {}",
            self.info
        );
        bytes_to_f32(&self.data)
    }

    /// Zero-copy view of `len` bytes starting at `offset`, reinterpreted with `info`.
    pub fn view(&self, offset: usize, info: TensorInfo) -> Result<Tensor> {
        let len = info.nbytes();
        let end = match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => end,
            _ => bail!(
                "view of {len} bytes at offset {offset} exceeds tensor of {} bytes",
                self.data.len()
            ),
        };
        Ok(Tensor {
            info,
            data: self.data.slice(offset..end),
        })
    }

    /// Reinterprets the payload under another shape with the same element count.
    pub fn reshape(&self, shape: Shape) -> Result<Tensor> {
        ensure!(
            shape.numel() == self.shape().numel(),
            "cannot reshape {} to {}",
            self.shape(),
            shape
        );
        Ok(Tensor::from_cpu_bytes(self.dtype(), shape, self.data.clone()))
    }
}

pub fn bytes_to_f32(bytes: &[u8]) -> Result<Vec<f32>> {
    ensure!(bytes.len().is_multiple_of(4), "f32 payload has invalid byte length");
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

pub fn bytes_from_f32(values: &[f32]) -> Bytes {
    let data: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    Bytes::from(data)
}

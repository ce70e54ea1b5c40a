//! Caller-facing tensors and the executor-native representation
//!
//! The engine never interprets tensor contents. It only moves tensors between
//! the caller's [`Tensor`] and the [`NativeTensor`] each executor consumes,
//! through a [`TensorAdapter`].

use crate::device::DevicePtr;
use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Dimension value marking an unknown (dynamic) extent
pub const DYNAMIC_DIM: i64 = -1;

/// Scalar element types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Bool,
    I8,
    U8,
    I16,
    I32,
    I64,
    F16,
    Bf16,
    F32,
    F64,
}

impl DType {
    /// Storage size of one element
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::F16 | DType::Bf16 => 2,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Bool => "bool",
            DType::I8 => "i8",
            DType::U8 => "u8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::F16 => "f16",
            DType::Bf16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Shape and element type of a tensor.
///
/// A dimension of [`DYNAMIC_DIM`] is unknown until run time; such descriptors
/// only appear on graph and artifact signatures, never on concrete tensors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dims: Vec<i64>,
    pub dtype: DType,
}

impl TensorDesc {
    pub fn new(dims: impl Into<Vec<i64>>, dtype: DType) -> Self {
        Self {
            dims: dims.into(),
            dtype,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Whether every dimension is known
    pub fn is_static(&self) -> bool {
        self.dims.iter().all(|d| *d >= 0)
    }

    /// Number of elements, when the shape is static
    pub fn element_count(&self) -> Option<usize> {
        if !self.is_static() {
            return None;
        }
        self.dims
            .iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(*d as usize))
    }

    /// Byte size, when the shape is static
    pub fn byte_size(&self) -> Option<usize> {
        self.element_count()
            .and_then(|n| n.checked_mul(self.dtype.size_in_bytes()))
    }
}

impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.dtype)?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if *d < 0 {
                f.write_str("?")?;
            } else {
                write!(f, "{}", d)?;
            }
        }
        f.write_str("]")
    }
}

/// Backing storage of a tensor
#[derive(Debug, Clone)]
pub enum TensorData {
    /// Host bytes; clones share the allocation
    Host(Arc<[u8]>),
    /// Device memory owned outside the tensor
    Device { ptr: DevicePtr, len: usize },
}

impl TensorData {
    /// Zero-filled host storage
    pub fn zeroed(len: usize) -> Self {
        TensorData::Host(Arc::from(vec![0u8; len]))
    }

    pub fn byte_len(&self) -> usize {
        match self {
            TensorData::Host(bytes) => bytes.len(),
            TensorData::Device { len, .. } => *len,
        }
    }

    /// Address of the first byte; identity for zero-copy checks
    pub fn data_ptr(&self) -> usize {
        match self {
            TensorData::Host(bytes) => bytes.as_ptr() as usize,
            TensorData::Device { ptr, .. } => ptr.0 as usize,
        }
    }

    /// Host bytes, if resident on the host
    pub fn host_bytes(&self) -> Option<&[u8]> {
        match self {
            TensorData::Host(bytes) => Some(bytes),
            TensorData::Device { .. } => None,
        }
    }
}

/// Tensor as supplied to and returned from the public API
#[derive(Debug, Clone)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub data: TensorData,
}

impl Tensor {
    /// Build a host tensor, checking that the byte length matches the shape
    pub fn from_bytes(desc: TensorDesc, bytes: impl Into<Arc<[u8]>>) -> Result<Self> {
        let data = TensorData::Host(bytes.into());
        check_byte_len(&desc, &data)?;
        Ok(Self { desc, data })
    }

    /// Build a host tensor from f32 values
    pub fn from_f32(dims: impl Into<Vec<i64>>, values: &[f32]) -> Result<Self> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(TensorDesc::new(dims, DType::F32), bytes)
    }

    /// Zero-filled host tensor for a static descriptor
    pub fn zeros(desc: TensorDesc) -> Result<Self> {
        let len = desc.byte_size().ok_or_else(|| {
            SessionError::InvalidParameter(format!("cannot allocate dynamic shape {}", desc))
        })?;
        Ok(Self {
            desc,
            data: TensorData::zeroed(len),
        })
    }

    /// Wrap externally owned device memory
    pub fn device(desc: TensorDesc, ptr: DevicePtr, len: usize) -> Self {
        Self {
            desc,
            data: TensorData::Device { ptr, len },
        }
    }

    /// Decode host contents as f32 values
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.desc.dtype != DType::F32 {
            return None;
        }
        let bytes = self.data.host_bytes()?;
        Some(
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }
}

/// Tensor in an executor's native representation
#[derive(Debug, Clone)]
pub struct NativeTensor {
    pub dims: Vec<i64>,
    pub dtype: DType,
    pub storage: TensorData,
}

impl NativeTensor {
    pub fn desc(&self) -> TensorDesc {
        TensorDesc::new(self.dims.clone(), self.dtype)
    }
}

/// How a conversion treats the underlying bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionMode {
    /// Share the caller's storage; the data pointer is preserved
    View,
    /// Copy host bytes into fresh storage
    Copy,
}

/// Bidirectional conversion between [`Tensor`] and [`NativeTensor`]
pub trait TensorAdapter: Send + Sync {
    fn to_native(&self, tensor: &Tensor, mode: ConversionMode) -> Result<NativeTensor>;

    fn from_native(&self, tensor: NativeTensor, mode: ConversionMode) -> Result<Tensor>;

    fn to_native_all(&self, tensors: &[Tensor], mode: ConversionMode) -> Result<Vec<NativeTensor>> {
        tensors.iter().map(|t| self.to_native(t, mode)).collect()
    }

    fn from_native_all(
        &self,
        tensors: Vec<NativeTensor>,
        mode: ConversionMode,
    ) -> Result<Vec<Tensor>> {
        tensors
            .into_iter()
            .map(|t| self.from_native(t, mode))
            .collect()
    }
}

/// Adapter for executors whose native tensors share the caller's layout.
///
/// Device storage is always passed by reference: `Copy` only duplicates host
/// bytes, since device memory has no owner on this side of the adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTensorAdapter;

impl TensorAdapter for DefaultTensorAdapter {
    fn to_native(&self, tensor: &Tensor, mode: ConversionMode) -> Result<NativeTensor> {
        check_byte_len(&tensor.desc, &tensor.data)?;
        Ok(NativeTensor {
            dims: tensor.desc.dims.clone(),
            dtype: tensor.desc.dtype,
            storage: convert_storage(&tensor.data, mode),
        })
    }

    fn from_native(&self, tensor: NativeTensor, mode: ConversionMode) -> Result<Tensor> {
        let desc = TensorDesc::new(tensor.dims, tensor.dtype);
        let data = match mode {
            ConversionMode::View => tensor.storage,
            ConversionMode::Copy => convert_storage(&tensor.storage, mode),
        };
        check_byte_len(&desc, &data)?;
        Ok(Tensor { desc, data })
    }
}

fn convert_storage(data: &TensorData, mode: ConversionMode) -> TensorData {
    match (mode, data) {
        (ConversionMode::Copy, TensorData::Host(bytes)) => TensorData::Host(Arc::from(bytes.to_vec())),
        _ => data.clone(),
    }
}

fn check_byte_len(desc: &TensorDesc, data: &TensorData) -> Result<()> {
    let expected = desc.byte_size().ok_or_else(|| {
        SessionError::InvalidParameter(format!("concrete tensor has dynamic shape {}", desc))
    })?;
    if data.byte_len() != expected {
        return Err(SessionError::InvalidParameter(format!(
            "tensor {} expects {} bytes, storage holds {}",
            desc,
            expected,
            data.byte_len()
        )));
    }
    Ok(())
}

//! Model parameters as an ordered sequence of named tensors.
//!
//! A `ParameterSet` is an immutable snapshot: the coordinator shares it behind an `Arc`
//! and replaces it wholesale after every aggregation. Tensors keep their storage precision
//! (`f32` or `f64`); on the wire and on disk element bytes are little-endian, base64 encoded,
//! so values survive bit-for-bit (NaN payloads included).

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
}

impl DType {
    pub fn size_of(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => f.write_str("f32"),
            DType::F64 => f.write_str("f64"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(vec![0.0; len]),
            DType::F64 => TensorData::F64(vec![0.0; len]),
        }
    }

    /// Element `i` widened to `f64`.
    #[inline]
    pub fn get_f64(&self, i: usize) -> f64 {
        match self {
            TensorData::F32(v) => v[i] as f64,
            TensorData::F64(v) => v[i],
        }
    }

    /// Narrow an `f64` buffer into the given storage precision.
    pub fn from_f64(dtype: DType, values: Vec<f64>) -> Self {
        match dtype {
            DType::F32 => TensorData::F32(values.into_iter().map(|v| v as f32).collect()),
            DType::F64 => TensorData::F64(values),
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorData::F64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    pub fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        if bytes.len() % dtype.size_of() != 0 {
            return Err(FlError::Snapshot(format!("{} bytes is not a whole number of {dtype} elements", bytes.len())));
        }
        Ok(match dtype {
            DType::F32 => TensorData::F32(
                bytes.chunks_exact(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect(),
            ),
            DType::F64 => TensorData::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
        })
    }
}

/// Shape and precision of one tensor, used to detect model drift.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorLayout {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}

/// Elements a shape holds; a shape whose product overflows `usize` is rejected.
pub fn element_count(shape: &[usize]) -> Result<usize> {
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| FlError::Snapshot(format!("shape {shape:?} has too many elements")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorRecord", into = "TensorRecord")]
pub struct Tensor {
    name: String,
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: TensorData) -> Result<Self> {
        let name = name.into();
        let expected = element_count(&shape).map_err(|e| FlError::Snapshot(format!("tensor {name}: {e}")))?;
        if data.len() != expected {
            return Err(FlError::Snapshot(format!(
                "tensor {name}: shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { name, shape, data })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn layout(&self) -> TensorLayout {
        TensorLayout { shape: self.shape.clone(), dtype: self.dtype() }
    }

    /// Same values bit for bit, which `PartialEq` cannot promise for NaN.
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        self.name == other.name && self.shape == other.shape && self.data.to_le_bytes() == other.data.to_le_bytes()
    }
}

/// Serialized form of a tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorRecord {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: String,
}

impl From<Tensor> for TensorRecord {
    fn from(t: Tensor) -> Self {
        TensorRecord { dtype: t.dtype(), data: STANDARD.encode(t.data.to_le_bytes()), name: t.name, shape: t.shape }
    }
}

impl TryFrom<TensorRecord> for Tensor {
    type Error = FlError;

    fn try_from(r: TensorRecord) -> Result<Self> {
        let bytes = STANDARD
            .decode(r.data.as_bytes())
            .map_err(|e| FlError::Snapshot(format!("tensor {}: invalid base64: {e}", r.name)))?;
        let data = TensorData::from_le_bytes(r.dtype, &bytes)?;
        Tensor::new(r.name, r.shape, data)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet {
    tensors: Vec<Tensor>,
}

impl ParameterSet {
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    pub fn into_tensors(self) -> Vec<Tensor> {
        self.tensors
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.iter()
    }

    pub fn layout(&self) -> Vec<TensorLayout> {
        self.tensors.iter().map(Tensor::layout).collect()
    }

    pub fn num_elements(&self) -> usize {
        self.tensors.iter().map(Tensor::len).sum()
    }

    /// Require `other` to have exactly this set's tensor count, shapes and dtypes.
    /// Names are not compared: clients may label tensors differently.
    pub fn ensure_same_layout(&self, other: &ParameterSet) -> Result<()> {
        let count = self.len().max(other.len());
        for index in 0..count {
            let expected = self.tensors.get(index).map(Tensor::layout);
            let found = other.tensors.get(index).map(Tensor::layout);
            if expected != found {
                return Err(FlError::shape_mismatch(index, expected.as_ref(), found.as_ref()));
            }
        }
        Ok(())
    }

    pub fn bit_eq(&self, other: &ParameterSet) -> bool {
        self.len() == other.len() && self.tensors.iter().zip(&other.tensors).all(|(a, b)| a.bit_eq(b))
    }

    /// SHA-256 over names, dtypes, shapes and element bytes, hex encoded.
    pub fn digest(&self) -> String {
        let mut h = Sha256::new();
        for t in &self.tensors {
            h.update((t.name.len() as u64).to_le_bytes());
            h.update(t.name.as_bytes());
            h.update(t.dtype().to_string().as_bytes());
            h.update((t.shape.len() as u64).to_le_bytes());
            for d in &t.shape {
                h.update((*d as u64).to_le_bytes());
            }
            h.update(t.data.to_le_bytes());
        }
        hex::encode(h.finalize())
    }
}

impl FromIterator<Tensor> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = Tensor>>(iter: I) -> Self {
        Self { tensors: iter.into_iter().collect() }
    }
}

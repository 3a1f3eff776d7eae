//! Tensor helpers on top of `candle_core`.
//!
//! Tensors are candle tensors throughout. What lives here is the glue the
//! broadcast path needs: offsets for varlen kernels, integer readback, and
//! the host-side wire form a tensor takes when a [`crate::TensorDict`] goes
//! through serde.

use anyhow::{bail, Result};
use candle_core::WithDType;
use serde::{Deserialize, Serialize};

pub use candle_core::{DType, Device, Tensor};

/// 1-D tensor of `data` on `device`.
pub fn from_vec1<T: WithDType>(data: Vec<T>, device: &Device) -> Result<Tensor> {
    let len = data.len();
    Ok(Tensor::from_vec(data, (len,), device)?)
}

/// Prefix sums of `seqlens` as a `[n + 1]` u32 tensor, plus the max length.
pub fn to_offsets(
    seqlens: impl Iterator<Item = usize>,
    device: &Device,
) -> Result<(usize, Tensor)> {
    let mut offsets = Vec::new();
    let mut offset = 0;
    let mut max = 0;
    for len in seqlens {
        max = std::cmp::max(len, max);
        offsets.push(offset as u32);
        offset += len;
    }
    offsets.push(offset as u32);
    Ok((max, from_vec1(offsets, device)?))
}

/// Integer contents widened to i64, for index-like tensors.
pub fn to_index_vec(t: &Tensor) -> Result<Vec<i64>> {
    match t.dtype() {
        DType::U8 | DType::U32 | DType::I64 => {
            Ok(t.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?)
        }
        dtype => bail!("{:?} tensor used as index", dtype),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum WireData {
    U8(Vec<u8>),
    U32(Vec<u32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Host copy of a tensor: row-major data plus its dims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireTensor {
    shape: Vec<usize>,
    data: WireData,
}

impl WireTensor {
    fn from_tensor(t: &Tensor) -> Result<Self> {
        let flat = t.flatten_all()?;
        let data = match t.dtype() {
            DType::U8 => WireData::U8(flat.to_vec1()?),
            DType::U32 => WireData::U32(flat.to_vec1()?),
            DType::I64 => WireData::I64(flat.to_vec1()?),
            DType::F32 => WireData::F32(flat.to_vec1()?),
            DType::F64 => WireData::F64(flat.to_vec1()?),
            dtype => bail!("{:?} tensors have no wire form", dtype),
        };
        Ok(Self {
            shape: t.dims().to_vec(),
            data,
        })
    }

    // tensors always arrive on the CPU; the receiver moves them
    fn into_tensor(self) -> Result<Tensor> {
        let WireTensor { shape, data } = self;
        let dev = &Device::Cpu;
        let t = match data {
            WireData::U8(v) => Tensor::from_vec(v, shape, dev)?,
            WireData::U32(v) => Tensor::from_vec(v, shape, dev)?,
            WireData::I64(v) => Tensor::from_vec(v, shape, dev)?,
            WireData::F32(v) => Tensor::from_vec(v, shape, dev)?,
            WireData::F64(v) => Tensor::from_vec(v, shape, dev)?,
        };
        Ok(t)
    }
}

/// Same dtype, dims and elements, wherever the two tensors live.
pub fn same_contents(a: &Tensor, b: &Tensor) -> bool {
    match (WireTensor::from_tensor(a), WireTensor::from_tensor(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// `#[serde(with = "crate::tensor::wire")]` for tensor-valued fields.
pub(crate) mod wire {
    use super::{Tensor, WireTensor};
    use serde::{de, ser, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(t: &Tensor, s: S) -> Result<S::Ok, S::Error> {
        WireTensor::from_tensor(t)
            .map_err(ser::Error::custom)?
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Tensor, D::Error> {
        WireTensor::deserialize(d)?
            .into_tensor()
            .map_err(de::Error::custom)
    }
}

use crate::error::{Error, ErrorFlags, Result};
use crate::format::{QUANT_BLOCK, StorageType, TensorHeader};
use crate::quant;
use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use std::fmt;

/// Owned element storage of a weight tensor.
#[derive(Clone)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    /// Raw blocks of the tensor's quantized storage type.
    Quantized(Vec<u8>),
}

/// An immutable weight tensor: `height` rows of `width` contiguous elements.
#[derive(Clone)]
pub struct Tensor {
    name: String,
    data_type: StorageType,
    dim_count: u32,
    width: usize,
    height: usize,
    data: TensorData,
}

impl Tensor {
    /// Decodes a payload read from a model file.
    pub fn from_bytes(name: impl Into<String>, header: &TensorHeader, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        let expected = header.payload_size()?;
        if bytes.len() != expected {
            return Error::fail(
                ErrorFlags::FILE_READ,
                format!("Tensor '{name}' payload is {} bytes, expected {expected}", bytes.len()),
            );
        }

        let data = match header.data_type {
            StorageType::F32 => {
                let mut values = vec![0.0f32; header.element_count()?];
                LittleEndian::read_f32_into(bytes, &mut values);
                TensorData::F32(values)
            }
            StorageType::F16 => {
                let mut bits = vec![0u16; header.element_count()?];
                LittleEndian::read_u16_into(bytes, &mut bits);
                TensorData::F16(bits.into_iter().map(f16::from_bits).collect())
            }
            _ => TensorData::Quantized(bytes.to_vec()),
        };

        Ok(Self {
            name,
            data_type: header.data_type,
            dim_count: header.dim_count,
            width: header.width as usize,
            height: header.height as usize,
            data,
        })
    }

    pub fn from_f32(name: impl Into<String>, width: usize, height: Option<usize>, values: Vec<f32>) -> Self {
        debug_assert_eq!(values.len(), width * height.unwrap_or(1));
        Self {
            name: name.into(),
            data_type: StorageType::F32,
            dim_count: if height.is_some() { 2 } else { 1 },
            width,
            height: height.unwrap_or(1),
            data: TensorData::F32(values),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> StorageType {
        self.data_type
    }

    pub fn dim_count(&self) -> u32 {
        self.dim_count
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn element_count(&self) -> usize {
        self.width * self.height
    }

    pub fn size_in_bytes(&self) -> usize {
        match &self.data {
            TensorData::F32(values) => values.len() * 4,
            TensorData::F16(values) => values.len() * 2,
            TensorData::Quantized(bytes) => bytes.len(),
        }
    }

    /// The elements as f32, when stored that way.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Some(values),
            _ => None,
        }
    }

    /// Converts to f32 storage, dequantizing if needed.
    pub fn into_f32(self) -> Self {
        if self.data_type == StorageType::F32 {
            return self;
        }

        let mut values = vec![0.0f32; self.element_count()];
        for row in 0..self.height {
            self.row_to_f32(row, &mut values[row * self.width..(row + 1) * self.width]);
        }
        Self { data_type: StorageType::F32, data: TensorData::F32(values), ..self }
    }

    /// Decodes row `row` into `out` (length `width`).
    pub fn row_to_f32(&self, row: usize, out: &mut [f32]) {
        debug_assert_eq!(out.len(), self.width);
        let start = row * self.width;
        match &self.data {
            TensorData::F32(values) => out.copy_from_slice(&values[start..start + self.width]),
            TensorData::F16(values) => {
                for (o, v) in out.iter_mut().zip(&values[start..start + self.width]) {
                    *o = v.to_f32();
                }
            }
            TensorData::Quantized(bytes) => quant::dequantize_row(self.data_type, self.row_bytes(bytes, row), out),
        }
    }

    /// Dot product of row `row` with `x`, accumulated strictly left to right.
    ///
    /// The summation order depends only on the row, never on how many rows or
    /// threads a caller uses, so repeated products are bit-identical.
    #[inline]
    pub fn row_dot(&self, row: usize, x: &[f32]) -> f32 {
        debug_assert_eq!(x.len(), self.width);
        let start = row * self.width;
        match &self.data {
            TensorData::F32(values) => values[start..start + self.width].iter().zip(x).fold(0.0, |acc, (w, x)| acc + w * x),
            TensorData::F16(values) => {
                values[start..start + self.width].iter().zip(x).fold(0.0, |acc, (w, x)| acc + w.to_f32() * x)
            }
            TensorData::Quantized(bytes) => {
                let block_bytes = self.data_type.block_bytes().unwrap_or(0);
                let mut decoded = [0.0f32; QUANT_BLOCK];
                let mut acc = 0.0;
                for (block, xs) in self.row_bytes(bytes, row).chunks_exact(block_bytes).zip(x.chunks_exact(QUANT_BLOCK)) {
                    quant::dequantize_block(self.data_type, block, &mut decoded);
                    acc = decoded.iter().zip(xs).fold(acc, |acc, (w, x)| acc + w * x);
                }
                acc
            }
        }
    }

    fn row_bytes<'a>(&self, bytes: &'a [u8], row: usize) -> &'a [u8] {
        let row_size = self.data_type.payload_bytes(self.width).unwrap_or(0);
        &bytes[row * row_size..(row + 1) * row_size]
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("name", &self.name)
            .field("data_type", &self.data_type)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.size_in_bytes())
            .finish()
    }
}

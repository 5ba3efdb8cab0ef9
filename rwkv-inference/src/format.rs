//! On-disk model format: file header, tensor records and the storage-type table.
//!
//! All integers are little-endian `u32`. A file is one [`FileHeader`] followed by
//! tensor records until end of file. Each record is a [`TensorHeader`], the tensor
//! name bytes, and a payload whose size follows from the storage type's block layout.

use crate::error::{Error, ErrorFlags, Result, io_error};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Magic number at the start of every model file ("ggmf").
pub const FILE_MAGIC: u32 = 0x67676d66;
/// Oldest readable format version.
pub const FILE_VERSION_MIN: u32 = 100;
/// Newest readable format version.
pub const FILE_VERSION_MAX: u32 = 101;
/// Version written by the quantizer and the writers in this module.
pub const FILE_VERSION_CURRENT: u32 = FILE_VERSION_MAX;
/// Quantized payloads are only understood from this version on.
const QUANTIZED_MIN_VERSION: u32 = 101;
/// Elements per block for every quantized storage type.
pub const QUANT_BLOCK: usize = 32;

/// Element encoding of a tensor or of a whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    /// Retired, rejected on load.
    Q4_1O,
    /// Retired, rejected on load.
    Q4_2,
    /// Retired, rejected on load.
    Q4_3,
    Q5_0,
    Q5_1,
    Q8_0,
}

impl StorageType {
    pub const ALL: [StorageType; 10] = [
        Self::F32,
        Self::F16,
        Self::Q4_0,
        Self::Q4_1,
        Self::Q4_1O,
        Self::Q4_2,
        Self::Q4_3,
        Self::Q5_0,
        Self::Q5_1,
        Self::Q8_0,
    ];

    /// Targets accepted by the quantizer.
    pub const QUANTIZED: [StorageType; 5] = [Self::Q4_0, Self::Q4_1, Self::Q5_0, Self::Q5_1, Self::Q8_0];

    pub fn id(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q4_1O => 4,
            Self::Q4_2 => 5,
            Self::Q4_3 => 6,
            Self::Q5_0 => 7,
            Self::Q5_1 => 8,
            Self::Q8_0 => 9,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "float32",
            Self::F16 => "float16",
            Self::Q4_0 => "Q4_0",
            Self::Q4_1 => "Q4_1",
            Self::Q4_1O => "Q4_1_O",
            Self::Q4_2 => "Q4_2",
            Self::Q4_3 => "Q4_3",
            Self::Q5_0 => "Q5_0",
            Self::Q5_1 => "Q5_1",
            Self::Q8_0 => "Q8_0",
        }
    }

    pub fn is_quantized(self) -> bool {
        !matches!(self, Self::F32 | Self::F16)
    }

    /// Formats that older releases wrote and that can no longer be decoded.
    pub fn is_retired(self) -> bool {
        matches!(self, Self::Q4_1O | Self::Q4_2 | Self::Q4_3)
    }

    pub fn block_elements(self) -> usize {
        if self.is_quantized() { QUANT_BLOCK } else { 1 }
    }

    /// Bytes per block, `None` for retired formats.
    pub fn block_bytes(self) -> Option<usize> {
        match self {
            Self::F32 => Some(4),
            Self::F16 => Some(2),
            Self::Q4_0 => Some(18),
            Self::Q4_1 => Some(20),
            Self::Q5_0 => Some(22),
            Self::Q5_1 => Some(24),
            Self::Q8_0 => Some(34),
            Self::Q4_1O | Self::Q4_2 | Self::Q4_3 => None,
        }
    }

    /// Payload size of `elements` values, or `None` when the count is not block aligned,
    /// the format is retired or the size overflows `usize`.
    pub fn payload_bytes(self, elements: usize) -> Option<usize> {
        let block = self.block_elements();
        if elements % block != 0 {
            return None;
        }
        self.block_bytes()?.checked_mul(elements / block)
    }

    /// Rejects retired formats with a dedicated message.
    pub fn ensure_supported(self) -> Result<Self> {
        if self.is_retired() {
            return Error::fail(
                ErrorFlags::DATA_TYPE | ErrorFlags::UNSUPPORTED,
                format!("Storage type {self} was removed; re-quantize the model from a float32 or float16 file"),
            );
        }
        Ok(self)
    }
}

impl TryFrom<u32> for StorageType {
    type Error = Error;

    fn try_from(id: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.id() == id)
            .ok_or_else(|| Error::new(ErrorFlags::DATA_TYPE, format!("Unknown storage type id {id}")))
    }
}

impl FromStr for StorageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::new(ErrorFlags::ARGS | ErrorFlags::DATA_TYPE, format!("Unknown storage type '{s}'")))
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// Reads one little-endian u32 field, tagging truncation as a read failure.
macro_rules! read_u32 {
    ($reader:expr, $field:literal) => {
        $reader
            .read_u32::<LittleEndian>()
            .map_err(io_error(ErrorFlags::FILE_READ, concat!("Failed to read ", $field)))?
    };
}

/// The fixed-size preamble of a model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub magic: u32,
    pub version: u32,
    pub n_vocab: u32,
    pub n_embed: u32,
    pub n_layer: u32,
    pub data_type: StorageType,
}

impl FileHeader {
    pub const SIZE: usize = 24;

    pub fn new(n_vocab: u32, n_embed: u32, n_layer: u32, data_type: StorageType) -> Self {
        Self { magic: FILE_MAGIC, version: FILE_VERSION_CURRENT, n_vocab, n_embed, n_layer, data_type }
    }

    /// Reads and validates a header. Fails on the first violated field.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let magic = read_u32!(reader, "magic");
        if magic != FILE_MAGIC {
            return Error::fail(
                ErrorFlags::FILE_MAGIC,
                format!("Invalid file magic: expected {FILE_MAGIC:#x}, got {magic:#x}"),
            );
        }

        let version = read_u32!(reader, "version");
        if !(FILE_VERSION_MIN..=FILE_VERSION_MAX).contains(&version) {
            return Error::fail(
                ErrorFlags::FILE_VERSION,
                format!("Unsupported file version {version}, expected {FILE_VERSION_MIN}..={FILE_VERSION_MAX}"),
            );
        }

        let n_vocab = read_u32!(reader, "vocabulary size");
        let n_embed = read_u32!(reader, "embedding width");
        let n_layer = read_u32!(reader, "layer count");
        let data_type = StorageType::try_from(read_u32!(reader, "storage type"))?.ensure_supported()?;

        if data_type.is_quantized() && version < QUANTIZED_MIN_VERSION {
            return Error::fail(
                ErrorFlags::FILE_VERSION | ErrorFlags::UNSUPPORTED,
                format!("Quantized {data_type} files of version {version} use an old block layout; re-quantize the model"),
            );
        }

        Ok(Self { magic, version, n_vocab, n_embed, n_layer, data_type })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let fields = [self.magic, self.version, self.n_vocab, self.n_embed, self.n_layer, self.data_type.id()];
        for field in fields {
            writer.write_u32::<LittleEndian>(field).map_err(io_error(ErrorFlags::FILE_WRITE, "Failed to write file header"))?;
        }
        Ok(())
    }
}

/// Per-tensor record header. One-dimensional tensors have `height == 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorHeader {
    pub dim_count: u32,
    pub key_length: u32,
    pub data_type: StorageType,
    pub width: u32,
    pub height: u32,
}

impl TensorHeader {
    pub fn vector(key_length: usize, data_type: StorageType, width: usize) -> Self {
        Self { dim_count: 1, key_length: key_length as u32, data_type, width: width as u32, height: 1 }
    }

    pub fn matrix(key_length: usize, data_type: StorageType, width: usize, height: usize) -> Self {
        Self { dim_count: 2, key_length: key_length as u32, data_type, width: width as u32, height: height as u32 }
    }

    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let dim_count = read_u32!(reader, "tensor dimension count");
        let key_length = read_u32!(reader, "tensor name length");
        let data_type = StorageType::try_from(read_u32!(reader, "tensor storage type"))?.ensure_supported()?;
        let width = read_u32!(reader, "tensor width");
        let height = match dim_count {
            1 => 1,
            2 => read_u32!(reader, "tensor height"),
            _ => return Error::fail(ErrorFlags::SHAPE, format!("Tensor has {dim_count} dimensions, only 1 or 2 are supported")),
        };

        let header = Self { dim_count, key_length, data_type, width, height };
        header.payload_size()?;
        Ok(header)
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        let fields = [self.dim_count, self.key_length, self.data_type.id(), self.width, self.height];
        let count = if self.dim_count == 2 { 5 } else { 4 };
        for field in &fields[..count] {
            writer
                .write_u32::<LittleEndian>(*field)
                .map_err(io_error(ErrorFlags::FILE_WRITE, "Failed to write tensor header"))?;
        }
        Ok(())
    }

    pub fn element_count(&self) -> Result<usize> {
        (self.width as usize).checked_mul(self.height as usize).ok_or_else(|| self.oversized())
    }

    /// Payload size in bytes. Quantized rows must hold whole blocks.
    pub fn payload_size(&self) -> Result<usize> {
        let elements = self.element_count()?;
        if self.width as usize % self.data_type.block_elements() != 0 {
            return Error::fail(
                ErrorFlags::SHAPE,
                format!("Tensor width {} is not a multiple of the {} block size", self.width, self.data_type),
            );
        }
        self.data_type.payload_bytes(elements).ok_or_else(|| self.oversized())
    }

    fn oversized(&self) -> Error {
        Error::new(
            ErrorFlags::SHAPE,
            format!("Tensor of {}x{} {} values has no addressable payload size", self.width, self.height, self.data_type),
        )
    }
}

/// Reads a tensor header and its name, leaving the reader at the payload.
pub fn read_tensor_header<R: Read>(reader: &mut R) -> Result<(TensorHeader, String)> {
    let header = TensorHeader::read(reader)?;

    let mut key = Vec::with_capacity(header.key_length.min(1024) as usize);
    reader
        .take(header.key_length as u64)
        .read_to_end(&mut key)
        .map_err(io_error(ErrorFlags::FILE_READ, "Failed to read tensor name"))?;
    if key.len() != header.key_length as usize {
        return Error::fail(ErrorFlags::FILE_READ, format!("Tensor name truncated: expected {} bytes", header.key_length));
    }

    let name = String::from_utf8(key).map_err(|_| Error::new(ErrorFlags::KEY, "Tensor name is not valid UTF-8"))?;
    Ok((header, name))
}

/// Writes a complete tensor record; the payload must match the header's size.
pub fn write_tensor<W: Write>(writer: &mut W, header: &TensorHeader, name: &str, payload: &[u8]) -> Result<()> {
    let expected = header.payload_size()?;
    if payload.len() != expected || header.key_length as usize != name.len() {
        return Error::fail(
            ErrorFlags::ARGS | ErrorFlags::DATA,
            format!("Tensor '{name}' payload is {} bytes, header expects {expected}", payload.len()),
        );
    }

    header.write(writer)?;
    writer.write_all(name.as_bytes()).map_err(io_error(ErrorFlags::FILE_WRITE, "Failed to write tensor name"))?;
    writer.write_all(payload).map_err(io_error(ErrorFlags::FILE_WRITE, "Failed to write tensor payload"))?;
    Ok(())
}

/// Writes an f32 tensor record, encoding the values as `data_type` (f32 or f16).
pub fn write_float_tensor<W: Write>(
    writer: &mut W,
    name: &str,
    data_type: StorageType,
    width: usize,
    height: Option<usize>,
    values: &[f32],
) -> Result<()> {
    let header = match height {
        Some(height) => TensorHeader::matrix(name.len(), data_type, width, height),
        None => TensorHeader::vector(name.len(), data_type, width),
    };

    let payload = match data_type {
        StorageType::F32 => values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>(),
        StorageType::F16 => values.iter().flat_map(|&v| half::f16::from_f32(v).to_le_bytes()).collect(),
        other => return Error::fail(ErrorFlags::ARGS | ErrorFlags::DATA_TYPE, format!("{other} is not a float storage type")),
    };

    write_tensor(writer, &header, name, &payload)
}

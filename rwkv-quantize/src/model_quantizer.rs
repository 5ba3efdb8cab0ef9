#[cfg(test)]
#[path = "../tests/unit/model_quantizer_test.rs"]
mod model_quantizer_test;

use byteorder::{ByteOrder, LittleEndian};
use half::f16;
use log::{debug, info};
use rayon::prelude::*;
use rwkv_inference::format::{FILE_VERSION_CURRENT, QUANT_BLOCK, read_tensor_header, write_tensor};
use rwkv_inference::model::{EMBEDDING_TENSOR, HEAD_TENSOR, parameter_shapes};
use rwkv_inference::quant::{Histogram, normalize_histogram, quantize_row};
use rwkv_inference::{Error, ErrorFlags, FileHeader, Result, ResultExt, StorageType, TensorHeader};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::utils::ProgressTracker;

fn io_failure(flags: ErrorFlags, what: impl std::fmt::Display) -> impl FnOnce(io::Error) -> Error {
    move |e| Error::new(ErrorFlags::FILE | flags, format!("{what}: {e}"))
}

/// Summary of one quantization run.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizeReport {
    pub target: StorageType,
    pub tensor_count: usize,
    pub quantized_count: usize,
    /// Payload bytes read from the source.
    pub original_bytes: usize,
    /// Payload bytes actually written, quantized or copied.
    pub written_bytes: usize,
    /// Share of quantized codes per bucket.
    pub histogram: [f64; 16],
}

impl QuantizeReport {
    fn new(target: StorageType) -> Self {
        Self { target, tensor_count: 0, quantized_count: 0, original_bytes: 0, written_bytes: 0, histogram: [0.0; 16] }
    }

    pub fn compression_ratio(&self) -> f64 {
        self.original_bytes as f64 / self.written_bytes.max(1) as f64
    }
}

/// Streams a float model file into a block-quantized copy, one tensor at a time.
#[derive(Debug, Clone)]
pub struct ModelQuantizer {
    target: StorageType,
    show_progress: bool,
}

impl ModelQuantizer {
    pub fn new(target: StorageType) -> Result<Self> {
        let target = target.ensure_supported().flag(ErrorFlags::ARGS)?;
        if !target.is_quantized() {
            return Err(Error::new(
                ErrorFlags::ARGS | ErrorFlags::DATA_TYPE,
                format!("{target} is not a quantized storage type"),
            ));
        }
        Ok(Self { target, show_progress: false })
    }

    /// Draws a progress bar on stdout while quantizing.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.show_progress = enabled;
        self
    }

    pub fn target(&self) -> StorageType {
        self.target
    }

    /// Only float 2-D tensors other than the embedding and the head are quantized.
    pub fn should_quantize(name: &str, header: &TensorHeader) -> bool {
        header.dim_count == 2
            && matches!(header.data_type, StorageType::F32 | StorageType::F16)
            && name != EMBEDDING_TENSOR
            && name != HEAD_TENSOR
    }

    /// Reads `src` and writes the quantized model to `dst`.
    ///
    /// **Steps:**
    /// 1. Validate the source header; only float32 and float16 files are accepted
    /// 2. Write the header with the target type and the current format version
    /// 3. For each tensor record: quantize it, or copy it through unchanged
    pub fn quantize_file(&self, src: &Path, dst: &Path) -> Result<QuantizeReport> {
        let source = File::open(src).map_err(io_failure(ErrorFlags::FILE_OPEN, format!("Failed to open {}", src.display())))?;
        let mut reader = BufReader::new(source);

        let header = FileHeader::read(&mut reader).flag(ErrorFlags::FILE)?;
        if !matches!(header.data_type, StorageType::F32 | StorageType::F16) {
            return Err(Error::new(
                ErrorFlags::ARGS | ErrorFlags::DATA_TYPE | ErrorFlags::UNSUPPORTED,
                format!("Source model is {}, only float32 and float16 models can be quantized", header.data_type),
            ));
        }

        let target = File::create(dst).map_err(io_failure(ErrorFlags::FILE_OPEN, format!("Failed to create {}", dst.display())))?;
        let mut writer = BufWriter::new(target);
        FileHeader { version: FILE_VERSION_CURRENT, data_type: self.target, ..header }.write(&mut writer).flag(ErrorFlags::FILE)?;

        info!("Quantizing {} ({}) to {}", src.display(), header.data_type, self.target);

        let progress = self.show_progress.then(|| ProgressTracker::new(parameter_shapes(&header, 0).len(), "Quantizing"));
        let mut report = QuantizeReport::new(self.target);
        let mut hist: Histogram = [0; 16];
        let mut payload = Vec::new();

        while !reader.fill_buf().map_err(io_failure(ErrorFlags::FILE_READ, "Failed to read tensor record"))?.is_empty() {
            let (tensor, name) = read_tensor_header(&mut reader).flag(ErrorFlags::FILE)?;
            let size = tensor.payload_size().flag(ErrorFlags::FILE)?;
            payload.clear();
            (&mut reader)
                .take(size as u64)
                .read_to_end(&mut payload)
                .map_err(io_failure(ErrorFlags::FILE_READ, format!("Failed to read payload of '{name}'")))?;
            if payload.len() != size {
                return Err(Error::new(
                    ErrorFlags::FILE | ErrorFlags::FILE_READ,
                    format!("Payload of '{name}' is {} bytes, expected {size}", payload.len()),
                ));
            }

            report.tensor_count += 1;
            report.original_bytes += payload.len();
            if let Some(progress) = &progress {
                progress.set_current(report.tensor_count, &name);
            }

            if !Self::should_quantize(&name, &tensor) {
                write_tensor(&mut writer, &tensor, &name, &payload).flag(ErrorFlags::FILE)?;
                report.written_bytes += payload.len();
                continue;
            }

            let values = widen(&tensor, &payload, &name)?;
            let quantized = self.quantize_tensor(&values, tensor.width as usize, &mut hist)?;
            write_tensor(&mut writer, &TensorHeader { data_type: self.target, ..tensor }, &name, &quantized)
                .flag(ErrorFlags::FILE)?;

            debug!(
                "{name} {}x{}: {} -> {}, {} -> {} bytes",
                tensor.width,
                tensor.height,
                tensor.data_type,
                self.target,
                payload.len(),
                quantized.len()
            );
            report.quantized_count += 1;
            report.written_bytes += quantized.len();
        }

        writer.flush().map_err(io_failure(ErrorFlags::FILE_WRITE, format!("Failed to write {}", dst.display())))?;
        report.histogram = normalize_histogram(&hist);

        info!(
            "Quantized {}/{} tensors: {:.2} MiB -> {:.2} MiB ({:.2}x)",
            report.quantized_count,
            report.tensor_count,
            report.original_bytes as f64 / (1024.0 * 1024.0),
            report.written_bytes as f64 / (1024.0 * 1024.0),
            report.compression_ratio()
        );
        info!("Histogram: {}", format_histogram(&report.histogram));

        Ok(report)
    }

    /// Quantizes a row-major matrix of rows `width` wide, rows in parallel.
    pub fn quantize_tensor(&self, values: &[f32], width: usize, hist: &mut Histogram) -> Result<Vec<u8>> {
        let row_bytes = match self.target.payload_bytes(width) {
            Some(bytes) if width > 0 && width % QUANT_BLOCK == 0 => bytes,
            _ => {
                return Err(Error::new(
                    ErrorFlags::SHAPE,
                    format!("Row width {width} is not a multiple of the {} block size", self.target),
                ));
            }
        };
        if values.len() % width != 0 {
            return Err(Error::new(
                ErrorFlags::ARGS | ErrorFlags::DIMENSION,
                format!("{} values do not form rows of {width}", values.len()),
            ));
        }

        let mut out = vec![0u8; values.len() / width * row_bytes];
        let counts = values
            .par_chunks(width)
            .zip(out.par_chunks_mut(row_bytes))
            .map(|(src, dst)| {
                let mut row_hist: Histogram = [0; 16];
                quantize_row(self.target, src, dst, &mut row_hist).map(|_| row_hist)
            })
            .try_reduce(
                || [0; 16],
                |mut acc, row| {
                    acc.iter_mut().zip(row).for_each(|(a, r)| *a += r);
                    Ok(acc)
                },
            )?;

        hist.iter_mut().zip(counts).for_each(|(h, c)| *h += c);
        Ok(out)
    }
}

/// Decodes a float payload to f32.
fn widen(header: &TensorHeader, payload: &[u8], name: &str) -> Result<Vec<f32>> {
    let mut values = vec![0.0f32; header.element_count()?];
    match header.data_type {
        StorageType::F32 => LittleEndian::read_f32_into(payload, &mut values),
        StorageType::F16 => {
            let mut bits = vec![0u16; values.len()];
            LittleEndian::read_u16_into(payload, &mut bits);
            values.iter_mut().zip(bits).for_each(|(v, b)| *v = f16::from_bits(b).to_f32());
        }
        other => {
            return Err(Error::new(
                ErrorFlags::DATA_TYPE | ErrorFlags::UNSUPPORTED,
                format!("Tensor '{name}' is already {other}; only float tensors can be quantized"),
            ));
        }
    }
    Ok(values)
}

fn format_histogram(histogram: &[f64; 16]) -> String {
    histogram.iter().map(|share| format!("{share:.3}")).collect::<Vec<_>>().join(" ")
}

//! Synthetic model files for integration tests.

#![allow(dead_code)]

use anyhow::Result;
use rwkv_inference::model::{ParameterShape, parameter_shapes};
use rwkv_inference::{FileHeader, StorageType};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const N_VOCAB: u32 = 256;
pub const N_EMBED: u32 = 32;
pub const N_LAYER: u32 = 2;
pub const FFN_WIDTH: usize = 128;

/// A prompt longer than every chunk size under test.
pub const LONG_PROMPT: &str = "hello world, this prompt has exactly seventy bytes in it for testing!!";

pub fn tiny_header(data_type: StorageType) -> FileHeader {
    FileHeader::new(N_VOCAB, N_EMBED, N_LAYER, data_type)
}

pub fn tiny_shapes(header: &FileHeader) -> Vec<ParameterShape> {
    parameter_shapes(header, FFN_WIDTH)
}

/// Values in the ranges a trained RWKV checkpoint would hold for this parameter.
pub fn synthetic_values(name: &str, len: usize, rng: &mut fastrand::Rng) -> Vec<f32> {
    let mut uniform = |lo: f32, hi: f32| lo + rng.f32() * (hi - lo);
    (0..len)
        .map(|_| {
            if name.contains("time_mix") {
                uniform(0.0, 1.0)
            } else if name.contains("time_decay") {
                -uniform(-1.0, 1.0).exp()
            } else if name.contains("time_first") {
                uniform(-0.5, 0.5)
            } else if name.contains("ln") && name.ends_with("weight") {
                uniform(0.9, 1.1)
            } else if name.ends_with("bias") {
                uniform(-0.05, 0.05)
            } else {
                uniform(-0.2, 0.2)
            }
        })
        .collect()
}

/// Writes `shapes` under `header`. Matrices use the header's storage type, vectors stay f32.
pub fn write_model(path: &Path, header: &FileHeader, shapes: &[ParameterShape]) -> Result<()> {
    let mut rng = fastrand::Rng::with_seed(7);
    let mut writer = BufWriter::new(File::create(path)?);
    header.write(&mut writer)?;

    for shape in shapes {
        let values = synthetic_values(&shape.name, shape.width * shape.height.unwrap_or(1), &mut rng);
        let data_type = if shape.height.is_some() { header.data_type } else { StorageType::F32 };
        rwkv_inference::format::write_float_tensor(&mut writer, &shape.name, data_type, shape.width, shape.height, &values)?;
    }

    writer.flush()?;
    Ok(())
}

/// A complete tiny model in `dir`.
pub fn write_tiny_model(dir: &TempDir, data_type: StorageType) -> Result<PathBuf> {
    let header = tiny_header(data_type);
    let path = dir.path().join(format!("tiny-{data_type}.bin"));
    write_model(&path, &header, &tiny_shapes(&header))?;
    Ok(path)
}

/// Byte-level tokens.
pub fn tokens(prompt: &str) -> Vec<u32> {
    prompt.bytes().map(u32::from).collect()
}

//! Tiny float model files for quantizer tests.

#![allow(dead_code)]

use anyhow::Result;
use rwkv_inference::format::write_float_tensor;
use rwkv_inference::model::parameter_shapes;
use rwkv_inference::{FileHeader, StorageType};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tempfile::TempDir;

pub const N_LAYER: u32 = 2;
pub const FFN_WIDTH: usize = 128;

/// Matrices quantized per block: four time-mixing and three channel-mixing projections.
pub const MATRICES_PER_LAYER: usize = 7;

fn synthetic_value(name: &str, rng: &mut fastrand::Rng) -> f32 {
    let mut uniform = |lo: f32, hi: f32| lo + rng.f32() * (hi - lo);
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
}

/// Writes a vocab-256, 32-wide, two-block model. Matrices use `data_type`, vectors f32.
pub fn write_tiny_model(dir: &TempDir, data_type: StorageType) -> Result<PathBuf> {
    let header = FileHeader::new(256, 32, N_LAYER, data_type);
    let path = dir.path().join(format!("tiny-{data_type}.bin"));
    let mut rng = fastrand::Rng::with_seed(2023);

    let mut writer = BufWriter::new(File::create(&path)?);
    header.write(&mut writer)?;
    for shape in parameter_shapes(&header, FFN_WIDTH) {
        let values: Vec<f32> =
            (0..shape.width * shape.height.unwrap_or(1)).map(|_| synthetic_value(&shape.name, &mut rng)).collect();
        let tensor_type = if shape.height.is_some() { data_type } else { StorageType::F32 };
        write_float_tensor(&mut writer, &shape.name, tensor_type, shape.width, shape.height, &values)?;
    }
    writer.flush()?;

    Ok(path)
}

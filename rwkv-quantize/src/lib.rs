//! # rwkv-quantize
//!
//! Rewrites float32 / float16 RWKV model files into block-quantized ones.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rwkv_inference::StorageType;
//! use rwkv_quantize::quantize_model_file;
//!
//! # fn main() -> anyhow::Result<()> {
//! let report = quantize_model_file("model-f16.bin", "model-q5_1.bin", StorageType::Q5_1)?;
//! println!("{} tensors quantized", report.quantized_count);
//! # Ok(())
//! # }
//! ```

pub mod model_quantizer;
mod utils;

pub use model_quantizer::{ModelQuantizer, QuantizeReport};

use rwkv_inference::{Result, StorageType, record_global};
use std::path::Path;

/// Quantizes `src` into `dst`, recording any failure in the process-wide error slot.
///
/// The 2-D weights of every block are encoded as `target`; the embedding, the
/// head and all 1-D parameters are copied unchanged.
pub fn quantize_model_file(src: impl AsRef<Path>, dst: impl AsRef<Path>, target: StorageType) -> Result<QuantizeReport> {
    let result = ModelQuantizer::new(target).and_then(|quantizer| quantizer.quantize_file(src.as_ref(), dst.as_ref()));
    record_global(result)
}

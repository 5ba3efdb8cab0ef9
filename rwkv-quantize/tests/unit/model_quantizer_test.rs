use super::*;
use rwkv_inference::quant::dequantize_row;

fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| ((i * 37 % 101) as f32 - 50.0) / 25.0).collect()
}

#[test]
fn test_target_must_be_a_live_quantized_type() {
    for target in StorageType::QUANTIZED {
        assert_eq!(ModelQuantizer::new(target).unwrap().target(), target);
    }

    let err = ModelQuantizer::new(StorageType::F16).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::ARGS | ErrorFlags::DATA_TYPE));

    let err = ModelQuantizer::new(StorageType::Q4_2).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::ARGS | ErrorFlags::UNSUPPORTED));
}

#[test]
fn test_should_quantize_skips_vectors_embedding_and_head() {
    let matrix = TensorHeader::matrix(0, StorageType::F32, 32, 32);
    let vector = TensorHeader::vector(0, StorageType::F32, 32);

    assert!(ModelQuantizer::should_quantize("blocks.0.att.key.weight", &matrix));
    assert!(ModelQuantizer::should_quantize("blocks.3.ffn.value.weight", &matrix));
    assert!(!ModelQuantizer::should_quantize("emb.weight", &matrix));
    assert!(!ModelQuantizer::should_quantize("head.weight", &matrix));
    assert!(!ModelQuantizer::should_quantize("blocks.0.ln1.weight", &vector));

    let quantized = TensorHeader::matrix(0, StorageType::Q8_0, 32, 32);
    assert!(!ModelQuantizer::should_quantize("blocks.0.att.key.weight", &quantized));
    let half = TensorHeader::matrix(0, StorageType::F16, 32, 32);
    assert!(ModelQuantizer::should_quantize("blocks.0.att.key.weight", &half));
}

#[test]
fn test_quantize_tensor_counts_every_value() {
    let quantizer = ModelQuantizer::new(StorageType::Q5_1).unwrap();
    let values = ramp(64 * 5);
    let mut hist: Histogram = [0; 16];

    let encoded = quantizer.quantize_tensor(&values, 64, &mut hist).unwrap();

    assert_eq!(encoded.len(), 5 * 2 * 24);
    assert_eq!(hist.iter().sum::<u64>(), values.len() as u64);

    let mut decoded = vec![0.0; values.len()];
    dequantize_row(StorageType::Q5_1, &encoded, &mut decoded);
    let max_error = values.iter().zip(&decoded).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max);
    assert!(max_error < 0.1, "max error {max_error}");
}

#[test]
fn test_parallel_rows_match_serial_rows() {
    let quantizer = ModelQuantizer::new(StorageType::Q4_0).unwrap();
    let values = ramp(32 * 9);

    let mut hist: Histogram = [0; 16];
    let encoded = quantizer.quantize_tensor(&values, 32, &mut hist).unwrap();

    let mut serial_hist: Histogram = [0; 16];
    let mut serial = vec![0u8; encoded.len()];
    quantize_row(StorageType::Q4_0, &values, &mut serial, &mut serial_hist).unwrap();

    assert_eq!(encoded, serial);
    assert_eq!(hist, serial_hist);
}

#[test]
fn test_quantize_tensor_rejects_bad_widths() {
    let quantizer = ModelQuantizer::new(StorageType::Q8_0).unwrap();
    let mut hist: Histogram = [0; 16];

    let err = quantizer.quantize_tensor(&ramp(48), 48, &mut hist).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::SHAPE));

    let err = quantizer.quantize_tensor(&ramp(48), 32, &mut hist).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::DIMENSION));
    assert_eq!(hist, [0; 16]);
}

#[test]
fn test_widen_float_payloads() {
    let values = [1.0f32, -2.5, 0.125, 65504.0];

    let f32_payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    let header = TensorHeader::vector(1, StorageType::F32, 4);
    assert_eq!(widen(&header, &f32_payload, "x").unwrap(), values);

    let f16_payload: Vec<u8> = values.iter().flat_map(|&v| f16::from_f32(v).to_le_bytes()).collect();
    let header = TensorHeader::vector(1, StorageType::F16, 4);
    assert_eq!(widen(&header, &f16_payload, "x").unwrap(), values);

    let header = TensorHeader::matrix(1, StorageType::Q8_0, 32, 1);
    let err = widen(&header, &[0; 34], "x").unwrap_err();
    assert!(err.flags().contains(ErrorFlags::UNSUPPORTED));
}

#[test]
fn test_report_ratio() {
    let report = QuantizeReport { original_bytes: 400, written_bytes: 100, ..QuantizeReport::new(StorageType::Q4_0) };
    assert_eq!(report.compression_ratio(), 4.0);
    assert_eq!(format_histogram(&[0.0; 16]).split(' ').count(), 16);
}

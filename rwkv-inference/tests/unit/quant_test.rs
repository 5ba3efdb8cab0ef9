use super::*;

fn sample_row(seed: u64, len: usize) -> Vec<f32> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..len).map(|_| rng.f32() * 2.0 - 1.0).collect()
}

fn roundtrip(data_type: StorageType, src: &[f32]) -> (Vec<f32>, Histogram) {
    let block_bytes = data_type.block_bytes().unwrap();
    let mut encoded = vec![0u8; src.len() / QUANT_BLOCK * block_bytes];
    let mut hist = Histogram::default();
    quantize_row(data_type, src, &mut encoded, &mut hist).unwrap();

    let mut decoded = vec![0.0; src.len()];
    dequantize_row(data_type, &encoded, &mut decoded);
    (decoded, hist)
}

// Step between adjacent codes for one block, as the quantizer derives it.
fn block_step(data_type: StorageType, block: &[f32]) -> f32 {
    let (min, max) = min_max(block);
    let amax = block.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    match data_type {
        StorageType::Q4_0 => amax / 8.0,
        StorageType::Q4_1 => (max - min) / 15.0,
        StorageType::Q5_0 => amax / 16.0,
        StorageType::Q5_1 => (max - min) / 31.0,
        StorageType::Q8_0 => amax / 127.0,
        other => panic!("{other} is not quantized"),
    }
}

#[test]
fn test_roundtrip_stays_within_one_step() {
    let src = sample_row(7, 8 * QUANT_BLOCK);

    for data_type in StorageType::QUANTIZED {
        let (decoded, _) = roundtrip(data_type, &src);

        for (block, out) in src.chunks(QUANT_BLOCK).zip(decoded.chunks(QUANT_BLOCK)) {
            let step = block_step(data_type, block);
            for (&x, &y) in block.iter().zip(out) {
                assert!(
                    (x - y).abs() <= step * 1.01 + 1e-3,
                    "{data_type}: {x} decoded as {y}, step {step}"
                );
            }
        }
    }
}

#[test]
fn test_rounding_error_is_half_step_for_asymmetric_formats() {
    let src = sample_row(11, 4 * QUANT_BLOCK);

    for data_type in [StorageType::Q4_1, StorageType::Q5_1, StorageType::Q8_0] {
        let (decoded, _) = roundtrip(data_type, &src);
        for (block, out) in src.chunks(QUANT_BLOCK).zip(decoded.chunks(QUANT_BLOCK)) {
            let step = block_step(data_type, block);
            for (&x, &y) in block.iter().zip(out) {
                assert!((x - y).abs() <= step * 0.5 + 2e-3, "{data_type}: {x} decoded as {y}");
            }
        }
    }
}

#[test]
fn test_q4_0_known_block() {
    let mut src = [0.0f32; QUANT_BLOCK];
    src[0] = -8.0;
    src[1] = 4.0;
    src[16] = 1.0;

    let mut encoded = [0u8; 18];
    let mut hist = Histogram::default();
    quantize_row(StorageType::Q4_0, &src, &mut encoded, &mut hist).unwrap();

    assert_eq!(read_half(&encoded[0..2]), 1.0);
    // -8 maps to code 0, 4 to code 12, zero to code 8.
    assert_eq!(encoded[2] & 0x0F, 0);
    assert_eq!(encoded[3] & 0x0F, 12);
    assert_eq!(encoded[2] >> 4, 9);
    assert_eq!(hist.iter().sum::<u64>(), QUANT_BLOCK as u64);
    assert_eq!(hist[8], 29);

    let mut decoded = [0.0f32; QUANT_BLOCK];
    dequantize_block(StorageType::Q4_0, &encoded, &mut decoded);
    assert_eq!(decoded[0], -8.0);
    assert_eq!(decoded[1], 4.0);
    assert_eq!(decoded[16], 1.0);
}

#[test]
fn test_q8_0_histogram_buckets() {
    let mut src = [0.0f32; QUANT_BLOCK];
    src[0] = 127.0;
    src[1] = -127.0;

    let (_, hist) = roundtrip(StorageType::Q8_0, &src);

    assert_eq!(hist[15], 1);
    assert_eq!(hist[1], 1);
    assert_eq!(hist[8], 30);
}

#[test]
fn test_zero_block_decodes_to_zero() {
    let src = [0.0f32; QUANT_BLOCK];
    for data_type in StorageType::QUANTIZED {
        let (decoded, _) = roundtrip(data_type, &src);
        assert!(decoded.iter().all(|&v| v == 0.0), "{data_type}");
    }
}

#[test]
fn test_quantize_rejects_bad_arguments() {
    let src = [0.5f32; QUANT_BLOCK];
    let mut hist = Histogram::default();

    let mut short = [0u8; 10];
    let err = quantize_row(StorageType::Q4_0, &src, &mut short, &mut hist).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::ARGS));

    let mut out = [0u8; 128];
    let err = quantize_row(StorageType::F16, &src, &mut out, &mut hist).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::DATA_TYPE));

    let err = quantize_row(StorageType::Q4_1, &src[..20], &mut out[..20], &mut hist).unwrap_err();
    assert!(err.flags().contains(ErrorFlags::DIMENSION));
}

#[test]
fn test_normalize_histogram() {
    let mut hist = Histogram::default();
    hist[0] = 1;
    hist[3] = 3;

    let normalized = normalize_histogram(&hist);
    assert_eq!(normalized[0], 0.25);
    assert_eq!(normalized[3], 0.75);
    assert_eq!(normalize_histogram(&Histogram::default()), [0.0; 16]);
}

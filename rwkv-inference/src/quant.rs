//! Block codecs for the quantized storage types.
//!
//! Every codec works on blocks of [`QUANT_BLOCK`] values that share a half-precision
//! scale (and, for the `_1` variants, a minimum). Quantizers also feed a 16-bucket
//! histogram of the produced codes.

use crate::error::{Error, ErrorFlags, Result};
use crate::format::{QUANT_BLOCK, StorageType};
use byteorder::{ByteOrder, LittleEndian};
use half::f16;

/// Counts of quantized codes, folded onto 16 buckets.
pub type Histogram = [u64; 16];

const HALF_BLOCK: usize = QUANT_BLOCK / 2;

/// Quantizes one row of `src` into `dst`, which must hold exactly the encoded row.
pub fn quantize_row(data_type: StorageType, src: &[f32], dst: &mut [u8], hist: &mut Histogram) -> Result<()> {
    let block_bytes = match data_type.block_bytes() {
        Some(bytes) if data_type.is_quantized() => bytes,
        _ => return Error::fail(ErrorFlags::ARGS | ErrorFlags::DATA_TYPE, format!("{data_type} is not a quantization target")),
    };

    if src.len() % QUANT_BLOCK != 0 || dst.len() != src.len() / QUANT_BLOCK * block_bytes {
        return Error::fail(
            ErrorFlags::ARGS | ErrorFlags::DIMENSION,
            format!("Cannot quantize {} values into {} bytes of {data_type}", src.len(), dst.len()),
        );
    }

    let encode: fn(&[f32], &mut [u8], &mut Histogram) = match data_type {
        StorageType::Q4_0 => quantize_q4_0,
        StorageType::Q4_1 => quantize_q4_1,
        StorageType::Q5_0 => quantize_q5_0,
        StorageType::Q5_1 => quantize_q5_1,
        _ => quantize_q8_0,
    };

    for (block, out) in src.chunks_exact(QUANT_BLOCK).zip(dst.chunks_exact_mut(block_bytes)) {
        encode(block, out, hist);
    }
    Ok(())
}

/// Decodes one block of `data_type` into 32 values.
#[inline]
pub fn dequantize_block(data_type: StorageType, block: &[u8], out: &mut [f32; QUANT_BLOCK]) {
    match data_type {
        StorageType::Q4_0 => dequantize_q4_0(block, out),
        StorageType::Q4_1 => dequantize_q4_1(block, out),
        StorageType::Q5_0 => dequantize_q5_0(block, out),
        StorageType::Q5_1 => dequantize_q5_1(block, out),
        StorageType::Q8_0 => dequantize_q8_0(block, out),
        other => unreachable!("{other} has no block codec"),
    }
}

/// Decodes a whole quantized row. `dst.len()` must be a multiple of the block size.
pub fn dequantize_row(data_type: StorageType, src: &[u8], dst: &mut [f32]) {
    let Some(block_bytes) = data_type.block_bytes() else { return };
    let mut values = [0.0f32; QUANT_BLOCK];

    for (block, out) in src.chunks_exact(block_bytes).zip(dst.chunks_exact_mut(QUANT_BLOCK)) {
        dequantize_block(data_type, block, &mut values);
        out.copy_from_slice(&values);
    }
}

/// Scales a histogram to fractions of its total.
pub fn normalize_histogram(hist: &Histogram) -> [f64; 16] {
    let total: u64 = hist.iter().sum();
    let mut normalized = [0.0; 16];
    if total > 0 {
        for (out, &count) in normalized.iter_mut().zip(hist) {
            *out = count as f64 / total as f64;
        }
    }
    normalized
}

#[inline]
fn read_half(bytes: &[u8]) -> f32 {
    f16::from_bits(LittleEndian::read_u16(bytes)).to_f32()
}

#[inline]
fn write_half(bytes: &mut [u8], value: f32) {
    LittleEndian::write_u16(bytes, f16::from_f32(value).to_bits());
}

#[inline]
fn inverse(d: f32) -> f32 {
    if d != 0.0 { 1.0 / d } else { 0.0 }
}

/// Value with the largest magnitude, sign preserved.
fn signed_absmax(x: &[f32]) -> f32 {
    x.iter().fold(0.0f32, |max, &v| if v.abs() > max.abs() { v } else { max })
}

fn min_max(x: &[f32]) -> (f32, f32) {
    x.iter().fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

// Q4_0: d | qs[16]. Value j sits in the low nibble of qs[j], value j+16 in the high one.
fn quantize_q4_0(x: &[f32], out: &mut [u8], hist: &mut Histogram) {
    let d = signed_absmax(x) / -8.0;
    let id = inverse(d);
    write_half(&mut out[0..2], d);

    for j in 0..HALF_BLOCK {
        let q0 = ((x[j] * id + 8.5) as i32).clamp(0, 15) as u8;
        let q1 = ((x[j + HALF_BLOCK] * id + 8.5) as i32).clamp(0, 15) as u8;
        out[2 + j] = q0 | (q1 << 4);
        hist[q0 as usize] += 1;
        hist[q1 as usize] += 1;
    }
}

fn dequantize_q4_0(block: &[u8], out: &mut [f32; QUANT_BLOCK]) {
    let d = read_half(&block[0..2]);
    for (j, &byte) in block[2..18].iter().enumerate() {
        out[j] = ((byte & 0x0F) as i32 - 8) as f32 * d;
        out[j + HALF_BLOCK] = ((byte >> 4) as i32 - 8) as f32 * d;
    }
}

// Q4_1: d | m | qs[16].
fn quantize_q4_1(x: &[f32], out: &mut [u8], hist: &mut Histogram) {
    let (min, max) = min_max(x);
    let d = (max - min) / 15.0;
    let id = inverse(d);
    write_half(&mut out[0..2], d);
    write_half(&mut out[2..4], min);

    for j in 0..HALF_BLOCK {
        let q0 = (((x[j] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
        let q1 = (((x[j + HALF_BLOCK] - min) * id + 0.5) as i32).clamp(0, 15) as u8;
        out[4 + j] = q0 | (q1 << 4);
        hist[q0 as usize] += 1;
        hist[q1 as usize] += 1;
    }
}

fn dequantize_q4_1(block: &[u8], out: &mut [f32; QUANT_BLOCK]) {
    let d = read_half(&block[0..2]);
    let m = read_half(&block[2..4]);
    for (j, &byte) in block[4..20].iter().enumerate() {
        out[j] = (byte & 0x0F) as f32 * d + m;
        out[j + HALF_BLOCK] = (byte >> 4) as f32 * d + m;
    }
}

// Q5_0: d | qh | qs[16]. Bit j of qh is the fifth bit of value j.
fn quantize_q5_0(x: &[f32], out: &mut [u8], hist: &mut Histogram) {
    let d = signed_absmax(x) / -16.0;
    let id = inverse(d);
    write_half(&mut out[0..2], d);

    let mut qh = 0u32;
    for j in 0..HALF_BLOCK {
        let q0 = ((x[j] * id + 16.5) as i32).clamp(0, 31) as u32;
        let q1 = ((x[j + HALF_BLOCK] * id + 16.5) as i32).clamp(0, 31) as u32;
        out[6 + j] = ((q0 & 0x0F) | ((q1 & 0x0F) << 4)) as u8;
        qh |= ((q0 >> 4) & 1) << j;
        qh |= ((q1 >> 4) & 1) << (j + HALF_BLOCK);
        hist[(q0 >> 1) as usize] += 1;
        hist[(q1 >> 1) as usize] += 1;
    }
    LittleEndian::write_u32(&mut out[2..6], qh);
}

fn dequantize_q5_0(block: &[u8], out: &mut [f32; QUANT_BLOCK]) {
    let d = read_half(&block[0..2]);
    let qh = LittleEndian::read_u32(&block[2..6]);
    for (j, &byte) in block[6..22].iter().enumerate() {
        let q0 = (byte & 0x0F) as u32 | (((qh >> j) & 1) << 4);
        let q1 = (byte >> 4) as u32 | (((qh >> (j + HALF_BLOCK)) & 1) << 4);
        out[j] = (q0 as i32 - 16) as f32 * d;
        out[j + HALF_BLOCK] = (q1 as i32 - 16) as f32 * d;
    }
}

// Q5_1: d | m | qh | qs[16].
fn quantize_q5_1(x: &[f32], out: &mut [u8], hist: &mut Histogram) {
    let (min, max) = min_max(x);
    let d = (max - min) / 31.0;
    let id = inverse(d);
    write_half(&mut out[0..2], d);
    write_half(&mut out[2..4], min);

    let mut qh = 0u32;
    for j in 0..HALF_BLOCK {
        let q0 = (((x[j] - min) * id + 0.5) as i32).clamp(0, 31) as u32;
        let q1 = (((x[j + HALF_BLOCK] - min) * id + 0.5) as i32).clamp(0, 31) as u32;
        out[8 + j] = ((q0 & 0x0F) | ((q1 & 0x0F) << 4)) as u8;
        qh |= ((q0 >> 4) & 1) << j;
        qh |= ((q1 >> 4) & 1) << (j + HALF_BLOCK);
        hist[(q0 >> 1) as usize] += 1;
        hist[(q1 >> 1) as usize] += 1;
    }
    LittleEndian::write_u32(&mut out[4..8], qh);
}

fn dequantize_q5_1(block: &[u8], out: &mut [f32; QUANT_BLOCK]) {
    let d = read_half(&block[0..2]);
    let m = read_half(&block[2..4]);
    let qh = LittleEndian::read_u32(&block[4..8]);
    for (j, &byte) in block[8..24].iter().enumerate() {
        let q0 = (byte & 0x0F) as u32 | (((qh >> j) & 1) << 4);
        let q1 = (byte >> 4) as u32 | (((qh >> (j + HALF_BLOCK)) & 1) << 4);
        out[j] = q0 as f32 * d + m;
        out[j + HALF_BLOCK] = q1 as f32 * d + m;
    }
}

// Q8_0: d | qs[32] as i8.
fn quantize_q8_0(x: &[f32], out: &mut [u8], hist: &mut Histogram) {
    let amax = x.iter().fold(0.0f32, |max, &v| max.max(v.abs()));
    let d = amax / 127.0;
    let id = inverse(d);
    write_half(&mut out[0..2], d);

    for (j, &v) in x.iter().enumerate() {
        let q = (v * id).round().clamp(-127.0, 127.0) as i8;
        out[2 + j] = q as u8;
        hist[(q as i32 / 16 + 8) as usize] += 1;
    }
}

fn dequantize_q8_0(block: &[u8], out: &mut [f32; QUANT_BLOCK]) {
    let d = read_half(&block[0..2]);
    for (value, &byte) in out.iter_mut().zip(&block[2..34]) {
        *value = (byte as i8) as f32 * d;
    }
}

#[cfg(test)]
#[path = "../tests/unit/quant_test.rs"]
mod tests;

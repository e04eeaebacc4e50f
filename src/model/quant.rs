//! 4-bit block quantization of frozen base weights.
//!
//! Weights are split into blocks of `block_size` values. Each block is scaled
//! by its absolute maximum and every value is replaced by the index of the
//! nearest level in a 16-entry code book (NF4 or FP4). Two indices are packed
//! per byte, low nibble first. With double quantization the per-block scales
//! are themselves stored as 8-bit codes in blocks of [`SCALE_BLOCK_SIZE`]
//! around their mean.

use candle_core::{DType, Device, Result as CandleResult, Shape, Tensor};

use crate::config::QuantType;

/// `NormalFloat` levels: quantiles of a standard normal, normalized to [-1, 1].
pub const NF4_LEVELS: [f32; 16] = [
    -1.0,
    -0.696_192_8,
    -0.525_073_05,
    -0.394_917_5,
    -0.284_441_38,
    -0.184_773_43,
    -0.091_050_036,
    0.0,
    0.079_580_3,
    0.160_930_2,
    0.246_112_3,
    0.337_915_24,
    0.440_709_83,
    0.562_617,
    0.722_956_84,
    1.0,
];

/// FP4 (e2m1) levels, normalized to [-1, 1].
pub const FP4_LEVELS: [f32; 16] = [
    0.0,
    0.005_208_333,
    0.666_666_7,
    1.0,
    0.333_333_34,
    0.5,
    0.166_666_67,
    0.25,
    -0.0,
    -0.005_208_333,
    -0.666_666_7,
    -1.0,
    -0.333_333_34,
    -0.5,
    -0.166_666_67,
    -0.25,
];

/// Number of block scales sharing one second-level scale.
pub const SCALE_BLOCK_SIZE: usize = 256;

/// Quantization parameters for one model load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantSpec {
    /// Code book.
    pub quant_type: QuantType,
    /// Values per absmax block.
    pub block_size: usize,
    /// Quantize the block scales too.
    pub double_quant: bool,
}

impl QuantSpec {
    /// NF4 with 64-value blocks and plain scales.
    #[must_use]
    pub fn nf4() -> Self {
        Self {
            quant_type: QuantType::Nf4,
            block_size: 64,
            double_quant: false,
        }
    }
}

fn levels(quant_type: QuantType) -> &'static [f32; 16] {
    match quant_type {
        QuantType::Nf4 => &NF4_LEVELS,
        QuantType::Fp4 => &FP4_LEVELS,
    }
}

/// Index of the level closest to `value`; the first one wins ties.
fn nearest(table: &[f32; 16], value: f32) -> u8 {
    let mut best = 0u8;
    let mut best_dist = f32::INFINITY;
    for (idx, level) in (0u8..).zip(table.iter()) {
        let dist = (value - level).abs();
        if dist < best_dist {
            best = idx;
            best_dist = dist;
        }
    }
    best
}

#[derive(Debug, Clone)]
enum BlockScales {
    Plain(Tensor),
    Double {
        codes: Tensor,
        absmax: Tensor,
        offset: f32,
        count: usize,
    },
}

/// A weight matrix stored as packed 4-bit codes plus block scales.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    packed: Tensor,
    scales: BlockScales,
    table: Tensor,
    shape: Shape,
    block_size: usize,
    quant_type: QuantType,
}

/// Quantize `weight` on its own device.
///
/// # Errors
///
/// Returns an error for an odd or zero block size, or if the tensor cannot be read.
pub fn quantize(weight: &Tensor, spec: QuantSpec) -> CandleResult<QuantizedTensor> {
    let block_size = spec.block_size;
    if block_size == 0 || block_size % 2 != 0 {
        candle_core::bail!("block size must be a positive even number, got {block_size}")
    }

    let device = weight.device();
    let values = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let table = levels(spec.quant_type);
    let zero = nearest(table, 0.0);

    let n_blocks = values.len().div_ceil(block_size);
    let mut absmax = Vec::with_capacity(n_blocks);
    let mut indices = Vec::with_capacity(n_blocks * block_size);
    for block in values.chunks(block_size) {
        let scale = block.iter().fold(0f32, |m, v| m.max(v.abs()));
        let inv = if scale > 0.0 { scale.recip() } else { 0.0 };
        absmax.push(scale);
        indices.extend(block.iter().map(|v| nearest(table, v * inv)));
    }
    indices.resize(n_blocks * block_size, zero);

    let packed: Vec<u8> = indices
        .chunks_exact(2)
        .map(|pair| pair[0] | (pair[1] << 4))
        .collect();
    let packed_len = packed.len();

    let scales = if spec.double_quant {
        double_quantize(&absmax, device)?
    } else {
        BlockScales::Plain(Tensor::from_vec(absmax, n_blocks, device)?)
    };

    Ok(QuantizedTensor {
        packed: Tensor::from_vec(packed, packed_len, device)?,
        scales,
        table: Tensor::new(table, device)?,
        shape: weight.shape().clone(),
        block_size,
        quant_type: spec.quant_type,
    })
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn double_quantize(absmax: &[f32], device: &Device) -> CandleResult<BlockScales> {
    let count = absmax.len();
    #[allow(clippy::cast_precision_loss)]
    let offset = absmax.iter().sum::<f32>() / count.max(1) as f32;

    let n_groups = count.div_ceil(SCALE_BLOCK_SIZE);
    let mut group_max = Vec::with_capacity(n_groups);
    let mut codes = Vec::with_capacity(n_groups * SCALE_BLOCK_SIZE);
    for group in absmax.chunks(SCALE_BLOCK_SIZE) {
        let c = group.iter().fold(0f32, |m, s| m.max((s - offset).abs()));
        let inv = if c > 0.0 { 127.0 / c } else { 0.0 };
        group_max.push(c);
        codes.extend(
            group
                .iter()
                .map(|s| (((s - offset) * inv).round().clamp(-127.0, 127.0) + 128.0) as u8),
        );
    }
    codes.resize(n_groups * SCALE_BLOCK_SIZE, 128);
    let codes_len = codes.len();

    Ok(BlockScales::Double {
        codes: Tensor::from_vec(codes, codes_len, device)?,
        absmax: Tensor::from_vec(group_max, n_groups, device)?,
        offset,
        count,
    })
}

impl QuantizedTensor {
    /// Shape of the original weight.
    #[must_use]
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Code book used.
    #[must_use]
    pub fn quant_type(&self) -> QuantType {
        self.quant_type
    }

    /// Whether the block scales are double-quantized.
    #[must_use]
    pub fn is_double_quantized(&self) -> bool {
        matches!(self.scales, BlockScales::Double { .. })
    }

    /// Bytes held by codes and scales.
    #[must_use]
    pub fn storage_bytes(&self) -> usize {
        let scales = match &self.scales {
            BlockScales::Plain(s) => s.elem_count() * 4,
            BlockScales::Double { codes, absmax, .. } => codes.elem_count() + absmax.elem_count() * 4 + 4,
        };
        self.packed.elem_count() + scales
    }

    fn block_scales(&self) -> CandleResult<Tensor> {
        match &self.scales {
            BlockScales::Plain(s) => Ok(s.clone()),
            BlockScales::Double {
                codes,
                absmax,
                offset,
                count,
            } => {
                let n_groups = absmax.elem_count();
                let centered = ((codes.to_dtype(DType::F32)? - 128.0)? / 127.0)?
                    .reshape((n_groups, SCALE_BLOCK_SIZE))?
                    .broadcast_mul(&absmax.unsqueeze(1)?)?;
                centered
                    .flatten_all()?
                    .narrow(0, 0, *count)?
                    .affine(1.0, f64::from(*offset))
            }
        }
    }

    /// Reconstruct the weight as an F32 tensor on the storage device.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn dequantize(&self) -> CandleResult<Tensor> {
        let packed = self.packed.to_dtype(DType::F32)?;
        let high = (&packed / 16.0)?.floor()?;
        let low = (&packed - (&high * 16.0)?)?;
        let indices = Tensor::stack(&[&low, &high], 1)?
            .flatten_all()?
            .to_dtype(DType::U32)?;

        let scales = self.block_scales()?;
        let n_blocks = scales.elem_count();
        let values = self
            .table
            .index_select(&indices, 0)?
            .reshape((n_blocks, self.block_size))?
            .broadcast_mul(&scales.unsqueeze(1)?)?;

        values
            .flatten_all()?
            .narrow(0, 0, self.shape.elem_count())?
            .reshape(self.shape.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize) -> Tensor {
        #[allow(clippy::cast_precision_loss)]
        let values: Vec<f32> = (0..n).map(|i| ((i as f32) * 0.37).sin() * 0.05).collect();
        Tensor::from_vec(values, (n / 16, 16), &Device::Cpu).unwrap()
    }

    fn max_abs(t: &Tensor) -> f32 {
        t.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap()
    }

    #[test]
    fn test_nf4_levels_sorted_and_symmetric_bounds() {
        assert!(NF4_LEVELS.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(NF4_LEVELS[0], -1.0);
        assert_eq!(NF4_LEVELS[15], 1.0);
        assert_eq!(nearest(&NF4_LEVELS, 0.0), 7);
        assert_eq!(nearest(&NF4_LEVELS, 0.98), 15);
    }

    #[test]
    fn test_nf4_error_is_bounded() {
        let weight = ramp(256);
        let q = quantize(&weight, QuantSpec::nf4()).unwrap();
        let restored = q.dequantize().unwrap();
        assert_eq!(restored.dims(), weight.dims());

        // half the widest gap between adjacent levels, times the block absmax
        let half_gap = NF4_LEVELS
            .windows(2)
            .map(|w| (w[1] - w[0]) / 2.0)
            .fold(0f32, f32::max);
        assert!(half_gap > 0.15 && half_gap < 0.16);
        let err = max_abs(&(restored - &weight).unwrap());
        let bound = half_gap * max_abs(&weight);
        assert!(err <= bound + 1e-6, "error {err} exceeds {bound}");
    }

    #[test]
    fn test_levels_round_trip_exactly() {
        let scale = 0.5f32;
        let values: Vec<f32> = NF4_LEVELS.iter().map(|l| l * scale).collect();
        let weight = Tensor::from_vec(values.clone(), (1, 16), &Device::Cpu).unwrap();
        let q = quantize(
            &weight,
            QuantSpec {
                block_size: 16,
                ..QuantSpec::nf4()
            },
        )
        .unwrap();
        let restored = q.dequantize().unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in restored.iter().zip(&values) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_fp4_and_partial_block() {
        // 48 values with 32-value blocks leaves a half-filled trailing block
        let weight = ramp(48);
        let spec = QuantSpec {
            quant_type: QuantType::Fp4,
            block_size: 32,
            double_quant: false,
        };
        let q = quantize(&weight, spec).unwrap();
        assert_eq!(q.quant_type(), QuantType::Fp4);
        let restored = q.dequantize().unwrap();
        assert_eq!(restored.dims(), &[3, 16]);
        let err = max_abs(&(restored - &weight).unwrap());
        assert!(err <= 0.17 * max_abs(&weight) + 1e-6, "error {err}");
    }

    #[test]
    fn test_double_quant_close_to_plain() {
        let weight = ramp(1024);
        let plain = quantize(&weight, QuantSpec::nf4()).unwrap();
        let double = quantize(
            &weight,
            QuantSpec {
                double_quant: true,
                ..QuantSpec::nf4()
            },
        )
        .unwrap();
        assert!(double.is_double_quantized());

        let a = plain.dequantize().unwrap();
        let b = double.dequantize().unwrap();
        let diff = max_abs(&(a - b).unwrap());
        assert!(diff < 0.01 * max_abs(&weight) + 1e-6, "diff {diff}");
    }

    #[test]
    fn test_storage_smaller_than_f32() {
        let weight = ramp(4096);
        let q = quantize(&weight, QuantSpec::nf4()).unwrap();
        assert!(q.storage_bytes() * 6 < 4096 * 4);
    }

    #[test]
    fn test_zero_block_and_bad_block_size() {
        let weight = Tensor::zeros((2, 32), DType::F32, &Device::Cpu).unwrap();
        let q = quantize(&weight, QuantSpec::nf4()).unwrap();
        assert_eq!(max_abs(&q.dequantize().unwrap()), 0.0);

        let bad = QuantSpec {
            block_size: 3,
            ..QuantSpec::nf4()
        };
        assert!(quantize(&weight, bad).is_err());
    }
}

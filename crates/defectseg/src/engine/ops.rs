//! Tensor kernels over planar buffers.

use nalgebra::DMatrix;
use rayon::prelude::*;

use super::EngineError;
use crate::image::PixelBuffer;
use crate::topology::{LayerId, LayerSpec, PoolSpec};
use crate::weights::LayerWeights;

/// Convolution followed by bias, optional batch-norm and optional ReLU.
///
/// The kernel is `[kw, kh, cin, cout]` fastest-first, so each output channel's
/// weights form one contiguous column of length `kw * kh * cin`. Input patches
/// are unrolled into an `npix x depth` matrix with the same column order and
/// multiplied by the kernel matrix; the column-major product is already
/// channel-major.
pub(crate) fn conv2d(
    input: &PixelBuffer,
    layer: LayerId,
    spec: &LayerSpec,
    weights: &LayerWeights,
    epsilon: f32,
) -> Result<PixelBuffer, EngineError> {
    let cin = input.channels();
    if cin != weights.in_channels() {
        return Err(EngineError::ChannelMismatch {
            layer,
            expected: weights.in_channels(),
            actual: cin,
        });
    }
    let (w, h) = (input.width(), input.height());
    let (ow, oh) = match (spec.output_extent(w), spec.output_extent(h)) {
        (Some(ow), Some(oh)) if ow > 0 && oh > 0 => (ow, oh),
        _ => {
            return Err(EngineError::DegenerateWindow {
                shape: input.shape(),
            })
        }
    };
    let k = spec.kernel;
    let (stride, pad) = (spec.stride, spec.padding);
    let npix = ow * oh;
    let depth = k * k * cin;
    let cout = weights.out_channels();

    let mut cols = vec![0.0f32; npix * depth];
    cols.par_chunks_mut(npix).enumerate().for_each(|(j, col)| {
        let ci = j / (k * k);
        let ky = (j / k) % k;
        let kx = j % k;
        let plane = input.plane(ci);
        for oy in 0..oh {
            let iy = (oy * stride + ky) as isize - pad as isize;
            if iy < 0 || iy >= h as isize {
                continue;
            }
            let src = &plane[iy as usize * w..(iy as usize + 1) * w];
            for (ox, dst) in col[oy * ow..(oy + 1) * ow].iter_mut().enumerate() {
                let ix = (ox * stride + kx) as isize - pad as isize;
                if ix >= 0 && (ix as usize) < w {
                    *dst = src[ix as usize];
                }
            }
        }
    });

    let cols = DMatrix::from_vec(npix, depth, cols);
    let kernel = DMatrix::from_column_slice(depth, cout, weights.kernel.data());
    let product = cols * kernel;
    let mut out = product.as_slice().to_vec();

    out.par_chunks_mut(npix).enumerate().for_each(|(co, plane)| {
        let bias = weights.bias[co];
        let bn = weights.batch_norm.as_ref().map(|bn| {
            (
                bn.mean[co],
                (bn.variance[co] + epsilon).sqrt(),
                bn.gamma[co],
                bn.beta[co],
            )
        });
        for v in plane.iter_mut() {
            let mut x = *v + bias;
            if let Some((mean, std, gamma, beta)) = bn {
                x = (x - mean) / std * gamma + beta;
            }
            if spec.activation {
                x = x.max(0.0);
            }
            *v = x;
        }
    });

    Ok(PixelBuffer::from_vec(ow, oh, cout, out)?)
}

/// Max over each window; padded positions never contribute.
pub(crate) fn max_pool(input: &PixelBuffer, pool: &PoolSpec) -> Result<PixelBuffer, EngineError> {
    let (w, h) = (input.width(), input.height());
    let (ow, oh) = match (pool.output_extent(w), pool.output_extent(h)) {
        (Some(ow), Some(oh)) if ow > 0 && oh > 0 => (ow, oh),
        _ => {
            return Err(EngineError::DegenerateWindow {
                shape: input.shape(),
            })
        }
    };
    let mut out = PixelBuffer::new(ow, oh, input.channels());
    let plane_len = ow * oh;
    out.data_mut()
        .par_chunks_mut(plane_len.max(1))
        .enumerate()
        .for_each(|(c, dst)| {
            let src = input.plane(c);
            for oy in 0..oh {
                let y0 = (oy * pool.stride) as isize - pool.padding as isize;
                for ox in 0..ow {
                    let x0 = (ox * pool.stride) as isize - pool.padding as isize;
                    let mut best = f32::NEG_INFINITY;
                    for y in y0.max(0)..(y0 + pool.window as isize).min(h as isize) {
                        let row = &src[y as usize * w..(y as usize + 1) * w];
                        for x in x0.max(0)..(x0 + pool.window as isize).min(w as isize) {
                            best = best.max(row[x as usize]);
                        }
                    }
                    dst[oy * ow + ox] = best;
                }
            }
        });
    Ok(out)
}

/// Nearest-neighbour upsample by an integer factor.
pub(crate) fn upsample_nearest(input: &PixelBuffer, factor: usize) -> PixelBuffer {
    let (w, h) = (input.width(), input.height());
    let (ow, oh) = (w * factor, h * factor);
    let mut out = PixelBuffer::new(ow, oh, input.channels());
    for c in 0..input.channels() {
        for oy in 0..oh {
            let src = input.row(c, oy / factor);
            for (ox, dst) in out.row_mut(c, oy).iter_mut().enumerate() {
                *dst = src[ox / factor];
            }
        }
    }
    out
}

/// `first`'s channels followed by `second`'s.
pub(crate) fn concat(first: &PixelBuffer, second: &PixelBuffer) -> Result<PixelBuffer, EngineError> {
    if first.width() != second.width() || first.height() != second.height() {
        return Err(EngineError::OperandShape {
            op: "concat",
            lhs: first.shape(),
            rhs: second.shape(),
        });
    }
    let mut data = Vec::with_capacity(first.data().len() + second.data().len());
    data.extend_from_slice(first.data());
    data.extend_from_slice(second.data());
    Ok(PixelBuffer::from_vec(
        first.width(),
        first.height(),
        first.channels() + second.channels(),
        data,
    )?)
}

pub(crate) fn add(lhs: &PixelBuffer, rhs: &PixelBuffer) -> Result<PixelBuffer, EngineError> {
    if lhs.shape() != rhs.shape() {
        return Err(EngineError::OperandShape {
            op: "add",
            lhs: lhs.shape(),
            rhs: rhs.shape(),
        });
    }
    let mut out = lhs.clone();
    for (a, &b) in out.data_mut().iter_mut().zip(rhs.data()) {
        *a += b;
    }
    Ok(out)
}

pub(crate) fn relu_in_place(buffer: &mut PixelBuffer) {
    for v in buffer.data_mut() {
        *v = v.max(0.0);
    }
}

pub(crate) fn sigmoid_in_place(buffer: &mut PixelBuffer) {
    for v in buffer.data_mut() {
        *v = 1.0 / (1.0 + (-*v).exp());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{WeightBinding, REFERENCE_LAYERS};
    use crate::weights::{BatchNormParams, Tensor};
    use approx::assert_abs_diff_eq;

    fn spec(kernel: usize, padding: usize, stride: usize, activation: bool) -> LayerSpec {
        LayerSpec {
            conv: "test",
            bn: None,
            kernel,
            padding,
            stride,
            activation,
            binding: WeightBinding::Standalone,
        }
    }

    fn weights(dims: [usize; 4], kernel: Vec<f32>, bias: Vec<f32>) -> LayerWeights {
        LayerWeights {
            kernel: Tensor::new(&dims, kernel).unwrap(),
            bias,
            batch_norm: None,
        }
    }

    /// Direct nested-loop convolution for cross-checking.
    fn naive_conv(input: &PixelBuffer, spec: &LayerSpec, w: &LayerWeights) -> PixelBuffer {
        let k = spec.kernel;
        let ow = spec.output_extent(input.width()).unwrap();
        let oh = spec.output_extent(input.height()).unwrap();
        let (cin, cout) = (w.in_channels(), w.out_channels());
        let mut out = PixelBuffer::new(ow, oh, cout);
        for co in 0..cout {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = w.bias[co];
                    for ci in 0..cin {
                        for ky in 0..k {
                            for kx in 0..k {
                                let iy = (oy * spec.stride + ky) as isize - spec.padding as isize;
                                let ix = (ox * spec.stride + kx) as isize - spec.padding as isize;
                                if iy < 0 || ix < 0 {
                                    continue;
                                }
                                let Ok(v) = input.get(ix as usize, iy as usize, ci) else {
                                    continue;
                                };
                                let widx = kx + k * (ky + k * (ci + cin * co));
                                acc += v * w.kernel.data()[widx];
                            }
                        }
                    }
                    out.set(ox, oy, co, acc).unwrap();
                }
            }
        }
        out
    }

    #[test]
    fn conv_matches_direct_evaluation() {
        let input = PixelBuffer::from_vec(
            5,
            4,
            2,
            (0..40).map(|v| (v as f32 * 0.37).sin()).collect(),
        )
        .unwrap();
        for (k, pad, stride) in [(3, 1, 1), (3, 1, 2), (1, 0, 2), (7, 3, 2)] {
            let s = spec(k, pad, stride, false);
            let n = k * k * 2 * 3;
            let w = weights(
                [k, k, 2, 3],
                (0..n).map(|v| ((v * 7 % 11) as f32 - 5.0) * 0.1).collect(),
                vec![0.1, -0.2, 0.3],
            );
            let fast = conv2d(&input, LayerId(0), &s, &w, 0.0).unwrap();
            let slow = naive_conv(&input, &s, &w);
            assert_eq!(fast.shape(), slow.shape());
            for (a, b) in fast.data().iter().zip(slow.data()) {
                assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn conv_applies_batch_norm_then_relu() {
        let input = PixelBuffer::filled(2, 2, 1, 3.0);
        let mut w = weights([1, 1, 1, 1], vec![1.0], vec![1.0]);
        w.batch_norm = Some(BatchNormParams {
            gamma: vec![2.0],
            beta: vec![-10.0],
            mean: vec![2.0],
            variance: vec![4.0],
        });
        // ((3 + 1) - 2) / 2 * 2 - 10 = -8
        let linear = conv2d(&input, LayerId(0), &spec(1, 0, 1, false), &w, 0.0).unwrap();
        assert!(linear.data().iter().all(|&v| v == -8.0));
        let activated = conv2d(&input, LayerId(0), &spec(1, 0, 1, true), &w, 0.0).unwrap();
        assert!(activated.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn conv_rejects_channel_mismatch() {
        let input = PixelBuffer::new(4, 4, 3);
        let w = weights([1, 1, 2, 1], vec![1.0, 1.0], vec![0.0]);
        let err = conv2d(&input, LayerId(5), &spec(1, 0, 1, false), &w, 0.0).unwrap_err();
        assert!(matches!(
            err,
            EngineError::ChannelMismatch {
                expected: 2,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn stem_halves_spatial_size() {
        let stem = &REFERENCE_LAYERS[0];
        let input = PixelBuffer::filled(16, 12, 3, 1.0);
        let n = 7 * 7 * 3;
        let mut w = weights([7, 7, 3, 1], vec![1.0; n], vec![0.0]);
        w.batch_norm = Some(BatchNormParams {
            gamma: vec![1.0],
            beta: vec![0.0],
            mean: vec![0.0],
            variance: vec![1.0],
        });
        let out = conv2d(&input, LayerId(0), stem, &w, 0.0).unwrap();
        assert_eq!((out.width(), out.height()), (8, 6));
        // Interior output sees the full 7x7x3 window.
        assert_eq!(out.get(3, 3, 0).unwrap(), n as f32);
    }

    #[test]
    fn max_pool_ignores_padding() {
        let input =
            PixelBuffer::from_vec(4, 4, 1, (0..16).map(|v| -(v as f32) - 1.0).collect()).unwrap();
        let pool = PoolSpec {
            window: 3,
            stride: 2,
            padding: 1,
        };
        let out = max_pool(&input, &pool).unwrap();
        assert_eq!((out.width(), out.height()), (2, 2));
        // Top-left window covers (0..2, 0..2) only; all negative, padding not zero.
        assert_eq!(out.get(0, 0, 0).unwrap(), -1.0);
        assert_eq!(out.get(1, 1, 0).unwrap(), -6.0);
    }

    #[test]
    fn upsample_repeats_pixels() {
        let input = PixelBuffer::from_vec(2, 1, 1, vec![1.0, 2.0]).unwrap();
        let out = upsample_nearest(&input, 2);
        assert_eq!(out.row(0, 0), &[1.0, 1.0, 2.0, 2.0]);
        assert_eq!(out.row(0, 1), &[1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn concat_puts_first_channels_first() {
        let a = PixelBuffer::filled(2, 2, 2, 1.0);
        let b = PixelBuffer::filled(2, 2, 1, 9.0);
        let out = concat(&a, &b).unwrap();
        assert_eq!(out.channels(), 3);
        assert!(out.plane(1).iter().all(|&v| v == 1.0));
        assert!(out.plane(2).iter().all(|&v| v == 9.0));
        assert!(concat(&a, &PixelBuffer::new(3, 2, 1)).is_err());
    }

    #[test]
    fn add_requires_identical_shapes() {
        let a = PixelBuffer::filled(2, 2, 1, 1.5);
        let sum = add(&a, &a).unwrap();
        assert!(sum.data().iter().all(|&v| v == 3.0));
        assert!(add(&a, &PixelBuffer::new(2, 2, 2)).is_err());
    }

    #[test]
    fn sigmoid_bounds_output() {
        let mut b = PixelBuffer::from_vec(3, 1, 1, vec![-100.0, 0.0, 100.0]).unwrap();
        sigmoid_in_place(&mut b);
        assert_abs_diff_eq!(b.data()[0], 0.0, epsilon = 1e-6);
        assert_eq!(b.data()[1], 0.5);
        assert_abs_diff_eq!(b.data()[2], 1.0, epsilon = 1e-6);
    }
}

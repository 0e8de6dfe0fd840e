//! Arg-max decoding of keypoint heatmaps.

use candle_core::{DType, Device, Tensor};

use regda_core::{DecodedPeak, Error, RefinedPeak, Result};

/// Peaks decoded from a `(B, K, H, W)` heatmap batch, stored row-major by
/// `(sample, keypoint)`.
#[derive(Debug, Clone, PartialEq)]
pub struct PeakBatch {
    pub batch: usize,
    pub keypoints: usize,
    pub peaks: Vec<DecodedPeak>,
}

impl PeakBatch {
    pub fn get(&self, sample: usize, keypoint: usize) -> Option<&DecodedPeak> {
        if keypoint >= self.keypoints {
            return None;
        }
        self.peaks.get(sample * self.keypoints + keypoint)
    }

    /// Peaks of one sample, one per keypoint.
    pub fn sample(&self, sample: usize) -> &[DecodedPeak] {
        let start = (sample * self.keypoints).min(self.peaks.len());
        let end = (start + self.keypoints).min(self.peaks.len());
        &self.peaks[start..end]
    }

    /// Floor-divide every coordinate by `divisor`.
    pub fn scaled(&self, divisor: usize) -> Self {
        Self {
            batch: self.batch,
            keypoints: self.keypoints,
            peaks: self.peaks.iter().map(|p| p.scaled(divisor)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }
}

/// Locate the maximum of every `(b, k)` channel of a `(B, K, H, W)` batch.
///
/// The scan is row-major, so ties resolve to the lowest linear index and
/// NaN never wins. A channel whose maximum is not strictly positive decodes
/// to `(0, 0)`; its confidence is still reported.
pub fn decode_peaks(heatmaps: &Tensor) -> Result<PeakBatch> {
    let (batch, keypoints, height, width) = heatmaps.dims4()?;
    let values = host_values(heatmaps)?;
    let plane = height * width;

    let mut peaks = Vec::with_capacity(batch * keypoints);
    for channel in values.chunks_exact(plane.max(1)).take(batch * keypoints) {
        let mut best_idx = 0usize;
        let mut best_val = f32::NEG_INFINITY;
        for (idx, &v) in channel.iter().enumerate() {
            if v > best_val {
                best_val = v;
                best_idx = idx;
            }
        }

        let peak = if best_val > 0.0 {
            DecodedPeak::new(best_idx % width, best_idx / width, best_val)
        } else {
            DecodedPeak::new(0, 0, best_val)
        };
        peaks.push(peak);
    }

    Ok(PeakBatch {
        batch,
        keypoints,
        peaks,
    })
}

/// Shift each interior peak a quarter pixel toward its larger neighbour
/// along both axes.
///
/// Interior means `1 < x < W - 1` and `1 < y < H - 1`; peaks on the first
/// two rows or columns, or on the last one, are returned unchanged.
pub fn refine_peaks(heatmaps: &Tensor, peaks: &PeakBatch) -> Result<Vec<RefinedPeak>> {
    let (batch, keypoints, height, width) = heatmaps.dims4()?;
    if batch != peaks.batch || keypoints != peaks.keypoints {
        return Err(Error::ShapeMismatch {
            what: "peaks",
            expected: vec![batch, keypoints],
            actual: vec![peaks.batch, peaks.keypoints],
        });
    }

    let values = host_values(heatmaps)?;
    let plane = height * width;

    let refined = peaks
        .peaks
        .iter()
        .enumerate()
        .map(|(channel, peak)| {
            let hm = &values[channel * plane..(channel + 1) * plane];
            let (px, py) = (peak.x, peak.y);
            let mut x = px as f32;
            let mut y = py as f32;

            if px > 1 && px + 1 < width && py > 1 && py + 1 < height {
                let dx = hm[py * width + px + 1] - hm[py * width + px - 1];
                let dy = hm[(py + 1) * width + px] - hm[(py - 1) * width + px];
                x += 0.25 * sign(dx);
                y += 0.25 * sign(dy);
            }

            RefinedPeak {
                x,
                y,
                confidence: peak.confidence,
            }
        })
        .collect();

    Ok(refined)
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Detached copy of the batch as a flat host vector.
fn host_values(heatmaps: &Tensor) -> Result<Vec<f32>> {
    let values = heatmaps
        .detach()
        .to_device(&Device::Cpu)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_with(values: &[(usize, usize, usize, usize, f32)], dims: (usize, usize, usize, usize)) -> Tensor {
        let (b, k, h, w) = dims;
        let mut data = vec![0.0f32; b * k * h * w];
        for &(bi, ki, y, x, v) in values {
            data[((bi * k + ki) * h + y) * w + x] = v;
        }
        Tensor::from_vec(data, dims, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_decode_locates_maxima() -> Result<()> {
        let hm = batch_with(
            &[(0, 0, 3, 5, 0.9), (0, 1, 7, 1, 0.4), (1, 0, 0, 7, 2.0), (1, 1, 6, 6, 0.1)],
            (2, 2, 8, 8),
        );
        let peaks = decode_peaks(&hm)?;

        assert_eq!(peaks.len(), 4);
        assert_eq!(peaks.get(0, 0), Some(&DecodedPeak::new(5, 3, 0.9)));
        assert_eq!(peaks.get(0, 1), Some(&DecodedPeak::new(1, 7, 0.4)));
        assert_eq!(peaks.get(1, 0), Some(&DecodedPeak::new(7, 0, 2.0)));
        assert_eq!(peaks.get(1, 1), Some(&DecodedPeak::new(6, 6, 0.1)));
        assert!(peaks.get(1, 2).is_none());
        assert_eq!(peaks.sample(1).len(), 2);
        Ok(())
    }

    #[test]
    fn test_ties_resolve_to_first_in_scan_order() -> Result<()> {
        let hm = batch_with(&[(0, 0, 2, 3, 1.0), (0, 0, 1, 6, 1.0), (0, 0, 4, 0, 1.0)], (1, 1, 5, 7));
        let peak = decode_peaks(&hm)?.peaks[0];
        assert_eq!((peak.x, peak.y), (6, 1));
        Ok(())
    }

    #[test]
    fn test_non_positive_channel_decodes_to_origin() -> Result<()> {
        let mut data = vec![-1.0f32; 16];
        data[10] = -0.5;
        let hm = Tensor::from_vec(data, (1, 1, 4, 4), &Device::Cpu)?;
        let peak = decode_peaks(&hm)?.peaks[0];
        assert_eq!((peak.x, peak.y), (0, 0));
        assert_eq!(peak.confidence, -0.5);
        assert!(!peak.is_valid());
        Ok(())
    }

    #[test]
    fn test_nan_never_wins() -> Result<()> {
        let mut data = vec![0.0f32; 9];
        data[0] = f32::NAN;
        data[4] = 0.3;
        let hm = Tensor::from_vec(data, (1, 1, 3, 3), &Device::Cpu)?;
        let peak = decode_peaks(&hm)?.peaks[0];
        assert_eq!((peak.x, peak.y), (1, 1));
        Ok(())
    }

    #[test]
    fn test_refine_moves_toward_larger_neighbour() -> Result<()> {
        let hm = batch_with(
            &[
                (0, 0, 4, 4, 1.0),
                (0, 0, 4, 5, 0.6),
                (0, 0, 4, 3, 0.2),
                (0, 0, 3, 4, 0.5),
                (0, 0, 5, 4, 0.1),
                (0, 1, 0, 2, 1.0),
            ],
            (1, 2, 8, 8),
        );
        let peaks = decode_peaks(&hm)?;
        let refined = refine_peaks(&hm, &peaks)?;

        assert_eq!((refined[0].x, refined[0].y), (4.25, 3.75));
        // Border peaks are left untouched
        assert_eq!((refined[1].x, refined[1].y), (2.0, 0.0));
        Ok(())
    }

    #[test]
    fn test_refine_skips_second_row_and_column() -> Result<()> {
        let hm = batch_with(
            &[
                (0, 0, 3, 1, 1.0),
                (0, 0, 3, 2, 0.5),
                (0, 1, 1, 3, 1.0),
                (0, 1, 2, 3, 0.5),
                (0, 2, 3, 2, 1.0),
                (0, 2, 3, 3, 0.5),
            ],
            (1, 3, 6, 6),
        );
        let refined = refine_peaks(&hm, &decode_peaks(&hm)?)?;
        assert_eq!((refined[0].x, refined[0].y), (1.0, 3.0));
        assert_eq!((refined[1].x, refined[1].y), (3.0, 1.0));
        assert_eq!((refined[2].x, refined[2].y), (2.25, 3.0));
        Ok(())
    }

    #[test]
    fn test_refine_rejects_foreign_peaks() -> Result<()> {
        let hm = Tensor::zeros((1, 2, 4, 4), DType::F32, &Device::Cpu)?;
        let other = Tensor::zeros((2, 2, 4, 4), DType::F32, &Device::Cpu)?;
        let peaks = decode_peaks(&other)?;
        assert!(matches!(
            refine_peaks(&hm, &peaks),
            Err(Error::ShapeMismatch { .. })
        ));
        Ok(())
    }
}

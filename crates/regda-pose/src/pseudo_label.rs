//! Pseudo ground-truth / ground-false generation from predicted heatmaps.
//!
//! The prediction is detached, decoded to one integer peak per keypoint and
//! replaced by the bank template at that peak. The result is a constant
//! target: nothing flows back into the decoding path.

use std::sync::Arc;

use candle_core::{Device, Tensor};
use tracing::debug;

use regda_core::{Error, GroundFalseStrategy, HeatmapConfig, Result};

use crate::decoder::{decode_peaks, PeakBatch};
use crate::ground_false::apply_strategy;
use crate::template::{suppression_matrix, TemplateBank};

/// Ground truth and ground false derived from one prediction batch.
#[derive(Debug, Clone)]
pub struct PseudoLabels {
    /// Gathered templates `(B, K, H_t, W_t)`
    pub ground_truth: Tensor,
    /// Complementary map, same shape as `ground_truth`
    pub ground_false: Tensor,
    /// Peaks on the template grid
    pub peaks: PeakBatch,
}

/// Generates pseudo labels for one `(K, H, W, sigma)` configuration.
pub struct PseudoLabelGenerator {
    bank: Arc<TemplateBank>,
    table: Tensor,
    suppression: Tensor,
    config: HeatmapConfig,
    device: Device,
}

impl PseudoLabelGenerator {
    /// Create a generator backed by the shared template bank for `config`.
    pub fn new(config: HeatmapConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let bank = TemplateBank::shared(config.template_spec()?)?;
        Self::with_bank(config, bank, device)
    }

    /// Create a generator on an existing bank.
    ///
    /// Fails unless `input / scale` is exactly the bank's grid.
    pub fn with_bank(config: HeatmapConfig, bank: Arc<TemplateBank>, device: &Device) -> Result<Self> {
        if config.num_keypoints == 0 {
            return Err(Error::Config("num_keypoints must be positive".to_string()));
        }
        let expected = config.template_spec()?;
        if expected.height != bank.height() || expected.width != bank.width() {
            return Err(Error::ResolutionMismatch {
                input_height: config.input_height,
                input_width: config.input_width,
                scale: config.scale,
                template_height: bank.height(),
                template_width: bank.width(),
            });
        }
        if expected != *bank.spec() {
            return Err(Error::InvalidInput(format!(
                "template bank built with sigma {} truncate {}, configuration asks for sigma {} truncate {}",
                bank.spec().sigma,
                bank.spec().truncate,
                expected.sigma,
                expected.truncate
            )));
        }

        let table = bank.table().to_device(device)?;
        let suppression = suppression_matrix(config.num_keypoints, device)?;

        debug!(
            keypoints = config.num_keypoints,
            input_height = config.input_height,
            input_width = config.input_width,
            scale = config.scale,
            strategy = ?config.ground_false,
            "Created pseudo-label generator"
        );

        Ok(Self {
            bank,
            table,
            suppression,
            config,
            device: device.clone(),
        })
    }

    /// Ground truth and ground false for a `(B, K, H, W)` prediction.
    pub fn generate(&self, y: &Tensor) -> Result<PseudoLabels> {
        let (ground_truth, peaks) = self.ground_truth(y)?;
        let ground_false = apply_strategy(self.config.ground_false, &ground_truth, &self.suppression)?;
        Ok(PseudoLabels {
            ground_truth,
            ground_false,
            peaks,
        })
    }

    /// Ground truth only, with the peaks it was gathered at.
    pub fn ground_truth(&self, y: &Tensor) -> Result<(Tensor, PeakBatch)> {
        let (b, k) = self.check_input(y)?;

        let peaks = decode_peaks(&y.detach())?.scaled(self.config.scale);

        let h = self.bank.height();
        let w = self.bank.width();
        let rows: Vec<u32> = peaks
            .peaks
            .iter()
            .map(|p| self.bank.row_index(p.x, p.y) as u32)
            .collect();
        let rows = Tensor::from_vec(rows, b * k, &self.device)?;

        let ground_truth = self.table.index_select(&rows, 0)?.reshape((b, k, h, w))?;
        Ok((ground_truth, peaks))
    }

    fn check_input(&self, y: &Tensor) -> Result<(usize, usize)> {
        let (b, k, h, w) = y.dims4()?;
        let expected = [b, self.config.num_keypoints, self.config.input_height, self.config.input_width];
        if [b, k, h, w] != expected {
            return Err(Error::ShapeMismatch {
                what: "prediction batch",
                expected: expected.to_vec(),
                actual: vec![b, k, h, w],
            });
        }
        Ok((b, k))
    }

    pub fn bank(&self) -> &TemplateBank {
        &self.bank
    }

    pub fn suppression(&self) -> &Tensor {
        &self.suppression
    }

    pub fn strategy(&self) -> GroundFalseStrategy {
        self.config.ground_false
    }

    pub fn config(&self) -> &HeatmapConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Var};
    use regda_core::TemplateSpec;

    use crate::decoder::decode_peaks;

    fn config(k: usize, size: usize) -> HeatmapConfig {
        HeatmapConfig {
            num_keypoints: k,
            input_height: size,
            input_width: size,
            ..HeatmapConfig::default()
        }
    }

    fn spikes(b: usize, k: usize, size: usize, at: &[(usize, usize)]) -> Tensor {
        let mut data = vec![0.0f32; b * k * size * size];
        for bi in 0..b {
            for ki in 0..k {
                let (x, y) = at[(bi * k + ki) % at.len()];
                data[((bi * k + ki) * size + y) * size + x] = 1.0;
            }
        }
        Tensor::from_vec(data, (b, k, size, size), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_ground_truth_is_template_at_peak() -> Result<()> {
        let generator = PseudoLabelGenerator::new(config(3, 16), &Device::Cpu)?;
        let y = spikes(2, 3, 16, &[(2, 3), (15, 0), (8, 9)]);
        let labels = generator.generate(&y)?;

        assert_eq!(labels.ground_truth.dims(), &[2, 3, 16, 16]);
        assert_eq!(labels.ground_false.dims(), &[2, 3, 16, 16]);

        let expected = generator.bank().template(15, 0)?;
        let got = labels.ground_truth.get(0)?.get(1)?;
        assert_eq!(got.to_vec2::<f32>()?, expected.to_vec2::<f32>()?);

        let decoded = decode_peaks(&labels.ground_truth)?;
        assert_eq!(decoded.peaks, labels.peaks.peaks);
        Ok(())
    }

    #[test]
    fn test_values_stay_in_unit_interval() -> Result<()> {
        for strategy in [GroundFalseStrategy::CrossSuppression, GroundFalseStrategy::Complement] {
            let cfg = HeatmapConfig {
                ground_false: strategy,
                ..config(4, 16)
            };
            let generator = PseudoLabelGenerator::new(cfg, &Device::Cpu)?;
            let y = Tensor::randn(0f32, 1.0, (3, 4, 16, 16), &Device::Cpu)?;
            let labels = generator.generate(&y)?;
            for t in [&labels.ground_truth, &labels.ground_false] {
                let v = t.flatten_all()?.to_vec1::<f32>()?;
                assert!(v.iter().all(|&x| (0.0..=1.0).contains(&x)));
            }
        }
        Ok(())
    }

    #[test]
    fn test_complement_is_exclusive_with_ground_truth() -> Result<()> {
        let cfg = HeatmapConfig {
            ground_false: GroundFalseStrategy::Complement,
            ..config(2, 16)
        };
        let generator = PseudoLabelGenerator::new(cfg, &Device::Cpu)?;
        let labels = generator.generate(&spikes(1, 2, 16, &[(4, 4), (5, 6)]))?;

        let gt = labels.ground_truth.flatten_all()?.to_vec1::<f32>()?;
        let gf = labels.ground_false.flatten_all()?.to_vec1::<f32>()?;
        for (t, f) in gt.iter().zip(&gf) {
            if *t >= 0.1 {
                assert_eq!(*f, 0.0);
            }
        }
        Ok(())
    }

    #[test]
    fn test_scaled_generator_uses_coarse_grid() -> Result<()> {
        let cfg = HeatmapConfig {
            scale: 4,
            truncate: 1.5,
            ground_false: GroundFalseStrategy::Complement,
            ..config(2, 64)
        };
        let generator = PseudoLabelGenerator::new(cfg, &Device::Cpu)?;
        let labels = generator.generate(&spikes(1, 2, 64, &[(63, 17), (0, 40)]))?;

        assert_eq!(labels.ground_truth.dims(), &[1, 2, 16, 16]);
        let p0 = labels.peaks.get(0, 0).unwrap();
        let p1 = labels.peaks.get(0, 1).unwrap();
        assert_eq!((p0.x, p0.y), (15, 4));
        assert_eq!((p1.x, p1.y), (0, 10));
        Ok(())
    }

    #[test]
    fn test_rejects_wrong_shapes_and_banks() -> Result<()> {
        let generator = PseudoLabelGenerator::new(config(3, 16), &Device::Cpu)?;
        let wrong_k = Tensor::zeros((1, 4, 16, 16), DType::F32, &Device::Cpu)?;
        let wrong_hw = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu)?;
        assert!(matches!(generator.generate(&wrong_k), Err(Error::ShapeMismatch { .. })));
        assert!(matches!(generator.generate(&wrong_hw), Err(Error::ShapeMismatch { .. })));

        let bank = TemplateBank::shared(TemplateSpec::new(16, 16, 2.0))?;
        let scaled = HeatmapConfig {
            scale: 2,
            ..config(3, 16)
        };
        assert!(matches!(
            PseudoLabelGenerator::with_bank(scaled, bank, &Device::Cpu),
            Err(Error::ResolutionMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_rejects_bank_with_other_gaussian() -> Result<()> {
        let wider = TemplateBank::shared(TemplateSpec::new(16, 16, 3.0))?;
        assert!(matches!(
            PseudoLabelGenerator::with_bank(config(2, 16), wider, &Device::Cpu),
            Err(Error::InvalidInput(_))
        ));

        let short = TemplateBank::shared(TemplateSpec::new(16, 16, 2.0).with_truncate(1.5))?;
        assert!(matches!(
            PseudoLabelGenerator::with_bank(config(2, 16), short, &Device::Cpu),
            Err(Error::InvalidInput(_))
        ));

        let matching = TemplateBank::shared(TemplateSpec::new(16, 16, 2.0))?;
        assert!(PseudoLabelGenerator::with_bank(config(2, 16), matching, &Device::Cpu).is_ok());
        Ok(())
    }

    #[test]
    fn test_targets_carry_no_gradient() -> Result<()> {
        let generator = PseudoLabelGenerator::new(config(2, 8), &Device::Cpu)?;
        let y = Var::from_tensor(&spikes(1, 2, 8, &[(1, 1), (6, 2)]))?;
        let labels = generator.generate(y.as_tensor())?;

        let loss = (labels.ground_truth.sum_all()? + y.as_tensor().sum_all()?)?;
        let grads = loss.backward()?;
        assert!(grads.get(&labels.ground_truth).is_none());
        assert!(grads.get(y.as_tensor()).is_some());
        Ok(())
    }
}

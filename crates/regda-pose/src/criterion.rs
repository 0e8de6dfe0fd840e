//! Distance criteria between predicted heatmaps and heatmap targets.
//!
//! Both criteria work per joint on `(B, K, H, W)` inputs and accept an
//! optional `(B, K)` instance weight.
//!
//! KL variant: L = Σ_hw p · (log p − log softmax(pred)), where p is the target
//! normalised to a distribution over the spatial axis.

use candle_core::{Tensor, D};
use candle_nn::ops::log_softmax;

use regda_core::{Error, Result};

/// How per-joint losses are reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    /// Scalar mean over samples and joints
    #[default]
    Mean,
    /// Per-sample mean over joints, shaped `(B,)`
    None,
}

/// A distance between a prediction and a (constant) heatmap target.
pub trait HeatmapCriterion {
    fn loss(&self, pred: &Tensor, target: &Tensor, weight: Option<&Tensor>) -> Result<Tensor>;
}

impl<C: HeatmapCriterion + ?Sized> HeatmapCriterion for &C {
    fn loss(&self, pred: &Tensor, target: &Tensor, weight: Option<&Tensor>) -> Result<Tensor> {
        (**self).loss(pred, target, weight)
    }
}

impl<C: HeatmapCriterion + ?Sized> HeatmapCriterion for Box<C> {
    fn loss(&self, pred: &Tensor, target: &Tensor, weight: Option<&Tensor>) -> Result<Tensor> {
        (**self).loss(pred, target, weight)
    }
}

/// Half mean squared error per joint.
#[derive(Debug, Clone, Default)]
pub struct JointsMseLoss {
    pub reduction: Reduction,
}

impl JointsMseLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }
}

impl HeatmapCriterion for JointsMseLoss {
    fn loss(&self, pred: &Tensor, target: &Tensor, weight: Option<&Tensor>) -> Result<Tensor> {
        let (b, k) = check_pair(pred, target, weight)?;
        let pred = pred.reshape((b, k, ()))?;
        let target = target.reshape((b, k, ()))?.to_dtype(pred.dtype())?;

        let diff = (&pred - &target)?;
        let mut loss = ((&diff * &diff)? * 0.5)?;
        if let Some(w) = weight {
            let w = w.to_dtype(loss.dtype())?.reshape((b, k, 1))?;
            loss = loss.broadcast_mul(&w)?;
        }

        Ok(match self.reduction {
            Reduction::Mean => loss.mean_all()?,
            Reduction::None => loss.mean(D::Minus1)?.mean(D::Minus1)?,
        })
    }
}

/// KL divergence from the normalised target to the spatial softmax of the
/// prediction.
#[derive(Debug, Clone)]
pub struct JointsKlLoss {
    pub reduction: Reduction,
    /// Added to every target pixel before normalisation
    pub epsilon: f64,
}

impl Default for JointsKlLoss {
    fn default() -> Self {
        Self {
            reduction: Reduction::Mean,
            epsilon: 0.0,
        }
    }
}

impl JointsKlLoss {
    pub fn new(reduction: Reduction, epsilon: f64) -> Self {
        Self { reduction, epsilon }
    }
}

impl HeatmapCriterion for JointsKlLoss {
    fn loss(&self, pred: &Tensor, target: &Tensor, weight: Option<&Tensor>) -> Result<Tensor> {
        let (b, k) = check_pair(pred, target, weight)?;
        let pred = pred.reshape((b, k, ()))?;
        let log_q = log_softmax(&pred, D::Minus1)?;

        let target = target.reshape((b, k, ()))?.to_dtype(pred.dtype())?;
        let target = (target + self.epsilon)?;
        let mass = target.sum_keepdim(D::Minus1)?;
        let denom = mass.gt(&mass.zeros_like()?)?.where_cond(&mass, &mass.ones_like()?)?;
        let p = target.broadcast_div(&denom)?;

        // p == 0 contributes exactly zero
        let log_p = p.clamp(f32::MIN_POSITIVE, f32::MAX)?.log()?;
        let mut loss = (&p * (log_p - &log_q)?)?.sum(D::Minus1)?;
        if let Some(w) = weight {
            loss = (loss * w.to_dtype(pred.dtype())?.reshape((b, k))?)?;
        }

        Ok(match self.reduction {
            Reduction::Mean => loss.mean_all()?,
            Reduction::None => loss.mean(D::Minus1)?,
        })
    }
}

fn check_pair(pred: &Tensor, target: &Tensor, weight: Option<&Tensor>) -> Result<(usize, usize)> {
    let (b, k, _, _) = pred.dims4()?;
    if pred.dims() != target.dims() {
        return Err(Error::ShapeMismatch {
            what: "criterion target",
            expected: pred.dims().to_vec(),
            actual: target.dims().to_vec(),
        });
    }
    if let Some(w) = weight {
        if w.dims() != [b, k] {
            return Err(Error::ShapeMismatch {
                what: "instance weight",
                expected: vec![b, k],
                actual: w.dims().to_vec(),
            });
        }
    }
    Ok((b, k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_mse_is_zero_for_identical_maps() -> Result<()> {
        let device = Device::Cpu;
        let t = Tensor::rand(0f32, 1.0, (2, 3, 4, 4), &device)?;
        let loss: f32 = JointsMseLoss::default().loss(&t, &t, None)?.to_scalar()?;
        assert_eq!(loss, 0.0);
        Ok(())
    }

    #[test]
    fn test_mse_value_and_weights() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::new(&[[[[1.0f32, 0.0]], [[0.0, 0.0]]]], &device)?;
        let target = Tensor::zeros_like(&pred)?;

        // 0.5 * (1 + 0) / 2 on joint 0, nothing on joint 1, mean over joints
        let loss: f32 = JointsMseLoss::default().loss(&pred, &target, None)?.to_scalar()?;
        assert!((loss - 0.125).abs() < 1e-6);

        let weight = Tensor::new(&[[0.0f32, 1.0]], &device)?;
        let loss: f32 = JointsMseLoss::default()
            .loss(&pred, &target, Some(&weight))?
            .to_scalar()?;
        assert_eq!(loss, 0.0);

        let per_sample = JointsMseLoss::new(Reduction::None).loss(&pred, &target, None)?;
        assert_eq!(per_sample.dims(), &[1]);
        Ok(())
    }

    #[test]
    fn test_kl_is_non_negative_and_finite() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device)?;
        let target = Tensor::rand(0f32, 1.0, (2, 3, 8, 8), &device)?;
        let kl: f32 = JointsKlLoss::default().loss(&pred, &target, None)?.to_scalar()?;
        assert!(kl.is_finite());
        assert!(kl >= -1e-6);
        Ok(())
    }

    #[test]
    fn test_kl_handles_all_zero_targets() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::randn(0f32, 1.0, (1, 2, 4, 4), &device)?;
        let target = Tensor::zeros((1, 2, 4, 4), candle_core::DType::F32, &device)?;
        let kl: f32 = JointsKlLoss::default().loss(&pred, &target, None)?.to_scalar()?;
        assert_eq!(kl, 0.0);
        Ok(())
    }

    #[test]
    fn test_kl_prefers_matching_peak() -> Result<()> {
        let device = Device::Cpu;
        let mut target = vec![0.0f32; 16];
        target[5] = 1.0;
        let target = Tensor::from_vec(target, (1, 1, 4, 4), &device)?;
        let near = (&target * 8.0)?;
        let far = (Tensor::ones_like(&target)? - &target)?;

        let criterion = JointsKlLoss::default();
        let near: f32 = criterion.loss(&near, &target, None)?.to_scalar()?;
        let far: f32 = criterion.loss(&far, &target, None)?.to_scalar()?;
        assert!(near < far);
        Ok(())
    }

    #[test]
    fn test_rejects_mismatched_inputs() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::zeros((1, 2, 4, 4), candle_core::DType::F32, &device)?;
        let target = Tensor::zeros((1, 2, 2, 2), candle_core::DType::F32, &device)?;
        assert!(JointsMseLoss::default().loss(&pred, &target, None).is_err());

        let weight = Tensor::ones((1, 3), candle_core::DType::F32, &device)?;
        assert!(matches!(
            JointsKlLoss::default().loss(&pred, &pred, Some(&weight)),
            Err(Error::ShapeMismatch { what: "instance weight", .. })
        ));
        Ok(())
    }

    #[test]
    fn test_weight_must_be_batch_by_joint() -> Result<()> {
        let device = Device::Cpu;
        let pred = Tensor::zeros((2, 3, 4, 4), candle_core::DType::F32, &device)?;
        let target = Tensor::ones((2, 3, 4, 4), candle_core::DType::F32, &device)?;

        // Same element count, wrong layout
        for weight in [
            Tensor::ones((3, 2), candle_core::DType::F32, &device)?,
            Tensor::ones(6, candle_core::DType::F32, &device)?,
        ] {
            assert!(matches!(
                JointsMseLoss::default().loss(&pred, &target, Some(&weight)),
                Err(Error::ShapeMismatch { what: "instance weight", .. })
            ));
        }

        let weight = Tensor::ones((2, 3), candle_core::DType::F32, &device)?;
        let loss: f32 = JointsMseLoss::default()
            .loss(&pred, &target, Some(&weight))?
            .to_scalar()?;
        assert!((loss - 0.5).abs() < 1e-6);
        Ok(())
    }
}

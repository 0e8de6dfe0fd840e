//! Regression disparity between the adversarial head and pseudo labels.
//!
//! In `min` mode the adversarial output is pulled toward the ground truth
//! gathered at the main head's peaks; in `max` mode it is compared against
//! the ground-false map, which drives it away from the predicted locations.
//! How the ground-false map is built is described by a [`FalseMapRecipe`].

use candle_core::Tensor;
use tracing::debug;

use regda_core::{DisparityConfig, DisparityMode, Error, PresenceRule, Result};

use crate::criterion::HeatmapCriterion;
use crate::decoder::PeakBatch;
use crate::ground_false::{
    blend_adversarial, carve_true_locations, normalize_by_max, presence_map, BLEND_SUPPRESSION,
};
use crate::pseudo_label::PseudoLabelGenerator;

/// Steps applied after the ground truth has been gathered.
///
/// Order: presence rule (or the generator's own strategy) → adversarial
/// blend → per-channel max normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FalseMapRecipe {
    pub presence: Option<PresenceRule>,
    pub adversarial_blend: Option<f32>,
    pub normalize_channels: bool,
}

impl FalseMapRecipe {
    /// Generator output as is.
    pub fn generator() -> Self {
        Self::default()
    }

    /// Presence rule, carved with the 10x ground truth.
    pub fn presence(rule: PresenceRule) -> Self {
        Self {
            presence: Some(rule),
            ..Self::default()
        }
    }

    /// Add the auxiliary adversarial prediction, suppress the true location
    /// with `BLEND_SUPPRESSION` and normalise each channel.
    pub fn blended(presence: Option<PresenceRule>) -> Self {
        Self {
            presence,
            adversarial_blend: Some(BLEND_SUPPRESSION),
            normalize_channels: true,
        }
    }
}

impl From<&DisparityConfig> for FalseMapRecipe {
    fn from(config: &DisparityConfig) -> Self {
        Self {
            presence: config.presence,
            adversarial_blend: config.adversarial_blend,
            normalize_channels: config.normalize_channels,
        }
    }
}

/// Inputs of one disparity evaluation
#[derive(Debug, Clone, Copy)]
pub struct DisparityInputs<'a> {
    /// Main head output `(B, K, H, W)`
    pub y: &'a Tensor,
    /// Adversarial head output, at template resolution
    pub y_adv: &'a Tensor,
    /// Further predictions (other heads or domains) folded in by the presence rule
    pub auxiliary: &'a [Tensor],
    /// Auxiliary adversarial output used by the blend step
    pub adversarial: Option<&'a Tensor>,
    /// Per-keypoint instance weight `(B, K)`
    pub weight: Option<&'a Tensor>,
}

impl<'a> DisparityInputs<'a> {
    pub fn new(y: &'a Tensor, y_adv: &'a Tensor) -> Self {
        Self {
            y,
            y_adv,
            auxiliary: &[],
            adversarial: None,
            weight: None,
        }
    }

    pub fn with_auxiliary(mut self, auxiliary: &'a [Tensor]) -> Self {
        self.auxiliary = auxiliary;
        self
    }

    pub fn with_adversarial(mut self, adversarial: &'a Tensor) -> Self {
        self.adversarial = Some(adversarial);
        self
    }

    pub fn with_weight(mut self, weight: &'a Tensor) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Loss together with the targets it was computed against
#[derive(Debug, Clone)]
pub struct DisparityOutput {
    pub mode: DisparityMode,
    /// Criterion value
    pub loss: Tensor,
    pub ground_truth: Tensor,
    pub ground_false: Tensor,
    /// Peaks of the main prediction on the template grid
    pub peaks: PeakBatch,
}

/// Regression disparity loss
pub struct RegressionDisparity<C> {
    generator: PseudoLabelGenerator,
    criterion: C,
    recipe: FalseMapRecipe,
}

impl<C: HeatmapCriterion> RegressionDisparity<C> {
    pub fn new(generator: PseudoLabelGenerator, criterion: C) -> Self {
        Self::with_recipe(generator, criterion, FalseMapRecipe::default())
    }

    pub fn with_recipe(generator: PseudoLabelGenerator, criterion: C, recipe: FalseMapRecipe) -> Self {
        Self {
            generator,
            criterion,
            recipe,
        }
    }

    /// Evaluate the disparity for `mode`.
    pub fn forward(&self, inputs: DisparityInputs<'_>, mode: DisparityMode) -> Result<DisparityOutput> {
        let (ground_truth, ground_false, peaks) = self.targets(&inputs)?;

        if inputs.y_adv.dims() != ground_truth.dims() {
            return Err(Error::ShapeMismatch {
                what: "adversarial prediction",
                expected: ground_truth.dims().to_vec(),
                actual: inputs.y_adv.dims().to_vec(),
            });
        }

        debug!(mode = %mode, batch = peaks.batch, "Evaluating regression disparity");

        let target = match mode {
            DisparityMode::Min => &ground_truth,
            DisparityMode::Max => &ground_false,
        };
        let loss = self.criterion.loss(inputs.y_adv, target, inputs.weight)?;

        Ok(DisparityOutput {
            mode,
            loss,
            ground_truth,
            ground_false,
            peaks,
        })
    }

    /// Like [`forward`](Self::forward) with the mode given as `"min"` or `"max"`.
    pub fn forward_str(&self, inputs: DisparityInputs<'_>, mode: &str) -> Result<DisparityOutput> {
        let mode: DisparityMode = mode.parse()?;
        self.forward(inputs, mode)
    }

    /// Ground truth and ground false for `inputs` without evaluating the criterion.
    pub fn targets(&self, inputs: &DisparityInputs<'_>) -> Result<(Tensor, Tensor, PeakBatch)> {
        for aux in inputs.auxiliary {
            if aux.dims() != inputs.y.dims() {
                return Err(Error::ShapeMismatch {
                    what: "auxiliary prediction",
                    expected: inputs.y.dims().to_vec(),
                    actual: aux.dims().to_vec(),
                });
            }
        }

        let (ground_truth, mut ground_false, peaks) = match self.recipe.presence {
            None => {
                if !inputs.auxiliary.is_empty() {
                    return Err(Error::InvalidInput(
                        "auxiliary predictions require a presence rule".to_string(),
                    ));
                }
                let labels = self.generator.generate(inputs.y)?;
                (labels.ground_truth, labels.ground_false, labels.peaks)
            }
            Some(rule) => {
                let (ground_truth, peaks) = self.generator.ground_truth(inputs.y)?;
                let auxiliary = inputs
                    .auxiliary
                    .iter()
                    .map(|aux| self.generator.ground_truth(aux).map(|(gt, _)| gt))
                    .collect::<Result<Vec<_>>>()?;
                let presence = presence_map(rule, &ground_truth, &auxiliary)?;
                let ground_false = carve_true_locations(&presence, &ground_truth)?;
                (ground_truth, ground_false, peaks)
            }
        };

        match (self.recipe.adversarial_blend, inputs.adversarial) {
            (Some(factor), Some(adversarial)) => {
                ground_false = blend_adversarial(&ground_false, adversarial, &ground_truth, factor)?;
            }
            (None, Some(_)) => {
                return Err(Error::InvalidInput(
                    "auxiliary adversarial prediction requires an adversarial blend factor".to_string(),
                ));
            }
            _ => {}
        }

        if self.recipe.normalize_channels {
            ground_false = normalize_by_max(&ground_false)?;
        }

        if let Some(weight) = inputs.weight {
            let (b, k) = (peaks.batch, peaks.keypoints);
            if weight.dims() != [b, k] {
                return Err(Error::ShapeMismatch {
                    what: "instance weight",
                    expected: vec![b, k],
                    actual: weight.dims().to_vec(),
                });
            }
        }

        Ok((ground_truth, ground_false, peaks))
    }

    pub fn generator(&self) -> &PseudoLabelGenerator {
        &self.generator
    }

    pub fn criterion(&self) -> &C {
        &self.criterion
    }

    pub fn recipe(&self) -> &FalseMapRecipe {
        &self.recipe
    }
}

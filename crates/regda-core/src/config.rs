//! Configuration for pseudo-label generation, disparity and the gradient
//! reversal schedule.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{GroundFalseStrategy, PresenceRule, TemplateSpec};

/// Complete RegDA configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegDaConfig {
    /// Heatmap geometry and pseudo-label strategy
    pub heatmap: HeatmapConfig,

    /// Ground-false recipe used by the disparity loss
    pub disparity: DisparityConfig,

    /// Gradient reversal warm-start schedule
    pub schedule: GradientScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeatmapConfig {
    /// Number of keypoints K
    pub num_keypoints: usize,

    /// Height of the predicted heatmaps
    pub input_height: usize,

    /// Width of the predicted heatmaps
    pub input_width: usize,

    /// Integer divisor from prediction grid to template grid
    pub scale: usize,

    /// Gaussian spread of the templates
    pub sigma: f64,

    /// Template window half-width as a multiple of sigma
    pub truncate: f64,

    /// How the generator derives ground-false maps
    pub ground_false: GroundFalseStrategy,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        Self {
            num_keypoints: 21,
            input_height: 64,
            input_width: 64,
            scale: 1,
            sigma: 2.0,
            truncate: 3.0,
            ground_false: GroundFalseStrategy::CrossSuppression,
        }
    }
}

impl HeatmapConfig {
    pub fn new(num_keypoints: usize) -> Self {
        Self {
            num_keypoints,
            ..Default::default()
        }
    }

    /// Template grid the bank must be built for.
    ///
    /// Fails when the prediction grid is not an exact multiple of `scale`,
    /// since floor-divided peaks would otherwise index past the bank.
    pub fn template_spec(&self) -> Result<TemplateSpec> {
        if self.scale == 0 {
            return Err(Error::Config("scale must be at least 1".to_string()));
        }
        if self.input_height % self.scale != 0 || self.input_width % self.scale != 0 {
            return Err(Error::ResolutionMismatch {
                input_height: self.input_height,
                input_width: self.input_width,
                scale: self.scale,
                template_height: self.input_height / self.scale,
                template_width: self.input_width / self.scale,
            });
        }
        Ok(TemplateSpec {
            height: self.input_height / self.scale,
            width: self.input_width / self.scale,
            sigma: self.sigma,
            truncate: self.truncate,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_keypoints == 0 {
            return Err(Error::Config("num_keypoints must be positive".to_string()));
        }
        self.template_spec()?
            .validate()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DisparityConfig {
    /// Presence rule; `None` keeps the generator's own ground-false map
    pub presence: Option<PresenceRule>,

    /// Factor on the ground truth subtracted after adding the auxiliary
    /// adversarial prediction; `None` disables blending
    pub adversarial_blend: Option<f32>,

    /// Divide each (sample, keypoint) slice by its own maximum
    pub normalize_channels: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientScheduleConfig {
    /// Steepness of the warm-start curve
    pub alpha: f64,

    /// Initial coefficient
    pub lo: f64,

    /// Final coefficient
    pub hi: f64,

    /// Iterations until the coefficient approaches `hi`
    pub max_iters: u64,

    /// Advance the schedule on every forward pass
    pub auto_step: bool,
}

impl Default for GradientScheduleConfig {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            lo: 0.0,
            hi: 0.1,
            max_iters: 1000,
            auto_step: false,
        }
    }
}

impl GradientScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iters == 0 {
            return Err(Error::Config("max_iters must be positive".to_string()));
        }
        if self.hi < self.lo {
            return Err(Error::Config(format!(
                "schedule hi ({}) must not be below lo ({})",
                self.hi, self.lo
            )));
        }
        Ok(())
    }
}

impl RegDaConfig {
    /// Load configuration from file, overridden by `REGDA_*` variables
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("REGDA").separator("__"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("REGDA").separator("__"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.heatmap.validate()?;
        self.schedule.validate()?;
        if let Some(factor) = self.disparity.adversarial_blend {
            if !factor.is_finite() || factor < 0.0 {
                return Err(Error::Config(format!(
                    "adversarial_blend must be a non-negative finite factor, got {factor}"
                )));
            }
        }
        Ok(())
    }
}

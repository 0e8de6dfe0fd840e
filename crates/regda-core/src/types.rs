//! Fundamental types shared by the template bank, pseudo-label generator
//! and disparity loss.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Whether the adversarial head is pulled toward (`Min`) or pushed away
/// from (`Max`) the pseudo ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisparityMode {
    /// Compare the adversarial output against the ground-truth map
    Min,
    /// Compare the adversarial output against the ground-false map
    Max,
}

impl DisparityMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisparityMode::Min => "min",
            DisparityMode::Max => "max",
        }
    }
}

impl fmt::Display for DisparityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DisparityMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "min" => Ok(DisparityMode::Min),
            "max" => Ok(DisparityMode::Max),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

/// How the pseudo-label generator derives a ground-false map from the
/// gathered ground-truth templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundFalseStrategy {
    /// Spread every keypoint's template into all other channels through the
    /// all-ones-minus-identity matrix, clipped to [0, 1]
    #[default]
    CrossSuppression,
    /// `clip(1 - 10 * ground_truth, 0, 1)`
    Complement,
}

/// Rule collapsing one or more ground-truth batches into a single
/// per-sample "a keypoint is plausible here" map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceRule {
    /// Clipped channel sum of the primary prediction only
    Own,
    /// Raw channel sums of all predictions added, normalised by the sample max
    Summed,
    /// Clipped channel sums added, normalised by the sample max
    ClippedSum,
    /// Primary presence plus whatever each auxiliary adds on top of it
    Union,
    /// Like `Union`, but the difference is taken per channel before summing
    ChannelUnion,
}

impl PresenceRule {
    /// Whether this rule accepts auxiliary predictions at all.
    pub fn takes_auxiliary(&self) -> bool {
        !matches!(self, PresenceRule::Own)
    }
}

/// Integer arg-max location of one keypoint channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecodedPeak {
    /// Column index in `[0, W)`
    pub x: usize,
    /// Row index in `[0, H)`
    pub y: usize,
    /// Heatmap value at the arg-max
    pub confidence: f32,
}

impl DecodedPeak {
    pub fn new(x: usize, y: usize, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    /// Channels whose maximum is not strictly positive carry no location.
    pub fn is_valid(&self) -> bool {
        self.confidence > 0.0
    }

    /// Floor-divide the coordinates for a coarser template grid.
    pub fn scaled(&self, divisor: usize) -> Self {
        Self {
            x: self.x / divisor.max(1),
            y: self.y / divisor.max(1),
            confidence: self.confidence,
        }
    }
}

/// Sub-pixel refined keypoint location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RefinedPeak {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

/// Geometry of a Gaussian template bank.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    /// Grid height H
    pub height: usize,
    /// Grid width W
    pub width: usize,
    /// Gaussian spread
    pub sigma: f64,
    /// Window half-width as a multiple of sigma
    pub truncate: f64,
}

impl TemplateSpec {
    pub fn new(height: usize, width: usize, sigma: f64) -> Self {
        Self {
            height,
            width,
            sigma,
            truncate: 3.0,
        }
    }

    pub fn with_truncate(mut self, truncate: f64) -> Self {
        self.truncate = truncate;
        self
    }

    /// Half-width of the pasted patch in whole pixels.
    pub fn radius(&self) -> usize {
        (self.sigma * self.truncate).floor() as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.height == 0 || self.width == 0 {
            return Err(Error::InvalidInput(format!(
                "template grid must be non-empty, got {}x{}",
                self.height, self.width
            )));
        }
        if !(self.sigma > 0.0) || !self.sigma.is_finite() {
            return Err(Error::InvalidInput(format!(
                "sigma must be positive and finite, got {}",
                self.sigma
            )));
        }
        if !(self.truncate > 0.0) || !self.truncate.is_finite() {
            return Err(Error::InvalidInput(format!(
                "truncate must be positive and finite, got {}",
                self.truncate
            )));
        }
        Ok(())
    }
}

impl Default for TemplateSpec {
    fn default() -> Self {
        Self::new(64, 64, 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("min".parse::<DisparityMode>().unwrap(), DisparityMode::Min);
        assert_eq!("max".parse::<DisparityMode>().unwrap(), DisparityMode::Max);
        assert!(matches!(
            "MAX".parse::<DisparityMode>(),
            Err(Error::InvalidMode(m)) if m == "MAX"
        ));
        assert!("".parse::<DisparityMode>().is_err());
    }

    #[test]
    fn test_peak_scaling_floors() {
        let peak = DecodedPeak::new(63, 5, 0.7).scaled(4);
        assert_eq!((peak.x, peak.y), (15, 1));
        assert_eq!(peak.confidence, 0.7);
    }

    #[test]
    fn test_template_radius() {
        assert_eq!(TemplateSpec::new(64, 64, 2.0).radius(), 6);
        assert_eq!(TemplateSpec::new(16, 16, 2.0).with_truncate(1.5).radius(), 3);
        assert_eq!(TemplateSpec::new(32, 32, 2.0).with_truncate(2.0).radius(), 4);
    }

    #[test]
    fn test_template_validation() {
        assert!(TemplateSpec::default().validate().is_ok());
        assert!(TemplateSpec::new(0, 64, 2.0).validate().is_err());
        assert!(TemplateSpec::new(64, 64, 0.0).validate().is_err());
        assert!(TemplateSpec::new(64, 64, f64::NAN).validate().is_err());
        assert!(TemplateSpec::new(64, 64, 2.0)
            .with_truncate(-1.0)
            .validate()
            .is_err());
    }
}

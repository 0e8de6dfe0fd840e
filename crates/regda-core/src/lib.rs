//! # RegDA-Core
//!
//! Core types, errors and configuration for regressive domain adaptation
//! of 2D keypoint detectors.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DisparityConfig, GradientScheduleConfig, HeatmapConfig, RegDaConfig};
pub use error::{Error, Result};
pub use types::*;

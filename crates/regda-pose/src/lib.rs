//! # RegDA-Pose
//!
//! Pseudo-label heatmaps and the regression disparity loss for
//! regressive domain adaptation of 2D keypoint detectors.
//!
//! ## Pipeline
//!
//! 1. **Template bank**: one Gaussian heatmap per integer peak location,
//!    built once per grid geometry and shared process-wide
//! 2. **Peak decoding**: argmax per (sample, keypoint) on a detached copy
//!    of the prediction
//! 3. **Pseudo labels**: ground truth gathered from the bank at the decoded
//!    peaks, plus a ground-false map marking where the keypoint is not
//! 4. **Regression disparity**: the adversarial head is pulled toward the
//!    ground truth (`min`) or toward the ground-false map (`max`)
//!
//! ## Network
//!
//! [`RegDaPoseModel`] shares an upsampling trunk between a main head and an
//! adversarial head reached through a warm-start gradient reversal layer.
//!
//! Disparity: L_min = MSE(y_adv, gt(y)), L_max = MSE(y_adv, gf(y))

pub mod criterion;
pub mod decoder;
pub mod disparity;
pub mod gradient;
pub mod ground_false;
pub mod heads;
pub mod model;
pub mod pseudo_label;
pub mod template;

pub use criterion::*;
pub use decoder::*;
pub use disparity::*;
pub use gradient::*;
pub use ground_false::*;
pub use heads::*;
pub use model::*;
pub use pseudo_label::*;
pub use template::*;

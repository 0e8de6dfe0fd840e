//! Ground-false map construction.
//!
//! A ground-false map marks where the adversarial head should *not* place a
//! keypoint. The two base strategies work on the ground truth alone; the
//! presence rules additionally fold in ground truths decoded from auxiliary
//! predictions before the true location is carved out again.

use candle_core::{Tensor, D};

use regda_core::{Error, GroundFalseStrategy, PresenceRule, Result};

/// Multiplier applied to the ground truth before it is subtracted, so that
/// any pixel with ground truth >= 0.1 is driven to zero.
pub const TRUE_SUPPRESSION: f32 = 10.0;

/// Default factor used when blending in an auxiliary adversarial prediction.
pub const BLEND_SUPPRESSION: f32 = 100.0;

/// Apply a base strategy to a `(B, K, H, W)` ground truth.
pub fn apply_strategy(
    strategy: GroundFalseStrategy,
    ground_truth: &Tensor,
    suppression: &Tensor,
) -> Result<Tensor> {
    match strategy {
        GroundFalseStrategy::CrossSuppression => cross_suppression(ground_truth, suppression),
        GroundFalseStrategy::Complement => complement(ground_truth),
    }
}

/// `clip(M . gt, 0, 1)` over the keypoint axis.
///
/// Channel `k` receives the sum of every other keypoint's template at each
/// pixel. `M` is symmetric, so left-multiplying the `(K, H*W)` slices is the
/// same as right-multiplying their transposes.
pub fn cross_suppression(ground_truth: &Tensor, suppression: &Tensor) -> Result<Tensor> {
    let (b, k, h, w) = ground_truth.dims4()?;
    let (mk, mk2) = suppression.dims2()?;
    if mk != k || mk2 != k {
        return Err(Error::ShapeMismatch {
            what: "suppression matrix",
            expected: vec![k, k],
            actual: vec![mk, mk2],
        });
    }

    let flat = ground_truth.reshape((b, k, h * w))?;
    let m = suppression
        .to_dtype(flat.dtype())?
        .unsqueeze(0)?
        .broadcast_as((b, k, k))?
        .contiguous()?;
    let spread = m.matmul(&flat)?;

    Ok(spread.clamp(0f32, 1f32)?.reshape((b, k, h, w))?)
}

/// `clip(1 - 10 * gt, 0, 1)`: near-binary "definitely not this keypoint".
pub fn complement(ground_truth: &Tensor) -> Result<Tensor> {
    Ok(ground_truth
        .affine(-(TRUE_SUPPRESSION as f64), 1.0)?
        .clamp(0f32, 1f32)?)
}

/// Collapse the primary ground truth and any auxiliary ground truths into a
/// `(B, H, W)` presence map.
pub fn presence_map(
    rule: PresenceRule,
    primary: &Tensor,
    auxiliary: &[Tensor],
) -> Result<Tensor> {
    if !rule.takes_auxiliary() && !auxiliary.is_empty() {
        return Err(Error::InvalidInput(format!(
            "presence rule {rule:?} takes no auxiliary predictions, got {}",
            auxiliary.len()
        )));
    }
    for aux in auxiliary {
        if aux.dims() != primary.dims() {
            return Err(Error::ShapeMismatch {
                what: "auxiliary ground truth",
                expected: primary.dims().to_vec(),
                actual: aux.dims().to_vec(),
            });
        }
    }

    let own = clipped_channel_sum(primary)?;

    match rule {
        PresenceRule::Own => Ok(own),
        PresenceRule::Summed => {
            let mut total = primary.sum(1)?;
            for aux in auxiliary {
                total = (total + aux.sum(1)?)?;
            }
            normalize_by_max(&total)
        }
        PresenceRule::ClippedSum => {
            let mut total = own;
            for aux in auxiliary {
                total = (total + clipped_channel_sum(aux)?)?;
            }
            normalize_by_max(&total)
        }
        PresenceRule::Union => {
            let mut total = own.clone();
            for aux in auxiliary {
                let extra = (clipped_channel_sum(aux)? - &own)?.clamp(0f32, 1f32)?;
                total = (total + extra)?;
            }
            Ok(total.clamp(0f32, 1f32)?)
        }
        PresenceRule::ChannelUnion => {
            let mut total = own;
            for aux in auxiliary {
                let extra = (aux - primary)?.clamp(0f32, 1f32)?;
                total = (total + clipped_channel_sum(&extra)?)?;
            }
            Ok(total.clamp(0f32, 1f32)?)
        }
    }
}

/// `clip(broadcast_K(presence) - 10 * gt, 0, 1)`.
pub fn carve_true_locations(presence: &Tensor, ground_truth: &Tensor) -> Result<Tensor> {
    let (b, k, h, w) = ground_truth.dims4()?;
    let expanded = presence.unsqueeze(1)?.repeat((1, k, 1, 1))?;
    if expanded.dims() != [b, k, h, w] {
        return Err(Error::ShapeMismatch {
            what: "presence map",
            expected: vec![b, h, w],
            actual: presence.dims().to_vec(),
        });
    }
    let suppressed = (expanded - (ground_truth * TRUE_SUPPRESSION as f64)?)?;
    Ok(suppressed.clamp(0f32, 1f32)?)
}

/// `clip(ground_false + adversarial - factor * gt, 0, 1)`.
pub fn blend_adversarial(
    ground_false: &Tensor,
    adversarial: &Tensor,
    ground_truth: &Tensor,
    factor: f32,
) -> Result<Tensor> {
    if adversarial.dims() != ground_false.dims() {
        return Err(Error::ShapeMismatch {
            what: "auxiliary adversarial prediction",
            expected: ground_false.dims().to_vec(),
            actual: adversarial.dims().to_vec(),
        });
    }
    let adversarial = adversarial.detach().to_dtype(ground_false.dtype())?;
    let blended = ((ground_false + adversarial)? - (ground_truth * factor as f64)?)?;
    Ok(blended.clamp(0f32, 1f32)?)
}

/// Divide each trailing `(H, W)` slice by its own maximum.
///
/// Slices whose maximum is not strictly positive are returned unchanged, so
/// an all-zero channel stays zero instead of turning into NaN.
pub fn normalize_by_max(t: &Tensor) -> Result<Tensor> {
    let max = t.max_keepdim(D::Minus1)?.max_keepdim(D::Minus2)?;
    let zeros = max.zeros_like()?;
    let ones = max.ones_like()?;
    let denom = max.gt(&zeros)?.where_cond(&max, &ones)?;
    Ok(t.broadcast_div(&denom)?)
}

fn clipped_channel_sum(ground_truth: &Tensor) -> Result<Tensor> {
    Ok(ground_truth.sum(1)?.clamp(0f32, 1f32)?)
}

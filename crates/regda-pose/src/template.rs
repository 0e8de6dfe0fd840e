//! Gaussian heatmap template bank and the cross-keypoint suppression matrix.
//!
//! For every integer peak location `(mu_x, mu_y)` on an `H x W` grid the bank
//! stores one `H x W` image holding an unnormalised Gaussian patch pasted at
//! that location. The patch is cut from a fixed `(2r+1) x (2r+1)` window and
//! clipped against the grid, so the peak stays exactly 1.0 even on the border.
//!
//! Layout: row `mu_x * H + mu_y` of a `(W*H, H*W)` table, each row being the
//! flattened image in row-major `(iy, ix)` order. Gathering templates for a
//! batch of peaks is a single `index_select`.

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{Device, Tensor};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, info};

use regda_core::{Result, TemplateSpec};

/// Immutable bank of Gaussian templates for one grid geometry.
#[derive(Debug)]
pub struct TemplateBank {
    spec: TemplateSpec,
    table: Tensor,
}

impl TemplateBank {
    /// Build a bank on the CPU.
    pub fn new(spec: TemplateSpec) -> Result<Self> {
        spec.validate()?;

        let (h, w) = (spec.height, spec.width);
        let patch = gaussian_patch(&spec);
        let radius = spec.radius();
        let side = 2 * radius + 1;
        let image_len = h * w;

        let mut data = vec![0.0f32; w * h * image_len];

        for mu_x in 0..w {
            for mu_y in 0..h {
                let row = &mut data[(mu_x * h + mu_y) * image_len..][..image_len];

                // Image range covered by the window, clipped to the grid
                let y_lo = mu_y.saturating_sub(radius);
                let y_hi = (mu_y + radius).min(h - 1);
                let x_lo = mu_x.saturating_sub(radius);
                let x_hi = (mu_x + radius).min(w - 1);

                for iy in y_lo..=y_hi {
                    let gy = iy + radius - mu_y;
                    for ix in x_lo..=x_hi {
                        let gx = ix + radius - mu_x;
                        row[iy * w + ix] = patch[gy * side + gx];
                    }
                }
            }
        }

        let table = Tensor::from_vec(data, (w * h, image_len), &Device::Cpu)?;

        info!(
            height = h,
            width = w,
            sigma = spec.sigma,
            radius,
            bytes = w * h * image_len * std::mem::size_of::<f32>(),
            "Built heatmap template bank"
        );

        Ok(Self { spec, table })
    }

    /// Fetch the bank for `spec` from the process-wide cache, building it on
    /// first use.
    pub fn shared(spec: TemplateSpec) -> Result<Arc<Self>> {
        static CACHE: Lazy<Mutex<HashMap<BankKey, Arc<TemplateBank>>>> =
            Lazy::new(|| Mutex::new(HashMap::new()));

        let key = BankKey::from(&spec);
        if let Some(bank) = CACHE.lock().get(&key) {
            debug!(height = spec.height, width = spec.width, "Template bank cache hit");
            return Ok(bank.clone());
        }

        // Built without holding the lock; a concurrent builder may win the insert
        let built = Arc::new(Self::new(spec)?);
        let bank = CACHE.lock().entry(key).or_insert(built).clone();
        Ok(bank)
    }

    pub fn spec(&self) -> &TemplateSpec {
        &self.spec
    }

    pub fn height(&self) -> usize {
        self.spec.height
    }

    pub fn width(&self) -> usize {
        self.spec.width
    }

    /// The flattened `(W*H, H*W)` table, resident on the CPU.
    pub fn table(&self) -> &Tensor {
        &self.table
    }

    /// Row of the table holding the template peaked at `(x, y)`.
    pub fn row_index(&self, x: usize, y: usize) -> usize {
        x * self.spec.height + y
    }

    /// Template peaked at column `x`, row `y`, shaped `(H, W)`.
    pub fn template(&self, x: usize, y: usize) -> Result<Tensor> {
        let row = self.table.get(self.row_index(x, y))?;
        Ok(row.reshape((self.spec.height, self.spec.width))?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BankKey {
    height: usize,
    width: usize,
    sigma_bits: u64,
    truncate_bits: u64,
}

impl From<&TemplateSpec> for BankKey {
    fn from(spec: &TemplateSpec) -> Self {
        Self {
            height: spec.height,
            width: spec.width,
            sigma_bits: spec.sigma.to_bits(),
            truncate_bits: spec.truncate.to_bits(),
        }
    }
}

/// Row-major `(2r+1)^2` window with value 1.0 at its centre.
fn gaussian_patch(spec: &TemplateSpec) -> Vec<f32> {
    let radius = spec.radius() as f64;
    let side = 2 * spec.radius() + 1;
    let denom = 2.0 * spec.sigma * spec.sigma;

    let mut patch = Vec::with_capacity(side * side);
    for gy in 0..side {
        for gx in 0..side {
            let dx = gx as f64 - radius;
            let dy = gy as f64 - radius;
            patch.push((-(dx * dx + dy * dy) / denom).exp() as f32);
        }
    }
    patch
}

/// `K x K` matrix with zeros on the diagonal and ones elsewhere.
pub fn suppression_matrix(num_keypoints: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![1.0f32; num_keypoints * num_keypoints];
    for k in 0..num_keypoints {
        data[k * num_keypoints + k] = 0.0;
    }
    Ok(Tensor::from_vec(data, (num_keypoints, num_keypoints), device)?)
}

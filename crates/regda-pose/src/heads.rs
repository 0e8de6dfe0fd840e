//! Upsampling trunk and keypoint regression heads.
//!
//! The upsampling trunk turns backbone features into a heatmap-resolution
//! feature map; regression heads map that feature map to one confidence
//! map per keypoint.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{
    batch_norm, BatchNorm, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Init,
    VarBuilder,
};

/// Standard deviation of the normal initialisation of every conv weight
const INIT_STD: f64 = 0.001;

/// Configuration for the deconvolution upsampling trunk
#[derive(Debug, Clone)]
pub struct UpsamplingConfig {
    /// Backbone output channels
    pub in_channels: usize,
    /// Channels of every deconvolution stage
    pub hidden_dim: usize,
    /// Number of x2 stages
    pub num_layers: usize,
}

impl Default for UpsamplingConfig {
    fn default() -> Self {
        Self {
            in_channels: 2048,
            hidden_dim: 256,
            num_layers: 3,
        }
    }
}

/// Stack of (ConvTranspose2d k4 s2 p1, BatchNorm, ReLU) stages
pub struct Upsampling {
    stages: Vec<(ConvTranspose2d, BatchNorm)>,
    config: UpsamplingConfig,
}

impl Upsampling {
    pub fn new(config: UpsamplingConfig, vb: VarBuilder) -> Result<Self> {
        let mut stages = Vec::with_capacity(config.num_layers);
        let mut in_channels = config.in_channels;

        for i in 0..config.num_layers {
            let vb = vb.pp(format!("deconv{}", i));
            let weight = vb.get_with_hints(
                (in_channels, config.hidden_dim, 4, 4),
                "weight",
                Init::Randn {
                    mean: 0.0,
                    stdev: INIT_STD,
                },
            )?;
            let deconv = ConvTranspose2d::new(
                weight,
                None,
                ConvTranspose2dConfig {
                    padding: 1,
                    output_padding: 0,
                    stride: 2,
                    dilation: 1,
                },
            );
            let bn = batch_norm(config.hidden_dim, 1e-5, vb.pp("bn"))?;
            stages.push((deconv, bn));
            in_channels = config.hidden_dim;
        }

        Ok(Self { stages, config })
    }

    /// Forward pass doubling the spatial size per stage
    ///
    /// # Arguments
    /// * `features` - Backbone features [batch, in_channels, h, w]
    /// * `train` - Use batch statistics in the norm layers
    pub fn forward_t(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = features.clone();
        for (deconv, bn) in &self.stages {
            x = deconv.forward(&x)?;
            x = bn.forward_t(&x, train)?;
            x = x.relu()?;
        }
        Ok(x)
    }

    /// Channels of the produced feature map
    pub fn out_channels(&self) -> usize {
        if self.stages.is_empty() {
            self.config.in_channels
        } else {
            self.config.hidden_dim
        }
    }

    pub fn config(&self) -> &UpsamplingConfig {
        &self.config
    }
}

/// Configuration for a keypoint regression head
#[derive(Debug, Clone)]
pub struct HeadConfig {
    /// Input feature channels
    pub channels: usize,
    /// Number of keypoints K
    pub num_keypoints: usize,
    /// Total conv layers, the last one being the 1x1 projection
    pub num_layers: usize,
}

impl Default for HeadConfig {
    fn default() -> Self {
        Self {
            channels: 256,
            num_keypoints: 21,
            num_layers: 2,
        }
    }
}

/// (num_layers - 1) x (Conv3x3, BatchNorm, ReLU) followed by a 1x1 conv to K maps
pub struct RegressionHead {
    blocks: Vec<(Conv2d, BatchNorm)>,
    projection: Conv2d,
    config: HeadConfig,
}

impl RegressionHead {
    pub fn new(config: HeadConfig, vb: VarBuilder) -> Result<Self> {
        let mut blocks = Vec::with_capacity(config.num_layers.saturating_sub(1));
        for i in 0..config.num_layers.saturating_sub(1) {
            let vb = vb.pp(format!("block{}", i));
            let conv = conv2d_normal(
                config.channels,
                config.channels,
                3,
                Conv2dConfig {
                    padding: 1,
                    ..Default::default()
                },
                vb.pp("conv"),
            )?;
            let bn = batch_norm(config.channels, 1e-5, vb.pp("bn"))?;
            blocks.push((conv, bn));
        }

        let projection = conv2d_normal(
            config.channels,
            config.num_keypoints,
            1,
            Conv2dConfig::default(),
            vb.pp("heatmap"),
        )?;

        Ok(Self {
            blocks,
            projection,
            config,
        })
    }

    /// Forward pass producing keypoint heatmaps
    ///
    /// # Arguments
    /// * `features` - Upsampled features [batch, channels, H, W]
    ///
    /// # Returns
    /// Heatmaps tensor [batch, num_keypoints, H, W]
    pub fn forward_t(&self, features: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = features.clone();
        for (conv, bn) in &self.blocks {
            x = conv.forward(&x)?;
            x = bn.forward_t(&x, train)?;
            x = x.relu()?;
        }
        self.projection.forward(&x)
    }

    pub fn config(&self) -> &HeadConfig {
        &self.config
    }
}

/// Conv2d with N(0, 0.001) weights and zero bias
fn conv2d_normal(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: Conv2dConfig,
    vb: VarBuilder,
) -> Result<Conv2d> {
    let weight = vb.get_with_hints(
        (out_channels, in_channels / cfg.groups, kernel_size, kernel_size),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: INIT_STD,
        },
    )?;
    let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.0))?;
    Ok(Conv2d::new(weight, Some(bias), cfg))
}

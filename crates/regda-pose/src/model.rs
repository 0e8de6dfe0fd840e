//! Pose network with a main and an adversarial regression head.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use tracing::info;

use regda_core::{GradientScheduleConfig, Result};

use crate::gradient::WarmStartGradientReverseLayer;
use crate::heads::{HeadConfig, RegressionHead, Upsampling, UpsamplingConfig};

/// Which output `predict` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalOutput {
    #[default]
    Main,
    Adversarial,
    /// Falls back to the main head when no auxiliary head is built
    Auxiliary,
}

/// Complete model configuration
#[derive(Debug, Clone)]
pub struct RegDaPoseConfig {
    pub upsampling: UpsamplingConfig,
    /// Depth and keypoint count shared by every head; `channels` is taken
    /// from the upsampling trunk
    pub head: HeadConfig,
    /// Build a second adversarial head fed with plain (non-reversed) features
    pub auxiliary_head: bool,
    pub eval_output: EvalOutput,
    pub schedule: GradientScheduleConfig,
}

impl Default for RegDaPoseConfig {
    fn default() -> Self {
        Self {
            upsampling: UpsamplingConfig::default(),
            head: HeadConfig::default(),
            auxiliary_head: false,
            eval_output: EvalOutput::Main,
            schedule: GradientScheduleConfig::default(),
        }
    }
}

/// Outputs of a training forward pass
#[derive(Debug, Clone)]
pub struct PoseOutputs {
    /// Main head `(B, K, H, W)`
    pub y: Tensor,
    /// Adversarial head behind the gradient reversal layer
    pub y_adv: Tensor,
    /// Auxiliary adversarial head, when configured
    pub y_adv2: Option<Tensor>,
}

/// Upsampling trunk shared by a main head and one or two adversarial heads
pub struct RegDaPoseModel {
    upsampling: Upsampling,
    head: RegressionHead,
    head_adv: RegressionHead,
    head_adv2: Option<RegressionHead>,
    grl: WarmStartGradientReverseLayer,
    config: RegDaPoseConfig,
}

impl RegDaPoseModel {
    pub fn new(config: RegDaPoseConfig, vb: VarBuilder) -> Result<Self> {
        config.schedule.validate()?;

        let upsampling = Upsampling::new(config.upsampling.clone(), vb.pp("upsampling"))?;
        let head_config = HeadConfig {
            channels: upsampling.out_channels(),
            ..config.head.clone()
        };

        let head = RegressionHead::new(head_config.clone(), vb.pp("head"))?;
        let head_adv = RegressionHead::new(head_config.clone(), vb.pp("head_adv"))?;
        let head_adv2 = if config.auxiliary_head {
            Some(RegressionHead::new(head_config, vb.pp("head_adv2"))?)
        } else {
            None
        };
        let grl = WarmStartGradientReverseLayer::from_config(&config.schedule);

        info!(
            keypoints = config.head.num_keypoints,
            head_layers = config.head.num_layers,
            auxiliary_head = config.auxiliary_head,
            "Built RegDA pose model"
        );

        Ok(Self {
            upsampling,
            head,
            head_adv,
            head_adv2,
            grl,
            config,
        })
    }

    /// Forward pass over backbone features
    ///
    /// # Arguments
    /// * `features` - Backbone output [batch, in_channels, h, w]
    /// * `train` - Use batch statistics in the norm layers
    pub fn forward_t(&self, features: &Tensor, train: bool) -> Result<PoseOutputs> {
        let f = self.upsampling.forward_t(features, train)?;
        let f_adv = self.grl.forward(&f)?;

        let y = self.head.forward_t(&f, train)?;
        let y_adv = self.head_adv.forward_t(&f_adv, train)?;
        let y_adv2 = match &self.head_adv2 {
            Some(head) => Some(head.forward_t(&f, train)?),
            None => None,
        };

        Ok(PoseOutputs { y, y_adv, y_adv2 })
    }

    /// Evaluation output selected by `eval_output`
    pub fn predict(&self, features: &Tensor) -> Result<Tensor> {
        let f = self.upsampling.forward_t(features, false)?;
        let head = match (self.config.eval_output, &self.head_adv2) {
            (EvalOutput::Adversarial, _) => &self.head_adv,
            (EvalOutput::Auxiliary, Some(head)) => head,
            _ => &self.head,
        };
        Ok(head.forward_t(&f, false)?)
    }

    /// Advance the gradient reversal schedule; call once per training iteration.
    pub fn step(&self) {
        self.grl.step();
    }

    pub fn gradient_layer(&self) -> &WarmStartGradientReverseLayer {
        &self.grl
    }

    pub fn config(&self) -> &RegDaPoseConfig {
        &self.config
    }
}

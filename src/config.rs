use crate::models::box_head::BoxHeadKind;

use burn::config::Config;
use thiserror::Error;

/// One backbone feature level consumed by the cascade.
#[derive(Config, Debug, PartialEq)]
pub struct FeatureLevelConfig {
    /// Channel count of the level's feature map.
    pub channels: usize,
    /// Downsampling stride of the level relative to the input image.
    pub stride: usize,
}

/// Immutable configuration of the cascade head.
///
/// The per-stage lists define the stage count: one IoU threshold and one
/// box-regression weight set per stage, in stage order with progressively
/// stricter thresholds. All cross-field consistency is checked once at
/// construction by [`CascadeRoiHeadsConfig::validate`]; no configuration
/// mistake surfaces at run time.
#[derive(Config, Debug)]
pub struct CascadeRoiHeadsConfig {
    /// Number of foreground classes; `num_classes` itself is the background
    /// sentinel in matched labels.
    pub num_classes: usize,
    /// Feature levels pooled from, highest resolution first.
    pub in_features: Vec<FeatureLevelConfig>,
    /// Per-stage ground-truth matching thresholds, e.g. `[0.5, 0.6, 0.7]`.
    pub stage_ious: Vec<f32>,
    /// Per-stage box-delta weights, e.g. `(10, 10, 5, 5)` then stricter.
    pub stage_bbox_reg_weights: Vec<(f32, f32, f32, f32)>,
    /// Feature transform of every stage head.
    pub box_head: BoxHeadKind,
    #[config(default = 7)]
    pub pooler_resolution: usize,
    #[config(default = 2)]
    pub pooler_sampling_ratio: usize,
    /// Multi-class regression is unsupported across cascade stages; this
    /// exists so a config port from a plain two-stage detector fails loudly
    /// instead of silently changing meaning.
    #[config(default = true)]
    pub cls_agnostic_bbox_reg: bool,
    /// Append ground-truth boxes to the stage-0 proposals in training, so
    /// the head sees positives even while the proposal generator is still
    /// poor.
    #[config(default = true)]
    pub proposal_append_gt: bool,
    /// Transition point of the regression Huber loss.
    #[config(default = 1.0)]
    pub smooth_l1_beta: f32,
    #[config(default = 0.05)]
    pub test_score_thresh: f32,
    #[config(default = 0.5)]
    pub test_nms_thresh: f32,
    #[config(default = 100)]
    pub test_topk_per_image: usize,
}

impl CascadeRoiHeadsConfig {
    pub fn num_stages(&self) -> usize {
        self.stage_ious.len()
    }

    /// Coordinate scale of each feature level (`1 / stride`).
    pub fn pooler_scales(&self) -> Vec<f32> {
        self.in_features
            .iter()
            .map(|level| 1.0 / level.stride as f32)
            .collect()
    }

    /// The shared channel count of the configured feature levels.
    ///
    /// Only meaningful after [`CascadeRoiHeadsConfig::validate`].
    pub fn in_channels(&self) -> usize {
        self.in_features[0].channels
    }

    /// Checks every cross-field invariant. Called by the controller
    /// constructor; configuration errors never escape to run time.
    pub fn validate(&self) -> Result<(), CascadeConfigError> {
        if self.stage_ious.is_empty() {
            return Err(CascadeConfigError::NoStages);
        }

        if self.stage_ious.len() != self.stage_bbox_reg_weights.len() {
            return Err(CascadeConfigError::StageCountMismatch {
                ious: self.stage_ious.len(),
                weights: self.stage_bbox_reg_weights.len(),
            });
        }

        if !self.cls_agnostic_bbox_reg {
            return Err(CascadeConfigError::ClassSpecificRegression);
        }

        if self.in_features.is_empty() {
            return Err(CascadeConfigError::NoFeatureLevels);
        }

        let channels: Vec<usize> = self.in_features.iter().map(|f| f.channels).collect();
        if channels.iter().any(|c| *c != channels[0]) {
            return Err(CascadeConfigError::ChannelMismatch(channels));
        }

        if let BoxHeadKind::FullyConnected(num_fc, fc_dim) = self.box_head {
            if num_fc == 0 || fc_dim == 0 {
                return Err(CascadeConfigError::EmptyBoxHead);
            }
        }

        if self.smooth_l1_beta <= 0.0 {
            return Err(CascadeConfigError::NonPositiveSmoothL1Beta(
                self.smooth_l1_beta,
            ));
        }

        Ok(())
    }
}

/// Fatal configuration mistakes, raised at construction only.
#[derive(Debug, Error, PartialEq)]
pub enum CascadeConfigError {
    #[error("at least one cascade stage is required")]
    NoStages,
    #[error("stage count mismatch: {ious} IoU thresholds vs {weights} box-regression weight sets")]
    StageCountMismatch { ious: usize, weights: usize },
    #[error("cascade box regression must be class-agnostic")]
    ClassSpecificRegression,
    #[error("at least one input feature level is required")]
    NoFeatureLevels,
    #[error("input feature levels must share one channel count, got {0:?}")]
    ChannelMismatch(Vec<usize>),
    #[error("fully connected box head needs at least one layer of nonzero width")]
    EmptyBoxHead,
    #[error("smooth-l1 beta must be positive, got {0}")]
    NonPositiveSmoothL1Beta(f32),
}

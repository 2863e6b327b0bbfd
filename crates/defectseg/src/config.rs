use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::image::LETTERBOX_PAD_VALUE;
use crate::threshold::MaskValues;

pub const DEFAULT_THRESHOLD: f32 = 0.15;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Scaling applied to decoded `[0, 255]` samples before inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputNormalization {
    /// Feed samples unchanged; the trained network expects this.
    #[default]
    Raw,
    /// Divide by 255.
    Unit,
}

impl InputNormalization {
    pub fn factor(self) -> f32 {
        match self {
            Self::Raw => 1.0,
            Self::Unit => 1.0 / 255.0,
        }
    }
}

/// What a batch does after an item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and move on to the next item.
    #[default]
    Continue,
    /// Stop at the first failed item.
    FailFast,
}

/// Runtime configuration of a [`Segmenter`](crate::Segmenter) and batch runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// Probabilities below this value become background.
    pub threshold: f32,
    pub input_normalization: InputNormalization,
    /// Letterbox padding, in the normalized input range.
    pub pad_value: f32,
    pub mask: MaskValues,
    pub jpeg_quality: u8,
    pub failure_policy: FailurePolicy,
    pub engine: EngineConfig,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            input_normalization: InputNormalization::default(),
            pad_value: LETTERBOX_PAD_VALUE,
            mask: MaskValues::default(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            failure_policy: FailurePolicy::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl SegmentConfig {
    /// Load from JSON; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.threshold.is_finite() {
            return Err("threshold must be finite".to_string());
        }
        if !self.pad_value.is_finite() {
            return Err("pad_value must be finite".to_string());
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(format!(
                "jpeg_quality must be in 1..=100, got {}",
                self.jpeg_quality
            ));
        }
        if self.engine.threads == Some(0) {
            return Err("engine.threads must be >= 1".to_string());
        }
        let eps = self.engine.batch_norm_epsilon;
        if !eps.is_finite() || eps < 0.0 {
            return Err("engine.batch_norm_epsilon must be finite and >= 0".to_string());
        }
        if !self.mask.background.is_finite() || !self.mask.foreground.is_finite() {
            return Err("mask values must be finite".to_string());
        }
        Ok(())
    }
}

//! Few-shot Dynamic MDETR configuration
//!
//! This module defines the configuration structure for the grounding model and
//! its preset variants.

use std::path::Path;

use serde::Deserialize;

use crate::error::{GroundingError, Result};

/// How a template's pseudo-class offset is chosen from the embedding table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSelection {
    /// One row drawn uniformly at random per template (seeded by the caller)
    RandomRow,
    /// Mean of all rows, identical for every template
    MeanOfRows,
}

/// Configuration for few-shot Dynamic MDETR
#[derive(Debug, Clone, Deserialize)]
pub struct FsMdetrConfig {
    // Backbone adapters
    /// Width of the vision backbone output (must equal `hidden_dim`)
    pub backbone_dim: usize,
    /// Width of the text backbone output
    pub text_dim: usize,
    /// Input image resolution (square)
    pub imsize: usize,
    /// Total stride of the vision backbone
    pub feature_stride: usize,
    /// Padded text length
    pub max_query_len: usize,

    // Fusion encoder
    /// Hidden width shared by prompts, visual and text tokens
    pub hidden_dim: usize,
    /// Number of fusion encoder layers (0 disables the encoder)
    pub vl_enc_layers: usize,
    /// Attention heads in every transformer block
    pub vl_nheads: usize,
    /// Feed-forward width in every transformer block
    pub vl_dim_feedforward: usize,

    // Iterative decoder
    /// Number of refinement stages
    pub stages: usize,
    /// Number of points sampled around the reference point at each stage
    pub sampling_points: usize,
    /// Use a distinct encoder-decoder block per stage
    pub different_transformer: bool,

    // Visual prompts
    /// Rows in the pseudo-class embedding table
    pub pseudo_num_classes: usize,
    /// Maximum number of template prompts
    pub max_prompts: usize,
    /// Pseudo-class row selection
    pub prompt_selection: PromptSelection,
}

impl Default for FsMdetrConfig {
    fn default() -> Self {
        Self::resnet50()
    }
}

impl FsMdetrConfig {
    /// ResNet-50 + BERT-base backbones at 640px
    pub fn resnet50() -> Self {
        Self {
            backbone_dim: 256,
            text_dim: 768,
            imsize: 640,
            feature_stride: 32,
            max_query_len: 20,
            hidden_dim: 256,
            vl_enc_layers: 6,
            vl_nheads: 8,
            vl_dim_feedforward: 2048,
            stages: 6,
            sampling_points: 36,
            different_transformer: false,
            pseudo_num_classes: 10,
            max_prompts: 16,
            prompt_selection: PromptSelection::RandomRow,
        }
    }

    /// ResNet-101 + BERT-base backbones at 640px
    pub fn resnet101() -> Self {
        Self {
            different_transformer: true,
            ..Self::resnet50()
        }
    }

    /// Small configuration for smoke tests and CPU experiments
    pub fn tiny() -> Self {
        Self {
            backbone_dim: 32,
            text_dim: 48,
            imsize: 128,
            feature_stride: 32,
            max_query_len: 8,
            hidden_dim: 32,
            vl_enc_layers: 1,
            vl_nheads: 4,
            vl_dim_feedforward: 64,
            stages: 3,
            sampling_points: 4,
            different_transformer: false,
            pseudo_num_classes: 4,
            max_prompts: 4,
            prompt_selection: PromptSelection::RandomRow,
        }
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| GroundingError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Side of the square visual feature grid
    pub fn feature_map_size(&self) -> usize {
        self.imsize / self.feature_stride
    }

    /// Number of visual tokens (H * W)
    pub fn num_visu_tokens(&self) -> usize {
        self.feature_map_size() * self.feature_map_size()
    }

    /// Check the widths and counts the model relies on
    pub fn validate(&self) -> Result<()> {
        if self.feature_stride == 0 {
            return Err(GroundingError::config("feature_stride must be at least 1"));
        }
        if self.backbone_dim != self.hidden_dim {
            return Err(GroundingError::config(format!(
                "pseudo embedding width {} must equal backbone width {}",
                self.hidden_dim, self.backbone_dim
            )));
        }
        if self.vl_nheads == 0 || self.hidden_dim % self.vl_nheads != 0 {
            return Err(GroundingError::config(format!(
                "hidden_dim {} is not divisible by vl_nheads {}",
                self.hidden_dim, self.vl_nheads
            )));
        }
        // Sine positions split the width into (y, x) halves of sin/cos pairs
        if self.hidden_dim == 0 || self.hidden_dim % 4 != 0 {
            return Err(GroundingError::config(format!(
                "hidden_dim {} must be a positive multiple of 4",
                self.hidden_dim
            )));
        }
        if self.stages == 0 {
            return Err(GroundingError::config("stages must be at least 1"));
        }
        if self.sampling_points == 0 {
            return Err(GroundingError::config("sampling_points must be at least 1"));
        }
        if self.pseudo_num_classes == 0 {
            return Err(GroundingError::config("pseudo_num_classes must be at least 1"));
        }
        if self.feature_map_size() == 0 {
            return Err(GroundingError::config(format!(
                "imsize {} is smaller than feature_stride {}",
                self.imsize, self.feature_stride
            )));
        }
        if self.max_query_len == 0 {
            return Err(GroundingError::config("max_query_len must be at least 1"));
        }
        Ok(())
    }
}

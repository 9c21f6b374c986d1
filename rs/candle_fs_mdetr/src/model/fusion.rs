//! Joint encoding of prompt, visual and text tokens
//!
//! The three streams are concatenated along the sequence axis in a fixed
//! order `[prompts, visual, text]`, run through a length-preserving encoder
//! and split back apart. Prompt tokens are never padding and take their
//! positions from a dedicated learned table.

use candle_core::{DType, Tensor, D};
use candle_nn::Init;

use crate::config::FsMdetrConfig;
use crate::error::{ensure_len, GroundingError, Result};
use crate::model::adapters::{TextFeatures, VisualFeatures};
use crate::model::transformer::{FusionTransformerEncoder, SequenceEncoder};
use crate::params::GroupedVarBuilder;

/// Refined streams after fusion; the prompt slice is dropped
#[derive(Debug, Clone)]
pub struct FusedStreams {
    /// [B, HW, C]
    pub visual: Tensor,
    /// [B, HW]
    pub visual_mask: Tensor,
    /// [B, HW, C]
    pub visual_pos: Tensor,
    /// [B, L, C]
    pub text: Tensor,
    /// [B, L]
    pub text_mask: Tensor,
    /// [B, L, C]
    pub text_pos: Tensor,
    /// P + HW + L
    pub sequence_len: usize,
}

pub struct FusionEncoderWrapper {
    encoder: Box<dyn SequenceEncoder>,
    prompt_pos: Tensor,
    text_pos: Tensor,
    hidden_dim: usize,
    num_visu_tokens: usize,
    max_query_len: usize,
}

impl FusionEncoderWrapper {
    pub fn load(config: &FsMdetrConfig, vb: &GroupedVarBuilder) -> Result<Self> {
        let vb = vb.frozen();
        let pos_init = Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };
        let prompt_pos = vb.pp("prompt_pos_embed").get_with_hints(
            (config.max_prompts, config.hidden_dim),
            "weight",
            pos_init,
        )?;
        let text_pos = vb.pp("text_pos_embed").get_with_hints(
            (config.max_query_len, config.hidden_dim),
            "weight",
            pos_init,
        )?;
        let encoder = FusionTransformerEncoder::load(
            config.hidden_dim,
            config.vl_nheads,
            config.vl_dim_feedforward,
            config.vl_enc_layers,
            vb.pp("vl_encoder"),
        )?;
        tracing::debug!(layers = encoder.num_layers(), "loaded fusion encoder");

        Ok(Self {
            encoder: Box::new(encoder),
            prompt_pos,
            text_pos,
            hidden_dim: config.hidden_dim,
            num_visu_tokens: config.num_visu_tokens(),
            max_query_len: config.max_query_len,
        })
    }

    /// Swap the encoder, keeping the learned position tables
    pub fn with_encoder(mut self, encoder: Box<dyn SequenceEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    /// Fuse the three streams.
    ///
    /// # Arguments
    /// * `prompts` - [P, C], shared by every batch item
    /// * `visual` - projected visual tokens with mask and positions
    /// * `text` - projected text tokens with mask
    pub fn forward(
        &self,
        prompts: &Tensor,
        visual: &VisualFeatures,
        text: &TextFeatures,
    ) -> Result<FusedStreams> {
        let (num_prompts, prompt_dim) = prompts.dims2()?;
        let (b, hw, visual_dim) = visual.features.dims3()?;
        let (text_b, l, text_dim) = text.features.dims3()?;

        if num_prompts == 0 {
            return Err(GroundingError::input("prompt bank is empty"));
        }
        if num_prompts > self.prompt_pos.dim(0)? {
            return Err(GroundingError::config(format!(
                "{} prompts exceed the prompt position table ({})",
                num_prompts,
                self.prompt_pos.dim(0)?
            )));
        }
        ensure_len("prompt width", self.hidden_dim, prompt_dim)?;
        ensure_len("visual width", self.hidden_dim, visual_dim)?;
        ensure_len("text width", self.hidden_dim, text_dim)?;
        ensure_len("visual tokens", self.num_visu_tokens, hw)?;
        ensure_len("text tokens", self.max_query_len, l)?;
        ensure_len("text batch", b, text_b)?;

        let c = self.hidden_dim;
        let dtype = visual.features.dtype();
        let device = visual.features.device();

        let prompt_src = prompts
            .to_dtype(dtype)?
            .unsqueeze(0)?
            .broadcast_as((b, num_prompts, c))?
            .contiguous()?;
        let src = Tensor::cat(&[&prompt_src, &visual.features, &text.features], 1)?;

        let prompt_mask = Tensor::zeros((b, num_prompts), DType::U8, device)?;
        let visual_mask = visual.padding_mask.to_dtype(DType::U8)?;
        let text_mask = text.padding_mask.to_dtype(DType::U8)?;
        let mask = Tensor::cat(&[&prompt_mask, &visual_mask, &text_mask], 1)?;

        let prompt_pos = self
            .prompt_pos
            .narrow(0, 0, num_prompts)?
            .to_dtype(dtype)?
            .unsqueeze(0)?
            .broadcast_as((b, num_prompts, c))?
            .contiguous()?;
        let text_pos = self
            .text_pos
            .to_dtype(dtype)?
            .unsqueeze(0)?
            .broadcast_as((b, l, c))?
            .contiguous()?;
        let pos = Tensor::cat(&[&prompt_pos, &visual.pos, &text_pos], 1)?;

        let sequence_len = num_prompts + hw + l;
        let fused = self.encoder.encode(&src, &mask, &pos)?;
        ensure_len("fused sequence length", sequence_len, fused.dim(1)?)?;
        ensure_len("fused width", c, fused.dim(D::Minus1)?)?;

        tracing::debug!(
            prompts = num_prompts,
            visual = hw,
            text = l,
            "fused prompt, visual and text tokens"
        );
        Ok(FusedStreams {
            visual: fused.narrow(1, num_prompts, hw)?,
            visual_mask,
            visual_pos: visual.pos.clone(),
            text: fused.narrow(1, num_prompts + hw, l)?,
            text_mask,
            text_pos,
            sequence_len,
        })
    }
}

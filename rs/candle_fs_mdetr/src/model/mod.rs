pub mod adapters;
pub mod decoder;
pub mod fusion;
pub mod pos_enc;
pub mod prompt;
pub mod sampling;
pub mod transformer;

use std::fmt::Debug;

use candle_core::{Module, Tensor};
use candle_nn::{linear, Linear};
use rand::Rng;

use crate::config::FsMdetrConfig;
use crate::error::{ensure_len, GroundingError, Result};
use crate::model::adapters::{MaskedBatch, TextAdapter, TextFeatures, VisionAdapter, VisualFeatures};
use crate::model::decoder::{IterativeDecoder, StageOutput};
use crate::model::fusion::{FusedStreams, FusionEncoderWrapper};
use crate::model::prompt::{PromptConstructor, VisualPromptBank};
use crate::model::transformer::{SampleDecoder, SequenceEncoder};
use crate::params::GroupedVarBuilder;

/// Few-shot Dynamic MDETR visual grounding model
///
/// Holds the projections, the prompt constructor, the fusion encoder and the
/// iterative decoder, plus the prompt bank of the current adaptation target.
pub struct FsMdetr {
    /// Model configuration
    pub config: FsMdetrConfig,
    /// Vision backbone width -> hidden width
    visu_proj: Linear,
    /// Text backbone width -> hidden width
    text_proj: Linear,
    prompt_constructor: PromptConstructor,
    fusion: FusionEncoderWrapper,
    decoder: IterativeDecoder,
    /// Set by [`FsMdetr::build_prompt_bank`], required by every forward pass
    bank: Option<VisualPromptBank>,
}

impl FsMdetr {
    pub fn load(vb: &GroupedVarBuilder, config: &FsMdetrConfig) -> Result<Self> {
        config.validate()?;

        let visu_proj = linear(
            config.backbone_dim,
            config.hidden_dim,
            vb.frozen().pp("visu_proj"),
        )?;
        let text_proj = linear(config.text_dim, config.hidden_dim, vb.frozen().pp("text_proj"))?;
        let prompt_constructor = PromptConstructor::load(config, vb)?;
        let fusion = FusionEncoderWrapper::load(config, vb)?;
        let decoder = IterativeDecoder::load(config, vb)?;

        tracing::info!(
            hidden_dim = config.hidden_dim,
            stages = config.stages,
            sampling_points = config.sampling_points,
            visual_tokens = config.num_visu_tokens(),
            "loaded few-shot grounding model"
        );
        Ok(Self {
            config: config.clone(),
            visu_proj,
            text_proj,
            prompt_constructor,
            fusion,
            decoder,
            bank: None,
        })
    }

    /// Replace the fusion encoder, e.g. with a stub in tests
    pub fn with_fusion_encoder(mut self, encoder: Box<dyn SequenceEncoder>) -> Self {
        self.fusion = self.fusion.with_encoder(encoder);
        self
    }

    /// Replace the per-stage decoder with one shared implementation
    pub fn with_stage_decoder(mut self, decoder: Box<dyn SampleDecoder>) -> Self {
        self.decoder = self.decoder.with_stage_decoder(decoder);
        self
    }

    /// Build and store the prompt bank for a new adaptation target.
    ///
    /// Must run before the first forward pass. Rebuilding replaces the
    /// previous bank.
    pub fn build_prompt_bank<L, R>(
        &mut self,
        vision: &dyn VisionAdapter,
        templates: &MaskedBatch,
        labels: &[L],
        rng: &mut R,
    ) -> Result<&VisualPromptBank>
    where
        L: Ord + Debug,
        R: Rng,
    {
        let bank = self
            .prompt_constructor
            .build(vision, templates, labels, rng)?;
        let bank = self.bank.insert(bank);
        Ok(&*bank)
    }

    pub fn prompt_bank(&self) -> Option<&VisualPromptBank> {
        self.bank.as_ref()
    }

    /// Prompt tokens [P, C] for the stored bank
    pub fn prompt_tokens(&self) -> Result<Tensor> {
        let bank = self
            .bank
            .as_ref()
            .ok_or_else(|| GroundingError::input("prompt bank has not been built"))?;
        self.prompt_constructor.tokens(bank)
    }

    /// Adapters, projections and fusion; returns the fused streams and the
    /// visual grid
    fn encode(
        &self,
        vision: &dyn VisionAdapter,
        text_adapter: &dyn TextAdapter,
        images: &MaskedBatch,
        text: &MaskedBatch,
    ) -> Result<(FusedStreams, (usize, usize))> {
        let prompts = self.prompt_tokens()?;

        let visual = vision.encode_image(images)?;
        ensure_len(
            "vision backbone width",
            self.config.backbone_dim,
            visual.features.dim(2)?,
        )?;
        let visual = VisualFeatures {
            features: self.visu_proj.forward(&visual.features)?,
            ..visual
        };

        let text = text_adapter.encode_text(text)?;
        ensure_len("text backbone width", self.config.text_dim, text.features.dim(2)?)?;
        let text = TextFeatures {
            features: self.text_proj.forward(&text.features)?,
            ..text
        };
        ensure_len(
            "text batch size",
            visual.features.dim(0)?,
            text.features.dim(0)?,
        )?;

        let fused = self.fusion.forward(&prompts, &visual, &text)?;
        Ok((fused, visual.grid))
    }

    /// Every stage's box and reference point
    pub fn forward_stages(
        &self,
        vision: &dyn VisionAdapter,
        text_adapter: &dyn TextAdapter,
        images: &MaskedBatch,
        text: &MaskedBatch,
    ) -> Result<Vec<StageOutput>> {
        let (fused, grid) = self.encode(vision, text_adapter, images, text)?;
        self.decoder.decode_stages(&fused, grid)
    }

    /// Predicted boxes [B, 4] as normalised (cx, cy, w, h)
    pub fn forward(
        &self,
        vision: &dyn VisionAdapter,
        text_adapter: &dyn TextAdapter,
        images: &MaskedBatch,
        text: &MaskedBatch,
    ) -> Result<Tensor> {
        let (fused, grid) = self.encode(vision, text_adapter, images, text)?;
        self.decoder.decode(&fused, grid)
    }

    /// Build the prompt bank from `templates`, then ground `text` in `images`
    #[allow(clippy::too_many_arguments)]
    pub fn ground<L, R>(
        &mut self,
        vision: &dyn VisionAdapter,
        text_adapter: &dyn TextAdapter,
        images: &MaskedBatch,
        text: &MaskedBatch,
        templates: &MaskedBatch,
        labels: &[L],
        rng: &mut R,
    ) -> Result<Tensor>
    where
        L: Ord + Debug,
        R: Rng,
    {
        self.build_prompt_bank(vision, templates, labels, rng)?;
        self.forward(vision, text_adapter, images, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::adapters::{FeatureMapAdapter, PrecomputedText};
    use crate::params::ParamStore;
    use candle_core::{DType, Device};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn inputs(config: &FsMdetrConfig) -> (MaskedBatch, MaskedBatch, MaskedBatch) {
        let device = Device::Cpu;
        let side = config.feature_map_size();
        let images = MaskedBatch::unpadded_image(
            Tensor::randn(0f32, 1.0, (2, config.backbone_dim, side, side), &device).unwrap(),
        )
        .unwrap();
        let text = MaskedBatch::new(
            Tensor::randn(0f32, 1.0, (2, config.max_query_len, config.text_dim), &device).unwrap(),
            Tensor::zeros((2, config.max_query_len), DType::U8, &device).unwrap(),
        );
        let templates = MaskedBatch::unpadded_image(
            Tensor::randn(0f32, 1.0, (1, config.backbone_dim, 3, 3), &device).unwrap(),
        )
        .unwrap();
        (images, text, templates)
    }

    #[test]
    fn test_forward_without_bank_is_invalid_input() {
        let config = FsMdetrConfig::tiny();
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let model = FsMdetr::load(&store.var_builder(), &config).unwrap();
        let (images, text, _) = inputs(&config);
        let vision = FeatureMapAdapter::new(config.hidden_dim);

        let err = model
            .forward(&vision, &PrecomputedText, &images, &text)
            .unwrap_err();
        assert!(matches!(err, GroundingError::InvalidInput(_)));
    }

    #[test]
    fn test_ground_builds_bank_then_forwards() {
        let config = FsMdetrConfig::tiny();
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let mut model = FsMdetr::load(&store.var_builder(), &config).unwrap();
        let (images, text, templates) = inputs(&config);
        let vision = FeatureMapAdapter::new(config.hidden_dim);
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let boxes = model
            .ground(&vision, &PrecomputedText, &images, &text, &templates, &["cat"], &mut rng)
            .unwrap();
        assert_eq!(boxes.dims(), &[2, 4]);
        assert_eq!(model.prompt_bank().map(|bank| bank.len()), Some(1));
    }

    #[test]
    fn test_wrong_grid_is_config_mismatch() {
        let config = FsMdetrConfig::tiny();
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let mut model = FsMdetr::load(&store.var_builder(), &config).unwrap();
        let (_, text, templates) = inputs(&config);
        let vision = FeatureMapAdapter::new(config.hidden_dim);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        model
            .build_prompt_bank(&vision, &templates, &[0u8], &mut rng)
            .unwrap();

        let side = config.feature_map_size() + 1;
        let images = MaskedBatch::unpadded_image(
            Tensor::zeros((2, config.backbone_dim, side, side), DType::F32, &Device::Cpu).unwrap(),
        )
        .unwrap();
        let err = model
            .forward(&vision, &PrecomputedText, &images, &text)
            .unwrap_err();
        assert!(matches!(err, GroundingError::ConfigMismatch(_)));
    }

    #[test]
    fn test_invalid_config_is_rejected_at_load() {
        let config = FsMdetrConfig {
            backbone_dim: 16,
            ..FsMdetrConfig::tiny()
        };
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        assert!(matches!(
            FsMdetr::load(&store.var_builder(), &config),
            Err(GroundingError::ConfigMismatch(_))
        ));
    }
}

//! Iterative sampling decoder
//!
//! A fixed number of stages, each of which:
//! 1. samples `N` visual features around the current reference point
//! 2. decodes the text stream against them with a one-layer encoder-decoder
//! 3. mean-pools the decoded text over valid tokens
//! 4. predicts a box and moves the reference point to its center
//! 5. updates the sampling query from the pooled vector and the old query
//!
//! The final stage's box is the grounding result.

use candle_core::{DType, Tensor, D};
use candle_nn::{Init, Module};

use crate::config::FsMdetrConfig;
use crate::error::{GroundingError, Result};
use crate::model::fusion::FusedStreams;
use crate::model::sampling::AdaptiveSampler;
use crate::model::transformer::{Mlp, SampleDecoder, VlTransformer};
use crate::params::GroupedVarBuilder;

/// Carried from one stage to the next
struct DecoderState {
    /// [B, C]
    query: Tensor,
    /// [B, 2] normalised (x, y)
    reference_point: Tensor,
    /// [B, L, C]
    text: Tensor,
}

/// Result of one stage
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// [B, 4] normalised (cx, cy, w, h)
    pub pred_box: Tensor,
    /// [B, 2] reference point handed to the next stage
    pub reference_point: Tensor,
}

/// Valid-token weights for mean pooling over the text axis
struct TextSelection {
    /// [B, L, 1], 1 for valid tokens
    weights: Tensor,
    /// [B, 1]
    counts: Tensor,
}

impl TextSelection {
    fn new(text_mask: &Tensor, dtype: DType) -> Result<Self> {
        let valid = (1.0 - text_mask.to_dtype(DType::F32)?)?;
        let counts = valid.sum_keepdim(1)?;
        let per_item = counts.flatten_all()?.to_vec1::<f32>()?;
        if let Some(item) = per_item.iter().position(|&n| n < 0.5) {
            return Err(GroundingError::input(format!(
                "text of batch item {item} is all padding"
            )));
        }
        Ok(Self {
            weights: valid.unsqueeze(2)?.to_dtype(dtype)?,
            counts: counts.to_dtype(dtype)?,
        })
    }

    /// [B, L, C] -> [B, C]
    fn pool(&self, hs: &Tensor) -> candle_core::Result<Tensor> {
        hs.broadcast_mul(&self.weights)?
            .sum(1)?
            .broadcast_div(&self.counts)
    }
}

/// Average `hs` [B, L, C] over the tokens `text_mask` [B, L] marks valid
pub fn masked_mean_pool(hs: &Tensor, text_mask: &Tensor) -> Result<Tensor> {
    Ok(TextSelection::new(text_mask, hs.dtype())?.pool(hs)?)
}

pub struct IterativeDecoder {
    init_sampling_feature: Tensor,
    init_reference_point: Tensor,
    sampler: AdaptiveSampler,
    vl_transformers: Vec<Box<dyn SampleDecoder>>,
    bbox_embed: Mlp,
    update_sampling_queries: Vec<Mlp>,
    stages: usize,
}

impl IterativeDecoder {
    pub fn load(config: &FsMdetrConfig, vb: &GroupedVarBuilder) -> Result<Self> {
        let c = config.hidden_dim;
        let stages = config.stages;

        let init_sampling_feature = vb.pp("init_sampling_feature").adaptable().get_with_hints(
            (1, c),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        let init_reference_point = vb.pp("init_reference_point").frozen().get_with_hints(
            (1, 2),
            "weight",
            Init::Const(0.5),
        )?;

        let sampler =
            AdaptiveSampler::load(c, config.sampling_points, stages, vb.frozen().pp("sampler"))?;

        let num_transformers = if config.different_transformer { stages } else { 1 };
        let mut vl_transformers: Vec<Box<dyn SampleDecoder>> = Vec::with_capacity(num_transformers);
        for i in 0..num_transformers {
            let vb_t = if config.different_transformer {
                vb.frozen().pp(format!("vl_transformer.{}", i))
            } else {
                vb.frozen().pp("vl_transformer")
            };
            vl_transformers.push(Box::new(VlTransformer::load(
                c,
                config.vl_nheads,
                config.vl_dim_feedforward,
                vb_t,
            )?));
        }

        let bbox_embed = Mlp::load(c, c, 4, 3, vb.frozen().pp("bbox_embed"))?;
        let update_sampling_queries = (0..stages)
            .map(|i| {
                Mlp::load(
                    2 * c,
                    c,
                    c,
                    2,
                    vb.adaptable().pp(format!("update_sampling_queries.{}", i)),
                )
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            init_sampling_feature,
            init_reference_point,
            sampler,
            vl_transformers,
            bbox_embed,
            update_sampling_queries,
            stages,
        })
    }

    /// Use one decoder for every stage instead of the loaded blocks
    pub fn with_stage_decoder(mut self, decoder: Box<dyn SampleDecoder>) -> Self {
        self.vl_transformers = vec![decoder];
        self
    }

    fn stage_decoder(&self, stage: usize) -> &dyn SampleDecoder {
        let index = if self.vl_transformers.len() == 1 { 0 } else { stage };
        self.vl_transformers[index].as_ref()
    }

    /// Learned initial query and reference point broadcast over the batch
    fn initial_state(&self, fused: &FusedStreams) -> Result<DecoderState> {
        let b = fused.text.dim(0)?;
        let dtype = fused.text.dtype();
        let c = self.init_sampling_feature.dim(1)?;
        Ok(DecoderState {
            query: self
                .init_sampling_feature
                .to_dtype(dtype)?
                .broadcast_as((b, c))?
                .contiguous()?,
            reference_point: self
                .init_reference_point
                .to_dtype(dtype)?
                .broadcast_as((b, 2))?
                .contiguous()?,
            text: fused.text.clone(),
        })
    }

    /// Run every stage and return each stage's box and reference point
    ///
    /// # Arguments
    /// * `fused` - output of the fusion encoder
    /// * `grid` - (H, W) of the visual feature map
    pub fn decode_stages(
        &self,
        fused: &FusedStreams,
        grid: (usize, usize),
    ) -> Result<Vec<StageOutput>> {
        let (b, hw, c) = fused.visual.dims3()?;
        let (h, w) = grid;
        if h * w != hw {
            return Err(GroundingError::config(format!(
                "grid {h}x{w} does not cover {hw} visual tokens"
            )));
        }
        let selection = TextSelection::new(&fused.text_mask, fused.text.dtype())?;

        // [B, HW, C] -> [B, C, H, W]
        let visual_map = fused.visual.transpose(1, 2)?.reshape((b, c, h, w))?;
        let pos_map = fused
            .visual_pos
            .to_dtype(fused.visual.dtype())?
            .transpose(1, 2)?
            .reshape((b, c, h, w))?;

        let mut state = self.initial_state(fused)?;
        let mut outputs = Vec::with_capacity(self.stages);
        for stage in 0..self.stages {
            let (samples, sample_pos) = self.sampler.sample(
                stage,
                &state.query,
                &state.reference_point,
                &visual_map,
                &pos_map,
            )?;
            let hs = self.stage_decoder(stage).decode(
                &samples,
                &sample_pos,
                &state.text,
                &fused.text_mask,
                &fused.text_pos,
            )?;
            let pooled = selection.pool(&hs)?;
            let pred_box = candle_nn::ops::sigmoid(&self.bbox_embed.forward(&pooled)?)?;

            let reference_point = pred_box.narrow(D::Minus1, 0, 2)?;
            let query = self.update_sampling_queries[stage]
                .forward(&Tensor::cat(&[&pooled, &state.query], D::Minus1)?)?;
            tracing::debug!(stage, "decoded stage");

            outputs.push(StageOutput {
                pred_box,
                reference_point: reference_point.clone(),
            });
            state = DecoderState {
                query,
                reference_point,
                text: hs,
            };
        }
        Ok(outputs)
    }

    /// Final-stage box [B, 4]
    pub fn decode(&self, fused: &FusedStreams, grid: (usize, usize)) -> Result<Tensor> {
        self.decode_stages(fused, grid)?
            .pop()
            .map(|stage| stage.pred_box)
            .ok_or_else(|| GroundingError::config("decoder has no stages"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamStore;
    use candle_core::Device;

    fn fused_streams(config: &FsMdetrConfig, b: usize, valid: usize) -> FusedStreams {
        let device = Device::Cpu;
        let c = config.hidden_dim;
        let hw = config.num_visu_tokens();
        let l = config.max_query_len;
        let mut mask = vec![0u8; valid];
        mask.resize(l, 1);
        let mask = Tensor::new(mask.as_slice(), &device)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .repeat((b, 1))
            .unwrap();
        FusedStreams {
            visual: Tensor::randn(0f32, 1.0, (b, hw, c), &device).unwrap(),
            visual_mask: Tensor::zeros((b, hw), DType::U8, &device).unwrap(),
            visual_pos: Tensor::randn(0f32, 1.0, (b, hw, c), &device).unwrap(),
            text: Tensor::randn(0f32, 1.0, (b, l, c), &device).unwrap(),
            text_mask: mask,
            text_pos: Tensor::randn(0f32, 1.0, (b, l, c), &device).unwrap(),
            sequence_len: hw + l,
        }
    }

    #[test]
    fn test_single_valid_token_pools_to_itself() {
        let device = Device::Cpu;
        let hs = Tensor::randn(0f32, 1.0, (2, 5, 3), &device).unwrap();
        let mask = Tensor::new(&[[1u8, 1, 0, 1, 1], [0, 1, 1, 1, 1]], &device).unwrap();
        let pooled = masked_mean_pool(&hs, &mask).unwrap();

        let expected = Tensor::stack(
            &[
                hs.get(0).unwrap().get(2).unwrap(),
                hs.get(1).unwrap().get(0).unwrap(),
            ],
            0,
        )
        .unwrap();
        let diff = (pooled - expected)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6, "max diff {diff}");
    }

    #[test]
    fn test_all_padding_text_is_invalid_input() {
        let device = Device::Cpu;
        let hs = Tensor::ones((2, 3, 4), DType::F32, &device).unwrap();
        let mask = Tensor::new(&[[0u8, 1, 1], [1, 1, 1]], &device).unwrap();
        let err = masked_mean_pool(&hs, &mask).unwrap_err();
        assert!(matches!(err, GroundingError::InvalidInput(_)));
    }

    #[test]
    fn test_stage_boxes_and_reference_points() {
        let config = FsMdetrConfig::tiny();
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let decoder = IterativeDecoder::load(&config, &store.var_builder()).unwrap();
        let fused = fused_streams(&config, 2, 5);
        let side = config.feature_map_size();

        let stages = decoder.decode_stages(&fused, (side, side)).unwrap();
        assert_eq!(stages.len(), config.stages);
        for stage in &stages {
            assert_eq!(stage.pred_box.dims(), &[2, 4]);
            let values = stage.pred_box.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));

            let center = stage.pred_box.narrow(1, 0, 2).unwrap().to_vec2::<f32>().unwrap();
            let reference = stage.reference_point.to_vec2::<f32>().unwrap();
            assert_eq!(center, reference);
        }

        let final_box = decoder.decode(&fused, (side, side)).unwrap();
        assert_eq!(
            final_box.to_vec2::<f32>().unwrap(),
            stages[config.stages - 1].pred_box.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_decode_rejects_all_padding_before_first_stage() {
        let config = FsMdetrConfig::tiny();
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let decoder = IterativeDecoder::load(&config, &store.var_builder()).unwrap();
        let fused = fused_streams(&config, 1, 0);
        let side = config.feature_map_size();
        let err = decoder.decode_stages(&fused, (side, side)).unwrap_err();
        assert!(matches!(err, GroundingError::InvalidInput(_)));
    }

    #[test]
    fn test_per_stage_transformers_are_distinct_parameters() {
        let config = FsMdetrConfig {
            different_transformer: true,
            ..FsMdetrConfig::tiny()
        };
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        IterativeDecoder::load(&config, &store.var_builder()).unwrap();
        let names: Vec<String> = store.parameters().into_iter().map(|p| p.name).collect();
        for stage in 0..config.stages {
            let prefix = format!("vl_transformer.{stage}.");
            assert!(names.iter().any(|n| n.starts_with(&prefix)), "missing {prefix}");
        }
    }
}

//! Visual prompts built from template exemplars
//!
//! Each template is encoded by the vision adapter, average pooled to a single
//! vector and offset by one row of a learnable pseudo-class table. The bank
//! keeps the pooled features and the chosen rows separately, so the prompt
//! tokens always reflect the current table while it is being adapted.

use std::collections::BTreeMap;
use std::fmt::Debug;

use candle_core::{Tensor, D};
use candle_nn::{Init, VarBuilder};
use rand::Rng;

use crate::config::{FsMdetrConfig, PromptSelection};
use crate::error::{GroundingError, Result};
use crate::model::adapters::{MaskedBatch, VisionAdapter};
use crate::params::GroupedVarBuilder;

/// Learnable [num_pseudo_classes, C] table drawn from a unit normal
pub struct PseudoEmbedding {
    embeddings: Tensor,
}

impl PseudoEmbedding {
    pub fn load(num_classes: usize, dim: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        let embeddings = vb.get_with_hints(
            (num_classes, dim),
            "embeddings",
            Init::Randn {
                mean: 0.0,
                stdev: 1.0,
            },
        )?;
        Ok(Self { embeddings })
    }

    pub fn num_classes(&self) -> usize {
        self.embeddings.dims()[0]
    }

    /// One row as [1, C]
    pub fn row(&self, index: usize) -> candle_core::Result<Tensor> {
        self.embeddings.narrow(0, index, 1)
    }

    /// Mean of all rows as [1, C]
    pub fn mean_row(&self) -> candle_core::Result<Tensor> {
        self.embeddings.mean_keepdim(0)
    }
}

/// Which part of the pseudo-class table offsets a template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoRow {
    Row(usize),
    Mean,
}

/// Pooled template features in bank order, with their pseudo-class rows
#[derive(Debug, Clone)]
pub struct VisualPromptBank {
    /// [P, C]
    pooled: Tensor,
    rows: Vec<PseudoRow>,
    /// Index of each entry in the caller's template list
    template_order: Vec<usize>,
}

impl VisualPromptBank {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[PseudoRow] {
        &self.rows
    }

    pub fn template_order(&self) -> &[usize] {
        &self.template_order
    }
}

pub struct PromptConstructor {
    pseudo_embedding: PseudoEmbedding,
    selection: PromptSelection,
    hidden_dim: usize,
    max_prompts: usize,
}

impl PromptConstructor {
    pub fn load(config: &FsMdetrConfig, vb: &GroupedVarBuilder) -> Result<Self> {
        let pseudo_embedding = PseudoEmbedding::load(
            config.pseudo_num_classes,
            config.hidden_dim,
            vb.pp("pseudo_embedding").adaptable(),
        )?;
        Ok(Self {
            pseudo_embedding,
            selection: config.prompt_selection,
            hidden_dim: config.hidden_dim,
            max_prompts: config.max_prompts,
        })
    }

    pub fn pseudo_embedding(&self) -> &PseudoEmbedding {
        &self.pseudo_embedding
    }

    /// Build the prompt bank for one adaptation target.
    ///
    /// Templates are visited by ascending label, then in input order within a
    /// label. `templates` holds one image per template along the batch axis.
    pub fn build<L, R>(
        &self,
        vision: &dyn VisionAdapter,
        templates: &MaskedBatch,
        labels: &[L],
        rng: &mut R,
    ) -> Result<VisualPromptBank>
    where
        L: Ord + Debug,
        R: Rng,
    {
        let num_templates = templates.batch_size()?;
        if num_templates == 0 {
            return Err(GroundingError::input("template set is empty"));
        }
        if labels.len() != num_templates {
            return Err(GroundingError::input(format!(
                "{} labels supplied for {} templates",
                labels.len(),
                num_templates
            )));
        }
        if num_templates > self.max_prompts {
            return Err(GroundingError::config(format!(
                "{} templates exceed max_prompts {}",
                num_templates, self.max_prompts
            )));
        }

        let visual = vision.encode_image(templates)?;
        // Global average pool: [T, HW, C] -> [T, C]
        let pooled = visual.features.mean(1)?.detach();
        let width = pooled.dim(D::Minus1)?;
        if width != self.hidden_dim {
            return Err(GroundingError::config(format!(
                "pooled template width {} does not match hidden width {}",
                width, self.hidden_dim
            )));
        }

        let mut groups: BTreeMap<&L, Vec<usize>> = BTreeMap::new();
        for (index, label) in labels.iter().enumerate() {
            groups.entry(label).or_default().push(index);
        }
        let template_order: Vec<usize> = groups.into_values().flatten().collect();

        let num_rows = self.pseudo_embedding.num_classes();
        let rows: Vec<PseudoRow> = template_order
            .iter()
            .map(|_| match self.selection {
                PromptSelection::RandomRow => PseudoRow::Row(rng.gen_range(0..num_rows)),
                PromptSelection::MeanOfRows => PseudoRow::Mean,
            })
            .collect();

        let order = Tensor::from_vec(
            template_order.iter().map(|&i| i as u32).collect::<Vec<_>>(),
            template_order.len(),
            pooled.device(),
        )?;
        let pooled = pooled.index_select(&order, 0)?;

        tracing::info!(
            prompts = template_order.len(),
            labels = ?labels,
            rows = ?rows,
            "built visual prompt bank"
        );
        Ok(VisualPromptBank {
            pooled,
            rows,
            template_order,
        })
    }

    /// Prompt tokens [P, C] from the bank and the current table
    pub fn tokens(&self, bank: &VisualPromptBank) -> Result<Tensor> {
        let offsets = bank
            .rows
            .iter()
            .map(|row| match row {
                PseudoRow::Row(index) => self.pseudo_embedding.row(*index),
                PseudoRow::Mean => self.pseudo_embedding.mean_row(),
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let offsets = Tensor::cat(&offsets, 0)?.to_dtype(bank.pooled.dtype())?;
        Ok((&bank.pooled + offsets)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::adapters::FeatureMapAdapter;
    use crate::params::ParamStore;
    use candle_core::{DType, Device};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn config(selection: PromptSelection) -> FsMdetrConfig {
        FsMdetrConfig {
            prompt_selection: selection,
            ..FsMdetrConfig::tiny()
        }
    }

    /// Templates whose feature maps are filled with `10 * index`
    fn templates(count: usize, dim: usize) -> MaskedBatch {
        let device = Device::Cpu;
        let maps: Vec<Tensor> = (0..count)
            .map(|i| Tensor::full(10.0f32 * i as f32, (1, dim, 2, 2), &device).unwrap())
            .collect();
        MaskedBatch::unpadded_image(Tensor::cat(&maps, 0).unwrap()).unwrap()
    }

    #[test]
    fn test_bank_follows_label_then_input_order() {
        let config = config(PromptSelection::MeanOfRows);
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let constructor = PromptConstructor::load(&config, &store.var_builder()).unwrap();
        let adapter = FeatureMapAdapter::new(config.hidden_dim);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let bank = constructor
            .build(&adapter, &templates(4, config.hidden_dim), &[2, 1, 2, 0], &mut rng)
            .unwrap();
        assert_eq!(bank.len(), 4);
        assert_eq!(bank.template_order(), &[3, 1, 0, 2]);

        let tokens = constructor.tokens(&bank).unwrap();
        assert_eq!(tokens.dims(), &[4, config.hidden_dim]);
        let mean_row = constructor.pseudo_embedding().mean_row().unwrap();
        let pooled = tokens
            .broadcast_sub(&mean_row)
            .unwrap()
            .mean(1)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let expected = [30.0, 10.0, 0.0, 20.0];
        for (got, want) in pooled.iter().zip(expected) {
            assert!((got - want).abs() < 1e-4, "{got} vs {want}");
        }
    }

    #[test]
    fn test_random_rows_are_seeded() {
        let config = config(PromptSelection::RandomRow);
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let constructor = PromptConstructor::load(&config, &store.var_builder()).unwrap();
        let adapter = FeatureMapAdapter::new(config.hidden_dim);
        let batch = templates(3, config.hidden_dim);
        let labels = ["cat", "dog", "cat"];

        let build = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            constructor.build(&adapter, &batch, &labels, &mut rng).unwrap()
        };
        let first = build(7);
        let second = build(7);
        assert_eq!(first.rows(), second.rows());
        for row in first.rows() {
            match row {
                PseudoRow::Row(index) => assert!(*index < config.pseudo_num_classes),
                PseudoRow::Mean => panic!("random selection produced a mean row"),
            }
        }
    }

    #[test]
    fn test_invalid_template_sets() {
        let config = config(PromptSelection::RandomRow);
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let constructor = PromptConstructor::load(&config, &store.var_builder()).unwrap();
        let adapter = FeatureMapAdapter::new(config.hidden_dim);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let empty = MaskedBatch::unpadded_image(
            Tensor::zeros((0, config.hidden_dim, 2, 2), DType::F32, &Device::Cpu).unwrap(),
        )
        .unwrap();
        let err = constructor
            .build::<u32, _>(&adapter, &empty, &[], &mut rng)
            .unwrap_err();
        assert!(matches!(err, GroundingError::InvalidInput(_)));

        let err = constructor
            .build(&adapter, &templates(2, config.hidden_dim), &[0u32], &mut rng)
            .unwrap_err();
        assert!(matches!(err, GroundingError::InvalidInput(_)));

        let too_many = templates(config.max_prompts + 1, config.hidden_dim);
        let labels = vec![0u32; config.max_prompts + 1];
        let err = constructor
            .build(&adapter, &too_many, &labels, &mut rng)
            .unwrap_err();
        assert!(matches!(err, GroundingError::ConfigMismatch(_)));
    }

    #[test]
    fn test_pooled_width_must_match_hidden_width() {
        let config = config(PromptSelection::RandomRow);
        let store = ParamStore::new(DType::F32, &Device::Cpu);
        let constructor = PromptConstructor::load(&config, &store.var_builder()).unwrap();
        let adapter = FeatureMapAdapter::new(config.hidden_dim);
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let err = constructor
            .build(&adapter, &templates(1, config.hidden_dim + 2), &[0u32], &mut rng)
            .unwrap_err();
        assert!(matches!(err, GroundingError::ConfigMismatch(_)));
    }
}

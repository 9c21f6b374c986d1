//! Predict subcommand: ground text queries in pre-extracted backbone features.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_fs_mdetr::boxes::PredictedBox;
use candle_fs_mdetr::config::FsMdetrConfig;
use candle_fs_mdetr::model::adapters::{FeatureMapAdapter, MaskedBatch, PrecomputedText};
use candle_fs_mdetr::model::FsMdetr;
use candle_fs_mdetr::params::{GroupedVarBuilder, ParamStore};
use candle_nn::VarBuilder;
use clap::Args;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Arguments for the predict subcommand
#[derive(Args, Debug)]
pub struct PredictArgs {
    /// Safetensors file with `image`, `text`, `text_mask`, `templates` and
    /// `template_labels` (optionally `image_mask`).
    pub features: PathBuf,
    /// Path to model weights, in safetensors format. Randomly initialised
    /// when omitted.
    #[arg(long)]
    pub model: Option<PathBuf>,
    /// Seed for the pseudo-class row selection.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Image width in pixels, for pixel-space boxes.
    #[arg(long, requires = "height")]
    pub width: Option<u32>,
    /// Image height in pixels, for pixel-space boxes.
    #[arg(long, requires = "width")]
    pub height: Option<u32>,
    /// Print the box of every decoding stage.
    #[arg(long)]
    pub stages: bool,
}

/// Backbone outputs read from a features file
struct FeatureInputs {
    images: MaskedBatch,
    text: MaskedBatch,
    templates: MaskedBatch,
    labels: Vec<i64>,
}

fn take(tensors: &mut HashMap<String, Tensor>, name: &str, path: &Path) -> anyhow::Result<Tensor> {
    tensors
        .remove(name)
        .with_context(|| format!("missing tensor `{name}` in {}", path.display()))
}

fn load_features(path: &Path, device: &Device) -> anyhow::Result<FeatureInputs> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("reading features from {}", path.display()))?;

    let image = take(&mut tensors, "image", path)?.to_dtype(DType::F32)?;
    let images = match tensors.remove("image_mask") {
        Some(mask) => MaskedBatch::new(image, mask.to_dtype(DType::U8)?),
        None => MaskedBatch::unpadded_image(image)?,
    };

    let text = MaskedBatch::new(
        take(&mut tensors, "text", path)?.to_dtype(DType::F32)?,
        take(&mut tensors, "text_mask", path)?.to_dtype(DType::U8)?,
    );

    let templates =
        MaskedBatch::unpadded_image(take(&mut tensors, "templates", path)?.to_dtype(DType::F32)?)?;
    let labels = take(&mut tensors, "template_labels", path)?
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1::<i64>()?;

    Ok(FeatureInputs {
        images,
        text,
        templates,
        labels,
    })
}

fn load_model(
    args: &PredictArgs,
    config: &FsMdetrConfig,
    device: &Device,
) -> anyhow::Result<FsMdetr> {
    let model = match &args.model {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("Model weights not found at {:?}", path);
            }
            tracing::info!(path = ?path, "loading model weights");
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device)? };
            FsMdetr::load(&GroupedVarBuilder::shared(vb), config)?
        }
        None => {
            tracing::warn!("no --model given, using randomly initialised weights");
            let store = ParamStore::new(DType::F32, device);
            FsMdetr::load(&store.var_builder(), config)?
        }
    };
    Ok(model)
}

pub fn run(args: &PredictArgs, config: &FsMdetrConfig, device: &Device) -> anyhow::Result<()> {
    let inputs = load_features(&args.features, device)?;
    let mut model = load_model(args, config, device)?;

    let vision = FeatureMapAdapter::new(config.hidden_dim);
    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let bank = model.build_prompt_bank(&vision, &inputs.templates, &inputs.labels, &mut rng)?;
    tracing::info!(prompts = bank.len(), seed = args.seed, "prompt bank ready");

    let start = Instant::now();
    let stages = model.forward_stages(&vision, &PrecomputedText, &inputs.images, &inputs.text)?;
    tracing::info!(elapsed = ?start.elapsed(), stages = stages.len(), "grounding done");

    if args.stages {
        for (i, stage) in stages.iter().enumerate() {
            for (item, pred) in PredictedBox::from_tensor(&stage.pred_box)?.iter().enumerate() {
                println!("stage {i} item {item}: {pred}");
            }
        }
    }

    let last = stages.last().context("model produced no stages")?;
    for (item, pred) in PredictedBox::from_tensor(&last.pred_box)?.iter().enumerate() {
        match (args.width, args.height) {
            (Some(w), Some(h)) => {
                let [x1, y1, x2, y2] = pred.to_pixels(w, h);
                println!("{item}: {pred} pixels: ({x1:.1}, {y1:.1}, {x2:.1}, {y2:.1})");
            }
            _ => println!("{item}: {pred}"),
        }
    }
    Ok(())
}

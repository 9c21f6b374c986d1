//! Params subcommand: list parameters with their adaptation group.

use std::path::PathBuf;

use candle_core::{DType, Device};
use candle_fs_mdetr::config::FsMdetrConfig;
use candle_fs_mdetr::model::FsMdetr;
use candle_fs_mdetr::params::{ParamGroup, ParamStore};
use clap::Args;

/// Arguments for the params subcommand
#[derive(Args, Debug)]
pub struct ParamsArgs {
    /// Initialise from these weights, in safetensors format.
    #[arg(long)]
    pub model: Option<PathBuf>,
    /// Apply the few-shot adaptation policy before listing.
    #[arg(long)]
    pub adapt: bool,
    /// Only list trainable parameters.
    #[arg(long)]
    pub trainable_only: bool,
    /// Write all parameters to this safetensors file.
    #[arg(long)]
    pub save: Option<PathBuf>,
}

pub fn run(args: &ParamsArgs, config: &FsMdetrConfig, device: &Device) -> anyhow::Result<()> {
    let mut store = ParamStore::new(DType::F32, device);
    // Building the model registers every variable in the store
    let _model = FsMdetr::load(&store.var_builder(), config)?;

    if let Some(path) = &args.model {
        tracing::info!(path = ?path, "loading model weights");
        store.load(path)?;
    }
    if args.adapt {
        store.apply_adaptation_policy();
    }

    for param in store.parameters() {
        if args.trainable_only && !param.trainable {
            continue;
        }
        let group = match param.group {
            ParamGroup::Frozen => "frozen",
            ParamGroup::Adaptable => "adaptable",
        };
        println!(
            "{:<64} {:<10} {:<9} {:?}",
            param.name,
            group,
            if param.trainable { "trainable" } else { "-" },
            param.shape
        );
    }
    println!(
        "trainable: {} / {} parameters",
        store.num_elements(true),
        store.num_elements(false)
    );

    if let Some(path) = &args.save {
        store.save(path)?;
        println!("saved weights to {}", path.display());
    }
    Ok(())
}

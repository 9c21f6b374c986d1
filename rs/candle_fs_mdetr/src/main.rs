//! Few-shot Dynamic MDETR visual grounding with Candle
//!
//! This binary grounds text queries in pre-extracted backbone features and
//! inspects the parameter groups of the model.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod cmd_params;
mod cmd_predict;

use std::path::PathBuf;

use candle_core::{Device, Result};
use candle_fs_mdetr::config::FsMdetrConfig;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::warn!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::warn!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Model variants
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum Which {
    Resnet50,
    Resnet101,
    Tiny,
}

impl Which {
    fn config(&self) -> FsMdetrConfig {
        match self {
            Which::Resnet50 => FsMdetrConfig::resnet50(),
            Which::Resnet101 => FsMdetrConfig::resnet101(),
            Which::Tiny => FsMdetrConfig::tiny(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    cpu: bool,

    /// Which model variant to use.
    #[arg(long, value_enum, default_value_t = Which::Resnet50, global = true)]
    which: Which,

    /// JSON configuration overriding the `--which` preset.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ground text queries in pre-extracted image features
    Predict(cmd_predict::PredictArgs),
    /// List the model parameters and their adaptation groups
    Params(cmd_params::ParamsArgs),
}

impl Cli {
    /// The JSON file is validated on load; presets are checked by `FsMdetr::load`
    fn model_config(&self) -> anyhow::Result<FsMdetrConfig> {
        match &self.config {
            Some(path) => Ok(FsMdetrConfig::from_json_file(path)?),
            None => Ok(self.which.config()),
        }
    }
}

pub fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let cli = Cli::parse();
    let device = device(cli.cpu)?;
    tracing::info!(?device, "selected device");

    let config = cli.model_config()?;
    tracing::info!(which = ?cli.which, custom = cli.config.is_some(), "model config");

    match &cli.command {
        Command::Predict(args) => cmd_predict::run(args, &config, &device),
        Command::Params(args) => cmd_params::run(args, &config, &device),
    }
}

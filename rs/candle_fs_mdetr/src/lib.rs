//! Few-shot Dynamic MDETR visual grounding.
//!
//! This crate provides:
//! - visual prompts built from a handful of template exemplars
//! - joint encoding of prompt, visual and text tokens
//! - the iterative sampling decoder that refines one box per query
//! - parameter groups that restrict few-shot adaptation to a small surface

pub mod boxes;
pub mod config;
pub mod error;
pub mod loss;
pub mod model;
pub mod params;
pub mod train;

pub use boxes::PredictedBox;
pub use config::{FsMdetrConfig, PromptSelection};
pub use error::{GroundingError, Result};
pub use model::FsMdetr;
pub use params::{GroupedVarBuilder, ParamGroup, ParamStore};

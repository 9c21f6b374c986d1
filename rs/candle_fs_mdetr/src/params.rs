//! Parameter groups and the few-shot adaptation policy.
//!
//! Every learnable tensor is created through a [`GroupedVarBuilder`], and the
//! component that creates it decides whether it belongs to the frozen group
//! (backbone projections, fusion encoder, decoder blocks, heads) or to the
//! adaptable group (pseudo-class embeddings, initial sampling query, query
//! update projections). Freezing is then a property of the group, not of the
//! parameter's name.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};

/// Ownership tag assigned to a parameter at construction time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamGroup {
    /// Pretrained weights that few-shot adaptation must not touch
    Frozen,
    /// The small surface updated when adapting to a new category
    Adaptable,
}

/// A pair of `VarBuilder`s sharing one prefix path, one per [`ParamGroup`]
#[derive(Clone)]
pub struct GroupedVarBuilder<'a> {
    frozen: VarBuilder<'a>,
    adaptable: VarBuilder<'a>,
}

impl<'a> GroupedVarBuilder<'a> {
    pub fn new(frozen: VarBuilder<'a>, adaptable: VarBuilder<'a>) -> Self {
        Self { frozen, adaptable }
    }

    /// Both groups read from the same backend, e.g. a safetensors checkpoint
    pub fn shared(vb: VarBuilder<'a>) -> Self {
        Self {
            frozen: vb.clone(),
            adaptable: vb,
        }
    }

    pub fn pp<S: ToString>(&self, s: S) -> Self {
        let s = s.to_string();
        Self {
            frozen: self.frozen.pp(&s),
            adaptable: self.adaptable.pp(s),
        }
    }

    pub fn group(&self, group: ParamGroup) -> VarBuilder<'a> {
        match group {
            ParamGroup::Frozen => self.frozen.clone(),
            ParamGroup::Adaptable => self.adaptable.clone(),
        }
    }

    pub fn frozen(&self) -> VarBuilder<'a> {
        self.group(ParamGroup::Frozen)
    }

    pub fn adaptable(&self) -> VarBuilder<'a> {
        self.group(ParamGroup::Adaptable)
    }
}

/// Description of one stored parameter
#[derive(Debug, Clone, PartialEq)]
pub struct ParamInfo {
    pub name: String,
    pub group: ParamGroup,
    pub shape: Vec<usize>,
    pub trainable: bool,
}

impl ParamInfo {
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Owns the variables of both parameter groups and their trainable flags
pub struct ParamStore {
    frozen: VarMap,
    adaptable: VarMap,
    frozen_trainable: bool,
    dtype: DType,
    device: Device,
}

impl ParamStore {
    /// Empty store; every group starts out trainable
    pub fn new(dtype: DType, device: &Device) -> Self {
        Self {
            frozen: VarMap::new(),
            adaptable: VarMap::new(),
            frozen_trainable: true,
            dtype,
            device: device.clone(),
        }
    }

    /// Builder that creates (or reuses) variables in this store
    pub fn var_builder(&self) -> GroupedVarBuilder<'static> {
        GroupedVarBuilder::new(
            VarBuilder::from_varmap(&self.frozen, self.dtype, &self.device),
            VarBuilder::from_varmap(&self.adaptable, self.dtype, &self.device),
        )
    }

    fn map(&self, group: ParamGroup) -> &VarMap {
        match group {
            ParamGroup::Frozen => &self.frozen,
            ParamGroup::Adaptable => &self.adaptable,
        }
    }

    pub fn is_trainable(&self, group: ParamGroup) -> bool {
        match group {
            ParamGroup::Frozen => self.frozen_trainable,
            ParamGroup::Adaptable => true,
        }
    }

    /// Freeze everything outside the adaptable group.
    ///
    /// Applied once, before the first adaptation step.
    pub fn apply_adaptation_policy(&mut self) {
        self.frozen_trainable = false;
        tracing::info!(
            trainable = self.num_elements(true),
            total = self.num_elements(false),
            "applied few-shot adaptation policy"
        );
    }

    /// Variables an optimizer is allowed to update
    pub fn trainable_vars(&self) -> Vec<Var> {
        [ParamGroup::Frozen, ParamGroup::Adaptable]
            .into_iter()
            .filter(|group| self.is_trainable(*group))
            .flat_map(|group| self.map(group).all_vars())
            .collect()
    }

    /// All parameters sorted by name
    pub fn parameters(&self) -> Vec<ParamInfo> {
        let mut params = Vec::new();
        for group in [ParamGroup::Frozen, ParamGroup::Adaptable] {
            let trainable = self.is_trainable(group);
            for (name, var) in named_vars(self.map(group)) {
                params.push(ParamInfo {
                    name,
                    group,
                    shape: var.dims().to_vec(),
                    trainable,
                });
            }
        }
        params.sort_by(|a, b| a.name.cmp(&b.name));
        params
    }

    /// Total number of scalar parameters, optionally only the trainable ones
    pub fn num_elements(&self, trainable_only: bool) -> usize {
        self.parameters()
            .iter()
            .filter(|p| !trainable_only || p.trainable)
            .map(ParamInfo::elem_count)
            .sum()
    }

    /// Overwrite every stored variable with the tensor of the same name in a
    /// safetensors file
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.frozen.load(path)?;
        self.adaptable.load(path)
    }

    /// Write both groups into a single safetensors file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for group in [ParamGroup::Frozen, ParamGroup::Adaptable] {
            for (name, var) in named_vars(self.map(group)) {
                tensors.insert(name, var.as_tensor().clone());
            }
        }
        candle_core::safetensors::save(&tensors, path)
    }
}

fn named_vars(map: &VarMap) -> Vec<(String, Var)> {
    let data = map.data().lock().unwrap_or_else(|e| e.into_inner());
    data.iter()
        .map(|(name, var)| (name.clone(), var.clone()))
        .collect()
}

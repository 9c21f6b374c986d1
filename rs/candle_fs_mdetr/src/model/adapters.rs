//! Backbone adapter interfaces
//!
//! The vision and text backbones are opaque feature extractors. The model only
//! sees them through [`VisionAdapter`] and [`TextAdapter`], so pre-extracted
//! features (or deterministic stubs in tests) can stand in for real networks.
//!
//! All tensors are batch-first. Masks are u8 with 1 marking padding.

use candle_core::{DType, Tensor};

use crate::error::{GroundingError, Result};
use crate::model::pos_enc::PositionEmbeddingSine;

/// A padded batch together with its padding mask
#[derive(Debug, Clone)]
pub struct MaskedBatch {
    pub tensors: Tensor,
    pub mask: Tensor,
}

impl MaskedBatch {
    pub fn new(tensors: Tensor, mask: Tensor) -> Self {
        Self { tensors, mask }
    }

    /// Image-like batch [B, C, H, W] with nothing padded
    pub fn unpadded_image(tensors: Tensor) -> Result<Self> {
        let (b, _c, h, w) = tensors.dims4()?;
        let mask = Tensor::zeros((b, h, w), DType::U8, tensors.device())?;
        Ok(Self { tensors, mask })
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.tensors.dim(0)?)
    }
}

/// Flattened visual feature map produced by a vision backbone
#[derive(Debug, Clone)]
pub struct VisualFeatures {
    /// [B, H*W, C]
    pub features: Tensor,
    /// [B, H*W], 1 marks padding
    pub padding_mask: Tensor,
    /// [B, H*W, C]
    pub pos: Tensor,
    /// (H, W) of the feature grid
    pub grid: (usize, usize),
}

impl VisualFeatures {
    pub fn num_tokens(&self) -> usize {
        self.grid.0 * self.grid.1
    }
}

/// Token features produced by a text backbone
#[derive(Debug, Clone)]
pub struct TextFeatures {
    /// [B, L, D]
    pub features: Tensor,
    /// [B, L], 1 marks padding
    pub padding_mask: Tensor,
}

pub trait VisionAdapter {
    fn encode_image(&self, images: &MaskedBatch) -> Result<VisualFeatures>;
}

pub trait TextAdapter {
    fn encode_text(&self, text: &MaskedBatch) -> Result<TextFeatures>;
}

/// Vision adapter over pre-extracted backbone feature maps.
///
/// Input tensors are [B, C, H, W] feature maps with a [B, H, W] padding mask.
/// Positions are DETR sine encodings of the mask.
pub struct FeatureMapAdapter {
    position_encoding: PositionEmbeddingSine,
}

impl FeatureMapAdapter {
    pub fn new(hidden_dim: usize) -> Self {
        Self {
            position_encoding: PositionEmbeddingSine::for_hidden_dim(hidden_dim),
        }
    }
}

impl VisionAdapter for FeatureMapAdapter {
    fn encode_image(&self, images: &MaskedBatch) -> Result<VisualFeatures> {
        let (b, c, h, w) = images.tensors.dims4()?;
        if h * w == 0 {
            return Err(GroundingError::input("image feature grid is empty"));
        }
        let mask_dims = images.mask.dims();
        if mask_dims != [b, h, w] {
            return Err(GroundingError::input(format!(
                "image mask shape {mask_dims:?} does not match feature grid [{b}, {h}, {w}]"
            )));
        }

        // [B, C, H, W] -> [B, H*W, C]
        let features = images.tensors.flatten_from(2)?.transpose(1, 2)?.contiguous()?;
        let pos = self
            .position_encoding
            .forward(&images.mask)?
            .reshape((b, h * w, self.position_encoding.dim()))?
            .to_dtype(features.dtype())?;
        let padding_mask = images.mask.to_dtype(DType::U8)?.reshape((b, h * w))?;

        tracing::trace!(batch = b, channels = c, h, w, "encoded feature map");
        Ok(VisualFeatures {
            features,
            padding_mask,
            pos,
            grid: (h, w),
        })
    }
}

/// Text adapter over pre-extracted token embeddings [B, L, D]
pub struct PrecomputedText;

impl TextAdapter for PrecomputedText {
    fn encode_text(&self, text: &MaskedBatch) -> Result<TextFeatures> {
        let (b, l, _d) = text.tensors.dims3()?;
        let mask_dims = text.mask.dims();
        if mask_dims != [b, l] {
            return Err(GroundingError::input(format!(
                "text mask shape {mask_dims:?} does not match tokens [{b}, {l}]"
            )));
        }
        Ok(TextFeatures {
            features: text.tensors.clone(),
            padding_mask: text.mask.to_dtype(DType::U8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_feature_map_adapter_flattens_row_major() {
        let device = Device::Cpu;
        // One channel, 2x3 grid holding its own flat index
        let data: Vec<f32> = (0..6).map(|x| x as f32).collect();
        let maps = Tensor::from_vec(data, (1, 1, 2, 3), &device).unwrap();
        let batch = MaskedBatch::unpadded_image(maps).unwrap();

        let adapter = FeatureMapAdapter::new(4);
        let out = adapter.encode_image(&batch).unwrap();

        assert_eq!(out.grid, (2, 3));
        assert_eq!(out.num_tokens(), 6);
        assert_eq!(out.features.dims(), &[1, 6, 1]);
        assert_eq!(out.pos.dims(), &[1, 6, 4]);
        assert_eq!(out.padding_mask.dims(), &[1, 6]);
        let flat = out.features.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(flat, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_empty_grid_is_invalid_input() {
        let device = Device::Cpu;
        let maps = Tensor::zeros((1, 4, 0, 3), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((1, 0, 3), DType::U8, &device).unwrap();
        let adapter = FeatureMapAdapter::new(4);
        let err = adapter
            .encode_image(&MaskedBatch::new(maps, mask))
            .unwrap_err();
        assert!(matches!(err, GroundingError::InvalidInput(_)));
    }

    #[test]
    fn test_precomputed_text_checks_mask_shape() {
        let device = Device::Cpu;
        let tokens = Tensor::zeros((2, 5, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((2, 4), DType::U8, &device).unwrap();
        let err = PrecomputedText
            .encode_text(&MaskedBatch::new(tokens, mask))
            .unwrap_err();
        assert!(matches!(err, GroundingError::InvalidInput(_)));
    }
}

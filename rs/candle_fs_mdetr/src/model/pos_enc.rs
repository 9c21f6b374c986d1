//! Sinusoidal 2D position encoding for visual feature maps
//!
//! DETR-style encoding: valid positions are counted along each axis with a
//! cumulative sum over the inverted padding mask, normalised to `[0, scale]`,
//! divided by a geometric frequency ladder and passed through interleaved
//! sin/cos. Padded positions therefore never shift the coordinates of valid
//! ones.
//!
//! Output shape: [batch_size, height, width, num_pos_feats * 2]

use candle_core::{DType, Device, Result, Tensor};

/// Configuration for sinusoidal position embedding
#[derive(Debug, Clone)]
pub struct PositionEmbeddingSineConfig {
    /// Number of position features per axis (typically hidden_dim / 2)
    pub num_pos_feats: usize,
    /// Temperature for the frequency scaling (typically 10000)
    pub temperature: f64,
    /// Scale applied after normalisation (typically 2π)
    pub scale: f64,
}

impl PositionEmbeddingSineConfig {
    pub fn new(hidden_dim: usize) -> Self {
        Self {
            num_pos_feats: hidden_dim / 2,
            temperature: 10000.0,
            scale: 2.0 * std::f64::consts::PI,
        }
    }
}

pub struct PositionEmbeddingSine {
    config: PositionEmbeddingSineConfig,
}

impl PositionEmbeddingSine {
    pub fn new(config: PositionEmbeddingSineConfig) -> Self {
        Self { config }
    }

    pub fn for_hidden_dim(hidden_dim: usize) -> Self {
        Self::new(PositionEmbeddingSineConfig::new(hidden_dim))
    }

    /// Output width (`num_pos_feats * 2`)
    pub fn dim(&self) -> usize {
        self.config.num_pos_feats * 2
    }

    /// Compute the encoding for a padded batch.
    ///
    /// # Arguments
    /// * `padding_mask` - u8 tensor [batch_size, height, width], 1 marks padding
    ///
    /// # Returns
    /// Tensor of shape [batch_size, height, width, num_pos_feats * 2]
    pub fn forward(&self, padding_mask: &Tensor) -> Result<Tensor> {
        let (_b, height, width) = padding_mask.dims3()?;
        let device = padding_mask.device();

        let not_mask = (1.0 - padding_mask.to_dtype(DType::F32)?)?;
        let y_embed = not_mask.cumsum(1)?;
        let x_embed = not_mask.cumsum(2)?;

        let eps = 1e-6;
        let y_max = y_embed.narrow(1, height - 1, 1)?;
        let y_embed = (y_embed.broadcast_div(&(y_max + eps)?)? * self.config.scale)?;
        let x_max = x_embed.narrow(2, width - 1, 1)?;
        let x_embed = (x_embed.broadcast_div(&(x_max + eps)?)? * self.config.scale)?;

        let dim_t = self.create_dim_tensor(device)?;
        let pos_y = y_embed.unsqueeze(3)?.broadcast_div(&dim_t)?;
        let pos_x = x_embed.unsqueeze(3)?.broadcast_div(&dim_t)?;

        let pos_y = interleave_sin_cos(&pos_y)?;
        let pos_x = interleave_sin_cos(&pos_x)?;

        Tensor::cat(&[&pos_y, &pos_x], 3)
    }

    /// Encoding for an unpadded batch
    pub fn forward_unmasked(
        &self,
        batch_size: usize,
        height: usize,
        width: usize,
        device: &Device,
    ) -> Result<Tensor> {
        let mask = Tensor::zeros((batch_size, height, width), DType::U8, device)?;
        self.forward(&mask)
    }

    /// dim_t[i] = temperature ** (2 * (i // 2) / num_pos_feats)
    fn create_dim_tensor(&self, device: &Device) -> Result<Tensor> {
        let num_pos_feats = self.config.num_pos_feats;
        let dim_values: Vec<f32> = (0..num_pos_feats)
            .map(|i| {
                let exponent = 2.0 * ((i / 2) as f64) / (num_pos_feats as f64);
                self.config.temperature.powf(exponent) as f32
            })
            .collect();
        Tensor::from_vec(dim_values, num_pos_feats, device)
    }
}

/// sin on even feature indices, cos on odd ones, kept in place:
/// [sin(p0), cos(p1), sin(p2), cos(p3), ...]
fn interleave_sin_cos(pos: &Tensor) -> Result<Tensor> {
    let (b, h, w, feats) = pos.dims4()?;
    let half = feats / 2;
    let pairs = pos.reshape((b, h, w, half, 2))?;
    let sin = pairs.narrow(4, 0, 1)?.sin()?;
    let cos = pairs.narrow(4, 1, 1)?.cos()?;
    Tensor::cat(&[&sin, &cos], 4)?.reshape((b, h, w, feats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_encoding_shape() {
        let pos_enc = PositionEmbeddingSine::for_hidden_dim(256);
        let output = pos_enc.forward_unmasked(2, 20, 20, &Device::Cpu).unwrap();
        assert_eq!(output.dims(), &[2, 20, 20, 256]);
        assert_eq!(pos_enc.dim(), 256);
    }

    #[test]
    fn test_position_encoding_range() {
        let pos_enc = PositionEmbeddingSine::for_hidden_dim(64);
        let output = pos_enc.forward_unmasked(1, 8, 8, &Device::Cpu).unwrap();
        let values = output.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| (-1.0 - 1e-6..=1.0 + 1e-6).contains(v)));
    }

    #[test]
    fn test_first_feature_is_sine_of_normalised_row() {
        // Feature 0 of the y half is sin(y_embed / 1) with y_embed = (i + 1) / H * 2π
        let pos_enc = PositionEmbeddingSine::for_hidden_dim(8);
        let output = pos_enc.forward_unmasked(1, 4, 2, &Device::Cpu).unwrap();
        let row1 = output
            .narrow(1, 1, 1)
            .unwrap()
            .narrow(3, 0, 1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let expected = (2.0f64 / (4.0 + 1e-6) * 2.0 * std::f64::consts::PI).sin() as f32;
        for v in row1 {
            assert!((v - expected).abs() < 1e-5, "{v} vs {expected}");
        }
    }

    #[test]
    fn test_padding_does_not_shift_valid_positions() {
        let pos_enc = PositionEmbeddingSine::for_hidden_dim(16);
        let device = Device::Cpu;
        let unpadded = pos_enc.forward_unmasked(1, 2, 2, &device).unwrap();

        // 2x2 valid region inside a 2x4 map padded on the right
        let mask = Tensor::from_vec(vec![0u8, 0, 1, 1, 0, 0, 1, 1], (1, 2, 4), &device).unwrap();
        let padded = pos_enc.forward(&mask).unwrap();
        let valid = padded.narrow(2, 0, 2).unwrap();

        let diff = (valid - unpadded)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-5, "max diff {diff}");
    }
}

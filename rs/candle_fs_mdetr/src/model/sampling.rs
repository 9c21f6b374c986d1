//! 2D adaptive feature sampling
//!
//! At every decoding stage a query predicts `N` offsets around the current
//! reference point. The visual feature map and its positional encoding are
//! bilinearly sampled at those locations, producing the small sequence the
//! stage decoder attends to.

use candle_core::{IndexOp, Result, Tensor, D};
use candle_nn::{Init, Linear, Module, VarBuilder};

/// Bilinear `grid_sample` with `align_corners = false` and zero padding
///
/// # Arguments
/// * `input` - [N, C, H, W]
/// * `grid` - [N, H_out, W_out, 2] with (x, y) in [-1, 1]
///
/// # Returns
/// Sampled tensor [N, C, H_out, W_out]
pub fn grid_sample_bilinear(input: &Tensor, grid: &Tensor) -> Result<Tensor> {
    let (n, c, h, w) = input.dims4()?;
    let (_, h_out, w_out, _) = grid.dims4()?;
    let dtype = input.dtype();

    // [-1, 1] -> [-0.5, size - 0.5], pixel centers at 0, 1, ..., size - 1
    let x = (((grid.i((.., .., .., 0))? + 1.0)? * (w as f64 / 2.0))? - 0.5)?;
    let y = (((grid.i((.., .., .., 1))? + 1.0)? * (h as f64 / 2.0))? - 0.5)?;

    // Corner coordinates carry no gradient; the weights below do
    let x0 = x.detach().floor()?;
    let y0 = y.detach().floor()?;

    let input_flat = input.reshape((n, c, h * w))?;
    let mut output = Tensor::zeros((n, c, h_out, w_out), dtype, input.device())?;

    for (dx, dy) in [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0)] {
        let cx = (&x0 + dx)?;
        let cy = (&y0 + dy)?;

        // (1 - |x - cx|) * (1 - |y - cy|), zeroed when the corner is off the map
        let wx = (1.0 - (&x - &cx)?.abs()?)?;
        let wy = (1.0 - (&y - &cy)?.abs()?)?;
        let in_bounds = cx
            .ge(0.0)?
            .mul(&cx.lt(w as f64)?)?
            .mul(&cy.ge(0.0)?)?
            .mul(&cy.lt(h as f64)?)?
            .to_dtype(dtype)?;
        let weight = wx.mul(&wy)?.mul(&in_bounds)?.unsqueeze(1)?;

        let ix = cx.clamp(0.0, (w - 1) as f64)?;
        let iy = cy.clamp(0.0, (h - 1) as f64)?;
        let idx = ((iy * w as f64)? + ix)?
            .to_dtype(candle_core::DType::U32)?
            .reshape((n, 1, h_out * w_out))?
            .repeat((1, c, 1))?;

        let corner = input_flat
            .gather(&idx, 2)?
            .reshape((n, c, h_out, w_out))?;
        output = (output + corner.broadcast_mul(&weight)?)?;
    }

    Ok(output)
}

/// One stage's offset generator.
///
/// Small weights and a small uniform bias keep the initial points spread
/// within a quarter of the map around the reference point.
fn offset_generator(hidden_dim: usize, outputs: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (outputs, hidden_dim),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: 1e-2,
        },
    )?;
    let bias = vb.get_with_hints(outputs, "bias", Init::Uniform { lo: -0.25, up: 0.25 })?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Per-stage offset generators around a shared reference point
pub struct AdaptiveSampler {
    offset_generators: Vec<Linear>,
    num_points: usize,
}

impl AdaptiveSampler {
    pub fn load(
        hidden_dim: usize,
        num_points: usize,
        stages: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let offset_generators = (0..stages)
            .map(|i| {
                offset_generator(
                    hidden_dim,
                    num_points * 2,
                    vb.pp(format!("offset_generators.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            offset_generators,
            num_points,
        })
    }

    /// Normalised sampling locations [B, N, 2] for one stage
    pub fn locations(&self, stage: usize, query: &Tensor, reference: &Tensor) -> Result<Tensor> {
        let generator = self.offset_generators.get(stage).ok_or_else(|| {
            candle_core::Error::Msg(format!(
                "no offset generator for stage {stage} ({} stages)",
                self.offset_generators.len()
            ))
        })?;
        let b = query.dim(0)?;
        let offsets = generator
            .forward(query)?
            .reshape((b, self.num_points, 2))?;
        offsets.broadcast_add(&reference.unsqueeze(1)?)
    }

    /// Sample the feature map and its positional encoding around `reference`
    ///
    /// # Arguments
    /// * `query` - [B, C]
    /// * `reference` - [B, 2] normalised (x, y)
    /// * `features`, `pos` - [B, C, H, W]
    ///
    /// # Returns
    /// `(samples, sample_pos)`, each [B, N, C]
    pub fn sample(
        &self,
        stage: usize,
        query: &Tensor,
        reference: &Tensor,
        features: &Tensor,
        pos: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let locations = self.locations(stage, query, reference)?;
        // [B, N, 2] in [0, 1] -> [B, N, 1, 2] in [-1, 1]
        let grid = ((locations * 2.0)? - 1.0)?.unsqueeze(2)?;

        let gather = |map: &Tensor| -> Result<Tensor> {
            grid_sample_bilinear(map, &grid)?
                .squeeze(D::Minus1)?
                .transpose(1, 2)?
                .contiguous()
        };
        Ok((gather(features)?, gather(pos)?))
    }
}

//! Transformer blocks used by the fusion encoder and the stage decoders
//!
//! Post-norm DETR blocks with additive positional encodings on queries and
//! keys. The model reaches them only through two narrow traits:
//! - [`SequenceEncoder`]: order- and length-preserving transform over the fused
//!   prompt/visual/text sequence
//! - [`SampleDecoder`]: one-layer encoder-decoder that refines the sampled
//!   visual features and decodes the text stream against them
//!
//! All tensors are batch-first. Key padding masks are u8 with 1 marking padding.

use candle_core::{Result, Tensor, D};
use candle_nn::{init, linear, Init, Linear, Module, VarBuilder};

/// Order- and length-preserving sequence transform
pub trait SequenceEncoder {
    /// * `src` - [B, N, C]
    /// * `padding_mask` - [B, N]
    /// * `pos` - [B, N, C]
    fn encode(&self, src: &Tensor, padding_mask: &Tensor, pos: &Tensor) -> Result<Tensor>;
}

/// Text-guided decoding against a small set of sampled visual features
pub trait SampleDecoder {
    /// * `samples`, `sample_pos` - [B, N, C]
    /// * `text`, `text_pos` - [B, L, C]
    /// * `text_mask` - [B, L]
    ///
    /// Returns the decoded text stream [B, L, C].
    fn decode(
        &self,
        samples: &Tensor,
        sample_pos: &Tensor,
        text: &Tensor,
        text_mask: &Tensor,
        text_pos: &Tensor,
    ) -> Result<Tensor>;
}

/// Multi-Layer Perceptron with ReLU between layers
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    pub fn load(
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { input_dim } else { hidden_dim };
            let out_dim = if i == num_layers - 1 {
                output_dim
            } else {
                hidden_dim
            };
            layers.push(linear(in_dim, out_dim, vb.pp(format!("layers.{}", i)))?);
        }
        Ok(Self { layers })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut output = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            output = layer.forward(&output)?;
            if i < self.layers.len() - 1 {
                output = output.relu()?;
            }
        }
        Ok(output)
    }
}

/// Layer normalization over the last dimension.
///
/// Uses the plain-op `layer_norm_slow` so gradients reach the adaptable
/// parameters upstream of every norm.
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f32,
}

impl LayerNorm {
    pub fn load(dim: usize, eps: f32, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        candle_nn::ops::layer_norm_slow(x, &self.weight, &self.bias, self.eps)
    }
}

/// Multi-head attention with packed input projections and key padding mask
pub struct MultiheadAttention {
    num_heads: usize,
    head_dim: usize,
    in_proj_weight: Tensor,
    in_proj_bias: Tensor,
    out_proj: Linear,
}

impl MultiheadAttention {
    pub fn load(embed_dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        let in_proj_weight = vb.get_with_hints(
            (3 * embed_dim, embed_dim),
            "in_proj_weight",
            init::DEFAULT_KAIMING_NORMAL,
        )?;
        let in_proj_bias = vb.get_with_hints(3 * embed_dim, "in_proj_bias", Init::Const(0.0))?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;

        Ok(Self {
            num_heads,
            head_dim: embed_dim / num_heads,
            in_proj_weight,
            in_proj_bias,
            out_proj,
        })
    }

    /// Project with the `chunk`-th slice (0 = q, 1 = k, 2 = v) of the packed weights
    fn project(&self, x: &Tensor, chunk: usize) -> Result<Tensor> {
        let embed_dim = self.num_heads * self.head_dim;
        let weight = self.in_proj_weight.narrow(0, chunk * embed_dim, embed_dim)?;
        let bias = self.in_proj_bias.narrow(0, chunk * embed_dim, embed_dim)?;
        x.broadcast_matmul(&weight.t()?)?.broadcast_add(&bias)
    }

    /// [batch, seq, embed] -> [batch, heads, seq, head_dim]
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, n, _) = x.dims3()?;
        x.reshape((b, n, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// # Arguments
    /// * `query` - [batch_size, q_len, embed_dim]
    /// * `key`, `value` - [batch_size, k_len, embed_dim]
    /// * `key_padding_mask` - optional [batch_size, k_len], 1 masks the key out
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        key_padding_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch_size, q_len, embed_dim) = query.dims3()?;
        let k_len = key.dim(1)?;

        let q = self.split_heads(&self.project(query, 0)?)?;
        let k = self.split_heads(&self.project(key, 1)?)?;
        let v = self.split_heads(&self.project(value, 2)?)?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let attn_weights = (q.matmul(&k_t)? / scale)?;

        let attn_weights = match key_padding_mask {
            Some(mask) => {
                let shape = attn_weights.shape().clone();
                let mask = mask
                    .reshape((batch_size, 1, 1, k_len))?
                    .broadcast_as(shape.clone())?;
                let neg_inf = Tensor::new(f32::NEG_INFINITY, attn_weights.device())?
                    .to_dtype(attn_weights.dtype())?
                    .broadcast_as(shape)?;
                mask.where_cond(&neg_inf, &attn_weights)?
            }
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_output = attn_weights.matmul(&v)?;

        let attn_output = attn_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, q_len, embed_dim))?;
        self.out_proj.forward(&attn_output)
    }
}

fn with_pos(x: &Tensor, pos: &Tensor) -> Result<Tensor> {
    x + pos
}

/// Self-attention + FFN encoder layer
pub struct TransformerEncoderLayer {
    self_attn: MultiheadAttention,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
}

impl TransformerEncoderLayer {
    pub fn load(
        d_model: usize,
        nhead: usize,
        dim_feedforward: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attn: MultiheadAttention::load(d_model, nhead, vb.pp("self_attn"))?,
            linear1: linear(d_model, dim_feedforward, vb.pp("linear1"))?,
            linear2: linear(dim_feedforward, d_model, vb.pp("linear2"))?,
            norm1: LayerNorm::load(d_model, 1e-5, vb.pp("norm1"))?,
            norm2: LayerNorm::load(d_model, 1e-5, vb.pp("norm2"))?,
        })
    }

    pub fn forward(
        &self,
        src: &Tensor,
        padding_mask: Option<&Tensor>,
        pos: &Tensor,
    ) -> Result<Tensor> {
        let q = with_pos(src, pos)?;
        let src2 = self.self_attn.forward(&q, &q, src, padding_mask)?;
        let src = self.norm1.forward(&(src + src2)?)?;

        let src2 = self.linear2.forward(&self.linear1.forward(&src)?.relu()?)?;
        self.norm2.forward(&(src + src2)?)
    }
}

/// Self-attention + cross-attention + FFN decoder layer
pub struct TransformerDecoderLayer {
    self_attn: MultiheadAttention,
    cross_attn: MultiheadAttention,
    linear1: Linear,
    linear2: Linear,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
}

impl TransformerDecoderLayer {
    pub fn load(
        d_model: usize,
        nhead: usize,
        dim_feedforward: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            self_attn: MultiheadAttention::load(d_model, nhead, vb.pp("self_attn"))?,
            cross_attn: MultiheadAttention::load(d_model, nhead, vb.pp("multihead_attn"))?,
            linear1: linear(d_model, dim_feedforward, vb.pp("linear1"))?,
            linear2: linear(dim_feedforward, d_model, vb.pp("linear2"))?,
            norm1: LayerNorm::load(d_model, 1e-5, vb.pp("norm1"))?,
            norm2: LayerNorm::load(d_model, 1e-5, vb.pp("norm2"))?,
            norm3: LayerNorm::load(d_model, 1e-5, vb.pp("norm3"))?,
        })
    }

    /// # Arguments
    /// * `tgt` - [batch_size, tgt_len, d_model]
    /// * `memory` - [batch_size, mem_len, d_model]
    /// * `tgt_mask` - [batch_size, tgt_len] key padding mask for self-attention
    /// * `pos` - memory positions, `query_pos` - target positions
    pub fn forward(
        &self,
        tgt: &Tensor,
        memory: &Tensor,
        tgt_mask: Option<&Tensor>,
        pos: &Tensor,
        query_pos: &Tensor,
    ) -> Result<Tensor> {
        let q = with_pos(tgt, query_pos)?;
        let tgt2 = self.self_attn.forward(&q, &q, tgt, tgt_mask)?;
        let tgt = self.norm1.forward(&(tgt + tgt2)?)?;

        let tgt2 = self.cross_attn.forward(
            &with_pos(&tgt, query_pos)?,
            &with_pos(memory, pos)?,
            memory,
            None,
        )?;
        let tgt = self.norm2.forward(&(tgt + tgt2)?)?;

        let tgt2 = self.linear2.forward(&self.linear1.forward(&tgt)?.relu()?)?;
        self.norm3.forward(&(tgt + tgt2)?)
    }
}

/// Stack of encoder layers over the fused prompt/visual/text sequence
pub struct FusionTransformerEncoder {
    layers: Vec<TransformerEncoderLayer>,
}

impl FusionTransformerEncoder {
    pub fn load(
        d_model: usize,
        nhead: usize,
        dim_feedforward: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layers = (0..num_layers)
            .map(|i| {
                TransformerEncoderLayer::load(
                    d_model,
                    nhead,
                    dim_feedforward,
                    vb.pp(format!("layers.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}

impl SequenceEncoder for FusionTransformerEncoder {
    fn encode(&self, src: &Tensor, padding_mask: &Tensor, pos: &Tensor) -> Result<Tensor> {
        let mut output = src.clone();
        for layer in &self.layers {
            output = layer.forward(&output, Some(padding_mask), pos)?;
        }
        Ok(output)
    }
}

/// One-layer encoder-decoder used at every decoding stage.
///
/// The encoder refines the sampled visual features; the decoder runs the text
/// stream as its target sequence against the encoded samples.
pub struct VlTransformer {
    encoder: TransformerEncoderLayer,
    decoder: TransformerDecoderLayer,
    decoder_norm: LayerNorm,
}

impl VlTransformer {
    pub fn load(
        d_model: usize,
        nhead: usize,
        dim_feedforward: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            encoder: TransformerEncoderLayer::load(
                d_model,
                nhead,
                dim_feedforward,
                vb.pp("encoder.layers.0"),
            )?,
            decoder: TransformerDecoderLayer::load(
                d_model,
                nhead,
                dim_feedforward,
                vb.pp("decoder.layers.0"),
            )?,
            decoder_norm: LayerNorm::load(d_model, 1e-5, vb.pp("decoder.norm"))?,
        })
    }
}

impl SampleDecoder for VlTransformer {
    fn decode(
        &self,
        samples: &Tensor,
        sample_pos: &Tensor,
        text: &Tensor,
        text_mask: &Tensor,
        text_pos: &Tensor,
    ) -> Result<Tensor> {
        let memory = self.encoder.forward(samples, None, sample_pos)?;
        let hs = self
            .decoder
            .forward(text, &memory, Some(text_mask), sample_pos, text_pos)?;
        self.decoder_norm.forward(&hs)
    }
}

use std::ops::Range;
use std::sync::Arc;

use candle_core::{D, DType, Device, Module, Result, Tensor, bail};
use candle_nn::{Activation, Embedding, Linear, VarBuilder, linear_b, linear_no_bias};
use candle_transformers::utils::repeat_kv;

use crate::gemma3::config::TextConfig;

/// Gemma flavoured RMS norm: scales by `1 + weight` and always reduces in f32.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = (vb.get(size, "weight")?.to_dtype(DType::F32)? + 1.0)?;
        Ok(Self { weight, eps })
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let variance = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let xs = xs.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        xs.broadcast_mul(&self.weight)?.to_dtype(dtype)
    }
}

#[derive(Debug)]
struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(
        head_dim: usize,
        base: f64,
        scaling_factor: f64,
        max_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / base.powf(i as f64 / head_dim as f64) / scaling_factor) as f32)
            .collect();
        let half = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), device)?;
        let positions = Tensor::arange(0u32, max_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor, offset: usize) -> Result<(Tensor, Tensor)> {
        let (_b, _h, seq_len, _d) = q.dims4()?;
        let cos = self.cos.narrow(0, offset, seq_len)?;
        let sin = self.sin.narrow(0, offset, seq_len)?;
        let q = candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?;
        let k = candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?;
        Ok((q, k))
    }
}

#[derive(Debug)]
struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
    act: Activation,
    span: tracing::Span,
}

impl Mlp {
    fn new(cfg: &TextConfig, vb: VarBuilder) -> Result<Self> {
        let (hidden, inter) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(hidden, inter, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden, inter, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(inter, hidden, vb.pp("down_proj"))?,
            act: cfg.hidden_activation,
            span: tracing::span!(tracing::Level::TRACE, "mlp"),
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let gate = self.gate_proj.forward(xs)?.apply(&self.act)?;
        self.down_proj.forward(&(gate * self.up_proj.forward(xs)?)?)
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: RmsNorm,
    k_norm: RmsNorm,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f64,
    softcap: Option<f64>,
    sliding_window: Option<usize>,
    rotary: Arc<RotaryEmbedding>,
    kv_cache: Option<(Tensor, Tensor)>,
    span: tracing::Span,
}

impl Attention {
    fn new(
        cfg: &TextConfig,
        sliding_window: Option<usize>,
        rotary: Arc<RotaryEmbedding>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let hidden = cfg.hidden_size;
        let (heads, kv_heads, head_dim) =
            (cfg.num_attention_heads, cfg.num_key_value_heads, cfg.head_dim);
        if kv_heads == 0 || heads % kv_heads != 0 {
            bail!("{heads} attention heads cannot be grouped over {kv_heads} kv heads")
        }
        let bias = cfg.attention_bias;

        Ok(Self {
            q_proj: linear_b(hidden, heads * head_dim, bias, vb.pp("q_proj"))?,
            k_proj: linear_b(hidden, kv_heads * head_dim, bias, vb.pp("k_proj"))?,
            v_proj: linear_b(hidden, kv_heads * head_dim, bias, vb.pp("v_proj"))?,
            o_proj: linear_b(heads * head_dim, hidden, bias, vb.pp("o_proj"))?,
            q_norm: RmsNorm::new(head_dim, cfg.rms_norm_eps, vb.pp("q_norm"))?,
            k_norm: RmsNorm::new(head_dim, cfg.rms_norm_eps, vb.pp("k_norm"))?,
            num_heads: heads,
            num_kv_heads: kv_heads,
            head_dim,
            scale: cfg.query_pre_attn_scalar.powf(-0.5),
            softcap: cfg.attn_logit_softcapping,
            sliding_window,
            rotary,
            kv_cache: None,
            span: tracing::span!(tracing::Level::TRACE, "attn"),
        })
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>, offset: usize) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, seq_len, _) = xs.dims3()?;

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let q = self.q_norm.forward(&q)?;
        let k = self.k_norm.forward(&k)?;
        let (q, k) = self.rotary.apply(&q, &k, offset)?;

        let (k, v) = match &self.kv_cache {
            Some((k_cache, v_cache)) if offset > 0 => (
                Tensor::cat(&[k_cache, &k], 2)?,
                Tensor::cat(&[v_cache, &v], 2)?,
            ),
            _ => (k, v),
        };
        // local layers never look further back than the window
        let (k, v) = match self.sliding_window {
            Some(window) if seq_len == 1 && k.dim(2)? > window => {
                let start = k.dim(2)? - window;
                (k.narrow(2, start, window)?, v.narrow(2, start, window)?)
            }
            _ => (k, v),
        };
        let kv_len = k.dim(2)?;
        self.kv_cache = Some(match self.sliding_window {
            Some(window) if kv_len > window => (
                k.narrow(2, kv_len - window, window)?,
                v.narrow(2, kv_len - window, window)?,
            ),
            _ => (k.clone(), v.clone()),
        });

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let att = (q.matmul(&k.t()?)? * self.scale)?;
        let att = match self.softcap {
            Some(cap) => ((att / cap)?.tanh()? * cap)?,
            None => att,
        };
        let att = match mask {
            Some(mask) => {
                let total = mask.dim(D::Minus1)?;
                let mask = if total > kv_len {
                    mask.narrow(D::Minus1, total - kv_len, kv_len)?
                } else {
                    mask.clone()
                };
                att.broadcast_add(&mask)?
            }
            None => att,
        };
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let ys = att
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&ys)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
    pre_feedforward_layernorm: RmsNorm,
    post_feedforward_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(
        cfg: &TextConfig,
        sliding_window: Option<usize>,
        rotary: Arc<RotaryEmbedding>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (hidden, eps) = (cfg.hidden_size, cfg.rms_norm_eps);
        Ok(Self {
            self_attn: Attention::new(cfg, sliding_window, rotary, vb.pp("self_attn"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
            input_layernorm: RmsNorm::new(hidden, eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: RmsNorm::new(
                hidden,
                eps,
                vb.pp("post_attention_layernorm"),
            )?,
            pre_feedforward_layernorm: RmsNorm::new(
                hidden,
                eps,
                vb.pp("pre_feedforward_layernorm"),
            )?,
            post_feedforward_layernorm: RmsNorm::new(
                hidden,
                eps,
                vb.pp("post_feedforward_layernorm"),
            )?,
        })
    }

    fn is_sliding(&self) -> bool {
        self.self_attn.sliding_window.is_some()
    }

    fn forward(&mut self, xs: &Tensor, mask: Option<&Tensor>, offset: usize) -> Result<Tensor> {
        let residual = xs;
        let xs = self.input_layernorm.forward(xs)?;
        let xs = self.self_attn.forward(&xs, mask, offset)?;
        let xs = (self.post_attention_layernorm.forward(&xs)? + residual)?;

        let residual = &xs;
        let ys = self.pre_feedforward_layernorm.forward(&xs)?;
        let ys = self.mlp.forward(&ys)?;
        self.post_feedforward_layernorm.forward(&ys)? + residual
    }

    fn clear_kv_cache(&mut self) {
        self.self_attn.kv_cache = None;
    }
}

/// Additive attention mask of shape `(seq_len, offset + seq_len)`.
///
/// Position `j` is visible from query position `q` when it is causal (and
/// within `window` when given), or when both sit inside the same image span.
/// Image tokens attend to each other bidirectionally.
pub fn mask_values(
    seq_len: usize,
    offset: usize,
    window: Option<usize>,
    image_spans: &[Range<usize>],
) -> Vec<f32> {
    let total = offset + seq_len;
    let same_image = |q: usize, k: usize| {
        image_spans
            .iter()
            .any(|span| span.contains(&q) && span.contains(&k))
    };

    (0..seq_len)
        .flat_map(|i| {
            let q = offset + i;
            (0..total).map(move |k| (q, k))
        })
        .map(|(q, k)| {
            let causal = k <= q && window.is_none_or(|w| q - k < w);
            if causal || same_image(q, k) {
                0.0
            } else {
                f32::NEG_INFINITY
            }
        })
        .collect()
}

/// Gemma3 language model that can be driven from precomputed input embeddings.
#[derive(Debug)]
pub struct TextModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: Linear,
    embed_scale: Tensor,
    sliding_window: usize,
    final_softcap: Option<f64>,
    max_context: usize,
    dtype: DType,
    device: Device,
}

impl TextModel {
    /// `vb` points at the decoder (`embed_tokens`, `layers`, `norm`); the output
    /// projection is read from `lm_head_vb` when present and tied to the
    /// embeddings otherwise.
    pub fn new(
        cfg: &TextConfig,
        max_context: usize,
        vb: VarBuilder,
        lm_head_vb: VarBuilder,
    ) -> Result<Self> {
        let (dtype, device) = (vb.dtype(), vb.device().clone());
        let embed_tokens =
            candle_nn::embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embed_tokens"))?;

        let local_rotary = Arc::new(RotaryEmbedding::new(
            cfg.head_dim,
            cfg.rope_local_base_freq,
            1.0,
            max_context,
            dtype,
            &device,
        )?);
        let global_rotary = Arc::new(RotaryEmbedding::new(
            cfg.head_dim,
            cfg.rope_theta,
            cfg.rope_scaling_factor(),
            max_context,
            dtype,
            &device,
        )?);

        let vb_layers = vb.pp("layers");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| {
                let (window, rotary) = if cfg.is_sliding(i) {
                    (Some(cfg.sliding_window), local_rotary.clone())
                } else {
                    (None, global_rotary.clone())
                };
                DecoderLayer::new(cfg, window, rotary, vb_layers.pp(i))
            })
            .collect::<Result<Vec<_>>>()?;

        let norm = RmsNorm::new(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("norm"))?;
        let lm_head = if lm_head_vb.contains_tensor("weight") {
            linear_no_bias(cfg.hidden_size, cfg.vocab_size, lm_head_vb)?
        } else {
            Linear::new(embed_tokens.embeddings().clone(), None)
        };
        let embed_scale =
            Tensor::new((cfg.hidden_size as f32).sqrt(), &device)?.to_dtype(dtype)?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            embed_scale,
            sliding_window: cfg.sliding_window,
            final_softcap: cfg.final_logit_softcapping,
            max_context,
            dtype,
            device,
        })
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn max_context(&self) -> usize {
        self.max_context
    }

    /// Scaled token embeddings, `(batch, seq_len)` ids to `(batch, seq_len, hidden)`.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens
            .forward(input_ids)?
            .broadcast_mul(&self.embed_scale)
    }

    fn mask(
        &self,
        seq_len: usize,
        offset: usize,
        window: Option<usize>,
        image_spans: &[Range<usize>],
    ) -> Result<Tensor> {
        let values = mask_values(seq_len, offset, window, image_spans);
        Tensor::from_vec(values, (1, 1, seq_len, offset + seq_len), &self.device)?
            .to_dtype(self.dtype)
    }

    /// Runs the decoder over `embeds` placed at `offset` and returns f32 logits
    /// for the last position, `(batch, vocab)`.
    pub fn forward_embeds(
        &mut self,
        embeds: &Tensor,
        offset: usize,
        image_spans: &[Range<usize>],
    ) -> Result<Tensor> {
        let (_b, seq_len, _) = embeds.dims3()?;
        if offset + seq_len > self.max_context {
            bail!(
                "context length exceeded: offset {offset} + {seq_len} tokens > {}",
                self.max_context
            )
        }

        let (global_mask, local_mask) = if seq_len == 1 {
            (None, None)
        } else {
            (
                Some(self.mask(seq_len, offset, None, image_spans)?),
                Some(self.mask(seq_len, offset, Some(self.sliding_window), image_spans)?),
            )
        };

        let mut xs = embeds.clone();
        for layer in self.layers.iter_mut() {
            let mask = if layer.is_sliding() {
                local_mask.as_ref()
            } else {
                global_mask.as_ref()
            };
            xs = layer.forward(&xs, mask, offset)?;
        }

        let xs = xs.narrow(1, seq_len - 1, 1)?;
        let logits = self.lm_head.forward(&self.norm.forward(&xs)?)?;
        let logits = match self.final_softcap {
            Some(cap) => ((logits / cap)?.tanh()? * cap)?,
            None => logits,
        };
        logits.squeeze(1)?.to_dtype(DType::F32)
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.clear_kv_cache();
        }
    }
}

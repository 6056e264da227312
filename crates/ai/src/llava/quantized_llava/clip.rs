use super::linear::QLinear;
use candle_core::{shape::D, DType, IndexOp, Module, Result, Shape, Tensor};
use candle_nn::Conv2dConfig;
use candle_transformers::quantized_var_builder;

#[derive(Debug, Clone, Copy)]
pub enum Activation {
    QuickGelu,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::QuickGelu => xs * candle_nn::ops::sigmoid(&(xs * 1.702f64)?),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClipVisionConfig {
    pub activation: Activation,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[allow(dead_code)]
    pub projection_dim: usize,
    pub num_channels: usize,
    pub image_size: usize,
    pub patch_size: usize,
    pub layer_norm_eps: f64,
}

impl ClipVisionConfig {
    pub fn num_patches(&self) -> usize {
        (self.image_size / self.patch_size).pow(2)
    }
}

fn layer_norm(
    size: usize,
    eps: f64,
    vb: quantized_var_builder::VarBuilder,
    dtype: DType,
) -> Result<candle_nn::LayerNorm> {
    let weight = vb.get(size, "weight")?;
    let weight = weight.dequantize(vb.device())?.to_dtype(dtype)?;
    let bias = vb.get(size, "bias")?;
    let bias = bias.dequantize(vb.device())?.to_dtype(dtype)?;
    Ok(candle_nn::LayerNorm::new(weight, bias, eps))
}

// https://github.com/huggingface/transformers/blob/f6fa0f0bf0796ac66f201f23bdb8585de1609add/src/transformers/models/clip/modeling_clip.py#L112
#[derive(Clone, Debug)]
struct ClipVisionEmbeddings {
    patch_embedding: candle_nn::Conv2d,
    position_ids: Tensor,
    class_embedding: Tensor,
    position_embedding: candle_nn::Embedding,
}

impl ClipVisionEmbeddings {
    fn new(
        vs: quantized_var_builder::VarBuilder,
        c: &ClipVisionConfig,
        dtype: DType,
    ) -> Result<Self> {
        // originally nn.Parameter
        let class_embedding = vs.get(c.hidden_size, "class_embd")?;
        let class_embedding = class_embedding.dequantize(vs.device())?.to_dtype(dtype)?;

        let num_positions = c.num_patches() + 1;
        let position_ids = Tensor::arange(0, num_positions as u32, vs.device())?;

        let conv2dconfig = Conv2dConfig {
            stride: c.patch_size,
            ..Default::default()
        };

        let position_embedding = {
            let (in_size, out_size) = (num_positions, c.hidden_size);
            let embeddings = vs.get((in_size, out_size), "position_embd.weight")?;
            let embeddings = embeddings.dequantize(vs.device())?.to_dtype(dtype)?;
            candle_nn::Embedding::new(embeddings, out_size)
        };

        // clip patch embedding has no bias
        let patch_embedding = {
            let (in_channels, out_channels, kernel_size) =
                (c.num_channels, c.hidden_size, c.patch_size);
            let ws = vs.get(
                (
                    out_channels,
                    in_channels / conv2dconfig.groups,
                    kernel_size,
                    kernel_size,
                ),
                "patch_embd.weight",
            )?;
            let ws = ws.dequantize(vs.device())?.to_dtype(dtype)?;
            candle_nn::Conv2d::new(ws, None, conv2dconfig)
        };

        Ok(Self {
            patch_embedding,
            position_ids,
            class_embedding,
            position_embedding,
        })
    }
}

impl Module for ClipVisionEmbeddings {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let batch_size = pixel_values.shape().dims();
        let patch_embeds = self
            .patch_embedding
            .forward(pixel_values)?
            .flatten_from(2)?
            .transpose(1, 2)?;
        let shape = Shape::from((batch_size[0], 1, self.class_embedding.dim(D::Minus1)?));
        let class_embeds = self.class_embedding.expand(shape)?;
        let embeddings = Tensor::cat(&[class_embeds, patch_embeds], 1)?;
        let position_embedding = self.position_embedding.forward(&self.position_ids)?;
        embeddings.broadcast_add(&position_embedding)
    }
}

#[derive(Clone, Debug)]
struct ClipAttention {
    k_proj: QLinear,
    v_proj: QLinear,
    q_proj: QLinear,
    out_proj: QLinear,
    head_dim: usize,
    scale: f64,
    num_attention_heads: usize,
}

impl ClipAttention {
    fn new(
        vs: quantized_var_builder::VarBuilder,
        c: &ClipVisionConfig,
        dtype: DType,
    ) -> Result<Self> {
        let embed_dim = c.hidden_size;
        let num_attention_heads = c.num_attention_heads;
        let k_proj = QLinear::load(embed_dim, embed_dim, vs.pp("attn_k"), dtype)?;
        let v_proj = QLinear::load(embed_dim, embed_dim, vs.pp("attn_v"), dtype)?;
        let q_proj = QLinear::load(embed_dim, embed_dim, vs.pp("attn_q"), dtype)?;
        let out_proj = QLinear::load(embed_dim, embed_dim, vs.pp("attn_out"), dtype)?;
        let head_dim = embed_dim / num_attention_heads;
        let scale = (head_dim as f64).powf(-0.5);

        Ok(ClipAttention {
            k_proj,
            v_proj,
            q_proj,
            out_proj,
            head_dim,
            scale,
            num_attention_heads,
        })
    }

    fn shape(&self, xs: &Tensor, seq_len: usize, bsz: usize) -> Result<Tensor> {
        xs.reshape((bsz, seq_len, self.num_attention_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let in_dtype = xs.dtype();
        let (bsz, seq_len, embed_dim) = xs.dims3()?;

        let query_states = (self.q_proj.forward(xs)? * self.scale)?;
        let proj_shape = (bsz * self.num_attention_heads, seq_len, self.head_dim);
        // attention scores are always computed in f32
        let query_states = self
            .shape(&query_states, seq_len, bsz)?
            .reshape(proj_shape)?
            .to_dtype(DType::F32)?;
        let key_states = self
            .shape(&self.k_proj.forward(xs)?, seq_len, bsz)?
            .reshape(proj_shape)?
            .to_dtype(DType::F32)?;
        let value_states = self
            .shape(&self.v_proj.forward(xs)?, seq_len, bsz)?
            .reshape(proj_shape)?
            .to_dtype(DType::F32)?;
        let attn_weights = query_states.matmul(&key_states.transpose(1, 2)?)?;
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;

        let attn_output = attn_weights.matmul(&value_states)?.to_dtype(in_dtype)?;
        let attn_output = attn_output
            .reshape((bsz, self.num_attention_heads, seq_len, self.head_dim))?
            .transpose(1, 2)?
            .reshape((bsz, seq_len, embed_dim))?;
        self.out_proj.forward(&attn_output)
    }
}

#[derive(Clone, Debug)]
struct ClipMlp {
    // llama.cpp names fc1 `ffn_down` and fc2 `ffn_up`
    ffn_down: QLinear,
    ffn_up: QLinear,
    activation: Activation,
}

impl ClipMlp {
    fn new(
        vs: quantized_var_builder::VarBuilder,
        c: &ClipVisionConfig,
        dtype: DType,
    ) -> Result<Self> {
        let ffn_down = QLinear::load(
            c.hidden_size,
            c.intermediate_size,
            vs.pp("ffn_down"),
            dtype,
        )?;
        let ffn_up = QLinear::load(c.intermediate_size, c.hidden_size, vs.pp("ffn_up"), dtype)?;
        Ok(ClipMlp {
            ffn_down,
            ffn_up,
            activation: c.activation,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.ffn_down.forward(xs)?;
        self.ffn_up.forward(&self.activation.forward(&xs)?)
    }
}

#[derive(Clone, Debug)]
struct ClipEncoderLayer {
    self_attn: ClipAttention,
    layer_norm1: candle_nn::LayerNorm,
    mlp: ClipMlp,
    layer_norm2: candle_nn::LayerNorm,
}

impl ClipEncoderLayer {
    fn new(
        vs: quantized_var_builder::VarBuilder,
        c: &ClipVisionConfig,
        dtype: DType,
    ) -> Result<Self> {
        let self_attn = ClipAttention::new(vs.clone(), c, dtype)?;
        let layer_norm1 = layer_norm(c.hidden_size, c.layer_norm_eps, vs.pp("ln1"), dtype)?;
        let mlp = ClipMlp::new(vs.clone(), c, dtype)?;
        let layer_norm2 = layer_norm(c.hidden_size, c.layer_norm_eps, vs.pp("ln2"), dtype)?;

        Ok(ClipEncoderLayer {
            self_attn,
            layer_norm1,
            mlp,
            layer_norm2,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self.layer_norm1.forward(xs)?;
        let xs = self.self_attn.forward(&xs)?;
        let xs = (xs + residual)?;

        let residual = &xs;
        let xs = self.layer_norm2.forward(&xs)?;
        let xs = self.mlp.forward(&xs)?;
        xs + residual
    }
}

#[derive(Clone, Debug)]
pub struct ClipEncoder {
    layers: Vec<ClipEncoderLayer>,
}

impl ClipEncoder {
    pub fn new(
        vs: quantized_var_builder::VarBuilder,
        c: &ClipVisionConfig,
        dtype: DType,
    ) -> Result<Self> {
        // clip.vision.block_count is 23 in the mmproj gguf while ViT-L has 24 layers:
        // llava reads the second to last layer, so the converter drops the last one.
        let layers = (0..c.num_hidden_layers)
            .map(|index| ClipEncoderLayer::new(vs.pp(index.to_string()), c, dtype))
            .collect::<Result<Vec<_>>>()?;
        Ok(ClipEncoder { layers })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }
}

// https://github.com/huggingface/transformers/blob/f6fa0f0bf0796ac66f201f23bdb8585de1609add/src/transformers/models/clip/modeling_clip.py#L743
#[derive(Clone, Debug)]
pub struct ClipVisionTransformer {
    embeddings: ClipVisionEmbeddings,
    encoder: ClipEncoder,
    pre_layer_norm: candle_nn::LayerNorm,
}

impl ClipVisionTransformer {
    pub fn new(
        vs: quantized_var_builder::VarBuilder,
        c: &ClipVisionConfig,
        dtype: DType,
    ) -> Result<Self> {
        let embeddings = ClipVisionEmbeddings::new(vs.clone(), c, dtype)?;
        let pre_layer_norm = layer_norm(c.hidden_size, c.layer_norm_eps, vs.pp("pre_ln"), dtype)?;
        let encoder = ClipEncoder::new(vs.pp("blk"), c, dtype)?;
        // no post layernorm in the gguf, llava never uses the pooled output
        Ok(Self {
            embeddings,
            encoder,
            pre_layer_norm,
        })
    }

    /// Patch features of the last encoder layer kept in the gguf, without the class token.
    /// (batch, 3, 336, 336) -> (batch, 576, 1024)
    pub fn patch_features(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let hidden_states = pixel_values
            .apply(&self.embeddings)?
            .apply(&self.pre_layer_norm)?;
        let hidden_states = self.encoder.forward(&hidden_states)?;
        hidden_states.i((.., 1..))
    }
}

#[cfg(test)]
mod test {
    use super::{Activation, ClipVisionConfig};
    use crate::llava::quantized_llava::config::LLAVA_V1_5_CONFIG;
    use candle_core::{Device, Module, Tensor};

    #[test]
    fn test_num_patches_of_vit_l_336() {
        let config: &ClipVisionConfig = &LLAVA_V1_5_CONFIG.clip_vision_config;
        assert_eq!(config.num_patches(), 576);
    }

    #[test]
    fn test_quick_gelu() -> candle_core::Result<()> {
        let xs = Tensor::new(&[0f32, 1.0, -1.0], &Device::Cpu)?;
        let ys = Activation::QuickGelu.forward(&xs)?.to_vec1::<f32>()?;

        assert_eq!(ys[0], 0.0);
        // x * sigmoid(1.702 * x)
        assert!((ys[1] - 0.845796).abs() < 1e-4);
        assert!((ys[2] + 0.154204).abs() < 1e-4);
        Ok(())
    }
}

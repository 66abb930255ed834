use candle_core::{Module, Result, Tensor};
use candle_nn::{
    conv2d, embedding, layer_norm, linear, linear_no_bias, Activation, Conv2d, Conv2dConfig,
    LayerNorm, Linear, VarBuilder,
};
use candle_transformers::models::siglip::VisionConfig;

/// Number of encoder layers that produce `hidden_states[feature_layer]`.
///
/// Hidden states start with the embeddings output, so a tower with `n` layers
/// has `n + 1` of them and negative indices count from the end.
pub(crate) fn feature_layer_count(num_hidden_layers: usize, feature_layer: i64) -> Result<usize> {
    let num_states = num_hidden_layers as i64 + 1;
    let index = if feature_layer < 0 {
        num_states + feature_layer
    } else {
        feature_layer
    };
    if !(0..num_states).contains(&index) {
        candle_core::bail!(
            "vision feature layer {} out of range for {} layers",
            feature_layer,
            num_hidden_layers
        );
    }
    Ok(index as usize)
}

struct VisionEmbeddings {
    patch_embedding: Conv2d,
    position_embedding: Tensor,
}

impl VisionEmbeddings {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let patch_embedding = conv2d(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            Conv2dConfig {
                stride: cfg.patch_size,
                ..Default::default()
            },
            vb.pp("patch_embedding"),
        )?;
        let num_patches = (cfg.image_size / cfg.patch_size).pow(2);
        let position_embedding =
            embedding(num_patches, cfg.hidden_size, vb.pp("position_embedding"))?
                .embeddings()
                .clone();
        Ok(Self {
            patch_embedding,
            position_embedding,
        })
    }
}

impl Module for VisionEmbeddings {
    /// `(batch, channels, height, width)` to `(batch, patches, hidden)`.
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        pixel_values
            .apply(&self.patch_embedding)?
            .flatten_from(2)?
            .transpose(1, 2)?
            .broadcast_add(&self.position_embedding)
    }
}

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        let head_dim = hidden_size / cfg.num_attention_heads;
        Ok(Self {
            q_proj: linear(hidden_size, hidden_size, vb.pp("q_proj"))?,
            k_proj: linear(hidden_size, hidden_size, vb.pp("k_proj"))?,
            v_proj: linear(hidden_size, hidden_size, vb.pp("v_proj"))?,
            out_proj: linear(hidden_size, hidden_size, vb.pp("out_proj"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: (head_dim as f64).powf(-0.5),
        })
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = xs.dims3()?;
        let shape = (batch_size, seq_len, self.num_heads, self.head_dim);
        let heads = |proj: &Linear| -> Result<Tensor> {
            xs.apply(proj)?.reshape(shape)?.transpose(1, 2)?.contiguous()
        };
        let query = heads(&self.q_proj)?;
        let key = heads(&self.k_proj)?;
        let value = heads(&self.v_proj)?;

        let weights = (query.matmul(&key.t()?)? * self.scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&weights)?;
        weights
            .matmul(&value)?
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, ()))?
            .apply(&self.out_proj)
    }
}

struct Mlp {
    fc1: Linear,
    fc2: Linear,
    activation: Activation,
}

impl Mlp {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(cfg.hidden_size, cfg.intermediate_size, vb.pp("fc1"))?,
            fc2: linear(cfg.intermediate_size, cfg.hidden_size, vb.pp("fc2"))?,
            activation: cfg.hidden_act,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc1)?
            .apply(&self.activation)?
            .apply(&self.fc2)
    }
}

struct EncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: Attention,
    layer_norm2: LayerNorm,
    mlp: Mlp,
}

impl EncoderLayer {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            layer_norm1: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm1"))?,
            self_attn: Attention::new(cfg, vb.pp("self_attn"))?,
            layer_norm2: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layer_norm2"))?,
            mlp: Mlp::new(cfg, vb.pp("mlp"))?,
        })
    }
}

impl Module for EncoderLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let attended = (xs + xs.apply(&self.layer_norm1)?.apply(&self.self_attn)?)?;
        &attended + attended.apply(&self.layer_norm2)?.apply(&self.mlp)?
    }
}

/// SigLIP vision encoder cut at the hidden state the language model reads.
/// The post layernorm and pooling head are never used, so they are not
/// loaded.
pub(crate) struct VisionTower {
    embeddings: VisionEmbeddings,
    layers: Vec<EncoderLayer>,
}

impl VisionTower {
    pub fn load(cfg: &VisionConfig, feature_layer: i64, vb: VarBuilder) -> Result<Self> {
        let num_layers = feature_layer_count(cfg.num_hidden_layers, feature_layer)?;
        let embeddings = VisionEmbeddings::new(cfg, vb.pp("embeddings"))?;
        let vb_layers = vb.pp("encoder").pp("layers");
        let layers = (0..num_layers)
            .map(|i| EncoderLayer::new(cfg, vb_layers.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { embeddings, layers })
    }
}

impl Module for VisionTower {
    fn forward(&self, pixel_values: &Tensor) -> Result<Tensor> {
        let mut xs = self.embeddings.forward(pixel_values)?;
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?;
        }
        Ok(xs)
    }
}

/// Maps vision features into the text embedding space.
pub(crate) struct Projector {
    linear_1: Linear,
    activation: Activation,
    linear_2: Linear,
}

impl Projector {
    pub fn load(
        vision_hidden_size: usize,
        text_hidden_size: usize,
        activation: Activation,
        bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let layer = |in_dim, out_dim, vb: VarBuilder| {
            if bias {
                linear(in_dim, out_dim, vb)
            } else {
                linear_no_bias(in_dim, out_dim, vb)
            }
        };
        Ok(Self {
            linear_1: layer(vision_hidden_size, text_hidden_size, vb.pp("linear_1"))?,
            activation,
            linear_2: layer(text_hidden_size, text_hidden_size, vb.pp("linear_2"))?,
        })
    }
}

impl Module for Projector {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.linear_1)?
            .apply(&self.activation)?
            .apply(&self.linear_2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tiny_config() -> VisionConfig {
        serde_json::from_str(
            r#"{
                "hidden_size": 8,
                "intermediate_size": 16,
                "num_hidden_layers": 3,
                "num_attention_heads": 2,
                "image_size": 8,
                "patch_size": 4
            }"#,
        )
        .expect("vision config")
    }

    #[test]
    fn test_feature_layer_count() {
        assert_eq!(feature_layer_count(27, -2).expect("penultimate"), 26);
        assert_eq!(feature_layer_count(27, -1).expect("last"), 27);
        assert_eq!(feature_layer_count(27, 0).expect("embeddings"), 0);
        assert_eq!(feature_layer_count(27, 27).expect("last"), 27);
        assert!(feature_layer_count(27, 28).is_err());
        assert!(feature_layer_count(27, -29).is_err());
    }

    #[test]
    fn test_tower_and_projector_shapes() {
        let cfg = tiny_config();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);

        let tower = VisionTower::load(&cfg, -2, vb.pp("vision_tower")).expect("tower");
        assert_eq!(tower.layers.len(), 2);
        let projector = Projector::load(8, 12, Activation::Gelu, true, vb.pp("projector"))
            .expect("projector");

        let pixel_values = Tensor::zeros((1, 3, 8, 8), DType::F32, &Device::Cpu).expect("pixels");
        let features = tower.forward(&pixel_values).expect("features");
        assert_eq!(features.dims(), &[1, 4, 8]);
        let projected = projector.forward(&features).expect("projected");
        assert_eq!(projected.dims(), &[1, 4, 12]);
    }
}

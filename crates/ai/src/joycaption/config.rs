use crate::image_processor::ImageProcessor;
use candle_nn::Activation;
use candle_transformers::models::{
    llama::{Config as LlamaConfig, Llama3RopeConfig, LlamaEosToks},
    siglip::VisionConfig,
};
use serde::Deserialize;

/// `config.json` of a LLaVA checkpoint pairing a SigLIP vision tower with a
/// Llama text model. Saved checkpoints leave out values equal to the
/// transformers defaults, so every field falls back to those.
#[derive(Debug, Clone, Deserialize)]
pub struct JoyCaptionConfig {
    #[serde(default = "default_image_token_index")]
    pub image_token_index: u32,
    #[serde(default = "default_projector_hidden_act")]
    pub projector_hidden_act: Activation,
    #[serde(default = "default_true")]
    pub multimodal_projector_bias: bool,
    /// Index into the vision hidden states, embeddings output first.
    #[serde(default = "default_vision_feature_layer")]
    pub vision_feature_layer: i64,
    /// `default` drops the first patch feature, `full` keeps all of them.
    #[serde(default = "default_vision_feature_select_strategy")]
    pub vision_feature_select_strategy: String,
    pub text_config: TextConfig,
    pub vision_config: VisionConfig,
}

fn default_image_token_index() -> u32 {
    32000
}

fn default_projector_hidden_act() -> Activation {
    Activation::Gelu
}

fn default_true() -> bool {
    true
}

fn default_vision_feature_layer() -> i64 {
    -2
}

fn default_vision_feature_select_strategy() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_intermediate_size")]
    pub intermediate_size: usize,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_num_layers")]
    pub num_hidden_layers: usize,
    #[serde(default = "default_num_layers")]
    pub num_attention_heads: usize,
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_bos_token_id")]
    pub bos_token_id: Option<u32>,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: Option<LlamaEosToks>,
    pub rope_scaling: Option<Llama3RopeConfig>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub tie_word_embeddings: bool,
}

fn default_hidden_size() -> usize {
    4096
}

fn default_intermediate_size() -> usize {
    11008
}

fn default_vocab_size() -> usize {
    32000
}

fn default_num_layers() -> usize {
    32
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_rope_theta() -> f32 {
    10_000.
}

fn default_bos_token_id() -> Option<u32> {
    Some(1)
}

fn default_eos_token_id() -> Option<LlamaEosToks> {
    Some(LlamaEosToks::Single(2))
}

fn default_max_position_embeddings() -> usize {
    2048
}

impl TextConfig {
    pub fn to_llama_config(&self) -> LlamaConfig {
        LlamaConfig {
            hidden_size: self.hidden_size,
            intermediate_size: self.intermediate_size,
            vocab_size: self.vocab_size,
            num_hidden_layers: self.num_hidden_layers,
            num_attention_heads: self.num_attention_heads,
            num_key_value_heads: self.num_key_value_heads.unwrap_or(self.num_attention_heads),
            use_flash_attn: false,
            rms_norm_eps: self.rms_norm_eps,
            rope_theta: self.rope_theta,
            bos_token_id: self.bos_token_id,
            eos_token_id: self.eos_token_id.clone(),
            rope_scaling: self.rope_scaling.clone(),
            max_position_embeddings: self.max_position_embeddings,
            tie_word_embeddings: self.tie_word_embeddings,
        }
    }
}

/// The parts of `generation_config.json` that override the text config.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationConfig {
    pub eos_token_id: Option<LlamaEosToks>,
    pub pad_token_id: Option<u32>,
}

pub(crate) fn eos_token_ids(eos: Option<&LlamaEosToks>) -> Vec<u32> {
    match eos {
        Some(LlamaEosToks::Single(id)) => vec![*id],
        Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
        None => Vec::new(),
    }
}

/// `preprocessor_config.json` of a SigLIP image processor.
#[derive(Debug, Clone, Deserialize)]
pub struct SiglipPreprocessorConfig {
    #[serde(default = "default_image_size")]
    pub size: ImageSize,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_image_mean_std")]
    pub image_mean: Vec<f32>,
    #[serde(default = "default_image_mean_std")]
    pub image_std: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ImageSize {
    pub height: u32,
    pub width: u32,
}

fn default_image_size() -> ImageSize {
    ImageSize {
        height: 224,
        width: 224,
    }
}

fn default_rescale_factor() -> f32 {
    1. / 255.
}

fn default_image_mean_std() -> Vec<f32> {
    vec![0.5, 0.5, 0.5]
}

impl SiglipPreprocessorConfig {
    pub fn image_processor(&self) -> ImageProcessor {
        ImageProcessor {
            size: self.size.width,
            do_resize: true,
            do_center_crop: false,
            crop_size: self.size.width,
            do_rescale: self.do_rescale,
            rescale_factor: self.rescale_factor,
            do_normalize: self.do_normalize,
            image_mean: self.image_mean.clone(),
            image_std: self.image_std.clone(),
        }
    }
}

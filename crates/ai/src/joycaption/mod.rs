mod config;
mod vision;

use crate::{
    device::CandleDevices,
    hub::{ConfigCache, ModelFiles, CONFIG_FILE, GENERATION_CONFIG_FILE, PREPROCESSOR_CONFIG_FILE},
    image_processor::ImageProcessor,
    prompt::tokenize_with_image_token,
    sampling::{sample_tokens, StopTokens},
    CaptionBackend, CaptionGenerator, CaptionProcessor, ComputeDevice, GenerationParams,
};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config as LlamaConfig, Llama};
use config::{
    eos_token_ids, GenerationConfig, ImageSize, JoyCaptionConfig, SiglipPreprocessorConfig,
};
use file_downloader::FileDownload;
use image::DynamicImage;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::debug;
use vision::{Projector, VisionTower};

/// JoyCaption Beta One: a SigLIP so400m vision tower and Llama 3.1 8B in the
/// HuggingFace LLaVA layout.
pub const DEFAULT_MODEL_ID: &str = "fancyfeast/llama-joycaption-beta-one-hf-llava";

/// Fetches LLaVA checkpoints with a SigLIP vision tower and a Llama text model
/// from the hub and runs them with candle.
pub struct JoyCaptionBackend {
    files: ModelFiles,
    configs: ConfigCache<JoyCaptionConfigs>,
    devices: Arc<CandleDevices>,
}

struct JoyCaptionConfigs {
    model: JoyCaptionConfig,
    generation: GenerationConfig,
    preprocessor: SiglipPreprocessorConfig,
}

impl JoyCaptionConfigs {
    /// The generation config wins over the text config.
    fn eos_token_ids(&self) -> Vec<u32> {
        let eos = eos_token_ids(self.generation.eos_token_id.as_ref());
        if eos.is_empty() {
            eos_token_ids(self.model.text_config.eos_token_id.as_ref())
        } else {
            eos
        }
    }
}

impl JoyCaptionBackend {
    pub fn new(download: FileDownload) -> Self {
        Self {
            files: ModelFiles::new(download),
            configs: ConfigCache::default(),
            devices: Arc::new(CandleDevices::default()),
        }
    }

    async fn configs(&self, model_id: &str) -> anyhow::Result<Arc<JoyCaptionConfigs>> {
        if let Some(configs) = self.configs.get(model_id) {
            return Ok(configs);
        }

        let model: JoyCaptionConfig = self.files.read_json(model_id, CONFIG_FILE).await?;
        let generation = self
            .files
            .read_json(model_id, GENERATION_CONFIG_FILE)
            .await
            .unwrap_or_else(|e| {
                debug!("no generation config for {}: {}", model_id, e);
                GenerationConfig::default()
            });
        let preprocessor: SiglipPreprocessorConfig =
            self.files.read_json(model_id, PREPROCESSOR_CONFIG_FILE).await?;

        Ok(self.configs.insert(
            model_id,
            JoyCaptionConfigs {
                model,
                generation,
                preprocessor,
            },
        ))
    }
}

impl CaptionBackend for JoyCaptionBackend {
    type Processor = JoyCaptionProcessor;
    type Model = JoyCaptionModel;

    async fn load_processor(&self, model_id: &str) -> anyhow::Result<Self::Processor> {
        let configs = self.configs(model_id).await?;
        let tokenizer = self.files.tokenizer(model_id).await?;

        let image_token_id = configs.model.image_token_index;
        let Some(image_token) = tokenizer.id_to_token(image_token_id) else {
            anyhow::bail!("image token {} is not in the vocabulary", image_token_id);
        };
        let Some(eos_token_id) = configs.eos_token_ids().first().copied() else {
            anyhow::bail!("no eos token configured for {}", model_id);
        };
        let pad_token_id = tokenizer
            .get_padding()
            .map(|padding| padding.pad_id)
            .or(configs.generation.pad_token_id);

        Ok(JoyCaptionProcessor {
            image_processor: configs.preprocessor.image_processor(),
            image_size: configs.preprocessor.size,
            image_token,
            image_token_id,
            bos_token_id: configs.model.text_config.bos_token_id,
            eos_token_id,
            pad_token_id,
            tokenizer,
            devices: Arc::clone(&self.devices),
        })
    }

    async fn load_model(
        &self,
        model_id: &str,
        device: &ComputeDevice,
    ) -> anyhow::Result<Self::Model> {
        let configs = self.configs(model_id).await?;
        let config = &configs.model;
        let drop_first_feature = match config.vision_feature_select_strategy.as_str() {
            "default" => true,
            "full" => false,
            other => anyhow::bail!("unsupported vision feature select strategy {}", other),
        };
        let weights = self.files.weights(model_id).await?;

        let candle_device = self.devices.get(device)?;
        let dtype = device.preferred_dtype();
        let llama_config = config.text_config.to_llama_config();

        // weights go straight onto the selected device
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &candle_device)? };
        let vision_tower = VisionTower::load(
            &config.vision_config,
            config.vision_feature_layer,
            vb.pp("vision_tower").pp("vision_model"),
        )?;
        let projector = Projector::load(
            config.vision_config.hidden_size,
            config.text_config.hidden_size,
            config.projector_hidden_act,
            config.multimodal_projector_bias,
            vb.pp("multi_modal_projector"),
        )?;
        let llama = Llama::load(vb.pp("language_model"), &llama_config)?;

        Ok(JoyCaptionModel {
            vision_tower,
            projector,
            llama,
            llama_config,
            drop_first_feature,
            eos_token_ids: configs.eos_token_ids(),
            pad_token_id: configs.generation.pad_token_id,
            dtype,
            device: candle_device,
        })
    }

    fn release_device_memory(&self, device: &ComputeDevice) {
        self.devices.synchronize(device);
        debug!("released model buffers on {}", device);
    }
}

pub struct JoyCaptionInputs {
    input_ids: Tensor,
    prompt_ids: Vec<u32>,
    image_position: usize,
    pixel_values: Tensor,
}

pub struct JoyCaptionProcessor {
    tokenizer: Tokenizer,
    image_processor: ImageProcessor,
    image_size: ImageSize,
    image_token: String,
    image_token_id: u32,
    bos_token_id: Option<u32>,
    eos_token_id: u32,
    pad_token_id: Option<u32>,
    devices: Arc<CandleDevices>,
}

impl CaptionProcessor for JoyCaptionProcessor {
    type Inputs = JoyCaptionInputs;

    fn image_token(&self) -> Option<String> {
        Some(self.image_token.clone())
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    fn set_pad_token_id(&mut self, token_id: u32) {
        self.pad_token_id = Some(token_id);
    }

    fn encode(
        &self,
        image: &DynamicImage,
        text: &str,
        device: &ComputeDevice,
    ) -> anyhow::Result<Self::Inputs> {
        let candle_device = self.devices.get(device)?;

        let pixel_values = self
            .image_processor
            .process_fixed_size(image, self.image_size.width, self.image_size.height)?
            .to_device(&candle_device)?
            .to_dtype(device.preferred_dtype())?;

        let ids = tokenize_with_image_token(
            &self.tokenizer,
            text,
            &self.image_token,
            i64::from(self.image_token_id),
            self.bos_token_id.map(i64::from).unwrap_or(-1),
        )?;
        let prompt_ids = ids.iter().map(|id| *id as u32).collect::<Vec<_>>();
        let image_position = single_image_position(&prompt_ids, self.image_token_id)?;
        let input_ids = Tensor::new(prompt_ids.as_slice(), &candle_device)?.unsqueeze(0)?;

        Ok(JoyCaptionInputs {
            input_ids,
            prompt_ids,
            image_position,
            pixel_values,
        })
    }

    fn input_len(inputs: &Self::Inputs) -> usize {
        inputs.prompt_ids.len()
    }

    fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        self.tokenizer
            .decode(token_ids, skip_special_tokens)
            .map_err(anyhow::Error::msg)
    }
}

/// The image features replace exactly one placeholder.
fn single_image_position(prompt_ids: &[u32], image_token_id: u32) -> anyhow::Result<usize> {
    let mut positions = prompt_ids
        .iter()
        .enumerate()
        .filter(|(_, id)| **id == image_token_id)
        .map(|(position, _)| position);
    match (positions.next(), positions.next()) {
        (Some(position), None) => Ok(position),
        (None, _) => anyhow::bail!("prompt has no image token"),
        (Some(_), Some(_)) => anyhow::bail!("prompt has more than one image token"),
    }
}

/// `(1, len, hidden)` text embeddings with the token at `position` replaced by
/// `(1, patches, hidden)` image features.
fn splice_image_features(
    text_embeds: &Tensor,
    image_features: &Tensor,
    position: usize,
) -> candle_core::Result<Tensor> {
    let (_, seq_len, _) = text_embeds.dims3()?;
    let mut parts = Vec::with_capacity(3);
    if position > 0 {
        parts.push(text_embeds.narrow(1, 0, position)?);
    }
    parts.push(image_features.clone());
    if position + 1 < seq_len {
        parts.push(text_embeds.narrow(1, position + 1, seq_len - position - 1)?);
    }
    Tensor::cat(&parts, 1)
}

pub struct JoyCaptionModel {
    vision_tower: VisionTower,
    projector: Projector,
    llama: Llama,
    llama_config: LlamaConfig,
    drop_first_feature: bool,
    eos_token_ids: Vec<u32>,
    pad_token_id: Option<u32>,
    dtype: DType,
    device: Device,
}

impl JoyCaptionModel {
    fn image_features(&self, pixel_values: &Tensor) -> candle_core::Result<Tensor> {
        let features = self.vision_tower.forward(pixel_values)?;
        let features = if self.drop_first_feature {
            let (_, num_patches, _) = features.dims3()?;
            features.narrow(1, 1, num_patches - 1)?
        } else {
            features
        };
        self.projector.forward(&features)
    }
}

impl CaptionGenerator for JoyCaptionModel {
    type Inputs = JoyCaptionInputs;

    fn set_pad_token_id(&mut self, token_id: u32) {
        self.pad_token_id = Some(token_id);
    }

    #[tracing::instrument(level = "info", name = "JoyCaptionModel::generate", skip_all)]
    fn generate(
        &mut self,
        inputs: &Self::Inputs,
        params: &GenerationParams,
    ) -> anyhow::Result<Vec<u32>> {
        let stop_tokens = StopTokens::new(
            self.eos_token_ids.iter().copied(),
            params.pad_token_id.or(self.pad_token_id),
        );
        debug!(
            "stop tokens: {:?}, max new tokens: {}",
            stop_tokens, params.max_new_tokens
        );

        let image_features = self.image_features(&inputs.pixel_values)?;
        let text_embeds = self.llama.embed(&inputs.input_ids)?;
        let input_embeds =
            splice_image_features(&text_embeds, &image_features, inputs.image_position)?;

        let mut cache = Cache::new(true, self.dtype, &self.llama_config, &self.device)?;
        let llama = &self.llama;
        let device = &self.device;
        sample_tokens(
            input_embeds,
            &inputs.prompt_ids,
            params,
            &stop_tokens,
            |input, index_pos| llama.forward_input_embed(input, index_pos, &mut cache),
            |token_id| {
                let next_token = Tensor::new(&[token_id], device)?;
                llama.embed(&next_token)?.unsqueeze(0)
            },
        )
    }
}

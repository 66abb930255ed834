use crate::{
    device::CandleDevices,
    hub::{ConfigCache, ModelFiles, CONFIG_FILE, GENERATION_CONFIG_FILE, PREPROCESSOR_CONFIG_FILE},
    image_processor::{ImageProcessor, PreProcessorConfig},
    prompt::tokenize_with_image_token,
    sampling::{sample_tokens, StopTokens},
    CaptionBackend, CaptionGenerator, CaptionProcessor, ComputeDevice, GenerationParams,
    DEFAULT_IMAGE_TOKEN,
};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::{
    llama::{Cache, Config as LlamaConfig},
    llava::{
        config::{HFGenerationConfig, HFLLaVAConfig, HFPreProcessorConfig, LLaVAConfig},
        LLaVA,
    },
};
use file_downloader::FileDownload;
use image::{DynamicImage, GenericImageView};
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::debug;

/// A LLaVA checkpoint with a CLIP vision tower in HuggingFace layout.
pub const DEFAULT_MODEL_ID: &str = "llava-hf/llava-v1.6-vicuna-7b-hf";

/// Fetches LLaVA checkpoints from the hub and runs them with candle.
pub struct LlavaBackend {
    files: ModelFiles,
    configs: ConfigCache<LlavaConfigs>,
    devices: Arc<CandleDevices>,
}

struct LlavaConfigs {
    hf: HFLLaVAConfig,
    llava: LLaVAConfig,
    preprocessor: PreProcessorConfig,
}

impl LlavaBackend {
    pub fn new(download: FileDownload) -> Self {
        Self {
            files: ModelFiles::new(download),
            configs: ConfigCache::default(),
            devices: Arc::new(CandleDevices::default()),
        }
    }

    async fn configs(&self, model_id: &str) -> anyhow::Result<Arc<LlavaConfigs>> {
        if let Some(configs) = self.configs.get(model_id) {
            return Ok(configs);
        }

        let hf: HFLLaVAConfig = self.files.read_json(model_id, CONFIG_FILE).await?;
        let generation: HFGenerationConfig =
            self.files.read_json(model_id, GENERATION_CONFIG_FILE).await?;
        let preprocessor_json: serde_json::Value =
            self.files.read_json(model_id, PREPROCESSOR_CONFIG_FILE).await?;
        let hf_preprocessor: HFPreProcessorConfig =
            serde_json::from_value(preprocessor_json.clone())?;
        let preprocessor: PreProcessorConfig = serde_json::from_value(preprocessor_json)?;

        let llava = hf.to_llava_config(&generation, &hf_preprocessor);
        Ok(self.configs.insert(
            model_id,
            LlavaConfigs {
                hf,
                llava,
                preprocessor,
            },
        ))
    }
}

impl CaptionBackend for LlavaBackend {
    type Processor = LlavaProcessor;
    type Model = LlavaModel;

    async fn load_processor(&self, model_id: &str) -> anyhow::Result<Self::Processor> {
        let configs = self.configs(model_id).await?;
        let tokenizer = self.files.tokenizer(model_id).await?;

        let image_token_id = configs.llava.image_token_index;
        let image_token = u32::try_from(image_token_id)
            .ok()
            .and_then(|id| tokenizer.id_to_token(id));
        let pad_token_id = tokenizer.get_padding().map(|padding| padding.pad_id);

        Ok(LlavaProcessor {
            image_processor: ImageProcessor::from_hf_preprocessor_config(&configs.preprocessor),
            aspect_ratio: configs.llava.image_aspect_ratio.clone(),
            grid_pinpoints: configs.llava.image_grid_pinpoints.clone(),
            image_token,
            image_token_id: image_token_id as i64,
            bos_token_id: configs.llava.bos_token_id as i64,
            eos_token_id: configs.llava.eos_token_id as u32,
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
        let weights = self.files.weights(model_id).await?;

        let candle_device = self.devices.get(device)?;
        let dtype = device.preferred_dtype();
        let llama_config = configs.llava.to_llama_config();
        let clip_vision_config = configs.hf.to_clip_vision_config();

        // weights go straight onto the selected device
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &candle_device)? };
        let llava = LLaVA::load(vb, &configs.llava, Some(clip_vision_config))?;

        Ok(LlavaModel {
            llava,
            llama_config,
            eos_token_id: configs.llava.eos_token_id as u32,
            pad_token_id: configs.llava.pad_token_id.try_into().ok(),
            dtype,
            device: candle_device,
        })
    }

    fn release_device_memory(&self, device: &ComputeDevice) {
        self.devices.synchronize(device);
        debug!("released model buffers on {}", device);
    }
}

pub struct LlavaInputs {
    input_ids: Tensor,
    prompt_len: usize,
    pixel_values: Tensor,
    image_size: (u32, u32),
    prompt_ids: Vec<u32>,
}

pub struct LlavaProcessor {
    tokenizer: Tokenizer,
    image_processor: ImageProcessor,
    aspect_ratio: String,
    grid_pinpoints: Vec<(u32, u32)>,
    image_token: Option<String>,
    image_token_id: i64,
    bos_token_id: i64,
    eos_token_id: u32,
    pad_token_id: Option<u32>,
    devices: Arc<CandleDevices>,
}

impl CaptionProcessor for LlavaProcessor {
    type Inputs = LlavaInputs;

    fn image_token(&self) -> Option<String> {
        self.image_token.clone()
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
            .process(image, &self.aspect_ratio, &self.grid_pinpoints)?
            .to_device(&candle_device)?
            .to_dtype(device.preferred_dtype())?;

        let image_token = self.image_token.as_deref().unwrap_or(DEFAULT_IMAGE_TOKEN);
        let ids = tokenize_with_image_token(
            &self.tokenizer,
            text,
            image_token,
            self.image_token_id,
            self.bos_token_id,
        )?;
        let prompt_len = ids.len();
        let prompt_ids = ids.iter().map(|id| *id as u32).collect();
        let input_ids = Tensor::from_vec(ids, (1, prompt_len), &candle_device)?;

        Ok(LlavaInputs {
            input_ids,
            prompt_len,
            pixel_values,
            image_size: image.dimensions(),
            prompt_ids,
        })
    }

    fn input_len(inputs: &Self::Inputs) -> usize {
        inputs.prompt_len
    }

    fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        self.tokenizer
            .decode(token_ids, skip_special_tokens)
            .map_err(anyhow::Error::msg)
    }
}

pub struct LlavaModel {
    llava: LLaVA,
    llama_config: LlamaConfig,
    eos_token_id: u32,
    pad_token_id: Option<u32>,
    dtype: DType,
    device: Device,
}

impl CaptionGenerator for LlavaModel {
    type Inputs = LlavaInputs;

    fn set_pad_token_id(&mut self, token_id: u32) {
        self.pad_token_id = Some(token_id);
    }

    #[tracing::instrument(level = "info", name = "LlavaModel::generate", skip_all)]
    fn generate(
        &mut self,
        inputs: &Self::Inputs,
        params: &GenerationParams,
    ) -> anyhow::Result<Vec<u32>> {
        let stop_tokens = StopTokens::new(
            [self.eos_token_id],
            params.pad_token_id.or(self.pad_token_id),
        );
        debug!(
            "stop tokens: {:?}, max new tokens: {}",
            stop_tokens, params.max_new_tokens
        );

        let input_embeds = self.llava.prepare_inputs_labels_for_multimodal(
            &inputs.input_ids,
            &[inputs.pixel_values.clone()],
            &[inputs.image_size],
        )?;

        let mut cache = Cache::new(true, self.dtype, &self.llama_config, &self.device)?;
        let llava = &self.llava;
        let device = &self.device;
        sample_tokens(
            input_embeds,
            &inputs.prompt_ids,
            params,
            &stop_tokens,
            |input, index_pos| llava.forward(input, index_pos, &mut cache),
            |token_id| {
                let next_token = Tensor::new(&[token_id], device)?;
                llava.llama.embed(&next_token)?.unsqueeze(0)
            },
        )
    }
}

use crate::{CaptionBackend, CaptionProcessor, ComputeDevice};
use crate::traits::CaptionGenerator;
use tracing::{error, info};

/// Processor and model are loaded and dropped together.
pub(crate) struct LoadedCaptioner<B: CaptionBackend> {
    pub processor: B::Processor,
    pub model: B::Model,
}

/// Owned by the session thread, so loading, unloading and generation never
/// interleave.
pub(crate) struct ModelLoader<B: CaptionBackend> {
    model: Option<LoadedCaptioner<B>>,
    backend: B,
    model_id: String,
    device: ComputeDevice,
}

impl<B: CaptionBackend> ModelLoader<B> {
    pub fn new(backend: B, model_id: String, device: ComputeDevice) -> Self {
        Self {
            model: None,
            backend,
            model_id,
            device,
        }
    }

    /// Loads the model if it is absent and hands out the loaded pair.
    pub async fn load(&mut self) -> anyhow::Result<&mut LoadedCaptioner<B>> {
        if self.model.is_none() {
            info!("loading caption model {}", self.model_id);
            let captioner = self.create().await.inspect_err(|e| {
                error!("failed to load model {}: {:?}", self.model_id, e);
            })?;
            self.model = Some(captioner);
            info!("model loaded successfully on {}", self.device);
        }

        self.model
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no valid model"))
    }

    async fn create(&self) -> anyhow::Result<LoadedCaptioner<B>> {
        info!("loading processor...");
        let mut processor = self.backend.load_processor(&self.model_id).await?;

        info!("loading model...");
        let mut model = self.backend.load_model(&self.model_id, &self.device).await?;

        if processor.pad_token_id().is_none() {
            let eos_token_id = processor.eos_token_id();
            info!("no pad token defined, using eos token {}", eos_token_id);
            processor.set_pad_token_id(eos_token_id);
            model.set_pad_token_id(eos_token_id);
        }

        Ok(LoadedCaptioner { processor, model })
    }

    pub fn offload(&mut self) {
        if let Some(captioner) = self.model.take() {
            info!("unloading model from memory...");
            drop(captioner);
            self.backend.release_device_memory(&self.device);
            info!("model unloaded successfully");
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }
}

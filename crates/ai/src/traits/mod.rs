mod image_caption;

use crate::ComputeDevice;
pub use image_caption::*;
use image::DynamicImage;
use std::future::Future;

/// Turns images and text into model inputs and token ids back into text.
pub trait CaptionProcessor {
    type Inputs;

    /// Image placeholder from the processor configuration, if it names one.
    fn image_token(&self) -> Option<String>;

    fn pad_token_id(&self) -> Option<u32>;

    fn eos_token_id(&self) -> u32;

    fn set_pad_token_id(&mut self, token_id: u32);

    /// Encodes the image and prompt and places every tensor on `device`.
    fn encode(
        &self,
        image: &DynamicImage,
        text: &str,
        device: &ComputeDevice,
    ) -> anyhow::Result<Self::Inputs>;

    /// Length of the prompt prefix that [`CaptionGenerator::generate`] echoes back.
    fn input_len(inputs: &Self::Inputs) -> usize;

    fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String>;
}

pub trait CaptionGenerator {
    type Inputs;

    fn set_pad_token_id(&mut self, token_id: u32);

    /// Returns the prompt ids followed by the newly generated ids.
    fn generate(
        &mut self,
        inputs: &Self::Inputs,
        params: &GenerationParams,
    ) -> anyhow::Result<Vec<u32>>;
}

/// A pretrained image-to-text capability addressed by a model identifier.
///
/// The backend is moved onto the thread that owns the loaded model, so the
/// processor and model themselves need not be `Send`.
pub trait CaptionBackend: Send + 'static {
    type Processor: CaptionProcessor + 'static;
    type Model: CaptionGenerator<Inputs = <Self::Processor as CaptionProcessor>::Inputs> + 'static;

    fn load_processor(
        &self,
        model_id: &str,
    ) -> impl Future<Output = anyhow::Result<Self::Processor>>;

    fn load_model(
        &self,
        model_id: &str,
        device: &ComputeDevice,
    ) -> impl Future<Output = anyhow::Result<Self::Model>>;

    /// Called after both handles are dropped. Waits for pending device work.
    fn release_device_memory(&self, device: &ComputeDevice);
}

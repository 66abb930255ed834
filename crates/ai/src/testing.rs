//! A scripted in-memory caption backend for exercising the session lifecycle
//! without model weights.

use crate::{
    CaptionBackend, CaptionGenerator, CaptionProcessor, ComputeDevice, GenerationParams,
};
use image::{ColorType, DynamicImage, GenericImageView};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

#[derive(Default)]
struct ScriptState {
    loads: AtomicUsize,
    releases: AtomicUsize,
    generations: AtomicUsize,
    last_prompt: Mutex<Option<String>>,
    last_color: Mutex<Option<ColorType>>,
    model_pad_token_id: Mutex<Option<u32>>,
}

/// Answers every image with a fixed caption.
///
/// Token ids are the bytes of the text, so the prompt echo and the decoded
/// caption are easy to inspect.
#[derive(Clone)]
pub struct ScriptedBackend {
    caption: String,
    image_token: Option<String>,
    fail_load: bool,
    fail_width: Option<u32>,
    state: Arc<ScriptState>,
}

impl ScriptedBackend {
    pub const EOS_TOKEN_ID: u32 = 0;

    pub fn new(caption: impl Into<String>) -> Self {
        Self {
            caption: caption.into(),
            image_token: None,
            fail_load: false,
            fail_width: None,
            state: Arc::new(ScriptState::default()),
        }
    }

    pub fn with_image_token(mut self, token: impl Into<String>) -> Self {
        self.image_token = Some(token.into());
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    /// Generation fails for images of this width.
    pub fn failing_on_width(mut self, width: u32) -> Self {
        self.fail_width = Some(width);
        self
    }

    pub fn loads(&self) -> usize {
        self.state.loads.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }

    pub fn generations(&self) -> usize {
        self.state.generations.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        lock(&self.state.last_prompt).clone()
    }

    pub fn last_color(&self) -> Option<ColorType> {
        *lock(&self.state.last_color)
    }

    pub fn model_pad_token_id(&self) -> Option<u32> {
        *lock(&self.state.model_pad_token_id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct ScriptedInputs {
    prompt_ids: Vec<u32>,
    width: u32,
}

pub struct ScriptedProcessor {
    image_token: Option<String>,
    pad_token_id: Option<u32>,
    state: Arc<ScriptState>,
}

impl CaptionProcessor for ScriptedProcessor {
    type Inputs = ScriptedInputs;

    fn image_token(&self) -> Option<String> {
        self.image_token.clone()
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    fn eos_token_id(&self) -> u32 {
        ScriptedBackend::EOS_TOKEN_ID
    }

    fn set_pad_token_id(&mut self, token_id: u32) {
        self.pad_token_id = Some(token_id);
    }

    fn encode(
        &self,
        image: &DynamicImage,
        text: &str,
        _device: &ComputeDevice,
    ) -> anyhow::Result<Self::Inputs> {
        *lock(&self.state.last_prompt) = Some(text.to_string());
        *lock(&self.state.last_color) = Some(image.color());
        Ok(ScriptedInputs {
            prompt_ids: text.bytes().map(u32::from).collect(),
            width: image.dimensions().0,
        })
    }

    fn input_len(inputs: &Self::Inputs) -> usize {
        inputs.prompt_ids.len()
    }

    fn decode(&self, token_ids: &[u32], skip_special_tokens: bool) -> anyhow::Result<String> {
        let bytes = token_ids
            .iter()
            .filter(|id| !(skip_special_tokens && **id == ScriptedBackend::EOS_TOKEN_ID))
            .map(|id| u8::try_from(*id))
            .collect::<Result<Vec<u8>, _>>()?;
        Ok(String::from_utf8(bytes)?)
    }
}

pub struct ScriptedModel {
    caption: String,
    fail_width: Option<u32>,
    state: Arc<ScriptState>,
}

impl CaptionGenerator for ScriptedModel {
    type Inputs = ScriptedInputs;

    fn set_pad_token_id(&mut self, token_id: u32) {
        *lock(&self.state.model_pad_token_id) = Some(token_id);
    }

    fn generate(
        &mut self,
        inputs: &Self::Inputs,
        params: &GenerationParams,
    ) -> anyhow::Result<Vec<u32>> {
        if self.fail_width == Some(inputs.width) {
            anyhow::bail!("device out of memory");
        }
        self.state.generations.fetch_add(1, Ordering::SeqCst);

        let mut output_ids = inputs.prompt_ids.clone();
        let caption = format!(" {} \n", self.caption);
        output_ids.extend(
            caption
                .bytes()
                .map(u32::from)
                .take(params.max_new_tokens),
        );
        output_ids.push(ScriptedBackend::EOS_TOKEN_ID);
        Ok(output_ids)
    }
}

impl CaptionBackend for ScriptedBackend {
    type Processor = ScriptedProcessor;
    type Model = ScriptedModel;

    async fn load_processor(&self, model_id: &str) -> anyhow::Result<Self::Processor> {
        if self.fail_load {
            anyhow::bail!("model {} not found", model_id);
        }
        Ok(ScriptedProcessor {
            image_token: self.image_token.clone(),
            pad_token_id: None,
            state: Arc::clone(&self.state),
        })
    }

    async fn load_model(
        &self,
        _model_id: &str,
        _device: &ComputeDevice,
    ) -> anyhow::Result<Self::Model> {
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedModel {
            caption: self.caption.clone(),
            fail_width: self.fail_width,
            state: Arc::clone(&self.state),
        })
    }

    fn release_device_memory(&self, _device: &ComputeDevice) {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
    }
}

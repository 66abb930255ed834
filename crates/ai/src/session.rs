use crate::{
    loader::{LoadedCaptioner, ModelLoader},
    CaptionBackend, CaptionGenerator, CaptionProcessor, ComputeDevice, GenerationParams,
    ImageCaptionOutput, DEFAULT_IMAGE_TOKEN,
};
use image::{ColorType, DynamicImage};
use std::time::Duration;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, error, info, warn};

const REQUEST_BUFFER: usize = 512;

enum SessionRequest {
    Load(oneshot::Sender<anyhow::Result<()>>),
    Unload(oneshot::Sender<()>),
    IsLoaded(oneshot::Sender<bool>),
    ResetIdleTimer,
    CancelIdleTimer,
    Caption {
        image: DynamicImage,
        prompt: String,
        reply: oneshot::Sender<anyhow::Result<ImageCaptionOutput>>,
    },
}

/// Owns one lazily loaded caption model.
///
/// The model lives on a dedicated thread and every request is handled there
/// in order, so loading, generation and the idle unload never overlap. The
/// model is loaded on first use and unloaded again once no caption has been
/// requested for `idle_timeout`. If the timer fires between two captions the
/// next call simply loads the model again. Dropping the session unloads the
/// model and stops the thread.
pub struct CaptionSession {
    model_id: String,
    tx: mpsc::Sender<SessionRequest>,
}

impl CaptionSession {
    pub fn new<B: CaptionBackend>(
        backend: B,
        model_id: impl Into<String>,
        idle_timeout: Duration,
    ) -> anyhow::Result<Self> {
        Self::with_device(backend, model_id, idle_timeout, ComputeDevice::detect())
    }

    pub fn with_device<B: CaptionBackend>(
        backend: B,
        model_id: impl Into<String>,
        idle_timeout: Duration,
        device: ComputeDevice,
    ) -> anyhow::Result<Self> {
        let model_id = model_id.into();
        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let worker_model_id = model_id.clone();

        std::thread::Builder::new()
            .name("caption-model".to_string())
            .spawn(move || {
                let worker = SessionWorker {
                    loader: ModelLoader::new(backend, worker_model_id, device),
                    device,
                    idle_timeout,
                    idle_deadline: None,
                };
                let local = tokio::task::LocalSet::new();
                local.spawn_local(worker.run(rx));
                rt.block_on(local);
            })?;

        Ok(Self { model_id, tx })
    }

    #[tracing::instrument(name = "CaptionSession::load", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn load(&self) -> anyhow::Result<()> {
        self.request(SessionRequest::Load).await?
    }

    pub async fn unload(&self) {
        if let Err(e) = self.request(SessionRequest::Unload).await {
            warn!("failed to unload model {}: {:?}", self.model_id, e);
        }
    }

    pub async fn is_loaded(&self) -> bool {
        self.request(SessionRequest::IsLoaded)
            .await
            .unwrap_or(false)
    }

    /// Replaces the pending unload, if any, with one `idle_timeout` from now.
    /// Every caption does this on its own.
    pub async fn reset_idle_timer(&self) {
        self.notify(SessionRequest::ResetIdleTimer).await
    }

    /// Drops the pending unload, if any. The next caption arms it again.
    pub async fn cancel_idle_timer(&self) {
        self.notify(SessionRequest::CancelIdleTimer).await
    }

    /// Unloads the model and cancels any pending idle timer.
    pub async fn shutdown(&self) {
        info!("unloading model...");
        self.unload().await;
        self.cancel_idle_timer().await;
    }

    /// Loads the model if needed and captions `image`. The idle window
    /// restarts once the caption is done.
    #[tracing::instrument(name = "CaptionSession::generate_caption", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn generate_caption(
        &self,
        image: DynamicImage,
        prompt: &str,
    ) -> anyhow::Result<ImageCaptionOutput> {
        let prompt = prompt.to_string();
        self.request(|reply| SessionRequest::Caption {
            image,
            prompt,
            reply,
        })
        .await?
    }

    async fn notify(&self, request: SessionRequest) {
        if self.tx.send(request).await.is_err() {
            warn!("caption session for {} is closed", self.model_id);
        }
    }

    async fn request<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> SessionRequest,
    ) -> anyhow::Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(request(reply))
            .await
            .map_err(|e| anyhow::anyhow!("failed to send request: {}", e))?;
        rx.await
            .map_err(|e| anyhow::anyhow!("failed to receive result: {:?}", e))
    }
}

struct SessionWorker<B: CaptionBackend> {
    loader: ModelLoader<B>,
    device: ComputeDevice,
    idle_timeout: Duration,
    idle_deadline: Option<Instant>,
}

impl<B: CaptionBackend> SessionWorker<B> {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionRequest>) {
        loop {
            let deadline = self.idle_deadline;
            let request = match deadline {
                Some(deadline) => tokio::select! {
                    biased;
                    request = rx.recv() => request,
                    _ = tokio::time::sleep_until(deadline) => {
                        debug!("no caption requested for {:?}, offload model", self.idle_timeout);
                        self.idle_deadline = None;
                        self.loader.offload();
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            let Some(request) = request else {
                debug!("caption session closed, offload model");
                self.loader.offload();
                break;
            };

            self.handle(request).await;
        }
    }

    async fn handle(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Load(reply) => {
                let result = self.loader.load().await.map(|_| ());
                if reply.send(result).is_err() {
                    error!("failed to send load result");
                }
            }
            SessionRequest::Unload(reply) => {
                self.loader.offload();
                if reply.send(()).is_err() {
                    error!("failed to send unload result");
                }
            }
            SessionRequest::IsLoaded(reply) => {
                if reply.send(self.loader.is_loaded()).is_err() {
                    error!("failed to send load state");
                }
            }
            SessionRequest::ResetIdleTimer => self.reset_idle_timer(),
            SessionRequest::CancelIdleTimer => {
                self.idle_deadline = None;
            }
            SessionRequest::Caption {
                image,
                prompt,
                reply,
            } => {
                let result = self.caption(image, &prompt).await;
                if reply.send(result).is_err() {
                    error!("failed to send caption");
                }
            }
        }
    }

    async fn caption(
        &mut self,
        image: DynamicImage,
        prompt: &str,
    ) -> anyhow::Result<ImageCaptionOutput> {
        let device = self.device;
        let captioner = self.loader.load().await?;
        let result = generate(captioner, &device, image, prompt);
        self.reset_idle_timer();
        result
    }

    fn reset_idle_timer(&mut self) {
        if self.loader.is_loaded() {
            self.idle_deadline = Some(Instant::now() + self.idle_timeout);
        }
    }
}

fn generate<B: CaptionBackend>(
    captioner: &mut LoadedCaptioner<B>,
    device: &ComputeDevice,
    image: DynamicImage,
    prompt: &str,
) -> anyhow::Result<ImageCaptionOutput> {
    let image = match image.color() {
        ColorType::Rgb8 => image,
        _ => DynamicImage::ImageRgb8(image.to_rgb8()),
    };

    info!("original prompt: {}", prompt);
    let image_token = captioner
        .processor
        .image_token()
        .unwrap_or_else(|| DEFAULT_IMAGE_TOKEN.to_string());
    debug!("image token: {}", image_token);

    let prompt_text = format!("{image_token}\n{prompt}");
    debug!("formatted prompt: {:?}", prompt_text);

    let inputs = captioner.processor.encode(&image, &prompt_text, device)?;

    let params = GenerationParams {
        pad_token_id: captioner.processor.pad_token_id(),
        ..Default::default()
    };

    info!("generating caption...");
    let output_ids = captioner.model.generate(&inputs, &params)?;

    let input_len = <B::Processor as CaptionProcessor>::input_len(&inputs);
    let generated_ids = output_ids.get(input_len..).unwrap_or_default();
    let caption = captioner
        .processor
        .decode(generated_ids, true)?
        .trim()
        .to_string();

    info!("generated caption: {}", caption);
    Ok(caption)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use image::{ImageBuffer, Rgba};
    use std::sync::Arc;

    const IDLE: Duration = Duration::from_secs(5 * 60);

    fn session(backend: &ScriptedBackend, idle_timeout: Duration) -> CaptionSession {
        CaptionSession::with_device(backend.clone(), "test/model", idle_timeout, ComputeDevice::Cpu)
            .expect("session")
    }

    fn rgb_image(width: u32) -> DynamicImage {
        DynamicImage::new_rgb8(width, 4)
    }

    async fn wait_until(check: impl Fn() -> bool) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[test_log::test(tokio::test)]
    async fn test_load_and_unload() {
        let backend = ScriptedBackend::new("a cat");
        let session = session(&backend, IDLE);
        assert!(!session.is_loaded().await);

        session.load().await.expect("load");
        assert!(session.is_loaded().await);
        session.load().await.expect("second load");
        assert_eq!(backend.loads(), 1);

        session.unload().await;
        assert!(!session.is_loaded().await);
        assert_eq!(backend.releases(), 1);

        // unloading twice is a no-op
        session.unload().await;
        assert!(!session.is_loaded().await);
        assert_eq!(backend.releases(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_pad_token_falls_back_to_eos() {
        let backend = ScriptedBackend::new("a cat");
        let session = session(&backend, IDLE);
        session.load().await.expect("load");
        assert_eq!(backend.model_pad_token_id(), Some(ScriptedBackend::EOS_TOKEN_ID));
    }

    #[test_log::test(tokio::test)]
    async fn test_failed_load_leaves_session_unloaded() {
        let backend = ScriptedBackend::new("a cat").failing_load();
        let session = session(&backend, IDLE);
        assert!(session.load().await.is_err());
        assert!(!session.is_loaded().await);
        assert!(session.generate_caption(rgb_image(4), "describe").await.is_err());
        assert!(!session.is_loaded().await);
    }

    #[test_log::test(tokio::test)]
    async fn test_generate_caption() {
        let backend = ScriptedBackend::new("a cat on a mat");
        let session = session(&backend, IDLE);

        let caption = session
            .generate_caption(rgb_image(4), "Describe this image.")
            .await
            .expect("caption");

        assert_eq!(caption, "a cat on a mat");
        assert_eq!(backend.last_prompt().as_deref(), Some("<image>\nDescribe this image."));
        assert!(session.is_loaded().await);
        session.shutdown().await;
        assert!(!session.is_loaded().await);
    }

    #[test_log::test(tokio::test)]
    async fn test_generate_caption_uses_processor_image_token() {
        let backend = ScriptedBackend::new("a dog").with_image_token("<|image|>");
        let session = session(&backend, IDLE);
        session
            .generate_caption(rgb_image(4), "caption")
            .await
            .expect("caption");
        assert_eq!(backend.last_prompt().as_deref(), Some("<|image|>\ncaption"));
    }

    #[test_log::test(tokio::test)]
    async fn test_generate_caption_converts_to_rgb() {
        let backend = ScriptedBackend::new("a dog");
        let session = session(&backend, IDLE);
        let rgba = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(3, 3, Rgba([1, 2, 3, 4])));
        session.generate_caption(rgba, "caption").await.expect("caption");
        assert_eq!(backend.last_color(), Some(ColorType::Rgb8));
    }

    #[test_log::test(tokio::test)]
    async fn test_generation_error_is_propagated() {
        let backend = ScriptedBackend::new("a cat").failing_on_width(7);
        let session = session(&backend, IDLE);
        let result = session.generate_caption(rgb_image(7), "caption").await;
        assert!(result.is_err());
        assert!(session.generate_caption(rgb_image(4), "caption").await.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn test_idle_timer_unloads_model() {
        let idle = Duration::from_millis(200);
        let backend = ScriptedBackend::new("a cat");
        let session = session(&backend, idle);
        session.generate_caption(rgb_image(4), "caption").await.expect("caption");
        assert!(session.is_loaded().await);

        assert!(wait_until(|| backend.releases() == 1).await);
        assert!(!session.is_loaded().await);

        // the next caption loads the model again
        session.generate_caption(rgb_image(4), "caption").await.expect("caption");
        assert!(session.is_loaded().await);
        assert_eq!(backend.loads(), 2);
    }

    #[test_log::test(tokio::test)]
    async fn test_each_caption_restarts_idle_window() {
        let idle = Duration::from_millis(400);
        let backend = ScriptedBackend::new("a cat");
        let session = session(&backend, idle);

        for _ in 0..6 {
            session.generate_caption(rgb_image(4), "caption").await.expect("caption");
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(session.is_loaded().await);
        }
        assert_eq!(backend.loads(), 1);
        assert_eq!(backend.releases(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_explicit_load_does_not_arm_idle_timer() {
        let idle = Duration::from_millis(50);
        let backend = ScriptedBackend::new("a cat");
        let session = session(&backend, idle);
        session.generate_caption(rgb_image(4), "caption").await.expect("caption");
        session.shutdown().await;
        assert_eq!(backend.releases(), 1);

        session.load().await.expect("load");
        tokio::time::sleep(idle * 4).await;
        // no timer left to unload the explicitly loaded model
        assert!(session.is_loaded().await);
        assert_eq!(backend.releases(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_idle_timer_keeps_model() {
        let idle = Duration::from_millis(300);
        let backend = ScriptedBackend::new("a cat");
        let session = session(&backend, idle);
        session.generate_caption(rgb_image(4), "caption").await.expect("caption");
        session.cancel_idle_timer().await;

        tokio::time::sleep(idle * 2).await;
        assert!(session.is_loaded().await);
        assert_eq!(backend.releases(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_reset_idle_timer_arms_explicit_load() {
        let backend = ScriptedBackend::new("a cat");
        let session = session(&backend, Duration::from_millis(50));
        // nothing to unload yet
        session.reset_idle_timer().await;
        session.load().await.expect("load");
        session.reset_idle_timer().await;

        assert!(wait_until(|| backend.releases() == 1).await);
        assert!(!session.is_loaded().await);
    }

    #[test_log::test(tokio::test)]
    async fn test_dropping_session_unloads_model() {
        let backend = ScriptedBackend::new("a cat");
        let session = session(&backend, IDLE);
        session.generate_caption(rgb_image(4), "caption").await.expect("caption");
        drop(session);

        assert!(wait_until(|| backend.releases() == 1).await);
    }

    // An idle timeout far shorter than the gap between captions keeps the
    // timer firing around every request. No caption may see an unloaded model.
    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_short_idle_timeout_never_fails_a_caption() {
        let backend = ScriptedBackend::new("a cat");
        let session = Arc::new(session(&backend, Duration::from_micros(200)));

        let mut tasks = Vec::new();
        for worker in 0..4u64 {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move {
                for i in 0..25u64 {
                    let caption = session.generate_caption(rgb_image(4), "caption").await?;
                    anyhow::ensure!(caption == "a cat", "unexpected caption {:?}", caption);
                    if (worker + i) % 2 == 0 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
                anyhow::Ok(())
            }));
        }
        for task in tasks {
            task.await.expect("join").expect("every caption succeeds");
        }

        assert_eq!(backend.generations(), 100);
        assert!(backend.loads() >= 1);
    }
}

//! Background image encoding for interactive mask sessions.
//!
//! The encoder runs on a worker thread. The owning thread drives a small state
//! machine through [`MaskSession::poll`]; the segmentation context moves to the
//! worker for the duration of an encode and comes back over a channel.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        mpsc::{self, Receiver, TryRecvError},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use image::{imageops::FilterType, RgbImage};
use tracing::{debug, error, info, warn};

use crate::{
    config::MaskSettings,
    errors::{Result, SegError},
    maskops::postprocess,
    prompt::seed_from_points,
    provider::Provider,
    segmentation::{Mask, SegPoint, SegmentationContext, SegmentationOptions, ENCODER_INPUT_SIZE},
    traits::ModelLoader,
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EncodeState {
    Idle = 0,
    /// An image is queued; the "encoding" notice can be shown before work starts.
    MessageShown = 1,
    Ready = 2,
    Running = 3,
    Error = -1,
}

impl EncodeState {
    fn from_raw(v: i32) -> Self {
        match v {
            1 => Self::MessageShown,
            2 => Self::Ready,
            3 => Self::Running,
            -1 => Self::Error,
            _ => Self::Idle,
        }
    }
}

type Context<L> = SegmentationContext<<L as ModelLoader>::Session>;

struct EncodeOutcome<L: ModelLoader> {
    ctx: Option<Context<L>>,
    image: RgbImage,
    result: Result<()>,
}

struct Worker<L: ModelLoader> {
    handle: JoinHandle<()>,
    rx: Receiver<EncodeOutcome<L>>,
}

/// Shrink so the longest side is at most the encoder input size. Never upscales.
pub fn fit_encoder_input(image: RgbImage) -> RgbImage {
    let (w, h) = image.dimensions();
    let longest = w.max(h) as usize;
    if longest <= ENCODER_INPUT_SIZE {
        return image;
    }
    let scale = ENCODER_INPUT_SIZE as f32 / longest as f32;
    let nw = ((w as f32 * scale).round() as u32).clamp(1, ENCODER_INPUT_SIZE as u32);
    let nh = ((h as f32 * scale).round() as u32).clamp(1, ENCODER_INPUT_SIZE as u32);
    debug!(from = ?(w, h), to = ?(nw, nh), "downscaling image for encoder");
    image::imageops::resize(&image, nw, nh, FilterType::Triangle)
}

/// Load (if needed), encode, and warm up. Runs on the worker thread.
///
/// An encode failure on an accelerated provider switches the loader to CPU and
/// tries once more with a freshly loaded context.
fn encode_job<L: ModelLoader>(
    loader: &L,
    model_id: &str,
    options: &SegmentationOptions,
    ctx: Option<Context<L>>,
    image: &RgbImage,
) -> (Option<Context<L>>, Result<()>) {
    let (mut ctx, mut fresh) = match ctx {
        Some(c) => (c, false),
        None => match SegmentationContext::load_with(loader, model_id, options) {
            Ok(c) => (c, true),
            Err(e) => return (None, Err(e)),
        },
    };

    if let Err(e) = ctx.encode(image) {
        let provider = loader.provider();
        if provider == Provider::Cpu {
            return (Some(ctx), Err(e));
        }
        warn!(error = %e, provider = %provider, "encode failed, retrying on CPU");
        drop(ctx);
        loader.set_provider(Provider::Cpu);
        ctx = match SegmentationContext::load_with(loader, model_id, options) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "CPU reload failed");
                return (None, Err(e));
            }
        };
        fresh = true;
        if let Err(e) = ctx.encode(image) {
            return (Some(ctx), Err(e));
        }
    }

    if fresh {
        if let Err(e) = ctx.warmup() {
            warn!(error = %e, "decoder warm-up failed");
        }
    }
    (Some(ctx), Ok(()))
}

/// One interactive segmentation session over a single model.
pub struct MaskSession<L: ModelLoader + 'static> {
    loader: Arc<L>,
    model_id: String,
    options: SegmentationOptions,
    state: Arc<AtomicI32>,
    cancelled: Arc<AtomicBool>,
    ctx: Option<Context<L>>,
    /// Image currently encoded (or queued), already downscaled.
    image: Option<RgbImage>,
    worker: Option<Worker<L>>,
    last_error: Option<SegError>,
}

impl<L: ModelLoader + 'static> std::fmt::Debug for MaskSession<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaskSession")
            .field("model_id", &self.model_id)
            .field("state", &self.state())
            .field("loaded", &self.ctx.is_some())
            .field("worker", &self.worker.is_some())
            .finish()
    }
}

impl<L: ModelLoader + 'static> MaskSession<L> {
    /// The model is loaded lazily by the first encode.
    pub fn new(loader: Arc<L>, model_id: impl Into<String>) -> Self {
        Self::with_options(loader, model_id, SegmentationOptions::default())
    }

    pub fn with_options(loader: Arc<L>, model_id: impl Into<String>, options: SegmentationOptions) -> Self {
        Self {
            loader,
            model_id: model_id.into(),
            options,
            state: Arc::new(AtomicI32::new(EncodeState::Idle as i32)),
            cancelled: Arc::new(AtomicBool::new(false)),
            ctx: None,
            image: None,
            worker: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> EncodeState {
        EncodeState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: EncodeState) {
        self.state.store(s as i32, Ordering::Release);
    }

    /// Queue `image` for encoding. The worker starts on the next [`Self::poll`].
    pub fn set_image(&mut self, image: RgbImage) -> Result<()> {
        if self.worker.is_some() {
            self.collect();
        }
        if self.worker.is_some() {
            return Err(SegError::Validation {
                field: "image".to_string(),
                reason: "an encode is still running".to_string(),
            });
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(SegError::Validation {
                field: "image".to_string(),
                reason: "empty image".to_string(),
            });
        }
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.reset_encoding();
        }
        self.image = Some(fit_encoder_input(image));
        self.last_error = None;
        self.cancelled.store(false, Ordering::Release);
        self.set_state(EncodeState::MessageShown);
        Ok(())
    }

    /// Drive state transitions and return the resulting state.
    ///
    /// Starts the worker for a queued image, and collects its result once the
    /// worker has signalled completion. Never blocks on the encode.
    pub fn poll(&mut self) -> EncodeState {
        if self.worker.is_some() {
            self.collect();
        } else if self.state() == EncodeState::MessageShown {
            if self.cancelled.load(Ordering::Acquire) {
                self.set_state(EncodeState::Idle);
            } else if let Err(e) = self.spawn_worker() {
                error!(error = %e, "failed to start encode worker");
                self.last_error = Some(e);
                self.set_state(EncodeState::Error);
            }
        }
        self.state()
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let Some(image) = self.image.take() else {
            self.set_state(EncodeState::Idle);
            return Ok(());
        };
        let (tx, rx) = mpsc::channel();
        let loader = Arc::clone(&self.loader);
        let state = Arc::clone(&self.state);
        let model_id = self.model_id.clone();
        let options = self.options.clone();
        let ctx = self.ctx.take();

        self.set_state(EncodeState::Running);
        let spawned = thread::Builder::new()
            .name("sam-encode".to_string())
            .spawn(move || {
                let start = Instant::now();
                let (ctx, result) = encode_job(&*loader, &model_id, &options, ctx, &image);
                let next = if result.is_ok() {
                    EncodeState::Ready
                } else {
                    EncodeState::Error
                };
                info!(elapsed = ?start.elapsed(), ok = result.is_ok(), "encode worker finished");
                // the outcome must be in the channel before the state flips
                let _ = tx.send(EncodeOutcome { ctx, image, result });
                state.store(next as i32, Ordering::Release);
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker { handle, rx });
                Ok(())
            }
            Err(e) => {
                self.set_state(EncodeState::Error);
                Err(e.into())
            }
        }
    }

    fn collect(&mut self) {
        let Some(worker) = self.worker.as_ref() else {
            return;
        };
        let outcome = match worker.rx.try_recv() {
            Ok(o) => o,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => {
                self.join_worker();
                self.last_error = Some(SegError::Validation {
                    field: "encode worker".to_string(),
                    reason: "exited without a result".to_string(),
                });
                self.set_state(EncodeState::Error);
                return;
            }
        };
        self.join_worker();

        self.ctx = outcome.ctx;
        self.image = Some(outcome.image);
        match outcome.result {
            Ok(()) if self.cancelled.load(Ordering::Acquire) => {
                debug!("encode finished after cancel, discarding");
                if let Some(ctx) = self.ctx.as_mut() {
                    ctx.reset_encoding();
                }
                self.set_state(EncodeState::Idle);
            }
            Ok(()) => self.set_state(EncodeState::Ready),
            Err(e) => {
                error!(error = %e, "image encode failed");
                self.last_error = Some(e);
                self.set_state(EncodeState::Error);
            }
        }
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.handle.join().is_err() {
                error!("encode worker panicked");
            }
        }
    }

    /// Do not start (or keep) the next encode. A running encode finishes, but
    /// its result is dropped.
    pub fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        match self.state() {
            EncodeState::MessageShown | EncodeState::Ready => {
                if let Some(ctx) = self.ctx.as_mut() {
                    ctx.reset_encoding();
                }
                self.set_state(EncodeState::Idle);
            }
            _ => {}
        }
    }

    /// Join the worker if it has finished. Returns `false` while it is still
    /// running so the caller can retry later instead of blocking.
    pub fn try_shutdown(&mut self) -> bool {
        if self.worker.is_some() {
            self.collect();
        }
        if self.worker.is_some() {
            return false;
        }
        self.ctx = None;
        self.image = None;
        self.set_state(EncodeState::Idle);
        true
    }

    /// Poll until the image is encoded or `timeout` passes.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.poll() {
                EncodeState::Ready => return Ok(()),
                EncodeState::Error => {
                    return Err(self.last_error.take().unwrap_or_else(|| SegError::Validation {
                        field: "encode".to_string(),
                        reason: "failed".to_string(),
                    }))
                }
                EncodeState::Idle => {
                    return Err(SegError::Validation {
                        field: "image".to_string(),
                        reason: "nothing queued for encoding".to_string(),
                    })
                }
                EncodeState::MessageShown | EncodeState::Running => {}
            }
            if Instant::now() >= deadline {
                return Err(SegError::Validation {
                    field: "encode".to_string(),
                    reason: format!("not ready after {timeout:?}"),
                });
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn take_error(&mut self) -> Option<SegError> {
        self.last_error.take()
    }

    fn ready_context(&mut self) -> Result<&mut Context<L>> {
        if self.poll() != EncodeState::Ready {
            return Err(SegError::Validation {
                field: "image".to_string(),
                reason: "not encoded".to_string(),
            });
        }
        self.ctx.as_mut().ok_or_else(|| SegError::Validation {
            field: "model".to_string(),
            reason: "not loaded".to_string(),
        })
    }

    /// Decode `points` into a post-processed mask. Runs on the calling thread.
    ///
    /// The first decode after a new image or [`reset_prompts`](Self::reset_prompts)
    /// starts a fresh mask, as does a single point. Later prompts refine it.
    pub fn decode(&mut self, points: &[SegPoint], settings: &MaskSettings) -> Result<Mask> {
        let ctx = self.ready_context()?;
        let mut mask = ctx.segment(points, settings.refine_passes())?;
        let seed = seed_from_points(points, mask.width, mask.height);
        postprocess(
            &mut mask.data,
            mask.width,
            mask.height,
            self.image.as_ref(),
            settings,
            seed,
        )?;
        Ok(mask)
    }

    /// Forget the accumulated previous mask; the image stays encoded.
    pub fn reset_prompts(&mut self) {
        if let Some(ctx) = self.ctx.as_mut() {
            ctx.reset_prev_mask();
        }
    }

    pub fn supports_box(&self) -> bool {
        self.ctx.as_ref().is_some_and(SegmentationContext::supports_box)
    }

    /// The image as encoded, after downscaling.
    pub fn image(&self) -> Option<&RgbImage> {
        self.image.as_ref()
    }

    pub fn context(&self) -> Option<&Context<L>> {
        self.ctx.as_ref()
    }

    pub fn loader(&self) -> &Arc<L> {
        &self.loader
    }
}

impl<L: ModelLoader + 'static> Drop for MaskSession<L> {
    fn drop(&mut self) {
        if !self.try_shutdown() {
            // the worker owns everything it touches; let it finish detached
            debug!("dropping session with encode still running");
        }
    }
}

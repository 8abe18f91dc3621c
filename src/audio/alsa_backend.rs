//! ALSA implementation of the audio seams.
//!
//! Capture runs on its own thread and hands exact windows to the controller.
//! Playback is a small mixer thread: scheduled sources are summed into each
//! period, and the clock is the number of frames written so far.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::runtime::RuntimeFlavor;

use super::capture::FrameAccumulator;
use super::device::{AudioBackend, InputContext, Microphone, OutputContext, ProcessorNode, SourceId};
use super::pcm::{self, DecodedAudio};
use crate::config::Config;
use crate::controller::EventSink;
use crate::error::{CallError, CallResult};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
struct AlsaParams {
    sample_rate: u32,
    channels: u32,
    period_size: usize,
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "Capture",
        Direction::Playback => "Playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );
    Ok((pcm, params))
}

/// PCM on the wire has a fixed rate, so a device that cannot run at it is unusable.
fn ensure_rate(params: &AlsaParams, requested: u32) -> Result<()> {
    if params.sample_rate != requested {
        anyhow::bail!(
            "device runs at {} Hz but the call needs {} Hz",
            params.sample_rate,
            requested
        );
    }
    Ok(())
}

/// Runs blocking device work (joins, open handshakes) without stalling
/// the async worker it is called from.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

pub struct AlsaBackend {
    capture_device: String,
    playback_device: String,
    playback_period_size: usize,
}

impl AlsaBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            capture_device: config.capture_device.to_string(),
            playback_device: config.playback_device.to_string(),
            playback_period_size: config.playback_period_size,
        }
    }
}

#[async_trait]
impl AudioBackend for AlsaBackend {
    fn open_input(&self, sample_rate: u32) -> CallResult<Box<dyn InputContext>> {
        Ok(Box::new(AlsaInputContext { sample_rate }))
    }

    fn open_output(
        &self,
        sample_rate: u32,
        channels: u16,
        events: EventSink,
    ) -> CallResult<Box<dyn OutputContext>> {
        AlsaOutputContext::open(
            &self.playback_device,
            sample_rate,
            channels,
            self.playback_period_size,
            events,
        )
        .map(|ctx| Box::new(ctx) as Box<dyn OutputContext>)
        .map_err(|e| CallError::Device(format!("{:#}", e)))
    }

    async fn acquire_microphone(&self, sample_rate: u32) -> CallResult<Box<dyn Microphone>> {
        // Open once so a missing or busy microphone fails the connect attempt
        // here; the capture thread reopens it with the same parameters.
        let device = self.capture_device.clone();
        let params = tokio::task::spawn_blocking(move || {
            open_pcm(&device, Direction::Capture, sample_rate, 1, None).map(|(_, params)| params)
        })
        .await
        .map_err(|e| CallError::Microphone(e.to_string()))?
        .map_err(|e| CallError::Microphone(format!("{:#}", e)))?;
        ensure_rate(&params, sample_rate).map_err(|e| CallError::Device(format!("capture: {:#}", e)))?;

        Ok(Box::new(AlsaMicrophone {
            device: self.capture_device.clone(),
            params,
            released: false,
            running: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct AlsaInputContext {
    sample_rate: u32,
}

impl InputContext for AlsaInputContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn close(&mut self) {
        log::debug!("Input context closed");
    }
}

// ======================== Capture ========================

struct AlsaMicrophone {
    device: String,
    params: AlsaParams,
    released: bool,
    running: Arc<AtomicBool>,
}

impl Microphone for AlsaMicrophone {
    fn connect(&mut self, window: usize, sink: EventSink) -> CallResult<Box<dyn ProcessorNode>> {
        if self.released || self.running.load(Ordering::SeqCst) {
            return Err(CallError::Microphone("microphone already connected or stopped".into()));
        }
        let device = self.device.clone();
        let params = self.params.clone();
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        let handle = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                if let Err(e) = record_thread(&device, params, window, sink, &running) {
                    log::error!("Capture thread error: {}", e);
                }
            })
            .map_err(|e| CallError::Microphone(e.to_string()))?;

        Ok(Box::new(CaptureNode {
            running: self.running.clone(),
            handle: Some(handle),
        }))
    }

    fn stop_tracks(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if !self.released {
            self.released = true;
            log::info!("Microphone released");
        }
    }
}

struct CaptureNode {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProcessorNode for CaptureNode {
    fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            // at most one period away from noticing the flag
            let _ = blocking(|| handle.join());
        }
    }
}

fn record_thread(
    device: &str,
    params: AlsaParams,
    window: usize,
    sink: EventSink,
    running: &AtomicBool,
) -> Result<()> {
    let requested = params.sample_rate;
    let (pcm, params) = open_pcm(device, Direction::Capture, requested, params.channels, None)?;
    ensure_rate(&params, requested)?;
    let channels = params.channels.max(1) as usize;
    let mut read_buf = vec![0i16; params.period_size * channels];
    let mut mono = Vec::with_capacity(params.period_size);
    let mut accumulator = FrameAccumulator::new(window);
    let io = pcm.io_i16()?;

    log::info!("Recording started: rate={}, window={}", params.sample_rate, window);

    while running.load(Ordering::Relaxed) {
        match io.readi(&mut read_buf) {
            Ok(frames) => {
                // first channel only; the session wants mono
                mono.clear();
                mono.extend(read_buf[..frames * channels].iter().step_by(channels).copied());
                for frame in accumulator.push(&pcm::dequantize(&mono)) {
                    if !sink.capture(frame) {
                        log::warn!("Controller gone, stopping capture");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                log::warn!("ALSA capture error: {}, recovering...", e);
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM capture: {}", e2);
                    break;
                }
            }
        }
    }

    log::info!("Recording stopped");
    Ok(())
}

// ======================== Playback ========================

struct QueuedSource {
    id: SourceId,
    start_frame: u64,
    audio: DecodedAudio,
}

#[derive(Default)]
struct Mixer {
    sources: Vec<QueuedSource>,
}

impl Mixer {
    /// Sums every source overlapping `[at, at + frames)` into `out`.
    /// Returns the ids of sources that finished within this period.
    fn render(&mut self, at: u64, out: &mut [f32], channels: usize) -> Vec<SourceId> {
        out.fill(0.0);
        let frames = (out.len() / channels) as u64;
        let end = at + frames;
        for source in &self.sources {
            let src_channels = source.audio.channels.max(1) as usize;
            let src_frames = source.audio.frames() as u64;
            let src_end = source.start_frame + src_frames;
            if source.start_frame >= end || src_end <= at {
                continue;
            }
            let from = source.start_frame.max(at);
            let to = src_end.min(end);
            for frame in from..to {
                let src_index = (frame - source.start_frame) as usize * src_channels;
                let out_index = (frame - at) as usize * channels;
                for ch in 0..channels {
                    let sample = source.audio.samples[src_index + ch.min(src_channels - 1)];
                    out[out_index + ch] += sample;
                }
            }
        }

        let mut ended = Vec::new();
        self.sources.retain(|source| {
            let done = source.start_frame + source.audio.frames() as u64 <= end;
            if done {
                ended.push(source.id);
            }
            !done
        });
        ended
    }
}

struct AlsaOutputContext {
    sample_rate: u32,
    mixer: Arc<Mutex<Mixer>>,
    frames_played: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AlsaOutputContext {
    fn open(
        device: &str,
        sample_rate: u32,
        channels: u16,
        period_size: usize,
        events: EventSink,
    ) -> Result<Self> {
        let period = if period_size > 0 { Some(period_size) } else { None };
        let mixer = Arc::new(Mutex::new(Mixer::default()));
        let frames_played = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        // The device is opened on the playback thread; the open result comes back here.
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<u32>>(1);
        let handle = {
            let device = device.to_string();
            let mixer = mixer.clone();
            let frames_played = frames_played.clone();
            let running = running.clone();
            std::thread::Builder::new().name("playback".into()).spawn(move || {
                let opened = open_pcm(&device, Direction::Playback, sample_rate, channels as u32, period)
                    .and_then(|(pcm, params)| ensure_rate(&params, sample_rate).map(|()| (pcm, params)));
                let (pcm, params) = match opened {
                    Ok(opened) => {
                        let _ = ready_tx.send(Ok(opened.1.sample_rate));
                        opened
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = play_thread(pcm, params, &mixer, &frames_played, &running, events) {
                    log::error!("Playback thread error: {}", e);
                }
            })?
        };
        // the clock runs in the device's own rate
        let device_rate = blocking(|| ready_rx.recv())
            .context("playback thread exited before opening the device")??;

        Ok(Self {
            sample_rate: device_rate,
            mixer,
            frames_played,
            running,
            handle: Some(handle),
        })
    }
}

impl OutputContext for AlsaOutputContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.frames_played.load(Ordering::Relaxed) as f64 / self.sample_rate as f64
    }

    fn start_source(&mut self, id: SourceId, audio: DecodedAudio, when: f64) -> CallResult<()> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(CallError::Device("output context closed".into()));
        }
        let start_frame = (when * self.sample_rate as f64).round() as u64;
        let mut mixer = self
            .mixer
            .lock()
            .map_err(|_| CallError::Device("playback mixer poisoned".into()))?;
        mixer.sources.push(QueuedSource { id, start_frame, audio });
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) {
        if let Ok(mut mixer) = self.mixer.lock() {
            mixer.sources.retain(|source| source.id != id);
        }
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = blocking(|| handle.join());
        }
    }
}

fn play_thread(
    pcm: PCM,
    params: AlsaParams,
    mixer: &Mutex<Mixer>,
    frames_played: &AtomicU64,
    running: &AtomicBool,
    events: EventSink,
) -> Result<()> {
    let channels = params.channels.max(1) as usize;
    let mut mix_buf = vec![0f32; params.period_size * channels];
    let io = pcm.io_i16()?;

    log::info!("Playback started: rate={}, ch={}, period={}", params.sample_rate, channels, params.period_size);

    while running.load(Ordering::Relaxed) {
        let at = frames_played.load(Ordering::Relaxed);
        let ended = match mixer.lock() {
            Ok(mut mixer) => mixer.render(at, &mut mix_buf, channels),
            Err(_) => anyhow::bail!("playback mixer poisoned"),
        };
        let pcm_data = pcm::quantize(&mix_buf);

        // Write with a retry loop so short writes and XRUNs don't lose frames.
        let total_frames = pcm_data.len() / channels;
        let mut frames_written = 0;
        let mut retry_count = 0u32;
        while frames_written < total_frames {
            let offset = frames_written * channels;
            match io.writei(&pcm_data[offset..]) {
                Ok(n) => {
                    frames_written += n;
                    retry_count = 0;
                }
                Err(e) => {
                    log::warn!("ALSA XRUN or error: {}, recovering...", e);
                    retry_count += 1;
                    if let Err(e2) = pcm.prepare() {
                        log::error!("Failed to recover PCM playback: {}", e2);
                        break;
                    }
                    if retry_count >= 3 {
                        log::error!(
                            "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                            retry_count,
                            total_frames - frames_written
                        );
                        break;
                    }
                }
            }
        }
        frames_played.fetch_add(total_frames as u64, Ordering::Relaxed);

        for id in ended {
            events.source_ended(id);
        }
    }

    log::info!("Playback stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: SourceId, start_frame: u64, samples: Vec<f32>) -> QueuedSource {
        QueuedSource {
            id,
            start_frame,
            audio: DecodedAudio { samples, sample_rate: 24000, channels: 1 },
        }
    }

    fn params(sample_rate: u32) -> AlsaParams {
        AlsaParams { sample_rate, channels: 1, period_size: 1024 }
    }

    #[test]
    fn mismatched_device_rate_is_refused() {
        assert!(ensure_rate(&params(16000), 16000).is_ok());
        let err = ensure_rate(&params(48000), 24000).unwrap_err();
        assert!(err.to_string().contains("48000"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_work_runs_on_multi_thread_runtime() {
        let joined = blocking(|| std::thread::spawn(|| 7).join());
        assert_eq!(joined.unwrap(), 7);
    }

    #[tokio::test]
    async fn blocking_work_runs_inline_on_current_thread_runtime() {
        assert_eq!(blocking(|| 3), 3);
    }

    #[test]
    fn blocking_work_runs_outside_a_runtime() {
        assert_eq!(blocking(|| 5), 5);
    }

    #[test]
    fn mixer_places_sources_at_their_start_frame() {
        let mut mixer = Mixer::default();
        mixer.sources.push(source(1, 2, vec![0.5; 3]));
        let mut out = vec![0.0; 4];
        let ended = mixer.render(0, &mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5]);
        assert!(ended.is_empty());

        let ended = mixer.render(4, &mut out, 1);
        assert_eq!(out, vec![0.5, 0.0, 0.0, 0.0]);
        assert_eq!(ended, vec![1]);
        assert!(mixer.sources.is_empty());
    }

    #[test]
    fn mixer_sums_overlaps_and_fans_out_mono() {
        let mut mixer = Mixer::default();
        mixer.sources.push(source(1, 0, vec![0.25; 2]));
        mixer.sources.push(source(2, 1, vec![0.5; 1]));
        let mut out = vec![0.0; 4];
        let ended = mixer.render(0, &mut out, 2);
        assert_eq!(out, vec![0.25, 0.25, 0.75, 0.75]);
        assert_eq!(ended, vec![1, 2]);
    }
}

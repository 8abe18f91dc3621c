//! Platform seams of the voice call.
//!
//! The controller only talks to these traits; the ALSA implementation lives
//! in `alsa_backend` and tests plug in in-memory doubles.

use async_trait::async_trait;

use super::pcm::DecodedAudio;
use crate::controller::EventSink;
use crate::error::{CallError, CallResult};

pub type SourceId = u64;

/// Playback side: a clock plus sources scheduled against it.
///
/// Natural completion of a source is reported through the `EventSink`
/// handed to `AudioBackend::open_output`.
pub trait OutputContext: Send {
    fn sample_rate(&self) -> u32;
    /// Playback clock in seconds since the context was opened.
    fn current_time(&self) -> f64;
    fn start_source(&mut self, id: SourceId, audio: DecodedAudio, when: f64) -> CallResult<()>;
    fn stop_source(&mut self, id: SourceId);
    fn close(&mut self);
}

/// Capture clock domain the microphone is processed in.
pub trait InputContext: Send {
    fn sample_rate(&self) -> u32;
    fn close(&mut self);
}

/// The node delivering capture windows; dropping the connection stops delivery.
pub trait ProcessorNode: Send {
    fn disconnect(&mut self);
}

pub trait Microphone: Send {
    /// Starts delivering windows of exactly `window` samples to `sink`.
    fn connect(&mut self, window: usize, sink: EventSink) -> CallResult<Box<dyn ProcessorNode>>;
    fn stop_tracks(&mut self);
}

#[async_trait]
pub trait AudioBackend: Send + Sync {
    fn open_input(&self, sample_rate: u32) -> CallResult<Box<dyn InputContext>>;

    fn open_output(
        &self,
        sample_rate: u32,
        channels: u16,
        events: EventSink,
    ) -> CallResult<Box<dyn OutputContext>>;

    /// Permission-gated; may take a while on real hardware.
    async fn acquire_microphone(&self, sample_rate: u32) -> CallResult<Box<dyn Microphone>>;
}

/// Backend used when the binary is built without any audio device support.
pub struct UnavailableBackend;

const UNAVAILABLE: &str = "built without an audio backend (enable the `alsa-backend` feature)";

#[async_trait]
impl AudioBackend for UnavailableBackend {
    fn open_input(&self, _sample_rate: u32) -> CallResult<Box<dyn InputContext>> {
        Err(CallError::Device(UNAVAILABLE.into()))
    }

    fn open_output(
        &self,
        _sample_rate: u32,
        _channels: u16,
        _events: EventSink,
    ) -> CallResult<Box<dyn OutputContext>> {
        Err(CallError::Device(UNAVAILABLE.into()))
    }

    async fn acquire_microphone(&self, _sample_rate: u32) -> CallResult<Box<dyn Microphone>> {
        Err(CallError::Microphone(UNAVAILABLE.into()))
    }
}

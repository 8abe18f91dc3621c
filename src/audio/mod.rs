//! audio - Capture, playback scheduling and PCM codec for the voice call
//!
//! The device layer is a set of traits (`device`); the ALSA implementation
//! is compiled in with the `alsa-backend` feature.

#[cfg(feature = "alsa-backend")]
mod alsa_backend;
pub mod capture;
pub mod device;
pub mod pcm;
pub mod playback;

use std::sync::Arc;

use crate::config::Config;
use device::AudioBackend;

/// Audio backend selected at build time.
pub fn default_backend(config: &Config) -> Arc<dyn AudioBackend> {
    #[cfg(feature = "alsa-backend")]
    {
        Arc::new(alsa_backend::AlsaBackend::new(config))
    }
    #[cfg(not(feature = "alsa-backend"))]
    {
        let _ = config;
        log::warn!("No audio backend compiled in; voice calls will fail to connect");
        Arc::new(device::UnavailableBackend)
    }
}

//! Outbound half of the bridge: microphone windows → encoded frames.

use super::pcm;
use crate::protocol::Blob;

/// Regroups arbitrarily sized device reads into fixed-size windows.
pub struct FrameAccumulator {
    window: usize,
    pending: Vec<f32>,
}

impl FrameAccumulator {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            pending: Vec::with_capacity(window * 2),
        }
    }

    /// Appends `samples` and returns every window completed by them, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut windows = Vec::new();
        while self.pending.len() >= self.window {
            windows.push(self.pending.drain(..self.window).collect());
        }
        windows
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Encodes capture windows and gates their transmission.
pub struct CapturePipeline {
    window_size: usize,
    mime_type: String,
    frames_sent: u64,
    frames_dropped: u64,
}

impl CapturePipeline {
    pub fn new(sample_rate: u32, window_size: usize) -> Self {
        Self {
            window_size,
            mime_type: pcm::pcm_mime_type(sample_rate),
            frames_sent: 0,
            frames_dropped: 0,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn encode_frame(&self, window: &[f32]) -> Blob {
        let bytes = pcm::pcm16_to_bytes(&pcm::quantize(window));
        Blob {
            mime_type: self.mime_type.clone(),
            data: pcm::encode_base64(&bytes),
        }
    }

    /// Returns the frame to transmit, or `None` when the gate is closed.
    ///
    /// `muted` must be the value at send time. Gated frames are dropped,
    /// never queued for later.
    pub fn process(&mut self, window: &[f32], muted: bool, session_open: bool) -> Option<Blob> {
        if muted || !session_open {
            self.frames_dropped += 1;
            return None;
        }
        self.frames_sent += 1;
        Some(self.encode_frame(window))
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_emits_exact_windows_and_keeps_remainder() {
        let mut acc = FrameAccumulator::new(4);
        assert!(acc.push(&[0.1, 0.2, 0.3]).is_empty());
        let windows = acc.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(windows, vec![vec![0.1, 0.2, 0.3, 0.4], vec![0.5, 0.6, 0.7, 0.8]]);
        assert_eq!(acc.pending(), 1);
    }

    #[test]
    fn frame_carries_pcm_mime_and_base64_payload() {
        let pipeline = CapturePipeline::new(16000, 2);
        let frame = pipeline.encode_frame(&[0.5, -0.5]);
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        let bytes = pcm::decode_base64(&frame.data).unwrap();
        assert_eq!(pcm::bytes_to_pcm16(&bytes).unwrap(), vec![16384, -16384]);
    }

    #[test]
    fn muted_or_closed_session_drops_frames() {
        let mut pipeline = CapturePipeline::new(16000, 4);
        let window = [0.0; 4];
        assert!(pipeline.process(&window, true, true).is_none());
        assert!(pipeline.process(&window, false, false).is_none());
        assert!(pipeline.process(&window, false, true).is_some());
        assert_eq!(pipeline.frames_sent(), 1);
        assert_eq!(pipeline.frames_dropped(), 2);
    }
}

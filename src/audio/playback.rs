//! Gapless playback of inbound frames.
//!
//! Every buffer starts at `max(cursor, clock)` and pushes the cursor forward
//! by its own duration, so arrival jitter never opens gaps or overlaps.

use std::collections::HashSet;

use super::device::{OutputContext, SourceId};
use super::pcm;
use crate::error::CallResult;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler {
    sample_rate: u32,
    channels: u16,
    next_start_time: f64,
    active: HashSet<SourceId>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            next_start_time: 0.0,
            active: HashSet::new(),
            next_id: 1,
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_sources(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: SourceId) -> bool {
        self.active.contains(&id)
    }

    /// Decodes `pcm_bytes` and schedules it right after everything already queued.
    ///
    /// A malformed payload leaves the cursor and the active set untouched.
    pub fn schedule(
        &mut self,
        output: &mut dyn OutputContext,
        pcm_bytes: &[u8],
    ) -> CallResult<ScheduledSource> {
        let audio = pcm::decode_audio(pcm_bytes, self.sample_rate, self.channels)?;
        let duration = audio.duration();
        let start_time = self.next_start_time.max(output.current_time());

        let id = self.next_id;
        self.next_id += 1;
        output.start_source(id, audio, start_time)?;

        self.next_start_time = start_time + duration;
        self.active.insert(id);
        log::debug!(
            "Scheduled source {} at {:.3}s for {:.3}s ({} queued)",
            id,
            start_time,
            duration,
            self.active.len()
        );
        Ok(ScheduledSource {
            id,
            start_time,
            duration,
        })
    }

    /// Natural completion of a source. Returns false for unknown ids.
    pub fn source_ended(&mut self, id: SourceId) -> bool {
        self.active.remove(&id)
    }

    /// Barge-in: stop everything queued and restart the timeline at zero.
    ///
    /// Returns the number of sources that were stopped. Without an output
    /// context the bookkeeping is still reset.
    pub fn interrupt(&mut self, output: Option<&mut dyn OutputContext>) -> usize {
        let stopped = self.active.len();
        if let Some(output) = output {
            for id in self.active.iter() {
                output.stop_source(*id);
            }
        }
        self.active.clear();
        self.next_start_time = 0.0;
        stopped
    }
}

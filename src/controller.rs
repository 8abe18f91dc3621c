use crate::audio::capture::CapturePipeline;
use crate::audio::device::{
    AudioBackend, InputContext, Microphone, OutputContext, ProcessorNode, SourceId,
};
use crate::audio::pcm;
use crate::audio::playback::PlaybackScheduler;
use crate::config::Config;
use crate::error::{CallError, CallResult};
use crate::net_link::{LiveConnector, NetEvent, SessionHandle};
use crate::prompts::VOICE_SYSTEM_INSTRUCTION;
use crate::protocol::{ServerMessage, SetupMessage};
use crate::state_machine::CallState;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    Start,
    Stop,
    ToggleMute,
}

/// Everything the controller reacts to, delivered over a single channel.
///
/// Events produced on behalf of a call carry the attempt number they belong
/// to; anything tagged with a superseded attempt is released or ignored.
pub enum CallEvent {
    Command(CallCommand),
    MicrophoneReady {
        attempt: u64,
        result: CallResult<Box<dyn Microphone>>,
    },
    SessionReady {
        attempt: u64,
        result: CallResult<SessionHandle>,
    },
    Session {
        attempt: u64,
        event: NetEvent,
    },
    CaptureWindow {
        attempt: u64,
        samples: Vec<f32>,
    },
    SourceEnded {
        attempt: u64,
        id: SourceId,
    },
    Shutdown,
}

/// Sender handed to devices and the network task, stamped with one attempt.
///
/// Sends never block, so it is safe to use from real-time audio threads.
#[derive(Clone)]
pub struct EventSink {
    attempt: u64,
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl EventSink {
    pub(crate) fn new(attempt: u64, tx: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self { attempt, tx }
    }

    pub fn capture(&self, samples: Vec<f32>) -> bool {
        self.tx
            .send(CallEvent::CaptureWindow { attempt: self.attempt, samples })
            .is_ok()
    }

    pub fn source_ended(&self, id: SourceId) -> bool {
        self.tx
            .send(CallEvent::SourceEnded { attempt: self.attempt, id })
            .is_ok()
    }

    pub fn session(&self, event: NetEvent) -> bool {
        self.tx
            .send(CallEvent::Session { attempt: self.attempt, event })
            .is_ok()
    }
}

/// Snapshot published to observers after every state change.
#[derive(Debug, Clone, Default)]
pub struct CallStatus {
    pub state: CallState,
    pub muted: bool,
    pub connected_at: Option<Instant>,
    pub last_error: Option<String>,
}

/// Cloneable remote control for a running controller.
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<CallEvent>,
    status: watch::Receiver<CallStatus>,
}

impl CallHandle {
    pub fn start(&self) -> bool {
        self.command(CallCommand::Start)
    }

    pub fn stop(&self) -> bool {
        self.command(CallCommand::Stop)
    }

    pub fn toggle_mute(&self) -> bool {
        self.command(CallCommand::ToggleMute)
    }

    pub fn shutdown(&self) -> bool {
        self.tx.send(CallEvent::Shutdown).is_ok()
    }

    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    fn command(&self, command: CallCommand) -> bool {
        self.tx.send(CallEvent::Command(command)).is_ok()
    }
}

// Resources of one call; every field is released by `teardown`
#[derive(Default)]
struct CallResources {
    input: Option<Box<dyn InputContext>>,
    output: Option<Box<dyn OutputContext>>,
    microphone: Option<Box<dyn Microphone>>,
    processor: Option<Box<dyn ProcessorNode>>,
    session: Option<SessionHandle>,
}

impl CallResources {
    fn output(&mut self) -> Option<&mut dyn OutputContext> {
        self.output.as_mut().map(|output| output.as_mut() as &mut dyn OutputContext)
    }
}

pub struct CallController {
    config: Config,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn LiveConnector>,
    events_tx: mpsc::UnboundedSender<CallEvent>,
    status_tx: watch::Sender<CallStatus>,
    status_rx: watch::Receiver<CallStatus>,

    state: CallState,
    muted: bool,
    attempt: u64,
    connected_at: Option<Instant>,
    last_error: Option<String>,

    resources: CallResources,
    scheduler: PlaybackScheduler,
    capture: CapturePipeline,
}

impl CallController {
    pub fn new(
        config: Config,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn LiveConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(CallStatus::default());
        let scheduler = PlaybackScheduler::new(config.output_sample_rate, config.channels);
        let capture = CapturePipeline::new(config.input_sample_rate, config.capture_window);
        let controller = Self {
            config,
            backend,
            connector,
            events_tx,
            status_tx,
            status_rx,
            state: CallState::Idle,
            muted: false,
            attempt: 0,
            connected_at: None,
            last_error: None,
            resources: CallResources::default(),
            scheduler,
            capture,
        };
        (controller, events_rx)
    }

    pub fn handle(&self) -> CallHandle {
        CallHandle {
            tx: self.events_tx.clone(),
            status: self.status_rx.clone(),
        }
    }

    /// Single consumer loop: every event is handled to completion before the next.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<CallEvent>) {
        log::info!("Call controller started. State: {:?}", self.state);
        while let Some(event) = events.recv().await {
            if matches!(event, CallEvent::Shutdown) {
                break;
            }
            self.handle_event(event);
        }
        self.teardown("controller shutting down");
        log::info!("Call controller stopped");
    }

    pub fn handle_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::Command(CallCommand::Start) => self.start(),
            CallEvent::Command(CallCommand::Stop) => self.teardown("stopped by user"),
            CallEvent::Command(CallCommand::ToggleMute) => self.toggle_mute(),
            CallEvent::MicrophoneReady { attempt, result } => {
                self.on_microphone_ready(attempt, result)
            }
            CallEvent::SessionReady { attempt, result } => self.on_session_ready(attempt, result),
            CallEvent::Session { attempt, event } => self.on_session_event(attempt, event),
            CallEvent::CaptureWindow { attempt, samples } => self.on_capture(attempt, &samples),
            CallEvent::SourceEnded { attempt, id } => {
                if attempt == self.attempt {
                    self.scheduler.source_ended(id);
                }
            }
            CallEvent::Shutdown => self.teardown("controller shutting down"),
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    fn start(&mut self) {
        if !self.state.can_start() {
            log::warn!("Ignoring start: call is {}", self.state);
            self.last_error = Some(CallError::AlreadyActive(self.state).to_string());
            self.publish();
            return;
        }

        self.attempt += 1;
        self.state = CallState::Connecting;
        self.last_error = None;
        self.publish();
        log::info!("Starting call (attempt {})", self.attempt);

        if let Err(e) = self.open_contexts() {
            self.fail(e);
            return;
        }

        let backend = self.backend.clone();
        let tx = self.events_tx.clone();
        let attempt = self.attempt;
        let sample_rate = self.config.input_sample_rate;
        tokio::spawn(async move {
            let result = backend.acquire_microphone(sample_rate).await;
            let _ = tx.send(CallEvent::MicrophoneReady { attempt, result });
        });
    }

    fn open_contexts(&mut self) -> CallResult<()> {
        let input = self.backend.open_input(self.config.input_sample_rate)?;
        self.resources.input = Some(input);
        let output = self.backend.open_output(
            self.config.output_sample_rate,
            self.config.channels,
            self.sink(),
        )?;
        self.resources.output = Some(output);
        Ok(())
    }

    fn on_microphone_ready(&mut self, attempt: u64, result: CallResult<Box<dyn Microphone>>) {
        if attempt != self.attempt || self.state != CallState::Connecting {
            // stop() won the race; release what arrived late
            if let Ok(mut microphone) = result {
                log::info!("Releasing microphone of abandoned attempt {}", attempt);
                microphone.stop_tracks();
            }
            return;
        }

        match result {
            Ok(microphone) => {
                self.resources.microphone = Some(microphone);
                let connector = self.connector.clone();
                let setup = SetupMessage::audio(
                    self.config.live_model,
                    self.config.voice_name,
                    VOICE_SYSTEM_INSTRUCTION,
                );
                let sink = self.sink();
                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = connector.connect(setup, sink).await;
                    let _ = tx.send(CallEvent::SessionReady { attempt, result });
                });
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_session_ready(&mut self, attempt: u64, result: CallResult<SessionHandle>) {
        if attempt != self.attempt || self.state != CallState::Connecting {
            if let Ok(session) = result {
                log::info!("Closing session of abandoned attempt {}", attempt);
                session.close();
            }
            return;
        }

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                self.fail(e);
                return;
            }
        };
        self.resources.session = Some(session);

        let window = self.capture.window_size();
        let sink = self.sink();
        let processor = match self.resources.microphone.as_mut() {
            Some(microphone) => microphone.connect(window, sink),
            None => Err(CallError::Microphone("microphone released before open".into())),
        };
        match processor {
            Ok(processor) => {
                self.resources.processor = Some(processor);
                self.state = CallState::Active;
                self.connected_at = Some(Instant::now());
                self.publish();
                log::info!("Call active");
            }
            Err(e) => self.fail(e),
        }
    }

    fn on_session_event(&mut self, attempt: u64, event: NetEvent) {
        if attempt != self.attempt {
            return;
        }
        match event {
            NetEvent::Message(msg) => self.process_server_message(&msg),
            NetEvent::Closed(reason) => {
                log::info!("Live session closed: {}", reason);
                self.teardown("remote close");
            }
            NetEvent::Error(e) => {
                log::error!("Voice call error: {}", e);
                self.fail(CallError::Session(e));
            }
        }
    }

    fn process_server_message(&mut self, msg: &ServerMessage) {
        if let Some(data) = msg.audio_payload() {
            if let Some(output) = self.resources.output() {
                let scheduled = pcm::decode_base64(data)
                    .and_then(|bytes| self.scheduler.schedule(output, &bytes));
                if let Err(e) = scheduled {
                    log::warn!("Skipping inbound audio: {}", e);
                }
            }
        }

        if msg.is_interrupted() {
            let stopped = self.scheduler.interrupt(self.resources.output());
            log::info!("Interrupted, stopped {} queued buffers", stopped);
        }

        if msg.is_turn_complete() {
            log::debug!("Model turn complete");
        }

        if let Some(go_away) = &msg.go_away {
            log::warn!("Server going away (time left: {:?})", go_away.time_left);
        }
    }

    fn on_capture(&mut self, attempt: u64, samples: &[f32]) {
        if attempt != self.attempt {
            return;
        }
        let session_open = self.state == CallState::Active && self.resources.session.is_some();
        if let Some(frame) = self.capture.process(samples, self.muted, session_open) {
            if let Some(session) = &self.resources.session {
                session.send_audio(frame);
            }
        }
    }

    fn toggle_mute(&mut self) {
        self.muted = !self.muted;
        log::info!("Microphone {}", if self.muted { "muted" } else { "unmuted" });
        self.publish();
    }

    fn fail(&mut self, error: CallError) {
        log::error!("Voice call failed: {}", error);
        self.teardown("failure");
        self.last_error = Some(error.to_string());
        self.publish();
    }

    /// Releases everything the call holds. Idempotent and safe in any state.
    pub fn teardown(&mut self, reason: &str) {
        let was = self.state;

        let stopped = self.scheduler.interrupt(self.resources.output());
        if let Some(mut processor) = self.resources.processor.take() {
            processor.disconnect();
        }
        if let Some(mut microphone) = self.resources.microphone.take() {
            microphone.stop_tracks();
        }
        if let Some(mut input) = self.resources.input.take() {
            input.close();
        }
        if let Some(mut output) = self.resources.output.take() {
            output.close();
        }
        if let Some(session) = self.resources.session.take() {
            session.close();
        }

        // anything still in flight for this call is now stale
        self.attempt += 1;
        self.state = CallState::Idle;
        self.connected_at = None;

        if was != CallState::Idle {
            log::info!(
                "Call ended ({}): {} buffers cancelled, {} frames sent, {} dropped",
                reason,
                stopped,
                self.capture.frames_sent(),
                self.capture.frames_dropped()
            );
            self.publish();
        }
    }

    fn sink(&self) -> EventSink {
        EventSink::new(self.attempt, self.events_tx.clone())
    }

    fn publish(&self) {
        self.status_tx.send_replace(CallStatus {
            state: self.state,
            muted: self.muted,
            connected_at: self.connected_at,
            last_error: self.last_error.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::DecodedAudio;
    use crate::net_link::NetCommand;
    use crate::protocol::Blob;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Rig {
        clock: f64,
        started: Vec<(SourceId, f64)>,
        stopped: Vec<SourceId>,
        inputs_open: i32,
        outputs_open: i32,
        mics_live: i32,
        processors_live: i32,
        capture_sinks: Vec<EventSink>,
        sessions: Vec<mpsc::Receiver<NetCommand>>,
    }

    type Shared = Arc<Mutex<Rig>>;

    struct MockInput(Shared);
    impl InputContext for MockInput {
        fn sample_rate(&self) -> u32 {
            16000
        }
        fn close(&mut self) {
            self.0.lock().unwrap().inputs_open -= 1;
        }
    }

    struct MockOutput(Shared);
    impl OutputContext for MockOutput {
        fn sample_rate(&self) -> u32 {
            24000
        }
        fn current_time(&self) -> f64 {
            self.0.lock().unwrap().clock
        }
        fn start_source(&mut self, id: SourceId, _audio: DecodedAudio, when: f64) -> CallResult<()> {
            self.0.lock().unwrap().started.push((id, when));
            Ok(())
        }
        fn stop_source(&mut self, id: SourceId) {
            self.0.lock().unwrap().stopped.push(id);
        }
        fn close(&mut self) {
            self.0.lock().unwrap().outputs_open -= 1;
        }
    }

    struct MockProcessor(Shared, bool);
    impl ProcessorNode for MockProcessor {
        fn disconnect(&mut self) {
            if !self.1 {
                self.1 = true;
                self.0.lock().unwrap().processors_live -= 1;
            }
        }
    }

    struct MockMic(Shared, bool);
    impl Microphone for MockMic {
        fn connect(&mut self, _window: usize, sink: EventSink) -> CallResult<Box<dyn ProcessorNode>> {
            let mut rig = self.0.lock().unwrap();
            rig.processors_live += 1;
            rig.capture_sinks.push(sink);
            Ok(Box::new(MockProcessor(self.0.clone(), false)))
        }
        fn stop_tracks(&mut self) {
            if !self.1 {
                self.1 = true;
                self.0.lock().unwrap().mics_live -= 1;
            }
        }
    }

    struct MockBackend {
        rig: Shared,
        deny_microphone: bool,
        mic_gate: Arc<Notify>,
        gated: AtomicBool,
    }

    #[async_trait]
    impl AudioBackend for MockBackend {
        fn open_input(&self, _sample_rate: u32) -> CallResult<Box<dyn InputContext>> {
            self.rig.lock().unwrap().inputs_open += 1;
            Ok(Box::new(MockInput(self.rig.clone())))
        }

        fn open_output(&self, _rate: u32, _ch: u16, _events: EventSink) -> CallResult<Box<dyn OutputContext>> {
            self.rig.lock().unwrap().outputs_open += 1;
            Ok(Box::new(MockOutput(self.rig.clone())))
        }

        async fn acquire_microphone(&self, _sample_rate: u32) -> CallResult<Box<dyn Microphone>> {
            if self.gated.load(Ordering::SeqCst) {
                self.mic_gate.notified().await;
            }
            if self.deny_microphone {
                return Err(CallError::Microphone("permission denied".into()));
            }
            self.rig.lock().unwrap().mics_live += 1;
            Ok(Box::new(MockMic(self.rig.clone(), false)))
        }
    }

    struct MockConnector {
        rig: Shared,
        refuse: bool,
    }

    #[async_trait]
    impl LiveConnector for MockConnector {
        async fn connect(&self, _setup: SetupMessage, _events: EventSink) -> CallResult<SessionHandle> {
            if self.refuse {
                return Err(CallError::Session("handshake rejected".into()));
            }
            let (tx, rx) = mpsc::channel(100);
            self.rig.lock().unwrap().sessions.push(rx);
            Ok(SessionHandle::new(tx, None))
        }
    }

    struct Harness {
        controller: CallController,
        rx: mpsc::UnboundedReceiver<CallEvent>,
        rig: Shared,
        mic_gate: Arc<Notify>,
    }

    fn harness(deny_microphone: bool, refuse: bool, gated: bool) -> Harness {
        let rig: Shared = Arc::new(Mutex::new(Rig::default()));
        let mic_gate = Arc::new(Notify::new());
        let backend = Arc::new(MockBackend {
            rig: rig.clone(),
            deny_microphone,
            mic_gate: mic_gate.clone(),
            gated: AtomicBool::new(gated),
        });
        let connector = Arc::new(MockConnector { rig: rig.clone(), refuse });
        let (controller, rx) = CallController::new(Config::new().unwrap(), backend, connector);
        Harness { controller, rx, rig, mic_gate }
    }

    impl Harness {
        fn send(&mut self, event: CallEvent) {
            self.controller.handle_event(event);
        }

        async fn pump_one(&mut self) {
            let event = self.rx.recv().await.unwrap();
            self.controller.handle_event(event);
        }

        async fn connect(&mut self) {
            self.send(CallEvent::Command(CallCommand::Start));
            self.pump_one().await; // MicrophoneReady
            self.pump_one().await; // SessionReady
            assert_eq!(self.controller.state(), CallState::Active);
        }

        fn attempt(&self) -> u64 {
            self.controller.attempt
        }

        fn inbound(&mut self, msg: &str) {
            let msg: ServerMessage = serde_json::from_str(msg).unwrap();
            let attempt = self.attempt();
            self.send(CallEvent::Session { attempt, event: NetEvent::Message(msg) });
        }

        fn capture_window(&mut self) {
            let sink = self.rig.lock().unwrap().capture_sinks.last().cloned().unwrap();
            sink.capture(vec![0.25; 4096]);
        }

        fn sent_frames(&self) -> Vec<Blob> {
            let mut rig = self.rig.lock().unwrap();
            let mut frames = Vec::new();
            if let Some(rx) = rig.sessions.last_mut() {
                while let Ok(cmd) = rx.try_recv() {
                    if let NetCommand::SendAudio(blob) = cmd {
                        frames.push(blob);
                    }
                }
            }
            frames
        }

        fn assert_released(&self) {
            let rig = self.rig.lock().unwrap();
            assert_eq!(rig.inputs_open, 0, "input context leaked");
            assert_eq!(rig.outputs_open, 0, "output context leaked");
            assert_eq!(rig.mics_live, 0, "microphone leaked");
            assert_eq!(rig.processors_live, 0, "processor leaked");
            assert!(self.controller.resources.session.is_none());
            assert_eq!(self.controller.scheduler.active_sources(), 0);
            assert_eq!(self.controller.scheduler.next_start_time(), 0.0);
        }
    }

    fn audio_message(seconds: f64) -> String {
        let bytes = vec![0u8; (seconds * 24000.0).round() as usize * 2];
        format!(
            r#"{{"serverContent":{{"modelTurn":{{"parts":[{{"inlineData":{{"mimeType":"audio/pcm;rate=24000","data":"{}"}}}}]}}}}}}"#,
            pcm::encode_base64(&bytes)
        )
    }

    #[tokio::test]
    async fn start_reaches_active_and_streams_frames() {
        let mut h = harness(false, false, false);
        h.connect().await;
        assert!(h.controller.handle().status().connected_at.is_some());

        h.capture_window();
        h.pump_one().await;
        let frames = h.sent_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].mime_type, "audio/pcm;rate=16000");
        let bytes = pcm::decode_base64(&frames[0].data).unwrap();
        assert_eq!(bytes.len(), 4096 * 2);
    }

    #[tokio::test]
    async fn inbound_buffers_play_back_to_back() {
        let mut h = harness(false, false, false);
        h.connect().await;
        for seconds in [0.5, 0.3, 0.2] {
            h.inbound(&audio_message(seconds));
        }
        let starts: Vec<f64> = h.rig.lock().unwrap().started.iter().map(|(_, t)| *t).collect();
        assert_eq!(starts.len(), 3);
        assert!((starts[0] - 0.0).abs() < 1e-9);
        assert!((starts[1] - 0.5).abs() < 1e-9);
        assert!((starts[2] - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn malformed_message_between_buffers_is_skipped() {
        let mut h = harness(false, false, false);
        h.connect().await;
        h.inbound(&audio_message(0.5));
        h.inbound(r#"{"serverContent":{"turnComplete":false}}"#);
        h.inbound(r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":"%%%"}}]}}}"#);
        h.inbound(&audio_message(0.3));
        let started = h.rig.lock().unwrap().started.clone();
        assert_eq!(started.len(), 2);
        assert!((started[1].1 - 0.5).abs() < 1e-9);
        assert_eq!(h.controller.state(), CallState::Active);
    }

    #[tokio::test]
    async fn interruption_cancels_queue_and_resets_cursor() {
        let mut h = harness(false, false, false);
        h.connect().await;
        h.inbound(&audio_message(0.5));
        h.inbound(&audio_message(0.5));
        h.inbound(r#"{"serverContent":{"interrupted":true}}"#);

        assert_eq!(h.controller.scheduler.active_sources(), 0);
        assert_eq!(h.controller.scheduler.next_start_time(), 0.0);
        assert_eq!(h.rig.lock().unwrap().stopped.len(), 2);

        h.rig.lock().unwrap().clock = 0.2;
        h.inbound(&audio_message(0.1));
        let last = *h.rig.lock().unwrap().started.last().unwrap();
        assert!((last.1 - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn ended_sources_leave_the_active_set() {
        let mut h = harness(false, false, false);
        h.connect().await;
        h.inbound(&audio_message(0.1));
        let (id, _) = h.rig.lock().unwrap().started[0];
        let attempt = h.attempt();
        h.send(CallEvent::SourceEnded { attempt, id });
        assert_eq!(h.controller.scheduler.active_sources(), 0);
    }

    #[tokio::test]
    async fn mute_gates_outbound_but_not_playback() {
        let mut h = harness(false, false, false);
        h.connect().await;
        h.send(CallEvent::Command(CallCommand::ToggleMute));
        assert!(h.controller.is_muted());

        h.capture_window();
        h.pump_one().await;
        assert!(h.sent_frames().is_empty());

        h.inbound(&audio_message(0.2));
        assert_eq!(h.rig.lock().unwrap().started.len(), 1);

        h.send(CallEvent::Command(CallCommand::ToggleMute));
        h.capture_window();
        h.pump_one().await;
        assert_eq!(h.sent_frames().len(), 1);
    }

    #[tokio::test]
    async fn stop_twice_is_harmless() {
        let mut h = harness(false, false, false);
        h.connect().await;
        h.inbound(&audio_message(0.5));
        h.send(CallEvent::Command(CallCommand::Stop));
        h.assert_released();
        assert_eq!(h.controller.state(), CallState::Idle);
        h.send(CallEvent::Command(CallCommand::Stop));
        h.assert_released();
        assert_eq!(h.controller.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn stop_with_queued_audio_stops_every_source() {
        let mut h = harness(false, false, false);
        h.connect().await;
        h.inbound(&audio_message(0.4));
        h.inbound(&audio_message(0.4));
        h.inbound(&audio_message(0.4));
        let started: Vec<SourceId> = h.rig.lock().unwrap().started.iter().map(|(id, _)| *id).collect();

        h.send(CallEvent::Command(CallCommand::Stop));
        let mut stopped = h.rig.lock().unwrap().stopped.clone();
        stopped.sort_unstable();
        assert_eq!(stopped, started);
        h.assert_released();
    }

    #[tokio::test]
    async fn stop_before_open_releases_late_resources() {
        let mut h = harness(false, false, true);
        h.send(CallEvent::Command(CallCommand::Start));
        assert_eq!(h.controller.state(), CallState::Connecting);
        h.send(CallEvent::Command(CallCommand::Stop));
        assert_eq!(h.controller.state(), CallState::Idle);

        // the microphone only shows up now, after the stop
        h.mic_gate.notify_one();
        h.pump_one().await;
        h.assert_released();
        assert!(h.rig.lock().unwrap().sessions.is_empty());
    }

    #[tokio::test]
    async fn late_session_of_abandoned_attempt_is_closed() {
        let mut h = harness(false, false, false);
        h.send(CallEvent::Command(CallCommand::Start));
        h.pump_one().await; // MicrophoneReady → connect spawned
        h.send(CallEvent::Command(CallCommand::Stop));
        h.pump_one().await; // SessionReady for the old attempt
        h.assert_released();
        assert_eq!(h.controller.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mut h = harness(false, false, false);
        h.connect().await;
        let attempt = h.attempt();
        h.send(CallEvent::Command(CallCommand::Start));
        assert_eq!(h.controller.state(), CallState::Active);
        assert_eq!(h.attempt(), attempt);
        assert_eq!(h.rig.lock().unwrap().inputs_open, 1);
        assert!(h.controller.handle().status().last_error.is_some());
    }

    #[tokio::test]
    async fn denied_microphone_fails_the_connect() {
        let mut h = harness(true, false, false);
        h.send(CallEvent::Command(CallCommand::Start));
        h.pump_one().await;
        assert_eq!(h.controller.state(), CallState::Idle);
        h.assert_released();
        let status = h.controller.handle().status();
        assert!(status.last_error.unwrap().contains("microphone"));
    }

    #[tokio::test]
    async fn refused_session_tears_everything_down() {
        let mut h = harness(false, true, false);
        h.send(CallEvent::Command(CallCommand::Start));
        h.pump_one().await;
        h.pump_one().await;
        assert_eq!(h.controller.state(), CallState::Idle);
        h.assert_released();
    }

    #[tokio::test]
    async fn remote_close_and_error_tear_down() {
        let mut h = harness(false, false, false);
        h.connect().await;
        let attempt = h.attempt();
        h.send(CallEvent::Session { attempt, event: NetEvent::Closed("bye".into()) });
        assert_eq!(h.controller.state(), CallState::Idle);
        h.assert_released();

        h.connect().await;
        let attempt = h.attempt();
        h.send(CallEvent::Session { attempt, event: NetEvent::Error("reset".into()) });
        assert_eq!(h.controller.state(), CallState::Idle);
        h.assert_released();
    }

    #[tokio::test]
    async fn stale_events_after_teardown_are_ignored() {
        let mut h = harness(false, false, false);
        h.connect().await;
        let old = h.attempt();
        h.send(CallEvent::Command(CallCommand::Stop));
        h.send(CallEvent::Session { attempt: old, event: NetEvent::Error("late".into()) });
        assert!(h.controller.handle().status().last_error.is_none());
        h.send(CallEvent::CaptureWindow { attempt: old, samples: vec![0.0; 16] });
        assert!(h.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn run_loop_drives_a_call_through_the_handle() {
        let h = harness(false, false, false);
        let handle = h.controller.handle();
        let mut status = handle.subscribe();
        let task = tokio::spawn(h.controller.run(h.rx));

        handle.start();
        while status.borrow_and_update().state != CallState::Active {
            status.changed().await.unwrap();
        }
        handle.stop();
        while status.borrow_and_update().state != CallState::Idle {
            status.changed().await.unwrap();
        }
        handle.shutdown();
        task.await.unwrap();
        assert_eq!(h.rig.lock().unwrap().mics_live, 0);
    }
}

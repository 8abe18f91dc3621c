use crate::config::Config;
use crate::controller::EventSink;
use crate::error::{CallError, CallResult};
use crate::protocol::{Blob, ClientMessage, RealtimeInput, ServerMessage, SetupMessage};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the live session reports back to the controller.
#[derive(Debug)]
pub enum NetEvent {
    Message(ServerMessage),
    Closed(String),
    Error(String),
}

#[derive(Debug)]
pub enum NetCommand {
    SendAudio(Blob),
    Close,
}

/// Owned reference to one open live session.
pub struct SessionHandle {
    tx: mpsc::Sender<NetCommand>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn new(tx: mpsc::Sender<NetCommand>, task: Option<JoinHandle<()>>) -> Self {
        Self { tx, task }
    }

    /// Queues one outbound frame without waiting.
    pub fn send_audio(&self, frame: Blob) -> bool {
        match self.tx.try_send(NetCommand::SendAudio(frame)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Live link saturated, dropping audio frame");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn close(mut self) {
        let _ = self.tx.try_send(NetCommand::Close);
        // the network task sends the close frame and exits on its own
        self.task.take();
    }
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Resolves once the server acknowledged the setup (the "open" point).
    async fn connect(&self, setup: SetupMessage, events: EventSink) -> CallResult<SessionHandle>;
}

pub struct LiveLink {
    config: Config,
}

impl LiveLink {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn endpoint(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(self.config.live_ws_url)?;
        url.query_pairs_mut().append_pair("key", &self.config.api_key);
        Ok(url)
    }

    // 建立连接，发送 setup，等待 setupComplete
    async fn open(&self, setup: SetupMessage) -> anyhow::Result<WsStream> {
        let url = self.endpoint()?;
        log::info!("Connecting to {}...", self.config.live_ws_url);
        let (mut ws, _) = connect_async(url.as_str()).await?;

        let setup_json = serde_json::to_string(&ClientMessage::Setup(setup))?;
        log::debug!("Sending setup: {}", setup_json);
        ws.send(Message::Text(setup_json.into())).await?;

        tokio::time::timeout(
            Duration::from_secs(self.config.setup_timeout_secs),
            wait_for_setup_complete(&mut ws),
        )
        .await
        .map_err(|_| anyhow!("timed out waiting for setupComplete"))??;

        log::info!("Live session open");
        Ok(ws)
    }
}

#[async_trait]
impl LiveConnector for LiveLink {
    async fn connect(&self, setup: SetupMessage, events: EventSink) -> CallResult<SessionHandle> {
        if !self.config.has_api_key() {
            return Err(CallError::Session("no API key configured".into()));
        }
        let ws = self
            .open(setup)
            .await
            .map_err(|e| CallError::Session(format!("{:#}", e)))?;

        let (tx, rx) = mpsc::channel::<NetCommand>(100);
        let task = tokio::spawn(async move {
            let event = match session_loop(ws, rx, &events).await {
                Ok(reason) => NetEvent::Closed(reason),
                Err(e) => NetEvent::Error(e.to_string()),
            };
            events.session(event);
        });
        Ok(SessionHandle::new(tx, Some(task)))
    }
}

async fn wait_for_setup_complete(ws: &mut WsStream) -> anyhow::Result<()> {
    while let Some(msg) = ws.next().await {
        match decode_frame(msg?) {
            Frame::Message(msg) if msg.is_setup_complete() => return Ok(()),
            Frame::Message(_) | Frame::Ignored => continue,
            Frame::Closed(reason) => bail!("server closed during setup: {}", reason),
        }
    }
    bail!("connection closed during setup")
}

enum Frame {
    Message(ServerMessage),
    Closed(String),
    Ignored,
}

// Text and binary frames both carry JSON; anything unparseable is skipped.
fn decode_frame(msg: Message) -> Frame {
    let parsed = match &msg {
        Message::Text(text) => serde_json::from_str::<ServerMessage>(text.as_str()),
        Message::Binary(data) => serde_json::from_slice::<ServerMessage>(data),
        Message::Close(frame) => {
            let reason = frame
                .as_ref()
                .map(|f| f.reason.as_str().to_string())
                .unwrap_or_default();
            return Frame::Closed(reason);
        }
        _ => return Frame::Ignored,
    };
    match parsed {
        Ok(msg) => Frame::Message(msg),
        Err(e) => {
            log::warn!("Ignoring undecodable server frame: {}", e);
            Frame::Ignored
        }
    }
}

// 主循环，处理读取和写入，返回关闭原因
async fn session_loop(
    ws: WsStream,
    mut rx_cmd: mpsc::Receiver<NetCommand>,
    events: &EventSink,
) -> anyhow::Result<String> {
    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(msg)) => match decode_frame(msg) {
                        Frame::Message(msg) => {
                            if !events.session(NetEvent::Message(msg)) {
                                let _ = write.send(Message::Close(None)).await;
                                return Ok("controller gone".into());
                            }
                        }
                        Frame::Closed(reason) => return Ok(reason),
                        Frame::Ignored => {}
                    },
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok("connection closed".into()),
                }
            }
            cmd = rx_cmd.recv() => {
                match cmd {
                    Some(NetCommand::SendAudio(blob)) => {
                        let input = ClientMessage::RealtimeInput(RealtimeInput { media_chunks: vec![blob] });
                        write.send(Message::Text(serde_json::to_string(&input)?.into())).await?;
                    }
                    Some(NetCommand::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok("closed locally".into());
                    }
                }
            }
        }
    }
}

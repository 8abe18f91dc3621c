use crate::config::Config;
use crate::prompts::CHAT_SYSTEM_INSTRUCTION;
use crate::protocol::{Content, TextPart};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const GREETING: &str = "¡Hola! Soy tu asistente municipal. ¿En qué trámite puedo orientarte hoy?";
pub const EMPTY_REPLY: &str =
    "Lo siento, tuve un problema procesando tu solicitud. ¿Podrías intentar de nuevo?";
pub const UNAVAILABLE_REPLY: &str = "En este momento no puedo responder. Por favor, intenta más tarde.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Model,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "Tú"),
            Role::Model => write!(f, "Asistente"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
}

impl ChatTurn {
    fn to_content(&self) -> Content {
        turn(self.role, &self.text)
    }
}

fn turn(role: Role, text: &str) -> Content {
    Content {
        role: Some(role.as_str().to_string()),
        parts: vec![TextPart {
            text: Some(text.to_string()),
        }],
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    pub generation_config: ChatGenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatGenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Deserialize, Default)]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
pub struct Candidate {
    pub content: Option<Content>,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate.
    pub fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect();
        Some(text)
    }
}

pub enum ChatOutcome {
    Reply(String),
    Empty,
    Error(String),
}

impl ChatOutcome {
    /// What the user sees; failures never end the conversation.
    pub fn into_reply(self) -> String {
        match self {
            ChatOutcome::Reply(text) => text,
            ChatOutcome::Empty => EMPTY_REPLY.to_string(),
            ChatOutcome::Error(e) => {
                log::error!("Chat request failed: {}", e);
                UNAVAILABLE_REPLY.to_string()
            }
        }
    }
}

pub struct ChatClient {
    client: Client,
    config: Config,
}

impl ChatClient {
    /// Every request, including reading the body, is bounded by `chat_timeout_secs`.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.chat_timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/{}:generateContent",
            self.config.chat_api_url.trim_end_matches('/'),
            self.config.chat_model
        )
    }

    /// System instruction first, then the prior turns, then the new message.
    pub fn build_request(&self, history: &[ChatTurn], message: &str) -> GenerateRequest {
        let mut contents = Vec::with_capacity(history.len() + 2);
        contents.push(turn(Role::User, CHAT_SYSTEM_INSTRUCTION));
        contents.extend(history.iter().map(ChatTurn::to_content));
        contents.push(turn(Role::User, message));
        GenerateRequest {
            contents,
            generation_config: ChatGenerationConfig {
                temperature: self.config.chat_temperature,
                top_p: self.config.chat_top_p,
                max_output_tokens: self.config.chat_max_output_tokens,
            },
        }
    }

    pub async fn send(&self, history: &[ChatTurn], message: &str) -> ChatOutcome {
        if !self.config.has_api_key() {
            return ChatOutcome::Error("no API key configured".into());
        }
        let body = self.build_request(history, message);
        log::debug!("Chat request with {} turns", body.contents.len());

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.config.api_key.as_str())])
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) => {
                if resp.status().is_success() {
                    match resp.json::<GenerateResponse>().await {
                        Ok(parsed) => match parsed.text() {
                            Some(text) if !text.trim().is_empty() => ChatOutcome::Reply(text),
                            _ => ChatOutcome::Empty,
                        },
                        Err(e) => ChatOutcome::Error(format!("JSON parse error: {}", e)),
                    }
                } else {
                    ChatOutcome::Error(format!("HTTP Error: {}", resp.status()))
                }
            }
            Err(e) if e.is_timeout() => ChatOutcome::Error(format!("Request timed out: {}", e)),
            Err(e) => ChatOutcome::Error(format!("Request failed: {}", e)),
        }
    }

    pub async fn reply(&self, history: &[ChatTurn], message: &str) -> String {
        self.send(history, message).await.into_reply()
    }
}

/// One text conversation, opened with the assistant's greeting.
pub struct ChatSession {
    client: ChatClient,
    history: Vec<ChatTurn>,
}

impl ChatSession {
    pub fn new(client: ChatClient) -> Self {
        Self {
            client,
            history: vec![ChatTurn {
                role: Role::Model,
                text: GREETING.to_string(),
            }],
        }
    }

    pub fn history(&self) -> &[ChatTurn] {
        &self.history
    }

    /// Returns `None` for blank input, which is not sent.
    pub async fn ask(&mut self, input: &str) -> Option<String> {
        let message = input.trim();
        if message.is_empty() {
            return None;
        }
        let reply = self.client.reply(&self.history, message).await;
        self.history.push(ChatTurn {
            role: Role::User,
            text: message.to_string(),
        });
        self.history.push(ChatTurn {
            role: Role::Model,
            text: reply.clone(),
        });
        Some(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_with(api_url: &'static str, key: &str) -> ChatClient {
        let mut config = Config::new().unwrap();
        config.chat_api_url = api_url;
        config.api_key = key.to_string();
        ChatClient::new(config).unwrap()
    }

    #[test]
    fn request_puts_instruction_first_and_message_last() {
        let client = client_with("https://example.com/v1beta/models", "k");
        let history = vec![ChatTurn { role: Role::Model, text: GREETING.into() }];
        let request = client.build_request(&history, "¿Cómo pago el predial?");
        let value = serde_json::to_value(&request).unwrap();

        let contents = value["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[0]["parts"][0]["text"], CHAT_SYSTEM_INSTRUCTION);
        assert_eq!(contents[1], json!({ "role": "model", "parts": [ { "text": GREETING } ] }));
        assert_eq!(contents[2]["parts"][0]["text"], "¿Cómo pago el predial?");

        let generation = &value["generationConfig"];
        assert_eq!(generation["maxOutputTokens"], 800);
        assert!((generation["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert!((generation["topP"].as_f64().unwrap() - 0.95).abs() < 1e-6);
    }

    #[test]
    fn endpoint_names_the_model_method() {
        let client = client_with("https://example.com/v1beta/models/", "k");
        assert_eq!(
            client.endpoint(),
            format!("https://example.com/v1beta/models/{}:generateContent", client.config.chat_model)
        );
    }

    #[test]
    fn response_text_comes_from_first_candidate() {
        let parsed: GenerateResponse = serde_json::from_value(json!({
            "candidates": [
                { "content": { "role": "model", "parts": [ { "text": "Hola, " }, { "text": "ciudadano" } ] } },
                { "content": { "parts": [ { "text": "ignored" } ] } }
            ]
        }))
        .unwrap();
        assert_eq!(parsed.text().as_deref(), Some("Hola, ciudadano"));

        let empty: GenerateResponse = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty.text(), None);
    }

    #[test]
    fn outcomes_fall_back_to_fixed_replies() {
        assert_eq!(ChatOutcome::Reply("ok".into()).into_reply(), "ok");
        assert_eq!(ChatOutcome::Empty.into_reply(), EMPTY_REPLY);
        assert_eq!(ChatOutcome::Error("boom".into()).into_reply(), UNAVAILABLE_REPLY);
    }

    #[tokio::test]
    async fn unreachable_endpoint_yields_apology_and_keeps_history() {
        let client = client_with("http://127.0.0.1:9/v1beta/models", "k");
        let mut session = ChatSession::new(client);
        let reply = session.ask("  hola  ").await;
        assert_eq!(reply.as_deref(), Some(UNAVAILABLE_REPLY));
        assert_eq!(session.history().len(), 3);
        assert_eq!(session.history()[1].text, "hola");
    }

    #[tokio::test]
    async fn silent_server_times_out_with_apology() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accepts and then never answers
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut config = Config::new().unwrap();
        config.chat_api_url = Box::leak(format!("http://{}/v1beta/models", addr).into_boxed_str());
        config.api_key = "k".into();
        config.chat_timeout_secs = 1;
        let mut session = ChatSession::new(ChatClient::new(config).unwrap());

        let reply = tokio::time::timeout(Duration::from_secs(8), session.ask("hola"))
            .await
            .expect("chat turn must finish within its timeout");
        assert_eq!(reply.as_deref(), Some(UNAVAILABLE_REPLY));
        assert_eq!(session.history().len(), 3);
        server.abort();
    }

    #[tokio::test]
    async fn blank_input_is_not_sent() {
        let mut session = ChatSession::new(client_with("http://127.0.0.1:9/", "k"));
        assert_eq!(session.ask("   ").await, None);
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.history()[0].text, GREETING);
    }
}

/// Environment variables checked, in order, for the API credential.
const API_KEY_VARS: [&str; 2] = ["API_KEY", "GEMINI_API_KEY"];

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 音频参数
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u16,
    pub capture_window: usize,
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub playback_period_size: usize,

    // Live audio session
    pub live_ws_url: &'static str,
    pub live_model: &'static str,
    pub voice_name: &'static str,
    pub setup_timeout_secs: u64,

    // Text chat
    pub chat_api_url: &'static str,
    pub chat_model: &'static str,
    pub chat_temperature: f32,
    pub chat_top_p: f32,
    pub chat_max_output_tokens: u32,
    pub chat_timeout_secs: u64,

    // Credential (runtime override of the build-time default)
    pub api_key: String,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// All values come from config.toml through build.rs.
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            input_sample_rate: env!("AUDIO_INPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_INPUT_SAMPLE_RATE")?,
            output_sample_rate: env!("AUDIO_OUTPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_OUTPUT_SAMPLE_RATE")?,
            channels: env!("AUDIO_CHANNELS").parse()
                .map_err(|_| "Failed to parse AUDIO_CHANNELS")?,
            capture_window: env!("AUDIO_CAPTURE_WINDOW").parse()
                .map_err(|_| "Failed to parse AUDIO_CAPTURE_WINDOW")?,
            capture_device: env!("AUDIO_CAPTURE_DEVICE"),
            playback_device: env!("AUDIO_PLAYBACK_DEVICE"),
            playback_period_size: env!("AUDIO_PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse AUDIO_PLAYBACK_PERIOD_SIZE")?,

            live_ws_url: env!("LIVE_WS_URL"),
            live_model: env!("LIVE_MODEL"),
            voice_name: env!("LIVE_VOICE_NAME"),
            setup_timeout_secs: env!("LIVE_SETUP_TIMEOUT_SECS").parse()
                .map_err(|_| "Failed to parse LIVE_SETUP_TIMEOUT_SECS")?,

            chat_api_url: env!("CHAT_API_URL"),
            chat_model: env!("CHAT_MODEL"),
            chat_temperature: env!("CHAT_TEMPERATURE").parse()
                .map_err(|_| "Failed to parse CHAT_TEMPERATURE")?,
            chat_top_p: env!("CHAT_TOP_P").parse()
                .map_err(|_| "Failed to parse CHAT_TOP_P")?,
            chat_max_output_tokens: env!("CHAT_MAX_OUTPUT_TOKENS").parse()
                .map_err(|_| "Failed to parse CHAT_MAX_OUTPUT_TOKENS")?,
            chat_timeout_secs: env!("CHAT_TIMEOUT_SECS").parse()
                .map_err(|_| "Failed to parse CHAT_TIMEOUT_SECS")?,

            api_key: env!("DEFAULT_API_KEY").to_string(),
        })
    }

    /// Replaces the baked-in credential with the first non-empty runtime value.
    pub fn apply_env_overrides(&mut self) {
        if let Some(key) = resolve_api_key(|name| std::env::var(name).ok()) {
            self.api_key = key;
        }
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

fn resolve_api_key(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    API_KEY_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_time_values_parse() {
        let config = Config::new().unwrap();
        assert_eq!(config.input_sample_rate, 16000);
        assert_eq!(config.output_sample_rate, 24000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.capture_window, 4096);
        assert_eq!(config.voice_name, "Kore");
        assert!(config.chat_timeout_secs > 0);
    }

    #[test]
    fn api_key_prefers_first_non_empty_variable() {
        let key = resolve_api_key(|name| match name {
            "API_KEY" => Some("  ".to_string()),
            "GEMINI_API_KEY" => Some("secret".to_string()),
            _ => None,
        });
        assert_eq!(key.as_deref(), Some("secret"));

        let key = resolve_api_key(|name| (name == "API_KEY").then(|| "primary".to_string()));
        assert_eq!(key.as_deref(), Some("primary"));

        assert_eq!(resolve_api_key(|_| None), None);
    }
}

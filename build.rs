use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    audio: Audio,
    live: Live,
    chat: Chat,
    credentials: Credentials,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Audio {
    input_sample_rate: u32,
    output_sample_rate: u32,
    channels: u16,
    capture_window: usize,
    capture_device: String,
    playback_device: String,
    playback_period_size: usize,
}

#[derive(Deserialize)]
struct Live {
    ws_url: String,
    model: String,
    voice_name: String,
    setup_timeout_secs: u64,
}

#[derive(Deserialize)]
struct Chat {
    api_url: String,
    model: String,
    temperature: f32,
    top_p: f32,
    max_output_tokens: u32,
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct Credentials {
    api_key: String,
}

// Read config.toml at compile time and export every value as an env var
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // Audio
    println!("cargo:rustc-env=AUDIO_INPUT_SAMPLE_RATE={}", config.audio.input_sample_rate);
    println!("cargo:rustc-env=AUDIO_OUTPUT_SAMPLE_RATE={}", config.audio.output_sample_rate);
    println!("cargo:rustc-env=AUDIO_CHANNELS={}", config.audio.channels);
    println!("cargo:rustc-env=AUDIO_CAPTURE_WINDOW={}", config.audio.capture_window);
    println!("cargo:rustc-env=AUDIO_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);

    // Live audio session
    println!("cargo:rustc-env=LIVE_WS_URL={}", config.live.ws_url);
    println!("cargo:rustc-env=LIVE_MODEL={}", config.live.model);
    println!("cargo:rustc-env=LIVE_VOICE_NAME={}", config.live.voice_name);
    println!("cargo:rustc-env=LIVE_SETUP_TIMEOUT_SECS={}", config.live.setup_timeout_secs);

    // Text chat
    println!("cargo:rustc-env=CHAT_API_URL={}", config.chat.api_url);
    println!("cargo:rustc-env=CHAT_MODEL={}", config.chat.model);
    println!("cargo:rustc-env=CHAT_TEMPERATURE={}", config.chat.temperature);
    println!("cargo:rustc-env=CHAT_TOP_P={}", config.chat.top_p);
    println!("cargo:rustc-env=CHAT_MAX_OUTPUT_TOKENS={}", config.chat.max_output_tokens);
    println!("cargo:rustc-env=CHAT_TIMEOUT_SECS={}", config.chat.timeout_secs);

    println!("cargo:rustc-env=DEFAULT_API_KEY={}", config.credentials.api_key);
}

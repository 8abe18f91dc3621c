mod audio;
mod catalog;
mod chat;
mod config;
mod console;
mod controller;
mod error;
mod net_link;
mod prompts;
mod protocol;
mod state_machine;

use chat::{ChatClient, ChatSession};
use config::Config;
use console::ConsoleCommand;
use controller::CallController;
use net_link::LiveLink;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 加载配置
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    config.apply_env_overrides();
    if !config.has_api_key() {
        log::warn!("No API key set (API_KEY / GEMINI_API_KEY); chat and voice will not connect");
    }
    log::info!("{} v{} starting", config.app_name, config.app_version);

    // 音频后端 + 实时语音会话
    let backend = audio::default_backend(&config);
    let connector = Arc::new(LiveLink::new(config.clone()));
    let (controller, rx_events) = CallController::new(config.clone(), backend, connector);
    let call = controller.handle();
    let controller_task = tokio::spawn(controller.run(rx_events));

    // 文本聊天在独立任务中运行，不阻塞主循环
    let mut chat = ChatSession::new(ChatClient::new(config.clone())?);
    let (tx_chat, mut rx_chat) = mpsc::channel::<String>(4);
    tokio::spawn(async move {
        while let Some(text) = rx_chat.recv().await {
            if let Some(reply) = chat.ask(&text).await {
                println!("Asistente: {}", reply);
            }
        }
    });

    let mut status = call.subscribe();
    let mut last_shown = status.borrow().clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", chat::GREETING);
    println!("{}", console::HELP);

    loop {
        tokio::select! {
            // 监听 Ctrl+C 信号
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }

            // 通话状态变化
            changed = status.changed() => {
                if changed.is_err() {
                    log::warn!("Call controller stopped unexpectedly");
                    break;
                }
                let current = status.borrow_and_update().clone();
                if console::status_changed(&last_shown, &current) {
                    println!("[{}]", console::render_status(&current));
                    last_shown = current;
                }
            }

            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Failed to read stdin: {}", e);
                        break;
                    }
                };
                let Some(cmd) = ConsoleCommand::parse(&line) else {
                    continue;
                };
                match cmd {
                    ConsoleCommand::Call => {
                        call.start();
                    }
                    ConsoleCommand::HangUp => {
                        call.stop();
                    }
                    ConsoleCommand::ToggleMute => {
                        call.toggle_mute();
                    }
                    ConsoleCommand::Status => println!("{}", console::render_status(&call.status())),
                    ConsoleCommand::Chat(text) => {
                        if tx_chat.try_send(text).is_err() {
                            println!("El asistente aún está respondiendo. Intenta en un momento.");
                        }
                    }
                    ConsoleCommand::Track(radicado) => println!("{}", console::render_seguimiento(&radicado)),
                    ConsoleCommand::Areas => println!("{}", console::render_areas()),
                    ConsoleCommand::Tramites(area) => println!("{}", console::render_tramites(area.as_deref())),
                    ConsoleCommand::Help => println!("{}", console::HELP),
                    ConsoleCommand::Quit => break,
                    ConsoleCommand::Unknown(input) => {
                        println!("Comando no reconocido: {}. Escribe 'ayuda'.", input);
                    }
                }
            }
        }
    }

    // 结束前挂断并释放音频设备
    call.shutdown();
    if let Err(e) = controller_task.await {
        log::error!("Controller task failed: {}", e);
    }
    Ok(())
}

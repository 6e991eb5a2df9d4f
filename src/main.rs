//! Fireside - Local LLM Chat
//!
//! Loads a local quantized model and streams generated answers into the
//! terminal, token by token.

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fireside::app::ChatApp;
use fireside::config;
use fireside::inference::{FinishReason, StreamEvent};

#[tokio::main]
async fn main() {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("fireside=info".parse().unwrap()))
        .init();

    info!("Starting Fireside v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = config::load_settings();
    if let Some(dir) = std::env::args().nth(1) {
        settings.model_dir = PathBuf::from(dir);
    }

    let mut app = ChatApp::new(settings);

    println!("Loading model...");
    let model_info = match app.load_model() {
        Ok(info) => info,
        Err(e) => {
            error!("Failed to load model from {:?}: {e}", app.settings().model_dir);
            std::process::exit(1);
        }
    };
    println!("{}", model_info.load_report());
    println!("Type a prompt and press enter. Ctrl-C stops a running answer.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\n> ");
        let _ = std::io::stdout().flush();

        let prompt = match lines.next_line().await {
            Ok(Some(line)) => line,
            // EOF or a broken stdin both end the session
            _ => break,
        };
        let prompt = prompt.trim();
        if prompt.is_empty() {
            continue;
        }

        let (mut events, stop_signal) = match app.ask(prompt) {
            Ok(stream) => stream,
            Err(e) => {
                error!("{e}");
                continue;
            }
        };

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(StreamEvent::Fragment(text)) => {
                        print!("{text}");
                        let _ = std::io::stdout().flush();
                    }
                    Some(StreamEvent::Done(reason)) => {
                        println!();
                        if reason == FinishReason::Cancelled {
                            info!("Generation cancelled");
                        }
                        break;
                    }
                    Some(StreamEvent::Error(e)) => {
                        println!();
                        error!("Generation failed: {e}");
                        break;
                    }
                    None => {
                        println!();
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    stop_signal.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    info!("Shutting down");
}

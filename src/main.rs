//! aibridge - JSON-RPC bridge to a conversational AI backend
//!
//! Runs either on stdin/stdout (pipe mode, the default) or as an HTTP
//! front-end exposing the SSE and chunked streaming transports.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use serde_json::json;

use aibridge::ai::{AiClient, HttpAiClient, ScriptedAiClient};
use aibridge::config::BridgeConfig;
use aibridge::engine::{EngineConfig, ProtocolEngine};
use aibridge::history::ConversationHistory;
use aibridge::logging;
use aibridge::requests::RequestTracker;
use aibridge::server::{self, HttpServerConfig};
use aibridge::session::SessionRegistry;
use aibridge::transport::{PipeTransport, Transport};

enum RunMode {
    Pipe,
    Http,
}

struct CliArgs {
    mode: RunMode,
    config_path: Option<PathBuf>,
    log_level: Option<String>,
}

const USAGE: &str = "\
Usage: aibridge [OPTIONS]

Options:
  --stdio              Serve JSON-RPC on stdin/stdout (default)
  --http               Serve the SSE and chunked HTTP transports
  --config <PATH>      Load configuration from PATH instead of the defaults
  --log-level <LEVEL>  Override the configured log level
  -h, --help           Print this help
";

fn parse_args() -> Result<CliArgs, String> {
    let mut args = CliArgs {
        mode: RunMode::Pipe,
        config_path: None,
        log_level: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--stdio" => args.mode = RunMode::Pipe,
            "--http" => args.mode = RunMode::Http,
            "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| "--config requires a path".to_string())?;
                args.config_path = Some(PathBuf::from(path));
            }
            "--log-level" => {
                let level = iter
                    .next()
                    .ok_or_else(|| "--log-level requires a value".to_string())?;
                args.log_level = Some(level);
            }
            "-h" | "--help" => {
                print!("{USAGE}");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument '{other}'")),
        }
    }
    Ok(args)
}

fn build_ai_client(config: &BridgeConfig) -> Arc<dyn AiClient> {
    match &config.upstream.base_url {
        Some(base_url) if !base_url.is_empty() => {
            let mut client = HttpAiClient::new(base_url);
            if let Some(api_key) = &config.upstream.api_key {
                client = client.with_api_key(api_key);
            }
            if let Some(agent) = &config.upstream.agent {
                client = client.with_default_agent(agent);
            }
            tracing::info!(base_url = %base_url, "using HTTP AI backend");
            Arc::new(client)
        }
        _ => {
            tracing::info!("no upstream configured, using scripted AI backend");
            Arc::new(ScriptedAiClient::acknowledging())
        }
    }
}

fn build_engine(config: &BridgeConfig) -> Arc<ProtocolEngine> {
    let sessions = Arc::new(SessionRegistry::new(config.session.ttl()));
    let requests = RequestTracker::new(config.request.timeout());
    let history = Arc::new(ConversationHistory::new(config.history.max_messages));
    let ai = build_ai_client(config);
    let engine = ProtocolEngine::new(sessions, requests, history, ai, Vec::new(), EngineConfig::default());
    Arc::clone(engine.sessions()).spawn_sweeper(config.session.sweep_interval());
    engine
}

/// Pipe mode: one session for the lifetime of the process, bridged over
/// stdin/stdout
async fn run_pipe(engine: Arc<ProtocolEngine>) -> aibridge::Result<()> {
    let session = engine.sessions().create_session(HashMap::from([(
        "transport".to_string(),
        json!("pipe"),
    )]));
    tracing::info!(session_id = %session.id, "pipe transport ready");

    let transport = Arc::new(PipeTransport::stdio(&session.id));
    transport.set_close_hook(engine.disconnect_hook(&session.id));
    engine.attach(transport.clone() as Arc<dyn Transport>).await;
    Arc::clone(&transport).start().await?;

    // The read loop owns stdin; hold the process open until it ends or the
    // operator interrupts.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(std::time::Duration::from_millis(200)) => {
                if transport.is_closed() {
                    break;
                }
            }
        }
    }
    transport.close().await;
    Ok(())
}

async fn run(args: CliArgs) -> aibridge::Result<()> {
    let mut config = match &args.config_path {
        Some(path) => BridgeConfig::load_from_file(path)?,
        None => BridgeConfig::load()?,
    };
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    logging::init_logging(&config.logging);

    let engine = build_engine(&config);
    let result = match args.mode {
        RunMode::Pipe => run_pipe(Arc::clone(&engine)).await,
        RunMode::Http => {
            let http = HttpServerConfig {
                bind: config.server.bind_addr(),
                heartbeat: config.sse.heartbeat(),
                ..HttpServerConfig::default()
            };
            server::serve(Arc::clone(&engine), http).await
        }
    };

    // Shutdown path: cancel in-flight work and close bound transports
    // through the registry's cleanup hook.
    let dropped = engine.sessions().clear_all();
    if dropped > 0 {
        tracing::info!(count = dropped, "cleared sessions on shutdown");
    }
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {e}\n\n{USAGE}");
            return ExitCode::from(2);
        }
    };

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

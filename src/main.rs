// Main entry point for the PolicyShield server and CLI

use clap::{Parser, Subcommand};
use policyshield::api::{create_router, handlers, AppState};
use policyshield::config::ShieldConfig;
use policyshield::core::models::ShieldMode;
use policyshield::engine::shield::ShieldEngineBuilder;
use policyshield::loader::rule_loader::load_rules;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal;
use tracing::{error, info};

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_RUNTIME_ERROR: u8 = 2;

#[derive(Parser)]
#[command(name = "policyshield", version, about = "Policy enforcement point for AI-agent tool calls")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One-shot verdict for a tool call against a rule file
    Check {
        /// Rule YAML file or directory
        #[arg(long)]
        rules: PathBuf,
        /// Tool name to check
        #[arg(long)]
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Session id
        #[arg(long, default_value = "default")]
        session: String,
        /// Operating mode (ENFORCE, AUDIT, DISABLED)
        #[arg(long, default_value = "ENFORCE")]
        mode: String,
    },
    /// Run the HTTP server
    Serve {
        /// Config file (default: ./policyshield.yaml or POLICYSHIELD_CONFIG)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the rules path from the config
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Override the bind address
        #[arg(long)]
        bind: Option<String>,
        /// Override the port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Ask a running server to reload its rules
    Reload {
        /// Base URL of the running server
        #[arg(long, default_value = "http://127.0.0.1:8100")]
        url: String,
        /// Bearer token (default: POLICYSHIELD_API_TOKEN)
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Check {
            rules,
            tool,
            args,
            session,
            mode,
        } => run_check(rules, &tool, &args, &session, &mode),
        Commands::Serve {
            config,
            rules,
            bind,
            port,
        } => run_serve(config, rules, bind, port).await,
        Commands::Reload { url, token } => run_reload(&url, token).await,
    }
}

fn run_check(rules: PathBuf, tool: &str, args: &str, session: &str, mode: &str) -> ExitCode {
    let mode: ShieldMode = match mode.parse() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let args: serde_json::Value = match serde_json::from_str(args) {
        Ok(serde_json::Value::Object(map)) => serde_json::Value::Object(map),
        Ok(_) => {
            eprintln!("Configuration error: --args must be a JSON object");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
        Err(e) => {
            eprintln!("Configuration error: invalid --args JSON: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let rule_set = match load_rules(&rules) {
        Ok(rule_set) => rule_set,
        Err(e) => {
            eprintln!("Rule load error: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let engine = match ShieldEngineBuilder::from_rule_set(rule_set).mode(mode).build() {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let result = engine.check_with(tool, args, session, None, None);
    match serde_json::to_string_pretty(&result) {
        Ok(rendered) => {
            println!("{}", rendered);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Runtime error: {}", e);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

async fn run_serve(
    config_path: Option<PathBuf>,
    rules: Option<PathBuf>,
    bind: Option<String>,
    port: Option<u16>,
) -> ExitCode {
    // Load and validate configuration before any logging
    let mut config = match ShieldConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    if let Some(rules) = rules {
        config.rules_path = rules;
    }
    if let Some(bind) = bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    if let Err(e) = init_tracing(&config) {
        eprintln!("Configuration error: {}", e);
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    info!("Starting PolicyShield");

    let engine = match config.build_engine() {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Failed to build engine");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    info!(
        rules = engine.rule_count(),
        mode = engine.mode().as_str(),
        "Engine initialized"
    );

    let addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let state = AppState::new(engine.clone(), config);
    handlers::spawn_background_tasks(&state);
    let router = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %addr, "Failed to bind to address");
            return ExitCode::from(EXIT_RUNTIME_ERROR);
        }
    };
    info!(addr = %addr, "Server listening");

    let served = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Flush buffered traces before exit
    engine.flush_traces();

    match served {
        Ok(()) => {
            info!("Server shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Server error");
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

async fn run_reload(url: &str, token: Option<String>) -> ExitCode {
    let token = token.or_else(ShieldConfig::api_token);
    let client = reqwest::Client::new();
    let mut request = client.post(format!("{}/api/v1/reload", url.trim_end_matches('/')));
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }

    match request.send().await {
        Ok(response) if response.status().is_success() => {
            match response.text().await {
                Ok(body) => println!("{}", body),
                Err(_) => println!("{{\"status\": \"ok\"}}"),
            }
            ExitCode::SUCCESS
        }
        Ok(response) => {
            eprintln!("Reload failed: HTTP {}", response.status());
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
        Err(e) => {
            eprintln!("Reload failed: {}", e);
            ExitCode::from(EXIT_RUNTIME_ERROR)
        }
    }
}

/// Initialize the tracing subscriber from config values.
fn init_tracing(config: &ShieldConfig) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt()
        .with_target(false)
        .with_env_filter(filter);

    if config.log_format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Graceful shutdown on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            info!("SIGTERM received, starting graceful shutdown");
        },
    }
}

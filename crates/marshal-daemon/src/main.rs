//! marshal - execution control plane daemon.
//!
//! `marshal serve` exposes the control plane over HTTP until Ctrl-C.
//! `marshal exec <name> [json]` dispatches one call and asks for approval on
//! the terminal.

mod prompt;

use std::error::Error;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use marshal_core::approval::Origin;
use marshal_core::paths::default_config_path;
use marshal_core::{load_config, ControlPlane, ControlPlaneConfig, EventBus, ToolCall};
use marshal_http::{HttpApprover, SharedState};
use serde_json::Value;

use crate::prompt::TerminalPrompter;

type DaemonResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Execution control plane for autonomous agents.
#[derive(Parser, Debug)]
#[command(name = "marshal", version, about)]
struct Cli {
    /// Config file (default: ~/.config/marshal/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Skip every approval prompt
    #[arg(long, global = true)]
    autonomous: bool,

    /// Address to bind the HTTP server to
    #[arg(long, global = true, default_value = "127.0.0.1")]
    host: String,

    /// Port for the HTTP server
    #[arg(long, global = true, default_value_t = 7878)]
    port: u16,

    /// Bearer token required by the HTTP server
    #[arg(long, global = true, env = "MARSHAL_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Browser origin allowed to call the HTTP API (repeatable)
    #[arg(long = "allow-origin", global = true, value_name = "ORIGIN")]
    allow_origins: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP/WebSocket API (default)
    Serve,

    /// Run a single capability and print its result
    Exec {
        /// Capability name, e.g. shell or process
        name: String,

        /// Arguments as a JSON object
        args: Option<String>,

        /// Who the call is attributed to
        #[arg(long, default_value = "interactive")]
        origin: Origin,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> DaemonResult<ExitCode> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let config = load_config(&config_path)?;
    log::debug!("config loaded from {}", config_path.display());

    match cli.command {
        None | Some(Commands::Serve) => serve(&cli, config).await,
        Some(Commands::Exec {
            ref name,
            ref args,
            origin,
        }) => exec(&cli, config, name, args.as_deref(), origin).await,
    }
}

async fn serve(cli: &Cli, config: ControlPlaneConfig) -> DaemonResult<ExitCode> {
    let event_bus = Arc::new(EventBus::new());
    let approvals = Arc::new(HttpApprover::new(Arc::clone(&event_bus)));
    let plane = ControlPlane::builder()
        .config(config)
        .event_bus(event_bus)
        .remote_approver(approvals.clone())
        .build();
    if cli.autonomous {
        plane.set_autonomous(true);
    }
    plane.start();

    let state = SharedState::new(plane.clone(), Arc::clone(&approvals))
        .with_auth_token(cli.token.clone())
        .with_allowed_origins(cli.allow_origins.iter().cloned());
    if state.auth_token.is_none() && !is_loopback(&cli.host) {
        log::warn!(
            "serving on {} without an auth token; set --token or MARSHAL_TOKEN",
            cli.host
        );
    }

    let mut server = marshal_http::start(Arc::new(state), &cli.host, cli.port).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");

    let abandoned = approvals.abandon_all();
    if abandoned > 0 {
        log::info!("{} pending approval(s) abandoned", abandoned);
    }
    plane.shutdown().await;
    server.stop().await;
    Ok(ExitCode::SUCCESS)
}

async fn exec(
    cli: &Cli,
    config: ControlPlaneConfig,
    name: &str,
    args: Option<&str>,
    origin: Origin,
) -> DaemonResult<ExitCode> {
    let args = foreground_only(name, parse_args(args)?);
    let plane = ControlPlane::builder()
        .config(config)
        .prompter(Arc::new(TerminalPrompter))
        .build();
    if cli.autonomous {
        plane.set_autonomous(true);
    }

    let call = ToolCall::new(name, args).with_origin(origin);
    let cancel = call.cancel.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = plane.execute(&call).await;
    interrupt.abort();
    plane.shutdown().await;

    if result.is_error {
        eprintln!("{}", result.content);
        Ok(ExitCode::FAILURE)
    } else {
        println!("{}", result.content);
        Ok(ExitCode::SUCCESS)
    }
}

fn parse_args(raw: Option<&str>) -> DaemonResult<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(Default::default()));
    };
    let value: Value =
        serde_json::from_str(raw).map_err(|e| format!("Invalid JSON arguments: {e}"))?;
    if !value.is_object() {
        return Err("Arguments must be a JSON object".into());
    }
    Ok(value)
}

/// A one-shot `exec` tears its sessions down on exit, so shell commands
/// always run in the foreground here.
fn foreground_only(name: &str, mut args: Value) -> Value {
    if name != "shell" {
        return args;
    }
    if let Some(map) = args.as_object_mut() {
        let background = map.remove("background").is_some_and(|v| v == Value::Bool(true));
        let yield_ms = map.remove("yieldMs").is_some();
        if background || yield_ms {
            log::info!("exec runs shell commands in the foreground; background options ignored");
        }
    }
    args
}

fn is_loopback(host: &str) -> bool {
    host == "localhost"
        || host
            .parse::<std::net::IpAddr>()
            .is_ok_and(|ip| ip.is_loopback())
}

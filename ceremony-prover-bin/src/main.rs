use ceremony_prover_lib::api;
use ceremony_prover_lib::config::ServiceConfig;
use ceremony_prover_lib::context::ServiceContext;
use ceremony_prover_lib::state::ParameterStore;
use ceremony_prover_lib::types::CircuitInfo;
use ceremony_prover_lib::ExternalInput;
use clap::{Args, Parser, Subcommand};
use color_eyre::{Result, eyre::Context};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "ceremony_prover=info,ceremony_prover_lib=info,tower_http=info";

#[derive(Parser, Debug)]
#[command(name = "ceremony-prover")]
#[command(about = "Trusted-setup ceremonies and Groth16 proof generation")]
struct Cli {
    /// TOML service configuration
    #[arg(short, long, env = "CEREMONY_PROVER_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides `data_dir` from the configuration
    #[arg(long, env = "CEREMONY_PROVER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API
    Serve {
        /// Overrides `bind_addr` from the configuration
        #[arg(long, env = "CEREMONY_PROVER_BIND")]
        bind: Option<String>,
    },
    /// Ceremony operations against the local store
    #[command(subcommand)]
    Ceremony(CeremonyCommand),
    /// Circuit registry operations against the local store
    #[command(subcommand)]
    Circuit(CircuitCommand),
}

#[derive(Subcommand, Debug)]
enum CeremonyCommand {
    /// Run or resume a ceremony instance
    Run {
        #[arg(long)]
        instance_id: String,
        /// Plan name from the configuration
        #[arg(long)]
        plan: Option<String>,
        /// External input as KEY=VALUE, repeatable
        #[arg(long = "input", value_parser = parse_key_value)]
        inputs: Vec<(String, String)>,
    },
    /// Print the stored record of a ceremony instance
    Status {
        #[arg(long)]
        instance_id: String,
    },
}

#[derive(Subcommand, Debug)]
enum CircuitCommand {
    /// Register (or replace) a circuit
    Register(RegisterArgs),
    /// List registered circuits
    List,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    name: String,
    /// Store slot holding the proving key
    #[arg(long)]
    parameter_slot: String,
    /// Witness generator (.wasm)
    #[arg(long)]
    wasm: PathBuf,
    /// Ceremony instance that must be COMPLETE before proofs are served
    #[arg(long)]
    ceremony: Option<String>,
    /// Store slot holding the verification key
    #[arg(long)]
    verification_key_slot: Option<String>,
    #[arg(long)]
    description: Option<String>,
}

fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got `{}`", raw))
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ServiceConfig::load(path)
            .with_context(|| format!("Loading configuration from {}", path.display()))?,
        None => ServiceConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let shutdown = CancellationToken::new();
    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            serve(config, shutdown).await
        }
        Command::Ceremony(command) => run_ceremony_command(config, shutdown, command).await,
        Command::Circuit(command) => run_circuit_command(config, shutdown, command),
    }
}

async fn serve(config: ServiceConfig, shutdown: CancellationToken) -> Result<()> {
    let bind_addr = config.bind_addr.clone();
    let ctx = ServiceContext::new(config, shutdown.clone()).context("Initializing service")?;
    let app = api::router(ctx);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Binding {}", bind_addr))?;
    info!("Listening on {}", bind_addr);

    spawn_signal_handler(shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server")?;

    info!("Server stopped");
    Ok(())
}

async fn run_ceremony_command(
    config: ServiceConfig,
    shutdown: CancellationToken,
    command: CeremonyCommand,
) -> Result<()> {
    let ctx = ServiceContext::new(config, shutdown.clone()).context("Initializing service")?;
    match command {
        CeremonyCommand::Run {
            instance_id,
            plan,
            inputs,
        } => {
            spawn_signal_handler(shutdown);
            let external_input: ExternalInput = inputs.into_iter().collect();
            let instance = ctx
                .run_ceremony(instance_id.clone(), plan, external_input)
                .await
                .with_context(|| format!("Running ceremony {}", instance_id))?;
            print_json(&instance)
        }
        CeremonyCommand::Status { instance_id } => {
            let instance = ctx.orchestrator().instance(&instance_id)?;
            print_json(&instance)
        }
    }
}

fn run_circuit_command(
    config: ServiceConfig,
    shutdown: CancellationToken,
    command: CircuitCommand,
) -> Result<()> {
    match command {
        CircuitCommand::Register(args) => {
            let ctx = ServiceContext::new(config, shutdown).context("Initializing service")?;
            let info = CircuitInfo {
                name: args.name,
                description: args.description,
                parameter_slot: args.parameter_slot,
                ceremony_instance: args.ceremony,
                wasm_path: args.wasm,
                verification_key_slot: args.verification_key_slot,
            };
            ctx.proof_service()
                .register_circuit(&info)
                .with_context(|| format!("Registering circuit {}", info.name))?;
            print_json(&info)
        }
        // Read-only: no context, so configured circuits are not re-registered
        CircuitCommand::List => {
            let store = ParameterStore::new(config.data_dir).context("Opening parameter store")?;
            print_json(&store.list_circuits()?)
        }
    }
}

/// Ctrl-C cancels the token: the server drains and a running stage is
/// abandoned without committing, leaving the instance resumable.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    });
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

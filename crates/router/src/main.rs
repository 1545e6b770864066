mod api;
mod beacon;
mod single_instance;
mod streaming;


use anyhow::{Context, Result};
use api::AppState;
use beacon::NetworkBeacon;
use clap::{Args, Parser, Subcommand};
use lemonade_catalog::{paths, Catalog};
use lemonade_common::ModelList;
use lemonade_runtime::{http, ManagerConfig, ModelManager, WrappedServerFactory};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, RwLock};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_FAILURE: i32 = 1;
const EXIT_ALREADY_RUNNING: i32 = 2;
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_HOST: &str = "localhost";
const STATUS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const EPHEMERAL_START_TIMEOUT_MS: u64 = 10_000;

#[derive(Parser)]
#[command(name = "lemonade-router", version, about = "Local router for on-device inference backends")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve(ServeArgs),
    /// Report whether a server is running
    Status(EndpointArgs),
    /// Stop a running server
    Stop(EndpointArgs),
    /// List catalog models and their downloaded state
    List,
    /// Register models in the catalog
    Pull(PullArgs),
    /// Delete models and their artifacts
    Delete(DeleteArgs),
    /// Reserved
    Run,
}

#[derive(Args, Clone)]
struct ServeArgs {
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Context size for loaded models
    #[arg(long)]
    ctx_size: Option<i64>,
    /// LlamaCpp backend to use (vulkan, rocm, metal, cpu)
    #[arg(long = "llamacpp")]
    llamacpp_backend: Option<String>,
    /// Custom arguments to pass to llama-server (must not conflict with managed args)
    #[arg(long)]
    llamacpp_args: Option<String>,
    /// Max loaded models per class, in the order LLM, embedding, reranker, audio
    #[arg(long = "max-loaded-models", num_args = 1..=4)]
    max_loaded_models: Vec<usize>,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            log_level: "error".to_string(),
            ctx_size: None,
            llamacpp_backend: None,
            llamacpp_args: None,
            max_loaded_models: Vec::new(),
        }
    }
}

impl ServeArgs {
    fn manager_config(&self) -> ManagerConfig {
        let mut server_options = serde_json::Map::new();
        if let Some(ctx_size) = self.ctx_size {
            server_options.insert("ctx_size".into(), Value::from(ctx_size));
        }
        if let Some(backend) = &self.llamacpp_backend {
            server_options.insert("llamacpp_backend".into(), Value::from(backend.clone()));
        }
        if let Some(args) = &self.llamacpp_args {
            server_options.insert("llamacpp_args".into(), Value::from(args.clone()));
        }

        let cap = |index: usize| self.max_loaded_models.get(index).copied().unwrap_or(1);
        ManagerConfig {
            max_llm_models: cap(0),
            max_embedding_models: cap(1),
            max_reranking_models: cap(2),
            max_audio_models: cap(3),
            server_options,
        }
    }
}

#[derive(Args)]
struct EndpointArgs {
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,
}

#[derive(Args)]
struct PullArgs {
    /// Models to pull
    #[arg(required = true)]
    models: Vec<String>,
    #[arg(long)]
    checkpoint: Option<String>,
    #[arg(long)]
    recipe: Option<String>,
    #[arg(long)]
    reasoning: bool,
    #[arg(long)]
    vision: bool,
    #[arg(long)]
    mmproj: Option<String>,
}

#[derive(Args)]
struct DeleteArgs {
    /// Models to delete
    #[arg(required = true)]
    models: Vec<String>,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

fn health_url(host: &str, port: u16) -> String {
    format!("http://{}:{}/api/v1/health", host, port)
}

fn api_url(host: &str, port: u16, endpoint: &str) -> String {
    format!("http://{}:{}{}", host, port, endpoint)
}

async fn is_server_running(host: &str, port: u16) -> bool {
    http::is_reachable(&health_url(host, port), STATUS_PROBE_TIMEOUT).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Serve(args) => cmd_serve(args).await,
        Commands::Status(args) => cmd_status(args).await,
        Commands::Stop(args) => cmd_stop(args).await,
        Commands::List => cmd_list().await,
        Commands::Pull(args) => cmd_pull(args).await,
        Commands::Delete(args) => cmd_delete(args).await,
        Commands::Run => {
            println!("Run command not yet implemented");
            0
        }
    };
    std::process::exit(code);
}

/// Assemble catalog, manager and shutdown plumbing for one server instance
fn build_state(args: &ServeArgs) -> Result<(AppState, mpsc::Receiver<()>)> {
    let catalog = Catalog::load().context("loading model catalog")?;
    let catalog = Arc::new(RwLock::new(catalog));

    let factory = Arc::new(WrappedServerFactory {
        models_dir: paths::models_dir(),
        bin_dir: paths::bin_dir().context("preparing binary dir")?,
        approximate_tokens: true,
    });

    let manager = Arc::new(
        ModelManager::new(catalog.clone(), args.manager_config(), factory)
            .context("configuring model manager")?,
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let state = AppState {
        manager,
        catalog,
        shutdown: shutdown_tx,
        start_time: SystemTime::now(),
    };
    Ok((state, shutdown_rx))
}

async fn serve(args: &ServeArgs, state: AppState, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
    let app = api::build_router(state.clone());

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("binding {}:{}", args.host, args.port))?;
    info!("Listening on http://{}:{}", args.host, args.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => {},
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, cleaning up...");
                }
            }
        })
        .await?;

    // Idempotent when /internal/shutdown already drained the pool
    state.manager.unload_all().await;
    Ok(())
}

async fn cmd_serve(args: ServeArgs) -> i32 {
    init_tracing(&args.log_level);

    if single_instance::is_another_instance_running("Server")
        || is_server_running(&args.host, args.port).await
    {
        eprintln!("Lemonade Server is already running on port {}", args.port);
        eprintln!("Please stop the existing server before starting a new instance.");
        return EXIT_ALREADY_RUNNING;
    }

    let (state, shutdown_rx) = match build_state(&args) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return EXIT_FAILURE;
        }
    };

    let beacon = NetworkBeacon::new();
    let payload = NetworkBeacon::build_standard_payload(
        &NetworkBeacon::local_hostname(),
        &format!("http://{}:{}", args.host, args.port),
    );
    beacon.start_broadcasting(
        beacon::DEFAULT_BEACON_PORT,
        payload,
        beacon::DEFAULT_BEACON_INTERVAL_SECS,
    );

    let result = serve(&args, state, shutdown_rx).await;
    beacon.stop_broadcasting();

    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_FAILURE
        }
    }
}

async fn cmd_status(args: EndpointArgs) -> i32 {
    if is_server_running(&args.host, args.port).await {
        println!("Server is running on port {}", args.port);
        0
    } else {
        println!("Server is not running");
        EXIT_FAILURE
    }
}

async fn cmd_stop(args: EndpointArgs) -> i32 {
    if !is_server_running(&args.host, args.port).await {
        println!("Lemonade Server is not running");
        return 0;
    }

    println!("Stopping server...");
    let url = api_url(&args.host, args.port, "/internal/shutdown");
    match http::post_json(&url, &json!({}), Some(STATUS_PROBE_TIMEOUT)).await {
        Ok((200, _)) => {
            println!("Lemonade Server stopped successfully.");
            0
        }
        Ok((status, _)) => {
            eprintln!("Failed to stop server: HTTP {}", status);
            EXIT_FAILURE
        }
        Err(_) => {
            // A dropped connection is expected while the server exits
            tokio::time::sleep(Duration::from_millis(500)).await;
            if !is_server_running(&args.host, args.port).await {
                println!("Lemonade Server stopped successfully.");
                0
            } else {
                eprintln!("Error stopping server");
                EXIT_FAILURE
            }
        }
    }
}

/// A server started in-process to answer one CLI command when none is
/// running, then torn down.
struct EphemeralServer {
    state: AppState,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl EphemeralServer {
    async fn start() -> Result<Self> {
        let args = ServeArgs::default();
        let (state, shutdown_rx) = build_state(&args)?;

        let task = {
            let state = state.clone();
            tokio::spawn(async move { serve(&args, state, shutdown_rx).await })
        };

        for _ in 0..(EPHEMERAL_START_TIMEOUT_MS / 100) {
            if is_server_running(DEFAULT_HOST, DEFAULT_PORT).await {
                return Ok(Self { state, task });
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("Failed to start ephemeral server")
    }

    async fn stop(self) {
        let _ = self.state.shutdown.send(()).await;
        let _ = self.task.await;
    }
}

/// Run `operation` against a live server, starting an ephemeral one if
/// nothing is listening.
async fn with_server<F, Fut>(operation: F) -> i32
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = i32>,
{
    let ephemeral = if is_server_running(DEFAULT_HOST, DEFAULT_PORT).await {
        None
    } else {
        println!("[INFO] Starting ephemeral server...");
        match EphemeralServer::start().await {
            Ok(server) => Some(server),
            Err(e) => {
                eprintln!("[ERROR] {:#}", e);
                return EXIT_FAILURE;
            }
        }
    };

    let code = operation().await;

    if let Some(server) = ephemeral {
        server.stop().await;
    }
    code
}

async fn cmd_list() -> i32 {
    init_tracing("error");
    with_server(|| async {
        let url = api_url(DEFAULT_HOST, DEFAULT_PORT, "/api/v1/models?show_all=true");
        let (status, body) = match http::get(&url, STATUS_PROBE_TIMEOUT).await {
            Ok(response) => response,
            Err(e) => {
                eprintln!("[ERROR] Failed to fetch models: {}", e);
                return EXIT_FAILURE;
            }
        };
        if status != 200 {
            eprintln!("[ERROR] Failed to fetch models (HTTP {}): {}", status, body);
            return EXIT_FAILURE;
        }

        let models: ModelList = match serde_json::from_str(&body) {
            Ok(models) => models,
            Err(e) => {
                eprintln!("[ERROR] Invalid response format: {}", e);
                return EXIT_FAILURE;
            }
        };

        println!("{:<40}{:<12}Details", "Model Name", "Downloaded");
        println!("{}", "-".repeat(100));
        for entry in &models.data {
            let status = if entry.downloaded { "Yes" } else { "No" };
            let details = if entry.labels.is_empty() {
                "-".to_string()
            } else {
                entry.labels.join(", ")
            };
            println!("{:<40}{:<12}{}", entry.id, status, details);
        }
        println!("{}", "-".repeat(100));
        0
    })
    .await
}

async fn cmd_pull(args: PullArgs) -> i32 {
    init_tracing("error");
    with_server(|| async {
        let mut code = 0;
        for model in &args.models {
            println!("\nPulling model: {}", model);

            let mut request = json!({"model_name": model});
            if let Some(checkpoint) = &args.checkpoint {
                request["checkpoint"] = Value::from(checkpoint.clone());
            }
            if let Some(recipe) = &args.recipe {
                request["recipe"] = Value::from(recipe.clone());
            }
            if args.reasoning {
                request["reasoning"] = Value::from(true);
            }
            if args.vision {
                request["vision"] = Value::from(true);
            }
            if let Some(mmproj) = &args.mmproj {
                request["mmproj"] = Value::from(mmproj.clone());
            }

            let url = api_url(DEFAULT_HOST, DEFAULT_PORT, "/api/v1/pull");
            match http::post_json(&url, &request, Some(STATUS_PROBE_TIMEOUT)).await {
                Ok((200, _)) => println!("[SUCCESS] Model pulled: {}", model),
                Ok((_, body)) => {
                    eprintln!("[ERROR] Failed to pull {}: {}", model, body);
                    code = EXIT_FAILURE;
                }
                Err(e) => {
                    eprintln!("[ERROR] Failed to pull {}: {}", model, e);
                    code = EXIT_FAILURE;
                }
            }
        }
        code
    })
    .await
}

async fn cmd_delete(args: DeleteArgs) -> i32 {
    init_tracing("error");
    with_server(|| async {
        let mut code = 0;
        for model in &args.models {
            println!("\nDeleting model: {}", model);

            let request = json!({"model": model});
            let url = api_url(DEFAULT_HOST, DEFAULT_PORT, "/api/v1/delete");
            match http::post_json(&url, &request, Some(STATUS_PROBE_TIMEOUT)).await {
                Ok((200, _)) => println!("[SUCCESS] Model deleted: {}", model),
                Ok((_, body)) => {
                    eprintln!("[ERROR] Failed to delete {}: {}", model, body);
                    code = EXIT_FAILURE;
                }
                Err(e) => {
                    eprintln!("[ERROR] Failed to delete {}: {}", model, e);
                    code = EXIT_FAILURE;
                }
            }
        }
        code
    })
    .await
}

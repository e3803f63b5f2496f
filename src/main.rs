use clap::{Parser, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use pixel_dispatch::api::{run_api, ApiState};
use pixel_dispatch::config::OrchestratorConfig;
use pixel_dispatch::orchestrator::{Collaborators, JobOrchestrator};
use pixel_dispatch::remote::RemoteInvoker;
use pixel_dispatch::request::ProcessingRequest;
use pixel_dispatch::routing::connectivity::{
    Connectivity, ConnectivityMonitor, ConnectivitySource, FixedConnectivity, HttpLatencyProbe,
};
use pixel_dispatch::scheduler::resolver::resolve;
use pixel_dispatch::shutdown::install_shutdown_handler;
use pixel_dispatch::worker::ContainerLoader;

#[derive(Parser, Debug)]
#[command(name = "pixel-dispatch")]
#[command(version)]
#[command(about = "Image-processing job orchestrator with local workers, remote fallback and result caching")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator and its HTTP API
    Server(ServerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// Print the execution order of a request's sub-commands without running anything
    Resolve {
        /// Request JSON file
        file: PathBuf,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Configuration JSON file
        file: PathBuf,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Configuration file (JSON). Built-in defaults when omitted.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Address to bind the HTTP API to
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Port for the HTTP API
    #[arg(long, default_value = "8080")]
    port: u16,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:8080")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a request read from a JSON file
    Submit {
        /// Request JSON file
        file: PathBuf,

        /// Poll until the job finishes
        #[arg(long, short = 'w')]
        wait: bool,
    },
    /// Get status of a specific job
    Status {
        /// The job ID
        job_id: String,
    },
    /// List all jobs
    List,
    /// Cancel a job
    Cancel {
        /// The job ID
        job_id: String,
    },
}

#[derive(Serialize)]
struct ResolveOutput {
    order: Vec<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn read_request(file: &PathBuf) -> Result<ProcessingRequest, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(file)?;
    Ok(serde_json::from_str(&raw)?)
}

fn api_url(args: &ClientArgs, path: &str) -> String {
    format!("{}{}", args.addr.trim_end_matches('/'), path)
}

/// Turn a non-2xx reply into `Error: CODE message` and exit.
async fn check_response(response: reqwest::Response) -> Result<Value, Box<dyn std::error::Error>> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let code = body["code"].as_str().unwrap_or("ERROR");
        let error = body["error"].as_str().unwrap_or("request failed");
        eprintln!("Error: {} {} ({})", code, error, status);
        std::process::exit(1);
    }
    Ok(body)
}

fn print_job(job: &Value, output: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(job)?),
        OutputFormat::Table => {
            println!("Job ID:    {}", job["id"].as_str().unwrap_or("-"));
            println!("Service:   {}", job["serviceId"].as_str().unwrap_or("-"));
            println!("State:     {}", job["state"].as_str().unwrap_or("-"));
            println!("Progress:  {}%", job["progress"]);
            println!("Message:   {}", job["message"].as_str().unwrap_or(""));
            if let Some(mode) = job["mode"].as_str() {
                println!("Mode:      {}", mode);
            }
            if let Some(result) = job["result"].as_object() {
                println!("Output:    {}", result["payloadRef"].as_str().unwrap_or("-"));
                println!("Cached:    {}", result["cached"]);
                println!("Model:     {}", result["modelUsed"].as_str().unwrap_or("-"));
            }
            if let Some(failure) = job["failure"].as_object() {
                println!(
                    "Error:     {} {}",
                    failure["code"].as_str().unwrap_or("-"),
                    failure["message"].as_str().unwrap_or("")
                );
                if let Some(done) = failure["completedSubCommands"].as_array() {
                    if !done.is_empty() {
                        let ids: Vec<&str> = done.iter().filter_map(Value::as_str).collect();
                        println!("Completed: {}", ids.join(", "));
                    }
                }
            }
        }
    }
    Ok(())
}

fn is_terminal(job: &Value) -> bool {
    matches!(
        job["state"].as_str(),
        Some("completed") | Some("failed") | Some("cancelled")
    )
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match &args.config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::default(),
    };
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    let shutdown = install_shutdown_handler();

    let connectivity: Arc<dyn ConnectivitySource> = match &config.connectivity.probe_url {
        Some(url) => {
            let probe = HttpLatencyProbe::new(
                url.clone(),
                Duration::from_millis(config.connectivity.probe_interval_ms.max(1)),
            )?;
            let monitor = Arc::new(ConnectivityMonitor::new(Arc::new(probe), &config.connectivity));
            let runner = monitor.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                runner.run(token).await;
            });
            monitor as Arc<dyn ConnectivitySource>
        }
        None => Arc::new(FixedConnectivity::new(Connectivity::Online)),
    };

    let mut collaborators = Collaborators::new(
        Arc::new(ContainerLoader::new(config.sandbox.clone())),
        connectivity,
    );
    if let Some(remote) = &config.remote {
        collaborators = collaborators.with_remote(Arc::new(RemoteInvoker::new(remote)?));
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    tracing::info!(
        addr = %addr,
        services = config.services.len(),
        remote = ?config.remote.as_ref().map(|r| r.endpoint.clone()),
        probe = ?config.connectivity.probe_url,
        "Starting pixel-dispatch"
    );

    let sweep_every = (config.job_retention() / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
    let orchestrator = JobOrchestrator::new(config, collaborators)?;
    {
        let orchestrator = orchestrator.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            orchestrator.run_retention(sweep_every, token).await;
        });
    }
    run_api(addr, ApiState::new(orchestrator.clone()), shutdown.clone()).await?;
    orchestrator.shutdown().await;

    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    http: &reqwest::Client,
    args: &ClientArgs,
    file: PathBuf,
    wait: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = read_request(&file)?;
    let response = http
        .post(api_url(args, "/api/jobs"))
        .json(&request)
        .send()
        .await?;
    let body = check_response(response).await?;
    let job_id = body["jobId"].as_str().unwrap_or_default().to_string();

    if !wait {
        match args.output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&body)?),
            OutputFormat::Table => {
                println!("Job submitted successfully!");
                println!("Job ID: {}", job_id);
            }
        }
        return Ok(());
    }

    loop {
        let response = http
            .get(api_url(args, &format!("/api/jobs/{}", job_id)))
            .send()
            .await?;
        let job = check_response(response).await?;
        if is_terminal(&job) {
            print_job(&job, &args.output)?;
            if job["state"] != "completed" {
                std::process::exit(1);
            }
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn handle_job_status(
    http: &reqwest::Client,
    args: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .get(api_url(args, &format!("/api/jobs/{}", job_id)))
        .send()
        .await?;
    let job = check_response(response).await?;
    print_job(&job, &args.output)
}

async fn handle_job_list(
    http: &reqwest::Client,
    args: &ClientArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http.get(api_url(args, "/api/jobs")).send().await?;
    let body = check_response(response).await?;
    let jobs = body.as_array().cloned().unwrap_or_default();

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
        OutputFormat::Table => {
            if jobs.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!("{:<38} {:<18} {:<10} {:<8} MODE", "JOB ID", "SERVICE", "STATE", "PROGRESS");
            println!("{}", "-".repeat(84));
            for job in &jobs {
                println!(
                    "{:<38} {:<18} {:<10} {:<8} {}",
                    job["id"].as_str().unwrap_or("-"),
                    job["serviceId"].as_str().unwrap_or("-"),
                    job["state"].as_str().unwrap_or("-"),
                    format!("{}%", job["progress"]),
                    job["mode"].as_str().unwrap_or("-"),
                );
            }
            println!();
            println!("{} jobs", jobs.len());
        }
    }
    Ok(())
}

async fn handle_job_cancel(
    http: &reqwest::Client,
    args: &ClientArgs,
    job_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = http
        .delete(api_url(args, &format!("/api/jobs/{}", job_id)))
        .send()
        .await?;
    let body = check_response(response).await?;
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&body)?),
        OutputFormat::Table => match body["outcome"].as_str() {
            Some("cancelled") => println!("Job {} cancelled.", job_id),
            _ => println!("Job {} is executing; it will stop before its next step.", job_id),
        },
    }
    Ok(())
}

fn handle_resolve(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let request = read_request(&file)?;
    match resolve(&request.sub_commands) {
        Ok(order) => {
            let output = ResolveOutput {
                order: order.into_iter().map(|c| c.id).collect(),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn handle_check_config(file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = OrchestratorConfig::from_file(&file)?;
    match config.validate() {
        Ok(()) => {
            println!(
                "Configuration OK: {} services, {} keys",
                config.services.len(),
                config.keys.len()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
        }
        Commands::Job { client, command } => {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?;

            match command {
                JobCommands::Submit { file, wait } => {
                    handle_job_submit(&http, &client, file, wait).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&http, &client, job_id).await?;
                }
                JobCommands::List => {
                    handle_job_list(&http, &client).await?;
                }
                JobCommands::Cancel { job_id } => {
                    handle_job_cancel(&http, &client, job_id).await?;
                }
            }
        }
        Commands::Resolve { file } => handle_resolve(file)?,
        Commands::CheckConfig { file } => handle_check_config(file)?,
    }

    Ok(())
}

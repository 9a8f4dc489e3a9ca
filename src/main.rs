use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing_subscriber::EnvFilter;

use vscope_broker::config::BrokerConfig;
use vscope_broker::node::BrokerNode;
use vscope_broker::server::BrokerClient;
use vscope_broker::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "vscope-broker")]
#[command(version)]
#[command(about = "Job-queue broker with virtual scopes and wake-up notifications")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a broker
    Server(ServerArgs),

    /// Bind the client identity to a virtual scope
    SetScope {
        #[command(flatten)]
        client: ClientArgs,

        /// Scope name; empty resets to the global scope
        #[arg(default_value = "")]
        scope: String,
    },

    /// Submit a job
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        /// Job input
        payload: String,

        /// Submit into this scope (binds the identity first)
        #[arg(long)]
        scope: Option<String>,

        /// Affinity tags, comma-separated
        #[arg(long)]
        aff: Option<String>,
    },

    /// Fetch a job
    Fetch {
        #[command(flatten)]
        client: ClientArgs,

        /// Affinity tags, comma-separated. Without tags any affinity matches.
        #[arg(long)]
        aff: Option<String>,

        /// Also take unscoped jobs when bound to a named scope
        #[arg(long)]
        accept_unscoped: bool,

        /// Seconds to wait for a job
        #[arg(long, default_value = "0")]
        timeout: u64,

        /// Wait for a UDP wake-up and re-poll instead of long-polling
        #[arg(long)]
        listen: bool,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port to listen on
    #[arg(long, default_value = "9100")]
    port: u16,

    /// Address to bind the listener to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port for the JSON status API (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Queue name reported in notifications
    #[arg(long, default_value = "TEST")]
    queue: String,

    /// Maximum number of pending jobs
    #[arg(long, default_value = "10000")]
    max_jobs: usize,

    /// Upper bound on fetch timeouts, in seconds
    #[arg(long, default_value = "3600")]
    max_wait_timeout: u64,

    /// Interval between wait expiry sweeps, in milliseconds
    #[arg(long, default_value = "250")]
    sweep_interval_ms: u64,

    /// Disable routing of WN_SCOPE:::<node> jobs to unbound worker nodes
    #[arg(long)]
    no_worker_node_scopes: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Broker address
    #[arg(long, short = 'a', default_value = "127.0.0.1:9100")]
    addr: SocketAddr,

    /// Client node name
    #[arg(long, default_value = "cli")]
    node: String,

    /// Client session token
    #[arg(long, default_value = "default")]
    session: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
struct SubmitOutput {
    job_key: String,
}

#[derive(Serialize)]
struct FetchOutput {
    job_key: Option<String>,
    input: Option<String>,
    scope: Option<String>,
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

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let dashboard_addr: Option<SocketAddr> = match args.dashboard_port {
        Some(p) => Some(format!("{}:{}", args.host, p).parse()?),
        None => None,
    };

    let config = BrokerConfig {
        listen_addr,
        dashboard_addr,
        queue_name: args.queue,
        max_jobs: args.max_jobs,
        max_wait_timeout_secs: args.max_wait_timeout,
        sweep_interval_ms: args.sweep_interval_ms,
        worker_node_scopes: !args.no_worker_node_scopes,
        ..BrokerConfig::default()
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        queue = %config.queue_name,
        max_jobs = config.max_jobs,
        "Starting broker"
    );

    let token = install_shutdown_handler();
    let node = BrokerNode::bind(config).await?;
    node.run(token).await?;
    Ok(())
}

// =============================================================================
// Client Implementation
// =============================================================================

async fn connect(args: &ClientArgs) -> Result<BrokerClient, Box<dyn std::error::Error>> {
    Ok(BrokerClient::connect(args.addr, &args.node, &args.session).await?)
}

async fn handle_set_scope(args: ClientArgs, scope: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(&args).await?;
    client.set_scope(&scope).await?;
    client.quit().await?;
    if let OutputFormat::Table = args.output {
        println!("Scope of {}/{} set to {:?}", args.node, args.session, scope);
    }
    Ok(())
}

async fn handle_submit(
    args: ClientArgs,
    payload: String,
    scope: Option<String>,
    aff: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(&args).await?;
    if let Some(scope) = scope {
        client.set_scope(&scope).await?;
    }

    let job_key = client
        .submit_with_affinity(&payload, aff.as_deref())
        .await?;
    client.quit().await?;

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&SubmitOutput { job_key })?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job key: {}", job_key);
        }
    }
    Ok(())
}

async fn handle_fetch(
    args: ClientArgs,
    aff: Option<String>,
    accept_unscoped: bool,
    timeout: u64,
    listen: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut request = match &aff {
        Some(aff) => format!("GET2 any_aff=0 aff={aff}"),
        None => "GET2 any_aff=1".to_string(),
    };
    if accept_unscoped {
        request.push_str(" accept_unscoped=1");
    }
    let immediate = request.clone();

    let mut client = connect(&args).await?;
    let mut values: HashMap<String, String> = if listen && timeout > 0 {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let port = socket.local_addr()?.port();
        let first = client
            .call(&format!("{request} timeout={timeout} port={port}"))
            .await?;
        if first.contains_key("job_key") {
            first
        } else {
            let mut buf = [0u8; 1024];
            match tokio::time::timeout(Duration::from_secs(timeout), socket.recv(&mut buf)).await {
                Ok(Ok(n)) => {
                    eprintln!("Notified: {}", String::from_utf8_lossy(&buf[..n]));
                    client.call(&immediate).await?
                }
                _ => HashMap::new(),
            }
        }
    } else {
        if timeout > 0 {
            request.push_str(&format!(" timeout={timeout}"));
        }
        client.call(&request).await?
    };
    client.quit().await?;

    let output = FetchOutput {
        job_key: values.remove("job_key"),
        input: values.remove("input"),
        scope: values.remove("scope"),
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => match output.job_key {
            Some(key) => {
                println!("Job key: {}", key);
                println!("Scope:   {:?}", output.scope.unwrap_or_default());
                println!("Input:");
                for line in output.input.unwrap_or_default().lines() {
                    println!("  {}", line);
                }
            }
            None => println!("No job available."),
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await,
        Commands::SetScope { client, scope } => handle_set_scope(client, scope).await,
        Commands::Submit {
            client,
            payload,
            scope,
            aff,
        } => handle_submit(client, payload, scope, aff).await,
        Commands::Fetch {
            client,
            aff,
            accept_unscoped,
            timeout,
            listen,
        } => handle_fetch(client, aff, accept_unscoped, timeout, listen).await,
    }
}

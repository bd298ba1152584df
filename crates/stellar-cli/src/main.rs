mod config;
mod dict_cmds;
mod node_cmds;
mod rule_cmds;
mod serve_cmd;
mod task_cmds;
mod worker_cmd;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use stellar_core::node::{NodeManager, NodeManagerConfig};
use stellar_core::scheduler::{Scheduler, SchedulerConfig};
use stellar_db::pool;

use config::StellarConfig;
use serve_cmd::{AppState, ServeError};

// Exit codes: 0 normal, 2 config error, 3 persistence connect failure,
// 4 bind error, 130 interrupted.
const EXIT_CONFIG: u8 = 2;
const EXIT_PERSISTENCE: u8 = 3;
const EXIT_BIND: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "stellar", about = "Distributed reconnaissance platform controller")]
struct Cli {
    /// Database URL (overrides STELLAR_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a stellar config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/stellar")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the stellar database (create + migrate)
    DbInit,
    /// Run the controller: protocol listener plus coordinator loops
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
        /// Listen port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run as a worker node against a controller
    Worker {
        /// Controller base URL, e.g. https://controller:8440
        #[arg(long)]
        controller: String,
        /// Node name shown in the registry
        #[arg(long)]
        name: String,
        /// Address this worker advertises
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
        /// Port this worker advertises
        #[arg(long, default_value_t = 8441)]
        port: i32,
        /// Tags for this node (repeatable)
        #[arg(long)]
        tag: Vec<String>,
        /// Heartbeat interval in seconds
        #[arg(long, default_value_t = 30)]
        heartbeat_interval: i64,
        /// Declared task concurrency
        #[arg(long, default_value_t = 2)]
        max_concurrent: i32,
        /// Subdomain dictionary file for dns-brute
        #[arg(long)]
        dictionary: Option<PathBuf>,
        /// Upstream DNS resolver as ip:port (repeatable)
        #[arg(long)]
        resolver: Vec<String>,
    },
    /// Node registry operations
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Take-over fingerprint rule management
    Rule {
        #[command(subcommand)]
        command: RuleCommands,
    },
    /// Brute-force dictionary management
    Dict {
        #[command(subcommand)]
        command: DictCommands,
    },
}

#[derive(Subcommand)]
pub enum DictCommands {
    /// Store (or replace) a dictionary from a wordlist file
    Add {
        /// Dictionary name
        name: String,
        /// Wordlist file, one label per line
        file: std::path::PathBuf,
    },
    /// List stored dictionaries
    List,
    /// Remove a dictionary
    Remove { name: String },
}

#[derive(Subcommand)]
pub enum NodeCommands {
    /// List nodes
    List {
        /// Filter by status (registering, online, offline, disabled, maintenance)
        #[arg(long)]
        status: Option<String>,
        /// Filter by role (controller, worker, hybrid)
        #[arg(long)]
        role: Option<String>,
        /// Require a tag (repeatable)
        #[arg(long)]
        tag: Vec<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show one node with health and stats
    Show { node_id: String },
    /// Put a node into (or take it out of) maintenance
    Maintenance {
        node_id: String,
        /// Leave maintenance instead of entering it
        #[arg(long)]
        off: bool,
    },
    /// Remove nodes that have been offline past a grace window
    Cleanup {
        /// Grace window in seconds
        #[arg(long, default_value_t = 86_400)]
        grace_secs: i64,
    },
    /// Fleet-wide statistics
    Stats,
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Submit a task
    Submit {
        /// Task name
        name: String,
        /// Task type (subdomain_enum, port_scan, vuln_scan, asset_discovery,
        /// page_monitoring, sensitive_detection)
        #[arg(long = "type")]
        task_type: String,
        /// Owning project ID
        #[arg(long)]
        project: String,
        /// Priority (low, normal, high, critical)
        #[arg(long, default_value = "normal")]
        priority: String,
        /// Timeout in seconds
        #[arg(long, default_value_t = 3600)]
        timeout: i64,
        /// Retry budget
        #[arg(long, default_value_t = 3)]
        max_retries: i32,
        /// Dependency task ID (repeatable)
        #[arg(long)]
        depends_on: Vec<String>,
        /// Type-specific parameters as a JSON object
        #[arg(long)]
        params: Option<String>,
        /// Stored dictionary name to embed for dns-brute
        #[arg(long)]
        dictionary: Option<String>,
        /// Tags (repeatable)
        #[arg(long)]
        tag: Vec<String>,
        /// Human description
        #[arg(long)]
        description: Option<String>,
    },
    /// List tasks
    List {
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Show one task
    Show { task_id: String },
    /// Cancel a task (idempotent)
    Cancel { task_id: String },
    /// Re-queue a failed or timed-out task
    Retry { task_id: String },
    /// Print a task's event log
    Events { task_id: String },
    /// Add a dependency edge to a pending task
    Depend {
        /// The dependent task
        task_id: String,
        /// The task it must wait for
        on: String,
    },
}

#[derive(Subcommand)]
pub enum RuleCommands {
    /// Add a fingerprint rule
    Add {
        /// Service name recorded as takeover_kind
        service: String,
        /// CNAME pattern (glob with '*', or a domain suffix)
        cname_pattern: String,
        /// Optional HTTP-body regex for confirmation
        #[arg(long)]
        body_pattern: Option<String>,
        /// Match order (lower matches first)
        #[arg(long, default_value_t = 0)]
        position: i32,
    },
    /// List rules in match order
    List,
    /// Remove a rule
    Remove { rule_id: String },
}

/// Execute the `stellar init` command: write the config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        controller: config::ControllerSection::default(),
        dns: config::DnsSection::default(),
    };

    cfg.save()?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `stellar db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `stellar db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = StellarConfig::resolve(cli_db_url)?;

    println!("Initializing stellar database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    db_pool.close().await;

    println!("stellar db-init complete.");
    Ok(())
}

/// Run the serve command, mapping failures onto the documented exit codes.
async fn cmd_serve(
    cli_db_url: Option<&str>,
    bind: Option<String>,
    port: Option<u16>,
) -> ExitCode {
    let resolved = match StellarConfig::resolve(cli_db_url) {
        Ok(resolved) => resolved,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let db_pool = match pool::create_pool(&resolved.db_config).await {
        Ok(db_pool) => db_pool,
        Err(e) => {
            eprintln!("persistence error: {e:#}");
            return ExitCode::from(EXIT_PERSISTENCE);
        }
    };

    let nodes = NodeManager::new(db_pool.clone(), NodeManagerConfig::default());
    let scheduler = Scheduler::new(db_pool.clone(), nodes.clone(), SchedulerConfig::default());
    let state = AppState::new(db_pool.clone(), nodes, scheduler);

    let bind = bind.unwrap_or(resolved.controller.bind);
    let port = port.unwrap_or(resolved.controller.port);

    let outcome = serve_cmd::run_serve(state, &bind, port).await;
    db_pool.close().await;

    match outcome {
        // Graceful shutdown only happens via ctrl-c.
        Ok(()) => ExitCode::from(EXIT_INTERRUPTED),
        Err(ServeError::Bind { addr, source }) => {
            eprintln!("failed to bind {addr}: {source}");
            ExitCode::from(EXIT_BIND)
        }
        Err(ServeError::Other(e)) => {
            eprintln!("controller error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result: anyhow::Result<()> = match cli.command {
        Commands::Init { db_url, force } => cmd_init(&db_url, force),
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        Commands::Serve { bind, port } => {
            return cmd_serve(cli.database_url.as_deref(), bind, port).await;
        }
        Commands::Worker {
            controller,
            name,
            ip,
            port,
            tag,
            heartbeat_interval,
            max_concurrent,
            dictionary,
            resolver,
        } => {
            let mut resolvers = Vec::new();
            for entry in &resolver {
                match entry.parse() {
                    Ok(addr) => resolvers.push(addr),
                    Err(e) => {
                        eprintln!("invalid resolver address {entry:?}: {e}");
                        return ExitCode::from(EXIT_CONFIG);
                    }
                }
            }
            if resolvers.is_empty() {
                // Fall back to the config file's resolver list, then the
                // public defaults.
                resolvers = StellarConfig::resolve(cli.database_url.as_deref())
                    .map(|c| c.resolvers)
                    .unwrap_or_default();
            }
            if resolvers.is_empty() {
                resolvers = vec![
                    "8.8.8.8:53".parse().expect("static address"),
                    "1.1.1.1:53".parse().expect("static address"),
                ];
            }
            worker_cmd::run_worker(worker_cmd::WorkerOptions {
                controller_url: controller,
                name,
                ip,
                port,
                tags: tag,
                heartbeat_interval_secs: heartbeat_interval,
                max_concurrent_tasks: max_concurrent,
                dictionary_path: dictionary,
                resolvers,
            })
            .await
        }
        Commands::Node { command } => {
            with_pool(cli.database_url.as_deref(), |db_pool| async move {
                node_cmds::run_node_command(command, &db_pool).await
            })
            .await
        }
        Commands::Task { command } => {
            with_pool(cli.database_url.as_deref(), |db_pool| async move {
                task_cmds::run_task_command(command, &db_pool).await
            })
            .await
        }
        Commands::Rule { command } => {
            with_pool(cli.database_url.as_deref(), |db_pool| async move {
                rule_cmds::run_rule_command(command, &db_pool).await
            })
            .await
        }
        Commands::Dict { command } => {
            with_pool(cli.database_url.as_deref(), |db_pool| async move {
                dict_cmds::run_dict_command(command, &db_pool).await
            })
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Resolve config, open a pool, run the command, close the pool.
async fn with_pool<F, Fut>(cli_db_url: Option<&str>, f: F) -> anyhow::Result<()>
where
    F: FnOnce(sqlx::PgPool) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let resolved = StellarConfig::resolve(cli_db_url)?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let result = f(db_pool.clone()).await;
    db_pool.close().await;
    result
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use toolmux::logging::{init_tracing, LogOptions};
use toolmux::mcp_client::{
    load_servers_config, requirements, ConfigFormat, ConnectionState, MultiServerClient,
    ServerSpecs,
};

/// Exit status when no server could be connected.
const EXIT_OFFLINE: u8 = 2;

#[derive(Parser)]
#[command(name = "toolmux")]
#[command(about = "Connect to MCP tool servers and route tool calls by name")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server configuration file (JSON, or YAML by extension)
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "TOOLMUX_CONFIG",
        default_value = "mcp_servers.json"
    )]
    config: PathBuf,

    /// Per-server connect timeout in seconds
    #[arg(long, short = 't', global = true, default_value_t = 30)]
    timeout: u64,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the config and check that every server can be launched
    Check,
    /// Connect to every server and print the tool catalog
    Tools {
        /// Print statuses and tools as JSON
        #[arg(long)]
        json: bool,
    },
    /// Call one tool and print its result
    Call {
        /// Qualified (`server.tool`) or bare tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, short = 'a')]
        args: Option<String>,
        /// Call timeout in seconds
        #[arg(long, default_value_t = 30)]
        call_timeout: u64,
    },
    /// Write a starter configuration file
    Init {
        /// Destination (YAML if it ends in .yaml/.yml)
        #[arg(long, short = 'o', default_value = "mcp_servers.json")]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    init_tracing(&LogOptions {
        file: cli.log_file.clone(),
        json: cli.log_json,
    })
    .context("failed to initialize logging")?;

    let connect_timeout = Duration::from_secs(cli.timeout);

    match cli.command {
        Commands::Check => check(&cli.config),
        Commands::Tools { json } => tools(&cli.config, connect_timeout, json).await,
        Commands::Call {
            tool,
            args,
            call_timeout,
        } => {
            call(
                &cli.config,
                connect_timeout,
                &tool,
                args.as_deref(),
                Duration::from_secs(call_timeout),
            )
            .await
        }
        Commands::Init { output, force } => init(&output, force),
    }
}

fn load(path: &Path) -> Result<ServerSpecs> {
    let specs = load_servers_config(path)
        .with_context(|| format!("failed to load server config {}", path.display()))?;
    for skipped in specs.skipped() {
        eprintln!("warning: skipped server '{}': {}", skipped.name, skipped.reason);
    }
    Ok(specs)
}

fn check(path: &Path) -> Result<ExitCode> {
    let specs = load(path)?;
    println!("{} server(s) configured in {}", specs.len(), path.display());

    let report = requirements::check_requirements(&specs);
    for spec in specs.iter() {
        match report.get(&spec.name) {
            None => println!("  ok       {} ({} {})", spec.name, spec.command, spec.args.join(" ")),
            Some(problems) => {
                println!("  missing  {}", spec.name);
                for problem in problems {
                    println!("           - {problem}");
                }
            }
        }
    }

    Ok(if report.is_empty() && specs.skipped().is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn tools(path: &Path, connect_timeout: Duration, json: bool) -> Result<ExitCode> {
    let specs = load(path)?;
    let client = MultiServerClient::new();
    client.connect_all(&specs, connect_timeout).await;

    if json {
        let doc = serde_json::json!({
            "servers": client.server_status(),
            "tools": client.list_tools(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
    } else {
        for status in client.server_status() {
            match (status.state, &status.last_error) {
                (ConnectionState::Connected, _) => {
                    println!("{:<24} connected ({} tools)", status.name, status.tool_count);
                }
                (state, Some(error)) => println!("{:<24} {state}: {error}", status.name),
                (state, None) => println!("{:<24} {state}", status.name),
            }
        }

        let catalog = client.catalog();
        if !catalog.is_empty() {
            println!();
        }
        for tool in catalog.list_all() {
            let summary = tool.description.lines().next().unwrap_or_default();
            println!("  {:<40} {summary}", tool.qualified_name);
        }
    }

    let offline = client.is_offline();
    client.disconnect_all().await;
    Ok(if offline {
        ExitCode::from(EXIT_OFFLINE)
    } else {
        ExitCode::SUCCESS
    })
}

async fn call(
    path: &Path,
    connect_timeout: Duration,
    tool: &str,
    args: Option<&str>,
    call_timeout: Duration,
) -> Result<ExitCode> {
    let arguments: serde_json::Value = match args {
        Some(raw) => serde_json::from_str(raw).context("--args must be valid JSON")?,
        None => serde_json::Value::Null,
    };

    let specs = load(path)?;
    let client = MultiServerClient::new().with_call_timeout(call_timeout);
    client.connect_all(&specs, connect_timeout).await;

    if client.is_offline() {
        eprintln!("error: no servers connected");
        client.disconnect_all().await;
        return Ok(ExitCode::from(EXIT_OFFLINE));
    }

    let result = client.call(tool, arguments).await;
    client.disconnect_all().await;

    let output = result.with_context(|| format!("call to '{tool}' failed"))?;
    println!("{}", serde_json::to_string_pretty(&output.payload)?);

    Ok(if output.is_error() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn init(output: &Path, force: bool) -> Result<ExitCode> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let config = requirements::starter_config();
    let rendered = match ConfigFormat::from_path(output) {
        ConfigFormat::Yaml => serde_yaml::to_string(&config)?,
        ConfigFormat::Json => format!("{}\n", serde_json::to_string_pretty(&config)?),
    };
    std::fs::write(output, rendered)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("wrote {}", output.display());
    Ok(ExitCode::SUCCESS)
}

mod config;
mod error;
mod tools;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mcp::{ClientSession, ToolServer};
use runtime::providers::OpenAiBackend;
use runtime::{Agent, McpToolHost};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use config::Config;
use error::{Error, Result};

const DEMO_PROMPTS: [&str; 3] = [
    "Add these numbers: 7 and 22.",
    "What's the weather in Tokyo?",
    "What's the secret word?",
];

#[derive(Parser)]
#[command(name = "toolwire")]
#[command(about = "Tool invocation over HTTP sessions", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "toolwire.toml")]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo tools over HTTP
    Serve {
        /// Listen address (overrides config)
        #[arg(short, long)]
        addr: Option<String>,
    },
    /// List the tools a host offers
    Tools {
        /// Tool host URL (overrides config)
        #[arg(short, long)]
        url: Option<String>,
    },
    /// Invoke a single tool
    Call {
        /// Tool name
        tool: String,
        /// Parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
        /// Tool host URL (overrides config)
        #[arg(short, long)]
        url: Option<String>,
        /// Call timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },
    /// Answer a prompt with an agent that uses the host's tools
    Run {
        prompt: String,
        /// Tool host URL (overrides config)
        #[arg(short, long)]
        url: Option<String>,
        /// Model name (overrides config)
        #[arg(short, long)]
        model: Option<String>,
    },
    /// Serve the demo tools in-process and run the sample prompts against them
    Demo {
        /// Listen address (overrides config)
        #[arg(short, long)]
        addr: Option<String>,
        /// Model name (overrides config)
        #[arg(short, long)]
        model: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "toolwire=debug,mcp=debug,runtime=debug,tower_http=debug,warn"
    } else {
        "toolwire=info,mcp=info,runtime=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load_or_default(&cli.config)?;
    config.apply_env();

    match cli.command.unwrap_or(Commands::Demo {
        addr: None,
        model: None,
    }) {
        Commands::Serve { addr } => {
            if let Some(addr) = addr {
                config.server.addr = addr;
            }
            cmd_serve(&config).await
        }
        Commands::Tools { url } => {
            if let Some(url) = url {
                config.client.url = url;
            }
            cmd_tools(&config).await
        }
        Commands::Call {
            tool,
            params,
            url,
            timeout,
        } => {
            if let Some(url) = url {
                config.client.url = url;
            }
            if let Some(secs) = timeout {
                config.client.call_timeout_secs = secs;
            }
            let params: Value = serde_json::from_str(&params)?;
            cmd_call(&config, &tool, params).await
        }
        Commands::Run { prompt, url, model } => {
            if let Some(url) = url {
                config.client.url = url;
            }
            if let Some(model) = model {
                config.agent.model = model;
            }
            cmd_run(&config, &[prompt.as_str()]).await
        }
        Commands::Demo { addr, model } => {
            if let Some(addr) = addr {
                config.server.addr = addr;
            }
            if let Some(model) = model {
                config.agent.model = model;
            }
            cmd_demo(config).await
        }
    }
}

fn tool_server(config: &Config) -> Result<ToolServer> {
    let registry = tools::registry(reqwest::Client::new(), config.weather_url()?)?;
    Ok(ToolServer::new(Arc::new(registry), config.server_config()))
}

async fn cmd_serve(config: &Config) -> Result<()> {
    let server = tool_server(config)?;
    let listener = TcpListener::bind(&config.server.addr).await?;
    server.serve(listener, shutdown_signal()).await?;
    tracing::info!("tool host stopped");
    Ok(())
}

async fn cmd_tools(config: &Config) -> Result<()> {
    let session = ClientSession::connect(&config.client.url, config.session_config()).await?;
    let listed = session.list_tools().await;
    session.close().await;

    for tool in listed? {
        match &tool.description {
            Some(description) => println!("{:<24} {description}", tool.name),
            None => println!("{}", tool.name),
        }
    }
    Ok(())
}

async fn cmd_call(config: &Config, tool: &str, params: Value) -> Result<()> {
    let session = ClientSession::connect(&config.client.url, config.session_config()).await?;
    let result = session.call(tool, params).await;
    session.close().await;

    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Run each prompt through a fresh agent loop over one shared session.
async fn cmd_run(config: &Config, prompts: &[&str]) -> Result<()> {
    let api_key = config.api_key()?;
    let agent_config = config.agent_config()?;

    let mut backend = OpenAiBackend::builder(api_key, &config.agent.model);
    if let Some(base_url) = &config.agent.base_url {
        backend = backend.base_url(base_url);
    }
    let backend = backend.build();

    let host = McpToolHost::connect(&config.client.url, config.session_config()).await?;
    tracing::debug!(backend = %backend, session = host.session().id(), "agent ready");
    let agent = Agent::new(backend, host, agent_config);

    let mut outcome: Result<()> = Ok(());
    for (i, prompt) in prompts.iter().enumerate() {
        let sep = if i == 0 { "" } else { "\n" };
        println!("{sep}Running: {prompt}");
        match agent.run(prompt).await {
            Ok(run) => {
                tracing::debug!(
                    turns = run.turns.len(),
                    input_tokens = run.usage.input_tokens,
                    output_tokens = run.usage.output_tokens,
                    "run complete"
                );
                println!("{}", run.output);
            }
            Err(e) => {
                outcome = Err(e.into());
                break;
            }
        }
    }

    agent.host().close().await;
    outcome
}

async fn cmd_demo(mut config: Config) -> Result<()> {
    // Fail before binding if the model cannot be reached anyway.
    config.api_key()?;

    let server = tool_server(&config)?;
    let listener = TcpListener::bind(&config.server.addr).await?;
    let local = listener.local_addr()?;
    config.client.url = format!("http://{local}");

    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(async move {
        server
            .serve(listener, async move {
                let _ = stopped.await;
            })
            .await
    });

    let outcome = match wait_ready(&config.client.url).await {
        Ok(()) => cmd_run(&config, &DEMO_PROMPTS).await,
        Err(e) => Err(e),
    };

    let _ = stop.send(());
    match serving.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "tool host exited with error"),
        Err(e) => tracing::warn!(error = %e, "tool host task failed"),
        Ok(Ok(())) => {}
    }
    outcome
}

/// Poll the host's health endpoint until it answers.
async fn wait_ready(url: &str) -> Result<()> {
    let http = reqwest::Client::new();
    let health = format!("{}/health", url.trim_end_matches('/'));
    for _ in 0..50 {
        match http.get(&health).send().await {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    Err(Error::HostNotReady {
        url: url.to_string(),
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

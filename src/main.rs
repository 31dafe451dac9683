//! `vega-relay` CLI - serve the API or drive providers from the terminal

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use vega_relay::config::{self, Config, FFMPEG_PATH_ENV};
use vega_relay::provider::Role;
use vega_relay::server::{self, AppState};

#[derive(Parser)]
#[command(name = "vega-relay")]
#[command(about = "Sandboxed provider-module runner and live transcode proxy")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/vega-relay/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to listen on (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Resolve playable streams for a link
    Resolve {
        /// Provider name (aliases accepted)
        provider: String,

        /// Content link handed to the provider
        link: String,

        /// Content type passed to the stream function
        #[arg(short = 't', long = "type", default_value = "movie")]
        kind: String,

        /// Print raw JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Fetch a provider's modules and check its stream export
    Modules {
        /// Provider name (aliases accepted)
        provider: String,
    },

    /// Check that ffmpeg can be found and run
    Probe,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            server::serve(AppState::from_config(&config)?, &bind).await?;
        }
        Commands::Resolve { provider, link, kind, json } => {
            cmd_resolve(&config, &provider, &link, &kind, json).await?;
        }
        Commands::Modules { provider } => {
            cmd_modules(&config, &provider).await?;
        }
        Commands::Probe => {
            cmd_probe(&config).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from(path)?;
            config.apply_env(std::env::var_os(FFMPEG_PATH_ENV).map(PathBuf::from));
            Ok(config)
        }
        None => Config::load().with_context(|| format!("loading {}", config::config_path().display())),
    }
}

async fn cmd_resolve(config: &Config, provider: &str, link: &str, kind: &str, json: bool) -> Result<()> {
    let state = AppState::from_config(config)?;
    let cancel = CancellationToken::new();

    eprintln!("🔎 Resolving {kind} via {provider}: {link}");
    let start = Instant::now();

    let streams = tokio::select! {
        result = state.resolver.resolve_stream(provider, link, kind, &cancel) => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            anyhow::bail!("interrupted");
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&streams)?);
        return Ok(());
    }

    println!("📺 {} streams in {:.0}ms", streams.len(), start.elapsed().as_secs_f64() * 1000.0);
    for stream in &streams {
        let quality = stream.quality.as_deref().map(|q| format!(" [{q}]")).unwrap_or_default();
        println!("   {} ({}){quality}", stream.server, stream.kind);
        println!("      {}", stream.link);
    }

    Ok(())
}

async fn cmd_modules(config: &Config, provider: &str) -> Result<()> {
    let state = AppState::from_config(config)?;
    let report = state.resolver.inspect(provider).await;

    println!("📦 Provider: {} (key: {})", report.provider, report.key);
    println!("   Host: {}/{}", report.environment.platform, report.environment.arch);
    for role in Role::ALL {
        let mark = if report.modules.contains(&role) { "✅" } else { "❌" };
        println!("   {mark} {role}");
    }

    let stream = &report.stream_module;
    if stream.available {
        println!("\n🧪 Stream module: {} bytes", stream.size);
        if let Some(ref error) = stream.error {
            println!("   ❌ Failed to load: {error}");
        }
        if let Some(ref exports) = stream.exports {
            println!("   Exports: {}", exports.join(", "));
        }
        match report.get_stream.path {
            Some(ref path) => println!("   ✅ Stream function: {path}"),
            None => println!("   ❌ No stream function"),
        }
    }

    Ok(())
}

async fn cmd_probe(config: &Config) -> Result<()> {
    let state = AppState::from_config(config)?;
    match state.transcoder.probe().await {
        Ok(report) => {
            println!("✅ ffmpeg: {} ({:?})", report.path.display(), report.located_by);
            println!("   {}", report.version);
            println!("   Output: {} + {}, fragmented MP4", report.codec, report.audio);
            Ok(())
        }
        Err(e) => {
            println!("❌ {e}");
            Err(e.into())
        }
    }
}

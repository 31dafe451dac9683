//! `vega-relay` - provider-module sandbox and live transcode proxy
//!
//! # Features
//!
//! - **Provider modules**: per-provider scripts fetched remotely and cached with a TTL
//! - **Sandbox**: `QuickJS` execution with only a curated capability surface
//!   (HTTP, HTML selection, crypto, link extractors)
//! - **Stream resolution**: conventional export lookup, cooperative cancellation
//! - **Transcoding**: ffmpeg to fragmented MP4, streamed with backpressure
//!
//! # Example
//!
//! ```rust,no_run
//! use vega_relay::{config::Config, server::AppState};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let state = AppState::from_config(&Config::load()?)?;
//!     let streams = state
//!         .resolver
//!         .resolve_stream("vega", "https://example.com/watch/1", "movie", &CancellationToken::new())
//!         .await?;
//!     println!("{} streams", streams.len());
//!     Ok(())
//! }
//! ```

pub mod capability;
pub mod config;
pub mod fingerprint;
pub mod http_client;
pub mod provider;
pub mod sandbox;
pub mod server;
pub mod transcode;

pub use capability::{CapabilityContext, CapabilityError};
pub use config::Config;
pub use fingerprint::{chrome_profile, firefox_profile, random_profile, BrowserProfile};
pub use http_client::{CapturedResponse, ScrapeClient};
pub use provider::{ModuleCache, ModuleSet, ProviderError, ProviderKey, Role, StreamDescriptor, StreamResolver};
pub use sandbox::{ExportSurface, SandboxError, SandboxExecutor};
pub use transcode::{ProbeReport, TranscodeError, TranscodeProxy, TranscodeStream};

/// Version of vega-relay
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

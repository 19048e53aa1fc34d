//! Intercom call operator CLI

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use intercom_call_core::api::{CallApi, HttpCallApi};
use intercom_call_core::identity::{AuthError, AuthProvider, CurrentUser};
use intercom_call_core::push::parse_push_payload;
use intercom_call_core::signaling::InboundSignal;
use intercom_call_core::{CallId, CallLifecycleState, IntercomConfig};
use output::OutputFormat;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod output;

/// Log filter when `RUST_LOG` is unset; covers the binary and the library
const DEFAULT_LOG_FILTER: &str = "intercom=info,intercom_call_core=info";

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON configuration file; defaults plus INTERCOM_* variables otherwise
    #[arg(short, long, env = "INTERCOM_CONFIG")]
    config: Option<PathBuf>,

    /// Backend base URL, overrides the configuration
    #[arg(long, env = "INTERCOM_API_BASE_URL")]
    api_base_url: Option<String>,

    /// Bearer token for backend requests
    #[arg(long, env = "INTERCOM_API_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate the intercom call payload in a push notification
    ParsePush {
        /// Notification JSON file, `-` for stdin
        file: PathBuf,
    },

    /// Classify a signaling message body
    Classify {
        /// Message body as JSON text
        json: String,
    },

    /// Print the call lifecycle transition table
    Transitions {
        /// Only show transitions out of this state
        #[arg(long)]
        from: Option<String>,
    },

    /// Query the backend status of a call
    Status {
        /// Call identifier
        call_id: String,
    },
}

/// Fixed bearer token from the command line
struct StaticToken(String);

#[async_trait]
impl AuthProvider for StaticToken {
    async fn current_user(&self) -> Result<Option<CurrentUser>, AuthError> {
        Ok(None)
    }

    async fn access_token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => IntercomConfig::from_file(path)?,
        None => IntercomConfig::from_env()?,
    };
    if let Some(url) = cli.api_base_url {
        config.api.base_url = url;
    }

    let rendered = match cli.command {
        Commands::ParsePush { file } => {
            let raw = read_input(&file)?;
            let notification: serde_json::Value =
                serde_json::from_str(&raw).context("Notification is not valid JSON")?;
            let parsed = parse_push_payload(&notification, &config.coordinator.default_caller_name);
            output::render_push(cli.format, parsed.as_ref())?
        }
        Commands::Classify { json } => {
            let signal = InboundSignal::parse(&json)?;
            output::render_signal(cli.format, &signal)?
        }
        Commands::Transitions { from } => {
            let from = from.as_deref().map(parse_state).transpose()?;
            output::render_transitions(cli.format, from)?
        }
        Commands::Status { call_id } => {
            let auth = cli
                .token
                .map(|token| Arc::new(StaticToken(token)) as Arc<dyn AuthProvider>);
            let api = HttpCallApi::new(&config.api, auth)?;
            tracing::info!(call_id = %call_id, base_url = %config.api.base_url, "Querying call status");
            let details = api.call_details(&CallId::new(call_id)).await?;
            output::render_status(cli.format, &details)?
        }
    };

    print!("{rendered}");
    Ok(())
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("Cannot read stdin")?;
        return Ok(raw);
    }
    std::fs::read_to_string(path).with_context(|| format!("Cannot read {}", path.display()))
}

fn parse_state(name: &str) -> Result<CallLifecycleState> {
    match CallLifecycleState::ALL
        .iter()
        .find(|state| state.as_str().eq_ignore_ascii_case(name))
    {
        Some(state) => Ok(*state),
        None => bail!(
            "Unknown state '{}'; expected one of: {}",
            name,
            CallLifecycleState::ALL
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_includes_library() {
        assert!(DEFAULT_LOG_FILTER
            .split(',')
            .any(|directive| directive == "intercom_call_core=info"));
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_parse_state() {
        assert_eq!(parse_state("ringing").unwrap(), CallLifecycleState::Ringing);
        assert!(parse_state("paused").is_err());
    }
}

use std::process::ExitCode;

use clap::Parser;
use colony_cli::{run_cli, Cli};
use colony_domain::ErrorEnvelope;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    // Logs go to stderr; stdout carries exactly one JSON document.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let (document, code) = match run_cli(cli) {
        Ok(value) => (value, ExitCode::SUCCESS),
        Err(err) => {
            let envelope = ErrorEnvelope::from_anyhow(&err);
            tracing::error!(kind = envelope.kind.as_str(), "{}", envelope.message);
            (json!({ "error": envelope }), ExitCode::FAILURE)
        }
    };

    match serde_json::to_string_pretty(&document) {
        Ok(text) => {
            println!("{text}");
            code
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to encode command output");
            ExitCode::FAILURE
        }
    }
}

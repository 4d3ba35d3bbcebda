//! wa-relay CLI entry point.
//!
//! Provides `serve` (the default) for running the relay, plus `normalize`
//! and `extract` for checking how a number or a webhook payload will be
//! interpreted without touching the session.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use wa_relay::config::RelayConfig;
use wa_relay::normalize::address::canonicalize;
use wa_relay::normalize::extract::extract_fields;
use wa_relay::normalize::ValidationError;
use wa_relay::relay::{build_router, AppState};
use wa_relay::whatsapp::client::BridgeTransport;
use wa_relay::whatsapp::{spawn_session, CredentialStore, WhatsAppTransport};

/// Relay Chatwoot webhooks to WhatsApp.
#[derive(Parser)]
#[command(name = "wa-relay", version, about)]
struct Cli {
    /// Config file (default: `$RELAY_CONFIG_PATH` or `./relay.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute. Defaults to `serve`.
    #[command(subcommand)]
    command: Option<Command>,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the relay: WhatsApp session plus HTTP server.
    Serve,
    /// Print the WhatsApp address a raw number canonicalizes to.
    Normalize {
        /// Phone number or JID.
        raw: String,
        /// Override the configured country code.
        #[arg(long)]
        country_code: Option<String>,
        /// Do not insert the regional mobile prefix.
        #[arg(long)]
        no_mobile_prefix: bool,
    },
    /// Show the destination and body extracted from a webhook payload.
    Extract {
        /// JSON file to read; stdin when omitted.
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RelayConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => handle_serve(config).await,
        Command::Normalize {
            raw,
            country_code,
            no_mobile_prefix,
        } => handle_normalize(&config, &raw, country_code, no_mobile_prefix),
        Command::Extract { file } => handle_extract(file),
    }
}

/// Run the relay until Ctrl-C or SIGTERM.
async fn handle_serve(config: RelayConfig) -> anyhow::Result<()> {
    let _logging_guard = wa_relay::logging::init(&config.log)?;

    let store = CredentialStore::new(config.whatsapp.auth_dir.clone());
    let transport: Arc<dyn WhatsAppTransport> =
        Arc::new(BridgeTransport::new(config.whatsapp.bridge_url.clone()));
    let (session, supervisor) =
        spawn_session(transport, store, config.whatsapp.session_settings());

    let state = AppState::new(session, config.address.policy())
        .with_media_limits(config.server.media_limits());
    let router = build_router(state, &config.server);

    let addr = config.server.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        addr = %listener.local_addr()?,
        webhook_path = %config.server.webhook_path,
        auth_dir = %config.whatsapp.auth_dir.display(),
        "wa-relay listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    supervisor.abort();
    info!("wa-relay stopped");
    Ok(())
}

fn handle_normalize(
    config: &RelayConfig,
    raw: &str,
    country_code: Option<String>,
    no_mobile_prefix: bool,
) -> anyhow::Result<()> {
    wa_relay::logging::init_cli();

    let mut policy = config.address.policy();
    if let Some(cc) = country_code {
        policy.country_code = cc;
    }
    if no_mobile_prefix {
        policy.enforce_mobile_prefix = false;
    }

    let jid = canonicalize(raw, &policy)
        .ok_or_else(|| ValidationError::InvalidAddress(raw.to_owned()))?;
    println!("{jid}");
    Ok(())
}

fn handle_extract(file: Option<PathBuf>) -> anyhow::Result<()> {
    wa_relay::logging::init_cli();

    let contents = match file {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read stdin")?;
            buf
        }
    };
    let payload: serde_json::Value =
        serde_json::from_str(&contents).context("payload is not valid JSON")?;

    let fields = extract_fields(&payload);
    let missing = fields.missing();
    let report = serde_json::json!({
        "destination": fields.destination,
        "body": fields.body,
        "missing": missing,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mail_relay::api;
use mail_relay::channels::{ImapMailbox, SmtpRelay};
use mail_relay::config::RelayConfig;
use mail_relay::error::Result;
use mail_relay::pipeline::{
    Cadence, Forwarder, ForwarderDeps, ForwarderSettings, RunScheduler, TokioSleeper,
};
use mail_relay::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Logging comes up before config parsing, so RELAY_LOG_DIR is read directly.
    let _log_guard = init_tracing(std::env::var("RELAY_LOG_DIR").ok().as_deref());

    let config = RelayConfig::from_env().context("Invalid configuration")?;

    eprintln!("📬 Mail Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Mailbox: {}@{}:{}/{}",
        config.mailbox.username, config.mailbox.host, config.mailbox.port, config.mailbox.folder
    );
    eprintln!("   SMTP:    {}:{}", config.smtp.host, config.smtp.port);
    eprintln!("   Trigger: http://0.0.0.0:{}/api/process", config.http_port);

    let forwarder = build_forwarder(&config)
        .await
        .context("Failed to build forwarding pipeline")?;

    let cadence = Cadence::from_duration(config.check_interval);
    let scheduler = RunScheduler::new(Arc::clone(&forwarder), cadence).start();

    // ── HTTP trigger ─────────────────────────────────────────────────────
    let app = api::routes(Arc::clone(&forwarder));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "HTTP trigger server started");
    let (server_tx, mut server_rx) = watch::channel(false);
    let mut server = tokio::spawn(async move {
        let shutdown = async move {
            let _ = server_rx.changed().await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "HTTP server exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested");

    // Stop accepting triggers, then drain runs and in-flight requests.
    let _ = server_tx.send(true);
    if scheduler.stop(config.shutdown_grace).await {
        tracing::info!("Scheduler stopped cleanly");
    }
    if tokio::time::timeout(config.shutdown_grace, &mut server)
        .await
        .is_err()
    {
        tracing::warn!("HTTP server did not drain within grace period");
        server.abort();
    }
    Ok(())
}

/// Wire the libSQL store, IMAP mailbox and SMTP relay into a forwarder.
async fn build_forwarder(config: &RelayConfig) -> Result<Arc<Forwarder>> {
    let db = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    let transport = SmtpRelay::new(&config.smtp)?;
    tracing::info!(db = %config.db_path.display(), "Database opened");

    Ok(Arc::new(Forwarder::new(
        ForwarderDeps {
            mailbox: Arc::new(ImapMailbox::new(config.mailbox.clone())),
            rules: db.clone(),
            recipients: db.clone(),
            outcomes: db,
            transport: Arc::new(transport),
            sleeper: Arc::new(TokioSleeper),
        },
        ForwarderSettings::from_config(config),
    )))
}

/// Console logging, plus a daily-rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&str>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = tracing_subscriber::fmt::layer().with_target(false);

    match log_dir.filter(|d| !d.trim().is_empty()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mail-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .init();
            None
        }
    }
}

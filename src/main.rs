use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};

use postal_scan::channels::lmtp::{LmtpClient, MailStore};
use postal_scan::config::ScanConfig;
use postal_scan::llm::create_provider;
use postal_scan::logging;
use postal_scan::pipeline::{self, WatcherOptions, spawn_staging_watcher};
use postal_scan::store::ledger::{LibSqlLedger, ProcessedLedger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match ScanConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            let _guard = logging::init(None, false);
            error!(error = %e, "Invalid configuration");
            return Err(e).context("loading configuration");
        }
    };

    let _log_guard =
        logging::init(config.log_dir.as_deref(), config.log_json).context("initializing logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        user = %config.mail_user,
        domain = %config.mail_domain,
        maildir = %config.maildir_path.display(),
        model = %config.model,
        rate_limit = config.rate_limit_per_minute,
        "postal-scan starting"
    );

    pipeline::ensure_directories(&config)
        .await
        .context("creating mail directories")?;

    // ── Ledger ──────────────────────────────────────────────────────────
    let ledger: Arc<dyn ProcessedLedger> = Arc::new(
        LibSqlLedger::new_local(&config.ledger_path)
            .await
            .with_context(|| format!("opening ledger at {}", config.ledger_path.display()))?,
    );
    info!(
        path = %config.ledger_path.display(),
        records = ledger.count().await.unwrap_or(0),
        "Ledger ready"
    );

    // ── Mail store ──────────────────────────────────────────────────────
    let lmtp = LmtpClient::new(config.lmtp_host.clone(), config.lmtp_port, config.lmtp_timeout);
    lmtp.check_connection()
        .await
        .with_context(|| format!("mail store unreachable at {}", lmtp.endpoint()))?;
    info!(endpoint = %lmtp.endpoint(), "Mail store reachable");
    let mail_store: Arc<dyn MailStore> = Arc::new(lmtp);

    // ── Pipeline ────────────────────────────────────────────────────────
    let llm = create_provider(&config);
    let processor = Arc::new(pipeline::build_processor(
        &config,
        llm,
        mail_store,
        Arc::clone(&ledger),
    ));

    let (watcher_handle, shutdown) =
        spawn_staging_watcher(processor, WatcherOptions::from_config(&config));

    wait_for_signal().await;
    info!("Shutdown requested, finishing in-flight messages");
    shutdown.trigger();

    if let Err(e) = watcher_handle.await {
        warn!(error = %e, "Watcher task ended abnormally");
    }
    info!("postal-scan stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, using Ctrl-C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

//! Scan-first delivery pipeline.
//!
//! Every staged message flows through:
//! 1. `StagingWatcher` — discovery (sweep + live events), settle, dispatch
//! 2. `RateLimiter` — admission before any backend call
//! 3. `safety::clean` — untrusted text is sanitized before it is embedded
//! 4. `Classifier` — strict-grammar verdict, QUARANTINE on failure
//! 5. `DeliveryRouter` — LMTP delivery or quarantine move, then ledger
//!
//! **No message reaches the mailbox without a SAFE verdict.**

pub mod classifier;
pub mod processor;
pub mod rate_limit;
pub mod router;
pub mod types;
pub mod watcher;

use std::sync::Arc;

use crate::channels::lmtp::MailStore;
use crate::channels::quarantine::QuarantineStore;
use crate::channels::staging::StagingQueue;
use crate::config::ScanConfig;
use crate::llm::provider::LlmProvider;
use crate::llm::retry::RetryPolicy;
use crate::store::ledger::ProcessedLedger;

pub use classifier::{Classifier, SanitizedFields};
pub use processor::MessageProcessor;
pub use rate_limit::RateLimiter;
pub use router::DeliveryRouter;
pub use watcher::{WatcherOptions, WatcherShutdown, spawn_staging_watcher};

/// Wire a processor from configuration and the three external seams.
pub fn build_processor(
    config: &ScanConfig,
    llm: Arc<dyn LlmProvider>,
    mail_store: Arc<dyn MailStore>,
    ledger: Arc<dyn ProcessedLedger>,
) -> MessageProcessor {
    let staging = StagingQueue::new(config.staging_dir(), config.delivered_dir());
    let quarantine = QuarantineStore::new(config.quarantine_dir());
    let limiter = Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute));
    let classifier = Classifier::new(
        llm,
        RetryPolicy {
            max_attempts: config.max_attempts.max(1),
            ..RetryPolicy::default()
        },
        config.ai_timeout,
    );
    let router = DeliveryRouter::new(
        mail_store,
        quarantine,
        staging.clone(),
        Arc::clone(&ledger),
        config.mail_user.clone(),
        config.mail_domain.clone(),
    );
    MessageProcessor::new(staging, ledger, limiter, classifier, router)
}

/// Create the staging, archive and quarantine directories.
pub async fn ensure_directories(config: &ScanConfig) -> crate::error::Result<()> {
    StagingQueue::new(config.staging_dir(), config.delivered_dir())
        .ensure_dirs()
        .await?;
    QuarantineStore::new(config.quarantine_dir())
        .ensure_dirs()
        .await?;
    Ok(())
}

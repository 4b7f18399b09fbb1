//! Message processor: one staged message from claim to terminal outcome.
//!
//! **Core invariant: a message leaves staging only after its side effect
//! succeeded, and is ledgered only after that.**
//!
//! Flow:
//! 1. Ledger check → already processed ids are retired without side effects
//! 2. Claim (`.mail` → `.processing`), re-check the ledger, read
//! 3. Parse headers → unparseable messages go straight to quarantine
//! 4. Rate limiter admission → denied messages are released for a later pass
//! 5. Sanitize + classify → verdict (QUARANTINE on any failure)
//! 6. Route → deliver or quarantine, then ledger

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channels::email::parse_headers;
use crate::channels::staging::StagingQueue;
use crate::error::StagingError;
use crate::pipeline::classifier::{Classifier, SanitizedFields};
use crate::pipeline::rate_limit::RateLimiter;
use crate::pipeline::router::DeliveryRouter;
use crate::pipeline::types::{
    Outcome, RetryCause, SkipCause, StagedMessage, Verdict, VerdictKind,
};
use crate::safety::{LOG_MAX_LEN, sanitize_for_log};
use crate::store::ledger::ProcessedLedger;

/// Reason recorded for messages whose headers do not parse.
pub const UNPARSEABLE_REASON: &str = "Unparseable message headers";

pub struct MessageProcessor {
    staging: StagingQueue,
    ledger: Arc<dyn ProcessedLedger>,
    limiter: Arc<RateLimiter>,
    classifier: Classifier,
    router: DeliveryRouter,
}

impl MessageProcessor {
    pub fn new(
        staging: StagingQueue,
        ledger: Arc<dyn ProcessedLedger>,
        limiter: Arc<RateLimiter>,
        classifier: Classifier,
        router: DeliveryRouter,
    ) -> Self {
        Self {
            staging,
            ledger,
            limiter,
            classifier,
            router,
        }
    }

    pub fn staging(&self) -> &StagingQueue {
        &self.staging
    }

    pub fn ledger(&self) -> &Arc<dyn ProcessedLedger> {
        &self.ledger
    }

    /// Process one staged id. Never panics on bad input; every path ends in
    /// an [`Outcome`].
    pub async fn process(&self, id: &str) -> Outcome {
        match self.ledger.seen(id).await {
            Ok(true) => return self.retire_processed(id).await,
            Ok(false) => {}
            Err(e) => {
                warn!(id, error = %e, "Ledger check failed, leaving message staged");
                return Outcome::Retry {
                    cause: RetryCause::LedgerFailed(e.to_string()),
                };
            }
        }

        let path = match self.staging.claim(id).await {
            Ok(Some(path)) => path,
            Ok(None) => {
                debug!(id, "Staged file gone before claim");
                return Outcome::Skipped {
                    cause: SkipCause::Vanished,
                };
            }
            Err(StagingError::MalformedName(name)) => {
                warn!(name = %sanitize_for_log(&name, LOG_MAX_LEN), "Skipping malformed staging id");
                return Outcome::Skipped {
                    cause: SkipCause::Malformed,
                };
            }
            Err(e) => {
                warn!(id, error = %e, "Claim failed");
                return Outcome::Retry {
                    cause: RetryCause::ReadFailed(e.to_string()),
                };
            }
        };

        // Another instance may have finished this id between the check above
        // and the claim; only a check made while holding the claim is final.
        match self.ledger.seen(id).await {
            Ok(true) => return self.retire_claimed(id).await,
            Ok(false) => {}
            Err(e) => {
                warn!(id, error = %e, "Ledger check failed, leaving message staged");
                return self
                    .release(
                        id,
                        Outcome::Retry {
                            cause: RetryCause::LedgerFailed(e.to_string()),
                        },
                    )
                    .await;
            }
        }

        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(id, "Claimed file vanished");
                return Outcome::Skipped {
                    cause: SkipCause::Vanished,
                };
            }
            Err(e) => {
                warn!(id, error = %e, "Failed to read claimed message");
                return self
                    .release(
                        id,
                        Outcome::Retry {
                            cause: RetryCause::ReadFailed(e.to_string()),
                        },
                    )
                    .await;
            }
        };

        let Some(headers) = parse_headers(&raw) else {
            warn!(id, bytes = raw.len(), "Unparseable message, quarantining");
            let message = StagedMessage {
                id: id.to_string(),
                path,
                raw,
                headers: Default::default(),
            };
            let outcome = self
                .router
                .route(&message, &Verdict::quarantine(UNPARSEABLE_REASON))
                .await;
            return self.release(id, outcome).await;
        };

        if !self.limiter.admit() {
            debug!(
                id,
                retry_after_secs = self.limiter.retry_after().as_secs(),
                in_window = self.limiter.current_count(),
                "Rate limit reached, deferring"
            );
            return self
                .release(
                    id,
                    Outcome::Retry {
                        cause: RetryCause::RateLimited,
                    },
                )
                .await;
        }

        info!(
            id,
            from = %sanitize_for_log(&headers.from, LOG_MAX_LEN),
            subject = %sanitize_for_log(&headers.subject, LOG_MAX_LEN),
            "Classifying message"
        );

        let fields = SanitizedFields::from_headers(&headers);
        let verdict = self.classifier.classify(&fields).await;

        let message = StagedMessage {
            id: id.to_string(),
            path,
            raw,
            headers,
        };
        let outcome = self.router.route(&message, &verdict).await;
        self.release(id, outcome).await
    }

    /// Already ledgered but still staged: finish the retirement that a crash
    /// interrupted. No delivery, no quarantine.
    async fn retire_processed(&self, id: &str) -> Outcome {
        match self.staging.claim(id).await {
            Ok(Some(_)) => return self.retire_claimed(id).await,
            Ok(None) => {}
            Err(e) => warn!(id, error = %e, "Could not claim already-processed message"),
        }
        Outcome::Skipped {
            cause: SkipCause::AlreadyProcessed,
        }
    }

    /// Retire a claimed, already-ledgered artifact according to its recorded
    /// verdict. Only delivered messages go to the archive.
    async fn retire_claimed(&self, id: &str) -> Outcome {
        let verdict = match self.ledger.get(id).await {
            Ok(record) => record.map(|r| r.verdict),
            Err(e) => {
                warn!(id, error = %e, "Ledger lookup failed, leaving message staged");
                return self
                    .release(
                        id,
                        Outcome::Retry {
                            cause: RetryCause::LedgerFailed(e.to_string()),
                        },
                    )
                    .await;
            }
        };

        info!(id, ?verdict, "Retiring already-processed message left in staging");
        match verdict {
            Some(VerdictKind::Quarantine) => match self.staging.discard(id).await {
                Ok(()) | Err(StagingError::Vanished(_)) => {}
                Err(e) => warn!(id, error = %e, "Failed to remove staged artifact"),
            },
            _ => self.router.retire(id).await,
        }
        Outcome::Skipped {
            cause: SkipCause::AlreadyProcessed,
        }
    }

    /// On a retry outcome, hand the claim back so a later pass sees the file.
    async fn release(&self, id: &str, outcome: Outcome) -> Outcome {
        if let Outcome::Retry { cause } = &outcome {
            debug!(id, ?cause, "Releasing claim");
            if let Err(e) = self.staging.release(id).await {
                warn!(id, error = %e, "Failed to release claim");
            }
        }
        outcome
    }
}

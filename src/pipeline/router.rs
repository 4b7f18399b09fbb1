//! DeliveryRouter: performs the side effect a verdict calls for, then ledgers it.
//!
//! The ledger write always follows a confirmed side effect. A failed side
//! effect leaves the message staged and writes nothing.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::channels::email::address_domain;
use crate::channels::lmtp::MailStore;
use crate::channels::quarantine::QuarantineStore;
use crate::channels::staging::StagingQueue;
use crate::error::StagingError;
use crate::pipeline::types::{Outcome, RetryCause, StagedMessage, Verdict, VerdictKind};
use crate::store::ledger::ProcessedLedger;

pub struct DeliveryRouter {
    mail_store: Arc<dyn MailStore>,
    quarantine: QuarantineStore,
    staging: StagingQueue,
    ledger: Arc<dyn ProcessedLedger>,
    mail_user: String,
    mail_domain: String,
}

impl DeliveryRouter {
    pub fn new(
        mail_store: Arc<dyn MailStore>,
        quarantine: QuarantineStore,
        staging: StagingQueue,
        ledger: Arc<dyn ProcessedLedger>,
        mail_user: impl Into<String>,
        mail_domain: impl Into<String>,
    ) -> Self {
        Self {
            mail_store,
            quarantine,
            staging,
            ledger,
            mail_user: mail_user.into(),
            mail_domain: mail_domain.into().to_lowercase(),
        }
    }

    /// LMTP recipient for a message: its To address when that belongs to the
    /// configured domain, else the configured mailbox.
    pub fn recipient_for(&self, message: &StagedMessage) -> String {
        message
            .headers
            .to_address
            .as_deref()
            .filter(|addr| {
                address_domain(addr).is_some_and(|d| d == self.mail_domain)
                    && !addr.contains(['<', '>', '\r', '\n', ' '])
            })
            .map(str::to_string)
            .unwrap_or_else(|| self.mail_user.clone())
    }

    /// Act on a verdict for a claimed message.
    pub async fn route(&self, message: &StagedMessage, verdict: &Verdict) -> Outcome {
        match verdict.kind {
            VerdictKind::Safe => self.deliver(message, verdict).await,
            VerdictKind::Quarantine => self.quarantine(message, verdict).await,
        }
    }

    async fn deliver(&self, message: &StagedMessage, verdict: &Verdict) -> Outcome {
        let recipient = self.recipient_for(message);

        if let Err(e) = self.mail_store.deliver(&recipient, &message.raw).await {
            warn!(
                id = %message.id,
                error = %e,
                permanent = e.is_permanent(),
                "Delivery failed, message stays staged"
            );
            return Outcome::Retry {
                cause: RetryCause::DeliveryFailed(e.to_string()),
            };
        }

        if let Err(e) = self
            .ledger
            .record(&message.id, VerdictKind::Safe, &verdict.reason)
            .await
        {
            // Retiring anyway keeps a second delivery from happening.
            error!(id = %message.id, error = %e, "Delivered but ledger write failed");
        }

        self.retire(&message.id).await;
        info!(id = %message.id, recipient = %recipient, reason = %verdict.reason, "Message delivered");
        Outcome::Delivered {
            reason: verdict.reason.clone(),
        }
    }

    async fn quarantine(&self, message: &StagedMessage, verdict: &Verdict) -> Outcome {
        if let Err(e) = self.quarantine.admit(&message.id, &message.path).await {
            warn!(id = %message.id, error = %e, "Quarantine move failed, message stays staged");
            return Outcome::Retry {
                cause: RetryCause::QuarantineFailed(e.to_string()),
            };
        }

        if let Err(e) = self
            .ledger
            .record(&message.id, VerdictKind::Quarantine, &verdict.reason)
            .await
        {
            // Already out of staging, so it cannot be processed twice.
            error!(id = %message.id, error = %e, "Quarantined but ledger write failed");
        }

        info!(id = %message.id, reason = %verdict.reason, "Message quarantined");
        Outcome::Quarantined {
            reason: verdict.reason.clone(),
        }
    }

    /// Drop a claimed artifact whose side effect already happened.
    pub async fn retire(&self, id: &str) {
        match self.staging.retire(id).await {
            Ok(()) => {}
            Err(StagingError::Vanished(_)) => {}
            Err(e) => error!(id, error = %e, "Failed to retire staged artifact"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::DeliveryError;
    use crate::pipeline::types::MessageHeaders;
    use crate::store::ledger::LibSqlLedger;

    /// Records deliveries, or fails them all.
    struct RecordingStore {
        delivered: Mutex<Vec<(String, Vec<u8>)>>,
        fail: bool,
    }

    impl RecordingStore {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl MailStore for RecordingStore {
        async fn deliver(&self, recipient: &str, raw: &[u8]) -> Result<(), DeliveryError> {
            if self.fail {
                return Err(DeliveryError::Temporary {
                    stage: "RCPT TO",
                    code: 451,
                    message: "busy".into(),
                });
            }
            self.delivered
                .lock()
                .unwrap()
                .push((recipient.to_string(), raw.to_vec()));
            Ok(())
        }

        async fn check_connection(&self) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        staging: StagingQueue,
        quarantine: QuarantineStore,
        ledger: Arc<LibSqlLedger>,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let staging = StagingQueue::new(tmp.path().join(".staging"), None);
        staging.ensure_dirs().await.unwrap();
        let quarantine = QuarantineStore::new(tmp.path().join("alice/.Quarantine/cur"));
        quarantine.ensure_dirs().await.unwrap();
        let ledger = Arc::new(LibSqlLedger::new_memory().await.unwrap());
        Fixture {
            _tmp: tmp,
            staging,
            quarantine,
            ledger,
        }
    }

    fn router(f: &Fixture, store: Arc<RecordingStore>) -> DeliveryRouter {
        DeliveryRouter::new(
            store,
            f.quarantine.clone(),
            f.staging.clone(),
            f.ledger.clone(),
            "alice",
            "Example.com",
        )
    }

    async fn claimed(f: &Fixture, raw: &[u8], to: Option<&str>) -> StagedMessage {
        let id = f.staging.stage(raw).await.unwrap();
        let path = f.staging.claim(&id).await.unwrap().unwrap();
        StagedMessage {
            id,
            path,
            raw: raw.to_vec(),
            headers: MessageHeaders {
                to_address: to.map(str::to_string),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn safe_delivers_ledgers_and_retires() {
        let f = fixture().await;
        let store = RecordingStore::new(false);
        let router = router(&f, store.clone());
        let msg = claimed(&f, b"hello", None).await;

        let outcome = router.route(&msg, &Verdict::safe("Normal correspondence")).await;
        assert_eq!(
            outcome,
            Outcome::Delivered {
                reason: "Normal correspondence".into()
            }
        );
        assert_eq!(store.delivered.lock().unwrap().len(), 1);
        assert!(f.ledger.seen(&msg.id).await.unwrap());
        assert!(!msg.path.exists());
    }

    #[tokio::test]
    async fn delivery_failure_leaves_message_and_ledger_untouched() {
        let f = fixture().await;
        let router = router(&f, RecordingStore::new(true));
        let msg = claimed(&f, b"hello", None).await;

        let outcome = router.route(&msg, &Verdict::safe("ok")).await;
        assert!(matches!(
            outcome,
            Outcome::Retry {
                cause: RetryCause::DeliveryFailed(_)
            }
        ));
        assert!(!f.ledger.seen(&msg.id).await.unwrap());
        assert!(msg.path.exists());
    }

    #[tokio::test]
    async fn quarantine_moves_under_same_id() {
        let f = fixture().await;
        let store = RecordingStore::new(false);
        let router = router(&f, store.clone());
        let msg = claimed(&f, b"phish", None).await;

        let outcome = router
            .route(&msg, &Verdict::quarantine("Typosquatting urgency"))
            .await;
        assert!(matches!(outcome, Outcome::Quarantined { .. }));
        assert!(store.delivered.lock().unwrap().is_empty());
        assert_eq!(
            tokio::fs::read(f.quarantine.path_for(&msg.id)).await.unwrap(),
            b"phish"
        );
        let rec = f.ledger.get(&msg.id).await.unwrap().unwrap();
        assert_eq!(rec.verdict, VerdictKind::Quarantine);
        assert!(!msg.path.exists());
    }

    #[tokio::test]
    async fn quarantine_failure_leaves_message_staged() {
        let f = fixture().await;
        let router = router(&f, RecordingStore::new(false));
        let mut msg = claimed(&f, b"phish", None).await;
        msg.path = msg.path.with_extension("missing");

        let outcome = router.route(&msg, &Verdict::quarantine("Bad")).await;
        assert!(matches!(
            outcome,
            Outcome::Retry {
                cause: RetryCause::QuarantineFailed(_)
            }
        ));
        assert!(!f.ledger.seen(&msg.id).await.unwrap());
    }

    #[tokio::test]
    async fn recipient_uses_to_address_in_domain() {
        let f = fixture().await;
        let router = router(&f, RecordingStore::new(false));

        let in_domain = claimed(&f, b"x", Some("svc-github@example.com")).await;
        assert_eq!(router.recipient_for(&in_domain), "svc-github@example.com");

        let foreign = claimed(&f, b"x", Some("someone@elsewhere.org")).await;
        assert_eq!(router.recipient_for(&foreign), "alice");

        let missing = claimed(&f, b"x", None).await;
        assert_eq!(router.recipient_for(&missing), "alice");
    }
}

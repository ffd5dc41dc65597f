//! Operator alerting
//!
//! Components emit structured [`AlertEvent`]s; formatting and delivery are
//! the alerter's concern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use crate::core_types::{Chain, DepositId, PayoutId, SweepBatchId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    /// Pre-credit reorg; no balance impact
    ReorgBeforeCredit {
        deposit_id: DepositId,
        user_id: UserId,
        chain: Chain,
        tx_hash: String,
        reason: String,
    },
    /// Post-credit reorg that could not be auto-reversed
    ReorgRequiresReview {
        deposit_id: DepositId,
        user_id: UserId,
        chain: Chain,
        amount_usd: Decimal,
        reason: String,
    },
    ReorgReversed {
        deposit_id: DepositId,
        user_id: UserId,
        chain: Chain,
        amount_usd: Decimal,
    },
    SweepFailed {
        chain: Chain,
        batch_id: SweepBatchId,
        failed: usize,
        succeeded: usize,
        errors: Vec<String>,
    },
    PayoutInsufficientFunds {
        payout_id: PayoutId,
        chain: Chain,
        token_address: String,
        required: Decimal,
        available: Decimal,
        shortfall: Decimal,
    },
    PayoutFailed {
        payout_id: PayoutId,
        chain: Chain,
        reason: String,
        tx_hash: Option<String>,
    },
    /// Outcome unknown to the ledger; check the chain before any retry
    PayoutStuck {
        payout_id: PayoutId,
        chain: Chain,
        reason: String,
        tx_hash: Option<String>,
    },
}

impl AlertKind {
    pub fn severity(&self) -> Severity {
        match self {
            AlertKind::ReorgBeforeCredit { .. } | AlertKind::SweepFailed { .. } => {
                Severity::Warning
            }
            _ => Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: AlertKind,
}

impl AlertEvent {
    pub fn new(kind: AlertKind, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            at,
            severity: kind.severity(),
            kind,
        }
    }
}

/// Delivery must not fail the caller; implementations log their own errors.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, event: AlertEvent);
}

/// Writes alerts to the tracing pipeline
#[derive(Debug, Default)]
pub struct TracingAlerter;

#[async_trait]
impl Alerter for TracingAlerter {
    async fn alert(&self, event: AlertEvent) {
        let payload = serde_json::to_string(&event.kind).unwrap_or_default();
        match event.severity {
            Severity::Critical => error!(alert_id = %event.id, "ALERT {}", payload),
            Severity::Warning => warn!(alert_id = %event.id, "ALERT {}", payload),
        }
    }
}

/// POSTs alert JSON to a webhook, falling back to tracing on failure
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
    fallback: TracingAlerter,
}

impl WebhookAlerter {
    pub fn new(url: String) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url,
            fallback: TracingAlerter,
        })
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn alert(&self, event: AlertEvent) {
        let result = self
            .client
            .post(&self.url)
            .json(&event)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        if let Err(e) = result {
            warn!(alert_id = %event.id, error = %e, "Webhook alert delivery failed");
            self.fallback.alert(event).await;
        }
    }
}

/// Collects alerts in memory for assertions
#[cfg(test)]
#[derive(Default)]
pub struct RecordingAlerter {
    events: std::sync::Mutex<Vec<AlertEvent>>,
}

#[cfg(test)]
impl RecordingAlerter {
    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<AlertKind> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Alerter for RecordingAlerter {
    async fn alert(&self, event: AlertEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_serializes_flat() {
        let event = AlertEvent::new(
            AlertKind::PayoutInsufficientFunds {
                payout_id: 7,
                chain: Chain::Base,
                token_address: "0xtoken".to_string(),
                required: Decimal::new(100, 0),
                available: Decimal::new(40, 0),
                shortfall: Decimal::new(60, 0),
            },
            Utc::now(),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "payout_insufficient_funds");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["shortfall"], "60");
        assert_eq!(json["chain"], "base");
    }

    #[test]
    fn test_severity() {
        let kind = AlertKind::SweepFailed {
            chain: Chain::Ethereum,
            batch_id: 1,
            failed: 2,
            succeeded: 0,
            errors: vec![],
        };
        assert_eq!(kind.severity(), Severity::Warning);
    }

    #[tokio::test]
    async fn test_recording_alerter() {
        let alerter = RecordingAlerter::default();
        alerter
            .alert(AlertEvent::new(
                AlertKind::ReorgReversed {
                    deposit_id: 1,
                    user_id: 2,
                    chain: Chain::Solana,
                    amount_usd: Decimal::new(50, 0),
                },
                Utc::now(),
            ))
            .await;
        assert_eq!(alerter.events().len(), 1);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::Minor;

/// A request to move funds for one reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    pub amount: Minor,
    pub currency: String,
    pub token: String,
    pub description: String,
}

/// Proof that a charge was captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub id: String,
    pub amount: Minor,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentError {
    Declined(String),
    Unavailable(String),
    Timeout(Duration),
}

impl std::fmt::Display for PaymentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentError::Declined(reason) => write!(f, "declined: {reason}"),
            PaymentError::Unavailable(reason) => write!(f, "gateway unavailable: {reason}"),
            PaymentError::Timeout(after) => write!(f, "gateway timed out after {after:?}"),
        }
    }
}

impl std::error::Error for PaymentError {}

/// External payment authorization. Implementations move real money, so
/// callers never retry a charge on their own.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, charge: &Charge) -> Result<Receipt, PaymentError>;

    /// Compensate a captured charge whose reservation could not be stored.
    async fn refund(&self, receipt: &Receipt) -> Result<(), PaymentError>;
}

/// Run a gateway call under a deadline. Expiry is a failure, never success.
pub async fn with_deadline<T, F>(limit: Duration, call: F) -> Result<T, PaymentError>
where
    F: std::future::Future<Output = Result<T, PaymentError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(PaymentError::Timeout(limit)),
    }
}

pub const DECLINED_TOKEN: &str = "tok_chargeDeclined";

/// In-process gateway with test-card semantics: tokens must start with
/// `tok_`, and `tok_chargeDeclined` is always declined.
#[derive(Debug, Default)]
pub struct SandboxGateway {
    captured: DashMap<String, Receipt>,
    attempts: AtomicU64,
    refunds: AtomicU64,
    latency: Option<Duration>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`, e.g. to exercise deadlines.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Number of `charge` calls received, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn refunds(&self) -> u64 {
        self.refunds.load(Ordering::Relaxed)
    }

    /// Charges currently captured (refunded ones excluded).
    pub fn captured(&self) -> Vec<Receipt> {
        self.captured.iter().map(|e| e.value().clone()).collect()
    }

    pub fn captured_total(&self) -> Minor {
        self.captured.iter().map(|e| e.value().amount).sum()
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn charge(&self, charge: &Charge) -> Result<Receipt, PaymentError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !charge.token.starts_with("tok_") {
            return Err(PaymentError::Declined("invalid payment token".into()));
        }
        if charge.token == DECLINED_TOKEN {
            return Err(PaymentError::Declined("card declined".into()));
        }
        if charge.amount <= 0 {
            return Err(PaymentError::Declined("amount must be positive".into()));
        }
        let receipt = Receipt {
            id: format!("ch_{}", Ulid::new()),
            amount: charge.amount,
            currency: charge.currency.clone(),
        };
        self.captured.insert(receipt.id.clone(), receipt.clone());
        Ok(receipt)
    }

    async fn refund(&self, receipt: &Receipt) -> Result<(), PaymentError> {
        match self.captured.remove(&receipt.id) {
            Some(_) => {
                self.refunds.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(PaymentError::Declined(format!("unknown charge {}", receipt.id))),
        }
    }
}

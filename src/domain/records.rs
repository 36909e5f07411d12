use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const MIN_RATING: i64 = 1;
pub const MAX_RATING: i64 = 5;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReviewStatus::Pending => f.write_str("pending"),
            ReviewStatus::Approved => f.write_str("approved"),
            ReviewStatus::Rejected => f.write_str("rejected"),
        }
    }
}

/// A rating one user gave a subject. Only approved reviews feed the rankings.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ReviewRecord {
    pub id: String,
    pub author_id: String,
    pub subject_id: String,
    pub rating: u8,
    #[serde(default)]
    pub content: String,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReviewRecord {
    /// A fresh pending review with a generated id.
    pub fn submit(
        author_id: impl Into<String>,
        subject_id: impl Into<String>,
        rating: i64,
        content: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            author_id: author_id.into(),
            subject_id: subject_id.into(),
            rating: validate_rating(rating)?,
            content: content.into(),
            status: ReviewStatus::Pending,
            created_at: at,
            updated_at: at,
        })
    }

    /// Moves a pending review to `to`. Decided reviews are final.
    pub fn decide(&mut self, to: ReviewStatus, at: DateTime<Utc>) -> Result<()> {
        if self.status != ReviewStatus::Pending || to == ReviewStatus::Pending {
            return Err(CoreError::InvalidTransition {
                kind: "review",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = at;
        Ok(())
    }
}

pub fn validate_rating(rating: i64) -> Result<u8> {
    if (MIN_RATING..=MAX_RATING).contains(&rating) {
        Ok(rating as u8)
    } else {
        Err(CoreError::InvalidRating(rating))
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Pending => f.write_str("pending"),
            PaymentStatus::Paid => f.write_str("paid"),
            PaymentStatus::Failed => f.write_str("failed"),
        }
    }
}

/// A top-up payment through an external provider.
///
/// `provider_ref_id` identifies the subject the payment is commissioned to.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PaymentRecord {
    pub id: String,
    pub user_id: String,
    pub amount: u64,
    #[serde(default)]
    pub provider: String,
    pub provider_ref_id: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn pending(
        user_id: impl Into<String>,
        amount: i64,
        provider: impl Into<String>,
        provider_ref_id: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        let amount = u64::try_from(amount)
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| {
                CoreError::InvalidAmount(format!("payment amount must be positive, got {amount}"))
            })?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            amount,
            provider: provider.into(),
            provider_ref_id: provider_ref_id.into(),
            status: PaymentStatus::Pending,
            created_at: at,
            updated_at: at,
        })
    }

    /// Records the provider's verdict on a pending payment.
    pub fn settle(&mut self, paid: bool, at: DateTime<Utc>) -> Result<()> {
        let to = if paid {
            PaymentStatus::Paid
        } else {
            PaymentStatus::Failed
        };
        if self.status != PaymentStatus::Pending {
            return Err(CoreError::InvalidTransition {
                kind: "payment",
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = at;
        Ok(())
    }
}

/// Records returned by a store scan, minus the ones that failed to decode.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordScan<T> {
    pub records: Vec<T>,
    pub malformed: usize,
}

impl<T> RecordScan<T> {
    pub fn new(records: Vec<T>) -> Self {
        Self {
            records,
            malformed: 0,
        }
    }
}

impl<T> Default for RecordScan<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

use crate::domain::records::{
    PaymentRecord, PaymentStatus, ReviewRecord, ReviewStatus, validate_rating,
};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::io::Read;
use uuid::Uuid;

/// Reads rows of any deserializable shape from a CSV source.
///
/// This reader wraps `csv::Reader` and provides an iterator over `Result<T>`.
/// It handles whitespace trimming and flexible record lengths automatically.
pub struct RecordReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> RecordReader<R> {
    /// Creates a new `RecordReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes rows.
    ///
    /// A row that fails to parse yields an `Err` and the iteration continues with the
    /// next row.
    pub fn records<T: DeserializeOwned>(self) -> impl Iterator<Item = Result<T>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(CoreError::from))
    }
}

/// `package_id,name,coin_cost,duration_days`
#[derive(Debug, Deserialize, PartialEq)]
pub struct PackageRow {
    pub package_id: String,
    pub name: String,
    pub coin_cost: u64,
    pub duration_days: i64,
}

/// `id,author_id,subject_id,rating,content,status,created_at`
///
/// `id` and `content` may be left empty; a missing id is generated.
#[derive(Debug, Deserialize, PartialEq)]
pub struct ReviewRow {
    pub id: Option<String>,
    pub author_id: String,
    pub subject_id: String,
    pub rating: i64,
    pub content: Option<String>,
    pub status: ReviewStatus,
    pub created_at: DateTime<Utc>,
}

impl ReviewRow {
    pub fn into_record(self) -> Result<ReviewRecord> {
        Ok(ReviewRecord {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            author_id: self.author_id,
            subject_id: self.subject_id,
            rating: validate_rating(self.rating)?,
            content: self.content.unwrap_or_default(),
            status: self.status,
            created_at: self.created_at,
            updated_at: self.created_at,
        })
    }
}

/// `id,user_id,amount,provider,provider_ref_id,status,created_at`
#[derive(Debug, Deserialize, PartialEq)]
pub struct PaymentRow {
    pub id: Option<String>,
    pub user_id: String,
    pub amount: i64,
    pub provider: Option<String>,
    pub provider_ref_id: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

impl PaymentRow {
    pub fn into_record(self) -> Result<PaymentRecord> {
        let amount = u64::try_from(self.amount)
            .ok()
            .filter(|value| *value > 0)
            .ok_or_else(|| {
                CoreError::InvalidAmount(format!(
                    "payment amount must be positive, got {}",
                    self.amount
                ))
            })?;
        Ok(PaymentRecord {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            user_id: self.user_id,
            amount,
            provider: self.provider.unwrap_or_default(),
            provider_ref_id: self.provider_ref_id,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.created_at,
        })
    }
}

#[derive(Debug, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Deposit,
    Deduct,
    Transfer,
    Buy,
}

/// One ledger operation to replay: `op,user,target,amount`.
///
/// `target` is the recipient of a transfer or the package of a purchase.
#[derive(Debug, Deserialize, PartialEq)]
pub struct OperationRow {
    pub op: OperationKind,
    pub user: String,
    pub target: Option<String>,
    pub amount: Option<i64>,
}

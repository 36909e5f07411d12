use crate::domain::records::{PaymentRecord, PaymentStatus, ReviewRecord, ReviewStatus};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Calendar month key in `YYYY-MM` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    year: i32,
    month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if (0..=9999).contains(&year) && (1..=12).contains(&month) {
            Ok(Self { year, month })
        } else {
            Err(CoreError::InvalidMonth(format!("{year:04}-{month:02}")))
        }
    }

    /// The month `at` falls in, in UTC.
    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at.year() == self.year && at.month() == self.month
    }
}

impl FromStr for Month {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || CoreError::InvalidMonth(s.to_string());
        let bytes = s.as_bytes();
        if bytes.len() != 7 || bytes[4] != b'-' {
            return Err(invalid());
        }
        let digits = |part: &str| -> Result<u32> {
            if part.bytes().all(|b| b.is_ascii_digit()) {
                part.parse().map_err(|_| invalid())
            } else {
                Err(invalid())
            }
        };
        let year = digits(&s[..4])?;
        let month = digits(&s[5..])?;
        Self::new(year as i32, month).map_err(|_| invalid())
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl Serialize for Month {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Month {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct RankEntry {
    pub subject_id: String,
    pub rating_sum: u64,
    pub review_count: u64,
    pub rank_position: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct CommissionEntry {
    pub subject_id: String,
    pub amount: f64,
    pub month: Month,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct BonusEntry {
    pub subject_id: String,
    pub amount: f64,
    pub period: String,
    pub created_at: DateTime<Utc>,
}

/// Identifies the rows written by one settlement run for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(Uuid);

impl Generation {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Generation {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The unit a settlement pass replaces as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SettlementScope {
    Rankings,
    Commissions(Month),
    Bonuses(String),
}

impl fmt::Display for SettlementScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementScope::Rankings => f.write_str("rankings"),
            SettlementScope::Commissions(month) => write!(f, "commissions/{month}"),
            SettlementScope::Bonuses(period) => write!(f, "bonuses/{period}"),
        }
    }
}

/// All rows of one scope produced by a settlement pass.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultSet {
    Rankings(Vec<RankEntry>),
    Commissions {
        month: Month,
        entries: Vec<CommissionEntry>,
    },
    Bonuses {
        period: String,
        entries: Vec<BonusEntry>,
    },
}

impl ResultSet {
    pub fn scope(&self) -> SettlementScope {
        match self {
            ResultSet::Rankings(_) => SettlementScope::Rankings,
            ResultSet::Commissions { month, .. } => SettlementScope::Commissions(*month),
            ResultSet::Bonuses { period, .. } => SettlementScope::Bonuses(period.clone()),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ResultSet::Rankings(entries) => entries.len(),
            ResultSet::Commissions { entries, .. } => entries.len(),
            ResultSet::Bonuses { entries, .. } => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ranks subjects by the sum of their approved ratings.
///
/// Ties on `rating_sum` are ordered by `subject_id` so repeated runs over the same
/// reviews produce the same positions.
pub fn rank_subjects(reviews: &[ReviewRecord], at: DateTime<Utc>) -> Vec<RankEntry> {
    let mut totals: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for review in reviews
        .iter()
        .filter(|r| r.status == ReviewStatus::Approved)
    {
        let entry = totals.entry(review.subject_id.as_str()).or_default();
        entry.0 += u64::from(review.rating);
        entry.1 += 1;
    }

    let mut ranked: Vec<(&str, (u64, u64))> = totals.into_iter().collect();
    // Stable sort keeps the BTreeMap's subject_id order among equal sums.
    ranked.sort_by(|(_, (a_sum, _)), (_, (b_sum, _))| b_sum.cmp(a_sum));

    ranked
        .into_iter()
        .enumerate()
        .map(|(idx, (subject_id, (rating_sum, review_count)))| RankEntry {
            subject_id: subject_id.to_string(),
            rating_sum,
            review_count,
            rank_position: idx as u32 + 1,
            updated_at: at,
        })
        .collect()
}

/// Commission owed per subject for paid payments created within `month`.
pub fn commission_by_subject(
    payments: &[PaymentRecord],
    month: Month,
    percent: f64,
    at: DateTime<Utc>,
) -> Vec<CommissionEntry> {
    // A few maximal payments already overflow u64.
    let mut totals: BTreeMap<&str, u128> = BTreeMap::new();
    for payment in payments
        .iter()
        .filter(|p| p.status == PaymentStatus::Paid && month.contains(p.created_at))
    {
        *totals.entry(payment.provider_ref_id.as_str()).or_default() += u128::from(payment.amount);
    }

    totals
        .into_iter()
        .map(|(subject_id, total)| CommissionEntry {
            subject_id: subject_id.to_string(),
            amount: total as f64 * percent / 100.0,
            month,
            created_at: at,
        })
        .collect()
}

/// Flat bonus for the `top_n` best-ranked subjects whose rank was refreshed at or
/// after `cutoff`.
pub fn select_bonus(
    mut ranks: Vec<RankEntry>,
    cutoff: DateTime<Utc>,
    top_n: usize,
    amount: f64,
    period: &str,
    at: DateTime<Utc>,
) -> Vec<BonusEntry> {
    ranks.retain(|r| r.updated_at >= cutoff);
    ranks.sort_by(|a, b| {
        a.rank_position
            .cmp(&b.rank_position)
            .then_with(|| a.subject_id.cmp(&b.subject_id))
    });
    ranks
        .into_iter()
        .take(top_n)
        .map(|r| BonusEntry {
            subject_id: r.subject_id,
            amount,
            period: period.to_string(),
            created_at: at,
        })
        .collect()
}

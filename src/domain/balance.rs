use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A quantity of coins in the smallest currency unit.
///
/// Unsigned, so a balance can never be observed below zero.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Coins(pub u64);

/// A strictly positive amount moved by a ledger operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Amount(u64);

impl Coins {
    pub const ZERO: Self = Self(0);

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn checked_add(self, amount: Amount) -> Option<Self> {
        self.0.checked_add(amount.0).map(Self)
    }

    pub fn checked_sub(self, amount: Amount) -> Option<Self> {
        self.0.checked_sub(amount.0).map(Self)
    }
}

impl fmt::Display for Coins {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Amount {
    pub fn new(value: i64) -> Result<Self> {
        if value > 0 {
            Ok(Self(value as u64))
        } else {
            Err(CoreError::InvalidAmount(format!(
                "amount must be positive, got {value}"
            )))
        }
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = CoreError;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<Coins> for Amount {
    type Error = CoreError;

    fn try_from(value: Coins) -> Result<Self> {
        if value.0 > 0 {
            Ok(Self(value.0))
        } else {
            Err(CoreError::InvalidAmount("amount must be positive, got 0".to_string()))
        }
    }
}

impl From<Amount> for Coins {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The coin balance held by one user.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct CoinBalance {
    pub user_id: String,
    pub amount: Coins,
    pub updated_at: DateTime<Utc>,
}

impl CoinBalance {
    pub fn new(user_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            amount: Coins::ZERO,
            updated_at: at,
        }
    }

    /// Adds coins to the balance.
    pub fn credit(&mut self, amount: Amount, at: DateTime<Utc>) -> Result<()> {
        self.amount = self.amount.checked_add(amount).ok_or_else(|| {
            CoreError::InvalidAmount(format!(
                "crediting {amount} to {} would overflow",
                self.user_id
            ))
        })?;
        self.updated_at = at;
        Ok(())
    }

    /// Removes coins if the balance covers them.
    pub fn debit(&mut self, amount: Amount, at: DateTime<Utc>) -> Result<()> {
        match self.amount.checked_sub(amount) {
            Some(rest) => {
                self.amount = rest;
                self.updated_at = at;
                Ok(())
            }
            None => Err(CoreError::InsufficientBalance {
                user_id: self.user_id.clone(),
                available: self.amount,
                requested: amount.value(),
            }),
        }
    }
}

/// One conditional mutation of a balance.
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceOp {
    /// Creates the balance on first use.
    Credit { user_id: String, amount: Amount },
    /// Requires an existing balance of at least `amount`.
    Debit { user_id: String, amount: Amount },
}

impl BalanceOp {
    pub fn user_id(&self) -> &str {
        match self {
            BalanceOp::Credit { user_id, .. } | BalanceOp::Debit { user_id, .. } => user_id,
        }
    }

    fn apply_to(&self, existing: Option<CoinBalance>, at: DateTime<Utc>) -> Result<CoinBalance> {
        match self {
            BalanceOp::Credit { user_id, amount } => {
                let mut balance = existing.unwrap_or_else(|| CoinBalance::new(user_id.clone(), at));
                balance.credit(*amount, at)?;
                Ok(balance)
            }
            BalanceOp::Debit { user_id, amount } => {
                let mut balance = existing.ok_or_else(|| CoreError::NoBalanceRecord {
                    user_id: user_id.clone(),
                })?;
                balance.debit(*amount, at)?;
                Ok(balance)
            }
        }
    }
}

/// Outcome of evaluating a batch of [`BalanceOp`]s without writing anything.
#[derive(Debug, Default)]
pub struct BalancePlan {
    /// Final state of every balance the batch touched.
    pub touched: HashMap<String, CoinBalance>,
    /// State of the affected balance right after each op, in op order.
    pub results: Vec<CoinBalance>,
}

/// Evaluates `ops` in order, reading each balance at most once through `load`.
///
/// Stores call this inside their atomic section and persist `touched` only when it
/// returns `Ok`, which makes a batch all-or-nothing.
pub fn plan_ops<F>(ops: &[BalanceOp], at: DateTime<Utc>, mut load: F) -> Result<BalancePlan>
where
    F: FnMut(&str) -> Result<Option<CoinBalance>>,
{
    let mut plan = BalancePlan::default();
    for op in ops {
        let user_id = op.user_id();
        let existing = match plan.touched.remove(user_id) {
            Some(balance) => Some(balance),
            None => load(user_id)?,
        };
        let next = op.apply_to(existing, at)?;
        plan.results.push(next.clone());
        plan.touched.insert(user_id.to_string(), next);
    }
    Ok(plan)
}

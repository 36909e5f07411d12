use crate::domain::balance::{Amount, BalanceOp, CoinBalance, Coins};
use crate::domain::ports::{BalanceStore, BalanceStoreRef, TimeSourceRef};
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::slice;
use tracing::{debug, error, info};

/// Balances on both sides of a completed transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transfer {
    pub from: CoinBalance,
    pub to: CoinBalance,
}

/// Per-user coin balances and the operations that move them.
///
/// Every mutation is a single conditional [`BalanceStore::apply`] call, so the
/// balance check and the write can't be separated by a concurrent caller.
#[derive(Clone)]
pub struct Ledger {
    balances: BalanceStoreRef,
    clock: TimeSourceRef,
}

impl Ledger {
    pub fn new(balances: BalanceStoreRef, clock: TimeSourceRef) -> Self {
        Self { balances, clock }
    }

    /// Current balance, zero for a user who was never credited.
    pub async fn balance(&self, user_id: &str) -> Result<Coins> {
        let amount = self
            .balances
            .get(user_id)
            .await?
            .map(|b| b.amount)
            .unwrap_or(Coins::ZERO);
        debug!(user_id, %amount, "balance read");
        Ok(amount)
    }

    /// Every balance record, ordered by user id.
    pub async fn balances(&self) -> Result<Vec<CoinBalance>> {
        let mut all = self.balances.get_all().await?;
        all.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(all)
    }

    pub async fn deposit(&self, user_id: &str, amount: i64) -> Result<CoinBalance> {
        self.credit(user_id, Amount::new(amount)?).await
    }

    pub async fn deduct(&self, user_id: &str, amount: i64) -> Result<CoinBalance> {
        self.debit(user_id, Amount::new(amount)?).await
    }

    /// Moves `amount` from `from` to `to` as a debit followed by a credit.
    ///
    /// A failed debit never reaches the credit. The credit runs on its own task, so
    /// dropping this future after the debit still lets the credit finish. A process
    /// crash between the two legs leaves `from` debited; use [`Ledger::transfer_atomic`]
    /// when that window is unacceptable.
    pub async fn transfer(&self, from: &str, to: &str, amount: i64) -> Result<Transfer> {
        if from == to {
            return Err(CoreError::SelfTransfer {
                user_id: from.to_string(),
            });
        }
        let amount = Amount::new(amount)?;

        let debited = self.debit(from, amount).await?;

        let ledger = self.clone();
        let recipient = to.to_string();
        let credited = tokio::spawn(async move { ledger.credit(&recipient, amount).await })
            .await
            .unwrap_or_else(|join_err| Err(CoreError::store(join_err)))
            .inspect_err(|err| {
                error!(from, to, %amount, error = %err, "transfer debited source but credit failed");
            })?;

        info!(from, to, %amount, "transfer completed");
        Ok(Transfer {
            from: debited,
            to: credited,
        })
    }

    /// Transfer whose two legs commit together or not at all.
    pub async fn transfer_atomic(&self, from: &str, to: &str, amount: i64) -> Result<Transfer> {
        if from == to {
            return Err(CoreError::SelfTransfer {
                user_id: from.to_string(),
            });
        }
        let mut results = self
            .unit_of_work()
            .deduct(from, amount)?
            .deposit(to, amount)?
            .commit()
            .await?
            .into_iter();

        match (results.next(), results.next()) {
            (Some(debited), Some(credited)) => {
                info!(from, to, amount, "atomic transfer completed");
                Ok(Transfer {
                    from: debited,
                    to: credited,
                })
            }
            _ => Err(CoreError::store(
                "balance store returned fewer results than submitted ops",
            )),
        }
    }

    /// Starts a batch of balance ops that commit through one atomic store call.
    pub fn unit_of_work(&self) -> LedgerBatch {
        LedgerBatch {
            ledger: self.clone(),
            ops: Vec::new(),
        }
    }

    pub(crate) async fn credit(&self, user_id: &str, amount: Amount) -> Result<CoinBalance> {
        let op = BalanceOp::Credit {
            user_id: user_id.to_string(),
            amount,
        };
        let balance = apply_one(self.balances.as_ref(), op, self.clock.now()).await?;
        info!(user_id, %amount, balance = %balance.amount, "coins deposited");
        Ok(balance)
    }

    pub(crate) async fn debit(&self, user_id: &str, amount: Amount) -> Result<CoinBalance> {
        let op = BalanceOp::Debit {
            user_id: user_id.to_string(),
            amount,
        };
        let balance = apply_one(self.balances.as_ref(), op, self.clock.now()).await?;
        info!(user_id, %amount, balance = %balance.amount, "coins deducted");
        Ok(balance)
    }
}

async fn apply_one(
    store: &dyn BalanceStore,
    op: BalanceOp,
    at: DateTime<Utc>,
) -> Result<CoinBalance> {
    store
        .apply(slice::from_ref(&op), at)
        .await?
        .pop()
        .ok_or_else(|| CoreError::store(format!("no balance returned for {}", op.user_id())))
}

/// Debits and credits collected for a single all-or-nothing commit.
///
/// Amounts are validated as they are added; balance checks happen at commit time
/// against the stored balances, including the effect of earlier ops in the batch.
pub struct LedgerBatch {
    ledger: Ledger,
    ops: Vec<BalanceOp>,
}

impl LedgerBatch {
    pub fn deposit(mut self, user_id: &str, amount: i64) -> Result<Self> {
        self.ops.push(BalanceOp::Credit {
            user_id: user_id.to_string(),
            amount: Amount::new(amount)?,
        });
        Ok(self)
    }

    pub fn deduct(mut self, user_id: &str, amount: i64) -> Result<Self> {
        self.ops.push(BalanceOp::Debit {
            user_id: user_id.to_string(),
            amount: Amount::new(amount)?,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies every op or none. Returns the balance after each op, in op order.
    pub async fn commit(self) -> Result<Vec<CoinBalance>> {
        if self.ops.is_empty() {
            return Ok(Vec::new());
        }
        let at = self.ledger.clock.now();
        let results = self.ledger.balances.apply(&self.ops, at).await?;
        info!(ops = self.ops.len(), "ledger batch committed");
        Ok(results)
    }
}

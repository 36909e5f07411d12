use super::balance::{BalanceOp, CoinBalance};
use super::entitlement::{Entitlement, PackageDefinition};
use super::records::{PaymentRecord, RecordScan, ReviewRecord};
use super::settlement::{
    BonusEntry, CommissionEntry, Generation, Month, RankEntry, ResultSet, SettlementScope,
};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::Mutex;

#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<CoinBalance>>;

    /// Applies every op or none of them.
    ///
    /// Debits are checked against the balance as it stands inside the same atomic
    /// section that writes it. Returns the balance after each op, in op order.
    async fn apply(&self, ops: &[BalanceOp], at: DateTime<Utc>) -> Result<Vec<CoinBalance>>;

    async fn get_all(&self) -> Result<Vec<CoinBalance>>;
}

/// Computes the next entitlement from the current one (if any).
pub type EntitlementUpdate<'a> = &'a (dyn Fn(Option<&Entitlement>) -> Entitlement + Send + Sync);

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Entitlement>>;
    async fn any_active(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Atomic read-modify-write of the (user, package) entitlement.
    async fn upsert_with(
        &self,
        user_id: &str,
        package_id: &str,
        update: EntitlementUpdate<'_>,
    ) -> Result<Entitlement>;
}

#[async_trait]
pub trait PackageCatalog: Send + Sync {
    async fn get(&self, package_id: &str) -> Result<Option<PackageDefinition>>;
    async fn put(&self, package: PackageDefinition) -> Result<()>;
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn put(&self, review: ReviewRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<ReviewRecord>>;
    /// Approved reviews created at or after `since`.
    async fn approved_since(&self, since: DateTime<Utc>) -> Result<RecordScan<ReviewRecord>>;
}

#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn put(&self, payment: PaymentRecord) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<PaymentRecord>>;
    async fn paid(&self) -> Result<RecordScan<PaymentRecord>>;
}

/// Derived settlement tables, replaced one scope at a time.
///
/// Rows are written under a [`Generation`] that stays invisible until `publish`
/// swaps the scope's current-generation pointer. Readers only ever see the published
/// generation.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn stage(&self, generation: &Generation, rows: &ResultSet) -> Result<()>;

    /// Makes `generation` current for `scope`, returning the generation it replaced.
    ///
    /// The replaced generation is retired: its rows stay until the next `prune`.
    async fn publish(
        &self,
        scope: &SettlementScope,
        generation: &Generation,
    ) -> Result<Option<Generation>>;

    /// Deletes the rows of every retired generation of `scope`. Staged generations that
    /// were never published and the current one are left alone. Returns the number of
    /// rows removed.
    async fn prune(&self, scope: &SettlementScope) -> Result<usize>;

    async fn rankings(&self) -> Result<Vec<RankEntry>>;
    async fn commissions(&self, month: &Month) -> Result<Vec<CommissionEntry>>;
    async fn bonuses(&self, period: &str) -> Result<Vec<BonusEntry>>;
}

/// Wall-clock source, injectable so time-dependent rules can be tested.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used by tests and replays.
#[derive(Debug)]
pub struct ManualTimeSource {
    now: Mutex<DateTime<Utc>>,
}

impl ManualTimeSource {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub type BalanceStoreRef = Arc<dyn BalanceStore>;
pub type EntitlementStoreRef = Arc<dyn EntitlementStore>;
pub type PackageCatalogRef = Arc<dyn PackageCatalog>;
pub type ReviewStoreRef = Arc<dyn ReviewStore>;
pub type PaymentStoreRef = Arc<dyn PaymentStore>;
pub type ResultStoreRef = Arc<dyn ResultStore>;
pub type TimeSourceRef = Arc<dyn TimeSource>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_manual_time_source_moves_only_when_told() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualTimeSource::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::days(2));
        assert_eq!(clock.now(), start + Duration::days(2));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_system_time_source_is_recent() {
        let now = SystemTimeSource.now();
        assert!(now.timestamp() > 1_700_000_000);
    }
}

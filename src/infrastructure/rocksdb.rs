use crate::config::Settings;
use crate::domain::balance::{BalanceOp, CoinBalance, plan_ops};
use crate::domain::entitlement::{Entitlement, PackageDefinition};
use crate::domain::ports::{
    BalanceStore, EntitlementStore, EntitlementUpdate, PackageCatalog, PaymentStore, ResultStore,
    ReviewStore,
};
use crate::domain::records::{PaymentRecord, PaymentStatus, RecordScan, ReviewRecord, ReviewStatus};
use crate::domain::settlement::{
    BonusEntry, CommissionEntry, Generation, Month, RankEntry, ResultSet, SettlementScope,
};
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode,
    OptimisticTransactionDB, Options, Transaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub const CF_BALANCES: &str = "balances";
pub const CF_ENTITLEMENTS: &str = "entitlements";
pub const CF_PACKAGES: &str = "packages";
pub const CF_REVIEWS: &str = "reviews";
pub const CF_PAYMENTS: &str = "payments";
/// Settlement rows keyed `scope \0 generation \0 index`.
pub const CF_RESULTS: &str = "results";
/// Current generation per settlement scope.
pub const CF_RESULT_POINTERS: &str = "result_pointers";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_BALANCES,
    CF_ENTITLEMENTS,
    CF_PACKAGES,
    CF_REVIEWS,
    CF_PAYMENTS,
    CF_RESULTS,
    CF_RESULT_POINTERS,
];

const KEY_SEPARATOR: char = '\u{0}';

type Txn<'db> = Transaction<'db, OptimisticTransactionDB>;

/// A persistent store implementing every port on one RocksDB instance.
///
/// Each entity kind lives in its own Column Family. Conditional writes run in
/// optimistic transactions: keys are read with `get_for_update`, and a commit that
/// loses a race is retried from scratch up to `max_write_attempts` times.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<OptimisticTransactionDB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<OptimisticTransactionDB>,
    max_write_attempts: u32,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path` with default settings.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &Settings::default())
    }

    /// Opens or creates a RocksDB instance, ensuring all column families exist.
    pub fn open_with<P: AsRef<Path>>(path: P, settings: &Settings) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db: OptimisticTransactionDB =
            OptimisticTransactionDB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            max_write_attempts: settings.max_write_attempts.max(1),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| CoreError::store(format!("{name} column family not found")))
    }

    /// Runs `body` in an optimistic transaction, retrying on commit conflicts.
    ///
    /// An `Err` from `body` drops the transaction, discarding its writes.
    fn transact<T>(&self, key: &str, mut body: impl FnMut(&Txn<'_>) -> Result<T>) -> Result<T> {
        for attempt in 1..=self.max_write_attempts {
            let txn = self.db.transaction();
            let value = body(&txn)?;
            match txn.commit() {
                Ok(()) => return Ok(value),
                Err(err) if matches!(err.kind(), ErrorKind::Busy | ErrorKind::TryAgain) => {
                    debug!(key, attempt, "optimistic transaction conflict, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(CoreError::WriteConflict {
            key: key.to_string(),
            attempts: self.max_write_attempts,
        })
    }

    fn put_json<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        let bytes = serde_json::to_vec(value)?;
        self.transact(key, |txn| {
            txn.put_cf(cf, key.as_bytes(), &bytes)?;
            Ok(())
        })
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        decode(self.db.get_cf(cf, key.as_bytes())?)
    }

    /// Decodes every value under `prefix` that passes `keep`, skipping values that
    /// fail to decode.
    fn scan<T, F>(&self, cf_name: &str, prefix: &[u8], keep: F) -> Result<RecordScan<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let cf = self.cf(cf_name)?;
        let mut scan = RecordScan::default();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            match serde_json::from_slice::<T>(&value) {
                Ok(record) if keep(&record) => scan.records.push(record),
                Ok(_) => {}
                Err(err) => {
                    scan.malformed += 1;
                    warn!(
                        column_family = cf_name,
                        key = %String::from_utf8_lossy(&key),
                        error = %err,
                        "skipping malformed record"
                    );
                }
            }
        }
        Ok(scan)
    }

    fn current_generation(&self, scope: &SettlementScope) -> Result<Option<Generation>> {
        let cf = self.cf(CF_RESULT_POINTERS)?;
        self.db
            .get_cf(cf, scope.to_string().as_bytes())?
            .map(|bytes| parse_generation(&bytes))
            .transpose()
    }

    fn published_rows<T: DeserializeOwned>(&self, scope: &SettlementScope) -> Result<Vec<T>> {
        let Some(generation) = self.current_generation(scope)? else {
            return Ok(Vec::new());
        };
        let prefix = generation_prefix(scope, &generation);
        Ok(self.scan(CF_RESULTS, prefix.as_bytes(), |_: &T| true)?.records)
    }
}

fn decode<T: DeserializeOwned>(bytes: Option<Vec<u8>>) -> Result<Option<T>> {
    bytes
        .map(|b| serde_json::from_slice(&b).map_err(CoreError::from))
        .transpose()
}

fn parse_generation(bytes: &[u8]) -> Result<Generation> {
    std::str::from_utf8(bytes)
        .map_err(CoreError::store)?
        .parse()
        .map_err(CoreError::store)
}

fn entitlement_key(user_id: &str, package_id: &str) -> String {
    format!("{user_id}{KEY_SEPARATOR}{package_id}")
}

fn retired_key(scope: &SettlementScope) -> String {
    format!("{scope}{KEY_SEPARATOR}retired")
}

fn generation_prefix(scope: &SettlementScope, generation: &Generation) -> String {
    format!("{scope}{KEY_SEPARATOR}{generation}{KEY_SEPARATOR}")
}

fn put_rows<T: Serialize>(txn: &Txn<'_>, cf: &ColumnFamily, prefix: &str, rows: &[T]) -> Result<()> {
    for (idx, row) in rows.iter().enumerate() {
        txn.put_cf(cf, format!("{prefix}{idx:010}"), serde_json::to_vec(row)?)?;
    }
    Ok(())
}

#[async_trait]
impl BalanceStore for RocksDBStore {
    async fn get(&self, user_id: &str) -> Result<Option<CoinBalance>> {
        self.get_json(CF_BALANCES, user_id)
    }

    async fn apply(&self, ops: &[BalanceOp], at: DateTime<Utc>) -> Result<Vec<CoinBalance>> {
        let cf = self.cf(CF_BALANCES)?;
        let label = ops
            .iter()
            .map(BalanceOp::user_id)
            .collect::<Vec<_>>()
            .join(",");
        self.transact(&label, |txn| {
            let plan = plan_ops(ops, at, |user_id| {
                decode(txn.get_for_update_cf(cf, user_id.as_bytes(), true)?)
            })?;
            for (user_id, balance) in &plan.touched {
                txn.put_cf(cf, user_id.as_bytes(), serde_json::to_vec(balance)?)?;
            }
            Ok(plan.results)
        })
    }

    async fn get_all(&self) -> Result<Vec<CoinBalance>> {
        Ok(self.scan(CF_BALANCES, &[], |_: &CoinBalance| true)?.records)
    }
}

#[async_trait]
impl EntitlementStore for RocksDBStore {
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Entitlement>> {
        let prefix = format!("{user_id}{KEY_SEPARATOR}");
        Ok(self
            .scan(CF_ENTITLEMENTS, prefix.as_bytes(), |_: &Entitlement| true)?
            .records)
    }

    async fn any_active(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let prefix = format!("{user_id}{KEY_SEPARATOR}");
        let scan = self.scan(CF_ENTITLEMENTS, prefix.as_bytes(), |e: &Entitlement| {
            e.is_active_at(now)
        })?;
        Ok(!scan.records.is_empty())
    }

    async fn upsert_with(
        &self,
        user_id: &str,
        package_id: &str,
        update: EntitlementUpdate<'_>,
    ) -> Result<Entitlement> {
        let cf = self.cf(CF_ENTITLEMENTS)?;
        let key = entitlement_key(user_id, package_id);
        self.transact(&key, |txn| {
            let current: Option<Entitlement> =
                decode(txn.get_for_update_cf(cf, key.as_bytes(), true)?)?;
            let next = update(current.as_ref());
            txn.put_cf(cf, key.as_bytes(), serde_json::to_vec(&next)?)?;
            Ok(next)
        })
    }
}

#[async_trait]
impl PackageCatalog for RocksDBStore {
    async fn get(&self, package_id: &str) -> Result<Option<PackageDefinition>> {
        self.get_json(CF_PACKAGES, package_id)
    }

    async fn put(&self, package: PackageDefinition) -> Result<()> {
        self.put_json(CF_PACKAGES, &package.package_id, &package)
    }
}

#[async_trait]
impl ReviewStore for RocksDBStore {
    async fn put(&self, review: ReviewRecord) -> Result<()> {
        self.put_json(CF_REVIEWS, &review.id, &review)
    }

    async fn get(&self, id: &str) -> Result<Option<ReviewRecord>> {
        self.get_json(CF_REVIEWS, id)
    }

    async fn approved_since(&self, since: DateTime<Utc>) -> Result<RecordScan<ReviewRecord>> {
        self.scan(CF_REVIEWS, &[], |r: &ReviewRecord| {
            r.status == ReviewStatus::Approved && r.created_at >= since
        })
    }
}

#[async_trait]
impl PaymentStore for RocksDBStore {
    async fn put(&self, payment: PaymentRecord) -> Result<()> {
        self.put_json(CF_PAYMENTS, &payment.id, &payment)
    }

    async fn get(&self, id: &str) -> Result<Option<PaymentRecord>> {
        self.get_json(CF_PAYMENTS, id)
    }

    async fn paid(&self) -> Result<RecordScan<PaymentRecord>> {
        self.scan(CF_PAYMENTS, &[], |p: &PaymentRecord| {
            p.status == PaymentStatus::Paid
        })
    }
}

#[async_trait]
impl ResultStore for RocksDBStore {
    async fn stage(&self, generation: &Generation, rows: &ResultSet) -> Result<()> {
        let cf = self.cf(CF_RESULTS)?;
        let scope = rows.scope();
        let prefix = generation_prefix(&scope, generation);
        self.transact(&prefix, |txn| match rows {
            ResultSet::Rankings(entries) => put_rows(txn, cf, &prefix, entries),
            ResultSet::Commissions { entries, .. } => put_rows(txn, cf, &prefix, entries),
            ResultSet::Bonuses { entries, .. } => put_rows(txn, cf, &prefix, entries),
        })
    }

    async fn publish(
        &self,
        scope: &SettlementScope,
        generation: &Generation,
    ) -> Result<Option<Generation>> {
        let cf = self.cf(CF_RESULT_POINTERS)?;
        let key = scope.to_string();
        let retired_key = retired_key(scope);
        self.transact(&key, |txn| {
            let previous = txn
                .get_for_update_cf(cf, key.as_bytes(), true)?
                .map(|bytes| parse_generation(&bytes))
                .transpose()?;
            txn.put_cf(cf, key.as_bytes(), generation.to_string())?;
            if let Some(previous) = previous {
                let mut retired: Vec<Generation> =
                    decode(txn.get_for_update_cf(cf, retired_key.as_bytes(), true)?)?
                        .unwrap_or_default();
                retired.push(previous);
                txn.put_cf(cf, retired_key.as_bytes(), serde_json::to_vec(&retired)?)?;
            }
            Ok(previous)
        })
    }

    async fn prune(&self, scope: &SettlementScope) -> Result<usize> {
        let pointers = self.cf(CF_RESULT_POINTERS)?;
        let results = self.cf(CF_RESULTS)?;
        let key = scope.to_string();
        let retired_key = retired_key(scope);

        self.transact(&retired_key, |txn| {
            let retired: Vec<Generation> =
                decode(txn.get_for_update_cf(pointers, retired_key.as_bytes(), true)?)?
                    .unwrap_or_default();
            if retired.is_empty() {
                return Ok(0);
            }
            let current = txn
                .get_for_update_cf(pointers, key.as_bytes(), true)?
                .map(|bytes| parse_generation(&bytes))
                .transpose()?;

            let mut removed = 0;
            for generation in retired.iter().filter(|g| Some(**g) != current) {
                // Rows of a staged generation never change, so a plain scan is enough.
                let prefix = generation_prefix(scope, generation);
                for item in self.db.iterator_cf(
                    results,
                    IteratorMode::From(prefix.as_bytes(), Direction::Forward),
                ) {
                    let (row_key, _) = item?;
                    if !row_key.starts_with(prefix.as_bytes()) {
                        break;
                    }
                    txn.delete_cf(results, &row_key)?;
                    removed += 1;
                }
            }
            txn.delete_cf(pointers, retired_key.as_bytes())?;
            Ok(removed)
        })
    }

    async fn rankings(&self) -> Result<Vec<RankEntry>> {
        self.published_rows(&SettlementScope::Rankings)
    }

    async fn commissions(&self, month: &Month) -> Result<Vec<CommissionEntry>> {
        self.published_rows(&SettlementScope::Commissions(*month))
    }

    async fn bonuses(&self, period: &str) -> Result<Vec<BonusEntry>> {
        self.published_rows(&SettlementScope::Bonuses(period.to_string()))
    }
}

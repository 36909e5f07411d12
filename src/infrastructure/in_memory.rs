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
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for coin balances.
///
/// A whole batch is planned and written under one write guard, so concurrent
/// debits on the same user serialize and can never overdraw.
#[derive(Default, Clone)]
pub struct InMemoryBalanceStore {
    balances: Arc<RwLock<HashMap<String, CoinBalance>>>,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn get(&self, user_id: &str) -> Result<Option<CoinBalance>> {
        let balances = self.balances.read().await;
        Ok(balances.get(user_id).cloned())
    }

    async fn apply(&self, ops: &[BalanceOp], at: DateTime<Utc>) -> Result<Vec<CoinBalance>> {
        let mut balances = self.balances.write().await;
        let plan = plan_ops(ops, at, |user_id| Ok(balances.get(user_id).cloned()))?;
        balances.extend(plan.touched);
        Ok(plan.results)
    }

    async fn get_all(&self) -> Result<Vec<CoinBalance>> {
        let balances = self.balances.read().await;
        Ok(balances.values().cloned().collect())
    }
}

/// Entitlements keyed by (user, package).
#[derive(Default, Clone)]
pub struct InMemoryEntitlementStore {
    entitlements: Arc<RwLock<HashMap<(String, String), Entitlement>>>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Entitlement>> {
        let entitlements = self.entitlements.read().await;
        let mut found: Vec<Entitlement> = entitlements
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.package_id.cmp(&b.package_id));
        Ok(found)
    }

    async fn any_active(&self, user_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let entitlements = self.entitlements.read().await;
        Ok(entitlements
            .values()
            .any(|e| e.user_id == user_id && e.is_active_at(now)))
    }

    async fn upsert_with(
        &self,
        user_id: &str,
        package_id: &str,
        update: EntitlementUpdate<'_>,
    ) -> Result<Entitlement> {
        let mut entitlements = self.entitlements.write().await;
        let key = (user_id.to_string(), package_id.to_string());
        let next = update(entitlements.get(&key));
        entitlements.insert(key, next.clone());
        Ok(next)
    }
}

#[derive(Default, Clone)]
pub struct InMemoryPackageCatalog {
    packages: Arc<RwLock<HashMap<String, PackageDefinition>>>,
}

impl InMemoryPackageCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PackageCatalog for InMemoryPackageCatalog {
    async fn get(&self, package_id: &str) -> Result<Option<PackageDefinition>> {
        let packages = self.packages.read().await;
        Ok(packages.get(package_id).cloned())
    }

    async fn put(&self, package: PackageDefinition) -> Result<()> {
        let mut packages = self.packages.write().await;
        packages.insert(package.package_id.clone(), package);
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryReviewStore {
    reviews: Arc<RwLock<HashMap<String, ReviewRecord>>>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReviewStore for InMemoryReviewStore {
    async fn put(&self, review: ReviewRecord) -> Result<()> {
        let mut reviews = self.reviews.write().await;
        reviews.insert(review.id.clone(), review);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ReviewRecord>> {
        let reviews = self.reviews.read().await;
        Ok(reviews.get(id).cloned())
    }

    async fn approved_since(&self, since: DateTime<Utc>) -> Result<RecordScan<ReviewRecord>> {
        let reviews = self.reviews.read().await;
        Ok(RecordScan::new(
            reviews
                .values()
                .filter(|r| r.status == ReviewStatus::Approved && r.created_at >= since)
                .cloned()
                .collect(),
        ))
    }
}

#[derive(Default, Clone)]
pub struct InMemoryPaymentStore {
    payments: Arc<RwLock<HashMap<String, PaymentRecord>>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn put(&self, payment: PaymentRecord) -> Result<()> {
        let mut payments = self.payments.write().await;
        payments.insert(payment.id.clone(), payment);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<PaymentRecord>> {
        let payments = self.payments.read().await;
        Ok(payments.get(id).cloned())
    }

    async fn paid(&self) -> Result<RecordScan<PaymentRecord>> {
        let payments = self.payments.read().await;
        Ok(RecordScan::new(
            payments
                .values()
                .filter(|p| p.status == PaymentStatus::Paid)
                .cloned()
                .collect(),
        ))
    }
}

#[derive(Default)]
struct ResultTables {
    generations: HashMap<(String, Generation), ResultSet>,
    current: HashMap<String, Generation>,
    retired: HashMap<String, Vec<Generation>>,
}

impl ResultTables {
    fn published(&self, scope: &SettlementScope) -> Option<&ResultSet> {
        let key = scope.to_string();
        let generation = self.current.get(&key)?;
        self.generations.get(&(key, *generation))
    }
}

/// Settlement result tables with generation staging.
#[derive(Default, Clone)]
pub struct InMemoryResultStore {
    tables: Arc<RwLock<ResultTables>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn stage(&self, generation: &Generation, rows: &ResultSet) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .generations
            .insert((rows.scope().to_string(), *generation), rows.clone());
        Ok(())
    }

    async fn publish(
        &self,
        scope: &SettlementScope,
        generation: &Generation,
    ) -> Result<Option<Generation>> {
        let mut tables = self.tables.write().await;
        let key = scope.to_string();
        let previous = tables.current.insert(key.clone(), *generation);
        if let Some(previous) = previous {
            tables.retired.entry(key).or_default().push(previous);
        }
        Ok(previous)
    }

    async fn prune(&self, scope: &SettlementScope) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let key = scope.to_string();
        let retired = tables.retired.remove(&key).unwrap_or_default();
        let current = tables.current.get(&key).copied();
        let mut removed = 0;
        for generation in retired.into_iter().filter(|g| Some(*g) != current) {
            if let Some(rows) = tables.generations.remove(&(key.clone(), generation)) {
                removed += rows.len();
            }
        }
        Ok(removed)
    }

    async fn rankings(&self) -> Result<Vec<RankEntry>> {
        let tables = self.tables.read().await;
        match tables.published(&SettlementScope::Rankings) {
            Some(ResultSet::Rankings(entries)) => Ok(entries.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn commissions(&self, month: &Month) -> Result<Vec<CommissionEntry>> {
        let tables = self.tables.read().await;
        match tables.published(&SettlementScope::Commissions(*month)) {
            Some(ResultSet::Commissions { entries, .. }) => Ok(entries.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn bonuses(&self, period: &str) -> Result<Vec<BonusEntry>> {
        let tables = self.tables.read().await;
        match tables.published(&SettlementScope::Bonuses(period.to_string())) {
            Some(ResultSet::Bonuses { entries, .. }) => Ok(entries.clone()),
            _ => Ok(Vec::new()),
        }
    }
}

//! Store adapters implementing the domain ports.

pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;

use crate::domain::ports::{
    BalanceStore, BalanceStoreRef, EntitlementStore, EntitlementStoreRef, PackageCatalog,
    PackageCatalogRef, PaymentStore, PaymentStoreRef, ResultStore, ResultStoreRef, ReviewStore,
    ReviewStoreRef,
};
use in_memory::{
    InMemoryBalanceStore, InMemoryEntitlementStore, InMemoryPackageCatalog, InMemoryPaymentStore,
    InMemoryResultStore, InMemoryReviewStore,
};
use std::sync::Arc;

/// One handle per port, constructed once and injected into the services.
#[derive(Clone)]
pub struct StoreHandles {
    pub balances: BalanceStoreRef,
    pub entitlements: EntitlementStoreRef,
    pub packages: PackageCatalogRef,
    pub reviews: ReviewStoreRef,
    pub payments: PaymentStoreRef,
    pub results: ResultStoreRef,
}

impl StoreHandles {
    pub fn in_memory() -> Self {
        Self {
            balances: Arc::new(InMemoryBalanceStore::new()),
            entitlements: Arc::new(InMemoryEntitlementStore::new()),
            packages: Arc::new(InMemoryPackageCatalog::new()),
            reviews: Arc::new(InMemoryReviewStore::new()),
            payments: Arc::new(InMemoryPaymentStore::new()),
            results: Arc::new(InMemoryResultStore::new()),
        }
    }

    /// Uses a single store that implements every port for all of them.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: BalanceStore
            + EntitlementStore
            + PackageCatalog
            + ReviewStore
            + PaymentStore
            + ResultStore
            + 'static,
    {
        Self {
            balances: store.clone(),
            entitlements: store.clone(),
            packages: store.clone(),
            reviews: store.clone(),
            payments: store.clone(),
            results: store,
        }
    }
}

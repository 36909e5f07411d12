//! Application layer orchestrating the domain through its ports.
//!
//! Each service receives the store handles it needs at construction and holds no
//! state of its own beyond them, so services are cheap to clone into tasks.

pub mod ledger;
pub mod records;
pub mod settlement;
pub mod subscription;

pub use ledger::{Ledger, LedgerBatch, Transfer};
pub use records::RecordBook;
pub use settlement::{SettlementJob, SettlementReport, SettlementRequest, SettlementRun};
pub use subscription::SubscriptionManager;

use crate::config::Settings;
use crate::domain::ports::TimeSourceRef;
use crate::error::{CoreError, Result};
use crate::infrastructure::StoreHandles;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Runs `fut` until it finishes or `token` is cancelled, whichever comes first.
///
/// Store calls are all-or-nothing, so abandoning `fut` at an await point never leaves
/// a half-applied store write behind.
pub async fn cancellable<F, T>(token: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CoreError::Cancelled),
        result = fut => result,
    }
}

/// Every service wired onto one set of store handles.
#[derive(Clone)]
pub struct Services {
    pub ledger: Ledger,
    pub subscriptions: SubscriptionManager,
    pub settlement: SettlementJob,
    pub records: RecordBook,
}

impl Services {
    pub fn new(stores: &StoreHandles, clock: TimeSourceRef, settings: Settings) -> Self {
        let ledger = Ledger::new(stores.balances.clone(), clock.clone());
        Self {
            subscriptions: SubscriptionManager::new(
                ledger.clone(),
                stores.packages.clone(),
                stores.entitlements.clone(),
                clock.clone(),
            ),
            settlement: SettlementJob::new(
                stores.reviews.clone(),
                stores.payments.clone(),
                stores.results.clone(),
                clock.clone(),
                settings,
            ),
            records: RecordBook::new(
                stores.packages.clone(),
                stores.reviews.clone(),
                stores.payments.clone(),
                clock,
            ),
            ledger,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::balance::Coins;
    use crate::domain::ports::SystemTimeSource;
    use std::sync::Arc;
    use std::time::Duration;

    fn services() -> Services {
        Services::new(
            &StoreHandles::in_memory(),
            Arc::new(SystemTimeSource),
            Settings::default(),
        )
    }

    #[tokio::test]
    async fn test_cancellable_passes_result_through() {
        let token = CancellationToken::new();
        let value = cancellable(&token, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let services = services();
        let token = CancellationToken::new();
        token.cancel();

        let result = cancellable(&token, services.ledger.deposit("alice", 10)).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
        assert_eq!(services.ledger.balance("alice").await.unwrap(), Coins(0));
    }

    #[tokio::test]
    async fn test_cancel_while_pending() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let result: Result<()> = cancellable(&token, std::future::pending()).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn test_services_share_stores() {
        let services = services();
        services.ledger.deposit("alice", 100).await.unwrap();
        services
            .records
            .create_package("basic", "Basic", 40, 10)
            .await
            .unwrap();

        services
            .subscriptions
            .buy_package("alice", "basic")
            .await
            .unwrap();
        assert_eq!(services.ledger.balance("alice").await.unwrap(), Coins(60));
        assert!(services.subscriptions.check_active("alice").await.unwrap());
    }
}

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use coin_settlement::application::Services;
use coin_settlement::config::Settings;
use coin_settlement::domain::ports::ManualTimeSource;
use coin_settlement::infrastructure::StoreHandles;
use std::sync::Arc;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap()
}

/// In-memory services on a clock that only moves when the test says so.
pub fn services() -> (Services, Arc<ManualTimeSource>) {
    let clock = Arc::new(ManualTimeSource::new(start()));
    let services = Services::new(&StoreHandles::in_memory(), clock.clone(), Settings::default());
    (services, clock)
}

/// Deposits `amount` for each of `users`.
pub async fn fund(services: &Services, users: &[&str], amount: i64) {
    for user in users {
        services.ledger.deposit(user, amount).await.unwrap();
    }
}

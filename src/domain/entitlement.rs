use crate::domain::balance::Coins;
use crate::error::{CoreError, Result};
use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};

/// A purchasable package: how many coins it costs and how long it lasts.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct PackageDefinition {
    pub package_id: String,
    pub name: String,
    pub coin_cost: Coins,
    pub duration_days: u32,
    pub created_at: DateTime<Utc>,
}

impl PackageDefinition {
    pub fn new(
        package_id: impl Into<String>,
        name: impl Into<String>,
        coin_cost: u64,
        duration_days: i64,
        at: DateTime<Utc>,
    ) -> Result<Self> {
        let package_id = package_id.into();
        let duration_days = u32::try_from(duration_days)
            .ok()
            .filter(|days| *days > 0)
            .ok_or_else(|| {
                CoreError::InvalidPackage(format!(
                    "{package_id}: duration must be a positive number of days, got {duration_days}"
                ))
            })?;
        Ok(Self {
            package_id,
            name: name.into(),
            coin_cost: Coins(coin_cost),
            duration_days,
            created_at: at,
        })
    }

    /// `from` pushed forward by this package's duration, saturating at the latest
    /// representable instant.
    pub fn extend(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from.checked_add_days(Days::new(u64::from(self.duration_days)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A user's time-bounded right to a package (one per user and package).
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Entitlement {
    pub user_id: String,
    pub package_id: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entitlement {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// The entitlement after one more purchase of `package` at `now`.
    ///
    /// A still-running entitlement stacks the new duration onto its expiry; a lapsed or
    /// missing one restarts from `now`.
    pub fn renewed(
        existing: Option<&Entitlement>,
        user_id: &str,
        package: &PackageDefinition,
        now: DateTime<Utc>,
    ) -> Entitlement {
        match existing {
            Some(current) => {
                let base = if current.is_active_at(now) {
                    current.expires_at
                } else {
                    now
                };
                Entitlement {
                    started_at: now,
                    expires_at: package.extend(base),
                    updated_at: now,
                    ..current.clone()
                }
            }
            None => Entitlement {
                user_id: user_id.to_string(),
                package_id: package.package_id.clone(),
                started_at: now,
                expires_at: package.extend(now),
                created_at: now,
                updated_at: now,
            },
        }
    }
}

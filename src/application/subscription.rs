use crate::application::ledger::Ledger;
use crate::domain::balance::Amount;
use crate::domain::entitlement::Entitlement;
use crate::domain::ports::{EntitlementStoreRef, PackageCatalogRef, TimeSourceRef};
use crate::error::{CoreError, Result};
use tracing::{debug, error, info};

/// Turns coin deductions into time-bounded package entitlements.
#[derive(Clone)]
pub struct SubscriptionManager {
    ledger: Ledger,
    catalog: PackageCatalogRef,
    entitlements: EntitlementStoreRef,
    clock: TimeSourceRef,
}

impl SubscriptionManager {
    pub fn new(
        ledger: Ledger,
        catalog: PackageCatalogRef,
        entitlements: EntitlementStoreRef,
        clock: TimeSourceRef,
    ) -> Self {
        Self {
            ledger,
            catalog,
            entitlements,
            clock,
        }
    }

    /// Charges the package price and extends (or restarts) the user's entitlement.
    ///
    /// An entitlement that is still running gets the package duration stacked onto its
    /// expiry; a lapsed or missing one starts over from now. If the entitlement write
    /// fails after the coins were deducted, the error is logged and returned; the coins
    /// stay spent.
    pub async fn buy_package(&self, user_id: &str, package_id: &str) -> Result<Entitlement> {
        let package = self
            .catalog
            .get(package_id)
            .await?
            .ok_or_else(|| CoreError::PackageNotFound {
                package_id: package_id.to_string(),
            })?;

        // Free packages skip the ledger.
        let charged = match Amount::try_from(package.coin_cost) {
            Ok(cost) => {
                self.ledger.debit(user_id, cost).await?;
                true
            }
            Err(_) => false,
        };

        let entitlements = self.entitlements.clone();
        let clock = self.clock.clone();
        let user = user_id.to_string();
        let upsert = tokio::spawn(async move {
            let now = clock.now();
            entitlements
                .upsert_with(&user, &package.package_id, &|existing| {
                    Entitlement::renewed(existing, &user, &package, now)
                })
                .await
        });

        let entitlement = upsert
            .await
            .unwrap_or_else(|join_err| Err(CoreError::store(join_err)))
            .inspect_err(|err| {
                if charged {
                    error!(
                        user_id,
                        package_id,
                        error = %err,
                        "coins deducted but entitlement was not written"
                    );
                }
            })?;

        info!(
            user_id,
            package_id,
            expires_at = %entitlement.expires_at,
            "package purchased"
        );
        Ok(entitlement)
    }

    /// Whether the user holds any entitlement that has not yet expired.
    pub async fn check_active(&self, user_id: &str) -> Result<bool> {
        let active = self
            .entitlements
            .any_active(user_id, self.clock.now())
            .await?;
        debug!(user_id, active, "entitlement check");
        Ok(active)
    }

    pub async fn entitlements(&self, user_id: &str) -> Result<Vec<Entitlement>> {
        let mut all = self.entitlements.list_for_user(user_id).await?;
        all.sort_by(|a, b| a.package_id.cmp(&b.package_id));
        Ok(all)
    }
}

use crate::domain::entitlement::PackageDefinition;
use crate::domain::ports::{PackageCatalogRef, PaymentStoreRef, ReviewStoreRef, TimeSourceRef};
use crate::domain::records::{PaymentRecord, ReviewRecord, ReviewStatus};
use crate::error::{CoreError, Result};
use tracing::info;

/// Writes the source records the settlement job aggregates, plus the package catalog.
#[derive(Clone)]
pub struct RecordBook {
    catalog: PackageCatalogRef,
    reviews: ReviewStoreRef,
    payments: PaymentStoreRef,
    clock: TimeSourceRef,
}

impl RecordBook {
    pub fn new(
        catalog: PackageCatalogRef,
        reviews: ReviewStoreRef,
        payments: PaymentStoreRef,
        clock: TimeSourceRef,
    ) -> Self {
        Self {
            catalog,
            reviews,
            payments,
            clock,
        }
    }

    /// Adds or replaces a package definition.
    pub async fn create_package(
        &self,
        package_id: &str,
        name: &str,
        coin_cost: u64,
        duration_days: i64,
    ) -> Result<PackageDefinition> {
        let package =
            PackageDefinition::new(package_id, name, coin_cost, duration_days, self.clock.now())?;
        self.catalog.put(package.clone()).await?;
        info!(package_id, coin_cost, duration_days, "package saved");
        Ok(package)
    }

    pub async fn submit_review(
        &self,
        author_id: &str,
        subject_id: &str,
        rating: i64,
        content: &str,
    ) -> Result<ReviewRecord> {
        let review = ReviewRecord::submit(author_id, subject_id, rating, content, self.clock.now())?;
        self.reviews.put(review.clone()).await?;
        info!(review_id = %review.id, subject_id, rating, "review submitted");
        Ok(review)
    }

    pub async fn approve_review(&self, id: &str) -> Result<ReviewRecord> {
        self.decide_review(id, ReviewStatus::Approved).await
    }

    pub async fn reject_review(&self, id: &str) -> Result<ReviewRecord> {
        self.decide_review(id, ReviewStatus::Rejected).await
    }

    pub async fn record_payment(
        &self,
        user_id: &str,
        amount: i64,
        provider: &str,
        provider_ref_id: &str,
    ) -> Result<PaymentRecord> {
        let payment =
            PaymentRecord::pending(user_id, amount, provider, provider_ref_id, self.clock.now())?;
        self.payments.put(payment.clone()).await?;
        info!(payment_id = %payment.id, user_id, amount, provider, "payment recorded");
        Ok(payment)
    }

    /// Applies the provider's verdict to a pending payment.
    pub async fn settle_payment(&self, id: &str, paid: bool) -> Result<PaymentRecord> {
        let mut payment = self
            .payments
            .get(id)
            .await?
            .ok_or_else(|| CoreError::RecordNotFound {
                kind: "payment",
                id: id.to_string(),
            })?;
        payment.settle(paid, self.clock.now())?;
        self.payments.put(payment.clone()).await?;
        info!(payment_id = id, status = %payment.status, "payment settled");
        Ok(payment)
    }

    /// Stores an already-built review as is, e.g. one read from an export.
    pub async fn import_review(&self, review: ReviewRecord) -> Result<()> {
        self.reviews.put(review).await
    }

    pub async fn import_payment(&self, payment: PaymentRecord) -> Result<()> {
        self.payments.put(payment).await
    }

    async fn decide_review(&self, id: &str, to: ReviewStatus) -> Result<ReviewRecord> {
        let mut review = self
            .reviews
            .get(id)
            .await?
            .ok_or_else(|| CoreError::RecordNotFound {
                kind: "review",
                id: id.to_string(),
            })?;
        review.decide(to, self.clock.now())?;
        self.reviews.put(review.clone()).await?;
        info!(review_id = id, status = %to, "review decided");
        Ok(review)
    }
}

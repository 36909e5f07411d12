use crate::config::Settings;
use crate::domain::ports::{PaymentStoreRef, ResultStoreRef, ReviewStoreRef, TimeSourceRef};
use crate::domain::settlement::{
    BonusEntry, CommissionEntry, Generation, Month, RankEntry, ResultSet, SettlementScope,
    commission_by_subject, rank_subjects, select_bonus,
};
use crate::error::{CoreError, ReplaceStage, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

/// What one settlement pass published.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementReport {
    pub scope: SettlementScope,
    pub generation: Generation,
    /// Rows in the published generation.
    pub rows: usize,
    /// Source records skipped because they could not be decoded.
    pub skipped: usize,
    /// The generation this pass replaced, if the scope had one.
    pub replaced: Option<Generation>,
    /// Rows deleted from retired generations of the scope.
    pub pruned: usize,
}

/// Parameters of a full settlement run.
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementRequest {
    /// Reviews created at or after this instant are ranked. Its month is the commission month.
    pub since: DateTime<Utc>,
    pub percent: f64,
    pub period: String,
    pub top_n: Option<usize>,
    pub bonus_amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementRun {
    pub rankings: SettlementReport,
    pub commissions: SettlementReport,
    pub bonuses: SettlementReport,
}

/// Recomputes rankings, commissions and bonuses from raw review and payment history.
///
/// Every pass replaces its whole scope: rows are staged under a fresh
/// [`Generation`], published by swapping the scope's pointer, then the generations
/// retired by publishing are pruned. Readers see either the old set or the new one.
#[derive(Clone)]
pub struct SettlementJob {
    reviews: ReviewStoreRef,
    payments: PaymentStoreRef,
    results: ResultStoreRef,
    clock: TimeSourceRef,
    settings: Settings,
}

impl SettlementJob {
    pub fn new(
        reviews: ReviewStoreRef,
        payments: PaymentStoreRef,
        results: ResultStoreRef,
        clock: TimeSourceRef,
        settings: Settings,
    ) -> Self {
        Self {
            reviews,
            payments,
            results,
            clock,
            settings,
        }
    }

    /// Ranks subjects by the approved reviews created at or after `since`.
    pub async fn calculate_rankings(&self, since: DateTime<Utc>) -> Result<SettlementReport> {
        let scope = SettlementScope::Rankings;
        let scan = read_phase(&scope, self.reviews.approved_since(since).await)?;
        log_skipped(&scope, scan.malformed);

        let now = self.clock.now();
        let rows = ResultSet::Rankings(rank_subjects(&scan.records, now));
        self.replace(rows, scan.malformed).await
    }

    /// Commission per subject on the paid payments created in `month` (`YYYY-MM`, UTC).
    pub async fn calculate_commission(&self, month: &str, percent: f64) -> Result<SettlementReport> {
        let month: Month = month.parse()?;
        self.commission_for(month, percent).await
    }

    /// Flat `bonus_amount` for the `top_n` best-ranked subjects whose rank was
    /// refreshed within the configured lookback window.
    pub async fn calculate_bonus(
        &self,
        period: &str,
        top_n: usize,
        bonus_amount: f64,
    ) -> Result<SettlementReport> {
        if !bonus_amount.is_finite() || bonus_amount < 0.0 {
            return Err(CoreError::InvalidAmount(format!(
                "bonus amount must be a non-negative number, got {bonus_amount}"
            )));
        }
        let scope = SettlementScope::Bonuses(period.to_string());
        let ranks = read_phase(&scope, self.results.rankings().await)?;

        let now = self.clock.now();
        let cutoff = now - Duration::days(i64::from(self.settings.bonus_lookback_days));
        let rows = ResultSet::Bonuses {
            period: period.to_string(),
            entries: select_bonus(ranks, cutoff, top_n, bonus_amount, period, now),
        };
        self.replace(rows, 0).await
    }

    /// Rankings, then commission for the month of `since`, then bonuses.
    ///
    /// Stops at the first failing pass; passes that already published stay published.
    pub async fn run_all(&self, request: &SettlementRequest) -> Result<SettlementRun> {
        let rankings = self.calculate_rankings(request.since).await?;
        let commissions = self
            .commission_for(Month::of(request.since), request.percent)
            .await?;
        let bonuses = self
            .calculate_bonus(
                &request.period,
                request.top_n.unwrap_or(self.settings.default_top_n),
                request
                    .bonus_amount
                    .unwrap_or(self.settings.default_bonus_amount),
            )
            .await?;
        Ok(SettlementRun {
            rankings,
            commissions,
            bonuses,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn rankings(&self) -> Result<Vec<RankEntry>> {
        self.results.rankings().await
    }

    pub async fn commissions(&self, month: &str) -> Result<Vec<CommissionEntry>> {
        let month: Month = month.parse()?;
        self.results.commissions(&month).await
    }

    pub async fn bonuses(&self, period: &str) -> Result<Vec<BonusEntry>> {
        self.results.bonuses(period).await
    }

    async fn commission_for(&self, month: Month, percent: f64) -> Result<SettlementReport> {
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(CoreError::InvalidPercent(percent));
        }
        let scope = SettlementScope::Commissions(month);
        let scan = read_phase(&scope, self.payments.paid().await)?;
        log_skipped(&scope, scan.malformed);

        let now = self.clock.now();
        let rows = ResultSet::Commissions {
            month,
            entries: commission_by_subject(&scan.records, month, percent, now),
        };
        self.replace(rows, scan.malformed).await
    }

    async fn replace(&self, rows: ResultSet, skipped: usize) -> Result<SettlementReport> {
        let scope = rows.scope();
        let generation = Generation::new();
        let interrupted = |stage: ReplaceStage, source: CoreError| {
            error!(
                scope = %scope,
                generation = %generation,
                phase = "replace",
                stage = %stage,
                error = %source,
                "settlement replace interrupted"
            );
            CoreError::PartialReplace {
                scope: scope.to_string(),
                stage,
                source: Box::new(source),
            }
        };

        self.results
            .stage(&generation, &rows)
            .await
            .map_err(|e| interrupted(ReplaceStage::Stage, e))?;
        let replaced = self
            .results
            .publish(&scope, &generation)
            .await
            .map_err(|e| interrupted(ReplaceStage::Publish, e))?;
        let pruned = self
            .results
            .prune(&scope)
            .await
            .map_err(|e| interrupted(ReplaceStage::Prune, e))?;

        info!(
            scope = %scope,
            generation = %generation,
            rows = rows.len(),
            pruned,
            "settlement published"
        );
        Ok(SettlementReport {
            scope,
            generation,
            rows: rows.len(),
            skipped,
            replaced,
            pruned,
        })
    }
}

fn read_phase<T>(scope: &SettlementScope, result: Result<T>) -> Result<T> {
    result.inspect_err(|err| {
        warn!(scope = %scope, phase = "read", error = %err, "settlement read failed");
    })
}

fn log_skipped(scope: &SettlementScope, malformed: usize) {
    if malformed > 0 {
        warn!(scope = %scope, skipped = malformed, "skipped malformed source records");
    } else {
        debug!(scope = %scope, "all source records decoded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ManualTimeSource, PaymentStore, ResultStore, ReviewStore};
    use crate::domain::records::{PaymentRecord, PaymentStatus, RecordScan, ReviewRecord, ReviewStatus};
    use crate::infrastructure::in_memory::{
        InMemoryPaymentStore, InMemoryResultStore, InMemoryReviewStore,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn june(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, day, 12, 0, 0).unwrap()
    }

    struct Fixture {
        clock: Arc<ManualTimeSource>,
        reviews: Arc<InMemoryReviewStore>,
        payments: Arc<InMemoryPaymentStore>,
        job: SettlementJob,
    }

    fn fixture_with(results: ResultStoreRef) -> Fixture {
        let clock = Arc::new(ManualTimeSource::new(june(30)));
        let reviews = Arc::new(InMemoryReviewStore::new());
        let payments = Arc::new(InMemoryPaymentStore::new());
        let job = SettlementJob::new(
            reviews.clone(),
            payments.clone(),
            results,
            clock.clone(),
            Settings::default(),
        );
        Fixture {
            clock,
            reviews,
            payments,
            job,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(InMemoryResultStore::new()))
    }

    async fn approved(f: &Fixture, subject: &str, rating: i64) {
        let mut review = ReviewRecord::submit("author", subject, rating, "", june(1)).unwrap();
        review.status = ReviewStatus::Approved;
        f.reviews.put(review).await.unwrap();
    }

    async fn payment(f: &Fixture, subject: &str, amount: i64, status: PaymentStatus, at: DateTime<Utc>) {
        let mut p = PaymentRecord::pending("payer", amount, "omise", subject, at).unwrap();
        p.status = status;
        f.payments.put(p).await.unwrap();
    }

    async fn seed_reviews(f: &Fixture) {
        for rating in [5, 4, 5] {
            approved(f, "s1", rating).await;
        }
        for rating in [3, 3] {
            approved(f, "s2", rating).await;
        }
        let pending = ReviewRecord::submit("author", "s3", 5, "", june(1)).unwrap();
        f.reviews.put(pending).await.unwrap();
    }

    #[tokio::test]
    async fn test_rankings_scenario() {
        let f = fixture();
        seed_reviews(&f).await;

        let report = f.job.calculate_rankings(june(1)).await.unwrap();
        assert_eq!(report.rows, 2);
        assert_eq!(report.replaced, None);

        let ranks = f.job.rankings().await.unwrap();
        assert_eq!(ranks[0].subject_id, "s1");
        assert_eq!((ranks[0].rating_sum, ranks[0].review_count, ranks[0].rank_position), (14, 3, 1));
        assert_eq!(ranks[1].subject_id, "s2");
        assert_eq!((ranks[1].rating_sum, ranks[1].review_count, ranks[1].rank_position), (6, 2, 2));
    }

    #[tokio::test]
    async fn test_rankings_are_idempotent() {
        let f = fixture();
        seed_reviews(&f).await;

        let first_report = f.job.calculate_rankings(june(1)).await.unwrap();
        let first = f.job.rankings().await.unwrap();
        let second_report = f.job.calculate_rankings(june(1)).await.unwrap();
        let second = f.job.rankings().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second_report.replaced, Some(first_report.generation));
    }

    #[tokio::test]
    async fn test_rankings_respect_since() {
        let f = fixture();
        seed_reviews(&f).await;

        f.job.calculate_rankings(june(2)).await.unwrap();
        assert!(f.job.rankings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commission_month_filter_and_math() {
        let f = fixture();
        payment(&f, "s1", 1000, PaymentStatus::Paid, june(3)).await;
        payment(&f, "s1", 500, PaymentStatus::Paid, june(20)).await;
        payment(&f, "s1", 9999, PaymentStatus::Failed, june(20)).await;
        payment(&f, "s2", 200, PaymentStatus::Paid, june(5)).await;
        let may = Utc.with_ymd_and_hms(2025, 5, 31, 23, 59, 59).unwrap();
        payment(&f, "s2", 800, PaymentStatus::Paid, may).await;

        let report = f.job.calculate_commission("2025-06", 10.0).await.unwrap();
        assert_eq!(report.rows, 2);

        let rows = f.job.commissions("2025-06").await.unwrap();
        let s1 = rows.iter().find(|c| c.subject_id == "s1").unwrap();
        let s2 = rows.iter().find(|c| c.subject_id == "s2").unwrap();
        assert!((s1.amount - 150.0).abs() < f64::EPSILON);
        assert!((s2.amount - 20.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_commission_replaces_only_its_month() {
        let f = fixture();
        let may = Utc.with_ymd_and_hms(2025, 5, 10, 0, 0, 0).unwrap();
        payment(&f, "s1", 100, PaymentStatus::Paid, may).await;
        payment(&f, "s1", 100, PaymentStatus::Paid, june(10)).await;

        f.job.calculate_commission("2025-05", 50.0).await.unwrap();
        f.job.calculate_commission("2025-06", 10.0).await.unwrap();
        f.job.calculate_commission("2025-06", 20.0).await.unwrap();

        let may_rows = f.job.commissions("2025-05").await.unwrap();
        let june_rows = f.job.commissions("2025-06").await.unwrap();
        assert_eq!(may_rows.len(), 1);
        assert!((may_rows[0].amount - 50.0).abs() < f64::EPSILON);
        assert_eq!(june_rows.len(), 1);
        assert!((june_rows[0].amount - 20.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_commission_rejects_bad_input() {
        let f = fixture();
        assert!(matches!(
            f.job.calculate_commission("2025-13", 10.0).await,
            Err(CoreError::InvalidMonth(_))
        ));
        for percent in [-1.0, 100.5, f64::NAN] {
            assert!(matches!(
                f.job.calculate_commission("2025-06", percent).await,
                Err(CoreError::InvalidPercent(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_bonus_top_one() {
        let f = fixture();
        seed_reviews(&f).await;
        f.job.calculate_rankings(june(1)).await.unwrap();

        let report = f.job.calculate_bonus("2025-Q2", 1, 1000.0).await.unwrap();
        assert_eq!(report.rows, 1);

        let bonuses = f.job.bonuses("2025-Q2").await.unwrap();
        assert_eq!(bonuses.len(), 1);
        assert_eq!(bonuses[0].subject_id, "s1");
        assert!((bonuses[0].amount - 1000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_bonus_top_n_larger_than_ranking() {
        let f = fixture();
        seed_reviews(&f).await;
        f.job.calculate_rankings(june(1)).await.unwrap();

        let report = f.job.calculate_bonus("2025-Q2", 10, 50.0).await.unwrap();
        assert_eq!(report.rows, 2);
    }

    #[tokio::test]
    async fn test_bonus_lookback_excludes_stale_ranks() {
        let f = fixture();
        seed_reviews(&f).await;
        f.job.calculate_rankings(june(1)).await.unwrap();

        f.clock.advance(Duration::days(91));
        let report = f.job.calculate_bonus("2025-Q3", 3, 100.0).await.unwrap();
        assert_eq!(report.rows, 0);
        assert!(f.job.bonuses("2025-Q3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bonus_rejects_negative_amount() {
        let f = fixture();
        assert!(matches!(
            f.job.calculate_bonus("p", 1, -5.0).await,
            Err(CoreError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn test_run_all() {
        let f = fixture();
        seed_reviews(&f).await;
        payment(&f, "s1", 1000, PaymentStatus::Paid, june(3)).await;

        let run = f
            .job
            .run_all(&SettlementRequest {
                since: june(1),
                percent: 5.0,
                period: "2025-06".to_string(),
                top_n: None,
                bonus_amount: Some(10.0),
            })
            .await
            .unwrap();

        assert_eq!(run.rankings.rows, 2);
        assert_eq!(
            run.commissions.scope,
            SettlementScope::Commissions("2025-06".parse().unwrap())
        );
        assert_eq!(run.commissions.rows, 1);
        assert_eq!(run.bonuses.rows, 2);
    }

    /// Delegates to an in-memory store, failing whichever replace step is switched on.
    #[derive(Default)]
    struct FlakyResultStore {
        inner: InMemoryResultStore,
        fail_stage: AtomicBool,
        fail_publish: AtomicBool,
        fail_prune: AtomicBool,
    }

    #[async_trait]
    impl ResultStore for FlakyResultStore {
        async fn stage(&self, generation: &Generation, rows: &ResultSet) -> Result<()> {
            if self.fail_stage.load(Ordering::SeqCst) {
                return Err(CoreError::store("disk full"));
            }
            self.inner.stage(generation, rows).await
        }

        async fn publish(
            &self,
            scope: &SettlementScope,
            generation: &Generation,
        ) -> Result<Option<Generation>> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(CoreError::store("pointer write lost"));
            }
            self.inner.publish(scope, generation).await
        }

        async fn prune(&self, scope: &SettlementScope) -> Result<usize> {
            if self.fail_prune.load(Ordering::SeqCst) {
                return Err(CoreError::store("delete timed out"));
            }
            self.inner.prune(scope).await
        }

        async fn rankings(&self) -> Result<Vec<RankEntry>> {
            self.inner.rankings().await
        }

        async fn commissions(&self, month: &Month) -> Result<Vec<CommissionEntry>> {
            self.inner.commissions(month).await
        }

        async fn bonuses(&self, period: &str) -> Result<Vec<BonusEntry>> {
            self.inner.bonuses(period).await
        }
    }

    fn interrupted_at(err: &CoreError) -> Option<ReplaceStage> {
        match err {
            CoreError::PartialReplace { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_failed_stage_keeps_previous_results() {
        let results = Arc::new(FlakyResultStore::default());
        let f = fixture_with(results.clone());
        seed_reviews(&f).await;
        f.job.calculate_rankings(june(1)).await.unwrap();
        let before = f.job.rankings().await.unwrap();

        approved(&f, "s2", 5).await;
        approved(&f, "s2", 5).await;
        results.fail_stage.store(true, Ordering::SeqCst);

        let err = f.job.calculate_rankings(june(1)).await.unwrap_err();
        assert_eq!(interrupted_at(&err), Some(ReplaceStage::Stage));
        assert_eq!(f.job.rankings().await.unwrap(), before);

        results.fail_stage.store(false, Ordering::SeqCst);
        f.job.calculate_rankings(june(1)).await.unwrap();
        let after = f.job.rankings().await.unwrap();
        assert_eq!(after[0].subject_id, "s2");
        assert_eq!(after[0].rating_sum, 16);
    }

    #[tokio::test]
    async fn test_failed_publish_keeps_previous_results() {
        let results = Arc::new(FlakyResultStore::default());
        let f = fixture_with(results.clone());
        seed_reviews(&f).await;
        let first = f.job.calculate_rankings(june(1)).await.unwrap();
        let before = f.job.rankings().await.unwrap();

        approved(&f, "s3", 5).await;
        results.fail_publish.store(true, Ordering::SeqCst);
        let err = f.job.calculate_rankings(june(1)).await.unwrap_err();
        assert_eq!(interrupted_at(&err), Some(ReplaceStage::Publish));
        assert_eq!(f.job.rankings().await.unwrap(), before);

        results.fail_publish.store(false, Ordering::SeqCst);
        let retry = f.job.calculate_rankings(june(1)).await.unwrap();
        assert_eq!(retry.replaced, Some(first.generation));
        assert_eq!(f.job.rankings().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_prune_is_cleaned_up_by_next_run() {
        let results = Arc::new(FlakyResultStore::default());
        let f = fixture_with(results.clone());
        seed_reviews(&f).await;
        f.job.calculate_rankings(june(1)).await.unwrap();

        approved(&f, "s3", 5).await;
        results.fail_prune.store(true, Ordering::SeqCst);
        let err = f.job.calculate_rankings(june(1)).await.unwrap_err();
        assert_eq!(interrupted_at(&err), Some(ReplaceStage::Prune));
        // The new set is already published
        assert_eq!(f.job.rankings().await.unwrap().len(), 3);

        results.fail_prune.store(false, Ordering::SeqCst);
        let next = f.job.calculate_rankings(june(1)).await.unwrap();
        // Two rows from the first run plus three from the unpruned second run
        assert_eq!(next.pruned, 5);
        assert_eq!(f.job.rankings().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_overlapping_runs_leave_latest_publish_visible() {
        let results = Arc::new(InMemoryResultStore::new());
        let f = fixture_with(results.clone());
        seed_reviews(&f).await;
        f.job.calculate_rankings(june(1)).await.unwrap();

        // Stage two runs, publish both, then let the older run prune last
        let scope = SettlementScope::Rankings;
        let (a, b) = (Generation::new(), Generation::new());
        let older = ResultSet::Rankings(f.job.rankings().await.unwrap());
        let mut review = ReviewRecord::submit("x", "s9", 1, "", june(2)).unwrap();
        review.status = ReviewStatus::Approved;
        let newer = ResultSet::Rankings(rank_subjects(&[review], june(2)));
        results.stage(&a, &older).await.unwrap();
        results.stage(&b, &newer).await.unwrap();
        results.publish(&scope, &a).await.unwrap();
        results.publish(&scope, &b).await.unwrap();
        results.prune(&scope).await.unwrap();
        results.prune(&scope).await.unwrap();

        let visible = f.job.rankings().await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].subject_id, "s9");
    }

    struct OfflineReviewStore;

    #[async_trait]
    impl ReviewStore for OfflineReviewStore {
        async fn put(&self, _review: ReviewRecord) -> Result<()> {
            Err(CoreError::store("offline"))
        }

        async fn get(&self, _id: &str) -> Result<Option<ReviewRecord>> {
            Err(CoreError::store("offline"))
        }

        async fn approved_since(&self, _since: DateTime<Utc>) -> Result<RecordScan<ReviewRecord>> {
            Err(CoreError::store("offline"))
        }
    }

    #[tokio::test]
    async fn test_read_failure_aborts_before_writing() {
        let results = Arc::new(InMemoryResultStore::new());
        let job = SettlementJob::new(
            Arc::new(OfflineReviewStore),
            Arc::new(InMemoryPaymentStore::new()),
            results.clone(),
            Arc::new(ManualTimeSource::new(june(30))),
            Settings::default(),
        );

        let err = job.calculate_rankings(june(1)).await.unwrap_err();
        assert!(matches!(err, CoreError::StoreUnavailable(_)));
        assert!(results.rankings().await.unwrap().is_empty());
    }
}

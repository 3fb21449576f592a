//! Two-phase run: crawl every target, then evaluate every tracked item.
//!
//! A target failing with a hard error (navigation, listing read, store) does
//! not stop the other targets, but it marks the crawl phase as failed and the
//! detection phase is then skipped for the run.

use std::time::{Duration, Instant};

use tracing::{Instrument, error, info, info_span, instrument, warn};

use pricewatch_crawler::{CatalogCrawler, CrawlStats, PageSource};
use pricewatch_notify::NotificationChannel;
use pricewatch_shared::{CrawlConfig, DetectionConfig, Result, RunId, Target};
use pricewatch_storage::PriceStore;

use crate::detector::{AnomalyDetector, Decision};
use crate::dispatcher::NotificationDispatcher;
use crate::ingest::IngestionPipeline;

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase (`crawl`, `detect`).
    fn phase(&self, name: &str);
    /// Called before crawling a target.
    fn target_started(&self, label: &str, index: usize, total: usize);
    /// Called after each ingested record with the running count for the target.
    fn item_ingested(&self, label: &str, count: usize);
    /// Called when a target is done, successfully or not.
    fn target_finished(&self, outcome: &TargetOutcome);
    /// Called before evaluating each tracked item.
    fn item_evaluated(&self, current: usize, total: usize);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn target_started(&self, _label: &str, _index: usize, _total: usize) {}
    fn item_ingested(&self, _label: &str, _count: usize) {}
    fn target_finished(&self, _outcome: &TargetOutcome) {}
    fn item_evaluated(&self, _current: usize, _total: usize) {}
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of crawling and ingesting one target.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    pub label: String,
    pub stats: CrawlStats,
    /// Records ingested (observations appended).
    pub ingested: usize,
    /// Items seen for the first time.
    pub created: usize,
    /// Hard error that aborted this target, if any.
    pub error: Option<String>,
}

impl TargetOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrawlPhaseReport {
    pub targets: Vec<TargetOutcome>,
}

impl CrawlPhaseReport {
    /// `true` when every target completed without a hard error.
    pub fn is_success(&self) -> bool {
        self.targets.iter().all(TargetOutcome::is_success)
    }

    pub fn total_ingested(&self) -> usize {
        self.targets.iter().map(|t| t.ingested).sum()
    }

    pub fn failed_targets(&self) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| !t.is_success())
            .map(|t| t.label.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectionReport {
    pub evaluated: usize,
    pub notified: usize,
    pub delivery_failures: usize,
    /// Items with fewer than two observations.
    pub skipped: usize,
    /// Comparable items whose price did not change.
    pub unchanged: usize,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub crawl: CrawlPhaseReport,
    /// `None` when detection was skipped because the crawl phase failed.
    pub detection: Option<DetectionReport>,
    pub elapsed: Duration,
}

// ---------------------------------------------------------------------------
// RunOrchestrator
// ---------------------------------------------------------------------------

/// Runs the crawl and detection phases against one store, page source, and
/// notification channel.
pub struct RunOrchestrator<'a, S, P, C> {
    store: &'a S,
    source: P,
    channel: &'a C,
    targets: Vec<Target>,
    crawler: CatalogCrawler,
    detector: AnomalyDetector,
}

impl<'a, S, P, C> RunOrchestrator<'a, S, P, C>
where
    S: PriceStore,
    P: PageSource,
    C: NotificationChannel,
{
    pub fn new(
        store: &'a S,
        source: P,
        channel: &'a C,
        targets: Vec<Target>,
        crawl: CrawlConfig,
        detection: DetectionConfig,
    ) -> Self {
        Self {
            store,
            source,
            channel,
            targets,
            crawler: CatalogCrawler::new(crawl),
            detector: AnomalyDetector::new(detection),
        }
    }

    /// Crawl and ingest every target in order. Per-target errors are logged
    /// and recorded in the report; they never abort the remaining targets.
    #[instrument(skip_all, fields(targets = self.targets.len()))]
    pub async fn crawl_phase(&mut self, progress: &dyn ProgressReporter) -> CrawlPhaseReport {
        progress.phase("crawl");
        let targets = self.targets.clone();
        let mut report = CrawlPhaseReport::default();

        for (index, target) in targets.iter().enumerate() {
            progress.target_started(&target.label, index + 1, targets.len());
            let outcome = self.crawl_target(target, progress).await;
            match &outcome.error {
                None => info!(
                    label = %outcome.label,
                    ingested = outcome.ingested,
                    created = outcome.created,
                    "target crawled"
                ),
                Some(e) => error!(label = %outcome.label, error = %e, "target crawl failed"),
            }
            progress.target_finished(&outcome);
            report.targets.push(outcome);
        }

        report
    }

    async fn crawl_target(&mut self, target: &Target, progress: &dyn ProgressReporter) -> TargetOutcome {
        let store = self.store;
        let mut outcome = TargetOutcome {
            label: target.label.clone(),
            stats: CrawlStats::default(),
            ingested: 0,
            created: 0,
            error: None,
        };

        let journal_id = match store.start_crawl_run(&target.label).await {
            Ok(id) => id,
            Err(e) => {
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };

        let pipeline = IngestionPipeline::new(store, self.crawler.parser().clone());
        let mut session = self.crawler.crawl(&mut self.source, target);

        let result: Result<()> = async {
            while let Some(record) = session.next_record().await? {
                let ingested = pipeline.ingest(&record).await?;
                outcome.ingested += 1;
                if ingested.created {
                    outcome.created += 1;
                }
                progress.item_ingested(&target.label, outcome.ingested);
            }
            Ok(())
        }
        .await;

        outcome.stats = session.into_stats();
        if let Err(e) = result {
            outcome.error = Some(e.to_string());
        }

        let journal = serde_json::json!({
            "stats": outcome.stats,
            "ingested": outcome.ingested,
            "created": outcome.created,
            "error": outcome.error,
        });
        if let Err(e) = store.finish_crawl_run(&journal_id, &journal.to_string()).await {
            warn!(label = %target.label, error = %e, "failed to close crawl journal entry");
        }

        outcome
    }

    /// Evaluate every tracked item and notify on price movements.
    ///
    /// Store failures abort the pass. Delivery failures are logged and
    /// counted; the pass continues with the next item.
    #[instrument(skip_all)]
    pub async fn detection_phase(&self, progress: &dyn ProgressReporter) -> Result<DetectionReport> {
        progress.phase("detect");
        let items = self.store.list_tracked_items().await?;
        let dispatcher =
            NotificationDispatcher::new(self.channel, self.crawler.config().currency_marker.clone());
        let mut report = DetectionReport::default();

        for (index, item) in items.iter().enumerate() {
            progress.item_evaluated(index + 1, items.len());
            report.evaluated += 1;

            match self.detector.evaluate_item(self.store, item).await? {
                Decision::Skip => report.skipped += 1,
                Decision::Quiet(_) => report.unchanged += 1,
                Decision::Notify(movement) => match dispatcher.dispatch(item, &movement).await {
                    Ok(()) => report.notified += 1,
                    Err(e) => {
                        warn!(item_id = item.item_id, error = %e, "notification delivery failed");
                        report.delivery_failures += 1;
                    }
                },
            }
        }

        info!(
            evaluated = report.evaluated,
            notified = report.notified,
            delivery_failures = report.delivery_failures,
            "detection pass complete"
        );
        Ok(report)
    }

    /// One full run: crawl phase, then detection unless the crawl phase failed.
    pub async fn run_once(&mut self, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let run_id = RunId::new();
        let span = info_span!("run", run_id = %run_id);

        async move {
            let started = Instant::now();
            let crawl = self.crawl_phase(progress).await;

            let detection = if crawl.is_success() {
                Some(self.detection_phase(progress).await?)
            } else {
                warn!(
                    failed = ?crawl.failed_targets(),
                    "crawl phase failed; skipping detection"
                );
                None
            };

            Ok(RunReport {
                run_id,
                crawl,
                detection,
                elapsed: started.elapsed(),
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use pricewatch_crawler::HttpPageSource;
    use pricewatch_shared::PriceWatchError;
    use pricewatch_storage::Storage;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::test_support::{FailingChannel, FaultyStore, RecordingChannel, temp_storage};

    fn crawl_config() -> CrawlConfig {
        CrawlConfig {
            settle_delay: Duration::ZERO,
            page_delay: Duration::ZERO,
            growth_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
            ..CrawlConfig::default()
        }
    }

    fn listing(server: &MockServer) -> String {
        format!(
            r#"<html><body><ul>
            <li data-productid="1"><a href="{0}/p/spirit">Spirit 42mm</a><span>85.000,00 TL</span></li>
            <li data-productid="2"><a href="{0}/p/conquest">Conquest</a><span>61.000,00 TL</span></li>
            </ul></body></html>"#,
            server.uri()
        )
    }

    async fn seed_history(store: &Storage, url: &str, amounts: &[f64]) {
        let brand = store.get_or_create_brand("Longines").await.unwrap();
        let (item_id, _) = store.get_or_create_item(brand, "Spirit 42mm", url).await.unwrap();
        for (days_ago, amount) in amounts.iter().rev().enumerate() {
            let at = Utc::now() - chrono::Duration::days(days_ago as i64 + 1);
            store.append_price_observation_at(item_id, *amount, at).await.unwrap();
        }
    }

    fn targets(server: &MockServer) -> Vec<Target> {
        vec![Target {
            label: "Longines".into(),
            url: format!("{}/longines", server.uri()),
        }]
    }

    #[tokio::test]
    async fn full_run_notifies_on_price_change() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/longines"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&server)))
            .mount(&server)
            .await;

        let store = temp_storage().await;
        seed_history(&store, &format!("{}/p/spirit", server.uri()), &[100_000.0]).await;

        let channel = RecordingChannel::default();
        let source = HttpPageSource::new(&crawl_config()).unwrap();
        let mut orchestrator = RunOrchestrator::new(
            &store,
            source,
            &channel,
            targets(&server),
            crawl_config(),
            DetectionConfig::default(),
        );

        let report = orchestrator.run_once(&SilentProgress).await.unwrap();
        assert!(report.crawl.is_success());
        assert_eq!(report.crawl.total_ingested(), 2);
        assert_eq!(report.crawl.targets[0].created, 1);

        let detection = report.detection.expect("detection ran");
        assert_eq!(detection.evaluated, 2);
        assert_eq!(detection.notified, 1);
        assert_eq!(detection.skipped, 1);

        let sent = channel.messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Spirit 42mm"));
        assert!(sent[0].contains("Old: 100,000 TL"));
        assert!(sent[0].contains("New: <b>85,000 TL</b>"));
    }

    #[tokio::test]
    async fn failed_crawl_skips_detection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = temp_storage().await;
        // Would notify if detection ran
        seed_history(&store, "https://shop.example.com/p/spirit", &[100.0, 80.0]).await;

        let channel = RecordingChannel::default();
        let source = HttpPageSource::new(&crawl_config()).unwrap();
        let mut orchestrator = RunOrchestrator::new(
            &store,
            source,
            &channel,
            targets(&server),
            crawl_config(),
            DetectionConfig::default(),
        );

        let report = orchestrator.run_once(&SilentProgress).await.unwrap();
        assert!(!report.crawl.is_success());
        assert_eq!(report.crawl.failed_targets(), vec!["Longines"]);
        assert!(report.detection.is_none());
        assert!(channel.messages().is_empty());
    }

    #[tokio::test]
    async fn one_failing_target_does_not_stop_the_others() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/longines"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&server)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = temp_storage().await;
        let channel = RecordingChannel::default();
        let mut all_targets = vec![Target {
            label: "Broken".into(),
            url: format!("{}/broken", server.uri()),
        }];
        all_targets.extend(targets(&server));

        let mut orchestrator = RunOrchestrator::new(
            &store,
            HttpPageSource::new(&crawl_config()).unwrap(),
            &channel,
            all_targets,
            crawl_config(),
            DetectionConfig::default(),
        );

        let report = orchestrator.crawl_phase(&SilentProgress).await;
        assert!(!report.is_success());
        assert!(!report.targets[0].is_success());
        assert!(report.targets[1].is_success());
        assert_eq!(report.total_ingested(), 2);
        assert_eq!(store.counts().await.unwrap().observations, 2);
    }

    #[tokio::test]
    async fn delivery_failures_are_counted_not_fatal() {
        let store = temp_storage().await;
        seed_history(&store, "https://shop.example.com/p/spirit", &[100.0, 80.0]).await;

        let orchestrator = RunOrchestrator::new(
            &store,
            HttpPageSource::new(&crawl_config()).unwrap(),
            &FailingChannel,
            Vec::new(),
            crawl_config(),
            DetectionConfig::default(),
        );

        let report = orchestrator.detection_phase(&SilentProgress).await.unwrap();
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.notified, 0);
        assert_eq!(report.delivery_failures, 1);
    }

    #[tokio::test]
    async fn crawl_is_journaled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/longines"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&server)))
            .mount(&server)
            .await;

        let store = temp_storage().await;
        let channel = RecordingChannel::default();
        let mut orchestrator = RunOrchestrator::new(
            &store,
            HttpPageSource::new(&crawl_config()).unwrap(),
            &channel,
            targets(&server),
            crawl_config(),
            DetectionConfig::default(),
        );
        orchestrator.crawl_phase(&SilentProgress).await;

        let entry = store.last_crawl_run("Longines").await.unwrap().unwrap();
        assert!(entry.finished_at.is_some());
        let journal: serde_json::Value =
            serde_json::from_str(&entry.stats_json.unwrap()).unwrap();
        assert_eq!(journal["ingested"], 2);
        assert_eq!(journal["stats"]["end"], "exhausted");
        assert_eq!(journal["stats"]["pages_loaded"], 1);
        assert!(journal["error"].is_null());
    }

    #[tokio::test]
    async fn store_failure_aborts_only_its_target_and_skips_detection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/longines"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&server)))
            .mount(&server)
            .await;
        let tissot = format!(
            r#"<html><body><ul>
            <li data-productid="9"><a href="{0}/tissot/p/prx">PRX</a><span>21.000,00 TL</span></li>
            </ul></body></html>"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/tissot"))
            .respond_with(ResponseTemplate::new(200).set_body_string(tissot))
            .mount(&server)
            .await;

        let store = FaultyStore {
            fail_items_matching: Some("/tissot/".into()),
            ..FaultyStore::new().await
        };
        // Would notify if detection ran
        seed_history(&store.inner, &format!("{}/p/spirit", server.uri()), &[100_000.0]).await;

        let mut all_targets = vec![Target {
            label: "Tissot".into(),
            url: format!("{}/tissot", server.uri()),
        }];
        all_targets.extend(targets(&server));

        let channel = RecordingChannel::default();
        let mut orchestrator = RunOrchestrator::new(
            &store,
            HttpPageSource::new(&crawl_config()).unwrap(),
            &channel,
            all_targets,
            crawl_config(),
            DetectionConfig::default(),
        );

        let report = orchestrator.run_once(&SilentProgress).await.unwrap();
        let failed = &report.crawl.targets[0];
        assert_eq!(failed.ingested, 0);
        assert!(failed.error.as_deref().unwrap().contains("disk I/O error"));

        let healthy = &report.crawl.targets[1];
        assert!(healthy.is_success());
        assert_eq!(healthy.ingested, 2);

        assert_eq!(report.crawl.failed_targets(), vec!["Tissot"]);
        assert!(report.detection.is_none());
        assert!(channel.messages().is_empty());

        let journal = store.inner.last_crawl_run("Tissot").await.unwrap().unwrap();
        let journal: serde_json::Value =
            serde_json::from_str(&journal.stats_json.unwrap()).unwrap();
        assert!(journal["error"].as_str().unwrap().contains("disk I/O error"));
    }

    #[tokio::test]
    async fn store_failure_during_detection_is_an_error() {
        let store = FaultyStore {
            fail_history: true,
            ..FaultyStore::new().await
        };
        seed_history(&store.inner, "https://shop.example.com/p/spirit", &[100.0, 80.0]).await;

        let channel = RecordingChannel::default();
        let orchestrator = RunOrchestrator::new(
            &store,
            HttpPageSource::new(&crawl_config()).unwrap(),
            &channel,
            Vec::new(),
            crawl_config(),
            DetectionConfig::default(),
        );

        let err = orchestrator.detection_phase(&SilentProgress).await.unwrap_err();
        assert!(matches!(err, PriceWatchError::Storage(_)));
        assert!(channel.messages().is_empty());
    }
}

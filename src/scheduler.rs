//! Periodic collection loop.
//!
//! Every cycle runs one unit per configured cluster:
//! collect listings -> build graph -> write snapshot -> trim -> write file.
//! At most `clusters_in_parallel` units run at once; a new unit starts as soon
//! as a running one finishes. Units never take each other down: errors and
//! panics stop at the unit boundary and are logged.

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

use crate::collector::Collector;
use crate::db::Database;
use crate::error::{FetchError, UnitError};
use crate::flamegraph::FlameGraph;
use crate::output::FileOutput;
use crate::settings::{Cluster, Settings};

/// What one cluster unit produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitReport {
    pub cluster: String,
    pub metrics: usize,
    pub nodes: usize,
    /// Snapshot timestamp and row count, when the row store took the write.
    pub snapshot: Option<(i64, usize)>,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub succeeded: Vec<UnitReport>,
    /// Clusters whose unit failed or panicked.
    pub failed: Vec<String>,
    pub elapsed: Duration,
}

pub struct Scheduler {
    settings: Arc<Settings>,
    collector: Collector,
    store: Option<Arc<Database>>,
    output: Option<Arc<FileOutput>>,
}

impl Scheduler {
    pub fn new(
        settings: Arc<Settings>,
        collector: Collector,
        store: Option<Arc<Database>>,
        output: Option<FileOutput>,
    ) -> Self {
        Self {
            settings,
            collector,
            store,
            output: output.map(Arc::new),
        }
    }

    /// Collector and file sink derived from `settings`; the store is opened by
    /// the caller since the query server shares it.
    pub fn from_settings(settings: Arc<Settings>, store: Option<Arc<Database>>) -> Result<Self, FetchError> {
        let collector = Collector::new(&settings)?;
        let output = settings
            .write_to_file
            .then(|| FileOutput::new(settings.output_dir.clone()));
        Ok(Self::new(settings, collector, store, output))
    }

    pub async fn run_cycle(&self) -> CycleReport {
        self.run_units(ClusterUnit::run).await
    }

    /// One cycle with `work` as the per-cluster pipeline.
    async fn run_units<F, Fut>(&self, work: F) -> CycleReport
    where
        F: Fn(ClusterUnit) -> Fut,
        Fut: Future<Output = Result<UnitReport, UnitError>> + Send + 'static,
    {
        let started = Instant::now();
        info!(clusters = self.settings.clusters.len(), "iteration start");

        let permits = Arc::new(Semaphore::new(self.settings.clusters_in_parallel.max(1)));
        let mut units = JoinSet::new();

        for cluster in &self.settings.clusters {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let unit = ClusterUnit {
                cluster: cluster.clone(),
                collector: self.collector.clone(),
                store: self.store.clone(),
                output: self.output.clone(),
                trim_fraction: self.settings.remove_lowest_fraction(),
            };
            info!(cluster = %cluster.name, hosts = cluster.hosts.len(), "fetching results");
            let span = info_span!("cluster", cluster = %cluster.name);
            let job = guarded(cluster.name.clone(), work(unit));
            units.spawn(
                async move {
                    let result = job.await;
                    drop(permit);
                    result
                }
                .instrument(span),
            );
        }

        let mut report = CycleReport::default();
        while let Some(joined) = units.join_next().await {
            match joined {
                Ok(Ok(unit)) => report.succeeded.push(unit),
                Ok(Err(cluster)) => report.failed.push(cluster),
                Err(e) => error!(error = %e, "cluster task aborted"),
            }
        }
        report.elapsed = started.elapsed();
        report
    }

    /// Run cycles until the task is dropped.
    pub async fn run_forever(&self) {
        loop {
            let report = self.run_cycle().await;
            let sleep_for = next_sleep(self.settings.rerun_interval(), report.elapsed);
            info!(
                total_processing_ms = report.elapsed.as_millis() as u64,
                sleep_ms = sleep_for.as_millis() as u64,
                succeeded = report.succeeded.len(),
                failed = report.failed.len(),
                "all work is done"
            );
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Time left in the interval; zero when the cycle overran it.
pub fn next_sleep(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

struct ClusterUnit {
    cluster: Cluster,
    collector: Collector,
    store: Option<Arc<Database>>,
    output: Option<Arc<FileOutput>>,
    trim_fraction: f64,
}

/// Unit boundary: nothing inside `job` escapes as an error or a panic.
async fn guarded<Fut>(cluster: String, job: Fut) -> Result<UnitReport, String>
where
    Fut: Future<Output = Result<UnitReport, UnitError>>,
{
    let started = Instant::now();

    match AssertUnwindSafe(job).catch_unwind().await {
        Ok(Ok(report)) => {
            info!(
                metrics = report.metrics,
                nodes = report.nodes,
                cluster_processing_ms = started.elapsed().as_millis() as u64,
                "finished generating graphs"
            );
            Ok(report)
        }
        Ok(Err(e)) => {
            warn!(error = %e, "cluster cycle finished with errors");
            Err(cluster)
        }
        Err(_) => {
            error!("panic while processing cluster");
            Err(cluster)
        }
    }
}

impl ClusterUnit {
    /// Every enabled sink is attempted; the first sink error is returned
    /// after the rest have run.
    async fn run(self) -> Result<UnitReport, UnitError> {
        let names = self.collector.collect(&self.cluster.hosts).await;
        info!(metrics = names.len(), "got results");

        let mut graph = FlameGraph::build(&self.cluster.name, &names);
        let mut report = UnitReport {
            cluster: self.cluster.name.clone(),
            metrics: names.len(),
            nodes: graph.len(),
            ..UnitReport::default()
        };
        let mut first_error: Option<UnitError> = None;

        if let Some(store) = &self.store {
            let store = store.clone();
            let now = chrono::Utc::now().timestamp();
            let joined = tokio::task::spawn_blocking(move || {
                let written = store.write_next_snapshot(&graph, now);
                (graph, written)
            })
            .await;

            match joined {
                Ok((returned, written)) => {
                    graph = returned;
                    match written {
                        Ok((timestamp, rows)) => {
                            info!(rows, timestamp, "snapshot written");
                            report.snapshot = Some((timestamp, rows));
                        }
                        Err(e) => {
                            error!(error = %e, "failed to write snapshot");
                            first_error.get_or_insert(e.into());
                        }
                    }
                }
                // The graph went down with the task; nothing left for the file sink.
                Err(e) => return Err(UnitError::Store(e.into())),
            }
        }

        if let Some(output) = &self.output {
            let removed = graph.trim_fraction(self.trim_fraction);
            match output.write(&graph).await {
                Ok(path) => {
                    info!(path = %path.display(), removed_nodes = removed, "graph written to file");
                    report.file = Some(path);
                }
                Err(e) => {
                    error!(error = %e, "failed to write output file");
                    first_error.get_or_insert(e.into());
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn spawn_agent(metrics: &[&str]) -> String {
        let body = serde_json::json!({ "Metrics": metrics });
        let router = Router::new().route(
            "/metrics/list/",
            get(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    fn cluster(name: &str, hosts: Vec<String>) -> Cluster {
        Cluster { name: name.to_string(), hosts }
    }

    #[test]
    fn test_next_sleep() {
        let interval = Duration::from_secs(600);
        assert_eq!(next_sleep(interval, Duration::from_secs(100)), Duration::from_secs(500));
        assert_eq!(next_sleep(interval, Duration::from_secs(600)), Duration::ZERO);
        assert_eq!(next_sleep(interval, Duration::from_secs(900)), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_cycle_persists_full_snapshot_and_trimmed_file() {
        let mut metrics: Vec<String> = (0..18).map(|i| format!("big.host{}.cpu", i)).collect();
        metrics.extend(["small.one.cpu".to_string(), "small.two.cpu".to_string()]);
        let metric_refs: Vec<&str> = metrics.iter().map(|s| s.as_str()).collect();
        let host_a = spawn_agent(&metric_refs[..10]).await;
        let host_b = spawn_agent(&metric_refs[8..]).await;
        let other = spawn_agent(&["x.y.z"]).await;

        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(Settings {
            clusters: vec![cluster("prod", vec![host_a, host_b]), cluster("stage", vec![other])],
            remove_lowest_pct: 10.0,
            write_to_file: true,
            output_dir: dir.path().to_path_buf(),
            fetch_timeout_secs: 5,
            ..Settings::default()
        });
        let store = Arc::new(Database::in_memory().unwrap());
        let scheduler = Scheduler::from_settings(settings, Some(store.clone())).unwrap();

        let report = scheduler.run_cycle().await;
        assert!(report.failed.is_empty());
        assert_eq!(report.succeeded.len(), 2);

        let prod = report.succeeded.iter().find(|u| u.cluster == "prod").unwrap();
        assert_eq!(prod.metrics, 20);
        let (timestamp, _) = prod.snapshot.unwrap();

        // Store holds the untrimmed graph
        let stored = store.load_snapshot(timestamp, "prod", 0.0).unwrap().unwrap();
        assert_eq!(stored.find(&["small"]).unwrap().value, 2);
        assert_eq!(stored.find(&["big"]).unwrap().value, 18);

        // File holds the trimmed one: floor = 20 * 0.1 = 2
        let file = prod.file.clone().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(file).unwrap()).unwrap();
        let children = json["children"].as_array().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0]["name"], "big");
        assert!(dir.path().join("stacks_stage.json").exists());
    }

    #[tokio::test]
    async fn test_store_failure_is_contained_to_its_cluster() {
        let good_host = spawn_agent(&["a.b.c"]).await;
        let bad_host = spawn_agent(&["d.e.f"]).await;

        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("flamegraph.db");
        let store = Arc::new(Database::new(&db_path).unwrap());
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TRIGGER reject_bad BEFORE INSERT ON flamegraph
                 WHEN NEW.cluster = 'bad'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();
        }

        let settings = Arc::new(Settings {
            clusters: vec![cluster("bad", vec![bad_host]), cluster("good", vec![good_host])],
            clusters_in_parallel: 1,
            write_to_file: true,
            output_dir: dir.path().join("out"),
            fetch_timeout_secs: 5,
            ..Settings::default()
        });
        let scheduler = Scheduler::from_settings(settings, Some(store.clone())).unwrap();

        let report = scheduler.run_cycle().await;
        assert_eq!(report.failed, vec!["bad".to_string()]);
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.succeeded[0].cluster, "good");

        // The failed cluster still got its file, and nothing of it was stored
        assert!(dir.path().join("out").join("stacks_bad.json").exists());
        assert!(store.list_snapshots("bad").unwrap().is_empty());
        assert_eq!(store.list_snapshots("good").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_cluster_still_produces_empty_snapshot() {
        let settings = Arc::new(Settings {
            clusters: vec![cluster("dark", vec!["127.0.0.1:1".to_string()])],
            fetch_timeout_secs: 2,
            ..Settings::default()
        });
        let store = Arc::new(Database::in_memory().unwrap());
        let scheduler = Scheduler::from_settings(settings, Some(store.clone())).unwrap();

        let report = scheduler.run_cycle().await;
        let unit = &report.succeeded[0];
        assert_eq!(unit.metrics, 0);
        assert_eq!(unit.nodes, 1);
        assert!(unit.file.is_none());

        let (timestamp, rows) = unit.snapshot.unwrap();
        assert_eq!(rows, 1);
        let stored = store.load_snapshot(timestamp, "dark", 0.0).unwrap().unwrap();
        assert_eq!(stored.root().total, 0);
    }

    #[tokio::test]
    async fn test_back_to_back_cycles_keep_every_snapshot() {
        let settings = Arc::new(Settings {
            clusters: vec![cluster("prod", Vec::new())],
            ..Settings::default()
        });
        let store = Arc::new(Database::in_memory().unwrap());
        let scheduler = Scheduler::from_settings(settings, Some(store.clone())).unwrap();

        let first = scheduler.run_cycle().await;
        let second = scheduler.run_cycle().await;
        assert!(first.failed.is_empty());
        assert!(second.failed.is_empty());

        let (first_ts, _) = first.succeeded[0].snapshot.unwrap();
        let (second_ts, _) = second.succeeded[0].snapshot.unwrap();
        assert!(second_ts > first_ts);
        assert_eq!(store.list_snapshots("prod").unwrap(), vec![second_ts, first_ts]);
    }

    #[tokio::test]
    async fn test_units_in_flight_stay_under_ceiling() {
        let settings = Arc::new(Settings {
            clusters: (0..5).map(|i| cluster(&format!("c{}", i), Vec::new())).collect(),
            clusters_in_parallel: 2,
            ..Settings::default()
        });
        let scheduler = Scheduler::from_settings(settings, None).unwrap();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let report = scheduler
            .run_units(|unit| {
                let (current, highest) = (in_flight.clone(), peak.clone());
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    highest.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    unit.run().await
                }
            })
            .await;

        assert_eq!(report.succeeded.len(), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_unit_does_not_stop_others() {
        let host = spawn_agent(&["a.b.c"]).await;
        let settings = Arc::new(Settings {
            clusters: vec![
                cluster("boom", vec![host.clone()]),
                cluster("left", vec![host.clone()]),
                cluster("right", vec![host]),
            ],
            clusters_in_parallel: 1,
            fetch_timeout_secs: 5,
            ..Settings::default()
        });
        let store = Arc::new(Database::in_memory().unwrap());
        let scheduler = Scheduler::from_settings(settings, Some(store.clone())).unwrap();

        let report = scheduler
            .run_units(|unit| {
                let explode = unit.cluster.name == "boom";
                async move {
                    if explode {
                        panic!("tree construction blew up");
                    }
                    unit.run().await
                }
            })
            .await;

        assert_eq!(report.failed, vec!["boom".to_string()]);
        assert_eq!(report.succeeded.len(), 2);
        assert!(store.list_snapshots("boom").unwrap().is_empty());
        assert_eq!(store.list_snapshots("left").unwrap().len(), 1);
        assert_eq!(store.list_snapshots("right").unwrap().len(), 1);
    }
}

//! Namespace listing collection from host agents.
//!
//! Each host agent serves `GET /metrics/list/?format=json` returning
//! `{"Metrics": ["a.b.c", ...]}`. A cluster's listings are fetched
//! concurrently, merged into a set, and returned sorted. A host that keeps
//! failing contributes nothing; the merge is then partial, which is accepted.

use futures::{stream, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, error, info, warn};

use crate::error::FetchError;
use crate::settings::Settings;

pub const LISTING_PATH: &str = "/metrics/list/?format=json";

#[derive(Debug, Deserialize)]
struct MetricsList {
    #[serde(rename = "Metrics", default)]
    metrics: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct Collector {
    client: reqwest::Client,
    agent_port: u16,
    attempts: u32,
    parallelism: usize,
}

impl Collector {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout())
            .build()?;
        Ok(Self {
            client,
            agent_port: settings.agent_port,
            attempts: settings.fetch_attempts.max(1),
            parallelism: settings.fetch_per_cluster.max(1),
        })
    }

    /// Listing URL for a configured host entry. Entries that already name a
    /// port are used verbatim.
    pub fn listing_url(&self, host: &str) -> String {
        let address = if host.parse::<SocketAddr>().is_ok() || has_explicit_port(host) {
            host.to_string()
        } else if let Ok(IpAddr::V6(ip)) = host.parse::<IpAddr>() {
            format!("[{}]:{}", ip, self.agent_port)
        } else {
            format!("{}:{}", host, self.agent_port)
        };
        format!("http://{}{}", address, LISTING_PATH)
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<String>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }
        let body = response.bytes().await?;
        let list: MetricsList = serde_json::from_slice(&body)?;
        Ok(list.metrics.unwrap_or_default())
    }

    /// Fetch one host's listing, retrying up to the configured number of
    /// attempts. Returns the last error once attempts are exhausted.
    pub async fn fetch_listing(&self, host: &str) -> Result<Vec<String>, FetchError> {
        let url = self.listing_url(host);
        let mut attempt = 1;
        loop {
            match self.fetch_once(&url).await {
                Ok(metrics) => {
                    debug!(url = %url, attempt, metrics = metrics.len(), "listing fetched");
                    return Ok(metrics);
                }
                Err(e) if attempt < self.attempts => {
                    warn!(url = %url, attempt, error = %e, "listing fetch failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    error!(url = %url, attempt, error = %e, "tries exceeded while fetching listing");
                    return Err(e);
                }
            }
        }
    }

    /// Deduplicated, sorted union of every host's listing.
    pub async fn collect(&self, hosts: &[String]) -> Vec<String> {
        // Owned hosts: the unit future must be `Send` for `tokio::spawn`.
        let listings: Vec<Result<Vec<String>, FetchError>> = stream::iter(hosts.to_vec())
            .map(|host| {
                let collector = self.clone();
                async move { collector.fetch_listing(&host).await }
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        let mut failed = 0;
        let mut unique: HashSet<String> = HashSet::new();
        for listing in listings {
            match listing {
                Ok(metrics) => unique.extend(metrics),
                Err(_) => failed += 1,
            }
        }

        let mut names: Vec<String> = unique.into_iter().collect();
        names.sort_unstable();
        info!(hosts = hosts.len(), failed_hosts = failed, metrics = names.len(), "listings collected");
        names
    }
}

/// `name:port` with a numeric port and no other colon.
fn has_explicit_port(host: &str) -> bool {
    match host.rsplit_once(':') {
        Some((name, port)) => !name.is_empty() && !name.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_collector() -> Collector {
        let settings = Settings {
            fetch_timeout_secs: 5,
            ..Settings::default()
        };
        Collector::new(&settings).unwrap()
    }

    async fn spawn_agent(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr.to_string()
    }

    fn listing_agent(metrics: &[&str]) -> Router {
        let body = serde_json::json!({ "Metrics": metrics });
        Router::new().route(
            "/metrics/list/",
            get(move || {
                let body = body.clone();
                async move { Json(body) }
            }),
        )
    }

    /// Fails `failures` times with a 500, then serves `metrics`.
    fn flaky_agent(failures: usize, metrics: &[&str], hits: Arc<AtomicUsize>) -> Router {
        let body = serde_json::json!({ "Metrics": metrics });
        Router::new().route(
            "/metrics/list/",
            get(move || {
                let body = body.clone();
                let hits = hits.clone();
                async move {
                    let hit = hits.fetch_add(1, Ordering::SeqCst);
                    if hit < failures {
                        Err((StatusCode::INTERNAL_SERVER_ERROR, "try later"))
                    } else {
                        Ok(Json(body))
                    }
                }
            }),
        )
    }

    #[test]
    fn test_listing_url() {
        let collector = test_collector();
        assert_eq!(collector.listing_url("10.0.0.1"), "http://10.0.0.1:8080/metrics/list/?format=json");
        assert_eq!(collector.listing_url("web1"), "http://web1:8080/metrics/list/?format=json");
        assert_eq!(collector.listing_url("web1:9090"), "http://web1:9090/metrics/list/?format=json");
        assert_eq!(collector.listing_url("::1"), "http://[::1]:8080/metrics/list/?format=json");
        assert_eq!(collector.listing_url("[::1]:9090"), "http://[::1]:9090/metrics/list/?format=json");
    }

    #[tokio::test]
    async fn test_collect_deduplicates_across_hosts() {
        let a = spawn_agent(listing_agent(&["a.b.c", "a.b.d", "x.y"])).await;
        let b = spawn_agent(listing_agent(&["a.b.c", "z.q"])).await;

        let names = test_collector().collect(&[a, b]).await;
        assert_eq!(names, vec!["a.b.c", "a.b.d", "x.y", "z.q"]);
    }

    #[tokio::test]
    async fn test_failing_host_contributes_nothing() {
        let hits = Arc::new(AtomicUsize::new(0));
        let broken = spawn_agent(flaky_agent(usize::MAX, &["never.seen"], hits.clone())).await;
        let healthy = spawn_agent(listing_agent(&["ok.metric"])).await;

        let collector = test_collector();
        assert!(matches!(
            collector.fetch_listing(&broken).await,
            Err(FetchError::Status(status)) if status == reqwest::StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let names = collector.collect(&[broken, healthy]).await;
        assert_eq!(names, vec!["ok.metric"]);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_retry_recovers_before_exhaustion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let host = spawn_agent(flaky_agent(2, &["late.metric"], hits.clone())).await;

        let names = test_collector().fetch_listing(&host).await.unwrap();
        assert_eq!(names, vec!["late.metric"]);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_malformed_listing_is_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/metrics/list/",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "<html>not a listing</html>"
                }
            }),
        );
        let host = spawn_agent(router).await;

        let result = test_collector().fetch_listing(&host).await;
        assert!(matches!(result, Err(FetchError::Decode(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_null_listing_is_empty() {
        let router = Router::new().route(
            "/metrics/list/",
            get(|| async { Json(serde_json::json!({ "Metrics": null })) }),
        );
        let host = spawn_agent(router).await;
        assert!(test_collector().fetch_listing(&host).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetches_in_flight_stay_under_ceiling() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let hits = Arc::new(AtomicUsize::new(0));
        let (current, highest, counter) = (in_flight.clone(), peak.clone(), hits.clone());
        let router = Router::new().route(
            "/metrics/list/",
            get(move || {
                let (current, highest, counter) = (current.clone(), highest.clone(), counter.clone());
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    highest.fetch_max(now, Ordering::SeqCst);
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Json(serde_json::json!({ "Metrics": ["slow.metric"] }))
                }
            }),
        );
        let host = spawn_agent(router).await;

        let settings = Settings {
            fetch_per_cluster: 2,
            fetch_timeout_secs: 5,
            ..Settings::default()
        };
        let collector = Collector::new(&settings).unwrap();
        let names = collector.collect(&vec![host; 6]).await;

        assert_eq!(names, vec!["slow.metric"]);
        assert_eq!(hits.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_skipped() {
        let healthy = spawn_agent(listing_agent(&["up.metric"])).await;
        let names = test_collector()
            .collect(&["127.0.0.1:1".to_string(), healthy])
            .await;
        assert_eq!(names, vec!["up.metric"]);
    }
}

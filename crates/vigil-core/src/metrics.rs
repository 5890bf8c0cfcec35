use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Result, VigilError};

/// A timestamped metric sample.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Boxed future alias for trait methods.
pub type MetricsFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Source of metric values the rules engine evaluates against.
///
/// Samples are pulled on demand; the engine never stores them.
pub trait MetricsProvider: Send + Sync {
    /// Evaluate an expression to a single value.
    fn query<'a>(&'a self, expression: &'a str) -> MetricsFuture<'a, f64>;

    /// Evaluate an expression over a window, newest last. Optional; the
    /// default reports the capability as unsupported.
    fn query_range<'a>(
        &'a self,
        expression: &'a str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> MetricsFuture<'a, Vec<MetricSample>> {
        let _ = expression;
        Box::pin(async {
            Err(VigilError::Metrics(
                "range queries are not supported by this provider".to_string(),
            ))
        })
    }
}

/// Prometheus-compatible HTTP metrics provider.
pub struct HttpMetricsProvider {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<PromSeries>,
}

#[derive(Debug, Deserialize)]
struct PromSeries {
    #[serde(default)]
    value: Option<(f64, String)>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

impl HttpMetricsProvider {
    /// Create a provider against a Prometheus-style query API.
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn fetch(&self, expression: &str) -> Result<PromResponse> {
        let url = format!("{}/api/v1/query", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("query", expression)])
            .send()
            .await
            .map_err(|e| VigilError::Metrics(format!("query request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(VigilError::Metrics(format!(
                "query returned HTTP {}",
                response.status()
            )));
        }

        response
            .json::<PromResponse>()
            .await
            .map_err(|e| VigilError::Metrics(format!("malformed query response: {}", e)))
    }
}

impl MetricsProvider for HttpMetricsProvider {
    fn query<'a>(&'a self, expression: &'a str) -> MetricsFuture<'a, f64> {
        Box::pin(async move {
            let body = self.fetch(expression).await?;

            if body.status != "success" {
                return Err(VigilError::Metrics(
                    body.error.unwrap_or_else(|| "query failed".to_string()),
                ));
            }

            let series = body
                .data
                .and_then(|d| d.result.into_iter().next())
                .ok_or_else(|| {
                    VigilError::Metrics(format!("expression '{}' returned no data", expression))
                })?;

            let raw = series
                .value
                .map(|(_, v)| v)
                .or_else(|| series.values.into_iter().next_back().map(|(_, v)| v))
                .ok_or_else(|| {
                    VigilError::Metrics(format!("expression '{}' returned no sample", expression))
                })?;

            raw.parse::<f64>()
                .map_err(|e| VigilError::Metrics(format!("non-numeric sample '{}': {}", raw, e)))
        })
    }
}

/// Fixed-value provider for tests: expressions resolve from a map, and the
/// whole provider can be switched into a failing mode.
#[derive(Clone, Default)]
pub struct StaticProvider {
    values: Arc<Mutex<HashMap<String, f64>>>,
    fail_with: Arc<Mutex<Option<String>>>,
}

impl StaticProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value an expression resolves to.
    pub fn set(&self, expression: impl Into<String>, value: f64) {
        self.values
            .lock()
            .expect("provider lock poisoned")
            .insert(expression.into(), value);
    }

    /// Make every query fail with the given message.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock().expect("provider lock poisoned") = Some(message.into());
    }

    /// Clear a previously set failure mode.
    pub fn recover(&self) {
        *self.fail_with.lock().expect("provider lock poisoned") = None;
    }
}

impl MetricsProvider for StaticProvider {
    fn query<'a>(&'a self, expression: &'a str) -> MetricsFuture<'a, f64> {
        let failure = self.fail_with.lock().expect("provider lock poisoned").clone();
        let value = self
            .values
            .lock()
            .expect("provider lock poisoned")
            .get(expression)
            .copied();

        Box::pin(async move {
            if let Some(message) = failure {
                return Err(VigilError::Metrics(message));
            }
            value.ok_or_else(|| {
                VigilError::Metrics(format!("no value registered for '{}'", expression))
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider_returns_registered_value() {
        let provider = StaticProvider::new();
        provider.set("cpu_usage", 42.5);

        let value = provider.query("cpu_usage").await.unwrap();
        assert_eq!(value, 42.5);
    }

    #[tokio::test]
    async fn test_static_provider_unknown_expression() {
        let provider = StaticProvider::new();
        let err = provider.query("unknown").await.unwrap_err();
        assert!(matches!(err, VigilError::Metrics(_)));
    }

    #[tokio::test]
    async fn test_static_provider_failure_mode() {
        let provider = StaticProvider::new();
        provider.set("cpu_usage", 1.0);
        provider.fail_with("scrape down");

        assert!(provider.query("cpu_usage").await.is_err());

        provider.recover();
        assert_eq!(provider.query("cpu_usage").await.unwrap(), 1.0);
    }

    #[test]
    fn test_prom_response_parsing() {
        let body = r#"{
            "status": "success",
            "data": {"result": [{"value": [1722500000.0, "85.2"]}]}
        }"#;
        let parsed: PromResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.status, "success");
        let series = &parsed.data.unwrap().result[0];
        assert_eq!(series.value.as_ref().unwrap().1, "85.2");
    }

    #[tokio::test]
    async fn test_default_range_query_unsupported() {
        let provider = StaticProvider::new();
        let now = Utc::now();
        let err = provider.query_range("x", now, now).await.unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }
}

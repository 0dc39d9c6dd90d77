use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, ensure};
use url::Url;

use super::{
    BackendType, BuildClientSnafu, ConfigError, DecodeResponseSnafu, Error, LOOKBACK_WINDOW,
    MetricName, MetricSource, NoSeriesSnafu, QueryFailedSnafu, ReadResponseSnafu,
    SendQuerySnafu, UnexpectedResultTypeSnafu, UnexpectedStatusSnafu,
};
use crate::crd::BackendAuth;

const QUERY_RANGE_PATH: &str = "api/v1/query_range";

/// Samples a Prometheus compatible HTTP API with range queries.
///
/// The average is taken over one representative value per returned series:
/// the most recent sample of that series.
pub struct PrometheusSource {
    client: reqwest::Client,
    query_range_url: Url,
    credentials: Option<Credentials>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Credentials {
    Bearer(String),
    Basic {
        login: String,
        password: Option<String>,
    },
}

impl Credentials {
    fn from_auth(auth: &BackendAuth) -> Option<Self> {
        if let Some(token) = auth.token.as_ref().filter(|token| !token.is_empty()) {
            return Some(Self::Bearer(token.clone()));
        }

        auth.login
            .as_ref()
            .filter(|login| !login.is_empty())
            .map(|login| Self::Basic {
                login: login.clone(),
                password: auth.password.clone(),
            })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    status: String,

    #[serde(default)]
    data: Option<QueryData>,

    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,

    #[serde(default)]
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Series {
    #[serde(default)]
    metric: BTreeMap<String, String>,

    /// `[unix_timestamp, "value"]` pairs, oldest first.
    #[serde(default)]
    values: Vec<(f64, String)>,
}

impl Series {
    fn representative_value(&self) -> f64 {
        self.values
            .last()
            .and_then(|(_, value)| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or_default()
    }
}

impl PrometheusSource {
    pub fn new(
        host: &str,
        auth: Option<&BackendAuth>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let query_range_url = super::base_url(host)?
            .join(QUERY_RANGE_PATH)
            .context(super::InvalidHostSnafu { host })?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(BuildClientSnafu)?;

        Ok(Self {
            client,
            query_range_url,
            credentials: auth.and_then(Credentials::from_auth),
        })
    }

    async fn query_range(&self, query: &str) -> Result<Vec<Series>, Error> {
        let end = jiff::Timestamp::now().as_second();
        let window = i64::try_from(LOOKBACK_WINDOW.as_secs()).unwrap_or(i64::MAX);
        let start = end - window;

        let mut request = self.client.get(self.query_range_url.clone()).query(&[
            ("query", query.to_owned()),
            ("start", start.to_string()),
            ("end", end.to_string()),
            ("step", window.to_string()),
        ]);

        request = match &self.credentials {
            Some(Credentials::Bearer(token)) => request.bearer_auth(token),
            Some(Credentials::Basic { login, password }) => {
                request.basic_auth(login, password.as_ref())
            }
            None => request,
        };

        let response = request.send().await.context(SendQuerySnafu {
            url: self.query_range_url.as_str(),
        })?;

        // Always drain the body so the connection goes back to the pool
        let status = response.status();
        let body = response.text().await.context(ReadResponseSnafu)?;

        let decoded = serde_json::from_str::<QueryResponse>(&body);
        let response = match decoded {
            Ok(response) => response,
            Err(_) if !status.is_success() => {
                return UnexpectedStatusSnafu { status, body }.fail();
            }
            Err(source) => return Err(source).context(DecodeResponseSnafu),
        };

        ensure!(
            response.status == "success",
            QueryFailedSnafu {
                message: response
                    .error
                    .unwrap_or_else(|| format!("status {:?}", response.status)),
            }
        );

        let Some(data) = response.data else {
            return Ok(Vec::new());
        };

        ensure!(
            data.result_type == "matrix",
            UnexpectedResultTypeSnafu {
                result_type: data.result_type
            }
        );

        if data.result.is_null() {
            return Ok(Vec::new());
        }

        serde_json::from_value(data.result).context(DecodeResponseSnafu)
    }
}

#[async_trait]
impl MetricSource for PrometheusSource {
    fn backend_type(&self) -> BackendType {
        BackendType::RangeTsdb
    }

    /// An unavailable Prometheus samples as a load of one.
    fn degraded_average(&self) -> f64 {
        1.0
    }

    async fn query_average(&self, metric: MetricName) -> Result<f64, Error> {
        let series = self.query_range(metric.range_query()).await?;
        average_of_series(&series).context(NoSeriesSnafu { metric })
    }
}

fn average_of_series(series: &[Series]) -> Option<f64> {
    if series.is_empty() {
        return None;
    }

    for entry in series.iter().filter(|entry| entry.values.is_empty()) {
        tracing::debug!(labels = ?entry.metric, "series without samples counts as 0");
    }

    let sum: f64 = series.iter().map(Series::representative_value).sum();
    Some(sum / series.len() as f64)
}

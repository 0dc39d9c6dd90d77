use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use snafu::ResultExt;
use url::Url;

use super::{
    BackendType, BuildClientSnafu, ConfigError, Error, MetricName, MetricSource, ParseCsvSnafu,
    QueryFailedSnafu, ReadResponseSnafu, SendQuerySnafu, UnexpectedStatusSnafu,
};

const QUERY_PATH: &str = "api/v2/query";
const MEASUREMENT: &str = "jitsi_stats";
const VALUE_COLUMN: &str = "_value";

/// Samples an InfluxDB 2 bucket with a Flux query.
///
/// Every record returned by the query counts towards the average. Records whose
/// `_value` is missing or not a float count as `0`.
pub struct InfluxDbSource {
    client: reqwest::Client,
    query_url: Url,
    bucket: String,
    token: Option<String>,
}

impl InfluxDbSource {
    pub fn new(
        host: &str,
        bucket: &str,
        org: Option<&str>,
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let mut query_url = super::base_url(host)?
            .join(QUERY_PATH)
            .context(super::InvalidHostSnafu { host })?;

        if let Some(org) = org.filter(|org| !org.is_empty()) {
            query_url.query_pairs_mut().append_pair("org", org);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context(BuildClientSnafu)?;

        Ok(Self {
            client,
            query_url,
            bucket: bucket.to_owned(),
            token: token.filter(|token| !token.is_empty()).map(ToOwned::to_owned),
        })
    }

    async fn query_csv(&self, flux: String) -> Result<String, Error> {
        let body = json!({
            "query": flux,
            "type": "flux",
            "dialect": {
                "header": true,
                "annotations": ["datatype"],
            },
        });

        let mut request = self
            .client
            .post(self.query_url.clone())
            .header(reqwest::header::ACCEPT, "application/csv")
            .json(&body);

        if let Some(token) = &self.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Token {token}"));
        }

        let response = request.send().await.context(SendQuerySnafu {
            url: self.query_url.as_str(),
        })?;

        // The body is read to the end on every path, which hands the
        // connection back to the pool
        let status = response.status();
        let body = response.text().await.context(ReadResponseSnafu)?;

        if !status.is_success() {
            return UnexpectedStatusSnafu { status, body }.fail();
        }

        Ok(body)
    }
}

#[async_trait]
impl MetricSource for InfluxDbSource {
    fn backend_type(&self) -> BackendType {
        BackendType::BucketTsdb
    }

    /// An unavailable bucket drives the pool towards its minimum.
    fn degraded_average(&self) -> f64 {
        0.0
    }

    async fn query_average(&self, metric: MetricName) -> Result<f64, Error> {
        let csv = self
            .query_csv(flux_query(&self.bucket, metric.bucket_field()))
            .await?;

        let records = RecordStats::from_annotated_csv(&csv)?;
        if records.count == 0 {
            tracing::debug!(bucket = %self.bucket, %metric, "query returned no records");
        }

        Ok(records.average())
    }
}

/// Builds the Flux query reading the distinct values of `field` over the
/// look-back window.
fn flux_query(bucket: &str, field: &str) -> String {
    format!(
        r#"from(bucket: "{bucket}") |> range(start: -15m) |> filter(fn: (r) => r._measurement == "{MEASUREMENT}") |> filter(fn: (r) => r._field == "{field}") |> distinct(column: "{VALUE_COLUMN}")"#,
        bucket = escape_flux_string(bucket),
        field = escape_flux_string(field),
    )
}

fn escape_flux_string(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', r#"\""#)
}

#[derive(Debug, Default, PartialEq)]
struct RecordStats {
    sum: f64,
    count: usize,
}

impl RecordStats {
    fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Aggregates the records of an annotated CSV response.
    ///
    /// Tables are separated by blank lines or a new `#datatype` annotation and
    /// start with their own header row.
    fn from_annotated_csv(csv: &str) -> Result<Self, Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(csv.as_bytes());

        let mut stats = Self::default();
        let mut datatypes: Option<csv::StringRecord> = None;
        let mut table: Option<Table> = None;

        for record in reader.records() {
            let record = record.context(ParseCsvSnafu)?;

            if record.iter().all(str::is_empty) {
                table = None;
                continue;
            }

            let first = record.get(0).unwrap_or_default();
            if first.starts_with('#') {
                if first == "#datatype" {
                    datatypes = Some(record);
                    table = None;
                }
                continue;
            }

            // Blank lines are dropped by the reader, a table without
            // annotations only announces itself with its header row
            match &table {
                Some(Table::Records { .. }) if is_header(&record) || is_error_header(&record) => {
                    table = Some(Table::from_header(&record, datatypes.as_ref()));
                }
                Some(Table::Records {
                    value_index,
                    value_is_float,
                }) => {
                    stats.count += 1;
                    stats.sum += record_value(&record, *value_index, *value_is_float);
                }
                Some(Table::Error { message_index }) => {
                    let message = record.get(*message_index).unwrap_or_default();
                    return QueryFailedSnafu { message }.fail();
                }
                None => table = Some(Table::from_header(&record, datatypes.as_ref())),
            }
        }

        Ok(stats)
    }
}

enum Table {
    Records {
        value_index: Option<usize>,
        value_is_float: bool,
    },

    /// InfluxDB reports errors that happen mid-stream as an `error,reference` table.
    Error { message_index: usize },
}

impl Table {
    fn from_header(header: &csv::StringRecord, datatypes: Option<&csv::StringRecord>) -> Self {
        if is_error_header(header) {
            let message_index = header
                .iter()
                .position(|column| column == "error")
                .unwrap_or_default();
            return Self::Error { message_index };
        }

        let value_index = header.iter().position(|column| column == VALUE_COLUMN);
        let value_is_float = match (value_index, datatypes) {
            (Some(index), Some(datatypes)) => datatypes.get(index) == Some("double"),
            // Without annotations the type is unknown, so try to parse
            (Some(_), None) => true,
            (None, _) => false,
        };

        Self::Records {
            value_index,
            value_is_float,
        }
    }
}

fn is_header(record: &csv::StringRecord) -> bool {
    starts_with_columns(record, ["result", "table"])
}

fn is_error_header(record: &csv::StringRecord) -> bool {
    starts_with_columns(record, ["error", "reference"])
}

/// Matches the leading columns of a row, skipping the empty annotation column.
///
/// Data rows carry the result name and the table number in these positions,
/// so tag values never look like a header.
fn starts_with_columns(record: &csv::StringRecord, columns: [&str; 2]) -> bool {
    let offset = usize::from(record.get(0) == Some(""));
    columns
        .iter()
        .enumerate()
        .all(|(index, column)| record.get(offset + index) == Some(*column))
}

fn record_value(record: &csv::StringRecord, value_index: Option<usize>, is_float: bool) -> f64 {
    if !is_float {
        return 0.0;
    }

    value_index
        .and_then(|index| record.get(index))
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or_default()
}

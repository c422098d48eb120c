//! Source adapter contract plus the fixture-file and JSON-feed adapters.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nlw_core::{FetchedBatch, ListingRecord, Scalar, SourceKind};
use nlw_storage::{FeedClient, FetchError};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "nlw-adapters";

/// Geographic context of a search. The variant must match the source's locality fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Locality {
    Coordinates { lat: f64, long: f64 },
    CityState { city: i64, state: i64 },
    Postal { postal_code: String, country: String },
}

impl Locality {
    pub fn fields(&self) -> Vec<(&'static str, Scalar)> {
        match self {
            Locality::Coordinates { lat, long } => {
                vec![("lat", Scalar::Float(*lat)), ("long", Scalar::Float(*long))]
            }
            Locality::CityState { city, state } => {
                vec![("city", Scalar::Integer(*city)), ("state", Scalar::Integer(*state))]
            }
            Locality::Postal {
                postal_code,
                country,
            } => vec![
                ("postal_code", Scalar::Text(postal_code.clone())),
                ("country", Scalar::Text(country.clone())),
            ],
        }
    }

    pub fn fits(&self, source: SourceKind) -> bool {
        let wanted = source
            .manifest()
            .locality_fields()
            .iter()
            .map(|f| f.name)
            .collect::<Vec<_>>();
        let have = self.fields().into_iter().map(|(name, _)| name).collect::<Vec<_>>();
        wanted == have
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locality::Coordinates { lat, long } => write!(f, "lat {lat} and long {long}"),
            Locality::CityState { city, state } => write!(f, "city {city} and state {state}"),
            Locality::Postal {
                postal_code,
                country,
            } => write!(f, "postal code {postal_code} in {country}"),
        }
    }
}

/// What one check asks a source for. `filters` are passed through to the adapter untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: String,
    pub locality: Locality,
    #[serde(default)]
    pub filters: std::collections::BTreeMap<String, String>,
}

impl SearchParams {
    pub fn new(query: impl Into<String>, locality: Locality) -> Self {
        Self {
            query: query.into(),
            locality,
            filters: Default::default(),
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    /// Query-string form used by feed requests.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("query".to_string(), self.query.clone())];
        pairs.extend(
            self.locality
                .fields()
                .into_iter()
                .map(|(name, value)| (name.to_string(), value.to_cell())),
        );
        pairs.extend(self.filters.iter().map(|(k, v)| (k.clone(), v.clone())));
        pairs
    }

    /// Fill in search context the adapter's parser did not set itself.
    pub fn stamp(&self, record: &mut ListingRecord, fetched_at: DateTime<Utc>) {
        record.insert_if_absent("query", self.query.as_str());
        for (name, value) in self.locality.fields() {
            record.insert_if_absent(name, value);
        }
        record.insert_if_absent("time_found", fetched_at.to_rfc3339());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterFault {
    Fetch,
    Parse,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("locality {locality} does not fit source {source_kind}")]
    LocalityMismatch {
        source_kind: SourceKind,
        locality: String,
    },
}

impl AdapterError {
    pub fn fault(&self) -> AdapterFault {
        match self {
            AdapterError::Parse(_) => AdapterFault::Parse,
            _ => AdapterFault::Fetch,
        }
    }
}

/// Fetch + parse collaborator for one source. The novelty core only sees the batch.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceKind;

    async fn fetch(&self, params: &SearchParams) -> Result<FetchedBatch, AdapterError>;
}

fn ensure_locality_fits(source: SourceKind, params: &SearchParams) -> Result<(), AdapterError> {
    if params.locality.fits(source) {
        Ok(())
    } else {
        Err(AdapterError::LocalityMismatch {
            source_kind: source,
            locality: params.locality.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchPayload {
    Bundle {
        #[serde(default)]
        fetched_at: Option<DateTime<Utc>>,
        records: Vec<JsonValue>,
    },
    Rows(Vec<JsonValue>),
}

fn scalar_from_json(field: &str, value: &JsonValue) -> Result<Scalar, AdapterError> {
    Ok(match value {
        JsonValue::Null => Scalar::Null,
        JsonValue::Bool(v) => Scalar::Bool(*v),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Scalar::Integer(i),
            None => Scalar::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => Scalar::Text(s.clone()),
        JsonValue::Array(items) => {
            let parts = items
                .iter()
                .map(|item| -> Result<Option<String>, AdapterError> {
                    match scalar_from_json(field, item)? {
                        Scalar::Null => Ok(None),
                        scalar => Ok(Some(scalar.to_cell())),
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            Scalar::Text(parts.into_iter().flatten().collect::<Vec<_>>().join(", "))
        }
        JsonValue::Object(_) => {
            return Err(AdapterError::Parse(format!(
                "field `{field}` holds a nested object"
            )))
        }
    })
}

fn record_from_json(value: &JsonValue) -> Result<ListingRecord, AdapterError> {
    let object = value
        .as_object()
        .ok_or_else(|| AdapterError::Parse("listing entry is not an object".to_string()))?;
    object
        .iter()
        .map(|(name, v)| -> Result<(String, Scalar), AdapterError> {
            Ok((name.clone(), scalar_from_json(name, v)?))
        })
        .collect()
}

/// Decode a captured or served batch: either a bare array of flat listing objects or
/// `{"fetched_at": ..., "records": [...]}`.
pub fn parse_batch_json(bytes: &[u8]) -> Result<(Option<DateTime<Utc>>, Vec<ListingRecord>), AdapterError> {
    let payload: BatchPayload = serde_json::from_slice(bytes)
        .map_err(|e| AdapterError::Parse(format!("invalid batch JSON: {e}")))?;
    let (fetched_at, rows) = match payload {
        BatchPayload::Bundle {
            fetched_at,
            records,
        } => (fetched_at, records),
        BatchPayload::Rows(rows) => (None, rows),
    };
    let records = rows
        .iter()
        .map(record_from_json)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((fetched_at, records))
}

fn finish_batch(
    source: SourceKind,
    params: &SearchParams,
    fetched_at: DateTime<Utc>,
    found_at: DateTime<Utc>,
    mut records: Vec<ListingRecord>,
) -> FetchedBatch {
    for record in &mut records {
        params.stamp(record, found_at);
    }
    FetchedBatch {
        source,
        fetched_at,
        records,
    }
}

/// Replays a batch captured to disk.
///
/// Every replay is a fresh fetch: the batch is timestamped now, while `time_found` falls back
/// to the bundle's capture time when it has one.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source: SourceKind,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(source: SourceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source(&self) -> SourceKind {
        self.source
    }

    async fn fetch(&self, params: &SearchParams) -> Result<FetchedBatch, AdapterError> {
        ensure_locality_fits(self.source, params)?;
        let bytes = fs::read(&self.path)
            .map_err(|e| AdapterError::Fetch(format!("reading {}: {e}", self.path.display())))?;
        let (captured_at, records) = parse_batch_json(&bytes)?;
        debug!(source = %self.source, rows = records.len(), path = %self.path.display(), "replayed fixture batch");
        let fetched_at = Utc::now();
        Ok(finish_batch(
            self.source,
            params,
            fetched_at,
            captured_at.unwrap_or(fetched_at),
            records,
        ))
    }
}

/// Pulls pre-normalized listings from an HTTP JSON feed.
#[derive(Debug, Clone)]
pub struct FeedAdapter {
    source: SourceKind,
    url: String,
    client: FeedClient,
}

impl FeedAdapter {
    pub fn new(source: SourceKind, url: impl Into<String>, client: FeedClient) -> Self {
        Self {
            source,
            url: url.into(),
            client,
        }
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn source(&self) -> SourceKind {
        self.source
    }

    async fn fetch(&self, params: &SearchParams) -> Result<FetchedBatch, AdapterError> {
        ensure_locality_fits(self.source, params)?;
        let body = self
            .client
            .get(self.source, &self.url, &params.to_query_pairs())
            .await?;
        let (_, records) = parse_batch_json(&body.body)?;
        debug!(source = %self.source, rows = records.len(), url = %body.final_url, "fetched feed batch");
        Ok(finish_batch(self.source, params, body.fetched_at, body.fetched_at, records))
    }
}

/// How a watch obtains its batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterSpec {
    Fixture { path: PathBuf },
    Feed { url: String },
}

pub fn adapter_for(source: SourceKind, spec: &AdapterSpec, client: &FeedClient) -> Box<dyn SourceAdapter> {
    match spec {
        AdapterSpec::Fixture { path } => Box::new(FixtureAdapter::new(source, path.clone())),
        AdapterSpec::Feed { url } => Box::new(FeedAdapter::new(source, url.clone(), client.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nyc() -> Locality {
        Locality::Coordinates {
            lat: 40.7128,
            long: -74.006,
        }
    }

    #[test]
    fn locality_must_match_source_fields() {
        assert!(nyc().fits(SourceKind::Craigslist));
        assert!(nyc().fits(SourceKind::Offerup));
        assert!(!nyc().fits(SourceKind::Kijiji));
        assert!(Locality::CityState {
            city: 1700281,
            state: 9001
        }
        .fits(SourceKind::Kijiji));
        assert!(Locality::Postal {
            postal_code: "10001".into(),
            country: "US".into()
        }
        .fits(SourceKind::Ebay));
    }

    #[test]
    fn stamping_keeps_values_set_by_the_parser() {
        let params = SearchParams::new("toyota", nyc());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut record = ListingRecord::new()
            .with("listing_id", 1)
            .with("time_found", "earlier");
        params.stamp(&mut record, fetched_at);
        assert_eq!(record.get("query"), Some(&Scalar::Text("toyota".into())));
        assert_eq!(record.get("lat"), Some(&Scalar::Float(40.7128)));
        assert_eq!(record.get("time_found"), Some(&Scalar::Text("earlier".into())));
    }

    #[test]
    fn bare_arrays_and_bundles_both_parse() {
        let (at, rows) = parse_batch_json(br#"[{"listing_id": 1}, {"listing_id": "2"}]"#).unwrap();
        assert!(at.is_none());
        assert_eq!(rows.len(), 2);

        let (at, rows) = parse_batch_json(
            br#"{"fetched_at": "2026-02-24T12:00:00Z", "records": [{"listing_id": 3, "flags": ["FIRM", "SHIPPABLE"]}]}"#,
        )
        .unwrap();
        assert!(at.is_some());
        assert_eq!(rows[0].get("flags"), Some(&Scalar::Text("FIRM, SHIPPABLE".into())));
    }

    #[test]
    fn nested_objects_are_parse_errors() {
        let err = parse_batch_json(br#"[{"listing_id": 1, "price": {"amount": 5}}]"#).unwrap_err();
        assert_eq!(err.fault(), AdapterFault::Parse);
        let err = parse_batch_json(b"<html>blocked</html>").unwrap_err();
        assert_eq!(err.fault(), AdapterFault::Parse);
    }

    #[test]
    fn feed_query_pairs_carry_locality_and_filters() {
        let params = SearchParams::new("civic", nyc())
            .with_filter("max_price", "9000")
            .with_filter("radius", "50");
        let pairs = params.to_query_pairs();
        assert_eq!(pairs[0], ("query".to_string(), "civic".to_string()));
        assert!(pairs.contains(&("lat".to_string(), "40.7128".to_string())));
        assert!(pairs.contains(&("max_price".to_string(), "9000".to_string())));
    }

    #[tokio::test]
    async fn fixture_adapter_rejects_wrong_locality_before_reading() {
        let adapter = FixtureAdapter::new(SourceKind::Kijiji, "/nonexistent/batch.json");
        let err = adapter
            .fetch(&SearchParams::new("truck", nyc()))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::LocalityMismatch { .. }));
    }

    #[tokio::test]
    async fn missing_fixture_file_is_a_fetch_fault() {
        let adapter = FixtureAdapter::new(SourceKind::Craigslist, "/nonexistent/batch.json");
        let err = adapter
            .fetch(&SearchParams::new("toyota", nyc()))
            .await
            .unwrap_err();
        assert_eq!(err.fault(), AdapterFault::Fetch);
    }
}

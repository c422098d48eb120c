//! Core listing model, per-source field manifests and the identity key policy for NLW.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "nlw-core";

/// Single cell of a listing record as produced by an adapter or read back from history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Render the value the way it is stored in a tabular cell.
    pub fn to_cell(&self) -> String {
        match self {
            Scalar::Null => String::new(),
            Scalar::Bool(v) => v.to_string(),
            Scalar::Integer(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Text(v) => v.clone(),
        }
    }

    /// Cells read back from storage are untyped; blank cells become `Null`.
    pub fn from_cell(cell: &str) -> Self {
        if cell.is_empty() {
            Scalar::Null
        } else {
            Scalar::Text(cell.to_string())
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Scalar::Null => true,
            Scalar::Text(v) => v.trim().is_empty(),
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            Scalar::Null => "null".to_string(),
            Scalar::Bool(v) => format!("bool {v}"),
            Scalar::Integer(v) => format!("integer {v}"),
            Scalar::Float(v) => format!("float {v}"),
            Scalar::Text(v) => format!("text {v:?}"),
        }
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Scalar::Integer(i64::from(value))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// Normalized listing handed from adapters into the novelty pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingRecord {
    fields: BTreeMap<String, Scalar>,
}

impl ListingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Set `name` only when the record carries no value for it yet.
    pub fn insert_if_absent(&mut self, name: &str, value: impl Into<Scalar>) {
        let missing = self.fields.get(name).map(Scalar::is_blank).unwrap_or(true);
        if missing {
            self.fields.insert(name.to_string(), value.into());
        }
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, Scalar)> for ListingRecord {
    fn from_iter<I: IntoIterator<Item = (String, Scalar)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Records returned by one adapter invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedBatch {
    pub source: SourceKind,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<ListingRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Craigslist,
    CraigslistVehicles,
    Ebay,
    GumtreeUk,
    Kijiji,
    KijijiMobile,
    Offerup,
}

impl SourceKind {
    pub const ALL: [SourceKind; 7] = [
        SourceKind::Craigslist,
        SourceKind::CraigslistVehicles,
        SourceKind::Ebay,
        SourceKind::GumtreeUk,
        SourceKind::Kijiji,
        SourceKind::KijijiMobile,
        SourceKind::Offerup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Craigslist => "craigslist",
            SourceKind::CraigslistVehicles => "craigslist_vehicles",
            SourceKind::Ebay => "ebay",
            SourceKind::GumtreeUk => "gumtree_uk",
            SourceKind::Kijiji => "kijiji",
            SourceKind::KijijiMobile => "kijiji_mobile",
            SourceKind::Offerup => "offerup",
        }
    }

    pub fn manifest(self) -> &'static FieldManifest {
        match self {
            SourceKind::Craigslist => &CRAIGSLIST,
            SourceKind::CraigslistVehicles => &CRAIGSLIST_VEHICLES,
            SourceKind::Ebay => &EBAY,
            SourceKind::GumtreeUk => &GUMTREE_UK,
            SourceKind::Kijiji => &KIJIJI,
            SourceKind::KijijiMobile => &KIJIJI_MOBILE,
            SourceKind::Offerup => &OFFERUP,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown source {0:?}")]
pub struct UnknownSourceError(pub String);

impl FromStr for SourceKind {
    type Err = UnknownSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        SourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == wanted)
            .ok_or_else(|| UnknownSourceError(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Integer,
    Float,
    Text,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Text => "text",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityField {
    pub name: &'static str,
    pub ty: FieldType,
}

impl IdentityField {
    const fn new(name: &'static str, ty: FieldType) -> Self {
        Self { name, ty }
    }
}

/// Declared columns for one source: identity fields first, then descriptive columns.
///
/// Column order here is the column order of the source's history and dated artifacts.
#[derive(Debug, PartialEq, Eq)]
pub struct FieldManifest {
    pub source: SourceKind,
    pub identity: &'static [IdentityField],
    pub descriptive: &'static [&'static str],
}

impl FieldManifest {
    pub fn columns(&self) -> Vec<&'static str> {
        self.identity
            .iter()
            .map(|f| f.name)
            .chain(self.descriptive.iter().copied())
            .collect()
    }

    pub fn locality_fields(&self) -> &'static [IdentityField] {
        &self.identity[2..]
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.identity.iter().any(|f| f.name == name) || self.descriptive.contains(&name)
    }

    /// Cells of `record` in column order; absent fields become blank cells.
    pub fn project(&self, record: &ListingRecord) -> Vec<String> {
        self.columns()
            .into_iter()
            .map(|col| record.get(col).map(Scalar::to_cell).unwrap_or_default())
            .collect()
    }
}

const LISTING_ID_INT: IdentityField = IdentityField::new("listing_id", FieldType::Integer);
const LISTING_ID_TEXT: IdentityField = IdentityField::new("listing_id", FieldType::Text);
const QUERY: IdentityField = IdentityField::new("query", FieldType::Text);
const LAT: IdentityField = IdentityField::new("lat", FieldType::Float);
const LONG: IdentityField = IdentityField::new("long", FieldType::Float);

static CRAIGSLIST: FieldManifest = FieldManifest {
    source: SourceKind::Craigslist,
    identity: &[LISTING_ID_INT, QUERY, LAT, LONG],
    descriptive: &["title", "price", "url", "location", "time_posted", "time_found"],
};

static CRAIGSLIST_VEHICLES: FieldManifest = FieldManifest {
    source: SourceKind::CraigslistVehicles,
    identity: &[LISTING_ID_INT, QUERY, LAT, LONG],
    descriptive: &[
        "title",
        "price",
        "url",
        "location",
        "mileage",
        "year",
        "time_posted",
        "time_found",
    ],
};

static EBAY: FieldManifest = FieldManifest {
    source: SourceKind::Ebay,
    identity: &[
        LISTING_ID_TEXT,
        QUERY,
        IdentityField::new("postal_code", FieldType::Text),
        IdentityField::new("country", FieldType::Text),
    ],
    descriptive: &[
        "title",
        "location",
        "image_url",
        "price",
        "url",
        "time_posted",
        "seller",
        "time_found",
    ],
};

static GUMTREE_UK: FieldManifest = FieldManifest {
    source: SourceKind::GumtreeUk,
    identity: &[LISTING_ID_INT, QUERY, LAT, LONG],
    descriptive: &[
        "title",
        "location",
        "location_name",
        "image_url",
        "price",
        "url",
        "time_posted",
        "mileage",
        "year",
        "distance",
        "time_found",
    ],
};

static KIJIJI: FieldManifest = FieldManifest {
    source: SourceKind::Kijiji,
    identity: &[
        LISTING_ID_INT,
        QUERY,
        IdentityField::new("city", FieldType::Integer),
        IdentityField::new("state", FieldType::Integer),
    ],
    descriptive: &[
        "title",
        "location",
        "image_url",
        "price",
        "url",
        "mileageinkm",
        "poster_info",
        "time_posted",
        "sorted_time",
        "time_found",
    ],
};

static KIJIJI_MOBILE: FieldManifest = FieldManifest {
    source: SourceKind::KijijiMobile,
    identity: &[LISTING_ID_INT, QUERY, LAT, LONG],
    descriptive: &[
        "title",
        "location",
        "image_url",
        "price",
        "url",
        "mileageinkm",
        "car_year",
        "poster_info",
        "time_posted",
        "sorted_time",
        "time_found",
    ],
};

static OFFERUP: FieldManifest = FieldManifest {
    source: SourceKind::Offerup,
    identity: &[LISTING_ID_TEXT, QUERY, LAT, LONG],
    descriptive: &[
        "condition_text",
        "flags",
        "image_url",
        "is_firm_price",
        "location_name",
        "price",
        "title",
        "vehicle_miles",
        "url",
        "time_found",
    ],
};

/// One canonicalized component of an identity tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Integer(i64),
    /// Bit pattern of a finite float with `-0.0` folded into `0.0`.
    Float(u64),
    Text(String),
}

impl KeyPart {
    pub fn float(value: f64) -> Self {
        let value = if value == 0.0 { 0.0 } else { value };
        KeyPart::Float(value.to_bits())
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Integer(v) => write!(f, "{v}"),
            KeyPart::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            KeyPart::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Fully typed identity tuple: `(listing_id, query, locality...)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey(pub Vec<KeyPart>);

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self.0.iter().map(ToString::to_string).collect::<Vec<_>>();
        write!(f, "({})", parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecordError {
    #[error("identity field `{field}` is missing")]
    MissingField { field: String },
    #[error("identity field `{field}` expected {expected}, found {found}")]
    Uncoercible {
        field: String,
        expected: FieldType,
        found: String,
    },
    #[error("field `{field}` is not declared for this source")]
    UndeclaredField { field: String },
}

/// Derives identity tuples for one source from its field manifest.
#[derive(Debug, Clone, Copy)]
pub struct IdentityPolicy {
    manifest: &'static FieldManifest,
}

impl IdentityPolicy {
    pub fn for_source(source: SourceKind) -> Self {
        Self {
            manifest: source.manifest(),
        }
    }

    pub fn source(&self) -> SourceKind {
        self.manifest.source
    }

    pub fn manifest(&self) -> &'static FieldManifest {
        self.manifest
    }

    pub fn identity_of(&self, record: &ListingRecord) -> Result<IdentityKey, MalformedRecordError> {
        self.manifest
            .identity
            .iter()
            .map(|field| coerce(field.name, record.get(field.name), field.ty))
            .collect::<Result<Vec<_>, _>>()
            .map(IdentityKey)
    }

    /// Schema-on-write check for fresh records: no undeclared fields, then the identity tuple.
    pub fn validate(&self, record: &ListingRecord) -> Result<IdentityKey, MalformedRecordError> {
        if let Some(name) = record.field_names().find(|name| !self.manifest.is_declared(name)) {
            return Err(MalformedRecordError::UndeclaredField {
                field: name.to_string(),
            });
        }
        self.identity_of(record)
    }
}

pub fn coerce(field: &str, value: Option<&Scalar>, ty: FieldType) -> Result<KeyPart, MalformedRecordError> {
    let value = match value {
        Some(v) if !v.is_blank() => v,
        _ => {
            return Err(MalformedRecordError::MissingField {
                field: field.to_string(),
            })
        }
    };
    let uncoercible = || MalformedRecordError::Uncoercible {
        field: field.to_string(),
        expected: ty,
        found: value.describe(),
    };

    match ty {
        FieldType::Integer => match value {
            Scalar::Integer(v) => Ok(KeyPart::Integer(*v)),
            Scalar::Float(v) => integral_f64(*v).map(KeyPart::Integer).ok_or_else(uncoercible),
            Scalar::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().and_then(integral_f64))
                    .map(KeyPart::Integer)
                    .ok_or_else(uncoercible)
            }
            _ => Err(uncoercible()),
        },
        FieldType::Float => match value {
            Scalar::Integer(v) => Ok(KeyPart::float(*v as f64)),
            Scalar::Float(v) if v.is_finite() => Ok(KeyPart::float(*v)),
            Scalar::Text(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(KeyPart::float)
                .ok_or_else(uncoercible),
            _ => Err(uncoercible()),
        },
        FieldType::Text => match value {
            Scalar::Text(s) => Ok(KeyPart::Text(s.trim().to_string())),
            Scalar::Integer(v) => Ok(KeyPart::Text(v.to_string())),
            Scalar::Float(v) => match integral_f64(*v) {
                Some(i) => Ok(KeyPart::Text(i.to_string())),
                None if v.is_finite() => Ok(KeyPart::Text(v.to_string())),
                None => Err(uncoercible()),
            },
            Scalar::Bool(v) => Ok(KeyPart::Text(v.to_string())),
            Scalar::Null => Err(uncoercible()),
        },
    }
}

fn integral_f64(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
        Some(value as i64)
    } else {
        None
    }
}

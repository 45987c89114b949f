//! Core data models for the catalog pipeline.
//!
//! A [`RawRecord`] is what the upstream hands us; a [`Product`] is the typed,
//! normalized form that is flattened, merged into the canonical dataset, and
//! embedded. Absent attributes are `None`, never a leftover raw string.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque key/value bag returned by the upstream catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub Map<String, Value>);

impl RawRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The record's identifier, if present and non-empty.
    pub fn sku(&self) -> Option<&str> {
        self.0
            .get("sku")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Parsed `updated_at`, if present and in a recognised format.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.0
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
    }

    /// Nested variant entries: `children` followed by `bundle_items`.
    pub fn nested(&self) -> impl Iterator<Item = &Value> {
        ["children", "bundle_items"]
            .into_iter()
            .filter_map(|key| self.0.get(key).and_then(Value::as_array))
            .flatten()
    }
}

/// Length units accepted by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    Mm,
    Cm,
    In,
}

impl LengthUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mm" => Some(LengthUnit::Mm),
            "cm" => Some(LengthUnit::Cm),
            "in" | "inch" | "inches" | "\"" => Some(LengthUnit::In),
            _ => None,
        }
    }
}

impl fmt::Display for LengthUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LengthUnit::Mm => write!(f, "mm"),
            LengthUnit::Cm => write!(f, "cm"),
            LengthUnit::In => write!(f, "in"),
        }
    }
}

/// What a single extracted length measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureKind {
    Length,
    Thickness,
    Extension,
    Width,
    Height,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub kind: MeasureKind,
    pub value: f64,
    pub unit: LengthUnit,
}

/// Typed dimensions: either a length × width pair or a list of individual
/// measurements pulled from the text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dimensions {
    Plane {
        length: f64,
        width: f64,
        unit: LengthUnit,
    },
    Measured {
        measurements: Vec<Measurement>,
    },
}

impl Dimensions {
    /// A single length in the given unit, as produced by the identifier fallback.
    pub fn length(value: f64, unit: LengthUnit) -> Self {
        Dimensions::Measured {
            measurements: vec![Measurement {
                kind: MeasureKind::Length,
                value,
                unit,
            }],
        }
    }

    /// First measurement of the given kind.
    pub fn find(&self, kind: MeasureKind) -> Option<&Measurement> {
        match self {
            Dimensions::Measured { measurements } => {
                measurements.iter().find(|m| m.kind == kind)
            }
            Dimensions::Plane { .. } => None,
        }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimensions::Plane {
                length,
                width,
                unit,
            } => write!(f, "{} x {} {}", length, width, unit),
            Dimensions::Measured { measurements } => {
                let parts: Vec<String> = measurements
                    .iter()
                    .map(|m| format!("{:?} {} {}", m.kind, m.value, m.unit).to_lowercase())
                    .collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

/// Load capacity: a single rating or a min/max range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Capacity {
    Range { min: f64, max: f64, unit: String },
    Scalar { value: f64, unit: String },
}

impl Capacity {
    pub fn unit(&self) -> &str {
        match self {
            Capacity::Range { unit, .. } | Capacity::Scalar { unit, .. } => unit,
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::Range { min, max, unit } => {
                write!(f, "load capacity {}-{} {}", min, max, unit)
            }
            Capacity::Scalar { value, unit } => write!(f, "load capacity {} {}", value, unit),
        }
    }
}

/// A normalized product, and after flattening also a variant-tagged one.
///
/// Every attribute is `Option` so that "absent" is a first-class state: the
/// flattener only inherits into `None` and the merge engine only overwrites
/// with `Some`. All keys are always serialized so the dataset file keeps a
/// stable column set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub sku: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub features: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub dimensions: Option<Dimensions>,
    #[serde(default)]
    pub capacity: Option<Capacity>,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub corrosion_resistant: Option<bool>,
    #[serde(default)]
    pub uom: Option<String>,
    #[serde(default)]
    pub country_of_manufacture: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub is_variant: bool,
    #[serde(default)]
    pub parent_sku: Option<String>,
}

impl Product {
    /// An otherwise-empty product with the given identifier.
    pub fn new(sku: impl Into<String>) -> Self {
        Self {
            sku: sku.into(),
            name: None,
            description: None,
            features: None,
            price: None,
            weight_kg: None,
            dimensions: None,
            capacity: None,
            material: None,
            corrosion_resistant: None,
            uom: None,
            country_of_manufacture: None,
            category_id: None,
            updated_at: None,
            is_variant: false,
            parent_sku: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// Wire format for every timestamp this crate writes.
/// Whole seconds, with a fractional part only when the instant has one.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Parse an upstream or state-file timestamp.
///
/// Accepts RFC 3339 (`2025-01-01T00:00:00Z`), naive ISO-8601
/// (`2025-01-01T00:00:00`, read as UTC), and the space-separated form the
/// catalog API emits (`2025-01-01 00:00:00`).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

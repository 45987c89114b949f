//! Field normalization: free text and upstream attributes → typed product fields.
//!
//! Extraction is best-effort. Each extractor is an independent strategy that
//! returns `Option`; strategies are tried in order and the first `Some` wins.
//! Nothing here fails on malformed input, it only yields less information.
//!
//! Dimension strategies, in order:
//!
//! | Strategy | Example input | Result |
//! |----------|---------------|--------|
//! | anchored measurements | `"thickness 12.7 mm, extension 450 mm"` | thickness + extension |
//! | length × width | `"600 x 400 mm"` | plane 600 × 400 mm |
//! | identifier suffix | sku `"DA4120-0040"` | length 400 mm |
//! | name suffix | name `"Slide DA4120-0450 black"` | length 450 mm |

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::models::{
    format_timestamp, Capacity, Dimensions, LengthUnit, MeasureKind, Measurement, Product,
    RawRecord,
};

static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static NUMERIC_ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&#(x[0-9a-fA-F]+|[0-9]+);").unwrap());

static ANCHORED_MEASURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(thickness|extension|length|width|height)\b[^0-9]{0,20}?(\d+(?:[.,]\d+)?)\s*(mm|cm|inches|inch|in\b|")"#,
    )
    .unwrap()
});
static PLANE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*[x×]\s*(\d+(?:\.\d+)?)\s*(mm|cm|in\b)?").unwrap()
});
static SKU_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-(\d{3,4})$").unwrap());
static NAME_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-(\d{3,4})\b").unwrap());

static CAPACITY_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:load\s+rating|load\s+capacity|capacity|up\s+to)\b[^0-9]{0,20}?(\d+(?:\.\d+)?)\s*(?:-|–|to)\s*(\d+(?:\.\d+)?)\s*(kg|lbs?|tons?)\b",
    )
    .unwrap()
});
static CAPACITY_SCALAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:load\s+rating|load\s+capacity|capacity|up\s+to)\b[^0-9]{0,20}?(\d+(?:\.\d+)?)\s*(kg|lbs?|tons?)\b",
    )
    .unwrap()
});

/// Materials recognised in free text, most specific first.
const MATERIAL_KEYWORDS: &[(&str, &str)] = &[
    ("stainless steel", "stainless steel"),
    ("aluminium", "aluminium"),
    ("aluminum", "aluminium"),
    ("zinc", "zinc"),
    ("brass", "brass"),
    ("nylon", "nylon"),
    ("plastic", "plastic"),
    ("steel", "steel"),
];

/// Typed values the text extractors produce.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedFields {
    pub dimensions: Option<Dimensions>,
    pub capacity: Option<Capacity>,
}

/// Inputs visible to every extraction strategy.
struct FieldContext<'a> {
    text: &'a str,
    sku: &'a str,
    name: &'a str,
}

type Strategy<T> = fn(&FieldContext<'_>) -> Option<T>;

const DIMENSION_STRATEGIES: &[Strategy<Dimensions>] = &[
    anchored_measurements,
    plane_dimensions,
    sku_suffix_length,
    name_suffix_length,
];

const CAPACITY_STRATEGIES: &[Strategy<Capacity>] = &[capacity_range, capacity_scalar];

fn first_match<T>(strategies: &[Strategy<T>], ctx: &FieldContext<'_>) -> Option<T> {
    strategies.iter().find_map(|strategy| strategy(ctx))
}

/// Extract dimensions and load capacity from free text.
///
/// Falls back to a size code embedded in the identifier or name when the
/// text carries no dimension phrase.
pub fn normalize(text: &str, sku: &str, name: &str) -> NormalizedFields {
    let ctx = FieldContext { text, sku, name };
    NormalizedFields {
        dimensions: first_match(DIMENSION_STRATEGIES, &ctx),
        capacity: first_match(CAPACITY_STRATEGIES, &ctx),
    }
}

fn parse_number(s: &str) -> Option<f64> {
    s.replace(',', ".").parse::<f64>().ok()
}

fn anchored_measurements(ctx: &FieldContext<'_>) -> Option<Dimensions> {
    let measurements: Vec<Measurement> = ANCHORED_MEASURE
        .captures_iter(ctx.text)
        .filter_map(|caps| {
            let kind = match caps[1].to_ascii_lowercase().as_str() {
                "thickness" => MeasureKind::Thickness,
                "extension" => MeasureKind::Extension,
                "width" => MeasureKind::Width,
                "height" => MeasureKind::Height,
                _ => MeasureKind::Length,
            };
            Some(Measurement {
                kind,
                value: parse_number(&caps[2])?,
                unit: LengthUnit::parse(&caps[3])?,
            })
        })
        .collect();

    if measurements.is_empty() {
        None
    } else {
        Some(Dimensions::Measured { measurements })
    }
}

fn plane_dimensions(ctx: &FieldContext<'_>) -> Option<Dimensions> {
    let caps = PLANE.captures(ctx.text)?;
    let unit = caps
        .get(3)
        .and_then(|m| LengthUnit::parse(m.as_str()))
        .unwrap_or(LengthUnit::Mm);
    Some(Dimensions::Plane {
        length: parse_number(&caps[1])?,
        width: parse_number(&caps[2])?,
        unit,
    })
}

/// Decode a 3–4 digit size code into millimetres.
///
/// Zero-padded codes below 100 count in centimetres (`0040` → 400 mm);
/// anything else is already millimetres (`0450` → 450 mm).
fn size_code_mm(code: &str) -> Option<f64> {
    let value: u32 = code.parse().ok()?;
    match value {
        0 => None,
        v if v < 100 => Some(f64::from(v * 10)),
        v => Some(f64::from(v)),
    }
}

fn sku_suffix_length(ctx: &FieldContext<'_>) -> Option<Dimensions> {
    let caps = SKU_SUFFIX.captures(ctx.sku.trim())?;
    size_code_mm(&caps[1]).map(|mm| Dimensions::length(mm, LengthUnit::Mm))
}

fn name_suffix_length(ctx: &FieldContext<'_>) -> Option<Dimensions> {
    let caps = NAME_SUFFIX.captures(ctx.name)?;
    size_code_mm(&caps[1]).map(|mm| Dimensions::length(mm, LengthUnit::Mm))
}

fn capacity_unit(raw: &str) -> String {
    let unit = raw.to_ascii_lowercase();
    match unit.as_str() {
        "lbs" => "lb".to_string(),
        "tons" => "ton".to_string(),
        _ => unit,
    }
}

fn capacity_range(ctx: &FieldContext<'_>) -> Option<Capacity> {
    let caps = CAPACITY_RANGE.captures(ctx.text)?;
    let a = parse_number(&caps[1])?;
    let b = parse_number(&caps[2])?;
    Some(Capacity::Range {
        min: a.min(b),
        max: a.max(b),
        unit: capacity_unit(&caps[3]),
    })
}

fn capacity_scalar(ctx: &FieldContext<'_>) -> Option<Capacity> {
    let caps = CAPACITY_SCALAR.captures(ctx.text)?;
    Some(Capacity::Scalar {
        value: parse_number(&caps[1])?,
        unit: capacity_unit(&caps[2]),
    })
}

// ============ Text cleaning ============

/// Unescape HTML entities, strip tags, and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let unescaped = unescape_html(text);
    let stripped = TAG.replace_all(&unescaped, " ");
    WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

fn unescape_html(text: &str) -> String {
    let named = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'");
    let numeric = NUMERIC_ENTITY.replace_all(&named, |caps: &regex::Captures<'_>| {
        let code = &caps[1];
        let parsed = match code.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => code.parse::<u32>().ok(),
        };
        parsed
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_default()
    });
    // `&amp;` last so "&amp;lt;" decodes to "&lt;" and not "<"
    numeric.replace("&amp;", "&")
}

// ============ Attribute mapping ============

/// Look up an attribute as a top-level key, then in `custom_attributes`.
fn attribute<'a>(raw: &'a RawRecord, code: &str) -> Option<&'a Value> {
    if let Some(v) = raw.get(code).filter(|v| !v.is_null()) {
        return Some(v);
    }
    raw.get("custom_attributes")?
        .as_array()?
        .iter()
        .find(|entry| entry.get("attribute_code").and_then(Value::as_str) == Some(code))
        .and_then(|entry| entry.get("value"))
        .filter(|v| !v.is_null())
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => clean_text(s),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn attr_text(raw: &RawRecord, codes: &[&str]) -> Option<String> {
    codes
        .iter()
        .find_map(|code| attribute(raw, code).and_then(value_text))
}

fn attr_f64(raw: &RawRecord, code: &str) -> Option<f64> {
    match attribute(raw, code)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s.trim()),
        _ => None,
    }
}

fn attr_bool(raw: &RawRecord, codes: &[&str]) -> Option<bool> {
    codes.iter().find_map(|code| match attribute(raw, code)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "yes" | "true" | "y" => Some(true),
            "0" | "no" | "false" | "n" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

fn category_id(raw: &RawRecord) -> Option<String> {
    let from_ids = attribute(raw, "category_ids")
        .and_then(Value::as_array)
        .and_then(|ids| ids.first())
        .and_then(value_text);
    from_ids.or_else(|| {
        raw.get("extension_attributes")?
            .get("category_links")?
            .as_array()?
            .first()?
            .get("category_id")
            .and_then(value_text)
    })
}

pub(crate) fn detect_material(explicit: Option<String>, haystack: &str) -> Option<String> {
    if let Some(m) = explicit {
        return Some(m.to_lowercase());
    }
    let lower = haystack.to_lowercase();
    MATERIAL_KEYWORDS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, canonical)| canonical.to_string())
}

fn detect_corrosion(text: &str) -> Option<bool> {
    let lower = text.to_lowercase();
    if lower.contains("corrosion resistant") || lower.contains("corrosion-resistant") {
        Some(true)
    } else {
        None
    }
}

/// Build a typed [`Product`] from an upstream record.
///
/// Returns `None` when the record has no usable identifier.
pub fn normalize_record(raw: &RawRecord) -> Option<Product> {
    let sku = raw.sku()?.to_string();

    let mut product = Product::new(sku);
    product.name = attr_text(raw, &["name"]);
    product.description = attr_text(raw, &["description"]);
    product.features = attr_text(raw, &["features", "short_description"]);
    product.price = attr_f64(raw, "price");
    product.weight_kg = attr_f64(raw, "weight");
    product.uom = attr_text(raw, &["uom", "unit_of_measure"]);
    product.country_of_manufacture = attr_text(raw, &["country_of_manufacture"]);
    product.category_id = category_id(raw);
    product.updated_at = raw.updated_at().map(|ts| format_timestamp(&ts));

    let text = [&product.name, &product.description, &product.features]
        .into_iter()
        .flatten()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(". ");

    let fields = normalize(&text, &product.sku, product.display_name());
    product.dimensions = attr_f64(raw, "length")
        .filter(|v| *v > 0.0)
        .map(|v| Dimensions::length(v, LengthUnit::Mm))
        .or(fields.dimensions);
    product.capacity = fields.capacity;
    product.material = detect_material(attr_text(raw, &["material"]), &text);
    product.corrosion_resistant = attr_bool(raw, &["corrosion_resistant", "corrosion_resistance"])
        .or_else(|| detect_corrosion(&text));

    Some(product)
}

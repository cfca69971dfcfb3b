#![forbid(unsafe_code)]

//! Dataset metadata snapshots.
//!
//! A [`Metadata`] value is produced by a data source for one expression tree and is shared
//! read-only (`Arc<Metadata>`) by every compiled node. It is replaced wholesale on each update,
//! never mutated in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vx_types::{Value, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeomType {
    #[default]
    Point,
    Line,
    Polygon,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStat {
    pub name: String,
    #[serde(default)]
    pub frequency: f64,
}

/// Summary statistics for one property, computed at the source over the full dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default = "nan")]
    pub min: f64,
    #[serde(default = "nan")]
    pub max: f64,
    #[serde(default = "nan")]
    pub avg: f64,
    #[serde(default = "nan")]
    pub sum: f64,
    #[serde(default)]
    pub count: f64,
    #[serde(default)]
    pub categories: Vec<CategoryStat>,
}

fn nan() -> f64 {
    f64::NAN
}

impl ColumnStats {
    #[must_use]
    pub fn numeric(name: impl Into<String>, min: f64, max: f64, avg: f64, sum: f64, count: f64) -> Self {
        Self {
            name: name.into(),
            value_type: ValueType::Number,
            min,
            max,
            avg,
            sum,
            count,
            categories: Vec::new(),
        }
    }

    #[must_use]
    pub fn categorical(name: impl Into<String>, categories: &[&str]) -> Self {
        Self {
            name: name.into(),
            value_type: ValueType::Category,
            min: f64::NAN,
            max: f64::NAN,
            avg: f64::NAN,
            sum: f64::NAN,
            count: categories.len() as f64,
            categories: categories
                .iter()
                .map(|name| CategoryStat {
                    name: (*name).to_owned(),
                    frequency: 0.0,
                })
                .collect(),
        }
    }

    /// Position of `category` within this column's categorical domain.
    #[must_use]
    pub fn category_index(&self, category: &str) -> Option<usize> {
        self.categories.iter().position(|c| c.name == category)
    }
}

/// A raw sample cell as delivered by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Number(f64),
    Text(String),
}

pub type SampleRow = BTreeMap<String, Datum>;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MetadataError {
    #[error("duplicate column {0:?} in metadata")]
    DuplicateColumn(String),
    #[error("column {name:?} reports min {min} greater than max {max}")]
    InconsistentRange { name: String, min: f64, max: f64 },
    #[error("column {name:?} reports a negative count {count}")]
    NegativeCount { name: String, count: f64 },
    #[error("malformed metadata json: {0}")]
    Json(String),
}

#[derive(Debug, Deserialize)]
struct RawMetadata {
    #[serde(default)]
    geom_type: GeomType,
    columns: Vec<ColumnStats>,
    #[serde(default)]
    sample: Vec<SampleRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metadata {
    geom_type: GeomType,
    columns: Vec<ColumnStats>,
    sample: Vec<SampleRow>,
    category_ids: BTreeMap<String, u32>,
}

impl Metadata {
    /// Builds a snapshot, validating column statistics and assigning global category ids
    /// in column order.
    pub fn new(columns: Vec<ColumnStats>, sample: Vec<SampleRow>) -> Result<Self, MetadataError> {
        let mut seen = BTreeMap::new();
        for column in &columns {
            if seen.insert(column.name.as_str(), ()).is_some() {
                return Err(MetadataError::DuplicateColumn(column.name.clone()));
            }
            if column.count < 0.0 {
                return Err(MetadataError::NegativeCount {
                    name: column.name.clone(),
                    count: column.count,
                });
            }
            if column.min > column.max {
                return Err(MetadataError::InconsistentRange {
                    name: column.name.clone(),
                    min: column.min,
                    max: column.max,
                });
            }
        }

        let mut category_ids = BTreeMap::new();
        for category in columns.iter().flat_map(|c| &c.categories) {
            let next = category_ids.len() as u32;
            category_ids.entry(category.name.clone()).or_insert(next);
        }

        Ok(Self {
            geom_type: GeomType::default(),
            columns,
            sample,
            category_ids,
        })
    }

    pub fn from_json(input: &str) -> Result<Self, MetadataError> {
        let raw: RawMetadata =
            serde_json::from_str(input).map_err(|err| MetadataError::Json(err.to_string()))?;
        Ok(Self::new(raw.columns, raw.sample)?.with_geom_type(raw.geom_type))
    }

    #[must_use]
    pub fn with_geom_type(mut self, geom_type: GeomType) -> Self {
        self.geom_type = geom_type;
        self
    }

    #[must_use]
    pub fn geom_type(&self) -> GeomType {
        self.geom_type
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnStats] {
        &self.columns
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnStats> {
        self.columns.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn sample(&self) -> &[SampleRow] {
        &self.sample
    }

    /// Global id of a category string, as stored in per-feature category textures.
    #[must_use]
    pub fn category_id(&self, category: &str) -> Option<u32> {
        self.category_ids.get(category).copied()
    }

    /// Numeric sample values for `property`, sorted ascending. Missing and non-finite cells are dropped.
    #[must_use]
    pub fn sorted_sample(&self, property: &str) -> Vec<f64> {
        let mut values = self
            .sample
            .iter()
            .filter_map(|row| match row.get(property) {
                Some(Datum::Number(v)) if v.is_finite() => Some(*v),
                _ => None,
            })
            .collect::<Vec<_>>();
        values.sort_by(f64::total_cmp);
        values
    }
}

/// One feature delivered by a source: its property values plus an optional
/// position in normalized `[-1, 1]` map space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    properties: BTreeMap<String, Value>,
    position: Option<[f64; 2]>,
}

impl Feature {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FeatureValue>) -> Self {
        self.properties.insert(name.into(), value.into().0);
        self
    }

    #[must_use]
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Some([x, y]);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    #[must_use]
    pub fn position(&self) -> Option<[f64; 2]> {
        self.position
    }
}

/// Conversion helper for [`Feature::with`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureValue(Value);

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        Self(Value::Number(value))
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        Self(Value::Category(value.to_owned()))
    }
}

impl From<Value> for FeatureValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// A batch of features delivered together by a source (one tile, one page of rows).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureBatch {
    pub geom_type: GeomType,
    pub features: Vec<Feature>,
}

impl FeatureBatch {
    #[must_use]
    pub fn new(geom_type: GeomType, features: Vec<Feature>) -> Self {
        Self {
            geom_type,
            features,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnStats, Datum, GeomType, Metadata, MetadataError, SampleRow};
    use vx_types::ValueType;

    #[test]
    fn category_ids_are_assigned_in_column_order_without_duplicates() {
        let metadata = Metadata::new(
            vec![
                ColumnStats::categorical("kind", &["red", "blue"]),
                ColumnStats::categorical("other", &["blue", "green"]),
            ],
            Vec::new(),
        )
        .expect("metadata");
        assert_eq!(metadata.category_id("red"), Some(0));
        assert_eq!(metadata.category_id("blue"), Some(1));
        assert_eq!(metadata.category_id("green"), Some(2));
        assert_eq!(metadata.category_id("purple"), None);
    }

    #[test]
    fn inconsistent_ranges_are_rejected() {
        let err = Metadata::new(
            vec![ColumnStats::numeric("price", 5.0, 1.0, 2.0, 3.0, 4.0)],
            Vec::new(),
        )
        .expect_err("must fail");
        assert!(matches!(err, MetadataError::InconsistentRange { .. }));
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let err = Metadata::new(
            vec![
                ColumnStats::numeric("price", 0.0, 1.0, 0.5, 1.0, 2.0),
                ColumnStats::numeric("price", 0.0, 1.0, 0.5, 1.0, 2.0),
            ],
            Vec::new(),
        )
        .expect_err("must fail");
        assert_eq!(err, MetadataError::DuplicateColumn("price".into()));
    }

    #[test]
    fn sorted_sample_drops_text_and_sorts() {
        let rows = [3.0, 1.0, 2.0]
            .into_iter()
            .map(|v| SampleRow::from([("price".to_owned(), Datum::Number(v))]))
            .chain(std::iter::once(SampleRow::from([(
                "price".to_owned(),
                Datum::Text("n/a".into()),
            )])))
            .collect();
        let metadata = Metadata::new(
            vec![ColumnStats::numeric("price", 1.0, 3.0, 2.0, 6.0, 3.0)],
            rows,
        )
        .expect("metadata");
        assert_eq!(metadata.sorted_sample("price"), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn metadata_parses_from_source_json() {
        let json = r#"{
            "geom_type": "polygon",
            "columns": [
                {"name": "price", "type": "number", "min": 0, "max": 2, "avg": 1, "sum": 3, "count": 4},
                {"name": "kind", "type": "category", "categories": [{"name": "a"}, {"name": "b", "frequency": 3}]}
            ],
            "sample": [{"price": 0.5, "kind": "a"}]
        }"#;
        let metadata = Metadata::from_json(json).expect("parse");
        assert_eq!(metadata.geom_type(), GeomType::Polygon);
        let price = metadata.column("price").expect("price");
        assert_eq!(price.value_type, ValueType::Number);
        assert_eq!(price.sum, 3.0);
        assert!(metadata.column("kind").expect("kind").min.is_nan());
        assert_eq!(metadata.category_id("b"), Some(1));
        assert_eq!(metadata.sorted_sample("price"), vec![0.5]);
    }

    #[test]
    fn malformed_json_reports_a_metadata_error() {
        let err = Metadata::from_json("{\"columns\": 3}").expect_err("must fail");
        assert!(matches!(err, MetadataError::Json(_)));
    }
}

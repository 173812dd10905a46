//! Field schemas and the per-source schema registry.
//!
//! Every logical data source carries a fixed set of typed fields. Which
//! schema applies to a batch is decided once, by looking for each schema's
//! discriminating field among the batch's field ids.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;

/// The type of a single observed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Binary pass/fail indicator, normalized to OK/NG.
    Status,
    /// Whole-number counter or measurement.
    Integer,
    /// Decimal measurement with bounded precision.
    Float,
    /// Device-reported clock reading (HH:MM:SS).
    Time,
}

impl FieldType {
    /// Whether values of this type participate in median/outlier math.
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float)
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Status => write!(f, "status"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Float => write!(f, "float"),
            FieldType::Time => write!(f, "time"),
        }
    }
}

/// Identifier of a field within a source schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldId(pub String);

impl FieldId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FieldId {
    fn from(s: &str) -> Self {
        FieldId(s.to_string())
    }
}

impl From<String> for FieldId {
    fn from(s: String) -> Self {
        FieldId(s)
    }
}

/// One typed field in a source schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub id: FieldId,
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(id: impl Into<FieldId>, field_type: FieldType) -> Self {
        Self {
            id: id.into(),
            field_type,
        }
    }
}

/// The fixed field layout of one logical data source.
///
/// `comparable_range` selects the contiguous run of fields whose normalized
/// values form the redundancy fingerprint; device-time and other metadata
/// fields sit outside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSchema {
    /// Human-readable source identifier (e.g. a camera/station name).
    pub source_id: String,
    /// Field whose presence in a batch selects this schema.
    pub discriminator: FieldId,
    /// Ordered field specs for this source.
    pub fields: Vec<FieldSpec>,
    /// Index range into `fields` used for the redundancy fingerprint.
    pub comparable_range: Range<usize>,
}

impl SourceSchema {
    pub fn new(
        source_id: impl Into<String>,
        discriminator: impl Into<FieldId>,
        fields: Vec<FieldSpec>,
        comparable_range: Range<usize>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            discriminator: discriminator.into(),
            fields,
            comparable_range,
        }
    }

    /// Look up the declared type of a field, if the schema knows it.
    pub fn field_type(&self, id: &FieldId) -> Option<FieldType> {
        self.fields.iter().find(|f| &f.id == id).map(|f| f.field_type)
    }

    /// The ordered fields that make up the redundancy fingerprint. Empty
    /// when the configured range does not fit the field list.
    pub fn comparable_fields(&self) -> &[FieldSpec] {
        self.fields
            .get(self.comparable_range.clone())
            .unwrap_or(&[])
    }

    /// Whether the comparable range actually fits inside `fields`. The
    /// pipeline rejects batches whose resolved schema fails this.
    pub fn comparable_range_fits(&self) -> bool {
        self.comparable_range.start <= self.comparable_range.end
            && self.comparable_range.end <= self.fields.len()
    }

    /// Iterate over the schema's numeric (Integer/Float) fields.
    pub fn numeric_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.field_type.is_numeric())
    }
}

/// Registry of known source schemas, resolved per batch by discriminator.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: Vec<SourceSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: SourceSchema) {
        self.schemas.push(schema);
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    /// Resolve the schema for a batch given the set of field ids present.
    ///
    /// The first registered schema whose discriminating field appears in the
    /// batch wins. Returns `None` when no schema matches.
    pub fn resolve(&self, present_fields: &HashSet<FieldId>) -> Option<&SourceSchema> {
        self.schemas
            .iter()
            .find(|s| present_fields.contains(&s.discriminator))
    }

    pub fn schemas(&self) -> &[SourceSchema] {
        &self.schemas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latch_schema() -> SourceSchema {
        SourceSchema::new(
            "latch",
            "F12",
            vec![
                FieldSpec { id: "F12".into(), field_type: FieldType::Status },
                FieldSpec { id: "F13".into(), field_type: FieldType::Integer },
                FieldSpec { id: "F16".into(), field_type: FieldType::Float },
                FieldSpec { id: "F52".into(), field_type: FieldType::Time },
            ],
            0..3,
        )
    }

    #[test]
    fn test_field_type_lookup() {
        let schema = latch_schema();
        assert_eq!(schema.field_type(&"F13".into()), Some(FieldType::Integer));
        assert_eq!(schema.field_type(&"F99".into()), None);
    }

    #[test]
    fn test_comparable_fields_exclude_time() {
        let schema = latch_schema();
        let ids: Vec<&str> = schema
            .comparable_fields()
            .iter()
            .map(|f| f.id.as_str())
            .collect();
        assert_eq!(ids, vec!["F12", "F13", "F16"]);
    }

    #[test]
    fn test_registry_resolves_by_discriminator() {
        let mut registry = SchemaRegistry::new();
        registry.register(latch_schema());

        let mut present = HashSet::new();
        present.insert(FieldId::new("F12"));
        present.insert(FieldId::new("F13"));
        assert_eq!(registry.resolve(&present).unwrap().source_id, "latch");

        let mut other = HashSet::new();
        other.insert(FieldId::new("F1"));
        assert!(registry.resolve(&other).is_none());
    }

    #[test]
    fn test_oversized_comparable_range_never_panics() {
        let schema = SourceSchema::new(
            "narrow",
            "F40",
            vec![FieldSpec::new("F40", FieldType::Integer)],
            0..5,
        );
        assert!(!schema.comparable_range_fits());
        assert!(schema.comparable_fields().is_empty());
        assert!(latch_schema().comparable_range_fits());
    }

    #[test]
    fn test_numeric_fields() {
        let schema = latch_schema();
        let numeric: Vec<&str> = schema.numeric_fields().map(|f| f.id.as_str()).collect();
        assert_eq!(numeric, vec!["F13", "F16"]);
    }
}

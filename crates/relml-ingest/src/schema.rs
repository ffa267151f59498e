//! Schema descriptor: ordered canonical fields with header aliases, a required flag and a
//! value kind.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("reading schema {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing schema yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid schema: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    ListingKey,
    ModifiedAt,
    Domain,
    PropertyType,
    Zip,
    Timestamp,
    Decimal,
    Integer,
    ImageCount,
    Lifecycle,
    Text,
}

impl FieldKind {
    /// Kinds that may appear at most once because the resolver reads them by role.
    fn is_singular(self) -> bool {
        !matches!(
            self,
            FieldKind::Timestamp | FieldKind::Decimal | FieldKind::Integer | FieldKind::Text
        )
    }
}

fn default_kind() -> FieldKind {
    FieldKind::Text
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_kind")]
    pub kind: FieldKind,
}

impl FieldSpec {
    fn new(name: &str, kind: FieldKind, required: bool, aliases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
            required,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

/// Lowercase ASCII-alphanumeric form used for header matching. Strips a UTF-8 BOM.
pub fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

impl SchemaSpec {
    /// Column set of MLS listing exports.
    pub fn listing_default() -> Self {
        use FieldKind::*;
        Self {
            name: "mls_listings".to_string(),
            fields: vec![
                FieldSpec::new(
                    "listing_key",
                    ListingKey,
                    true,
                    &["listingkey", "mlsnumber", "mlsid", "mls", "mls#", "listingid"],
                ),
                FieldSpec::new("domain", Domain, false, &["domain", "dataset", "dataarea"]),
                FieldSpec::new(
                    "matrix_modified_dt",
                    ModifiedAt,
                    true,
                    &[
                        "matrixmodifieddt",
                        "matrixmodifieddate",
                        "matrixmodifiedtimestamp",
                        "modifieddt",
                        "lastupdated",
                    ],
                ),
                FieldSpec::new(
                    "address",
                    Text,
                    false,
                    &["streetaddress", "propertyaddress"],
                ),
                FieldSpec::new("city", Text, false, &["town"]),
                FieldSpec::new("state", Text, false, &["province", "region"]),
                FieldSpec::new("zip", Zip, false, &["zipcode", "postalcode", "zip5"]),
                FieldSpec::new(
                    "list_price",
                    Decimal,
                    false,
                    &["listprice", "price", "listpricecurrent"],
                ),
                FieldSpec::new(
                    "sqft",
                    Decimal,
                    false,
                    &["squarefeet", "totallivingsf", "livingsize"],
                ),
                FieldSpec::new("beds", Integer, false, &["bedrooms", "numberbedrooms"]),
                FieldSpec::new(
                    "baths",
                    Decimal,
                    false,
                    &["bathrooms", "numberbathrooms", "fullbaths"],
                ),
                FieldSpec::new(
                    "property_type",
                    PropertyType,
                    false,
                    &["propertytype", "proptype", "type"],
                ),
                FieldSpec::new(
                    "photo_count",
                    ImageCount,
                    false,
                    &["photocount", "photoscount", "numberofphotos", "picturecount"],
                ),
                FieldSpec::new(
                    "listing_status",
                    Lifecycle,
                    false,
                    &["status", "listingstatus", "mlsstatus"],
                ),
            ],
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, SchemaError> {
        let schema: SchemaSpec = serde_yaml::from_str(raw)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.fields.is_empty() {
            return Err(SchemaError::Invalid(format!("schema {} has no fields", self.name)));
        }
        let mut owners: HashMap<String, &str> = HashMap::new();
        let mut kinds: HashMap<FieldKind, &str> = HashMap::new();
        for field in &self.fields {
            if field.kind.is_singular() {
                if let Some(previous) = kinds.insert(field.kind, &field.name) {
                    return Err(SchemaError::Invalid(format!(
                        "fields {previous} and {} share kind {:?}",
                        field.name, field.kind
                    )));
                }
            }
            for alias in self.match_keys(field) {
                if let Some(previous) = owners.insert(alias.clone(), &field.name) {
                    if previous != field.name {
                        return Err(SchemaError::Invalid(format!(
                            "header alias {alias} maps to both {previous} and {}",
                            field.name
                        )));
                    }
                }
            }
        }
        for kind in [FieldKind::ListingKey, FieldKind::ModifiedAt] {
            let Some(name) = kinds.get(&kind) else {
                return Err(SchemaError::Invalid(format!("no field of kind {kind:?}")));
            };
            let required = self
                .fields
                .iter()
                .any(|field| field.name == *name && field.required);
            if !required {
                return Err(SchemaError::Invalid(format!("field {name} must be required")));
            }
        }
        Ok(())
    }

    fn match_keys(&self, field: &FieldSpec) -> Vec<String> {
        std::iter::once(&field.name)
            .chain(field.aliases.iter())
            .map(|alias| normalize_header(alias))
            .filter(|alias| !alias.is_empty())
            .collect()
    }

    pub fn field(&self, index: usize) -> &FieldSpec {
        &self.fields[index]
    }

    pub fn field_of_kind(&self, kind: FieldKind) -> Option<usize> {
        self.fields.iter().position(|field| field.kind == kind)
    }

    /// Resolve a header row against the schema. The first header matching a field is bound
    /// to it; unmatched and repeated headers are kept as extras.
    pub fn bind_header(&self, header: &[String]) -> HeaderBinding {
        let mut lookup: HashMap<String, usize> = HashMap::new();
        for (index, field) in self.fields.iter().enumerate() {
            for key in self.match_keys(field) {
                lookup.entry(key).or_insert(index);
            }
        }

        let mut columns = Vec::with_capacity(header.len());
        let mut bound = vec![None; self.fields.len()];
        for (position, raw) in header.iter().enumerate() {
            let normalized = normalize_header(raw);
            match lookup.get(&normalized) {
                Some(&field) if bound[field].is_none() => {
                    bound[field] = Some(position);
                    columns.push(ColumnBinding::Field(field));
                }
                _ => {
                    let name = if normalized.is_empty() {
                        format!("column{}", position + 1)
                    } else {
                        normalized
                    };
                    columns.push(ColumnBinding::Extra(name));
                }
            }
        }

        let missing_required = self
            .fields
            .iter()
            .zip(&bound)
            .filter(|(field, slot)| field.required && slot.is_none())
            .map(|(field, _)| field.name.clone())
            .collect();

        HeaderBinding {
            columns,
            field_positions: bound,
            missing_required,
        }
    }
}

impl Default for SchemaSpec {
    fn default() -> Self {
        Self::listing_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnBinding {
    Field(usize),
    Extra(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBinding {
    pub columns: Vec<ColumnBinding>,
    /// Header position bound to each schema field, by field index.
    pub field_positions: Vec<Option<usize>>,
    pub missing_required: Vec<String>,
}

impl HeaderBinding {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn position_of(&self, field: usize) -> Option<usize> {
        self.field_positions.get(field).copied().flatten()
    }
}

//! Per-row validation and routing into clean or quarantined streams.

use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use relml_core::{
    Domain, ListingIdentity, ListingLifecycle, NormalizedRow, QuarantineReason, QuarantinedRow,
};
use tracing::debug;

use crate::resolve::{
    domain_from_path, domain_from_property_type, format_timestamp, normalize_zip,
    normalized_row_hash, parse_decimal, parse_integer, parse_timestamp, ZipOutcome,
};
use crate::rows::{CsvRowSource, RawRecord, RecordError, RowSourceError};
use crate::schema::{ColumnBinding, FieldKind, HeaderBinding, SchemaSpec};

/// File-level facts stamped onto every row.
#[derive(Debug, Clone)]
pub struct RowContext {
    pub source_file_hash: String,
    pub origin_path: PathBuf,
    pub recorded_at: DateTime<Utc>,
}

impl RowContext {
    pub fn new(
        source_file_hash: impl Into<String>,
        origin_path: impl AsRef<Path>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source_file_hash: source_file_hash.into(),
            origin_path: origin_path.as_ref().to_path_buf(),
            recorded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowVerdict {
    Clean(Box<NormalizedRow>),
    Quarantined(QuarantinedRow),
}

struct Rejection {
    reason: QuarantineReason,
    detail: String,
}

fn reject(reason: QuarantineReason, detail: impl Into<String>) -> Rejection {
    Rejection {
        reason,
        detail: detail.into(),
    }
}

pub struct RowValidator<'a> {
    schema: &'a SchemaSpec,
    binding: HeaderBinding,
    path_domain: Option<Domain>,
    context: &'a RowContext,
}

impl<'a> RowValidator<'a> {
    pub fn new(schema: &'a SchemaSpec, header: &[String], context: &'a RowContext) -> Self {
        Self {
            schema,
            binding: schema.bind_header(header),
            path_domain: domain_from_path(&context.origin_path),
            context,
        }
    }

    pub fn binding(&self) -> &HeaderBinding {
        &self.binding
    }

    pub fn validate(&self, record: &RawRecord) -> RowVerdict {
        match self.check(record) {
            Ok(row) => RowVerdict::Clean(Box::new(row)),
            Err(rejection) => RowVerdict::Quarantined(QuarantinedRow {
                source_file_hash: self.context.source_file_hash.clone(),
                source_row_ordinal: record.ordinal,
                raw_payload: record.raw.clone(),
                reason: rejection.reason,
                detail: rejection.detail,
                recorded_at: self.context.recorded_at,
            }),
        }
    }

    fn value<'r>(&self, fields: &'r [String], field: usize) -> Option<&'r str> {
        self.binding
            .position_of(field)
            .and_then(|position| fields.get(position))
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    fn check(&self, record: &RawRecord) -> Result<NormalizedRow, Rejection> {
        let fields = record
            .fields
            .as_ref()
            .map_err(|err| match err {
                RecordError::Quote(_) => reject(QuarantineReason::BadQuote, err.to_string()),
                RecordError::Encoding { .. } => reject(QuarantineReason::Other, err.to_string()),
            })?;

        if fields.len() != self.binding.width() {
            return Err(reject(
                QuarantineReason::ColumnMismatch,
                format!(
                    "expected {} fields, found {}",
                    self.binding.width(),
                    fields.len()
                ),
            ));
        }

        if !self.binding.missing_required.is_empty() {
            return Err(reject(
                QuarantineReason::MissingRequiredCol,
                format!(
                    "missing required column(s): {}",
                    self.binding.missing_required.join(", ")
                ),
            ));
        }
        for (index, field) in self.schema.fields.iter().enumerate() {
            if field.required && self.value(fields, index).is_none() {
                return Err(reject(
                    QuarantineReason::MissingRequiredCol,
                    format!("Missing value for {}", field.name),
                ));
            }
        }

        let mut attributes = BTreeMap::new();
        let mut listing_key = None;
        let mut modified_at = None;
        let mut explicit_domain = None;
        let mut property_domain = None;
        let mut expected_image_count = None;
        let mut lifecycle = None;

        for (index, field) in self.schema.fields.iter().enumerate() {
            let Some(value) = self.value(fields, index) else {
                continue;
            };
            let normalized = match field.kind {
                FieldKind::ListingKey => {
                    listing_key = Some(value.to_string());
                    value.to_string()
                }
                FieldKind::ModifiedAt | FieldKind::Timestamp => {
                    let parsed = parse_timestamp(value).ok_or_else(|| {
                        reject(
                            QuarantineReason::Other,
                            format!("{} is not a valid ISO timestamp", field.name),
                        )
                    })?;
                    if field.kind == FieldKind::ModifiedAt {
                        modified_at = Some(parsed);
                    }
                    format_timestamp(&parsed)
                }
                FieldKind::Decimal => parse_decimal(value).ok_or_else(|| {
                    reject(
                        QuarantineReason::Other,
                        format!("{} is not a valid number: {value}", field.name),
                    )
                })?,
                FieldKind::Integer => parse_integer(value)
                    .ok_or_else(|| {
                        reject(
                            QuarantineReason::Other,
                            format!("{} is not a valid integer: {value}", field.name),
                        )
                    })?
                    .to_string(),
                FieldKind::ImageCount => {
                    let count = parse_integer(value)
                        .and_then(|n| u32::try_from(n).ok())
                        .ok_or_else(|| {
                            reject(
                                QuarantineReason::Other,
                                format!("{} is not a valid image count: {value}", field.name),
                            )
                        })?;
                    expected_image_count = Some(count);
                    count.to_string()
                }
                FieldKind::Zip => match normalize_zip(value) {
                    ZipOutcome::Blank => continue,
                    ZipOutcome::Valid(zip) => zip,
                    ZipOutcome::Invalid => {
                        return Err(reject(
                            QuarantineReason::InvalidZip,
                            format!("{} {value:?} normalizes to 00000", field.name),
                        ))
                    }
                },
                FieldKind::Domain => {
                    explicit_domain = value.parse::<Domain>().ok();
                    value.to_ascii_uppercase()
                }
                FieldKind::PropertyType => {
                    property_domain = domain_from_property_type(value);
                    value.to_string()
                }
                FieldKind::Lifecycle => {
                    lifecycle = ListingLifecycle::parse_lenient(value);
                    value.to_string()
                }
                FieldKind::Text => value.to_string(),
            };
            attributes.insert(field.name.clone(), normalized);
        }

        for (position, column) in self.binding.columns.iter().enumerate() {
            if let ColumnBinding::Extra(name) = column {
                // A repeated header must not stand in for its canonical field.
                if self.schema.fields.iter().any(|field| field.name == *name) {
                    continue;
                }
                let value = fields[position].trim();
                if !value.is_empty() {
                    attributes
                        .entry(name.clone())
                        .or_insert_with(|| value.to_string());
                }
            }
        }

        let listing_key = listing_key.ok_or_else(|| {
            reject(
                QuarantineReason::IdentityMissing,
                "Missing value for listing_key",
            )
        })?;
        let domain = property_domain
            .or(explicit_domain)
            .or(self.path_domain)
            .ok_or_else(|| reject(QuarantineReason::IdentityMissing, "Missing value for domain"))?;
        let modified_at = modified_at.ok_or_else(|| {
            reject(
                QuarantineReason::MissingRequiredCol,
                "Missing value for modification timestamp",
            )
        })?;
        attributes.insert("domain".to_string(), domain.as_str().to_string());

        Ok(NormalizedRow {
            identity: ListingIdentity::new(listing_key, domain),
            modified_at,
            normalized_row_hash: normalized_row_hash(&attributes),
            source_file_hash: self.context.source_file_hash.clone(),
            source_row_ordinal: record.ordinal,
            raw_payload: record.raw.clone(),
            expected_image_count,
            lifecycle,
            attributes,
        })
    }
}

/// Both streams keep source order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutedRows {
    pub total: u64,
    pub clean: Vec<NormalizedRow>,
    pub quarantined: Vec<QuarantinedRow>,
}

#[derive(Debug)]
pub struct RouteOutcome {
    pub header: Vec<String>,
    pub rows: RoutedRows,
    /// Set when reading stopped early; rows seen before the failure are kept.
    pub fatal: Option<RowSourceError>,
}

pub fn route_records<I>(
    validator: &RowValidator<'_>,
    records: I,
) -> (RoutedRows, Option<RowSourceError>)
where
    I: IntoIterator<Item = Result<RawRecord, RowSourceError>>,
{
    let mut routed = RoutedRows::default();
    for record in records {
        let record = match record {
            Ok(record) => record,
            Err(err) => return (routed, Some(err)),
        };
        routed.total += 1;
        match validator.validate(&record) {
            RowVerdict::Clean(row) => routed.clean.push(*row),
            RowVerdict::Quarantined(row) => {
                debug!(
                    ordinal = row.source_row_ordinal,
                    reason = %row.reason,
                    detail = %row.detail,
                    "row quarantined"
                );
                routed.quarantined.push(row);
            }
        }
    }
    (routed, None)
}

/// Read a whole CSV stream. Only an unreadable or malformed header is returned as `Err`.
pub fn route_csv<R: BufRead>(
    schema: &SchemaSpec,
    reader: R,
    context: &RowContext,
) -> Result<RouteOutcome, RowSourceError> {
    let source = CsvRowSource::new(reader)?;
    let header = source.header().to_vec();
    let validator = RowValidator::new(schema, &header, context);
    let (rows, fatal) = route_records(&validator, source);
    Ok(RouteOutcome {
        header,
        rows,
        fatal,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Cursor;

    fn context(path: &str) -> RowContext {
        RowContext::new(
            "f".repeat(64),
            path,
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        )
    }

    fn route(path: &str, csv: &str) -> RouteOutcome {
        route_csv(
            &SchemaSpec::listing_default(),
            Cursor::new(csv.as_bytes().to_vec()),
            &context(path),
        )
        .expect("route")
    }

    #[test]
    fn clean_rows_are_normalized() {
        let out = route(
            "raw/sales/export.csv",
            "MLS#,Matrix_Modified_DT,Zip Code,List Price,Photo Count,Status,Garage\n\
             HAR1,2024-03-01 12:00:00,77024-1234,\"$350,000\",12,Active,2\n",
        );
        assert!(out.fatal.is_none());
        assert_eq!(out.rows.total, 1);
        assert!(out.rows.quarantined.is_empty());
        let row = &out.rows.clean[0];
        assert_eq!(row.identity, ListingIdentity::new("HAR1", Domain::Sale));
        assert_eq!(row.attributes["zip"], "77024");
        assert_eq!(row.attributes["list_price"], "350000");
        assert_eq!(row.attributes["matrix_modified_dt"], "2024-03-01T12:00:00Z");
        assert_eq!(row.attributes["garage"], "2");
        assert_eq!(row.expected_image_count, Some(12));
        assert_eq!(row.lifecycle, Some(ListingLifecycle::Active));
        assert_eq!(row.source_row_ordinal, 1);
    }

    #[test]
    fn reasons_follow_precedence() {
        let out = route(
            "raw/misc/export.csv",
            "ListingKey,LastUpdated,Zip,PropertyType\n\
             K1,2024-01-01T00:00:00Z,\"770\"24,Residential\n\
             K2,2024-01-01T00:00:00Z,77024\n\
             ,2024-01-01T00:00:00Z,77024,Residential\n\
             K4,not-a-date,00000,Residential\n\
             K5,2024-01-01T00:00:00Z,00000,Residential\n\
             K6,2024-01-01T00:00:00Z,77024,\n\
             K7,2024-01-01T00:00:00Z,77024,Lease\n",
        );
        let reasons: Vec<_> = out
            .rows
            .quarantined
            .iter()
            .map(|row| (row.source_row_ordinal, row.reason))
            .collect();
        assert_eq!(
            reasons,
            vec![
                (1, QuarantineReason::BadQuote),
                (2, QuarantineReason::ColumnMismatch),
                (3, QuarantineReason::MissingRequiredCol),
                (4, QuarantineReason::Other),
                (5, QuarantineReason::InvalidZip),
                (6, QuarantineReason::IdentityMissing),
            ]
        );
        assert_eq!(
            out.rows.quarantined[3].detail,
            "matrix_modified_dt is not a valid ISO timestamp"
        );
        assert_eq!(out.rows.quarantined[5].detail, "Missing value for domain");
        assert_eq!(out.rows.clean.len(), 1);
        assert_eq!(out.rows.clean[0].identity.domain, Domain::Rental);
        assert_eq!(
            out.rows.total,
            (out.rows.clean.len() + out.rows.quarantined.len()) as u64
        );
    }

    #[test]
    fn raw_payload_is_kept_verbatim() {
        let out = route(
            "sales.csv",
            "ListingKey,LastUpdated\nK1,\"2024-01-01\"x\n",
        );
        assert_eq!(out.rows.quarantined[0].raw_payload, "K1,\"2024-01-01\"x");
        assert_eq!(out.rows.quarantined[0].reason, QuarantineReason::BadQuote);
    }

    #[test]
    fn missing_header_column_quarantines_every_row() {
        let out = route("sales.csv", "ListingKey,Zip\nK1,77024\nK2,77005\n");
        assert_eq!(out.rows.quarantined.len(), 2);
        assert!(out
            .rows
            .quarantined
            .iter()
            .all(|row| row.reason == QuarantineReason::MissingRequiredCol));
        assert!(out.rows.quarantined[0].detail.contains("matrix_modified_dt"));
    }

    #[test]
    fn domain_sources_are_ordered() {
        let out = route(
            "raw/rentals/export.csv",
            "ListingKey,LastUpdated,Domain,PropertyType\n\
             K1,2024-01-01T00:00:00Z,SALE,Lease\n\
             K2,2024-01-01T00:00:00Z,SALE,\n\
             K3,2024-01-01T00:00:00Z,,\n",
        );
        let domains: Vec<_> = out.rows.clean.iter().map(|r| r.identity.domain).collect();
        assert_eq!(domains, vec![Domain::Rental, Domain::Sale, Domain::Rental]);
    }

    #[test]
    fn row_hash_is_column_order_independent() {
        let a = route(
            "sales.csv",
            "ListingKey,LastUpdated,City\nK1,2024-01-01T00:00:00Z,Houston\n",
        );
        let b = route(
            "sales.csv",
            "City,LastUpdated,ListingKey\nHouston,2024-01-01 00:00:00,K1\n",
        );
        assert_eq!(
            a.rows.clean[0].normalized_row_hash,
            b.rows.clean[0].normalized_row_hash
        );
    }

    #[test]
    fn header_only_file_has_no_rows() {
        let out = route("sales.csv", "ListingKey,LastUpdated\n");
        assert_eq!(out.rows, RoutedRows::default());
    }

    #[test]
    fn repeated_header_never_fills_the_canonical_field() {
        let out = route(
            "sales.csv",
            "ListingKey,LastUpdated,Zip,ZIP,Notes
K1,2024-01-01T00:00:00Z,,00000,x
",
        );
        let row = &out.rows.clean[0];
        assert!(!row.attributes.contains_key("zip"));
        assert_eq!(row.attributes["notes"], "x");
    }

    #[test]
    fn undecodable_rows_are_quarantined_and_neighbours_kept() {
        let mut csv = b"ListingKey,LastUpdated,City\nK1,2024-01-01T00:00:00Z,Houston\n".to_vec();
        csv.extend_from_slice(b"K2,2024-01-01T00:00:00Z,Hou\xffston\n");
        csv.extend_from_slice(b"K3,2024-01-01T00:00:00Z,Katy\n");
        let out = route_csv(
            &SchemaSpec::listing_default(),
            Cursor::new(csv),
            &context("sales.csv"),
        )
        .expect("route");

        assert!(out.fatal.is_none());
        assert_eq!(out.rows.total, 3);
        assert_eq!(out.rows.clean.len(), 2);
        let bad = &out.rows.quarantined[0];
        assert_eq!(bad.source_row_ordinal, 2);
        assert_eq!(bad.reason, QuarantineReason::Other);
        assert!(bad.detail.contains("UTF-8"), "{}", bad.detail);
    }
}

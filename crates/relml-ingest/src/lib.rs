//! Source-side ingestion: schema binding, CSV records, row validation/normalization and image
//! bundle entries. Nothing here touches storage except through the hashing helpers.

mod images;
mod resolve;
mod rows;
mod schema;
mod validate;

pub use images::{
    parse_image_filename, FilenameError, ImageBundle, ImageEntry, ImageName, ImageSourceError,
    IMAGE_EXTENSIONS,
};
pub use resolve::{
    domain_from_path, domain_from_property_type, format_timestamp, normalize_zip,
    normalized_row_hash, parse_decimal, parse_integer, parse_timestamp, ZipOutcome,
};
pub use rows::{parse_record, CsvRowSource, QuoteError, RawRecord, RecordError, RowSourceError};
pub use schema::{
    normalize_header, ColumnBinding, FieldKind, FieldSpec, HeaderBinding, SchemaError, SchemaSpec,
};
pub use validate::{
    route_csv, route_records, RouteOutcome, RoutedRows, RowContext, RowValidator, RowVerdict,
};

pub const CRATE_NAME: &str = "relml-ingest";

//! Single-pass CSV record source. Quoting problems are reported per record so the router can
//! quarantine them; only I/O failures end the stream.

use std::io::BufRead;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuoteError {
    #[error("unterminated quoted field")]
    Unterminated,
    #[error("stray quote in unquoted field {0}")]
    StrayQuote(usize),
    #[error("unexpected text after closing quote in field {0}")]
    TextAfterQuote(usize),
}

/// Why a single record could not be split into fields.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error(transparent)]
    Quote(#[from] QuoteError),
    #[error("record is not valid UTF-8 (invalid byte at offset {valid_up_to})")]
    Encoding { valid_up_to: usize },
}

#[derive(Debug, Error)]
pub enum RowSourceError {
    #[error("reading csv header: {0}")]
    Header(#[source] std::io::Error),
    #[error("csv header is malformed: {0}")]
    MalformedHeader(RecordError),
    #[error("reading csv record {ordinal}: {source}")]
    Read {
        ordinal: u64,
        #[source]
        source: std::io::Error,
    },
}

impl RowSourceError {
    pub fn kind(&self) -> &'static str {
        match self {
            RowSourceError::Header(_) => "header_unreadable",
            RowSourceError::MalformedHeader(_) => "header_malformed",
            RowSourceError::Read { .. } => "read_error",
        }
    }
}

/// One logical CSV record. `raw` is the verbatim text without the final line terminator;
/// undecodable bytes appear as U+FFFD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// 1-based position among data records; blank lines are not counted.
    pub ordinal: u64,
    pub raw: String,
    pub fields: Result<Vec<String>, RecordError>,
}

#[derive(Clone, Copy)]
enum State {
    FieldStart,
    Unquoted,
    Quoted,
    QuoteInQuoted,
}

/// Split one logical record. Returns `None` while a quoted field is still open.
pub fn parse_record(text: &str) -> Option<Result<Vec<String>, QuoteError>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut state = State::FieldStart;
    let mut error = None;

    for ch in text.chars() {
        state = match (state, ch) {
            (State::FieldStart, '"') => State::Quoted,
            (State::FieldStart | State::Unquoted | State::QuoteInQuoted, ',') => {
                fields.push(std::mem::take(&mut current));
                State::FieldStart
            }
            (State::FieldStart | State::Unquoted, c) => {
                if c == '"' && error.is_none() {
                    error = Some(QuoteError::StrayQuote(fields.len() + 1));
                }
                current.push(c);
                State::Unquoted
            }
            (State::Quoted, '"') => State::QuoteInQuoted,
            (State::Quoted, c) => {
                current.push(c);
                State::Quoted
            }
            (State::QuoteInQuoted, '"') => {
                current.push('"');
                State::Quoted
            }
            (State::QuoteInQuoted, c) => {
                if error.is_none() {
                    error = Some(QuoteError::TextAfterQuote(fields.len() + 1));
                }
                current.push(c);
                State::Unquoted
            }
        };
    }

    if matches!(state, State::Quoted) {
        return None;
    }
    fields.push(current);
    Some(match error {
        Some(err) => Err(err),
        None => Ok(fields),
    })
}

fn strip_terminator(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    &buf[..end]
}

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

type LogicalRecord = (String, Result<Vec<String>, RecordError>);

fn decode_record(bytes: &[u8], fields: Result<Vec<String>, QuoteError>) -> LogicalRecord {
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), fields.map_err(RecordError::from)),
        Err(err) => (
            String::from_utf8_lossy(bytes).into_owned(),
            Err(RecordError::Encoding {
                valid_up_to: err.valid_up_to(),
            }),
        ),
    }
}

pub struct CsvRowSource<R> {
    reader: R,
    header: Vec<String>,
    next_ordinal: u64,
    finished: bool,
}

impl<R: BufRead> CsvRowSource<R> {
    /// Reads the header eagerly. An empty input yields an empty header and no records.
    pub fn new(mut reader: R) -> Result<Self, RowSourceError> {
        let header = match read_logical_record(&mut reader, true).map_err(RowSourceError::Header)? {
            None => Vec::new(),
            Some((_, fields)) => fields
                .map_err(RowSourceError::MalformedHeader)?
                .into_iter()
                .map(|name| name.trim().to_string())
                .collect(),
        };
        Ok(Self {
            reader,
            header,
            next_ordinal: 1,
            finished: false,
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }
}

/// Reads physical lines until a record closes or input ends. Blank lines between records are
/// skipped.
fn read_logical_record<R: BufRead>(
    reader: &mut R,
    strip_bom: bool,
) -> std::io::Result<Option<LogicalRecord>> {
    let mut buf = Vec::new();
    loop {
        let read = reader.read_until(b'\n', &mut buf)?;
        if strip_bom && buf.starts_with(UTF8_BOM) {
            buf.drain(..UTF8_BOM.len());
        }
        let bytes = strip_terminator(&buf);
        if read == 0 {
            if bytes.is_empty() {
                return Ok(None);
            }
            return Ok(Some(decode_record(bytes, Err(QuoteError::Unterminated))));
        }
        if bytes.is_empty() {
            buf.clear();
            continue;
        }
        // Quote structure is ASCII, so a lossy view finds record boundaries.
        if let Some(fields) = parse_record(&String::from_utf8_lossy(bytes)) {
            return Ok(Some(decode_record(bytes, fields)));
        }
    }
}

impl<R: BufRead> Iterator for CsvRowSource<R> {
    type Item = Result<RawRecord, RowSourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let ordinal = self.next_ordinal;
        match read_logical_record(&mut self.reader, false) {
            Ok(Some((raw, fields))) => {
                self.next_ordinal += 1;
                Some(Ok(RawRecord {
                    ordinal,
                    raw,
                    fields,
                }))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(source) => {
                self.finished = true;
                Some(Err(RowSourceError::Read { ordinal, source }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor, Read};

    fn source(text: &str) -> CsvRowSource<Cursor<Vec<u8>>> {
        CsvRowSource::new(Cursor::new(text.as_bytes().to_vec())).expect("header")
    }

    #[test]
    fn splits_plain_and_quoted_fields() {
        assert_eq!(
            parse_record(r#"a,"b,c","say ""hi""",,"#),
            Some(Ok(vec![
                "a".to_string(),
                "b,c".to_string(),
                r#"say "hi""#.to_string(),
                String::new(),
                String::new(),
            ]))
        );
    }

    #[test]
    fn reports_quote_problems() {
        assert_eq!(
            parse_record(r#"a,b"c,d"#),
            Some(Err(QuoteError::StrayQuote(2)))
        );
        assert_eq!(
            parse_record(r#"a,"b"x,d"#),
            Some(Err(QuoteError::TextAfterQuote(2)))
        );
        assert_eq!(parse_record(r#"a,"open"#), None);
    }

    #[test]
    fn header_strips_bom_and_whitespace() {
        let rows = source("\u{feff}ListingKey , Zip\nK1,77024\n");
        assert_eq!(rows.header(), ["ListingKey", "Zip"]);

        let quoted = source("\u{feff}\"MLS#\",\"Zip Code\"\n");
        assert_eq!(quoted.header(), ["MLS#", "Zip Code"]);
    }

    #[test]
    fn quoted_newlines_stay_in_one_record() {
        let records: Vec<_> = source("k,notes\r\nK1,\"line one\nline two\"\r\nK2,x\r\n")
            .collect::<Result<_, _>>()
            .expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].ordinal, 1);
        assert_eq!(records[0].raw, "K1,\"line one\nline two\"");
        assert_eq!(
            records[0].fields,
            Ok(vec!["K1".to_string(), "line one\nline two".to_string()])
        );
        assert_eq!(records[1].ordinal, 2);
    }

    #[test]
    fn unterminated_quote_at_eof_is_a_record_error() {
        let records: Vec<_> = source("k,notes\nK1,ok\nK2,\"never closed\nmore\n")
            .collect::<Result<_, _>>()
            .expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(
            records[1].fields,
            Err(RecordError::Quote(QuoteError::Unterminated))
        );
        assert_eq!(records[1].raw, "K2,\"never closed\nmore");
    }

    #[test]
    fn blank_lines_are_skipped_and_empty_input_has_no_header() {
        let records: Vec<_> = source("k\n\nK1\n\n\nK2\n")
            .collect::<Result<_, _>>()
            .expect("records");
        assert_eq!(
            records.iter().map(|r| r.ordinal).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let empty = source("");
        assert!(empty.header().is_empty());
        assert_eq!(empty.count(), 0);
    }

    struct FailAfter {
        data: Cursor<Vec<u8>>,
    }

    impl Read for FailAfter {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.data.read(buf)?;
            if n == 0 {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
            }
            Ok(n)
        }
    }

    #[test]
    fn io_errors_end_the_stream() {
        let reader = BufReader::new(FailAfter {
            data: Cursor::new(b"k\nK1\n".to_vec()),
        });
        let mut rows = CsvRowSource::new(reader).expect("header");
        assert!(rows.next().expect("first").is_ok());
        let err = rows.next().expect("second").expect_err("io error");
        assert!(matches!(err, RowSourceError::Read { ordinal: 2, .. }));
        assert!(rows.next().is_none());
    }

    #[test]
    fn malformed_header_is_fatal() {
        let err = CsvRowSource::new(Cursor::new(b"a\"b,c\n".to_vec())).err();
        assert!(matches!(
            err,
            Some(RowSourceError::MalformedHeader(RecordError::Quote(
                QuoteError::StrayQuote(1)
            )))
        ));
    }

    #[test]
    fn invalid_utf8_is_a_record_error_and_reading_continues() {
        let mut bytes = b"k,v\nK1,ok\nK2,\xff\xfe\nK3,fine\n".to_vec();
        bytes.extend_from_slice(b"K4,\"still \xc3\x28 quoted\"\n");
        let records: Vec<_> = CsvRowSource::new(Cursor::new(bytes))
            .expect("header")
            .collect::<Result<_, _>>()
            .expect("records");

        assert_eq!(records.len(), 4);
        assert!(records[0].fields.is_ok());
        assert_eq!(
            records[1].fields,
            Err(RecordError::Encoding { valid_up_to: 3 })
        );
        assert_eq!(records[1].raw, "K2,\u{fffd}\u{fffd}");
        assert_eq!(
            records[2].fields,
            Ok(vec!["K3".to_string(), "fine".to_string()])
        );
        assert!(matches!(
            records[3].fields,
            Err(RecordError::Encoding { .. })
        ));
    }
}

//! Parser for kernel enumeration output.
//!
//! One line per table, produced by an `iter/bpf_map` program:
//!
//! ```text
//!   12 my_table               1024         37
//! ```
//!
//! Fields are `id name capacity cardinality`, whitespace separated. The
//! producer prints `"%4u %-16s %10d %10lld"`, so an unnamed table leaves the
//! name column blank: a line with three fields is accepted only when the gap
//! after the id spans the whole name column. Kernel table names never contain
//! spaces. Otherwise parsing is strict: any other field count or an
//! unparsable number is an error, and one bad line rejects the whole output.

use serde::Serialize;
use tc_common::{TableId, TableName};
use thiserror::Error;

use crate::publish::pressure;

/// One table's ground-truth census as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CensusLine {
    pub id: TableId,
    pub name: TableName,
    pub capacity: u32,
    pub cardinality: u64,
}

impl CensusLine {
    pub fn pressure(&self) -> f64 {
        pressure(self.cardinality, self.capacity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollLineError {
    #[error("expected 4 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("negative cardinality {0}")]
    NegativeCardinality(i64),
}

/// Enumeration output that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line_no}: {source}")]
pub struct CensusParseError {
    pub line_no: usize,
    #[source]
    pub source: PollLineError,
}

impl From<CensusParseError> for tc_common::Error {
    fn from(err: CensusParseError) -> Self {
        tc_common::Error::MalformedCensusLine {
            line_no: err.line_no,
            reason: err.source.to_string(),
        }
    }
}

/// Width of the producer's left-justified name column.
const NAME_COLUMN: usize = 16;

/// True when the text following `id` is a blank name column.
fn name_column_blank(line: &str, id: &str) -> bool {
    let after = &line.trim_start()[id.len()..];
    let gap = after.len() - after.trim_start().len();
    gap > NAME_COLUMN
}

fn number<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, PollLineError> {
    value.parse().map_err(|_| PollLineError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Parse a single non-blank line.
pub fn parse_census_line(line: &str) -> Result<CensusLine, PollLineError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let (id, name, capacity, cardinality) = match fields[..] {
        [id, name, capacity, cardinality] => (id, name, capacity, cardinality),
        [id, capacity, cardinality] if name_column_blank(line, id) => {
            (id, "", capacity, cardinality)
        }
        _ => return Err(PollLineError::FieldCount(fields.len())),
    };

    let cardinality: i64 = number("cardinality", cardinality)?;
    if cardinality < 0 {
        return Err(PollLineError::NegativeCardinality(cardinality));
    }

    Ok(CensusLine {
        id: TableId(number("id", id)?),
        name: TableName::new(name),
        capacity: number("capacity", capacity)?,
        cardinality: cardinality as u64,
    })
}

/// Parse a whole enumeration output. Blank lines are ignored.
pub fn parse_census_output(output: &str) -> Result<Vec<CensusLine>, CensusParseError> {
    output
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            parse_census_line(line).map_err(|source| CensusParseError {
                line_no: idx + 1,
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        let line = parse_census_line("12 my_table 1024 37").unwrap();
        assert_eq!(line.id, TableId(12));
        assert_eq!(line.name.as_str(), "my_table");
        assert_eq!(line.capacity, 1024);
        assert_eq!(line.cardinality, 37);
        assert_eq!(line.pressure(), 37.0 / 1024.0);
    }

    #[test]
    fn test_parse_padded_line() {
        let line = parse_census_line("  12 my_table               1024         37").unwrap();
        assert_eq!(line.id, TableId(12));
        assert_eq!(line.cardinality, 37);
    }

    #[test]
    fn test_missing_field_rejected() {
        assert_eq!(
            parse_census_line("12 my_table 1024"),
            Err(PollLineError::FieldCount(3))
        );
        assert_eq!(
            parse_census_line("12 my_table 1024 37 9"),
            Err(PollLineError::FieldCount(5))
        );
    }

    #[test]
    fn test_unnamed_table_line() {
        let raw = format!("{:>4} {:<16} {:>10} {:>10}", 8, "", 64, 2);
        let line = parse_census_line(&raw).unwrap();
        assert_eq!(line.id, TableId(8));
        assert!(line.name.is_empty());
        assert_eq!(line.capacity, 64);
        assert_eq!(line.cardinality, 2);
    }

    #[test]
    fn test_short_gap_is_not_a_blank_name() {
        // Three fields separated by ordinary spacing are still a missing field.
        assert_eq!(
            parse_census_line("   8 64 2"),
            Err(PollLineError::FieldCount(3))
        );
        assert!(matches!(
            parse_census_line(&format!("{:>4} {:<16} {:>10}", 8, "", 64)),
            Err(PollLineError::FieldCount(2))
        ));
    }

    #[test]
    fn test_output_with_unnamed_table() {
        let out = format!(
            "{:>4} {:<16} {:>10} {:>10}\n{:>4} {:<16} {:>10} {:>10}\n",
            7, "conn_track", 1024, 10, 8, "", 64, 2
        );
        let lines = parse_census_output(&out).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].name.as_str(), "conn_track");
        assert_eq!(lines[1].id, TableId(8));
        assert_eq!(lines[1].pressure(), 2.0 / 64.0);
    }

    #[test]
    fn test_invalid_numbers_rejected() {
        assert!(matches!(
            parse_census_line("x my_table 1024 37"),
            Err(PollLineError::InvalidNumber { field: "id", .. })
        ));
        assert!(matches!(
            parse_census_line("12 my_table -5 37"),
            Err(PollLineError::InvalidNumber { field: "capacity", .. })
        ));
        assert_eq!(
            parse_census_line("12 my_table 1024 -1"),
            Err(PollLineError::NegativeCardinality(-1))
        );
    }

    #[test]
    fn test_zero_capacity_pressure_is_sentinel() {
        let line = parse_census_line("3 ringbuf 0 0").unwrap();
        assert_eq!(line.pressure(), crate::publish::PRESSURE_UNKNOWN);
    }

    #[test]
    fn test_output_skips_blank_lines() {
        let out = "   1 a   16    2\n\n   2 b   32    4\n   \n";
        let lines = parse_census_output(out).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].capacity, 32);
    }

    #[test]
    fn test_output_rejected_on_any_bad_line() {
        let out = "1 a 16 2\n2 b 32\n3 c 8 1\n";
        let err = parse_census_output(out).unwrap_err();
        assert_eq!(err.line_no, 2);
        assert_eq!(err.source, PollLineError::FieldCount(3));

        let err: tc_common::Error = err.into();
        assert_eq!(err.code(), 21);
    }
}

//! `jstat -gc` output parsing
//!
//! The command prints a header row of column names followed by one row of
//! values. Column sets differ between JVM builds (`CGC`/`CGCT` only exist on
//! newer releases, for example), so columns are looked up by name and a
//! missing column reads as zero instead of failing the sample.

use log::debug;
use std::collections::HashMap;

use crate::error::ParseError;
use crate::samples::{GcSample, UNKNOWN_GC_TYPE};

/// Total garbage collection time, seconds
pub const GC_TIME_COLUMN: &str = "GCT";
/// Eden space utilisation, KB
pub const EDEN_USAGE_COLUMN: &str = "EU";
/// Old space utilisation, KB
pub const OLD_USAGE_COLUMN: &str = "OU";

/// Parse `jstat -gc` output into a [`GcSample`]
///
/// # Errors
///
/// Returns `ParseError` when the text has fewer than two non-empty lines.
pub fn parse_gc_stats(raw: &str) -> Result<GcSample, ParseError> {
    let mut lines = raw.lines().map(str::trim).filter(|l| !l.is_empty());

    let (Some(header), Some(values)) = (lines.next(), lines.next()) else {
        return Err(ParseError::new(
            "jstat output",
            "expected a header line and a values line",
        ));
    };

    let columns = column_map(header, values);

    Ok(GcSample {
        gc_type: UNKNOWN_GC_TYPE.to_string(),
        duration_ms: column_value(&columns, GC_TIME_COLUMN) * 1000.0,
        young_region_usage: column_value(&columns, EDEN_USAGE_COLUMN),
        old_region_usage: column_value(&columns, OLD_USAGE_COLUMN),
    })
}

/// Pair header names with values positionally
///
/// Extra names or extra values beyond the shorter row are ignored.
fn column_map<'a>(header: &'a str, values: &'a str) -> HashMap<&'a str, &'a str> {
    let names: Vec<&str> = header.split_whitespace().collect();
    let cells: Vec<&str> = values.split_whitespace().collect();
    if names.len() != cells.len() {
        debug!(
            "jstat header has {} columns but values row has {}",
            names.len(),
            cells.len()
        );
    }
    names.into_iter().zip(cells).collect()
}

fn column_value(columns: &HashMap<&str, &str>, name: &str) -> f64 {
    match columns.get(name) {
        Some(cell) => cell.parse().unwrap_or_else(|_| {
            debug!("jstat column {} has non-numeric value {:?}", name, cell);
            0.0
        }),
        None => 0.0,
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_single_line_always_fails(line: String) -> bool {
        let single: String = line.chars().filter(|c| *c != '\n').collect();
        parse_gc_stats(&single).is_err()
    }

    #[quickcheck]
    fn prop_two_lines_always_parse(header: Vec<u8>, values: Vec<u16>) -> bool {
        let names: Vec<String> = header.iter().map(|b| format!("C{}", b)).collect();
        let cells: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        let text = format!("x {}\n1 {}\n", names.join(" "), cells.join(" "));
        parse_gc_stats(&text).is_ok()
    }
}

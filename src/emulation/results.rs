use csv::{ReaderBuilder, StringRecord};

use crate::emulation::model::{TestRecord, TestSummary};
use crate::error::{DittoError, Result};
use crate::process::strip_bom;

/// Columns every row must carry; a tenth, optional column holds the error
const REQUIRED_COLUMNS: usize = 9;

/// Parse the runner's result table (header row first) into typed records and
/// their summary.
pub fn parse_results(content: &[u8]) -> Result<(TestSummary, Vec<TestRecord>)> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(strip_bom(content));

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(|e| {
            DittoError::ExternalTool(format!("failed to read CSV record: {}", e))
        })?;
        // Header is line 1
        records.push(parse_row(&row, index + 2)?);
    }

    let summary = TestSummary::from_records(&records);
    Ok((summary, records))
}

fn parse_row(row: &StringRecord, line: usize) -> Result<TestRecord> {
    if row.len() < REQUIRED_COLUMNS {
        return Err(DittoError::ExternalTool(format!(
            "malformed result row at line {}: expected at least {} columns, got {}",
            line,
            REQUIRED_COLUMNS,
            row.len()
        )));
    }
    let field = |i: usize| row.get(i).unwrap_or_default().to_string();
    Ok(TestRecord {
        timestamp: field(0),
        status: field(1),
        tactic: field(2),
        technique: field(3),
        technique_name: field(4),
        test_number: field(5),
        test_name: field(6),
        test_guid: field(7),
        executor_name: field(8),
        error_message: field(9),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "Timestamp,Status,Tactic,Technique,Technique Name,Test Number,Test Name,Test GUID,Executor Name,Error Message\n";

    fn row(status: &str) -> String {
        format!(
            "2024-01-01 10:00:00,{},discovery,T1082,System Information Discovery,1,systeminfo,9a1c,command_prompt\n",
            status
        )
    }

    #[test]
    fn ten_rows_with_seven_passes() {
        let mut csv = HEADER.to_string();
        for i in 0..10 {
            csv.push_str(&row(if i < 7 { "Pass" } else { "Fail" }));
        }
        let (summary, records) = parse_results(csv.as_bytes()).unwrap();
        assert_eq!(records.len(), 10);
        assert_eq!(summary.total_tests, 10);
        assert_eq!(summary.passed_tests, 7);
        assert_eq!(summary.failed_tests, 3);
        assert_eq!(summary.success_rate, 70.0);
    }

    #[test]
    fn optional_error_column_is_read() {
        let csv = format!(
            "{}2024-01-01 10:00:00,Fail,discovery,T1082,SID,1,systeminfo,9a1c,command_prompt,Access denied\n",
            HEADER
        );
        let (summary, records) = parse_results(csv.as_bytes()).unwrap();
        assert_eq!(summary.failed_tests, 1);
        assert_eq!(records[0].error_message, "Access denied");
        assert_eq!(records[0].technique, "T1082");
    }

    #[test]
    fn header_only_yields_empty_summary() {
        let (summary, records) = parse_results(HEADER.as_bytes()).unwrap();
        assert!(records.is_empty());
        assert_eq!(summary.success_rate, 0.0);
    }

    #[test]
    fn short_rows_are_rejected() {
        let csv = format!("{}2024-01-01,Pass,discovery\n", HEADER);
        let err = parse_results(csv.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn byte_order_mark_is_ignored() {
        let mut content = b"\xef\xbb\xbf".to_vec();
        content.extend_from_slice(HEADER.as_bytes());
        content.extend_from_slice(row("Pass").as_bytes());
        let (summary, records) = parse_results(&content).unwrap();
        assert_eq!(summary.passed_tests, 1);
        assert_eq!(records[0].timestamp, "2024-01-01 10:00:00");
    }
}

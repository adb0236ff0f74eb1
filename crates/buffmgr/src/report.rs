//! Status and consistency report rendering.

use crate::check::ConsistencyReport;
use buffmgr_db::{FileStatus, StatusReport};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, CellAlignment, Table};

pub fn render_status_table(report: &StatusReport) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["Status", "Files"]);

    for status in FileStatus::ALL {
        table.add_row(vec![
            Cell::new(status.as_str()),
            Cell::new(report.count(status)).set_alignment(CellAlignment::Right),
        ]);
    }
    if report.without_events > 0 {
        table.add_row(vec![
            Cell::new("(no events)"),
            Cell::new(report.without_events).set_alignment(CellAlignment::Right),
        ]);
    }
    table.add_row(vec![
        Cell::new("TOTAL"),
        Cell::new(report.total()).set_alignment(CellAlignment::Right),
    ]);

    table.to_string()
}

/// One row per discrepancy, followed by the totals.
pub fn render_consistency_table(report: &ConsistencyReport) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["Problem", "File id", "Path"]);

    for file in &report.missing {
        table.add_row(vec![
            Cell::new("missing from storage"),
            Cell::new(file.id).set_alignment(CellAlignment::Right),
            Cell::new(&file.path),
        ]);
    }
    for path in &report.untracked {
        table.add_row(vec![Cell::new("not tracked"), Cell::new("-"), Cell::new(path)]);
    }

    format!(
        "{}\nrecords: {}  stored: {}  missing: {}  untracked: {}  unreadable: {}",
        table,
        report.records,
        report.stored,
        report.missing.len(),
        report.untracked.len(),
        report.errors
    )
}

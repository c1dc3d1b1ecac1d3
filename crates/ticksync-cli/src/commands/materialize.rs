use ticksync_core::lookup::RunReport;
use ticksync_core::CentralSyncManager;

use crate::error::CliError;

pub async fn run_materialize(manager: &CentralSyncManager) -> Result<(), CliError> {
    let report = manager.update_lookup_table().await?;
    for line in format_report_lines(&report) {
        println!("{line}");
    }
    for failure in &report.failures {
        eprintln!(
            "{}: window [{}, {}) failed: {}",
            failure.record_type,
            failure.window.source_start_tick,
            failure.window.lookup_end_tick,
            failure.error
        );
    }
    Ok(())
}

pub fn format_report_lines(report: &RunReport) -> Vec<String> {
    let mut lines: Vec<String> = report
        .windows
        .iter()
        .filter(|window| window.rows > 0)
        .map(|window| {
            format!(
                "{:<20} [{}, {})  {} rows",
                window.record_type,
                window.window.source_start_tick,
                window.window.lookup_end_tick,
                window.rows
            )
        })
        .collect();
    lines.push(format!(
        "Materialized {} rows across {} windows",
        report.rows(),
        report.windows.len()
    ));
    lines
}

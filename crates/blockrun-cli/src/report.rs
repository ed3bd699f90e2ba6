//! Plain-text rendering of run and suite results for the console.

use blockrun_pipeline::{ExecutionResult, ExecutionSummary, SuiteReport, TestReport};

fn verdict(success: bool) -> &'static str {
    if success {
        "PASSED"
    } else {
        "FAILED"
    }
}

fn mark(success: bool) -> char {
    if success {
        '✓'
    } else {
        '✗'
    }
}

fn summary_lines(summary: &ExecutionSummary, indent: &str) -> Vec<String> {
    summary
        .results
        .iter()
        .map(|r| match &r.error {
            Some(err) => format!("{indent}{} {} ({} ms): {err}", mark(r.success), r.id, r.duration_ms),
            None => format!("{indent}{} {} ({} ms)", mark(r.success), r.id, r.duration_ms),
        })
        .collect()
}

/// One line per executed block followed by the summary counts.
pub fn render_run(name: &str, result: &ExecutionResult, summary: &ExecutionSummary) -> String {
    let mut lines = vec![format!("Pipeline: {name}")];
    lines.extend(summary_lines(summary, "  "));
    lines.push(String::new());
    lines.push(format!(
        "Blocks: {} total, {} executed, {} succeeded, {} failed",
        summary.total_blocks, summary.executed, summary.succeeded, summary.failed
    ));
    lines.push(format!("Duration: {} ms", summary.duration_ms));
    lines.push(format!("Result: {}", verdict(result.success)));
    if let Some(ref err) = result.error {
        lines.push(format!("Error: {err}"));
    }
    lines.join("\n")
}

fn test_lines(report: &TestReport) -> Vec<String> {
    let mut lines = vec![format!("{} {}", mark(report.success), report.name)];
    if let Some(ref summary) = report.summary {
        lines.extend(summary_lines(summary, "    "));
    }
    if let Some(ref err) = report.error {
        lines.push(format!("    error: {err}"));
    }
    lines
}

pub fn render_suite(report: &SuiteReport) -> String {
    let mut lines = vec![format!(
        "Suite: {}",
        report.name.as_deref().unwrap_or("<unnamed>")
    )];
    if let Some(ref setup) = report.setup {
        lines.extend(test_lines(setup));
    }
    for test in &report.tests {
        lines.extend(test_lines(test));
    }
    if let Some(ref teardown) = report.teardown {
        lines.extend(test_lines(teardown));
    }
    lines.push(String::new());
    lines.push(format!(
        "Tests: {} passed, {} failed ({} ms)",
        report.passed, report.failed, report.duration_ms
    ));
    lines.push(format!("Result: {}", verdict(report.success)));
    lines.join("\n")
}

use std::{collections::BTreeMap, fmt::Write};

use serde::Serialize;

use crate::{
    correlation::{AttackPathExplanation, CorrelationReport, Finding},
    registry::{ScanId, ScanRecord},
};

/// Format styles supported in default reporter implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

/// Render the findings of one correlation pass.
pub fn render_findings(report: &CorrelationReport, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Human => render_findings_human(report),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
    }
}

fn render_findings_human(report: &CorrelationReport) -> anyhow::Result<String> {
    let mut out = String::new();
    match report.highest_severity() {
        Some(highest) => writeln!(
            out,
            "High-risk findings: {} (highest severity: {highest})",
            report.count
        )?,
        None => writeln!(out, "High-risk findings: 0")?,
    }
    writeln!(out)?;

    if report.findings.is_empty() {
        writeln!(out, "No correlated findings.")?;
        return Ok(out);
    }

    for (index, finding) in report.findings.iter().enumerate() {
        write_finding(&mut out, index, finding)?;
    }
    Ok(out)
}

fn write_finding(out: &mut String, index: usize, finding: &Finding) -> anyhow::Result<()> {
    writeln!(
        out,
        "[{index}] {severity:<8} {title}",
        severity = finding.severity.as_str().to_uppercase(),
        title = finding.title,
    )?;
    writeln!(
        out,
        "    confidence: {} • vector: {}",
        finding.confidence, finding.attack_vector
    )?;
    let components: Vec<&str> = finding.components.iter().map(String::as_str).collect();
    writeln!(out, "    components: {}", components.join(", "))?;
    writeln!(out, "    {}", single_line(&finding.reasoning))?;
    for cited in &finding.evidence {
        if cited.sources.is_empty() {
            writeln!(out, "    evidence: {} ({})", cited.category.as_str(), cited.confidence)?;
        } else {
            writeln!(
                out,
                "    evidence: {} ({}) from {}",
                cited.category.as_str(),
                cited.confidence,
                cited.sources.join(", ")
            )?;
        }
    }
    writeln!(out)?;
    Ok(())
}

pub fn render_explanation(
    explanation: &AttackPathExplanation,
    format: OutputFormat,
) -> anyhow::Result<String> {
    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(explanation)?);
    }
    let mut out = String::new();
    writeln!(out, "Attack path: {}", explanation.title)?;
    writeln!(
        out,
        "  Severity: {} • Confidence: {}",
        explanation.severity, explanation.confidence
    )?;
    writeln!(out, "  Vector: {}", explanation.attack_vector)?;
    if let Some(entry) = &explanation.entry_point {
        writeln!(out, "  Entry point: {entry}")?;
    }
    writeln!(out, "  Exploit class: {}", explanation.exploit_class)?;
    if let Some(effort) = explanation.attacker_effort {
        writeln!(out, "  Attacker effort: {}", effort.as_str())?;
    }
    if !explanation.preconditions.is_empty() {
        writeln!(out, "  Preconditions:")?;
        for item in &explanation.preconditions {
            writeln!(out, "    - {item}")?;
        }
    }
    if let Some(impact) = &explanation.impact {
        writeln!(out, "  Impact: {impact}")?;
    }
    writeln!(out, "  Rationale: {}", single_line(&explanation.rationale))?;
    Ok(out)
}

#[derive(Debug, Serialize)]
struct JsonScans<'a> {
    count: usize,
    scans: &'a BTreeMap<ScanId, ScanRecord>,
}

/// Render registry records, oldest first in human form.
pub fn render_scans(
    scans: &BTreeMap<ScanId, ScanRecord>,
    format: OutputFormat,
) -> anyhow::Result<String> {
    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(&JsonScans {
            count: scans.len(),
            scans,
        })?);
    }
    let mut out = String::new();
    if scans.is_empty() {
        writeln!(out, "No scans recorded.")?;
        return Ok(out);
    }
    let mut records: Vec<&ScanRecord> = scans.values().collect();
    records.sort_by_key(|record| record.started_at);
    for record in records {
        writeln!(
            out,
            "{id}  {status:<8}  {started}  {firmware}",
            id = record.scan_id,
            status = record.status.as_str(),
            started = record.started_at.format("%Y-%m-%d %H:%M:%S"),
            firmware = record.firmware.display(),
        )?;
    }
    Ok(out)
}

pub fn render_scan(record: &ScanRecord, format: OutputFormat) -> anyhow::Result<String> {
    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(record)?);
    }
    let mut out = String::new();
    writeln!(out, "Scan {}", record.scan_id)?;
    writeln!(out, "  Status:   {}", record.status)?;
    writeln!(out, "  Firmware: {}", record.firmware.display())?;
    writeln!(out, "  Log dir:  {}", record.log_dir.display())?;
    writeln!(out, "  Started:  {}", record.started_at.to_rfc3339())?;
    if let Some(finished) = record.finished_at {
        let elapsed = (finished - record.started_at).num_seconds().max(0);
        writeln!(
            out,
            "  Finished: {} (after {}s)",
            finished.to_rfc3339(),
            elapsed
        )?;
    }
    if let Some(pid) = record.pid {
        writeln!(out, "  PID:      {pid}")?;
    }
    if let Some(error) = &record.error {
        writeln!(out, "  Error:")?;
        for line in error.lines() {
            writeln!(out, "    {line}")?;
        }
    }
    Ok(out)
}

fn single_line(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            _ => c,
        })
        .collect()
}

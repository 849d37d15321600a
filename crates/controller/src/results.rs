//! Structured test results and outcome resolution
//!
//! A test command's exit code is not a reliable verdict: a reporter or
//! coverage step can exit non-zero after every test passed. When a
//! machine-readable report exists, its failure and error counters decide.

use regex::Regex;
use std::path::Path;
use tracing::{debug, warn};

use testenv_common::{
    ExitCodePolicy, Result, ResultFormat, RunOutcome, StructuredResult, StructuredResultSpec,
};

/// Read the structured result from the output directory. `Ok(None)` when the
/// report is missing or carries no counters.
pub fn load_structured_result(
    spec: &StructuredResultSpec,
    output_dir: &Path,
) -> Result<Option<StructuredResult>> {
    let path = output_dir.join(&spec.path);
    if !path.exists() {
        debug!("No structured result at {}", path.display());
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let parsed = match spec.format {
        ResultFormat::Junit => parse_junit(&content),
        ResultFormat::Json => parse_json(&content, spec)?,
    };
    if parsed.is_none() {
        warn!("{} has no recognisable test counters", path.display());
    }
    Ok(parsed)
}

/// Counters from a JUnit XML report. A `<testsuites>` root carrying totals
/// wins; otherwise `<testsuite>` elements are summed. A counter that does not
/// fit in a `u64` makes the whole report unreadable.
pub fn parse_junit(xml: &str) -> Option<StructuredResult> {
    let root = Regex::new(r"<testsuites\b([^>]*)>").ok()?;
    let suite = Regex::new(r"<testsuite\b([^>]*)>").ok()?;

    if let Some(caps) = root.captures(xml) {
        if let Some(result) = counters(&caps[1])? {
            return Some(result);
        }
    }

    let mut total: Option<StructuredResult> = None;
    for caps in suite.captures_iter(xml) {
        if let Some(result) = counters(&caps[1])? {
            let sum = total.get_or_insert_with(StructuredResult::default);
            sum.tests = sum.tests.saturating_add(result.tests);
            sum.failures = sum.failures.saturating_add(result.failures);
            sum.errors = sum.errors.saturating_add(result.errors);
            sum.skipped = sum.skipped.saturating_add(result.skipped);
        }
    }
    total
}

/// Counter attributes of one element. `Some(None)` when neither `failures`
/// nor `errors` is present, `None` when a counter is out of range.
fn counters(attrs: &str) -> Option<Option<StructuredResult>> {
    let attr = Regex::new(r#"\b(tests|failures|errors|skipped)\s*=\s*"(\d+)""#).ok()?;
    let mut result = StructuredResult::default();
    let mut seen = false;
    for caps in attr.captures_iter(attrs) {
        let value: u64 = match caps[2].parse() {
            Ok(value) => value,
            Err(e) => {
                warn!("JUnit counter {}=\"{}\" unreadable: {}", &caps[1], &caps[2], e);
                return None;
            }
        };
        match &caps[1] {
            "tests" => result.tests = value,
            "failures" => {
                result.failures = value;
                seen = true;
            }
            "errors" => {
                result.errors = value;
                seen = true;
            }
            "skipped" => result.skipped = value,
            _ => {}
        }
    }
    Some(seen.then_some(result))
}

/// Counters from a JSON report, located by the configured JSON pointers.
pub fn parse_json(json: &str, spec: &StructuredResultSpec) -> Result<Option<StructuredResult>> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let read = |pointer: &str| value.pointer(pointer).and_then(|v| v.as_u64());

    let failures = read(&spec.failures_pointer);
    let errors = read(&spec.errors_pointer);
    if failures.is_none() && errors.is_none() {
        return Ok(None);
    }
    Ok(Some(StructuredResult {
        tests: read(&spec.tests_pointer).unwrap_or(0),
        failures: failures.unwrap_or(0),
        errors: errors.unwrap_or(0),
        skipped: 0,
    }))
}

/// Decide pass/fail from the exit code and the structured result.
pub fn resolve_outcome(
    policy: ExitCodePolicy,
    exit_code: i32,
    structured: Option<&StructuredResult>,
) -> RunOutcome {
    match (policy, structured) {
        (ExitCodePolicy::PreferStructured, Some(result)) => {
            if result.is_clean() {
                if exit_code != 0 {
                    warn!(
                        "Test command exited {} but the report shows no failures; treating as passed",
                        exit_code
                    );
                }
                RunOutcome::Passed
            } else {
                RunOutcome::Failed {
                    failures: result.failures,
                    errors: result.errors,
                    exit_code: Some(exit_code),
                }
            }
        }
        (_, structured) => {
            if exit_code == 0 {
                RunOutcome::Passed
            } else {
                RunOutcome::Failed {
                    failures: structured.map(|r| r.failures).unwrap_or(0),
                    errors: structured.map(|r| r.errors).unwrap_or(0),
                    exit_code: Some(exit_code),
                }
            }
        }
    }
}

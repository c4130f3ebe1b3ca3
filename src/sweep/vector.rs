//! Sweep-vector expression parser.
//!
//! Operators describe the settings of a sweep axis as a small expression:
//! a literal list `[0, 4, 8]`, a `range(...)` call with 1-3 integer
//! arguments, or the dash grammar `start-stop` with an optional `:steps`
//! (total count) or `;stepsize` suffix. Anything else is rejected with a
//! fixed message; the parser never panics on operator input.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// The single, operator-facing rejection message.
pub const INVALID_EXPRESSION: &str = "Invalid Expression";

/// Rejection of a sweep-vector expression. Displays as the fixed
/// operator-facing text regardless of which rule failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{INVALID_EXPRESSION}")]
pub struct SweepVectorError;

/// `start-stop`, `start-stop:steps`, `start-stop;stepsize`.
#[allow(clippy::expect_used)]
fn dash_regex() -> &'static Regex {
    static DASH: OnceLock<Regex> = OnceLock::new();
    DASH.get_or_init(|| {
        Regex::new(r"^\s*(\d+)\s*-\s*(\d+)\s*(?:([:;])\s*(\d+)\s*)?$")
            .expect("static regex is valid")
    })
}

/// Parse a sweep expression into an ordered settings vector.
///
/// The order of the returned settings is program order; callers must not
/// sort it. An empty literal list `[]` parses successfully; guarding
/// against zero-length sweeps is the caller's job.
pub fn parse_sweep_vector(input: &str) -> Result<Vec<i64>, SweepVectorError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SweepVectorError);
    }
    if trimmed.starts_with('[') {
        return parse_list(trimmed);
    }
    if trimmed.starts_with("range") {
        return parse_range_call(trimmed);
    }
    parse_dash(trimmed)
}

fn parse_list(input: &str) -> Result<Vec<i64>, SweepVectorError> {
    let inner = input
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or(SweepVectorError)?;
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|item| item.trim().parse::<i64>().map_err(|_| SweepVectorError))
        .collect()
}

fn parse_range_call(input: &str) -> Result<Vec<i64>, SweepVectorError> {
    let inner = input
        .strip_prefix("range")
        .map(str::trim_start)
        .and_then(|s| s.strip_prefix('('))
        .and_then(|s| s.strip_suffix(')'))
        .ok_or(SweepVectorError)?;
    let args: Vec<i64> = inner
        .split(',')
        .map(|item| item.trim().parse::<i64>().map_err(|_| SweepVectorError))
        .collect::<Result<_, _>>()?;
    let (start, stop, step) = match args.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(SweepVectorError),
    };
    if step == 0 {
        return Err(SweepVectorError);
    }
    let mut settings = Vec::new();
    let mut value = start;
    while (step > 0 && value < stop) || (step < 0 && value > stop) {
        settings.push(value);
        value += step;
    }
    Ok(settings)
}

fn parse_dash(input: &str) -> Result<Vec<i64>, SweepVectorError> {
    let captures = dash_regex().captures(input).ok_or(SweepVectorError)?;
    let start: i64 = captures[1].parse().map_err(|_| SweepVectorError)?;
    let stop: i64 = captures[2].parse().map_err(|_| SweepVectorError)?;

    match (captures.get(3).map(|m| m.as_str()), captures.get(4)) {
        // start-stop;stepsize: walk inclusively by the given step.
        (Some(";"), Some(step)) => {
            let step: i64 = step.as_str().parse().map_err(|_| SweepVectorError)?;
            if step == 0 {
                return Err(SweepVectorError);
            }
            Ok(inclusive_walk(start, stop, step))
        }
        // start-stop:steps: exactly `steps` evenly spaced settings.
        (Some(":"), Some(steps)) => {
            let steps: i64 = steps.as_str().parse().map_err(|_| SweepVectorError)?;
            if steps <= 1 {
                return Ok(vec![start]);
            }
            let span = (stop - start) as f64;
            let count = steps as usize;
            Ok((0..count)
                .map(|i| start + (span * i as f64 / (count - 1) as f64).round() as i64)
                .collect())
        }
        _ => Ok(inclusive_walk(start, stop, 1)),
    }
}

/// Append `start`, `start+step`, ... stopping once `stop` is reached or
/// passed (the last appended value may equal or exceed `stop`).
fn inclusive_walk(start: i64, stop: i64, step: i64) -> Vec<i64> {
    let mut settings = Vec::new();
    let mut value = start;
    loop {
        settings.push(value);
        if value >= stop {
            break;
        }
        value += step;
    }
    settings
}

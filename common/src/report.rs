//! Formato de las líneas de log de una invocación.
//!
//! El host de funciones las escribe y el agregador del master las parsea,
//! así que ambos lados usan este módulo.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::filename::TIME_WIDTH;
use crate::job::TimeStep;

pub const START: &str = "START";
pub const END: &str = "END";
pub const REPORT: &str = "REPORT";
pub const GRANULE_FAILURES: &str = "GRANULE_FAILURES";
pub const ERROR: &str = "ERROR";
const TIMED_OUT: &str = "Task timed out after";
const REQUEST_ID: &str = "RequestId:";

/// Patrón por defecto del agregador: todo lo que cierra o marca fallos.
pub const DEFAULT_FILTER_PATTERN: &str = "?REPORT ?GRANULE_FAILURES ?ERROR ?\"Task timed out\"";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub duration_ms: f64,
    pub billed_duration_ms: u64,
    pub memory_size_mb: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_used_mb: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogLine {
    Start { id: String },
    End { id: String },
    Report { id: String, report: PerformanceReport },
    GranuleFailures { id: String, time_steps: BTreeSet<TimeStep> },
    TimedOut { id: String, seconds: f64 },
    Error { id: String, message: String },
}

impl LogLine {
    pub fn invocation_id(&self) -> &str {
        match self {
            LogLine::Start { id }
            | LogLine::End { id }
            | LogLine::Report { id, .. }
            | LogLine::GranuleFailures { id, .. }
            | LogLine::TimedOut { id, .. }
            | LogLine::Error { id, .. } => id,
        }
    }
}

/* --------- Formateo --------- */

pub fn format_start(id: &str) -> String {
    format!("{START} {REQUEST_ID} {id} Version: $LATEST")
}

pub fn format_end(id: &str) -> String {
    format!("{END} {REQUEST_ID} {id}")
}

pub fn format_report(id: &str, r: &PerformanceReport) -> String {
    let mut line = format!(
        "{REPORT} {REQUEST_ID} {id}\tDuration: {:.2} ms\tBilled Duration: {} ms\tMemory Size: {} MB",
        r.duration_ms, r.billed_duration_ms, r.memory_size_mb
    );
    if let Some(used) = r.max_memory_used_mb {
        line.push_str(&format!("\tMax Memory Used: {} MB", used));
    }
    if let Some(init) = r.init_duration_ms {
        line.push_str(&format!("\tInit Duration: {:.2} ms", init));
    }
    line
}

pub fn format_failures(id: &str, time_steps: &BTreeSet<TimeStep>) -> String {
    let padded: Vec<String> = time_steps
        .iter()
        .map(|t| format!("{:0width$}", t, width = TIME_WIDTH))
        .collect();
    let json = serde_json::to_string(&padded).unwrap_or_else(|_| "[]".to_string());
    format!("{GRANULE_FAILURES} {REQUEST_ID} {id}\t{json}")
}

pub fn format_timed_out(id: &str, seconds: f64) -> String {
    format!("{id} {TIMED_OUT} {seconds:.2} seconds")
}

pub fn format_error(id: &str, message: &str) -> String {
    // una sola línea por evento
    let message = message.replace(['\n', '\r'], " ");
    format!("{ERROR} {REQUEST_ID} {id}\t{message}")
}

/* --------- Parseo --------- */

/// `"<KIND> RequestId: <id>..."` -> (id, resto después del id)
fn split_request(rest: &str) -> Option<(&str, &str)> {
    let rest = rest.trim_start().strip_prefix(REQUEST_ID)?.trim_start();
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    let id = &rest[..end];
    if id.is_empty() {
        return None;
    }
    Some((id, &rest[end..]))
}

fn field<'a>(fields: &[(&'a str, &'a str)], key: &str) -> Option<&'a str> {
    fields
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| *v)
}

fn number_before_unit(value: &str) -> Option<f64> {
    value.split_whitespace().next()?.parse::<f64>().ok()
}

fn parse_report(id: &str, rest: &str) -> Option<LogLine> {
    let fields: Vec<(&str, &str)> = rest
        .split('\t')
        .filter_map(|part| part.split_once(':'))
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let duration_ms = number_before_unit(field(&fields, "Duration")?)?;
    let billed = number_before_unit(field(&fields, "Billed Duration")?)?;
    let memory = number_before_unit(field(&fields, "Memory Size")?)?;
    let used = field(&fields, "Max Memory Used").and_then(number_before_unit);
    let init = field(&fields, "Init Duration").and_then(number_before_unit);

    Some(LogLine::Report {
        id: id.to_string(),
        report: PerformanceReport {
            duration_ms,
            billed_duration_ms: billed.ceil() as u64,
            memory_size_mb: memory as u32,
            max_memory_used_mb: used.map(|u| u as u32),
            init_duration_ms: init,
        },
    })
}

fn parse_failures(id: &str, rest: &str) -> Option<LogLine> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(rest.trim()).ok()?;
    let mut time_steps = BTreeSet::new();
    for v in raw {
        let t = match v {
            serde_json::Value::Number(n) => n.as_u64()?,
            serde_json::Value::String(s) => s.trim().parse().ok()?,
            _ => return None,
        };
        time_steps.insert(t);
    }
    Some(LogLine::GranuleFailures {
        id: id.to_string(),
        time_steps,
    })
}

/// Parsea un mensaje de log. Las líneas que no son del protocolo dan `None`.
pub fn parse_line(message: &str) -> Option<LogLine> {
    let message = message.trim_end();
    let (kind, rest) = message.split_once(' ')?;

    match kind {
        START => split_request(rest).map(|(id, _)| LogLine::Start { id: id.to_string() }),
        END => split_request(rest).map(|(id, _)| LogLine::End { id: id.to_string() }),
        REPORT => split_request(rest).and_then(|(id, tail)| parse_report(id, tail)),
        GRANULE_FAILURES => split_request(rest).and_then(|(id, tail)| parse_failures(id, tail)),
        ERROR => split_request(rest).map(|(id, tail)| LogLine::Error {
            id: id.to_string(),
            message: tail.trim().to_string(),
        }),
        id => {
            let secs = rest.strip_prefix(TIMED_OUT)?.trim();
            let secs = number_before_unit(secs)?;
            Some(LogLine::TimedOut {
                id: id.to_string(),
                seconds: secs,
            })
        }
    }
}

/* --------- Filtro de eventos --------- */

/// Patrón estilo filtro de logs: `?A ?B` es OR, `A B` es AND,
/// y los términos entre comillas pueden tener espacios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPattern {
    any: Vec<String>,
    all: Vec<String>,
}

impl FilterPattern {
    pub fn parse(pattern: &str) -> Self {
        let mut any = Vec::new();
        let mut all = Vec::new();

        for term in tokenize(pattern) {
            match term.strip_prefix('?') {
                Some(t) => any.push(unquote(t)),
                None => all.push(unquote(&term)),
            }
        }

        Self { any, all }
    }

    pub fn matches(&self, message: &str) -> bool {
        let any_ok = self.any.is_empty() || self.any.iter().any(|t| message.contains(t.as_str()));
        let all_ok = self.all.iter().all(|t| message.contains(t.as_str()));
        any_ok && all_ok
    }
}

fn unquote(term: &str) -> String {
    term.trim_matches('"').to_string()
}

fn tokenize(pattern: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in pattern.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

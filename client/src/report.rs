//! Texto que imprime el cliente a partir de un job log o del host.

use ecco_common::api::FunctionConfiguration;
use ecco_common::{InvocationStatus, JobLog, TimeStep};
use std::collections::BTreeMap;
use std::fmt::Write;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counts {
    dispatched: usize,
    succeeded: usize,
    failed: usize,
}

pub fn format_status(log: &JobLog) -> String {
    let mut out = format!("{}\n", log.summary());

    if !log.cost_by_tier.is_empty() {
        out.push_str("\nCosto por memoria:\n");
        for (memory, tier) in &log.cost_by_tier {
            let _ = writeln!(
                out,
                "  {:>6} MB: {} invocaciones, {:.1} s facturados, {:.3} GB-s, ${:.6}",
                memory, tier.invocations, tier.total_billed_time, tier.total_gb_seconds, tier.total_cost
            );
        }
    }

    let mut by_function: BTreeMap<&str, Counts> = BTreeMap::new();
    for record in log.invocations.values() {
        let counts = by_function.entry(record.batch.function_name.as_str()).or_default();
        match record.status {
            InvocationStatus::Dispatched => counts.dispatched += 1,
            InvocationStatus::Succeeded => counts.succeeded += 1,
            InvocationStatus::Failed => counts.failed += 1,
        }
    }
    if !by_function.is_empty() {
        out.push_str("\nInvocaciones por función:\n");
        for (name, c) in by_function {
            let _ = writeln!(
                out,
                "  {}: ok={} fallidas={} en curso={}",
                name, c.succeeded, c.failed, c.dispatched
            );
        }
    }
    out
}

fn join_steps(steps: impl Iterator<Item = TimeStep>) -> String {
    steps.map(|t| t.to_string()).collect::<Vec<_>>().join(", ")
}

pub fn format_failures(log: &JobLog) -> String {
    let failures = log.failures_by_job();
    if failures.is_empty() {
        return "Sin time steps fallidos\n".to_string();
    }

    let mut out = String::new();
    for (job, steps) in &failures {
        let _ = writeln!(out, "{}: {} time steps", job, steps.len());
        let _ = writeln!(out, "  {}", join_steps(steps.iter().copied()));
    }
    out
}

pub fn format_functions(functions: &[FunctionConfiguration]) -> String {
    if functions.is_empty() {
        return "No hay funciones registradas\n".to_string();
    }

    let mut out = String::new();
    for f in functions {
        let _ = write!(
            out,
            "{} [{:?}] memoria={} MB timeout={} s imagen={} modificada={}",
            f.name,
            f.state,
            f.memory_size,
            f.timeout_secs,
            f.image_ref,
            f.last_modified.format("%Y-%m-%d %H:%M:%S")
        );
        if let Some(reason) = &f.state_reason {
            let _ = write!(out, " ({})", reason);
        }
        out.push('\n');
    }
    out
}

//! Sondeo de logs hasta que cada invocación enviada tenga su REPORT.

use chrono::Utc;
use ecco_common::api::{log_group_for, FilterEventsRequest, LogEvent};
use ecco_common::report::{parse_line, DEFAULT_FILTER_PATTERN};
use ecco_common::{
    InvocationId, InvocationOutcome, InvocationStatus, JobLog, LogLine, PerformanceReport, TimeStep,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, LogBackend};
use crate::error::PipelineError;

/// Margen para relojes desfasados entre el master y el host.
const CLOCK_SLACK_MS: i64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Complete,
    /// Venció el techo de tiempo; las pendientes quedan sin resolver
    TimedOut { unresolved: usize },
    Cancelled { unresolved: usize },
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub wall_clock_ceiling: Duration,
}

/// Lo visto en los logs para una invocación.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Observation {
    pub report: Option<PerformanceReport>,
    pub failed_time_steps: BTreeSet<TimeStep>,
    pub timed_out: Option<f64>,
    pub error: Option<String>,
}

impl Observation {
    fn absorb(&mut self, other: Observation) {
        if other.report.is_some() {
            self.report = other.report;
        }
        self.failed_time_steps.extend(other.failed_time_steps);
        self.timed_out = self.timed_out.or(other.timed_out);
        self.error = self.error.take().or(other.error);
    }

    /// Sin REPORT la invocación sigue abierta.
    pub fn into_outcome(self) -> Option<InvocationOutcome> {
        let report = self.report?;
        // timeout, o error sin lista de time steps: cae el lote entero
        let fatal_error = match (self.timed_out, self.error) {
            (Some(secs), _) => Some(format!("Task timed out after {:.2} seconds", secs)),
            (None, Some(msg)) if self.failed_time_steps.is_empty() => Some(msg),
            _ => None,
        };
        Some(InvocationOutcome {
            report: Some(report),
            failed_time_steps: self.failed_time_steps,
            fatal_error,
        })
    }
}

/// Agrupa por invocación las líneas del protocolo.
pub fn observe(events: &[LogEvent]) -> HashMap<String, Observation> {
    let mut out: HashMap<String, Observation> = HashMap::new();
    for event in events {
        let Some(line) = parse_line(&event.message) else {
            continue;
        };
        let obs = out.entry(line.invocation_id().to_string()).or_default();
        match line {
            LogLine::Report { report, .. } => obs.report = Some(report),
            LogLine::GranuleFailures { time_steps, .. } => obs.failed_time_steps.extend(time_steps),
            LogLine::TimedOut { seconds, .. } => obs.timed_out = Some(seconds),
            LogLine::Error { message, .. } => obs.error = Some(message),
            LogLine::Start { .. } | LogLine::End { .. } => {}
        }
    }
    out
}

/// Cuántas de `ids` siguen abiertas en el log.
fn pending(log: &JobLog, ids: &BTreeSet<InvocationId>) -> usize {
    ids.iter()
        .filter(|id| {
            log.invocations
                .get(id.as_str())
                .is_some_and(|r| r.status == InvocationStatus::Dispatched)
        })
        .count()
}

pub struct Aggregator {
    logs: Arc<dyn LogBackend>,
    streams_per_query: usize,
    pattern: String,
}

impl Aggregator {
    pub fn new(logs: Arc<dyn LogBackend>, streams_per_query: usize) -> Self {
        Self {
            logs,
            streams_per_query: streams_per_query.max(1),
            pattern: DEFAULT_FILTER_PATTERN.to_string(),
        }
    }

    /// Sondea hasta cerrar las invocaciones `ids`, vencer el techo o recibir
    /// cancelación. Otras pendientes del mismo log no se esperan.
    /// Guarda el log después de cada pasada.
    pub async fn poll_until_complete(
        &self,
        log: &mut JobLog,
        ids: &BTreeSet<InvocationId>,
        log_path: &Path,
        settings: PollSettings,
        cancel: &CancellationToken,
    ) -> Result<PollOutcome, PipelineError> {
        let deadline = sleep_until(Instant::now() + settings.wall_clock_ceiling);
        tokio::pin!(deadline);
        let mut ticker = interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if pending(log, ids) == 0 {
                return Ok(PollOutcome::Complete);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    let unresolved = pending(log, ids);
                    warn!("sondeo cancelado con {} invocaciones sin resolver", unresolved);
                    log.save(log_path)?;
                    return Ok(PollOutcome::Cancelled { unresolved });
                }
                _ = &mut deadline => {
                    let unresolved = pending(log, ids);
                    warn!("techo de tiempo alcanzado: {} invocaciones sin resolver", unresolved);
                    log.save(log_path)?;
                    return Ok(PollOutcome::TimedOut { unresolved });
                }
                _ = ticker.tick() => {}
            }

            let closed = self.pass(log, ids).await;
            log.save(log_path)?;
            debug!(
                "pasada de logs: {} cerradas, {} pendientes",
                closed,
                pending(log, ids)
            );
        }
    }

    /// Una pasada sobre las funciones con alguna de `ids` abierta.
    /// Un error del backend afecta sólo a esa función en esta pasada.
    pub async fn pass(&self, log: &mut JobLog, ids: &BTreeSet<InvocationId>) -> usize {
        let mut by_function: BTreeMap<String, (i64, HashSet<String>)> = BTreeMap::new();
        for record in log.outstanding().filter(|r| ids.contains(&r.id)) {
            let since = record.dispatch_time.timestamp_millis();
            let entry = by_function
                .entry(record.batch.function_name.clone())
                .or_insert((since, HashSet::new()));
            entry.0 = entry.0.min(since);
            entry.1.insert(record.id.clone());
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut closed = 0;

        for (function, (since_ms, ids)) in by_function {
            let observed = match self.collect(&function, since_ms - CLOCK_SLACK_MS, now_ms).await {
                Ok(o) => o,
                Err(e) => {
                    warn!("error leyendo logs de {} (se reintenta): {}", function, e);
                    continue;
                }
            };

            for (id, obs) in observed {
                if !ids.contains(&id) {
                    continue;
                }
                let Some(outcome) = obs.into_outcome() else {
                    continue;
                };
                let failed = !outcome.failed_time_steps.is_empty() || outcome.fatal_error.is_some();
                // el id viene de `outstanding`, siempre existe
                if let Ok(true) = log.complete(&id, outcome) {
                    closed += 1;
                    if failed {
                        info!("invocación {} terminó con fallos", id);
                    }
                }
            }
        }

        closed
    }

    async fn collect(
        &self,
        function: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<HashMap<String, Observation>, BackendError> {
        let group = log_group_for(function);

        let mut streams = Vec::new();
        let mut token = None;
        loop {
            let page = self.logs.list_streams(&group, token).await?;
            streams.extend(
                page.streams
                    .into_iter()
                    .filter(|s| s.last_event_ms >= start_ms)
                    .map(|s| s.name),
            );
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }

        let mut observed: HashMap<String, Observation> = HashMap::new();
        for chunk in streams.chunks(self.streams_per_query) {
            let mut req = FilterEventsRequest {
                group: group.clone(),
                streams: chunk.to_vec(),
                pattern: self.pattern.clone(),
                start_ms,
                end_ms,
                next_token: None,
                limit: None,
            };
            loop {
                let page = self.logs.filter_events(&req).await?;
                for (id, obs) in observe(&page.events) {
                    observed.entry(id).or_default().absorb(obs);
                }
                match page.next_token {
                    Some(t) => req.next_token = Some(t),
                    None => break,
                }
            }
        }
        Ok(observed)
    }
}

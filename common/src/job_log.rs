use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

use crate::job::{JobTuple, TimeStep};
use crate::report::PerformanceReport;

pub type InvocationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Dispatched,
    Succeeded,
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvocationStatus::Dispatched)
    }
}

/// A qué lote corresponde una invocación.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRef {
    pub job: JobTuple,
    pub batch_index: usize,
    pub function_name: String,
    pub time_steps: Vec<TimeStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub id: InvocationId,
    pub dispatch_time: DateTime<Utc>,
    pub status: InvocationStatus,
    pub batch: BatchRef,
    #[serde(default)]
    pub report: Option<PerformanceReport>,
    #[serde(default)]
    pub failed_time_steps: BTreeSet<TimeStep>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl InvocationRecord {
    pub fn dispatched(id: impl Into<InvocationId>, dispatch_time: DateTime<Utc>, batch: BatchRef) -> Self {
        Self {
            id: id.into(),
            dispatch_time,
            status: InvocationStatus::Dispatched,
            batch,
            report: None,
            failed_time_steps: BTreeSet::new(),
            completed_at: None,
        }
    }
}

/// Lo que el agregador observó en los logs para una invocación.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvocationOutcome {
    pub report: Option<PerformanceReport>,
    /// Time steps que el worker reportó como fallidos
    pub failed_time_steps: BTreeSet<TimeStep>,
    /// Timeout o error de runtime: falla el lote completo
    pub fatal_error: Option<String>,
}

/* --------- Costos --------- */

/// Acumulado por nivel de memoria. Los acumuladores son enteros para que
/// el orden de los reportes no cambie el resultado.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostTier {
    pub total_time: f64,
    pub total_billed_time: f64,
    pub total_gb_seconds: f64,
    pub total_cost: f64,
    pub invocations: u64,
    duration_us: u64,
    billed_ms: u64,
    mb_ms: u64,
}

impl CostTier {
    fn add(&mut self, report: &PerformanceReport, unit_price: f64) {
        self.invocations += 1;
        self.duration_us += (report.duration_ms * 1000.0).round().max(0.0) as u64;
        self.billed_ms += report.billed_duration_ms;
        self.mb_ms += u64::from(report.memory_size_mb) * report.billed_duration_ms;

        // totales en segundos, derivados de los enteros
        self.total_time = self.duration_us as f64 / 1_000_000.0;
        self.total_billed_time = self.billed_ms as f64 / 1000.0;
        self.total_gb_seconds = self.mb_ms as f64 / 1024.0 / 1000.0;
        self.total_cost = self.total_gb_seconds * unit_price;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTimeStep {
    pub job: JobTuple,
    pub time_step: TimeStep,
}

#[derive(Debug, Error)]
pub enum JobLogError {
    #[error("invocación desconocida: {0}")]
    UnknownInvocation(InvocationId),
    #[error("error de E/S en {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON inválido en {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Registro agregado de una corrida (o de una ronda de reintento).
///
/// Tiene un solo escritor (el pipeline del master); los lectores trabajan
/// sobre una copia cargada de disco.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    pub run_name: String,
    pub run_date: DateTime<Utc>,
    /// Segundos de reloj acumulados por todas las pasadas
    pub total_time: f64,
    pub unit_price_per_gb_second: f64,
    /// memoria (MB) -> acumulado
    pub cost_by_tier: BTreeMap<u32, CostTier>,
    pub grand_total_cost: f64,
    pub number_of_invocations: usize,
    pub time_steps_failed: Vec<FailedTimeStep>,
    pub invocations: BTreeMap<InvocationId, InvocationRecord>,
}

impl JobLog {
    pub fn new(run_name: impl Into<String>, unit_price_per_gb_second: f64) -> Self {
        Self {
            run_name: run_name.into(),
            run_date: Utc::now(),
            total_time: 0.0,
            unit_price_per_gb_second,
            cost_by_tier: BTreeMap::new(),
            grand_total_cost: 0.0,
            number_of_invocations: 0,
            time_steps_failed: Vec::new(),
            invocations: BTreeMap::new(),
        }
    }

    pub fn record_dispatch(&mut self, record: InvocationRecord) {
        if self.invocations.contains_key(&record.id) {
            return;
        }
        self.number_of_invocations += 1;
        self.invocations.insert(record.id.clone(), record);
    }

    /// Lote que nunca llegó a enviarse: sus time steps van directo a fallidos.
    pub fn record_undispatched(&mut self, job: JobTuple, time_steps: &[TimeStep]) {
        for &time_step in time_steps {
            self.push_failure(FailedTimeStep { job, time_step });
        }
    }

    fn push_failure(&mut self, failure: FailedTimeStep) {
        if !self.time_steps_failed.contains(&failure) {
            self.time_steps_failed.push(failure);
        }
    }

    pub fn outstanding(&self) -> impl Iterator<Item = &InvocationRecord> {
        self.invocations
            .values()
            .filter(|r| r.status == InvocationStatus::Dispatched)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding().count()
    }

    /// Transición terminal de una invocación. Devuelve `false` si ya era
    /// terminal (la transición ocurre una sola vez y el costo se suma una vez).
    ///
    /// Los fallos reportados fuera del lote se descartan.
    pub fn complete(&mut self, id: &str, outcome: InvocationOutcome) -> Result<bool, JobLogError> {
        let record = self
            .invocations
            .get_mut(id)
            .ok_or_else(|| JobLogError::UnknownInvocation(id.to_string()))?;
        if record.status.is_terminal() {
            return Ok(false);
        }

        let batch_steps: BTreeSet<TimeStep> = record.batch.time_steps.iter().copied().collect();
        let failed: BTreeSet<TimeStep> = if outcome.fatal_error.is_some() {
            batch_steps
        } else {
            outcome
                .failed_time_steps
                .intersection(&batch_steps)
                .copied()
                .collect()
        };

        record.status = if failed.is_empty() {
            InvocationStatus::Succeeded
        } else {
            InvocationStatus::Failed
        };
        record.failed_time_steps = failed.clone();
        record.report = outcome.report.clone();
        record.completed_at = Some(Utc::now());
        let job = record.batch.job;

        for time_step in failed {
            self.push_failure(FailedTimeStep { job, time_step });
        }
        if let Some(report) = &outcome.report {
            self.add_cost(report);
        }
        Ok(true)
    }

    fn add_cost(&mut self, report: &PerformanceReport) {
        let price = self.unit_price_per_gb_second;
        self.cost_by_tier
            .entry(report.memory_size_mb)
            .or_default()
            .add(report, price);
        self.grand_total_cost = self.cost_by_tier.values().map(|t| t.total_cost).sum();
    }

    /// Fallos agrupados por tupla de job, para el controlador de reintentos.
    pub fn failures_by_job(&self) -> BTreeMap<JobTuple, BTreeSet<TimeStep>> {
        let mut out: BTreeMap<JobTuple, BTreeSet<TimeStep>> = BTreeMap::new();
        for f in &self.time_steps_failed {
            out.entry(f.job).or_default().insert(f.time_step);
        }
        out
    }

    /// Incorpora otro log de la misma corrida (p. ej. el que quedó en disco).
    pub fn merge(&mut self, other: &JobLog) {
        for (id, theirs) in &other.invocations {
            match self.invocations.get(id).map(|r| r.status) {
                None => {
                    let mut fresh = theirs.clone();
                    fresh.status = InvocationStatus::Dispatched;
                    fresh.report = None;
                    fresh.failed_time_steps.clear();
                    fresh.completed_at = None;
                    self.record_dispatch(fresh);
                    self.apply_terminal(theirs);
                }
                Some(InvocationStatus::Dispatched) => self.apply_terminal(theirs),
                Some(_) => {}
            }
        }
        for f in &other.time_steps_failed {
            self.push_failure(*f);
        }
        self.total_time = self.total_time.max(other.total_time);
    }

    fn apply_terminal(&mut self, theirs: &InvocationRecord) {
        if !theirs.status.is_terminal() {
            return;
        }
        let outcome = InvocationOutcome {
            report: theirs.report.clone(),
            failed_time_steps: theirs.failed_time_steps.clone(),
            fatal_error: None,
        };
        // el id existe: se acaba de registrar o ya estaba
        let _ = self.complete(&theirs.id, outcome);
    }

    pub fn summary(&self) -> RunSummary {
        let mut s = RunSummary {
            run_name: self.run_name.clone(),
            submitted: self.invocations.len(),
            total_time: self.total_time,
            total_cost: self.grand_total_cost,
            failed_time_steps: self.time_steps_failed.len(),
            ..Default::default()
        };
        for r in self.invocations.values() {
            match r.status {
                InvocationStatus::Dispatched => s.unresolved += 1,
                InvocationStatus::Succeeded => s.succeeded += 1,
                InvocationStatus::Failed => s.failed += 1,
            }
        }
        s
    }

    /* --------- Persistencia --------- */

    /// Escritura atómica: `<path>.tmp` y luego rename.
    pub fn save(&self, path: &Path) -> Result<(), JobLogError> {
        let io_err = |source| JobLogError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let json = serde_json::to_vec_pretty(self).map_err(|source| JobLogError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)
    }

    pub fn load(path: &Path) -> Result<Self, JobLogError> {
        let text = fs::read_to_string(path).map_err(|source| JobLogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| JobLogError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reanuda una corrida con el mismo nombre si su log existe en disco.
    pub fn load_or_new(
        path: &Path,
        run_name: &str,
        unit_price_per_gb_second: f64,
    ) -> Result<Self, JobLogError> {
        let mut log = JobLog::new(run_name, unit_price_per_gb_second);
        if path.is_file() {
            let previous = JobLog::load(path)?;
            log.run_date = previous.run_date;
            log.merge(&previous);
        }
        Ok(log)
    }
}

/// Resumen final que se imprime al terminar.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_name: String,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub unresolved: usize,
    pub failed_time_steps: usize,
    pub total_time: f64,
    pub total_cost: f64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Corrida {}:", self.run_name)?;
        writeln!(
            f,
            "  invocaciones: enviadas={}, ok={}, fallidas={}, sin resolver={}",
            self.submitted, self.succeeded, self.failed, self.unresolved
        )?;
        writeln!(f, "  time steps fallidos: {}", self.failed_time_steps)?;
        writeln!(f, "  tiempo total: {:.1} s", self.total_time)?;
        write!(f, "  costo total: ${:.6}", self.total_cost)
    }
}

//! Encadena builder -> batcher -> función -> dispatcher -> agregador por cada job.

use async_trait::async_trait;
use ecco_common::api::FunctionConfiguration;
use ecco_common::task::write_task_list;
use ecco_common::{
    partition, BatchBudget, GroupingStore, JobLog, JobSpec, JobTuple, ObjectStore,
};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::{Aggregator, PollOutcome, PollSettings};
use crate::backend::{ComputeBackend, ImageRegistry, LogBackend};
use crate::config::{Config, FunctionClass};
use crate::dispatcher::{Confirm, DispatchOutcome, Dispatcher};
use crate::error::PipelineError;
use crate::lifecycle::FunctionManager;
use crate::retry::JobRunner;
use crate::task_list::{task_list_path, TaskList, TaskListBuilder};

/// Cómo terminó un job dentro de una corrida.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Dispatched {
        batches: usize,
        undispatched: usize,
        poll: PollOutcome,
    },
    NoData,
    Skipped(String),
    Declined,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Dispatched {
                batches,
                undispatched,
                poll,
            } => {
                write!(f, "{} lotes enviados", batches - undispatched)?;
                if *undispatched > 0 {
                    write!(f, ", {} sin enviar", undispatched)?;
                }
                match poll {
                    PollOutcome::Complete => write!(f, ", completo"),
                    PollOutcome::TimedOut { unresolved } => {
                        write!(f, ", {} sin resolver (techo de tiempo)", unresolved)
                    }
                    PollOutcome::Cancelled { unresolved } => {
                        write!(f, ", {} sin resolver (cancelado)", unresolved)
                    }
                }
            }
            JobOutcome::NoData => write!(f, "sin datos"),
            JobOutcome::Skipped(reason) => write!(f, "omitido: {}", reason),
            JobOutcome::Declined => write!(f, "no aprobado"),
        }
    }
}

/// Backends externos que usa el pipeline.
#[derive(Clone)]
pub struct Backends {
    pub groupings: Arc<dyn GroupingStore>,
    pub store: Arc<dyn ObjectStore>,
    pub compute: Arc<dyn ComputeBackend>,
    pub images: Arc<dyn ImageRegistry>,
    pub logs: Arc<dyn LogBackend>,
}

pub struct Pipeline {
    config: Arc<Config>,
    builder: TaskListBuilder,
    functions: FunctionManager,
    dispatcher: Dispatcher,
    aggregator: Aggregator,
    cancel: CancellationToken,
    /// Una verificación de función por clase y corrida del proceso
    ensured: Mutex<HashMap<FunctionClass, FunctionConfiguration>>,
}

impl Pipeline {
    pub fn new(config: Arc<Config>, backends: Backends, cancel: CancellationToken) -> Self {
        let builder = TaskListBuilder::new(
            backends.groupings,
            backends.store,
            Arc::new(config.calendar.clone()),
            config.naming.clone(),
        );
        let functions = FunctionManager::new(
            backends.compute.clone(),
            backends.images,
            Duration::from_secs(config.activation_poll_secs.max(1)),
            Duration::from_secs(config.activation_timeout_secs),
            config.function_timeout_secs,
        );
        let dispatcher = Dispatcher::new(
            backends.compute,
            config.dispatch_concurrency,
            config.dispatch_attempts,
        )
        .with_retry_delay(Duration::from_millis(config.dispatch_retry_delay_ms));
        let aggregator = Aggregator::new(backends.logs, config.streams_per_query);

        Self {
            config,
            builder,
            functions,
            dispatcher,
            aggregator,
            cancel,
            ensured: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_confirmation(mut self, confirm: Confirm) -> Self {
        self.dispatcher = self.dispatcher.with_confirmation(confirm);
        self
    }

    pub fn groupings(&self) -> &dyn GroupingStore {
        self.builder.groupings()
    }

    fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.config.poll_interval(),
            wall_clock_ceiling: self.config.wall_clock_ceiling(),
        }
    }

    fn build(&self, spec: &JobSpec) -> Result<TaskList, PipelineError> {
        let list = self.builder.build(
            spec,
            &self.config.source_root,
            &self.config.destination_root,
        )?;
        for w in &list.warnings {
            warn!("{}", w);
        }
        Ok(list)
    }

    fn write_list(&self, run_name: &str, list: &TaskList) -> Result<(), PipelineError> {
        let path = task_list_path(&self.config.task_list_dir, run_name, list.job);
        write_task_list(&path, &list.tasks)
            .map_err(|source| PipelineError::TaskList { path: path.clone(), source })?;
        info!("lista de tareas de {} -> {}", list.job, path.display());
        Ok(())
    }

    /// Sólo construye y escribe las listas de tareas (subcomando `tasks`).
    pub fn write_task_lists(&self, jobs: &[JobSpec], run_name: &str) -> Vec<(JobTuple, usize)> {
        let mut written = Vec::new();
        for spec in jobs {
            let job = spec.tuple();
            let list = match self.build(spec) {
                Ok(l) => l,
                Err(e) => {
                    warn!("job {} abortado: {}", job, e);
                    continue;
                }
            };
            if list.is_empty() {
                warn!("job {}: sin datos", job);
                continue;
            }
            match self.write_list(run_name, &list) {
                Ok(()) => written.push((job, list.tasks.len())),
                Err(e) => warn!("job {}: {}", job, e),
            }
        }
        written
    }

    async fn ensure_function(&self, class: FunctionClass) -> Result<FunctionConfiguration, PipelineError> {
        let mut ensured = self.ensured.lock().await;
        if let Some(f) = ensured.get(&class) {
            return Ok(f.clone());
        }
        let f = self
            .functions
            .ensure_current(
                &self.config.function_name(class),
                &self.config.image_ref,
                self.config.memory_size(class),
            )
            .await?;
        ensured.insert(class, f.clone());
        Ok(f)
    }

    /// Un job completo: tareas, lotes, función, envío y sondeo.
    pub async fn run_job(
        &self,
        spec: &JobSpec,
        run_name: &str,
        log: &mut JobLog,
    ) -> Result<JobOutcome, PipelineError> {
        let job = spec.tuple();
        let list = self.build(spec)?;
        if list.is_empty() {
            return Ok(JobOutcome::NoData);
        }
        self.write_list(run_name, &list)?;

        let class = FunctionClass {
            dimension: list.grouping.dimension,
            product_type: job.product_type,
        };
        let budget = BatchBudget {
            field_count: list.grouping.fields.len(),
            vertical_levels: self.config.vertical_levels(class.dimension),
            per_field_seconds: self.config.per_field_seconds(class),
            max_window_seconds: self.config.max_window_seconds,
            override_ceiling: self.config.override_ceiling,
        };
        let batches = match partition(job, list.tasks, &budget) {
            Ok(b) => b,
            Err(skip) => return Ok(JobOutcome::Skipped(skip.reason)),
        };
        info!(
            "job {}: {} lotes de hasta {} time steps",
            job,
            batches.len(),
            budget.units_per_invocation()
        );

        let function = self.ensure_function(class).await?;
        let batch_count = batches.len();
        let (ids, undispatched) = match self.dispatcher.dispatch_job(&function.name, batches, log).await {
            DispatchOutcome::Declined => return Ok(JobOutcome::Declined),
            DispatchOutcome::Submitted {
                invocations,
                undispatched,
            } => (invocations.into_iter().collect::<BTreeSet<_>>(), undispatched.len()),
        };

        let log_path = self.config.job_log_path(run_name);
        log.save(&log_path)?;
        // sólo las de este job; las abiertas de jobs anteriores ya se abandonaron
        let poll = self
            .aggregator
            .poll_until_complete(log, &ids, &log_path, self.poll_settings(), &self.cancel)
            .await?;

        Ok(JobOutcome::Dispatched {
            batches: batch_count,
            undispatched,
            poll,
        })
    }
}

#[async_trait]
impl JobRunner for Pipeline {
    /// Corre todos los jobs en orden. Reanuda el log si ya existe uno con el mismo nombre.
    async fn run_jobs(&self, jobs: &[JobSpec], run_name: &str) -> Result<JobLog, PipelineError> {
        let started = Instant::now();
        let log_path = self.config.job_log_path(run_name);
        let mut log = JobLog::load_or_new(
            &log_path,
            run_name,
            self.config.unit_price_per_gb_second,
        )?;
        info!("corrida {}: {} jobs", run_name, jobs.len());

        for spec in jobs {
            if self.cancel.is_cancelled() {
                warn!("corrida {} cancelada, quedan jobs sin procesar", run_name);
                break;
            }
            let job = spec.tuple();
            match self.run_job(spec, run_name, &mut log).await {
                Ok(outcome @ JobOutcome::Dispatched { .. }) => info!("job {}: {}", job, outcome),
                Ok(outcome) => warn!("job {}: {}", job, outcome),
                Err(e) if e.is_fatal() => {
                    error!("job {}: error fatal: {}", job, e);
                    log.total_time += started.elapsed().as_secs_f64();
                    // el error original importa más que uno de escritura
                    let _ = log.save(&log_path);
                    return Err(e);
                }
                Err(e) => warn!("job {} abortado: {}", job, e),
            }
        }

        log.total_time += started.elapsed().as_secs_f64();
        log.save(&log_path)?;
        Ok(log)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

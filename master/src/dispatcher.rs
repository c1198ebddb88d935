use chrono::Utc;
use ecco_common::{Batch, BatchRef, InvocationId, InvocationRecord, JobLog, JobTuple, TimeStep};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, ComputeBackend};

/// Pregunta al operador; recibe el resumen del job y devuelve si se envía.
pub type Confirm = Arc<dyn Fn(String) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Ids en el orden de los lotes, más los índices que no se pudieron enviar
    Submitted {
        invocations: Vec<InvocationId>,
        undispatched: Vec<usize>,
    },
    Declined,
}

/// Envío asíncrono de lotes con un pool acotado de llamadas simultáneas.
#[derive(Clone)]
pub struct Dispatcher {
    compute: Arc<dyn ComputeBackend>,
    slots: Arc<Semaphore>,
    attempts: u32,
    retry_delay: Duration,
    confirm: Option<Confirm>,
}

impl Dispatcher {
    pub fn new(compute: Arc<dyn ComputeBackend>, concurrency: usize, attempts: u32) -> Self {
        Self {
            compute,
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
            attempts: attempts.max(1),
            retry_delay: Duration::from_millis(500),
            confirm: None,
        }
    }

    pub fn with_confirmation(mut self, confirm: Confirm) -> Self {
        self.confirm = Some(confirm);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Envía un lote. El tiempo de despacho se toma antes de la llamada.
    pub async fn dispatch(
        &self,
        function_name: &str,
        batch: &Batch,
    ) -> Result<InvocationRecord, BackendError> {
        let dispatch_time = Utc::now();
        let mut attempt = 1;

        let id = loop {
            match self.compute.invoke_async(function_name, batch).await {
                Ok(id) => break id,
                Err(e) if attempt < self.attempts => {
                    warn!(
                        "envío del lote {} de {} falló (intento {}/{}): {}",
                        batch.index, batch.job, attempt, self.attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        };

        Ok(InvocationRecord::dispatched(
            id,
            dispatch_time,
            BatchRef {
                job: batch.job,
                batch_index: batch.index,
                function_name: function_name.to_string(),
                time_steps: batch.time_steps.clone(),
            },
        ))
    }

    /// Envía todos los lotes de un job y los registra en el log en orden
    /// ascendente de tiempo. Un lote que no se puede enviar no frena a los demás.
    pub async fn dispatch_job(
        &self,
        function_name: &str,
        batches: Vec<Batch>,
        log: &mut JobLog,
    ) -> DispatchOutcome {
        let Some(job) = batches.first().map(|b| b.job) else {
            return DispatchOutcome::Submitted {
                invocations: Vec::new(),
                undispatched: Vec::new(),
            };
        };

        if let Some(confirm) = &self.confirm {
            let summary = summarize(job, function_name, &batches);
            let confirm = confirm.clone();
            let approved = tokio::task::spawn_blocking(move || confirm(summary))
                .await
                .unwrap_or(false);
            if !approved {
                info!("job {} no aprobado por el operador", job);
                return DispatchOutcome::Declined;
            }
        }

        let mut handles: Vec<(usize, Vec<TimeStep>, JoinHandle<_>)> = Vec::new();
        for batch in batches {
            // el permiso se toma acá para que el orden de envío sea el de los lotes
            let permit = match self.slots.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let this = self.clone();
            let name = function_name.to_string();
            let index = batch.index;
            let steps = batch.time_steps.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                this.dispatch(&name, &batch).await
            });
            handles.push((index, steps, handle));
        }

        let mut invocations = Vec::new();
        let mut undispatched = Vec::new();
        for (index, steps, handle) in handles {
            match handle.await {
                Ok(Ok(record)) => {
                    debug!("lote {} de {} -> {}", index, job, record.id);
                    invocations.push(record.id.clone());
                    log.record_dispatch(record);
                }
                Ok(Err(e)) => {
                    warn!("lote {} de {} no se pudo enviar: {}", index, job, e);
                    log.record_undispatched(job, &steps);
                    undispatched.push(index);
                }
                Err(e) => {
                    warn!("tarea de envío del lote {} abortó: {}", index, e);
                    log.record_undispatched(job, &steps);
                    undispatched.push(index);
                }
            }
        }

        DispatchOutcome::Submitted {
            invocations,
            undispatched,
        }
    }
}

fn summarize(job: JobTuple, function_name: &str, batches: &[Batch]) -> String {
    let sizes: Vec<usize> = batches.iter().map(|b| b.time_steps.len()).collect();
    format!(
        "job {}: {} lotes, tamaños {:?} -> {}",
        job,
        batches.len(),
        sizes,
        function_name
    )
}

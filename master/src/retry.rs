use async_trait::async_trait;
use ecco_common::{FailedTimeStep, JobLog, JobSpec, TimeSteps};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use crate::error::PipelineError;

/// Lo que el controlador de reintentos necesita del pipeline: correr una
/// lista de jobs bajo un nombre de corrida y devolver su log.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_jobs(&self, jobs: &[JobSpec], run_name: &str) -> Result<JobLog, PipelineError>;

    fn is_cancelled(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct RetryRound {
    pub round_number: u32,
    pub source_failures: Vec<FailedTimeStep>,
    pub resulting_job_log: JobLog,
    /// Lo que pasa a la ronda siguiente
    pub remaining_failures: Vec<FailedTimeStep>,
}

/// Un job por tupla, con sólo los time steps que fallaron.
pub fn jobs_from_failures(failures: &[FailedTimeStep]) -> Vec<JobSpec> {
    let mut grouped: BTreeMap<_, BTreeSet<_>> = BTreeMap::new();
    for f in failures {
        grouped.entry(f.job).or_default().insert(f.time_step);
    }
    grouped
        .into_iter()
        .map(|(tuple, steps)| JobSpec::from_tuple(tuple, TimeSteps::Steps(steps)))
        .collect()
}

/// Fallos de `fed` que la ronda no resolvió: los que volvieron a fallar y los
/// que ninguna invocación cerrada cubrió (job abortado, sin datos, cancelado
/// o sin resolver).
pub fn unresolved_after(fed: &[FailedTimeStep], result: &JobLog) -> Vec<FailedTimeStep> {
    let failed: BTreeSet<FailedTimeStep> = result.time_steps_failed.iter().copied().collect();
    let covered: BTreeSet<FailedTimeStep> = result
        .invocations
        .values()
        .filter(|r| r.status.is_terminal())
        .flat_map(|r| {
            r.batch.time_steps.iter().map(move |&time_step| FailedTimeStep {
                job: r.batch.job,
                time_step,
            })
        })
        .collect();
    fed.iter()
        .copied()
        .filter(|f| failed.contains(f) || !covered.contains(f))
        .collect()
}

pub struct RetryController {
    max_rounds: u32,
}

impl RetryController {
    pub fn new(max_rounds: u32) -> Self {
        Self { max_rounds }
    }

    /// Rondas uniformes: cada ronda reintenta todos los fallos de la anterior,
    /// sin importar qué tupla los produjo. Un time step sólo sale de la lista
    /// cuando una invocación cerrada lo resolvió. Nunca modifica `log`.
    pub async fn retry(
        &self,
        log: &JobLog,
        runner: &dyn JobRunner,
    ) -> Result<Vec<RetryRound>, PipelineError> {
        let mut rounds = Vec::new();
        let mut source = log.time_steps_failed.clone();

        for round_number in 1..=self.max_rounds {
            if source.is_empty() {
                break;
            }
            if runner.is_cancelled() {
                warn!("reintentos cancelados antes de la ronda {}", round_number);
                break;
            }
            let jobs = jobs_from_failures(&source);
            let run_name = format!("{}_retry{}", log.run_name, round_number);
            info!(
                "reintento {}: {} time steps en {} jobs ({})",
                round_number,
                source.len(),
                jobs.len(),
                run_name
            );

            let result = runner.run_jobs(&jobs, &run_name).await?;
            let next = unresolved_after(&source, &result);
            info!(
                "reintento {}: {} de {} time steps siguen pendientes",
                round_number,
                next.len(),
                source.len()
            );

            rounds.push(RetryRound {
                round_number,
                source_failures: source,
                resulting_job_log: result,
                remaining_failures: next.clone(),
            });
            source = next;
        }

        if !source.is_empty() {
            info!("quedan {} time steps fallidos tras los reintentos", source.len());
        }
        Ok(rounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ecco_common::{
        BatchRef, Frequency, InvocationOutcome, InvocationRecord, JobTuple, ProductType, TimeStep,
    };
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    };

    fn tuple(grouping_id: u32) -> JobTuple {
        JobTuple {
            grouping_id,
            product_type: ProductType::Native,
            frequency: Frequency::AvgMon,
        }
    }

    /// Corre cada job en una invocación que falla, en cada ronda, los time
    /// steps de su lista. Las agrupaciones de `aborted` nunca se corren.
    struct ScriptedRunner {
        failing: Vec<BTreeSet<(u32, TimeStep)>>,
        aborted: BTreeSet<u32>,
        cancelled: AtomicBool,
        seen: Mutex<Vec<(String, Vec<JobSpec>)>>,
    }

    impl ScriptedRunner {
        fn new(failing: Vec<BTreeSet<(u32, TimeStep)>>) -> Self {
            Self {
                failing,
                aborted: BTreeSet::new(),
                cancelled: AtomicBool::new(false),
                seen: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run_jobs(&self, jobs: &[JobSpec], run_name: &str) -> Result<JobLog, PipelineError> {
            let round = {
                let mut seen = self.seen.lock().unwrap();
                seen.push((run_name.to_string(), jobs.to_vec()));
                seen.len() - 1
            };
            let mut log = JobLog::new(run_name, 0.0);
            let failing = self.failing.get(round).cloned().unwrap_or_default();
            for (i, spec) in jobs.iter().enumerate() {
                let TimeSteps::Steps(steps) = &spec.time_steps else {
                    continue;
                };
                if self.aborted.contains(&spec.grouping_id) {
                    continue;
                }
                let id = format!("{}-{}", run_name, i);
                log.record_dispatch(InvocationRecord::dispatched(
                    id.as_str(),
                    Utc::now(),
                    BatchRef {
                        job: spec.tuple(),
                        batch_index: 0,
                        function_name: "f".to_string(),
                        time_steps: steps.iter().copied().collect(),
                    },
                ));
                let failed = steps
                    .iter()
                    .copied()
                    .filter(|t| failing.contains(&(spec.grouping_id, *t)))
                    .collect();
                log.complete(
                    &id,
                    InvocationOutcome {
                        failed_time_steps: failed,
                        ..Default::default()
                    },
                )
                .unwrap();
            }
            Ok(log)
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    fn log_with(failures: &[(u32, TimeStep)]) -> JobLog {
        let mut log = JobLog::new("run", 0.0);
        for (g, t) in failures {
            log.record_undispatched(tuple(*g), &[*t]);
        }
        log
    }

    #[tokio::test]
    async fn sin_fallos_no_hay_rondas() {
        let runner = ScriptedRunner::new(vec![]);
        let rounds = RetryController::new(3)
            .retry(&log_with(&[]), &runner)
            .await
            .unwrap();
        assert!(rounds.is_empty());
        assert!(runner.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn escenario_d_una_ronda_resuelve() {
        let runner = ScriptedRunner::new(vec![BTreeSet::new()]);
        let log = log_with(&[(0, 12)]);
        let rounds = RetryController::new(3).retry(&log, &runner).await.unwrap();

        assert_eq!(rounds.len(), 1);
        assert!(rounds[0].resulting_job_log.time_steps_failed.is_empty());
        assert!(rounds[0].remaining_failures.is_empty());
        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[0].0, "run_retry1");
        assert_eq!(
            seen[0].1,
            vec![JobSpec::from_tuple(tuple(0), TimeSteps::Steps([12].into_iter().collect()))]
        );
        // el log original no se toca
        assert_eq!(log.time_steps_failed.len(), 1);
    }

    #[tokio::test]
    async fn rondas_uniformes_y_monotonas() {
        // ronda 1 sigue fallando (0,12) y (1,5); ronda 2 sólo (1,5); ronda 3 nada
        let runner = ScriptedRunner::new(vec![
            [(0, 12), (1, 5), (1, 99)].into_iter().collect(),
            [(1, 5)].into_iter().collect(),
            BTreeSet::new(),
        ]);
        let log = log_with(&[(0, 12), (0, 36), (1, 5)]);
        let rounds = RetryController::new(5).retry(&log, &runner).await.unwrap();

        assert_eq!(rounds.len(), 3);
        for pair in rounds.windows(2) {
            let fed: BTreeSet<_> = pair[1].source_failures.iter().collect();
            let before: BTreeSet<_> = pair[0].source_failures.iter().collect();
            assert!(fed.is_subset(&before));
        }
        // la ronda 2 recibe lo que quedó de ambas tuplas
        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen[1].1.len(), 2);
        assert_eq!(rounds[2].source_failures.len(), 1);
        assert!(rounds[2].remaining_failures.is_empty());
    }

    #[tokio::test]
    async fn respeta_el_maximo_de_rondas() {
        let always: BTreeSet<(u32, TimeStep)> = [(0, 12)].into_iter().collect();
        let runner = ScriptedRunner::new(vec![always.clone(), always.clone(), always]);
        let rounds = RetryController::new(2)
            .retry(&log_with(&[(0, 12)]), &runner)
            .await
            .unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[1].resulting_job_log.time_steps_failed.len(), 1);
        assert_eq!(rounds[1].remaining_failures.len(), 1);
    }

    #[tokio::test]
    async fn job_no_corrido_sigue_pendiente() {
        let mut runner = ScriptedRunner::new(vec![BTreeSet::new(), BTreeSet::new()]);
        runner.aborted.insert(1);
        let log = log_with(&[(0, 12), (1, 5)]);
        let rounds = RetryController::new(2).retry(&log, &runner).await.unwrap();

        assert_eq!(rounds.len(), 2);
        // el log de la ronda no muestra fallos, pero (1,5) nunca se corrió
        assert!(rounds[0].resulting_job_log.time_steps_failed.is_empty());
        assert_eq!(
            rounds[0].remaining_failures,
            vec![FailedTimeStep { job: tuple(1), time_step: 5 }]
        );
        assert_eq!(rounds[1].source_failures, rounds[0].remaining_failures);
        assert_eq!(rounds[1].remaining_failures.len(), 1);
    }

    #[tokio::test]
    async fn cancelado_no_abre_rondas() {
        let runner = ScriptedRunner::new(vec![BTreeSet::new()]);
        runner.cancelled.store(true, Ordering::SeqCst);
        let rounds = RetryController::new(3)
            .retry(&log_with(&[(0, 12)]), &runner)
            .await
            .unwrap();
        assert!(rounds.is_empty());
        assert!(runner.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn invocacion_abierta_no_resuelve() {
        let fed = vec![FailedTimeStep { job: tuple(0), time_step: 12 }];
        let mut result = JobLog::new("r", 0.0);
        result.record_dispatch(InvocationRecord::dispatched(
            "abierta",
            Utc::now(),
            BatchRef {
                job: tuple(0),
                batch_index: 0,
                function_name: "f".to_string(),
                time_steps: vec![12],
            },
        ));
        assert_eq!(unresolved_after(&fed, &result), fed);

        result.complete("abierta", InvocationOutcome::default()).unwrap();
        assert!(unresolved_after(&fed, &result).is_empty());
    }
}

use chrono::{DateTime, Utc};
use ecco_common::api::{log_group_for, FunctionConfiguration, FunctionState};
use ecco_common::report::{
    format_end, format_error, format_failures, format_report, format_start, format_timed_out,
};
use ecco_common::{Batch, PerformanceReport, TimeStep};
use std::{collections::BTreeSet, path::Path, time::Duration};
use sysinfo::{ProcessExt, System, SystemExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::state::HostState;

/// `YYYY/MM/DD/[$LATEST]<id sin guiones>`
pub fn stream_name(at: DateTime<Utc>, invocation_id: &str) -> String {
    let id: String = invocation_id.chars().filter(|c| *c != '-').collect();
    format!("{}/[$LATEST]{}", at.format("%Y/%m/%d"), id)
}

/// Milisegundos facturados: hacia arriba, al menos 1, nunca más que el timeout.
pub fn billed_ms(elapsed: Duration, limit: Duration) -> u64 {
    let ms = elapsed.as_micros().div_ceil(1000) as u64;
    ms.clamp(1, (limit.as_millis() as u64).max(1))
}

// memoria residente del host, en MB
fn memory_used_mb() -> Option<u32> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return None;
    }
    sys.process(pid)
        .map(|p| (p.memory() / (1024 * 1024)) as u32)
}

/// Pasa la función de Pending a Active o Failed según exista el ejecutable.
pub async fn activate(state: HostState, name: String, image_ref: String, generation: u64) {
    tokio::time::sleep(state.config.activation_delay).await;

    let (next, reason) = if Path::new(&image_ref).is_file() {
        (FunctionState::Active, None)
    } else {
        (
            FunctionState::Failed,
            Some(format!("imagen no encontrada: {}", image_ref)),
        )
    };

    if state.settle(&name, generation, next, reason) {
        info!("función {} -> {:?}", name, next);
    } else {
        debug!("activación vieja de {} descartada", name);
    }
}

/* ---------------- invocaciones ---------------- */

// arranque en frío: scratch de la función y chequeo de la imagen
async fn cold_start(state: &HostState, function: &FunctionConfiguration) -> f64 {
    let started = Instant::now();
    let dir = state.stager.scratch().to_path_buf();
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!("no se pudo crear el scratch {}: {}", dir.display(), e);
    }
    let _ = tokio::fs::metadata(&function.image_ref).await;
    started.elapsed().as_secs_f64() * 1000.0
}

/// Corre las tareas del lote en orden. Devuelve los time steps fallidos, o
/// un error si el lote entero no se pudo procesar.
async fn execute(
    state: &HostState,
    function: &FunctionConfiguration,
    id: &str,
    batch: &Batch,
) -> Result<BTreeSet<TimeStep>, String> {
    let covered: BTreeSet<TimeStep> = batch.tasks.iter().map(|t| t.time_step).collect();
    let mut failed: BTreeSet<TimeStep> = batch
        .time_steps
        .iter()
        .copied()
        .filter(|t| !covered.contains(t))
        .collect();
    if !failed.is_empty() {
        warn!("{}: time steps sin tarea {:?}", id, failed);
    }

    for task in &batch.tasks {
        let staged = match state.stager.stage(task).await {
            Ok(s) => s,
            Err(e) => {
                warn!("{}: staging de t={} falló: {}", id, task.time_step, e);
                failed.insert(task.time_step);
                continue;
            }
        };

        match state.generator.generate(&function.image_ref, &staged.task).await {
            Ok(()) => debug!("{}: gránulo {} listo", id, task.granule_uri),
            Err(e) if e.fails_whole_batch() => return Err(e.to_string()),
            Err(e) => {
                warn!("{}: t={} falló: {}", id, task.time_step, e);
                failed.insert(task.time_step);
            }
        }
    }

    Ok(failed)
}

/// Ejecuta una invocación completa y deja START/END/REPORT en su stream.
pub async fn run_invocation(
    state: HostState,
    function: FunctionConfiguration,
    id: String,
    batch: Batch,
    cold: bool,
) {
    let group = log_group_for(&function.name);
    let stream = stream_name(Utc::now(), &id);

    let _permit = match state.slots.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => return,
    };

    state.append_log(&group, &stream, format_start(&id));
    let init_duration_ms = if cold {
        Some(cold_start(&state, &function).await)
    } else {
        None
    };

    let limit = Duration::from_secs(function.timeout_secs);
    let started = Instant::now();
    let result = timeout(limit, execute(&state, &function, &id, &batch)).await;
    let elapsed = started.elapsed();

    match result {
        Ok(Ok(failed)) if failed.is_empty() => {
            info!("{}: lote {} de {} completo", id, batch.index, batch.job);
        }
        Ok(Ok(failed)) => {
            info!(
                "{}: lote {} de {} con {} time steps fallidos",
                id,
                batch.index,
                batch.job,
                failed.len()
            );
            state.append_log(&group, &stream, format_failures(&id, &failed));
        }
        Ok(Err(message)) => {
            warn!("{}: error de ejecución: {}", id, message);
            state.append_log(&group, &stream, format_error(&id, &message));
        }
        Err(_) => {
            warn!("{}: timeout a los {} s", id, function.timeout_secs);
            state.append_log(&group, &stream, format_timed_out(&id, limit.as_secs_f64()));
        }
    }

    state.append_log(&group, &stream, format_end(&id));
    let report = PerformanceReport {
        duration_ms: elapsed.as_secs_f64() * 1000.0,
        billed_duration_ms: billed_ms(elapsed, limit),
        memory_size_mb: function.memory_size,
        max_memory_used_mb: memory_used_mb().map(|m| m.min(function.memory_size)),
        init_duration_ms,
    };
    state.append_log(&group, &stream, format_report(&id, &report));
}

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobTuple, TimeStep};
use crate::task::Task;

/// Presupuesto de ejecución de una invocación.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchBudget {
    pub field_count: usize,
    pub vertical_levels: u32,
    pub per_field_seconds: f64,
    pub max_window_seconds: f64,
    pub override_ceiling: Option<usize>,
}

impl BatchBudget {
    /// `floor(W / (t * f * v))`, acotado por el techo opcional.
    pub fn units_per_invocation(&self) -> usize {
        let cost_per_unit =
            self.per_field_seconds * self.field_count as f64 * f64::from(self.vertical_levels);

        let units = if cost_per_unit > 0.0 {
            (self.max_window_seconds / cost_per_unit).floor()
        } else {
            // sin coste por unidad no hay límite de tiempo
            f64::from(u32::MAX)
        };
        let units = if units.is_finite() && units > 0.0 {
            units as usize
        } else {
            0
        };

        match self.override_ceiling {
            Some(ceiling) => units.min(ceiling),
            None => units,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("job {job} omitido: {reason}")]
pub struct SkipSignal {
    pub job: JobTuple,
    pub reason: String,
}

/// Lote de time steps enviado en una sola invocación.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub job: JobTuple,
    /// Posición del lote dentro del job
    pub index: usize,
    pub time_steps: Vec<TimeStep>,
    /// Payload: las tareas de esos time steps
    pub tasks: Vec<Task>,
}

/// Parte las tareas (ordenadas por time step) en lotes consecutivos.
///
/// El lote `i` cubre `[i*S, (i+1)*S)`; el último puede ser más corto.
/// Con `S == 0` no se genera ningún lote y el job se omite completo.
pub fn partition(
    job: JobTuple,
    mut tasks: Vec<Task>,
    budget: &BatchBudget,
) -> Result<Vec<Batch>, SkipSignal> {
    let size = budget.units_per_invocation();
    if size == 0 {
        return Err(SkipSignal {
            job,
            reason: "cannot fit one vertical level within the execution window".to_string(),
        });
    }

    tasks.sort_by_key(|t| t.time_step);
    tasks.dedup_by_key(|t| t.time_step);

    let mut batches = Vec::with_capacity(tasks.len().div_ceil(size));
    let mut rest = tasks.into_iter().peekable();
    let mut index = 0;

    while rest.peek().is_some() {
        let chunk: Vec<Task> = rest.by_ref().take(size).collect();
        batches.push(Batch {
            job,
            index,
            time_steps: chunk.iter().map(|t| t.time_step).collect(),
            tasks: chunk,
        });
        index += 1;
    }

    Ok(batches)
}

use ecco_common::JobLogError;
use std::path::PathBuf;
use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::task_list::BuildError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Agrupación inexistente o listado de origen fallido
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("backend: {0}")]
    Backend(#[from] BackendError),

    #[error("la función {name} quedó en Failed: {reason}")]
    FunctionFailed { name: String, reason: String },

    #[error("la función {name} no llegó a Active en {secs} s")]
    ActivationTimeout { name: String, secs: u64 },

    #[error("no se pudo persistir el job log: {0}")]
    JobLog(#[from] JobLogError),

    #[error("no se pudo escribir la lista de tareas {path}: {source}")]
    TaskList {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Fatal = aborta el proceso. El resto aborta sólo el job en curso.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Config(_)
            | PipelineError::FunctionFailed { .. }
            | PipelineError::ActivationTimeout { .. }
            | PipelineError::JobLog(_) => true,
            PipelineError::Build(_)
            | PipelineError::Backend(_)
            | PipelineError::TaskList { .. } => false,
        }
    }
}

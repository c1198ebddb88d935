use async_trait::async_trait;
use ecco_common::Task;
use std::{io, process::Stdio};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

#[derive(Debug, Error)]
pub enum GenerateError {
    /// No se pudo arrancar el ejecutable: falla toda la invocación
    #[error("no se pudo ejecutar {image}: {source}")]
    Spawn {
        image: String,
        #[source]
        source: io::Error,
    },

    #[error("el generador terminó con código {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("no se pudo serializar la tarea: {0}")]
    Payload(#[from] serde_json::Error),
}

impl GenerateError {
    /// Sólo el fallo de arranque invalida el lote entero.
    pub fn fails_whole_batch(&self) -> bool {
        matches!(self, GenerateError::Spawn { .. })
    }
}

/// Produce el gránulo de una tarea ya staged.
#[async_trait]
pub trait GranuleGenerator: Send + Sync {
    async fn generate(&self, image_ref: &str, task: &Task) -> Result<(), GenerateError>;
}

/// Corre la imagen como proceso, con la tarea en JSON por stdin.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessGenerator;

#[async_trait]
impl GranuleGenerator for ProcessGenerator {
    async fn generate(&self, image_ref: &str, task: &Task) -> Result<(), GenerateError> {
        let payload = serde_json::to_vec(task)?;

        let mut child = Command::new(image_ref)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| GenerateError::Spawn {
                image: image_ref.to_string(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // un generador que no lee stdin cierra el pipe; no es un error
            match stdin.write_all(&payload).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(source) => {
                    return Err(GenerateError::Spawn {
                        image: image_ref.to_string(),
                        source,
                    })
                }
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| GenerateError::Spawn {
                image: image_ref.to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(GenerateError::Exit {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::sample_task;

    fn task() -> Task {
        sample_task(12)
    }

    #[tokio::test]
    async fn codigo_de_salida_decide_el_resultado() {
        let generator = ProcessGenerator;
        assert!(generator.generate("/bin/true", &task()).await.is_ok());

        let err = generator.generate("/bin/false", &task()).await.unwrap_err();
        assert!(matches!(err, GenerateError::Exit { code: Some(1), .. }));
        assert!(!err.fails_whole_batch());
    }

    #[tokio::test]
    async fn imagen_inexistente_falla_el_lote() {
        let err = ProcessGenerator
            .generate("/no/existe/ecco_generator", &task())
            .await
            .unwrap_err();
        assert!(err.fails_whole_batch());
    }
}

use ecco_common::{ObjectStore, StoreError, Task};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::debug;

#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("copia interrumpida: {0}")]
    Aborted(String),
}

#[derive(Debug, Clone)]
pub struct Staged {
    /// La tarea con las keys apuntando a copias locales
    pub task: Task,
    pub fetched: usize,
    pub reused: usize,
}

/// Pool acotado de descargas hacia el directorio scratch.
#[derive(Clone)]
pub struct Stager {
    store: Arc<dyn ObjectStore>,
    scratch: PathBuf,
    slots: Arc<Semaphore>,
}

impl Stager {
    pub fn new(store: Arc<dyn ObjectStore>, scratch: impl Into<PathBuf>, concurrency: usize) -> Self {
        Self {
            store,
            scratch: scratch.into(),
            slots: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Ruta en scratch: la key relativa al origen, o sólo el nombre si no cuelga de él.
    fn local_key(&self, source_root: &str, key: &str) -> String {
        let root = source_root.trim_end_matches('/');
        let rel = key
            .strip_prefix(root)
            .filter(|r| !root.is_empty() && r.starts_with('/'))
            .map(|r| r.trim_start_matches('/').to_string())
            .unwrap_or_else(|| {
                Path::new(key)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| key.to_string())
            });
        self.scratch.join(rel).to_string_lossy().to_string()
    }

    /// Copia las partes de la tarea que todavía no estén en scratch.
    pub async fn stage(&self, task: &Task) -> Result<Staged, StageError> {
        let mut staged = task.clone();
        let mut copies = JoinSet::new();
        let mut pending: HashSet<String> = HashSet::new();
        let mut reused = 0;

        for refs in staged.variable_inputs.values_mut() {
            for file in refs.iter_mut() {
                for part in file.parts.iter_mut() {
                    let local = self.local_key(&task.source_root, part);
                    if self.store.exists(&local) {
                        reused += 1;
                    } else if pending.insert(local.clone()) {
                        let store = self.store.clone();
                        let slots = self.slots.clone();
                        let src = part.clone();
                        let dest = local.clone();
                        copies.spawn(async move {
                            let _permit = slots
                                .acquire_owned()
                                .await
                                .map_err(|e| StageError::Aborted(e.to_string()))?;
                            tokio::task::spawn_blocking(move || store.copy(&src, &dest))
                                .await
                                .map_err(|e| StageError::Aborted(e.to_string()))??;
                            Ok::<(), StageError>(())
                        });
                    }
                    *part = local;
                }
            }
        }

        let fetched = pending.len();
        while let Some(res) = copies.join_next().await {
            res.map_err(|e| StageError::Aborted(e.to_string()))??;
        }

        staged.source_root = self.scratch.to_string_lossy().to_string();
        debug!(
            "staging de {} (t={}): {} copiados, {} ya estaban",
            task.granule_uri, task.time_step, fetched, reused
        );
        Ok(Staged {
            task: staged,
            fetched,
            reused,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecco_common::{
        Dimension, DynamicMetadata, Frequency, JobTuple, LocalStore, ProductType, SourceFileRef,
    };
    use std::{collections::BTreeMap, env, fs};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("staging_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn task(source_root: &Path, parts: Vec<String>) -> Task {
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "SSH".to_string(),
            vec![SourceFileRef {
                variable: "SSH".to_string(),
                time_step: 12,
                parts,
            }],
        );
        Task {
            granule_uri: "/dest/SSH/x.nc".to_string(),
            job: JobTuple {
                grouping_id: 0,
                product_type: ProductType::Native,
                frequency: Frequency::AvgDay,
            },
            time_step: 12,
            variable_inputs: inputs,
            dynamic_metadata: DynamicMetadata {
                name: "SSH".to_string(),
                dimension: Dimension::TwoD,
                time_coverage_start: String::new(),
                time_coverage_end: String::new(),
                time_coverage_center: String::new(),
                frequency_label: "P1D".to_string(),
            },
            source_root: source_root.to_string_lossy().to_string(),
            destination_root: "/dest".to_string(),
        }
    }

    fn put(root: &Path, rel: &str, content: &str) -> String {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path.to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn copia_una_vez_y_reusa_lo_staged() {
        let base = temp_dir("reuso");
        let src = base.join("src");
        let data = put(&src, "SSH_day_mean/SSH_day_mean.0000000012.data", "datos");
        let meta = put(&src, "SSH_day_mean/SSH_day_mean.0000000012.meta", "meta");
        let stager = Stager::new(Arc::new(LocalStore), base.join("scratch"), 2);

        let first = stager.stage(&task(&src, vec![data, meta])).await.unwrap();
        assert_eq!(first.fetched, 2);
        assert_eq!(first.reused, 0);

        let staged_data = first.task.variable_inputs["SSH"][0].data_part().unwrap().to_string();
        assert_eq!(
            PathBuf::from(&staged_data),
            base.join("scratch/SSH_day_mean/SSH_day_mean.0000000012.data")
        );
        assert_eq!(fs::read_to_string(&staged_data).unwrap(), "datos");
        assert_eq!(first.task.source_root, base.join("scratch").to_string_lossy());

        let task_again = task(
            &src,
            vec![
                src.join("SSH_day_mean/SSH_day_mean.0000000012.data").to_string_lossy().to_string(),
                src.join("SSH_day_mean/SSH_day_mean.0000000012.meta").to_string_lossy().to_string(),
            ],
        );
        let second = stager.stage(&task_again).await.unwrap();
        assert_eq!(second.fetched, 0);
        assert_eq!(second.reused, 2);
    }

    #[tokio::test]
    async fn parte_faltante_es_error() {
        let base = temp_dir("faltante");
        let src = base.join("src");
        let missing = src.join("X/X.0000000001.data").to_string_lossy().to_string();
        let stager = Stager::new(Arc::new(LocalStore), base.join("scratch"), 1);

        let err = stager.stage(&task(&src, vec![missing])).await.unwrap_err();
        assert!(matches!(err, StageError::Store(_)));
        // no queda nada a medias en scratch
        let leftovers = fs::read_dir(base.join("scratch/X"))
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }
}

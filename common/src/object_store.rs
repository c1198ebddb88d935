use glob::{glob, Pattern};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("patrón de listado inválido {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("error de E/S en {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(key: impl AsRef<Path>, source: io::Error) -> Self {
        StoreError::Io {
            key: key.as_ref().display().to_string(),
            source,
        }
    }
}

/// Almacenamiento de objetos: listado por prefijo, sync y copia.
pub trait ObjectStore: Send + Sync {
    /// Keys que empiezan con `prefix`, ordenadas.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Copia a `dest` todo lo que falte o difiera bajo `src`. Devuelve cuántos objetos copió.
    fn sync(&self, src: &str, dest: &str) -> Result<usize, StoreError>;

    fn copy(&self, src: &str, dest: &str) -> Result<(), StoreError>;

    fn exists(&self, key: &str) -> bool;
}

/// Implementación sobre el sistema de archivos local; las keys son rutas.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStore;

impl LocalStore {
    fn glob_files(pattern: &str) -> Result<Vec<PathBuf>, StoreError> {
        let paths = glob(pattern).map_err(|source| StoreError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;

        let mut out: Vec<PathBuf> = paths
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect();
        out.sort();
        Ok(out)
    }
}

impl ObjectStore for LocalStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", Pattern::escape(prefix));
        Ok(Self::glob_files(&pattern)?
            .into_iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect())
    }

    fn sync(&self, src: &str, dest: &str) -> Result<usize, StoreError> {
        let src_root = Path::new(src);
        let pattern = format!("{}/**/*", Pattern::escape(src.trim_end_matches('/')));
        let mut copied = 0;

        for path in Self::glob_files(&pattern)? {
            let Ok(rel) = path.strip_prefix(src_root) else {
                continue;
            };
            let target = Path::new(dest).join(rel);

            let same_size = match (fs::metadata(&path), fs::metadata(&target)) {
                (Ok(a), Ok(b)) => a.len() == b.len(),
                _ => false,
            };
            if same_size {
                continue;
            }

            self.copy(&path.to_string_lossy(), &target.to_string_lossy())?;
            copied += 1;
        }

        Ok(copied)
    }

    /// Escribe primero en una ruta privada y después renombra, así un lector
    /// concurrente nunca ve un archivo a medias.
    fn copy(&self, src: &str, dest: &str) -> Result<(), StoreError> {
        let dest_path = Path::new(dest);
        if let Some(parent) = dest_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }

        let partial = PathBuf::from(format!("{}.partial-{}", dest, uuid::Uuid::new_v4()));
        fs::copy(src, &partial).map_err(|e| StoreError::io(src, e))?;
        fs::rename(&partial, dest_path).map_err(|e| {
            let _ = fs::remove_file(&partial);
            StoreError::io(dest_path, e)
        })
    }

    fn exists(&self, key: &str) -> bool {
        Path::new(key).is_file()
    }
}

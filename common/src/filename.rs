//! Nombres de archivo crudos del modelo: `<prefix>_<period>.<time>.<ext>`.
//!
//! Ejemplo: `SSH_day_mean.0000000732.data`. El prefijo puede contener `_`
//! (p. ej. `EXFtaue`, `SI_area`), por eso se busca la etiqueta de periodo
//! como sufijo en vez de partir por el primer guion bajo.

use std::{fmt, path::Path};
use thiserror::Error;

use crate::job::{Frequency, TimeStep};

/// Ancho fijo del time step en los nombres de archivo.
pub const TIME_WIDTH: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilenameError {
    #[error("sin extensión: {0}")]
    MissingExtension(String),
    #[error("time step inválido en {0}")]
    BadTime(String),
    #[error("periodo de promediado desconocido en {0}")]
    UnknownPeriod(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccoFilename {
    pub prefix: String,
    pub averaging_period: Frequency,
    pub time: TimeStep,
    pub ext: String,
}

impl EccoFilename {
    pub fn new(
        prefix: impl Into<String>,
        averaging_period: Frequency,
        time: TimeStep,
        ext: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            averaging_period,
            time,
            ext: ext.into(),
        }
    }

    /// Parsea sólo el nombre (sin directorio).
    pub fn parse(name: &str) -> Result<Self, FilenameError> {
        let (rest, ext) = name
            .rsplit_once('.')
            .filter(|(_, ext)| !ext.is_empty())
            .ok_or_else(|| FilenameError::MissingExtension(name.to_string()))?;

        let (stem, time) = rest
            .rsplit_once('.')
            .ok_or_else(|| FilenameError::BadTime(name.to_string()))?;
        if time.len() != TIME_WIDTH || !time.bytes().all(|b| b.is_ascii_digit()) {
            return Err(FilenameError::BadTime(name.to_string()));
        }
        let time = time
            .parse::<TimeStep>()
            .map_err(|_| FilenameError::BadTime(name.to_string()))?;

        for period in Frequency::ALL {
            let suffix = format!("_{}", period.file_label());
            if let Some(prefix) = stem.strip_suffix(&suffix) {
                if prefix.is_empty() {
                    break;
                }
                return Ok(Self::new(prefix, period, time, ext));
            }
        }

        Err(FilenameError::UnknownPeriod(name.to_string()))
    }

    /// Parsea la última componente de una ruta o key de objeto.
    pub fn parse_key(key: &str) -> Result<Self, FilenameError> {
        let name = Path::new(key)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(key);
        Self::parse(name)
    }

    /// Prefijo de listado para una variable, opcionalmente fijando el time step.
    ///
    /// `SSH_day_mean/SSH_day_mean.` o `SSH_day_mean/SSH_day_mean.0000000732.`
    pub fn listing_prefix(variable: &str, period: Frequency, time: Option<TimeStep>) -> String {
        let base = format!("{}_{}", variable, period.file_label());
        match time {
            Some(t) => format!("{base}/{base}.{t:0width$}.", width = TIME_WIDTH),
            None => format!("{base}/{base}."),
        }
    }
}

impl fmt::Display for EccoFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}.{:0width$}.{}",
            self.prefix,
            self.averaging_period.file_label(),
            self.time,
            self.ext,
            width = TIME_WIDTH
        )
    }
}

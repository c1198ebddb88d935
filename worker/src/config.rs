use std::{env, path::PathBuf, time::Duration};

/// Configuración del host, leída de variables de entorno.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub bind: String,
    /// Invocaciones simultáneas
    pub concurrency: usize,
    /// Copias simultáneas del pool de staging
    pub fetch_concurrency: usize,
    pub scratch_dir: PathBuf,
    /// Timeout por defecto de las funciones nuevas
    pub function_timeout_secs: u64,
    /// Espera antes de pasar una función de Pending a Active/Failed
    pub activation_delay: Duration,
    /// Tamaño de página de los listados de logs
    pub page_size: usize,
    /// Los eventos de log más viejos que esto se descartan
    pub log_retention: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9090".to_string(),
            concurrency: 4,
            fetch_concurrency: 8,
            scratch_dir: env::temp_dir().join("ecco_scratch"),
            function_timeout_secs: 900,
            activation_delay: Duration::from_millis(500),
            page_size: 50,
            log_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Valores ausentes o que no parsean quedan en su default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str, default: u64| {
            get(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            bind: get("HOST_BIND").unwrap_or(defaults.bind),
            concurrency: number("HOST_CONCURRENCY", defaults.concurrency as u64).max(1) as usize,
            fetch_concurrency: number("FETCH_CONCURRENCY", defaults.fetch_concurrency as u64)
                .max(1) as usize,
            scratch_dir: get("SCRATCH_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_dir),
            function_timeout_secs: number("FUNCTION_TIMEOUT_SECS", defaults.function_timeout_secs)
                .max(1),
            activation_delay: Duration::from_millis(number(
                "ACTIVATION_DELAY_MS",
                defaults.activation_delay.as_millis() as u64,
            )),
            page_size: defaults.page_size,
            log_retention: Duration::from_secs(
                number("LOG_RETENTION_SECS", defaults.log_retention.as_secs()).max(1),
            ),
        }
    }
}

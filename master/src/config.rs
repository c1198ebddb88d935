use ecco_common::{Dimension, GranuleNaming, ModelCalendar, ProductType};
use serde::Deserialize;
use std::{collections::BTreeMap, env, fs, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no se pudo leer {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("configuración inválida en {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("falta el parámetro de configuración `{0}`")]
    Missing(&'static str),
    #[error("valor inválido para {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Clase de función: una por (dimensión × product type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionClass {
    pub dimension: Dimension,
    pub product_type: ProductType,
}

impl FunctionClass {
    /// Clave en los mapas de configuración, ej: "3D_latlon"
    pub fn key(&self) -> String {
        format!("{}_{}", self.dimension, self.product_type)
    }
}

/// Configuración del orquestador. Todo tiene default; el archivo JSON y
/// las variables de entorno sólo pisan lo que traen.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub run_name: Option<String>,

    pub source_root: String,
    pub destination_root: String,
    pub grouping_dir: PathBuf,
    pub job_log_dir: PathBuf,
    pub task_list_dir: PathBuf,

    /// URL base del host de funciones
    pub host_url: String,
    pub image_ref: String,
    pub function_prefix: String,
    pub function_timeout_secs: u64,

    /// "<dim>_<tipo>" -> MB
    pub memory_sizes: BTreeMap<String, u32>,
    pub default_memory_size: u32,
    /// "<dim>_<tipo>" -> segundos por campo y nivel vertical
    pub per_field_seconds: BTreeMap<String, f64>,
    pub default_per_field_seconds: f64,
    pub max_window_seconds: f64,
    pub override_ceiling: Option<usize>,
    pub vertical_levels: u32,

    pub unit_price_per_gb_second: f64,

    pub poll_interval_secs: u64,
    pub wall_clock_ceiling_secs: u64,
    pub streams_per_query: usize,

    pub dispatch_concurrency: usize,
    pub dispatch_attempts: u32,
    pub dispatch_retry_delay_ms: u64,
    pub require_confirmation: bool,

    pub max_retry_rounds: u32,
    pub activation_poll_secs: u64,
    pub activation_timeout_secs: u64,

    pub calendar: ModelCalendar,
    pub naming: GranuleNaming,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            run_name: None,
            source_root: String::new(),
            destination_root: String::new(),
            grouping_dir: PathBuf::from("metadata"),
            job_log_dir: PathBuf::from("job_logs"),
            task_list_dir: PathBuf::from("task_lists"),
            host_url: "http://localhost:9090".to_string(),
            image_ref: String::new(),
            function_prefix: "ecco_granule".to_string(),
            function_timeout_secs: 900,
            memory_sizes: BTreeMap::new(),
            default_memory_size: 1024,
            per_field_seconds: BTreeMap::new(),
            default_per_field_seconds: 10.0,
            max_window_seconds: 900.0,
            override_ceiling: None,
            vertical_levels: 50,
            unit_price_per_gb_second: 0.000_016_666_7,
            poll_interval_secs: 30,
            wall_clock_ceiling_secs: 4 * 3600,
            streams_per_query: 100,
            dispatch_concurrency: 8,
            dispatch_attempts: 3,
            dispatch_retry_delay_ms: 500,
            require_confirmation: false,
            max_retry_rounds: 3,
            activation_poll_secs: 2,
            activation_timeout_secs: 300,
            calendar: ModelCalendar::default(),
            naming: GranuleNaming::default(),
        }
    }
}

impl Config {
    /// Lee el archivo (si hay), aplica el entorno y valida.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => {
                let text = fs::read_to_string(p).map_err(|source| ConfigError::Read {
                    path: p.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: p.to_path_buf(),
                    source,
                })?
            }
            None => Config::default(),
        };

        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Variables de entorno con prioridad sobre el archivo.
    pub fn apply_env<F>(&mut self, get: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get("ECCO_HOST_URL") {
            self.host_url = v;
        }
        if let Some(v) = get("ECCO_SOURCE_ROOT") {
            self.source_root = v;
        }
        if let Some(v) = get("ECCO_DESTINATION_ROOT") {
            self.destination_root = v;
        }
        if let Some(v) = get("ECCO_IMAGE_REF") {
            self.image_ref = v;
        }
        if let Some(v) = get("ECCO_JOB_LOG_DIR") {
            self.job_log_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ECCO_REQUIRE_CONFIRMATION") {
            self.require_confirmation = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "y" => true,
                "0" | "false" | "no" | "n" | "" => false,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "ECCO_REQUIRE_CONFIRMATION",
                        value: v,
                    })
                }
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image_ref.trim().is_empty() {
            return Err(ConfigError::Missing("image_ref"));
        }
        if self.source_root.trim().is_empty() {
            return Err(ConfigError::Missing("source_root"));
        }
        if self.destination_root.trim().is_empty() {
            return Err(ConfigError::Missing("destination_root"));
        }
        if self.grouping_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("grouping_dir"));
        }
        if self.max_window_seconds <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "max_window_seconds",
                value: self.max_window_seconds.to_string(),
            });
        }
        if self.override_ceiling == Some(0) {
            return Err(ConfigError::Invalid {
                key: "override_ceiling",
                value: "0".to_string(),
            });
        }
        Ok(())
    }

    pub fn memory_size(&self, class: FunctionClass) -> u32 {
        self.memory_sizes
            .get(&class.key())
            .copied()
            .unwrap_or(self.default_memory_size)
    }

    pub fn per_field_seconds(&self, class: FunctionClass) -> f64 {
        self.per_field_seconds
            .get(&class.key())
            .copied()
            .unwrap_or(self.default_per_field_seconds)
    }

    pub fn vertical_levels(&self, dimension: Dimension) -> u32 {
        match dimension {
            Dimension::ThreeD => self.vertical_levels.max(1),
            Dimension::OneD | Dimension::TwoD => 1,
        }
    }

    pub fn function_name(&self, class: FunctionClass) -> String {
        format!("{}_{}", self.function_prefix, class.key())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn wall_clock_ceiling(&self) -> Duration {
        Duration::from_secs(self.wall_clock_ceiling_secs)
    }

    pub fn job_log_path(&self, run_name: &str) -> PathBuf {
        self.job_log_dir.join(format!("{}.json", run_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> Config {
        Config {
            source_root: "/data/src".to_string(),
            destination_root: "/data/out".to_string(),
            image_ref: "/opt/ecco/generate".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn json_parcial_usa_defaults() {
        let json = r#"{"source_root": "/s", "destination_root": "/d", "image_ref": "img",
                       "memory_sizes": {"3D_latlon": 4096}, "calendar": {"start": "2000-01-01T00:00:00",
                       "end": "2001-01-01T00:00:00", "timestepSeconds": 3600}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.max_window_seconds, 900.0);

        let class = FunctionClass {
            dimension: Dimension::ThreeD,
            product_type: ProductType::Latlon,
        };
        assert_eq!(config.memory_size(class), 4096);
        assert_eq!(config.function_name(class), "ecco_granule_3D_latlon");
        let other = FunctionClass {
            dimension: Dimension::TwoD,
            product_type: ProductType::Native,
        };
        assert_eq!(config.memory_size(other), 1024);
        assert_eq!(config.calendar.timestep_seconds, 3600);
    }

    #[test]
    fn entorno_pisa_el_archivo() {
        let env: HashMap<&str, &str> = [
            ("ECCO_HOST_URL", "http://host:1"),
            ("ECCO_REQUIRE_CONFIRMATION", "yes"),
        ]
        .into_iter()
        .collect();
        let mut config = valid();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.host_url, "http://host:1");
        assert!(config.require_confirmation);

        let err = valid()
            .apply_env(|k| (k == "ECCO_REQUIRE_CONFIRMATION").then(|| "quizas".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn falta_imagen_es_error() {
        let config = Config {
            image_ref: String::new(),
            ..valid()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Missing("image_ref"))));
    }

    #[test]
    fn techo_cero_es_invalido() {
        let config = Config {
            override_ceiling: Some(0),
            ..valid()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "override_ceiling", .. })
        ));
        let config = Config {
            override_ceiling: Some(1),
            ..valid()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn niveles_verticales_solo_en_3d() {
        let config = valid();
        assert_eq!(config.vertical_levels(Dimension::ThreeD), 50);
        assert_eq!(config.vertical_levels(Dimension::TwoD), 1);
    }
}

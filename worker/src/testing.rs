//! Piezas compartidas por los tests del host.

use async_trait::async_trait;
use chrono::Utc;
use ecco_common::api::{FunctionConfiguration, FunctionState};
use ecco_common::{
    Dimension, DynamicMetadata, Frequency, JobTuple, LocalStore, ProductType, Task, TimeStep,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    env, fs, io,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::config::HostConfig;
use crate::generator::{GenerateError, GranuleGenerator};
use crate::state::{FunctionEntry, HostState};

/// Falla los time steps indicados y anota las tareas que recibe.
#[derive(Default)]
pub struct FakeGenerator {
    pub failing: BTreeSet<TimeStep>,
    pub crash: bool,
    pub delay: Option<Duration>,
    pub seen: Mutex<Vec<Task>>,
}

#[async_trait]
impl GranuleGenerator for FakeGenerator {
    async fn generate(&self, image_ref: &str, task: &Task) -> Result<(), GenerateError> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.crash {
            return Err(GenerateError::Spawn {
                image: image_ref.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no existe"),
            });
        }
        self.seen.lock().unwrap().push(task.clone());
        if self.failing.contains(&task.time_step) {
            return Err(GenerateError::Exit {
                code: Some(2),
                stderr: "falla de prueba".to_string(),
            });
        }
        Ok(())
    }
}

pub fn temp_dir(sub: &str) -> PathBuf {
    let base = env::temp_dir().join("host_tests").join(sub);
    let _ = fs::remove_dir_all(&base);
    fs::create_dir_all(&base).unwrap();
    base
}

/// Tarea sin entradas: el staging no copia nada.
pub fn sample_task(time_step: TimeStep) -> Task {
    Task {
        granule_uri: format!("/dest/SSH/SSH_day_mean_{}.nc", time_step),
        job: JobTuple {
            grouping_id: 0,
            product_type: ProductType::Latlon,
            frequency: Frequency::AvgDay,
        },
        time_step,
        variable_inputs: BTreeMap::new(),
        dynamic_metadata: DynamicMetadata {
            name: "SSH".to_string(),
            dimension: Dimension::TwoD,
            time_coverage_start: "1992-01-01T00:00:00".to_string(),
            time_coverage_end: "1992-01-02T00:00:00".to_string(),
            time_coverage_center: "1992-01-01T12:00:00".to_string(),
            frequency_label: "P1D".to_string(),
        },
        source_root: "/src".to_string(),
        destination_root: "/dest".to_string(),
    }
}

/// Estado con scratch propio y activación inmediata.
pub fn test_state(sub: &str, generator: Arc<FakeGenerator>) -> (HostState, PathBuf) {
    let base = temp_dir(sub);
    let config = HostConfig {
        scratch_dir: base.join("scratch"),
        activation_delay: Duration::from_millis(0),
        page_size: 2,
        ..HostConfig::default()
    };
    (HostState::new(config, Arc::new(LocalStore), generator), base)
}

/// Registra una función ya activa.
pub fn add_active(state: &HostState, name: &str, image_ref: &str, timeout_secs: u64) -> FunctionConfiguration {
    let config = FunctionConfiguration {
        name: name.to_string(),
        memory_size: 512,
        image_ref: image_ref.to_string(),
        last_modified: Utc::now(),
        state: FunctionState::Active,
        state_reason: None,
        timeout_secs,
    };
    state.functions.lock().unwrap().insert(
        name.to_string(),
        FunctionEntry {
            config: config.clone(),
            cold: true,
            generation: 1,
        },
    );
    config
}

use chrono::Utc;
use ecco_common::api::{FunctionConfiguration, FunctionState};
use ecco_common::ObjectStore;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::Semaphore;

use crate::config::HostConfig;
use crate::generator::GranuleGenerator;
use crate::logs::LogStore;
use crate::staging::Stager;

/// Lock que ignora el envenenamiento.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub struct FunctionEntry {
    pub config: FunctionConfiguration,
    /// La próxima invocación paga el arranque en frío
    pub cold: bool,
    /// Sube con cada create/update; la activación vieja no pisa a la nueva
    pub generation: u64,
}

#[derive(Clone)]
pub struct HostState {
    pub config: Arc<HostConfig>,
    pub functions: Arc<Mutex<HashMap<String, FunctionEntry>>>,
    pub logs: Arc<Mutex<LogStore>>,
    // invocaciones en curso
    pub slots: Arc<Semaphore>,
    pub stager: Stager,
    pub generator: Arc<dyn GranuleGenerator>,
}

impl HostState {
    pub fn new(
        config: HostConfig,
        store: Arc<dyn ObjectStore>,
        generator: Arc<dyn GranuleGenerator>,
    ) -> Self {
        let stager = Stager::new(store, config.scratch_dir.clone(), config.fetch_concurrency);
        let logs = LogStore::with_retention(config.log_retention);
        Self {
            slots: Arc::new(Semaphore::new(config.concurrency)),
            config: Arc::new(config),
            functions: Arc::new(Mutex::new(HashMap::new())),
            logs: Arc::new(Mutex::new(logs)),
            stager,
            generator,
        }
    }

    pub fn function(&self, name: &str) -> Option<FunctionEntry> {
        lock(&self.functions).get(name).cloned()
    }

    /// Deja la función en Pending con una generación nueva y la devuelve.
    pub fn put_pending(&self, mut config: FunctionConfiguration) -> (FunctionConfiguration, u64) {
        let mut functions = lock(&self.functions);
        let generation = functions.get(&config.name).map(|e| e.generation + 1).unwrap_or(1);
        config.state = FunctionState::Pending;
        config.state_reason = None;
        config.last_modified = Utc::now();
        functions.insert(
            config.name.clone(),
            FunctionEntry {
                config: config.clone(),
                cold: true,
                generation,
            },
        );
        (config, generation)
    }

    /// Cierra la activación si nadie tocó la función mientras tanto.
    pub fn settle(&self, name: &str, generation: u64, state: FunctionState, reason: Option<String>) -> bool {
        let mut functions = lock(&self.functions);
        match functions.get_mut(name) {
            Some(entry) if entry.generation == generation => {
                entry.config.state = state;
                entry.config.state_reason = reason;
                true
            }
            _ => false,
        }
    }

    /// Devuelve si esta invocación es fría y apaga la marca.
    pub fn take_cold(&self, name: &str) -> bool {
        let mut functions = lock(&self.functions);
        match functions.get_mut(name) {
            Some(entry) => std::mem::replace(&mut entry.cold, false),
            None => false,
        }
    }

    pub fn append_log(&self, group: &str, stream: &str, message: String) {
        let now = Utc::now().timestamp_millis();
        lock(&self.logs).append(group, stream, now, message);
    }
}

//! Backends en memoria para los tests del orquestador.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ecco_common::api::{
    log_group_for, CreateFunctionRequest, FilterEventsRequest, FilterEventsResponse,
    FunctionConfiguration, FunctionState, ImageInfo, ListStreamsResponse, LogEvent, LogStream,
    UpdateFunctionRequest,
};
use ecco_common::report::{
    format_end, format_error, format_failures, format_report, format_start, FilterPattern,
};
use ecco_common::{Batch, PerformanceReport, TimeStep};
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    },
};

use crate::backend::{BackendError, ComputeBackend, ImageRegistry, LogBackend};

pub fn old_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
        .single()
        .unwrap()
}

/// Host falso: registra llamadas y, si `auto_complete` está activo, escribe
/// los logs de cada invocación en el momento de recibirla.
pub struct FakeBackend {
    pub functions: Mutex<HashMap<String, FunctionConfiguration>>,
    pub image_pushed: Mutex<DateTime<Utc>>,
    /// Estado que toma una función después de create/update
    pub activate_as: Mutex<FunctionState>,
    pub calls: Mutex<Vec<String>>,
    pub invocations: Mutex<Vec<(String, Batch)>>,
    /// Lotes (por índice) cuyo envío siempre falla
    pub reject_batches: Mutex<HashSet<usize>>,
    /// Time steps que fallan la primera vez que se ejecutan
    pub fail_once: Mutex<BTreeSet<TimeStep>>,
    /// El runtime revienta sin lista de time steps
    pub crash_batches: Mutex<HashSet<usize>>,
    pub auto_complete: AtomicBool,
    pub logs_down: AtomicBool,
    pub stream_page: usize,
    pub event_page: usize,
    pub max_streams_per_query: AtomicUsize,
    streams: Mutex<HashMap<String, Vec<LogStream>>>,
    events: Mutex<Vec<(String, LogEvent)>>,
    counter: AtomicU64,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            functions: Mutex::new(HashMap::new()),
            image_pushed: Mutex::new(old_date()),
            activate_as: Mutex::new(FunctionState::Active),
            calls: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            reject_batches: Mutex::new(HashSet::new()),
            fail_once: Mutex::new(BTreeSet::new()),
            crash_batches: Mutex::new(HashSet::new()),
            auto_complete: AtomicBool::new(true),
            logs_down: AtomicBool::new(false),
            stream_page: 2,
            event_page: 3,
            max_streams_per_query: AtomicUsize::new(0),
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        }
    }
}

impl FakeBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn invoked(&self) -> Vec<(String, Batch)> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn add_function(&self, config: FunctionConfiguration) {
        self.functions
            .lock()
            .unwrap()
            .insert(config.name.clone(), config);
    }

    /// Escribe líneas en un stream propio de la invocación.
    pub fn emit(&self, function_name: &str, id: &str, lines: &[String]) {
        let group = log_group_for(function_name);
        let now = Utc::now().timestamp_millis();
        let stream = format!("2026/01/01/[$LATEST]{}", id);

        {
            let mut streams = self.streams.lock().unwrap();
            let list = streams.entry(group.clone()).or_default();
            list.retain(|s| s.name != stream);
            list.push(LogStream {
                name: stream.clone(),
                last_event_ms: now,
            });
        }

        let mut events = self.events.lock().unwrap();
        for line in lines {
            events.push((
                group.clone(),
                LogEvent {
                    stream: stream.clone(),
                    timestamp_ms: now,
                    message: line.clone(),
                },
            ));
        }
    }

    pub fn report(memory_size_mb: u32, billed_duration_ms: u64) -> PerformanceReport {
        PerformanceReport {
            duration_ms: billed_duration_ms as f64 - 0.5,
            billed_duration_ms,
            memory_size_mb,
            max_memory_used_mb: Some(64),
            init_duration_ms: None,
        }
    }

    fn run(&self, name: &str, id: &str, batch: &Batch, memory: u32) {
        let mut lines = vec![format_start(id)];

        if self.crash_batches.lock().unwrap().contains(&batch.index) {
            lines.push(format_error(id, "Runtime.ExitError"));
        } else {
            let mut fail_once = self.fail_once.lock().unwrap();
            let failed: BTreeSet<TimeStep> = batch
                .time_steps
                .iter()
                .copied()
                .filter(|t| fail_once.remove(t))
                .collect();
            if !failed.is_empty() {
                lines.push(format_failures(id, &failed));
            }
        }

        lines.push(format_end(id));
        lines.push(format_report(id, &Self::report(memory, 1000)));
        self.emit(name, id, &lines);
    }
}

#[async_trait]
impl ComputeBackend for FakeBackend {
    async fn list_functions(&self) -> Result<Vec<FunctionConfiguration>, BackendError> {
        self.calls.lock().unwrap().push("list".to_string());
        Ok(self.functions.lock().unwrap().values().cloned().collect())
    }

    async fn get_function(&self, name: &str) -> Result<FunctionConfiguration, BackendError> {
        self.functions
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(name.to_string()))
    }

    async fn create_function(
        &self,
        req: &CreateFunctionRequest,
    ) -> Result<FunctionConfiguration, BackendError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("create:{}", req.name));
        let state = *self.activate_as.lock().unwrap();
        let config = FunctionConfiguration {
            name: req.name.clone(),
            memory_size: req.memory_size,
            image_ref: req.image_ref.clone(),
            last_modified: Utc::now(),
            state,
            state_reason: (state == FunctionState::Failed).then(|| "imagen inexistente".to_string()),
            timeout_secs: req.timeout_secs.unwrap_or(900),
        };
        self.add_function(config.clone());
        Ok(FunctionConfiguration {
            state: FunctionState::Pending,
            ..config
        })
    }

    async fn update_function(
        &self,
        name: &str,
        req: &UpdateFunctionRequest,
    ) -> Result<FunctionConfiguration, BackendError> {
        self.calls.lock().unwrap().push(format!("update:{}", name));
        let state = *self.activate_as.lock().unwrap();
        let mut functions = self.functions.lock().unwrap();
        let f = functions
            .get_mut(name)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;
        if let Some(image) = &req.image_ref {
            f.image_ref = image.clone();
        }
        if let Some(memory) = req.memory_size {
            f.memory_size = memory;
        }
        f.last_modified = Utc::now();
        f.state = state;
        Ok(f.clone())
    }

    async fn invoke_async(&self, name: &str, batch: &Batch) -> Result<String, BackendError> {
        if self.reject_batches.lock().unwrap().contains(&batch.index) {
            return Err(BackendError::Status {
                status: 429,
                body: "TooManyRequests".to_string(),
            });
        }
        let memory = self
            .functions
            .lock()
            .unwrap()
            .get(name)
            .map(|f| f.memory_size)
            .ok_or_else(|| BackendError::NotFound(name.to_string()))?;

        let id = format!("inv-{:04}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.invocations
            .lock()
            .unwrap()
            .push((name.to_string(), batch.clone()));
        if self.auto_complete.load(Ordering::SeqCst) {
            self.run(name, &id, batch, memory);
        }
        Ok(id)
    }
}

#[async_trait]
impl ImageRegistry for FakeBackend {
    async fn describe_image(&self, image_ref: &str) -> Result<ImageInfo, BackendError> {
        Ok(ImageInfo {
            image_ref: image_ref.to_string(),
            last_pushed: *self.image_pushed.lock().unwrap(),
            digest: None,
        })
    }
}

fn page<T: Clone>(items: &[T], token: Option<&str>, size: usize) -> (Vec<T>, Option<String>) {
    let start: usize = token.and_then(|t| t.parse().ok()).unwrap_or(0);
    let end = (start + size.max(1)).min(items.len());
    let next = (end < items.len()).then(|| end.to_string());
    (items.get(start..end).unwrap_or_default().to_vec(), next)
}

#[async_trait]
impl LogBackend for FakeBackend {
    async fn list_streams(
        &self,
        group: &str,
        next_token: Option<String>,
    ) -> Result<ListStreamsResponse, BackendError> {
        if self.logs_down.load(Ordering::SeqCst) {
            return Err(BackendError::Status {
                status: 503,
                body: "logs no disponibles".to_string(),
            });
        }
        let all = self
            .streams
            .lock()
            .unwrap()
            .get(group)
            .cloned()
            .unwrap_or_default();
        let (streams, next_token) = page(&all, next_token.as_deref(), self.stream_page);
        Ok(ListStreamsResponse {
            streams,
            next_token,
        })
    }

    async fn filter_events(
        &self,
        req: &FilterEventsRequest,
    ) -> Result<FilterEventsResponse, BackendError> {
        self.max_streams_per_query
            .fetch_max(req.streams.len(), Ordering::SeqCst);
        let pattern = FilterPattern::parse(&req.pattern);
        let matching: Vec<LogEvent> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|(group, _)| *group == req.group)
            .map(|(_, e)| e)
            .filter(|e| req.streams.is_empty() || req.streams.contains(&e.stream))
            .filter(|e| e.timestamp_ms >= req.start_ms && e.timestamp_ms <= req.end_ms)
            .filter(|e| pattern.matches(&e.message))
            .cloned()
            .collect();
        let (events, next_token) = page(&matching, req.next_token.as_deref(), self.event_page);
        Ok(FilterEventsResponse { events, next_token })
    }
}

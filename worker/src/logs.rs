use ecco_common::api::{
    FilterEventsRequest, FilterEventsResponse, ListStreamsResponse, LogEvent, LogStream,
};
use ecco_common::report::FilterPattern;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Logs en memoria: grupo -> stream -> eventos en orden de llegada.
/// Con retención, cada escritura descarta los eventos del grupo que quedaron
/// fuera de la ventana y los streams que se vaciaron.
#[derive(Debug, Default)]
pub struct LogStore {
    groups: HashMap<String, BTreeMap<String, Vec<LogEvent>>>,
    retention_ms: Option<i64>,
}

fn offset(token: Option<&str>) -> usize {
    token.and_then(|t| t.parse().ok()).unwrap_or(0)
}

fn next_token(start: usize, taken: usize, total: usize) -> Option<String> {
    let end = start + taken;
    (end < total).then(|| end.to_string())
}

impl LogStore {
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            groups: HashMap::new(),
            retention_ms: Some(i64::try_from(retention.as_millis()).unwrap_or(i64::MAX)),
        }
    }

    pub fn append(&mut self, group: &str, stream: &str, timestamp_ms: i64, message: String) {
        let streams = self.groups.entry(group.to_string()).or_default();
        if let Some(retention) = self.retention_ms {
            let cutoff = timestamp_ms.saturating_sub(retention);
            streams.retain(|_, events| {
                events.retain(|e| e.timestamp_ms >= cutoff);
                !events.is_empty()
            });
        }
        streams.entry(stream.to_string()).or_default().push(LogEvent {
            stream: stream.to_string(),
            timestamp_ms,
            message,
        });
    }

    /// Streams del grupo ordenados por nombre, paginados por offset.
    pub fn list_streams(&self, group: &str, token: Option<&str>, page: usize) -> ListStreamsResponse {
        let Some(streams) = self.groups.get(group) else {
            return ListStreamsResponse::default();
        };

        let start = offset(token);
        let listed: Vec<LogStream> = streams
            .iter()
            .skip(start)
            .take(page.max(1))
            .map(|(name, events)| LogStream {
                name: name.clone(),
                last_event_ms: events.last().map(|e| e.timestamp_ms).unwrap_or(0),
            })
            .collect();

        ListStreamsResponse {
            next_token: next_token(start, listed.len(), streams.len()),
            streams: listed,
        }
    }

    /// Eventos del grupo dentro de `[start_ms, end_ms]` que cumplen el patrón,
    /// ordenados por tiempo y stream.
    pub fn filter(&self, req: &FilterEventsRequest, page: usize) -> FilterEventsResponse {
        let Some(streams) = self.groups.get(&req.group) else {
            return FilterEventsResponse::default();
        };
        let pattern = FilterPattern::parse(&req.pattern);

        let mut matched: Vec<&LogEvent> = streams
            .iter()
            .filter(|(name, _)| req.streams.is_empty() || req.streams.contains(name))
            .flat_map(|(_, events)| events.iter())
            .filter(|e| e.timestamp_ms >= req.start_ms && e.timestamp_ms <= req.end_ms)
            .filter(|e| pattern.matches(&e.message))
            .collect();
        // estable: dentro de un stream se conserva el orden de escritura
        matched.sort_by(|a, b| (a.timestamp_ms, &a.stream).cmp(&(b.timestamp_ms, &b.stream)));

        let start = offset(req.next_token.as_deref());
        let limit = req.limit.unwrap_or(page).clamp(1, page.max(1));
        let events: Vec<LogEvent> = matched
            .iter()
            .skip(start)
            .take(limit)
            .map(|e| (*e).clone())
            .collect();

        FilterEventsResponse {
            next_token: next_token(start, events.len(), matched.len()),
            events,
        }
    }
}

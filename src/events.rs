//! Async publish/subscribe hub for pipeline lifecycle events
//!
//! Subscribers register an async handler; each gets its own bounded channel
//! drained by a dispatcher task, so a slow handler never stalls the
//! publisher or its peers. Published events are also appended to a bounded
//! in-memory history for inspection.

use crate::error::Result;
use crate::types::CorrelationId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default number of events retained in history
pub const DEFAULT_HISTORY_CAP: usize = 256;

// Per-subscriber queue depth before events are dropped for that subscriber.
const SUBSCRIBER_CHANNEL_CAP: usize = 128;

/// Kinds of lifecycle events the core emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A collaborator call started
    AgentStarted,
    /// A collaborator call finished successfully
    AgentCompleted,
    /// A collaborator call failed
    AgentFailed,
    /// A pipeline step started
    StepStarted,
    /// A pipeline step finished successfully
    StepCompleted,
    /// A pipeline step failed
    StepFailed,
    /// A pipeline execution started
    PipelineStarted,
    /// A pipeline execution finished successfully
    PipelineCompleted,
    /// A pipeline execution failed
    PipelineFailed,
    /// A completed record was archived
    DataPersisted,
    /// Archiving a completed record failed after all attempts
    DataPersistFailed,
    /// Generic service-level message
    System,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::AgentStarted => "agent_started",
            EventType::AgentCompleted => "agent_completed",
            EventType::AgentFailed => "agent_failed",
            EventType::StepStarted => "step_started",
            EventType::StepCompleted => "step_completed",
            EventType::StepFailed => "step_failed",
            EventType::PipelineStarted => "pipeline_started",
            EventType::PipelineCompleted => "pipeline_completed",
            EventType::PipelineFailed => "pipeline_failed",
            EventType::DataPersisted => "data_persisted",
            EventType::DataPersistFailed => "data_persist_failed",
            EventType::System => "system",
        };
        write!(f, "{s}")
    }
}

/// One immutable lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Kind of event
    pub event_type: EventType,
    /// Component or agent that emitted it
    pub source: String,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Optional structured payload
    #[serde(default)]
    pub payload: Option<Value>,
    /// Token linking events of one execution
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

impl Event {
    /// Create an event with the current timestamp
    pub fn new(event_type: EventType, source: impl Into<String>) -> Self {
        Self {
            event_type,
            source: source.into(),
            timestamp: Utc::now(),
            payload: None,
            correlation_id: None,
        }
    }

    /// Attach a structured payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Attach a correlation token
    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Handle for removing a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

struct Subscriber {
    id: u64,
    predicate: Predicate,
    tx: mpsc::Sender<Event>,
}

struct BusInner {
    history: Mutex<VecDeque<Event>>,
    history_cap: usize,
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// Publish/subscribe hub with bounded history
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the default history capacity
    pub fn new() -> Self {
        Self::with_history_cap(DEFAULT_HISTORY_CAP)
    }

    /// Create a bus retaining at most `cap` events
    pub fn with_history_cap(cap: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                history: Mutex::new(VecDeque::with_capacity(cap.min(1024))),
                history_cap: cap.max(1),
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish an event: append it to history, fan it out, and return the
    /// number of subscribers notified.
    ///
    /// Fan-out never blocks; a subscriber whose queue is full misses the
    /// event (logged) rather than stalling the publisher.
    pub fn publish(&self, event: Event) -> usize {
        {
            let mut history = self.inner.history.lock();
            if history.len() >= self.inner.history_cap {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let subscribers = self.inner.subscribers.read();
        let mut notified = 0;
        for sub in subscribers.iter() {
            if !(sub.predicate)(&event) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => notified += 1,
                Err(e) => {
                    tracing::warn!(subscriber = sub.id, "event dropped for slow subscriber: {e}");
                }
            }
        }
        notified
    }

    /// Subscribe to a single event type
    pub fn subscribe<F, Fut>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_subscriber(Arc::new(move |e: &Event| e.event_type == event_type), handler)
    }

    /// Subscribe to several event types at once
    pub fn subscribe_multiple<F, Fut>(
        &self,
        event_types: Vec<EventType>,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_subscriber(
            Arc::new(move |e: &Event| event_types.contains(&e.event_type)),
            handler,
        )
    }

    /// Subscribe with an arbitrary predicate over the full event
    pub fn subscribe_filtered<P, F, Fut>(&self, predicate: P, handler: F) -> SubscriptionId
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.add_subscriber(Arc::new(predicate), handler)
    }

    fn add_subscriber<F, Fut>(&self, predicate: Predicate, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::channel::<Event>(SUBSCRIBER_CHANNEL_CAP);
        self.inner
            .subscribers
            .write()
            .push(Subscriber { id, predicate, tx });

        // One dispatcher task per subscriber: delivery is FIFO for this
        // subscriber and a failing handler is isolated here.
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = handler(event).await {
                    tracing::warn!(subscriber = id, error = %e, "event handler failed");
                }
            }
        });

        SubscriptionId(id)
    }

    /// Remove a subscription; its dispatcher task drains and exits
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id.0);
        subscribers.len() != before
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Snapshot of the retained history, oldest first
    pub fn history(&self) -> Vec<Event> {
        self.inner.history.lock().iter().cloned().collect()
    }

    /// Retained events belonging to one execution
    pub fn history_for(&self, correlation_id: &CorrelationId) -> Vec<Event> {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|e| e.correlation_id.as_ref() == Some(correlation_id))
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

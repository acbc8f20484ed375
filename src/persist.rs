//! Archival of completed execution records
//!
//! Completed runs are handed to an external archive service. The call is
//! deliberately not fire-and-forget: a fixed attempt budget with a
//! per-request timeout, and the outcome always lands on the event bus as
//! `DataPersisted` or `DataPersistFailed` so a lost archive is visible.

use crate::events::{Event, EventBus, EventType};
use crate::store::ExecutionRecord;
use crate::types::CorrelationId;
use serde_json::json;
use std::time::Duration;
use url::Url;

/// Settings for the archive collaborator
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Archive endpoint records are POSTed to
    pub endpoint: Url,
    /// Total attempts before giving up
    pub attempts: u32,
    /// Per-request timeout
    pub timeout: Duration,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl PersistConfig {
    /// Create a config with the default retry budget
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            attempts: 3,
            timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(2),
        }
    }

    /// Set the attempt budget
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the pause between attempts
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }
}

/// Client posting completed records to the archive service
pub struct PersistClient {
    config: PersistConfig,
    client: reqwest::Client,
    bus: EventBus,
}

impl PersistClient {
    /// Create a client reporting outcomes on the given bus
    pub fn new(config: PersistConfig, bus: EventBus) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            bus,
        }
    }

    /// Archive one terminal record, retrying within the attempt budget.
    ///
    /// Never returns an error: the outcome is reported through the bus.
    pub async fn persist(&self, record: &ExecutionRecord, correlation_id: CorrelationId) {
        let payload = json!({
            "execution_id": record.id,
            "pipeline_name": record.pipeline_name,
            "input_data": record.input,
            "status": record.status,
            "started_at": record.started_at,
            "completed_at": record.completed_at,
            "result": record.results,
        });

        for attempt in 1..=self.config.attempts {
            let response = self
                .client
                .post(self.config.endpoint.clone())
                .timeout(self.config.timeout)
                .json(&payload)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    tracing::info!(execution = %record.id, attempt, "execution record archived");
                    self.bus.publish(
                        Event::new(EventType::DataPersisted, "persist_client")
                            .with_payload(json!({
                                "execution_id": record.id,
                                "attempts": attempt,
                            }))
                            .with_correlation(correlation_id),
                    );
                    return;
                }
                Ok(resp) => {
                    tracing::warn!(
                        execution = %record.id,
                        attempt,
                        status = %resp.status(),
                        "archive service rejected record"
                    );
                }
                Err(e) => {
                    tracing::warn!(execution = %record.id, attempt, error = %e, "archive request failed");
                }
            }

            if attempt < self.config.attempts {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }

        tracing::error!(
            execution = %record.id,
            attempts = self.config.attempts,
            "giving up on archiving execution record"
        );
        self.bus.publish(
            Event::new(EventType::DataPersistFailed, "persist_client")
                .with_payload(json!({
                    "execution_id": record.id,
                    "attempts": self.config.attempts,
                }))
                .with_correlation(correlation_id),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn terminal_record() -> ExecutionRecord {
        let mut record = ExecutionRecord::new("default", json!("build it"), Vec::new());
        record.finish(crate::types::ExecutionStatus::Completed, None);
        record
    }

    fn client_for(server: &mockito::ServerGuard, bus: EventBus, attempts: u32) -> PersistClient {
        let endpoint = Url::parse(&format!("{}/projects/save-generated", server.url())).unwrap();
        let config = PersistConfig::new(endpoint)
            .with_attempts(attempts)
            .with_retry_delay(Duration::from_millis(1));
        PersistClient::new(config, bus)
    }

    fn event_types(bus: &EventBus) -> Vec<EventType> {
        bus.history().iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn successful_archive_reports_data_persisted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/projects/save-generated")
            .with_status(200)
            .create_async()
            .await;

        let bus = EventBus::new();
        let record = terminal_record();
        client_for(&server, bus.clone(), 3)
            .persist(&record, CorrelationId::from(record.id))
            .await;

        mock.assert_async().await;
        assert_eq!(event_types(&bus), vec![EventType::DataPersisted]);
    }

    #[tokio::test]
    async fn exhausted_attempts_report_data_persist_failed() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/projects/save-generated")
            .with_status(500)
            .expect(2)
            .create_async()
            .await;

        let bus = EventBus::new();
        let record = terminal_record();
        client_for(&server, bus.clone(), 2)
            .persist(&record, CorrelationId::from(record.id))
            .await;

        mock.assert_async().await;
        assert_eq!(event_types(&bus), vec![EventType::DataPersistFailed]);
    }

    #[tokio::test]
    async fn archived_payload_carries_the_record_essentials() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/projects/save-generated")
            .match_body(mockito::Matcher::PartialJson(json!({
                "pipeline_name": "default",
                "status": "completed",
                "input_data": "build it",
            })))
            .with_status(200)
            .create_async()
            .await;

        let bus = EventBus::new();
        let record = terminal_record();
        client_for(&server, bus.clone(), 1)
            .persist(&record, CorrelationId::from(record.id))
            .await;

        mock.assert_async().await;
        let history = bus.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, EventType::DataPersisted);
        assert_eq!(
            history[0].payload.as_ref().unwrap()["attempts"],
            Value::from(1)
        );
    }
}

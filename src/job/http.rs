//! Remote job store speaking the PostgREST RPC dialect.
//!
//! Every operation is a stored procedure under `{base}/rest/v1/rpc/`, so the
//! atomicity of `claim_next_job` is enforced by the database, not here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::model::{Job, JobFilter, JobSpec, ResultMetadata};
use super::store::{JobStore, JobSubscription, StoreResult};
use crate::error::{ErrorDetail, StoreError};

pub struct HttpJobStore {
    client: Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
}

impl HttpJobStore {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: Duration::from_secs(2),
        }
    }

    /// How often subscriptions re-read the job row.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn call(&self, name: &str, body: Value) -> StoreResult<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/rest/v1/rpc/{name}", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(StoreError::Unreachable(format!("{name}: {status} {message}")));
        }
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(StoreError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn rpc<T: DeserializeOwned>(&self, name: &str, body: Value) -> StoreResult<T> {
        let response = self.call(name, body).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode(format!("{name}: {e}")))
    }

    async fn rpc_unit(&self, name: &str, body: Value) -> StoreResult<()> {
        self.call(name, body).await.map(|_| ())
    }
}

fn encode<T: serde::Serialize>(value: &T) -> StoreResult<Value> {
    serde_json::to_value(value).map_err(|e| StoreError::Decode(e.to_string()))
}

#[async_trait]
impl JobStore for HttpJobStore {
    async fn submit(&self, spec: JobSpec) -> StoreResult<Job> {
        self.rpc("submit_job", json!({ "p_spec": encode(&spec)? })).await
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Job>> {
        self.rpc("get_job", json!({ "p_job_id": id })).await
    }

    async fn claim_next(&self, worker_id: &str) -> StoreResult<Option<Job>> {
        let job: Option<Job> = self
            .rpc("claim_next_job", json!({ "p_worker_id": worker_id }))
            .await?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, worker_id, "claimed job");
        }
        Ok(job)
    }

    async fn report_progress(&self, id: &str, progress: u8, message: &str) -> StoreResult<()> {
        self.rpc_unit(
            "update_job_progress",
            json!({ "p_job_id": id, "p_progress": progress, "p_message": message }),
        )
        .await
    }

    async fn complete(&self, id: &str, metadata: &ResultMetadata) -> StoreResult<()> {
        self.rpc_unit(
            "complete_job",
            json!({ "p_job_id": id, "p_metadata": encode(metadata)? }),
        )
        .await
    }

    async fn fail(&self, id: &str, message: &str, detail: &ErrorDetail) -> StoreResult<()> {
        self.rpc_unit(
            "fail_job",
            json!({ "p_job_id": id, "p_error_message": message, "p_error_details": encode(detail)? }),
        )
        .await
    }

    async fn cancel(&self, id: &str, owner_id: &str) -> StoreResult<bool> {
        self.rpc("cancel_job", json!({ "p_job_id": id, "p_owner_id": owner_id }))
            .await
    }

    async fn list(&self, owner_id: &str, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        self.rpc(
            "list_jobs",
            json!({
                "p_owner_id": owner_id,
                "p_status": filter.status,
                "p_project_id": filter.project_id,
                "p_limit": filter.limit,
            }),
        )
        .await
    }

    async fn subscribe(&self, id: &str) -> StoreResult<JobSubscription> {
        let first = self
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let (tx, rx) = mpsc::channel(16);
        let store = HttpJobStore {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            poll_interval: self.poll_interval,
        };
        let id = id.to_string();
        let feeder = tokio::spawn(async move {
            let mut last = first;
            if last.status.is_terminal() {
                let _ = tx.send(last).await;
                return;
            }
            loop {
                tokio::time::sleep(store.poll_interval).await;
                match store.get(&id).await {
                    Ok(Some(job)) if job != last => {
                        let terminal = job.status.is_terminal();
                        if tx.send(job.clone()).await.is_err() || terminal {
                            break;
                        }
                        last = job;
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => warn!(job_id = %id, error = %e, "subscription poll failed"),
                }
            }
        });
        Ok(JobSubscription::new(rx, feeder))
    }

    async fn cleanup_stale(&self, lock_timeout: Duration) -> StoreResult<usize> {
        self.rpc(
            "cleanup_stale_jobs",
            json!({ "p_timeout_seconds": lock_timeout.as_secs() }),
        )
        .await
    }

    async fn ping(&self) -> StoreResult<()> {
        let response = self
            .client
            .get(format!("{}/rest/v1/", self.base_url))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status().is_server_error() {
            return Err(StoreError::Unreachable(response.status().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::job::model::{JobStatus, fixtures};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn processing_job() -> Job {
        let mut job = Job::new(fixtures::spec("owner"));
        job.status = JobStatus::Processing;
        job.locked_by = Some("worker-1".into());
        job
    }

    #[tokio::test]
    async fn claim_next_posts_worker_id() {
        let server = MockServer::start().await;
        let job = processing_job();
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/claim_next_job"))
            .and(header("apikey", "secret"))
            .and(body_partial_json(json!({ "p_worker_id": "worker-1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(&job))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpJobStore::new(server.uri(), "secret".into());
        let claimed = store.claim_next("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn claim_next_null_means_empty_queue() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/claim_next_job"))
            .respond_with(ResponseTemplate::new(200).set_body_string("null"))
            .mount(&server)
            .await;

        let store = HttpJobStore::new(server.uri(), "k".into());
        assert!(store.claim_next("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn server_errors_surface_as_unreachable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/claim_next_job"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpJobStore::new(server.uri(), "k".into());
        let err = store.claim_next("w").await.unwrap_err();
        assert!(matches!(err, StoreError::Unreachable(_)));
    }

    #[tokio::test]
    async fn fail_sends_structured_detail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/fail_job"))
            .and(body_partial_json(json!({
                "p_job_id": "job-1",
                "p_error_details": { "kind": "validation" }
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpJobStore::new(server.uri(), "k".into());
        let detail = ErrorDetail {
            kind: ErrorKind::Validation,
            stage: None,
            message: "too long".into(),
        };
        store.fail("job-1", "too long", &detail).await.unwrap();
    }

    #[tokio::test]
    async fn cancel_returns_procedure_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/cancel_job"))
            .respond_with(ResponseTemplate::new(200).set_body_string("false"))
            .mount(&server)
            .await;

        let store = HttpJobStore::new(server.uri(), "k".into());
        assert!(!store.cancel("job-1", "owner").await.unwrap());
    }

    #[tokio::test]
    async fn rejected_request_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/get_job"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let store = HttpJobStore::new(server.uri(), "k".into());
        match store.get("job-1").await {
            Err(StoreError::Rejected { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "bad key");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

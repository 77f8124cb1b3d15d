use std::future::Future;
use std::pin::Pin;

use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClusterError;
use crate::history::FaultAction;

/// Boxed future returned by the collaborator traits.
pub type OpFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ClusterError>> + 'a>>;

/// How the client stream talks to the job under test.
pub trait JobControl {
    /// Whether the monitored job is currently running.
    fn job_running(&self) -> OpFuture<'_, bool>;

    fn cancel_job(&self) -> OpFuture<'_, ()>;
}

/// Applies concrete faults to the cluster.
pub trait FaultInjector {
    fn inject(&self, fault: FaultAction) -> OpFuture<'_, ()>;
}

/// One entry of GET /jobs/overview.
#[derive(Debug, Deserialize, Serialize)]
pub struct JobOverview {
    pub jid: String,
    pub name: Option<String>,
    pub state: String,
}

#[derive(Debug, Deserialize)]
struct JobsOverview {
    jobs: Vec<JobOverview>,
}

/// Typed client for the job REST API and the cluster control agent.
pub struct ClusterClient {
    base_url: String,
    control_url: String,
    http: Client,
}

impl ClusterClient {
    pub fn new(base_url: &str, control_url: &str) -> Result<Self, ClusterError> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| ClusterError::Request {
                op: "build HTTP client".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            control_url: control_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// GET /jobs/overview: every job the cluster knows about.
    pub async fn jobs(&self) -> Result<Vec<JobOverview>, ClusterError> {
        let op = "GET /jobs/overview";
        let resp = self
            .http
            .get(format!("{}/jobs/overview", self.base_url))
            .send()
            .await
            .map_err(|e| request_failed(op, e))?;
        let resp = expect_success(op, resp).await?;

        resp.json::<JobsOverview>()
            .await
            .map(|overview| overview.jobs)
            .map_err(|e| ClusterError::Decode {
                op: op.into(),
                reason: e.to_string(),
            })
    }

    /// PATCH /jobs/:id?mode=cancel
    pub async fn cancel(&self, jid: &str) -> Result<(), ClusterError> {
        let op = format!("PATCH /jobs/{jid}");
        let resp = self
            .http
            .patch(format!("{}/jobs/{}", self.base_url, jid))
            .query(&[("mode", "cancel")])
            .send()
            .await
            .map_err(|e| request_failed(&op, e))?;
        expect_success(&op, resp).await?;
        Ok(())
    }

    /// GET /health on the control agent, checked before provisioning.
    pub async fn health(&self) -> Result<String, ClusterError> {
        let op = "GET /health";
        let resp = self
            .http
            .get(format!("{}/health", self.control_url))
            .send()
            .await
            .map_err(|e| request_failed(op, e))?;
        let resp = expect_success(op, resp).await?;

        resp.text().await.map_err(|e| ClusterError::Decode {
            op: op.into(),
            reason: e.to_string(),
        })
    }

    /// POST to the control agent, e.g. `/faults/kill-task-managers`.
    pub async fn control<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(), ClusterError> {
        let op = format!("POST {path}");
        let resp = self
            .http
            .post(format!("{}{}", self.control_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| request_failed(&op, e))?;
        expect_success(&op, resp).await?;
        Ok(())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl JobControl for ClusterClient {
    fn job_running(&self) -> OpFuture<'_, bool> {
        Box::pin(async move {
            let jobs = self.jobs().await?;
            Ok(jobs.iter().any(|job| job.state == "RUNNING"))
        })
    }

    fn cancel_job(&self) -> OpFuture<'_, ()> {
        Box::pin(async move {
            let jobs = self.jobs().await?;
            let running: Vec<&JobOverview> =
                jobs.iter().filter(|job| job.state == "RUNNING").collect();
            if running.is_empty() {
                return Err(ClusterError::NoRunningJob);
            }
            for job in running {
                debug!(jid = %job.jid, "cancelling job");
                self.cancel(&job.jid).await?;
            }
            Ok(())
        })
    }
}

impl FaultInjector for ClusterClient {
    fn inject(&self, fault: FaultAction) -> OpFuture<'_, ()> {
        Box::pin(async move {
            self.control(&format!("/faults/{}", fault.name()), &serde_json::json!({}))
                .await
        })
    }
}

fn request_failed(op: &str, e: reqwest::Error) -> ClusterError {
    ClusterError::Request {
        op: op.to_string(),
        reason: e.to_string(),
    }
}

async fn expect_success(op: &str, resp: Response) -> Result<Response, ClusterError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ClusterError::Status {
        op: op.to_string(),
        status: status.as_u16(),
        body,
    })
}

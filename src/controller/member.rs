//! Member-agent client
//!
//! Every database pod runs an agent sidecar that manages the replica's
//! membership in its replication or consensus group. Before a replica is
//! removed by scale-in it is asked to leave the group.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

const LEAVE_MEMBER_OPERATION: &str = "leaveMember";
const SUCCESS_EVENT: &str = "Success";

#[derive(Debug, Serialize)]
struct BindingRequest<'a> {
    operation: &'a str,
}

#[derive(Debug, Deserialize)]
struct BindingResponse {
    #[serde(default)]
    event: String,
    #[serde(default)]
    message: Option<String>,
}

#[async_trait]
pub trait MemberAgent: Send + Sync {
    /// Ask the replica in `pod` to leave its group
    async fn leave_member(&self, pod: &Pod, character_type: &str) -> Result<()>;
}

/// Talks to the agent over HTTP on the pod IP
pub struct HttpMemberAgent {
    http_client: Client,
    port: u16,
}

impl HttpMemberAgent {
    pub fn new(port: u16, timeout: Duration) -> Result<Self> {
        Ok(Self {
            http_client: Client::builder().timeout(timeout).build()?,
            port,
        })
    }

    fn binding_url(&self, pod_ip: &str, character_type: &str) -> String {
        format!("http://{}:{}/v1.0/bindings/{}", pod_ip, self.port, character_type)
    }
}

#[async_trait]
impl MemberAgent for HttpMemberAgent {
    async fn leave_member(&self, pod: &Pod, character_type: &str) -> Result<()> {
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .ok_or_else(|| Error::MemberAgentError(format!("pod {} has no IP yet", pod.name_any())))?;
        let url = self.binding_url(pod_ip, character_type);
        debug!("Asking {} to leave its group via {}", pod.name_any(), url);

        let response: BindingResponse = self
            .http_client
            .post(&url)
            .json(&BindingRequest {
                operation: LEAVE_MEMBER_OPERATION,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.event != SUCCESS_EVENT {
            return Err(Error::MemberAgentError(format!(
                "{} refused to leave: event={} {}",
                pod.name_any(),
                response.event,
                response.message.unwrap_or_default()
            )));
        }
        info!("Pod {} left its group", pod.name_any());
        Ok(())
    }
}

/// Agent that accepts every request, for dry runs and tests
#[derive(Default)]
pub struct NoopMemberAgent;

#[async_trait]
impl MemberAgent for NoopMemberAgent {
    async fn leave_member(&self, _pod: &Pod, _character_type: &str) -> Result<()> {
        Ok(())
    }
}

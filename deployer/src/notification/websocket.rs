use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

use super::{Event, Notifier, NotifyError};

/// Event types the UI cares about; everything else stays internal.
pub const FORWARDED_EVENT_TYPES: [&str; 6] = [
    "deployment.queued",
    "deployment.configuration_loaded",
    "deployment.end",
    "deployment.step_start",
    "deployment.step.release",
    "commits.fetched",
];

/// What goes over the wire to subscribed clients.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct WsEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
}

/// The websocket server itself is a separate surface; the deployer only
/// pushes envelopes at it. Payloads carry an `environment_id` the broadcaster
/// matches against client subscriptions.
pub trait Broadcast: Send + Sync {
    fn broadcast(&self, envelope: WsEnvelope) -> Result<(), NotifyError>;
}

/// Stand-in broadcaster for deployments without a websocket frontend.
pub struct NullBroadcast;

impl Broadcast for NullBroadcast {
    fn broadcast(&self, envelope: WsEnvelope) -> Result<(), NotifyError> {
        tracing::debug!(kind = %envelope.kind, "websocket event dropped (no frontend)");
        Ok(())
    }
}

/// Translate a whitelisted event into its websocket envelope. `None` for
/// internal-only events.
pub fn event_to_websocket(event: &Event) -> Option<WsEnvelope> {
    if !FORWARDED_EVENT_TYPES.contains(&event.kind()) {
        return None;
    }

    let envelope = match event {
        Event::CommitsFetched { environment_id, .. } => WsEnvelope {
            kind: "commits.fetched".into(),
            payload: json!({ "environment_id": environment_id }),
        },
        Event::ReleasedOnServer {
            deployment,
            server,
            release_date,
            branch,
            commit,
        } => WsEnvelope {
            kind: "deployment.step.release".into(),
            payload: json!({
                "environment_id": deployment.environment_id,
                "deployment": deployment,
                "server": server,
                "release_info": {
                    "commit": commit,
                    "branch": branch,
                    "release_date": release_date.to_rfc3339(),
                },
            }),
        },
        Event::DeploymentQueued {
            deploy_id,
            environment_id,
            repository_name,
            environment_name,
            branch,
            commit,
            user_id,
        } => WsEnvelope {
            kind: "deployment.deployment_status".into(),
            payload: json!({
                "environment_id": environment_id,
                "deployment": {
                    "id": deploy_id,
                    "user_id": user_id,
                    "status": "QUEUED",
                    "environment_id": environment_id,
                    "environment_name": environment_name,
                    "repository_name": repository_name,
                    "branch": branch,
                    "commit": commit,
                },
            }),
        },
        Event::ConfigurationLoaded { deployment }
        | Event::StepStart { deployment, .. }
        | Event::DeploymentEnd { deployment, .. } => WsEnvelope {
            kind: "deployment.deployment_status".into(),
            payload: json!({
                "environment_id": deployment.environment_id,
                "deployment": deployment,
            }),
        },
        _ => return None,
    };
    Some(envelope)
}

pub struct WebSocketNotifier {
    broadcast: Box<dyn Broadcast>,
}

impl WebSocketNotifier {
    pub fn new(broadcast: Box<dyn Broadcast>) -> Self {
        Self { broadcast }
    }
}

#[async_trait]
impl Notifier for WebSocketNotifier {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn dispatch(&self, event: &Event) -> Result<(), NotifyError> {
        match event_to_websocket(event) {
            Some(envelope) => self.broadcast.broadcast(envelope),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn internal_events_are_not_forwarded() {
        assert!(event_to_websocket(&Event::DeployerStarted).is_none());
        assert!(event_to_websocket(&Event::DeploymentStart { deploy_id: 1 }).is_none());
    }

    #[test]
    fn commits_fetched_carries_only_the_environment() {
        let envelope = event_to_websocket(&Event::CommitsFetched {
            environment_id: 42,
            repository_name: "webapp".into(),
            deploy_branch: "main".into(),
            deployment_id: None,
        })
        .unwrap();
        assert_eq!(envelope.kind, "commits.fetched");
        assert_eq!(envelope.payload, serde_json::json!({"environment_id": 42}));
    }

    #[test]
    fn queued_event_renders_a_synthetic_deployment() {
        let envelope = event_to_websocket(&Event::DeploymentQueued {
            deploy_id: 3,
            environment_id: 42,
            repository_name: "webapp".into(),
            environment_name: "prod".into(),
            branch: "main".into(),
            commit: "abc".into(),
            user_id: Some(1),
        })
        .unwrap();
        assert_eq!(envelope.kind, "deployment.deployment_status");
        assert_eq!(envelope.payload["deployment"]["status"], "QUEUED");
    }
}

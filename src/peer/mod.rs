pub mod client;

use crate::api::types::{CreateInstanceRequest, InstanceStatePut};
use crate::migration::channel::Channel;
use crate::ops::OpContext;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Peer {addr} unavailable: {reason}")]
    Unavailable { addr: String, reason: String },

    #[error("Peer request failed: {0}")]
    Api(String),

    #[error("Remote operation failed: {0}")]
    Operation(String),
}

/// Typed RPC surface against another daemon. One production implementation
/// over HTTPS plus a deterministic fake for tests.
#[async_trait]
pub trait PeerClient: Send + Sync {
    async fn get_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<serde_json::Value, PeerError>;

    /// Only accepted with `source.type = "migration"`, `mode = "pull"`.
    async fn create_instance(
        &self,
        project: &str,
        target: Option<&str>,
        req: &CreateInstanceRequest,
    ) -> Result<RemoteOperation, PeerError>;

    async fn delete_instance(&self, project: &str, name: &str)
        -> Result<RemoteOperation, PeerError>;

    async fn rename_instance(
        &self,
        project: &str,
        old: &str,
        new: &str,
    ) -> Result<RemoteOperation, PeerError>;

    async fn update_instance_state(
        &self,
        project: &str,
        name: &str,
        state: &InstanceStatePut,
    ) -> Result<RemoteOperation, PeerError>;

    /// Escape hatch for internal endpoints such as
    /// `/internal/cluster/instance-moved/{name}`.
    async fn raw_query(
        &self,
        method: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, PeerError>;

    /// Dials `<op_url>/websocket?secret=...` and returns the migration channel.
    async fn connect_operation_websocket(
        &self,
        op_url: &str,
        secret: &str,
    ) -> Result<Box<dyn Channel>, PeerError>;
}

/// Produces peer sessions. The `notify` flag marks internal relocation
/// traffic, which the receiving member must not forward again.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, address: &str, notify: bool) -> Arc<dyn PeerClient>;
}

pub type PollFn =
    Box<dyn Fn() -> BoxFuture<'static, Result<serde_json::Value, PeerError>> + Send + Sync>;
type MetadataHandler = Box<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Builds the polling closure behind a remote operation handle.
pub struct PollFnBuilder {
    pub base:    String,
    pub notify:  bool,
    pub http:    reqwest::Client,
    pub address: String,
}

impl PollFnBuilder {
    pub fn build(self, id: String) -> PollFn {
        let PollFnBuilder {
            base,
            notify,
            http,
            address,
        } = self;
        Box::new(move || {
            let url = format!("{}/1.0/operations/{}", base, id);
            let http = http.clone();
            let address = address.clone();
            Box::pin(async move {
                let mut req = http.get(&url);
                if notify {
                    req = req.header(client::NOTIFY_HEADER, "1");
                }
                let resp = req.send().await.map_err(|e| PeerError::Unavailable {
                    addr: address.clone(),
                    reason: e.to_string(),
                })?;
                let status = resp.status();
                let value: serde_json::Value =
                    resp.json().await.unwrap_or(serde_json::Value::Null);
                if !status.is_success() {
                    return Err(PeerError::Api(format!("HTTP {}", status)));
                }
                Ok(value)
            })
        })
    }
}

/// Async handle on an operation running on a peer.
pub struct RemoteOperation {
    initial:  serde_json::Value,
    poll:     Option<PollFn>,
    handlers: Vec<MetadataHandler>,
}

impl RemoteOperation {
    pub fn new(initial: serde_json::Value, poll: Option<PollFn>) -> Self {
        Self {
            initial,
            poll,
            handlers: Vec::new(),
        }
    }

    pub fn add_handler(&mut self, handler: impl Fn(&serde_json::Value) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Polls the peer until the operation reaches a terminal status,
    /// delivering metadata updates to the registered handlers on the way.
    /// Honors the caller's cancellation context.
    pub async fn wait(&mut self, ctx: &OpContext) -> Result<(), PeerError> {
        let mut current = self.initial.clone();
        let mut last_metadata = serde_json::Value::Null;

        loop {
            let metadata = current.get("metadata").cloned().unwrap_or(serde_json::Value::Null);
            if metadata != last_metadata {
                for handler in &self.handlers {
                    handler(&metadata);
                }
                last_metadata = metadata;
            }

            match current.get("status").and_then(|v| v.as_str()) {
                Some("success") => return Ok(()),
                Some("failure") => {
                    let err = current
                        .get("err")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown failure");
                    return Err(PeerError::Operation(err.to_string()));
                }
                Some("cancelled") => {
                    return Err(PeerError::Operation("operation cancelled".to_string()))
                }
                _ => {}
            }

            let Some(poll) = &self.poll else {
                // Non-polling handle with no terminal status: nothing more
                // will ever arrive.
                return Err(PeerError::Operation(
                    "operation handle has no poller".to_string(),
                ));
            };

            tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(PeerError::Operation("cancelled while waiting".to_string()));
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
            current = poll().await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakePeer;
    use super::*;
    use crate::api::types::CreateInstanceRequest;
    use crate::ops::{Operation, OperationClass, OperationType};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_ctx() -> OpContext {
        Operation::new(
            "default",
            OperationClass::Task,
            OperationType::InstanceMigrate,
            Default::default(),
        )
        .context()
    }

    #[tokio::test]
    async fn fake_peer_tracks_instances_across_calls() {
        let peer = FakePeer::default();
        let req = CreateInstanceRequest {
            name: "web01".to_string(),
            source: crate::api::types::InstanceSource {
                kind: "migration".to_string(),
                mode: "pull".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut op = peer.create_instance("default", None, &req).await.unwrap();
        op.wait(&test_ctx()).await.unwrap();

        assert!(peer.get_instance("default", "web01").await.is_ok());
        peer.delete_instance("default", "web01").await.unwrap();
        assert!(peer.get_instance("default", "web01").await.is_err());
    }

    #[tokio::test]
    async fn wait_delivers_metadata_before_completion() {
        let initial = serde_json::json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "status": "success",
            "metadata": {"secrets": {"control": "abc"}},
        });
        let mut op = RemoteOperation::new(initial, None);

        let seen = Arc::new(AtomicBool::new(false));
        let seen_in_handler = seen.clone();
        op.add_handler(move |metadata| {
            if metadata.get("secrets").is_some() {
                seen_in_handler.store(true, Ordering::SeqCst);
            }
        });

        op.wait(&test_ctx()).await.unwrap();
        assert!(seen.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_operations_surface_their_message() {
        let initial = serde_json::json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "status": "failure",
            "err": "disk full",
        });
        let mut op = RemoteOperation::new(initial, None);
        let err = op.wait(&test_ctx()).await.unwrap_err();
        assert!(err.to_string().contains("disk full"));
    }
}

/// Deterministic in-memory peer used by orchestrator tests.
#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct FakePeer {
        pub calls: Mutex<Vec<String>>,
        pub instances: Mutex<Vec<String>>,
    }

    fn done_op() -> RemoteOperation {
        RemoteOperation::new(
            serde_json::json!({
                "id": uuid::Uuid::new_v4().to_string(),
                "status": "success",
                "metadata": {},
            }),
            None,
        )
    }

    #[async_trait]
    impl PeerClient for FakePeer {
        async fn get_instance(
            &self,
            project: &str,
            name: &str,
        ) -> Result<serde_json::Value, PeerError> {
            self.calls.lock().push(format!("get {}/{}", project, name));
            if self.instances.lock().iter().any(|i| i == name) {
                Ok(serde_json::json!({"name": name, "project": project}))
            } else {
                Err(PeerError::Api("not found".to_string()))
            }
        }

        async fn create_instance(
            &self,
            project: &str,
            _target: Option<&str>,
            req: &CreateInstanceRequest,
        ) -> Result<RemoteOperation, PeerError> {
            self.calls
                .lock()
                .push(format!("create {}/{} mode={}", project, req.name, req.source.mode));
            self.instances.lock().push(req.name.clone());
            Ok(done_op())
        }

        async fn delete_instance(
            &self,
            project: &str,
            name: &str,
        ) -> Result<RemoteOperation, PeerError> {
            self.calls.lock().push(format!("delete {}/{}", project, name));
            self.instances.lock().retain(|i| i != name);
            Ok(done_op())
        }

        async fn rename_instance(
            &self,
            project: &str,
            old: &str,
            new: &str,
        ) -> Result<RemoteOperation, PeerError> {
            self.calls
                .lock()
                .push(format!("rename {}/{} -> {}", project, old, new));
            Ok(done_op())
        }

        async fn update_instance_state(
            &self,
            project: &str,
            name: &str,
            state: &InstanceStatePut,
        ) -> Result<RemoteOperation, PeerError> {
            self.calls
                .lock()
                .push(format!("state {}/{} {}", project, name, state.action));
            Ok(done_op())
        }

        async fn raw_query(
            &self,
            method: &str,
            path: &str,
            _body: serde_json::Value,
        ) -> Result<serde_json::Value, PeerError> {
            self.calls.lock().push(format!("{} {}", method, path));
            Ok(serde_json::json!({}))
        }

        async fn connect_operation_websocket(
            &self,
            _op_url: &str,
            _secret: &str,
        ) -> Result<Box<dyn Channel>, PeerError> {
            Err(PeerError::Api("fake peer has no websockets".to_string()))
        }
    }
}

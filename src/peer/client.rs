use crate::api::types::{CreateInstanceRequest, InstanceStatePut};
use crate::migration::channel::{Channel, ClientChannel};
use crate::peer::{PeerClient, PeerConnector, PeerError, PollFnBuilder, RemoteOperation};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::Duration;

/// Header marking internal relocation traffic. A member receiving it serves
/// the request itself instead of forwarding again.
pub const NOTIFY_HEADER: &str = "x-corral-notify";

/// Production peer session over the REST listener of another member.
///
/// Cluster-internal traffic runs on the plain listener; transport security
/// between members belongs to the out-of-scope auth layer.
pub struct HttpPeerClient {
    address:  String,
    base:     String,
    notify:   bool,
    http:     reqwest::Client,
}

pub struct HttpPeerConnector {
    http: reqwest::Client,
}

impl HttpPeerConnector {
    pub fn new() -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Arc::new(Self { http })
    }
}

impl PeerConnector for HttpPeerConnector {
    fn connect(&self, address: &str, notify: bool) -> Arc<dyn PeerClient> {
        let base = if address.contains("://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address)
        };
        Arc::new(HttpPeerClient {
            address: address.to_string(),
            base,
            notify,
            http: self.http.clone(),
        })
    }
}

impl HttpPeerClient {
    fn unavailable(&self, err: reqwest::Error) -> PeerError {
        PeerError::Unavailable {
            addr: self.address.clone(),
            reason: err.to_string(),
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, PeerError> {
        let url = format!("{}{}", self.base, path);
        debug!("Peer request {} {}", method, url);

        let mut req = self.http.request(method, &url);
        if self.notify {
            req = req.header(NOTIFY_HEADER, "1");
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req.send().await.map_err(|e| self.unavailable(e))?;
        let status = resp.status();
        let value: serde_json::Value = resp
            .json()
            .await
            .unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            let message = value
                .get("error")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(PeerError::Api(message));
        }
        Ok(value)
    }

    /// Wraps an operation response into a polling handle.
    fn operation_handle(&self, op: serde_json::Value) -> RemoteOperation {
        let id = op.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        let poller = PollFnBuilder {
            base: self.base.clone(),
            notify: self.notify,
            http: self.http.clone(),
            address: self.address.clone(),
        }
        .build(id);
        RemoteOperation::new(op, Some(poller))
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn get_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<serde_json::Value, PeerError> {
        self.request(
            reqwest::Method::GET,
            &format!("/1.0/instances/{}?project={}", name, project),
            None,
        )
        .await
    }

    async fn create_instance(
        &self,
        project: &str,
        target: Option<&str>,
        req: &CreateInstanceRequest,
    ) -> Result<RemoteOperation, PeerError> {
        let mut path = format!("/1.0/instances?project={}", project);
        if let Some(target) = target {
            path.push_str(&format!("&target={}", target));
        }
        let op = self
            .request(
                reqwest::Method::POST,
                &path,
                Some(serde_json::to_value(req).map_err(|e| PeerError::Api(e.to_string()))?),
            )
            .await?;
        Ok(self.operation_handle(op))
    }

    async fn delete_instance(
        &self,
        project: &str,
        name: &str,
    ) -> Result<RemoteOperation, PeerError> {
        let op = self
            .request(
                reqwest::Method::DELETE,
                &format!("/1.0/instances/{}?project={}", name, project),
                None,
            )
            .await?;
        Ok(self.operation_handle(op))
    }

    async fn rename_instance(
        &self,
        project: &str,
        old: &str,
        new: &str,
    ) -> Result<RemoteOperation, PeerError> {
        let op = self
            .request(
                reqwest::Method::POST,
                &format!("/1.0/instances/{}?project={}", old, project),
                Some(serde_json::json!({"name": new, "migration": false})),
            )
            .await?;
        Ok(self.operation_handle(op))
    }

    async fn update_instance_state(
        &self,
        project: &str,
        name: &str,
        state: &InstanceStatePut,
    ) -> Result<RemoteOperation, PeerError> {
        let op = self
            .request(
                reqwest::Method::PUT,
                &format!("/1.0/instances/{}/state?project={}", name, project),
                Some(serde_json::to_value(state).map_err(|e| PeerError::Api(e.to_string()))?),
            )
            .await?;
        Ok(self.operation_handle(op))
    }

    async fn raw_query(
        &self,
        method: &str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, PeerError> {
        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| PeerError::Api(format!("bad method {}", method)))?;
        let body = if body.is_null() { None } else { Some(body) };
        self.request(method, path, body).await
    }

    async fn connect_operation_websocket(
        &self,
        op_url: &str,
        secret: &str,
    ) -> Result<Box<dyn Channel>, PeerError> {
        let target = if op_url.contains("://") {
            op_url.to_string()
        } else {
            format!("{}{}", self.base, op_url)
        };
        let ws_target = target
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        let url = format!("{}/websocket?secret={}", ws_target, secret);
        debug!("Dialling migration websocket {}", url);

        let (stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .map_err(|e| PeerError::Unavailable {
                addr: self.address.clone(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(ClientChannel::new(stream)))
    }
}

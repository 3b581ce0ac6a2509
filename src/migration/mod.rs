pub mod channel;
pub mod control;
pub mod sink;
pub mod source;

use crate::db::DbError;
use crate::migration::channel::{Channel, ChannelError};
use crate::ops::{OpContext, CHAN_CONTROL, CHAN_FILESYSTEM, CHAN_STATE};
use crate::peer::PeerError;
use crate::storage::StorageError;
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// How long a source waits for the sink to attach its websockets.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("Migration protocol error: {0}")]
    Protocol(String),

    #[error("Live migration not supported by peer")]
    LiveNotSupported,

    #[error("Migration cancelled")]
    Cancelled,

    #[error("Remote reported failure: {0}")]
    Remote(String),
}

/// 256-bit hex secret guarding one migration channel.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// The per-channel secrets of one session, pre-allocated at INIT.
#[derive(Debug, Clone)]
pub struct SessionSecrets {
    pub control:    String,
    pub filesystem: String,
    pub state:      Option<String>,
}

impl SessionSecrets {
    pub fn new(live: bool) -> Self {
        Self {
            control: generate_secret(),
            filesystem: generate_secret(),
            state: live.then(generate_secret),
        }
    }

    /// Operation metadata published while waiting for the sink.
    pub fn metadata(&self) -> serde_json::Value {
        let mut secrets = serde_json::Map::new();
        secrets.insert(CHAN_CONTROL.into(), self.control.clone().into());
        secrets.insert(CHAN_FILESYSTEM.into(), self.filesystem.clone().into());
        if let Some(state) = &self.state {
            secrets.insert(CHAN_STATE.into(), state.clone().into());
        }
        serde_json::json!({ "secrets": secrets })
    }

    /// Websocket map handed to the destination in the create request.
    pub fn websockets(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert(CHAN_CONTROL.to_string(), self.control.clone());
        map.insert(CHAN_FILESYSTEM.to_string(), self.filesystem.clone());
        if let Some(state) = &self.state {
            map.insert(CHAN_STATE.to_string(), state.clone());
        }
        map
    }

    fn name_for(&self, secret: &str) -> Option<&'static str> {
        if secret == self.control {
            return Some(CHAN_CONTROL);
        }
        if secret == self.filesystem {
            return Some(CHAN_FILESYSTEM);
        }
        if self.state.as_deref() == Some(secret) {
            return Some(CHAN_STATE);
        }
        None
    }
}

/// The three connected channels of a running session.
pub struct ChannelSet {
    pub control:    Box<dyn Channel>,
    pub filesystem: Box<dyn Channel>,
    pub state:      Option<Box<dyn Channel>>,
}

impl ChannelSet {
    pub async fn close_all(&mut self) {
        let _ = self.control.close().await;
        let _ = self.filesystem.close().await;
        if let Some(state) = &mut self.state {
            let _ = state.close().await;
        }
    }
}

struct HubSlot {
    tx: mpsc::Sender<Box<dyn Channel>>,
    rx: Option<mpsc::Receiver<Box<dyn Channel>>>,
}

/// Hands websockets accepted by the HTTP layer to the session task.
///
/// `attach` parks the HTTP handler until the session releases the socket,
/// which keeps the connection open exactly as long as the transfer runs.
pub struct ChannelHub {
    secrets: SessionSecrets,
    slots:   Mutex<HashMap<&'static str, HubSlot>>,
    done:    watch::Sender<bool>,
}

impl ChannelHub {
    pub fn new(secrets: SessionSecrets) -> std::sync::Arc<Self> {
        let mut slots = HashMap::new();
        for name in [CHAN_CONTROL, CHAN_FILESYSTEM, CHAN_STATE] {
            if name == CHAN_STATE && secrets.state.is_none() {
                continue;
            }
            let (tx, rx) = mpsc::channel(1);
            slots.insert(name, HubSlot { tx, rx: Some(rx) });
        }
        let (done, _) = watch::channel(false);
        std::sync::Arc::new(Self {
            secrets,
            slots: Mutex::new(slots),
            done,
        })
    }

    pub fn secrets(&self) -> &SessionSecrets {
        &self.secrets
    }

    /// Matches `secret` to a channel slot and delivers the connection. The
    /// returned future resolves once the session is done with the socket.
    pub async fn attach(
        &self,
        secret: &str,
        conn: Box<dyn Channel>,
    ) -> anyhow::Result<()> {
        let name = self
            .secrets
            .name_for(secret)
            .ok_or_else(|| anyhow::anyhow!("no migration channel matches the given secret"))?;

        let tx = {
            let slots = self.slots.lock();
            slots
                .get(name)
                .map(|slot| slot.tx.clone())
                .ok_or_else(|| anyhow::anyhow!("channel {} not offered by this session", name))?
        };
        tx.send(conn)
            .await
            .map_err(|_| anyhow::anyhow!("migration session already finished"))?;

        let mut rx = self.done.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Waits until the required channels are attached: control and
    /// filesystem always, state when live.
    pub async fn wait_connected(&self, ctx: &OpContext) -> Result<ChannelSet, MigrationError> {
        let control = self.wait_one(CHAN_CONTROL, ctx).await?;
        let filesystem = self.wait_one(CHAN_FILESYSTEM, ctx).await?;
        let state = if self.secrets.state.is_some() {
            Some(self.wait_one(CHAN_STATE, ctx).await?)
        } else {
            None
        };
        Ok(ChannelSet {
            control,
            filesystem,
            state,
        })
    }

    async fn wait_one(
        &self,
        name: &'static str,
        ctx: &OpContext,
    ) -> Result<Box<dyn Channel>, MigrationError> {
        let mut rx = {
            let mut slots = self.slots.lock();
            slots
                .get_mut(name)
                .and_then(|slot| slot.rx.take())
                .ok_or_else(|| {
                    MigrationError::Protocol(format!("channel {} already claimed", name))
                })?
        };

        tokio::select! {
            _ = ctx.cancelled() => Err(MigrationError::Cancelled),
            _ = tokio::time::sleep(CONNECT_TIMEOUT) => Err(MigrationError::Protocol(
                format!("timed out waiting for the {} connection", name),
            )),
            conn = rx.recv() => conn.ok_or_else(|| {
                MigrationError::Protocol(format!("{} connection slot closed", name))
            }),
        }
    }

    /// Releases every parked HTTP handler; called from CLEANUP.
    pub fn finish(&self) {
        let _ = self.done.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::channel::MemChannel;
    use crate::ops::{Operation, OperationClass, OperationType};

    fn test_ctx() -> OpContext {
        Operation::new(
            "default",
            OperationClass::Websocket,
            OperationType::InstanceMigrate,
            Default::default(),
        )
        .context()
    }

    #[test]
    fn secrets_metadata_lists_state_only_when_live() {
        let stateless = SessionSecrets::new(false);
        assert!(stateless.state.is_none());
        assert!(stateless.metadata()["secrets"].get("state").is_none());

        let live = SessionSecrets::new(true);
        assert!(live.state.is_some());
        assert!(live.metadata()["secrets"].get("state").is_some());
    }

    #[tokio::test]
    async fn hub_matches_secrets_and_releases_on_finish() {
        let secrets = SessionSecrets::new(false);
        let control_secret = secrets.control.clone();
        let hub = ChannelHub::new(secrets);

        let (a, _b) = MemChannel::pair();
        let hub_attach = hub.clone();
        let attach = tokio::spawn(async move {
            hub_attach.attach(&control_secret, Box::new(a)).await
        });

        // Unknown secrets are refused outright.
        let (c, _d) = MemChannel::pair();
        assert!(hub.attach("bogus", Box::new(c)).await.is_err());

        let (e, _f) = MemChannel::pair();
        let fs_secret = hub.secrets().filesystem.clone();
        let hub_fs = hub.clone();
        let attach_fs =
            tokio::spawn(async move { hub_fs.attach(&fs_secret, Box::new(e)).await });

        let ctx = test_ctx();
        let set = hub.wait_connected(&ctx).await.unwrap();
        assert!(set.state.is_none());

        hub.finish();
        attach.await.unwrap().unwrap();
        attach_fs.await.unwrap().unwrap();
    }
}

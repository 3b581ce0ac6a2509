use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// Channel names a websocket operation may expose.
pub const CHAN_CONTROL: &str = "control";
pub const CHAN_FILESYSTEM: &str = "filesystem";
pub const CHAN_STATE: &str = "state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Task,
    Websocket,
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl OperationStatus {
    pub fn is_final(self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Failure | OperationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationType {
    #[serde(rename = "Migrating instance")]
    InstanceMigrate,
    #[serde(rename = "Renaming instance")]
    InstanceRename,
    #[serde(rename = "Moving instance to pool")]
    InstancePoolMove,
    #[serde(rename = "Moving instance to project")]
    InstanceProjectMove,
    #[serde(rename = "Receiving instance")]
    InstanceReceive,
    #[serde(rename = "Deleting instance")]
    InstanceDelete,
    #[serde(rename = "Changing instance state")]
    InstanceState,
    #[serde(rename = "Creating volume snapshot")]
    VolumeSnapshotCreate,
    #[serde(rename = "Deleting volume snapshot")]
    VolumeSnapshotDelete,
    #[serde(rename = "Renaming volume snapshot")]
    VolumeSnapshotRename,
    #[serde(rename = "Updating volume snapshot")]
    VolumeSnapshotUpdate,
}

impl OperationType {
    pub fn description(self) -> &'static str {
        match self {
            OperationType::InstanceMigrate => "Migrating instance",
            OperationType::InstanceRename => "Renaming instance",
            OperationType::InstancePoolMove => "Moving instance to pool",
            OperationType::InstanceProjectMove => "Moving instance to project",
            OperationType::InstanceReceive => "Receiving instance",
            OperationType::InstanceDelete => "Deleting instance",
            OperationType::InstanceState => "Changing instance state",
            OperationType::VolumeSnapshotCreate => "Creating volume snapshot",
            OperationType::VolumeSnapshotDelete => "Deleting volume snapshot",
            OperationType::VolumeSnapshotRename => "Renaming volume snapshot",
            OperationType::VolumeSnapshotUpdate => "Updating volume snapshot",
        }
    }
}

/// Cooperative cancellation handle passed to every operation run function.
///
/// Every suspension point in a run function is expected to either poll
/// `is_cancelled` or race against `cancelled()`.
#[derive(Clone)]
pub struct OpContext {
    rx: watch::Receiver<bool>,
}

impl OpContext {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without a cancel: park forever, the race in the
                // run function is decided by the other branch.
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Future returned by an operation run function.
pub type RunFn = Box<dyn FnOnce(OpContext) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Called when a peer attaches a websocket carrying a channel secret. The
/// returned future resolves when the operation is done with the socket, which
/// keeps the HTTP channel open for exactly as long as the transfer needs it.
pub type ConnectFn = Box<
    dyn Fn(String, rocket_ws::stream::DuplexStream) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

struct OpState {
    status:     OperationStatus,
    metadata:   serde_json::Map<String, serde_json::Value>,
    err:        String,
    updated_at: DateTime<Utc>,
}

pub struct Operation {
    pub id:        Uuid,
    pub project:   String,
    pub class:     OperationClass,
    pub op_type:   OperationType,
    pub resources: HashMap<String, Vec<String>>,
    created_at:    DateTime<Utc>,
    state:         Mutex<OpState>,
    status_tx:     watch::Sender<OperationStatus>,
    cancel_tx:     watch::Sender<bool>,
    started:       AtomicBool,
    cancel_sent:   AtomicBool,
    connect_fn:    Mutex<Option<ConnectFn>>,
}

impl Operation {
    pub fn new(
        project: &str,
        class: OperationClass,
        op_type: OperationType,
        resources: HashMap<String, Vec<String>>,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(OperationStatus::Pending);
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: Uuid::new_v4(),
            project: project.to_string(),
            class,
            op_type,
            resources,
            created_at: Utc::now(),
            state: Mutex::new(OpState {
                status: OperationStatus::Pending,
                metadata: serde_json::Map::new(),
                err: String::new(),
                updated_at: Utc::now(),
            }),
            status_tx,
            cancel_tx,
            started: AtomicBool::new(false),
            cancel_sent: AtomicBool::new(false),
            connect_fn: Mutex::new(None),
        })
    }

    pub fn context(&self) -> OpContext {
        OpContext {
            rx: self.cancel_tx.subscribe(),
        }
    }

    pub fn status(&self) -> OperationStatus {
        self.state.lock().status
    }

    pub fn set_connect(&self, connect: ConnectFn) {
        *self.connect_fn.lock() = Some(connect);
    }

    /// Attaches a peer websocket. Fails for task-class operations.
    pub fn connect(
        &self,
        secret: String,
        stream: rocket_ws::stream::DuplexStream,
    ) -> anyhow::Result<BoxFuture<'static, anyhow::Result<()>>> {
        let guard = self.connect_fn.lock();
        match guard.as_ref() {
            Some(connect) => Ok(connect(secret, stream)),
            None => anyhow::bail!("operation {} does not accept websockets", self.id),
        }
    }

    /// Merges keys into the operation metadata; updates are totally ordered
    /// by the state lock.
    pub fn update_metadata(&self, patch: serde_json::Value) {
        let mut state = self.state.lock();
        if let serde_json::Value::Object(map) = patch {
            for (k, v) in map {
                state.metadata.insert(k, v);
            }
        }
        state.updated_at = Utc::now();
    }

    pub fn metadata(&self) -> serde_json::Map<String, serde_json::Value> {
        self.state.lock().metadata.clone()
    }

    /// Requests cooperative cancellation. Signalled at most once; repeat
    /// calls are no-ops.
    pub fn cancel(&self) {
        if self.cancel_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cancel_tx.send(true);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_sent.load(Ordering::SeqCst)
    }

    fn transition(&self, status: OperationStatus, err: &str) {
        let mut state = self.state.lock();
        state.status = status;
        state.err = err.to_string();
        state.updated_at = Utc::now();
        drop(state);
        let _ = self.status_tx.send(status);
    }

    /// Blocks until the operation reaches a terminal status and returns it.
    pub async fn wait_final(&self) -> OperationStatus {
        let mut rx = self.status_tx.subscribe();
        loop {
            let status = *rx.borrow();
            if status.is_final() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// API rendering, linearizable with respect to metadata updates.
    pub fn render(&self) -> serde_json::Value {
        let state = self.state.lock();
        serde_json::json!({
            "id": self.id.to_string(),
            "class": self.class,
            "description": self.op_type.description(),
            "created_at": self.created_at,
            "updated_at": state.updated_at,
            "status": state.status,
            "resources": self.resources,
            "metadata": state.metadata,
            "may_cancel": !state.status.is_final(),
            "err": state.err,
        })
    }
}

/// In-memory registry of all live and recently finished operations.
pub struct OperationRegistry {
    ops: RwLock<HashMap<Uuid, Arc<Operation>>>,
}

impl OperationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<Operation>> {
        self.ops.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<Operation>> {
        self.ops.read().values().cloned().collect()
    }

    /// A non-final operation of the same type holding the same resource.
    /// Retried forwards land here instead of spawning a duplicate.
    pub fn find_active(
        &self,
        op_type: OperationType,
        resource_kind: &str,
        resource: &str,
    ) -> Option<Arc<Operation>> {
        self.ops
            .read()
            .values()
            .find(|op| {
                op.op_type == op_type
                    && !op.status().is_final()
                    && op
                        .resources
                        .get(resource_kind)
                        .map_or(false, |names| names.iter().any(|n| n == resource))
            })
            .cloned()
    }

    /// Registers the operation and runs `run` on its own task. The run
    /// function is invoked at most once; the terminal status reflects
    /// cancellation before failure.
    pub fn start(&self, op: Arc<Operation>, run: RunFn) {
        if op.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ops.write().insert(op.id, op.clone());
        op.transition(OperationStatus::Running, "");

        let ctx = op.context();
        tokio::spawn(async move {
            let result = run(ctx).await;
            match result {
                _ if op.cancel_requested() => {
                    op.transition(OperationStatus::Cancelled, "Operation cancelled");
                }
                Ok(()) => op.transition(OperationStatus::Success, ""),
                Err(err) => {
                    log::warn!("Operation {} failed: {:#}", op.id, err);
                    op.transition(OperationStatus::Failure, &format!("{:#}", err));
                }
            }
        });
    }

    pub fn cancel(&self, id: &Uuid) -> Option<Arc<Operation>> {
        let op = self.get(id)?;
        op.cancel();
        Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(name: &str) -> HashMap<String, Vec<String>> {
        let mut map = HashMap::new();
        map.insert("instances".to_string(), vec![name.to_string()]);
        map
    }

    #[tokio::test]
    async fn run_executes_once_and_succeeds() {
        let registry = OperationRegistry::new();
        let op = Operation::new(
            "default",
            OperationClass::Task,
            OperationType::InstanceRename,
            resources("web01"),
        );
        registry.start(
            op.clone(),
            Box::new(|_ctx| Box::pin(async { Ok(()) })),
        );
        // Second start must not re-run or reset state.
        registry.start(
            op.clone(),
            Box::new(|_ctx| Box::pin(async { panic!("ran twice") })),
        );
        assert_eq!(op.wait_final().await, OperationStatus::Success);
    }

    #[tokio::test]
    async fn cancellation_wins_over_run_result() {
        let registry = OperationRegistry::new();
        let op = Operation::new(
            "default",
            OperationClass::Task,
            OperationType::InstanceMigrate,
            resources("web01"),
        );
        registry.start(
            op.clone(),
            Box::new(|ctx| {
                Box::pin(async move {
                    ctx.cancelled().await;
                    anyhow::bail!("interrupted")
                })
            }),
        );
        op.cancel();
        assert_eq!(op.wait_final().await, OperationStatus::Cancelled);
    }

    #[tokio::test]
    async fn metadata_updates_merge() {
        let op = Operation::new(
            "default",
            OperationClass::Websocket,
            OperationType::InstanceMigrate,
            resources("web01"),
        );
        op.update_metadata(serde_json::json!({"secrets": {"control": "a"}}));
        op.update_metadata(serde_json::json!({"progress": "50%"}));
        let metadata = op.metadata();
        assert!(metadata.contains_key("secrets"));
        assert_eq!(metadata["progress"], "50%");
    }

    #[tokio::test]
    async fn failure_carries_message() {
        let registry = OperationRegistry::new();
        let op = Operation::new(
            "default",
            OperationClass::Task,
            OperationType::VolumeSnapshotCreate,
            resources("vol1"),
        );
        registry.start(
            op.clone(),
            Box::new(|_ctx| Box::pin(async { anyhow::bail!("driver fault") })),
        );
        assert_eq!(op.wait_final().await, OperationStatus::Failure);
        let rendered = op.render();
        assert!(rendered["err"].as_str().unwrap().contains("driver fault"));
    }

    #[tokio::test]
    async fn find_active_matches_resource() {
        let registry = OperationRegistry::new();
        let op = Operation::new(
            "default",
            OperationClass::Task,
            OperationType::InstanceMigrate,
            resources("web01"),
        );
        registry.start(
            op.clone(),
            Box::new(|ctx| {
                Box::pin(async move {
                    ctx.cancelled().await;
                    Ok(())
                })
            }),
        );
        let found = registry
            .find_active(OperationType::InstanceMigrate, "instances", "web01")
            .expect("active operation");
        assert_eq!(found.id, op.id);
        assert!(registry
            .find_active(OperationType::InstanceMigrate, "instances", "db01")
            .is_none());
        op.cancel();
        op.wait_final().await;
    }
}

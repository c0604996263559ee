//! Task intake — a single-consumer command queue in front of the
//! orchestrator.
//!
//! UI toggles, backup imports and endpoint switches all arrive through an
//! [`IntakeHandle`] and are applied one at a time by [`TaskIntake::run`],
//! each answered on its own `oneshot`.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::WatchError;
use crate::orchestrator::{AccountSubscriptions, TaskOrchestrator};
use crate::task::{ChainId, SubscriptionTask, TaskKey, TaskState};

type Reply<T> = oneshot::Sender<Result<T, WatchError>>;

/// Command sent from handles to the intake loop.
enum IntakeCommand {
    UpdateTask {
        task: SubscriptionTask,
        reply: Reply<TaskState>,
    },
    UpdateTasks {
        tasks: Vec<SubscriptionTask>,
        reply: Reply<Vec<(TaskKey, TaskState)>>,
    },
    ImportTasks {
        serialized: String,
        reply: Reply<Vec<(TaskKey, TaskState)>>,
    },
    EndpointChange {
        chain_id: ChainId,
        endpoint: String,
        reply: Reply<()>,
    },
    DisconnectUnused {
        reply: Reply<Vec<ChainId>>,
    },
    Resync {
        chain_id: ChainId,
        reply: Reply<()>,
    },
    RemoveAccount {
        chain_id: ChainId,
        address: String,
        reply: Reply<()>,
    },
    AccountSubscriptions {
        reply: Reply<Vec<AccountSubscriptions>>,
    },
    ChainSubscriptions {
        reply: Reply<BTreeMap<ChainId, Vec<SubscriptionTask>>>,
    },
    Close,
}

/// Consuming side of the queue.
pub struct TaskIntake {
    orchestrator: Arc<TaskOrchestrator>,
    cmd_rx: mpsc::UnboundedReceiver<IntakeCommand>,
}

impl TaskIntake {
    pub fn new(orchestrator: Arc<TaskOrchestrator>) -> (Self, IntakeHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            Self {
                orchestrator,
                cmd_rx,
            },
            IntakeHandle { cmd_tx },
        )
    }

    /// Start the consuming loop on the runtime.
    pub fn spawn(orchestrator: Arc<TaskOrchestrator>) -> (IntakeHandle, JoinHandle<()>) {
        let (intake, handle) = Self::new(orchestrator);
        (handle, tokio::spawn(intake.run()))
    }

    /// Apply commands in arrival order until every handle is dropped or
    /// [`IntakeHandle::close`] is called.
    pub async fn run(mut self) {
        tracing::debug!("task intake started");
        let orch = self.orchestrator;

        while let Some(cmd) = self.cmd_rx.recv().await {
            // A dropped reply receiver means the caller stopped waiting.
            match cmd {
                IntakeCommand::UpdateTask { task, reply } => {
                    let _ = reply.send(orch.apply_task(task).await);
                }
                IntakeCommand::UpdateTasks { tasks, reply } => {
                    let _ = reply.send(orch.apply_many(tasks).await);
                }
                IntakeCommand::ImportTasks { serialized, reply } => {
                    let _ = reply.send(orch.import_tasks(&serialized).await);
                }
                IntakeCommand::EndpointChange {
                    chain_id,
                    endpoint,
                    reply,
                } => {
                    let _ = reply.send(orch.on_endpoint_change(&chain_id, &endpoint).await);
                }
                IntakeCommand::DisconnectUnused { reply } => {
                    let _ = reply.send(Ok(orch.disconnect_if_unused().await));
                }
                IntakeCommand::Resync { chain_id, reply } => {
                    let _ = reply.send(orch.resync(&chain_id).await);
                }
                IntakeCommand::RemoveAccount {
                    chain_id,
                    address,
                    reply,
                } => {
                    let _ = reply.send(orch.remove_account(&chain_id, &address).await);
                }
                IntakeCommand::AccountSubscriptions { reply } => {
                    let _ = reply.send(orch.get_all_account_subscriptions().await);
                }
                IntakeCommand::ChainSubscriptions { reply } => {
                    let _ = reply.send(orch.get_all_chain_subscriptions().await);
                }
                IntakeCommand::Close => break,
            }
        }
        tracing::debug!("task intake stopped");
    }
}

/// Cloneable producer side of the queue.
#[derive(Clone)]
pub struct IntakeHandle {
    cmd_tx: mpsc::UnboundedSender<IntakeCommand>,
}

impl IntakeHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> IntakeCommand) -> Result<T, WatchError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| WatchError::Other("task intake closed".into()))?;
        rx.await
            .map_err(|_| WatchError::Other("task intake dropped the reply".into()))?
    }

    pub async fn update_task(&self, task: SubscriptionTask) -> Result<TaskState, WatchError> {
        self.request(|reply| IntakeCommand::UpdateTask { task, reply }).await
    }

    pub async fn update_tasks(
        &self,
        tasks: Vec<SubscriptionTask>,
    ) -> Result<Vec<(TaskKey, TaskState)>, WatchError> {
        self.request(|reply| IntakeCommand::UpdateTasks { tasks, reply }).await
    }

    /// Apply a JSON array of tasks from a backup file.
    pub async fn import_tasks(
        &self,
        serialized: impl Into<String>,
    ) -> Result<Vec<(TaskKey, TaskState)>, WatchError> {
        let serialized = serialized.into();
        self.request(|reply| IntakeCommand::ImportTasks { serialized, reply })
            .await
    }

    pub async fn on_endpoint_change(&self, chain_id: &str, endpoint: &str) -> Result<(), WatchError> {
        let chain_id = chain_id.to_string();
        let endpoint = endpoint.to_string();
        self.request(|reply| IntakeCommand::EndpointChange {
            chain_id,
            endpoint,
            reply,
        })
        .await
    }

    pub async fn disconnect_if_unused(&self) -> Result<Vec<ChainId>, WatchError> {
        self.request(|reply| IntakeCommand::DisconnectUnused { reply }).await
    }

    pub async fn resync(&self, chain_id: &str) -> Result<(), WatchError> {
        let chain_id = chain_id.to_string();
        self.request(|reply| IntakeCommand::Resync { chain_id, reply }).await
    }

    pub async fn remove_account(&self, chain_id: &str, address: &str) -> Result<(), WatchError> {
        let chain_id = chain_id.to_string();
        let address = address.to_string();
        self.request(|reply| IntakeCommand::RemoveAccount {
            chain_id,
            address,
            reply,
        })
        .await
    }

    pub async fn get_all_account_subscriptions(&self) -> Result<Vec<AccountSubscriptions>, WatchError> {
        self.request(|reply| IntakeCommand::AccountSubscriptions { reply }).await
    }

    pub async fn get_all_chain_subscriptions(
        &self,
    ) -> Result<BTreeMap<ChainId, Vec<SubscriptionTask>>, WatchError> {
        self.request(|reply| IntakeCommand::ChainSubscriptions { reply }).await
    }

    /// Stop the intake loop after the commands already queued.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(IntakeCommand::Close);
    }
}

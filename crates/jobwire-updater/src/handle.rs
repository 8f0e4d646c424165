use jobwire_core::{ConfigError, EndpointConfig};
use tokio::sync::{mpsc, oneshot};

use crate::{endpoint::EndpointStatus, errors::UpdaterError};

pub(crate) enum Control {
    Reconfigure {
        endpoints: Vec<EndpointConfig>,
        reply: oneshot::Sender<Result<(), ConfigError>>,
    },
    Status {
        reply: oneshot::Sender<Vec<EndpointStatus>>,
    },
}

/// Cloneable control handle for a running [`Engine`](crate::Engine).
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Control>,
}

impl EngineHandle {
    pub(crate) fn new(tx: mpsc::Sender<Control>) -> Self {
        Self { tx }
    }

    /// Replace the endpoint list.
    ///
    /// All links are closed. Endpoints present before and after with the same
    /// name, address and peer name keep their undelivered updates; the rest of
    /// the queues are re-derived from the registry.
    pub async fn reconfigure(&self, endpoints: Vec<EndpointConfig>) -> Result<(), UpdaterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Control::Reconfigure { endpoints, reply })
            .await
            .map_err(|_| UpdaterError::EngineGone)?;
        rx.await.map_err(|_| UpdaterError::EngineGone)??;
        Ok(())
    }

    /// Snapshot of every endpoint.
    pub async fn status(&self) -> Result<Vec<EndpointStatus>, UpdaterError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Control::Status { reply })
            .await
            .map_err(|_| UpdaterError::EngineGone)?;
        rx.await.map_err(|_| UpdaterError::EngineGone)
    }
}

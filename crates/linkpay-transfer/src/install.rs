use linkpay_channel::{ChannelEngine, EngineEvent, EventKind, ProposeInstallParams};
use linkpay_core::AppInstanceId;
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransferError;

/// Outcome of waiting on a proposal.
enum InstallOutcome {
    Installed,
    Rejected(String),
}

/// Drives `propose → install | reject | timeout` for one app instance.
///
/// Both listeners are registered before the proposal goes out so an answer
/// that arrives before `propose_install` returns is not lost. They are
/// filtered on the returned app id and dropped on every exit path. The
/// coordinator never retries.
pub struct InstallCoordinator {
    engine: Arc<dyn ChannelEngine>,
    timeout: Duration,
}

impl InstallCoordinator {
    pub fn new(engine: Arc<dyn ChannelEngine>, timeout: Duration) -> Self {
        Self { engine, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn propose_and_install(
        &self,
        params: ProposeInstallParams,
    ) -> Result<AppInstanceId, TransferError> {
        let hub = self.engine.events();
        let mut installs = hub.subscribe(EventKind::Install);
        let mut rejects = hub.subscribe(EventKind::RejectInstall);

        let app_instance_id = self
            .engine
            .propose_install(params)
            .await
            .map_err(TransferError::Proposal)?;
        tracing::debug!(%app_instance_id, "proposal sent, awaiting install");

        let wait = async {
            loop {
                tokio::select! {
                    Some(event) = installs.recv() => match event {
                        EngineEvent::Install { app_instance_id: id } if id == app_instance_id => {
                            return InstallOutcome::Installed;
                        }
                        other => tracing::debug!(?other, "ignoring install for another app"),
                    },
                    Some(event) = rejects.recv() => match event {
                        EngineEvent::RejectInstall { app_instance_id: id, reason }
                            if id == app_instance_id =>
                        {
                            return InstallOutcome::Rejected(reason);
                        }
                        other => tracing::debug!(?other, "ignoring reject for another app"),
                    },
                    else => return InstallOutcome::Rejected("event stream closed".into()),
                }
            }
        };
        let outcome = tokio::time::timeout(self.timeout, wait).await;
        drop(installs);
        drop(rejects);

        match outcome {
            Ok(InstallOutcome::Installed) => {
                tracing::info!(%app_instance_id, "app installed");
                Ok(app_instance_id)
            }
            Ok(InstallOutcome::Rejected(reason)) => {
                tracing::warn!(%app_instance_id, %reason, "install rejected");
                Err(TransferError::InstallRejected {
                    app_instance_id,
                    reason,
                })
            }
            Err(_) => {
                tracing::warn!(
                    %app_instance_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "install timed out"
                );
                Err(TransferError::InstallTimeout {
                    app_instance_id,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

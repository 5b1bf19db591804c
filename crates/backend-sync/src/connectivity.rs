use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{rpc::SyncRpc, sync::WorkerMsg};

/// Probes server reachability on a fixed interval, independent of the sync
/// loop, and signals edges into the worker's sequence.
///
/// Runs only for the lifetime of a session (an access token is configured
/// from bootstrap to logout). A failed probe is not retried; the next
/// interval tick probes again.
pub(crate) struct ConnectivityMonitor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConnectivityMonitor {
    pub(crate) fn spawn(
        rpc: Arc<dyn SyncRpc>,
        probe_interval: Duration,
        worker_tx: mpsc::Sender<WorkerMsg>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let child = cancel.child_token();

        let task = tokio::spawn(async move {
            let mut online = true;
            let mut ticker = time::interval(probe_interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // The interval's immediate first tick is skipped; the session
            // just bootstrapped, so the server is known reachable.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let reachable = rpc.get_versions().await.is_ok();
                        if reachable == online {
                            continue;
                        }
                        online = reachable;
                        debug!(online, "connectivity edge detected");
                        let signal = if online {
                            WorkerMsg::ConnectivityRestored
                        } else {
                            WorkerMsg::ConnectivityLost
                        };
                        if worker_tx.send(signal).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self { cancel, task }
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use async_trait::async_trait;

    use backend_core::OneTimeKeyCounts;

    use crate::rpc::{
        KeyClaimRequest, KeyUploadRequest, RpcError, SyncRequest, SyncResponse,
    };

    use super::*;

    struct FlakyRpc {
        versions: Mutex<VecDeque<Result<(), RpcError>>>,
    }

    impl FlakyRpc {
        fn scripted(results: Vec<Result<(), RpcError>>) -> Self {
            Self {
                versions: Mutex::new(results.into()),
            }
        }
    }

    #[async_trait]
    impl SyncRpc for FlakyRpc {
        fn set_access_token(&self, _token: Option<String>) {}

        fn abort_pending(&self) {}

        async fn sync(&self, _request: SyncRequest) -> Result<SyncResponse, RpcError> {
            Err(RpcError::transport("not scripted"))
        }

        async fn upload_keys(
            &self,
            _request: KeyUploadRequest,
        ) -> Result<OneTimeKeyCounts, RpcError> {
            Ok(OneTimeKeyCounts::new())
        }

        async fn claim_keys(&self, _request: KeyClaimRequest) -> Result<(), RpcError> {
            Ok(())
        }

        async fn get_versions(&self) -> Result<(), RpcError> {
            match self.versions.lock().expect("versions lock").pop_front() {
                Some(result) => result,
                None => Ok(()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_lost_and_restored_edges_without_duplicates() {
        let rpc = Arc::new(FlakyRpc::scripted(vec![
            Err(RpcError::transport("down")),
            Err(RpcError::transport("still down")),
            Ok(()),
        ]));
        let (tx, mut rx) = mpsc::channel(8);
        let monitor = ConnectivityMonitor::spawn(rpc, Duration::from_secs(15), tx);

        assert_eq!(rx.recv().await, Some(WorkerMsg::ConnectivityLost));
        // The second failed probe is not a new edge; the next message is
        // the recovery.
        assert_eq!(rx.recv().await, Some(WorkerMsg::ConnectivityRestored));

        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_probes_stay_silent() {
        let rpc = Arc::new(FlakyRpc::scripted(vec![Ok(()), Ok(()), Ok(())]));
        let (tx, mut rx) = mpsc::channel(8);
        let monitor = ConnectivityMonitor::spawn(rpc, Duration::from_secs(15), tx);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());

        monitor.stop();
    }
}

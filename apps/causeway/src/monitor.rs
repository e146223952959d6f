use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::session::{teardown, CloseReason, Outbound, Session, SessionRegistry};

/// How often a session is checked and probed, and how long it may stay
/// silent before it is recycled.
#[derive(Debug, Clone, Copy)]
pub struct LivenessConfig {
    pub probe_interval: Duration,
    pub idle_timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(45),
        }
    }
}

/// Supervise one session. On every tick the session is torn down if it has
/// been idle past the timeout, otherwise the transport is probed with a
/// control ping. The task exits on session shutdown or once the writer is
/// gone.
pub fn spawn_monitor(
    registry: SessionRegistry,
    session: Arc<Session>,
    liveness: LivenessConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(liveness.probe_interval);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        let shutdown = session.shutdown.notified();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if session.idle_for().await > liveness.idle_timeout {
                        teardown(&registry, &session, CloseReason::LivenessTimeout).await;
                        break;
                    }
                    if !session.enqueue(Outbound::Ping) {
                        break;
                    }
                }
            }
        }

        debug!(session_id = %session.id, "liveness monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn monitored(
        liveness: LivenessConfig,
    ) -> (
        SessionRegistry,
        Arc<Session>,
        mpsc::UnboundedReceiver<Outbound>,
        JoinHandle<()>,
    ) {
        let registry = SessionRegistry::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Session::new(tx));
        registry.register(session.clone());
        let handle = spawn_monitor(registry.clone(), session.clone(), liveness);
        (registry, session, rx, handle)
    }

    #[test_timeout::tokio_timeout_test]
    async fn idle_session_is_recycled() {
        let (registry, session, mut rx, handle) = monitored(LivenessConfig {
            probe_interval: Duration::from_millis(25),
            idle_timeout: Duration::from_millis(40),
        });

        loop {
            match rx.recv().await {
                Some(Outbound::Ping) => continue,
                Some(Outbound::Close) => break,
                Some(other) => panic!("unexpected outbound message: {other:?}"),
                None => panic!("queue closed before teardown"),
            }
        }

        assert!(!registry.contains(session.id));
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor exits")
            .expect("monitor task");
    }

    #[test_timeout::tokio_timeout_test]
    async fn active_session_stays_registered() {
        let (registry, session, mut rx, _handle) = monitored(LivenessConfig {
            probe_interval: Duration::from_millis(30),
            idle_timeout: Duration::from_millis(100),
        });

        let keepalive = {
            let session = session.clone();
            tokio::spawn(async move {
                for _ in 0..10 {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    session.touch().await;
                }
            })
        };
        keepalive.await.expect("keepalive task");

        assert!(registry.contains(session.id));
        let mut saw_ping = false;
        while let Ok(message) = rx.try_recv() {
            if matches!(message, Outbound::Ping) {
                saw_ping = true;
            }
        }
        assert!(saw_ping, "expected probes while the session stayed alive");

        teardown(&registry, &session, CloseReason::ClientDisconnect).await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn monitor_exits_on_session_shutdown() {
        let (registry, session, _rx, handle) = monitored(LivenessConfig {
            probe_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(45),
        });

        // Let the monitor reach its select loop before shutting down.
        tokio::time::sleep(Duration::from_millis(20)).await;
        teardown(&registry, &session, CloseReason::ClientDisconnect).await;

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor exits promptly")
            .expect("monitor task");
    }
}

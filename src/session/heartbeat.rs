use super::*;

use std::sync::Weak;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Admission gate guarding the session slot of one address.
pub(super) type Gate = Arc<Mutex<Option<Session>>>;

/// Spawns the liveness probe for session `session_id` behind `gate`.
///
/// Every `interval` the task takes the gate, writes an empty command and
/// waits for a prompt. A failed probe closes the session and empties the
/// slot. The task ends when the probe fails, when `stop` is cancelled,
/// when the slot no longer holds this session, or when the registry that
/// owns the gate is gone.
pub(super) fn spawn(
    gate: &Gate,
    session_id: u64,
    stop: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    let gate: Weak<Mutex<Option<Session>>> = Arc::downgrade(gate);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(strong) = gate.upgrade() else {
                break;
            };
            debug!("session {} acquiring heartbeat gate...", session_id);
            let mut slot = tokio::select! {
                _ = stop.cancelled() => break,
                slot = strong.lock() => slot,
            };

            let Some(session) = slot.as_mut().filter(|s| s.id() == session_id) else {
                debug!("session {} left the registry, heartbeat ends", session_id);
                break;
            };
            info!("{} heartbeat gate acquired", session.log_prefix());

            if let Err(err) = session.probe().await {
                if err.is_transport() {
                    error!("{} heartbeat error, transport lost: {}", session.log_prefix(), err);
                } else {
                    error!("{} heartbeat error, device not answering: {}", session.log_prefix(), err);
                }
                if let Err(close_err) = session.close().await {
                    warn!("{} close after heartbeat failure: {}", session.log_prefix(), close_err);
                }
                *slot = None;
                break;
            }
            trace!("{} heartbeat ok", session.log_prefix());
        }
        debug!("session {} heartbeat stopped", session_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceOperator;

    async fn gated_session(transport: ScriptedTransport) -> (Gate, u64, CancellationToken) {
        let operator: Arc<dyn Operator> = Arc::new(
            DeviceOperator::new(vec![("Login".to_string(), vec![r"Router> $"])], vec![], vec![])
                .expect("valid operator"),
        );
        let request = CliRequest {
            address: "10.0.0.9:23".to_string(),
            protocol: "telnet".to_string(),
            timeout_secs: 1,
            ..CliRequest::default()
        };
        let session = Session::open(request, operator, Box::new(transport), &EngineConfig::default())
            .await
            .expect("session should open");
        let id = session.id();
        let stop = session.stop_token();
        (Arc::new(Mutex::new(Some(session))), id, stop)
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_probe_keeps_session() {
        let transport = ScriptedTransport::new().with_default_reply(["\r\nRouter> "]);
        let handle = transport.clone();
        let (gate, id, stop) = gated_session(transport).await;
        let task = spawn(&gate, id, stop.clone(), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(handle.written(), vec!["\n", "\n", "\n"]);
        assert!(gate.lock().await.is_some());

        stop.cancel();
        task.await.expect("heartbeat task should stop");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_closes_and_evicts() {
        let transport = ScriptedTransport::new();
        transport.set_write_error(Some("broken pipe".to_string()));
        let handle = transport.clone();
        let (gate, id, stop) = gated_session(transport).await;
        let task = spawn(&gate, id, stop.clone(), Duration::from_secs(30));

        task.await.expect("heartbeat task should end on failure");
        assert!(gate.lock().await.is_none());
        assert!(handle.is_closed());
        assert!(stop.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_is_evicted_after_timeout() {
        let transport = ScriptedTransport::new();
        let (gate, id, stop) = gated_session(transport).await;
        let task = spawn(&gate, id, stop, Duration::from_secs(30));

        task.await.expect("heartbeat task should end on timeout");
        assert!(gate.lock().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_waits_for_the_gate() {
        let transport = ScriptedTransport::new().with_default_reply(["\r\nRouter> "]);
        let handle = transport.clone();
        let (gate, id, stop) = gated_session(transport).await;
        let held = gate.lock().await;
        let task = spawn(&gate, id, stop.clone(), Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.written().is_empty());
        drop(held);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.written(), vec!["\n"]);

        stop.cancel();
        task.await.expect("heartbeat task should stop");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_ends_idle_heartbeat() {
        let transport = ScriptedTransport::new();
        let handle = transport.clone();
        let (gate, id, stop) = gated_session(transport).await;
        let task = spawn(&gate, id, stop.clone(), Duration::from_secs(30));

        stop.cancel();
        task.await.expect("heartbeat task should stop");
        assert!(handle.written().is_empty());
        assert!(gate.lock().await.is_some());
    }
}

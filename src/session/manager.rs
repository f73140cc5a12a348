use super::*;

use std::collections::HashMap;
use std::sync::PoisonError;

use tokio::sync::OwnedMutexGuard;

use super::heartbeat::{self, Gate};

/// Process-wide cache of device sessions.
///
/// Each address owns one admission gate: a mutex around the slot holding
/// that address's [`Session`]. Holding the gate is the only way to touch
/// the session, so caller executions and heartbeat probes on one device
/// never interleave, while different devices proceed independently.
///
/// Gates are created on first use and kept for the registry's lifetime;
/// eviction empties the slot behind a gate but never replaces the gate, so
/// every waiter for an address queues on the same mutex.
pub struct ConnectionRegistry {
    gates: std::sync::Mutex<HashMap<String, Gate>>,
    connector: Arc<dyn Connector>,
    config: EngineConfig,
    dial_options: DialOptions,
}

/// Exclusive use of one address's session, held from acquisition until
/// release.
///
/// Dropping the lease releases the gate.
pub struct SessionLease {
    address: String,
    log_prefix: String,
    slot: OwnedMutexGuard<Option<Session>>,
}

impl ConnectionRegistry {
    /// Creates a registry that dials real SSH and Telnet connections.
    pub fn new() -> Self {
        Self::with_connector(Arc::new(NetworkConnector))
    }

    /// Creates a registry that opens transports through `connector`.
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        let config = EngineConfig::default();
        Self {
            gates: std::sync::Mutex::new(HashMap::new()),
            connector,
            dial_options: DialOptions::from_config(&config),
            config,
        }
    }

    /// Replaces the engine settings; dial timeout follows `config`.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.dial_options.connect_timeout = config.dial_timeout();
        self.config = config;
        self
    }

    /// Replaces the dial options (algorithm profile, host-key policy).
    pub fn with_dial_options(mut self, options: DialOptions) -> Self {
        self.dial_options = options;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn gate(&self, address: &str) -> Gate {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(address.to_string()).or_default())
    }

    fn all_gates(&self) -> Vec<(String, Gate)> {
        let gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        gates
            .iter()
            .map(|(addr, gate)| (addr.clone(), Arc::clone(gate)))
            .collect()
    }

    /// Returns the session for `request.address`, waiting for its gate.
    ///
    /// A cached session is rebound to `request` and `operator`; otherwise a
    /// new one is dialed, initialised and cached, and its heartbeat
    /// started. Dial failures leave nothing cached.
    pub async fn acquire(
        &self,
        request: CliRequest,
        operator: Arc<dyn Operator>,
    ) -> Result<SessionLease, ConnectError> {
        request.protocol()?;
        let address = request.address.clone();
        let log_prefix = request.log_prefix.clone();

        let gate = self.gate(&address);
        debug!("{} Acquiring sema...", log_prefix);
        let mut slot = Arc::clone(&gate).lock_owned().await;
        debug!("{} sema acquired", log_prefix);

        if slot.as_ref().is_some_and(Session::is_closed) {
            debug!("{} cached cli conn was closed, evicting", log_prefix);
            *slot = None;
        }

        match slot.as_mut() {
            Some(session) => {
                debug!("{} cli conn exist", log_prefix);
                session.bind(request, operator);
            }
            None => {
                debug!("{} Cache miss, creating new connection for {}", log_prefix, address);
                let transport = self
                    .connector
                    .connect(&request, operator.as_ref(), &self.dial_options)
                    .await?;
                let session = Session::open(request, operator, transport, &self.config).await?;
                heartbeat::spawn(
                    &gate,
                    session.id(),
                    session.stop_token(),
                    self.config.heartbeat_interval(),
                );
                debug!("{} New connection for {} has been cached", log_prefix, address);
                *slot = Some(session);
            }
        }

        Ok(SessionLease {
            address,
            log_prefix,
            slot,
        })
    }

    /// Vacates the admission gate held by `lease`.
    pub fn release(&self, lease: SessionLease) {
        drop(lease);
    }

    /// Closes the leased session, evicts it and releases the gate.
    pub async fn close(&self, mut lease: SessionLease) -> Result<(), ConnectError> {
        lease.close().await
    }

    /// Whether a live session is cached for `address`.
    ///
    /// Waits for the address's gate if it is held.
    pub async fn contains(&self, address: &str) -> bool {
        let gate = {
            let gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            match gates.get(address) {
                Some(gate) => Arc::clone(gate),
                None => return false,
            }
        };
        gate.lock().await.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Number of live cached sessions. Waits for every held gate.
    pub async fn len(&self) -> usize {
        let mut live = 0;
        for (_, gate) in self.all_gates() {
            if gate.lock().await.as_ref().is_some_and(|s| !s.is_closed()) {
                live += 1;
            }
        }
        live
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every cached session, waiting for in-flight operations.
    pub async fn shutdown(&self) {
        for (address, gate) in self.all_gates() {
            let mut slot = gate.lock().await;
            if let Some(mut session) = slot.take() {
                debug!("shutdown: closing {}", address);
                if let Err(err) = session.close().await {
                    warn!("shutdown: close {} failed, {}", address, err);
                }
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLease {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The leased session; `None` once it has been closed.
    pub fn session(&self) -> Option<&Session> {
        self.slot.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.slot.as_mut()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.slot.as_ref().map(Session::id)
    }

    /// Runs the bound request on the leased session.
    pub async fn exec(&mut self) -> Result<CommandResults, ExecError> {
        match self.slot.as_mut() {
            Some(session) => session.exec().await,
            None => Err(ExecError::new(
                CommandResults::new(),
                ConnectError::SessionClosed(self.address.clone()),
            )),
        }
    }

    /// Closes the session and empties its slot; the gate stays held until
    /// the lease is dropped.
    pub async fn close(&mut self) -> Result<(), ConnectError> {
        match self.slot.take() {
            Some(mut session) => {
                debug!("{} closing cli conn {}", self.log_prefix, self.address);
                session.close().await
            }
            None => Ok(()),
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        debug!("{} sema released", self.log_prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceOperator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out scripted transports and counts dials.
    struct CountingConnector {
        dials: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(
            &self,
            request: &CliRequest,
            _operator: &dyn Operator,
            _options: &DialOptions,
        ) -> Result<Box<dyn Transport>, ConnectError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ConnectError::DialFailure {
                    addr: request.address.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            Ok(Box::new(
                ScriptedTransport::new().with_default_reply(["\r\nRouter> "]),
            ))
        }
    }

    fn registry(fail: bool) -> (ConnectionRegistry, Arc<CountingConnector>) {
        let connector = Arc::new(CountingConnector {
            dials: AtomicUsize::new(0),
            fail,
        });
        (ConnectionRegistry::with_connector(connector.clone()), connector)
    }

    fn operator() -> Arc<dyn Operator> {
        Arc::new(
            DeviceOperator::new(vec![("Login".to_string(), vec![r"Router> $"])], vec![], vec![])
                .expect("valid operator"),
        )
    }

    fn request(address: &str) -> CliRequest {
        CliRequest {
            address: address.to_string(),
            protocol: "telnet".to_string(),
            mode: "login".to_string(),
            commands: vec!["show clock".to_string()],
            timeout_secs: 5,
            log_prefix: format!("[{address}]"),
            ..CliRequest::default()
        }
    }

    #[tokio::test]
    async fn acquire_twice_returns_same_session() {
        let (registry, connector) = registry(false);

        let lease = registry.acquire(request("10.0.0.1:23"), operator()).await.unwrap();
        let first = lease.session_id();
        registry.release(lease);

        let lease = registry.acquire(request("10.0.0.1:23"), operator()).await.unwrap();
        assert_eq!(lease.session_id(), first);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_rebinds_request() {
        let (registry, _) = registry(false);
        let lease = registry.acquire(request("10.0.0.1:23"), operator()).await.unwrap();
        registry.release(lease);

        let mut second = request("10.0.0.1:23");
        second.log_prefix = "[second]".to_string();
        let lease = registry.acquire(second, operator()).await.unwrap();
        let session = lease.session().expect("session cached");
        assert_eq!(session.request().log_prefix, "[second]");
    }

    #[tokio::test]
    async fn dial_failure_caches_nothing() {
        let (registry, connector) = registry(true);
        let result = registry.acquire(request("10.0.0.2:23"), operator()).await;
        assert!(matches!(result, Err(ConnectError::DialFailure { .. })));
        assert!(!registry.contains("10.0.0.2:23").await);

        // The gate was released: a second attempt dials again instead of hanging.
        let _ = registry.acquire(request("10.0.0.2:23"), operator()).await;
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsupported_protocol_is_rejected_before_dialing() {
        let (registry, connector) = registry(false);
        let mut req = request("10.0.0.3:23");
        req.protocol = "rlogin".to_string();
        let result = registry.acquire(req, operator()).await;
        assert!(matches!(result, Err(ConnectError::UnsupportedProtocol(_))));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_evicts_and_next_acquire_redials() {
        let (registry, connector) = registry(false);
        let lease = registry.acquire(request("10.0.0.4:23"), operator()).await.unwrap();
        let first = lease.session_id();
        registry.close(lease).await.unwrap();
        assert!(!registry.contains("10.0.0.4:23").await);

        let lease = registry.acquire(request("10.0.0.4:23"), operator()).await.unwrap();
        assert_ne!(lease.session_id(), first);
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn closed_lease_exec_reports_session_closed() {
        let (registry, _) = registry(false);
        let mut lease = registry.acquire(request("10.0.0.5:23"), operator()).await.unwrap();
        lease.close().await.unwrap();
        lease.close().await.unwrap();
        let err = lease.exec().await.expect_err("closed session cannot exec");
        assert!(matches!(err.source, ConnectError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn session_closed_through_lease_is_redialed() {
        let (registry, connector) = registry(false);
        let mut lease = registry.acquire(request("10.0.0.9:23"), operator()).await.unwrap();
        let first = lease.session_id();
        lease
            .session_mut()
            .expect("session cached")
            .close()
            .await
            .unwrap();
        registry.release(lease);

        let mut lease = registry.acquire(request("10.0.0.9:23"), operator()).await.unwrap();
        assert_ne!(lease.session_id(), first);
        assert_eq!(lease.session().map(Session::is_closed), Some(false));
        assert_eq!(connector.dials.load(Ordering::SeqCst), 2);
        assert!(lease.exec().await.is_ok());
    }

    #[tokio::test]
    async fn different_addresses_do_not_block_each_other() {
        let (registry, _) = registry(false);
        let held = registry.acquire(request("10.0.0.6:23"), operator()).await.unwrap();
        let other = tokio::time::timeout(
            Duration::from_secs(1),
            registry.acquire(request("10.0.0.7:23"), operator()),
        )
        .await;
        assert!(matches!(other, Ok(Ok(_))));
        drop(held);
    }

    #[tokio::test]
    async fn same_address_waits_for_release() {
        let (registry, _) = registry(false);
        let held = registry.acquire(request("10.0.0.8:23"), operator()).await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            registry.acquire(request("10.0.0.8:23"), operator()),
        )
        .await;
        assert!(blocked.is_err());
        registry.release(held);
        let lease = registry.acquire(request("10.0.0.8:23"), operator()).await;
        assert!(lease.is_ok());
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let (registry, _) = registry(false);
        for addr in ["10.0.1.1:23", "10.0.1.2:23"] {
            let lease = registry.acquire(request(addr), operator()).await.unwrap();
            registry.release(lease);
        }
        assert_eq!(registry.len().await, 2);
        registry.shutdown().await;
        assert!(registry.is_empty().await);
        assert!(!registry.contains("10.0.1.1:23").await);
        assert!(!registry.contains("10.0.1.2:23").await);
    }
}

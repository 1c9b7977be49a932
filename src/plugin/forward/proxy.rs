use crate::plugin::forward::host::Host;
use crate::plugin::forward::transport::{Connection, Transport, WireProtocol};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

const DEFAULT_HC_INTERVAL: Duration = Duration::from_millis(500);

/// Binds one Host to one Transport and owns the per-upstream health-check task.
pub struct Proxy {
    host: Arc<Host>,
    transport: Transport,
    force_tcp: bool,
    health_handle: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[allow(clippy::too_many_arguments)]
impl Proxy {
    pub fn new(
        addr: String,
        is_tls: bool,
        server_name: Option<String>,
        tls_connector: Option<TlsConnector>,
        max_fails: u32,
        expire: Duration,
        hc_interval: Duration,
        force_tcp: bool,
    ) -> Arc<Self> {
        let host = Arc::new(Host::new(addr, is_tls, server_name, tls_connector, expire, max_fails));
        let transport = Transport::start(host.clone());

        let (stop_tx, stop_rx) = oneshot::channel();
        let hc_host = host.clone();
        let health_handle = tokio::spawn(Self::health_check_loop(hc_host, hc_interval, stop_rx));

        Arc::new(Self {
            host,
            transport,
            force_tcp,
            health_handle: Mutex::new(Some(health_handle)),
            stop_tx: Mutex::new(Some(stop_tx)),
        })
    }

    /// Probes once immediately -- the host starts "down", so skipping straight to
    /// the first tick would leave it unavailable for a whole interval -- then ticks.
    async fn health_check_loop(host: Arc<Host>, hc_interval: Duration, mut stop_rx: oneshot::Receiver<()>) {
        host.check().await;
        let mut ticker = tokio::time::interval(hc_interval);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => { host.check().await; }
                _ = &mut stop_rx => { return; }
            }
        }
    }

    pub async fn dial(&self, proto: WireProtocol) -> Result<Connection> {
        self.transport.dial(proto).await
    }

    pub fn yield_conn(&self, conn: Connection) {
        self.transport.yield_conn(conn)
    }

    pub fn down(&self, max_fails: u32) -> bool {
        self.host.down(max_fails)
    }

    pub fn force_tcp(&self) -> bool {
        self.force_tcp
    }

    pub fn has_tls(&self) -> bool {
        self.host.is_tls
    }

    pub fn addr(&self) -> &str {
        &self.host.addr
    }

    pub fn close(&self) {
        if let Some(tx) = self.stop_tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.health_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.transport.stop();
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.close();
    }
}

pub fn default_hc_interval() -> Duration {
    DEFAULT_HC_INTERVAL
}

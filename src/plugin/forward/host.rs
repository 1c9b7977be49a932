use crate::plugin::prometheus::FORWARD_HEALTHCHECK_FAILURE_COUNT;
use anyhow::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{rustls::ServerName, TlsConnector};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// The address-plus-liveness record for one upstream. Exclusively owned by one Proxy.
pub struct Host {
    pub addr: String,
    pub is_tls: bool,
    pub server_name: Option<String>,
    pub tls_connector: Option<TlsConnector>,
    pub expire: Duration,

    fails: AtomicU32,
    checking: Mutex<bool>,
}

impl Host {
    /// The fail counter starts at `max_fails + 1`, so the host is considered down
    /// until its first successful probe.
    pub fn new(
        addr: String,
        is_tls: bool,
        server_name: Option<String>,
        tls_connector: Option<TlsConnector>,
        expire: Duration,
        max_fails: u32,
    ) -> Self {
        Self {
            addr,
            is_tls,
            server_name,
            tls_connector,
            expire,
            fails: AtomicU32::new(max_fails + 1),
            checking: Mutex::new(false),
        }
    }

    pub fn down(&self, max_fails: u32) -> bool {
        if max_fails == 0 {
            return false;
        }
        self.fails.load(Ordering::Acquire) > max_fails
    }

    /// Runs a probe and updates the fail counter. Idempotent under concurrent callers:
    /// a caller that arrives while a probe is already in flight is a no-op.
    pub async fn check(&self) {
        {
            let mut checking = self.checking.lock().unwrap();
            if *checking {
                return;
            }
            *checking = true;
        }

        match self.probe().await {
            Ok(()) => self.fails.store(0, Ordering::Release),
            Err(e) => {
                self.fails.fetch_add(1, Ordering::AcqRel);
                FORWARD_HEALTHCHECK_FAILURE_COUNT
                    .with_label_values(&[&self.addr])
                    .inc();
                tracing::debug!("[forward] probe failed for {}: {}", self.addr, e);
            }
        }

        *self.checking.lock().unwrap() = false;
    }

    /// Sends a root-zone NS query over TCP with RecursionDesired=false, and counts any
    /// reply -- regardless of its content -- as a live upstream.
    async fn probe(&self) -> Result<()> {
        let query = build_probe_query();

        if self.is_tls {
            let connector = self
                .tls_connector
                .clone()
                .ok_or_else(|| anyhow::anyhow!("probe requires tls config for {}", self.addr))?;
            let tcp = timeout(PROBE_TIMEOUT, TcpStream::connect(&self.addr)).await??;
            let domain_str = self.server_name.clone().unwrap_or_else(|| {
                self.addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&self.addr).to_string()
            });
            let domain = ServerName::try_from(domain_str.as_str())
                .map_err(|_| anyhow::anyhow!("invalid server name '{}'", domain_str))?;
            let mut stream = timeout(PROBE_TIMEOUT, connector.connect(domain, tcp)).await??;
            timeout(PROBE_TIMEOUT, write_framed(&mut stream, &query)).await??;
            let resp = timeout(PROBE_TIMEOUT, read_framed(&mut stream)).await??;
            if resp.is_empty() {
                anyhow::bail!("empty reply");
            }
            Ok(())
        } else {
            let mut stream = timeout(PROBE_TIMEOUT, TcpStream::connect(&self.addr)).await??;
            timeout(PROBE_TIMEOUT, write_framed(&mut stream, &query)).await??;
            let resp = timeout(PROBE_TIMEOUT, read_framed(&mut stream)).await??;
            if resp.is_empty() {
                anyhow::bail!("empty reply");
            }
            Ok(())
        }
    }
}

async fn write_framed<S: AsyncWriteExt + Unpin>(stream: &mut S, query: &[u8]) -> Result<()> {
    let len = query.len() as u16;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(query).await?;
    Ok(())
}

async fn read_framed<S: AsyncReadExt + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Builds a ". IN NS" query with RD=0, the wire probe used by health checks.
fn build_probe_query() -> Vec<u8> {
    let id: u16 = rand::random();
    let mut msg = Vec::with_capacity(17);
    msg.extend_from_slice(&id.to_be_bytes());
    msg.push(0x00); // QR=0, opcode=0, AA=0, TC=0, RD=0
    msg.push(0x00); // RA=0, Z=0, RCODE=0
    msg.extend_from_slice(&[0x00, 0x01]); // QDCOUNT=1
    msg.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
    msg.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
    msg.extend_from_slice(&[0x00, 0x00]); // ARCOUNT
    msg.push(0x00); // root name
    msg.extend_from_slice(&[0x00, 0x02]); // QTYPE=NS
    msg.extend_from_slice(&[0x00, 0x01]); // QCLASS=IN
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fails_initialized_above_max_fails() {
        let host = Host::new("127.0.0.1:0".into(), false, None, None, Duration::from_secs(10), 2);
        assert!(host.down(2), "host must start down until its first probe succeeds");
    }

    #[test]
    fn maxfails_zero_disables_gate() {
        let host = Host::new("127.0.0.1:0".into(), false, None, None, Duration::from_secs(10), 2);
        assert!(!host.down(0));
    }

    #[test]
    fn probe_query_targets_root_ns() {
        let q = build_probe_query();
        assert_eq!(q.len(), 17);
        assert_eq!(q[2] & 0x01, 0x00, "RD must be unset");
        assert_eq!(q[12], 0x00, "root name");
        assert_eq!(&q[13..15], &[0x00, 0x02], "QTYPE NS");
    }
}

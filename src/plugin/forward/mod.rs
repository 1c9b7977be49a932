pub mod host;
pub mod proxy;
pub mod transport;

use crate::config::PluginConfig;
use crate::plugin::forward::proxy::{default_hc_interval, Proxy};
use crate::plugin::forward::transport::WireProtocol;
use crate::plugin::prometheus::{FORWARD_REQUEST_COUNT, FORWARD_REQUEST_DURATION};
use crate::plugin::{Plugin, SharedState};
use crate::types::DnsMessage;
use anyhow::Result;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_rustls::rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore};
use tokio_rustls::TlsConnector;

/// Matches the query name against `from`/`ignored`, picks a randomized upstream
/// order, and runs the per-request failover loop against it.
pub struct ForwardPlugin {
    from: String,
    ignored: Vec<String>,
    proxies: Vec<Arc<Proxy>>,
    max_fails: u32,
    force_tcp: bool,
    error_tx: mpsc::Sender<String>,
}

#[async_trait::async_trait]
impl Plugin for ForwardPlugin {
    fn name(&self) -> &str {
        "forward"
    }

    fn from_config(config: &PluginConfig, shared: Arc<SharedState>) -> Result<Self> {
        let mut args = config.args.iter();
        let from_raw = args
            .next()
            .ok_or_else(|| anyhow::anyhow!("forward: missing zone argument"))?;
        let from = normalize_zone(from_raw);
        let to: Vec<String> = args.cloned().collect();
        if to.is_empty() {
            anyhow::bail!("forward: at least one upstream is required");
        }

        let mut ignored = Vec::new();
        let mut max_fails: u32 = 2;
        let mut hc_interval = default_hc_interval();
        let mut force_tcp = false;
        let mut expire = Duration::from_secs(10);
        let mut tls_cert = None;
        let mut tls_key = None;
        let mut tls_ca = None;
        let mut tls_servername = None;

        for sub in &config.block {
            match sub.name.as_str() {
                "except" => {
                    if sub.args.is_empty() {
                        anyhow::bail!("forward: 'except' requires at least one name");
                    }
                    ignored = sub.args.iter().map(|n| normalize_zone(n)).collect();
                }
                "max_fails" => {
                    let arg = sub.args.first().ok_or_else(|| anyhow::anyhow!("forward: 'max_fails' requires an argument"))?;
                    max_fails = arg.parse().map_err(|_| anyhow::anyhow!("forward: invalid max_fails '{}'", arg))?;
                }
                "health_check" => {
                    let arg = sub.args.first().ok_or_else(|| anyhow::anyhow!("forward: 'health_check' requires an argument"))?;
                    hc_interval = parse_duration(arg)?;
                }
                "force_tcp" => {
                    if !sub.args.is_empty() {
                        anyhow::bail!("forward: 'force_tcp' takes no arguments");
                    }
                    force_tcp = true;
                }
                "expire" => {
                    let arg = sub.args.first().ok_or_else(|| anyhow::anyhow!("forward: 'expire' requires an argument"))?;
                    expire = parse_duration(arg)?;
                }
                "tls" => {
                    tls_cert = sub.args.first().cloned();
                    tls_key = sub.args.get(1).cloned();
                    tls_ca = sub.args.get(2).cloned();
                }
                "tls_servername" => {
                    tls_servername = sub.args.first().cloned();
                }
                other => anyhow::bail!("forward: unknown property '{}'", other),
            }
        }

        let needs_tls = to.iter().any(|t| t.starts_with("tls://")) || tls_cert.is_some();
        let tls_connector = if needs_tls {
            Some(TlsConnector::from(Arc::new(build_tls_config(
                tls_cert.as_deref(),
                tls_key.as_deref(),
                tls_ca.as_deref(),
            )?)))
        } else {
            None
        };

        let mut proxies = Vec::with_capacity(to.len());
        for raw in &to {
            let (addr, is_tls) = parse_upstream(raw)?;
            proxies.push(Proxy::new(
                addr,
                is_tls,
                tls_servername.clone(),
                if is_tls { tls_connector.clone() } else { None },
                max_fails,
                expire,
                hc_interval,
                force_tcp,
            ));
        }

        tracing::info!(
            "[forward] '{}' -> {} upstream(s), max_fails={}, health_check={:?}",
            from,
            proxies.len(),
            max_fails,
            hc_interval
        );

        Ok(Self {
            from,
            ignored,
            proxies,
            max_fails,
            force_tcp,
            error_tx: shared.error_tx.clone(),
        })
    }

    async fn process(&self, msg: &mut DnsMessage) -> Result<DnsMessage> {
        if msg.halt_chain || self.proxies.is_empty() || msg.raw_query.is_empty() {
            return Ok(msg.clone());
        }

        let qname = extract_qname_string(&msg.raw_query).unwrap_or_else(|| ".".to_string());
        if !self.is_allowed_domain(&qname) {
            return Ok(msg.clone());
        }

        let client_proto = if msg.protocol == "tcp" { WireProtocol::Tcp } else { WireProtocol::Udp };
        let family = family_str(msg.client_addr);

        for idx in order_indices(self.proxies.len()) {
            let proxy = &self.proxies[idx];
            if proxy.down(self.max_fails) {
                continue;
            }

            let proto = select_wire_protocol(client_proto, self.force_tcp || proxy.force_tcp(), proxy.has_tls());
            let start = std::time::Instant::now();

            let mut conn = match proxy.dial(proto).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("[forward] dial {} ({}) failed for '{}': {}", proxy.addr(), proto.as_str(), qname, e);
                    let _ = self.error_tx.send(format!("forward: dial {} failed: {}", proxy.addr(), e)).await;
                    continue;
                }
            };

            if let Err(e) = conn.write_msg(&msg.raw_query).await {
                tracing::warn!("[forward] write to {} failed for '{}': {}", proxy.addr(), qname, e);
                let _ = self.error_tx.send(format!("forward: write to {} failed: {}", proxy.addr(), e)).await;
                continue;
            }

            let response = match conn.read_msg().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("[forward] read from {} failed for '{}': {}", proxy.addr(), qname, e);
                    let _ = self.error_tx.send(format!("forward: read from {} failed: {}", proxy.addr(), e)).await;
                    continue;
                }
            };

            let duration = start.elapsed().as_secs_f64();
            FORWARD_REQUEST_COUNT.with_label_values(&[proto.as_str(), family, proxy.addr()]).inc();
            FORWARD_REQUEST_DURATION.with_label_values(&[proto.as_str(), family, proxy.addr()]).observe(duration);

            proxy.yield_conn(conn);

            msg.raw_response = Some(response);
            msg.halt_chain = true;
            msg.answered_by = "forward".to_string();
            tracing::info!("[forward] resolved '{}' via {} ({}) in {:.4}s", qname, proxy.addr(), proto.as_str(), duration);
            return Ok(msg.clone());
        }

        tracing::warn!("[forward] no healthy upstream for '{}'", qname);
        let _ = self.error_tx.send(format!("forward: no healthy upstream for {}", qname)).await;
        msg.raw_response = Some(build_error_response(&msg.raw_query, 2));
        msg.halt_chain = true;
        msg.answered_by = "forward".to_string();
        Ok(msg.clone())
    }

    fn priority(&self) -> u8 {
        100
    }
}

impl ForwardPlugin {
    /// A query matches when it is a sub-name of `from` and not a sub-name of any
    /// `ignored` entry. Exact equality to `from` always matches, ignore list or not.
    fn is_allowed_domain(&self, name: &str) -> bool {
        if name.eq_ignore_ascii_case(&self.from) {
            return true;
        }
        if !is_subdomain(name, &self.from) {
            return false;
        }
        for ignore in &self.ignored {
            if is_subdomain(name, ignore) {
                return false;
            }
        }
        true
    }
}

/// N=1: identity. N=2: uniform swap. N>=3: uniform permutation. Recomputed per request.
fn order_indices(n: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..n).collect();
    match n {
        0 | 1 => idx,
        2 => {
            if rand::random::<bool>() {
                idx.swap(0, 1);
            }
            idx
        }
        _ => {
            idx.shuffle(&mut rand::thread_rng());
            idx
        }
    }
}

/// TLS beats force_tcp beats the client's own transport.
fn select_wire_protocol(client_proto: WireProtocol, force_tcp: bool, has_tls: bool) -> WireProtocol {
    let mut proto = client_proto;
    if force_tcp {
        proto = WireProtocol::Tcp;
    }
    if has_tls {
        proto = WireProtocol::TcpTls;
    }
    proto
}

fn is_subdomain(name: &str, suffix: &str) -> bool {
    if suffix == "." {
        return true;
    }
    if name.eq_ignore_ascii_case(suffix) {
        return true;
    }
    let name = name.to_ascii_lowercase();
    let suffix = suffix.to_ascii_lowercase();
    name.ends_with(&format!(".{suffix}"))
}

fn normalize_zone(s: &str) -> String {
    let mut z = s.to_ascii_lowercase();
    if !z.ends_with('.') {
        z.push('.');
    }
    z
}

fn parse_upstream(raw: &str) -> Result<(String, bool)> {
    if let Some(rest) = raw.strip_prefix("grpc://") {
        anyhow::bail!("forward: grpc upstream '{}' is not supported", rest);
    }
    let (is_tls, rest) = if let Some(rest) = raw.strip_prefix("tls://") {
        (true, rest)
    } else if let Some(rest) = raw.strip_prefix("dns://") {
        (false, rest)
    } else {
        (false, raw)
    };

    let addr = if let Some((host, port)) = rest.rsplit_once(':') {
        if is_tls && port == "53" {
            format!("{host}:853")
        } else {
            rest.to_string()
        }
    } else {
        format!("{}:{}", rest, if is_tls { 853 } else { 53 })
    };

    Ok((addr, is_tls))
}

fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix("ms") {
        Ok(Duration::from_millis(stripped.parse()?))
    } else if let Some(stripped) = s.strip_suffix('s') {
        Ok(Duration::from_secs(stripped.parse()?))
    } else if let Some(stripped) = s.strip_suffix('m') {
        Ok(Duration::from_secs(stripped.parse::<u64>()? * 60))
    } else {
        anyhow::bail!("invalid duration '{}'", s)
    }
}

fn family_str(addr: Option<SocketAddr>) -> &'static str {
    match addr {
        Some(SocketAddr::V4(_)) => "1",
        Some(SocketAddr::V6(_)) => "2",
        None => "",
    }
}

fn build_error_response(query: &[u8], rcode: u8) -> Vec<u8> {
    let mut resp = query.to_vec();
    if resp.len() >= 4 {
        resp[2] |= 0x80;
        resp[3] |= rcode & 0x0F;
    }
    resp
}

fn extract_qname_string(query: &[u8]) -> Option<String> {
    if query.len() < 12 {
        return None;
    }
    let mut offset = 12;
    let mut parts = Vec::new();
    while offset < query.len() {
        let len = query[offset] as usize;
        offset += 1;
        if len == 0 {
            break;
        }
        if offset + len <= query.len() {
            if let Ok(s) = std::str::from_utf8(&query[offset..offset + len]) {
                parts.push(s.to_string());
            }
            offset += len;
        } else {
            break;
        }
    }
    if parts.is_empty() {
        Some(".".to_string())
    } else {
        Some(format!("{}.", parts.join(".")))
    }
}

fn build_tls_config(cert: Option<&str>, key: Option<&str>, ca: Option<&str>) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    }));

    if let Some(ca_path) = ca {
        let certs = load_certs(ca_path)?;
        for cert in &certs {
            root_store
                .add(cert)
                .map_err(|e| anyhow::anyhow!("forward: invalid CA cert '{}': {}", ca_path, e))?;
        }
    }

    let builder = ClientConfig::builder().with_safe_defaults().with_root_certificates(root_store);

    let config = match (cert, key) {
        (Some(cert_path), Some(key_path)) => {
            let chain = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder.with_client_auth_cert(chain, key)?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => anyhow::bail!("forward: 'tls' requires both a cert and a key, or neither"),
    };

    Ok(config)
}

fn load_certs(path: &str) -> Result<Vec<Certificate>> {
    let file = std::fs::File::open(path).map_err(|e| anyhow::anyhow!("forward: cannot open '{}': {}", path, e))?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).map_err(|e| anyhow::anyhow!("forward: cannot parse '{}': {}", path, e))?;
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &str) -> Result<PrivateKey> {
    let file = std::fs::File::open(path).map_err(|e| anyhow::anyhow!("forward: cannot open '{}': {}", path, e))?;
    let mut reader = std::io::BufReader::new(file);
    let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| anyhow::anyhow!("forward: cannot parse '{}': {}", path, e))?;
    let key = keys
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("forward: no private key found in '{}'", path))?;
    Ok(PrivateKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    fn shared() -> Arc<SharedState> {
        Arc::new(SharedState::new_with_cache(
            Arc::new(crate::plugin::cache::CacheStore::new()),
            "Corefile".to_string(),
        ))
    }

    fn plugin_config(args: &[&str], block: Vec<PluginConfig>) -> PluginConfig {
        PluginConfig {
            name: "forward".to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            block,
        }
    }

    fn sub(name: &str, args: &[&str]) -> PluginConfig {
        PluginConfig {
            name: name.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            block: Vec::new(),
        }
    }

    fn sample_query(name_labels: &[&str], qtype: u16) -> Vec<u8> {
        let mut msg = vec![0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        for label in name_labels {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label.as_bytes());
        }
        msg.push(0x00);
        msg.extend_from_slice(&qtype.to_be_bytes());
        msg.extend_from_slice(&[0x00, 0x01]);
        msg
    }

    /// A backend that answers both the UDP query path and the TCP health probe on
    /// the same port, mirroring the dnstest double the original Go tests use.
    async fn spawn_echo_backend() -> (String, Arc<AtomicU64>) {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = udp.local_addr().unwrap();
        let tcp = TcpListener::bind(addr).await.unwrap();
        let counter = Arc::new(AtomicU64::new(0));

        let udp_counter = counter.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((n, from)) = udp.recv_from(&mut buf).await else { return };
                udp_counter.fetch_add(1, Ordering::SeqCst);
                let _ = udp.send_to(&buf[..n], from).await;
            }
        });

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = tcp.accept().await else { return };
                tokio::spawn(async move {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut buf = vec![0u8; len];
                    if stream.read_exact(&mut buf).await.is_err() {
                        return;
                    }
                    let resp_len = buf.len() as u16;
                    let _ = stream.write_all(&resp_len.to_be_bytes()).await;
                    let _ = stream.write_all(&buf).await;
                });
            }
        });

        (addr.to_string(), counter)
    }

    /// UDP-only: the health probe (always TCP) can never connect, so this upstream
    /// stays down forever.
    async fn spawn_udp_only_backend() -> (String, Arc<AtomicU64>) {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = udp.local_addr().unwrap();
        let counter = Arc::new(AtomicU64::new(0));
        let udp_counter = counter.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((n, from)) = udp.recv_from(&mut buf).await else { return };
                udp_counter.fetch_add(1, Ordering::SeqCst);
                let _ = udp.send_to(&buf[..n], from).await;
            }
        });
        (addr.to_string(), counter)
    }

    fn dns_message(query: Vec<u8>) -> DnsMessage {
        DnsMessage {
            raw_query: query,
            protocol: "udp".to_string(),
            client_addr: Some("127.0.0.1:9999".parse().unwrap()),
            ..Default::default()
        }
    }

    // S4: allowed-domain matrix.
    #[test]
    fn is_allowed_domain_matrix() {
        let plugin = ForwardPlugin {
            from: ".".to_string(),
            ignored: vec!["example.net.".to_string()],
            proxies: Vec::new(),
            max_fails: 2,
            force_tcp: false,
            error_tx: mpsc::channel(1).0,
        };

        assert!(plugin.is_allowed_domain("."));
        assert!(plugin.is_allowed_domain("www.example.org."));
        assert!(!plugin.is_allowed_domain("example.net."));
        assert!(!plugin.is_allowed_domain("www.example.net."));
    }

    #[test]
    fn ordering_is_identity_for_one_and_covers_all_indices() {
        assert_eq!(order_indices(1), vec![0]);
        let mut order = order_indices(5);
        order.sort();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn ordering_for_two_only_ever_swaps() {
        for _ in 0..50 {
            let order = order_indices(2);
            assert!(order == vec![0, 1] || order == vec![1, 0]);
        }
    }

    // S6: TLS beats force_tcp beats client proto.
    #[test]
    fn wire_protocol_precedence() {
        assert_eq!(select_wire_protocol(WireProtocol::Udp, false, false), WireProtocol::Udp);
        assert_eq!(select_wire_protocol(WireProtocol::Udp, true, false), WireProtocol::Tcp);
        assert_eq!(select_wire_protocol(WireProtocol::Udp, true, true), WireProtocol::TcpTls);
        assert_eq!(select_wire_protocol(WireProtocol::Tcp, false, true), WireProtocol::TcpTls);
    }

    #[test]
    fn grpc_upstream_is_rejected() {
        assert!(parse_upstream("grpc://10.0.0.1:53").is_err());
    }

    #[test]
    fn tls_upstream_rewrites_default_port() {
        let (addr, is_tls) = parse_upstream("tls://10.0.0.1:53").unwrap();
        assert!(is_tls);
        assert_eq!(addr, "10.0.0.1:853");
    }

    #[test]
    fn tls_upstream_keeps_explicit_nondefault_port() {
        let (addr, _) = parse_upstream("tls://10.0.0.1:8853").unwrap();
        assert_eq!(addr, "10.0.0.1:8853");
    }

    // S1: single backend echo.
    #[tokio::test]
    async fn single_backend_echoes_and_is_health_checked() {
        let (addr, counter) = spawn_echo_backend().await;
        let config = plugin_config(&[".", &addr], vec![sub("health_check", &["5ms"])]);
        let plugin = ForwardPlugin::from_config(&config, shared()).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await; // let the initial probe mark the host up

        let query = sample_query(&["example", "org"], 28);
        let mut msg = dns_message(query.clone());
        let result = plugin.process(&mut msg).await.unwrap();

        assert_eq!(result.raw_response.unwrap(), query);
        assert_eq!(result.answered_by, "forward");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }

    // S2: two backends, exactly one receives the query.
    #[tokio::test]
    async fn two_backends_exactly_one_serves_the_query() {
        let (addr1, counter1) = spawn_echo_backend().await;
        let (addr2, counter2) = spawn_echo_backend().await;
        let config = plugin_config(&[".", &addr1, &addr2], vec![sub("health_check", &["5ms"])]);
        let plugin = ForwardPlugin::from_config(&config, shared()).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await; // let initial probes land
        let query = sample_query(&["example", "org"], 1);
        let mut msg = dns_message(query);
        let result = plugin.process(&mut msg).await.unwrap();
        assert!(result.raw_response.is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter1.load(Ordering::SeqCst) > 0 || counter2.load(Ordering::SeqCst) > 0);
    }

    // S3: dead (UDP-only) backend -> SERVFAIL, zero packets delivered.
    #[tokio::test]
    async fn dead_backend_returns_servfail() {
        let (addr, counter) = spawn_udp_only_backend().await;
        let config = plugin_config(&[".", &addr], vec![sub("health_check", &["5ms"])]);
        let plugin = ForwardPlugin::from_config(&config, shared()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let query = sample_query(&["example", "org"], 1);
        let mut msg = dns_message(query);
        let result = plugin.process(&mut msg).await.unwrap();

        let resp = result.raw_response.unwrap();
        assert_eq!(resp[3] & 0x0F, 2, "expected SERVFAIL rcode");
        assert_eq!(counter.load(Ordering::SeqCst), 0, "dead backend must never see a query");
    }
}

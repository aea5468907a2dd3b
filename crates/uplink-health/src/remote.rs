//! Remote prober: remote host reachability over a specific egress port.
//!
//! One HTTP request per (interface, target) and tick. Any response counts as
//! a reply, whatever its status code; errors and timeouts count as no reply.
//! The HTTP client is injected through [`HttpProbe`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::StatusCode;
use http::header::{HOST, USER_AGENT};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;
use tokio_rustls::TlsConnector;
use tracing::debug;

use uplink_state::ProbeConfig;

use crate::error::{ProbeError, ProbeResult};
use crate::local::BoxFuture;
use crate::tls::insecure_client_config;
use crate::topology::{Egress, PortSnapshot};

/// Result of one remote probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeRes {
    pub is_remote_reply: bool,
    /// Wall-clock time spent on the attempt.
    pub latency_ms: u64,
}

/// HTTP probe capability.
pub trait HttpProbe: Send + Sync {
    /// Request `url` out of `egress`, giving up after `timeout`.
    fn probe<'a>(&'a self, url: &'a str, egress: &'a Egress, timeout: Duration)
    -> BoxFuture<'a, ProbeRes>;
}

/// Remote probe target for a network instance.
///
/// A user URL is used as is when it carries a scheme and gets `http://`
/// otherwise; a user IP becomes `http://<ip>`; everything else probes the
/// process-wide default.
pub fn resolve_target(config: &ProbeConfig, default_target: &str) -> String {
    if let Some(url) = config.server_url.as_deref().filter(|u| !u.trim().is_empty()) {
        let url = url.trim();
        if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{url}")
        }
    } else if let Some(ip) = config.server_ip.filter(|ip| !ip.is_unspecified()) {
        match ip {
            IpAddr::V4(v4) => format!("http://{v4}"),
            IpAddr::V6(v6) => format!("http://[{v6}]"),
        }
    } else {
        default_target.to_string()
    }
}

/// Per-tick memo of remote results keyed by (interface, target).
#[derive(Debug, Default)]
pub struct RemoteProbeCache {
    results: HashMap<(String, String), ProbeRes>,
}

impl RemoteProbeCache {
    pub fn get(&self, if_name: &str, target: &str) -> Option<ProbeRes> {
        self.results
            .get(&(if_name.to_string(), target.to_string()))
            .copied()
    }

    pub fn insert(&mut self, if_name: &str, target: &str, res: ProbeRes) {
        self.results
            .insert((if_name.to_string(), target.to_string()), res);
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Probes remote hosts through the device's ports.
#[derive(Clone)]
pub struct RemoteProber {
    http: Arc<dyn HttpProbe>,
    timeout: Duration,
}

impl RemoteProber {
    pub fn new(http: Arc<dyn HttpProbe>, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    /// Probe `target` out of `if_name`.
    ///
    /// A port the device does not know yields a neutral result.
    pub async fn probe(&self, if_name: &str, target: &str, ports: &PortSnapshot) -> ProbeRes {
        let Some(egress) = ports.egress(if_name) else {
            debug!(intf = %if_name, "no device port for remote probe");
            return ProbeRes::default();
        };
        let res = self.http.probe(target, &egress, self.timeout).await;
        debug!(
            intf = %if_name,
            %target,
            reply = res.is_remote_reply,
            latency_ms = res.latency_ms,
            "remote probe done"
        );
        res
    }

    /// Like [`probe`](Self::probe), but reuses a result already obtained
    /// this tick for the same interface and target.
    pub async fn probe_cached(
        &self,
        cache: &mut RemoteProbeCache,
        if_name: &str,
        target: &str,
        ports: &PortSnapshot,
    ) -> ProbeRes {
        if let Some(res) = cache.get(if_name, target) {
            debug!(intf = %if_name, %target, "reusing remote probe result");
            return res;
        }
        let res = self.probe(if_name, target, ports).await;
        cache.insert(if_name, target, res);
        res
    }
}

/// Parsed probe URL.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    tls: bool,
    host: String,
    port: u16,
    authority: String,
    path_and_query: String,
}

/// Parse a probe URL. A bare `host[:port]` is requested over https.
fn parse_target(url: &str) -> ProbeResult<Target> {
    let invalid = || ProbeError::InvalidTarget(url.to_string());
    let full = if url.contains("://") {
        url.to_string()
    } else {
        format!("https://{url}")
    };
    let uri: http::Uri = full.parse().map_err(|_| invalid())?;
    let tls = match uri.scheme_str() {
        Some("https") => true,
        Some("http") => false,
        _ => return Err(invalid()),
    };
    let host = uri
        .host()
        .ok_or_else(invalid)?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| host.clone());
    let path_and_query = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());
    Ok(Target {
        tls,
        host,
        port,
        authority,
        path_and_query,
    })
}

/// HTTP probe over hyper, bound to the egress interface.
#[derive(Clone)]
pub struct HyperProbe {
    tls: Arc<ClientConfig>,
    user_agent: String,
}

impl HyperProbe {
    pub fn new() -> Result<Self, rustls::Error> {
        Ok(Self {
            tls: insecure_client_config()?,
            user_agent: concat!("uplink-health/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    async fn exchange(&self, url: &str, egress: &Egress) -> ProbeResult<StatusCode> {
        let target = parse_target(url)?;
        let addr = resolve(&target, egress.local_addr).await?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = egress.local_addr.filter(|l| l.is_ipv4() == addr.is_ipv4()) {
            socket.bind(SocketAddr::new(local, 0))?;
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Err(e) = socket.bind_device(Some(egress.if_name.as_bytes())) {
            debug!(intf = %egress.if_name, error = %e, "bind to device failed, using source address only");
        }
        let stream = socket.connect(addr).await?;

        if target.tls {
            let name = ServerName::try_from(target.host.clone())
                .map_err(|e| ProbeError::Tls(e.to_string()))?;
            let stream = TlsConnector::from(self.tls.clone())
                .connect(name, stream)
                .await
                .map_err(|e| ProbeError::Tls(e.to_string()))?;
            send_request(TokioIo::new(stream), &target, &self.user_agent).await
        } else {
            send_request(TokioIo::new(stream), &target, &self.user_agent).await
        }
    }
}

impl HttpProbe for HyperProbe {
    fn probe<'a>(
        &'a self,
        url: &'a str,
        egress: &'a Egress,
        timeout: Duration,
    ) -> BoxFuture<'a, ProbeRes> {
        Box::pin(async move {
            let start = Instant::now();
            let result = tokio::time::timeout(timeout, self.exchange(url, egress))
                .await
                .unwrap_or(Err(ProbeError::Timeout));
            let latency_ms = start.elapsed().as_millis() as u64;
            match result {
                Ok(status) => {
                    debug!(%url, intf = %egress.if_name, %status, latency_ms, "remote replied");
                    ProbeRes {
                        is_remote_reply: true,
                        latency_ms,
                    }
                }
                Err(e) => {
                    debug!(%url, intf = %egress.if_name, error = %e, "remote probe failed");
                    ProbeRes {
                        is_remote_reply: false,
                        latency_ms,
                    }
                }
            }
        })
    }
}

/// Resolve the target host, preferring the egress address family.
async fn resolve(target: &Target, local: Option<IpAddr>) -> ProbeResult<SocketAddr> {
    if let Ok(ip) = target.host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, target.port));
    }
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|e| ProbeError::Resolve {
            host: target.host.clone(),
            reason: e.to_string(),
        })?
        .collect();
    let want_v4 = local.is_none_or(|l| l.is_ipv4());
    addrs
        .iter()
        .find(|a| a.is_ipv4() == want_v4)
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ProbeError::Resolve {
            host: target.host.clone(),
            reason: "no addresses".to_string(),
        })
}

async fn send_request<T>(
    io: TokioIo<T>,
    target: &Target,
    user_agent: &str,
) -> ProbeResult<StatusCode>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("GET")
        .uri(target.path_and_query.as_str())
        .header(HOST, target.authority.as_str())
        .header(USER_AGENT, user_agent)
        .body(Empty::<Bytes>::new())
        .map_err(|e| ProbeError::InvalidTarget(e.to_string()))?;

    let resp = sender.send_request(req).await?;
    Ok(resp.status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use crate::topology::DevicePort;

    struct CountingProbe {
        reply: bool,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl HttpProbe for CountingProbe {
        fn probe<'a>(
            &'a self,
            url: &'a str,
            egress: &'a Egress,
            _timeout: Duration,
        ) -> BoxFuture<'a, ProbeRes> {
            self.calls
                .lock()
                .unwrap()
                .push((egress.if_name.clone(), url.to_string()));
            let reply = self.reply;
            Box::pin(async move {
                ProbeRes {
                    is_remote_reply: reply,
                    latency_ms: 42,
                }
            })
        }
    }

    fn snapshot() -> PortSnapshot {
        PortSnapshot::new(vec![DevicePort {
            name: "eth0".to_string(),
            if_name: "eth0".to_string(),
            is_mgmt: true,
            free: true,
            gateway: Some("10.0.0.1".parse().unwrap()),
            subnet: Some("10.0.0.0/24".parse().unwrap()),
            addrs: vec!["10.0.0.5".parse().unwrap()],
        }])
    }

    fn loopback() -> Egress {
        Egress {
            if_name: "lo".to_string(),
            local_addr: Some("127.0.0.1".parse().unwrap()),
        }
    }

    #[test]
    fn target_from_user_url() {
        let mut config = ProbeConfig::default();
        config.server_url = Some("https://probe.example.com/check".to_string());
        assert_eq!(resolve_target(&config, "default"), "https://probe.example.com/check");

        config.server_url = Some("probe.example.com".to_string());
        assert_eq!(resolve_target(&config, "default"), "http://probe.example.com");
    }

    #[test]
    fn target_from_user_ip() {
        let mut config = ProbeConfig::default();
        config.server_ip = Some("8.8.8.8".parse().unwrap());
        assert_eq!(resolve_target(&config, "default"), "http://8.8.8.8");

        config.server_ip = Some("2001:db8::1".parse().unwrap());
        assert_eq!(resolve_target(&config, "default"), "http://[2001:db8::1]");

        config.server_ip = Some("0.0.0.0".parse().unwrap());
        assert_eq!(resolve_target(&config, "default"), "default");
    }

    #[test]
    fn url_wins_over_ip() {
        let config = ProbeConfig {
            server_url: Some("http://a.example".to_string()),
            server_ip: Some("8.8.8.8".parse().unwrap()),
            probe_interval: 0,
        };
        assert_eq!(resolve_target(&config, "default"), "http://a.example");
    }

    #[test]
    fn target_falls_back_to_default() {
        assert_eq!(
            resolve_target(&ProbeConfig::default(), "www.google.com"),
            "www.google.com"
        );
    }

    #[test]
    fn parse_bare_host_uses_https() {
        let t = parse_target("www.google.com").unwrap();
        assert!(t.tls);
        assert_eq!(t.host, "www.google.com");
        assert_eq!(t.port, 443);
        assert_eq!(t.path_and_query, "/");
    }

    #[test]
    fn parse_explicit_http_target() {
        let t = parse_target("http://10.1.1.1:8080/ping?x=1").unwrap();
        assert!(!t.tls);
        assert_eq!(t.host, "10.1.1.1");
        assert_eq!(t.port, 8080);
        assert_eq!(t.authority, "10.1.1.1:8080");
        assert_eq!(t.path_and_query, "/ping?x=1");

        let v6 = parse_target("http://[2001:db8::1]").unwrap();
        assert_eq!(v6.host, "2001:db8::1");
        assert_eq!(v6.port, 80);
    }

    #[test]
    fn parse_rejects_unknown_scheme() {
        assert!(matches!(
            parse_target("ftp://example.com"),
            Err(ProbeError::InvalidTarget(_))
        ));
    }

    #[test]
    fn cache_keys_on_interface_and_target() {
        let mut cache = RemoteProbeCache::default();
        let res = ProbeRes {
            is_remote_reply: true,
            latency_ms: 12,
        };
        cache.insert("eth0", "http://a", res);
        assert_eq!(cache.get("eth0", "http://a"), Some(res));
        assert_eq!(cache.get("eth0", "http://b"), None);
        assert_eq!(cache.get("eth1", "http://a"), None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn unknown_port_gives_neutral_result() {
        let http = Arc::new(CountingProbe {
            reply: true,
            calls: Mutex::new(Vec::new()),
        });
        let prober = RemoteProber::new(http.clone(), Duration::from_secs(3));
        let res = prober.probe("wwan0", "http://a", &snapshot()).await;
        assert_eq!(res, ProbeRes::default());
        assert!(http.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cached_probe_runs_once() {
        let http = Arc::new(CountingProbe {
            reply: true,
            calls: Mutex::new(Vec::new()),
        });
        let prober = RemoteProber::new(http.clone(), Duration::from_secs(3));
        let ports = snapshot();
        let mut cache = RemoteProbeCache::default();

        let first = prober.probe_cached(&mut cache, "eth0", "http://a", &ports).await;
        let second = prober.probe_cached(&mut cache, "eth0", "http://a", &ports).await;
        assert_eq!(first, second);
        assert_eq!(http.calls.lock().unwrap().len(), 1);

        prober.probe_cached(&mut cache, "eth0", "http://b", &ports).await;
        assert_eq!(http.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn any_status_counts_as_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let _ = sock
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n")
                .await;
        });

        let probe = HyperProbe::new().unwrap();
        let url = format!("http://{addr}/");
        let res = probe.probe(&url, &loopback(), Duration::from_secs(3)).await;
        assert!(res.is_remote_reply);
    }

    #[tokio::test]
    async fn closed_port_is_no_reply() {
        // Grab a free port, then close it.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let probe = HyperProbe::new().unwrap();
        let url = format!("http://{addr}/");
        let res = probe.probe(&url, &loopback(), Duration::from_secs(1)).await;
        assert!(!res.is_remote_reply);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let probe = HyperProbe::new().unwrap();
        let url = format!("http://{addr}/");
        let res = probe.probe(&url, &loopback(), Duration::from_millis(200)).await;
        assert!(!res.is_remote_reply);
        assert!(res.latency_ms >= 150);
    }
}

//! Local prober: next-hop reachability out of one port.
//!
//! A single echo from the port's local address to its next-hop, bounded by
//! a short timeout. The raw ping primitive is injected through [`Pinger`]
//! so the scheduler can be exercised without touching the network.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use uplink_state::ProbeInfo;

/// Boxed future returned by the capability traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw echo capability.
pub trait Pinger: Send + Sync {
    /// Send one echo from `src` to `dst` and report whether `dst` replied
    /// within `timeout`.
    fn ping(&self, src: IpAddr, dst: IpAddr, timeout: Duration) -> BoxFuture<'_, bool>;
}

/// Outcome of one local probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalProbe {
    pub reachable: bool,
    /// The port lost its local address while a verdict was still up; both
    /// verdicts must be driven down.
    pub force_down: bool,
}

/// Probes the next-hop of a port.
#[derive(Clone)]
pub struct LocalProber {
    pinger: Arc<dyn Pinger>,
    timeout: Duration,
}

impl LocalProber {
    pub fn new(pinger: Arc<dyn Pinger>, timeout: Duration) -> Self {
        Self { pinger, timeout }
    }

    /// Probe the next-hop of `info`.
    pub async fn probe(&self, info: &ProbeInfo) -> LocalProbe {
        let Some(src) = info.local_addr.filter(|a| !a.is_unspecified()) else {
            let force_down = info.gateway_up || info.remote_host_up;
            return LocalProbe {
                reachable: false,
                force_down,
            };
        };
        let Some(dst) = info.nh_addr.filter(|a| !a.is_unspecified()) else {
            return LocalProbe::default();
        };

        debug!(intf = %info.if_name, %src, %dst, timeout = ?self.timeout, "pinging next-hop");
        let reachable = self.pinger.ping(src, dst, self.timeout).await;
        if reachable {
            debug!(intf = %info.if_name, %dst, "next-hop replied");
        }
        LocalProbe {
            reachable,
            force_down: false,
        }
    }
}

/// Pinger backed by the system `ping` binary.
///
/// The child is killed when the timeout elapses, so a probe never outlives
/// its budget.
#[derive(Debug, Clone)]
pub struct SystemPinger {
    program: String,
}

impl SystemPinger {
    pub fn new() -> Self {
        Self {
            program: "ping".to_string(),
        }
    }

    /// Use a specific ping executable.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, src: IpAddr, dst: IpAddr, timeout: Duration) -> bool {
        let wait_secs = timeout.as_secs().max(1).to_string();
        let mut cmd = Command::new(&self.program);
        if dst.is_ipv6() {
            cmd.arg("-6");
        }
        cmd.args(["-n", "-q", "-c", "1", "-W", &wait_secs, "-I"])
            .arg(src.to_string())
            .arg(dst.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(%dst, error = %e, "ping failed to run");
                false
            }
            Err(_) => {
                debug!(%dst, "ping timed out");
                false
            }
        }
    }
}

impl Default for SystemPinger {
    fn default() -> Self {
        Self::new()
    }
}

impl Pinger for SystemPinger {
    fn ping(&self, src: IpAddr, dst: IpAddr, timeout: Duration) -> BoxFuture<'_, bool> {
        Box::pin(self.run(src, dst, timeout))
    }
}

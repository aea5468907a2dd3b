//! uplink-health: uplink health probing and failover for network instances.
//!
//! Every network instance has one or more candidate uplink ports. The probe
//! engine pings each port's next-hop, periodically checks a remote host
//! through each port, smooths the outcomes into UP/DOWN verdicts and keeps
//! the best port selected as the instance's uplink.
//!
//! # Architecture
//!
//! ```text
//! ProbeScheduler (single task)
//!   ├── TopologyEvent ──► TopologySync (create / refresh ProbeInfo, re-arm)
//!   ├── every tick
//!   │   ├── LocalProber  ── Pinger      (free ports, shared per interface)
//!   │   ├── RemoteProber ── HttpProbe   (every Nth tick, shared per interface+target)
//!   │   ├── apply_probe_result()        (hysteresis)
//!   │   ├── select_uplink()             (free tier first, stable on ties)
//!   │   └── publish to StatusStore
//!   └── UplinkSignal on a watch channel (one per tick at most)
//! ```
//!
//! # Hysteresis
//!
//! A verdict flips down after more than 4 consecutive failures and up after
//! more than 3 consecutive successes. After a long outage the first success
//! restores the gateway verdict at once, and a gateway that starts failing
//! after a long healthy period drags the remote verdict down with it.

pub mod error;
pub mod hysteresis;
pub mod local;
pub mod remote;
pub mod scheduler;
pub mod selector;
pub mod settings;
pub mod sync;
pub mod tls;
pub mod topology;

pub use error::{ProbeError, ProbeResult};
pub use hysteresis::{ProbeKind, apply_probe_result};
pub use local::{BoxFuture, LocalProbe, LocalProber, Pinger, SystemPinger};
pub use remote::{HttpProbe, HyperProbe, ProbeRes, RemoteProbeCache, RemoteProber, resolve_target};
pub use scheduler::{ProbeScheduler, TickReport, TopologyEvent, UplinkSignal};
pub use selector::select_uplink;
pub use settings::{ProbeSettings, Thresholds};
pub use sync::{SyncOutcome, TopologySync};
pub use topology::{DevicePort, Egress, PortSnapshot, Subnet};

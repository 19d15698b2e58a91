mod file;

pub use file::MissingLladdrPolicy;

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

/// Parses a TOML config file into a materialized [`ServerConfig`].
pub fn from_file(path: &str) -> io::Result<ServerConfig> {
    let spec = file::ServerConfigSpec::from_file(path)?;
    Ok(ServerConfig::from_spec(spec))
}

#[derive(Debug)]
pub struct ServerConfig {
    pub router_id: IpAddr,
    pub default_as: u32,
    pub poll_interval: u16,
    pub peers: Vec<Arc<PeerConfig>>,
}

/// Resolved, immutable-while-running peer configuration (spec §3). Wrapped
/// in `Arc` by [`ServerConfig::from_spec`] so connections and timers can
/// share it cheaply without cloning.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub local_as: u32,
    pub remote_as: u32,
    pub remote_ip: IpAddr,
    pub interface: Option<String>,
    pub source_addr: Option<IpAddr>,
    pub local_router_id: IpAddr,

    pub enabled: bool,
    pub passive: bool,

    pub hold_time: u16,
    pub initial_hold_time: u16,
    pub connect_retry_time: u16,
    pub keepalive_time: u16,
    pub dest_port: u16,

    pub multihop_via: Option<IpAddr>,
    pub multihop_ttl: u8,

    pub capabilities: bool,
    pub enable_as4: bool,
    pub enable_refresh: bool,
    pub route_refresh: bool,
    pub rr_client: bool,
    pub rs_client: bool,
    pub rr_cluster_id: Option<IpAddr>,

    pub password: Option<String>,
    pub route_limit: Option<usize>,

    pub start_delay_time: u16,
    pub error_amnesia_time: u16,
    pub error_delay_time_min: u16,
    pub error_delay_time_max: u16,
    pub disable_after_error: bool,

    pub missing_lladdr: MissingLladdrPolicy,
}

impl PeerConfig {
    pub fn is_ebgp(&self) -> bool {
        self.remote_as != self.local_as
    }

    /// Equality the way spec §6's `reconfigure` needs it: every field
    /// except the password must match exactly, and passwords compare as
    /// plain strings (testable property 8).
    pub fn unchanged_except_password(&self, other: &PeerConfig) -> bool {
        self.local_as == other.local_as
            && self.remote_as == other.remote_as
            && self.remote_ip == other.remote_ip
            && self.interface == other.interface
            && self.source_addr == other.source_addr
            && self.local_router_id == other.local_router_id
            && self.enabled == other.enabled
            && self.passive == other.passive
            && self.hold_time == other.hold_time
            && self.initial_hold_time == other.initial_hold_time
            && self.connect_retry_time == other.connect_retry_time
            && self.keepalive_time == other.keepalive_time
            && self.dest_port == other.dest_port
            && self.multihop_via == other.multihop_via
            && self.multihop_ttl == other.multihop_ttl
            && self.capabilities == other.capabilities
            && self.enable_as4 == other.enable_as4
            && self.enable_refresh == other.enable_refresh
            && self.route_refresh == other.route_refresh
            && self.rr_client == other.rr_client
            && self.rs_client == other.rs_client
            && self.rr_cluster_id == other.rr_cluster_id
            && self.route_limit == other.route_limit
            && self.start_delay_time == other.start_delay_time
            && self.error_amnesia_time == other.error_amnesia_time
            && self.error_delay_time_min == other.error_delay_time_min
            && self.error_delay_time_max == other.error_delay_time_max
            && self.disable_after_error == other.disable_after_error
            && self.missing_lladdr == other.missing_lladdr
            && self.password == other.password
    }
}

impl ServerConfig {
    fn from_spec(spec: file::ServerConfigSpec) -> Self {
        let peers = spec
            .peers
            .iter()
            .map(|p| {
                Arc::new(PeerConfig {
                    local_as: p.local_as.unwrap_or(spec.default_as),
                    remote_as: p.remote_as,
                    remote_ip: p.remote_ip,
                    interface: p.interface.clone(),
                    source_addr: p.source_addr,
                    local_router_id: p.local_router_id.unwrap_or(spec.router_id),
                    enabled: p.enabled,
                    passive: p.passive,
                    hold_time: p.hold_time,
                    initial_hold_time: p.initial_hold_time,
                    connect_retry_time: p.connect_retry_time,
                    keepalive_time: p.keepalive_time.unwrap_or(p.hold_time / 3),
                    dest_port: p.dest_port,
                    multihop_via: p.multihop_via,
                    multihop_ttl: p.multihop_ttl,
                    capabilities: p.capabilities,
                    enable_as4: p.enable_as4,
                    enable_refresh: p.enable_refresh,
                    route_refresh: p.route_refresh,
                    rr_client: p.rr_client,
                    rs_client: p.rs_client,
                    rr_cluster_id: p.rr_cluster_id,
                    password: p.password.clone(),
                    route_limit: p.route_limit,
                    start_delay_time: p.start_delay_time,
                    error_amnesia_time: p.error_amnesia_time,
                    error_delay_time_min: p.error_delay_time_min,
                    error_delay_time_max: p.error_delay_time_max,
                    disable_after_error: p.disable_after_error,
                    missing_lladdr: p.missing_lladdr,
                })
            })
            .collect();

        Self {
            router_id: spec.router_id,
            default_as: spec.default_as,
            poll_interval: spec.poll_interval,
            peers,
        }
    }
}

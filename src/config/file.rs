use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::net::IpAddr;

use serde::{self, Deserialize, Deserializer, Serialize, Serializer};

struct Defaults;

impl Defaults {
    fn enabled() -> bool {
        true
    }
    fn passive() -> bool {
        false
    }
    fn hold_time() -> u16 {
        240
    }
    fn initial_hold_time() -> u16 {
        240
    }
    fn connect_retry_time() -> u16 {
        120
    }
    fn dest_port() -> u16 {
        179
    }
    fn capabilities() -> bool {
        true
    }
    fn enable_as4() -> bool {
        true
    }
    fn enable_refresh() -> bool {
        true
    }
    fn route_refresh() -> bool {
        true
    }
    fn start_delay_time() -> u16 {
        5
    }
    fn error_amnesia_time() -> u16 {
        300
    }
    fn error_delay_time_min() -> u16 {
        60
    }
    fn error_delay_time_max() -> u16 {
        300
    }
    fn disable_after_error() -> bool {
        false
    }
    fn missing_lladdr() -> MissingLladdrPolicy {
        MissingLladdrPolicy::Ignore
    }
    fn multihop_ttl() -> u8 {
        1
    }
    fn poll_interval() -> u16 {
        30
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingLladdrPolicy {
    SelfAddress,
    Drop,
    Ignore,
}

impl fmt::Display for MissingLladdrPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let word = match self {
            MissingLladdrPolicy::SelfAddress => "self",
            MissingLladdrPolicy::Drop => "drop",
            MissingLladdrPolicy::Ignore => "ignore",
        };
        write!(f, "{}", word)
    }
}

impl Serialize for MissingLladdrPolicy {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MissingLladdrPolicy {
    fn deserialize<D>(deserializer: D) -> Result<MissingLladdrPolicy, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "self" => Ok(MissingLladdrPolicy::SelfAddress),
            "drop" => Ok(MissingLladdrPolicy::Drop),
            "ignore" => Ok(MissingLladdrPolicy::Ignore),
            _ => Err(serde::de::Error::custom(format!(
                "unsupported missing_lladdr policy: '{}'",
                s
            ))),
        }
    }
}

/// TOML representation of a peer block. Materialized into [`super::PeerConfig`]
/// once server-level defaults (router id, local AS) are known.
#[derive(Clone, Debug, Deserialize)]
pub(super) struct PeerConfigSpec {
    pub(super) remote_ip: IpAddr,
    pub(super) remote_as: u32,
    pub(super) local_as: Option<u32>,
    pub(super) local_router_id: Option<IpAddr>,
    pub(super) interface: Option<String>,
    pub(super) source_addr: Option<IpAddr>,

    #[serde(default = "Defaults::enabled")]
    pub(super) enabled: bool,
    #[serde(default = "Defaults::passive")]
    pub(super) passive: bool,

    #[serde(default = "Defaults::hold_time")]
    pub(super) hold_time: u16,
    #[serde(default = "Defaults::initial_hold_time")]
    pub(super) initial_hold_time: u16,
    #[serde(default = "Defaults::connect_retry_time")]
    pub(super) connect_retry_time: u16,
    /// Defaults to hold_time / 3 when unset; resolved in `from_spec`.
    pub(super) keepalive_time: Option<u16>,

    #[serde(default = "Defaults::dest_port")]
    pub(super) dest_port: u16,

    #[serde(default)]
    pub(super) multihop_via: Option<IpAddr>,
    #[serde(default = "Defaults::multihop_ttl")]
    pub(super) multihop_ttl: u8,

    #[serde(default = "Defaults::capabilities")]
    pub(super) capabilities: bool,
    #[serde(default = "Defaults::enable_as4")]
    pub(super) enable_as4: bool,
    #[serde(default = "Defaults::enable_refresh")]
    pub(super) enable_refresh: bool,
    #[serde(default = "Defaults::route_refresh")]
    pub(super) route_refresh: bool,
    #[serde(default)]
    pub(super) rr_client: bool,
    #[serde(default)]
    pub(super) rs_client: bool,
    pub(super) rr_cluster_id: Option<IpAddr>,

    pub(super) password: Option<String>,
    pub(super) route_limit: Option<usize>,

    #[serde(default = "Defaults::start_delay_time")]
    pub(super) start_delay_time: u16,
    #[serde(default = "Defaults::error_amnesia_time")]
    pub(super) error_amnesia_time: u16,
    #[serde(default = "Defaults::error_delay_time_min")]
    pub(super) error_delay_time_min: u16,
    #[serde(default = "Defaults::error_delay_time_max")]
    pub(super) error_delay_time_max: u16,
    #[serde(default = "Defaults::disable_after_error")]
    pub(super) disable_after_error: bool,

    #[serde(default = "Defaults::missing_lladdr")]
    pub(super) missing_lladdr: MissingLladdrPolicy,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerConfigSpec {
    pub(super) router_id: IpAddr,
    pub(super) default_as: u32,
    #[serde(default = "Defaults::poll_interval")]
    pub(super) poll_interval: u16,
    #[serde(default = "Vec::new")]
    pub(super) peers: Vec<PeerConfigSpec>,
}

impl ServerConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        toml::from_str(&contents).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

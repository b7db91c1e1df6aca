use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::display::Region;

/// Lower transport requested from the RTSP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransportMode {
    Udp,
    UdpMulticast,
    Tcp,
    /// RTSP and RTP tunnelled over HTTP.
    Http,
}

impl TransportMode {
    /// Value for the source's `protocols` flags property.
    pub fn protocols(&self) -> &'static str {
        match self {
            TransportMode::Udp => "udp",
            TransportMode::UdpMulticast => "udp-mcast",
            TransportMode::Tcp => "tcp",
            TransportMode::Http => "tcp+http",
        }
    }

    /// Transport implied by the URI scheme, if the scheme pins one.
    pub fn from_uri(uri: &str) -> Option<Self> {
        let scheme = uri.split_once("://")?.0.to_ascii_lowercase();
        match scheme.as_str() {
            "rtspt" => Some(TransportMode::Tcp),
            "rtsph" => Some(TransportMode::Http),
            "rtspu" => Some(TransportMode::Udp),
            _ => None,
        }
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(TransportMode::Udp),
            "udp-mcast" | "multicast" => Ok(TransportMode::UdpMulticast),
            "tcp" => Ok(TransportMode::Tcp),
            "http" => Ok(TransportMode::Http),
            other => Err(format!(
                "Unknown transport mode '{}' (expected udp, udp-mcast, tcp or http)",
                other
            )),
        }
    }
}

impl TryFrom<String> for TransportMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransportMode> for String {
    fn from(mode: TransportMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportMode::Udp => "udp",
            TransportMode::UdpMulticast => "udp-mcast",
            TransportMode::Tcp => "tcp",
            TransportMode::Http => "http",
        };
        f.write_str(name)
    }
}

/// Everything needed to open the source connection of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceOptions {
    pub location: String,
    pub user_id: Option<String>,
    pub user_pw: Option<String>,
    pub latency_ms: u32,
    pub transport: TransportMode,
    pub timeout: Duration,
    pub drop_on_latency: bool,
}

/// Where a stream is drawn on the display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Cell(usize),
    Rect,
}

/// Immutable description of one configured stream, resolved from the
/// configuration once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    /// Position in the configuration file.
    pub index: usize,
    pub name: String,
    pub source: SourceOptions,
    pub placement: Placement,
    pub region: Region,
    pub enabled: bool,
}

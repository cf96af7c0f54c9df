use std::{env, fmt, net::IpAddr, ops::RangeInclusive, str::FromStr};

use crate::error::{ConfigErrorKind, Error};

/// Inclusive range of UDP ports, written as `min-max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> Result<Self, Error> {
        if min == 0 || min > max {
            return Err(Error::new_config(
                format!("{}-{}", min, max),
                ConfigErrorKind::InvalidPortRangeError,
            ));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, port: u16) -> bool {
        self.min <= port && port <= self.max
    }

    pub fn len(&self) -> usize {
        (self.max - self.min) as usize + 1
    }

    pub fn iter(&self) -> RangeInclusive<u16> {
        self.min..=self.max
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            Error::new_config(
                format!("expected <min>-<max>, got {}", s),
                ConfigErrorKind::InvalidPortRangeError,
            )
        };
        let (min, max) = s.trim().split_once('-').ok_or_else(invalid)?;
        let min = min.trim().parse::<u16>().map_err(|_| invalid())?;
        let max = max.trim().parse::<u16>().map_err(|_| invalid())?;
        Self::new(min, max)
    }
}

/// Options for [`crate::transport::WebRTCApi`].
#[derive(Debug, Clone)]
pub struct WebRTCTransportConfig {
    /// Port range used for ICE UDP candidates.
    pub port_range: PortRange,
    /// Public IP announced as a host candidate.
    pub public_ip: Option<IpAddr>,
    /// STUN/TURN urls.
    pub ice_servers: Vec<String>,
}

impl Default for WebRTCTransportConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange {
                min: 20000,
                max: 20500,
            },
            public_ip: None,
            ice_servers: vec![],
        }
    }
}

/// Runtime options of the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address for the signaling listener and RTP sockets.
    pub address: IpAddr,
    pub signaling_port: u16,
    /// Ports handed out when a stream is created without an explicit port.
    pub rtp_port_range: PortRange,
    /// Stream created on startup.
    pub initial_rtp_port: Option<u16>,
    pub hub_capacity: usize,
    pub client_queue_capacity: usize,
    pub webrtc: WebRTCTransportConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::from([127, 0, 0, 1]),
            signaling_port: 8080,
            rtp_port_range: PortRange {
                min: 5000,
                max: 5999,
            },
            initial_rtp_port: None,
            hub_capacity: 64,
            client_queue_capacity: 256,
            webrtc: WebRTCTransportConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty() && v != "none")
        };

        if let Some(addr) = get("RELAY_ADDR") {
            config.address = parse_address(&addr)?;
        }
        if let Some(port) = get("WS_PORT") {
            config.signaling_port = parse_port(&port)?;
        }
        if let Some(port) = get("RTP_PORT") {
            config.initial_rtp_port = Some(parse_port(&port)?);
        }
        if let Some(range) = get("RTP_PORTS") {
            config.rtp_port_range = range.parse()?;
        }
        if let Some(range) = get("ICE_PORTS") {
            config.webrtc.port_range = range.parse()?;
        }
        if let Some(ip) = get("PUBLIC_IP") {
            config.webrtc.public_ip = Some(parse_address(&ip)?);
        }
        if let Some(servers) = get("ICE_SERVERS") {
            config.webrtc.ice_servers = servers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        Ok(config)
    }
}

fn parse_address(value: &str) -> Result<IpAddr, Error> {
    if value == "localhost" {
        return Ok(IpAddr::from([127, 0, 0, 1]));
    }
    value
        .parse::<IpAddr>()
        .map_err(|e| Error::new_config(format!("{}: {}", value, e), ConfigErrorKind::InvalidAddressError))
}

fn parse_port(value: &str) -> Result<u16, Error> {
    match value.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::new_config(
            value.to_string(),
            ConfigErrorKind::InvalidPortError,
        )),
    }
}

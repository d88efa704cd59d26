// Configuration for the membership protocol
//
// Defaults are tuned for a local-network cluster; the probe timings follow
// the usual SWIM guidance of a sub-second protocol period with a timeout of
// a fraction of that period.

use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Membership configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Unique name of the local node. Must be non-empty and stable for the
    /// lifetime of the process.
    pub name: String,

    /// Address to bind the UDP socket and TCP listener to. Port 0 picks an
    /// OS-assigned port, shared between both sockets.
    pub bind_addr: SocketAddr,

    /// Address advertised to peers. Required when binding to an
    /// unspecified address; defaults to the bound address otherwise.
    pub advertise_addr: Option<SocketAddr>,

    /// Opaque metadata attached to the local node
    pub meta: Vec<u8>,

    /// Interval between probe rounds
    pub probe_interval: Duration,

    /// How long to wait for a direct ack before falling back to indirect
    /// probes. Should be a fraction of `probe_interval`.
    pub probe_timeout: Duration,

    /// Number of peers asked to probe an unresponsive node indirectly
    pub indirect_probes: usize,

    /// Multiplier applied to the log-scaled suspicion timeout
    pub suspicion_mult: u32,

    /// Interval between anti-entropy push/pull exchanges. Zero disables
    /// the periodic exchange (joins still use it).
    pub push_pull_interval: Duration,

    /// Multiplier for the per-broadcast retransmit limit
    pub retransmit_mult: u32,

    /// Number of peers gossiped to per probe round
    pub gossip_fanout: usize,

    /// Grace period before a dead member is removed from the table
    pub reap_interval: Duration,

    /// Timeout for dialing push/pull streams
    pub dial_timeout: Duration,

    /// Capacity of each subscriber event channel
    pub event_buffer: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            bind_addr: "0.0.0.0:7946".parse().unwrap(),
            advertise_addr: None,
            meta: Vec::new(),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_probes: 3,
            suspicion_mult: 4,
            push_pull_interval: Duration::from_secs(30),
            retransmit_mult: 4,
            gossip_fanout: 3,
            reap_interval: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            event_buffer: 256,
        }
    }
}

impl MeshConfig {
    /// Configuration for a node reachable only on the loopback interface,
    /// with an OS-assigned port. Useful for tests and single-host setups.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        }
    }

    /// Validate the configuration, surfacing misconfiguration before any
    /// sockets are opened.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MeshError::Config("node name must not be empty".to_string()));
        }
        if self.probe_interval.is_zero() {
            return Err(MeshError::Config("probe interval must be non-zero".to_string()));
        }
        if self.probe_timeout.is_zero() || self.probe_timeout >= self.probe_interval {
            return Err(MeshError::Config(
                "probe timeout must be non-zero and shorter than the probe interval".to_string(),
            ));
        }
        if self.suspicion_mult == 0 {
            return Err(MeshError::Config("suspicion multiplier must be at least 1".to_string()));
        }
        if self.retransmit_mult == 0 {
            return Err(MeshError::Config("retransmit multiplier must be at least 1".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(MeshError::Config("event buffer must hold at least one event".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_with_name_is_valid() {
        let mut config = MeshConfig::default();
        assert!(config.validate().is_err());

        config.name = "node1".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_probe_timeout_at_or_above_interval() {
        let mut config = MeshConfig::local("node1");
        config.probe_timeout = config.probe_interval;
        assert!(config.validate().is_err());
    }

    #[test]
    fn local_config_binds_loopback() {
        let config = MeshConfig::local("node1");
        assert!(config.bind_addr.ip().is_loopback());
        assert_eq!(config.bind_addr.port(), 0);
    }
}

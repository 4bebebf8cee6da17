//! Node configuration
//!
//! Every tunable of a node lives here with a usable default. The builder
//! methods mirror the options an embedding application usually sets; the
//! binary maps its command-line flags onto them.

use crate::error::{Error, Result};
use shared::{DEFAULT_MAX_PACKET_SIZE, WIDE_HEADER_LEN};
use std::time::Duration;

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique within a cluster generation. Defaults to the process id.
    pub node_id: u64,
    pub is_master: bool,
    /// Address of the master's service listener (service nodes only).
    pub master_addr: Option<String>,
    /// Listener for inter-node links.
    pub service_addr: String,
    /// Listener for client connections, present on client-facing nodes.
    pub client_addr: Option<String>,
    /// Fixed delay between attempts to register with the master.
    pub retry_interval: Duration,
    /// Deadline for a forwarded call, connection setup included.
    pub call_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub max_packet_size: usize,
    pub debug: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: u64::from(std::process::id()),
            is_master: false,
            master_addr: None,
            service_addr: String::new(),
            client_addr: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            debug: false,
        }
    }
}

impl NodeConfig {
    pub fn new(service_addr: impl Into<String>) -> Self {
        Self {
            service_addr: service_addr.into(),
            ..Self::default()
        }
    }

    pub fn master(mut self) -> Self {
        self.is_master = true;
        self
    }

    pub fn with_master_addr(mut self, addr: impl Into<String>) -> Self {
        self.master_addr = Some(addr.into());
        self
    }

    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = Some(addr.into());
        self
    }

    pub fn with_node_id(mut self, node_id: u64) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// A non-master node without a master address runs standalone and
    /// serves clients on its service address.
    pub fn is_singleton(&self) -> bool {
        !self.is_master && self.master_addr.is_none()
    }

    /// Address clients connect to, if this node accepts clients at all.
    pub fn effective_client_addr(&self) -> Option<&str> {
        match &self.client_addr {
            Some(addr) => Some(addr.as_str()),
            None if self.is_singleton() => Some(self.service_addr.as_str()),
            None => None,
        }
    }

    /// Checks the configuration and fills defaults for unset intervals.
    pub fn validate(&mut self) -> Result<()> {
        if self.service_addr.trim().is_empty() {
            return Err(Error::Config("service address cannot be empty".into()));
        }
        if self.is_master && self.master_addr.is_some() {
            return Err(Error::Config(
                "a master node cannot register with another master".into(),
            ));
        }
        if let Some(addr) = &self.master_addr {
            if addr.trim().is_empty() {
                return Err(Error::Config("master address cannot be empty".into()));
            }
        }
        if self.call_timeout.is_zero() {
            return Err(Error::Config("call timeout must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(Error::Config(
                "heartbeat timeout must exceed a positive heartbeat interval".into(),
            ));
        }
        if self.max_packet_size < WIDE_HEADER_LEN {
            return Err(Error::Config(format!(
                "max packet size must be at least {WIDE_HEADER_LEN} bytes"
            )));
        }
        if self.retry_interval.is_zero() {
            self.retry_interval = DEFAULT_RETRY_INTERVAL;
        }
        Ok(())
    }
}

use std::time::Duration;

/// Timeouts and retry policy of a [`crate::GattConnectionManager`] and its connections.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerConfig {
    /// Deadline of attribute reads/writes, MTU and RSSI requests.
    pub operation_timeout: Duration,
    /// Deadline of service discovery, which takes much longer on large attribute tables.
    pub discovery_timeout: Duration,
    /// Deadline of the disconnect request issued by `close()`.
    pub disconnect_timeout: Duration,
    /// Duration of the low-latency scan tried first by `auto_connect`.
    pub high_power_scan_window: Duration,
    /// Deadline of the low-power fallback scan. `None` scans until a device is found.
    pub low_power_scan_timeout: Option<Duration>,
    /// How many times `auto_connect` repeats the scan-and-connect sequence after a
    /// failed connection.
    pub connect_retries: usize,
    /// Interval between connection priority requests while the stack rejects them.
    pub priority_poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(5),
            high_power_scan_window: Duration::from_secs(10),
            low_power_scan_timeout: None,
            connect_retries: 3,
            priority_poll_interval: Duration::from_millis(50),
        }
    }
}

impl ManagerConfig {
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn disconnect_timeout(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self
    }

    pub fn high_power_scan_window(mut self, window: Duration) -> Self {
        self.high_power_scan_window = window;
        self
    }

    pub fn low_power_scan_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.low_power_scan_timeout = timeout;
        self
    }

    pub fn connect_retries(mut self, retries: usize) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn priority_poll_interval(mut self, interval: Duration) -> Self {
        self.priority_poll_interval = interval;
        self
    }
}

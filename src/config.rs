use std::time::Duration;

/// Tunables for the relay, bound to CLI flags in `args.rs`.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: String,
    pub min_increment: f64,
    pub queue_capacity: usize,
    pub max_frame_size: usize,
    pub read_idle: Duration,
    pub write_deadline: Duration,
    pub reaper_interval: Duration,
}

impl RelayConfig {
    /// The ping ticker fires at 90% of the read-idle deadline, matching
    /// the Go original's `pingPeriod = pongWait * 9 / 10`.
    pub fn ping_interval(&self) -> Duration {
        self.read_idle.mul_f64(0.9)
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            min_increment: 1.0,
            queue_capacity: 256,
            max_frame_size: 1024,
            read_idle: Duration::from_secs(60),
            write_deadline: Duration::from_secs(10),
            reaper_interval: Duration::from_secs(60),
        }
    }
}

/// Threshold after which a stuck outbound queue is treated as a slow
/// consumer and the client is evicted. Not exposed as a CLI flag.
pub const QUEUE_STUCK_TIMEOUT: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_interval_is_ninety_percent_of_read_idle() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.ping_interval(), Duration::from_secs(54));
    }
}

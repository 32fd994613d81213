use crate::commitlog::DEFAULT_STORAGE_TIMEOUT;
use std::convert::TryFrom;
use tokio::time::Duration;

/// Protocol tunables. Anything left `None` gets a default.
#[derive(Clone, Debug, Default)]
pub struct RaftOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    /// Bound on every RPC to a peer.
    pub rpc_timeout: Option<Duration>,
    pub max_entries_per_append: Option<usize>,
    /// Bound on every log or metadata file operation. One that runs over fails like an IO error.
    pub storage_timeout: Option<Duration>,
}

#[derive(Debug)]
pub(super) struct RaftOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub rpc_timeout: Duration,
    pub max_entries_per_append: usize,
    pub storage_timeout: Duration,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.rpc_timeout >= self.follower_min_timeout {
            return Err("RPC timeout must be less than the follower's minimum timeout");
        }
        if self.max_entries_per_append == 0 {
            return Err("Max entries per AppendEntries must be at least 1");
        }
        if self.storage_timeout == Duration::from_millis(0) {
            return Err("Storage timeout must be greater than zero");
        }

        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            rpc_timeout: options.rpc_timeout.unwrap_or(Duration::from_millis(300)),
            max_entries_per_append: options.max_entries_per_append.unwrap_or(64),
            storage_timeout: options.storage_timeout.unwrap_or(DEFAULT_STORAGE_TIMEOUT),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert_eq!(validated.max_entries_per_append, 64);
        assert_eq!(validated.rpc_timeout, Duration::from_millis(300));
        assert_eq!(validated.storage_timeout, DEFAULT_STORAGE_TIMEOUT);
    }

    #[test]
    fn rejects_inconsistent_timeouts() {
        let heartbeat_too_slow = RaftOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(600)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(heartbeat_too_slow).is_err());

        let inverted_range = RaftOptions {
            follower_min_timeout: Some(Duration::from_millis(900)),
            follower_max_timeout: Some(Duration::from_millis(800)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(inverted_range).is_err());

        let slow_rpc = RaftOptions {
            rpc_timeout: Some(Duration::from_millis(500)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(slow_rpc).is_err());

        let no_batch = RaftOptions {
            max_entries_per_append: Some(0),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(no_batch).is_err());

        let no_storage_time = RaftOptions {
            storage_timeout: Some(Duration::from_millis(0)),
            ..RaftOptions::default()
        };
        assert!(RaftOptionsValidated::try_from(no_storage_time).is_err());
    }
}

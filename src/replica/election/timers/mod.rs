//! Background timer tasks. Each timer only ever enqueues an event on the driver's queue; the driver
//! decides what the event means.

mod clock;
mod election_timer;
mod heartbeat_timer;
mod signal;

#[cfg(test)]
mod test_utils;

pub(super) use election_timer::ElectionTimerHandle;
pub(super) use heartbeat_timer::HeartbeatTimerHandle;

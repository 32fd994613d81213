use crate::actor::WeakActorClient;
use crate::replica::election::timers::clock::{Clock, TokioClock};
use crate::replica::election::timers::signal::Mailbox;
use crate::replica::{HeartbeatTick, NodeId, Term};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// Per-peer leader timer. Enqueues a `HeartbeatTick` whenever `heartbeat_duration` passes without
/// the leader having sent anything to that peer.
pub(crate) struct HeartbeatTimerHandle<C: Clock = TokioClock> {
    shared: Arc<Shared<C>>,
}

struct Shared<C: Clock> {
    heartbeat_duration: Duration,
    next_heartbeat: Mailbox<Instant>,
    clock: C,
}

struct HeartbeatTimerTask<C: Clock> {
    shared: Weak<Shared<C>>,
    next_heartbeat: Mailbox<Instant>,
    actor_client: WeakActorClient,
    tick: HeartbeatTick,
    clock: C,
}

impl HeartbeatTimerHandle {
    pub(crate) fn spawn_timer_task(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: NodeId,
        term: Term,
    ) -> Self {
        let (task, handle) = HeartbeatTimerTask::new(heartbeat_duration, actor_client, peer_id, term, TokioClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> HeartbeatTimerHandle<C> {
    /// Pushes the next heartbeat out by a full period, because we just sent this peer something.
    pub(crate) fn reset_heartbeat_timer(&self) {
        self.shared.schedule_next();
    }
}

impl<C: Clock> Shared<C> {
    fn schedule_next(&self) {
        self.next_heartbeat.post(self.clock.now() + self.heartbeat_duration);
    }
}

impl<C: Clock> HeartbeatTimerTask<C> {
    fn new(
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        peer_id: NodeId,
        term: Term,
        clock: C,
    ) -> (Self, HeartbeatTimerHandle<C>) {
        let next_heartbeat = Mailbox::new();
        let shared = Arc::new(Shared {
            heartbeat_duration,
            next_heartbeat: next_heartbeat.clone(),
            clock: clock.clone(),
        });

        let task = HeartbeatTimerTask {
            shared: Arc::downgrade(&shared),
            next_heartbeat,
            actor_client,
            tick: HeartbeatTick { peer_id, term },
            clock,
        };

        (task, HeartbeatTimerHandle { shared })
    }

    async fn run(mut self) {
        // The mailbox starts empty, so the first tick goes out right away and a new leader
        // announces itself without waiting a whole period.
        loop {
            match self.next_heartbeat.take() {
                Some(wake_time) => self.clock.sleep_until(wake_time).await,
                None => match self.shared.upgrade() {
                    Some(shared) => {
                        let _ = self.actor_client.heartbeat_tick(self.tick.clone()).await;
                        shared.schedule_next();
                    }
                    // Handle dropped: no longer leader for this term.
                    None => return,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::ActorClient;
    use crate::replica::election::timers::clock::manual_clock;
    use crate::replica::election::timers::test_utils::TestUtilActor;

    fn tick() -> HeartbeatTick {
        HeartbeatTick {
            peer_id: NodeId::new(3),
            term: Term::new(10),
        }
    }

    #[tokio::test]
    async fn ticks_immediately_then_every_period_until_dropped() {
        let period = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, mut driver) = manual_clock();

        let (task, handle) =
            HeartbeatTimerTask::new(period, strong_actor_client.weak(), NodeId::new(3), Term::new(10), clock);
        let join_handle = tokio::task::spawn(task.run());

        actor.assert_heartbeat_tick(tick()).await;
        actor.assert_no_event().await;

        for _ in 0..5 {
            driver.advance(period);
            actor.assert_heartbeat_tick(tick()).await;
            actor.assert_no_event().await;
        }

        // A long gap still yields a single tick.
        driver.advance(period * 5);
        actor.assert_heartbeat_tick(tick()).await;
        actor.assert_no_event().await;

        drop(handle);
        driver.advance(period);
        join_handle.await.unwrap();
        actor.assert_no_event().await;
    }

    #[tokio::test]
    async fn reset_postpones_tick() {
        let period = Duration::from_millis(100);
        let (strong_actor_client, rx) = ActorClient::new(10);
        let mut actor = TestUtilActor::new(rx);
        let (clock, mut driver) = manual_clock();

        let (task, handle) =
            HeartbeatTimerTask::new(period, strong_actor_client.weak(), NodeId::new(3), Term::new(10), clock);
        tokio::task::spawn(task.run());
        actor.assert_heartbeat_tick(tick()).await;

        for _ in 0..5 {
            driver.advance(period / 2);
            handle.reset_heartbeat_timer();
        }
        actor.assert_no_event().await;
        assert_eq!(driver.elapsed(), period * 5 / 2);

        // Next tick is due at T=3.5.
        driver.advance(period / 2);
        actor.assert_no_event().await;

        driver.advance(period / 2);
        actor.assert_heartbeat_tick(tick()).await;
        assert_eq!(driver.elapsed(), period * 7 / 2);
    }
}

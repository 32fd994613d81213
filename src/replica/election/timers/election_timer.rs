use crate::actor::WeakActorClient;
use crate::replica::election::timers::clock::{Clock, TokioClock};
use crate::replica::election::timers::signal::{self, DropCheck, DropGuard, Mailbox};
use rand::Rng;
use std::ops::RangeInclusive;
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Election timer held by followers and candidates. The task enqueues `ElectionTimeout` once the
/// current deadline passes without a reset. Because an event can already be queued when the driver
/// resets the timer, the driver asks `has_expired()` before acting on it.
pub(crate) struct ElectionTimerHandle<C: Clock = TokioClock> {
    wake_time: Mailbox<Instant>,
    deadline: Mutex<Instant>,
    timeout_range: RangeInclusive<Duration>,
    clock: C,
    _guard: DropGuard,
}

struct ElectionTimerTask<C: Clock> {
    wake_time: Mailbox<Instant>,
    actor_client: WeakActorClient,
    clock: C,
    handle_dropped: DropCheck,
    // Pause between repeated timeout events while nobody resets us.
    refire_backoff: Duration,
}

impl ElectionTimerHandle {
    pub(crate) fn spawn_timer_task(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
    ) -> Self {
        let (task, handle) = ElectionTimerTask::new(min_timeout, max_timeout, actor_client, TokioClock);
        tokio::task::spawn(task.run());

        handle
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerHandle<C> {
    pub(crate) fn reset_timeout(&self) {
        let next = self.random_deadline();
        *self.lock_deadline() = next;
        self.wake_time.post(next);
    }

    pub(crate) fn has_expired(&self) -> bool {
        self.clock.now() >= *self.lock_deadline()
    }

    fn random_deadline(&self) -> Instant {
        let timeout = rand::thread_rng().gen_range(self.timeout_range.clone());
        self.clock.now() + timeout
    }

    fn lock_deadline(&self) -> std::sync::MutexGuard<'_, Instant> {
        self.deadline.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C: Clock + Send + Sync + 'static> ElectionTimerTask<C> {
    fn new(
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: WeakActorClient,
        clock: C,
    ) -> (Self, ElectionTimerHandle<C>) {
        let wake_time = Mailbox::new();
        let (guard, handle_dropped) = signal::drop_guard();

        let task = ElectionTimerTask {
            wake_time: wake_time.clone(),
            actor_client,
            clock: clock.clone(),
            handle_dropped,
            refire_backoff: min_timeout,
        };
        let handle = ElectionTimerHandle {
            wake_time,
            deadline: Mutex::new(clock.now()),
            timeout_range: min_timeout..=max_timeout,
            clock,
            _guard: guard,
        };

        // The task must start with a deadline, otherwise it would fire immediately.
        handle.reset_timeout();

        (task, handle)
    }

    async fn run(mut self) {
        loop {
            match self.wake_time.take() {
                Some(wake_time) => {
                    self.clock.sleep_until(wake_time).await;
                }
                None => {
                    // Slept through the last deadline with no reset in between.
                    if self.handle_dropped.is_dropped() {
                        return;
                    }
                    let _ = self.actor_client.election_timeout().await;
                    self.clock.sleep(self.refire_backoff).await;
                }
            }

            if self.handle_dropped.is_dropped() {
                return;
            }
        }
    }
}

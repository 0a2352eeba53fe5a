//! Liveness polling and automatic reconnection for the active connection.
//!
//! At most one polling loop exists at a time. Every activation is stamped with
//! a generation number; status writes from an older generation are dropped, so
//! a late ping answer can never touch a connection that is no longer active.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::backend::{BackendError, ConnectionBackend};
use crate::connections::Connection;
use crate::events::{EventBus, SessionEvent};
use crate::status::{ConnectionStatus, HealthState, StatusBoard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    /// Delay between activation and the first ping.
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    /// Consecutive failed pings before a reconnect is attempted.
    pub failure_threshold: u32,
    pub ping_timeout: Duration,
    pub reconnect_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            poll_interval: Duration::from_secs(30),
            failure_threshold: 3,
            ping_timeout: Duration::from_secs(10),
            reconnect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
struct Probe {
    connection: Connection,
    backend: Arc<dyn ConnectionBackend>,
    board: StatusBoard,
    bus: EventBus,
    config: HealthConfig,
    generation: Arc<AtomicU64>,
    issued: u64,
    cycle: Arc<tokio::sync::Mutex<()>>,
}

impl Probe {
    fn id(&self) -> Uuid {
        self.connection.id
    }

    fn is_live(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.issued
    }

    fn record(&self, apply: impl FnOnce(&mut ConnectionStatus)) -> Option<ConnectionStatus> {
        let status = self.board.update_if(
            self.id(),
            || self.is_live(),
            |status| {
                apply(status);
                status.clone()
            },
        )?;
        self.bus.publish(SessionEvent::StatusChanged {
            id: self.id(),
            status: status.clone(),
        });
        Some(status)
    }

    fn current(&self) -> Option<ConnectionStatus> {
        if self.is_live() {
            self.board.get(self.id())
        } else {
            None
        }
    }

    async fn run(self) {
        let period = self.config.poll_interval.max(Duration::from_millis(1));
        let mut ticker = time::interval_at(Instant::now() + self.config.settle_delay, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if !self.is_live() {
                break;
            }
            self.check().await;
        }
    }

    async fn check(&self) -> Option<ConnectionStatus> {
        let _cycle = self.cycle.lock().await;
        self.record(|status| status.state = HealthState::Checking)?;

        let backend = Arc::clone(&self.backend);
        let (id, family) = (self.id(), self.connection.family);
        let started_at = Instant::now();
        let outcome = self
            .guarded("ping", self.config.ping_timeout, async move {
                backend.ping(id, family).await
            })
            .await;
        let latency = started_at.elapsed();

        match outcome {
            Ok(()) => {
                self.record(|status| {
                    status.state = HealthState::Healthy;
                    status.consecutive_failures = 0;
                    status.last_error = None;
                    status.last_checked_at = Some(Utc::now());
                    status.last_latency = Some(latency);
                })?;
                tracing::debug!(connection_id = %id, ?latency, "ping succeeded");
            }
            Err(error) => {
                let status = self.record(|status| {
                    status.state = HealthState::Unhealthy;
                    status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                    status.last_error = Some(error.to_string());
                    status.last_checked_at = Some(Utc::now());
                    status.last_latency = None;
                })?;
                tracing::warn!(
                    connection_id = %id,
                    failures = status.consecutive_failures,
                    %error,
                    "ping failed"
                );
                if status.consecutive_failures >= self.config.failure_threshold {
                    self.reconnect(status.consecutive_failures).await;
                }
            }
        }

        self.current()
    }

    async fn reconnect(&self, failures: u32) {
        let backend = Arc::clone(&self.backend);
        let connection = self.connection.clone();
        tracing::info!(connection_id = %self.id(), failures, "attempting automatic reconnect");

        let outcome = self
            .guarded("reconnect", self.config.reconnect_timeout, async move {
                backend
                    .connect(connection.id, connection.family, &connection.params)
                    .await
            })
            .await;

        match outcome {
            Ok(()) => {
                let recorded = self.record(|status| {
                    status.state = HealthState::Healthy;
                    status.consecutive_failures = 0;
                    status.last_error = None;
                    status.last_checked_at = Some(Utc::now());
                });
                if recorded.is_some() {
                    tracing::info!(connection_id = %self.id(), "reconnected");
                    self.bus.publish(SessionEvent::Reconnected { id: self.id() });
                }
            }
            Err(error) => {
                if !self.is_live() {
                    return;
                }
                tracing::warn!(connection_id = %self.id(), %error, "reconnect failed");
                self.bus.publish(SessionEvent::ReconnectFailed {
                    id: self.id(),
                    error: error.to_string(),
                });
            }
        }
    }

    /// Runs a backend call on its own task so a timeout or a panicking driver
    /// surfaces as an ordinary failure instead of ending the loop. The call is
    /// aborted if this future is dropped, so cancelling the loop cancels it too.
    async fn guarded<F>(
        &self,
        operation: &'static str,
        limit: Duration,
        call: F,
    ) -> Result<(), BackendError>
    where
        F: Future<Output = Result<(), BackendError>> + Send + 'static,
    {
        let mut call = AbortOnDrop(tokio::spawn(call));
        match time::timeout(limit, &mut call.0).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(BackendError::new(format!(
                "{operation} aborted: {join_error}"
            ))),
            Err(_) => Err(BackendError::new(format!(
                "{operation} timed out after {}ms",
                limit.as_millis()
            ))),
        }
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct ActiveLoop {
    probe: Probe,
    task: Option<JoinHandle<()>>,
}

/// Polls the single active connection and repairs it after repeated failures.
pub struct HealthMonitor {
    backend: Arc<dyn ConnectionBackend>,
    board: StatusBoard,
    bus: EventBus,
    config: HealthConfig,
    generation: Arc<AtomicU64>,
    active: Mutex<Option<ActiveLoop>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(
        backend: Arc<dyn ConnectionBackend>,
        board: StatusBoard,
        bus: EventBus,
        config: HealthConfig,
    ) -> Self {
        Self {
            backend,
            board,
            bus,
            config,
            generation: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    #[must_use]
    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    #[must_use]
    pub fn active_connection_id(&self) -> Option<Uuid> {
        self.active.lock().as_ref().map(|active| active.probe.id())
    }

    /// Cancels any running loop, resets the connection to `Unknown` and starts
    /// polling it. Must be called from within a tokio runtime for polling to
    /// start; without one the status is reset and polling stays off.
    pub fn activate(&self, connection: Connection) {
        let mut active = self.active.lock();
        self.stop_locked(&mut active);

        let id = connection.id;
        let family = connection.family;
        let probe = Probe {
            connection,
            backend: Arc::clone(&self.backend),
            board: self.board.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            generation: Arc::clone(&self.generation),
            issued: self.generation.load(Ordering::SeqCst),
            cycle: Arc::new(tokio::sync::Mutex::new(())),
        };
        probe.record(|status| *status = ConnectionStatus::default());

        let task = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(probe.clone().run())),
            Err(_) => {
                tracing::warn!(connection_id = %id, "no async runtime; health polling disabled");
                None
            }
        };
        tracing::info!(connection_id = %id, %family, "health monitoring started");
        *active = Some(ActiveLoop { probe, task });
    }

    pub fn deactivate(&self) {
        let mut active = self.active.lock();
        self.stop_locked(&mut active);
    }

    fn stop_locked(&self, active: &mut Option<ActiveLoop>) {
        self.board
            .fenced(|| self.generation.fetch_add(1, Ordering::SeqCst));
        if let Some(previous) = active.take() {
            if let Some(task) = previous.task {
                task.abort();
            }
            tracing::info!(connection_id = %previous.probe.id(), "health monitoring stopped");
        }
    }

    /// Runs one check immediately, serialized with the polling loop.
    pub async fn check_now(&self) -> Option<ConnectionStatus> {
        let probe = self
            .active
            .lock()
            .as_ref()
            .map(|active| active.probe.clone())?;
        probe.check().await
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::{HealthConfig, HealthMonitor};
    use crate::backend::{BackendError, ConnectionBackend};
    use crate::connections::{Connection, ConnectionParams};
    use crate::events::{EventBus, SessionEvent};
    use crate::family::DatabaseFamily;
    use crate::status::{HealthState, StatusBoard};

    #[derive(Default)]
    struct FakeBackend {
        ping_script: Mutex<VecDeque<Result<(), BackendError>>>,
        connect_script: Mutex<VecDeque<Result<(), BackendError>>>,
        ping_delays: Mutex<HashMap<Uuid, Duration>>,
        ping_calls: Mutex<HashMap<Uuid, usize>>,
        connect_calls: AtomicUsize,
        connect_delay: Mutex<Option<Duration>>,
        connects_completed: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        panic_on_ping: AtomicBool,
    }

    impl FakeBackend {
        fn script_pings(&self, outcomes: impl IntoIterator<Item = Result<(), &'static str>>) {
            self.ping_script
                .lock()
                .extend(outcomes.into_iter().map(|outcome| outcome.map_err(BackendError::new)));
        }

        fn script_connects(&self, outcomes: impl IntoIterator<Item = Result<(), &'static str>>) {
            self.connect_script
                .lock()
                .extend(outcomes.into_iter().map(|outcome| outcome.map_err(BackendError::new)));
        }

        fn pings_for(&self, id: Uuid) -> usize {
            self.ping_calls.lock().get(&id).copied().unwrap_or(0)
        }
    }

    #[async_trait::async_trait]
    impl ConnectionBackend for FakeBackend {
        async fn ping(&self, id: Uuid, _family: DatabaseFamily) -> Result<(), BackendError> {
            *self.ping_calls.lock().entry(id).or_default() += 1;
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

            let delay = self.ping_delays.lock().get(&id).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            assert!(!self.panic_on_ping.load(Ordering::SeqCst), "driver exploded");
            self.ping_script.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn connect(
            &self,
            _id: Uuid,
            _family: DatabaseFamily,
            _params: &ConnectionParams,
        ) -> Result<(), BackendError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let delay = *self.connect_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.connects_completed.fetch_add(1, Ordering::SeqCst);
            self.connect_script.lock().pop_front().unwrap_or(Ok(()))
        }

        async fn disconnect(&self, _id: Uuid) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn connection(name: &str) -> Connection {
        Connection::new(
            name,
            DatabaseFamily::Postgres,
            ConnectionParams::host("127.0.0.1", "postgres"),
        )
    }

    fn monitor_with(backend: &Arc<FakeBackend>, config: HealthConfig) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(backend) as Arc<dyn ConnectionBackend>,
            StatusBoard::new(),
            EventBus::new(),
            config,
        )
    }

    fn state_of(monitor: &HealthMonitor, id: Uuid) -> (HealthState, u32) {
        let status = monitor.board().get(id).expect("status should exist");
        (status.state, status.consecutive_failures)
    }

    async fn advance(duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    #[tokio::test(start_paused = true)]
    async fn first_ping_waits_for_settle_delay() {
        let backend = Arc::new(FakeBackend::default());
        let monitor = monitor_with(&backend, HealthConfig::default());
        let target = connection("local");
        let id = target.id;

        monitor.activate(target);
        assert_eq!(state_of(&monitor, id), (HealthState::Unknown, 0));

        advance(Duration::from_millis(400)).await;
        assert_eq!(backend.pings_for(id), 0);

        advance(Duration::from_millis(200)).await;
        assert_eq!(backend.pings_for(id), 1);
        assert_eq!(state_of(&monitor, id), (HealthState::Healthy, 0));
        assert!(monitor.board().get(id).and_then(|status| status.last_checked_at).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn third_failure_triggers_reconnect_and_recovers() {
        let backend = Arc::new(FakeBackend::default());
        backend.script_pings([Err("refused"), Err("refused"), Err("refused"), Ok(())]);
        let monitor = monitor_with(&backend, HealthConfig::default());
        let mut events = monitor.bus.subscribe();
        let target = connection("flaky");
        let id = target.id;

        monitor.activate(target);

        advance(Duration::from_millis(600)).await;
        assert_eq!(state_of(&monitor, id), (HealthState::Unhealthy, 1));
        assert_eq!(
            monitor.board().get(id).and_then(|status| status.last_error),
            Some("refused".to_string())
        );

        advance(Duration::from_secs(30)).await;
        assert_eq!(state_of(&monitor, id), (HealthState::Unhealthy, 2));
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 0);

        advance(Duration::from_secs(30)).await;
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state_of(&monitor, id), (HealthState::Healthy, 0));

        advance(Duration::from_secs(30)).await;
        assert_eq!(backend.pings_for(id), 4);
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state_of(&monitor, id), (HealthState::Healthy, 0));

        let mut observed = Vec::new();
        let mut reconnected = false;
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::StatusChanged { status, .. } => {
                    observed.push((status.state, status.consecutive_failures));
                }
                SessionEvent::Reconnected { id: reconnected_id } => {
                    reconnected = reconnected_id == id;
                }
                _ => {}
            }
        }
        assert!(reconnected);
        assert_eq!(
            observed,
            vec![
                (HealthState::Unknown, 0),
                (HealthState::Checking, 0),
                (HealthState::Unhealthy, 1),
                (HealthState::Checking, 1),
                (HealthState::Unhealthy, 2),
                (HealthState::Checking, 2),
                (HealthState::Unhealthy, 3),
                (HealthState::Healthy, 0),
                (HealthState::Checking, 0),
                (HealthState::Healthy, 0),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_keeps_counter_and_retries_next_cycle() {
        let backend = Arc::new(FakeBackend::default());
        backend.script_pings([Err("down"), Err("down"), Err("down"), Err("down")]);
        backend.script_connects([Err("auth failed"), Err("auth failed")]);
        let monitor = monitor_with(&backend, HealthConfig::default());
        let target = connection("down");
        let id = target.id;

        monitor.activate(target);
        advance(Duration::from_millis(600) + Duration::from_secs(60)).await;

        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(state_of(&monitor, id), (HealthState::Unhealthy, 3));

        advance(Duration::from_secs(30)).await;
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 2);
        assert_eq!(state_of(&monitor, id), (HealthState::Unhealthy, 4));
        assert_eq!(
            monitor.board().get(id).and_then(|status| status.last_error),
            Some("down".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn switching_connections_cancels_previous_loop() {
        let backend = Arc::new(FakeBackend::default());
        let monitor = monitor_with(&backend, HealthConfig::default());
        let first = connection("a");
        let second = connection("b");
        let (first_id, second_id) = (first.id, second.id);
        backend
            .ping_delays
            .lock()
            .insert(first_id, Duration::from_secs(5));

        monitor.activate(first);
        advance(Duration::from_millis(600)).await;
        assert_eq!(state_of(&monitor, first_id), (HealthState::Checking, 0));

        monitor.activate(second);
        assert_eq!(monitor.active_connection_id(), Some(second_id));

        advance(Duration::from_secs(120)).await;
        assert_eq!(backend.pings_for(first_id), 1);
        assert_eq!(state_of(&monitor, first_id), (HealthState::Checking, 0));
        assert_eq!(state_of(&monitor, second_id), (HealthState::Healthy, 0));
        assert_eq!(backend.pings_for(second_id), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn late_answer_after_switch_is_discarded() {
        let backend = Arc::new(FakeBackend::default());
        backend.script_pings([Err("late failure")]);
        let monitor = Arc::new(monitor_with(
            &backend,
            HealthConfig {
                settle_delay: Duration::from_secs(3600),
                ..HealthConfig::default()
            },
        ));
        let first = connection("a");
        let first_id = first.id;
        backend
            .ping_delays
            .lock()
            .insert(first_id, Duration::from_secs(5));

        monitor.activate(first);
        let pending = {
            let monitor = Arc::clone(&monitor);
            tokio::spawn(async move { monitor.check_now().await })
        };
        advance(Duration::from_secs(1)).await;
        assert_eq!(state_of(&monitor, first_id), (HealthState::Checking, 0));

        monitor.deactivate();
        let late = pending.await.expect("check task should finish");

        assert!(late.is_none());
        assert_eq!(backend.pings_for(first_id), 1);
        assert_eq!(state_of(&monitor, first_id), (HealthState::Checking, 0));
        assert!(monitor.active_connection_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_cancels_reconnect_in_flight() {
        let backend = Arc::new(FakeBackend::default());
        backend.script_pings([Err("down"), Err("down"), Err("down")]);
        *backend.connect_delay.lock() = Some(Duration::from_secs(20));
        let monitor = monitor_with(&backend, HealthConfig::default());
        let target = connection("slow-reconnect");
        let id = target.id;

        monitor.activate(target);
        advance(Duration::from_secs(65)).await;
        assert_eq!(backend.connect_calls.load(Ordering::SeqCst), 1);

        monitor.deactivate();
        advance(Duration::from_secs(30)).await;

        assert_eq!(backend.connects_completed.load(Ordering::SeqCst), 0);
        assert_eq!(state_of(&monitor, id), (HealthState::Unhealthy, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_stops_polling() {
        let backend = Arc::new(FakeBackend::default());
        let monitor = monitor_with(&backend, HealthConfig::default());
        let target = connection("local");
        let id = target.id;

        monitor.activate(target);
        advance(Duration::from_millis(600)).await;
        monitor.deactivate();
        advance(Duration::from_secs(300)).await;

        assert_eq!(backend.pings_for(id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_pings_never_overlap() {
        let backend = Arc::new(FakeBackend::default());
        let monitor = monitor_with(
            &backend,
            HealthConfig {
                ping_timeout: Duration::from_secs(120),
                ..HealthConfig::default()
            },
        );
        let target = connection("slow");
        let id = target.id;
        backend.ping_delays.lock().insert(id, Duration::from_secs(45));

        monitor.activate(target);
        advance(Duration::from_secs(200)).await;

        assert!(backend.pings_for(id) >= 2);
        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_timeout_counts_as_failure() {
        let backend = Arc::new(FakeBackend::default());
        let monitor = monitor_with(
            &backend,
            HealthConfig {
                ping_timeout: Duration::from_secs(2),
                ..HealthConfig::default()
            },
        );
        let target = connection("hung");
        let id = target.id;
        backend.ping_delays.lock().insert(id, Duration::from_secs(20));

        monitor.activate(target);
        advance(Duration::from_secs(5)).await;

        let status = monitor.board().get(id).expect("status should exist");
        assert_eq!(status.state, HealthState::Unhealthy);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status
            .last_error
            .is_some_and(|error| error.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_backend_does_not_stop_the_loop() {
        let backend = Arc::new(FakeBackend::default());
        backend.panic_on_ping.store(true, Ordering::SeqCst);
        let monitor = monitor_with(&backend, HealthConfig::default());
        let target = connection("broken");
        let id = target.id;

        monitor.activate(target);
        advance(Duration::from_millis(600)).await;
        assert_eq!(state_of(&monitor, id), (HealthState::Unhealthy, 1));

        backend.panic_on_ping.store(false, Ordering::SeqCst);
        advance(Duration::from_secs(30)).await;
        assert_eq!(state_of(&monitor, id), (HealthState::Healthy, 0));
        assert_eq!(backend.pings_for(id), 2);
    }

    #[test]
    fn activation_without_runtime_only_resets_status() {
        let backend = Arc::new(FakeBackend::default());
        let monitor = monitor_with(&backend, HealthConfig::default());
        let target = connection("offline");
        let id = target.id;

        monitor.activate(target);

        assert_eq!(state_of(&monitor, id), (HealthState::Unknown, 0));
        assert_eq!(monitor.active_connection_id(), Some(id));
    }
}

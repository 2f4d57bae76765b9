//! Connection state service
//!
//! Tracks the signaling and task state of the current attempt, derives the
//! global ok/warning/error state from them and drives the buildup progress
//! indicator.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::buildup::{initial_progress, next_progress, tick_period};
use super::observers::{ObserverId, Observers};
use super::types::{
    BuildupSnapshot, ConnectionBuildupState, GlobalConnectionState, GlobalStateChange,
    SignalingState, TaskConnectionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Signaling,
    Task,
}

struct StateInner {
    signaling: SignalingState,
    task: TaskConnectionState,
    stage: Stage,
    global: GlobalConnectionState,
    was_connected: bool,
    unread_count: u32,

    buildup: ConnectionBuildupState,
    progress: u8,
    slow_connect: bool,
    /// Bumped on every buildup change; a ticker only writes while its epoch is current
    buildup_epoch: u64,
    ticker: Option<JoinHandle<()>>,
}

impl Default for StateInner {
    fn default() -> Self {
        Self {
            signaling: SignalingState::New,
            task: TaskConnectionState::New,
            stage: Stage::Signaling,
            global: GlobalConnectionState::Error,
            was_connected: false,
            unread_count: 0,
            buildup: ConnectionBuildupState::New,
            progress: 0,
            slow_connect: false,
            buildup_epoch: 0,
            ticker: None,
        }
    }
}

/// Outcome of a locked update, posted once the lock is released
#[derive(Default)]
struct Pending {
    global: Option<GlobalStateChange>,
    buildup: Option<ConnectionBuildupState>,
    reset: bool,
}

/// Shared connection state. One per session.
pub struct StateService {
    inner: Arc<Mutex<StateInner>>,
    global_observers: Observers<GlobalStateChange>,
    buildup_observers: Observers<ConnectionBuildupState>,
    reset_observers: Observers<()>,
}

impl Default for StateService {
    fn default() -> Self {
        Self::new()
    }
}

impl StateService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateInner::default())),
            global_observers: Observers::new(),
            buildup_observers: Observers::new(),
            reset_observers: Observers::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        // A panicking observer must not wedge the state machine
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // =========================================================================
    // Observers
    // =========================================================================

    /// Called on every actual change of the global state
    pub fn on_global_change<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&GlobalStateChange) + Send + Sync + 'static,
    {
        self.global_observers.subscribe(callback)
    }

    /// Called on every actual change of the buildup state
    pub fn on_buildup_change<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&ConnectionBuildupState) + Send + Sync + 'static,
    {
        self.buildup_observers.subscribe(callback)
    }

    /// Called after every [`StateService::reset`], changed or not
    pub fn on_reset<F>(&self, callback: F) -> ObserverId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.reset_observers.subscribe(move |_: &()| callback())
    }

    pub fn remove_reset_observer(&self, id: ObserverId) -> bool {
        self.reset_observers.unsubscribe(id)
    }

    pub fn remove_global_observer(&self, id: ObserverId) -> bool {
        self.global_observers.unsubscribe(id)
    }

    pub fn remove_buildup_observer(&self, id: ObserverId) -> bool {
        self.buildup_observers.unsubscribe(id)
    }

    fn post(&self, pending: Pending) {
        if let Some(change) = pending.global {
            info!(from = %change.previous, to = %change.current, "Global connection state changed");
            self.global_observers.notify(&change);
        }
        if let Some(state) = pending.buildup {
            self.buildup_observers.notify(&state);
        }
        if pending.reset {
            self.reset_observers.notify(&());
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn global_state(&self) -> GlobalConnectionState {
        self.lock().global
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.lock().signaling.clone()
    }

    pub fn task_state(&self) -> TaskConnectionState {
        self.lock().task.clone()
    }

    pub fn was_connected(&self) -> bool {
        self.lock().was_connected
    }

    pub fn buildup(&self) -> BuildupSnapshot {
        let inner = self.lock();
        BuildupSnapshot {
            state: inner.buildup,
            progress: inner.progress,
            slow_connect: inner.slow_connect,
        }
    }

    pub fn buildup_state(&self) -> ConnectionBuildupState {
        self.lock().buildup
    }

    pub fn unread_count(&self) -> u32 {
        self.lock().unread_count
    }

    pub fn set_unread_count(&self, count: u32) {
        self.lock().unread_count = count;
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Apply a signaling state. Ignored once the task stage is reached.
    pub fn update_signaling_state(&self, state: SignalingState) {
        let mut pending = Pending::default();
        {
            let mut inner = self.lock();
            if inner.stage == Stage::Task {
                debug!(%state, "Ignoring signaling state in task stage");
                return;
            }

            let global = match &state {
                SignalingState::New
                | SignalingState::WsConnecting
                | SignalingState::ServerHandshake
                | SignalingState::PeerHandshake => GlobalConnectionState::Warning,
                SignalingState::Task => {
                    inner.stage = Stage::Task;
                    GlobalConnectionState::Warning
                }
                SignalingState::Closing | SignalingState::Closed => GlobalConnectionState::Error,
                SignalingState::Unknown(other) => {
                    warn!(state = %other, "Ignoring unknown signaling state");
                    return;
                }
            };

            debug!(%state, "Signaling state changed");
            inner.signaling = state;
            pending.global = set_global(&mut inner, global);
        }
        self.post(pending);
    }

    /// Apply a task connection state
    pub fn update_task_state(&self, state: TaskConnectionState) {
        let mut pending = Pending::default();
        {
            let mut inner = self.lock();

            let global = match &state {
                TaskConnectionState::New
                | TaskConnectionState::Connecting
                | TaskConnectionState::Reconnecting => GlobalConnectionState::Warning,
                TaskConnectionState::Connected => GlobalConnectionState::Ok,
                TaskConnectionState::Disconnected => GlobalConnectionState::Error,
                TaskConnectionState::Unknown(other) => {
                    warn!(state = %other, "Ignoring unknown task connection state");
                    return;
                }
            };

            if inner.stage == Stage::Signaling {
                debug!("Task state reported, switching to task stage");
                inner.stage = Stage::Task;
            }
            if state == TaskConnectionState::Connected {
                inner.was_connected = true;
            }

            debug!(%state, "Task connection state changed");
            inner.task = state;
            pending.global = set_global(&mut inner, global);
        }
        self.post(pending);
    }

    /// Move the buildup indicator. Re-assigning the current state does nothing.
    pub fn update_connection_buildup_state(&self, state: ConnectionBuildupState) {
        let mut pending = Pending::default();
        {
            let mut inner = self.lock();
            pending.buildup = self.set_buildup(&mut inner, state);
        }
        self.post(pending);
    }

    /// Restore initial values on every track.
    ///
    /// `reset_unread` additionally zeroes the unread counter.
    pub fn reset(&self, reset_unread: bool) {
        let mut pending = Pending {
            reset: true,
            ..Pending::default()
        };
        {
            let mut inner = self.lock();
            debug!("Resetting connection state");
            inner.signaling = SignalingState::New;
            inner.task = TaskConnectionState::New;
            inner.stage = Stage::Signaling;
            inner.was_connected = false;
            if reset_unread {
                inner.unread_count = 0;
            }
            pending.buildup = self.set_buildup(&mut inner, ConnectionBuildupState::New);
            pending.global = set_global(&mut inner, GlobalConnectionState::Error);
        }
        self.post(pending);
    }

    fn set_buildup(
        &self,
        inner: &mut StateInner,
        state: ConnectionBuildupState,
    ) -> Option<ConnectionBuildupState> {
        if inner.buildup == state {
            return None;
        }

        debug!(from = %inner.buildup, to = %state, "Connection buildup state changed");
        inner.buildup_epoch += 1;
        if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
        }
        inner.buildup = state;
        inner.progress = initial_progress(state);
        inner.slow_connect = false;

        if let Some(period) = tick_period(state) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let epoch = inner.buildup_epoch;
                    let shared = Arc::clone(&self.inner);
                    inner.ticker = Some(handle.spawn(run_ticker(shared, state, epoch, period)));
                }
                Err(_) => debug!("No runtime available, buildup progress will not animate"),
            }
        }

        Some(state)
    }
}

impl Drop for StateService {
    fn drop(&mut self) {
        if let Some(ticker) = self.lock().ticker.take() {
            ticker.abort();
        }
    }
}

fn set_global(inner: &mut StateInner, state: GlobalConnectionState) -> Option<GlobalStateChange> {
    if inner.global == state {
        return None;
    }
    let previous = std::mem::replace(&mut inner.global, state);
    Some(GlobalStateChange {
        previous,
        current: state,
        was_connected: inner.was_connected,
    })
}

async fn run_ticker(
    inner: Arc<Mutex<StateInner>>,
    state: ConnectionBuildupState,
    epoch: u64,
    period: Duration,
) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        interval.tick().await;
        let mut guard = match inner.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if guard.buildup_epoch != epoch {
            return;
        }
        match next_progress(state, guard.progress) {
            Some(progress) => guard.progress = progress,
            None => {
                debug!(%state, "Connection buildup is slow");
                guard.slow_connect = true;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(service: &StateService) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        service.on_global_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn test_global_posts_only_on_change() {
        let service = StateService::new();
        let count = counting(&service);

        service.update_signaling_state(SignalingState::WsConnecting);
        service.update_signaling_state(SignalingState::ServerHandshake);
        service.update_signaling_state(SignalingState::PeerHandshake);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(service.global_state(), GlobalConnectionState::Warning);

        service.update_task_state(TaskConnectionState::Connected);
        service.update_task_state(TaskConnectionState::Connected);
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(service.global_state(), GlobalConnectionState::Ok);
    }

    #[test]
    fn test_signaling_ignored_in_task_stage() {
        let service = StateService::new();
        service.update_signaling_state(SignalingState::Task);
        service.update_task_state(TaskConnectionState::Connected);

        service.update_signaling_state(SignalingState::Closed);
        assert_eq!(service.global_state(), GlobalConnectionState::Ok);
        assert_eq!(service.signaling_state(), SignalingState::Task);
    }

    #[test]
    fn test_unknown_states_are_ignored() {
        let service = StateService::new();
        let count = counting(&service);

        service.update_signaling_state(SignalingState::from("quantum-tunnel"));
        service.update_task_state(TaskConnectionState::from("teleporting"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(service.signaling_state(), SignalingState::New);
    }

    #[test]
    fn test_disconnect_after_connect_reports_was_connected() {
        let service = StateService::new();
        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = changes.clone();
        service.on_global_change(move |change| c.lock().unwrap().push(*change));

        service.update_task_state(TaskConnectionState::Connected);
        service.update_task_state(TaskConnectionState::Disconnected);

        let changes = changes.lock().unwrap();
        let last = changes.last().unwrap();
        assert_eq!(last.previous, GlobalConnectionState::Ok);
        assert_eq!(last.current, GlobalConnectionState::Error);
        assert!(last.was_connected);
    }

    #[test]
    fn test_reset_clears_tracks_and_optionally_unread() {
        let service = StateService::new();
        service.set_unread_count(4);
        service.update_task_state(TaskConnectionState::Connected);
        service.update_connection_buildup_state(ConnectionBuildupState::Done);

        service.reset(false);
        assert_eq!(service.unread_count(), 4);
        assert!(!service.was_connected());
        assert_eq!(service.global_state(), GlobalConnectionState::Error);
        assert_eq!(service.buildup_state(), ConnectionBuildupState::New);

        service.reset(true);
        assert_eq!(service.unread_count(), 0);
    }

    #[test]
    fn test_every_reset_is_announced() {
        let service = StateService::new();
        let resets = Arc::new(AtomicUsize::new(0));
        let r = resets.clone();
        service.on_reset(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        // A reset from the initial state changes nothing but still counts
        service.reset(false);
        service.reset(true);
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_same_buildup_state_is_noop() {
        let service = StateService::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        service.on_buildup_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        service.update_connection_buildup_state(ConnectionBuildupState::Connecting);
        service.update_connection_buildup_state(ConnectionBuildupState::Connecting);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(service.buildup().progress, 13);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_animates_until_slow() {
        let service = StateService::new();
        service.update_connection_buildup_state(ConnectionBuildupState::PeerHandshake);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(service.buildup().progress, 25);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let snapshot = service.buildup();
        assert_eq!(snapshot.progress, 60);
        assert!(snapshot.slow_connect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_cancels_animation() {
        let service = StateService::new();
        service.update_connection_buildup_state(ConnectionBuildupState::Push);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(service.buildup().progress, 3);

        service.update_connection_buildup_state(ConnectionBuildupState::Connecting);
        tokio::time::sleep(Duration::from_secs(20)).await;
        let snapshot = service.buildup();
        assert_eq!(snapshot.progress, 13);
        assert!(!snapshot.slow_connect);
    }
}

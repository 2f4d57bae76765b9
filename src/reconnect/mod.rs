//! Reconnection controller
//!
//! Watches the global connection state of a [`Session`] and recovers lost
//! connections. Sessions running over WebRTC get a two-phase soft reconnect
//! ladder, relayed sessions a single delayed restart. When recovery fails the
//! state is reset and the user is sent back to pairing with the old keys.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::session::{InitParams, Session, StopOptions, WelcomeParams};
use crate::state::{ConnectionBuildupState, GlobalConnectionState, GlobalStateChange, ObserverId};
use crate::transport::ChosenTask;
use crate::types::RelayError;

#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// How long the first soft reconnect may take to show progress
    pub phase1_timeout: Duration,
    /// Same for the second and last one
    pub phase2_timeout: Duration,
    /// Pause between stopping and restarting a relayed session
    pub relayed_restart_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            phase1_timeout: Duration::from_secs(20),
            phase2_timeout: Duration::from_secs(40),
            relayed_restart_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    Idle,
    Phase1,
    Phase2,
    Failed,
}

impl fmt::Display for ReconnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Phase1 => "phase1",
            Self::Phase2 => "phase2",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Recovery strategy, decided by the transport the peer chose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformClass {
    SoftReconnect,
    AlwaysRelayed,
}

impl From<ChosenTask> for PlatformClass {
    fn from(task: ChosenTask) -> Self {
        match task {
            ChosenTask::WebRtc => Self::SoftReconnect,
            ChosenTask::RelayedData => Self::AlwaysRelayed,
        }
    }
}

struct Ladder {
    phase: ReconnectPhase,
    /// At most one armed at any time
    timer: Option<JoinHandle<()>>,
    /// Restart task of the current attempt
    restart: Option<JoinHandle<()>>,
    /// Bumped per restart; stale timers and startups compare against it
    attempt: u64,
    class: Option<PlatformClass>,
    /// Keys of the last good connection
    welcome: Option<WelcomeParams>,
}

struct ControllerInner {
    session: Session,
    config: ReconnectConfig,
    ladder: Mutex<Ladder>,
}

/// Keeps a session alive. Detaches from the session when dropped.
pub struct ReconnectionController {
    inner: Arc<ControllerInner>,
    global_observer: ObserverId,
    buildup_observer: ObserverId,
}

impl ReconnectionController {
    pub fn attach(session: Session, config: ReconnectConfig) -> Self {
        let inner = Arc::new(ControllerInner {
            session,
            config,
            ladder: Mutex::new(Ladder {
                phase: ReconnectPhase::Idle,
                timer: None,
                restart: None,
                attempt: 0,
                class: None,
                welcome: None,
            }),
        });

        let state = inner.session.state().clone();
        let weak = Arc::downgrade(&inner);
        let global_observer = state.on_global_change(move |change| {
            if let Some(inner) = weak.upgrade() {
                inner.on_global_change(change);
            }
        });
        let weak = Arc::downgrade(&inner);
        let buildup_observer = state.on_buildup_change(move |buildup| {
            if let Some(inner) = weak.upgrade() {
                inner.on_buildup_change(*buildup);
            }
        });

        Self {
            inner,
            global_observer,
            buildup_observer,
        }
    }

    pub fn phase(&self) -> ReconnectPhase {
        self.inner.ladder().phase
    }

    pub fn is_timer_armed(&self) -> bool {
        self.inner.ladder().timer.is_some()
    }

    /// Restarts performed since attaching
    pub fn attempts(&self) -> u64 {
        self.inner.ladder().attempt
    }
}

impl Drop for ReconnectionController {
    fn drop(&mut self) {
        let state = self.inner.session.state();
        state.remove_global_observer(self.global_observer);
        state.remove_buildup_observer(self.buildup_observer);

        let mut ladder = self.inner.ladder();
        if let Some(timer) = ladder.timer.take() {
            timer.abort();
        }
        if let Some(restart) = ladder.restart.take() {
            restart.abort();
        }
    }
}

impl ControllerInner {
    fn ladder(&self) -> MutexGuard<'_, Ladder> {
        self.ladder.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn on_global_change(self: &Arc<Self>, change: &GlobalStateChange) {
        match change.current {
            GlobalConnectionState::Ok => {
                let class = self.session.chosen_task().map(PlatformClass::from);
                let welcome = self.session.welcome_params();
                let mut ladder = self.ladder();
                if ladder.phase != ReconnectPhase::Idle {
                    info!(phase = %ladder.phase, "Reconnected");
                }
                clear_timer(&mut ladder);
                ladder.phase = ReconnectPhase::Idle;
                ladder.class = class;
                ladder.welcome = welcome;
            }
            // Losing a connection that never came up is the orchestrator's business
            _ if !change.was_connected => {}
            current => {
                self.session.data().clear_typing();

                let (phase, class) = {
                    let ladder = self.ladder();
                    (ladder.phase, ladder.class)
                };
                if phase != ReconnectPhase::Idle {
                    debug!(%phase, "Connection lost during recovery");
                    return;
                }

                match (class, current) {
                    (Some(PlatformClass::AlwaysRelayed), _) => {
                        warn!(state = %current, "Relayed connection lost, restarting");
                        self.begin(ReconnectPhase::Phase1, self.config.relayed_restart_delay);
                    }
                    (Some(PlatformClass::SoftReconnect), GlobalConnectionState::Error) => {
                        warn!("Connection lost, starting soft reconnect");
                        self.begin(ReconnectPhase::Phase1, Duration::ZERO);
                    }
                    (Some(PlatformClass::SoftReconnect), _) => {
                        debug!("Connection degraded, waiting for it to recover")
                    }
                    (None, _) => warn!("Connection lost before a transport was chosen"),
                }
            }
        }
    }

    fn on_buildup_change(&self, buildup: ConnectionBuildupState) {
        if !matches!(
            buildup,
            ConnectionBuildupState::PeerHandshake
                | ConnectionBuildupState::Loading
                | ConnectionBuildupState::Done
        ) {
            return;
        }

        let mut ladder = self.ladder();
        if matches!(ladder.phase, ReconnectPhase::Phase1 | ReconnectPhase::Phase2) {
            info!(phase = %ladder.phase, %buildup, "Reconnect progressing, timer cancelled");
            clear_timer(&mut ladder);
            ladder.phase = ReconnectPhase::Idle;
        }
    }

    /// Enter `phase`, arm its timer and restart the session after `delay`
    fn begin(self: &Arc<Self>, phase: ReconnectPhase, delay: Duration) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                error!("No runtime available, cannot reconnect");
                return;
            }
        };

        let timeout = match phase {
            ReconnectPhase::Phase2 => self.config.phase2_timeout,
            _ => self.config.phase1_timeout,
        };

        let mut ladder = self.ladder();
        clear_timer(&mut ladder);
        if let Some(previous) = ladder.restart.take() {
            previous.abort();
        }
        ladder.phase = phase;
        ladder.attempt += 1;
        let attempt = ladder.attempt;
        info!(%phase, attempt, timeout_ms = timeout.as_millis() as u64, "Reconnect phase started");

        let weak = Arc::downgrade(self);
        ladder.timer = Some(handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            on_timeout(weak, attempt).await;
        }));

        let controller = Arc::clone(self);
        let params = InitParams {
            key_pair: ladder.welcome.as_ref().map(|w| w.key_pair.clone()),
            peer_trusted_key: ladder.welcome.as_ref().and_then(|w| w.peer_trusted_key),
            reset_fields: false,
        };
        ladder.restart = Some(handle.spawn(async move {
            controller.restart(attempt, params, delay).await;
        }));
    }

    /// Soft stop, then init and start with the same keys
    async fn restart(self: Arc<Self>, attempt: u64, params: InitParams, delay: Duration) {
        self.session.stop(StopOptions::soft()).await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Err(e) = self.session.init(params) {
            error!(error = %e, "Could not re-initialise session");
            self.fail_if_current(attempt).await;
            return;
        }

        match self.session.start().await {
            Ok(()) => info!(attempt, "Reconnect attempt established a session"),
            Err(RelayError::Stopped) => debug!(attempt, "Reconnect attempt superseded"),
            Err(e) => {
                warn!(attempt, error = %e, "Reconnect attempt failed");
                self.fail_if_current(attempt).await;
            }
        }
    }

    async fn fail_if_current(&self, attempt: u64) {
        let welcome = {
            let mut ladder = self.ladder();
            if ladder.attempt != attempt || ladder.phase == ReconnectPhase::Failed {
                return;
            }
            clear_timer(&mut ladder);
            // The failing attempt is this task; detach instead of aborting it
            ladder.restart = None;
            ladder.phase = ReconnectPhase::Failed;
            ladder.welcome.clone()
        };
        self.give_up(welcome).await;
    }

    /// Terminal: tear down, reset once, back to pairing with the old keys
    async fn give_up(&self, welcome: Option<WelcomeParams>) {
        error!("Reconnect failed, returning to pairing");
        self.session
            .stop(StopOptions {
                requested_by_us: false,
                delete_stored_data: false,
                reset_push: false,
                redirect: false,
                reason: None,
            })
            .await;
        self.session.frontend().navigate_to_welcome(welcome);
    }
}

async fn on_timeout(controller: Weak<ControllerInner>, attempt: u64) {
    let controller = match controller.upgrade() {
        Some(controller) => controller,
        None => return,
    };

    let (phase, class, welcome) = {
        let mut ladder = controller.ladder();
        if ladder.attempt != attempt {
            return;
        }
        // This task is the timer; forget the handle rather than abort it
        ladder.timer = None;
        (ladder.phase, ladder.class, ladder.welcome.clone())
    };

    match (phase, class) {
        (ReconnectPhase::Phase1, Some(PlatformClass::SoftReconnect)) => {
            warn!("Reconnect phase 1 timed out, escalating");
            controller.begin(ReconnectPhase::Phase2, Duration::ZERO);
        }
        (ReconnectPhase::Phase1 | ReconnectPhase::Phase2, _) => {
            {
                let mut ladder = controller.ladder();
                if let Some(restart) = ladder.restart.take() {
                    restart.abort();
                }
                ladder.phase = ReconnectPhase::Failed;
            }
            warn!(%phase, "Reconnect timed out");
            controller.give_up(welcome).await;
        }
        _ => {}
    }
}

fn clear_timer(ladder: &mut Ladder) {
    if let Some(timer) = ladder.timer.take() {
        timer.abort();
    }
}

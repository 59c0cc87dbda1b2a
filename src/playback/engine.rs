use crate::core::{Action, AuxCommand, AuxDevice, BlockId, PoseTargets, ScheduledBlock, Timeline, TrackKind};
use crate::playback::dispatcher::{ActionDispatcher, DispatchOutcome};
use crate::playback::{PlaybackConfig, PlayerState, RunError, RunToken, StopMode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// One armed timer: a block within a loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TimerKey {
    iteration: u64,
    block: BlockId,
}

/// When a timer is due, and how late it may still act
#[derive(Debug, Clone, Copy)]
struct Slot {
    key: TimerKey,
    deadline: Instant,
    /// Length of the iteration the timer belongs to
    period: Duration,
}

/// Mutable run state, guarded by a single lock that is never held across an await
struct RunState {
    state: PlayerState,
    token: Option<RunToken>,
    /// Timers armed but not yet fired
    timers: HashMap<TimerKey, JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
    /// Serializes movement commands within a run
    lane: Arc<tokio::sync::Mutex<()>>,
    iteration: u64,
    iteration_origin: Option<Instant>,
    loop_length: Duration,
    playhead: Duration,
    last_error: Option<String>,
}

impl RunState {
    fn new() -> Self {
        Self {
            state: PlayerState::Idle,
            token: None,
            timers: HashMap::new(),
            ticker: None,
            lane: Arc::new(tokio::sync::Mutex::new(())),
            iteration: 0,
            iteration_origin: None,
            loop_length: Duration::ZERO,
            playhead: Duration::ZERO,
            last_error: None,
        }
    }

    fn is_current(&self, token: &RunToken) -> bool {
        self.state == PlayerState::Running && self.token.as_ref().is_some_and(|t| t.same_run(token))
    }
}

/// Point-in-time view of the player
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerStatus {
    pub state: PlayerState,
    pub run_id: Option<u64>,
    pub iteration: u64,
    pub playhead: Duration,
    pub loop_length: Duration,
    pub armed_timers: usize,
    /// Why the last run aborted, if it did
    pub last_error: Option<String>,
}

/// Timeline player
///
/// Flattens the timeline and arms one timer per block relative to the
/// iteration origin. A coarse ticker advances the playhead and re-arms the
/// whole set at the loop boundary, anchoring the next iteration at
/// `origin + loop_length` so the loop does not drift.
///
/// A timer claims itself under the run lock before acting, so stopping
/// (which flips the state and aborts every unclaimed timer under the same
/// lock) leaves no window for a stale timer to dispatch.
#[derive(Clone)]
pub struct Player {
    inner: Arc<PlayerInner>,
}

struct PlayerInner {
    dispatcher: ActionDispatcher,
    timeline: Arc<RwLock<Timeline>>,
    config: PlaybackConfig,
    run: Mutex<RunState>,
    next_run_id: AtomicU64,
}

impl Player {
    pub fn new(dispatcher: ActionDispatcher, timeline: Arc<RwLock<Timeline>>, config: PlaybackConfig) -> Self {
        Self {
            inner: Arc::new(PlayerInner {
                dispatcher,
                timeline,
                config,
                run: Mutex::new(RunState::new()),
                next_run_id: AtomicU64::new(0),
            }),
        }
    }

    /// Start playing the timeline in a loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<RunToken, RunError> {
        let token = self.begin()?;
        self.launch(&token)?;
        Ok(token)
    }

    /// Reserve the player for a run that is about to start
    ///
    /// The player sits in `Starting` until [`launch`](Self::launch). A stop in
    /// between cancels the reservation and the launch is refused.
    pub fn begin(&self) -> Result<RunToken, RunError> {
        let inner = &self.inner;
        let mut run = inner.lock_run();
        if run.state != PlayerState::Idle {
            return Err(RunError::AlreadyRunning(run.state));
        }
        let token = RunToken::new(inner.next_run_id.fetch_add(1, Ordering::SeqCst) + 1);
        run.state = PlayerState::Starting;
        run.token = Some(token.clone());
        debug!("Run {} reserved", token.run_id());
        Ok(token)
    }

    /// Start the run reserved by [`begin`](Self::begin)
    pub fn launch(&self, token: &RunToken) -> Result<(), RunError> {
        let inner = &self.inner;
        let mut run = inner.lock_run();
        let reserved = run.state == PlayerState::Starting
            && run.token.as_ref().is_some_and(|t| t.same_run(token));
        if !reserved || token.is_cancelled() {
            info!("Run {} was stopped before it started", token.run_id());
            return Err(RunError::Cancelled);
        }

        // Travel estimates chain from where the arms are now
        let origin_positions = inner.dispatcher.state().positions();
        inner.write_timeline().set_origin(origin_positions);

        run.state = PlayerState::Running;
        run.iteration = 0;
        run.playhead = Duration::ZERO;
        run.last_error = None;
        run.lane = Arc::new(tokio::sync::Mutex::new(()));

        if inner.config.blower_enabled {
            let dispatcher = inner.dispatcher.clone();
            let blower = Action::aux(AuxDevice::Blower, AuxCommand::Start, Some(inner.config.blower_speed));
            let token = token.clone();
            tokio::spawn(async move {
                if let Err(e) = dispatcher.dispatch(&blower, &PoseTargets::empty(), Some(&token)).await {
                    warn!("Blower start failed: {}", e);
                }
            });
        }

        let origin = Instant::now();
        inner.arm_iteration(&mut run, token, origin);
        run.ticker = Some(tokio::spawn(inner.clone().tick_loop(token.clone(), origin)));

        info!(
            "Run {} started: {} timers armed, loop {:.2}s",
            token.run_id(),
            run.timers.len(),
            run.loop_length.as_secs_f64()
        );
        Ok(())
    }

    /// Stop the current run
    ///
    /// Every pending timer is cancelled before the first await. Then the
    /// fogger and blower are stopped if running and, in `ReturnHome` mode,
    /// the arms go home once any in-flight move has finished. Returns false
    /// if there was no run to stop.
    pub async fn stop(&self, mode: StopMode) -> bool {
        if self.inner.drop_reservation() {
            return true;
        }
        let Some((token, lane)) = self.inner.cancel_run(None, None) else {
            return false;
        };
        info!("Stopping run {}", token.run_id());
        self.inner.shutdown(mode, lane).await;
        true
    }

    pub fn state(&self) -> PlayerState {
        self.inner.lock_run().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == PlayerState::Running
    }

    pub fn playhead(&self) -> Duration {
        self.inner.lock_run().playhead
    }

    pub fn status(&self) -> PlayerStatus {
        let run = self.inner.lock_run();
        PlayerStatus {
            state: run.state,
            run_id: run.token.as_ref().map(RunToken::run_id),
            iteration: run.iteration,
            playhead: run.playhead,
            loop_length: run.loop_length,
            armed_timers: run.timers.len(),
            last_error: run.last_error.clone(),
        }
    }

    pub fn timeline(&self) -> &Arc<RwLock<Timeline>> {
        &self.inner.timeline
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.inner.dispatcher
    }
}

impl PlayerInner {
    fn lock_run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_timeline(&self) -> std::sync::RwLockWriteGuard<'_, Timeline> {
        self.timeline.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_targets(&self) -> PoseTargets {
        let timeline = self.timeline.read().unwrap_or_else(PoisonError::into_inner);
        timeline.motion_profile().targets.clone()
    }

    /// Arm one timer per block for the iteration starting at `origin`
    ///
    /// Reads the timeline afresh, so edits apply from the next iteration.
    /// Blower blocks are not armed: the blower is on for the whole run.
    fn arm_iteration(self: &Arc<Self>, run: &mut RunState, token: &RunToken, origin: Instant) {
        let (schedule, loop_length, targets) = {
            let timeline = self.timeline.read().unwrap_or_else(PoisonError::into_inner);
            (
                timeline.flatten(),
                timeline.loop_length(),
                Arc::new(timeline.motion_profile().targets.clone()),
            )
        };

        // Timers of the previous iteration past the boundary stay armed
        run.timers.retain(|_, handle| !handle.is_finished());
        run.iteration_origin = Some(origin);
        run.loop_length = loop_length;
        let period = loop_length.max(self.config.tick);

        for scheduled in schedule {
            if scheduled.block.kind() == TrackKind::Blower {
                continue;
            }
            let key = TimerKey {
                iteration: run.iteration,
                block: scheduled.block.id,
            };
            let slot = Slot {
                key,
                deadline: origin + scheduled.start,
                period,
            };
            let task = self
                .clone()
                .fire(slot, token.clone(), scheduled, targets.clone(), run.lane.clone());
            run.timers.insert(key, tokio::spawn(task));
        }

        debug!(
            "Run {} iteration {}: {} timers armed",
            token.run_id(),
            run.iteration,
            run.timers.len()
        );
    }

    /// Timer body for one block
    async fn fire(
        self: Arc<Self>,
        slot: Slot,
        token: RunToken,
        scheduled: ScheduledBlock,
        targets: Arc<PoseTargets>,
        lane: Arc<tokio::sync::Mutex<()>>,
    ) {
        let key = slot.key;
        tokio::time::sleep_until(slot.deadline).await;
        if !self.claim(&key, &token) {
            return;
        }

        let action = scheduled.block.action;
        debug!(
            "Run {} iteration {}: {} at {:.2}s",
            token.run_id(),
            key.iteration,
            action,
            scheduled.block.start_s
        );

        if !action.is_movement() {
            if let Err(e) = self.dispatcher.dispatch(&action, &targets, Some(&token)).await {
                warn!("{}", e);
            }
            return;
        }

        let _lane = lane.lock().await;
        // Moves queued behind a slow one drop out once a whole loop late
        let late = Instant::now().saturating_duration_since(slot.deadline);
        if late > slot.period {
            warn!(
                "Run {} iteration {}: skipping {}, {:.2}s late",
                token.run_id(),
                key.iteration,
                action,
                late.as_secs_f64()
            );
            return;
        }
        match self.dispatcher.dispatch(&action, &targets, Some(&token)).await {
            Ok(DispatchOutcome::Cancelled) => debug!("{} dropped, run {} cancelled", action, token.run_id()),
            Ok(_) => {}
            Err(e) => {
                error!("Aborting run {}: {}", token.run_id(), e);
                self.abort(&token, e.to_string());
            }
        }
    }

    /// Take a fired timer out of the armed set if its run is still live
    fn claim(&self, key: &TimerKey, token: &RunToken) -> bool {
        let mut run = self.lock_run();
        run.is_current(token) && !token.is_cancelled() && run.timers.remove(key).is_some()
    }

    async fn tick_loop(self: Arc<Self>, token: RunToken, origin: Instant) {
        let period = self.config.tick.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(origin + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if token.is_cancelled() || !self.on_tick(&token) {
                break;
            }
        }
    }

    /// Advance the playhead, re-arming at the loop boundary; false once the run is gone
    fn on_tick(self: &Arc<Self>, token: &RunToken) -> bool {
        let mut run = self.lock_run();
        if !run.is_current(token) {
            return false;
        }
        let Some(origin) = run.iteration_origin else {
            return false;
        };

        let now = Instant::now();
        // An iteration never lasts less than one tick
        let period = run.loop_length.max(self.config.tick);
        let elapsed = now.saturating_duration_since(origin);
        if elapsed < period {
            run.playhead = elapsed;
            return true;
        }

        let mut next = origin + period;
        if now.saturating_duration_since(next) >= period {
            warn!("Run {} fell a whole loop behind, resynchronizing", token.run_id());
            next = now;
        }
        run.iteration += 1;
        run.playhead = now.saturating_duration_since(next);
        info!("Run {}: loop {} starting", token.run_id(), run.iteration);
        self.arm_iteration(&mut run, token, next);
        true
    }

    /// Cancel a run still in `Starting`; nothing is armed yet
    fn drop_reservation(&self) -> bool {
        let mut run = self.lock_run();
        if run.state != PlayerState::Starting {
            return false;
        }
        if let Some(token) = run.token.take() {
            token.cancel();
            info!("Run {} cancelled before starting", token.run_id());
        }
        run.state = PlayerState::Idle;
        true
    }

    /// Flip a running run to stopping and cancel everything still armed
    ///
    /// With `expected`, only that run is cancelled.
    fn cancel_run(
        &self,
        reason: Option<String>,
        expected: Option<&RunToken>,
    ) -> Option<(RunToken, Arc<tokio::sync::Mutex<()>>)> {
        let mut run = self.lock_run();
        if run.state != PlayerState::Running {
            return None;
        }
        if let Some(expected) = expected {
            if !run.is_current(expected) {
                return None;
            }
        }

        let token = run.token.take()?;
        token.cancel();
        run.state = PlayerState::Stopping;
        for (_, handle) in run.timers.drain() {
            handle.abort();
        }
        if let Some(ticker) = run.ticker.take() {
            ticker.abort();
        }
        if reason.is_some() {
            run.last_error = reason;
        }
        Some((token, run.lane.clone()))
    }

    /// Abort a run after a failed movement; no home return
    fn abort(self: &Arc<Self>, token: &RunToken, reason: String) {
        let Some((_, lane)) = self.cancel_run(Some(reason), Some(token)) else {
            return;
        };
        let inner = self.clone();
        tokio::spawn(async move {
            inner.shutdown(StopMode::SkipHome, lane).await;
        });
    }

    /// Bring the machine to a safe idle state after cancellation
    async fn shutdown(&self, mode: StopMode, lane: Arc<tokio::sync::Mutex<()>>) {
        let cached = self.dispatcher.state().snapshot();
        let none = PoseTargets::empty();

        if cached.fogger_running {
            let stop = Action::aux(AuxDevice::Fogger, AuxCommand::Stop, None);
            if let Err(e) = self.dispatcher.dispatch(&stop, &none, None).await {
                warn!("Fogger stop failed: {}", e);
            }
        }
        if cached.blower_running {
            let stop = Action::aux(AuxDevice::Blower, AuxCommand::Stop, None);
            if let Err(e) = self.dispatcher.dispatch(&stop, &none, None).await {
                warn!("Blower stop failed: {}", e);
            }
        }

        if mode == StopMode::ReturnHome {
            // Happens after any move still in flight
            let _lane = lane.lock().await;
            let targets = self.current_targets();
            if let Err(e) = self.dispatcher.return_home(&targets).await {
                warn!("Return home failed: {}", e);
            }
        }

        let mut run = self.lock_run();
        run.state = PlayerState::Idle;
        run.playhead = Duration::ZERO;
        run.iteration_origin = None;
        info!("Player idle");
    }
}

use crate::hardware::actuator::Actuator;
use crate::hardware::state::SharedActuatorState;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Probe statistics
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub probes_ok: AtomicU64,
    pub probes_failed: AtomicU64,
}

/// Connectivity monitor
///
/// Probes the controller on a fixed interval and mirrors the answer into the
/// cached actuator state. This is the only writer of the online flag.
pub struct ConnectivityMonitor {
    actuator: Arc<dyn Actuator>,
    state: SharedActuatorState,
    interval: Duration,
    timeout: Duration,
    /// Stop signal for background task
    stop_signal: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<MonitorStats>,
}

impl ConnectivityMonitor {
    pub fn new(
        actuator: Arc<dyn Actuator>,
        state: SharedActuatorState,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            actuator,
            state,
            interval,
            timeout,
            stop_signal: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            stats: Arc::new(MonitorStats::default()),
        }
    }

    /// Run a single probe attempt; returns whether the actuator is online
    pub async fn probe_once(&self) -> bool {
        Self::probe(&*self.actuator, &self.state, self.timeout, &self.stats).await
    }

    /// Start probing in the background (no-op if already started)
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        self.stop_signal.store(false, Ordering::SeqCst);

        let actuator = self.actuator.clone();
        let state = self.state.clone();
        let stop_signal = self.stop_signal.clone();
        let stats = self.stats.clone();
        let period = self.interval.max(Duration::from_millis(1));
        let timeout = self.timeout;

        info!(
            "Monitoring {} every {:?} (timeout {:?})",
            actuator.name(),
            period,
            timeout
        );

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if stop_signal.load(Ordering::SeqCst) {
                    break;
                }
                Self::probe(&*actuator, &state, timeout, &stats).await;
            }
            debug!("Connectivity monitor stopped");
        }));
    }

    /// Stop the background task
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Get statistics
    pub fn stats(&self) -> &MonitorStats {
        &self.stats
    }

    pub fn state(&self) -> &SharedActuatorState {
        &self.state
    }

    async fn probe(
        actuator: &dyn Actuator,
        state: &SharedActuatorState,
        timeout: Duration,
        stats: &MonitorStats,
    ) -> bool {
        match tokio::time::timeout(timeout, actuator.probe()).await {
            Ok(Ok(health)) if !health.is_ok() => {
                stats.probes_failed.fetch_add(1, Ordering::SeqCst);
                warn!("{} reports status {:?}", actuator.name(), health.status);
                if state.mark_offline() {
                    info!("{} went offline", actuator.name());
                }
                false
            }
            Ok(Ok(health)) => {
                stats.probes_ok.fetch_add(1, Ordering::SeqCst);
                if state.apply_health(&health) {
                    info!("{} is online", actuator.name());
                }
                true
            }
            Ok(Err(e)) => {
                stats.probes_failed.fetch_add(1, Ordering::SeqCst);
                warn!("Probe of {} failed: {}", actuator.name(), e);
                if state.mark_offline() {
                    info!("{} went offline", actuator.name());
                }
                false
            }
            Err(_) => {
                stats.probes_failed.fetch_add(1, Ordering::SeqCst);
                warn!("Probe of {} timed out after {:?}", actuator.name(), timeout);
                if state.mark_offline() {
                    info!("{} went offline", actuator.name());
                }
                false
            }
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AuxCommand, AuxDevice, AxisPositions, Pose};
    use crate::hardware::mock::{ActuatorCall, MockActuator};

    fn monitor_for(mock: Arc<MockActuator>) -> ConnectivityMonitor {
        ConnectivityMonitor::new(
            mock,
            SharedActuatorState::default(),
            Duration::from_secs(2),
            Duration::from_millis(1500),
        )
    }

    #[tokio::test]
    async fn test_probe_merges_ground_truth() {
        let mock = Arc::new(MockActuator::new("pi"));
        mock.set_pose(Pose::Dip).await.unwrap();
        mock.set_aux(AuxDevice::Blower, AuxCommand::Start, None).await.unwrap();

        let monitor = monitor_for(mock.clone());
        assert!(!monitor.state().is_online());
        assert!(monitor.probe_once().await);

        let snap = monitor.state().snapshot();
        assert!(snap.online);
        assert_eq!(snap.positions, AxisPositions::new(-200, -200));
        assert!(snap.blower_running);
        assert!(!snap.fogger_running);
        assert_eq!(monitor.stats().probes_ok.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_probe_marks_offline() {
        let mock = Arc::new(MockActuator::new("pi"));
        let monitor = monitor_for(mock.clone());
        assert!(monitor.probe_once().await);

        mock.set_reachable(false);
        assert!(!monitor.probe_once().await);
        assert!(!monitor.state().is_online());
        assert_eq!(monitor.stats().probes_failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_status_counts_as_offline() {
        let mock = Arc::new(MockActuator::new("pi"));
        let monitor = monitor_for(mock.clone());
        assert!(monitor.probe_once().await);

        mock.set_pose(Pose::Dip).await.unwrap();
        mock.set_status("error");
        assert!(!monitor.probe_once().await);

        let snap = monitor.state().snapshot();
        assert!(!snap.online);
        // Nothing from the unhealthy answer is merged
        assert_eq!(snap.positions, AxisPositions::new(400, 400));
        assert_eq!(monitor.stats().probes_failed.load(Ordering::SeqCst), 1);

        mock.set_status("OK");
        assert!(monitor.probe_once().await);
        assert_eq!(monitor.state().positions(), AxisPositions::new(-200, -200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_times_out() {
        let mock = Arc::new(MockActuator::new("pi"));
        let monitor = monitor_for(mock.clone());
        assert!(monitor.probe_once().await);

        mock.set_probe_delay(Some(Duration::from_secs(5)));
        let start = tokio::time::Instant::now();
        assert!(!monitor.probe_once().await);
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
        assert!(!monitor.state().is_online());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_probing_and_stop() {
        let mock = Arc::new(MockActuator::new("pi"));
        let monitor = monitor_for(mock.clone());

        monitor.start();
        assert!(monitor.is_running());

        // Probes at 0s, 2s and 4s
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(mock.count(|c| matches!(c, ActuatorCall::Probe)), 3);
        assert!(monitor.state().is_online());

        monitor.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mock.count(|c| matches!(c, ActuatorCall::Probe)), 3);
        assert!(!monitor.is_running());
    }
}

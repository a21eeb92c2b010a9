//! PauseControl - operator interrupt handling
//!
//! Interrupts arrive from whatever signal source the binary wires up and are
//! folded into a run state held in an atomic, so both tasks can poll it
//! without locking:
//! - one interrupt pauses; another after a quiet window resumes
//! - a burst reaching the stop threshold finishes the current action, then exits
//! - a burst reaching the hard-stop threshold exits immediately

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::domain::models::PauseConfig;

/// Run state derived from operator interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Running = 0,
    Paused = 1,
    StopRequested = 2,
    HardStopRequested = 3,
}

impl RunState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Paused,
            2 => Self::StopRequested,
            3 => Self::HardStopRequested,
            _ => Self::Running,
        }
    }
}

#[derive(Debug, Default)]
struct InterruptWindow {
    count: u32,
    last_interrupt: Option<Instant>,
}

/// Thread-safe pause/stop state machine.
#[derive(Debug)]
pub struct PauseControl {
    state: AtomicU8,
    window: Mutex<InterruptWindow>,
    window_len: Duration,
    stop_threshold: u32,
    hard_stop_threshold: u32,
}

impl PauseControl {
    pub fn new(config: &PauseConfig) -> Self {
        Self {
            state: AtomicU8::new(RunState::Running as u8),
            window: Mutex::new(InterruptWindow::default()),
            window_len: Duration::from_secs(config.window_secs),
            stop_threshold: config.stop_threshold,
            hard_stop_threshold: config.hard_stop_threshold,
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_paused(&self) -> bool {
        self.state() == RunState::Paused
    }

    /// True for both clean and hard stop requests.
    pub fn stop_requested(&self) -> bool {
        matches!(
            self.state(),
            RunState::StopRequested | RunState::HardStopRequested
        )
    }

    pub fn hard_stop_requested(&self) -> bool {
        self.state() == RunState::HardStopRequested
    }

    /// Interrupts counted in the current burst, as seen at `now`.
    pub fn pause_count(&self, now: Instant) -> u32 {
        let window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        match window.last_interrupt {
            Some(last) if now.saturating_duration_since(last) <= self.window_len => window.count,
            _ => 0,
        }
    }

    /// Record one operator interrupt received at `now`.
    pub fn interrupt(&self, now: Instant) -> RunState {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = window
            .last_interrupt
            .is_none_or(|last| now.saturating_duration_since(last) > self.window_len);
        window.last_interrupt = Some(now);
        window.count = if fresh { 1 } else { window.count + 1 };

        let current = self.state();
        let next = if window.count >= self.hard_stop_threshold {
            RunState::HardStopRequested
        } else if current == RunState::HardStopRequested {
            current
        } else if window.count >= self.stop_threshold {
            RunState::StopRequested
        } else if current == RunState::StopRequested {
            current
        } else if fresh && current == RunState::Paused {
            RunState::Running
        } else {
            RunState::Paused
        };
        self.state.store(next as u8, Ordering::SeqCst);

        match next {
            RunState::Paused => info!(
                pause_count = window.count,
                "Paused; interrupt again after {}s to resume, {} times quickly to stop",
                self.window_len.as_secs(),
                self.stop_threshold
            ),
            RunState::Running => info!("Resuming"),
            RunState::StopRequested => {
                warn!(pause_count = window.count, "Stop requested; finishing current action");
            }
            RunState::HardStopRequested => warn!(pause_count = window.count, "Hard stop requested"),
        }
        next
    }

    /// Request a clean stop from inside the run (bounds reached).
    pub fn request_stop(&self) {
        let _ = self.state.compare_exchange(
            RunState::Running as u8,
            RunState::StopRequested as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.state.compare_exchange(
            RunState::Paused as u8,
            RunState::StopRequested as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control() -> PauseControl {
        PauseControl::new(&PauseConfig::default())
    }

    #[test]
    fn test_three_quick_interrupts_request_stop() {
        let pause = control();
        let t0 = Instant::now();
        assert_eq!(pause.interrupt(t0), RunState::Paused);
        assert_eq!(pause.interrupt(t0 + Duration::from_secs(1)), RunState::Paused);
        assert_eq!(
            pause.interrupt(t0 + Duration::from_secs(2)),
            RunState::StopRequested
        );
        assert!(pause.stop_requested());
        assert!(!pause.hard_stop_requested());
    }

    #[test]
    fn test_gap_resets_count_without_stop() {
        let pause = control();
        let t0 = Instant::now();
        pause.interrupt(t0);
        pause.interrupt(t0 + Duration::from_secs(1));
        assert_eq!(pause.pause_count(t0 + Duration::from_secs(7)), 0);
        assert!(!pause.stop_requested());
    }

    #[test]
    fn test_interrupt_after_gap_resumes() {
        let pause = control();
        let t0 = Instant::now();
        pause.interrupt(t0);
        assert!(pause.is_paused());
        assert_eq!(
            pause.interrupt(t0 + Duration::from_secs(6)),
            RunState::Running
        );
        assert_eq!(pause.pause_count(t0 + Duration::from_secs(6)), 1);
    }

    #[test]
    fn test_five_quick_interrupts_hard_stop() {
        let pause = control();
        let t0 = Instant::now();
        for i in 0..5 {
            pause.interrupt(t0 + Duration::from_millis(500 * i));
        }
        assert!(pause.hard_stop_requested());
    }

    #[test]
    fn test_stop_request_survives_single_interrupt() {
        let pause = control();
        pause.request_stop();
        let t0 = Instant::now();
        assert_eq!(pause.interrupt(t0), RunState::StopRequested);
    }

    #[test]
    fn test_request_stop_does_not_downgrade_hard_stop() {
        let pause = control();
        let t0 = Instant::now();
        for i in 0..5 {
            pause.interrupt(t0 + Duration::from_millis(100 * i));
        }
        pause.request_stop();
        assert!(pause.hard_stop_requested());
    }
}

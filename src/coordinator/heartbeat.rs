//! One-shot heartbeat timer owned by the coordinator actor.
//!
//! The timer fires once and is re-armed explicitly after each tick, so a slow
//! tick can never overlap the next one. Each arming gets a new generation;
//! a tick whose generation is stale (the timer was disarmed or re-armed in
//! the meantime) is ignored.

use std::time::Duration;

use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::task::JoinHandle;

use super::actor::Command;

/// Timer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartbeatState {
    Idle,
    Armed,
}

#[derive(Debug)]
pub(crate) struct Heartbeat {
    interval: Option<Duration>,
    state: HeartbeatState,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// `None` disables the heartbeat entirely.
    pub(crate) fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            state: HeartbeatState::Idle,
            generation: 0,
            timer: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> HeartbeatState {
        self.state
    }

    /// Schedule one tick unless already armed.
    pub(crate) fn arm(&mut self, commands: &WeakUnboundedSender<Command>) {
        let Some(interval) = self.interval else {
            return;
        };
        if self.state == HeartbeatState::Armed {
            return;
        }

        self.generation = self.generation.wrapping_add(1);
        self.state = HeartbeatState::Armed;

        let generation = self.generation;
        let commands = commands.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(tx) = commands.upgrade() {
                let _ = tx.send(Command::HeartbeatTick { generation });
            }
        }));
    }

    /// Cancel a pending tick.
    pub(crate) fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation = self.generation.wrapping_add(1);
        self.state = HeartbeatState::Idle;
    }

    /// Accept a tick: true when it belongs to the current arming. The timer
    /// goes back to idle either way the tick is current.
    pub(crate) fn accept_tick(&mut self, generation: u64) -> bool {
        if self.state != HeartbeatState::Armed || generation != self.generation {
            return false;
        }
        self.timer = None;
        self.state = HeartbeatState::Idle;
        true
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

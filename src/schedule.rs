//! Fixed-period timers with an explicit stop handle.
//!
//! Every tick runs as its own task, so a slow tick never delays the next one
//! and ticks may overlap. In-flight ticks are aborted when the timer stops.

use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Fired by the interval.
    Scheduled,
    /// Operator asked for it.
    Manual,
    /// Another subsystem asked for fresh data.
    Notified,
}

/// Cloneable way to request an out-of-band tick on a running timer.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    tx: mpsc::UnboundedSender<Tick>,
}

impl TriggerHandle {
    /// Returns `false` once the timer has been stopped.
    pub fn fire(&self, tick: Tick) -> bool {
        self.tx.send(tick).is_ok()
    }

    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<Tick>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

pub struct ScheduledTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    trigger: TriggerHandle,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Starts the timer. The first scheduled tick fires immediately.
    pub fn start<F, Fut>(name: &'static str, period: Duration, mut on_tick: F) -> Self
    where
        F: FnMut(Tick) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let (tx, mut trigger_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut inflight = JoinSet::new();

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                    _ = ticker.tick() => {
                        inflight.spawn(on_tick(Tick::Scheduled));
                    }
                    Some(tick) = trigger_rx.recv() => {
                        inflight.spawn(on_tick(tick));
                    }
                    Some(_) = inflight.join_next(), if !inflight.is_empty() => {}
                }
            }

            inflight.abort_all();
            while inflight.join_next().await.is_some() {}
            debug!(task = name, "таймер остановлен");
        });

        Self {
            name,
            shutdown,
            trigger: TriggerHandle { tx },
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn trigger(&self) -> TriggerHandle {
        self.trigger.clone()
    }

    /// Signals the timer to stop without waiting for it.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stops the timer and waits until no tick is running anymore.
    pub async fn stop(self) {
        self.cancel();
        let _ = self.handle.await;
    }
}

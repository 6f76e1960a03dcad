//! Transaction timer service.
//!
//! Production code runs against the tokio monotonic clock; tests run
//! with `#[tokio::test(start_paused = true)]` and advance the clock
//! explicitly. Two timers armed for the same instant fire in arming
//! order. A stopped timer never fires; stopping is idempotent.
//!
//! The retransmission select-loops of the transaction FSMs pin their
//! own `sleep` futures; this module provides the cancellable one-shot
//! used for deferred work (termination delays, the automatic 100
//! Trying) and the per-timer book-keeping that snapshots are built
//! from.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, Sleep};

/// The named timers of RFC 3261 section 17 and RFC 6026.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerId {
    /// INVITE client retransmit interval.
    A,
    /// INVITE client transaction timeout.
    B,
    /// INVITE client wait for response retransmissions.
    D,
    /// Non-INVITE client retransmit interval.
    E,
    /// Non-INVITE client transaction timeout.
    F,
    /// INVITE server response retransmit interval.
    G,
    /// INVITE server wait for ACK.
    H,
    /// INVITE server wait for ACK retransmissions.
    I,
    /// Non-INVITE server linger for request retransmissions.
    J,
    /// Non-INVITE client wait for response retransmissions.
    K,
    /// INVITE server linger in Accepted (RFC 6026).
    L,
    /// INVITE client linger in Accepted (RFC 6026).
    M,
    /// Deferred automatic 100 Trying on an INVITE server.
    Trying100,
}

/// When a timer was armed and how much total budget it was given.
#[derive(Debug, Clone, Copy)]
pub struct Arming {
    armed_at: Instant,
    budget: Duration,
    // Budget already spent before arming, carried over from a restored
    // snapshot.
    prespent: Duration,
}

impl Arming {
    /// Arms now with the given budget.
    pub fn new(budget: Duration) -> Self {
        Self {
            armed_at: Instant::now(),
            budget,
            prespent: Duration::ZERO,
        }
    }

    /// Arms now with the given budget, `elapsed` of it already spent.
    /// Used when restoring a snapshot.
    pub fn with_elapsed(budget: Duration, elapsed: Duration) -> Self {
        Self {
            armed_at: Instant::now(),
            budget,
            prespent: elapsed,
        }
    }

    /// Time spent against the budget, including time carried over from
    /// a snapshot.
    pub fn elapsed(&self) -> Duration {
        self.prespent + self.armed_at.elapsed()
    }

    /// The total budget.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Budget not yet spent; zero when exhausted.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.elapsed())
    }
}

/// The armed timers of one transaction.
///
/// The table mirrors the sleeps the transaction's event loop is
/// actually waiting on; snapshots read `(elapsed, budget)` pairs from
/// here and restore recomputes the remaining sleep from them.
#[derive(Debug, Default)]
pub struct TimerTable {
    entries: Vec<(TimerId, Arming)>,
}

impl TimerTable {
    /// Arms (or re-arms) a named timer with a full budget.
    pub fn arm(&mut self, id: TimerId, budget: Duration) {
        self.disarm(id);
        self.entries.push((id, Arming::new(budget)));
    }

    /// Arms a named timer with part of its budget already spent.
    pub fn arm_with_elapsed(&mut self, id: TimerId, budget: Duration, elapsed: Duration) {
        self.disarm(id);
        self.entries.push((id, Arming::with_elapsed(budget, elapsed)));
    }

    /// Disarms a named timer. Disarming an unarmed timer is a no-op.
    pub fn disarm(&mut self, id: TimerId) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }

    /// The arming record for a timer, if armed.
    pub fn get(&self, id: TimerId) -> Option<&Arming> {
        self.entries
            .iter()
            .find_map(|(entry_id, arming)| (*entry_id == id).then_some(arming))
    }

    /// All armed timers in arming order.
    pub fn iter(&self) -> impl Iterator<Item = (TimerId, &Arming)> {
        self.entries.iter().map(|(id, arming)| (*id, arming))
    }
}

/// Returns a future that completes after `duration` on the service
/// clock.
pub fn after(duration: Duration) -> Sleep {
    time::sleep(duration)
}

enum TimerCmd {
    Reset(Duration),
    Stop,
}

/// A cancellable one-shot timer.
///
/// Fires at most once per arming; `reset` re-arms an expired or
/// pending timer, `stop` is idempotent and a stopped timer never
/// fires.
pub struct Timer {
    cmd_tx: mpsc::UnboundedSender<TimerCmd>,
}

impl Timer {
    /// Arms a timer for `duration`. Expiry is delivered once on the
    /// returned channel.
    pub fn new(duration: Duration) -> (Timer, oneshot::Receiver<()>) {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        let (fire_tx, fire_rx) = oneshot::channel();

        tokio::spawn(async move {
            let sleep = time::sleep(duration);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    _ = &mut sleep => {
                        let _ = fire_tx.send(());
                        break;
                    }
                    cmd = cmd_rx.recv() => match cmd {
                        Some(TimerCmd::Reset(duration)) => {
                            sleep.as_mut().reset(Instant::now() + duration);
                        }
                        Some(TimerCmd::Stop) | None => break,
                    }
                }
            }
        });

        (Timer { cmd_tx }, fire_rx)
    }

    /// Re-arms the timer for `duration` from now. A reset after expiry
    /// or stop has no effect.
    pub fn reset(&self, duration: Duration) {
        let _ = self.cmd_tx.send(TimerCmd::Reset(duration));
    }

    /// Stops the timer. Idempotent.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(TimerCmd::Stop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    #[tokio::test(start_paused = true)]
    async fn test_fires_once() {
        let (_timer, fired) = Timer::new(Duration::from_millis(200));

        time::sleep(Duration::from_millis(201)).await;

        fired.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_fire() {
        let (timer, fired) = Timer::new(Duration::from_millis(200));

        timer.stop();
        timer.stop();
        time::sleep(Duration::from_millis(300)).await;

        assert!(fired.await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_extends() {
        let (timer, mut fired) = Timer::new(Duration::from_millis(200));

        time::sleep(Duration::from_millis(100)).await;
        timer.reset(Duration::from_millis(500));
        time::sleep(Duration::from_millis(300)).await;

        assert!(fired.try_recv().is_err());

        time::sleep(Duration::from_millis(201)).await;
        fired.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_instant_fifo() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let (a_order, b_order) = (order.clone(), order.clone());
        let (_a, a_fired) = Timer::new(Duration::from_millis(100));
        let (_b, b_fired) = Timer::new(Duration::from_millis(100));

        let a_task = tokio::spawn(async move {
            if a_fired.await.is_ok() {
                a_order.lock().unwrap().push("a");
            }
        });
        let b_task = tokio::spawn(async move {
            if b_fired.await.is_ok() {
                b_order.lock().unwrap().push("b");
            }
        });

        time::sleep(Duration::from_millis(101)).await;
        a_task.await.unwrap();
        b_task.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_table_arithmetic() {
        let mut table = TimerTable::default();

        table.arm(TimerId::B, Duration::from_secs(32));
        time::sleep(Duration::from_millis(250)).await;

        let arming = table.get(TimerId::B).unwrap();
        assert_eq!(arming.elapsed(), Duration::from_millis(250));
        assert_eq!(arming.remaining(), Duration::from_millis(31_750));

        table.disarm(TimerId::B);
        assert!(table.get(TimerId::B).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget() {
        let arming = Arming::with_elapsed(Duration::from_secs(1), Duration::from_secs(2));

        assert_eq!(arming.remaining(), Duration::ZERO);
    }
}

//! Single-flight trade gate. The wallet may have at most one transaction in
//! flight; every submission path goes through this idle/trading state
//! machine. Buys take the non-blocking path and fail fast when busy; the
//! sell worker parks on the notifier and is woken the moment the previous
//! holder releases, instead of polling on a fixed delay.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

pub struct TradeGate {
    trading: AtomicBool,
    released: Notify,
}

impl TradeGate {
    pub fn new() -> Self {
        Self {
            trading: AtomicBool::new(false),
            released: Notify::new(),
        }
    }

    /// Move idle -> trading if possible. Returns the guard that owns the
    /// exclusive right to submit; None means another trade is in flight.
    pub fn try_acquire(&self) -> Option<GateGuard<'_>> {
        self.trading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
            .then_some(GateGuard { gate: self })
    }

    /// Wait until the gate is free, then take it. The notified future is
    /// registered before the state check so a release between the check and
    /// the await cannot be missed.
    pub async fn acquire(&self) -> GateGuard<'_> {
        loop {
            let released = self.released.notified();
            if let Some(guard) = self.try_acquire() {
                return guard;
            }
            released.await;
        }
    }

    pub fn is_busy(&self) -> bool {
        self.trading.load(Ordering::Acquire)
    }
}

impl Default for TradeGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the gate on drop, on every exit path.
pub struct GateGuard<'a> {
    gate: &'a TradeGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.trading.store(false, Ordering::Release);
        self.gate.released.notify_waiters();
    }
}

//! Transport-aware timer values (RFC 3261 §17, Table 4) and the one-shot
//! timer service the transaction manager runs them on.
//!
//! Reliable transports zero the wait timers:
//!
//! | Timer | UDP        | TCP/TLS |
//! |-------|------------|---------|
//! | A/E/G | T1 doubling| none    |
//! | B/F/H | 64*T1      | 64*T1   |
//! | D     | 32s        | 0       |
//! | I/K   | T4         | 0       |
//! | J     | 64*T1      | 0       |
//!
//! ```rust
//! use sip_transaction::timers::TransportAwareTimers;
//! use sip_transaction::TransactionTimer;
//! use sip_transport::TransportKind;
//!
//! let timers = TransportAwareTimers::new(TransportKind::Tcp);
//! assert_eq!(timers.duration(TransactionTimer::K), std::time::Duration::ZERO);
//! assert_eq!(timers.duration(TransactionTimer::F), std::time::Duration::from_secs(32));
//! assert!(!timers.should_retransmit());
//! ```

use std::future::Future;
use std::time::Duration;

use sip_transport::TransportKind;
use tokio::sync::oneshot;

use crate::TransactionTimer;

/// RFC 3261 base timer values (Table 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerDefaults {
    /// RTT estimate - default 500ms
    pub t1: Duration,
    /// Maximum retransmit interval - default 4s
    pub t2: Duration,
    /// Maximum time a message remains in the network - default 5s
    pub t4: Duration,
}

impl Default for TimerDefaults {
    fn default() -> Self {
        Self {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
        }
    }
}

/// Timer value calculator for one transaction's transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportAwareTimers {
    transport: TransportKind,
    defaults: TimerDefaults,
}

impl TransportAwareTimers {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            defaults: TimerDefaults::default(),
        }
    }

    pub fn with_defaults(transport: TransportKind, defaults: TimerDefaults) -> Self {
        Self {
            transport,
            defaults,
        }
    }

    /// Returns the initial duration for a given timer.
    ///
    /// ```
    /// use sip_transaction::timers::TransportAwareTimers;
    /// use sip_transaction::TransactionTimer;
    /// use sip_transport::TransportKind;
    /// use std::time::Duration;
    ///
    /// let udp = TransportAwareTimers::new(TransportKind::Udp);
    /// assert_eq!(udp.duration(TransactionTimer::K), Duration::from_secs(5));
    /// assert_eq!(udp.duration(TransactionTimer::D), Duration::from_secs(32));
    /// ```
    pub fn duration(&self, timer: TransactionTimer) -> Duration {
        let reliable = self.transport.is_reliable();
        let d = &self.defaults;
        match timer {
            TransactionTimer::A | TransactionTimer::E | TransactionTimer::G => {
                if reliable {
                    Duration::ZERO
                } else {
                    d.t1
                }
            }
            TransactionTimer::B | TransactionTimer::F | TransactionTimer::H => {
                d.t1.saturating_mul(64)
            }
            TransactionTimer::D => {
                if reliable {
                    Duration::ZERO
                } else {
                    Duration::from_secs(32)
                }
            }
            TransactionTimer::I | TransactionTimer::K => {
                if reliable {
                    Duration::ZERO
                } else {
                    d.t4
                }
            }
            TransactionTimer::J => {
                if reliable {
                    Duration::ZERO
                } else {
                    d.t1.saturating_mul(64)
                }
            }
        }
    }

    pub fn t1(&self) -> Duration {
        self.defaults.t1
    }

    pub fn t2(&self) -> Duration {
        self.defaults.t2
    }

    /// Retransmissions are only necessary for unreliable transports.
    pub fn should_retransmit(&self) -> bool {
        !self.transport.is_reliable()
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }
}

/// Handle to a pending one-shot timer. Dropping it cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    cancel: Option<oneshot::Sender<()>>,
}

impl TimerHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// True until the timer fired or was cancelled.
    pub fn is_pending(&self) -> bool {
        self.cancel.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Runs `task` after `delay` unless the returned handle is cancelled or
/// dropped first.
pub fn schedule<F>(delay: Duration, task: F) -> TimerHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => task.await,
            _ = &mut cancel_rx => {}
        }
    });
    TimerHandle {
        cancel: Some(cancel_tx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn wait_timers_zero_for_reliable() {
        for kind in [TransportKind::Tcp, TransportKind::Tls] {
            let timers = TransportAwareTimers::new(kind);
            for timer in [
                TransactionTimer::A,
                TransactionTimer::D,
                TransactionTimer::E,
                TransactionTimer::G,
                TransactionTimer::I,
                TransactionTimer::J,
                TransactionTimer::K,
            ] {
                assert_eq!(timers.duration(timer), Duration::ZERO, "{timer:?} {kind:?}");
            }
        }
    }

    #[test]
    fn timeouts_are_64_t1_everywhere() {
        for kind in [TransportKind::Udp, TransportKind::Tcp] {
            let timers = TransportAwareTimers::new(kind);
            for timer in [TransactionTimer::B, TransactionTimer::F, TransactionTimer::H] {
                assert_eq!(timers.duration(timer), Duration::from_secs(32));
            }
        }
    }

    #[test]
    fn udp_values() {
        let udp = TransportAwareTimers::new(TransportKind::Udp);
        assert_eq!(udp.duration(TransactionTimer::E), Duration::from_millis(500));
        assert_eq!(udp.duration(TransactionTimer::J), Duration::from_secs(32));
        assert_eq!(udp.duration(TransactionTimer::I), Duration::from_secs(5));
        assert!(udp.should_retransmit());
    }

    #[test]
    fn custom_timer_defaults() {
        let custom = TimerDefaults {
            t1: Duration::from_secs(1),
            t2: Duration::from_secs(8),
            t4: Duration::from_secs(10),
        };
        let timers = TransportAwareTimers::with_defaults(TransportKind::Udp, custom);
        assert_eq!(timers.t1(), Duration::from_secs(1));
        assert_eq!(timers.duration(TransactionTimer::K), Duration::from_secs(10));
        assert_eq!(timers.duration(TransactionTimer::F), Duration::from_secs(64));
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_task_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = schedule(Duration::from_secs(3), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(2999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(handle.is_pending());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handle = schedule(Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(handle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_cancel() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        schedule(Duration::from_secs(1), async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}

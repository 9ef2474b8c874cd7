use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

/// User requests forwarded to the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    TogglePause,
    /// Finish the current batch, then stop.
    Graceful,
    Immediate,
}

/// Counts CTRL+C presses: the first stops gracefully, any later one exits.
#[derive(Debug)]
pub struct InterruptCounter {
    presses: AtomicU8,
}

impl InterruptCounter {
    pub fn new() -> Self {
        Self {
            presses: AtomicU8::new(0),
        }
    }

    pub fn interrupt(&self) -> ControlEvent {
        let n = self.presses.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if n == 1 {
            ControlEvent::Graceful
        } else {
            ControlEvent::Immediate
        }
    }
}

pub fn spawn_ctrl_c_handler(
    interrupts: Arc<InterruptCounter>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let ev = interrupts.interrupt();
            let _ = control_tx.send(ev);
            if ev == ControlEvent::Immediate {
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_interrupt_is_immediate() {
        let interrupts = InterruptCounter::new();
        assert_eq!(interrupts.interrupt(), ControlEvent::Graceful);
        assert_eq!(interrupts.interrupt(), ControlEvent::Immediate);
        assert_eq!(interrupts.interrupt(), ControlEvent::Immediate);
    }
}

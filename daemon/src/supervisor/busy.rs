use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Single-flight flag for administrative operations.
///
/// Never queues: a second caller is turned away while a [`BusyGuard`] lives.
#[derive(Debug, Clone, Default)]
pub struct BusyGate {
    flag: Arc<AtomicBool>,
}

impl BusyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<BusyGuard> {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard {
                flag: self.flag.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Clears the gate when dropped, whichever way the operation ends.
#[derive(Debug)]
pub struct BusyGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

//! Writer serialization and spin backoff.

use std::thread;

use parking_lot::{Mutex, MutexGuard};

/// Pure CPU hints before any yield
const SPIN_BEFORE_YIELD: i32 = 128;

/// Optimistic acquisition attempts before the elided lock blocks.
const ELISION_ATTEMPTS: u32 = 16;

/// How writers serialize with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterMode {
    /// Caller guarantees a single writer; no lock is taken.
    Single,
    /// Writers block on the table-wide lock.
    Locked,
    /// Writers first try the lock optimistically with spinning, then block.
    Elided,
}

/// Table-wide writer lock, engaged only in multi-writer mode.
pub(crate) struct WriterLock {
    lock: Mutex<()>,
    mode: WriterMode,
}

impl WriterLock {
    pub(crate) fn new(multi_writer: bool, elide: bool) -> Self {
        let mode = match (multi_writer, elide) {
            (false, _) => WriterMode::Single,
            (true, false) => WriterMode::Locked,
            (true, true) => WriterMode::Elided,
        };
        Self {
            lock: Mutex::new(()),
            mode,
        }
    }

    /// Enter the writer critical section. `None` in single-writer mode.
    #[inline(always)]
    pub(crate) fn acquire(&self) -> Option<MutexGuard<'_, ()>> {
        match self.mode {
            WriterMode::Single => None,
            WriterMode::Locked => Some(self.lock.lock()),
            WriterMode::Elided => {
                let mut spins = 0;
                for _ in 0..ELISION_ATTEMPTS {
                    if let Some(guard) = self.lock.try_lock() {
                        return Some(guard);
                    }
                    if !try_spin(&mut spins) {
                        break;
                    }
                }
                Some(self.lock.lock())
            }
        }
    }
}

#[inline(always)]
fn try_spin(spins: &mut i32) -> bool {
    if *spins < SPIN_BEFORE_YIELD {
        *spins += *spins + 1;
        std::hint::spin_loop();
        true
    } else {
        false
    }
}

/// Spin with exponential growth, then yield the thread.
#[inline(always)]
pub(crate) fn delay(spins: &mut i32) {
    if !try_spin(spins) {
        *spins = 0;
        thread::yield_now();
    }
}

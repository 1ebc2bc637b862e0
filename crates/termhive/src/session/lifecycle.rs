//! Teardown state machine shared by explicit kills and observed exits.

use std::sync::atomic::{AtomicU8, Ordering};

/// Teardown phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Running and routable.
    Live = 0,
    /// One teardown path has claimed the session.
    Closing = 1,
    /// Bookkeeping removed.
    Closed = 2,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Live,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Atomic `Live → Closing → Closed` cell.
///
/// Only the first caller of [`LifecycleCell::begin_close`] gets `true`; that
/// caller performs teardown and then calls [`LifecycleCell::finish_close`].
#[derive(Debug)]
pub struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(Lifecycle::Live as u8))
    }

    /// Current phase.
    pub fn get(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn is_live(&self) -> bool {
        self.get() == Lifecycle::Live
    }

    /// Claims teardown. Returns false if another path already did.
    pub fn begin_close(&self) -> bool {
        self.0
            .compare_exchange(
                Lifecycle::Live as u8,
                Lifecycle::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Marks teardown complete.
    pub fn finish_close(&self) {
        self.0.store(Lifecycle::Closed as u8, Ordering::SeqCst);
    }
}

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

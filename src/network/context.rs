//! Process-wide network initialization
//!
//! Hosts may only be created while at least one [`NetworkContext`] is
//! alive. The first guard initializes the layer and dropping the last
//! one deinitializes it.

use parking_lot::Mutex;

use crate::error::NetworkError;

static LIVE_CONTEXTS: Mutex<usize> = parking_lot::const_mutex(0);

/// Guard bracketing all session usage
#[derive(Debug)]
pub struct NetworkContext {
    _private: (),
}

/// Initialize the network layer, returning a guard
pub fn initialize() -> NetworkContext {
    NetworkContext::acquire()
}

/// Whether any [`NetworkContext`] is alive
pub fn is_initialized() -> bool {
    *LIVE_CONTEXTS.lock() > 0
}

/// Fail with [`NetworkError::NotInitialized`] outside a context
pub(crate) fn ensure_initialized() -> Result<(), NetworkError> {
    if is_initialized() {
        Ok(())
    } else {
        Err(NetworkError::NotInitialized)
    }
}

impl NetworkContext {
    fn acquire() -> Self {
        let mut live = LIVE_CONTEXTS.lock();
        if *live == 0 {
            tracing::debug!("Network layer initialized");
        }
        *live += 1;
        Self { _private: () }
    }
}

impl Clone for NetworkContext {
    fn clone(&self) -> Self {
        Self::acquire()
    }
}

impl Drop for NetworkContext {
    fn drop(&mut self) {
        let mut live = LIVE_CONTEXTS.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            tracing::debug!("Network layer deinitialized");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_keeps_layer_initialized() {
        let first = initialize();
        let second = first.clone();
        assert!(is_initialized());

        drop(first);
        assert!(is_initialized());
        assert!(ensure_initialized().is_ok());

        // Other tests may hold guards concurrently, so only the positive
        // direction is asserted here.
        drop(second);
    }
}

//! Progress reporting and cooperative cancellation

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Observer of long running operations
///
/// Operations call [`ProgressListener::is_canceled`] between atomic
/// sub-steps and stop with [`crate::Error::Canceled`] when it returns true.
pub trait ProgressListener: Send + Sync {
    fn started(&self) {}

    fn set_description(&self, _description: &str) {}

    /// Progress in percent, or a count for unbounded work
    fn set_progress(&self, _progress: f32) {}

    fn progress(&self) -> f32 {
        0.0
    }

    fn is_canceled(&self) -> bool;

    fn cancel(&self);

    fn complete(&self) {}
}

/// Listener that records progress and cancellation in atomics
#[derive(Debug, Default)]
pub struct DefaultProgressListener {
    canceled: AtomicBool,
    completed: AtomicBool,
    progress: AtomicU32,
    description: Mutex<Option<String>>,
}

impl DefaultProgressListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn description(&self) -> Option<String> {
        self.description.lock().ok().and_then(|d| d.clone())
    }
}

impl ProgressListener for DefaultProgressListener {
    fn started(&self) {
        self.completed.store(false, Ordering::Release);
        self.progress.store(0f32.to_bits(), Ordering::Release);
    }

    fn set_description(&self, description: &str) {
        if let Ok(mut d) = self.description.lock() {
            *d = Some(description.to_string());
        }
    }

    fn set_progress(&self, progress: f32) {
        self.progress.store(progress.to_bits(), Ordering::Release);
    }

    fn progress(&self) -> f32 {
        f32::from_bits(self.progress.load(Ordering::Acquire))
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listener() {
        let listener = DefaultProgressListener::new();
        listener.started();
        listener.set_description("importing");
        listener.set_progress(42.5);
        assert_eq!(listener.progress(), 42.5);
        assert_eq!(listener.description().as_deref(), Some("importing"));
        assert!(!listener.is_canceled());
        listener.cancel();
        assert!(listener.is_canceled());
        listener.complete();
        assert!(listener.is_completed());
    }
}

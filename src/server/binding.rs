//! The at-most-one association between the server plane and an agent.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Handle to one bound agent connection.
#[derive(Debug, Clone)]
pub struct BoundBrowser {
    /// Monotonic connection number. Pending entries record it so a
    /// replacement only fails requests issued to the displaced connection.
    pub generation: u64,

    /// Serialized outbound frames; the connection task owns the
    /// receiving end.
    pub frames: mpsc::Sender<String>,

    /// Cancelled to tear the connection down when it is displaced.
    pub cancel: CancellationToken,
}

/// Process-scoped holder for the single agent binding.
///
/// Binding a new connection replaces the previous one without grace;
/// releasing only succeeds for the generation that still owns the slot.
#[derive(Debug, Default)]
pub struct BrowserBinding {
    current: Mutex<Option<BoundBrowser>>,
    connected: AtomicBool,
    generations: AtomicU64,
}

impl BrowserBinding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the generation number for a connection about to bind.
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Install a new binding, returning the displaced one if any.
    pub fn bind(&self, browser: BoundBrowser) -> Option<BoundBrowser> {
        let mut current = self.current.lock().expect("binding lock poisoned");
        let previous = current.replace(browser);
        self.connected.store(true, Ordering::Release);
        previous
    }

    /// Clear the binding if `generation` still owns it. Returns `false`
    /// when a newer connection has already taken over.
    pub fn release(&self, generation: u64) -> bool {
        let mut current = self.current.lock().expect("binding lock poisoned");
        match current.as_ref() {
            Some(bound) if bound.generation == generation => {
                *current = None;
                self.connected.store(false, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Generation and outbound sender of the current binding.
    pub fn bound(&self) -> Option<(u64, mpsc::Sender<String>)> {
        let current = self.current.lock().expect("binding lock poisoned");
        current
            .as_ref()
            .map(|bound| (bound.generation, bound.frames.clone()))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser(binding: &BrowserBinding) -> BoundBrowser {
        let (frames, _rx) = mpsc::channel(1);
        BoundBrowser {
            generation: binding.next_generation(),
            frames,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_bind_replaces_previous() {
        let binding = BrowserBinding::new();
        assert!(!binding.is_connected());
        assert!(binding.bound().is_none());

        let first = browser(&binding);
        assert!(binding.bind(first).is_none());
        assert!(binding.is_connected());

        let second = browser(&binding);
        let displaced = binding.bind(second.clone()).unwrap();
        assert_eq!(displaced.generation, 1);
        assert_eq!(binding.bound().unwrap().0, second.generation);
    }

    #[test]
    fn test_release_only_for_current_generation() {
        let binding = BrowserBinding::new();
        let first = browser(&binding);
        let second = browser(&binding);

        binding.bind(first);
        binding.bind(second);

        // The displaced connection cannot clear the new binding.
        assert!(!binding.release(1));
        assert!(binding.is_connected());

        assert!(binding.release(2));
        assert!(!binding.is_connected());
        assert!(binding.bound().is_none());

        // Releasing twice is harmless.
        assert!(!binding.release(2));
    }
}

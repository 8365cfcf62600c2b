//! Deferred install prompt.
//!
//! Hosts that get an "app can be installed" signal before the user asks for
//! it park the prompt here and show it later.

use chrono::{DateTime, Utc};
use tracing::debug;

/// A captured install prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredPrompt {
    /// Platforms the host reported as installable
    pub platforms: Vec<String>,
    pub captured_at: DateTime<Utc>,
}

impl DeferredPrompt {
    pub fn new(platforms: Vec<String>) -> Self {
        Self {
            platforms,
            captured_at: Utc::now(),
        }
    }
}

/// Outcome of showing a prompt to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptOutcome {
    Accepted,
    Dismissed,
}

/// Single-slot holder for the deferred prompt.
#[derive(Debug, Default)]
pub struct InstallPrompt {
    slot: Option<DeferredPrompt>,
    installed: bool,
}

impl InstallPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a prompt, replacing any earlier one. Ignored once installed.
    pub fn capture(&mut self, prompt: DeferredPrompt) {
        if self.installed {
            debug!("App already installed, ignoring install prompt");
            return;
        }
        self.slot = Some(prompt);
    }

    pub fn is_available(&self) -> bool {
        self.slot.is_some()
    }

    /// Take the prompt to show it. The slot is empty afterwards: a prompt can
    /// only be shown once.
    pub fn take(&mut self) -> Option<DeferredPrompt> {
        self.slot.take()
    }

    /// Record what the user chose for a prompt taken with [`take`](Self::take).
    pub fn resolve(&mut self, outcome: PromptOutcome) {
        debug!(?outcome, "Install prompt resolved");
        if outcome == PromptOutcome::Accepted {
            self.installed = true;
        }
    }

    /// Drop the pending prompt without showing it.
    pub fn dismiss(&mut self) {
        self.slot = None;
    }

    /// The host reported the app as installed.
    pub fn mark_installed(&mut self) {
        self.installed = true;
        self.slot = None;
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt() -> DeferredPrompt {
        DeferredPrompt::new(vec!["web".to_string()])
    }

    #[test]
    fn test_take_empties_slot() {
        let mut coordinator = InstallPrompt::new();
        assert!(!coordinator.is_available());

        coordinator.capture(prompt());
        assert!(coordinator.is_available());
        assert!(coordinator.take().is_some());
        assert!(coordinator.take().is_none());
    }

    #[test]
    fn test_dismiss() {
        let mut coordinator = InstallPrompt::new();
        coordinator.capture(prompt());
        coordinator.dismiss();
        assert!(!coordinator.is_available());
    }

    #[test]
    fn test_capture_ignored_after_install() {
        let mut coordinator = InstallPrompt::new();
        coordinator.capture(prompt());
        let shown = coordinator.take();
        assert!(shown.is_some());
        coordinator.resolve(PromptOutcome::Accepted);

        coordinator.capture(prompt());
        assert!(!coordinator.is_available());
        assert!(coordinator.is_installed());
    }
}

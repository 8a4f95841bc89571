//! Detached authorization windows.
//!
//! The broker only needs two things from a window it opened: whether it has
//! been closed, and a way to close it. [`SystemBrowser`] is the native host:
//! it opens the consent page in the user's browser. The tab itself cannot be
//! observed, so "closed" is signalled explicitly through [`SystemBrowser::close_current`]
//! (the CLI wires Ctrl-C to it).

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

/// Requested size of the authorization window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopupFeatures {
    pub width: u32,
    pub height: u32,
}

impl Default for PopupFeatures {
    fn default() -> Self {
        Self {
            width: 600,
            height: 700,
        }
    }
}

impl From<stowage_config::PopupConfig> for PopupFeatures {
    fn from(c: stowage_config::PopupConfig) -> Self {
        Self {
            width: c.width,
            height: c.height,
        }
    }
}

/// A window opened by the broker.
pub trait PopupWindow: Send + Sync {
    fn is_closed(&self) -> bool;
    /// Close the window. Closing an already closed window is a no-op.
    fn close(&self);
}

/// Opens authorization windows.
pub trait PopupOpener: Send + Sync {
    /// Open `url` in a detached window. `None` means the window was refused
    /// (popup blocked).
    fn open(&self, url: &str, features: PopupFeatures) -> Option<Arc<dyn PopupWindow>>;
}

/// A browser tab opened by [`SystemBrowser`].
#[derive(Debug, Default)]
pub struct BrowserTab {
    closed: AtomicBool,
}

impl PopupWindow for BrowserTab {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        // the tab belongs to the user's browser; we can only stop watching it
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Opens consent pages in the system browser.
#[derive(Default)]
pub struct SystemBrowser {
    current: Mutex<Option<Arc<BrowserTab>>>,
}

impl SystemBrowser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the most recently opened tab as closed by the user.
    pub fn close_current(&self) {
        if let Some(tab) = self.current.lock().unwrap().as_ref() {
            tab.close();
        }
    }
}

impl PopupOpener for SystemBrowser {
    fn open(&self, url: &str, features: PopupFeatures) -> Option<Arc<dyn PopupWindow>> {
        tracing::debug!(width = features.width, height = features.height, "opening browser");
        if let Err(e) = open::that(url) {
            tracing::warn!(error = %e, "failed to open browser");
            return None;
        }
        let tab = Arc::new(BrowserTab::default());
        *self.current.lock().unwrap() = Some(Arc::clone(&tab));
        Some(tab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_tab_close_idempotent() {
        let tab = BrowserTab::default();
        assert!(!tab.is_closed());
        tab.close();
        tab.close();
        assert!(tab.is_closed());
    }

    #[test]
    fn test_close_current_without_tab() {
        let browser = SystemBrowser::new();
        browser.close_current();
    }

    #[test]
    fn test_features_from_config() {
        let f = PopupFeatures::from(stowage_config::PopupConfig {
            width: 500,
            height: 640,
        });
        assert_eq!(f, PopupFeatures { width: 500, height: 640 });
        assert_eq!(PopupFeatures::default().width, 600);
    }
}

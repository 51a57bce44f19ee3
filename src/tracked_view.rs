use std::sync::{Arc, Weak};

use crate::tracker::Tracker;

/// Sends a screen view each time the view it belongs to appears.
///
/// Holds the tracker weakly so a view outliving its tracker never keeps the
/// tracker alive.
#[derive(Debug, Clone, Default)]
pub struct TrackedView {
    tracker: Weak<Tracker>,
    screen_name: Option<String>,
}

impl TrackedView {
    pub fn new(tracker: &Arc<Tracker>, screen_name: impl Into<String>) -> Self {
        Self {
            tracker: Arc::downgrade(tracker),
            screen_name: Some(screen_name.into()),
        }
    }

    pub fn set_tracker(&mut self, tracker: Option<&Arc<Tracker>>) {
        self.tracker = tracker.map(Arc::downgrade).unwrap_or_default();
    }

    pub fn set_screen_name(&mut self, screen_name: Option<String>) {
        self.screen_name = screen_name;
    }

    pub fn screen_name(&self) -> Option<&str> {
        self.screen_name.as_deref()
    }

    /// Returns whether a view hit was queued. Nothing is sent without a
    /// live tracker and a screen name.
    pub fn on_appear(&self) -> bool {
        match (self.tracker.upgrade(), self.screen_name.as_deref()) {
            (Some(tracker), Some(screen)) if !screen.is_empty() => tracker.send_view(Some(screen)),
            _ => false,
        }
    }
}

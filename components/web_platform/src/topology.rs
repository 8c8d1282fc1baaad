//! Window topology queries
//!
//! Every query is answered from the point of view of one window and never
//! fails: a window that refuses access degrades to the safe answer (closed,
//! not same domain, no relatives).

use crate::browser::{Browser, WindowId, WindowProxy};
use crate::same_origin::OPAQUE_ORIGIN;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// How a window was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    /// Opened by another window
    Popup,
    /// Embedded in a parent document
    Iframe,
    /// A top-level page nobody opened
    Fullpage,
}

#[derive(Default)]
struct SameDomainCache {
    entries: HashMap<WindowId, bool>,
    clear_scheduled: bool,
}

/// Topology queries made by code running in one window.
#[derive(Clone)]
pub struct Topology {
    browser: Arc<Browser>,
    window: WindowId,
    same_domain: Arc<Mutex<SameDomainCache>>,
}

impl std::fmt::Debug for Topology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topology").field("window", &self.window).finish()
    }
}

impl Topology {
    /// Creates the topology view of `window`.
    pub fn new(browser: Arc<Browser>, window: WindowId) -> Self {
        Self {
            browser,
            window,
            same_domain: Arc::new(Mutex::new(SameDomainCache::default())),
        }
    }

    /// The window queries are made from.
    pub fn window(&self) -> WindowId {
        self.window
    }

    /// The browser hosting the window.
    pub fn browser(&self) -> &Arc<Browser> {
        &self.browser
    }

    /// A proxy from this window to `win`.
    pub fn proxy(&self, win: WindowId) -> WindowProxy {
        self.browser.proxy(self.window, win)
    }

    /// Returns true if `win` is closed or refuses access.
    pub fn is_window_closed(&self, win: WindowId) -> bool {
        self.proxy(win).closed().unwrap_or(true)
    }

    /// The window that opened `win`.
    pub fn get_opener(&self, win: WindowId) -> Option<WindowId> {
        self.proxy(win).opener().ok().flatten()
    }

    /// The parent of `win`, if it is an iframe.
    pub fn get_parent(&self, win: WindowId) -> Option<WindowId> {
        self.proxy(win).parent().ok().flatten()
    }

    /// The opener of `win`, or else its parent.
    pub fn get_ancestor(&self, win: WindowId) -> Option<WindowId> {
        self.get_opener(win).or_else(|| self.get_parent(win))
    }

    /// Returns true if `parent` is the direct ancestor of `child`.
    pub fn is_ancestor(&self, parent: WindowId, child: WindowId) -> bool {
        self.get_ancestor(child) == Some(parent)
    }

    /// The top window of `win`'s frame tree.
    pub fn get_top(&self, win: WindowId) -> Option<WindowId> {
        self.proxy(win).top().ok()
    }

    /// Every frame below `win`, depth first.
    pub fn get_all_child_frames(&self, win: WindowId) -> Vec<WindowId> {
        let mut result = Vec::new();
        for frame in self.proxy(win).frames().unwrap_or_default() {
            result.push(frame);
            result.extend(self.get_all_child_frames(frame));
        }
        result
    }

    /// The top window of `win` followed by every frame below it.
    pub fn get_all_frames_in_window(&self, win: WindowId) -> Vec<WindowId> {
        let top = self.get_top(win).unwrap_or(win);
        let mut result = vec![top];
        result.extend(self.get_all_child_frames(top));
        if !result.contains(&win) {
            result.push(win);
        }
        result
    }

    /// The serialized origin of `win`, if readable from this window.
    ///
    /// `file://` pages report `file://`.
    pub fn get_domain(&self, win: WindowId) -> Option<String> {
        self.proxy(win).origin().ok().flatten().map(|origin| origin.serialize())
    }

    /// The serialized origin of this window, `"null"` if opaque.
    pub fn own_domain(&self) -> String {
        self.get_domain(self.window)
            .unwrap_or_else(|| OPAQUE_ORIGIN.to_string())
    }

    /// Returns true if this window may read `win`'s document.
    ///
    /// Answers are cached until the end of the current event loop turn.
    pub fn is_same_domain(&self, win: WindowId) -> bool {
        if win == self.window {
            return true;
        }
        if let Some(cached) = self.same_domain.lock().entries.get(&win) {
            return *cached;
        }

        let own = self.proxy(self.window).origin().ok().flatten();
        let other = self.proxy(win).origin().ok().flatten();
        let same = matches!((own, other), (Some(a), Some(b)) if a.is_same_origin(&b));

        let schedule = {
            let mut cache = self.same_domain.lock();
            cache.entries.insert(win, same);
            !std::mem::replace(&mut cache.clear_scheduled, true)
        };
        if schedule {
            let cache = Arc::clone(&self.same_domain);
            self.browser.event_loop().spawn(move || {
                let mut cache = cache.lock();
                cache.entries.clear();
                cache.clear_scheduled = false;
            });
        }
        same
    }

    /// Returns true if `a` and `b` belong to the same frame tree.
    ///
    /// When a top window cannot be read, the trees are compared by the
    /// frames reachable from each side.
    pub fn is_same_top_window(&self, a: WindowId, b: WindowId) -> bool {
        if let (Some(top_a), Some(top_b)) = (self.get_top(a), self.get_top(b)) {
            return top_a == top_b;
        }
        let frames_a = self.get_all_frames_in_window(a);
        let frames_b = self.get_all_frames_in_window(b);
        frames_a.iter().any(|frame| frames_b.contains(frame))
    }

    /// The type of `win`.
    pub fn get_window_type(&self, win: WindowId) -> WindowType {
        if self.get_opener(win).is_some() {
            WindowType::Popup
        } else if self.get_parent(win).is_some() {
            WindowType::Iframe
        } else {
            WindowType::Fullpage
        }
    }
}

//! The live line set for one user.
//!
//! A user can hold several concurrent lines (multiple devices/tabs).
//! Close operations here only signal: actual removal always happens later,
//! when the closed line's teardown reaches the hub's registry actor.

use bytes::Bytes;
use std::sync::{Arc, RwLock};

use super::line::{Line, Platform};

pub struct UserLines {
    lines: RwLock<Vec<Arc<Line>>>,
}

impl UserLines {
    pub(crate) fn new() -> Self {
        Self {
            lines: RwLock::new(Vec::new()),
        }
    }

    /// Insert a line. A leftover line with the same id (client reconnect
    /// racing its old connection's teardown) is removed and returned so
    /// the registry actor can retire it.
    pub(crate) fn add(&self, line: Arc<Line>) -> Option<Arc<Line>> {
        let mut lines = self.lines.write().expect("lines lock poisoned");
        let displaced = lines
            .iter()
            .position(|l| l.id() == line.id())
            .map(|i| lines.swap_remove(i));
        lines.push(line);
        displaced
    }

    /// Remove by id and identity. Returns true if a line was removed.
    /// Identity matters: a reconnect may have replaced the entry already.
    pub(crate) fn remove(&self, line: &Arc<Line>) -> bool {
        let mut lines = self.lines.write().expect("lines lock poisoned");
        match lines
            .iter()
            .position(|l| l.id() == line.id() && Arc::ptr_eq(l, line))
        {
            Some(i) => {
                lines.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, line_id: &str) -> Option<Arc<Line>> {
        self.lines
            .read()
            .expect("lines lock poisoned")
            .iter()
            .find(|l| l.id() == line_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lines.read().expect("lines lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.read().expect("lines lock poisoned").is_empty()
    }

    /// Snapshot of lines matching a predicate. Taken under the read lock
    /// so pushes (which await) never hold it.
    fn matching(&self, pred: impl Fn(&Line) -> bool) -> Vec<Arc<Line>> {
        self.lines
            .read()
            .expect("lines lock poisoned")
            .iter()
            .filter(|l| pred(l))
            .cloned()
            .collect()
    }

    // --- Close operations (signal only, non-removing) ---

    pub fn close_lines<S: AsRef<str>>(&self, line_ids: &[S]) {
        for line in self.matching(|l| line_ids.iter().any(|id| id.as_ref() == l.id())) {
            line.close(None);
        }
    }

    pub fn close_lines_except<S: AsRef<str>>(&self, line_ids: &[S]) {
        for line in self.matching(|l| !line_ids.iter().any(|id| id.as_ref() == l.id())) {
            line.close(None);
        }
    }

    pub fn close_platforms(&self, platforms: &[Platform]) {
        for line in self.matching(|l| platforms.contains(&l.platform())) {
            line.close(None);
        }
    }

    pub fn close_platforms_except(&self, platforms: &[Platform]) {
        for line in self.matching(|l| !platforms.contains(&l.platform())) {
            line.close(None);
        }
    }

    pub fn close_all(&self) {
        for line in self.matching(|_| true) {
            line.close(None);
        }
    }

    // --- Push operations ---

    /// Push one frame to every line. Returns the number of lines that
    /// accepted the frame under the overflow policy.
    pub async fn push(&self, data: Bytes) -> usize {
        self.push_snapshot(self.matching(|_| true), data).await
    }

    pub async fn push_to_lines<S: AsRef<str>>(&self, data: Bytes, line_ids: &[S]) -> usize {
        let targets = self.matching(|l| line_ids.iter().any(|id| id.as_ref() == l.id()));
        self.push_snapshot(targets, data).await
    }

    pub async fn push_to_lines_except<S: AsRef<str>>(&self, data: Bytes, line_ids: &[S]) -> usize {
        let targets = self.matching(|l| !line_ids.iter().any(|id| id.as_ref() == l.id()));
        self.push_snapshot(targets, data).await
    }

    pub async fn push_to_platforms(&self, data: Bytes, platforms: &[Platform]) -> usize {
        let targets = self.matching(|l| platforms.contains(&l.platform()));
        self.push_snapshot(targets, data).await
    }

    pub async fn push_to_platforms_except(&self, data: Bytes, platforms: &[Platform]) -> usize {
        let targets = self.matching(|l| !platforms.contains(&l.platform()));
        self.push_snapshot(targets, data).await
    }

    async fn push_snapshot(&self, targets: Vec<Arc<Line>>, data: Bytes) -> usize {
        let mut delivered = 0;
        for line in targets {
            if line.enqueue(data.clone()).await {
                delivered += 1;
            } else {
                tracing::debug!(
                    user_id = %line.user_id(),
                    line_id = %line.id(),
                    "Outbound frame not accepted (line closing or write channel full)"
                );
            }
        }
        delivered
    }

    /// Signal close on every line whose last activity predates the idle
    /// cutoff. Called from the hub sweep only. Returns how many were
    /// signalled.
    pub(crate) fn close_inactive(&self, max_idle_secs: i64, now_unix: i64) -> usize {
        let stale = self.matching(|l| now_unix - l.last_active() > max_idle_secs);
        let count = stale.len();
        for line in stale {
            line.close(None);
        }
        count
    }
}

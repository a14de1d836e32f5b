//! Task/poller compatibility predicate.

use chrono::{DateTime, Utc};

use crate::domain::{TaskInfo, VersioningTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    Match,
    /// `visible_at` is still in the future.
    NotYetVisible,
    /// Task is pinned to a build the poller doesn't run.
    BuildMismatch,
}

impl Compatibility {
    pub fn is_match(self) -> bool {
        self == Compatibility::Match
    }
}

/// Can a poller running `build_id` receive `task` at `now`?
pub fn check(task: &TaskInfo, build_id: Option<&str>, now: DateTime<Utc>) -> Compatibility {
    if !task.is_visible(now) {
        return Compatibility::NotYetVisible;
    }
    match (&task.versioning, build_id) {
        (VersioningTag::Unversioned, _) => Compatibility::Match,
        (VersioningTag::Pinned(want), Some(have)) if want == have => Compatibility::Match,
        (VersioningTag::Pinned(_), _) => Compatibility::BuildMismatch,
    }
}

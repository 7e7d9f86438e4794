//! App version ratings.
//!
//! Every checkin, crash, rollback, and successful update observed for an
//! `(app, version)` pair lands here. The resulting rating decides whether
//! the planner may keep rolling that version out.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use fleetgrid_state::{AppName, HostId, Version, epoch_secs};

/// Default number of crash records kept per version.
pub const DEFAULT_MAX_CRASH_DETAILS: usize = 64;

/// Rollout health of an app version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rating {
    Stable,
    Crashed,
}

/// Something observed about an app version on a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppEvent {
    Checkin,
    Crash,
    Rollback,
    SuccessfulUpdate,
}

impl AppEvent {
    fn is_failure(self) -> bool {
        matches!(self, Self::Crash | Self::Rollback)
    }
}

impl fmt::Display for AppEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Checkin => "checkin",
            Self::Crash => "crash",
            Self::Rollback => "rollback",
            Self::SuccessfulUpdate => "successful_update",
        };
        f.write_str(s)
    }
}

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCrash {
    pub host_id: HostId,
    pub app: AppName,
    pub version: Version,
    pub cause: AppEvent,
    /// Unix timestamp (seconds).
    pub time: u64,
}

/// Accumulated history of one app version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTrack {
    pub rating: Rating,
    pub running_count: u64,
    /// Most recent failures, oldest first.
    pub crash_details: VecDeque<AppCrash>,
}

impl Default for AppTrack {
    fn default() -> Self {
        Self {
            rating: Rating::Stable,
            running_count: 0,
            crash_details: VecDeque::new(),
        }
    }
}

/// Ratings for every observed app version.
#[derive(Debug)]
pub struct AppsStatusTracker {
    apps: RwLock<BTreeMap<AppName, BTreeMap<Version, AppTrack>>>,
    max_crash_details: usize,
}

impl Default for AppsStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AppsStatusTracker {
    pub fn new() -> Self {
        Self {
            apps: RwLock::new(BTreeMap::new()),
            max_crash_details: DEFAULT_MAX_CRASH_DETAILS,
        }
    }

    /// Set how many crash records are kept per version.
    pub fn with_max_crash_details(mut self, max: usize) -> Self {
        self.max_crash_details = max;
        self
    }

    /// Record an event. Returns the version's rating afterwards.
    pub fn update(&self, host_id: &str, app: &str, version: &Version, event: AppEvent) -> Rating {
        self.update_at(host_id, app, version, event, epoch_secs())
    }

    /// Record an event at an explicit time.
    pub fn update_at(
        &self,
        host_id: &str,
        app: &str,
        version: &Version,
        event: AppEvent,
        now: u64,
    ) -> Rating {
        let mut apps = self.apps.write().unwrap_or_else(PoisonError::into_inner);
        let track = apps
            .entry(app.to_string())
            .or_default()
            .entry(version.clone())
            .or_default();

        if event.is_failure() {
            if track.rating == Rating::Stable {
                warn!(host = %host_id, %app, %version, %event, "app version rated crashed");
            }
            track.rating = Rating::Crashed;
            track.crash_details.push_back(AppCrash {
                host_id: host_id.to_string(),
                app: app.to_string(),
                version: version.clone(),
                cause: event,
                time: now,
            });
            while track.crash_details.len() > self.max_crash_details {
                track.crash_details.pop_front();
            }
        } else {
            track.running_count += 1;
            debug!(host = %host_id, %app, %version, %event, rating = ?track.rating, "app version checked in");
        }
        track.rating
    }

    pub fn rating(&self, app: &str, version: &Version) -> Option<Rating> {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app)
            .and_then(|versions| versions.get(version))
            .map(|track| track.rating)
    }

    pub fn is_crashed(&self, app: &str, version: &Version) -> bool {
        self.rating(app, version) == Some(Rating::Crashed)
    }

    /// Copy of a version's history.
    pub fn track(&self, app: &str, version: &Version) -> Option<AppTrack> {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app)
            .and_then(|versions| versions.get(version))
            .cloned()
    }

    /// Newest version of `app` rated stable.
    pub fn last_stable(&self, app: &str) -> Option<Version> {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app)?
            .iter()
            .rev()
            .find(|(_, track)| track.rating == Rating::Stable)
            .map(|(version, _)| version.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkin_rates_stable() {
        let tracker = AppsStatusTracker::new();
        let v = Version::from("1");
        assert_eq!(tracker.rating("web", &v), None);

        assert_eq!(tracker.update("h1", "web", &v, AppEvent::Checkin), Rating::Stable);
        tracker.update("h2", "web", &v, AppEvent::SuccessfulUpdate);

        let track = tracker.track("web", &v).unwrap();
        assert_eq!(track.running_count, 2);
        assert!(track.crash_details.is_empty());
    }

    #[test]
    fn crash_is_permanent() {
        let tracker = AppsStatusTracker::new();
        let v = Version::from("2");
        tracker.update("h1", "web", &v, AppEvent::Checkin);
        assert_eq!(tracker.update("h1", "web", &v, AppEvent::Crash), Rating::Crashed);
        assert_eq!(tracker.update("h1", "web", &v, AppEvent::Checkin), Rating::Crashed);
        assert_eq!(
            tracker.update("h2", "web", &v, AppEvent::SuccessfulUpdate),
            Rating::Crashed
        );
        assert!(tracker.is_crashed("web", &v));
    }

    #[test]
    fn rollback_records_cause() {
        let tracker = AppsStatusTracker::new();
        let v = Version::from("2");
        tracker.update_at("h1", "web", &v, AppEvent::Rollback, 1234);

        let track = tracker.track("web", &v).unwrap();
        assert_eq!(track.rating, Rating::Crashed);
        assert_eq!(
            track.crash_details[0],
            AppCrash {
                host_id: "h1".into(),
                app: "web".into(),
                version: v.clone(),
                cause: AppEvent::Rollback,
                time: 1234,
            }
        );
    }

    #[test]
    fn crash_history_is_capped() {
        let tracker = AppsStatusTracker::new().with_max_crash_details(3);
        let v = Version::from("1");
        for i in 0..5 {
            tracker.update_at("h1", "web", &v, AppEvent::Crash, i);
        }
        let track = tracker.track("web", &v).unwrap();
        assert_eq!(track.crash_details.len(), 3);
        assert_eq!(track.crash_details.front().unwrap().time, 2);
        assert_eq!(track.crash_details.back().unwrap().time, 4);
    }

    #[test]
    fn last_stable_skips_crashed_versions() {
        let tracker = AppsStatusTracker::new();
        tracker.update("h1", "web", &"9".into(), AppEvent::Checkin);
        tracker.update("h1", "web", &"10".into(), AppEvent::Checkin);
        tracker.update("h1", "web", &"11".into(), AppEvent::Crash);

        assert_eq!(tracker.last_stable("web"), Some(Version::from("10")));
        assert_eq!(tracker.last_stable("db"), None);
    }
}

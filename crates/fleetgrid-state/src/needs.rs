//! Needs store — per app version resource needs, weighted by time of week.
//!
//! Needs are recorded in 15 minute buckets per weekday. A lookup takes the
//! component-wise maximum over the surrounding buckets so a placement made
//! just before a forecast peak is already sized for it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::types::{AppName, AppNeeds, Version};

/// Width of one time-of-day bucket, in minutes.
pub const NEEDS_DELTA: u32 = 15;

/// Buckets on either side of "now" that a lookup also considers.
pub const NEEDS_CAUTION_INTERVAL: u32 = 2;

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Needs used when an app has never reported usable figures.
pub const FALLBACK_NEEDS: AppNeeds = AppNeeds::new(1, 1, 1);

const WEEK: [Weekday; 7] = [
    Weekday::Sun,
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
];

/// Needs for one app version across a week, keyed by weekday and bucket start minute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeeklyNeeds {
    days: HashMap<Weekday, BTreeMap<u32, AppNeeds>>,
}

impl WeeklyNeeds {
    /// The same needs at every bucket of the week.
    pub fn flat(needs: AppNeeds) -> Self {
        let mut weekly = Self::default();
        weekly.set_flat(needs);
        weekly
    }

    /// Record needs for the bucket containing `minutes` on `day`.
    pub fn set(&mut self, day: Weekday, minutes: u32, needs: AppNeeds) {
        let bucket = minutes - minutes % NEEDS_DELTA;
        self.days.entry(day).or_default().insert(bucket, needs);
    }

    /// Overwrite every bucket of the week with `needs`.
    pub fn set_flat(&mut self, needs: AppNeeds) {
        for day in WEEK {
            let buckets = (0..MINUTES_PER_DAY as u32)
                .step_by(NEEDS_DELTA as usize)
                .map(|m| (m, needs))
                .collect();
            self.days.insert(day, buckets);
        }
    }

    fn bucket(&self, day: Weekday, minutes: u32) -> AppNeeds {
        self.days
            .get(&day)
            .and_then(|buckets| buckets.get(&minutes))
            .copied()
            .unwrap_or_default()
    }

    /// Maximum needs within the caution window around `minutes` on `day`.
    ///
    /// The window wraps into the previous or next weekday at midnight.
    pub fn get(&self, day: Weekday, minutes: u32) -> AppNeeds {
        let minutes = i64::from(minutes - minutes % NEEDS_DELTA);
        let span = i64::from(NEEDS_CAUTION_INTERVAL * NEEDS_DELTA);
        let mut peak = AppNeeds::default();
        let mut at = minutes - span;
        while at <= minutes + span {
            let needs = if at < 0 {
                self.bucket(day.pred(), (MINUTES_PER_DAY + at) as u32)
            } else if at >= MINUTES_PER_DAY {
                self.bucket(day.succ(), (at - MINUTES_PER_DAY) as u32)
            } else {
                self.bucket(day, at as u32)
            };
            peak = peak.max(&needs);
            at += i64::from(NEEDS_DELTA);
        }
        peak
    }

    /// Needs at the given instant.
    pub fn at(&self, time: DateTime<Utc>) -> AppNeeds {
        let (day, minutes) = time_to_weekday_minutes(time);
        self.get(day, minutes)
    }

    /// Highest needs recorded anywhere in the week.
    pub fn peak(&self) -> AppNeeds {
        self.days
            .values()
            .flat_map(|buckets| buckets.values())
            .fold(AppNeeds::default(), |acc, n| acc.max(n))
    }
}

/// Weekday and bucket start minute (UTC) for an instant, rounded down to the bucket.
pub fn time_to_weekday_minutes(time: DateTime<Utc>) -> (Weekday, u32) {
    let minutes = time.hour() * 60 + time.minute();
    (time.weekday(), minutes - minutes % NEEDS_DELTA)
}

/// Store of weekly needs per app and version.
#[derive(Debug, Default)]
pub struct NeedsStore {
    apps: RwLock<BTreeMap<AppName, BTreeMap<Version, WeeklyNeeds>>>,
}

impl NeedsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set flat needs for a version.
    ///
    /// Incomplete figures (any dimension zero) are replaced by the needs of
    /// the newest version that has complete ones, or by `FALLBACK_NEEDS`.
    pub fn update_needs(&self, app: &str, version: &Version, needs: AppNeeds) {
        let mut apps = self.apps.write().unwrap_or_else(PoisonError::into_inner);
        let versions = apps.entry(app.to_string()).or_default();
        let needs = if needs.is_complete() {
            needs
        } else {
            let fallback = versions
                .values()
                .rev()
                .map(WeeklyNeeds::peak)
                .find(AppNeeds::is_complete)
                .unwrap_or(FALLBACK_NEEDS);
            warn!(%app, %version, ?needs, ?fallback, "incomplete needs, using last known needs");
            fallback
        };
        debug!(%app, %version, ?needs, "needs updated");
        versions.insert(version.clone(), WeeklyNeeds::flat(needs));
    }

    /// Override the needs of one bucket of the week for a known version.
    pub fn forecast(
        &self,
        app: &str,
        version: &Version,
        day: Weekday,
        minutes: u32,
        needs: AppNeeds,
    ) -> StateResult<()> {
        let mut apps = self.apps.write().unwrap_or_else(PoisonError::into_inner);
        let weekly = apps
            .get_mut(app)
            .and_then(|versions| versions.get_mut(version))
            .ok_or_else(|| StateError::NeedsNotFound {
                name: app.to_string(),
                version: version.to_string(),
            })?;
        weekly.set(day, minutes, needs);
        debug!(%app, %version, %day, minutes, ?needs, "needs forecast recorded");
        Ok(())
    }

    /// Needs for `app` at `version` right now.
    pub fn get(&self, app: &str, version: &Version) -> StateResult<AppNeeds> {
        self.get_at(app, version, Utc::now())
    }

    /// Needs for `app` at `version` at the given instant.
    pub fn get_at(&self, app: &str, version: &Version, time: DateTime<Utc>) -> StateResult<AppNeeds> {
        let apps = self.apps.read().unwrap_or_else(PoisonError::into_inner);
        apps.get(app)
            .and_then(|versions| versions.get(version))
            .map(|weekly| weekly.at(time))
            .ok_or_else(|| StateError::NeedsNotFound {
                name: app.to_string(),
                version: version.to_string(),
            })
    }

    pub fn contains(&self, app: &str, version: &Version) -> bool {
        self.apps
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(app)
            .is_some_and(|versions| versions.contains_key(version))
    }
}

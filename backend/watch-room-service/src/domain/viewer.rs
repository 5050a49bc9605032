//! Viewer entity and its field-level change tracking.
//!
//! Every mutation goes through a setter that returns whether the value actually
//! changed and, if so, marks the field dirty. [`Viewer::take_patch`] turns the
//! dirty set into a [`ViewerPatch`] carrying only the changed fields and resets
//! the set, so broadcasts never retransmit untouched state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::errors::RoomError;

/// 100ns ticks per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Speed changes below this are treated as client jitter.
pub const SPEED_EPSILON: f64 = 0.1;

pub const DEFAULT_SPEED: f64 = 1.0;

pub const STAT_MESSAGES: &str = "messages";
pub const STAT_BEEPS: &str = "beeps";
pub const STAT_SCREAMS: &str = "screams";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerSettings {
    pub allow_beep: bool,
    pub allow_scream: bool,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self {
            allow_beep: true,
            allow_scream: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ViewerField {
    UserName,
    PhotoKey,
    Online,
    FullScreen,
    OnPause,
    TimeLine,
    Speed,
    Muted,
    Season,
    Episode,
    Settings,
    Tags,
    Statistic,
}

fn speed_changed(old: f64, new: f64) -> bool {
    (new - old).abs() >= SPEED_EPSILON
}

#[derive(Debug, Clone)]
pub struct Viewer {
    id: Uuid,
    user_name: String,
    photo_key: Option<String>,
    online: bool,
    full_screen: bool,
    on_pause: bool,
    time_line: i64,
    speed: f64,
    muted: bool,
    season: Option<i32>,
    episode: Option<i32>,
    settings: ViewerSettings,
    tags: BTreeSet<String>,
    statistic: BTreeMap<String, i64>,
    changed: BTreeSet<ViewerField>,
}

macro_rules! setter {
    ($name:ident, $field:ident, $ty:ty, $variant:ident) => {
        pub fn $name(&mut self, value: $ty) -> bool {
            if self.$field == value {
                return false;
            }
            self.$field = value;
            self.changed.insert(ViewerField::$variant);
            true
        }
    };
}

impl Viewer {
    pub fn new(
        id: Uuid,
        user_name: impl Into<String>,
        photo_key: Option<String>,
        settings: ViewerSettings,
    ) -> Self {
        Self {
            id,
            user_name: user_name.into(),
            photo_key,
            online: false,
            full_screen: false,
            on_pause: true,
            time_line: 0,
            speed: DEFAULT_SPEED,
            muted: false,
            season: None,
            episode: None,
            settings,
            tags: BTreeSet::new(),
            statistic: BTreeMap::new(),
            changed: BTreeSet::new(),
        }
    }

    /// Rebuild a viewer from storage, re-checking field invariants.
    pub fn restore(record: ViewerRecord) -> Result<Self, RoomError> {
        if record.user_name.trim().is_empty() {
            return Err(RoomError::argument("viewer name is empty"));
        }
        if record.time_line < 0 {
            return Err(RoomError::argument("negative time line"));
        }
        if !record.speed.is_finite() || record.speed <= 0.0 {
            return Err(RoomError::argument("speed must be positive"));
        }
        if record.season.map_or(false, |s| s < 1) || record.episode.map_or(false, |e| e < 1) {
            return Err(RoomError::argument("season and episode start at 1"));
        }

        Ok(Self {
            id: record.id,
            user_name: record.user_name,
            photo_key: record.photo_key,
            online: record.online,
            full_screen: record.full_screen,
            on_pause: record.on_pause,
            time_line: record.time_line,
            speed: record.speed,
            muted: record.muted,
            season: record.season,
            episode: record.episode,
            settings: record.settings,
            tags: record.tags.into_iter().collect(),
            statistic: record.statistic,
            changed: BTreeSet::new(),
        })
    }

    pub fn to_record(&self) -> ViewerRecord {
        ViewerRecord {
            id: self.id,
            user_name: self.user_name.clone(),
            photo_key: self.photo_key.clone(),
            online: self.online,
            full_screen: self.full_screen,
            on_pause: self.on_pause,
            time_line: self.time_line,
            speed: self.speed,
            muted: self.muted,
            season: self.season,
            episode: self.episode,
            settings: self.settings,
            tags: self.tags.iter().cloned().collect(),
            statistic: self.statistic.clone(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn photo_key(&self) -> Option<&str> {
        self.photo_key.as_deref()
    }

    pub fn online(&self) -> bool {
        self.online
    }

    pub fn full_screen(&self) -> bool {
        self.full_screen
    }

    pub fn on_pause(&self) -> bool {
        self.on_pause
    }

    pub fn time_line(&self) -> i64 {
        self.time_line
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    pub fn season(&self) -> Option<i32> {
        self.season
    }

    pub fn episode(&self) -> Option<i32> {
        self.episode
    }

    pub fn settings(&self) -> ViewerSettings {
        self.settings
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn statistic(&self, key: &str) -> i64 {
        self.statistic.get(key).copied().unwrap_or(0)
    }

    setter!(set_user_name, user_name, String, UserName);
    setter!(set_photo_key, photo_key, Option<String>, PhotoKey);
    setter!(set_online, online, bool, Online);
    setter!(set_full_screen, full_screen, bool, FullScreen);
    setter!(set_on_pause, on_pause, bool, OnPause);
    setter!(set_time_line, time_line, i64, TimeLine);
    setter!(set_muted, muted, bool, Muted);
    setter!(set_season, season, Option<i32>, Season);
    setter!(set_episode, episode, Option<i32>, Episode);
    setter!(set_settings, settings, ViewerSettings, Settings);

    pub fn set_speed(&mut self, value: f64) -> bool {
        if !speed_changed(self.speed, value) {
            return false;
        }
        self.speed = value;
        self.changed.insert(ViewerField::Speed);
        true
    }

    pub fn add_tag(&mut self, tag: &str) -> bool {
        if !self.tags.insert(tag.to_string()) {
            return false;
        }
        self.changed.insert(ViewerField::Tags);
        true
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        if !self.tags.remove(tag) {
            return false;
        }
        self.changed.insert(ViewerField::Tags);
        true
    }

    pub fn set_statistic(&mut self, key: &str, value: i64) -> bool {
        if self.statistic.get(key) == Some(&value) {
            return false;
        }
        self.statistic.insert(key.to_string(), value);
        self.changed.insert(ViewerField::Statistic);
        true
    }

    pub fn increment_statistic(&mut self, key: &str) -> i64 {
        let value = self.statistic(key) + 1;
        self.set_statistic(key, value);
        value
    }

    pub fn is_changed(&self, field: ViewerField) -> bool {
        self.changed.contains(&field)
    }

    pub fn changed_fields(&self) -> impl Iterator<Item = ViewerField> + '_ {
        self.changed.iter().copied()
    }

    pub fn clear_changes(&mut self) {
        self.changed.clear();
    }

    /// Consume the dirty set as a patch.
    pub fn take_patch(&mut self) -> ViewerPatch {
        let changed = std::mem::take(&mut self.changed);
        let mut patch = ViewerPatch::default();
        for field in changed {
            patch.include(field, self);
        }
        patch
    }
}

/// Plain storage/wire shape of a viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewerRecord {
    pub id: Uuid,
    pub user_name: String,
    pub photo_key: Option<String>,
    pub online: bool,
    pub full_screen: bool,
    pub on_pause: bool,
    pub time_line: i64,
    pub speed: f64,
    pub muted: bool,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub settings: ViewerSettings,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub statistic: BTreeMap<String, i64>,
}

/// Changed fields only. Nullable fields use a double option so that
/// "cleared" (`Some(None)`, serialised as `null`) differs from "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_key: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_screen: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_pause: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_line: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub season: Option<Option<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode: Option<Option<i32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<ViewerSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistic: Option<BTreeMap<String, i64>>,
}

impl ViewerPatch {
    /// Fields that differ between two snapshots of the same viewer.
    pub fn diff(before: &Viewer, after: &Viewer) -> Self {
        let mut patch = Self::default();
        let fields = [
            (ViewerField::UserName, before.user_name != after.user_name),
            (ViewerField::PhotoKey, before.photo_key != after.photo_key),
            (ViewerField::Online, before.online != after.online),
            (ViewerField::FullScreen, before.full_screen != after.full_screen),
            (ViewerField::OnPause, before.on_pause != after.on_pause),
            (ViewerField::TimeLine, before.time_line != after.time_line),
            (ViewerField::Speed, speed_changed(before.speed, after.speed)),
            (ViewerField::Muted, before.muted != after.muted),
            (ViewerField::Season, before.season != after.season),
            (ViewerField::Episode, before.episode != after.episode),
            (ViewerField::Settings, before.settings != after.settings),
            (ViewerField::Tags, before.tags != after.tags),
            (ViewerField::Statistic, before.statistic != after.statistic),
        ];
        for (field, differs) in fields {
            if differs {
                patch.include(field, after);
            }
        }
        patch
    }

    fn include(&mut self, field: ViewerField, viewer: &Viewer) {
        match field {
            ViewerField::UserName => self.user_name = Some(viewer.user_name.clone()),
            ViewerField::PhotoKey => self.photo_key = Some(viewer.photo_key.clone()),
            ViewerField::Online => self.online = Some(viewer.online),
            ViewerField::FullScreen => self.full_screen = Some(viewer.full_screen),
            ViewerField::OnPause => self.on_pause = Some(viewer.on_pause),
            ViewerField::TimeLine => self.time_line = Some(viewer.time_line),
            ViewerField::Speed => self.speed = Some(viewer.speed),
            ViewerField::Muted => self.muted = Some(viewer.muted),
            ViewerField::Season => self.season = Some(viewer.season),
            ViewerField::Episode => self.episode = Some(viewer.episode),
            ViewerField::Settings => self.settings = Some(viewer.settings),
            ViewerField::Tags => self.tags = Some(viewer.tags.iter().cloned().collect()),
            ViewerField::Statistic => self.statistic = Some(viewer.statistic.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewer() -> Viewer {
        Viewer::new(Uuid::new_v4(), "alice", None, ViewerSettings::default())
    }

    #[test]
    fn test_new_viewer_defaults() {
        let v = viewer();
        assert!(v.on_pause());
        assert!(!v.online());
        assert_eq!(v.speed(), 1.0);
        assert_eq!(v.changed_fields().count(), 0);
    }

    #[test]
    fn test_setter_noop_does_not_mark_dirty() {
        let mut v = viewer();
        assert!(!v.set_on_pause(true));
        assert!(!v.set_user_name("alice".to_string()));
        assert_eq!(v.changed_fields().count(), 0);

        assert!(v.set_on_pause(false));
        assert!(v.is_changed(ViewerField::OnPause));
    }

    #[test]
    fn test_speed_jitter_is_ignored() {
        let mut v = viewer();
        assert!(!v.set_speed(1.05));
        assert!(!v.set_speed(0.95));
        assert!(!v.is_changed(ViewerField::Speed));
        assert_eq!(v.speed(), 1.0);

        assert!(v.set_speed(1.25));
        assert!(v.is_changed(ViewerField::Speed));
        assert_eq!(v.changed_fields().filter(|f| *f == ViewerField::Speed).count(), 1);
    }

    #[test]
    fn test_take_patch_clears_dirty_set() {
        let mut v = viewer();
        v.set_time_line(42 * TICKS_PER_SECOND);
        v.set_muted(true);

        let patch = v.take_patch();
        assert_eq!(patch.time_line, Some(42 * TICKS_PER_SECOND));
        assert_eq!(patch.muted, Some(true));
        assert!(patch.speed.is_none());
        assert_eq!(v.changed_fields().count(), 0);
        assert!(v.take_patch().is_empty());
    }

    #[test]
    fn test_patch_serializes_only_changed_fields() {
        let mut v = viewer();
        v.set_season(Some(2));
        v.set_photo_key(None);
        let json = serde_json::to_value(v.take_patch()).unwrap();
        assert_eq!(json, serde_json::json!({ "season": 2 }));

        v.set_photo_key(Some("avatars/a.png".to_string()));
        v.take_patch();
        v.set_photo_key(None);
        let json = serde_json::to_value(v.take_patch()).unwrap();
        assert_eq!(json, serde_json::json!({ "photo_key": null }));
    }

    #[test]
    fn test_collection_mutations_mark_dirty() {
        let mut v = viewer();
        assert!(v.add_tag("owner"));
        assert!(!v.add_tag("owner"));
        assert_eq!(v.increment_statistic(STAT_BEEPS), 1);
        assert_eq!(v.increment_statistic(STAT_BEEPS), 2);

        let patch = v.take_patch();
        assert_eq!(patch.tags, Some(vec!["owner".to_string()]));
        assert_eq!(patch.statistic.unwrap().get(STAT_BEEPS), Some(&2));

        assert!(v.remove_tag("owner"));
        assert!(!v.remove_tag("owner"));
    }

    #[test]
    fn test_diff_matches_tracked_patch() {
        let before = viewer();
        let mut after = before.clone();
        after.set_full_screen(true);
        after.set_speed(1.04);
        after.set_speed(2.0);

        let diff = ViewerPatch::diff(&before, &after);
        assert_eq!(diff, after.take_patch());
        assert_eq!(diff.speed, Some(2.0));
        assert_eq!(diff.full_screen, Some(true));
    }

    #[test]
    fn test_restore_rejects_invalid_record() {
        let mut record = viewer().to_record();
        record.speed = f64::NAN;
        assert!(Viewer::restore(record).is_err());

        let mut record = viewer().to_record();
        record.episode = Some(0);
        assert!(Viewer::restore(record).is_err());

        let record = viewer().to_record();
        let restored = Viewer::restore(record.clone()).unwrap();
        assert_eq!(restored.to_record(), record);
    }
}

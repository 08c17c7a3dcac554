//! Core domain model, pipeline configuration, and timestamp resolution.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cadence-core";

/// Origin feed of a canonical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    /// AEG venue feeds served from axs.com.
    Aeg,
    Ticketmaster,
}

impl EventSource {
    pub fn as_tag(self) -> &'static str {
        match self {
            EventSource::Aeg => "aeg",
            EventSource::Ticketmaster => "ticketmaster",
        }
    }
}

impl FromStr for EventSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "aeg" => Ok(EventSource::Aeg),
            "ticketmaster" => Ok(EventSource::Ticketmaster),
            other => Err(format!("unknown event source tag: {other:?}")),
        }
    }
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// One occurrence of a ticketed event, normalized from a vendor feed.
///
/// `start_datetime` keeps the timestamp exactly as the vendor encoded it
/// (offset-aware, `Z`-suffixed, naive, or date-only); [`resolve_start`] turns
/// it into a comparable home-zone instant on demand. Every fetch produces a
/// fresh set of these; nothing is mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub event_id: String,
    pub source: EventSource,
    #[serde(default)]
    pub source_venue_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub start_datetime: String,
    #[serde(default)]
    pub venue_name: String,
    #[serde(default)]
    pub venue_city: String,
    #[serde(default)]
    pub venue_region: String,
    #[serde(default)]
    pub venue_country: String,
    #[serde(default)]
    pub event_url: String,
    #[serde(default)]
    pub presented_by: String,
    #[serde(default)]
    pub headliners: String,
    #[serde(default)]
    pub supporting: String,
}

impl CanonicalEvent {
    /// Resolved home-zone instant for this event, if the raw timestamp parses.
    pub fn start_in(&self, zone: Tz) -> Option<DateTime<Tz>> {
        resolve_start(&self.start_datetime, zone)
    }
}

/// Resolve a free-form vendor timestamp to a home-zone instant.
///
/// Attempted in order, first success wins:
/// 1. trailing `Z` rewritten to `+00:00`, then offset-aware parse;
/// 2. offset-aware extended-format parse;
/// 3. naive datetime, interpreted as already being home-zone local;
/// 4. date-only (`YYYY-MM-DD`, `YYYY/MM/DD`) at local midnight.
///
/// Returns `None` for anything else; callers drop the record rather than
/// defaulting to now.
pub fn resolve_start(raw: &str, zone: Tz) -> Option<DateTime<Tz>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let s = match trimmed.strip_suffix('Z') {
        Some(stripped) => format!("{stripped}+00:00"),
        None => trimmed.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Some(dt.with_timezone(&zone));
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&s, fmt) {
            return local_instant(naive, zone);
        }
    }

    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(&s, fmt) {
            return local_instant(date.and_hms_opt(0, 0, 0)?, zone);
        }
    }

    None
}

/// Interpret a naive local time in `zone`. Ambiguous wall-clock times (DST
/// fall-back) take the earlier instant; nonexistent times (spring-forward gap)
/// are unresolvable and the record is skipped.
fn local_instant(naive: NaiveDateTime, zone: Tz) -> Option<DateTime<Tz>> {
    match zone.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earlier, _) => Some(earlier),
        LocalResult::None => None,
    }
}

/// Ticketmaster Discovery query parameters.
#[derive(Debug, Clone)]
pub struct TicketmasterQuery {
    pub api_key: String,
    pub city: String,
    pub state_code: String,
    pub country_code: String,
    pub radius_miles: String,
    pub classification: String,
    pub page_size: u32,
}

/// Pipeline-wide configuration, constructed once at process start and passed
/// by reference into every component. Components never read the environment
/// themselves.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_root: PathBuf,
    /// Canonical zone: naive vendor timestamps are interpreted here, and all
    /// calendar-year comparisons happen here.
    pub home_zone: Tz,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// AEG feed endpoints, one per venue.
    pub aeg_feed_urls: Vec<String>,
    /// Optional lowercase substrings; an AEG event is kept only when its
    /// venue name contains one of these. Empty = keep all.
    pub aeg_venue_filters: Vec<String>,
    pub ticketmaster: TicketmasterQuery,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let home_zone = std::env::var("CADENCE_HOME_TZ")
            .ok()
            .and_then(|name| name.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::America::Denver);

        Self {
            data_root: std::env::var("CADENCE_DATA_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
            home_zone,
            user_agent: std::env::var("CADENCE_USER_AGENT")
                .unwrap_or_else(|_| "cadence/0.1 (personal use)".to_string()),
            http_timeout_secs: std::env::var("CADENCE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            aeg_feed_urls: split_list(&std::env::var("AEG_EVENTS_URLS").unwrap_or_default()),
            aeg_venue_filters: split_list(&std::env::var("AEG_VENUES").unwrap_or_default())
                .into_iter()
                .map(|v| v.to_lowercase())
                .collect(),
            ticketmaster: TicketmasterQuery {
                api_key: std::env::var("TICKETMASTER_API_KEY").unwrap_or_default(),
                city: std::env::var("TM_CITY").unwrap_or_else(|_| "Denver".to_string()),
                state_code: std::env::var("TM_STATE").unwrap_or_else(|_| "CO".to_string()),
                country_code: std::env::var("TM_COUNTRY").unwrap_or_else(|_| "US".to_string()),
                radius_miles: std::env::var("TM_RADIUS_MILES").unwrap_or_else(|_| "50".to_string()),
                classification: std::env::var("TM_CLASSIFICATION")
                    .unwrap_or_else(|_| "music".to_string()),
                page_size: std::env::var("TM_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(200),
            },
        }
    }

    /// Today's date on the home-zone calendar.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.home_zone).date_naive()
    }

    pub fn shows_raw_dir(&self, source: EventSource) -> PathBuf {
        self.data_root.join("shows").join("raw").join(source.as_tag())
    }

    pub fn shows_processed_dir(&self) -> PathBuf {
        self.data_root.join("shows").join("processed")
    }

    /// Processed event table for one source feed.
    pub fn events_table_path(&self, source: EventSource) -> PathBuf {
        let name = match source {
            EventSource::Aeg => "denver_events_upcoming.csv",
            EventSource::Ticketmaster => "denver_events_ticketmaster.csv",
        };
        self.shows_processed_dir().join(name)
    }

    pub fn shows_summary_path(&self, year: i32) -> PathBuf {
        self.data_root
            .join("shows")
            .join("metrics")
            .join(format!("shows_summary_{year}.csv"))
    }

    pub fn daily_dir(&self) -> PathBuf {
        self.data_root.join("daily")
    }

    /// Per-invocation run directory holding step logs and summaries.
    pub fn run_dir(&self, date: NaiveDate) -> PathBuf {
        self.daily_dir().join(date.format("%Y-%m-%d").to_string())
    }

    pub fn history_path(&self) -> PathBuf {
        self.daily_dir().join("history_daily.csv")
    }

    /// A config rooted somewhere else, keeping every other setting. Tests and
    /// ad hoc runs point this at a scratch directory.
    pub fn with_data_root(mut self, root: impl AsRef<Path>) -> Self {
        self.data_root = root.as_ref().to_path_buf();
        self
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use chrono_tz::America::Denver;

    #[test]
    fn z_suffix_is_utc() {
        let dt = resolve_start("2026-06-15T02:00:00Z", Denver).expect("parses");
        // 02:00 UTC is 20:00 the previous evening in Denver (UTC-6 in June).
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2026, 6, 14).unwrap());
        assert_eq!(dt.format("%H:%M").to_string(), "20:00");
    }

    #[test]
    fn explicit_offset_converts_to_home_zone() {
        let dt = resolve_start("2026-01-09T20:00:00-07:00", Denver).expect("parses");
        assert_eq!(dt.format("%Y-%m-%dT%H:%M").to_string(), "2026-01-09T20:00");
    }

    #[test]
    fn naive_timestamp_is_home_zone_local_not_utc() {
        let dt = resolve_start("2026-01-09T20:00:00", Denver).expect("parses");
        assert_eq!(dt.with_timezone(&Utc).format("%H:%M").to_string(), "03:00");
    }

    #[test]
    fn date_only_falls_back_to_local_midnight() {
        let dt = resolve_start("2026-03-01", Denver).expect("parses");
        assert_eq!(dt.format("%Y-%m-%d %H:%M").to_string(), "2026-03-01 00:00");
        assert!(resolve_start("2026/03/01", Denver).is_some());
    }

    #[test]
    fn garbage_and_empty_are_none() {
        assert!(resolve_start("", Denver).is_none());
        assert!(resolve_start("   ", Denver).is_none());
        assert!(resolve_start("next friday", Denver).is_none());
        assert!(resolve_start("2026-13-40", Denver).is_none());
    }

    #[test]
    fn utc_event_classified_one_local_day_earlier_across_midnight() {
        // 03:00 UTC on Jan 9 is 20:00 on Jan 8 in Denver (UTC-7 in winter).
        let dt = resolve_start("2026-01-09T03:00:00Z", Denver).expect("parses");
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2026, 1, 8).unwrap());
        assert_eq!(dt.year(), 2026);
    }

    #[test]
    fn offset_round_trip_preserves_the_instant() {
        let raw = "2026-09-03T19:30:00-04:00";
        let resolved = resolve_start(raw, Denver).expect("parses");
        let rendered = resolved.to_rfc3339();
        let back = resolve_start(&rendered, Denver).expect("re-parses");
        assert_eq!(resolved.timestamp(), back.timestamp());
    }

    #[test]
    fn source_tags_round_trip() {
        assert_eq!("aeg".parse::<EventSource>().unwrap(), EventSource::Aeg);
        assert_eq!(
            "ticketmaster".parse::<EventSource>().unwrap(),
            EventSource::Ticketmaster
        );
        assert!("bandsintown".parse::<EventSource>().is_err());
        assert_eq!(EventSource::Aeg.to_string(), "aeg");
    }
}

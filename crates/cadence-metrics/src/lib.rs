//! Cross-source event reconciliation and goal-tracking metrics: dedupe,
//! shows aggregation, and the consolidated daily history table.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use cadence_core::{resolve_start, CanonicalEvent, PipelineConfig};
use cadence_storage::{read_events, read_single_row, write_single_row, FlatTable};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

pub const CRATE_NAME: &str = "cadence-metrics";

// --- deduplication ----------------------------------------------------------

fn normalize_ws(s: &str) -> String {
    s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cross-source identity for an event.
///
/// The event URL is the stable key when a feed provides one; otherwise a
/// signature over normalized title, normalized venue, and the raw start
/// string. Two records with equal keys are the same real-world event.
pub fn dedupe_key(event: &CanonicalEvent) -> String {
    let url = event.event_url.trim();
    if !url.is_empty() {
        return format!("url:{url}");
    }
    let base = format!(
        "{}|{}|{}",
        normalize_ws(&event.title),
        normalize_ws(&event.venue_name),
        event.start_datetime.trim()
    );
    let mut hasher = Sha256::new();
    hasher.update(base.as_bytes());
    format!("sig:{}", &hex::encode(hasher.finalize())[..16])
}

/// Collapse duplicate sightings across feeds, first seen wins. No field-level
/// merging between duplicates; order of first occurrence is preserved.
pub fn dedupe(events: Vec<CanonicalEvent>) -> Vec<CanonicalEvent> {
    let mut seen = HashSet::new();
    events
        .into_iter()
        .filter(|event| seen.insert(dedupe_key(event)))
        .collect()
}

// --- shows aggregation ------------------------------------------------------

/// Combined cross-feed shows metrics for one target year.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShowsSummary {
    pub year: i32,
    pub upcoming_show_count: usize,
    pub next_show_date: String,
    pub next_show_datetime: String,
    pub next_show_title: String,
    pub next_show_venue: String,
    pub next_show_url: String,
    pub unique_venues_count: usize,
    pub sources_present: String,
    pub aeg_rows: usize,
    pub ticketmaster_rows: usize,
    pub combined_deduped_rows: usize,
}

impl ShowsSummary {
    /// Column order of the one-row summary table.
    pub fn columns(&self) -> Vec<(String, String)> {
        vec![
            ("year".into(), self.year.to_string()),
            (
                "denver_upcoming_show_count".into(),
                self.upcoming_show_count.to_string(),
            ),
            ("next_show_date".into(), self.next_show_date.clone()),
            ("next_show_datetime".into(), self.next_show_datetime.clone()),
            ("next_show_title".into(), self.next_show_title.clone()),
            ("next_show_venue".into(), self.next_show_venue.clone()),
            ("next_show_url".into(), self.next_show_url.clone()),
            (
                "unique_venues_count".into(),
                self.unique_venues_count.to_string(),
            ),
            ("sources_present".into(), self.sources_present.clone()),
            ("aeg_rows".into(), self.aeg_rows.to_string()),
            ("ticketmaster_rows".into(), self.ticketmaster_rows.to_string()),
            (
                "combined_deduped_rows".into(),
                self.combined_deduped_rows.to_string(),
            ),
        ]
    }
}

/// Aggregate both feeds for `year`.
///
/// Feed order matters: AEG rows come first, so on a cross-feed duplicate the
/// AEG sighting wins. The year filter is "same home-zone calendar year as the
/// target", which includes already-played events of that year; the feeds only
/// publish still-upcoming listings, so the daily re-derivation stays an
/// upcoming count in practice. Empty feeds aggregate to zeros.
pub fn aggregate_shows(
    config: &PipelineConfig,
    aeg_rows: Vec<CanonicalEvent>,
    ticketmaster_rows: Vec<CanonicalEvent>,
    year: i32,
) -> ShowsSummary {
    let aeg_count = aeg_rows.len();
    let ticketmaster_count = ticketmaster_rows.len();

    let mut combined = aeg_rows;
    combined.extend(ticketmaster_rows);

    let mut source_tags: Vec<&str> = combined
        .iter()
        .map(|event| event.source.as_tag())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    source_tags.sort_unstable();
    let sources_present = source_tags.join(",");

    let deduped = dedupe(combined);
    let combined_deduped_rows = deduped.len();

    // Resolve timestamps, keep the target local year, sort by instant. The
    // sort is stable, so equal instants keep dedupe insertion order.
    let mut filtered: Vec<(i64, chrono::DateTime<chrono_tz::Tz>, CanonicalEvent)> = deduped
        .into_iter()
        .filter_map(|event| {
            let local = resolve_start(&event.start_datetime, config.home_zone)?;
            if local.date_naive().year() != year {
                return None;
            }
            Some((local.timestamp(), local, event))
        })
        .collect();
    filtered.sort_by_key(|(ts, _, _)| *ts);

    let mut summary = ShowsSummary {
        year,
        upcoming_show_count: filtered.len(),
        sources_present,
        aeg_rows: aeg_count,
        ticketmaster_rows: ticketmaster_count,
        combined_deduped_rows,
        ..ShowsSummary::default()
    };

    if let Some((_, local, event)) = filtered.first() {
        summary.next_show_date = local.date_naive().to_string();
        summary.next_show_datetime = local.to_rfc3339();
        summary.next_show_title = event.title.clone();
        summary.next_show_venue = event.venue_name.clone();
        summary.next_show_url = event.event_url.clone();
    }

    summary.unique_venues_count = filtered
        .iter()
        .map(|(_, _, event)| event.venue_name.trim())
        .filter(|name| !name.is_empty())
        .collect::<HashSet<_>>()
        .len();

    summary
}

/// Read both processed feed tables, aggregate, and write the one-row summary.
pub fn run_shows_metrics(config: &PipelineConfig, year: i32) -> Result<ShowsSummary> {
    let aeg = read_events(&config.events_table_path(cadence_core::EventSource::Aeg))?;
    let ticketmaster =
        read_events(&config.events_table_path(cadence_core::EventSource::Ticketmaster))?;

    let summary = aggregate_shows(config, aeg, ticketmaster, year);

    let out_path = config.shows_summary_path(year);
    write_single_row(&out_path, &summary.columns())
        .with_context(|| format!("writing {}", out_path.display()))?;
    info!(
        year,
        upcoming = summary.upcoming_show_count,
        path = %out_path.display(),
        "wrote shows summary"
    );
    Ok(summary)
}

// --- consolidated daily history ---------------------------------------------

/// First value among `aliases` present and non-empty in a summary row.
/// Alias order is the schema history of that column, newest name first.
fn pick(row: &HashMap<String, String>, aliases: &[&str]) -> String {
    for alias in aliases {
        if let Some(value) = row.get(*alias) {
            if !value.is_empty() {
                return value.clone();
            }
        }
    }
    String::new()
}

fn first_existing(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|p| p.exists())
}

fn read_domain_summary(candidates: Vec<PathBuf>) -> HashMap<String, String> {
    match first_existing(candidates) {
        Some(path) => read_single_row(&path),
        None => HashMap::new(),
    }
}

/// Assemble the consolidated row for one calendar date from whatever domain
/// summaries exist on disk. Missing domains contribute empty strings.
pub fn build_history_row(
    config: &PipelineConfig,
    today: NaiveDate,
    year: i32,
) -> Vec<(String, String)> {
    let root = &config.data_root;

    let fitness = read_domain_summary(vec![
        root.join(format!("sugarwod/metrics/fitness_summary_{year}.csv")),
        root.join("sugarwod/metrics/fitness_summary_2026.csv"),
    ]);
    let reading = read_domain_summary(vec![
        root.join(format!("hardcover/metrics/reading_summary_{year}.csv"))
    ]);
    let date_night = read_domain_summary(vec![
        root.join(format!("calendar/metrics/date_night_summary_{year}.csv"))
    ]);
    let running = read_domain_summary(vec![
        root.join(format!("strava/metrics/running_summary_{year}.csv")),
        root.join(format!("running/metrics/running_summary_{year}.csv")),
        root.join(format!("strava/metrics/strava_summary_{year}.csv")),
        root.join(format!("running/metrics/running_metrics_{year}.csv")),
    ]);
    let shows = read_domain_summary(vec![
        root.join(format!("shows/metrics/shows_summary_{year}.csv"))
    ]);
    let spotify = read_domain_summary(vec![
        root.join(format!("spotify/metrics/spotify_summary_{year}.csv"))
    ]);

    let classes_attended_col = format!("classes_attended_{year}");

    vec![
        ("date".into(), today.format("%Y-%m-%d").to_string()),
        ("year".into(), year.to_string()),
        // Fitness
        (
            "classes_attended_ytd".into(),
            pick(&fitness, &[&classes_attended_col, "classes_attended_ytd"]),
        ),
        ("classes_goal".into(), pick(&fitness, &["classes_goal"])),
        (
            "classes_progress_pct".into(),
            pick(&fitness, &["classes_progress_pct"]),
        ),
        (
            "required_classes_per_week".into(),
            pick(&fitness, &["required_classes_per_week"]),
        ),
        ("rx_rate".into(), pick(&fitness, &["rx_rate"])),
        ("pr_count".into(), pick(&fitness, &["pr_count"])),
        // Reading
        (
            "nonfiction_read_ytd".into(),
            pick(&reading, &["nonfiction_read_ytd", "nonfiction_books_read"]),
        ),
        (
            "nonfiction_goal".into(),
            pick(&reading, &["nonfiction_goal", "nonfiction_books_goal"]),
        ),
        (
            "fiction_read_ytd".into(),
            pick(&reading, &["fiction_read_ytd", "fiction_books_read"]),
        ),
        (
            "fiction_goal".into(),
            pick(&reading, &["fiction_goal", "fiction_books_goal"]),
        ),
        // Calendar date night
        (
            "weeks_with_date_night".into(),
            pick(&date_night, &["weeks_with_date_night"]),
        ),
        ("weeks_observed".into(), pick(&date_night, &["weeks_observed"])),
        (
            "date_night_goal_per_week".into(),
            pick(&date_night, &["date_night_goal_per_week"]),
        ),
        (
            "date_night_completion_rate_pct".into(),
            pick(&date_night, &["completion_rate_pct"]),
        ),
        // Running
        (
            "running_miles_ytd".into(),
            pick(&running, &["running_miles_ytd", "miles_ytd", "miles_total"]),
        ),
        (
            "running_goal_miles".into(),
            pick(&running, &["running_goal_miles", "miles_goal"]),
        ),
        (
            "running_progress_pct".into(),
            pick(&running, &["running_progress_pct", "miles_progress_pct"]),
        ),
        // Shows
        (
            "denver_upcoming_show_count".into(),
            pick(
                &shows,
                &["denver_upcoming_show_count", "denver_events_upcoming_count"],
            ),
        ),
        ("next_show_date".into(), pick(&shows, &["next_show_date"])),
        ("next_show_title".into(), pick(&shows, &["next_show_title"])),
        ("next_show_venue".into(), pick(&shows, &["next_show_venue"])),
        ("next_show_url".into(), pick(&shows, &["next_show_url"])),
        (
            "unique_venues_count".into(),
            pick(&shows, &["unique_venues_count"]),
        ),
        // Listening
        (
            "spotify_minutes_ytd".into(),
            pick(&spotify, &["spotify_minutes_ytd"]),
        ),
        (
            "spotify_goal_minutes".into(),
            pick(&spotify, &["spotify_goal_minutes"]),
        ),
        (
            "spotify_progress_pct".into(),
            pick(&spotify, &["spotify_progress_pct"]),
        ),
        (
            "spotify_days_listened_ytd".into(),
            pick(&spotify, &["spotify_days_listened_ytd"]),
        ),
        (
            "spotify_unique_artists_ytd".into(),
            pick(&spotify, &["spotify_unique_artists_ytd"]),
        ),
        (
            "spotify_unique_tracks_ytd".into(),
            pick(&spotify, &["spotify_unique_tracks_ytd"]),
        ),
        (
            "spotify_top_artist_ytd".into(),
            pick(&spotify, &["spotify_top_artist_ytd"]),
        ),
        (
            "spotify_top_track_ytd".into(),
            pick(&spotify, &["spotify_top_track_ytd"]),
        ),
    ]
}

/// Upsert one consolidated row into the history table, keyed by `date`.
///
/// The header grows monotonically: columns new to this row are appended at
/// the end, never inserted, so existing columns keep their positions and the
/// file diffs append-only at the column level. A same-date row is replaced in
/// place; extra rows sharing that date (pre-existing corruption) are dropped,
/// keeping the first.
pub fn upsert_history(mut table: FlatTable, row: &[(String, String)]) -> FlatTable {
    for (column, _) in row {
        if !table.header.iter().any(|h| h == column) {
            table.header.push(column.clone());
        }
    }
    let width = table.header.len();
    for existing in &mut table.rows {
        existing.resize(width, String::new());
    }

    let values: HashMap<&str, &str> = row
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let new_cells: Vec<String> = table
        .header
        .iter()
        .map(|h| values.get(h.as_str()).copied().unwrap_or_default().to_string())
        .collect();

    let key_idx = table.column_index("date");
    let key_val = values.get("date").copied().unwrap_or_default();

    let mut rows = Vec::with_capacity(table.rows.len() + 1);
    let mut replaced = false;
    for existing in table.rows {
        let same_date = key_idx.map(|i| existing[i] == key_val).unwrap_or(false);
        if same_date {
            if !replaced {
                rows.push(new_cells.clone());
                replaced = true;
            }
            // later duplicates of the same date are dropped
        } else {
            rows.push(existing);
        }
    }
    if !replaced {
        rows.push(new_cells);
    }

    FlatTable {
        header: table.header,
        rows,
    }
}

/// Read → build row → upsert → rewrite the whole history file.
pub fn upsert_history_file(
    config: &PipelineConfig,
    today: NaiveDate,
    year: i32,
) -> Result<PathBuf> {
    let path = config.history_path();
    let existing = FlatTable::read(&path)?;
    let row = build_history_row(config, today, year);
    let updated = upsert_history(existing, &row);
    updated.write(&path)?;
    info!(path = %path.display(), rows = updated.rows.len(), "upserted daily history");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::EventSource;
    use tempfile::tempdir;

    fn config() -> PipelineConfig {
        PipelineConfig {
            data_root: PathBuf::from("data"),
            home_zone: chrono_tz::America::Denver,
            user_agent: "test".to_string(),
            http_timeout_secs: 5,
            aeg_feed_urls: Vec::new(),
            aeg_venue_filters: Vec::new(),
            ticketmaster: cadence_core::TicketmasterQuery {
                api_key: String::new(),
                city: "Denver".to_string(),
                state_code: "CO".to_string(),
                country_code: "US".to_string(),
                radius_miles: "50".to_string(),
                classification: "music".to_string(),
                page_size: 200,
            },
        }
    }

    fn event(source: EventSource, id: &str, title: &str, start: &str, url: &str) -> CanonicalEvent {
        CanonicalEvent {
            event_id: id.to_string(),
            source,
            source_venue_id: String::new(),
            title: title.to_string(),
            start_datetime: start.to_string(),
            venue_name: "Mission Ballroom".to_string(),
            venue_city: "Denver".to_string(),
            venue_region: "CO".to_string(),
            venue_country: "US".to_string(),
            event_url: url.to_string(),
            presented_by: String::new(),
            headliners: String::new(),
            supporting: String::new(),
        }
    }

    #[test]
    fn same_url_across_sources_keeps_one_record() {
        let shared = "https://www.axs.com/events/1/show";
        let rows = vec![
            event(EventSource::Aeg, "aeg-1", "The Show", "2026-05-01T20:00:00-06:00", shared),
            event(EventSource::Ticketmaster, "tm-9", "The Show", "2026-05-02T02:00:00Z", shared),
        ];
        let deduped = dedupe(rows);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].event_id, "aeg-1");
    }

    #[test]
    fn dedupe_is_idempotent_and_order_preserving() {
        let rows = vec![
            event(EventSource::Aeg, "a", "First", "2026-05-01", ""),
            event(EventSource::Aeg, "b", "Second", "2026-05-02", ""),
            event(EventSource::Aeg, "a2", "First", "2026-05-01", ""),
        ];
        let once = dedupe(rows);
        assert_eq!(once.len(), 2);
        assert_eq!(once[0].event_id, "a");
        assert_eq!(once[1].event_id, "b");
        let twice = dedupe(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn all_empty_fields_collide_on_the_signature_key() {
        // Accepted limitation: indistinguishable blank records collapse.
        let rows = vec![
            event(EventSource::Aeg, "x", "", "", ""),
            event(EventSource::Ticketmaster, "y", "", "", ""),
        ];
        let mut blank = rows;
        for row in &mut blank {
            row.venue_name.clear();
        }
        assert_eq!(dedupe(blank).len(), 1);
    }

    #[test]
    fn absent_feeds_aggregate_to_zeros() {
        let summary = aggregate_shows(&config(), Vec::new(), Vec::new(), 2026);
        assert_eq!(summary.upcoming_show_count, 0);
        assert_eq!(summary.next_show_title, "");
        assert_eq!(summary.next_show_date, "");
        assert_eq!(summary.unique_venues_count, 0);
        assert_eq!(summary.sources_present, "");
    }

    #[test]
    fn next_show_ties_break_by_input_order() {
        let rows = vec![
            event(EventSource::Aeg, "a", "Early A", "2026-06-01T20:00:00-06:00", "https://a"),
            event(EventSource::Aeg, "b", "Early B", "2026-06-01T20:00:00-06:00", "https://b"),
        ];
        let summary = aggregate_shows(&config(), rows, Vec::new(), 2026);
        assert_eq!(summary.next_show_title, "Early A");
    }

    #[test]
    fn year_filter_uses_home_zone_calendar() {
        // 03:00 UTC on Jan 1 2026 is Dec 31 2025 in Denver: not a 2026 show.
        let rows = vec![
            event(EventSource::Ticketmaster, "t1", "NYE", "2026-01-01T03:00:00Z", "https://t1"),
            event(EventSource::Ticketmaster, "t2", "Winter", "2026-01-15T02:00:00Z", "https://t2"),
        ];
        let summary = aggregate_shows(&config(), Vec::new(), rows, 2026);
        assert_eq!(summary.upcoming_show_count, 1);
        assert_eq!(summary.next_show_title, "Winter");
        // The local calendar date is one day earlier than the UTC date.
        assert_eq!(summary.next_show_date, "2026-01-14");
    }

    #[test]
    fn unparseable_starts_are_skipped_not_fatal() {
        let rows = vec![
            event(EventSource::Aeg, "good", "Kept", "2026-07-01T20:00:00-06:00", "https://g"),
            event(EventSource::Aeg, "bad", "Dropped", "TBA", "https://b"),
        ];
        let summary = aggregate_shows(&config(), rows, Vec::new(), 2026);
        assert_eq!(summary.upcoming_show_count, 1);
        assert_eq!(summary.combined_deduped_rows, 2);
    }

    #[test]
    fn sources_present_reports_provenance_sorted() {
        let aeg = vec![event(EventSource::Aeg, "a", "A", "nope", "https://a")];
        let tm = vec![event(EventSource::Ticketmaster, "t", "T", "nope", "https://t")];
        let summary = aggregate_shows(&config(), aeg, tm, 2026);
        assert_eq!(summary.sources_present, "aeg,ticketmaster");
        // Provenance covers the input even when every record fails the filter.
        assert_eq!(summary.upcoming_show_count, 0);
    }

    fn row(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn upsert_into_empty_table_creates_header_and_row() {
        let table = upsert_history(FlatTable::default(), &row(&[("date", "2026-01-01"), ("a", "1")]));
        assert_eq!(table.header, vec!["date", "a"]);
        assert_eq!(table.rows, vec![vec!["2026-01-01".to_string(), "1".to_string()]]);
    }

    #[test]
    fn upsert_is_idempotent() {
        let r = row(&[("date", "2026-01-01"), ("a", "1")]);
        let once = upsert_history(FlatTable::default(), &r);
        let twice = upsert_history(once.clone(), &r);
        assert_eq!(once, twice);
    }

    #[test]
    fn upsert_widens_header_and_backfills_blanks() {
        let mut table = upsert_history(FlatTable::default(), &row(&[("date", "2026-01-01"), ("a", "1")]));
        table = upsert_history(table, &row(&[("date", "2026-01-02"), ("a", "2")]));

        // New column `foo` arrives for day one only.
        let updated = upsert_history(
            table,
            &row(&[("date", "2026-01-01"), ("a", "9"), ("foo", "bar")]),
        );

        assert_eq!(updated.header, vec!["date", "a", "foo"]);
        assert_eq!(updated.rows.len(), 2);
        assert_eq!(updated.rows[0], vec!["2026-01-01", "9", "bar"]);
        assert_eq!(updated.rows[1], vec!["2026-01-02", "2", ""]);
    }

    #[test]
    fn upsert_replaces_in_place_and_heals_duplicate_dates() {
        let table = FlatTable {
            header: vec!["date".into(), "a".into()],
            rows: vec![
                vec!["2026-01-01".into(), "old".into()],
                vec!["2026-01-01".into(), "corrupt-duplicate".into()],
                vec!["2026-01-02".into(), "keep".into()],
            ],
        };
        let updated = upsert_history(table, &row(&[("date", "2026-01-01"), ("a", "new")]));
        assert_eq!(updated.rows.len(), 2);
        assert_eq!(updated.rows[0], vec!["2026-01-01", "new"]);
        assert_eq!(updated.rows[1], vec!["2026-01-02", "keep"]);
    }

    #[test]
    fn history_row_resolves_legacy_column_aliases() {
        let dir = tempdir().expect("tempdir");
        let config = config().with_data_root(dir.path());

        cadence_storage::write_single_row(
            &dir.path().join("sugarwod/metrics/fitness_summary_2026.csv"),
            &row(&[("classes_attended_2026", "87"), ("classes_goal", "156")]),
        )
        .expect("fitness");
        cadence_storage::write_single_row(
            &dir.path().join("running/metrics/running_summary_2026.csv"),
            &row(&[("miles_ytd", "140.5"), ("miles_goal", "365")]),
        )
        .expect("running");

        let today = NaiveDate::from_ymd_opt(2026, 8, 7).unwrap();
        let history: HashMap<String, String> =
            build_history_row(&config, today, 2026).into_iter().collect();

        assert_eq!(history["date"], "2026-08-07");
        assert_eq!(history["classes_attended_ytd"], "87");
        assert_eq!(history["running_miles_ytd"], "140.5");
        assert_eq!(history["running_goal_miles"], "365");
        // Domains with no summary on disk degrade to blanks.
        assert_eq!(history["fiction_read_ytd"], "");
        assert_eq!(history["spotify_minutes_ytd"], "");
    }

    #[test]
    fn upsert_history_file_round_trips() {
        let dir = tempdir().expect("tempdir");
        let config = config().with_data_root(dir.path());
        let today = NaiveDate::from_ymd_opt(2026, 8, 7).unwrap();

        let path = upsert_history_file(&config, today, 2026).expect("first upsert");
        let table = FlatTable::read(&path).expect("read");
        assert_eq!(table.rows.len(), 1);

        // Same day again: still one row.
        upsert_history_file(&config, today, 2026).expect("second upsert");
        let table = FlatTable::read(&path).expect("read");
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.header[0], "date");
    }
}

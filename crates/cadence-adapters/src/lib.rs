//! Per-vendor feed adapters: fetch raw JSON, normalize into canonical events.
//!
//! Each vendor shape is mapped to [`CanonicalEvent`] right here at the
//! ingestion boundary; nothing downstream ever touches vendor JSON. Field
//! extraction goes through explicit ordered alias lists, so every fallback a
//! feed has ever needed is visible at the call site.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cadence_core::{CanonicalEvent, EventSource, PipelineConfig};
use cadence_storage::{write_events, FetchError, HttpFetcher, SnapshotStore};
use chrono::Utc;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cadence-adapters";

pub const AXS_BASE_SITE: &str = "https://www.axs.com";
pub const TICKETMASTER_DISCOVERY_URL: &str =
    "https://app.ticketmaster.com/discovery/v2/events.json";

/// Hard stop on Discovery paging in case the reported page count lies.
const TICKETMASTER_MAX_PAGES: u64 = 50;
/// Polite inter-page delay against the Discovery API.
const TICKETMASTER_PAGE_DELAY: Duration = Duration::from_millis(350);

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("{feed} payload is not valid JSON: {reason}")]
    Payload { feed: EventSource, reason: String },
    #[error("{feed} feed is not configured: {reason}")]
    NotConfigured { feed: EventSource, reason: String },
}

/// One raw feed document (a whole feed, or one page of it).
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub label: String,
    pub raw: Vec<u8>,
    pub value: JsonValue,
}

/// Seam between a vendor feed and the pipeline. `fetch` talks to the network;
/// `parse` is pure and degrades per record, never per batch.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> EventSource;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        config: &PipelineConfig,
    ) -> Result<Vec<FetchedDocument>, AdapterError>;

    fn parse(&self, doc: &FetchedDocument, config: &PipelineConfig) -> Vec<CanonicalEvent>;
}

pub fn adapter_for_source(source: EventSource) -> &'static dyn SourceAdapter {
    match source {
        EventSource::Aeg => &AegAdapter,
        EventSource::Ticketmaster => &TicketmasterAdapter,
    }
}

/// Fetch one feed end to end: snapshot every raw document, parse, collapse
/// per-source duplicates by `(source, event_id)` keeping the first sighting,
/// and overwrite the source's processed event table.
pub async fn refresh_feed(
    source: EventSource,
    http: &HttpFetcher,
    config: &PipelineConfig,
) -> Result<usize> {
    let adapter = adapter_for_source(source);
    let store = SnapshotStore::new(config.shows_raw_dir(source));
    let fetched_at = Utc::now();

    let docs = adapter
        .fetch(http, config)
        .await
        .with_context(|| format!("fetching {source} feed"))?;

    let mut events = Vec::new();
    for doc in &docs {
        store
            .store(fetched_at, &doc.label, &doc.raw)
            .await
            .with_context(|| format!("storing {source} snapshot {}", doc.label))?;
        events.extend(adapter.parse(doc, config));
    }

    let mut seen = std::collections::HashSet::new();
    events.retain(|event| seen.insert((event.source, event.event_id.clone())));

    let table_path = config.events_table_path(source);
    write_events(&table_path, &events)
        .with_context(|| format!("writing {}", table_path.display()))?;
    info!(source = %source, rows = events.len(), path = %table_path.display(), "refreshed feed");
    Ok(events.len())
}

/// Stable identifier for events the vendor did not assign one to.
pub fn derived_event_id(
    source: EventSource,
    title: &str,
    start: &str,
    venue: &str,
    url: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{source}|{title}|{start}|{venue}|{url}").as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

// --- ordered-alias JSON extraction -----------------------------------------

fn value_to_string(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// First non-empty value among `keys` of a JSON object, in declared order.
fn first_str(obj: &JsonValue, keys: &[&str]) -> String {
    for key in keys {
        let s = value_to_string(&obj[*key]);
        if !s.is_empty() {
            return s;
        }
    }
    String::new()
}

/// String at a nested path, empty when any hop is missing.
fn nested_str(obj: &JsonValue, path: &[&str]) -> String {
    let mut cur = obj;
    for key in path {
        cur = &cur[*key];
    }
    value_to_string(cur)
}

fn join_site(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{base}{href}")
    } else {
        format!("{base}/{href}")
    }
}

// --- AEG (axs.com venue feeds) ----------------------------------------------

pub struct AegAdapter;

impl AegAdapter {
    fn events_list(doc: &JsonValue) -> &[JsonValue] {
        if let Some(list) = doc.as_array() {
            return list;
        }
        doc["events"].as_array().map(Vec::as_slice).unwrap_or(&[])
    }

    fn title_of(ev: &JsonValue) -> String {
        match &ev["title"] {
            JsonValue::Object(_) => first_str(
                &ev["title"],
                &["eventTitleText", "headlinersText", "presentedByText"],
            ),
            JsonValue::String(s) => s.trim().to_string(),
            _ => first_str(ev, &["name", "eventName", "headline"]),
        }
    }

    fn lineup_of(ev: &JsonValue) -> (String, String, String) {
        let title = &ev["title"];
        if !title.is_object() {
            return (String::new(), String::new(), String::new());
        }
        let presented_by = value_to_string(&title["presentedByText"]);
        let headliners = first_str(title, &["headlinersText", "eventTitleText"]);
        let supporting = value_to_string(&title["supportingText"]);
        (presented_by, headliners, supporting)
    }

    fn url_of(ev: &JsonValue) -> String {
        let links = &ev["links"];

        if links.is_object() {
            for key in ["event", "tickets", "axs", "url", "eventUrl", "purchase"] {
                let v = value_to_string(&links[key]);
                if !v.is_empty() {
                    return join_site(AXS_BASE_SITE, &v);
                }
            }
            if let Some(map) = links.as_object() {
                for v in map.values() {
                    if let Some(s) = v.as_str() {
                        if s.trim().starts_with("http") {
                            return s.trim().to_string();
                        }
                    }
                }
            }
        }

        if let Some(items) = links.as_array() {
            for item in items {
                if let Some(s) = item.as_str() {
                    if !s.trim().is_empty() {
                        return join_site(AXS_BASE_SITE, s);
                    }
                }
                if item.is_object() {
                    let u = first_str(item, &["url", "href"]);
                    if !u.is_empty() {
                        return join_site(AXS_BASE_SITE, &u);
                    }
                }
            }
        }

        let ticketing = &ev["ticketing"];
        if ticketing.is_object() {
            let u = first_str(ticketing, &["url", "purchaseUrl"]);
            if !u.is_empty() {
                return join_site(AXS_BASE_SITE, &u);
            }
        }

        String::new()
    }

    /// Venue id segment from a feed URL of the form `.../events/<id>/events.json`.
    fn venue_id_from_url(url: &str) -> String {
        url.split_once("/events/")
            .map(|(_, tail)| tail.split('/').next().unwrap_or_default().to_string())
            .unwrap_or_default()
    }

    fn matches_venue_filter(venue_name: &str, filters: &[String]) -> bool {
        if filters.is_empty() {
            return true;
        }
        let v = venue_name.to_lowercase();
        filters.iter().any(|f| v.contains(f))
    }
}

#[async_trait]
impl SourceAdapter for AegAdapter {
    fn source(&self) -> EventSource {
        EventSource::Aeg
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        config: &PipelineConfig,
    ) -> Result<Vec<FetchedDocument>, AdapterError> {
        if config.aeg_feed_urls.is_empty() {
            return Err(AdapterError::NotConfigured {
                feed: EventSource::Aeg,
                reason: "no feed urls (AEG_EVENTS_URLS)".to_string(),
            });
        }

        let mut docs = Vec::new();
        for url in &config.aeg_feed_urls {
            let resp = http.get(url, &[]).await?;
            let value: JsonValue =
                serde_json::from_slice(&resp.body).map_err(|err| AdapterError::Payload {
                    feed: EventSource::Aeg,
                    reason: err.to_string(),
                })?;
            let venue_id = Self::venue_id_from_url(url);
            let label = if venue_id.is_empty() {
                "events".to_string()
            } else {
                format!("events_{venue_id}")
            };
            docs.push(FetchedDocument {
                label,
                raw: resp.body,
                value,
            });
        }
        Ok(docs)
    }

    fn parse(&self, doc: &FetchedDocument, config: &PipelineConfig) -> Vec<CanonicalEvent> {
        let venue_id = doc.label.strip_prefix("events_").unwrap_or_default();
        let mut events = Vec::new();

        for ev in Self::events_list(&doc.value) {
            if !ev.is_object() {
                continue;
            }

            let venue = &ev["venue"];
            let venue_name = first_str(venue, &["name", "title", "venueName", "displayName"]);
            if !Self::matches_venue_filter(&venue_name, &config.aeg_venue_filters) {
                continue;
            }

            let title = Self::title_of(ev);
            let (presented_by, headliners, supporting) = Self::lineup_of(ev);
            let start =
                first_str(ev, &["eventDateTimeISO", "eventDateTime", "eventDateTimeUTC"]);
            let event_url = Self::url_of(ev);

            let mut event_id = first_str(ev, &["eventId", "id"]);
            if event_id.is_empty() {
                event_id = derived_event_id(
                    EventSource::Aeg,
                    &title,
                    &start,
                    &venue_name,
                    &event_url,
                );
            }

            events.push(CanonicalEvent {
                event_id,
                source: EventSource::Aeg,
                source_venue_id: venue_id.to_string(),
                title,
                start_datetime: start,
                venue_name,
                venue_city: first_str(venue, &["city"]),
                venue_region: first_str(venue, &["region", "state", "province", "stateCode"]),
                venue_country: first_str(venue, &["country"]),
                event_url,
                presented_by,
                headliners,
                supporting,
            });
        }

        events
    }
}

// --- Ticketmaster Discovery v2 ----------------------------------------------

pub struct TicketmasterAdapter;

impl TicketmasterAdapter {
    fn start_of(ev: &JsonValue) -> String {
        let date_time = nested_str(ev, &["dates", "start", "dateTime"]);
        if !date_time.is_empty() {
            return date_time;
        }
        let local_date = nested_str(ev, &["dates", "start", "localDate"]);
        let local_time = nested_str(ev, &["dates", "start", "localTime"]);
        if !local_date.is_empty() && !local_time.is_empty() {
            return format!("{local_date}T{local_time}");
        }
        local_date
    }

    fn venue_of(ev: &JsonValue) -> (String, String, String, String) {
        let v0 = ev["_embedded"]["venues"]
            .as_array()
            .and_then(|venues| venues.first())
            .cloned()
            .unwrap_or(JsonValue::Null);
        (
            value_to_string(&v0["name"]),
            nested_str(&v0, &["city", "name"]),
            nested_str(&v0, &["state", "stateCode"]),
            nested_str(&v0, &["country", "countryCode"]),
        )
    }

    fn lineup_of(ev: &JsonValue) -> (String, String) {
        let names: Vec<String> = ev["_embedded"]["attractions"]
            .as_array()
            .map(|attractions| {
                attractions
                    .iter()
                    .map(|a| value_to_string(&a["name"]))
                    .filter(|name| !name.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let headliners = names.first().cloned().unwrap_or_default();
        let supporting = if names.len() > 1 {
            names[1..].join(", ")
        } else {
            String::new()
        };
        (headliners, supporting)
    }
}

#[async_trait]
impl SourceAdapter for TicketmasterAdapter {
    fn source(&self) -> EventSource {
        EventSource::Ticketmaster
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        config: &PipelineConfig,
    ) -> Result<Vec<FetchedDocument>, AdapterError> {
        let tm = &config.ticketmaster;
        if tm.api_key.is_empty() {
            return Err(AdapterError::NotConfigured {
                feed: EventSource::Ticketmaster,
                reason: "no api key (TICKETMASTER_API_KEY)".to_string(),
            });
        }

        let mut docs = Vec::new();
        let mut page: u64 = 0;
        let mut total_pages: u64 = 0;

        loop {
            let query = [
                ("apikey", tm.api_key.clone()),
                ("classificationName", tm.classification.clone()),
                ("city", tm.city.clone()),
                ("stateCode", tm.state_code.clone()),
                ("countryCode", tm.country_code.clone()),
                ("radius", tm.radius_miles.clone()),
                ("unit", "miles".to_string()),
                ("size", tm.page_size.to_string()),
                ("page", page.to_string()),
                ("sort", "date,asc".to_string()),
            ];

            let resp = http.get(TICKETMASTER_DISCOVERY_URL, &query).await?;
            let value: JsonValue =
                serde_json::from_slice(&resp.body).map_err(|err| AdapterError::Payload {
                    feed: EventSource::Ticketmaster,
                    reason: err.to_string(),
                })?;

            if let Some(reported) = value["page"]["totalPages"].as_u64() {
                total_pages = reported;
            }

            docs.push(FetchedDocument {
                label: format!("events_page{page}"),
                raw: resp.body,
                value,
            });

            page += 1;
            if total_pages > 0 && page >= total_pages {
                break;
            }
            if page > TICKETMASTER_MAX_PAGES {
                warn!(page, "stopping ticketmaster paging at safety cap");
                break;
            }
            tokio::time::sleep(TICKETMASTER_PAGE_DELAY).await;
        }

        Ok(docs)
    }

    fn parse(&self, doc: &FetchedDocument, _config: &PipelineConfig) -> Vec<CanonicalEvent> {
        let events = doc.value["_embedded"]["events"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let mut out = Vec::new();
        for ev in events {
            if !ev.is_object() {
                continue;
            }

            let (venue_name, venue_city, venue_region, venue_country) = Self::venue_of(ev);
            let title = value_to_string(&ev["name"]);
            let start = Self::start_of(ev);
            let event_url = value_to_string(&ev["url"]);
            let (headliners, supporting) = Self::lineup_of(ev);

            let mut event_id = value_to_string(&ev["id"]);
            if event_id.is_empty() {
                event_id = derived_event_id(
                    EventSource::Ticketmaster,
                    &title,
                    &start,
                    &venue_name,
                    &event_url,
                );
            }

            out.push(CanonicalEvent {
                event_id,
                source: EventSource::Ticketmaster,
                source_venue_id: String::new(),
                title,
                start_datetime: start,
                venue_name,
                venue_city,
                venue_region,
                venue_country,
                event_url,
                presented_by: String::new(),
                headliners,
                supporting,
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            data_root: std::path::PathBuf::from("data"),
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

    fn doc(label: &str, value: serde_json::Value) -> FetchedDocument {
        FetchedDocument {
            label: label.to_string(),
            raw: Vec::new(),
            value,
        }
    }

    #[test]
    fn aeg_title_object_and_relative_link() {
        let payload = json!({
            "events": [{
                "eventId": 12345,
                "title": {
                    "eventTitleText": "Big Night Out",
                    "headlinersText": "The Headliner",
                    "supportingText": "Opener A, Opener B",
                    "presentedByText": "Presented by KTCL"
                },
                "venue": {"name": "Mission Ballroom", "city": "Denver", "state": "CO", "country": "US"},
                "eventDateTimeISO": "2026-01-09T20:00:00-07:00",
                "links": {"event": "/events/12345/big-night-out"}
            }]
        });

        let events = AegAdapter.parse(&doc("events_123", payload), &test_config());
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.event_id, "12345");
        assert_eq!(ev.source_venue_id, "123");
        assert_eq!(ev.title, "Big Night Out");
        assert_eq!(ev.headliners, "The Headliner");
        assert_eq!(ev.supporting, "Opener A, Opener B");
        assert_eq!(ev.presented_by, "Presented by KTCL");
        assert_eq!(ev.venue_region, "CO");
        assert_eq!(ev.event_url, "https://www.axs.com/events/12345/big-night-out");
    }

    #[test]
    fn aeg_string_title_and_missing_id_derives_one() {
        let payload = json!([{
            "title": "Plain Title",
            "venue": {"venueName": "Gothic Theatre"},
            "eventDateTime": "2026-02-01T19:00:00",
            "ticketing": {"purchaseUrl": "https://tickets.example/1"}
        }]);

        let events = AegAdapter.parse(&doc("events", payload), &test_config());
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.title, "Plain Title");
        assert_eq!(ev.venue_name, "Gothic Theatre");
        assert_eq!(ev.event_url, "https://tickets.example/1");
        assert_eq!(ev.event_id.len(), 16);
        assert_eq!(
            ev.event_id,
            derived_event_id(
                EventSource::Aeg,
                "Plain Title",
                "2026-02-01T19:00:00",
                "Gothic Theatre",
                "https://tickets.example/1"
            )
        );
    }

    #[test]
    fn aeg_venue_filter_drops_other_rooms() {
        let payload = json!({"events": [
            {"title": "Keep", "venue": {"name": "Ogden Theatre"}, "eventDateTimeISO": "2026-03-01"},
            {"title": "Drop", "venue": {"name": "Red Rocks"}, "eventDateTimeISO": "2026-03-02"}
        ]});

        let mut config = test_config();
        config.aeg_venue_filters = vec!["ogden".to_string()];
        let events = AegAdapter.parse(&doc("events", payload), &config);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Keep");
    }

    #[test]
    fn ticketmaster_full_shape() {
        let payload = json!({
            "_embedded": {"events": [{
                "id": "vvG1zZ9pqeqkbF",
                "name": "Touring Act",
                "url": "https://www.ticketmaster.com/event/1",
                "dates": {"start": {"dateTime": "2026-01-09T03:00:00Z", "localDate": "2026-01-08"}},
                "_embedded": {
                    "venues": [{"name": "Fillmore Auditorium",
                                "city": {"name": "Denver"},
                                "state": {"stateCode": "CO"},
                                "country": {"countryCode": "US"}}],
                    "attractions": [{"name": "Touring Act"}, {"name": "Support One"}, {"name": "Support Two"}]
                }
            }]},
            "page": {"totalPages": 1}
        });

        let events = TicketmasterAdapter.parse(&doc("events_page0", payload), &test_config());
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.event_id, "vvG1zZ9pqeqkbF");
        assert_eq!(ev.start_datetime, "2026-01-09T03:00:00Z");
        assert_eq!(ev.venue_name, "Fillmore Auditorium");
        assert_eq!(ev.venue_city, "Denver");
        assert_eq!(ev.headliners, "Touring Act");
        assert_eq!(ev.supporting, "Support One, Support Two");
        assert_eq!(ev.source_venue_id, "");
    }

    #[test]
    fn ticketmaster_local_date_time_fallbacks() {
        let with_both = json!({"_embedded": {"events": [
            {"id": "a", "name": "A",
             "dates": {"start": {"localDate": "2026-04-01", "localTime": "19:30:00"}}}
        ]}});
        let date_only = json!({"_embedded": {"events": [
            {"id": "b", "name": "B", "dates": {"start": {"localDate": "2026-04-02"}}}
        ]}});

        let config = test_config();
        let a = TicketmasterAdapter.parse(&doc("p0", with_both), &config);
        assert_eq!(a[0].start_datetime, "2026-04-01T19:30:00");
        let b = TicketmasterAdapter.parse(&doc("p0", date_only), &config);
        assert_eq!(b[0].start_datetime, "2026-04-02");
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let payload = json!({"_embedded": {"events": [
            "not an object",
            {"id": "ok", "name": "Survivor", "dates": {"start": {"localDate": "2026-05-05"}}}
        ]}});
        let events = TicketmasterAdapter.parse(&doc("p0", payload), &test_config());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].title, "Survivor");
    }

    #[test]
    fn venue_id_parsed_from_feed_url() {
        assert_eq!(
            AegAdapter::venue_id_from_url("https://api.example/venues/events/987/events.json"),
            "987"
        );
        assert_eq!(AegAdapter::venue_id_from_url("https://api.example/feed.json"), "");
    }
}

//! HTTP-backed sources for the three scrape kinds.
//!
//! Every response is classified into a [`FetchError`] kind here, so the
//! scrapers never look at status codes.

use crate::chunk::{RangeQuery, RangeSource};
use crate::config::{
    pause, Pacing, CROWDTANGLE_PAGE_SIZE, CROWDTANGLE_RESULT_CAP, DEFAULT_MAX_TRIES, HTTP_TIMEOUT,
    USER_AGENT,
};
use crate::error::FetchError;
use crate::models::Chunk;
use crate::pager::{FeedQuery, Page, PageSource};
use crate::queue::{ItemSource, RetryItem};
use crate::retry::with_retries;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

const CROWDTANGLE_API: &str = "https://api.crowdtangle.com";
const RAPIDAPI_HOST: &str = "instagram-data1.p.rapidapi.com";
/// Search keys the source sets itself; query params never override them.
const RESERVED_PARAMS: &[&str] = &["token", "startDate", "endDate", "count", "offset"];

/// Maps a non-success status to its failure kind.
pub fn classify_status(status: StatusCode, detail: &str) -> Option<FetchError> {
    if status.is_success() {
        return None;
    }
    let msg = format!("{} {}", status, detail);
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited(msg),
        s if s.is_server_error() => FetchError::Transient(msg),
        StatusCode::REQUEST_TIMEOUT => FetchError::Transient(msg),
        // 404, 410 and every other client error: asking again will not help
        _ => FetchError::NotFound(msg),
    })
}

fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_decode() {
        FetchError::Schema(err.to_string())
    } else {
        FetchError::Transient(err.to_string())
    }
}

/// Blocking client shared by the concrete sources.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(headers: HeaderMap) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn get(&self, url: &str, query: &[(String, String)]) -> Result<Response, FetchError> {
        debug!(url, "GET");
        let response = self.client.get(url).query(query).send().map_err(classify_transport)?;
        match classify_status(response.status(), url) {
            Some(err) => Err(err),
            None => Ok(response),
        }
    }

    pub fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<Value, FetchError> {
        let response = self.get(url, query)?;
        let bytes = response.bytes().map_err(classify_transport)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::Schema(format!("invalid JSON from {}: {}", url, e)))
    }

    pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.get(url, &[])?;
        Ok(response.bytes().map_err(classify_transport)?.to_vec())
    }
}

fn param_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Records and continuation link of one CrowdTangle response page.
pub fn crowdtangle_page(body: &Value) -> Result<(Vec<Value>, Option<String>), FetchError> {
    let result = body
        .get("result")
        .ok_or_else(|| FetchError::schema("CrowdTangle response has no 'result'"))?;
    let records = result
        .get("posts")
        .or_else(|| result.get("accountStatistics"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let next = result
        .pointer("/pagination/nextPage")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok((records, next))
}

/// Follows `nextPage` links until none is left or `cap` records are held.
///
/// `fetch` gets `None` for the first page and the link for every later one.
/// Later pages wait `pacing.request_delay` and are retried in place, so a
/// failed page keeps the pages collected before it.
pub fn collect_crowdtangle_pages<F>(
    mut fetch: F,
    pacing: &Pacing,
    max_tries: u32,
    cap: usize,
    unit: &str,
) -> Result<Vec<Value>, FetchError>
where
    F: FnMut(Option<&str>) -> Result<Value, FetchError>,
{
    let mut body = fetch(None)?;
    let mut collected = Vec::new();

    loop {
        let (records, next) = crowdtangle_page(&body)?;
        collected.extend(records);
        match next {
            Some(url) if collected.len() < cap => {
                pause(pacing.request_delay);
                body = with_retries(max_tries, pacing, unit, || fetch(Some(&url)))?;
            }
            Some(_) => {
                warn!(unit, cap, "Result cap reached; remaining pages are dropped by the source");
                break;
            }
            None => break,
        }
    }
    Ok(collected)
}

/// CrowdTangle's date-filtered endpoints (`/posts`, `/posts/search`,
/// `/leaderboard`, `/links`).
pub struct CrowdTangleSource {
    http: HttpFetcher,
    token: String,
    base_url: String,
    pacing: Pacing,
    max_tries: u32,
}

impl CrowdTangleSource {
    pub fn new(token: &str, pacing: Pacing) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(HeaderMap::new())?,
            token: token.to_string(),
            base_url: CROWDTANGLE_API.to_string(),
            pacing,
            max_tries: DEFAULT_MAX_TRIES,
        })
    }

    /// Search parameters from the query; the paging and date keys are always ours.
    fn params(
        &self,
        query: &RangeQuery,
        start: NaiveDate,
        end: NaiveDate,
        count: u32,
    ) -> Vec<(String, String)> {
        let mut params = vec![
            ("token".to_string(), self.token.clone()),
            ("startDate".to_string(), start.format("%Y-%m-%d").to_string()),
            ("endDate".to_string(), end.format("%Y-%m-%d").to_string()),
            ("count".to_string(), count.to_string()),
        ];
        params.extend(
            query
                .params
                .iter()
                .filter(|(k, _)| !RESERVED_PARAMS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), param_value(v))),
        );
        params
    }

    fn endpoint(&self, query: &RangeQuery) -> String {
        format!("{}/{}", self.base_url, query.query_type.trim_start_matches('/'))
    }
}

impl RangeSource for CrowdTangleSource {
    fn fetch_chunk(
        &mut self,
        query: &RangeQuery,
        chunk: &Chunk<NaiveDate>,
    ) -> Result<Value, FetchError> {
        let endpoint = self.endpoint(query);
        let params = self.params(query, chunk.start, chunk.end, CROWDTANGLE_PAGE_SIZE);
        let http = &self.http;
        let collected = collect_crowdtangle_pages(
            |next| match next {
                None => http.get_json(&endpoint, &params),
                Some(url) => http.get_json(url, &[]),
            },
            &self.pacing,
            self.max_tries,
            CROWDTANGLE_RESULT_CAP,
            &chunk.to_string(),
        )?;
        Ok(Value::Array(collected))
    }

    fn hit_count(&mut self, query: &RangeQuery, from: NaiveDate) -> Result<u64, FetchError> {
        let params = self.params(query, from, query.end, 0);
        let body = self.http.get_json(&self.endpoint(query), &params)?;
        body.pointer("/result/hitCount")
            .and_then(Value::as_u64)
            .ok_or_else(|| FetchError::schema("CrowdTangle response has no 'result.hitCount'"))
    }

    fn page_size(&self) -> u32 {
        CROWDTANGLE_PAGE_SIZE
    }

    fn result_cap(&self) -> Option<usize> {
        Some(CROWDTANGLE_RESULT_CAP)
    }
}

/// Instagram location / hashtag / user feeds via RapidAPI.
pub struct RapidApiFeedSource {
    http: HttpFetcher,
    query: FeedQuery,
}

impl RapidApiFeedSource {
    pub fn new(api_key: &str, query: FeedQuery) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("x-rapidapi-host", HeaderValue::from_static(RAPIDAPI_HOST));
        headers.insert(
            "x-rapidapi-key",
            HeaderValue::from_str(api_key).context("RapidAPI key is not a valid header value")?,
        );
        Ok(Self {
            http: HttpFetcher::new(headers)?,
            query,
        })
    }
}

/// Reads a feed response: `collector`, `end_cursor`, `has_more`, `count`.
pub fn decode_feed_page(raw: &Value) -> Result<Page, FetchError> {
    let items = raw
        .get("collector")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| FetchError::schema("feed response has no 'collector' list"))?;
    let has_more = raw
        .get("has_more")
        .and_then(Value::as_bool)
        .ok_or_else(|| FetchError::schema("feed response has no 'has_more' flag"))?;
    Ok(Page {
        items,
        next_cursor: raw.get("end_cursor").and_then(Value::as_str).unwrap_or_default().to_string(),
        has_more,
        total: raw.get("count").and_then(Value::as_u64),
    })
}

impl PageSource for RapidApiFeedSource {
    fn fetch_raw(&mut self, cursor: &str) -> Result<Value, FetchError> {
        let url = format!("https://{}/{}/feed", RAPIDAPI_HOST, self.query.mode);
        self.http.get_json(
            &url,
            &[
                (self.query.mode.param_name().to_string(), self.query.term.clone()),
                ("end_cursor".to_string(), cursor.to_string()),
            ],
        )
    }

    fn decode(&self, raw: &Value) -> Result<Page, FetchError> {
        decode_feed_page(raw)
    }
}

pub fn media_url(shortcode: &str) -> String {
    format!("https://www.instagram.com/p/{}/media/?size=l", shortcode)
}

/// Post images, addressed by post id and shortcode.
pub struct ImageSource {
    http: HttpFetcher,
    media_endpoint: bool,
}

impl ImageSource {
    /// With `media_endpoint`, images come from the stable per-shortcode URL
    /// instead of the (expiring) URL recorded in the item.
    pub fn new(media_endpoint: bool) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(HeaderMap::new())?,
            media_endpoint,
        })
    }

    pub fn url_for(&self, item: &RetryItem) -> Option<String> {
        if self.media_endpoint && !item.label.is_empty() {
            Some(media_url(&item.label))
        } else if !item.url.is_empty() {
            Some(item.url.clone())
        } else {
            None
        }
    }
}

impl ItemSource for ImageSource {
    fn extension(&self) -> &str {
        "jpg"
    }

    fn fetch(&mut self, item: &RetryItem) -> Result<Vec<u8>, FetchError> {
        let url = self
            .url_for(item)
            .ok_or_else(|| FetchError::NotFound(format!("no image url for item {}", item.key)))?;
        self.http.get_bytes(&url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, Instant};

    #[test]
    fn status_codes_map_to_failure_kinds() {
        assert_eq!(classify_status(StatusCode::OK, ""), None);
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            Some(FetchError::RateLimited(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, ""),
            Some(FetchError::Transient(_))
        ));
        for status in [StatusCode::NOT_FOUND, StatusCode::GONE, StatusCode::FORBIDDEN] {
            assert!(matches!(classify_status(status, ""), Some(FetchError::NotFound(_))));
        }
    }

    #[test]
    fn crowdtangle_page_reads_posts_and_next() {
        let body = json!({
            "status": 200,
            "result": {"posts": [{"id": 1}, {"id": 2}], "pagination": {"nextPage": "https://next"}}
        });
        let (records, next) = crowdtangle_page(&body).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(next.as_deref(), Some("https://next"));
    }

    #[test]
    fn crowdtangle_page_reads_leaderboard() {
        let body = json!({"result": {"accountStatistics": [{"account": {}}]}});
        let (records, next) = crowdtangle_page(&body).unwrap();
        assert_eq!(records.len(), 1);
        assert!(next.is_none());
        assert!(crowdtangle_page(&json!({"status": 401})).is_err());
    }

    fn crowdtangle_body(ids: &[u64], next: Option<&str>) -> Value {
        let posts: Vec<Value> = ids.iter().map(|id| json!({ "id": id })).collect();
        json!({"result": {"posts": posts, "pagination": {"nextPage": next}}})
    }

    /// Serves `first` → `p2` → `p3` → end; `p3` is rate limited on its first request.
    fn scripted_pages(
        calls: &mut Vec<(String, Instant)>,
    ) -> impl FnMut(Option<&str>) -> Result<Value, FetchError> + '_ {
        let mut throttled = false;
        move |next| {
            let label = next.unwrap_or("first").to_string();
            calls.push((label.clone(), Instant::now()));
            match label.as_str() {
                "first" => Ok(crowdtangle_body(&[1, 2], Some("p2"))),
                "p2" => Ok(crowdtangle_body(&[3], Some("p3"))),
                "p3" if !throttled => {
                    throttled = true;
                    Err(FetchError::RateLimited("429".into()))
                }
                "p3" => Ok(crowdtangle_body(&[4], None)),
                other => Err(FetchError::NotFound(other.to_string())),
            }
        }
    }

    #[test]
    fn throttled_page_is_retried_in_place() {
        let mut calls = Vec::new();
        let pages = scripted_pages(&mut calls);
        let records =
            collect_crowdtangle_pages(pages, &Pacing::immediate(), 3, 1000, "chunk").unwrap();

        let ids: Vec<u64> = records.iter().filter_map(|r| r["id"].as_u64()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        let order: Vec<&str> = calls.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(order, vec!["first", "p2", "p3", "p3"]);
    }

    #[test]
    fn pages_wait_for_request_delay() {
        let pacing = Pacing {
            request_delay: Duration::from_millis(15),
            rate_limit_delay: Duration::from_millis(30),
            ..Pacing::immediate()
        };
        let mut calls = Vec::new();
        collect_crowdtangle_pages(scripted_pages(&mut calls), &pacing, 3, 1000, "chunk").unwrap();

        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1].1.duration_since(w[0].1)).collect();
        assert_eq!(gaps.len(), 3);
        assert!(gaps[0] >= Duration::from_millis(15));
        assert!(gaps[1] >= Duration::from_millis(15));
        // the retried page waits out the rate limit instead
        assert!(gaps[2] >= Duration::from_millis(30));
    }

    #[test]
    fn page_retries_give_up_after_max_tries() {
        let mut calls = 0;
        let result = collect_crowdtangle_pages(
            |next| {
                calls += 1;
                match next {
                    None => Ok(crowdtangle_body(&[1], Some("p2"))),
                    Some(_) => Err(FetchError::Transient("reset".into())),
                }
            },
            &Pacing::immediate(),
            3,
            1000,
            "chunk",
        );
        assert!(matches!(result, Err(FetchError::Transient(_))));
        assert_eq!(calls, 4);
    }

    #[test]
    fn paging_stops_at_result_cap() {
        let mut calls = Vec::new();
        let pages = scripted_pages(&mut calls);
        let records =
            collect_crowdtangle_pages(pages, &Pacing::immediate(), 3, 3, "chunk").unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn feed_page_decodes_fields() {
        let raw = json!({
            "collector": [{"id": "1"}],
            "end_cursor": "QVF",
            "has_more": true,
            "count": 512
        });
        let page = decode_feed_page(&raw).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor, "QVF");
        assert!(page.has_more);
        assert_eq!(page.total, Some(512));

        let last_raw = json!({"collector": [], "end_cursor": null, "has_more": false});
        let last = decode_feed_page(&last_raw).unwrap();
        assert_eq!(last.next_cursor, "");
        let no_items = decode_feed_page(&json!({"has_more": false}));
        assert!(matches!(no_items, Err(FetchError::Schema(_))));
    }

    #[test]
    fn image_url_prefers_media_endpoint() {
        let source = ImageSource::new(true).unwrap();
        let item = RetryItem::new("9", "Bx1", "https://cdn/x.jpg", 3);
        assert_eq!(source.url_for(&item).unwrap(), "https://www.instagram.com/p/Bx1/media/?size=l");
        assert_eq!(crate::queue::artifact_name(&item, source.extension()), "9_Bx1.jpg");

        let direct = ImageSource::new(false).unwrap();
        assert_eq!(direct.url_for(&item).unwrap(), "https://cdn/x.jpg");
        assert!(direct.url_for(&RetryItem::new("1", "", "", 3)).is_none());
    }
}

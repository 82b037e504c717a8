//! Turning raw response artifacts into table rows.

use crate::pager::FeedMode;
use chrono::DateTime;
use serde_json::Value;

/// Cell value for a field the artifact does not carry.
pub const MISSING: &str = "";

/// Maps one artifact to rows of a fixed column set.
pub trait Extractor {
    fn columns(&self) -> &[&'static str];

    /// Columns whose combined values identify a record across artifacts.
    fn key(&self) -> &[&'static str];

    fn extract(&self, artifact: &Value) -> Vec<Vec<String>>;
}

/// Renders a JSON value as a table cell. Nested structures keep their JSON
/// form so lists like hashtags survive the flattening.
pub fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => MISSING.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

/// `lookup(post, "/statistics/actual/favoriteCount")`
pub fn lookup<'v>(value: &'v Value, pointer: &str) -> Option<&'v Value> {
    value.pointer(pointer)
}

/// Items of the artifact's top-level array, or of the array under `field`.
fn records<'v>(artifact: &'v Value, field: Option<&str>) -> &'v [Value] {
    let list = match field {
        Some(f) => artifact.get(f),
        None => Some(artifact),
    };
    list.and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
}

const POST_SEARCH_FIELDS: &[(&str, &str)] = &[
    ("account_name", "/account/name"),
    ("account_handle", "/account/handle"),
    ("account_subscriberCount", "/account/subscriberCount"),
    ("account_platformId", "/account/platformId"),
    ("date", "/date"),
    ("description", "/description"),
    ("id", "/id"),
    ("platform", "/platform"),
    ("platformId", "/platformId"),
    ("postUrl", "/postUrl"),
    ("score", "/score"),
    ("statistics_actual_favoriteCount", "/statistics/actual/favoriteCount"),
    ("statistics_actual_commentCount", "/statistics/actual/commentCount"),
    ("statistics_expected_favoriteCount", "/statistics/expected/favoriteCount"),
    ("statistics_expected_commentCount", "/statistics/expected/commentCount"),
    ("subscriberCount", "/subscriberCount"),
    ("type", "/type"),
];

const POST_SEARCH_COLUMNS: &[&str] = &[
    "account_name",
    "account_handle",
    "account_subscriberCount",
    "account_platformId",
    "date",
    "description",
    "id",
    "platform",
    "platformId",
    "postUrl",
    "score",
    "statistics_actual_favoriteCount",
    "statistics_actual_commentCount",
    "statistics_expected_favoriteCount",
    "statistics_expected_commentCount",
    "subscriberCount",
    "type",
];

/// Posts from CrowdTangle chunk artifacts (a JSON array of posts).
#[derive(Debug, Clone, Copy, Default)]
pub struct PostSearchExtractor;

impl Extractor for PostSearchExtractor {
    fn columns(&self) -> &[&'static str] {
        POST_SEARCH_COLUMNS
    }

    fn key(&self) -> &[&'static str] {
        &["id"]
    }

    fn extract(&self, artifact: &Value) -> Vec<Vec<String>> {
        records(artifact, None)
            .iter()
            .map(|post| {
                POST_SEARCH_FIELDS
                    .iter()
                    .map(|(_, pointer)| cell(lookup(post, pointer)))
                    .collect()
            })
            .collect()
    }
}

const FEED_COLUMNS: &[&str] = &[
    "id",
    "shortcode",
    "post_url",
    "type",
    "is_video",
    "likes",
    "comment_count",
    "comments_disabled",
    "search_mode",
    "search_term",
    "caption",
    "hashtags",
    "display_url",
    "owner_id",
    "timestamp",
    "mentions",
    "thumbnail_src",
];

pub fn post_url(shortcode: &str) -> String {
    format!("https://www.instagram.com/p/{}/", shortcode)
}

/// Unix seconds to `YYYY-MM-DD HH:MM:SS` UTC; anything else is kept as-is.
fn utc_timestamp(value: Option<&Value>) -> String {
    match value.and_then(Value::as_i64).and_then(|s| DateTime::from_timestamp(s, 0)) {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => cell(value),
    }
}

/// Posts from feed page artifacts (`collector` array), tagged with the search
/// that produced them.
#[derive(Debug, Clone)]
pub struct FeedPostExtractor {
    mode: FeedMode,
    term: String,
}

impl FeedPostExtractor {
    pub fn new(mode: FeedMode, term: &str) -> Self {
        Self {
            mode,
            term: term.to_string(),
        }
    }
}

impl Extractor for FeedPostExtractor {
    fn columns(&self) -> &[&'static str] {
        FEED_COLUMNS
    }

    fn key(&self) -> &[&'static str] {
        &["id", "shortcode"]
    }

    fn extract(&self, artifact: &Value) -> Vec<Vec<String>> {
        records(artifact, Some("collector"))
            .iter()
            .map(|post| {
                let shortcode = cell(post.get("shortcode"));
                let url = if shortcode.is_empty() {
                    MISSING.to_string()
                } else {
                    post_url(&shortcode)
                };
                vec![
                    cell(post.get("id")),
                    shortcode,
                    url,
                    // location feeds carry no post type
                    cell(post.get("type")),
                    cell(post.get("is_video")),
                    cell(post.get("likes")),
                    cell(post.get("comments")),
                    cell(post.get("comments_disabled")),
                    self.mode.to_string(),
                    self.term.clone(),
                    cell(post.get("description")),
                    cell(post.get("hashtags")),
                    cell(post.get("display_url")),
                    cell(lookup(post, "/owner/id")),
                    utc_timestamp(post.get("taken_at_timestamp")),
                    cell(post.get("mentions")),
                    cell(post.get("thumbnail_src")),
                ]
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cells_render_by_type() {
        assert_eq!(cell(None), "");
        assert_eq!(cell(Some(&Value::Null)), "");
        assert_eq!(cell(Some(&json!("text"))), "text");
        assert_eq!(cell(Some(&json!(42))), "42");
        assert_eq!(cell(Some(&json!(false))), "false");
        assert_eq!(cell(Some(&json!(["a", "b"]))), r#"["a","b"]"#);
    }

    #[test]
    fn post_search_row_follows_nested_fields() {
        let artifact = json!([{
            "account": {
                "name": "Club",
                "handle": "club",
                "subscriberCount": 10,
                "platformId": "77"
            },
            "date": "2021-01-02 10:00:00",
            "id": "p1",
            "statistics": {"actual": {"favoriteCount": 5, "commentCount": 1}},
            "type": "photo"
        }]);
        let ex = PostSearchExtractor;
        let rows = ex.extract(&artifact);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), ex.columns().len());

        let col = |name: &str| ex.columns().iter().position(|c| *c == name).unwrap();
        assert_eq!(rows[0][col("account_name")], "Club");
        assert_eq!(rows[0][col("statistics_actual_favoriteCount")], "5");
        assert_eq!(rows[0][col("statistics_expected_commentCount")], MISSING);
        assert_eq!(rows[0][col("id")], "p1");
    }

    #[test]
    fn post_search_ignores_non_array_artifact() {
        assert!(PostSearchExtractor.extract(&json!({"posts": []})).is_empty());
    }

    #[test]
    fn feed_row_carries_search_and_utc_time() {
        let artifact = json!({
            "collector": [{
                "id": "9", "shortcode": "Bx1", "is_video": false, "likes": 3, "comments": 0,
                "comments_disabled": false, "description": "hi #x", "hashtags": ["#x"],
                "display_url": "d", "owner": {"id": "o1"}, "taken_at_timestamp": 0,
                "mentions": [], "thumbnail_src": "t"
            }],
            "has_more": false
        });
        let ex = FeedPostExtractor::new(FeedMode::Hashtag, "rust");
        let rows = ex.extract(&artifact);
        let row = &rows[0];
        let col = |name: &str| FEED_COLUMNS.iter().position(|c| *c == name).unwrap();

        assert_eq!(row[col("post_url")], "https://www.instagram.com/p/Bx1/");
        assert_eq!(row[col("type")], MISSING);
        assert_eq!(row[col("search_mode")], "hashtag");
        assert_eq!(row[col("search_term")], "rust");
        assert_eq!(row[col("owner_id")], "o1");
        assert_eq!(row[col("timestamp")], "1970-01-01 00:00:00");
        assert_eq!(row[col("hashtags")], r##"["#x"]"##);
    }
}

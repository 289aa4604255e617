//! Domain entities materialized from events, their wire content, and query filters.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Channel name meaning "every channel" in filters.
pub const ALL_CHANNELS: &str = "all";

/// Posts by authors at or below this reputation are hidden on request.
pub const LOW_REPUTATION_FLOOR: i64 = -20;

/// A root post or a comment, keyed by its originating event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub score: i64,
    /// Number of descendants, direct and indirect.
    pub children: u64,
    pub author: String,
    pub created_at: u64,
    pub title: String,
    pub body: String,
    pub channel: String,
    /// Empty for root posts.
    pub parent: String,
    pub ranking: f64,
}

impl Post {
    pub fn is_comment(&self) -> bool {
        !self.parent.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    /// Signed contribution to score and reputation.
    pub fn delta(self) -> i64 {
        match self {
            Direction::Up => 1,
            Direction::Down => -1,
        }
    }

    pub fn from_up(up: bool) -> Self {
        if up {
            Direction::Up
        } else {
            Direction::Down
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: String,
    pub target: String,
    /// Channel of the target post when the vote was applied.
    pub channel: String,
    pub direction: Direction,
    pub created_at: u64,
}

/// Per-author reputation aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub pubkey: String,
    pub reputation: i64,
}

/// Profile record, last-write-wins by `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub pubkey: String,
    pub name: String,
    pub about: String,
    pub created_at: u64,
}

/// Deletion request from `author` for each id in `targets`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deletion {
    pub author: String,
    pub targets: Vec<String>,
}

/// Content length limits applied before storing or publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub title_max: usize,
    pub body_max: usize,
    pub channel_max: usize,
    pub alias_max: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            title_max: 300,
            body_max: 40_000,
            channel_max: 32,
            alias_max: 32,
        }
    }
}

/// JSON content of a post or comment event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent: String,
}

impl PostContent {
    pub fn is_valid_root(&self) -> bool {
        !self.title.is_empty() && !self.body.is_empty()
    }

    pub fn is_valid_comment(&self) -> bool {
        !self.body.is_empty() && !self.parent.is_empty()
    }

    /// Sanitize and collapse into exactly one shape.
    ///
    /// Comments drop their title and channel (the channel is inherited from
    /// the thread root at insert time); root posts drop any parent. Returns
    /// `None` when neither shape holds after sanitizing.
    pub fn normalized(mut self, limits: &Limits) -> Option<Self> {
        self.channel = sanitize_channel(&self.channel, limits.channel_max);
        self.title = truncate_chars(self.title.trim(), limits.title_max);
        self.body = truncate_chars(&self.body, limits.body_max);
        if self.is_valid_comment() {
            self.title.clear();
            self.channel.clear();
            Some(self)
        } else if self.is_valid_root() {
            self.parent.clear();
            Some(self)
        } else {
            None
        }
    }
}

/// JSON content of a vote event. An absent direction is a downvote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub direction: bool,
}

/// JSON content of a profile metadata event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
}

impl MetadataContent {
    /// Sanitized `(name, about)`, or `None` if the record carries nothing usable.
    pub fn normalized(&self, limits: &Limits) -> Option<(String, String)> {
        if self.name.is_none() && self.about.is_none() {
            return None;
        }
        let name = sanitize_alias(self.name.as_deref().unwrap_or_default());
        if name.chars().count() > limits.alias_max {
            return None;
        }
        let about = truncate_chars(self.about.as_deref().unwrap_or_default(), limits.body_max);
        Some((name, about))
    }
}

/// Lower-case a channel name, keep `[a-z0-9_-]`, and map the wildcard to empty.
pub fn sanitize_channel(raw: &str, max: usize) -> String {
    if raw == ALL_CHANNELS {
        return String::new();
    }
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if cleaned == ALL_CHANNELS {
        return String::new();
    }
    truncate_chars(&cleaned, max)
}

/// Keep only `[A-Za-z0-9_-]` in a display name.
pub fn sanitize_alias(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Which kinds of posts a listing returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PostScope {
    #[default]
    All,
    /// Root posts only.
    Posts,
    Comments,
}

impl FromStr for PostScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(PostScope::All),
            "posts" => Ok(PostScope::Posts),
            "comments" => Ok(PostScope::Comments),
            other => Err(format!("unknown post scope: {other}")),
        }
    }
}

/// Allow-listed sort columns for post listings; always descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOrder {
    CreatedAt,
    Score,
    Ranking,
}

impl PostOrder {
    pub fn column(self) -> &'static str {
        match self {
            PostOrder::CreatedAt => "created_at",
            PostOrder::Score => "score",
            PostOrder::Ranking => "ranking",
        }
    }
}

/// A sort column outside the allow-list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sort column not allowed: {0}")]
pub struct InvalidColumn(pub String);

impl FromStr for PostOrder {
    type Err = InvalidColumn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(PostOrder::CreatedAt),
            "score" => Ok(PostOrder::Score),
            "ranking" => Ok(PostOrder::Ranking),
            other => Err(InvalidColumn(other.to_string())),
        }
    }
}

/// Allow-listed sort columns for vote listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOrder {
    CreatedAt,
}

impl FromStr for VoteOrder {
    type Err = InvalidColumn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(VoteOrder::CreatedAt),
            other => Err(InvalidColumn(other.to_string())),
        }
    }
}

impl fmt::Display for PostOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// Order of siblings in a comment tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TreeOrder {
    #[default]
    Ranking,
    Score,
}

impl TreeOrder {
    pub fn column(self) -> &'static str {
        match self {
            TreeOrder::Ranking => "ranking",
            TreeOrder::Score => "score",
        }
    }
}

impl FromStr for TreeOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ranking" => Ok(TreeOrder::Ranking),
            "score" => Ok(TreeOrder::Score),
            other => Err(format!("unknown tree order: {other}")),
        }
    }
}

/// Filters for [`crate::store::Store::fetch_posts`].
#[derive(Debug, Clone, PartialEq)]
pub struct PostFilter {
    /// Exact channel, or empty / [`ALL_CHANNELS`] for every channel.
    pub channel: String,
    pub author: Option<String>,
    /// Whole-word search over title and body.
    pub contains: Option<String>,
    pub scope: PostScope,
    pub hide_low_reputation: bool,
    pub order: Option<PostOrder>,
    pub limit: Option<u32>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for PostFilter {
    fn default() -> Self {
        Self {
            channel: String::new(),
            author: None,
            contains: None,
            scope: PostScope::All,
            hide_low_reputation: false,
            order: None,
            limit: None,
            page: 0,
            page_size: 25,
        }
    }
}

/// Filters for [`crate::store::Store::fetch_votes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteFilter {
    pub voter: Option<String>,
    pub channel: String,
    pub order: Option<VoteOrder>,
    pub limit: Option<u32>,
    pub page: u32,
    pub page_size: u32,
}

impl Default for VoteFilter {
    fn default() -> Self {
        Self {
            voter: None,
            channel: String::new(),
            order: None,
            limit: None,
            page: 0,
            page_size: 25,
        }
    }
}

/// Top-level post count for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelCount {
    pub channel: String,
    pub posts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_sanitizing() {
        assert_eq!(sanitize_channel("Rust-Lang_2!", 32), "rust-lang_2");
        assert_eq!(sanitize_channel("all", 32), "");
        assert_eq!(sanitize_channel("A L L", 32), "");
        assert_eq!(sanitize_channel("abcdef", 3), "abc");
        assert_eq!(sanitize_channel("über", 32), "ber");
    }

    #[test]
    fn comment_shape_wins_over_root_shape() {
        let content = PostContent {
            title: "t".into(),
            body: "b".into(),
            channel: "news".into(),
            parent: "p".into(),
        };
        let n = content.normalized(&Limits::default()).unwrap();
        assert!(n.title.is_empty());
        assert!(n.channel.is_empty());
        assert_eq!(n.parent, "p");
    }

    #[test]
    fn root_needs_title_and_body() {
        let limits = Limits::default();
        let root = PostContent {
            title: "t".into(),
            body: "b".into(),
            channel: "News".into(),
            parent: String::new(),
        };
        assert_eq!(root.normalized(&limits).unwrap().channel, "news");
        let no_body = PostContent {
            title: "t".into(),
            ..Default::default()
        };
        assert!(no_body.normalized(&limits).is_none());
        let whitespace_title = PostContent {
            title: "   ".into(),
            body: "b".into(),
            ..Default::default()
        };
        assert!(whitespace_title.normalized(&limits).is_none());
    }

    #[test]
    fn long_fields_truncate_on_char_boundaries() {
        let limits = Limits {
            title_max: 3,
            body_max: 2,
            ..Limits::default()
        };
        let n = PostContent {
            title: "ééééé".into(),
            body: "ßßßß".into(),
            ..Default::default()
        }
        .normalized(&limits)
        .unwrap();
        assert_eq!(n.title, "ééé");
        assert_eq!(n.body, "ßß");
    }

    #[test]
    fn vote_content_defaults_to_down() {
        let v: VoteContent = serde_json::from_str(r#"{"target":"aa"}"#).unwrap();
        assert!(!v.direction);
        let encoded = serde_json::to_string(&VoteContent {
            target: "aa".into(),
            direction: true,
        })
        .unwrap();
        assert_eq!(encoded, r#"{"target":"aa","direction":true}"#);
    }

    #[test]
    fn metadata_requires_a_field_and_short_alias() {
        let limits = Limits::default();
        assert!(MetadataContent::default().normalized(&limits).is_none());
        let named = MetadataContent {
            name: Some("al ice!".into()),
            about: None,
        };
        assert_eq!(
            named.normalized(&limits).unwrap(),
            ("alice".to_string(), String::new())
        );
        let long = MetadataContent {
            name: Some("x".repeat(40)),
            about: None,
        };
        assert!(long.normalized(&limits).is_none());
    }

    #[test]
    fn order_parsing() {
        assert_eq!("score".parse::<TreeOrder>().unwrap(), TreeOrder::Score);
        assert!("children".parse::<TreeOrder>().is_err());
        assert_eq!("comments".parse::<PostScope>().unwrap(), PostScope::Comments);
        assert_eq!("ranking".parse::<PostOrder>().unwrap(), PostOrder::Ranking);
        assert_eq!(
            "id; DROP TABLE posts".parse::<PostOrder>().unwrap_err(),
            InvalidColumn("id; DROP TABLE posts".into())
        );
        assert!("score".parse::<VoteOrder>().is_err());
    }
}

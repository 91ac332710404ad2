//! Cip log.
//!
//! Append-only, timestamped log of short messages with hashtag extraction,
//! queried as a time window filtered by a follow set. Grounded on
//! `original_source/robin/src/robin_cip.c`. The original's doubly-linked
//! `prev`/`next` pointers become a plain `Vec` index walk.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;

pub const MAX_TEXT_LEN: usize = 280;

/// One hashtag occurrence within a cip's text, as a byte offset/length
/// pair — kept as an owned string here since cips are immutable
/// once appended and never need to re-slice a live buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hashtag {
    pub tag: String,
}

#[derive(Debug, Clone)]
pub struct Cip {
    pub ts: i64,
    pub author: String,
    pub text: String,
    pub hashtags: Vec<Hashtag>,
}

/// A cip as returned by a windowed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipView {
    pub ts: i64,
    pub author: String,
    pub text: String,
}

pub struct CipLog {
    cips: Mutex<Vec<Cip>>,
}

impl Default for CipLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CipLog {
    pub fn new() -> Self {
        CipLog {
            cips: Mutex::new(Vec::new()),
        }
    }

    /// Appends a cip authored by `author_email` with the given `text`,
    /// scanning for `#hashtag` tokens. Concurrent appends are serialized by
    /// the log mutex, so the timestamp is monotone non-decreasing in log
    /// order.
    pub fn append(&self, author_email: &str, text: &str) {
        let hashtags = extract_hashtags(text);
        let cip = Cip {
            ts: Utc::now().timestamp(),
            author: author_email.to_string(),
            text: text.to_string(),
            hashtags,
        };

        self.cips.lock().push(cip);
    }

    /// Returns, oldest-first, every cip with `ts > since` whose author is
    /// in `authors`. An empty `authors` set yields no cips.
    pub fn cips_since(&self, since: i64, authors: &[String]) -> Vec<CipView> {
        if authors.is_empty() {
            return Vec::new();
        }

        let cips = self.cips.lock();
        let mut out: Vec<CipView> = cips
            .iter()
            .rev()
            .take_while(|c| c.ts > since)
            .filter(|c| authors.iter().any(|a| a == &c.author))
            .map(|c| CipView {
                ts: c.ts,
                author: c.author.clone(),
                text: c.text.clone(),
            })
            .collect();

        out.reverse(); // oldest-first
        out
    }

    /// Aggregates hashtag occurrence counts across every cip with
    /// `ts > since`, regardless of author — hashtags are global, not
    /// filtered by a follow set.
    pub fn hashtags_since(&self, since: i64) -> Vec<(String, u64)> {
        let cips = self.cips.lock();
        let mut tally: HashMap<&str, u64> = HashMap::new();

        for cip in cips.iter().rev().take_while(|c| c.ts > since) {
            for tag in &cip.hashtags {
                *tally.entry(tag.tag.as_str()).or_insert(0) += 1;
            }
        }

        tally.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    /// Drops all in-memory state.
    pub fn shutdown(&self) {
        self.cips.lock().clear();
    }
}

/// Scans `text` for `#`-prefixed runs of alphanumeric bytes. A bare `#` (no
/// following alphanumeric) is ignored; multiple `#` in one token yield
/// separate tags, matching `robin_cip_add`'s `isalnum` scan.
fn extract_hashtags(text: &str) -> Vec<Hashtag> {
    let mut tags = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '#' {
            continue;
        }

        let mut tag = String::new();
        while let Some(&(_, next)) = chars.peek() {
            if next.is_alphanumeric() {
                tag.push(next);
                chars.next();
            } else {
                break;
            }
        }

        if !tag.is_empty() {
            tags.push(Hashtag { tag });
        }
    }

    tags
}

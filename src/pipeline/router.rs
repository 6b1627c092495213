//! Subject routing: `keyword - destination` parsing and the per-run rule snapshot.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::DatabaseError;
use crate::store::RuleStore;

static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}$").unwrap());

/// A parsed routing subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub keyword: String,
    pub destination: String,
}

/// Split a subject into trimmed `(keyword, destination)` at the first hyphen
/// after the keyword's first character, so a keyword may start with `-`.
///
/// Returns `None` when there is no such hyphen, either side is empty, or the
/// destination is not a syntactically valid address.
pub fn parse_subject(subject: &str) -> Option<Route> {
    let subject = subject.trim();
    let first = subject.chars().next()?.len_utf8();
    let split = first + subject[first..].find('-')?;
    let (keyword, destination) = (&subject[..split], &subject[split + 1..]);
    let keyword = keyword.trim();
    let destination = destination.trim();
    if keyword.is_empty() || destination.is_empty() || !is_valid_address(destination) {
        return None;
    }
    Some(Route {
        keyword: keyword.to_string(),
        destination: destination.to_string(),
    })
}

/// `local@domain.tld` syntax check.
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_RE.is_match(address)
}

/// Active keywords as of run start. Later rule edits do not affect it.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    keywords: HashSet<String>,
}

impl RuleSnapshot {
    pub async fn load(store: &dyn RuleStore) -> Result<Self, DatabaseError> {
        let rules = store.list_active().await?;
        Ok(Self::from_keywords(rules.into_iter().map(|r| r.keyword)))
    }

    pub fn from_keywords(keywords: impl IntoIterator<Item = String>) -> Self {
        Self {
            keywords: keywords.into_iter().collect(),
        }
    }

    /// Exact, case-sensitive match.
    pub fn allows(&self, keyword: &str) -> bool {
        self.keywords.contains(keyword)
    }

    pub fn len(&self) -> usize {
        self.keywords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }
}

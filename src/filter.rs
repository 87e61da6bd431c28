//! NIP-01 subscription filters: builder, JSON wire form, and matching.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::key::PublicKey;

/// Largest kind number the protocol can carry.
const MAX_KIND: u32 = 0xFFFF;

/// Subscription filter.
///
/// All constraints within one filter AND together; a request carrying
/// several filters matches an event when any single filter does. Empty
/// constraint sets are absent from the wire form and match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub(crate) ids: Option<BTreeSet<String>>,
    pub(crate) authors: Option<BTreeSet<String>>,
    pub(crate) kinds: Option<BTreeSet<u32>>,
    /// Tag constraints keyed by tag name (serialized as `#<name>`).
    pub(crate) tags: BTreeMap<String, BTreeSet<String>>,
    pub(crate) since: Option<u64>,
    pub(crate) until: Option<u64>,
    pub(crate) limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(self, id: impl Into<String>) -> Self {
        self.ids([id.into()])
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids
            .get_or_insert_with(BTreeSet::new)
            .extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn author(self, author: &PublicKey) -> Self {
        self.authors([author])
    }

    pub fn authors<'a, I>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = &'a PublicKey>,
    {
        self.authors
            .get_or_insert_with(BTreeSet::new)
            .extend(authors.into_iter().map(|pk| pk.to_hex()));
        self
    }

    pub fn kind(self, kind: u32) -> Self {
        self.kinds([kind])
    }

    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = u32>,
    {
        self.kinds.get_or_insert_with(BTreeSet::new).extend(kinds);
        self
    }

    /// Constrain on a `p` tag referencing `pubkey`, the usual way to ask for
    /// events addressed to a key (direct messages, mentions).
    pub fn pubkey(self, pubkey: &PublicKey) -> Self {
        self.custom_tag("p", [pubkey.to_hex()])
    }

    /// Constrain on tag `name`: the event must carry a tag of that name
    /// whose data intersects `values`.
    pub fn custom_tag<I, S>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Earliest `created_at`, inclusive.
    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// Latest `created_at`, inclusive.
    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Pure match of a single event against this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        for (name, values) in &self.tags {
            let hit = event.tags.iter().any(|tag| {
                tag.0.first().map(String::as_str) == Some(name.as_str())
                    && tag.0[1..].iter().any(|v| values.contains(v))
            });
            if !hit {
                return false;
            }
        }
        true
    }

    /// NIP-01 wire form, e.g. `{"authors": [...], "kinds": [1], "#p": [...]}`.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        if let Some(ids) = &self.ids {
            map.insert("ids".into(), json!(ids));
        }
        if let Some(authors) = &self.authors {
            map.insert("authors".into(), json!(authors));
        }
        if let Some(kinds) = &self.kinds {
            map.insert("kinds".into(), json!(kinds));
        }
        for (name, values) in &self.tags {
            map.insert(format!("#{name}"), json!(values));
        }
        if let Some(since) = self.since {
            map.insert("since".into(), json!(since));
        }
        if let Some(until) = self.until {
            map.insert("until".into(), json!(until));
        }
        if let Some(limit) = self.limit {
            map.insert("limit".into(), json!(limit));
        }
        Value::Object(map)
    }

    pub fn as_json(&self) -> String {
        self.to_value().to_string()
    }

    /// Parse the NIP-01 wire form. Unknown keys are ignored.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Filter("filter must be a JSON object".into()))?;
        let mut filter = Filter::new();
        for (key, val) in obj {
            match key.as_str() {
                "ids" => filter.ids = Some(string_set(val, key)?),
                "authors" => filter.authors = Some(string_set(val, key)?),
                "kinds" => {
                    let arr = val
                        .as_array()
                        .ok_or_else(|| Error::Filter("kinds must be an array".into()))?;
                    let mut kinds = BTreeSet::new();
                    for k in arr {
                        let k = k
                            .as_u64()
                            .ok_or_else(|| Error::Filter("kind must be an integer".into()))?;
                        kinds.insert(k as u32);
                    }
                    filter.kinds = Some(kinds);
                }
                "since" => {
                    filter.since = Some(
                        val.as_u64()
                            .ok_or_else(|| Error::Filter("since must be an integer".into()))?,
                    )
                }
                "until" => {
                    filter.until = Some(
                        val.as_u64()
                            .ok_or_else(|| Error::Filter("until must be an integer".into()))?,
                    )
                }
                "limit" => {
                    filter.limit = Some(
                        val.as_u64()
                            .ok_or_else(|| Error::Filter("limit must be an integer".into()))?
                            as usize,
                    )
                }
                name if name.starts_with('#') && name.len() > 1 => {
                    filter
                        .tags
                        .insert(name[1..].to_string(), string_set(val, name)?);
                }
                _ => {}
            }
        }
        Ok(filter)
    }

    /// Reject filters a relay would refuse or that can never match.
    pub fn validate(&self) -> Result<()> {
        if let Some(kinds) = &self.kinds {
            if let Some(kind) = kinds.iter().find(|k| **k > MAX_KIND) {
                return Err(Error::Filter(format!("kind {kind} out of range")));
            }
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(Error::Filter(format!(
                    "empty time window: since {since} > until {until}"
                )));
            }
        }
        Ok(())
    }
}

fn string_set(value: &Value, key: &str) -> Result<BTreeSet<String>> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::Filter(format!("{key} must be an array of strings")))?;
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(String::from)
                .ok_or_else(|| Error::Filter(format!("{key} must contain only strings")))
        })
        .collect()
}

/// True when any filter in the request matches the event.
pub(crate) fn match_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

/// Validate a whole request: at least one filter, each well-formed.
pub(crate) fn validate_filters(filters: &[Filter]) -> Result<()> {
    if filters.is_empty() {
        return Err(Error::Filter("at least one filter is required".into()));
    }
    for filter in filters {
        filter.validate()?;
    }
    Ok(())
}

/// Largest `limit` across the request, if any filter carries one.
pub(crate) fn request_limit(filters: &[Filter]) -> Option<usize> {
    filters.iter().filter_map(|f| f.limit).max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use crate::key::Keys;

    fn event(pubkey: &str, kind: u32, created_at: u64, tags: Vec<Tag>) -> Event {
        Event {
            id: "aa11".into(),
            pubkey: pubkey.into(),
            kind,
            created_at,
            tags,
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let ev = event("abc", 1, 100, vec![]);
        assert!(Filter::new().matches(&ev));
    }

    #[test]
    fn constraints_and_together() {
        let keys = Keys::generate();
        let ev = event(&keys.public_key().to_hex(), 1, 100, vec![]);
        assert!(Filter::new()
            .author(&keys.public_key())
            .kind(1)
            .matches(&ev));
        assert!(!Filter::new()
            .author(&keys.public_key())
            .kind(7)
            .matches(&ev));
    }

    #[test]
    fn since_until_inclusive() {
        let ev = event("abc", 1, 100, vec![]);
        assert!(Filter::new().since(100).matches(&ev));
        assert!(Filter::new().until(100).matches(&ev));
        assert!(!Filter::new().since(101).matches(&ev));
        assert!(!Filter::new().until(99).matches(&ev));
    }

    #[test]
    fn tag_constraint_intersects_values() {
        let ev = event(
            "abc",
            1,
            100,
            vec![Tag(vec!["t".into(), "news".into(), "tech".into()])],
        );
        assert!(Filter::new().custom_tag("t", ["tech"]).matches(&ev));
        assert!(!Filter::new().custom_tag("t", ["sports"]).matches(&ev));
        // Tag name in data position must not match.
        assert!(!Filter::new().custom_tag("news", ["t"]).matches(&ev));
    }

    #[test]
    fn pubkey_constraint_is_p_tag() {
        let keys = Keys::generate();
        let hex = keys.public_key().to_hex();
        let ev = event("abc", 14, 100, vec![Tag(vec!["p".into(), hex.clone()])]);
        assert!(Filter::new().pubkey(&keys.public_key()).matches(&ev));
        let f = Filter::new().pubkey(&keys.public_key());
        assert_eq!(f.to_value()["#p"], json!([hex]));
    }

    #[test]
    fn wire_form_round_trip() {
        let keys = Keys::generate();
        let filter = Filter::new()
            .author(&keys.public_key())
            .kinds([1, 1059])
            .custom_tag("t", ["news"])
            .since(10)
            .until(20)
            .limit(5);
        let parsed = Filter::from_value(&filter.to_value()).unwrap();
        assert_eq!(parsed, filter);
    }

    #[test]
    fn from_value_ignores_unknown_keys() {
        let parsed =
            Filter::from_value(&json!({"kinds": [1], "search": "ignored", "#": "ignored"}))
                .unwrap();
        assert_eq!(parsed, Filter::new().kind(1));
    }

    #[test]
    fn from_value_rejects_non_object() {
        assert!(Filter::from_value(&json!(["REQ"])).is_err());
        assert!(Filter::from_value(&json!({"authors": "abc"})).is_err());
    }

    #[test]
    fn validate_rejects_bad_filters() {
        assert!(Filter::new().kind(70000).validate().is_err());
        assert!(Filter::new().since(10).until(5).validate().is_err());
        assert!(Filter::new().since(5).until(5).validate().is_ok());
        assert!(validate_filters(&[]).is_err());
    }

    #[test]
    fn match_any_ors_filters() {
        let ev = event("abc", 7, 100, vec![]);
        let filters = vec![Filter::new().kind(1), Filter::new().kind(7)];
        assert!(match_any(&filters, &ev));
        assert!(!match_any(&[Filter::new().kind(1)], &ev));
    }

    #[test]
    fn request_limit_takes_max() {
        let filters = vec![
            Filter::new().kind(1).limit(3),
            Filter::new().kind(7),
            Filter::new().kind(2).limit(10),
        ];
        assert_eq!(request_limit(&filters), Some(10));
        assert_eq!(request_limit(&[Filter::new()]), None);
    }
}

use chrono::{DateTime, TimeZone, Utc};

use crate::{
    models::{Config, Setting, TryParse},
    Error, Result,
};

/// Snapshot of the remote configuration. It's a central piece that defines client behavior.
///
/// A `Configuration` is never mutated after creation: a newer document replaces it as a whole.
#[derive(Debug)]
pub struct Configuration {
    /// Parsed document.
    pub config: Config,
    /// ETag the server returned with the document, if any.
    pub etag: Option<String>,
    /// Timestamp when the document was fetched by the client.
    pub fetched_at: DateTime<Utc>,
    /// Raw JSON text the document was parsed from.
    pub json: String,
}

impl Configuration {
    /// Parse a configuration from the server response body.
    pub fn from_json(
        json: impl Into<String>,
        etag: Option<String>,
        fetched_at: DateTime<Utc>,
    ) -> Result<Configuration> {
        let json = json.into();
        let config = Config::from_json(&json)?;
        Ok(Configuration {
            config,
            etag: etag.filter(|etag| !etag.is_empty()),
            fetched_at,
            json,
        })
    }

    /// Parse an entry previously produced by [`Configuration::to_cache_entry()`].
    ///
    /// Entry format is `"{fetch_time_unix_millis}\n{etag}\n{config_json}"`.
    pub fn from_cache_entry(entry: &str) -> Result<Configuration> {
        let mut parts = entry.splitn(3, '\n');
        let (Some(fetch_time), Some(etag), Some(json)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::CacheEntry("expected three newline separated parts".to_owned()));
        };

        let millis: i64 = fetch_time
            .parse()
            .map_err(|_| Error::CacheEntry(format!("invalid fetch time: {fetch_time:?}")))?;
        let fetched_at = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| Error::CacheEntry(format!("fetch time out of range: {millis}")))?;

        if json.is_empty() {
            return Err(Error::CacheEntry("empty config JSON".to_owned()));
        }

        Configuration::from_json(json, Some(etag.to_owned()), fetched_at)
    }

    /// Serialize into the cache entry format.
    pub fn to_cache_entry(&self) -> String {
        self.cache_entry_at(self.fetched_at)
    }

    /// Cache entry for the same document, validated at `fetched_at`.
    pub(crate) fn cache_entry_at(&self, fetched_at: DateTime<Utc>) -> String {
        format!(
            "{}\n{}\n{}",
            fetched_at.timestamp_millis(),
            self.etag.as_deref().unwrap_or_default(),
            self.json
        )
    }

    /// Returns `true` if both snapshots hold the same document.
    ///
    /// ETags are compared when both sides carry one, the raw JSON otherwise.
    pub fn same_content(&self, other: &Configuration) -> bool {
        match (&self.etag, &other.etag) {
            (Some(a), Some(b)) => a == b,
            _ => self.json == other.json,
        }
    }

    /// Look up a setting by key.
    pub(crate) fn get_setting(&self, key: &str) -> Option<&TryParse<Setting>> {
        self.config.settings.get(key)
    }

    /// Get a sorted list of all flag keys. Note that this may include flags with bad
    /// configuration.
    pub fn keys(&self) -> Vec<String> {
        self.config.keys()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::Configuration;
    use crate::Error;

    const JSON: &str = r#"{"f":{"flag":{"v":true,"t":0}}}"#;

    #[test]
    fn cache_entry_round_trip() {
        let fetched_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let configuration =
            Configuration::from_json(JSON, Some("\"etag-1\"".to_owned()), fetched_at).unwrap();

        let entry = configuration.to_cache_entry();
        assert_eq!(entry, format!("1700000000123\n\"etag-1\"\n{JSON}"));

        let restored = Configuration::from_cache_entry(&entry).unwrap();
        assert_eq!(restored.fetched_at, fetched_at);
        assert_eq!(restored.etag.as_deref(), Some("\"etag-1\""));
        assert!(restored.same_content(&configuration));
    }

    #[test]
    fn cache_entry_without_etag() {
        let restored = Configuration::from_cache_entry(&format!("0\n\n{JSON}")).unwrap();
        assert_eq!(restored.etag, None);
        assert_eq!(restored.keys(), vec!["flag".to_owned()]);
    }

    #[test]
    fn invalid_cache_entries() {
        assert!(matches!(
            Configuration::from_cache_entry("garbage"),
            Err(Error::CacheEntry(_))
        ));
        assert!(matches!(
            Configuration::from_cache_entry("abc\n\n{}"),
            Err(Error::CacheEntry(_))
        ));
        assert!(matches!(
            Configuration::from_cache_entry("0\n\n{not json"),
            Err(Error::MalformedDocument(_))
        ));
    }

    #[test]
    fn content_comparison() {
        let now = Utc::now();
        let a = Configuration::from_json(JSON, Some("a".to_owned()), now).unwrap();
        let b = Configuration::from_json(JSON, Some("b".to_owned()), now).unwrap();
        let no_etag = Configuration::from_json(JSON, None, now).unwrap();
        assert!(!a.same_content(&b));
        assert!(a.same_content(&no_etag));
    }
}

use url::Url;

use crate::error::CrawlError;

/// Query parameters that only carry attribution data
const TRACKING_PARAMS: &[&str] = &[
    "fbclid",
    "gclid",
    "dclid",
    "msclkid",
    "mc_cid",
    "mc_eid",
    "_ga",
    "_gl",
    "igshid",
    "ref_src",
    "yclid",
];

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// Normalize a URL into its canonical identity form.
///
/// Lowercases scheme and host, drops default ports, fragments and tracking
/// parameters, sorts the remaining query pairs and strips trailing slashes
/// (the bare root included).
pub fn normalize_url(raw: &str) -> Result<String, CrawlError> {
    let trimmed = raw.trim();
    let mut url = Url::parse(trimmed).map_err(|e| CrawlError::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(CrawlError::InvalidUrl {
            url: trimmed.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    if url.host_str().is_none() {
        return Err(CrawlError::InvalidUrl {
            url: trimmed.to_string(),
            reason: "missing host".to_string(),
        });
    }

    // The url crate already lowercases the scheme and registrable hosts and
    // drops ports equal to the scheme default.
    url.set_fragment(None);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    params.sort();

    if params.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(params.iter());
    }

    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);

    let mut normalized = url.to_string();

    // A root path always serializes as "/", strip it from the string form
    let root_slash = format!("{}://{}/", url.scheme(), host_with_port(&url));
    if normalized.starts_with(&root_slash) && path.is_empty() {
        normalized.remove(root_slash.len() - 1);
    }

    Ok(normalized)
}

/// Compute the deduplication key for a URL.
///
/// Unparseable input falls back to the trimmed raw string so that the caller
/// still gets a stable key for it.
pub fn normalize_unique_key(raw: &str) -> String {
    normalize_url(raw).unwrap_or_else(|_| raw.trim().to_string())
}

/// Lowercased hostname of a URL
pub fn hostname(raw: &str) -> Result<String, CrawlError> {
    let url = Url::parse(raw.trim()).map_err(|e| CrawlError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    url.host_str()
        .map(|h| h.to_lowercase())
        .ok_or_else(|| CrawlError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        })
}

/// Strip a leading `www.` so that `www.example.com` and `example.com` compare equal
pub fn registrable_host(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

fn host_with_port(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url() {
        // Test case insensitivity in host
        assert_eq!(
            normalize_url("https://EXAMPLE.com/path").unwrap(),
            "https://example.com/path"
        );

        // Test removal of default ports
        assert_eq!(
            normalize_url("https://example.com:443/path").unwrap(),
            "https://example.com/path"
        );

        // Test removal of trailing slash
        assert_eq!(normalize_url("https://example.com/").unwrap(), "https://example.com");
        assert_eq!(
            normalize_url("https://example.com/docs/").unwrap(),
            "https://example.com/docs"
        );

        // Test query parameter sorting
        assert_eq!(
            normalize_url("https://example.com/search?b=2&a=1").unwrap(),
            "https://example.com/search?a=1&b=2"
        );

        // Test fragment removal
        assert_eq!(
            normalize_url("https://example.com/page#section").unwrap(),
            "https://example.com/page"
        );
    }

    #[test]
    fn test_equivalent_urls_share_a_key() {
        let variants = [
            "https://Example.com/a/?q=1&utm_source=news&b=2#top",
            "https://example.com/a?b=2&q=1",
            "https://example.com/a?fbclid=xyz&q=1&b=2",
            "https://example.com:443/a/?b=2&q=1",
        ];

        let keys: Vec<String> = variants.iter().map(|v| normalize_unique_key(v)).collect();
        assert!(keys.iter().all(|k| k == "https://example.com/a?b=2&q=1"), "{:?}", keys);
    }

    #[test]
    fn test_tracking_only_query_is_dropped() {
        assert_eq!(
            normalize_url("https://example.com/p?utm_medium=x&gclid=1").unwrap(),
            "https://example.com/p"
        );
    }

    #[test]
    fn test_non_default_port_is_kept() {
        assert_eq!(
            normalize_url("http://127.0.0.1:8080/").unwrap(),
            "http://127.0.0.1:8080"
        );
    }

    #[test]
    fn test_invalid_urls() {
        assert!(normalize_url("not a url").is_err());
        assert!(normalize_url("ftp://example.com/file").is_err());
        assert_eq!(normalize_unique_key("  not a url "), "not a url");
    }

    #[test]
    fn test_hostname() {
        assert_eq!(hostname("https://Sub.Example.com/x").unwrap(), "sub.example.com");
        assert_eq!(registrable_host("www.example.com"), "example.com");
    }
}

//! Shared User-Agent strings for media and site API requests.

/// Browser-like User-Agent sent with media and page requests.
///
/// Media CDNs commonly reject non-browser agents, so both the download
/// engine and site scrapers present as a desktop browser.
pub(crate) const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Default User-Agent for download requests.
#[must_use]
pub(crate) fn default_download_user_agent() -> String {
    BROWSER_USER_AGENT.to_string()
}

/// User-Agent for JSON API calls made by scrapers.
///
/// Some site APIs answer browser agents with an HTML challenge page instead of
/// JSON; a neutral tool agent gets the plain payload.
#[must_use]
pub(crate) fn default_api_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("mediadl/{version}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_user_agent_is_browser_like() {
        let ua = default_download_user_agent();
        assert!(ua.starts_with("Mozilla/5.0"), "unexpected UA: {ua}");
        assert!(ua.contains("Chrome/"));
    }

    #[test]
    fn test_api_user_agent_carries_crate_version() {
        let ua = default_api_user_agent();
        assert_eq!(
            ua.strip_prefix("mediadl/"),
            Some(env!("CARGO_PKG_VERSION")),
            "api UA must contain crate version: {ua}"
        );
    }
}

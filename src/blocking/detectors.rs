//! Blocking signal detection.
//!
//! Inspects every response observed by a session and decides whether it is
//! evidence that the site is rate limiting, challenging, or denying access.

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

use crate::config::EndpointConfig;
use crate::session::ObservedResponse;

use super::outcome::BlockReason;

const STATUS_RATE_LIMITED: u16 = 429;
const STATUS_ACCESS_DENIED: u16 = 490;

/// Challenge pages the site redirects to when it suspects automation.
static KNOWN_CHALLENGE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"/verify/(captcha|traffic)",
        r"/captcha(/|\?|$)",
        r"(^|[/.])challenge[s]?(/|\?|\.|$)",
        r"px-captcha",
    ]
    .iter()
    .map(|pattern| build_regex(pattern).expect("invalid built-in challenge pattern"))
    .collect()
});

fn build_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Classifies observed responses into [`BlockReason`]s.
#[derive(Debug, Clone)]
pub struct BlockDetector {
    critical_endpoints: Vec<String>,
    challenge_patterns: Vec<Regex>,
}

impl BlockDetector {
    /// Build a detector for the configured endpoints. Extra challenge
    /// patterns are appended to the built-in list.
    pub fn new(endpoints: &EndpointConfig) -> Result<Self, regex::Error> {
        let mut challenge_patterns = KNOWN_CHALLENGE_PATTERNS.clone();
        for raw in &endpoints.challenge_patterns {
            challenge_patterns.push(build_regex(raw)?);
        }

        Ok(Self {
            critical_endpoints: vec![
                endpoints.product_detail.clone(),
                endpoints.benefits.clone(),
            ],
            challenge_patterns,
        })
    }

    /// Returns the blocking reason signalled by `response`, if any.
    ///
    /// A 429 counts on any response of the session; 490 only on the data
    /// endpoints the page depends on.
    pub fn classify(&self, response: &ObservedResponse) -> Option<BlockReason> {
        let status = response.status.as_u16();
        if status == STATUS_RATE_LIMITED {
            return Some(BlockReason::RateLimited);
        }

        let url = response.url.as_str();
        if self.challenge_patterns.iter().any(|re| re.is_match(url)) {
            return Some(BlockReason::Captcha);
        }

        if status == STATUS_ACCESS_DENIED && self.is_critical(url) {
            return Some(BlockReason::AccessDenied);
        }

        None
    }

    fn is_critical(&self, url: &str) -> bool {
        self.critical_endpoints
            .iter()
            .any(|endpoint| url.contains(endpoint.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};
    use url::Url;

    fn response(url: &str, status: u16) -> ObservedResponse {
        ObservedResponse {
            url: Url::parse(url).unwrap(),
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    fn detector() -> BlockDetector {
        BlockDetector::new(&EndpointConfig::default()).unwrap()
    }

    #[test]
    fn rate_limit_on_any_response() {
        let detector = detector();
        let reason = detector.classify(&response("https://shop.example/static/app.js", 429));
        assert_eq!(reason, Some(BlockReason::RateLimited));
    }

    #[test]
    fn challenge_redirect_is_captcha() {
        let detector = detector();
        let reason = detector.classify(&response(
            "https://shop.example/verify/traffic?anti_bot_tracking_id=1",
            200,
        ));
        assert_eq!(reason, Some(BlockReason::Captcha));
    }

    #[test]
    fn status_490_only_counts_on_critical_endpoints() {
        let detector = detector();
        let endpoints = EndpointConfig::default();
        let critical = format!("https://shop.example{}?item_id=1", endpoints.product_detail);
        assert_eq!(
            detector.classify(&response(&critical, 490)),
            Some(BlockReason::AccessDenied)
        );
        assert_eq!(
            detector.classify(&response("https://shop.example/api/v4/banner", 490)),
            None
        );
    }

    #[test]
    fn ordinary_responses_pass() {
        let detector = detector();
        assert_eq!(detector.classify(&response("https://shop.example/product/1/2", 200)), None);
    }

    #[test]
    fn custom_patterns_extend_builtins() {
        let endpoints = EndpointConfig {
            challenge_patterns: vec![r"/robot-check".into()],
            ..Default::default()
        };
        let detector = BlockDetector::new(&endpoints).unwrap();
        assert_eq!(
            detector.classify(&response("https://shop.example/robot-check", 200)),
            Some(BlockReason::Captcha)
        );
    }
}

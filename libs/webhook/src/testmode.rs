//! `[test]` messages: the prefix is stripped from the delivered body and the webhook URL is
//! pointed at the test endpoint (`/webhook/...` becomes `/webhook-test/...`).

use url::Url;

pub const TEST_PREFIX: &str = "[test]";
pub const DEFAULT_SUFFIX: &str = "-test";

/// Body and target URL for one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub body: String,
    pub url: String,
    pub test_mode: bool,
}

#[derive(Debug, Clone)]
pub struct TestMode {
    suffix: String,
}

impl Default for TestMode {
    fn default() -> Self {
        Self::new(DEFAULT_SUFFIX)
    }
}

impl TestMode {
    pub fn new(suffix: &str) -> Self {
        let suffix = if suffix.is_empty() {
            DEFAULT_SUFFIX
        } else {
            suffix
        };
        Self {
            suffix: suffix.to_string(),
        }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// Case-sensitive `[test]` prefix after trimming surrounding whitespace.
    pub fn is_test_message(body: &str) -> bool {
        body.trim().starts_with(TEST_PREFIX)
    }

    /// Drops the prefix and the whitespace around the rest. Non-test bodies come back as-is.
    pub fn strip_prefix(body: &str) -> String {
        match body.trim().strip_prefix(TEST_PREFIX) {
            Some(rest) => rest.trim().to_string(),
            None => body.to_string(),
        }
    }

    pub fn test_url(&self, base: &str) -> String {
        if base.is_empty() {
            return String::new();
        }
        match Url::parse(base) {
            Ok(mut parsed) => {
                let path = parsed.path().to_string();
                if !self.should_rewrite(&path) {
                    return base.to_string();
                }
                parsed.set_path(&self.rewrite(&path));
                parsed.to_string()
            }
            Err(_) if self.should_rewrite(base) => self.rewrite(base),
            Err(_) => base.to_string(),
        }
    }

    pub fn route(&self, body: &str, url: &str) -> Routed {
        if !Self::is_test_message(body) {
            return Routed {
                body: body.to_string(),
                url: url.to_string(),
                test_mode: false,
            };
        }
        Routed {
            body: Self::strip_prefix(body),
            url: self.test_url(url),
            test_mode: true,
        }
    }

    fn should_rewrite(&self, text: &str) -> bool {
        text.contains("webhook") && !text.contains("webhook-test")
    }

    fn rewrite(&self, text: &str) -> String {
        text.replacen("webhook", &format!("webhook{}", self.suffix), 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_prefix_after_trimming() {
        assert!(TestMode::is_test_message("[test] hello"));
        assert!(TestMode::is_test_message("   [test]hello"));
        assert!(!TestMode::is_test_message("[TEST] hello"));
        assert!(!TestMode::is_test_message("hello [test]"));
        assert!(!TestMode::is_test_message(""));
    }

    #[test]
    fn strips_prefix_and_surrounding_whitespace() {
        assert_eq!(TestMode::strip_prefix("[test]   hello world  "), "hello world");
        assert_eq!(TestMode::strip_prefix("  [test]"), "");
        assert_eq!(TestMode::strip_prefix(" plain "), " plain ");
    }

    #[test]
    fn rewrites_webhook_urls() {
        let mode = TestMode::default();
        let cases = [
            (
                "https://n8n.example.com/webhook/abc123",
                "https://n8n.example.com/webhook-test/abc123",
            ),
            (
                "https://n8n.example.com/webhook/abc?token=xyz&mode=1",
                "https://n8n.example.com/webhook-test/abc?token=xyz&mode=1",
            ),
            (
                "http://localhost:5678/webhook/abc",
                "http://localhost:5678/webhook-test/abc",
            ),
            (
                "https://api.example.com/v1/hooks/webhook/handler/123",
                "https://api.example.com/v1/hooks/webhook-test/handler/123",
            ),
            (
                "https://n8n.example.com/webhook-test/abc",
                "https://n8n.example.com/webhook-test/abc",
            ),
            ("https://example.com/api/notify", "https://example.com/api/notify"),
            ("", ""),
        ];
        for (input, expected) in cases {
            assert_eq!(mode.test_url(input), expected, "input {input:?}");
        }
    }

    #[test]
    fn host_named_webhook_is_left_alone() {
        let mode = TestMode::default();
        assert_eq!(
            mode.test_url("https://webhook.example.com/notify"),
            "https://webhook.example.com/notify"
        );
    }

    #[test]
    fn custom_suffix_and_unparseable_urls() {
        let staging = TestMode::new("-staging");
        assert_eq!(
            staging.test_url("https://n8n.example.com/webhook/abc"),
            "https://n8n.example.com/webhook-staging/abc"
        );
        assert_eq!(TestMode::new("").suffix(), "-test");

        let mode = TestMode::default();
        assert_eq!(mode.test_url("hooks/webhook/abc"), "hooks/webhook-test/abc");
        assert_eq!(mode.test_url("not a url"), "not a url");
    }

    #[test]
    fn route_only_changes_test_messages() {
        let mode = TestMode::default();
        let url = "https://n8n.example.com/webhook/abc";

        let routed = mode.route("hello", url);
        assert_eq!(
            routed,
            Routed {
                body: "hello".into(),
                url: url.into(),
                test_mode: false
            }
        );

        let routed = mode.route("[test] hello", url);
        assert!(routed.test_mode);
        assert_eq!(routed.body, "hello");
        assert_eq!(routed.url, "https://n8n.example.com/webhook-test/abc");
    }
}

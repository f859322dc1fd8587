//! `Location` / `Link` header rewriting.

use feedpipe_stream::HeaderInterceptor;
use regex::Regex;
use tracing::debug;

/// Replaces the scheme and authority of absolute URLs in `Location` and
/// `Link` headers with a fixed base URL.
///
/// `Link` may carry several comma-separated links; each is rewritten on
/// its own. Values without an absolute `http(s)://host/` URL are kept.
#[derive(Debug, Clone)]
pub struct LinkRewriter {
    base: String,
    pattern: Regex,
}

impl LinkRewriter {
    pub fn new(base: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            // Greedy prefix: the last absolute URL in the value wins.
            pattern: Regex::new(r"^(.*)https?://[^/]+/(.*)$")?,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Rewrite a single URL-bearing value.
    pub fn rewrite(&self, value: &str) -> String {
        match self.pattern.captures(value) {
            Some(caps) => format!("{}{}/{}", &caps[1], self.base, &caps[2]),
            None => value.to_string(),
        }
    }
}

impl HeaderInterceptor for LinkRewriter {
    fn intercept(&self, name: &str, value: &str) -> Option<String> {
        if value.is_empty() {
            return None;
        }
        let rewritten = if name.eq_ignore_ascii_case("link") {
            value
                .split(',')
                .map(|link| self.rewrite(link))
                .collect::<Vec<_>>()
                .join(",")
        } else if name.eq_ignore_ascii_case("location") {
            self.rewrite(value)
        } else {
            return None;
        };
        debug!(header = name, from = value, to = %rewritten, "rewrote header");
        Some(rewritten)
    }
}

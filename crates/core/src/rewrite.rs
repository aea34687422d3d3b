//! Literal address substitution on outbound client messages.
//!
//! The relay does not parse RTSP. It looks for one configured byte string
//! (the camera's internal address, e.g. `10.1.1.32`) and swaps in another
//! (the public address) before forwarding:
//!
//! ```text
//! SETUP rtsp://10.1.1.32/stream1 RTSP/1.0
//!   -> SETUP rtsp://109.205.200.75/stream1 RTSP/1.0
//! ```
//!
//! Only the first occurrence in each received unit is replaced.

use std::borrow::Cow;

pub const DEFAULT_SEARCH_ADDRESS: &str = "10.1.1.32";
pub const DEFAULT_REPLACE_ADDRESS: &str = "109.205.200.75";

/// A literal search/replace pair applied to client-to-destination traffic.
///
/// Built once at startup and shared read-only by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    search: Vec<u8>,
    replace: Vec<u8>,
}

impl RewriteRule {
    pub fn new(search: impl Into<Vec<u8>>, replace: impl Into<Vec<u8>>) -> Self {
        Self {
            search: search.into(),
            replace: replace.into(),
        }
    }

    pub fn search(&self) -> &[u8] {
        &self.search
    }

    pub fn replace(&self) -> &[u8] {
        &self.replace
    }

    /// Replace the first occurrence of the search token in `message`.
    ///
    /// Returns the input borrowed when the token is absent, so the common
    /// no-match path does not allocate.
    pub fn apply<'a>(&self, message: &'a [u8]) -> Cow<'a, [u8]> {
        let Some(start) = find(message, &self.search) else {
            return Cow::Borrowed(message);
        };

        let end = start + self.search.len();
        let mut out = Vec::with_capacity(message.len() - self.search.len() + self.replace.len());
        out.extend_from_slice(&message[..start]);
        out.extend_from_slice(&self.replace);
        out.extend_from_slice(&message[end..]);
        Cow::Owned(out)
    }
}

impl Default for RewriteRule {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_ADDRESS, DEFAULT_REPLACE_ADDRESS)
    }
}

/// Position of the first occurrence of `needle` in `haystack`.
///
/// An empty needle never matches.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

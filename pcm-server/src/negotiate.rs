//! Content negotiation on `Accept` (spec.md §4.8).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Prometheus,
    Html,
}

impl Format {
    pub fn content_type(self) -> &'static str {
        match self {
            Format::Json => "application/json; charset=UTF-8",
            Format::Prometheus => "text/plain; version=0.0.4; charset=UTF-8",
            Format::Html => "text/html; charset=UTF-8",
        }
    }
}

/// Picks the best match in `accept` among the formats `/` and
/// `/persecond*` support; unmatched or missing `Accept` falls back to the
/// HTML landing page, matching a browser's default navigation request.
pub fn negotiate(accept: Option<&str>) -> Format {
    let Some(accept) = accept else {
        return Format::Html;
    };
    if accept.contains("application/json") {
        Format::Json
    } else if accept.contains("text/plain") {
        Format::Prometheus
    } else {
        Format::Html
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_is_preferred_when_present() {
        assert_eq!(negotiate(Some("application/json, text/plain")), Format::Json);
    }

    #[test]
    fn missing_accept_falls_back_to_html() {
        assert_eq!(negotiate(None), Format::Html);
    }

    #[test]
    fn unknown_mime_falls_back_to_html() {
        assert_eq!(negotiate(Some("application/xml")), Format::Html);
    }
}

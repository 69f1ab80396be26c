use regex::RegexSetBuilder;
use url::Url;

/// Precompiled exclusion patterns for recorded network traffic
///
/// Tracker domains, ad networks and static-asset extensions are matched
/// case-insensitively; a matching request URL is never logged.
pub struct ExclusionFilter {
    patterns: regex::RegexSet,
}

impl ExclusionFilter {
    pub fn new(patterns: &[String]) -> Result<Self, regex::Error> {
        let patterns = RegexSetBuilder::new(patterns)
            .case_insensitive(true)
            .build()?;
        Ok(Self { patterns })
    }

    pub fn is_excluded(&self, url: &str) -> bool {
        self.patterns.is_match(url)
    }
}

pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_lowercase()))
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

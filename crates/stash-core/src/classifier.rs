//! Content classification
//!
//! Maps a resource identifier to the category that decides how it is cached.
//! Rules are evaluated in a fixed order and the first match wins, so an
//! archive path like `/zim/index.json` is a `zim` resource, not `json`.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

const IMAGE_EXTENSIONS: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg"];

/// Content category of a resource
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ContentCategory {
    /// ZIM archives and anything under a `zim/` segment
    Zim,
    Image,
    Json,
    /// Scripts, stylesheets and anything unrecognized
    Static,
    /// HTML pages and the root document
    Page,
}

impl ContentCategory {
    pub const ALL: [ContentCategory; 5] = [
        ContentCategory::Zim,
        ContentCategory::Image,
        ContentCategory::Json,
        ContentCategory::Static,
        ContentCategory::Page,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCategory::Zim => "zim",
            ContentCategory::Image => "image",
            ContentCategory::Json => "json",
            ContentCategory::Static => "static",
            ContentCategory::Page => "page",
        }
    }
}

impl fmt::Display for ContentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a resource identifier (a path or an absolute URL).
///
/// Total: unmatched identifiers are `Static`.
pub fn classify(identifier: &str) -> ContentCategory {
    let path = resource_path(identifier);

    if path.ends_with(".zim") || path.contains("/zim/") || path.starts_with("zim/") {
        return ContentCategory::Zim;
    }

    if IMAGE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return ContentCategory::Image;
    }

    if path.ends_with(".json") {
        return ContentCategory::Json;
    }

    if path.ends_with(".js") || path.ends_with(".css") {
        return ContentCategory::Static;
    }

    if path.ends_with(".html") || path == "/" {
        return ContentCategory::Page;
    }

    ContentCategory::Static
}

/// Lowercased path component of an identifier, without query or fragment
fn resource_path(identifier: &str) -> String {
    let path = match Url::parse(identifier) {
        Ok(url) => url.path().to_string(),
        Err(_) => identifier
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };

    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_lowercase()
    }
}

//! Content-set filter for packaging
//!
//! Decides which files of a source tree belong in an offline bundle. The
//! engine itself never calls it; packaging tools use it before anything is
//! offered to the cache.
//!
//! Patterns are globs over `/`-separated relative paths: `*` matches within
//! one segment, `**` matches across segments, and `**/` also matches zero
//! segments so `**/*.html` admits a top-level `index.html`.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CoreError;

/// Maximum iterations for pattern matching to prevent pathological backtracking
const MAX_MATCH_ITERATIONS: usize = 10_000;

/// Filter configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilterConfig {
    #[serde(default = "default_include")]
    pub include: Vec<String>,
    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,
    #[serde(default = "default_min_file_size")]
    pub min_file_size: u64,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default = "default_max_total_size")]
    pub max_total_size: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            include: default_include(),
            exclude: default_exclude(),
            min_file_size: default_min_file_size(),
            max_file_size: default_max_file_size(),
            max_total_size: default_max_total_size(),
        }
    }
}

fn patterns(list: &[&str]) -> Vec<String> {
    list.iter().map(|p| p.to_string()).collect()
}

fn default_include() -> Vec<String> {
    patterns(&[
        // text
        "**/*.html",
        "**/*.htm",
        "**/*.txt",
        "**/*.md",
        "**/*.markdown",
        "**/*.pdf",
        // images
        "**/*.jpg",
        "**/*.jpeg",
        "**/*.png",
        "**/*.gif",
        "**/*.webp",
        "**/*.svg",
        // data
        "**/*.json",
        "**/*.xml",
        // archives
        "**/*.zip",
        "**/*.tar",
        "**/*.gz",
    ])
}

fn default_exclude() -> Vec<String> {
    patterns(&[
        "**/.DS_Store",
        "**/Thumbs.db",
        "**/desktop.ini",
        "**/*.tmp",
        "**/*.temp",
        "**/*.bak",
        "**/*.swp",
        "**/*.log",
        "**/logs/**",
        "**/*.map",
        "**/.git/**",
        "**/*.mp4",
        "**/*.avi",
        "**/*.mkv",
        "**/*.mp3",
        "**/*.wav",
        "**/broken/**",
        "**/corrupt/**",
    ])
}

fn default_min_file_size() -> u64 {
    100
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50 MB
}

fn default_max_total_size() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GB
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternPart {
    Literal(String),
    /// `*`: anything within one segment
    SingleWildcard,
    /// `**/`: zero or more whole segments
    AnyDirectories,
    /// `**`: anything, across segments
    MultiWildcard,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    parts: Vec<PatternPart>,
}

impl CompiledPattern {
    fn compile(pattern: &str) -> Result<Self, CoreError> {
        if pattern.trim().is_empty() {
            return Err(CoreError::Config("Empty filter pattern".to_string()));
        }

        let mut parts = Vec::new();
        let mut current = String::new();
        let chars: Vec<char> = pattern.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            if chars[i] != '*' {
                current.push(chars[i]);
                i += 1;
                continue;
            }

            if !current.is_empty() {
                parts.push(PatternPart::Literal(std::mem::take(&mut current)));
            }

            if chars.get(i + 1) == Some(&'*') {
                if chars.get(i + 2) == Some(&'/') {
                    parts.push(PatternPart::AnyDirectories);
                    i += 3;
                } else {
                    parts.push(PatternPart::MultiWildcard);
                    i += 2;
                }
            } else {
                parts.push(PatternPart::SingleWildcard);
                i += 1;
            }
        }

        if !current.is_empty() {
            parts.push(PatternPart::Literal(current));
        }

        Ok(Self {
            source: pattern.to_string(),
            parts,
        })
    }

    fn matches(&self, path: &str) -> bool {
        let mut iterations = 0;
        let matched = match_recursive(&self.parts, path, 0, 0, &mut iterations);
        if iterations > MAX_MATCH_ITERATIONS {
            warn!(
                "Matching {} against {} exceeded {} iterations, treating as no match",
                path, self.source, MAX_MATCH_ITERATIONS
            );
        }
        matched
    }
}

fn match_recursive(
    parts: &[PatternPart],
    path: &str,
    part_idx: usize,
    path_pos: usize,
    iterations: &mut usize,
) -> bool {
    *iterations += 1;
    if *iterations > MAX_MATCH_ITERATIONS {
        return false;
    }

    let Some(part) = parts.get(part_idx) else {
        return path_pos == path.len();
    };
    let remaining = &path[path_pos..];
    let mut next = |advance: usize| {
        match_recursive(parts, path, part_idx + 1, path_pos + advance, iterations)
    };

    match part {
        PatternPart::Literal(literal) => {
            remaining.starts_with(literal.as_str()) && next(literal.len())
        }
        PatternPart::SingleWildcard => {
            let segment_end = remaining.find('/').unwrap_or(remaining.len());
            (0..=segment_end)
                .filter(|&n| remaining.is_char_boundary(n))
                .any(&mut next)
        }
        PatternPart::AnyDirectories => std::iter::once(0)
            .chain(remaining.match_indices('/').map(|(i, _)| i + 1))
            .any(&mut next),
        PatternPart::MultiWildcard => (0..=remaining.len())
            .filter(|&n| remaining.is_char_boundary(n))
            .any(&mut next),
    }
}

/// Normalize a path to `/`-separated form without a leading `./` or `/`
fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut trimmed = path.as_str();
    loop {
        if let Some(rest) = trimmed.strip_prefix("./") {
            trimmed = rest;
        } else if let Some(rest) = trimmed.strip_prefix('/') {
            trimmed = rest;
        } else {
            break;
        }
    }
    trimmed.to_string()
}

/// Include/exclude filter, compiled once
#[derive(Debug, Clone)]
pub struct ContentFilter {
    include: Vec<CompiledPattern>,
    exclude: Vec<CompiledPattern>,
    min_file_size: u64,
    max_file_size: u64,
    max_total_size: u64,
}

impl ContentFilter {
    pub fn new(config: &FilterConfig) -> Result<Self, CoreError> {
        if config.min_file_size > config.max_file_size {
            return Err(CoreError::Config(
                "min_file_size must not exceed max_file_size".to_string(),
            ));
        }

        let compile = |list: &[String]| -> Result<Vec<CompiledPattern>, CoreError> {
            list.iter().map(|p| CompiledPattern::compile(p)).collect()
        };

        Ok(Self {
            include: compile(&config.include)?,
            exclude: compile(&config.exclude)?,
            min_file_size: config.min_file_size,
            max_file_size: config.max_file_size,
            max_total_size: config.max_total_size,
        })
    }

    /// Whether the path matches an include pattern and no exclude pattern
    pub fn matches(&self, path: &str) -> bool {
        let path = normalize(path);
        self.include.iter().any(|p| p.matches(&path))
            && !self.exclude.iter().any(|p| p.matches(&path))
    }

    /// Whether a file of `size` bytes at `path` belongs in the bundle
    pub fn admit(&self, path: &str, size: u64) -> bool {
        let admitted =
            (self.min_file_size..=self.max_file_size).contains(&size) && self.matches(path);
        if !admitted {
            debug!("Filtered out {} ({} bytes)", path, size);
        }
        admitted
    }

    pub fn max_total_size(&self) -> u64 {
        self.max_total_size
    }
}

/// Why [`ContentSet::add`] turned a file away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Fails the patterns or the per-file size limits
    Filtered,
    /// Would push the set past its total size budget
    OverBudget,
}

/// Files admitted into one bundle, bounded by the total size budget
#[derive(Debug, Clone)]
pub struct ContentSet {
    filter: ContentFilter,
    files: Vec<(String, u64)>,
    total_size: u64,
}

impl ContentSet {
    pub fn new(filter: ContentFilter) -> Self {
        Self {
            filter,
            files: Vec::new(),
            total_size: 0,
        }
    }

    pub fn add(&mut self, path: &str, size: u64) -> Result<(), Rejection> {
        if !self.filter.admit(path, size) {
            return Err(Rejection::Filtered);
        }
        if self.total_size + size > self.filter.max_total_size() {
            debug!("{} would exceed the bundle budget", path);
            return Err(Rejection::OverBudget);
        }

        self.total_size += size;
        self.files.push((normalize(path), size));
        Ok(())
    }

    pub fn files(&self) -> &[(String, u64)] {
        &self.files
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

const CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(256) {
    Some(size) => size,
    None => NonZeroUsize::MIN,
};

/// Case-insensitive glob matcher supporting `*` (any run, including empty) and `?` (exactly one
/// character).
///
/// Results are memoized per subject since the same service and operation names recur on every
/// trace.
pub struct GlobMatcher {
    pattern: String,
    pattern_lower: Vec<char>,
    cache: Mutex<LruCache<String, bool>>,
}

impl fmt::Debug for GlobMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobMatcher")
            .field("pattern", &self.pattern)
            .finish()
    }
}

impl Clone for GlobMatcher {
    fn clone(&self) -> Self {
        GlobMatcher::new(&self.pattern)
    }
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Self {
        GlobMatcher {
            pattern: pattern.to_string(),
            pattern_lower: pattern.to_lowercase().chars().collect(),
            cache: Mutex::new(LruCache::new(CACHE_SIZE)),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// True when the pattern is only `*`, which matches anything, including absent values.
    pub fn matches_everything(&self) -> bool {
        !self.pattern_lower.is_empty() && self.pattern_lower.iter().all(|c| *c == '*')
    }

    pub fn matches(&self, subject: &str) -> bool {
        if self.matches_everything() {
            return true;
        }
        let subject_lower = subject.to_lowercase();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hit) = cache.get(&subject_lower) {
            return *hit;
        }

        let subject_chars: Vec<char> = subject_lower.chars().collect();
        let result = glob_match(&self.pattern_lower, &subject_chars);
        cache.put(subject_lower, result);
        result
    }
}

/// Backtracking match: remember the last `*` and retry from one character further on mismatch.
fn glob_match(pattern: &[char], subject: &[char]) -> bool {
    let (mut px, mut sx) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while px < pattern.len() || sx < subject.len() {
        if px < pattern.len() {
            match pattern[px] {
                '*' => {
                    backtrack = Some((px, sx + 1));
                    px += 1;
                    continue;
                }
                '?' if sx < subject.len() => {
                    px += 1;
                    sx += 1;
                    continue;
                }
                c if sx < subject.len() && subject[sx] == c => {
                    px += 1;
                    sx += 1;
                    continue;
                }
                _ => {}
            }
        }
        match backtrack {
            Some((star_px, next_sx)) if next_sx <= subject.len() => {
                px = star_px;
                sx = next_sx;
            }
            _ => return false,
        }
    }
    true
}

//! Topic pattern matching.
//!
//! Routing keys and binding patterns are `.`-separated words. In a pattern
//! `*` matches exactly one word and `#` matches zero or more words; any other
//! word must match literally.

/// Returns whether `routing_key` matches the topic `pattern`.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    let (n, m) = (pattern.len(), words.len());

    // next[j]: pattern[i + 1..] matches words[j..]
    let mut next = vec![false; m + 1];
    next[m] = true;

    for i in (0..n).rev() {
        let mut current = vec![false; m + 1];
        for j in (0..=m).rev() {
            current[j] = match pattern[i] {
                "#" => next[j] || (j < m && current[j + 1]),
                "*" => j < m && next[j + 1],
                word => j < m && words[j] == word && next[j + 1],
            };
        }
        next = current;
    }
    next[0]
}

// FlashLaunch Core - Fuzzy Scorer
// Copyright (C) 2025 Akaere Networks
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Candidate scoring against a free-text query
//!
//! Rules, first match wins (all case-insensitive):
//! 1. exact match → `1.0`
//! 2. prefix match → `0.9`
//! 3. substring match → `0.75`
//! 4. otherwise `min(0.7 * LCS / len(candidate), 0.7)`
//!
//! Blank candidates or queries score `0`. Both sides are trimmed first.

pub const EXACT_SCORE: f64 = 1.0;
pub const PREFIX_SCORE: f64 = 0.9;
pub const SUBSTRING_SCORE: f64 = 0.75;
/// Upper bound (and weight) of the subsequence fallback
pub const SUBSEQUENCE_WEIGHT: f64 = 0.7;

/// Score `candidate` against `query`, always within `[0, 1]`
pub fn score(candidate: &str, query: &str) -> f64 {
    let candidate = candidate.trim();
    let query = query.trim();
    if candidate.is_empty() || query.is_empty() {
        return 0.0;
    }

    let candidate = candidate.to_lowercase();
    let query = query.to_lowercase();

    if candidate == query {
        return EXACT_SCORE;
    }
    if candidate.starts_with(&query) {
        return PREFIX_SCORE;
    }
    if candidate.contains(&query) {
        return SUBSTRING_SCORE;
    }

    let length = candidate.chars().count();
    let lcs = longest_common_subsequence(&candidate, &query);
    (SUBSEQUENCE_WEIGHT * lcs as f64 / length as f64).min(SUBSEQUENCE_WEIGHT)
}

/// Classic LCS length, keeping a single DP row
fn longest_common_subsequence(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row = vec![0usize; b.len() + 1];

    for ca in a.chars() {
        // dp[i-1][j-1]
        let mut diagonal = 0;
        for (j, &cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb {
                diagonal + 1
            } else {
                above.max(row[j])
            };
            diagonal = above;
        }
    }

    row[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_examples() {
        assert_eq!(score("Google Chrome", "chr"), SUBSTRING_SCORE);
        assert_eq!(score("Google Chrome", "Google"), PREFIX_SCORE);
        assert_eq!(score("Google Chrome", "google chrome"), EXACT_SCORE);
    }

    #[test]
    fn test_blank_inputs_score_zero() {
        assert_eq!(score("", "abc"), 0.0);
        assert_eq!(score("abc", ""), 0.0);
        assert_eq!(score("   ", "abc"), 0.0);
        assert_eq!(score("abc", "  \t"), 0.0);
    }

    #[test]
    fn test_subsequence_fallback() {
        // "gc" is neither prefix nor substring of "google chrome", LCS = 2
        let expected = 0.7 * 2.0 / 13.0;
        assert!((score("Google Chrome", "gc") - expected).abs() < 1e-12);

        // No common characters at all
        assert_eq!(score("abc", "xyz"), 0.0);
    }

    #[test]
    fn test_subsequence_is_capped() {
        // Query longer than the candidate, sharing all its characters
        let value = score("ab", "xaybz");
        assert!(value <= SUBSEQUENCE_WEIGHT);
        assert!((value - SUBSEQUENCE_WEIGHT).abs() < 1e-12);
    }

    #[test]
    fn test_lcs_table() {
        assert_eq!(longest_common_subsequence("abcbdab", "bdcaba"), 4);
        assert_eq!(longest_common_subsequence("", "abc"), 0);
        assert_eq!(longest_common_subsequence("abc", "abc"), 3);
    }

    #[test]
    fn test_rule_order_is_monotone() {
        let candidates = ["Visual Studio Code", "Terminal", "Calculator", "Über Café"];
        for candidate in candidates {
            let lower = candidate.to_lowercase();
            let exact = score(candidate, &lower);
            let prefix = score(candidate, &lower[..lower.char_indices().nth(3).unwrap().0]);
            let substring = score(candidate, &lower[lower.char_indices().nth(1).unwrap().0..]);
            let fallback = score(candidate, "qzx");

            assert!(exact >= prefix, "{candidate}");
            assert!(prefix >= substring, "{candidate}");
            assert!(substring >= fallback, "{candidate}");

            for value in [exact, prefix, substring, fallback] {
                assert!((0.0..=1.0).contains(&value));
            }
        }
    }

    #[test]
    fn test_case_insensitive_unicode() {
        assert_eq!(score("ÜBER", "über"), EXACT_SCORE);
        assert_eq!(score("Straße Apps", "STRASSE"), score("Straße Apps", "strasse"));
    }
}

//! "Did you mean" suggestions for unknown identifiers.
//!
//! Shared by the semantic validator and the template resolver. A suggestion is
//! offered when the closest known identifier is within edit distance 2.

/// Maximum edit distance for which a suggestion is offered.
const MAX_DISTANCE: usize = 2;

/// Levenshtein distance between two strings (char-wise, single-row DP).
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut row: Vec<usize> = (0..=b.len()).collect();
    for (i, &ca) in a.iter().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            let next = (prev + cost).min(row[j] + 1).min(row[j + 1] + 1);
            prev = row[j + 1];
            row[j + 1] = next;
        }
    }
    row[b.len()]
}

/// Returns the candidate closest to `unknown` when within edit distance 2.
/// Ties resolve to the lexically smallest candidate so output is stable.
pub fn closest<'a, I>(unknown: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(usize, &str)> = None;
    for cand in candidates {
        let d = edit_distance(unknown, cand);
        if d > MAX_DISTANCE {
            continue;
        }
        best = match best {
            Some((bd, bc)) if (bd, bc) <= (d, cand) => Some((bd, bc)),
            _ => Some((d, cand)),
        };
    }
    best.map(|(_, c)| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_basic() {
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", "abc"), 0);
        assert_eq!(edit_distance("artcle", "article"), 1);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
    }

    #[test]
    fn closest_within_two_edits() {
        let cands = ["article", "research", "score"];
        assert_eq!(
            closest("artcle", cands.iter().copied()),
            Some("article".to_string())
        );
        assert_eq!(closest("zzzzz", cands.iter().copied()), None);
    }

    #[test]
    fn closest_prefers_smaller_distance_then_lexical() {
        let cands = ["aab", "aac"];
        // Both are distance 1 from "aaa"; the lexically smaller wins.
        assert_eq!(closest("aaa", cands.iter().copied()), Some("aab".to_string()));
    }
}

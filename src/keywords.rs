use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

static RE_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[a-zA-Z0-9_.\-]+").expect("word pattern is valid")
});

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // articles and auxiliaries
        "a", "an", "the", "is", "are", "was", "were", "be", "been", "being",
        "have", "has", "had", "do", "does", "did", "will", "would", "could",
        "should", "may", "might", "must", "shall",
        // pronouns and determiners
        "i", "me", "my", "we", "our", "you", "your", "he", "she", "it",
        "they", "them", "their", "this", "that", "these", "those",
        "what", "which", "who", "whom", "how", "when", "where", "why",
        "all", "any", "both", "each", "few", "more", "most", "some",
        // request verbs
        "show", "get", "find", "list", "display", "give", "tell", "can",
        "please", "want", "need", "like",
        // prepositions and conjunctions
        "to", "of", "in", "for", "on", "with", "at", "by", "from", "as",
        "into", "through", "during", "before", "after", "above", "below",
        "between", "and", "or", "but", "not",
    ]
    .into_iter()
    .collect()
});

/// Reduce a natural-language request to lowercase search terms, in order
/// of first appearance.
pub fn extract_keywords(query: &str) -> Vec<String> {
    let lowered = query.to_lowercase();
    let mut seen = HashSet::new();

    RE_WORD
        .find_iter(&lowered)
        .map(|m| m.as_str())
        .filter(|word| word.chars().count() >= 2)
        .filter(|word| !STOP_WORDS.contains(word))
        .filter(|word| seen.insert(word.to_string()))
        .map(str::to_string)
        .collect()
}

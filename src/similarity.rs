//! Similarity measures used by the reconciler and the retriever:
//! embedding cosine, stemmed lexical overlap and entity-set Jaccard.

use ordered_float::OrderedFloat;
use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashSet;

/// Compute cosine similarity between two vectors.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Find the top-k most similar candidates to a query vector.
pub fn top_k_similar<T: Clone>(
    query: &[f32],
    candidates: &[(Vec<f32>, T)],
    k: usize,
) -> Vec<(f32, T)> {
    let mut scored: Vec<(OrderedFloat<f32>, T)> = candidates
        .iter()
        .map(|(vec, item)| (OrderedFloat(cosine_similarity(query, vec)), item.clone()))
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0));

    scored
        .into_iter()
        .take(k)
        .map(|(score, item)| (score.0, item))
        .collect()
}

fn stem_tokens(text: &str) -> HashSet<String> {
    let stemmer = Stemmer::create(Algorithm::English);
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| stemmer.stem(&t.to_lowercase()).into_owned())
        .collect()
}

/// Normalized lexical overlap between two texts: the share of the smaller
/// stemmed token set that also appears in the other. 1.0 for identical
/// token sets, 0.0 for disjoint texts.
pub fn lexical_overlap(a: &str, b: &str) -> f32 {
    let tokens_a = stem_tokens(a);
    let tokens_b = stem_tokens(b);
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let shared = tokens_a.intersection(&tokens_b).count();
    shared as f32 / tokens_a.len().min(tokens_b.len()) as f32
}

/// Jaccard similarity of two entity-name sets, case-insensitive.
pub fn entity_jaccard(a: &[String], b: &[String]) -> f32 {
    let set_a: HashSet<String> = a.iter().map(|s| s.to_lowercase()).collect();
    let set_b: HashSet<String> = b.iter().map(|s| s.to_lowercase()).collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 0.0;
    }

    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f32 / union as f32
}

/// Whether two entity-name sets are equal, case-insensitive.
pub fn entity_sets_equal(a: &[String], b: &[String]) -> bool {
    let set_a: HashSet<String> = a.iter().map(|s| s.to_lowercase()).collect();
    let set_b: HashSet<String> = b.iter().map(|s| s.to_lowercase()).collect();
    !set_a.is_empty() && set_a == set_b
}

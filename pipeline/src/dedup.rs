//! Semantic near-duplicate suppression for generated instructions.

use remote::{cosine_similarity, EmbeddingService, RemoteError};
use std::collections::HashSet;
use tracing::debug;

/// Keeps the candidates whose highest cosine similarity to any `existing`
/// text is below `threshold`, in their original order.
///
/// A candidate identical to an existing text is always dropped, before any
/// embedding is computed. Candidates are not compared with each other. With
/// no existing texts the candidates are returned untouched and the embedder
/// is not called.
pub fn filter<E>(
    embedder: &E,
    candidates: Vec<String>,
    existing: &[String],
    threshold: f32,
) -> Result<Vec<String>, RemoteError>
where
    E: EmbeddingService + ?Sized,
{
    if candidates.is_empty() || existing.is_empty() {
        return Ok(candidates);
    }

    let known: HashSet<&str> = existing.iter().map(String::as_str).collect();
    let before = candidates.len();
    let candidates: Vec<String> = candidates
        .into_iter()
        .filter(|c| !known.contains(c.as_str()))
        .collect();
    let exact = before - candidates.len();
    if candidates.is_empty() {
        debug!(exact, "all candidates were exact duplicates");
        return Ok(candidates);
    }

    let candidate_vecs = embedder.embed(&candidates)?;
    let existing_vecs = embedder.embed(existing)?;

    let kept: Vec<String> = candidates
        .into_iter()
        .zip(candidate_vecs.iter())
        .filter(|(_, vec)| {
            let max = existing_vecs
                .iter()
                .map(|other| cosine_similarity(vec, other))
                .fold(f32::NEG_INFINITY, f32::max);
            max < threshold
        })
        .map(|(text, _)| text)
        .collect();

    debug!(
        exact,
        similar = before - exact - kept.len(),
        kept = kept.len(),
        "dedup filter applied"
    );
    Ok(kept)
}

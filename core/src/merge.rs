//! Fan-in of the workers' local candidates into the final per-query ranking

use crate::collector::LocalTopK;
use crate::similarity::NAN_SCORE;
use crate::SearchError;
use std::collections::{BTreeSet, HashMap};
use tracing::instrument;

/// query id -> corpus id -> score. Corpus ids missing from a query's map were not in its
/// top-k; absence never means a score of zero.
pub type SearchResults = HashMap<String, HashMap<String, f32>>;

/// Check that every chunk `0..n_chunks` contributed exactly one record. Sentinels are
/// ignored. Returns the missing batch indices.
pub fn reconcile<'a, I>(records: I, n_chunks: usize) -> Result<Vec<usize>, SearchError>
where
    I: IntoIterator<Item = &'a LocalTopK>,
{
    let mut seen = vec![0usize; n_chunks];
    let mut duplicates = BTreeSet::new();

    for record in records {
        if record.is_sentinel() {
            continue;
        }
        match usize::try_from(record.batch_index)
            .ok()
            .and_then(|i| seen.get_mut(i))
        {
            Some(count) => {
                *count += 1;
                if *count > 1 {
                    duplicates.insert(record.batch_index as usize);
                }
            }
            None => {
                return Err(SearchError::Validation(format!(
                    "record has batch index {} but only {n_chunks} chunks were dispatched",
                    record.batch_index
                )))
            }
        }
    }

    if !duplicates.is_empty() {
        return Err(SearchError::DuplicateChunks(duplicates.into_iter().collect()));
    }

    Ok(seen
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(i, _)| i)
        .collect())
}

/// Build the final ranking. The candidate `j` of query `qi` in a record sits at global
/// corpus position `indices[[j, qi]] + batch_index * chunk_size`. Self-matches and
/// NaN-scored candidates are dropped, then each query keeps its `top_k` best candidates.
#[instrument(skip_all, fields(records = tracing::field::Empty, queries = query_ids.len()))]
pub fn merge<'a, I>(
    records: I,
    query_ids: &[String],
    corpus_ids: &[String],
    chunk_size: usize,
    top_k: usize,
) -> SearchResults
where
    I: IntoIterator<Item = &'a LocalTopK>,
{
    // (score, global position) per query
    let mut candidates: Vec<Vec<(f32, usize)>> = vec![Vec::new(); query_ids.len()];
    let mut n_records = 0usize;

    for record in records {
        if record.is_sentinel() {
            continue;
        }
        n_records += 1;
        let offset = record.batch_index as usize * chunk_size;

        for (qi, query_id) in query_ids.iter().enumerate() {
            if qi >= record.values.ncols() {
                break;
            }
            for j in 0..record.k() {
                let score = record.values[[j, qi]];
                if score == NAN_SCORE {
                    continue;
                }
                let position = offset + record.indices[[j, qi]];
                let Some(corpus_id) = corpus_ids.get(position) else {
                    tracing::warn!(
                        "Chunk {} points at corpus position {position} out of {}",
                        record.batch_index,
                        corpus_ids.len()
                    );
                    continue;
                };
                if corpus_id == query_id {
                    continue;
                }
                candidates[qi].push((score, position));
            }
        }
    }
    tracing::Span::current().record("records", n_records);

    query_ids
        .iter()
        .zip(candidates)
        .map(|(query_id, mut hits)| {
            hits.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
            let mut ranking = HashMap::with_capacity(top_k.min(hits.len()));
            for (score, position) in hits {
                if ranking.len() == top_k {
                    break;
                }
                ranking
                    .entry(corpus_ids[position].clone())
                    .or_insert(score);
            }
            (query_id.clone(), ranking)
        })
        .collect()
}

/// Hits of one query by descending score, ties by corpus id
pub fn ranked(hits: &HashMap<String, f32>) -> Vec<(&str, f32)> {
    let mut ranked: Vec<(&str, f32)> = hits.iter().map(|(id, s)| (id.as_str(), *s)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(b.0)));
    ranked
}

use crate::errors::EvolveError;
use crate::model::ParentSet;
use crate::storage::Store;

/// Elitist parent selection for generation `iter` (> 0).
///
/// Ranks every built, executed, scored candidate from generations `0..iter` and
/// keeps the best `k`. Fewer than two eligible candidates is fatal.
pub fn select_parents(store: &Store, run_id: &str, iter: u32, k: usize) -> anyhow::Result<ParentSet> {
    let source_iter = iter.saturating_sub(1);
    let eligible = store.eligible_parents(run_id, source_iter)?;
    if eligible.len() < 2 {
        return Err(EvolveError::InsufficientParents {
            iter: source_iter,
            found: eligible.len(),
        }
        .into());
    }

    let top: Vec<_> = eligible.into_iter().take(k).collect();
    let parents = ParentSet {
        source_iter,
        ids: top.iter().map(|r| r.id).collect(),
        codes: top.iter().map(|r| r.final_code.clone()).collect(),
        scores: top.iter().map(|r| r.score).collect(),
    };
    tracing::info!(
        event = "generation.select",
        iter,
        parents = ?parents.ids,
        best_score = ?parents.best_score(),
        "best score seen up to iter={} is {:?}",
        source_iter,
        parents.best_score()
    );
    Ok(parents)
}

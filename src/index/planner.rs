//! Thin query planner: conjunct ordering and bitmap combination.
//!
//! Compound predicates evaluate bottom-up in the integer-id space. For a
//! conjunction, leaves are ordered ascending by estimated result size
//! (low-cardinality fields first) so the running AND shrinks as fast as
//! possible, and evaluation short-circuits the moment it is empty.
//! Negation is AND-NOT against the live roster. UUIDs materialize only at
//! the very end, in the caller.

use futures::future::BoxFuture;
use futures::FutureExt;

use super::predicate::Predicate;
use super::{ExactValueSource, IndexError, MetadataIndex};
use crate::bitmap::IdSet;

/// Evaluate a predicate tree to an id set.
pub(crate) fn evaluate<'a>(
    index: &'a MetadataIndex,
    predicate: &'a Predicate,
    exact: &'a dyn ExactValueSource,
) -> BoxFuture<'a, Result<IdSet, IndexError>> {
    async move {
        match predicate {
            Predicate::All(parts) => evaluate_conjunction(index, parts, exact).await,
            Predicate::Any(parts) => {
                let mut results = Vec::with_capacity(parts.len());
                for part in parts {
                    results.push(evaluate(index, part, exact).await?);
                }
                Ok(IdSet::or_many(results.iter()))
            }
            Predicate::Not(inner) => {
                let excluded = evaluate(index, inner, exact).await?;
                Ok(index.roster().await?.and_not(&excluded))
            }
            leaf => index.eval_leaf(leaf, exact).await,
        }
    }
    .boxed()
}

async fn evaluate_conjunction(
    index: &MetadataIndex,
    parts: &[Predicate],
    exact: &dyn ExactValueSource,
) -> Result<IdSet, IndexError> {
    // Flatten nested conjunctions so ordering sees every conjunct at once.
    let mut leaves: Vec<&Predicate> = Vec::new();
    let mut complex: Vec<&Predicate> = Vec::new();
    let mut stack: Vec<&Predicate> = parts.iter().collect();
    while let Some(part) = stack.pop() {
        match part {
            Predicate::All(inner) => stack.extend(inner.iter()),
            Predicate::Any(_) | Predicate::Not(_) => complex.push(part),
            leaf => leaves.push(leaf),
        }
    }

    // Cheapest conjunct first: its result bounds every later AND.
    let mut estimated = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        estimated.push((index.estimate_leaf(leaf).await, leaf));
    }
    estimated.sort_by_key(|(cost, _)| *cost);

    let mut acc: Option<IdSet> = None;
    for (_, leaf) in estimated {
        let ids = index.eval_leaf(leaf, exact).await?;
        acc = Some(match acc {
            Some(current) => current.and(&ids),
            None => ids,
        });
        if acc.as_ref().expect("just set").is_empty() {
            tracing::trace!("conjunction short-circuited empty");
            return Ok(IdSet::new());
        }
    }
    for part in complex {
        let ids = evaluate(index, part, exact).await?;
        acc = Some(match acc {
            Some(current) => current.and(&ids),
            None => ids,
        });
        if acc.as_ref().expect("just set").is_empty() {
            return Ok(IdSet::new());
        }
    }
    Ok(acc.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::super::{IndexConfig, MetadataIndex, NoExactValues};
    use crate::cache::UnifiedCache;
    use crate::interner::IdMapper;
    use crate::model::Metadata;
    use crate::storage::{MemoryStore, ObjectStore};
    use crate::writebuf::{WriteBuffer, WriteBufferConfig};
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    fn test_index() -> MetadataIndex {
        let store = Arc::new(MemoryStore::new());
        let writer = Arc::new(WriteBuffer::new(
            store.clone() as Arc<dyn ObjectStore>,
            WriteBufferConfig::default(),
        ));
        MetadataIndex::new(
            store,
            writer,
            Arc::new(Mutex::new(IdMapper::new())),
            Arc::new(UnifiedCache::new(4 << 20)),
            IndexConfig::default(),
        )
    }

    fn meta(value: serde_json::Value) -> Metadata {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_conjunction_intersects() {
        let index = test_index();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index
            .add_entity(a, "Concept", &meta(json!({"type": "Concept", "score": 0.8})))
            .await
            .unwrap();
        index
            .add_entity(b, "Concept", &meta(json!({"type": "Concept", "score": 0.2})))
            .await
            .unwrap();

        let hits = index
            .query(
                &json!({"noun": "Concept", "score": {"gte": 0.5}}),
                &NoExactValues,
            )
            .await
            .unwrap();
        assert_eq!(hits, vec![a]);
    }

    #[tokio::test]
    async fn test_disjunction_unions() {
        let index = test_index();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        for (id, color) in [(a, "red"), (b, "green"), (c, "blue")] {
            index
                .add_entity(id, "Thing", &meta(json!({"color": color})))
                .await
                .unwrap();
        }

        let mut hits = index
            .query(
                &json!({"anyOf": [{"color": "red"}, {"color": "blue"}]}),
                &NoExactValues,
            )
            .await
            .unwrap();
        hits.sort();
        let mut expected = vec![a, c];
        expected.sort();
        assert_eq!(hits, expected);
    }

    #[tokio::test]
    async fn test_not_complements_against_roster() {
        let index = test_index();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index
            .add_entity(a, "Thing", &meta(json!({"color": "red"})))
            .await
            .unwrap();
        index
            .add_entity(b, "Thing", &meta(json!({"shape": "round"})))
            .await
            .unwrap();

        // b lacks `color` entirely and still matches the negation
        let hits = index
            .query(&json!({"not": {"color": "red"}}), &NoExactValues)
            .await
            .unwrap();
        assert_eq!(hits, vec![b]);
    }

    #[tokio::test]
    async fn test_empty_conjunct_short_circuits() {
        let index = test_index();
        index
            .add_entity(Uuid::new_v4(), "Thing", &meta(json!({"a": 1})))
            .await
            .unwrap();

        let hits = index
            .query(
                &json!({"a": 1, "nonexistent_field": "x"}),
                &NoExactValues,
            )
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_nested_combinators() {
        let index = test_index();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index
            .add_entity(a, "Person", &meta(json!({"type": "Person", "age": 30})))
            .await
            .unwrap();
        index
            .add_entity(b, "Person", &meta(json!({"type": "Person", "age": 70})))
            .await
            .unwrap();

        let hits = index
            .query(
                &json!({
                    "noun": "Person",
                    "anyOf": [
                        {"age": {"lt": 40}},
                        {"age": {"gt": 100}},
                    ]
                }),
                &NoExactValues,
            )
            .await
            .unwrap();
        assert_eq!(hits, vec![a]);
    }
}

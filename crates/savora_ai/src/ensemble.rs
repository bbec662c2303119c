//! Ensemble output combination.
//!
//! Combines the outputs of several models for one logical request. The
//! reducer is shape-driven rather than task-specific: list outputs are merged
//! item-by-item under a caller-supplied identity key, object outputs are
//! merged field-by-field, and anything else falls back to the
//! highest-weighted branch. Numeric fields combine as a weighted average;
//! string-array fields union with order-preserving de-duplication.

use serde_json::{Map, Value};

/// One successful branch: the model's contribution weight and its output.
pub struct Contribution {
    pub weight: f64,
    pub output: Value,
}

/// Field names driving the list merge. No task-specific field name is ever
/// assumed; callers override per task when their items use different names.
#[derive(Debug, Clone)]
pub struct MergeKeys {
    /// Identifies an item across branches when outputs are arrays of
    /// objects. Items missing the key are identified by their full
    /// serialized form, so they still de-duplicate exactly.
    pub identity: String,
    /// Orders the merged list, descending, when every merged item carries
    /// a numeric value under it.
    pub rank: String,
}

impl Default for MergeKeys {
    fn default() -> Self {
        Self {
            identity: "id".into(),
            rank: "score".into(),
        }
    }
}

/// Combine branch outputs into one value.
pub fn combine_outputs(contributions: &[Contribution], keys: &MergeKeys) -> Value {
    match contributions {
        [] => Value::Null,
        [only] => only.output.clone(),
        _ => {
            if contributions.iter().all(|c| c.output.is_array()) {
                combine_arrays(contributions, keys)
            } else if contributions.iter().all(|c| c.output.is_object()) {
                combine_objects(contributions)
            } else {
                heaviest(contributions)
            }
        }
    }
}

/// Ensemble confidence: fraction of branches that succeeded, scaled by the
/// mean weight of the contributing models.
pub fn confidence(contributions: &[Contribution], dispatched: usize) -> f64 {
    if contributions.is_empty() || dispatched == 0 {
        return 0.0;
    }
    let mean_weight: f64 =
        contributions.iter().map(|c| c.weight).sum::<f64>() / contributions.len() as f64;
    (contributions.len() as f64 / dispatched as f64) * mean_weight
}

fn heaviest(contributions: &[Contribution]) -> Value {
    contributions
        .iter()
        .max_by(|a, b| {
            a.weight
                .partial_cmp(&b.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|c| c.output.clone())
        .unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Array merge
// ---------------------------------------------------------------------------

fn item_identity(item: &Value, identity_key: &str) -> String {
    item.get(identity_key)
        .map(|v| v.to_string())
        .unwrap_or_else(|| item.to_string())
}

fn combine_arrays(contributions: &[Contribution], keys: &MergeKeys) -> Value {
    // Group items by identity, preserving first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, Vec<(f64, &Value)>> =
        std::collections::HashMap::new();

    for contribution in contributions {
        let Some(items) = contribution.output.as_array() else {
            continue;
        };
        for item in items {
            let id = item_identity(item, &keys.identity);
            let group = groups.entry(id.clone()).or_insert_with(|| {
                order.push(id);
                Vec::new()
            });
            group.push((contribution.weight, item));
        }
    }

    let mut merged: Vec<Value> = order
        .iter()
        .map(|id| merge_group(&groups[id]))
        .collect();

    // Re-rank by combined rank value where every item carries one.
    if merged
        .iter()
        .all(|item| item.get(&keys.rank).is_some_and(Value::is_number))
    {
        merged.sort_by(|a, b| {
            let sa = a.get(&keys.rank).and_then(Value::as_f64).unwrap_or(0.0);
            let sb = b.get(&keys.rank).and_then(Value::as_f64).unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    Value::Array(merged)
}

/// Merge all appearances of one item across branches.
fn merge_group(entries: &[(f64, &Value)]) -> Value {
    if entries.len() == 1 {
        return entries[0].1.clone();
    }

    // Non-object items de-duplicate to themselves.
    if !entries.iter().all(|(_, v)| v.is_object()) {
        return entries[0].1.clone();
    }

    let weighted: Vec<Contribution> = entries
        .iter()
        .map(|(w, v)| Contribution {
            weight: *w,
            output: (*v).clone(),
        })
        .collect();
    combine_objects(&weighted)
}

// ---------------------------------------------------------------------------
// Object merge
// ---------------------------------------------------------------------------

fn combine_objects(contributions: &[Contribution]) -> Value {
    let mut result = Map::new();

    // Field order follows the heaviest branch, then any fields only other
    // branches carry.
    let mut field_order: Vec<String> = Vec::new();
    let heaviest_first = {
        let mut sorted: Vec<&Contribution> = contributions.iter().collect();
        sorted.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        sorted
    };
    for contribution in &heaviest_first {
        if let Some(obj) = contribution.output.as_object() {
            for key in obj.keys() {
                if !field_order.contains(key) {
                    field_order.push(key.clone());
                }
            }
        }
    }

    for field in field_order {
        let present: Vec<(f64, &Value)> = contributions
            .iter()
            .filter_map(|c| c.output.get(&field).map(|v| (c.weight, v)))
            .collect();
        result.insert(field, merge_field(&present));
    }

    Value::Object(result)
}

fn merge_field(values: &[(f64, &Value)]) -> Value {
    if values.iter().all(|(_, v)| v.is_number()) {
        let total_weight: f64 = values.iter().map(|(w, _)| *w).sum();
        if total_weight > 0.0 {
            let sum: f64 = values
                .iter()
                .map(|(w, v)| w * v.as_f64().unwrap_or(0.0))
                .sum();
            return Value::from(sum / total_weight);
        }
    }

    if values.iter().all(|(_, v)| is_string_array(v)) {
        let mut seen = Vec::new();
        for (_, v) in values {
            for s in v.as_array().into_iter().flatten() {
                if !seen.contains(s) {
                    seen.push(s.clone());
                }
            }
        }
        return Value::Array(seen);
    }

    // Mixed or non-mergeable shapes: the heaviest branch wins.
    values
        .iter()
        .max_by(|(wa, _), (wb, _)| wa.partial_cmp(wb).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(_, v)| (*v).clone())
        .unwrap_or(Value::Null)
}

fn is_string_array(v: &Value) -> bool {
    v.as_array().is_some_and(|a| a.iter().all(Value::is_string))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn c(weight: f64, output: Value) -> Contribution {
        Contribution { weight, output }
    }

    fn keys() -> MergeKeys {
        MergeKeys::default()
    }

    #[test]
    fn empty_is_null_single_is_identity() {
        assert_eq!(combine_outputs(&[], &keys()), Value::Null);
        let out = json!({"score": 4.2});
        assert_eq!(combine_outputs(&[c(0.5, out.clone())], &keys()), out);
    }

    #[test]
    fn identical_scores_average_to_themselves() {
        // Weighted-average identity law: all branches agreeing on a score
        // leave it unchanged.
        let item = json!([{"id": "r1", "score": 4.0}]);
        let combined = combine_outputs(
            &[c(0.9, item.clone()), c(0.5, item.clone()), c(0.7, item)],
            &keys(),
        );
        assert!((combined[0]["score"].as_f64().unwrap() - 4.0).abs() < 1e-9);
    }

    #[test]
    fn numeric_fields_weighted_average() {
        let combined = combine_outputs(
            &[
                c(1.0, json!({"score": 2.0})),
                c(3.0, json!({"score": 6.0})),
            ],
            &keys(),
        );
        // (1*2 + 3*6) / 4 = 5
        assert!((combined["score"].as_f64().unwrap() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn list_merge_dedupes_by_identity_key() {
        let a = json!([
            {"id": "r1", "score": 4.0, "tags": ["thai"]},
            {"id": "r2", "score": 3.0, "tags": ["cafe"]}
        ]);
        let b = json!([
            {"id": "r1", "score": 5.0, "tags": ["spicy"]},
            {"id": "r3", "score": 4.5, "tags": ["sushi"]}
        ]);
        let combined = combine_outputs(&[c(1.0, a), c(1.0, b)], &keys());
        let items = combined.as_array().unwrap();
        assert_eq!(items.len(), 3);

        let r1 = items.iter().find(|i| i["id"] == "r1").unwrap();
        assert!((r1["score"].as_f64().unwrap() - 4.5).abs() < 1e-9);
        assert_eq!(r1["tags"], json!(["thai", "spicy"]));
    }

    #[test]
    fn merged_lists_reranked_by_score() {
        let a = json!([{"id": "low", "score": 1.0}, {"id": "high", "score": 4.0}]);
        let b = json!([{"id": "mid", "score": 3.0}]);
        let combined = combine_outputs(&[c(1.0, a), c(1.0, b)], &keys());
        let ids: Vec<&str> = combined
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn custom_identity_key() {
        let a = json!([{"place_id": "p1", "score": 2.0}]);
        let b = json!([{"place_id": "p1", "score": 4.0}]);
        let merge_keys = MergeKeys {
            identity: "place_id".into(),
            ..MergeKeys::default()
        };
        let combined = combine_outputs(&[c(1.0, a), c(1.0, b)], &merge_keys);
        let items = combined.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert!((items[0]["score"].as_f64().unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn custom_rank_key_orders_merged_list() {
        // Items rank on "rating"; the default "score" field is absent.
        let a = json!([{"id": "low", "rating": 1.5}, {"id": "high", "rating": 4.5}]);
        let b = json!([{"id": "mid", "rating": 3.0}]);
        let merge_keys = MergeKeys {
            rank: "rating".into(),
            ..MergeKeys::default()
        };
        let combined = combine_outputs(&[c(1.0, a.clone()), c(1.0, b.clone())], &merge_keys);
        let ids: Vec<&str> = combined
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);

        // Under the default keys nothing carries "score", so first-seen
        // order is preserved instead.
        let unranked = combine_outputs(&[c(1.0, a), c(1.0, b)], &keys());
        let ids: Vec<&str> = unranked
            .as_array()
            .unwrap()
            .iter()
            .map(|i| i["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["low", "high", "mid"]);
    }

    #[test]
    fn mismatched_shapes_fall_back_to_heaviest() {
        let combined = combine_outputs(
            &[
                c(0.3, json!("light opinion")),
                c(0.9, json!("heavy opinion")),
            ],
            &keys(),
        );
        assert_eq!(combined, json!("heavy opinion"));
    }

    #[test]
    fn non_numeric_scalar_field_takes_heaviest() {
        let combined = combine_outputs(
            &[
                c(0.2, json!({"summary": "meh"})),
                c(0.8, json!({"summary": "great"})),
            ],
            &keys(),
        );
        assert_eq!(combined["summary"], "great");
    }

    #[test]
    fn confidence_scales_with_successes_and_weight() {
        let contributions = vec![c(1.0, json!(1)), c(1.0, json!(2))];
        // 2 of 3 branches succeeded at full weight.
        let conf = confidence(&contributions, 3);
        assert!((conf - 2.0 / 3.0).abs() < 1e-9);

        // Same success ratio but weaker models halves the confidence.
        let weak = vec![c(0.5, json!(1)), c(0.5, json!(2))];
        assert!((confidence(&weak, 3) - 1.0 / 3.0).abs() < 1e-9);

        assert_eq!(confidence(&[], 3), 0.0);
    }
}

// src/op.rs

use serde_json::{json, Value};

use crate::error::ParseError;
use crate::types::{ParseRelation, ParseValue, Pointer};

/// A pending change to one attribute of a [`crate::ParseObject`].
///
/// Objects hold at most one op per attribute; a new mutation is folded into the
/// existing op with [`FieldOp::merge_onto`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Set(ParseValue),
    Unset,
    Increment(ParseValue),
    Add(Vec<ParseValue>),
    AddUnique(Vec<ParseValue>),
    Remove(Vec<ParseValue>),
    Relation {
        target_class: String,
        added: Vec<Pointer>,
        removed: Vec<Pointer>,
    },
}

fn push_unique(into: &mut Vec<ParseValue>, items: &[ParseValue]) {
    for item in items {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}

fn incompatible(previous: &FieldOp, next: &FieldOp) -> ParseError {
    ParseError::InvalidInput(format!(
        "cannot apply {} after a pending {}",
        next.name(),
        previous.name()
    ))
}

impl FieldOp {
    pub fn name(&self) -> &'static str {
        match self {
            FieldOp::Set(_) => "Set",
            FieldOp::Unset => "Delete",
            FieldOp::Increment(_) => "Increment",
            FieldOp::Add(_) => "Add",
            FieldOp::AddUnique(_) => "AddUnique",
            FieldOp::Remove(_) => "Remove",
            FieldOp::Relation { .. } => "Relation",
        }
    }

    /// Folds `self` (the newer mutation) onto `previous`, producing the single op
    /// that has the same effect as applying both in order.
    pub fn merge_onto(self, previous: &FieldOp) -> Result<FieldOp, ParseError> {
        match self {
            FieldOp::Set(_) | FieldOp::Unset => Ok(self),
            FieldOp::Increment(ref amount) => match previous {
                FieldOp::Unset => Ok(FieldOp::Set(amount.clone())),
                FieldOp::Set(current) if current.is_number() => current
                    .add_number(amount)
                    .map(FieldOp::Set)
                    .ok_or_else(|| incompatible(previous, &self)),
                FieldOp::Increment(prior) => prior
                    .add_number(amount)
                    .map(FieldOp::Increment)
                    .ok_or_else(|| incompatible(previous, &self)),
                _ => Err(incompatible(previous, &self)),
            },
            FieldOp::Add(ref items) => match previous {
                FieldOp::Unset => Ok(FieldOp::Set(ParseValue::Array(items.clone()))),
                FieldOp::Set(ParseValue::Array(current)) => {
                    let mut merged = current.clone();
                    merged.extend(items.iter().cloned());
                    Ok(FieldOp::Set(ParseValue::Array(merged)))
                }
                FieldOp::Add(prior) => {
                    let mut merged = prior.clone();
                    merged.extend(items.iter().cloned());
                    Ok(FieldOp::Add(merged))
                }
                _ => Err(incompatible(previous, &self)),
            },
            FieldOp::AddUnique(ref items) => match previous {
                FieldOp::Unset => {
                    let mut merged = Vec::new();
                    push_unique(&mut merged, items);
                    Ok(FieldOp::Set(ParseValue::Array(merged)))
                }
                FieldOp::Set(ParseValue::Array(current)) => {
                    let mut merged = current.clone();
                    push_unique(&mut merged, items);
                    Ok(FieldOp::Set(ParseValue::Array(merged)))
                }
                FieldOp::AddUnique(prior) => {
                    let mut merged = prior.clone();
                    push_unique(&mut merged, items);
                    Ok(FieldOp::AddUnique(merged))
                }
                _ => Err(incompatible(previous, &self)),
            },
            FieldOp::Remove(ref items) => match previous {
                FieldOp::Unset => Ok(FieldOp::Unset),
                FieldOp::Set(ParseValue::Array(current)) => Ok(FieldOp::Set(ParseValue::Array(
                    current.iter().filter(|v| !items.contains(v)).cloned().collect(),
                ))),
                FieldOp::Remove(prior) => {
                    let mut merged = prior.clone();
                    push_unique(&mut merged, items);
                    Ok(FieldOp::Remove(merged))
                }
                _ => Err(incompatible(previous, &self)),
            },
            FieldOp::Relation {
                ref target_class,
                ref added,
                ref removed,
            } => match previous {
                FieldOp::Relation {
                    target_class: prior_class,
                    added: prior_added,
                    removed: prior_removed,
                } => {
                    if prior_class != target_class {
                        return Err(ParseError::InvalidInput(format!(
                            "relation holds {} objects, not {}",
                            prior_class, target_class
                        )));
                    }
                    let mut next_added: Vec<Pointer> = prior_added
                        .iter()
                        .filter(|p| !removed.contains(p))
                        .cloned()
                        .collect();
                    let mut next_removed: Vec<Pointer> = prior_removed
                        .iter()
                        .filter(|p| !added.contains(p))
                        .cloned()
                        .collect();
                    for p in added {
                        if !next_added.contains(p) {
                            next_added.push(p.clone());
                        }
                    }
                    for p in removed {
                        if !next_removed.contains(p) {
                            next_removed.push(p.clone());
                        }
                    }
                    Ok(FieldOp::Relation {
                        target_class: target_class.clone(),
                        added: next_added,
                        removed: next_removed,
                    })
                }
                _ => Err(incompatible(previous, &self)),
            },
        }
    }

    /// Estimated attribute value after this op is applied to `current`.
    /// `None` means the attribute is absent.
    pub fn apply_to(&self, current: Option<&ParseValue>) -> Option<ParseValue> {
        match self {
            FieldOp::Set(v) => Some(v.clone()),
            FieldOp::Unset => None,
            FieldOp::Increment(amount) => match current {
                Some(v) if v.is_number() => v.add_number(amount),
                _ => Some(amount.clone()),
            },
            FieldOp::Add(items) => {
                let mut base = current
                    .and_then(ParseValue::as_array)
                    .map(<[ParseValue]>::to_vec)
                    .unwrap_or_default();
                base.extend(items.iter().cloned());
                Some(ParseValue::Array(base))
            }
            FieldOp::AddUnique(items) => {
                let mut base = current
                    .and_then(ParseValue::as_array)
                    .map(<[ParseValue]>::to_vec)
                    .unwrap_or_default();
                push_unique(&mut base, items);
                Some(ParseValue::Array(base))
            }
            FieldOp::Remove(items) => current.map(|v| match v.as_array() {
                Some(existing) => ParseValue::Array(
                    existing.iter().filter(|e| !items.contains(e)).cloned().collect(),
                ),
                None => v.clone(),
            }),
            FieldOp::Relation { target_class, .. } => Some(
                current
                    .cloned()
                    .unwrap_or_else(|| ParseValue::Relation(ParseRelation::new(target_class.clone()))),
            ),
        }
    }

    /// Wire encoding of the op for a save request body.
    pub fn encode(&self) -> Value {
        fn objects(items: &[ParseValue]) -> Vec<Value> {
            items.iter().map(ParseValue::to_json).collect()
        }
        fn pointers(items: &[Pointer]) -> Vec<Value> {
            items.iter().map(Pointer::to_json).collect()
        }

        match self {
            FieldOp::Set(v) => v.to_json(),
            FieldOp::Unset => json!({ "__op": "Delete" }),
            FieldOp::Increment(amount) => json!({ "__op": "Increment", "amount": amount.to_json() }),
            FieldOp::Add(items) => json!({ "__op": "Add", "objects": objects(items) }),
            FieldOp::AddUnique(items) => json!({ "__op": "AddUnique", "objects": objects(items) }),
            FieldOp::Remove(items) => json!({ "__op": "Remove", "objects": objects(items) }),
            FieldOp::Relation { added, removed, .. } => {
                let add = json!({ "__op": "AddRelation", "objects": pointers(added) });
                let remove = json!({ "__op": "RemoveRelation", "objects": pointers(removed) });
                match (added.is_empty(), removed.is_empty()) {
                    (false, false) => json!({ "__op": "Batch", "ops": [add, remove] }),
                    (true, false) => remove,
                    _ => add,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<ParseValue> {
        values.iter().map(|v| ParseValue::Integer(*v)).collect()
    }

    #[test]
    fn increments_sum() {
        let merged = FieldOp::Increment(2.into())
            .merge_onto(&FieldOp::Increment(1.into()))
            .unwrap();
        assert_eq!(merged, FieldOp::Increment(ParseValue::Integer(3)));
    }

    #[test]
    fn increment_after_unset_becomes_set() {
        let merged = FieldOp::Increment(5.into()).merge_onto(&FieldOp::Unset).unwrap();
        assert_eq!(merged, FieldOp::Set(ParseValue::Integer(5)));
    }

    #[test]
    fn add_after_set_array_folds_into_set() {
        let merged = FieldOp::Add(ints(&[3]))
            .merge_onto(&FieldOp::Set(ParseValue::Array(ints(&[1, 2]))))
            .unwrap();
        assert_eq!(merged, FieldOp::Set(ParseValue::Array(ints(&[1, 2, 3]))));
    }

    #[test]
    fn add_unique_skips_duplicates() {
        let merged = FieldOp::AddUnique(ints(&[2, 3]))
            .merge_onto(&FieldOp::AddUnique(ints(&[1, 2])))
            .unwrap();
        assert_eq!(merged, FieldOp::AddUnique(ints(&[1, 2, 3])));
    }

    #[test]
    fn incompatible_merge_is_rejected() {
        let err = FieldOp::Increment(1.into())
            .merge_onto(&FieldOp::Add(ints(&[1])))
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidInput(_)));
    }

    #[test]
    fn relation_add_then_remove_cancels() {
        let p = Pointer::new("Player", "p1");
        let first = FieldOp::Relation {
            target_class: "Player".into(),
            added: vec![p.clone()],
            removed: vec![],
        };
        let merged = FieldOp::Relation {
            target_class: "Player".into(),
            added: vec![],
            removed: vec![p.clone()],
        }
        .merge_onto(&first)
        .unwrap();
        assert_eq!(
            merged,
            FieldOp::Relation {
                target_class: "Player".into(),
                added: vec![],
                removed: vec![p],
            }
        );
    }

    #[test]
    fn apply_estimates_value() {
        let current = ParseValue::Array(ints(&[1, 2, 3]));
        assert_eq!(
            FieldOp::Remove(ints(&[2])).apply_to(Some(&current)),
            Some(ParseValue::Array(ints(&[1, 3])))
        );
        assert_eq!(
            FieldOp::Increment(4.into()).apply_to(Some(&ParseValue::Integer(1))),
            Some(ParseValue::Integer(5))
        );
        assert_eq!(FieldOp::Unset.apply_to(Some(&current)), None);
    }

    #[test]
    fn encodes_ops() {
        assert_eq!(FieldOp::Unset.encode(), json!({"__op": "Delete"}));
        assert_eq!(
            FieldOp::Increment(3.into()).encode(),
            json!({"__op": "Increment", "amount": 3})
        );
        let batch = FieldOp::Relation {
            target_class: "Player".into(),
            added: vec![Pointer::new("Player", "a")],
            removed: vec![Pointer::new("Player", "b")],
        }
        .encode();
        assert_eq!(batch["__op"], "Batch");
        assert_eq!(batch["ops"][1]["__op"], "RemoveRelation");
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of a patch operation. `move`/`copy`/`test` are not produced by
/// [`diff`] and not accepted by [`apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Replace,
    Add,
    Remove,
}

/// A single JSON-Patch operation addressing one location in a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: OpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// An ordered list of patch operations.
pub type Patch = Vec<PatchOp>;

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Compute a patch that transforms `before` into `after`.
///
/// Objects are diffed key by key; everything else (arrays included) that
/// compares unequal is emitted as a whole-value `replace` at its path.
pub fn diff(before: &Value, after: &Value) -> Patch {
    let mut patch = Vec::new();
    diff_value("", before, after, &mut patch);
    patch
}

fn diff_value(path: &str, before: &Value, after: &Value, patch: &mut Patch) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(before_map), Value::Object(after_map)) => {
            for (key, val_before) in before_map {
                let child_path = format!("{path}/{}", escape_token(key));
                match after_map.get(key) {
                    Some(val_after) => diff_value(&child_path, val_before, val_after, patch),
                    None => patch.push(PatchOp {
                        op: OpKind::Remove,
                        path: child_path,
                        value: None,
                    }),
                }
            }
            for (key, val_after) in after_map {
                if !before_map.contains_key(key) {
                    patch.push(PatchOp {
                        op: OpKind::Add,
                        path: format!("{path}/{}", escape_token(key)),
                        value: Some(val_after.clone()),
                    });
                }
            }
        }
        _ => patch.push(PatchOp {
            op: OpKind::Replace,
            path: path.to_string(),
            value: Some(after.clone()),
        }),
    }
}

/// Apply a patch to a document, returning the patched document.
pub fn apply(doc: Value, patch: &[PatchOp]) -> Result<Value, String> {
    let mut doc = doc;
    for op in patch {
        apply_op(&mut doc, op)
            .map_err(|err| format!("error applying operation at '{}': {err}", op.path))?;
    }
    Ok(doc)
}

fn apply_op(doc: &mut Value, op: &PatchOp) -> Result<(), String> {
    let tokens: Vec<String> = op
        .path
        .split('/')
        .skip(1)
        .map(unescape_token)
        .collect();
    let Some((last, parents)) = tokens.split_last() else {
        return Err("empty path".to_string());
    };

    let mut current = &mut *doc;
    for token in parents {
        current = match current {
            Value::Object(map) => map
                .get_mut(token)
                .ok_or_else(|| format!("path not found: {token}"))?,
            Value::Array(items) => {
                let index: usize = token
                    .parse()
                    .map_err(|_| format!("invalid array index: {token}"))?;
                let len = items.len();
                items
                    .get_mut(index)
                    .ok_or_else(|| format!("index {index} out of bounds for array of {len}"))?
            }
            _ => return Err(format!("invalid path segment: {token}")),
        };
    }

    let Value::Object(map) = current else {
        return Err("container is not an object".to_string());
    };
    match op.op {
        OpKind::Replace | OpKind::Add => {
            map.insert(last.clone(), op.value.clone().unwrap_or(Value::Null));
        }
        OpKind::Remove => {
            map.remove(last);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{apply, diff, OpKind};
    use serde_json::json;

    #[test]
    fn equal_documents_produce_empty_patch() {
        let doc = json!({"a": 1, "b": [1, 2, 3]});
        assert!(diff(&doc, &doc).is_empty());
    }

    #[test]
    fn scalar_change_is_a_replace() {
        let before = json!({"a": 1});
        let after = json!({"a": 2});
        let patch = diff(&before, &after);
        assert_eq!(patch.len(), 1);
        assert_eq!(patch[0].op, OpKind::Replace);
        assert_eq!(patch[0].path, "/a");
        assert_eq!(patch[0].value, Some(json!(2)));
    }

    #[test]
    fn added_and_removed_keys() {
        let before = json!({"keep": true, "gone": 1});
        let after = json!({"keep": true, "new": 2});
        let patch = diff(&before, &after);
        assert_eq!(patch.len(), 2);
        assert!(patch
            .iter()
            .any(|op| op.op == OpKind::Remove && op.path == "/gone"));
        assert!(patch
            .iter()
            .any(|op| op.op == OpKind::Add && op.path == "/new" && op.value == Some(json!(2))));
    }

    #[test]
    fn nested_objects_recurse() {
        let before = json!({"outer": {"inner": {"x": 1}}});
        let after = json!({"outer": {"inner": {"x": 5}}});
        let patch = diff(&before, &after);
        assert_eq!(patch.len(), 1);
        assert_eq!(patch[0].path, "/outer/inner/x");
    }

    #[test]
    fn arrays_replace_wholesale() {
        let before = json!({"items": [1, 2, 3]});
        let after = json!({"items": [1, 9, 3]});
        let patch = diff(&before, &after);
        assert_eq!(patch.len(), 1);
        assert_eq!(patch[0].op, OpKind::Replace);
        assert_eq!(patch[0].path, "/items");
        assert_eq!(patch[0].value, Some(json!([1, 9, 3])));
    }

    #[test]
    fn apply_diff_round_trips() {
        let before = json!({
            "stack": [1, 2],
            "variables": {"x": 1, "dead": "yes"},
            "nested": {"deep": {"flag": false}}
        });
        let after = json!({
            "stack": [],
            "variables": {"x": 2, "born": null},
            "nested": {"deep": {"flag": true}}
        });
        let patch = diff(&before, &after);
        assert_eq!(apply(before, &patch).expect("apply"), after);
    }

    #[test]
    fn reverse_diff_undoes_a_change() {
        let before = json!({"n": 1, "log": ["start"]});
        let after = json!({"n": 2, "log": ["start", "stepped"]});
        let undo = diff(&after, &before);
        assert_eq!(apply(after, &undo).expect("apply"), before);
    }

    #[test]
    fn keys_with_separators_are_escaped() {
        let before = json!({"a/b": 1, "c~d": 2});
        let after = json!({"a/b": 9, "c~d": 2});
        let patch = diff(&before, &after);
        assert_eq!(patch[0].path, "/a~1b");
        assert_eq!(apply(before, &patch).expect("apply"), after);
    }

    #[test]
    fn apply_navigates_arrays_on_interior_segments() {
        let doc = json!({"rows": [{"x": 1}, {"x": 2}]});
        let patched = apply(
            doc,
            &[super::PatchOp {
                op: OpKind::Replace,
                path: "/rows/1/x".to_string(),
                value: Some(json!(7)),
            }],
        )
        .expect("apply");
        assert_eq!(patched, json!({"rows": [{"x": 1}, {"x": 7}]}));
    }

    #[test]
    fn apply_rejects_missing_parents_and_empty_paths() {
        let doc = json!({"a": 1});
        let missing = super::PatchOp {
            op: OpKind::Replace,
            path: "/no/such/place".to_string(),
            value: Some(json!(0)),
        };
        assert!(apply(doc.clone(), &[missing]).is_err());

        let empty = super::PatchOp {
            op: OpKind::Replace,
            path: String::new(),
            value: Some(json!(0)),
        };
        assert!(apply(doc, &[empty]).is_err());
    }

    #[test]
    fn patch_serialization_shape() {
        let patch = diff(&json!({"a": 1}), &json!({"b": 2}));
        let text = serde_json::to_string(&patch).expect("serialize");
        let parsed: super::Patch = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed, patch);
        assert!(text.contains("\"op\":\"remove\""));
        assert!(text.contains("\"op\":\"add\""));
    }
}

//! Configuration tree: dotted-path access over a JSON object, plus the
//! original implementation's merge algebra (`!key` delete, `+key` append,
//! `key+` prepend, `-key` diff) and `%(key)s`-style reference resolution.
//!
//! Deliberately *not* a generic map with string-prefixed keys baked into the
//! type system: `Config` always holds a plain `serde_json::Value` object, and
//! the prefix tags are interpreted only inside [`Config::merge`].

use serde_json::{Map, Value};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default)]
pub struct Config {
    root: Value,
}

impl Config {
    pub fn new() -> Self {
        Config {
            root: Value::Object(Map::new()),
        }
    }

    pub fn from_value(root: Value) -> Self {
        Config { root }
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn load(json: &str) -> Result<Self, ConfigError> {
        Ok(Config {
            root: serde_json::from_str(json)?,
        })
    }

    pub fn dump(&self, pretty: bool) -> Result<String, ConfigError> {
        if pretty {
            Ok(serde_json::to_string_pretty(&self.root)?)
        } else {
            Ok(serde_json::to_string(&self.root)?)
        }
    }

    /// Gets a dotted-key path, e.g. `"listen.ssl.cert"`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut cur = &self.root;
        for part in path.split('.') {
            cur = cur.as_object()?.get(part)?;
        }
        Some(cur)
    }

    /// Sets a dotted-key path, creating intermediate objects as needed.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), ConfigError> {
        let parts: Vec<&str> = path.split('.').collect();
        let mut cur = &mut self.root;
        for part in &parts[..parts.len() - 1] {
            if !cur.is_object() {
                return Err(ConfigError::NotAnObject(path.to_string()));
            }
            let obj = cur.as_object_mut().unwrap();
            if !matches!(obj.get(*part), Some(Value::Object(_))) {
                obj.insert(part.to_string(), Value::Object(Map::new()));
            }
            cur = obj.get_mut(*part).unwrap();
        }
        let last = parts[parts.len() - 1];
        cur.as_object_mut()
            .ok_or_else(|| ConfigError::NotAnObject(path.to_string()))?
            .insert(last.to_string(), value);
        Ok(())
    }

    /// Removes a dotted-key path. A no-op if the path does not exist.
    pub fn remove(&mut self, path: &str) {
        let parts: Vec<&str> = path.split('.').collect();
        let mut cur = &mut self.root;
        for part in &parts[..parts.len() - 1] {
            match cur.as_object_mut().and_then(|o| o.get_mut(*part)) {
                Some(next) => cur = next,
                None => return,
            }
        }
        if let Some(obj) = cur.as_object_mut() {
            obj.remove(parts[parts.len() - 1]);
        }
    }

    /// Merges `delta` into this config's tree using [`merge`], then resolves
    /// `%(key)s` references to a fixpoint. Returns the count of references
    /// that remained unresolved.
    pub fn update(&mut self, delta: &Value) -> usize {
        self.root = merge(&self.root, delta);
        self.resolve()
    }

    /// Recursively substitutes `%(key)s` references against this tree's own
    /// leaves until a pass makes no further substitutions. Returns the
    /// number of references that remained unresolved on the final pass.
    pub fn resolve(&mut self) -> usize {
        let mut last_unresolved = usize::MAX;
        loop {
            let before = self.root.clone();
            let mut unresolved = 0usize;
            let snapshot = self.root.clone();
            resolve_value(&mut self.root, &snapshot, &mut unresolved);
            if self.root == before || unresolved == last_unresolved {
                return unresolved;
            }
            last_unresolved = unresolved;
        }
    }
}

/// Merges `b` into `a` and returns the result; `a`/`b` must be JSON objects
/// (or this degrades to "b replaces a" for non-objects). Mirrors the original
/// `Config.merge`: keys are processed in sorted order so `!key` deletions are
/// deterministic relative to sibling operations.
pub fn merge(a: &Value, b: &Value) -> Value {
    let (Value::Object(a_obj), Value::Object(b_obj)) = (a, b) else {
        return b.clone();
    };
    let mut out = a_obj.clone();
    let mut keys: Vec<&String> = b_obj.keys().collect();
    keys.sort();
    for bkey in keys {
        let bval = &b_obj[bkey];
        if let Some(key) = bkey.strip_prefix('!') {
            out.remove(key);
            continue;
        }
        if let Some(key) = bkey.strip_prefix('+') {
            append_list(&mut out, key, bval);
            continue;
        }
        if let Some(key) = bkey.strip_suffix('+') {
            prepend_list(&mut out, key, bval);
            continue;
        }
        if let Some(key) = bkey.strip_prefix('-') {
            diff_list(&mut out, key, bval);
            continue;
        }
        match (out.get(bkey), bval) {
            (Some(Value::Object(_)), Value::Object(_)) => {
                let merged = merge(out.get(bkey).unwrap(), bval);
                out.insert(bkey.clone(), merged);
            }
            _ => {
                out.insert(bkey.clone(), bval.clone());
            }
        }
    }
    Value::Object(out)
}

fn append_list(out: &mut Map<String, Value>, key: &str, incoming: &Value) {
    if let (Some(Value::Array(existing)), Value::Array(add)) = (out.get(key), incoming) {
        let mut merged = existing.clone();
        merged.extend(add.iter().cloned());
        out.insert(key.to_string(), Value::Array(merged));
    } else if out.contains_key(key) {
        // existing value present but not a list: leave as-is, matching the
        // original's silent no-op when types do not line up.
    } else {
        out.insert(key.to_string(), incoming.clone());
    }
}

fn prepend_list(out: &mut Map<String, Value>, key: &str, incoming: &Value) {
    if let (Some(Value::Array(existing)), Value::Array(add)) = (out.get(key), incoming) {
        let mut merged = add.clone();
        merged.extend(existing.iter().cloned());
        out.insert(key.to_string(), Value::Array(merged));
    } else if !out.contains_key(key) {
        out.insert(key.to_string(), incoming.clone());
    }
}

fn diff_list(out: &mut Map<String, Value>, key: &str, remove: &Value) {
    if let (Some(Value::Array(existing)), Value::Array(remove)) = (out.get(key), remove) {
        let filtered: Vec<Value> = existing
            .iter()
            .filter(|v| !remove.contains(v))
            .cloned()
            .collect();
        out.insert(key.to_string(), Value::Array(filtered));
    }
    // if types don't match, diff is a no-op: subtracting values never replaces.
}

fn resolve_value(v: &mut Value, root: &Value, unresolved: &mut usize) {
    match v {
        Value::Object(map) => {
            for val in map.values_mut() {
                resolve_value(val, root, unresolved);
            }
        }
        Value::Array(arr) => {
            for val in arr.iter_mut() {
                resolve_value(val, root, unresolved);
            }
        }
        Value::String(s) => {
            *s = resolve_string(s, root, unresolved);
        }
        _ => {}
    }
}

/// Substitutes every `%(dotted.key)s` occurrence in `s` with the string form
/// of that key's value in `root`. References to a missing key are left in
/// place and counted as unresolved.
fn resolve_string(s: &str, root: &Value, unresolved: &mut usize) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("%(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(close) = after.find(")s") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let key = &after[..close];
        let lookup = Config::from_value(root.clone()).get(key).cloned();
        match lookup {
            Some(value) => out.push_str(&value_as_string(&value)),
            None => {
                *unresolved += 1;
                out.push_str(&rest[start..start + 2 + close + 2]);
            }
        }
        rest = &after[close + 2..];
    }
    out.push_str(rest);
    out
}

fn value_as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dotted_get_set() {
        let mut cfg = Config::new();
        cfg.set("listen.address", json!("0.0.0.0")).unwrap();
        cfg.set("listen.port", json!(13700)).unwrap();
        assert_eq!(cfg.get("listen.address"), Some(&json!("0.0.0.0")));
        assert_eq!(cfg.get("listen.port"), Some(&json!(13700)));
    }

    #[test]
    fn merge_delete_and_replace() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"!a": true, "b": 3});
        let merged = merge(&a, &b);
        assert_eq!(merged, json!({"b": 3}));
    }

    #[test]
    fn merge_list_append_prepend_diff() {
        let a = json!({"list": [1, 2, 3]});
        assert_eq!(
            merge(&a, &json!({"+list": [4, 5]})),
            json!({"list": [1, 2, 3, 4, 5]})
        );
        assert_eq!(
            merge(&a, &json!({"list+": [0]})),
            json!({"list": [0, 1, 2, 3]})
        );
        assert_eq!(
            merge(&a, &json!({"-list": [2]})),
            json!({"list": [1, 3]})
        );
    }

    #[test]
    fn merge_recurses_into_nested_objects() {
        let a = json!({"pool": {"slots": 1, "hold": false}});
        let b = json!({"pool": {"slots": 4}});
        assert_eq!(
            merge(&a, &b),
            json!({"pool": {"slots": 4, "hold": false}})
        );
    }

    #[test]
    fn resolve_substitutes_references_to_fixpoint() {
        let mut cfg = Config::from_value(json!({
            "a": "foo",
            "b": "%(a)sbar",
            "c": "%(b)sbaz"
        }));
        let unresolved = cfg.resolve();
        assert_eq!(unresolved, 0);
        assert_eq!(cfg.get("c"), Some(&json!("foobarbaz")));
    }

    #[test]
    fn resolve_counts_missing_references() {
        let mut cfg = Config::from_value(json!({"a": "%(missing)s"}));
        let unresolved = cfg.resolve();
        assert_eq!(unresolved, 1);
    }
}

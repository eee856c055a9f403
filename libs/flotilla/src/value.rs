//! Typed accessors over the heterogeneous `serde_json::Value` config bag.

use serde_json::Value;

/// Boundary accessors with defaults, per the coercion rules the sync-config
/// store also follows: int accepts a number or a numeric string, bool
/// accepts booleans only, string accepts strings only.
pub trait ValueExt {
    fn str_of(&self, key: &str) -> Option<&str>;
    fn i64_of(&self, key: &str) -> Option<i64>;
    fn f64_of(&self, key: &str) -> Option<f64>;
    fn bool_of(&self, key: &str) -> Option<bool>;

    fn str_or(&self, key: &str, default: &str) -> String {
        self.str_of(key).map_or_else(|| default.to_string(), str::to_string)
    }
    fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.i64_of(key).unwrap_or(default)
    }
    fn bool_or(&self, key: &str, default: bool) -> bool {
        self.bool_of(key).unwrap_or(default)
    }
}

impl ValueExt for Value {
    fn str_of(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn i64_of(&self, key: &str) -> Option<i64> {
        coerce_i64(self.get(key)?)
    }

    fn f64_of(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn bool_of(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }
}

/// Number-or-numeric-string coercion used by the typed getters.
pub fn coerce_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Remove and return the `depends-on` list from a service config, accepting
/// either `["a", "b"]` or a heterogeneous list containing strings.
pub fn take_depends_on(config: &mut Value) -> Vec<String> {
    let Some(map) = config.as_object_mut() else {
        return Vec::new();
    };
    let Some(raw) = map.remove("depends-on") else {
        return Vec::new();
    };
    match raw {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        Value::String(s) => vec![s],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn typed_accessors_coerce_per_rules() {
        let v = json!({"s": "text", "i": 3, "istr": "42", "b": true, "f": 1.5});
        assert_eq!(v.str_of("s"), Some("text"));
        assert_eq!(v.str_of("i"), None);
        assert_eq!(v.i64_of("i"), Some(3));
        assert_eq!(v.i64_of("istr"), Some(42));
        assert_eq!(v.i64_of("s"), None);
        assert_eq!(v.bool_of("b"), Some(true));
        assert_eq!(v.bool_of("istr"), None);
        assert_eq!(v.f64_of("f"), Some(1.5));
        assert_eq!(v.str_or("missing", "dflt"), "dflt");
        assert_eq!(v.i64_or("missing", 9), 9);
    }

    #[test]
    fn depends_on_is_stripped_from_config() {
        let mut cfg = json!({"depends-on": ["a", "b"], "ttl": 60});
        let deps = take_depends_on(&mut cfg);
        assert_eq!(deps, vec!["a", "b"]);
        assert_eq!(cfg, json!({"ttl": 60}));

        let mut untouched = json!({"ttl": 60});
        assert!(take_depends_on(&mut untouched).is_empty());

        let mut mixed = json!({"depends-on": ["a", 1, null, "b"]});
        assert_eq!(take_depends_on(&mut mixed), vec!["a", "b"]);
    }
}

use crate::error::{ConfigError, ConfigResult};
use ahash::AHashMap;
use anyhow::Context;
use parking_lot::RwLock;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// A single typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Uint(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Conversion from a stored [`Value`] into a concrete property type.
/// Lossless numeric coercions are accepted so that file-loaded integers
/// satisfy unsigned or floating getters.
pub trait Property: Sized {
    const KIND: &'static str;

    fn from_value(v: &Value) -> Option<Self>;
}

impl Property for String {
    const KIND: &'static str = "string";

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl Property for i64 {
    const KIND: &'static str = "int";

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Int(i) => Some(*i),
            Value::Uint(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }
}

impl Property for u64 {
    const KIND: &'static str = "uint";

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Uint(u) => Some(*u),
            Value::Int(i) => u64::try_from(*i).ok(),
            _ => None,
        }
    }
}

impl Property for u32 {
    const KIND: &'static str = "uint";

    fn from_value(v: &Value) -> Option<Self> {
        u64::from_value(v).and_then(|u| u32::try_from(u).ok())
    }
}

impl Property for f64 {
    const KIND: &'static str = "float";

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Float(x) => Some(*x),
            Value::Int(i) => Some(*i as f64),
            Value::Uint(u) => Some(*u as f64),
            _ => None,
        }
    }
}

impl Property for bool {
    const KIND: &'static str = "bool";

    fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Shared typed key/value store driving device construction.
///
/// Channel properties follow the `chans.<name>.<index>.<field>` key scheme.
/// The store is written back to by the lifecycle driver once bound
/// addresses are known, so a handle kept by the caller observes resolved
/// endpoints.
#[derive(Clone, Default)]
pub struct Properties {
    inner: Arc<RwLock<AHashMap<String, Value>>>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from literal pairs; mostly a test and example helper.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let props = Self::new();
        for (k, v) in pairs {
            props.set(k, v);
        }
        props
    }

    /// Load properties from a JSON/TOML/YAML file, flattening nested tables
    /// and arrays into dotted keys (`chans.data.0.address`).
    pub fn from_file(path: impl AsRef<str>) -> anyhow::Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(PathBuf::from(path.as_ref())))
            .build()
            .with_context(|| format!("failed to read properties from {}", path.as_ref()))?;

        let root: serde_json::Value = cfg
            .try_deserialize()
            .with_context(|| format!("failed to parse properties from {}", path.as_ref()))?;

        let props = Self::new();
        flatten_into(&props, String::new(), &root);
        Ok(props)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.write().insert(key.into(), value.into());
    }

    /// Typed getter; `MissingKey` if absent, `TypeMismatch` if present with
    /// an incompatible type.
    pub fn get<T: Property>(&self, key: &str) -> ConfigResult<T> {
        let map = self.inner.read();
        let value = map
            .get(key)
            .ok_or_else(|| ConfigError::MissingKey(key.to_string()))?;

        T::from_value(value).ok_or_else(|| ConfigError::TypeMismatch {
            key: key.to_string(),
            expected: T::KIND,
        })
    }

    /// Typed getter with a default for missing keys. A present key of the
    /// wrong type is still an error, never silently defaulted.
    pub fn get_or<T: Property>(&self, key: &str, default: T) -> ConfigResult<T> {
        match self.get(key) {
            Ok(v) => Ok(v),
            Err(ConfigError::MissingKey(_)) => Ok(default),
            Err(e) => Err(e),
        }
    }

    /// All properties whose key starts with `prefix`.
    pub fn starting_with(&self, prefix: &str) -> Vec<(String, Value)> {
        self.inner
            .read()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Channel name -> sub-channel count, derived from `chans.*` keys.
    /// Indices per name must be contiguous from zero.
    pub fn channel_info(&self) -> ConfigResult<AHashMap<String, usize>> {
        let mut indices: AHashMap<String, Vec<usize>> = AHashMap::new();

        for (key, _) in self.starting_with("chans.") {
            let rest = &key["chans.".len()..];
            let mut parts = rest.splitn(3, '.');
            let (Some(name), Some(index), Some(_field)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let Ok(index) = index.parse::<usize>() else {
                return Err(ConfigError::BadChannelIndex(name.to_string()));
            };

            let list = indices.entry(name.to_string()).or_default();
            if !list.contains(&index) {
                list.push(index);
            }
        }

        let mut info = AHashMap::with_capacity(indices.len());
        for (name, mut list) in indices {
            list.sort_unstable();
            if list.iter().enumerate().any(|(want, got)| want != *got) {
                return Err(ConfigError::BadChannelIndex(name));
            }
            info.insert(name, list.len());
        }

        Ok(info)
    }
}

impl fmt::Debug for Properties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Properties")
            .field("len", &self.inner.read().len())
            .finish()
    }
}

fn flatten_into(props: &Properties, prefix: String, value: &serde_json::Value) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };

    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                flatten_into(props, join(k), v);
            }
        }
        serde_json::Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(props, join(&i.to_string()), v);
            }
        }
        serde_json::Value::String(s) => props.set(prefix, s.as_str()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                props.set(prefix, i);
            } else if let Some(u) = n.as_u64() {
                props.set(prefix, u);
            } else if let Some(x) = n.as_f64() {
                props.set(prefix, x);
            }
        }
        serde_json::Value::Bool(b) => props.set(prefix, *b),
        serde_json::Value::Null => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_get_and_defaults() {
        let props = Properties::from_pairs([("id", Value::from("sampler"))]);
        props.set("rate", 25.0);
        props.set("init-timeout", 120i64);

        assert_eq!(props.get::<String>("id").unwrap(), "sampler");
        assert_eq!(props.get::<f64>("rate").unwrap(), 25.0);
        assert_eq!(props.get::<i64>("init-timeout").unwrap(), 120);
        assert_eq!(props.get_or::<String>("missing", "x".into()).unwrap(), "x");

        match props.get::<i64>("id") {
            Err(ConfigError::TypeMismatch { key, .. }) => assert_eq!(key, "id"),
            other => panic!("expected type mismatch, got {other:?}"),
        }
        match props.get::<String>("absent") {
            Err(ConfigError::MissingKey(key)) => assert_eq!(key, "absent"),
            other => panic!("expected missing key, got {other:?}"),
        }
    }

    #[test]
    fn numeric_coercions_are_lossless() {
        let props = Properties::from_pairs([("n", Value::Int(7))]);
        assert_eq!(props.get::<u64>("n").unwrap(), 7);
        assert_eq!(props.get::<f64>("n").unwrap(), 7.0);

        props.set("neg", -1i64);
        assert!(props.get::<u64>("neg").is_err());
    }

    #[test]
    fn prefix_scan_returns_matching_entries() {
        let props = Properties::from_pairs([
            ("chans.data.0.address", Value::from("tcp://*:5555")),
            ("chans.data.0.method", Value::from("bind")),
            ("chans.ctl.0.address", Value::from("tcp://*:5556")),
        ]);

        let scanned = props.starting_with("chans.data.0.");
        assert_eq!(scanned.len(), 2);
        assert!(scanned.iter().all(|(k, _)| k.starts_with("chans.data.0.")));
    }

    #[test]
    fn channel_info_counts_subchannels() {
        let props = Properties::from_pairs([
            ("chans.data.0.address", Value::from("a")),
            ("chans.data.1.address", Value::from("b")),
            ("chans.data.1.method", Value::from("connect")),
            ("chans.ctl.0.address", Value::from("c")),
        ]);

        let info = props.channel_info().unwrap();
        assert_eq!(info.get("data"), Some(&2));
        assert_eq!(info.get("ctl"), Some(&1));
    }

    #[test]
    fn channel_info_rejects_gaps() {
        let props = Properties::from_pairs([
            ("chans.data.0.address", Value::from("a")),
            ("chans.data.2.address", Value::from("b")),
        ]);

        assert!(matches!(
            props.channel_info(),
            Err(ConfigError::BadChannelIndex(name)) if name == "data"
        ));
    }
}

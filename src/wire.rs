//! Lenient decoding helpers shared by the REST and channel models.
//!
//! The server omits optional fields and sometimes sends `null` where a value
//! is expected; both decode to the type's default instead of failing.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Deserialize `null` as `T::default()`. Pair with `#[serde(default)]` so a
/// missing field also falls back.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Deserialize a `{label: number}` map, keeping only numeric entries.
///
/// `null` or non-numeric scores are skipped, and anything other than an
/// object reads as an empty map.
pub(crate) fn sparse_scores<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    let Some(Value::Object(entries)) = raw else {
        return Ok(BTreeMap::new());
    };
    Ok(entries
        .into_iter()
        .filter_map(|(label, score)| score.as_f64().map(|score| (label, score)))
        .collect())
}

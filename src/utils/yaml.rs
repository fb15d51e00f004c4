/// Serde helpers for hand-edited YAML files
use serde::{Deserialize, Deserializer};

/// Read an explicit `null` the same as a missing key.
///
/// kubectl writes `clusters: null` in freshly emptied kubeconfigs and Lima
/// templates leave `cpus: null` or `env: null` for "use the default".
pub fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

//! Small numeric and serde helpers shared by the calibration modules.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;

use serde::de::{self, DeserializeOwned, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::Channel;
use crate::atomic::write_atomic;
use crate::error::{CalibrationError, Result};

/// Median of `values`; the mean of the two middle values for even lengths.
/// Returns `None` for an empty slice.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        Some((v[mid - 1] + v[mid]) / 2.0)
    } else {
        Some(v[mid])
    }
}

/// Map key that accepts either an integer or a numeric string.
struct ChannelKey(Channel);

impl<'de> Deserialize<'de> for ChannelKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        struct KeyVisitor;

        impl Visitor<'_> for KeyVisitor {
            type Value = ChannelKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a channel number or numeric string")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<ChannelKey, E> {
                usize::try_from(v)
                    .map(ChannelKey)
                    .map_err(|_| E::custom(format!("channel {v} out of range")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<ChannelKey, E> {
                usize::try_from(v)
                    .map(ChannelKey)
                    .map_err(|_| E::custom(format!("channel must be >= 0, got {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<ChannelKey, E> {
                v.trim()
                    .parse::<Channel>()
                    .map(ChannelKey)
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
            }
        }

        d.deserialize_any(KeyVisitor)
    }
}

/// Deserialize a channel-keyed map, normalizing `"0"` and `0` to the same key.
pub fn de_channel_map<'de, D, V>(d: D) -> std::result::Result<BTreeMap<Channel, V>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct MapVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for MapVisitor<V> {
        type Value = BTreeMap<Channel, V>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map keyed by channel")
        }

        fn visit_map<A: MapAccess<'de>>(
            self,
            mut access: A,
        ) -> std::result::Result<Self::Value, A::Error> {
            let mut out = BTreeMap::new();
            while let Some((ChannelKey(ch), value)) = access.next_entry::<ChannelKey, V>()? {
                out.insert(ch, value);
            }
            Ok(out)
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(BTreeMap::new())
        }
    }

    d.deserialize_any(MapVisitor(PhantomData))
}

/// Accept either a single number or a list of numbers.
pub fn de_one_or_many<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<f64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(f64),
        Many(Vec<f64>),
    }

    Ok(match OneOrMany::deserialize(d)? {
        OneOrMany::One(v) => vec![v],
        OneOrMany::Many(v) => v,
    })
}

pub(crate) fn to_yaml<T: Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| CalibrationError::storage("serialize", e))
}

pub(crate) fn from_yaml<T: DeserializeOwned>(path: &Path, text: &str) -> Result<T> {
    serde_yaml::from_str(text)
        .map_err(|e| CalibrationError::storage(format_args!("parse {}", path.display()), e))
}

/// Serialize `value` as YAML and write it atomically.
pub(crate) fn save_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = to_yaml(value)?;
    write_atomic(path, text.as_bytes())
        .map_err(|e| CalibrationError::storage(format_args!("write {}", path.display()), e))
}

/// Read and parse a YAML file. `Ok(None)` when the file does not exist.
pub(crate) fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(text) => from_yaml(path, &text).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CalibrationError::storage(
            format_args!("read {}", path.display()),
            e,
        )),
    }
}

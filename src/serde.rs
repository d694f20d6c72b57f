use super::LockFreeMap;

use serde::de::{Deserialize, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserializer;

use std::fmt;
use std::hash::BuildHasher;
use std::marker::PhantomData;

/// Builds a [`LockFreeMap`] with the default number of shards from a serialized map.
pub struct LockFreeMapVisitor<V, H: BuildHasher> {
    #[allow(clippy::type_complexity)]
    marker: PhantomData<fn() -> LockFreeMap<V, H>>,
}

impl<V, H> LockFreeMapVisitor<V, H>
where
    H: BuildHasher,
{
    fn new() -> Self {
        LockFreeMapVisitor {
            marker: PhantomData,
        }
    }
}

impl<'de, V, H> Visitor<'de> for LockFreeMapVisitor<V, H>
where
    V: 'static + Deserialize<'de>,
    H: BuildHasher + Default,
{
    type Value = LockFreeMap<V, H>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a LockFreeMap")
    }

    fn visit_map<M>(self, mut access: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let map = LockFreeMap::default();

        while let Some((key, value)) = access.next_entry::<String, V>()? {
            map.store(&key, value);
        }

        Ok(map)
    }
}

impl<'de, V, H> Deserialize<'de> for LockFreeMap<V, H>
where
    V: 'static + Deserialize<'de>,
    H: BuildHasher + Default,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(LockFreeMapVisitor::<V, H>::new())
    }
}

impl<V, H> Serialize for LockFreeMap<V, H>
where
    V: Serialize,
    H: BuildHasher,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        let mut error = None;
        self.range(|k, v| match map.serialize_entry(k, v) {
            Ok(()) => true,
            Err(e) => {
                error.replace(e);
                false
            }
        });

        if let Some(e) = error {
            return Err(e);
        }

        map.end()
    }
}

//! Component codec registry.
//!
//! Maps a component type name to an explicit encode/decode pair. The registry
//! is assembled once through [`RegistryBuilder`] at startup and is read-only
//! afterwards; it is shared by `Arc` and injected into the orchestrator.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use worldsave_common::EntityId;
use worldsave_kernel::{Component, ComponentValue};

use crate::error::CodecError;

/// Rewrites entity handles in place.
pub type EntityMapper<'a> = dyn FnMut(EntityId) -> EntityId + 'a;

/// Implemented by components holding references to other entities.
///
/// At capture time live handles are rewritten to snapshot-local placeholders;
/// at restore time placeholders are rewritten to the freshly created handles.
pub trait MapEntities {
    fn map_entities(&mut self, map: &mut EntityMapper<'_>);
}

type EncodeFn = Box<
    dyn Fn(&(dyn Any + Send + Sync), &mut EntityMapper<'_>) -> Result<Vec<u8>, CodecError>
        + Send
        + Sync,
>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<ComponentValue, CodecError> + Send + Sync>;
type RemapFn = Box<dyn Fn(&mut (dyn Any + Send + Sync), &mut EntityMapper<'_>) + Send + Sync>;

struct CodecEntry {
    encode: EncodeFn,
    decode: DecodeFn,
    remap: Option<RemapFn>,
}

/// Raw bytes of a component whose type is not registered in this build.
///
/// Restored into the world in place of the real value so that re-saving
/// writes the original bytes back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub type_name: String,
    pub bytes: Vec<u8>,
}

/// Outcome of decoding one component.
pub enum Decoded {
    Value(ComponentValue),
    Tombstone(Tombstone),
}

impl Decoded {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone(_))
    }

    /// Convert into a value that can be handed to a world.
    pub fn into_value(self) -> ComponentValue {
        match self {
            Self::Value(v) => v,
            Self::Tombstone(t) => Box::new(t),
        }
    }
}

impl fmt::Debug for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(_) => f.write_str("Decoded::Value(..)"),
            Self::Tombstone(t) => f.debug_tuple("Decoded::Tombstone").field(&t.type_name).finish(),
        }
    }
}

/// Collects codec registrations before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    entries: BTreeMap<String, CodecEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serde component under its [`Component::TYPE_NAME`], encoded as CBOR.
    pub fn register<T>(&mut self) -> Result<&mut Self, CodecError>
    where
        T: Component + Serialize + DeserializeOwned,
    {
        self.register_fn::<T>(T::TYPE_NAME, cbor_encode::<T>, cbor_decode::<T>)
    }

    /// Register a serde component holding entity references.
    pub fn register_mapped<T>(&mut self) -> Result<&mut Self, CodecError>
    where
        T: Component + Serialize + DeserializeOwned + Clone + MapEntities,
    {
        let type_name = T::TYPE_NAME;
        let encode: EncodeFn = Box::new(
            move |value: &(dyn Any + Send + Sync), map: &mut EntityMapper<'_>| {
                let mut copy = downcast::<T>(type_name, value)?.clone();
                copy.map_entities(map);
                cbor_encode(&copy).map_err(|reason| CodecError::Encode {
                    type_name: type_name.to_string(),
                    reason,
                })
            },
        );
        let remap: RemapFn = Box::new(|value: &mut (dyn Any + Send + Sync), map: &mut EntityMapper<'_>| {
            if let Some(v) = value.downcast_mut::<T>() {
                v.map_entities(map);
            }
        });
        self.insert(type_name, encode, decode_with::<T>(type_name, cbor_decode::<T>), Some(remap))
    }

    /// Register an explicit encode/decode pair under `type_name`.
    pub fn register_fn<T>(
        &mut self,
        type_name: &str,
        encode: fn(&T) -> Result<Vec<u8>, String>,
        decode: fn(&[u8]) -> Result<T, String>,
    ) -> Result<&mut Self, CodecError>
    where
        T: Any + Send + Sync,
    {
        let name = type_name.to_string();
        let encode_name = name.clone();
        let encode: EncodeFn = Box::new(move |value: &(dyn Any + Send + Sync), _map: &mut EntityMapper<'_>| {
            let typed = downcast::<T>(&encode_name, value)?;
            encode(typed).map_err(|reason| CodecError::Encode {
                type_name: encode_name.clone(),
                reason,
            })
        });
        let decode = decode_with::<T>(&name, decode);
        self.insert(&name, encode, decode, None)
    }

    pub fn build(self) -> ComponentRegistry {
        tracing::debug!(types = self.entries.len(), "component registry frozen");
        ComponentRegistry {
            entries: self.entries,
        }
    }

    fn insert(
        &mut self,
        type_name: &str,
        encode: EncodeFn,
        decode: DecodeFn,
        remap: Option<RemapFn>,
    ) -> Result<&mut Self, CodecError> {
        if self.entries.contains_key(type_name) {
            return Err(CodecError::DuplicateComponentType(type_name.to_string()));
        }
        self.entries.insert(
            type_name.to_string(),
            CodecEntry {
                encode,
                decode,
                remap,
            },
        );
        Ok(self)
    }
}

/// Frozen, read-only mapping from component type name to codec.
pub struct ComponentRegistry {
    entries: BTreeMap<String, CodecEntry>,
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("types", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ComponentRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.entries.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode a component value. Fails with `UnknownComponentType` if unregistered.
    pub fn encode(
        &self,
        type_name: &str,
        value: &(dyn Any + Send + Sync),
    ) -> Result<Vec<u8>, CodecError> {
        self.encode_mapped(type_name, value, &mut |id| id)
    }

    /// Encode a component value, rewriting any entity references through `map`.
    ///
    /// A [`Tombstone`] is written back as its original bytes.
    pub fn encode_mapped(
        &self,
        type_name: &str,
        value: &(dyn Any + Send + Sync),
        map: &mut EntityMapper<'_>,
    ) -> Result<Vec<u8>, CodecError> {
        if let Some(tombstone) = value.downcast_ref::<Tombstone>() {
            return Ok(tombstone.bytes.clone());
        }
        let entry = self
            .entries
            .get(type_name)
            .ok_or_else(|| CodecError::UnknownComponentType(type_name.to_string()))?;
        (entry.encode)(value, map)
    }

    /// Decode component bytes.
    ///
    /// An unregistered type yields a tombstone and a warning rather than an
    /// error; malformed bytes for a registered type are an error.
    pub fn decode(&self, type_name: &str, bytes: &[u8]) -> Result<Decoded, CodecError> {
        match self.entries.get(type_name) {
            Some(entry) => (entry.decode)(bytes).map(Decoded::Value),
            None => {
                tracing::warn!(type_name, len = bytes.len(), "unknown component type, keeping tombstone");
                Ok(Decoded::Tombstone(Tombstone {
                    type_name: type_name.to_string(),
                    bytes: bytes.to_vec(),
                }))
            }
        }
    }

    /// Whether values of this type carry entity references.
    pub fn has_references(&self, type_name: &str) -> bool {
        self.entries
            .get(type_name)
            .is_some_and(|e| e.remap.is_some())
    }

    /// Rewrite the entity references held by a restored value.
    pub fn remap(
        &self,
        type_name: &str,
        value: &mut (dyn Any + Send + Sync),
        map: &mut EntityMapper<'_>,
    ) {
        if let Some(remap) = self.entries.get(type_name).and_then(|e| e.remap.as_ref()) {
            remap(value, map);
        }
    }
}

fn downcast<'v, T: Any>(
    type_name: &str,
    value: &'v (dyn Any + Send + Sync),
) -> Result<&'v T, CodecError> {
    value
        .downcast_ref::<T>()
        .ok_or_else(|| CodecError::TypeMismatch(type_name.to_string()))
}

fn decode_with<T: Any + Send + Sync>(
    type_name: &str,
    decode: fn(&[u8]) -> Result<T, String>,
) -> DecodeFn {
    let type_name = type_name.to_string();
    Box::new(move |bytes: &[u8]| {
        decode(bytes)
            .map(|v| Box::new(v) as ComponentValue)
            .map_err(|reason| CodecError::Decode {
                type_name: type_name.clone(),
                reason,
            })
    })
}

fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, String> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| e.to_string())?;
    Ok(buf)
}

fn cbor_decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    ciborium::from_reader(bytes).map_err(|e| e.to_string())
}

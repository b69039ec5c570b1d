//! Attribute serialization.
//!
//! Attribute values are type-erased ([`AttributeValue`]) while in memory and
//! stored as a small JSON envelope:
//!
//! ```text
//! {"type": "<tag>", "value": <serde_json representation>}
//! ```
//!
//! The tag is resolved through a [`TypeRegistry`] handed to the codec
//! explicitly, so the code that reads a value does not need to share any
//! global state with the code that wrote it. It only needs a registry that
//! knows the same tags.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Attribute Value
// ─────────────────────────────────────────────────────────────────────────────

/// A type-erased session attribute value.
///
/// Cloning is cheap (the value is reference counted). Use
/// [`downcast_ref`](Self::downcast_ref) to get the concrete value back.
#[derive(Clone)]
pub struct AttributeValue {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl AttributeValue {
    /// Wrap a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    fn from_erased(inner: Arc<dyn Any + Send + Sync>, type_name: &'static str) -> Self {
        Self { inner, type_name }
    }

    /// Borrow the value as `T`, if that is its concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Whether the concrete type is `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// Name of the concrete Rust type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn value_type_id(&self) -> TypeId {
        Any::type_id(&*self.inner)
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeValue")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::new(value.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::new(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::new(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::new(value)
    }
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Type Registry
// ─────────────────────────────────────────────────────────────────────────────

type EncodeFn = fn(&(dyn Any + Send + Sync + 'static)) -> serde_json::Result<Value>;
type DecodeFn = fn(Value) -> serde_json::Result<Arc<dyn Any + Send + Sync>>;

struct Registration {
    tag: String,
    type_id: TypeId,
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

fn encode_as<T: Serialize + 'static>(
    value: &(dyn Any + Send + Sync + 'static),
) -> serde_json::Result<Value> {
    match value.downcast_ref::<T>() {
        Some(v) => serde_json::to_value(v),
        None => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "value is not a {}",
            std::any::type_name::<T>()
        ))),
    }
}

fn decode_as<T>(value: Value) -> serde_json::Result<Arc<dyn Any + Send + Sync>>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    let typed: T = serde_json::from_value(value)?;
    Ok(Arc::new(typed))
}

/// Resolves attribute type tags to concrete Rust types.
///
/// Passed to the storage backend at initialization; every value written or
/// read through the backend must have its type registered here.
pub struct TypeRegistry {
    by_tag: HashMap<String, Arc<Registration>>,
    by_type: HashMap<TypeId, Arc<Registration>>,
}

impl TypeRegistry {
    /// Create a registry with the common scalar and JSON types registered.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register::<String>("string");
        registry.register::<bool>("bool");
        registry.register::<i32>("i32");
        registry.register::<i64>("i64");
        registry.register::<u64>("u64");
        registry.register::<f64>("f64");
        registry.register::<Vec<String>>("string_list");
        registry.register::<Vec<u8>>("bytes");
        registry.register::<Value>("json");
        registry
    }

    /// Create a registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            by_tag: HashMap::new(),
            by_type: HashMap::new(),
        }
    }

    /// Register `T` under `tag`. A later registration of the same tag wins.
    pub fn register<T>(&mut self, tag: impl Into<String>) -> &mut Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let registration = Arc::new(Registration {
            tag: tag.into(),
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            encode: encode_as::<T>,
            decode: decode_as::<T>,
        });

        if let Some(previous) = self
            .by_tag
            .insert(registration.tag.clone(), Arc::clone(&registration))
        {
            debug!(
                tag = %registration.tag,
                previous = previous.type_name,
                "Replacing type registration"
            );
            if previous.type_id != registration.type_id {
                self.by_type.remove(&previous.type_id);
            }
        }
        self.by_type
            .insert(registration.type_id, Arc::clone(&registration));
        self
    }

    /// Whether a tag is known.
    pub fn contains_tag(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }

    /// Tag registered for `T`, if any.
    pub fn tag_of<T: 'static>(&self) -> Option<&str> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|r| r.tag.as_str())
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<&str> = self.by_tag.keys().map(String::as_str).collect();
        tags.sort_unstable();
        f.debug_struct("TypeRegistry").field("tags", &tags).finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    #[serde(rename = "type")]
    tag: &'a str,
    value: Value,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    tag: String,
    value: Value,
}

/// Converts attribute values to and from their stored byte form.
#[derive(Debug, Clone)]
pub struct AttributeCodec {
    registry: Arc<TypeRegistry>,
}

impl AttributeCodec {
    /// Create a codec that resolves types through `registry`.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this codec resolves types through.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Serialize a value into its stored form.
    pub fn encode(&self, value: &AttributeValue) -> Result<Vec<u8>> {
        let registration = self
            .registry
            .by_type
            .get(&value.value_type_id())
            .ok_or(Error::UnregisteredType(value.type_name()))?;

        let json = (registration.encode)(&*value.inner)?;
        let envelope = EnvelopeRef {
            tag: &registration.tag,
            value: json,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Reconstruct a value from its stored form.
    pub fn decode(&self, bytes: &[u8]) -> Result<AttributeValue> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let registration = self
            .registry
            .by_tag
            .get(&envelope.tag)
            .ok_or_else(|| Error::UnknownTypeTag(envelope.tag.clone()))?;

        let inner = (registration.decode)(envelope.value)?;
        Ok(AttributeValue::from_erased(inner, registration.type_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Cart {
        items: Vec<String>,
        total_cents: u64,
    }

    fn codec_with_cart() -> AttributeCodec {
        let mut registry = TypeRegistry::new();
        registry.register::<Cart>("shop.cart");
        AttributeCodec::new(Arc::new(registry))
    }

    #[test]
    fn test_builtin_scalars() {
        let codec = AttributeCodec::new(Arc::new(TypeRegistry::new()));

        let bytes = codec.encode(&AttributeValue::from("hello")).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<String>().unwrap(), "hello");

        let bytes = codec.encode(&AttributeValue::from(42_i64)).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<i64>(), Some(&42));
        assert!(!decoded.is::<i32>());
    }

    #[test]
    fn test_registered_struct() {
        let codec = codec_with_cart();
        let cart = Cart {
            items: vec!["book".into(), "pen".into()],
            total_cents: 1299,
        };

        let bytes = codec.encode(&AttributeValue::new(cart.clone())).unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["type"], "shop.cart");

        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.downcast_ref::<Cart>(), Some(&cart));
    }

    #[test]
    fn test_unregistered_type_rejected() {
        let codec = AttributeCodec::new(Arc::new(TypeRegistry::new()));
        let value = AttributeValue::new(Cart {
            items: vec![],
            total_cents: 0,
        });

        assert!(matches!(
            codec.encode(&value),
            Err(Error::UnregisteredType(_))
        ));
    }

    #[test]
    fn test_decode_depends_on_registry() {
        let writer = codec_with_cart();
        let bytes = writer
            .encode(&AttributeValue::new(Cart {
                items: vec!["mug".into()],
                total_cents: 800,
            }))
            .unwrap();

        let reader = AttributeCodec::new(Arc::new(TypeRegistry::new()));
        match reader.decode(&bytes) {
            Err(Error::UnknownTypeTag(tag)) => assert_eq!(tag, "shop.cart"),
            other => panic!("expected unknown tag, got {other:?}"),
        }

        assert!(codec_with_cart().decode(&bytes).is_ok());
    }

    #[test]
    fn test_malformed_bytes() {
        let codec = AttributeCodec::new(Arc::new(TypeRegistry::new()));
        assert!(matches!(codec.decode(b"not json"), Err(Error::Codec(_))));
    }

    #[test]
    fn test_reregistering_tag_replaces_type() {
        let mut registry = TypeRegistry::new();
        registry.register::<Cart>("thing");
        registry.register::<String>("thing");

        assert_eq!(registry.tag_of::<String>(), Some("thing"));
        assert_eq!(registry.tag_of::<Cart>(), None);
        assert!(registry.contains_tag("thing"));
    }
}

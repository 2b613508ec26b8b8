//! The tagged value tree that identity hashing operates on.
//!
//! Any `Serialize` input is lowered into a [`ConfigValue`] through a dedicated serde
//! serializer. The serializer rejects content that has no stable textual identity:
//! non-finite floats, raw byte buffers, map keys that are not scalars, and integers
//! outside the signed 64-bit range.

use serde::ser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::KeyError;

/// Normalizable configuration content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    /// Lower any serializable value into the tree, rejecting non-identity content.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Self, KeyError> {
        value
            .serialize(ValueSerializer::root())
            .map_err(|e| e.at("$"))
            .map_err(|e| KeyError::NonSerializableInput {
                path: e.path,
                reason: e.reason,
            })
    }

    /// An empty map.
    pub fn empty_map() -> Self {
        ConfigValue::Map(BTreeMap::new())
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigValue>> {
        match self {
            ConfigValue::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ConfigValue::Null)
    }
}

impl From<&str> for ConfigValue {
    fn from(s: &str) -> Self {
        ConfigValue::String(s.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(s: String) -> Self {
        ConfigValue::String(s)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl<K: Into<String>> FromIterator<(K, ConfigValue)> for ConfigValue {
    fn from_iter<I: IntoIterator<Item = (K, ConfigValue)>>(iter: I) -> Self {
        ConfigValue::Map(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

// ---------------------------------------------------------------------------
// Serializer
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct ValueError {
    path: String,
    reason: String,
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

impl std::error::Error for ValueError {}

impl ValueError {
    /// Attach a location to errors raised by foreign `Serialize` impls.
    fn at(mut self, path: &str) -> Self {
        if self.path.is_empty() {
            self.path = path.to_string();
        }
        self
    }
}

impl ser::Error for ValueError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        ValueError {
            path: String::new(),
            reason: msg.to_string(),
        }
    }
}

struct ValueSerializer {
    path: String,
}

impl ValueSerializer {
    fn root() -> Self {
        Self {
            path: "$".to_string(),
        }
    }

    fn child(&self, segment: impl fmt::Display) -> Self {
        Self {
            path: format!("{}.{}", self.path, segment),
        }
    }

    fn reject(&self, reason: impl Into<String>) -> ValueError {
        ValueError {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

impl ser::Serializer for ValueSerializer {
    type Ok = ConfigValue;
    type Error = ValueError;

    type SerializeSeq = SeqBuilder;
    type SerializeTuple = SeqBuilder;
    type SerializeTupleStruct = SeqBuilder;
    type SerializeTupleVariant = VariantSeqBuilder;
    type SerializeMap = MapBuilder;
    type SerializeStruct = MapBuilder;
    type SerializeStructVariant = VariantMapBuilder;

    fn serialize_bool(self, v: bool) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Int(v.into()))
    }

    fn serialize_i16(self, v: i16) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Int(v.into()))
    }

    fn serialize_i32(self, v: i32) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Int(v.into()))
    }

    fn serialize_i64(self, v: i64) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Int(v))
    }

    fn serialize_i128(self, v: i128) -> Result<ConfigValue, ValueError> {
        i64::try_from(v)
            .map(ConfigValue::Int)
            .map_err(|_| self.reject(format!("integer {v} exceeds the 64-bit range")))
    }

    fn serialize_u8(self, v: u8) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Int(v.into()))
    }

    fn serialize_u16(self, v: u16) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Int(v.into()))
    }

    fn serialize_u32(self, v: u32) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Int(v.into()))
    }

    fn serialize_u64(self, v: u64) -> Result<ConfigValue, ValueError> {
        i64::try_from(v)
            .map(ConfigValue::Int)
            .map_err(|_| self.reject(format!("integer {v} exceeds the 64-bit range")))
    }

    fn serialize_u128(self, v: u128) -> Result<ConfigValue, ValueError> {
        i64::try_from(v)
            .map(ConfigValue::Int)
            .map_err(|_| self.reject(format!("integer {v} exceeds the 64-bit range")))
    }

    fn serialize_f32(self, v: f32) -> Result<ConfigValue, ValueError> {
        self.serialize_f64(f64::from(v))
    }

    fn serialize_f64(self, v: f64) -> Result<ConfigValue, ValueError> {
        if v.is_finite() {
            Ok(ConfigValue::Float(v))
        } else {
            Err(self.reject(format!("non-finite float {v}")))
        }
    }

    fn serialize_char(self, v: char) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<ConfigValue, ValueError> {
        Err(self.reject(format!(
            "raw byte buffer ({} bytes) has no stable identity",
            v.len()
        )))
    }

    fn serialize_none(self) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<ConfigValue, ValueError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Null)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<ConfigValue, ValueError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<ConfigValue, ValueError> {
        let inner = value.serialize(self.child(variant))?;
        let mut map = BTreeMap::new();
        map.insert(variant.to_string(), inner);
        Ok(ConfigValue::Map(map))
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqBuilder, ValueError> {
        Ok(SeqBuilder {
            path: self.path,
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqBuilder, ValueError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> Result<SeqBuilder, ValueError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantSeqBuilder, ValueError> {
        Ok(VariantSeqBuilder {
            variant,
            seq: SeqBuilder {
                path: format!("{}.{}", self.path, variant),
                items: Vec::with_capacity(len),
            },
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapBuilder, ValueError> {
        Ok(MapBuilder {
            path: self.path,
            entries: BTreeMap::new(),
            pending_key: None,
        })
    }

    fn serialize_struct(self, _name: &'static str, len: usize) -> Result<MapBuilder, ValueError> {
        self.serialize_map(Some(len))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        _len: usize,
    ) -> Result<VariantMapBuilder, ValueError> {
        Ok(VariantMapBuilder {
            variant,
            map: MapBuilder {
                path: format!("{}.{}", self.path, variant),
                entries: BTreeMap::new(),
                pending_key: None,
            },
        })
    }
}

struct SeqBuilder {
    path: String,
    items: Vec<ConfigValue>,
}

impl SeqBuilder {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ValueError> {
        let path = format!("{}[{}]", self.path, self.items.len());
        let item = value
            .serialize(ValueSerializer { path: path.clone() })
            .map_err(|e| e.at(&path))?;
        self.items.push(item);
        Ok(())
    }
}

impl ser::SerializeSeq for SeqBuilder {
    type Ok = ConfigValue;
    type Error = ValueError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ValueError> {
        self.push(value)
    }

    fn end(self) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::List(self.items))
    }
}

impl ser::SerializeTuple for SeqBuilder {
    type Ok = ConfigValue;
    type Error = ValueError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ValueError> {
        self.push(value)
    }

    fn end(self) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::List(self.items))
    }
}

impl ser::SerializeTupleStruct for SeqBuilder {
    type Ok = ConfigValue;
    type Error = ValueError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ValueError> {
        self.push(value)
    }

    fn end(self) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::List(self.items))
    }
}

struct VariantSeqBuilder {
    variant: &'static str,
    seq: SeqBuilder,
}

impl ser::SerializeTupleVariant for VariantSeqBuilder {
    type Ok = ConfigValue;
    type Error = ValueError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ValueError> {
        self.seq.push(value)
    }

    fn end(self) -> Result<ConfigValue, ValueError> {
        let mut map = BTreeMap::new();
        map.insert(self.variant.to_string(), ConfigValue::List(self.seq.items));
        Ok(ConfigValue::Map(map))
    }
}

struct MapBuilder {
    path: String,
    entries: BTreeMap<String, ConfigValue>,
    pending_key: Option<String>,
}

impl MapBuilder {
    fn key_from<T: Serialize + ?Sized>(&self, key: &T) -> Result<String, ValueError> {
        let probe = ValueSerializer {
            path: format!("{}.<key>", self.path),
        };
        match key.serialize(probe)? {
            ConfigValue::String(s) => Ok(s),
            ConfigValue::Int(i) => Ok(i.to_string()),
            ConfigValue::Bool(b) => Ok(b.to_string()),
            other => Err(ValueError {
                path: format!("{}.<key>", self.path),
                reason: format!("map keys must be scalars, found {}", kind_name(&other)),
            }),
        }
    }

    fn insert<T: Serialize + ?Sized>(&mut self, key: String, value: &T) -> Result<(), ValueError> {
        let path = format!("{}.{}", self.path, key);
        let v = value
            .serialize(ValueSerializer { path: path.clone() })
            .map_err(|e| e.at(&path))?;
        self.entries.insert(key, v);
        Ok(())
    }
}

impl ser::SerializeMap for MapBuilder {
    type Ok = ConfigValue;
    type Error = ValueError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), ValueError> {
        self.pending_key = Some(self.key_from(key)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ValueError> {
        let key = self.pending_key.take().ok_or_else(|| ValueError {
            path: self.path.clone(),
            reason: "map value serialized before its key".to_string(),
        })?;
        self.insert(key, value)
    }

    fn end(self) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Map(self.entries))
    }
}

impl ser::SerializeStruct for MapBuilder {
    type Ok = ConfigValue;
    type Error = ValueError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ValueError> {
        self.insert(key.to_string(), value)
    }

    fn end(self) -> Result<ConfigValue, ValueError> {
        Ok(ConfigValue::Map(self.entries))
    }
}

struct VariantMapBuilder {
    variant: &'static str,
    map: MapBuilder,
}

impl ser::SerializeStructVariant for VariantMapBuilder {
    type Ok = ConfigValue;
    type Error = ValueError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), ValueError> {
        self.map.insert(key.to_string(), value)
    }

    fn end(self) -> Result<ConfigValue, ValueError> {
        let mut outer = BTreeMap::new();
        outer.insert(self.variant.to_string(), ConfigValue::Map(self.map.entries));
        Ok(ConfigValue::Map(outer))
    }
}

fn kind_name(value: &ConfigValue) -> &'static str {
    match value {
        ConfigValue::Null => "null",
        ConfigValue::Bool(_) => "bool",
        ConfigValue::Int(_) => "int",
        ConfigValue::Float(_) => "float",
        ConfigValue::String(_) => "string",
        ConfigValue::List(_) => "list",
        ConfigValue::Map(_) => "map",
    }
}

//! Conversion between record bytes and typed keys/values.
//!
//! Every topic the processor reads or writes needs a [`TopicCodec`]: one
//! [`Codec`] for keys and one for values.

use std::{fmt, marker::PhantomData, sync::Arc};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};

pub trait Codec<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Bytes>;
    fn deserialize(&self, bytes: &Bytes) -> Result<T>;
}

/// Key and value codecs for a single topic.
pub struct TopicCodec<K, V> {
    pub key: Arc<dyn Codec<K>>,
    pub value: Arc<dyn Codec<V>>,
}

impl<K, V> TopicCodec<K, V> {
    pub fn new(key: impl Codec<K> + 'static, value: impl Codec<V> + 'static) -> Self {
        Self {
            key: Arc::new(key),
            value: Arc::new(value),
        }
    }
}

impl<K, V> Clone for TopicCodec<K, V> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            value: Arc::clone(&self.value),
        }
    }
}

impl<K, V> fmt::Debug for TopicCodec<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicCodec").finish_non_exhaustive()
    }
}

/// UTF-8 strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn serialize(&self, value: &String) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn deserialize(&self, bytes: &Bytes) -> Result<String> {
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|err| {
                tracing::error!("Error converting from UTF8 {:?}", err);
                Error::DecodingError(err.to_string())
            })
    }
}

/// Passes raw bytes through untouched.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytesCodec;

impl Codec<Bytes> for BytesCodec {
    fn serialize(&self, value: &Bytes) -> Result<Bytes> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &Bytes) -> Result<Bytes> {
        Ok(bytes.clone())
    }
}

/// JSON documents via serde.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn serialize(&self, value: &T) -> Result<Bytes> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|err| Error::EncodingError(err.to_string()))
    }

    fn deserialize(&self, bytes: &Bytes) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|err| Error::DecodingError(err.to_string()))
    }
}

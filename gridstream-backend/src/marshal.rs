//! Marshalling of entries, updaters and error blobs into opaque wire bytes.
//!
//! Entries-blob and updater-blob are opaque to `gridstream` itself —
//! both are delegated to "the configured marshaller". This module
//! defines that contract and a `bincode`-backed default.
//!
//! [`Marshaller`] itself only carries the object-safe half of that
//! contract (erased value in, reversible byte transform out) so it can
//! live behind `Arc<dyn Marshaller>`; the ergonomic, generic
//! `marshal::<T>()`/`unmarshal::<T>()` calls live on [`MarshallerExt`],
//! mirroring how `hitbox-backend`'s `Format`/`FormatExt` split an
//! object-safe vtable from its typed convenience API.

use std::sync::Arc;

use bytes::Bytes;
use erased_serde::Serialize as ErasedSerialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::compressor::Compressor;
use crate::error::MarshalError;

/// Object-safe half of the marshalling contract: encodes an already
/// type-erased value, and reverses whatever wire-level transform an
/// implementor layers on top of the plain encoded bytes (compression,
/// say) so the decoded bytes are ready for a typed decode.
///
/// Implementors that add no transform of their own return `bytes`
/// unchanged from [`reverse_transform`](Self::reverse_transform).
pub trait Marshaller: Send + Sync {
    /// Encodes `value` into this marshaller's wire representation.
    fn marshal_erased(&self, value: &dyn ErasedSerialize) -> Result<Bytes, MarshalError>;

    /// Reverses this marshaller's own wire-level transform, handing the
    /// result to `decode` for the actual typed decode. `decode` reports
    /// its own failure through the returned `Result`.
    fn reverse_transform(
        &self,
        bytes: &[u8],
        decode: &mut dyn FnMut(&[u8]) -> Result<(), MarshalError>,
    ) -> Result<(), MarshalError>;
}

/// Typed convenience API over any [`Marshaller`], including through
/// `Arc<dyn Marshaller>` — the blanket impl below covers `?Sized`.
pub trait MarshallerExt: Marshaller {
    /// Encodes `value` into its wire representation.
    fn marshal<T: Serialize>(&self, value: &T) -> Result<Bytes, MarshalError> {
        self.marshal_erased(value)
    }

    /// Decodes a wire representation back into `T`.
    fn unmarshal<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, MarshalError> {
        let mut result: Option<T> = None;
        self.reverse_transform(bytes, &mut |plain| {
            let config = bincode::config::standard();
            let (value, _) = bincode::serde::decode_from_slice(plain, config)
                .map_err(|e| MarshalError::Decode(Box::new(e)))?;
            result = Some(value);
            Ok(())
        })?;
        result.ok_or_else(|| {
            MarshalError::Decode(Box::new(std::io::Error::other(
                "reverse_transform produced no value",
            )))
        })
    }
}

impl<T: Marshaller + ?Sized> MarshallerExt for T {}

/// Default marshaller: `bincode`'s compact binary encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeMarshaller;

impl Marshaller for BincodeMarshaller {
    fn marshal_erased(&self, value: &dyn ErasedSerialize) -> Result<Bytes, MarshalError> {
        let config = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec(value, config)
            .map_err(|e| MarshalError::Encode(Box::new(e)))?;
        Ok(Bytes::from(bytes))
    }

    fn reverse_transform(
        &self,
        bytes: &[u8],
        decode: &mut dyn FnMut(&[u8]) -> Result<(), MarshalError>,
    ) -> Result<(), MarshalError> {
        decode(bytes)
    }
}

/// Wraps a [`Marshaller`] with a [`Compressor`] applied to the encoded
/// bytes: `marshal` encodes then compresses, `unmarshal` decompresses
/// then decodes. Lets a deployment pick a serialization format and a
/// compression codec independently, the same separation of concerns
/// `hitbox-configuration`'s `Compression::to_compressor` keeps from its
/// choice of cache backend.
pub struct CompressingMarshaller<M> {
    inner: M,
    compressor: Arc<dyn Compressor>,
}

impl<M> CompressingMarshaller<M> {
    /// Wraps `inner`, compressing its output through `compressor`.
    pub fn new(inner: M, compressor: Arc<dyn Compressor>) -> Self {
        Self { inner, compressor }
    }
}

impl<M: Marshaller> Marshaller for CompressingMarshaller<M> {
    fn marshal_erased(&self, value: &dyn ErasedSerialize) -> Result<Bytes, MarshalError> {
        let encoded = self.inner.marshal_erased(value)?;
        self.compressor
            .compress(&encoded)
            .map_err(|e| MarshalError::Encode(Box::new(e)))
    }

    fn reverse_transform(
        &self,
        bytes: &[u8],
        decode: &mut dyn FnMut(&[u8]) -> Result<(), MarshalError>,
    ) -> Result<(), MarshalError> {
        let decompressed = self
            .compressor
            .decompress(bytes)
            .map_err(|e| MarshalError::Decode(Box::new(e)))?;
        self.inner.reverse_transform(&decompressed, decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::PassthroughCompressor;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        key: String,
        value: i64,
    }

    #[test]
    fn round_trips_through_bincode() {
        let marshaller = BincodeMarshaller;
        let sample = Sample {
            key: "a".into(),
            value: 42,
        };
        let bytes = marshaller.marshal(&sample).unwrap();
        let decoded: Sample = marshaller.unmarshal(&bytes).unwrap();
        assert_eq!(sample, decoded);
    }

    #[test]
    fn rejects_garbage_bytes() {
        let marshaller = BincodeMarshaller;
        let result: Result<Sample, _> = marshaller.unmarshal(&[0xff, 0x00, 0x01]);
        assert!(result.is_err());
    }

    #[test]
    fn compressing_marshaller_round_trips_through_its_inner_codec() {
        let marshaller = CompressingMarshaller::new(BincodeMarshaller, Arc::new(PassthroughCompressor));
        let sample = Sample {
            key: "a".into(),
            value: 42,
        };
        let bytes = marshaller.marshal(&sample).unwrap();
        let decoded: Sample = marshaller.unmarshal(&bytes).unwrap();
        assert_eq!(sample, decoded);
    }

    #[test]
    fn marshals_through_a_trait_object() {
        let marshaller: Arc<dyn Marshaller> = Arc::new(BincodeMarshaller);
        let sample = Sample {
            key: "b".into(),
            value: 7,
        };
        let bytes = marshaller.marshal(&sample).unwrap();
        let decoded: Sample = marshaller.unmarshal(&bytes).unwrap();
        assert_eq!(sample, decoded);
    }
}

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod compressor;
pub mod deployment;
pub mod discovery;
pub mod error;
pub mod marshal;
pub mod transport;
pub mod worker_pool;

#[cfg(feature = "metrics")]
pub(crate) mod metrics;

pub use compressor::{Compressor, CompressionError, PassthroughCompressor};
#[cfg(feature = "gzip")]
pub use compressor::GzipCompressor;
#[cfg(feature = "zstd")]
pub use compressor::ZstdCompressor;
pub use deployment::{DeploymentClassPredicate, DeploymentDescriptor, DeploymentMode};
pub use discovery::{Discovery, TopologyEvent};
pub use error::{LocalExecError, MarshalError, TransportError};
pub use marshal::{BincodeMarshaller, CompressingMarshaller, Marshaller, MarshallerExt};
pub use transport::{MessageHandler, NetworkTransport, Topic};
pub use worker_pool::{TokioWorkerPool, WorkerPool};

//! Pagestream engine: runs the external crawl engine, reads its output and
//! publishes artifacts to a message broker.
mod dispatch;
mod exec;
mod filename;
mod filter;
#[cfg(feature = "kafka")]
mod kafka;
mod locate;
mod manifest;
mod orchestrate;
mod parse;
mod persist;
mod publish;
pub mod settings;

pub use dispatch::{DispatchSettings, InvocationOutcome, ProcessDispatcher, ProcessFailure};
pub use exec::{EngineExecutor, ExecError, ProcessExecutor, RawOutput};
pub use filename::{artifact_prefix, find_artifacts, object_key};
pub use filter::SessionFilter;
#[cfg(feature = "kafka")]
pub use kafka::KafkaProducer;
pub use locate::{EngineBinary, EngineLocator, InvocationError, Platform, ENGINE_BINARY_NAME};
pub use manifest::{write_manifest, BatchSummary, ManifestError, MANIFEST_FILENAME};
pub use orchestrate::{BatchError, Orchestrator};
pub use parse::ResultParser;
pub use persist::{ensure_output_dir, AtomicFileWriter, PersistError};
pub use publish::{
    partition_index, BrokerMessage, Credentials, DeliveryReceipt, MessageProducer, ProducerError,
    StreamPublisher, TransportConfig, HEADER_CONTENT_TYPE, HEADER_SESSION, HEADER_TIMESTAMP,
    HEADER_URL,
};
pub use settings::Settings;

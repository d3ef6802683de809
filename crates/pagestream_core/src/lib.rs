//! Pagestream core: pure request model, validation, session ids, engine
//! invocation grammar and the per-URL result model. No IO happens here.
mod batch;
mod command;
mod request;
mod result;
mod session;
mod validate;

pub use batch::{advance, BatchEvent, BatchState};
pub use command::{Action, BuildError, CommandBuilder, Flag, Invocation, VERSION_FLAG};
pub use request::{
    Compression, ConcurrencyStrategy, ContentKind, ContentSelector, CrawlParams, CrawlRequest,
    EngineOptions, ExecutionMode, StreamParams, StreamRequest, TransportTuning, TuningParams,
    UploadParams, UploadRequest,
};
pub use result::{
    ArtifactSource, Artifacts, CrawlResult, FailureKind, KindDelivery, PublishFailure,
    PublishReceipt, StreamOutcome, StreamResult, UploadOutcome, UploadResult, UrlOutcome,
};
pub use session::{SessionId, SessionRegistry};
pub use validate::{
    validate_crawl, validate_stream, validate_upload, ValidationError, MAX_MESSAGE_CEILING,
};

// Library root: the session core and its stores, backends and config.
// The console binary entry point is src/main.rs.

pub mod backend;
pub mod config;
pub mod error;
pub mod logger;
pub mod models;
pub mod session;
pub mod settings;
pub mod speech;
pub mod transcript;

pub use error::{AppError, SessionError};
pub use session::{
    Generation, GenerationOutcome, GenerationReport, GenerationRequest, GenerationState, LoadOutcome,
    ModelInfo, ModelState, SamplingParams, Session, SessionBuilder, SessionEvent, SessionOptions,
};

//! Lemon server: a local inference gateway.
//!
//! One OpenAI-compatible HTTP surface over a zoo of native engine
//! subprocesses (llama-server, whisper-server, sd-server, koko,
//! ryzenai-server and the vendor-installed flm). The gateway installs
//! engine distributions, downloads model weights, supervises child
//! processes and routes requests to whichever engine serves the named
//! model.

pub mod api;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod process;
pub mod state;
pub mod transfers;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;

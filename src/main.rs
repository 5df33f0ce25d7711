//! MCQ Backend · verified multiple-choice question generation
//!
//! - Axum HTTP API
//! - Generate -> verify -> revise pipeline over OpenAI or Azure OpenAI chat models
//! - Optional local reference corpus for grounding questions
//!
//! Important env variables:
//!   PORT                        : u16 (default 3000)
//!   OPENAI_API_KEY              : enables the OpenAI provider
//!   OPENAI_BASE_URL             : default "https://api.openai.com/v1"
//!   OPENAI_GENERATION_MODEL     : default "gpt-4.1"
//!   OPENAI_VERIFICATION_MODEL   : default same as generation
//!   AZURE_OPENAI_API_KEY        : with AZURE_OPENAI_ENDPOINT, selects Azure instead
//!   AZURE_OPENAI_ENDPOINT       : e.g. "https://my-resource.openai.azure.com"
//!   AZURE_OPENAI_API_VERSION    : default "2024-02-15-preview"
//!   AZURE_OPENAI_CHAT_DEPLOYMENT: default "gpt-4.1"
//!   CORPUS_DIR                  : directory of .txt/.md reference documents
//!   AGENT_CONFIG_PATH           : path to TOML config (prompts + pipeline tuning)
//!   LOG_LEVEL                   : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT                  : "pretty" (default) or "json"

mod telemetry;
mod util;
mod errors;
mod domain;
mod config;
mod decode;
mod model;
mod openai;
mod corpus;
mod context;
mod generator;
mod verifier;
mod pipeline;
mod state;
mod protocol;
mod routes;
#[cfg(test)]
mod test_utils;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, instrument, warn};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Build shared application state (model client, corpus, pipeline services).
  let state = Arc::new(AppState::new());
  let shutdown = state.shutdown.clone();

  // Build the HTTP router with routes, CORS and tracing layers.
  let app = build_router(state);

  // Read port from env or default to 3000.
  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "mcq_backend", %addr, "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(async move {
      if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(target: "mcq_backend", error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
      }
      info!(target: "mcq_backend", "Shutdown requested; cancelling in-flight papers");
      shutdown.cancel();
    })
    .await?;
  Ok(())
}

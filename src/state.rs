//! Application state: the question pipeline services, built once at startup.
//!
//! This module owns:
//!   - the orchestrator (context assembler, generator, verifier), when a model is configured
//!   - the optional local corpus loaded from CORPUS_DIR
//!   - the shutdown token that cancels in-flight papers
//!
//! Without OPENAI_API_KEY / AZURE_OPENAI_* there is no orchestrator and the
//! question endpoint answers 503.

use std::{path::PathBuf, sync::Arc};

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{load_agent_config_from_env, AgentConfig};
use crate::context::ContextAssembler;
use crate::corpus::{LocalCorpus, SearchCapability};
use crate::generator::Generator;
use crate::model::TextModel;
use crate::openai::OpenAI;
use crate::pipeline::Orchestrator;
use crate::verifier::Verifier;

pub struct AppState {
    pub orchestrator: Option<Orchestrator>,
    pub corpus_ready: bool,
    /// Largest question count accepted per topic.
    pub max_questions_per_topic: usize,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build state from env: load config, load corpus, init the model client.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let cfg = load_agent_config_from_env().unwrap_or_default();
        let corpus = load_corpus_from_env();

        let models: Option<(Arc<dyn TextModel>, Arc<dyn TextModel>)> = match OpenAI::from_env() {
            Some(oa) => {
                info!(target: "mcq_backend", base_url = %oa.base_url, provider = ?oa.provider, generation_model = %oa.generation_model, verification_model = %oa.verification_model, "Model client enabled.");
                let gen_model: Arc<dyn TextModel> = Arc::new(oa.generation());
                let ver_model: Arc<dyn TextModel> = Arc::new(oa.verification());
                Some((gen_model, ver_model))
            }
            None => {
                warn!(target: "mcq_backend", "No OPENAI_API_KEY or AZURE_OPENAI_* set; question generation disabled.");
                None
            }
        };

        Self::with_services(cfg, models, corpus)
    }

    /// Wire the pipeline from explicit parts.
    pub fn with_services(
        cfg: AgentConfig,
        models: Option<(Arc<dyn TextModel>, Arc<dyn TextModel>)>,
        corpus: Option<Arc<dyn SearchCapability>>,
    ) -> Self {
        let corpus_ready = corpus.is_some();
        let settings = cfg.pipeline;
        let max_questions_per_topic = settings.max_questions_per_topic;
        let orchestrator = models.map(|(gen_model, ver_model)| {
            Orchestrator::new(
                ContextAssembler::new(corpus, &settings),
                Generator::new(gen_model, cfg.prompts.clone(), settings.clone()),
                Verifier::new(ver_model, cfg.prompts.clone(), settings.clone()),
                settings.clone(),
            )
        });

        Self { orchestrator, corpus_ready, max_questions_per_topic, shutdown: CancellationToken::new() }
    }
}

fn load_corpus_from_env() -> Option<Arc<dyn SearchCapability>> {
    let dir = PathBuf::from(std::env::var("CORPUS_DIR").ok()?);
    match LocalCorpus::load_dir(&dir) {
        Ok(c) if !c.is_empty() => {
            let corpus: Arc<dyn SearchCapability> = Arc::new(c);
            Some(corpus)
        }
        Ok(_) => {
            warn!(target: "mcq_backend", dir = %dir.display(), "Corpus directory has no usable text; running without context");
            None
        }
        Err(e) => {
            warn!(target: "mcq_backend", dir = %dir.display(), error = %e, "Failed to load corpus; running without context");
            None
        }
    }
}

//! The pipeline facade.
//!
//! [`Pipeline`] owns the long-lived services (text generator, artifact
//! cache, execution gateway, deck compiler, template registry) and is the
//! entry point for the CLI and the HTTP server.
//! Nothing here is global: tests build a `Pipeline` with scripted parts via
//! [`Pipeline::new`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::cache::ContentCache;
use crate::compile::DeckCompiler;
use crate::config::Config;
use crate::error::{CompileError, ExecutionError, QueryError, ResearchError, TransformError};
use crate::gateway::ExecutionGateway;
use crate::llm::{ChunkSink, QueryClient, TextGenerator};
use crate::models::{Artifact, CodeKind, Outline, ResearchDocument, Template};
use crate::outline;
use crate::render::{create_renderer, SlideRenderer};
use crate::research;
use crate::runtime::{RscriptRuntime, StatRuntime};
use crate::templates::TemplateRegistry;

/// Output of a full topic → deck run.
#[derive(Debug, Clone, Serialize)]
pub struct DeckRun {
    pub document: ResearchDocument,
    pub outline: Outline,
    pub template: String,
    pub deck: String,
}

/// Stands in for the LLM client when no API key is configured.
struct MissingKey {
    var: String,
}

#[async_trait]
impl TextGenerator for MissingKey {
    async fn query(
        &self,
        _prompt: &str,
        _max_tokens: u32,
        _streaming: bool,
        _on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<String, QueryError> {
        Err(QueryError::MissingApiKey {
            var: self.var.clone(),
        })
    }
}

pub struct Pipeline {
    config: Config,
    generator: Arc<dyn TextGenerator>,
    gateway: Arc<ExecutionGateway>,
    compiler: DeckCompiler,
    templates: TemplateRegistry,
}

impl Pipeline {
    /// Wire up the production services described by `config`.
    ///
    /// A missing API key is not fatal here: deck compilation and template
    /// listing work without one, and LLM calls fail with
    /// [`QueryError::MissingApiKey`] when attempted.
    pub fn from_config(config: &Config) -> Result<Self> {
        let generator: Arc<dyn TextGenerator> = match QueryClient::from_config(&config.llm) {
            Ok(client) => Arc::new(client),
            Err(QueryError::MissingApiKey { var }) => {
                warn!(var = %var, "LLM API key not set; research and outline calls will fail");
                Arc::new(MissingKey { var })
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to create LLM client for {}", config.llm.base_url)
                })
            }
        };
        let runtime = RscriptRuntime::from_config(&config.runtime);
        let renderer = create_renderer(&config.render)?;
        Ok(Self::new(config.clone(), generator, Arc::new(runtime), renderer))
    }

    pub fn new(
        config: Config,
        generator: Arc<dyn TextGenerator>,
        runtime: Arc<dyn StatRuntime>,
        renderer: Arc<dyn SlideRenderer>,
    ) -> Self {
        let cache = Arc::new(ContentCache::from_config(&config.cache));
        let gateway = Arc::new(ExecutionGateway::new(runtime, cache));
        let compiler = DeckCompiler::new(gateway.clone(), renderer, config.compile.max_parallel);
        Self {
            config,
            generator,
            gateway,
            compiler,
            templates: TemplateRegistry::builtin(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn generator(&self) -> Arc<dyn TextGenerator> {
        Arc::clone(&self.generator)
    }

    pub fn gateway(&self) -> &Arc<ExecutionGateway> {
        &self.gateway
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        self.gateway.cache()
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    // ============ Research & outline ============

    pub async fn conduct_research(
        &self,
        topic: &str,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<ResearchDocument, ResearchError> {
        research::conduct_research(
            self.generator.as_ref(),
            topic,
            self.config.llm.research_max_tokens,
            self.config.llm.streaming,
            on_chunk,
        )
        .await
    }

    pub async fn generate_outline(
        &self,
        document: &ResearchDocument,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<Outline, TransformError> {
        outline::generate_outline(
            self.generator.as_ref(),
            document,
            self.config.llm.outline_max_tokens,
            self.config.llm.streaming,
            on_chunk,
        )
        .await
    }

    // ============ Deck ============

    /// Look up a template by name, falling back to the configured default.
    pub fn resolve_template(&self, name: Option<&str>) -> Option<&'static Template> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(self.config.compile.default_template.as_str());
        self.templates.find(name)
    }

    pub async fn assemble_deck(
        &self,
        outline: &Outline,
        template: &Template,
    ) -> Result<String, CompileError> {
        self.compiler.assemble(outline, template).await
    }

    pub async fn compile_deck(
        &self,
        outline: &Outline,
        template: &Template,
    ) -> Result<String, CompileError> {
        self.compiler.compile(outline, template).await
    }

    pub fn renderer_name(&self) -> &str {
        self.compiler.renderer().name()
    }

    // ============ Runtime ============

    pub async fn execute(&self, code: &str, kind: CodeKind) -> Result<Artifact, ExecutionError> {
        self.gateway.execute(code, kind).await
    }

    pub async fn execute_document(&self, code: &str) -> Result<String, ExecutionError> {
        self.gateway.execute_document(code).await
    }

    // ============ Templates ============

    pub fn list_templates(&self, readable_only: bool) -> Vec<&'static Template> {
        if readable_only {
            self.templates.readable()
        } else {
            self.templates.all().iter().collect()
        }
    }

    pub fn sample_templates(&self, count: usize) -> Vec<&'static Template> {
        self.templates.random_sample(count)
    }

    // ============ Full run ============

    /// Topic → research → outline → rendered deck.
    pub async fn run(
        &self,
        topic: &str,
        template_name: Option<&str>,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> Result<DeckRun> {
        let template = self.resolve_template(template_name).with_context(|| {
            format!(
                "Unknown template: {}",
                template_name.unwrap_or(self.config.compile.default_template.as_str())
            )
        })?;

        let document = self
            .conduct_research(topic, on_chunk)
            .await
            .context("Research failed")?;
        let outline = self
            .generate_outline(&document, None)
            .await
            .context("Outline generation failed")?;
        let deck = self
            .compile_deck(&outline, template)
            .await
            .context("Deck compilation failed")?;

        Ok(DeckRun {
            document,
            outline,
            template: template.name.to_string(),
            deck,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::PassthroughRenderer;
    use crate::runtime::ExecMode;

    /// Answers research prompts with prose and outline prompts with slides.
    struct Canned;

    #[async_trait]
    impl TextGenerator for Canned {
        async fn query(
            &self,
            prompt: &str,
            _max_tokens: u32,
            _streaming: bool,
            on_chunk: Option<ChunkSink<'_>>,
        ) -> Result<String, QueryError> {
            let text = if prompt.contains("slide-deck outline") {
                "```markdown\n# Deck\n---\n## Chart\n```{r}\nplot(1:3)\n```\n```"
            } else {
                "Findings about the topic."
            };
            if let Some(cb) = on_chunk {
                cb(text);
            }
            Ok(text.to_string())
        }
    }

    struct Svg;

    #[async_trait]
    impl StatRuntime for Svg {
        fn name(&self) -> &str {
            "svg"
        }

        async fn run(&self, _code: &str, _mode: ExecMode) -> Result<String, ExecutionError> {
            Ok("<svg/>".to_string())
        }
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(
            Config::minimal(),
            Arc::new(Canned),
            Arc::new(Svg),
            Arc::new(PassthroughRenderer),
        )
    }

    #[tokio::test]
    async fn test_full_run() {
        let p = pipeline();
        let run = p.run("solar", Some("midnight"), None).await.unwrap();
        assert_eq!(run.document.raw_text, "Findings about the topic.");
        assert_eq!(run.outline.normalized_text, "# Deck\n---\n## Chart\n```{r}\nplot(1:3)\n```");
        assert_eq!(run.template, "midnight");
        assert!(run.deck.starts_with("---\nmarp: true\n"));
        assert!(run.deck.contains("data:image/svg+xml;base64,"));
        assert_eq!(p.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let err = pipeline().run("solar", Some("nope"), None).await.unwrap_err();
        assert!(err.to_string().contains("Unknown template"));
    }

    #[test]
    fn test_resolve_template_default() {
        let p = pipeline();
        assert_eq!(p.resolve_template(None).unwrap().name, "classic");
        assert_eq!(p.resolve_template(Some("  ")).unwrap().name, "classic");
        assert_eq!(p.resolve_template(Some("ocean")).unwrap().name, "ocean");
    }

    #[tokio::test]
    async fn test_missing_key_fails_only_on_query() {
        let mut config = Config::minimal();
        config.llm.api_key_env = "RESEARCH_DECK_PIPELINE_UNSET_KEY".to_string();
        let p = Pipeline::from_config(&config).unwrap();
        assert_eq!(p.list_templates(false).len(), 12);
        let err = p.conduct_research("topic", None).await.unwrap_err();
        match err {
            ResearchError::Query { source, .. } => {
                assert!(matches!(source, QueryError::MissingApiKey { .. }))
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_list_templates() {
        let p = pipeline();
        assert_eq!(p.list_templates(false).len(), 12);
        assert!(p.list_templates(true).len() < 12);
        assert_eq!(p.sample_templates(3).len(), 3);
    }
}

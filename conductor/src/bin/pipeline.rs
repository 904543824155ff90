//! End-to-end demo: a research-draft-critique pipeline running on mock
//! backends and a seeded local knowledge index.
//!
//! ```text
//! research ──> outline ──> draft ──┬──> finalize
//!                                  └ critique (optional)
//! ```

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use tracing::info;

use conductor::agents::client::MockClient;
use conductor::knowledge::source::LocalIndexSource;
use conductor::{
    AgentPool, AgentPoolBuilder, InMemoryStateStore, KnowledgeRouter, OperationRegistry,
    PoolConfig, RouterConfig, WorkflowEngine,
};
use conductor_sdk::{AgentConfig, GenerationRequest, OrchestratorError, StepDef, Workflow};

#[derive(Parser, Debug)]
#[command(name = "pipeline", about = "Run a demo workflow against mock agents")]
struct Args {
    /// Topic to research and write about
    #[arg(default_value = "session token authentication")]
    topic: String,

    /// Bound on concurrently running steps
    #[arg(long, default_value_t = 4)]
    max_concurrency: usize,
}

fn seeded_router() -> Arc<KnowledgeRouter> {
    let factual = LocalIndexSource::new();
    factual.add_document(
        "auth-design",
        "Authentication uses signed session tokens with a rolling expiry window. \
         Tokens are rotated on privilege change and revoked on logout.",
    );
    factual.add_document(
        "deployment",
        "Deploys roll out region by region behind a feature flag, with automated \
         rollback on elevated error rates.",
    );

    let analytical = LocalIndexSource::new();
    analytical.add_document(
        "auth-tradeoffs",
        "Short-lived session tokens trade user friction for a smaller replay window; \
         refresh tokens recover the friction at the cost of revocation complexity.",
    );

    Arc::new(KnowledgeRouter::new(
        Arc::new(factual),
        Arc::new(analytical),
        RouterConfig::default(),
    ))
}

fn mock_pool(max_concurrency: usize) -> Result<Arc<AgentPool>> {
    let pool = AgentPoolBuilder::new(PoolConfig {
        max_concurrency,
        ..PoolConfig::default()
    })
    .register(
        AgentConfig::local("fast", 8_000),
        Arc::new(MockClient::respond(
            "Outline: 1. token lifecycle 2. expiry policy 3. revocation",
        )),
    )?
    .register(
        AgentConfig::local("strong", 32_000),
        Arc::new(MockClient::respond(
            "Session tokens should be signed, short-lived, and rotated on privilege \
             change. Revocation lists cover the gap until expiry.",
        )),
    )?
    .build();
    Ok(Arc::new(pool))
}

fn build_registry(
    topic: String,
    router: Arc<KnowledgeRouter>,
    pool: Arc<AgentPool>,
) -> OperationRegistry {
    let mut registry = OperationRegistry::new();

    let router_op = router.clone();
    registry.register("research", move |ctx| {
        let router = router_op.clone();
        let topic = topic.clone();
        async move {
            let result = router.query(&topic, "pipeline", &ctx.cancel).await?;
            Ok(json!({
                "answer": result.answer,
                "snippets": result.snippets.len(),
                "from_cache": result.from_cache,
            }))
        }
    });

    let pool_outline = pool.clone();
    registry.register("outline", move |ctx| {
        let pool = pool_outline.clone();
        async move {
            let background = ctx
                .input("research")
                .and_then(|v| v.get("answer"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let request =
                GenerationRequest::new("fast", format!("Outline an article.\n\n{background}"));
            let result = pool.generate(&request, &ctx.cancel).await?;
            ctx.record_generation(&result);
            Ok(json!({ "text": result.text }))
        }
    });

    let pool_draft = pool.clone();
    registry.register("draft", move |ctx| {
        let pool = pool_draft.clone();
        async move {
            let outline = ctx
                .input("outline")
                .and_then(|v| v.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let request =
                GenerationRequest::new("strong", format!("Write the article.\n\n{outline}"));
            let result = pool.generate(&request, &ctx.cancel).await?;
            ctx.record_generation(&result);
            Ok(json!({ "text": result.text }))
        }
    });

    let pool_critique = pool.clone();
    registry.register("critique", move |ctx| {
        let pool = pool_critique.clone();
        async move {
            let draft = ctx
                .input("draft")
                .and_then(|v| v.get("text"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let request = GenerationRequest::new("", format!("Critique this draft.\n\n{draft}"));
            let entries = pool
                .tournament_with_cancel(&request, &["fast", "strong"], &ctx.cancel)
                .await;

            // Keep the longest successful critique; a fully-failed
            // tournament fails the (optional) step.
            let mut best: Option<(String, String)> = None;
            for (model, outcome) in entries {
                if let Ok(result) = outcome {
                    ctx.record_generation(&result);
                    let better = best
                        .as_ref()
                        .map(|(_, text)| result.text.len() > text.len())
                        .unwrap_or(true);
                    if better {
                        best = Some((model, result.text));
                    }
                }
            }
            let (model, text) = best.ok_or_else(|| {
                OrchestratorError::Operation("every critique backend failed".into())
            })?;
            Ok(json!({ "model": model, "text": text }))
        }
    });

    registry.register("finalize", |ctx| async move {
        let draft = ctx
            .input("draft")
            .and_then(|v| v.get("text"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let critique = ctx
            .input("critique")
            .and_then(|v| v.get("text"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(json!({
            "article": draft,
            "critique_applied": critique.is_some(),
            "critique": critique,
        }))
    });

    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let router = seeded_router();
    let pool = mock_pool(args.max_concurrency)?;
    let registry = build_registry(args.topic.clone(), router, pool.clone());
    let store = Arc::new(InMemoryStateStore::default());
    let engine = WorkflowEngine::new(registry, store);

    let workflow = Workflow::new("demo-pipeline")
        .step(StepDef::new("research", "research"))
        .step(StepDef::new("outline", "outline").depends_on(["research"]))
        .step(StepDef::new("draft", "draft").depends_on(["outline"]))
        .step(StepDef::new("critique", "critique").depends_on(["draft"]).optional())
        .step(StepDef::new("finalize", "finalize").depends_on(["draft", "critique"]));

    let run_id = engine.submit(workflow).await?;
    let mut events = engine.subscribe(run_id).await?;
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(?event, "progress");
        }
    });

    let result = engine.run(run_id).await?;
    printer.abort();

    println!("status: {:?}", result.status);
    println!(
        "steps:  {}/{} completed",
        result.steps_completed, result.steps_total
    );
    println!(
        "usage:  {} in / {} out tokens, ${:.4}, models {:?}",
        result.metadata.tokens_in,
        result.metadata.tokens_out,
        result.metadata.cost_usd,
        result.metadata.models_used
    );
    if let Some(output) = result.outputs.get("finalize") {
        println!("article:\n{}", serde_json::to_string_pretty(output)?);
    }
    for stats in pool.stats().per_model {
        println!("model {}: {} calls, avg {:?}", stats.0, stats.1.calls, stats.1.avg_latency);
    }

    Ok(())
}

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use digest_enrich::admission::{BudgetTracker, CircuitBreaker};
use digest_enrich::clock::{Clock, SystemClock};
use digest_enrich::config::EnrichmentConfig;
use digest_enrich::enrichment::{EnrichmentCoordinator, PostCandidate, ScoringEvaluator};
use digest_enrich::provider::{EnrichmentProvider, RemoteEnrichment, Summarizer};
use digest_enrich::store;

const USAGE: &str = "\
Usage: digest-enrich <command>

Commands:
  config        Print the effective configuration
  status        Print budget and circuit breaker state
  score <file>  Score posts without calling anything
  run <file>    Enrich posts (requires ENRICH_ENDPOINT)

<file> is a JSON array of posts:
  [{\"id\", \"title\", \"body\", \"engagement\", \"community\", \"url\"?}]";

/// A post as handed over by the fetcher.
#[derive(Debug, Deserialize)]
struct PostInput {
    id: String,
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    engagement: i64,
    community: String,
    #[serde(default)]
    url: Option<String>,
}

impl From<PostInput> for PostCandidate {
    fn from(post: PostInput) -> Self {
        PostCandidate::from_post(
            post.id,
            post.title,
            post.body,
            post.engagement,
            post.community,
            post.url.as_deref(),
        )
    }
}

#[derive(Serialize)]
struct ScoreLine {
    id: String,
    score: i64,
    eligible: bool,
    factors: Vec<String>,
}

fn read_candidates(path: &Path) -> anyhow::Result<Vec<PostCandidate>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let posts: Vec<PostInput> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of posts", path.display()))?;
    Ok(posts.into_iter().map(PostCandidate::from).collect())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn file_arg(args: &[String]) -> anyhow::Result<&Path> {
    match args.get(2) {
        Some(path) => Ok(Path::new(path)),
        None => bail!("missing <file>\n\n{USAGE}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let config = EnrichmentConfig::from_env().context("Invalid ENRICH_* configuration")?;

    match command {
        "config" => print_json(&config),
        "status" => {
            let clock: Arc<dyn Clock> = Arc::new(SystemClock);
            let store = store::open(&config.state, &config.timeouts).await?;
            let budget = BudgetTracker::new(
                Arc::clone(&store),
                Arc::clone(&clock),
                config.budget.clone(),
                config.timeouts.lock,
            );
            let breaker =
                CircuitBreaker::load(store, clock, config.breaker.clone(), config.timeouts.lock)
                    .await;

            print_json(&serde_json::json!({
                "enabled": config.enabled,
                "budget": budget.snapshot().await?,
                "breaker": breaker.status(),
            }))
        }
        "score" => {
            let candidates = read_candidates(file_arg(&args)?)?;
            let scoring = ScoringEvaluator::new(&config.scoring)?;
            let lines: Vec<ScoreLine> = candidates
                .iter()
                .map(|c| {
                    let score = scoring.score(c);
                    ScoreLine {
                        id: c.id.clone(),
                        score: score.score,
                        eligible: scoring.is_eligible(&score),
                        factors: score.factor_names(),
                    }
                })
                .collect();
            print_json(&lines)
        }
        "run" => {
            let candidates = read_candidates(file_arg(&args)?)?;
            let remote = Arc::new(RemoteEnrichment::from_env()?);

            eprintln!("digest-enrich v{}", env!("CARGO_PKG_VERSION"));
            eprintln!("   Candidates: {}", candidates.len());
            eprintln!(
                "   Daily limit: {} calls / {}",
                config.budget.daily_limit, config.budget.daily_cost_limit
            );
            info!(config = %serde_json::to_string(&config)?, "Effective configuration");

            let store = store::open(&config.state, &config.timeouts).await?;
            let provider: Arc<dyn EnrichmentProvider> = remote.clone();
            let summarizer: Arc<dyn Summarizer> = remote;
            let coordinator = EnrichmentCoordinator::new(
                &config,
                store,
                Arc::new(SystemClock),
                provider,
                Some(summarizer),
            )
            .await?;

            let results = coordinator.enrich_batch(&candidates).await;
            let status = coordinator.status().await;
            info!(status = %serde_json::to_string(&status)?, "Run complete");
            print_json(&results)
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }
}

// crates/demo/src/main.rs
//! jobtree demo binary.
//!
//! Builds a survey job tree, answers each question after a delay, polls for
//! elapsed deadlines on an interval, and prints the final snapshot as JSON.

mod survey;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use jobtree_core::{
    BehaviorRegistry, Clock, EngineConfig, JobSpec, JobState, JobTree, Request, SystemClock, TreeDriver,
};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use survey::{Question, Survey, QUESTION, SURVEY};

/// Environment variable holding the log filter.
const LOG_ENV: &str = "JOBTREE_LOG";
const DEFAULT_LOG_FILTER: &str = "warn,jobtree_core=info,jobtree_demo=info";

#[derive(Parser, Debug, Clone)]
#[command(name = "jobtree-demo", about = "Drive a sample survey job tree to completion")]
struct Args {
    /// Number of questions the survey asks
    #[arg(long, default_value_t = 3)]
    questions: u32,

    /// Index of a question that fails on start
    #[arg(long)]
    fail_question: Option<usize>,

    /// Keep the survey running when a question fails
    #[arg(long, default_value_t = false)]
    absorb_failures: bool,

    /// Delay before each question is answered; omit to leave questions unanswered
    #[arg(long)]
    answer_delay_ms: Option<u64>,

    /// Cancel the whole survey after this many milliseconds
    #[arg(long)]
    cancel_after_ms: Option<u64>,

    /// How often elapsed deadlines are checked
    #[arg(long, default_value_t = 250)]
    deadline_check_ms: u64,

    /// TOML engine configuration; falls back to JOBTREE_* environment variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

/// Logs the outcome of the survey request.
struct LoggedRequest;

impl Request for LoggedRequest {
    fn complete(&self, success: bool) {
        tracing::info!(success, "Survey request completed");
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            EngineConfig::from_toml_str(&text).with_context(|| format!("parsing config file {}", path.display()))
        }
        None => Ok(EngineConfig::from_env()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);
    let config = load_config(args.config.as_ref())?;
    tracing::debug!(?config, "Engine configuration loaded");

    let registry = Arc::new(
        BehaviorRegistry::new()
            .with(Survey {
                failing_question: args.fail_question,
                absorb_failures: args.absorb_failures,
            })
            .with(Question),
    );
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let spec = JobSpec::new(SURVEY).with_parameter("questions", i64::from(args.questions));
    let tree = JobTree::new(spec, Some(Arc::new(LoggedRequest)), clock.now());
    let root = tree.root_id();

    let driver = TreeDriver::new(tree, registry, clock, &config);
    let handle = driver.handle();
    let mut progress = driver.subscribe();
    let task = driver.spawn();

    if let Some(delay_ms) = args.answer_delay_ms {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut answered = HashSet::new();
            loop {
                match progress.recv().await {
                    Ok(p) if p.kind == QUESTION.as_str() && p.state == JobState::Runnable => {
                        if !answered.insert(p.job_id) {
                            continue;
                        }
                        let handle = handle.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                            let answer = serde_json::json!({ "answer": format!("answer to job {}", p.job_id) });
                            handle.respond(p.job_id, answer);
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Progress receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    if let Some(cancel_ms) = args.cancel_after_ms {
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(cancel_ms)).await;
            tracing::info!(job_id = %root, "Cancelling survey");
            handle.cancel(root);
        });
    }

    let ticker = {
        let handle = handle.clone();
        let period = Duration::from_millis(args.deadline_check_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if !handle.check_deadlines() {
                    break;
                }
            }
        })
    };

    let tree = task.await.context("tree driver task failed")?;
    ticker.abort();

    let root_node = tree.root();
    tracing::info!(
        job_id = %root_node.id(),
        state = %root_node.state(),
        elapsed_secs = root_node.elapsed_time(),
        jobs = tree.len(),
        "Survey finished"
    );
    let snapshot = tree.snapshot(chrono::Utc::now());
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

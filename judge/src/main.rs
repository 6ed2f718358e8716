use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use judge::languages::LanguageRegistry;
use judge::model::JudgeResult;
use judge::runner::SandboxedRunner;
use judge::sandbox::{self, SandboxPolicy};
use judge::{JudgeCallback, JudgeConfig, JudgeContext, JudgeManager, JudgeTask};

/// One line of output per submission
#[derive(Debug, Serialize)]
struct ResultLine<'a> {
    submission_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a JudgeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn print_result(line: &ResultLine<'_>) {
    match serde_json::to_string(line) {
        Ok(json) => {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = writeln!(stdout, "{}", json).and_then(|_| stdout.flush()) {
                error!("Failed to write result of {}: {}", line.submission_id, e);
            }
        }
        Err(e) => error!("Failed to serialize result of {}: {}", line.submission_id, e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("judge=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = JudgeConfig::load().context("Failed to load judge configuration")?;
    info!("Starting judge with {:?}", config);

    // Fail fast without cgroup v2 cpu + memory controllers
    sandbox::ensure_available(&config.sandbox.cgroup_root)?;
    info!(
        "Confirmed cgroup v2 support at {:?}",
        config.sandbox.cgroup_root
    );

    let policy = SandboxPolicy::load(config.seccomp_policy.as_deref())?;
    let languages = LanguageRegistry::load(config.languages.as_deref())?;

    let context = JudgeContext {
        runner: Arc::new(SandboxedRunner::new(policy, config.sandbox.clone())),
        languages: Arc::new(languages),
        work_root: config.work_root.clone(),
        compile_timeout: config.compile_timeout(),
        compile_user: Some((config.sandbox.uid, config.sandbox.gid)),
    };

    let callback: JudgeCallback = Arc::new(|submission_id, outcome| match outcome {
        Ok(result) => {
            info!("{}", result);
            print_result(&ResultLine {
                submission_id,
                result: Some(&result),
                error: None,
            });
        }
        Err(e) => print_result(&ResultLine {
            submission_id,
            result: None,
            error: Some(e.to_string()),
        }),
    });

    let manager = JudgeManager::start(
        context,
        config.workers,
        config.queue_capacity,
        callback,
    );

    info!("Waiting for jobs on stdin...");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JudgeTask>(&line) {
            Ok(task) => {
                info!(
                    "Received judge job: submission_id={}, language={}",
                    task.submission.submission_id, task.submission.language_id
                );
                manager.submit(task).await?;
            }
            Err(e) => warn!("Skipping malformed job: {}", e),
        }
    }

    info!("Input closed, waiting for running submissions");
    manager.shutdown().await;
    Ok(())
}

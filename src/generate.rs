//! Initial code generation with bounded parallelism.
//!
//! One task per file path, at most `concurrency` of them waiting on the
//! oracle at any moment. Tasks only own clones of their inputs; the map is
//! assembled after each task joins, so no shared state is mutated while
//! generation is in flight.

use crate::error::{DevloopError, Result};
use crate::oracle::Oracle;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

fn progress_bar(total: usize) -> ProgressBar {
    let bar = ProgressBar::new(total as u64);
    let style = ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style.progress_chars("=> "));
    bar
}

/// Generate content for every path in `paths`.
///
/// Returns exactly one entry per path. The first failure aborts every
/// task still pending and is returned unchanged.
///
/// # Errors
///
/// Returns the oracle error of the first failed task, or `GenerationFailed`
/// if a task panicked.
pub async fn generate_files(
    oracle: Arc<dyn Oracle>,
    prompt: &str,
    plan: &str,
    paths: &[String],
    concurrency: usize,
) -> Result<BTreeMap<String, String>> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let prompt: Arc<str> = Arc::from(prompt);
    let plan: Arc<str> = Arc::from(plan);
    let progress = progress_bar(paths.len());

    let mut tasks = JoinSet::new();
    for path in paths {
        let oracle = Arc::clone(&oracle);
        let semaphore = Arc::clone(&semaphore);
        let prompt = Arc::clone(&prompt);
        let plan = Arc::clone(&plan);
        let path = path.clone();

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.map_err(|e| {
                DevloopError::GenerationFailed {
                    file_path: path.clone(),
                    message: e.to_string(),
                }
            })?;
            debug!("Generating {}", path);
            let content = oracle.generate_code(&prompt, &plan, &path).await?;
            Ok::<_, DevloopError>((path, content))
        });
    }

    let mut code = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| DevloopError::GenerationFailed {
            file_path: "(unknown)".to_string(),
            message: e.to_string(),
        });
        match outcome.and_then(|result| result) {
            Ok((path, content)) => {
                progress.set_message(path.clone());
                progress.inc(1);
                code.insert(path, content);
            }
            Err(err) => {
                tasks.abort_all();
                progress.abandon();
                return Err(err);
            }
        }
    }

    progress.finish_and_clear();
    Ok(code)
}

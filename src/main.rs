use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use graphline::config::Config;
use graphline::graph::GraphClient;
use graphline::llm::{EmbeddingClient, LlmClient};
use graphline::pipeline::{AnalysisRun, EventSink, PipelineController};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    // Progress events go to stdout; logs go to stderr and, when
    // configured, a daily-rolling file.
    let _guard;
    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("graphline.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _guard = guard;
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    tracing::info!("Graphline starting up");

    let config = Arc::new(config);
    let graph = Arc::new(GraphClient::new(
        &config.graph.uri,
        &config.graph.user,
        &config.graph.password,
        &config.graph.database,
    ));
    let llm = Arc::new(LlmClient::new(
        &config.llm.api_base,
        &config.llm.api_key,
        &config.llm.model,
        config.llm.max_tokens,
        config.llm.temperature,
        config.llm.timeout_secs,
        config.audit_log_path(),
    ));
    let embeddings = Arc::new(EmbeddingClient::new(
        &config.embedding.api_base,
        &config.embedding.api_key,
        &config.embedding.model,
        config.embedding.dimension,
    ));
    let control = Arc::new(PipelineController::new());
    let (events, mut event_rx) = EventSink::new();

    let run = Arc::new(AnalysisRun::new(
        Arc::clone(&config),
        graph,
        llm,
        embeddings,
        Arc::clone(&control),
        events,
    ));

    let files = run.discover_source_files()?;
    tracing::info!("Discovered {} source files under {}", files.len(), config.src_dir().display());

    // Ctrl-C maps onto the controller's stop; the pipeline winds down at
    // the next batch boundary.
    {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping pipeline");
                control.stop();
            }
        });
    }

    let runner = tokio::spawn(async move { run.run(files).await });
    // The runner task owns the last event sender; the stream below ends
    // when the run finishes and drops it.

    // NDJSON event stream on stdout
    use tokio::io::AsyncWriteExt;
    let mut stdout = tokio::io::stdout();
    while let Some(event) = event_rx.recv().await {
        stdout.write_all(event.to_ndjson().as_bytes()).await?;
        stdout.flush().await?;
    }

    match runner.await? {
        Ok(()) => {
            tracing::info!("Analysis run finished");
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            tracing::warn!("Analysis run stopped");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

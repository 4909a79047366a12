//! DeskQuery — natural-language request orchestrator for desk booking analytics.
//!
//! The hosting service supplies the analytic operations (an
//! [`agent_core::OperationRegistry`]), an optional renderer
//! ([`agent_core::Visualizer`]) and the dataset handle; this crate turns each
//! user message into a classified, parameterized and executed action.

pub mod agent_core;
pub mod inference;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use agent_core::{
    AgentDatabase, ConversationManager, OperationRegistry, Orchestrator, OrchestratorContext,
    Visualizer,
};
use inference::config::{find_config_path, load_models_config};
use inference::{InferenceClient, ModelsConfig};

/// Return the platform-standard data directory for DeskQuery.
///
/// - macOS: `~/Library/Application Support/com.deskquery.app/`
/// - Windows: `{FOLDERID_RoamingAppData}\com.deskquery.app\`
/// - Linux: `$XDG_DATA_HOME/com.deskquery.app/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.deskquery/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("com.deskquery.app");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".deskquery")
}

/// Initialize the tracing subscriber, writing logs to the data directory.
///
/// Rotates existing logs (deskquery.log → .1 → .2 → .3), opens a fresh log
/// through a line-flushing writer and logs a startup banner. Set
/// `DESKQUERY_LOG_FORMAT=json` for one JSON object per line.
pub fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = data_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create {}", log_dir.display()))?;

    let log_path = log_dir.join("deskquery.log");
    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open {}", log_path.display()))?;
    let writer = FlushingWriter::new(log_file);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("deskquery=info,warn"));

    let json = std::env::var("DESKQUERY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== DeskQuery starting ==="
    );
    Ok(())
}

/// Rotate log files: `deskquery.log` → `deskquery.log.1` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Keeps each log line on disk even if the host process dies mid-request.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Resolve the path for the conversation database, creating its directory.
pub fn resolve_db_path() -> PathBuf {
    let dir = data_dir();
    if !dir.exists() {
        let _ = std::fs::create_dir_all(&dir);
    }
    dir.join("deskquery.db")
}

/// Build an orchestrator from `_models/config.yaml` and the default database.
pub fn bootstrap(
    registry: OperationRegistry,
    visualizer: Option<Arc<dyn Visualizer>>,
) -> anyhow::Result<Orchestrator> {
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let config_path = find_config_path(&cwd)?;
    let config = load_models_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    tracing::info!(config = %config_path.display(), "models config loaded");

    bootstrap_with(config, &resolve_db_path(), registry, visualizer)
}

/// Build an orchestrator from an already-loaded config and an explicit
/// database path (`":memory:"` works).
pub fn bootstrap_with(
    config: ModelsConfig,
    db_path: &Path,
    registry: OperationRegistry,
    visualizer: Option<Arc<dyn Visualizer>>,
) -> anyhow::Result<Orchestrator> {
    let orchestrator_config = config.orchestrator.clone();
    let client = InferenceClient::from_config(config).context("failed to build inference client")?;

    let db_path_str = db_path.to_string_lossy();
    let db = AgentDatabase::open(&db_path_str)
        .with_context(|| format!("failed to open database at {db_path_str}"))?;

    if registry.is_empty() {
        tracing::warn!("operation registry is empty; every request will end in no_match");
    }
    tracing::info!(
        model = client.current_model_name(),
        operations = registry.len(),
        visualizer = visualizer.is_some(),
        db = %db_path_str,
        "orchestrator ready"
    );

    let ctx = OrchestratorContext {
        oracle: Arc::new(client),
        registry: Arc::new(registry),
        visualizer,
        config: orchestrator_config,
    };
    Ok(Orchestrator::new(ctx, Box::new(ConversationManager::new(db))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use inference::config::parse_models_config;

    #[test]
    fn rotation_keeps_the_last_three() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("deskquery.log");
        for generation in 0..5 {
            std::fs::write(&log, format!("run {generation}")).unwrap();
            rotate_log_file(&log, 3);
        }
        assert!(!log.exists());
        let read = |suffix: u32| std::fs::read_to_string(format!("{}.{suffix}", log.display())).unwrap();
        assert_eq!(read(1), "run 4");
        assert_eq!(read(2), "run 3");
        assert_eq!(read(3), "run 2");
        assert!(!dir.path().join("deskquery.log.4").exists());
    }

    #[test]
    fn bootstrap_with_an_on_disk_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_models_config(
            r#"
            active_model: local
            models:
              local:
                display_name: "Local"
                base_url: "http://127.0.0.1:1/v1"
            orchestrator:
              retry_budget: 3
            "#,
        )
        .unwrap();

        let orch = bootstrap_with(config, &dir.path().join("dq.db"), OperationRegistry::new(), None).unwrap();
        assert_eq!(orch.context().config.retry_budget, 3);
        assert_eq!(orch.context().config.discard_budget, 5);
        let id = orch.new_conversation().unwrap();
        assert_eq!(orch.list_conversations().unwrap()[0].id, id);
    }
}

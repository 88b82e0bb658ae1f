// Stream registry: the explicit owner of every live pipeline.
//
// Pipelines are reachable only through this map; nothing hangs off ambient
// globals. Removing an entry and letting the Arc drop is the ownership story
// for a stream's entire resource tree.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use colored::*;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::StreamConfig;
use crate::error::AudioError;

use super::effects::PluginRegistry;
use super::monitor::MonitorRouter;
use super::pipeline::StreamPipeline;
use super::types::StreamStatus;

/// Owns all stream pipelines plus the process-wide shared pieces: the plugin
/// registry and the single monitor output router.
pub struct StreamRegistry {
    streams: Mutex<HashMap<String, Arc<StreamPipeline>>>,
    plugins: Arc<PluginRegistry>,
    monitor: Arc<MonitorRouter>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            plugins: Arc::new(PluginRegistry::with_builtins()),
            monitor: Arc::new(MonitorRouter::new()),
        }
    }

    /// Registry built around a caller-provided plugin registry, for hosts
    /// that register plugins beyond the builtins.
    pub fn with_plugins(plugins: PluginRegistry) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            plugins: Arc::new(plugins),
            monitor: Arc::new(MonitorRouter::new()),
        }
    }

    pub fn monitor(&self) -> Arc<MonitorRouter> {
        Arc::clone(&self.monitor)
    }

    /// Create and register a pipeline for `config`. The stream starts in the
    /// stopped state; call `start()` on the returned handle.
    pub async fn create_stream(
        &self,
        config: StreamConfig,
    ) -> Result<Arc<StreamPipeline>, AudioError> {
        let mut streams = self.streams.lock().await;
        if streams.contains_key(&config.id) {
            return Err(AudioError::Config(format!(
                "stream id {} already registered",
                config.id
            )));
        }

        let id = config.id.clone();
        let pipeline = Arc::new(StreamPipeline::new(
            config,
            Arc::clone(&self.plugins),
            Arc::clone(&self.monitor),
        ));
        streams.insert(id.clone(), Arc::clone(&pipeline));
        info!(
            "{}: registered stream {} ({} total)",
            "REGISTRY".cyan(),
            id,
            streams.len()
        );
        Ok(pipeline)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<StreamPipeline>> {
        self.streams.lock().await.get(id).cloned()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.streams.lock().await.keys().cloned().collect()
    }

    pub async fn statuses(&self) -> Vec<StreamStatus> {
        let streams = self.streams.lock().await;
        streams.values().map(|pipeline| pipeline.status()).collect()
    }

    /// Stop and unregister one stream. Deselects it from the monitor if it
    /// was the monitored stream.
    pub async fn remove_stream(&self, id: &str) -> Result<()> {
        let pipeline = self.streams.lock().await.remove(id);
        let Some(pipeline) = pipeline else {
            warn!("{}: remove of unknown stream {}", "REGISTRY".cyan(), id);
            return Ok(());
        };

        if self.monitor.selected().as_deref() == Some(id) {
            self.monitor.select(None);
        }

        pipeline.stop().await?;
        info!("{}: removed stream {}", "REGISTRY".cyan(), id);
        Ok(())
    }

    /// Stop every stream, in registration-map order. Used on shutdown; each
    /// stream's failure is logged and the loop continues.
    pub async fn stop_all(&self) {
        let pipelines: Vec<Arc<StreamPipeline>> = {
            let streams = self.streams.lock().await;
            streams.values().cloned().collect()
        };

        info!(
            "{}: stopping all streams ({})",
            "REGISTRY".cyan(),
            pipelines.len()
        );
        for pipeline in pipelines {
            if let Err(e) = pipeline.stop().await {
                error!(
                    "{}: stream {} failed to stop cleanly: {}",
                    "REGISTRY".cyan(),
                    pipeline.id(),
                    e
                );
            }
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-resort shutdown guard.
///
/// Armed at the start of shutdown; if the graceful path (stop_all + drop)
/// has not finished within the grace period the process is terminated, so a
/// wedged encoder or an unjoinable thread can never hang shutdown forever.
/// Disarm by dropping the watchdog once graceful shutdown completes.
pub struct ShutdownWatchdog {
    armed: Arc<std::sync::atomic::AtomicBool>,
}

impl ShutdownWatchdog {
    pub fn arm(grace: Duration) -> Self {
        let armed = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let flag = Arc::clone(&armed);
        std::thread::Builder::new()
            .name("shutdown-watchdog".to_string())
            .spawn(move || {
                std::thread::sleep(grace);
                if flag.load(std::sync::atomic::Ordering::SeqCst) {
                    error!(
                        "{}: graceful shutdown exceeded {:?}, forcing exit",
                        "WATCHDOG".red(),
                        grace
                    );
                    std::process::exit(1);
                }
            })
            .ok();
        Self { armed }
    }
}

impl Drop for ShutdownWatchdog {
    fn drop(&mut self) {
        self.armed
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureConfig;

    fn manual_config(id: &str) -> StreamConfig {
        StreamConfig {
            id: id.to_string(),
            name: format!("stream {}", id),
            capture: CaptureConfig::Manual {
                sample_rate: 48000,
                channels: 2,
            },
            effects: Vec::new(),
            renditions: Vec::new(),
            smoothing: None,
            output_dir: std::env::temp_dir().join("aircast-registry-test"),
            encoder_binary: "ffmpeg".into(),
            monitor_enabled: false,
        }
    }

    #[tokio::test]
    async fn duplicate_stream_ids_are_rejected() {
        let registry = StreamRegistry::new();
        registry.create_stream(manual_config("s1")).await.unwrap();
        let err = registry.create_stream(manual_config("s1")).await;
        assert!(matches!(err, Err(AudioError::Config(_))));
    }

    #[tokio::test]
    async fn remove_deselects_the_monitored_stream() {
        let registry = StreamRegistry::new();
        registry.create_stream(manual_config("s1")).await.unwrap();
        registry.monitor().select(Some("s1".to_string()));

        registry.remove_stream("s1").await.unwrap();
        assert_eq!(registry.monitor().selected(), None);
        assert!(registry.get("s1").await.is_none());
    }

    #[tokio::test]
    async fn removing_an_unknown_stream_is_not_an_error() {
        let registry = StreamRegistry::new();
        registry.remove_stream("ghost").await.unwrap();
    }

    #[test]
    fn disarmed_watchdog_does_not_kill_the_process() {
        let watchdog = ShutdownWatchdog::arm(Duration::from_millis(50));
        drop(watchdog);
        std::thread::sleep(Duration::from_millis(120));
        // Still alive: the disarm flag was observed.
    }
}

// Stream pipeline orchestrator.
//
// Wires one capture source through the effect chain and the optional
// rate-smoothing buffer into the fan-out: encoder sinks, pre/post ring
// buffers, visualization taps, and the shared monitor output. Owns the
// stream state machine and error aggregation.
//
// Flow per delivered block: the raw input is snapshotted first (pre ring +
// pre taps always reflect true input regardless of downstream failures),
// then the effect chain runs, then the result fans out, converted once to
// PCM16 for every sink.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::*;
use crossbeam::channel::Sender;
use tracing::{error, info, warn};

use crate::config::StreamConfig;
use crate::error::AudioError;

use super::capture::{build_capture_source, CaptureSource, ManualFeed};
use super::effects::{ChainCommand, EffectChain, PluginRegistry};
use super::encoder::{write_master_manifest, EncoderSink};
use super::monitor::MonitorRouter;
use super::pcm;
use super::ring_buffer::RingAudioBuffer;
use super::smoothing::RateSmoothingBuffer;
use super::taps::{BlockCallback, TapId, TapRegistry};
use super::types::{AudioBlock, SinkStatus, StreamState, StreamStatus, WaveFormat};

/// Seconds of recent audio kept in each visualization ring buffer.
const RING_SECONDS: usize = 2;
/// Block-size hint handed to plugins at initialization; actual blocks may be
/// larger, scratch buffers grow as needed.
const MAX_BLOCK_FRAMES_HINT: usize = 4096;

struct PipelineShared {
    stream_id: String,
    stream_name: String,
    wave_format: WaveFormat,
    state: Mutex<StreamState>,
    pre_ring: RingAudioBuffer,
    post_ring: RingAudioBuffer,
    pre_taps: TapRegistry,
    post_taps: TapRegistry,
    chain: Mutex<EffectChain>,
    chain_commands: Mutex<Option<Sender<ChainCommand>>>,
    smoothing: Option<RateSmoothingBuffer>,
    sinks: Mutex<Vec<EncoderSink>>,
    capture: Mutex<Option<Box<dyn CaptureSource>>>,
    monitor: Arc<MonitorRouter>,
    monitor_enabled: bool,
    last_error: Mutex<Option<String>>,
    diagnostics: Mutex<HashMap<String, String>>,
    exited_sinks: AtomicUsize,
    total_sinks: AtomicUsize,
}

/// One live stream: capture, effects, smoothing, and encoder fan-out.
pub struct StreamPipeline {
    config: StreamConfig,
    plugins: Arc<PluginRegistry>,
    shared: Arc<PipelineShared>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    manual_feed: Mutex<Option<ManualFeed>>,
}

impl StreamPipeline {
    /// Build a pipeline around an immutable configuration snapshot. The
    /// rate-smoothing decision is made here, once; it cannot change while
    /// running.
    pub fn new(
        config: StreamConfig,
        plugins: Arc<PluginRegistry>,
        monitor: Arc<MonitorRouter>,
    ) -> Self {
        let wave_format = config.capture.wave_format();
        let ring_capacity = wave_format.samples_per_second() * RING_SECONDS;

        let smoothing = config.smoothing.as_ref().map(|smoothing_config| {
            RateSmoothingBuffer::new(
                smoothing_config,
                wave_format.sample_rate,
                wave_format.channels,
            )
        });

        let shared = Arc::new(PipelineShared {
            stream_id: config.id.clone(),
            stream_name: config.name.clone(),
            wave_format,
            state: Mutex::new(StreamState::Stopped),
            pre_ring: RingAudioBuffer::new(ring_capacity),
            post_ring: RingAudioBuffer::new(ring_capacity),
            pre_taps: TapRegistry::new(),
            post_taps: TapRegistry::new(),
            chain: Mutex::new(EffectChain::new(
                wave_format.sample_rate,
                wave_format.channels,
            )),
            chain_commands: Mutex::new(None),
            smoothing,
            sinks: Mutex::new(Vec::new()),
            capture: Mutex::new(None),
            monitor,
            monitor_enabled: config.monitor_enabled,
            last_error: Mutex::new(None),
            diagnostics: Mutex::new(HashMap::new()),
            exited_sinks: AtomicUsize::new(0),
            total_sinks: AtomicUsize::new(0),
        });

        // The smoothing listener is registered once for the pipeline's
        // lifetime; it holds a weak reference to avoid a retain cycle with
        // the buffer it is registered on.
        if let Some(smoothing) = &shared.smoothing {
            let weak = Arc::downgrade(&shared);
            smoothing.on_chunk(Arc::new(move |chunk| {
                if let Some(shared) = weak.upgrade() {
                    PipelineShared::fan_out(&shared, chunk);
                }
            }));
        }

        Self {
            config,
            plugins,
            shared,
            started_at: Mutex::new(None),
            manual_feed: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock().unwrap()
    }

    /// Start the stream: capture source, effect chain, encoder sinks, master
    /// manifest, in that order of construction. Calling `start` on a running
    /// stream is a no-op that returns the current status.
    pub async fn start(&self) -> Result<StreamStatus, AudioError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            match *state {
                StreamState::Running | StreamState::Starting => {
                    info!(
                        "{}: stream {} already {}, start is a no-op",
                        "PIPELINE".green(),
                        self.config.id,
                        *state
                    );
                    drop(state);
                    return Ok(self.status());
                }
                StreamState::Stopping => {
                    return Err(AudioError::InvalidState {
                        expected: "stopped".to_string(),
                        found: "stopping".to_string(),
                    });
                }
                StreamState::Stopped | StreamState::Failed => *state = StreamState::Starting,
            }
        }

        info!(
            "{}: starting stream {} (\"{}\") with {} renditions",
            "PIPELINE".green(),
            self.config.id,
            self.config.name,
            self.config.renditions.len()
        );

        *self.shared.last_error.lock().unwrap() = None;
        self.shared.diagnostics.lock().unwrap().clear();
        self.shared.exited_sinks.store(0, Ordering::SeqCst);

        // Effect chain: missing plugins and bad presets degrade, they never
        // prevent the stream from starting.
        {
            let mut chain = EffectChain::new(
                self.shared.wave_format.sample_rate,
                self.shared.wave_format.channels,
            );
            chain.load(&self.plugins, &self.config.effects, MAX_BLOCK_FRAMES_HINT);
            let sender = chain.command_sender();
            *self.shared.chain.lock().unwrap() = chain;
            *self.shared.chain_commands.lock().unwrap() = Some(sender);
        }

        // Encoder sinks: one failure is fatal for this stream, but already
        // spawned siblings are shut down cleanly first.
        let mut sinks = Vec::with_capacity(self.config.renditions.len());
        for rendition in &self.config.renditions {
            let exit_weak = Arc::downgrade(&self.shared);
            let diag_weak = Arc::downgrade(&self.shared);

            let spawned = EncoderSink::spawn(
                rendition.clone(),
                &self.shared.wave_format,
                &self.config.output_dir,
                &self.config.encoder_binary,
                Some(Arc::new(move |name: &str, line: &str| {
                    if let Some(shared) = diag_weak.upgrade() {
                        shared
                            .diagnostics
                            .lock()
                            .unwrap()
                            .insert(name.to_string(), line.to_string());
                    }
                })),
                Some(Arc::new(move |name: &str| {
                    if let Some(shared) = exit_weak.upgrade() {
                        PipelineShared::on_sink_exited(&shared, name);
                    }
                })),
            );

            match spawned {
                Ok(sink) => sinks.push(sink),
                Err(e) => {
                    error!(
                        "{}: rendition {} failed to spawn: {}",
                        "PIPELINE".green(),
                        rendition.name,
                        e
                    );
                    for mut sink in sinks {
                        sink.stop();
                    }
                    self.fail(format!("rendition {} failed: {}", rendition.name, e));
                    return Err(e);
                }
            }
        }
        self.shared.total_sinks.store(sinks.len(), Ordering::SeqCst);
        *self.shared.sinks.lock().unwrap() = sinks;

        // The master manifest must exist before any rendition's segments can
        // be requested.
        if let Err(e) =
            write_master_manifest(&self.config.output_dir, &self.config.renditions).await
        {
            self.stop_all_sinks();
            self.fail(format!("failed to write master manifest: {}", e));
            return Err(AudioError::Sink(e.to_string()));
        }

        // Capture last: once it starts, blocks flow.
        let (mut capture, feed) = match build_capture_source(&self.config.capture) {
            Ok(built) => built,
            Err(e) => {
                self.stop_all_sinks();
                self.fail(format!("capture construction failed: {}", e));
                return Err(e);
            }
        };

        let block_weak = Arc::downgrade(&self.shared);
        capture.on_block(Arc::new(move |block| {
            if let Some(shared) = block_weak.upgrade() {
                PipelineShared::handle_block(&shared, block);
            }
        }));

        let error_weak = Arc::downgrade(&self.shared);
        capture.on_error(Arc::new(move |err| {
            if let Some(shared) = error_weak.upgrade() {
                error!("{}: terminal capture error: {}", "PIPELINE".green(), err);
                *shared.last_error.lock().unwrap() = Some(err.to_string());
                // Teardown joins capture/sink threads, so it runs on its own
                // thread rather than on whichever backend thread reported
                // the error.
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || PipelineShared::teardown(&shared));
            }
        }));

        if let Err(e) = capture.start() {
            self.stop_all_sinks();
            self.fail(format!("capture failed to start: {}", e));
            return Err(e);
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != StreamState::Starting {
                // Teardown won a race during startup (terminal capture error
                // or a concurrent stop) and the settled state must not be
                // overwritten with Running. Sinks stored above may have been
                // missed by that teardown; stop them before reporting.
                let found = state.to_string();
                drop(state);
                self.stop_all_sinks();
                warn!(
                    "{}: stream {} torn down mid-start ({}), reporting failed start",
                    "PIPELINE".green(),
                    self.config.id,
                    self.shared
                        .last_error
                        .lock()
                        .unwrap()
                        .as_deref()
                        .unwrap_or("stopped concurrently")
                );
                return Err(AudioError::InvalidState {
                    expected: "starting".to_string(),
                    found,
                });
            }
            *self.shared.capture.lock().unwrap() = Some(capture);
            *state = StreamState::Running;
        }
        *self.manual_feed.lock().unwrap() = feed;
        *self.started_at.lock().unwrap() = Some(Utc::now());

        // Sinks that died while we were still starting were counted but could
        // not trigger teardown; settle that now.
        let exited = self.shared.exited_sinks.load(Ordering::SeqCst);
        let total = self.shared.total_sinks.load(Ordering::SeqCst);
        if total > 0 && exited >= total {
            *self.shared.last_error.lock().unwrap() =
                Some("all encoder sinks exited".to_string());
            let shared = Arc::clone(&self.shared);
            std::thread::spawn(move || PipelineShared::teardown(&shared));
        }

        info!(
            "{}: stream {} running",
            "PIPELINE".green(),
            self.config.id
        );
        Ok(self.status())
    }

    /// Stop the stream: capture first (no new blocks), then sinks with
    /// drain, then the effect chain and buffers. Idempotent and safe to call
    /// concurrently from multiple triggers.
    pub async fn stop(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || PipelineShared::teardown(&shared)).await?;
        Ok(())
    }

    pub fn status(&self) -> StreamStatus {
        let state = self.state();
        let started_at = *self.started_at.lock().unwrap();
        let uptime_seconds = match (state, started_at) {
            (StreamState::Running, Some(started)) => {
                (Utc::now() - started).num_seconds().max(0) as u64
            }
            _ => 0,
        };

        let diagnostics = self.shared.diagnostics.lock().unwrap();
        let sinks = self
            .shared
            .sinks
            .lock()
            .unwrap()
            .iter()
            .map(|sink| SinkStatus {
                rendition: sink.rendition().name.clone(),
                state: sink.state(),
                blocks_written: sink.blocks_written(),
                blocks_dropped: sink.blocks_dropped(),
                last_diagnostic: diagnostics.get(&sink.rendition().name).cloned(),
            })
            .collect();

        StreamStatus {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            state,
            started_at,
            uptime_seconds,
            sinks,
            smoothing_fill_percent: self.shared.smoothing.as_ref().map(|s| s.fill_level()),
            last_error: self.shared.last_error.lock().unwrap().clone(),
        }
    }

    /// Toggle bypass for the chain entry at `index`; applied between blocks,
    /// never mid-block.
    pub fn set_effect_bypassed(&self, index: usize, bypassed: bool) -> Result<(), AudioError> {
        self.send_chain_command(ChainCommand::SetBypassed { index, bypassed })
    }

    pub fn set_effect_preset(&self, index: usize, preset: Vec<u8>) -> Result<(), AudioError> {
        self.send_chain_command(ChainCommand::SetPreset { index, preset })
    }

    fn send_chain_command(&self, command: ChainCommand) -> Result<(), AudioError> {
        let guard = self.shared.chain_commands.lock().unwrap();
        match guard.as_ref() {
            Some(sender) => sender
                .send(command)
                .map_err(|_| AudioError::InvalidState {
                    expected: "running".to_string(),
                    found: self.state().to_string(),
                }),
            None => Err(AudioError::InvalidState {
                expected: "running".to_string(),
                found: self.state().to_string(),
            }),
        }
    }

    /// Subscribe to raw pre-effect blocks (true input).
    pub fn subscribe_input_tap(&self, callback: BlockCallback) -> TapId {
        self.shared.pre_taps.subscribe(callback)
    }

    /// Subscribe to processed post-effect blocks.
    pub fn subscribe_output_tap(&self, callback: BlockCallback) -> TapId {
        self.shared.post_taps.subscribe(callback)
    }

    pub fn unsubscribe_input_tap(&self, id: TapId) -> bool {
        self.shared.pre_taps.unsubscribe(id)
    }

    pub fn unsubscribe_output_tap(&self, id: TapId) -> bool {
        self.shared.post_taps.unsubscribe(id)
    }

    /// Most recent raw input samples, for oscilloscope-style polling.
    pub fn recent_input(&self, count: usize) -> Vec<f32> {
        self.shared.pre_ring.read_latest(count)
    }

    /// Most recent processed samples.
    pub fn recent_output(&self, count: usize) -> Vec<f32> {
        self.shared.post_ring.read_latest(count)
    }

    /// Push handle when the stream uses a manual capture source; `None` for
    /// hardware capture. Available after `start()`.
    pub fn manual_feed(&self) -> Option<ManualFeed> {
        self.manual_feed.lock().unwrap().clone()
    }

    pub fn wave_format(&self) -> WaveFormat {
        self.shared.wave_format
    }

    fn fail(&self, message: String) {
        error!("{}: stream {}: {}", "PIPELINE".green(), self.config.id, message);
        *self.shared.last_error.lock().unwrap() = Some(message);
        *self.shared.state.lock().unwrap() = StreamState::Failed;
    }

    fn stop_all_sinks(&self) {
        let mut sinks = self.shared.sinks.lock().unwrap();
        for sink in sinks.iter_mut() {
            sink.stop();
        }
        sinks.clear();
    }
}

impl PipelineShared {
    /// Per-block hot path, called on the capture backend's thread.
    fn handle_block(shared: &Arc<Self>, block: AudioBlock) {
        if *shared.state.lock().unwrap() != StreamState::Running {
            return;
        }

        // Raw input snapshot first: visualization always reflects true input
        // even if everything downstream is failing.
        shared.pre_ring.write(&block.samples);
        shared.pre_taps.notify(&block);

        let processed = {
            let mut chain = shared.chain.lock().unwrap();
            chain.process_block(&block.samples).to_vec()
        };

        match &shared.smoothing {
            Some(smoothing) => smoothing.write(&processed),
            None => Self::fan_out(shared, &processed),
        }
    }

    /// Distribute one processed block: PCM16 once for all sinks, post ring,
    /// output taps, and the monitor if this stream is the selected one.
    fn fan_out(shared: &Arc<Self>, samples: &[f32]) {
        let pcm16 = pcm::float_to_pcm16(samples);

        {
            let sinks = shared.sinks.lock().unwrap();
            for sink in sinks.iter() {
                sink.write_audio_data(pcm16.clone());
            }
        }

        shared.post_ring.write(samples);
        shared
            .post_taps
            .notify(&AudioBlock::new(samples.to_vec(), shared.wave_format.channels));

        if shared.monitor_enabled {
            shared.monitor.write_for(&shared.stream_id, &pcm16);
        }
    }

    fn on_sink_exited(shared: &Arc<Self>, name: &str) {
        let exited = shared.exited_sinks.fetch_add(1, Ordering::SeqCst) + 1;
        let total = shared.total_sinks.load(Ordering::SeqCst);

        if *shared.state.lock().unwrap() != StreamState::Running {
            return;
        }

        warn!(
            "{}: sink {} exited ({}/{})",
            "PIPELINE".green(),
            name,
            exited,
            total
        );

        if total > 0 && exited >= total {
            *shared.last_error.lock().unwrap() =
                Some("all encoder sinks exited".to_string());
            // Teardown joins the sink's own watcher thread; never run it on
            // the thread that delivered this notification.
            let shared = Arc::clone(shared);
            std::thread::spawn(move || Self::teardown(&shared));
        }
    }

    /// Shared teardown used by user stop, capture failure, and the
    /// all-sinks-exited signal. First caller wins; every later or concurrent
    /// trigger is a no-op. Each cleanup step is isolated so one failing step
    /// never prevents the others.
    fn teardown(shared: &Arc<Self>) {
        {
            let mut state = shared.state.lock().unwrap();
            match *state {
                StreamState::Stopped | StreamState::Stopping => return,
                _ => *state = StreamState::Stopping,
            }
        }

        info!("{}: stopping stream {}", "PIPELINE".green(), shared.stream_id);

        // 1. Capture: no new blocks enter the pipeline.
        if let Some(mut capture) = shared.capture.lock().unwrap().take() {
            if let Err(e) = capture.stop() {
                warn!(
                    "{}: capture stop failed during teardown: {}",
                    "PIPELINE".green(),
                    e
                );
            }
        }

        // 2. Sinks: drain queues, close stdin, bounded wait, force kill.
        {
            let mut sinks = shared.sinks.lock().unwrap();
            for sink in sinks.iter_mut() {
                sink.stop();
            }
            sinks.clear();
        }

        // 3. Effect chain and buffers.
        shared.chain.lock().unwrap().release();
        *shared.chain_commands.lock().unwrap() = None;
        if let Some(smoothing) = &shared.smoothing {
            smoothing.clear();
        }
        shared.pre_ring.clear();
        shared.post_ring.clear();

        *shared.state.lock().unwrap() = StreamState::Stopped;
        info!("{}: stream {} stopped", "PIPELINE".green(), shared.stream_id);
    }
}

//! Pipeline runtime
//!
//! Owns one live media graph. A dedicated task serializes all mutation
//! through a command channel; observers read lock-free snapshots. The
//! runtime classifies bus messages into transient noise and fatal errors,
//! and never retries on its own — retry policy belongs to the supervisors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use gstreamer as gst;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AppError, Result};

use super::description::{PipelineDescription, PipelineKind, PropertyValue};

/// Observable pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Null,
    Ready,
    Paused,
    Playing,
    Error,
}

/// Value-copy snapshot of a pipeline instance
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSnapshot {
    pub state: PipelineState,
    pub error: Option<String>,
    pub uptime_secs: Option<u64>,
    pub bytes_produced: Option<u64>,
    pub frames_encoded: Option<u64>,
}

impl Default for PipelineSnapshot {
    fn default() -> Self {
        Self {
            state: PipelineState::Null,
            error: None,
            uptime_secs: None,
            bytes_produced: None,
            frames_encoded: None,
        }
    }
}

/// Classified bus event, drained by supervisors
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    FatalError {
        message: String,
        source: Option<String>,
    },
    Warning {
        message: String,
    },
    Eos,
}

enum Command {
    Start {
        deadline: Duration,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running pipeline task
///
/// Cloneable; all clones drive the same instance. Dropping every clone stops
/// the pipeline and releases the hardware.
#[derive(Clone)]
pub struct PipelineHandle {
    name: String,
    kind: PipelineKind,
    cmd_tx: mpsc::Sender<Command>,
    snapshot: Arc<ArcSwap<PipelineSnapshot>>,
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl PipelineHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    /// Bring the pipeline to playing, bounded by `deadline`.
    ///
    /// Cancelling leaves the pipeline in null, never half-started.
    pub async fn start(&self, deadline: Duration, cancel: CancellationToken) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Start {
                deadline,
                cancel,
                reply,
            })
            .await
            .map_err(|_| AppError::PipelineFatal {
                pipeline: self.name.clone(),
                reason: "runtime task gone".into(),
            })?;
        rx.await.map_err(|_| AppError::PipelineFatal {
            pipeline: self.name.clone(),
            reason: "runtime task dropped reply".into(),
        })?
    }

    /// Transition to null. Idempotent; hardware is released before this
    /// returns. A stop on an already-dead task is a no-op.
    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Current snapshot, a value copy
    pub fn state(&self) -> PipelineSnapshot {
        self.snapshot.load().as_ref().clone()
    }

    /// Pull bus events accumulated since the last call
    pub fn drain_events(&self) -> Vec<PipelineEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

/// Spawn a runtime for a description.
///
/// Realization happens before the task starts, so element-creation failures
/// surface immediately as `PipelineFatal`.
pub fn spawn(desc: &PipelineDescription) -> Result<PipelineHandle> {
    ensure_gst_init();
    desc.verify().map_err(|e| AppError::PipelineFatal {
        pipeline: desc.name.clone(),
        reason: e,
    })?;

    let pipeline = realize_pipeline(desc)?;
    let counters = Counters::attach(&pipeline);

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let snapshot = Arc::new(ArcSwap::from_pointee(PipelineSnapshot::default()));
    let events = Arc::new(Mutex::new(Vec::new()));

    let task = RuntimeTask {
        name: desc.name.clone(),
        pipeline,
        counters,
        snapshot: snapshot.clone(),
        events: events.clone(),
        started_at: None,
        fatal: None,
    };
    tokio::spawn(task.run(cmd_rx));

    Ok(PipelineHandle {
        name: desc.name.clone(),
        kind: desc.kind,
        cmd_tx,
        snapshot,
        events,
    })
}

struct Counters {
    bytes: Option<Arc<AtomicU64>>,
    frames: Option<Arc<AtomicU64>>,
}

impl Counters {
    /// Attach pad probes to the conventional counter elements when present
    fn attach(pipeline: &gst::Pipeline) -> Self {
        let bytes = pipeline.by_name("counter").and_then(|el| {
            let counter = Arc::new(AtomicU64::new(0));
            let c = counter.clone();
            let pad = el.static_pad("src")?;
            pad.add_probe(gst::PadProbeType::BUFFER, move |_, info| {
                if let Some(gst::PadProbeData::Buffer(buffer)) = &info.data {
                    c.fetch_add(buffer.size() as u64, Ordering::Relaxed);
                }
                gst::PadProbeReturn::Ok
            });
            Some(counter)
        });

        let frames = pipeline.by_name("enc").and_then(|el| {
            let counter = Arc::new(AtomicU64::new(0));
            let c = counter.clone();
            let pad = el.static_pad("src")?;
            pad.add_probe(gst::PadProbeType::BUFFER, move |_, _| {
                c.fetch_add(1, Ordering::Relaxed);
                gst::PadProbeReturn::Ok
            });
            Some(counter)
        });

        Self { bytes, frames }
    }
}

struct RuntimeTask {
    name: String,
    pipeline: gst::Pipeline,
    counters: Counters,
    snapshot: Arc<ArcSwap<PipelineSnapshot>>,
    events: Arc<Mutex<Vec<PipelineEvent>>>,
    started_at: Option<Instant>,
    fatal: Option<String>,
}

impl RuntimeTask {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut tick = tokio::time::interval(Duration::from_millis(250));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Start { deadline, cancel, reply }) => {
                        let result = self.do_start(deadline, cancel).await;
                        let _ = reply.send(result);
                    }
                    Some(Command::Stop { reply }) => {
                        self.do_stop();
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        // all handles dropped
                        self.do_stop();
                        return;
                    }
                },
                _ = tick.tick() => {
                    self.drain_bus();
                    self.publish_snapshot();
                }
            }
        }
    }

    async fn do_start(&mut self, deadline: Duration, cancel: CancellationToken) -> Result<()> {
        if self.fatal.is_some() {
            return Err(AppError::PipelineFatal {
                pipeline: self.name.clone(),
                reason: "instance is in error, only stop is valid".into(),
            });
        }

        debug!(pipeline = %self.name, "Starting");
        if self.pipeline.set_state(gst::State::Playing).is_err() {
            self.enter_error("refused playing state".to_string(), None);
            self.rollback_to_null();
            return Err(AppError::PipelineFatal {
                pipeline: self.name.clone(),
                reason: "refused playing state".into(),
            });
        }

        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                self.rollback_to_null();
                return Err(AppError::Cancelled);
            }

            self.drain_bus();
            if let Some(reason) = self.fatal.clone() {
                self.rollback_to_null();
                return Err(AppError::PipelineFatal {
                    pipeline: self.name.clone(),
                    reason,
                });
            }

            let (_, current, _) = self.pipeline.state(gst::ClockTime::ZERO);
            if current == gst::State::Playing {
                self.started_at = Some(Instant::now());
                self.publish_snapshot();
                return Ok(());
            }

            if started.elapsed() >= deadline {
                self.rollback_to_null();
                return Err(AppError::StartTimeout {
                    what: self.name.clone(),
                    deadline_secs: deadline.as_secs(),
                });
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn do_stop(&mut self) {
        debug!(pipeline = %self.name, "Stopping");
        self.rollback_to_null();
        self.publish_snapshot();
    }

    /// Stop always runs to completion; a partial stop leaks encoder slots.
    fn rollback_to_null(&mut self) {
        if self.pipeline.set_state(gst::State::Null).is_err() {
            warn!(pipeline = %self.name, "Null transition reported failure");
        }
        // wait for the state change to settle so the device is really closed
        let _ = self.pipeline.state(gst::ClockTime::from_seconds(3));
        self.started_at = None;
    }

    fn enter_error(&mut self, message: String, source: Option<String>) {
        if self.fatal.is_none() {
            warn!(pipeline = %self.name, error = %message, "Fatal pipeline error");
            self.fatal = Some(message.clone());
        }
        self.events
            .lock()
            .push(PipelineEvent::FatalError { message, source });
    }

    fn drain_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        for event in pop_bus_events(&bus) {
            match &event {
                PipelineEvent::FatalError { message, source } => {
                    self.enter_error(message.clone(), source.clone());
                }
                PipelineEvent::Warning { message } => {
                    // transient: counted into the event log, never state
                    debug!(pipeline = %self.name, warning = %message, "Bus warning");
                    self.events.lock().push(event);
                }
                PipelineEvent::Eos => {
                    // a live pipeline must not end on its own
                    self.enter_error("unexpected end of stream".into(), None);
                }
            }
        }
    }

    fn publish_snapshot(&self) {
        let state = if self.fatal.is_some() {
            PipelineState::Error
        } else {
            let (_, current, _) = self.pipeline.state(gst::ClockTime::ZERO);
            match current {
                gst::State::Playing => PipelineState::Playing,
                gst::State::Paused => PipelineState::Paused,
                gst::State::Ready => PipelineState::Ready,
                _ => PipelineState::Null,
            }
        };

        self.snapshot.store(Arc::new(PipelineSnapshot {
            state,
            error: self.fatal.clone(),
            uptime_secs: self.started_at.map(|t| t.elapsed().as_secs()),
            bytes_produced: self
                .counters
                .bytes
                .as_ref()
                .map(|c| c.load(Ordering::Relaxed)),
            frames_encoded: self
                .counters
                .frames
                .as_ref()
                .map(|c| c.load(Ordering::Relaxed)),
        }));
    }
}

/// Drain and classify all pending bus messages
pub(crate) fn pop_bus_events(bus: &gst::Bus) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Some(msg) = bus.pop() {
        match msg.view() {
            gst::MessageView::Error(err) => {
                events.push(PipelineEvent::FatalError {
                    message: err.error().to_string(),
                    source: msg.src().map(|s| s.path_string().to_string()),
                });
            }
            gst::MessageView::Warning(w) => {
                events.push(PipelineEvent::Warning {
                    message: w.error().to_string(),
                });
            }
            gst::MessageView::Eos(_) => events.push(PipelineEvent::Eos),
            _ => {}
        }
    }
    events
}

/// Initialize GStreamer exactly once
pub fn ensure_gst_init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if let Err(e) = gst::init() {
            // nothing media-related can work from here on
            panic!("GStreamer initialization failed: {}", e);
        }
    });
}

/// Realize a description into a fresh pipeline
pub fn realize_pipeline(desc: &PipelineDescription) -> Result<gst::Pipeline> {
    let pipeline = gst::Pipeline::with_name(&desc.name);
    realize_into(desc, pipeline.upcast_ref())?;
    Ok(pipeline)
}

/// Realize a description into a bin with ghost pads on the leaf queues.
///
/// Used for mixer branches: `out` becomes ghost pad `src`, `audio_out`
/// becomes ghost pad `audio_src`.
pub fn realize_branch_bin(desc: &PipelineDescription) -> Result<gst::Bin> {
    let bin = gst::Bin::with_name(&desc.name);
    realize_into(desc, &bin)?;

    for (leaf, ghost_name) in [("out", "src"), ("audio_out", "audio_src")] {
        if let Some(el) = bin.by_name(leaf) {
            let target = el.static_pad("src").ok_or_else(|| AppError::PipelineFatal {
                pipeline: desc.name.clone(),
                reason: format!("leaf '{}' has no src pad", leaf),
            })?;
            let ghost = gst::GhostPad::builder_with_target(&target)
                .map_err(|e| AppError::PipelineFatal {
                    pipeline: desc.name.clone(),
                    reason: format!("ghost pad for '{}': {}", leaf, e),
                })?
                .name(ghost_name)
                .build();
            bin.add_pad(&ghost).map_err(|e| AppError::PipelineFatal {
                pipeline: desc.name.clone(),
                reason: format!("adding ghost pad: {}", e),
            })?;
        }
    }
    Ok(bin)
}

/// Build elements, apply properties, wire static links and register
/// pad-added handlers for elements with sometimes pads.
pub fn realize_into(desc: &PipelineDescription, bin: &gst::Bin) -> Result<()> {
    let fatal = |reason: String| AppError::PipelineFatal {
        pipeline: desc.name.clone(),
        reason,
    };

    for spec in &desc.elements {
        let element = gst::ElementFactory::make(&spec.factory)
            .name(&spec.name)
            .build()
            .map_err(|e| fatal(format!("creating '{}' ({}): {}", spec.name, spec.factory, e)))?;

        for (key, value) in &spec.properties {
            if element.find_property(key).is_some() {
                element.set_property_from_str(key, &value.to_gst_string());
            } else {
                warn!(
                    element = %spec.factory,
                    property = %key,
                    "Element has no such property, skipping"
                );
            }
        }

        bin.add(&element)
            .map_err(|e| fatal(format!("adding '{}': {}", spec.name, e)))?;
    }

    for link in &desc.links {
        let src = bin
            .by_name(&link.from)
            .ok_or_else(|| fatal(format!("unknown element '{}'", link.from)))?;
        let dst = bin
            .by_name(&link.to)
            .ok_or_else(|| fatal(format!("unknown element '{}'", link.to)))?;

        if src.static_pad("src").is_none() && src.src_pads().is_empty() {
            // sometimes pads (rtspsrc and friends): link when the pad appears
            connect_dynamic_link(&src, &dst, &link.caps);
            continue;
        }

        match &link.caps {
            Some(caps) => {
                let caps = caps
                    .parse::<gst::Caps>()
                    .map_err(|e| fatal(format!("caps '{}': {}", caps, e)))?;
                src.link_filtered(&dst, &caps).map_err(|e| {
                    fatal(format!("linking {} -> {}: {}", link.from, link.to, e))
                })?;
            }
            None => {
                src.link(&dst).map_err(|e| {
                    fatal(format!("linking {} -> {}: {}", link.from, link.to, e))
                })?;
            }
        }
    }

    Ok(())
}

/// Link `src`'s future pads to `dst` once they appear and are compatible
fn connect_dynamic_link(src: &gst::Element, dst: &gst::Element, caps: &Option<String>) {
    let dst = dst.clone();
    let filter = caps.as_ref().and_then(|c| c.parse::<gst::Caps>().ok());
    src.connect_pad_added(move |el, pad| {
        let Some(sink_pad) = dst.static_pad("sink") else {
            return;
        };
        if sink_pad.is_linked() {
            return;
        }
        let pad_caps = pad.query_caps(None);
        if let Some(filter) = &filter {
            if !pad_caps.can_intersect(filter) {
                return;
            }
        }
        if !pad_caps.can_intersect(&sink_pad.query_caps(None)) {
            return;
        }
        if let Err(e) = pad.link(&sink_pad) {
            warn!(
                element = %el.name(),
                pad = %pad.name(),
                "Dynamic pad link failed: {:?}",
                e
            );
        }
    });
}

/// Pull one encoded frame from a preview description's appsink.
///
/// Builds a short-lived pipeline, waits for a sample and tears everything
/// down before returning. Used by the snapshot endpoint.
pub async fn capture_preview_frame(
    desc: PipelineDescription,
    timeout: Duration,
) -> Result<Vec<u8>> {
    ensure_gst_init();
    let name = desc.name.clone();
    tokio::task::spawn_blocking(move || {
        let pipeline = realize_pipeline(&desc)?;
        let appsink = pipeline
            .by_name("sink")
            .and_then(|el| el.dynamic_cast::<gstreamer_app::AppSink>().ok())
            .ok_or_else(|| AppError::PipelineFatal {
                pipeline: desc.name.clone(),
                reason: "preview description has no appsink".into(),
            })?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| AppError::PipelineFatal {
                pipeline: desc.name.clone(),
                reason: format!("preview refused playing: {}", e),
            })?;

        let sample = appsink.try_pull_sample(gst::ClockTime::from_mseconds(
            timeout.as_millis() as u64
        ));
        let result = match sample.and_then(|s| s.buffer_owned()) {
            Some(buffer) => {
                let map = buffer.map_readable().map_err(|_| AppError::PipelineFatal {
                    pipeline: desc.name.clone(),
                    reason: "unreadable preview buffer".into(),
                })?;
                Ok(map.as_slice().to_vec())
            }
            None => Err(AppError::StartTimeout {
                what: desc.name.clone(),
                deadline_secs: timeout.as_secs(),
            }),
        };

        let _ = pipeline.set_state(gst::State::Null);
        let _ = pipeline.state(gst::ClockTime::from_seconds(3));
        result
    })
    .await
    .map_err(|e| AppError::Internal(format!("preview task for {}: {}", name, e)))?
}

impl PropertyValue {
    /// Serialized form handed to `set_property_from_str`, which converts
    /// through the property's own GValue type
    fn to_gst_string(&self) -> String {
        match self {
            PropertyValue::Str(s) | PropertyValue::FromStr(s) => s.clone(),
            PropertyValue::Int(v) => v.to_string(),
            PropertyValue::UInt(v) => v.to_string(),
            PropertyValue::Bool(v) => v.to_string(),
            PropertyValue::Double(v) => v.to_string(),
            PropertyValue::Fraction(n, d) => format!("{}/{}", n, d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_value_to_gst_string() {
        assert_eq!(PropertyValue::Int(-1).to_gst_string(), "-1");
        assert_eq!(PropertyValue::UInt(4000).to_gst_string(), "4000");
        assert_eq!(PropertyValue::Bool(true).to_gst_string(), "true");
        assert_eq!(PropertyValue::Fraction(30, 1).to_gst_string(), "30/1");
        assert_eq!(
            PropertyValue::from_str_value("zerolatency").to_gst_string(),
            "zerolatency"
        );
    }

    #[test]
    fn test_default_snapshot_is_null() {
        let snap = PipelineSnapshot::default();
        assert_eq!(snap.state, PipelineState::Null);
        assert!(snap.error.is_none());
        assert!(snap.uptime_secs.is_none());
    }
}

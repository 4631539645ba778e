//! Pipeline engine: build, start, inject, stop.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use parley_core::config::Config;
use parley_core::frame::{Frame, FrameKind};

use crate::error::{
    ErrorReporter, InjectError, LifecycleError, StageError, TracingReporter, TransportError,
    ValidationError,
};
use crate::stage::{Emitter, Inbox, Source, Stage, StageDescriptor, dispatch};

const DEFAULT_INGRESS_CAPACITY: usize = 256;
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(2000);

/// Runtime knobs for one pipeline.
#[derive(Clone)]
pub struct PipelineConfig {
    /// Frames allowed to wait between the source and the first stage.
    pub ingress_capacity: usize,
    /// How long `stop` waits for stage tasks before abandoning them.
    pub grace_period: Duration,
    pub reporter: Arc<dyn ErrorReporter>,
}

impl PipelineConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ingress_capacity: config.ingress_capacity(),
            grace_period: config.grace_period(),
            reporter: Arc::new(TracingReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
            grace_period: DEFAULT_GRACE_PERIOD,
            reporter: Arc::new(TracingReporter),
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("ingress_capacity", &self.ingress_capacity)
            .field("grace_period", &self.grace_period)
            .finish_non_exhaustive()
    }
}

struct InjectTarget {
    descriptor: StageDescriptor,
    inbox: Inbox,
}

/// Cloneable handle for pushing frames into a running pipeline at a chosen
/// stage, bypassing everything upstream of it.
///
/// Indices are graph indices: 0 is the source (never injectable), 1 the first
/// stage.
#[derive(Clone)]
pub struct Injector {
    targets: Arc<[InjectTarget]>,
    cancel: CancellationToken,
}

impl Injector {
    pub fn inject_at(&self, index: usize, frame: Frame) -> Result<(), InjectError> {
        if self.cancel.is_cancelled() {
            return Err(InjectError::NotRunning);
        }
        let len = self.targets.len() + 1;
        if index == 0 || index >= len {
            return Err(InjectError::InvalidStageIndex { index, len });
        }
        let target = &self.targets[index - 1];
        let kind = frame.kind();
        if !target.descriptor.accepts(kind) {
            return Err(InjectError::KindNotAccepted { index, kind });
        }
        target
            .inbox
            .push(frame)
            .map_err(|_| InjectError::NotRunning)?;
        debug!(index, %kind, "Frame injected");
        Ok(())
    }

    /// True once the pipeline has been told to stop.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

enum Phase {
    Built {
        source: Box<dyn Source>,
        stages: Vec<Box<dyn Stage>>,
    },
    Running {
        cancel: CancellationToken,
        tasks: JoinSet<()>,
        injector: Injector,
    },
    Stopped,
}

/// A validated linear chain: one source, then stages, the last being the sink.
pub struct Pipeline {
    names: Vec<String>,
    descriptors: Vec<StageDescriptor>,
    config: PipelineConfig,
    phase: Phase,
}

impl Pipeline {
    /// Validate and assemble a chain. Nothing runs until [`Pipeline::start`].
    pub fn build(
        source: Box<dyn Source>,
        stages: Vec<Box<dyn Stage>>,
        config: PipelineConfig,
    ) -> Result<Self, ValidationError> {
        if stages.is_empty() {
            return Err(ValidationError::MissingSink);
        }

        let mut names = Vec::with_capacity(stages.len() + 1);
        let mut descriptors = Vec::with_capacity(stages.len() + 1);
        names.push(source.name().to_string());
        descriptors.push(source.descriptor());
        for stage in &stages {
            names.push(stage.name().to_string());
            descriptors.push(stage.descriptor());
        }

        for position in 0..descriptors.len() - 1 {
            let (upstream, downstream) = (&descriptors[position], &descriptors[position + 1]);
            if let Some(produced) = upstream.mismatch_with(downstream) {
                return Err(ValidationError::IncompatibleStageChain {
                    position,
                    upstream: names[position].clone(),
                    downstream: names[position + 1].clone(),
                    produced,
                    accepted: downstream.accepts.clone(),
                });
            }
        }

        debug!(stages = ?names, "Pipeline built");
        Ok(Self {
            names,
            descriptors,
            config,
            phase: Phase::Built { source, stages },
        })
    }

    /// Spawn one task per stage plus the source pump.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<(), LifecycleError> {
        let (mut source, stages) = match std::mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Built { source, stages } => (source, stages),
            other => {
                self.phase = other;
                return Err(LifecycleError::AlreadyStarted);
            }
        };

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let mut inboxes = Vec::with_capacity(stages.len());
        let mut queues = Vec::with_capacity(stages.len());
        for _ in &stages {
            let (inbox, rx, depth) = Inbox::new();
            inboxes.push(inbox);
            queues.push((rx, depth));
        }

        for (index, (stage, (rx, depth))) in stages.into_iter().zip(queues).enumerate() {
            let emit = match inboxes.get(index + 1) {
                Some(next) => Emitter::to(next.clone()),
                None => Emitter::detached(),
            };
            tasks.spawn(run_stage(
                stage,
                rx,
                depth,
                emit,
                cancel.clone(),
                self.config.reporter.clone(),
            ));
        }

        let ingress = inboxes[0].clone();
        let produces = self.descriptors[0].produces.clone();
        let capacity = self.config.ingress_capacity;
        let reporter = self.config.reporter.clone();
        let source_cancel = cancel.clone();
        tasks.spawn(async move {
            pump_source(
                source.as_mut(),
                &produces,
                ingress,
                capacity,
                source_cancel,
                reporter,
            )
            .await;
        });

        let targets: Arc<[InjectTarget]> = self.descriptors[1..]
            .iter()
            .cloned()
            .zip(inboxes)
            .map(|(descriptor, inbox)| InjectTarget { descriptor, inbox })
            .collect();
        let injector = Injector {
            targets,
            cancel: cancel.clone(),
        };

        info!(stages = ?self.names, "Pipeline started");
        self.phase = Phase::Running {
            cancel,
            tasks,
            injector,
        };
        Ok(())
    }

    /// Signal every stage to stop, wait up to the grace period, then abandon
    /// whatever is still running. No-op if never started; idempotent.
    pub async fn stop(&mut self) {
        let (cancel, mut tasks) = match std::mem::replace(&mut self.phase, Phase::Stopped) {
            Phase::Running { cancel, tasks, .. } => (cancel, tasks),
            other => {
                self.phase = other;
                return;
            }
        };

        cancel.cancel();
        if timeout(self.config.grace_period, drain(&mut tasks))
            .await
            .is_err()
        {
            warn!(
                remaining = tasks.len(),
                grace_ms = self.config.grace_period.as_millis() as u64,
                "Stage tasks did not quiesce within grace period, abandoning"
            );
            tasks.abort_all();
        }
        info!("Pipeline stopped");
    }

    pub fn inject_at(&self, index: usize, frame: Frame) -> Result<(), InjectError> {
        match &self.phase {
            Phase::Running { injector, .. } => injector.inject_at(index, frame),
            _ => Err(InjectError::NotRunning),
        }
    }

    /// Injection handle, available while running.
    pub fn injector(&self) -> Option<Injector> {
        match &self.phase {
            Phase::Running { injector, .. } => Some(injector.clone()),
            _ => None,
        }
    }

    /// Graph index of the first stage (never the source) accepting `kind`.
    pub fn position_accepting(&self, kind: FrameKind) -> Option<usize> {
        self.descriptors
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, d)| d.accepts(kind))
            .map(|(index, _)| index)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running { .. })
    }

    /// Number of graph elements, source included.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn stage_names(&self) -> &[String] {
        &self.names
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Phase::Running { cancel, .. } = &self.phase {
            cancel.cancel();
        }
    }
}

async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            if e.is_panic() {
                error!(error = %e, "Stage task panicked");
            }
        }
    }
}

async fn run_stage(
    mut stage: Box<dyn Stage>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    depth: Arc<AtomicUsize>,
    emit: Emitter,
    cancel: CancellationToken,
    reporter: Arc<dyn ErrorReporter>,
) {
    let name = stage.name().to_string();
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        depth.fetch_sub(1, Ordering::SeqCst);

        // The in-flight frame is not raced against cancellation; stop's grace
        // period bounds it instead.
        if let Err(e) = dispatch(stage.as_mut(), frame, &emit).await {
            reporter.report(&name, &e);
        }
    }
    stage.shutdown().await;
    debug!(stage = %name, "Stage stopped");
}

/// Moves source frames onto the first stage's queue. Frames of a kind the
/// source does not declare never enter the chain.
async fn pump_source(
    source: &mut dyn Source,
    produces: &[FrameKind],
    ingress: Inbox,
    capacity: usize,
    cancel: CancellationToken,
    reporter: Arc<dyn ErrorReporter>,
) {
    let name = source.name().to_string();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = source.next_frame() => next,
        };
        match next {
            Some(Ok(frame)) => {
                if !produces.contains(&frame.kind()) {
                    debug!(source = %name, kind = %frame.kind(), "Dropping undeclared frame kind");
                    continue;
                }
                if ingress.depth() >= capacity {
                    reporter.report(&name, &StageError::Overloaded);
                    continue;
                }
                if ingress.push(frame).is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                let closed = e.is_session_closed();
                reporter.report(&name, &e);
                if closed {
                    break;
                }
            }
            None => {
                reporter.report(&name, &StageError::Transport(TransportError::Closed));
                break;
            }
        }
    }
    debug!(source = %name, "Source stopped");
}

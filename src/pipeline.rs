//! Ordered stage execution with centralized exception interception.
//!
//! A [`Pipeline`] runs a fixed sequence of named [`Stage`]s against one
//! [`PipelineContext`] per message attempt. Behavior is extended through
//! [`PipelineModule`]s — typed hooks registered once at construction and
//! invoked around stages, on exceptions and on idle polls — never by
//! modifying the pipeline itself.
//!
//! The pipeline holds no cross-invocation state: each worker owns one
//! instance and drives exactly one message through it at a time. Retries
//! re-run the whole pipeline from the first stage, so stages must be safe
//! to re-run.

use std::sync::Arc;

use tracing_error::SpanTrace;

use crate::TransportMessage;
use crate::events::EngineKind;

/// Outcome of a pipeline run, recorded on the context by stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// The message ran through every stage.
    #[default]
    Completed,
    /// The message was relocated to the deferred queue.
    Deferred,
}

/// Mutable state shared by the stages of one pipeline run.
pub struct PipelineContext {
    raw: Vec<u8>,
    message: Option<TransportMessage>,
    aborted: bool,
    disposition: Disposition,
}

impl PipelineContext {
    /// Create a context for one received payload.
    pub fn new(raw: Vec<u8>) -> Self {
        Self {
            raw,
            message: None,
            aborted: false,
            disposition: Disposition::default(),
        }
    }

    /// The payload as received from the queue.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The decoded envelope, once the deserialize stage has run.
    pub fn message(&self) -> Option<&TransportMessage> {
        self.message.as_ref()
    }

    /// Mutable access to the decoded envelope.
    pub fn message_mut(&mut self) -> Option<&mut TransportMessage> {
        self.message.as_mut()
    }

    /// Install the decoded envelope.
    pub fn set_message(&mut self, message: TransportMessage) {
        self.message = Some(message);
    }

    /// Take the decoded envelope out of the context.
    pub fn take_message(&mut self) -> Option<TransportMessage> {
        self.message.take()
    }

    /// Skip all remaining stages of this run.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Whether a stage or hook aborted the run.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Record the run's outcome.
    pub fn set_disposition(&mut self, disposition: Disposition) {
        self.disposition = disposition;
    }

    /// The run's outcome.
    pub fn disposition(&self) -> Disposition {
        self.disposition
    }
}

/// One named step of a pipeline.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    /// Stage name, used in logs and handed to `before_stage` hooks.
    fn name(&self) -> &'static str;

    /// Run the stage against the current context.
    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), tower::BoxError>;
}

/// Whether an intercepted error was taken care of by a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Suppress propagation; the run completes as aborted.
    Handled,
    /// Propagate to the failure policy.
    Unhandled,
}

/// Extension hook attached to pipeline events.
///
/// All hooks default to no-ops; implement only the events of interest.
/// Hooks run synchronously within the worker's processing cycle and should
/// avoid heavy or blocking work.
#[async_trait::async_trait]
pub trait PipelineModule: Send + Sync {
    /// Runs ahead of every stage. May abort the run via the context.
    async fn before_stage(&self, _stage: &'static str, _ctx: &mut PipelineContext) {}

    /// Runs when a stage returns an error, before the error propagates.
    async fn on_exception(
        &self,
        _error: &tower::BoxError,
        _ctx: &mut PipelineContext,
    ) -> ErrorDisposition {
        ErrorDisposition::Unhandled
    }

    /// Runs each time a worker finds its work queue empty.
    async fn on_idle(&self, _engine: EngineKind) {}
}

/// Ordered stage sequence executed once per message attempt.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    modules: Vec<Arc<dyn PipelineModule>>,
}

impl Pipeline {
    /// Create a pipeline from its stages and modules.
    ///
    /// Both lists are resolved here, once, and never change afterwards.
    pub fn new(stages: Vec<Arc<dyn Stage>>, modules: Vec<Arc<dyn PipelineModule>>) -> Self {
        Self { stages, modules }
    }

    /// Run each stage in order against the context.
    ///
    /// An abort flag set by a stage or hook skips the remaining stages. A
    /// stage error is offered to every module's `on_exception` before it
    /// propagates; any module answering [`ErrorDisposition::Handled`] turns
    /// the run into an aborted completion instead of a failure.
    pub async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), PipelineError> {
        for stage in &self.stages {
            for module in &self.modules {
                module.before_stage(stage.name(), ctx).await;
            }

            if ctx.is_aborted() {
                break;
            }

            if let Err(error) = stage.execute(ctx).await {
                tracing::debug!(stage = stage.name(), %error, "stage failed");

                let mut handled = false;
                for module in &self.modules {
                    if module.on_exception(&error, ctx).await == ErrorDisposition::Handled {
                        handled = true;
                    }
                }

                if handled {
                    ctx.abort();
                    break;
                }

                return Err(PipelineError::stage(stage.name(), error));
            }

            if ctx.is_aborted() {
                break;
            }
        }

        Ok(())
    }

    /// Notify modules that the owning worker found no work.
    pub(crate) async fn idle(&self, engine: EngineKind) {
        for module in &self.modules {
            module.on_idle(engine).await;
        }
    }
}

/// Error returned when a pipeline run fails.
#[derive(Debug)]
pub struct PipelineError {
    stage: &'static str,
    context: SpanTrace,
    source: tower::BoxError,
}

impl PipelineError {
    fn stage(stage: &'static str, source: tower::BoxError) -> Self {
        Self {
            stage,
            context: SpanTrace::capture(),
            source,
        }
    }

    /// Name of the stage that failed.
    pub fn stage_name(&self) -> &'static str {
        self.stage
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Stage '{}' failed: {}", self.stage, self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        abort: bool,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl Stage for Record {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), tower::BoxError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                return Err("boom".into());
            }
            if self.abort {
                ctx.abort();
            }
            Ok(())
        }
    }

    fn record(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        abort: bool,
        fail: bool,
    ) -> Arc<dyn Stage> {
        Arc::new(Record {
            name,
            log: Arc::clone(log),
            abort,
            fail,
        })
    }

    #[tokio::test]
    async fn runs_stages_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![
                record("first", &log, false, false),
                record("second", &log, false, false),
            ],
            Vec::new(),
        );

        let mut ctx = PipelineContext::new(Vec::new());
        pipeline.execute(&mut ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(ctx.disposition(), Disposition::Completed);
    }

    #[tokio::test]
    async fn abort_skips_remaining_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![
                record("first", &log, true, false),
                record("second", &log, false, false),
            ],
            Vec::new(),
        );

        let mut ctx = PipelineContext::new(Vec::new());
        pipeline.execute(&mut ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        assert!(ctx.is_aborted());
    }

    struct CountExceptions {
        seen: AtomicUsize,
        handle: bool,
    }

    #[async_trait::async_trait]
    impl PipelineModule for CountExceptions {
        async fn on_exception(
            &self,
            _error: &tower::BoxError,
            _ctx: &mut PipelineContext,
        ) -> ErrorDisposition {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.handle {
                ErrorDisposition::Handled
            } else {
                ErrorDisposition::Unhandled
            }
        }
    }

    #[tokio::test]
    async fn unhandled_stage_error_propagates_after_hooks() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let module = Arc::new(CountExceptions {
            seen: AtomicUsize::new(0),
            handle: false,
        });
        let pipeline = Pipeline::new(
            vec![record("failing", &log, false, true)],
            vec![Arc::clone(&module) as Arc<dyn PipelineModule>],
        );

        let mut ctx = PipelineContext::new(Vec::new());
        let error = pipeline.execute(&mut ctx).await.unwrap_err();

        assert_eq!(error.stage_name(), "failing");
        assert_eq!(module.seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handled_error_completes_as_aborted() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let module = Arc::new(CountExceptions {
            seen: AtomicUsize::new(0),
            handle: true,
        });
        let pipeline = Pipeline::new(
            vec![
                record("failing", &log, false, true),
                record("after", &log, false, false),
            ],
            vec![Arc::clone(&module) as Arc<dyn PipelineModule>],
        );

        let mut ctx = PipelineContext::new(Vec::new());
        pipeline.execute(&mut ctx).await.unwrap();

        assert!(ctx.is_aborted());
        assert_eq!(*log.lock().unwrap(), vec!["failing"]);
        assert_eq!(module.seen.load(Ordering::SeqCst), 1);
    }

    struct AbortBefore;

    #[async_trait::async_trait]
    impl PipelineModule for AbortBefore {
        async fn before_stage(&self, stage: &'static str, ctx: &mut PipelineContext) {
            if stage == "second" {
                ctx.abort();
            }
        }
    }

    #[tokio::test]
    async fn before_stage_hook_can_abort() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(
            vec![
                record("first", &log, false, false),
                record("second", &log, false, false),
            ],
            vec![Arc::new(AbortBefore) as Arc<dyn PipelineModule>],
        );

        let mut ctx = PipelineContext::new(Vec::new());
        pipeline.execute(&mut ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["first"]);
    }
}

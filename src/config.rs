use std::sync::Arc;
use std::time::Duration;

use tracing_error::SpanTrace;

use crate::events::EngineKind;
use crate::queue::Queue;

/// Default idle-sleep ladder: quick re-polls first, settling at one second.
pub const DEFAULT_IDLE_DURATIONS: [Duration; 3] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_secs(1),
];

/// Default failure-ignore ladder applied between retries.
pub const DEFAULT_IGNORE_DURATIONS: [Duration; 3] = [
    Duration::from_millis(500),
    Duration::from_secs(2),
    Duration::from_secs(8),
];

/// Default retry budget before a message is quarantined.
pub const DEFAULT_MAXIMUM_FAILURE_COUNT: u32 = 5;

/// Immutable settings for the inbox engine.
///
/// The duration lists are ladders: each successive empty poll (or failure)
/// advances to the next entry, clamped at the last. Omitting the deferred
/// queue disables defer support entirely — a deferred message is then
/// treated as immediately due, and retry backoff windows are not enforced.
#[derive(Clone)]
pub struct InboxConfig {
    /// Queue the workers drain for new and retried messages.
    pub work_queue: Arc<dyn Queue>,
    /// Holding area for messages that are not yet due.
    pub deferred_queue: Option<Arc<dyn Queue>>,
    /// Terminal quarantine for poison messages.
    pub error_queue: Arc<dyn Queue>,
    /// Idle-sleep ladder between empty polls.
    pub durations_to_sleep_when_idle: Vec<Duration>,
    /// Backoff ladder indexed by failure count.
    pub durations_to_ignore_on_failure: Vec<Duration>,
    /// Failure count at which a message becomes poison. Zero makes the
    /// first failure terminal.
    pub maximum_failure_count: u32,
    /// Number of workers polling the work queue.
    pub worker_count: usize,
    /// Whether receive/handle/enqueue/acknowledge form one unit of work.
    ///
    /// Atomic enlistment belongs to the queue implementation; the engine's
    /// receive-then-acknowledge discipline already makes a rolled-back
    /// attempt indistinguishable from a crash before acknowledge.
    pub transactional: bool,
}

impl InboxConfig {
    /// Settings over a work queue and an error queue, with defaults for
    /// everything else.
    pub fn new(work_queue: Arc<dyn Queue>, error_queue: Arc<dyn Queue>) -> Self {
        Self {
            work_queue,
            deferred_queue: None,
            error_queue,
            durations_to_sleep_when_idle: DEFAULT_IDLE_DURATIONS.to_vec(),
            durations_to_ignore_on_failure: DEFAULT_IGNORE_DURATIONS.to_vec(),
            maximum_failure_count: DEFAULT_MAXIMUM_FAILURE_COUNT,
            worker_count: 1,
            transactional: false,
        }
    }

    /// Enable defer support through the given holding queue.
    pub fn with_deferred_queue(mut self, queue: Arc<dyn Queue>) -> Self {
        self.deferred_queue = Some(queue);
        self
    }

    /// Replace the idle-sleep ladder.
    pub fn with_idle_durations(mut self, durations: Vec<Duration>) -> Self {
        self.durations_to_sleep_when_idle = durations;
        self
    }

    /// Replace the failure-ignore ladder.
    pub fn with_ignore_durations(mut self, durations: Vec<Duration>) -> Self {
        self.durations_to_ignore_on_failure = durations;
        self
    }

    /// Replace the retry budget.
    pub fn with_maximum_failure_count(mut self, count: u32) -> Self {
        self.maximum_failure_count = count;
        self
    }

    /// Replace the worker count.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Mark the engine transactional.
    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        validate_worker_settings(
            EngineKind::Inbox,
            self.worker_count,
            &self.durations_to_sleep_when_idle,
        )
    }
}

/// Immutable settings for the outbox engine.
///
/// Mirrors [`InboxConfig`] without a deferred queue: outbound retries are
/// immediately visible after requeue.
#[derive(Clone)]
pub struct OutboxConfig {
    /// Queue holding messages awaiting dispatch.
    pub work_queue: Arc<dyn Queue>,
    /// Terminal quarantine for undeliverable messages.
    pub error_queue: Arc<dyn Queue>,
    /// Idle-sleep ladder between empty polls.
    pub durations_to_sleep_when_idle: Vec<Duration>,
    /// Backoff ladder indexed by failure count.
    pub durations_to_ignore_on_failure: Vec<Duration>,
    /// Failure count at which a message becomes poison.
    pub maximum_failure_count: u32,
    /// Number of workers polling the work queue.
    pub worker_count: usize,
    /// Whether receive/dispatch/acknowledge form one unit of work.
    pub transactional: bool,
}

impl OutboxConfig {
    /// Settings over a work queue and an error queue, with defaults for
    /// everything else.
    pub fn new(work_queue: Arc<dyn Queue>, error_queue: Arc<dyn Queue>) -> Self {
        Self {
            work_queue,
            error_queue,
            durations_to_sleep_when_idle: DEFAULT_IDLE_DURATIONS.to_vec(),
            durations_to_ignore_on_failure: DEFAULT_IGNORE_DURATIONS.to_vec(),
            maximum_failure_count: DEFAULT_MAXIMUM_FAILURE_COUNT,
            worker_count: 1,
            transactional: false,
        }
    }

    /// Replace the idle-sleep ladder.
    pub fn with_idle_durations(mut self, durations: Vec<Duration>) -> Self {
        self.durations_to_sleep_when_idle = durations;
        self
    }

    /// Replace the failure-ignore ladder.
    pub fn with_ignore_durations(mut self, durations: Vec<Duration>) -> Self {
        self.durations_to_ignore_on_failure = durations;
        self
    }

    /// Replace the retry budget.
    pub fn with_maximum_failure_count(mut self, count: u32) -> Self {
        self.maximum_failure_count = count;
        self
    }

    /// Replace the worker count.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Mark the engine transactional.
    pub fn transactional(mut self) -> Self {
        self.transactional = true;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        validate_worker_settings(
            EngineKind::Outbox,
            self.worker_count,
            &self.durations_to_sleep_when_idle,
        )
    }
}

fn validate_worker_settings(
    engine: EngineKind,
    worker_count: usize,
    idle: &[Duration],
) -> Result<(), ConfigError> {
    if worker_count == 0 {
        return Err(ConfigError::new(ConfigErrorKind::ZeroWorkerCount { engine }));
    }

    if idle.is_empty() {
        return Err(ConfigError::new(ConfigErrorKind::NoIdleDurations { engine }));
    }

    Ok(())
}

/// Error returned when an engine configuration violates an invariant.
///
/// Configuration errors are fatal: the bus refuses to start.
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    kind: ConfigErrorKind,
}

/// Configuration error kinds.
#[derive(Debug)]
pub enum ConfigErrorKind {
    /// An engine was configured with zero workers.
    ZeroWorkerCount { engine: EngineKind },
    /// An engine was configured with an empty idle-sleep ladder.
    NoIdleDurations { engine: EngineKind },
}

impl ConfigError {
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConfigErrorKind::ZeroWorkerCount { engine } => {
                writeln!(f, "{engine} engine requires at least one worker")
            }
            ConfigErrorKind::NoIdleDurations { engine } => {
                writeln!(f, "{engine} engine requires a non-empty idle-sleep ladder")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;

    fn queues() -> (Arc<dyn Queue>, Arc<dyn Queue>) {
        (
            Arc::new(InMemoryQueue::new()),
            Arc::new(InMemoryQueue::new()),
        )
    }

    #[test]
    fn defaults_validate() {
        let (work, error) = queues();
        assert!(InboxConfig::new(work, error).validate().is_ok());
    }

    #[test]
    fn zero_workers_is_fatal() {
        let (work, error) = queues();
        let config = InboxConfig::new(work, error).with_worker_count(0);

        assert!(matches!(
            config.validate().unwrap_err().kind(),
            ConfigErrorKind::ZeroWorkerCount {
                engine: EngineKind::Inbox
            }
        ));
    }

    #[test]
    fn empty_idle_ladder_is_fatal() {
        let (work, error) = queues();
        let config = OutboxConfig::new(work, error).with_idle_durations(Vec::new());

        assert!(matches!(
            config.validate().unwrap_err().kind(),
            ConfigErrorKind::NoIdleDurations {
                engine: EngineKind::Outbox
            }
        ));
    }
}

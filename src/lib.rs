#![doc = include_str!("../README.md")]

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod events;
pub mod handler;
mod inbox;
pub mod outbox;
pub mod pipeline;
pub mod queue;
pub mod serializer;
mod stages;
mod worker;

#[doc(inline)]
pub use bus::{Bus, BusBuilder, BusError, BusErrorKind};

#[doc(inline)]
pub use config::{InboxConfig, OutboxConfig};

#[doc(inline)]
pub use envelope::TransportMessage;

#[doc(inline)]
pub use events::{BusEvent, EngineKind};

#[doc(inline)]
pub use handler::{HandlerRegistry, MessageHandler};

#[doc(inline)]
pub use outbox::{MessageRouter, StaticRouter};

#[doc(inline)]
pub use pipeline::{Disposition, ErrorDisposition, Pipeline, PipelineContext, PipelineModule, Stage};

#[doc(inline)]
pub use queue::{InMemoryCatalog, InMemoryQueue, Queue, QueueCatalog, QueueError, QueueName};

#[doc(inline)]
pub use serializer::{JsonSerializer, MessageSerializer};

#[doc(inline)]
pub use worker::WorkerState;

//! # nsq-coordination
//!
//! Lifecycle of an NSQ writer and optional reader that share one address
//! set. [`Coordinator`] resolves where to connect, creates the sub-clients
//! and returns a [`Startup`] that resolves to an [`NsqSystem`] once every
//! enabled sub-client has reported ready, in either order. Errors and
//! discarded messages go to the [`DiagnosticsSink`] and never block
//! readiness. [`ShutdownCoordinator`] closes the reader then the writer, and
//! may run before, during or after startup.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use nsq_coordination::{Coordinator, Message};
//!
//! let config = config::ConnectionConfig::parse("nsq.yaml")?;
//! let startup = Coordinator::nsq(config).with_reader().start()?;
//! let shutdown = startup.shutdown_handle();
//! let system = startup.ready().await?;
//!
//! system.on_message(|msg: &Message| -> anyhow::Result<()> {
//!     println!("{:?}", msg.body());
//!     Ok(())
//! })?;
//! system.publish("events", "foo").await?;
//! shutdown.shutdown();
//! # Ok(())
//! # }
//! ```
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

pub mod barrier;
pub mod diagnostics;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod resolver;
pub mod shutdown;
pub mod system;

#[cfg(test)]
mod testing;

pub use nsq_client::{
    ClientError, ClientEvent, Connector, Endpoints, Message, NsqConnector, Role,
    memory::MemoryBroker,
};

pub use crate::{
    barrier::{BarrierState, ReadinessBarrier, ReadySignal},
    diagnostics::DiagnosticsSink,
    error::{CoordinationError, CoordinationResult},
    handler::MessageHandler,
    resolver::{AddressMode, AddressSet},
    shutdown::ShutdownCoordinator,
    system::{
        ClientState, Coordinator, HELD_TOUCH_INTERVAL, NsqSystem, Readiness, Startup,
        client_options,
    },
};

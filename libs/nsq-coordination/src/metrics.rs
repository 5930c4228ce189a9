#![allow(missing_docs)] // proc macros dont play nicely with docstrings

//! # metrics
//!
//! NSQ lifecycle statistics, registered lazily in the default prometheus
//! registry on first use.
use std::time::Instant;

use lazy_static::lazy_static;
use nsq_client::Role;
use prometheus::{
    IntCounter, IntCounterVec, IntGauge, register_int_counter, register_int_counter_vec,
    register_int_gauge,
};
use prometheus_static_metric::make_static_metric;

make_static_metric! {
    pub label_enum SubClientRole {
        writer,
        reader,
    }
    pub struct RoleCounts: IntCounter {
        "role" => SubClientRole
    }
}

impl RoleCounts {
    pub fn role(&self, role: Role) -> &IntCounter {
        match role {
            Role::Writer => &self.writer,
            Role::Reader => &self.reader,
        }
    }
}

lazy_static! {
    /// When the process started
    pub static ref START_TIME: Instant = Instant::now();
    /// process uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "uptime (seconds)").unwrap();

    pub static ref READY_EVENTS_VEC: IntCounterVec = register_int_counter_vec!(
        "nsq_ready_events",
        "count of ready events per sub-client",
        &["role"]
    )
    .unwrap();
    /// ready events, including repeats after reconnects
    pub static ref READY_EVENTS: RoleCounts = RoleCounts::from(&READY_EVENTS_VEC);

    pub static ref CLIENT_ERRORS_VEC: IntCounterVec = register_int_counter_vec!(
        "nsq_client_errors",
        "count of errors reported per sub-client",
        &["role"]
    )
    .unwrap();
    /// errors absorbed by the diagnostics sink
    pub static ref CLIENT_ERRORS: RoleCounts = RoleCounts::from(&CLIENT_ERRORS_VEC);

    /// messages dropped after max attempts
    pub static ref DISCARDS: IntCounter = register_int_counter!("nsq_discards", "count of messages discarded after max attempts").unwrap();
    /// messages delivered by the reader
    pub static ref MESSAGES: IntCounter = register_int_counter!("nsq_messages", "count of messages delivered").unwrap();
    /// handler errors, each one requeues a message
    pub static ref HANDLER_FAILURES: IntCounter = register_int_counter!("nsq_handler_failures", "count of message handler failures").unwrap();
    /// messages accepted by nsqd
    pub static ref PUBLISHED: IntCounter = register_int_counter!("nsq_published", "count of messages published").unwrap();
    /// systems in this process whose sub-clients have all reported ready and
    /// that have not been shut down
    pub static ref SYSTEM_READY: IntGauge = register_int_gauge!("nsq_systems_ready", "count of ready nsq systems").unwrap();
    /// shutdowns requested
    pub static ref SHUTDOWNS: IntCounter = register_int_counter!("nsq_shutdowns", "count of nsq system shutdowns").unwrap();
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use prometheus::gather;

    use super::*;

    #[test]
    fn counters_are_registered_and_exposed() {
        READY_EVENTS.role(Role::Writer).inc();
        CLIENT_ERRORS.role(Role::Reader).inc();
        DISCARDS.inc();
        SYSTEM_READY.get();

        let names = gather()
            .into_iter()
            .map(|family| family.get_name().to_owned())
            .collect::<HashSet<_>>();
        for name in [
            "nsq_ready_events",
            "nsq_client_errors",
            "nsq_discards",
            "nsq_systems_ready",
        ] {
            assert!(names.contains(name), "{name} missing from registry");
        }
    }
}

//! The hub side of drover: multiplexing tenants' daemons over the bus,
//! running their release jobs, and keeping their history.

#![forbid(unsafe_code)]

pub mod handlers;
pub mod history;
pub mod instance;
pub mod jobs;

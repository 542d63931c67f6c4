//!
//! collage-2pc
//! Atomic collage construction over two-phase commit. A single coordinator
//! consumes source files scattered across remote participants and persists
//! the assembled artifact in its own working directory: either every named
//! source is deleted and the artifact exists, or neither happens. The wire
//! is a lossy datagram transport, so both sides write-ahead log every step
//! and the coordinator retransmits decisions until acknowledged.
//!
#[macro_use]
extern crate log;

pub mod checker;
pub mod coordinator;
pub mod message;
pub mod oplog;
pub mod participant;
pub mod sim;
pub mod tpcoptions;
pub mod transaction;
pub mod transport;

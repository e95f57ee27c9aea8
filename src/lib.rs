//! Core machinery for a publish-subscribe middleware: the process-wide
//! entity handle server, the read/take pipeline with zero-copy sample
//! loans, and a cooperative state-machine scheduler.
//!
//! The three parts compose bottom-up. The handle server is a leaf every
//! component leans on: it issues the integer handles entities are addressed
//! by and arbitrates their lifecycle with pin counts, reference counts and
//! a handful of flags packed into one atomic word. The read pipeline pins a
//! reader, drains its history cache through a per-sample collector, and
//! manages the loans it hands to the application. The state-machine control
//! drives an unbounded number of machines from one worker thread with
//! per-state and per-machine timeouts, and is the engine behind
//! authentication and discovery workflows.

pub mod entity;
pub mod error;
pub mod fsm;
pub mod handle;
pub mod loan;
pub mod read;
pub mod rhc;
pub mod sample;
pub mod time;

pub use self::error::{Error, Result};
pub use self::handle::{Handle, HandleLink};
pub use self::loan::{LoanOrigin, LoanPool, LoanedSample};
pub use self::sample::{InstanceHandle, LoanedSampleState, SampleInfo, SerType, Serdata};

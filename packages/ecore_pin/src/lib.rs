#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Keeps selected background processes on a single efficiency processor at idle priority.
//!
//! On processors with both performance and efficiency cores, some always-running background
//! processes (anti-cheat services are the usual example) compete with foreground work for the
//! fast cores. This crate finds such processes by executable name, restricts each of them to one
//! efficiency processor and lowers its priority class to idle. When no efficiency processor can
//! be found, the highest-numbered logical processor is used instead.
//!
//! The work is organized in passes, each of which is independent of the previous ones:
//!
//! 1. [`TopologyProbe`] reads the processor topology and picks the target processor.
//! 2. [`ProcessFinder`] lists the running processes whose names are on the [`AllowList`].
//! 3. [`CoreBinder`] binds each of them to the target processor.
//!
//! [`BindingCycle`] runs one such pass and reports a [`PassSummary`]. [`Worker`] repeats passes
//! on a fixed [`Schedule`] on a background thread and publishes the results to a shared
//! [`WorkerState`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ecore_pin::{AllowList, LoggingObserver, Worker, WorkerState};
//!
//! let state = Arc::new(WorkerState::new(AllowList::new(["SGuard64.exe"])));
//! let worker = Worker::new(Arc::clone(&state));
//!
//! let summary = worker.run_pass(&LoggingObserver);
//! println!("{summary}");
//! ```
//!
//! # Platform support
//!
//! Only Windows exposes the processor topology and process scheduling APIs this crate needs. On
//! other platforms every operating system call reports [`OsError::ERROR_NOT_SUPPORTED`]: the
//! fallback processor is always chosen and every pass is aborted.

mod binding_cycle;
mod config;
mod core_binder;
mod error;
mod pal;
mod primitive_types;
mod process_finder;
mod topology;
mod worker;

pub use binding_cycle::*;
pub use config::*;
pub use core_binder::*;
pub use error::*;
pub use primitive_types::*;
pub use process_finder::*;
pub use topology::*;
pub use worker::*;

//! calltrace - an in-process tracing and call-count profiling runtime for
//! instrumented native programs.
//!
//! The compiler emits a call to [`__cyg_profile_func_enter`] /
//! [`__cyg_profile_func_exit`] (or the register-preserving `__fentry__` /
//! `__return__` pair) at every function boundary of an instrumented build.
//! This crate consumes those events at full rate in one of two modes:
//!
//! - **trace** (default feature): every thread owns a cyclic ring of
//!   16-byte `(address, cycle)` events; the most recent window can be
//!   dumped on demand, by signal, or trimmed by time.
//! - **count**: calls are tallied per function address in a sparse
//!   page-table store and the totals are written at process exit.
//!
//! # Modules
//!
//! - [`clock`] - cycle counter and frequency discovery
//! - [`proc_maps`] - executable-segment enumeration
//! - [`counters`] - the sparse page-table counter store
//! - [`ring`] - the per-thread event ring
//! - [`extract`] - time-bounded extraction from overwritten buffers
//! - [`registry`] - the set of live rings and the output file
//! - [`snapshot`] - snapshot flavors and serialization
//! - [`container`] - the tagged-chunk trace file format
//! - [`ftrace`] - optional scheduler-event enrichment
//! - [`hooks`] - compiler hook surface and C ABI
//! - [`interpose`] - loader/thread/exception interposition
//! - [`lifecycle`] - process constructor/destructor and signal worker
//!
//! # Example
//!
//! ```no_run
//! // Record a time-bounded window and write it out without stopping the
//! // traced threads for the write.
//! let t = calltrace::now();
//! // ... traced work happens here ...
//! let snap = calltrace::get_snapshot_starting_at_time(t);
//! calltrace::write_snapshot("window.raw", &snap).unwrap();
//! ```

pub mod clock;
pub mod container;
pub mod counters;
pub mod extract;
pub mod ftrace;
pub mod hooks;
pub mod interpose;
pub mod lifecycle;
pub mod proc_maps;
pub mod registry;
pub mod ring;
pub mod snapshot;

pub use clock::{cycles_per_second, now};
pub use hooks::{__cyg_profile_func_enter, __cyg_profile_func_exit};
pub use registry::{
    disable_tracing, enable_tracing, ignore_current_thread, set_thread_log_buf_size,
};
pub use ring::{
    TraceEvent, DEFAULT_LOG_BUF_SIZE, FLAG_CALL, FLAG_CATCH, FLAG_RETURN,
    FLAG_RETURN_WITH_CALLER, FLAG_TAILCALL,
};
pub use snapshot::{
    get_snapshot, get_snapshot_starting_at_time, get_snapshot_up_to_age, write_current_snapshot,
    write_snapshot, Snapshot,
};

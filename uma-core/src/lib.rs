//! Core of the UMA Serve daemon.
//!
//! A single thread owns every moving part: the readiness poller feeds an
//! event loop ([`server::Server`]) that accepts Unix-socket clients, parses
//! length-prefixed JSON requests into per-connection sessions, and once per
//! iteration lets the scheduler fuse work from all live sessions into one
//! batched call to the model runtime.
//!
//! | Module | Responsibility |
//! |---|---|
//! | `ipc::protocol` | framed-JSON wire codec, request/event types |
//! | `ipc::poller`   | epoll/kqueue readiness abstraction |
//! | `ipc::listener` | Unix-domain listen socket |
//! | `ipc::session`  | per-connection state machine |
//! | `ipc::store`    | session ownership, request parsing, close/cleanup |
//! | `engine`        | runtime trait, lockstep batch, mock runtime |
//! | `sched`         | tick, policy, sampler, adaptive sizer, ΣBMT units |
//! | `metrics`       | lock-free counters + snapshot |
//! | `server`        | the event loop |
//! | `config`        | CLI/env configuration |

pub mod config;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod metrics;
pub mod sched;
pub mod server;

pub use config::Config;
pub use error::ServerError;

//! Request orchestration for header bidding and ad server plugins.
//!
//! A page registers ad definitions and plugins with an
//! [`orchestrator::Orchestrator`], then requests and destroys ads by element
//! id. Requests are batched, header bidders get a bounded time budget to
//! collect bids, and the single ad server renders whatever is still live.
//!
//! # Modules
//!
//! - [`ad_config`]: Ad placement definitions with per-plugin payloads
//! - [`callback`]: At-most-once completion callbacks
//! - [`constants`]: Default timeouts and bounds
//! - [`error`]: Error contexts for `error_stack` reports
//! - [`event`]: Event catalogue and listener handles
//! - [`event_bus`]: Publish/subscribe with listener failure isolation
//! - [`logging`]: Logger setup for binaries
//! - [`orchestrator`]: The public API and the request round state machine
//! - [`plugin`]: Contracts implemented by ad server and bidder plugins
//! - [`service`]: Adapters that guard and cache plugin calls
//! - [`settings`]: Tunable settings loaded from TOML and the environment
//! - [`test_support`]: Recording plugins and event recorders for tests

pub mod ad_config;
pub mod callback;
pub mod constants;
mod debug;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod logging;
pub mod orchestrator;
pub mod plugin;
pub mod service;
pub mod settings;

pub use orchestrator::Orchestrator;
pub use plugin::Plugin;

//! iothub-agent: a device-side telemetry agent
//!
//! Drives the `iothub-device-client` engine from a tokio runtime: sends a
//! periodic heartbeat, answers the `ping` direct method, reports its own
//! settings to the device twin and shuts the client down cleanly on Ctrl+C.
//!
//! ## Modules
//!
//! * `config`: `AgentConfig` (logger, client and telemetry sections) loaded
//!   from TOML and validated with `validator`.
//! * `logger`: `tracing` subscriber setup: console output (compact, pretty,
//!   JSON) and optional systemd journald.
//! * `status`: hub link status published on a watch channel.
//! * `agent`: the dispatch and heartbeat loop.

pub mod agent;
pub mod config;
pub mod logger;
pub mod status;

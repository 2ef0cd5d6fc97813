//! tunnelrack: run and supervise frpc/frps tunnel configurations.
//!
//! The `supervisor` module owns every running tunnel process and publishes the
//! running set and the shared log as observables. The other modules lay out the
//! configuration directories, persist settings, auto-start at boot, and provide
//! the control surface used by the command-line front end.

pub mod autostart;
pub mod config;
pub mod configs;
pub mod control;
pub mod events;
pub mod identity;
pub mod output;
pub mod process;
pub mod settings;
pub mod supervisor;

//! Dependency-ordered phase orchestration.
//!
//! A workflow is a set of [`phase::Phase`]s with declared dependencies. The
//! [`dag`] module partitions them into waves and runs each wave's phases as
//! concurrent child processes; the [`orchestrator`] drives the waves, applying
//! retry, skip and abort policy; [`gates`] score quality-gated artifacts; and every
//! launch and outcome is appended to a JSON-lines [`manifest`].

pub mod config;
pub mod dag;
pub mod errors;
pub mod gates;
pub mod manifest;
pub mod orchestrator;
pub mod phase;
pub mod telemetry;
pub mod ui;

//! Browser tasks: an async task execution and polling engine in front of a
//! single automation session.

pub mod api;
pub mod artifacts;
pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod tasks;
pub mod worker;

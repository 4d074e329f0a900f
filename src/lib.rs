//! Step Sandbox — out-of-process step execution with brokered capabilities.

pub mod broker;
pub mod config;
pub mod config_service;
pub mod context;
pub mod error;
pub mod executor;
pub mod protocol;
pub mod steps;
pub mod store;
pub mod worker;

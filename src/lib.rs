//! Flare: client core for an SOS emergency response page.
//!
//! # Overview
//!
//! A person who receives an SOS link views the alerter's status, live
//! location, and chat transcript, and can acknowledge, chat, and send
//! quick status replies. Flare reconciles two independently operated
//! real-time sources (the relational backend's row-change feed and a
//! key-value broadcast tree) plus a request/response gateway into one
//! consistent reactive state per alert.
//!
//! The two sources overlap on purpose upstream, so reconciliation is
//! explicit: location and status are replaced last-arrival-wins, chat is
//! merged by message id, and all user actions apply confirmed server
//! responses only.
//!
//! # Modules
//!
//! - [`model`]: Domain and wire types for alerts, messages, and templates
//! - [`error`]: Error taxonomy per boundary
//! - [`config`]: Environment configuration
//! - [`gateway`]: Request/response client for the alert gateway
//! - [`feeds`]: Dual real-time channel clients and the event adapter
//! - [`sync`]: Reconciliation state machine
//! - [`session`]: Presentation binding layer (reactive state + actions)
//! - [`api`]: HTTP routing surface

pub mod api;
pub mod config;
pub mod error;
pub mod feeds;
pub mod gateway;
pub mod model;
pub mod session;
pub mod sync;

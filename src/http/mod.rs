//! HTTP surface: routing, auth, and response shaping.

pub mod auth;
pub mod error;
pub mod reply;
pub mod routes;
pub mod state;

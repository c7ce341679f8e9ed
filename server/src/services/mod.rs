//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own business logic and persistence concerns so route
//! handlers can stay focused on protocol translation and auth plumbing.

pub mod identity;
pub mod membership;
pub mod notify;
pub mod presence;
pub mod relay;
pub mod typing;

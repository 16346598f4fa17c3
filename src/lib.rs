//! PricePoint authorization server core.
//!
//! Provides a transactional unit-of-work data-access layer, identity accessors
//! bound to the same session, and the client-credentials token exchange with
//! claim destination routing.

pub mod config;
pub mod errors;
pub mod identity;
pub mod oauth;
pub mod seed;
pub mod storage;

//! Fakes and fixtures shared by the federation unit tests.
//!
//! The fakes implement the same traits the production upstreams and
//! generators implement, so the router can be exercised end to end without a
//! network.

pub mod fixtures;

//! Caching primitives for urlstat.
//!
//! These primitives wrap a keyed computation (see [`Fetch`]) and expose the same interface,
//! so they can be layered on top of each other and on top of plain closures.
//!
//! Currently there is a [`SingleFlightCache`] that provides request coalescing and
//! keeps every outcome in memory for the lifetime of the cache.

#![warn(missing_docs)]

mod fetch;
mod single_flight;

pub use fetch::*;
pub use single_flight::*;

//! Vouch - proves possession of RSA keys, tracks live sessions and stores
//! signatures in which one registered key vouches for another.

pub mod challenge;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod maintainer;
pub mod protocol;
pub mod session;
pub mod store;
pub mod trust;

pub use error::{Error, Result};

//! Host requirements validation.
//!
//! Checks that vagrant can be run and that the cache root is writable
//! before any sandbox is provisioned.

mod requirements;

pub use requirements::{
    SystemRequirements, check_all, check_cache_root_writable, check_vagrant,
};

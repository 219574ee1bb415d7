//! The `utils` module provides the pieces shared across the router: the error
//! taxonomy and logging setup.

pub mod error;
pub mod logging;

pub use error::{MessageRouterError, Result};

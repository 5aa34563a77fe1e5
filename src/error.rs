pub use callcore::error::CallError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0} is required to build a call session controller")]
    MissingComponent(&'static str),
}

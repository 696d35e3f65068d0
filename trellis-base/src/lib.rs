mod error;
mod ids;

pub use error::{err, err_kind, Error, ErrorKind, Result};
pub use ids::ConceptId;

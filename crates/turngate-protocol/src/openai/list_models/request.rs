use serde::{Deserialize, Serialize};

/// `GET /v1/models` takes no body; this is an empty marker request used for
/// symmetry with the other typed request structs in this crate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListModelsRequest;

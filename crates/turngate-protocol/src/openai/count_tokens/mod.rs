pub mod request;
pub mod response;
pub mod types;

pub use request::{InputTokenCountRequest, InputTokenCountRequestBody};
pub use response::InputTokenCountResponse;
pub use types::InputTokenCount;

pub mod request;
pub mod response;
pub mod types;

pub use request::{ListInputItemsPath, ListInputItemsQuery, ListInputItemsRequest, ListOrder};
pub use response::ListInputItemsResponse;
pub use types::{
    ComputerToolCallOutputResource, FunctionToolCallOutputResource, FunctionToolCallResource,
    InputMessageResource, ItemResource, MCPApprovalResponseResource, ResponseItemList,
    ResponseItemListObjectType,
};

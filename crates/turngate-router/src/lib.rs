pub mod admin;
pub mod proxy;
pub mod wsv2;

pub use admin::admin_router;
pub use proxy::proxy_router;
pub use wsv2::{wsv2_router, Wsv2Runtime};

pub mod context;
pub mod dispatcher;
mod handler;
pub mod message;

pub use context::BoxBody;
pub use dispatcher::{Dispatched, Dispatcher, FALLBACK_HEADER};
pub use handler::handle_request;
pub use message::{ProxyRequest, ProxyResponse};

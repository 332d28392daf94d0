pub mod api;
pub mod http;
pub mod router;

pub use api::TaskApi;
pub use http::{Credential, HttpTaskApi, Route};
pub use router::{ModeRouter, Operation};

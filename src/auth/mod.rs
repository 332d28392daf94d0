pub mod refresher;
pub mod token_manager;

pub use refresher::{HttpTokenRefresher, TokenRefresher};
pub use token_manager::TokenManager;

pub mod auth;
pub mod gateway;
pub mod http;
mod main_logic;

pub use gateway::ChatGateway;
pub use http::{ApiError, AppState, build_router};
pub use main_logic::run;

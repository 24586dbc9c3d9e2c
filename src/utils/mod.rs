pub mod constants;
pub mod helpers;
pub mod app_config;

pub use constants::*;
pub use helpers::*;
pub use app_config::{AppConfig, GcpSettings, StackSettings};

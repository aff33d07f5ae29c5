pub mod context;
pub mod error_codes;
pub mod http;
pub mod server;
pub mod stdio;
pub mod tools;

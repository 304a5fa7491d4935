pub mod address;
pub mod cgi;
pub mod child;
pub mod fcgi;
pub mod file;
pub mod http;
pub mod lhttp;
pub mod loader;
pub mod was;

pub use address::{
    CgiAddress, FileAddress, HttpAddress, LhttpAddress, NfsAddress, ResourceAddress,
};
pub use loader::{DirectResourceLoader, RequestEnv, ResourceLoader};

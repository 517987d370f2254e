//! # slib-http
//!
//! An embeddable, non-blocking HTTP/1.1 service.
//!
//! Requests are parsed incrementally from each connection, handed to an
//! ordered chain of processors and, when no processor claims them, served
//! from static resources or answered with `404 Not Found`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use slib_http::{RequestContext, Service, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Service::create(ServiceConfig::new().with_port(8080))?;
//!     service.add_processor(|ctx: &mut RequestContext| {
//!         ctx.write("Hello, World!");
//!         true
//!     });
//!     tokio::signal::ctrl_c().await?;
//!     Ok(())
//! }
//! ```

pub mod http;
pub mod service;

pub use http::{Headers, Method, StatusCode};
pub use service::{
    Connection, ConnectionId, Processor, RequestContext, Service, ServiceConfig, ServiceError,
    ServiceHandle,
};

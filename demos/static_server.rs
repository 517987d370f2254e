//! Serves a directory over HTTP, plus a `/hello` endpoint.
//!
//! ```text
//! cargo run --example static_server -- [config.toml]
//! RUST_LOG=slib_http=debug cargo run --example static_server
//! ```

use slib_http::{RequestContext, Service, ServiceConfig};
use tracing_subscriber::EnvFilter;

fn hello(ctx: &mut RequestContext) -> bool {
    if ctx.path() != "/hello" {
        return false;
    }
    let name = ctx.parameter("name").unwrap_or("World").to_owned();
    ctx.write(format!("<h1>Hello, {name}!</h1>"));
    true
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::new()
            .with_port(8080)
            .with_resources(".", "")
            .with_log_debug(true),
    };

    let service = Service::create(config)?;
    service.add_processor(hello);
    for addr in service.local_addrs() {
        tracing::info!(%addr, "serving");
    }

    tokio::signal::ctrl_c().await?;
    service.release();
    Ok(())
}

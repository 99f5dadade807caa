//! CLI entry point: parse flags, resolve configuration, wire up logging,
//! register the sample routes, and run the server.

use clap::Parser;

use fiberweb::config::{CliArgs, Config};
use fiberweb::error::Error;
use fiberweb::handler::{HandlerFn, Request as HandlerRequest, Response as HandlerResponse};
use fiberweb::server::Server;

fn main() -> Result<(), Error> {
    let args = CliArgs::parse();
    let config = Config::resolve(&args)?;

    init_logging(config.log_level);

    let mut server = Server::new(config);
    install_default_routes(&mut server)?;

    server.run()
}

fn init_logging(level: u8) {
    let filter = match level {
        0 => "off",
        1 => "error",
        2..=3 => "warn",
        4..=5 => "info",
        6..=7 => "debug",
        _ => "trace",
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// A minimal health-check route so a freshly-built binary serves something
/// before user routes/libraries are registered elsewhere.
fn install_default_routes(server: &mut Server) -> Result<(), Error> {
    let health: HandlerFn = std::sync::Arc::new(|_req: &HandlerRequest| {
        Ok(HandlerResponse {
            status: 200,
            content: b"ok".to_vec(),
            headers: std::collections::HashMap::new(),
        })
    });
    server
        .add_route("/healthz", "healthz", health)
        .map_err(Error::Config)?;
    Ok(())
}

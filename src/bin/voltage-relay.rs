//! voltage-relay: relays Modbus register data to a local Unix-socket consumer
//!
//! ```text
//! voltage-relay --config /etc/voltage-relay.toml
//! voltage-relay --mode serve --address 0.0.0.0:1502 --socketfile /tmp/mbsocket -v
//! ```

use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use voltage_relay::{logging, relay, Args};

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.verbose);

    match relay::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

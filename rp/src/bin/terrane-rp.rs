// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that runs the Terrane resource-provider server

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use slog::info;
use std::net::SocketAddr;
use terrane_rp::config::Config;
use terrane_rp::Server;

#[derive(Debug, Parser)]
struct Args {
    #[clap(long, action)]
    config_file: Utf8PathBuf,

    /// Overrides the bind address from the config file.
    #[clap(long, action)]
    http_address: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let mut config = Config::from_file(&args.config_file)?;
    if let Some(address) = args.http_address {
        config.dropshot.bind_address = address;
    }

    let log = config
        .log
        .to_logger("terrane-rp")
        .context("failed to create logger")?;
    info!(&log, "config"; "config" => ?config);

    let server = Server::start(&config, log).await?;
    server
        .wait_for_shutdown()
        .await
        .map_err(|error| anyhow::anyhow!("server stopped: {}", error))
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Edgeprint, a background print service.
//
// Entry point.  Initialises logging, loads the configuration and runs the
// engine until Ctrl-C or SIGTERM.

mod services;

use std::process::ExitCode;

use services::{data_dir, engine};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Edgeprint starting");

    let result = async {
        let dir = data_dir::data_dir()?;
        let config = engine::load_config(&dir)?;
        engine::run(config, &dir).await
    }
    .await;

    match result {
        Ok(()) => {
            tracing::info!("Edgeprint stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Edgeprint failed");
            ExitCode::FAILURE
        }
    }
}

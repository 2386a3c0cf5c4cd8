// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The Meta-Transaction Relayer binary.

use structopt::StructOpt;
use tokio::signal::unix;

use mtx_relayer_config::cli::{
    create_store, data_dir, load_config, setup_logger, Opts,
};
use mtx_relayer_context::RelayerContext;
use mtx_relayer_utils::probe;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Opts::from_args();
    setup_logger(args.verbose)?;
    match dotenv::dotenv() {
        Ok(_) => {
            tracing::trace!("Loaded .env file");
        }
        Err(e) => {
            tracing::warn!("Failed to load .env file: {}", e);
        }
    }

    // The configuration is validated and configured from the given directory
    let config = load_config(args.config_dir.clone())?;

    // persistent storage for the relayer
    let store = create_store(&args)?;
    let ctx = RelayerContext::new(config, store);

    // generated keys are kept next to the store, unless running on a
    // temporary store.
    let key_dir = if args.tmp {
        std::env::temp_dir().join("mtx-relayer")
    } else {
        let store_dir = data_dir(&args)?;
        match store_dir.parent() {
            Some(parent) => parent.to_path_buf(),
            None => store_dir,
        }
    };
    let (manager_keys, worker_keys) = ctx.key_managers(&key_dir)?;

    // start all background services.
    // this does not block, will fire the services on background tasks.
    let server =
        mtx_relayer::service::ignite(&ctx, manager_keys, worker_keys).await?;
    {
        let server = server.lock().await;
        tracing::info!(
            "Relay manager {:?} with {} workers",
            server.registration().manager_address(),
            server.registration().worker_addresses().len(),
        );
    }
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Lifecycle,
        started = true
    );
    // watch for signals
    let mut ctrlc_signal = unix::signal(unix::SignalKind::interrupt())?;
    let mut termination_signal = unix::signal(unix::SignalKind::terminate())?;
    let mut quit_signal = unix::signal(unix::SignalKind::quit())?;
    let shutdown = || {
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Lifecycle,
            shutdown = true
        );
        tracing::warn!("Shutting down...");
        // send shutdown signal to all of the application.
        ctx.shutdown();
        std::thread::sleep(std::time::Duration::from_millis(300));
        tracing::info!("Clean Exit ..");
    };
    tokio::select! {
        _ = ctrlc_signal.recv() => {
            tracing::warn!("Interrupted (Ctrl+C) ...");
            shutdown();
        },
        _ = termination_signal.recv() => {
            tracing::warn!("Got Terminate signal ...");
            shutdown();
        },
        _ = quit_signal.recv() => {
            tracing::warn!("Quitting ...");
            shutdown();
        },
    }
    Ok(())
}

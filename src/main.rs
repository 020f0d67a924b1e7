// Copyright (c) 2025 TexasFortress.AI
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use vmail::actions::ActionWorker;
use vmail::config::Settings;
use vmail::crypto::CredentialCipher;
use vmail::events::EventBus;
use vmail::idle::IdleSupervisor;
use vmail::pool::{ConnectionPool, DialingFactory, PoolConfig};
use vmail::service::Mailroom;
use vmail::smtp::SmtpService;
use vmail::store::Store;
use vmail::sync::SyncEngine;

/// V-Mail synchronization core daemon: connection pool, sync engine, action
/// worker, and IDLE listeners. The HTTP/WebSocket layer talks to this
/// process through the `Mailroom` facade.
#[derive(Parser, Debug)]
#[command(name = "vmail-server", version, about)]
struct Args {
    /// Path to an optional TOML configuration file.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args = Args::parse();

    // Load .env file if present
    dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    info!("starting vmail-server...");

    let settings = match Settings::new(args.config.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to load configuration: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                e.to_string(),
            ));
        }
    };

    let cipher = match CredentialCipher::from_hex_key(&settings.encryption_master_key) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("invalid encryption master key: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                e.to_string(),
            ));
        }
    };

    let store = match Store::connect(&settings.database_url).await {
        Ok(s) => s,
        Err(e) => {
            error!("database connection failed: {}", e);
            return Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
        }
    };
    info!("database ready");

    let shutdown = CancellationToken::new();
    let pool_config = PoolConfig::from(&settings.pool);
    let factory = Arc::new(DialingFactory::from_config(&pool_config));
    let pool = ConnectionPool::new(pool_config, factory, shutdown.clone());

    let engine = Arc::new(SyncEngine::new(
        store.clone(),
        Arc::clone(&pool),
        Arc::clone(&cipher),
        settings.cache_ttl(),
        std::time::Duration::from_secs(settings.sync.count_refresh_timeout_seconds),
    ));

    let bus = Arc::new(EventBus::new());
    let idle = IdleSupervisor::new(
        Arc::clone(&pool),
        Arc::clone(&engine),
        Arc::clone(&bus),
        shutdown.clone(),
    );

    let smtp = Arc::new(SmtpService::new(Arc::clone(&cipher), settings.pool.use_tls));
    let worker = ActionWorker::new(
        store.clone(),
        Arc::clone(&pool),
        Arc::clone(&cipher),
        smtp,
        shutdown.clone(),
    );
    let worker_handle = tokio::spawn(worker.run());

    let _mailroom = Arc::new(Mailroom::new(
        store,
        Arc::clone(&pool),
        engine,
        bus,
        cipher,
        idle,
        settings.undo_send_delay_seconds,
    ));
    info!("mailroom ready; action worker polling");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    shutdown.cancel();
    pool.shutdown().await;
    let _ = worker_handle.await;

    info!("vmail-server stopped");
    Ok(())
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2024 RemasteredArch
// Copyright © 2024 Jaxydog
//
// This file is part of smtp_gateway.
//
// smtp_gateway is free software: you can redistribute it and/or modify it under the terms of the
// GNU Affero General Public License as published by the Free Software Foundation, either version
// 3 of the License, or (at your option) any later version.
//
// smtp_gateway is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See
// the GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License along with
// smtp_gateway. If not, see <https://www.gnu.org/licenses/>.

//! Binds the configured SMTP and POP3 listeners and drives them forever.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use futures_util::{pin_mut, StreamExt};
use mailsrv::{
    config::Config, dispatcher::Dispatcher, listener, lock_registry::MailboxLockRegistry,
};
use tokio::net::TcpListener;
use tracing::{error, info, Level};

/// A small mail server: one SMTP listener for inbound submission, one POP3 listener for
/// retrieval, sharing a filesystem-backed mailbox store.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the server's configuration file.
    #[clap(default_value = "conf")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::read_file(&args.config)
        .await
        .map_err(|reason| anyhow::anyhow!(reason))
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    let config = Arc::new(config);

    let max_level = if config.debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(max_level).init();

    let Some(smtp_addr) = config.smtp else {
        bail!("configuration has no server.smtp address");
    };
    let Some(pop_addr) = config.pop else {
        bail!("configuration has no server.pop address");
    };

    let smtp_listener = TcpListener::bind(smtp_addr)
        .await
        .with_context(|| format!("failed to bind SMTP listener on {smtp_addr}"))?;
    let pop_listener = TcpListener::bind(pop_addr)
        .await
        .with_context(|| format!("failed to bind POP3 listener on {pop_addr}"))?;

    info!(%smtp_addr, %pop_addr, hostname = %config.hostname, "mailsrv starting");

    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config)));
    let lock_registry = MailboxLockRegistry::new();

    let help_seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as usize);

    let smtp = tokio::spawn(drive_smtp(
        smtp_listener,
        Arc::clone(&config),
        dispatcher,
        help_seed,
    ));
    let pop = tokio::spawn(drive_pop(pop_listener, config, lock_registry));

    let (smtp_result, pop_result) = tokio::join!(smtp, pop);
    smtp_result?;
    pop_result?;

    Ok(())
}

async fn drive_smtp(
    listener: TcpListener,
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    help_seed: usize,
) {
    let accepted = listener::listen_smtp(listener, config, dispatcher, help_seed);
    pin_mut!(accepted);

    while let Some(result) = accepted.next().await {
        match result {
            Ok(handle) => {
                tokio::spawn(async move {
                    if let Err(err) = handle.await {
                        error!(error = %err, "smtp session task panicked");
                    }
                });
            }
            Err(err) => error!(error = %err, "smtp accept failed"),
        }
    }
}

async fn drive_pop(listener: TcpListener, config: Arc<Config>, lock_registry: Arc<MailboxLockRegistry>) {
    let accepted = listener::listen_pop(listener, config, lock_registry);
    pin_mut!(accepted);

    while let Some(result) = accepted.next().await {
        match result {
            Ok(handle) => {
                tokio::spawn(async move {
                    if let Err(err) = handle.await {
                        error!(error = %err, "pop session task panicked");
                    }
                });
            }
            Err(err) => error!(error = %err, "pop accept failed"),
        }
    }
}

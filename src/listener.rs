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

//! Accepts TCP connections on a configured endpoint and spawns a session task per connection.
//!
//! Each [`listen_smtp`]/[`listen_pop`] call returns a [`Stream`] of per-connection
//! [`JoinHandle`]s rather than looping forever itself: the caller decides whether to drive it
//! to completion (the long-running case, in `mailsrv-cli`) or pull a bounded number of items
//! (tests). One failed `accept` doesn't end the stream — it's yielded as an `Err` item and the
//! loop continues, matching spec §7's "no error is fatal to the server process; listeners log
//! and continue accepting".

use std::sync::Arc;

use async_stream::stream;
use futures_core::Stream;
use tokio::{
    io::BufReader,
    net::TcpListener,
    task::JoinHandle,
};
use tracing::{info, info_span, warn, Instrument};

use crate::{
    config::Config, dispatcher::Dispatcher, error::MailError, lock_registry::MailboxLockRegistry,
    pop::PopSession, smtp::SmtpSession,
};

/// Accept SMTP connections on `listener`, spawning an [`SmtpSession`] per connection.
///
/// `help_seed` is the single per-process seed for `HELP`'s canned-message choice (spec §4.5/§9);
/// every session spawned from this listener shares it.
pub fn listen_smtp(
    listener: TcpListener,
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    help_seed: usize,
) -> impl Stream<Item = std::io::Result<JoinHandle<Result<(), MailError>>>> {
    stream! {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "smtp accept failed");
                    yield Err(err);
                    continue;
                }
            };

            let config = Arc::clone(&config);
            let dispatcher = Arc::clone(&dispatcher);

            let handle = tokio::spawn(
                async move {
                    info!("smtp connection accepted");
                    let (read_half, write_half) = stream.into_split();
                    let reader = BufReader::new(read_half);
                    let session = SmtpSession::new(reader, write_half, config, dispatcher, help_seed);
                    let result = session.run().await;
                    info!(?result, "smtp connection closed");
                    result
                }
                .instrument(info_span!("smtp", %peer)),
            );

            yield Ok(handle);
        }
    }
}

/// Accept POP3 connections on `listener`, spawning a [`PopSession`] per connection.
pub fn listen_pop(
    listener: TcpListener,
    config: Arc<Config>,
    lock_registry: Arc<MailboxLockRegistry>,
) -> impl Stream<Item = std::io::Result<JoinHandle<Result<(), MailError>>>> {
    stream! {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "pop accept failed");
                    yield Err(err);
                    continue;
                }
            };

            let config = Arc::clone(&config);
            let lock_registry = Arc::clone(&lock_registry);

            let handle = tokio::spawn(
                async move {
                    info!("pop connection accepted");
                    let (read_half, write_half) = stream.into_split();
                    let reader = BufReader::new(read_half);
                    let session = PopSession::new(reader, write_half, config, lock_registry);
                    let result = session.run().await;
                    info!(?result, "pop connection closed");
                    result
                }
                .instrument(info_span!("pop", %peer)),
            );

            yield Ok(handle);
        }
    }
}

#[cfg(test)]
mod test {
    use futures_util::{pin_mut, StreamExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::config::{Credential, UserRecord};

    fn config(maildir: std::path::PathBuf) -> Arc<Config> {
        let mut config = Config::default();
        config.hostname = "localhost".to_owned();
        config.maildir = maildir;
        config.users.insert(
            "joe".to_owned(),
            UserRecord {
                credential: Credential::Cleartext("123".to_owned()),
                lists: Vec::new(),
            },
        );
        Arc::new(config)
    }

    #[tokio::test]
    async fn accepted_smtp_connection_gets_banner() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = config(std::env::temp_dir().join("mailsrv-test-listener-smtp"));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config)));

        let stream = listen_smtp(listener, config, dispatcher, 0);
        tokio::spawn(async move {
            pin_mut!(stream);
            stream.next().await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();

        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("220 "));
    }

    #[tokio::test]
    async fn accepted_pop_connection_gets_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = config(std::env::temp_dir().join("mailsrv-test-listener-pop"));
        let lock_registry = MailboxLockRegistry::new();

        let stream = listen_pop(listener, config, lock_registry);
        tokio::spawn(async move {
            pin_mut!(stream);
            stream.next().await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await.unwrap();

        assert!(std::str::from_utf8(&buf[..n]).unwrap().starts_with("+OK"));
    }
}

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

//! The SMTP session, `Greeted -> Identified -> Mail -> DataIn -> Identified` per the protocol.
//!
//! As in [`crate::pop`], the lifecycle isn't tracked with an explicit state enum: it collapses
//! onto `sender_host`/`draft` going from `None` to `Some` and back, since nothing here needs to
//! distinguish a state from the fields that define it.
//!
//! Builds a [`Mail`] draft over the course of one transaction and hands it, with the stamped
//! body text, to a [`Dispatcher`] on `DATA` completion.

pub mod path;

use std::sync::Arc;

use base64::Engine;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, info, warn};

use self::path::Path;
use crate::{config::Config, dispatcher::Dispatcher, error::MailError, line_io::LineIO};

/// A `250`-series SMTP reply code.
const OK: u16 = 250;

/// An in-progress SMTP transaction: a reverse-path plus the forward-paths accepted so far.
#[derive(Debug, Clone)]
pub struct Mail {
    pub reverse_path: Path,
    pub forward_paths: Vec<Path>,
}

impl Mail {
    const fn new(reverse_path: Path) -> Self {
        Self {
            reverse_path,
            forward_paths: Vec::new(),
        }
    }
}

/// The small, fixed table of canned `HELP` responses, per spec §4.5/§9. One is picked
/// deterministically per process (seeded once from process start time truncated to seconds),
/// matching the original implementation's `helpSeed`.
const HELP_MESSAGES: &[&str] = &[
    "Nah, go RTFM",
    "Sorry, I'm busy right now",
    "Error: not a psychiatrist",
    "Usage: HELP",
    "Unknown command: HELP. Try HELP for more info",
    "Face not recognized",
    "Maybe, take a vacation?",
];

/// An SMTP session over one TCP connection.
pub struct SmtpSession<R, W> {
    io: LineIO<R, W>,
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    sender_host: Option<String>,
    draft: Option<Mail>,
    authenticated: bool,
    help_index: usize,
}

impl<R, W> SmtpSession<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Build a session, picking the process-deterministic `HELP` message index from `help_seed`
    /// (seconds since some fixed epoch at process start — passed in rather than read from the
    /// clock here, so the same seed applies to every session in one process run).
    pub fn new(
        reader: R,
        writer: W,
        config: Arc<Config>,
        dispatcher: Arc<Dispatcher>,
        help_seed: usize,
    ) -> Self {
        Self {
            io: LineIO::new(reader, writer),
            config,
            dispatcher,
            sender_host: None,
            draft: None,
            authenticated: false,
            help_index: help_seed % HELP_MESSAGES.len(),
        }
    }

    /// Run the session to completion: send the banner, then loop reading and dispatching
    /// commands until `QUIT` or the connection closes.
    ///
    /// # Errors
    ///
    /// [`MailError::Transport`] if the connection is closed or fails; other [`MailError`]
    /// variants are caught internally and turned into wire replies, so the loop continues.
    pub async fn run(mut self) -> Result<(), MailError> {
        self.io
            .send(220, &format!("{} ready", self.config.hostname))
            .await?;

        loop {
            let read = tokio::time::timeout(crate::timeouts::SERVER_TIMEOUT, self.io.read_command()).await;

            let command = match read {
                Ok(Ok(command)) => command,
                Ok(Err(MailError::Transport)) => return Ok(()),
                Ok(Err(MailError::Protocol(reason))) => {
                    self.reply(500, &reason).await?;
                    continue;
                }
                Ok(Err(err)) => return Err(err),
                Err(_elapsed) => {
                    self.reply(421, "Timeout waiting for command").await?;
                    return Ok(());
                }
            };

            if self.config.debug {
                debug!(verb = %command.verb, arg = ?command.arg, "smtp command");
            }

            if command.verb == "QUIT" {
                self.reply(221, "So long, Bob").await?;
                return Ok(());
            }

            self.dispatch(&command.verb, command.arg.as_deref()).await?;
        }
    }

    async fn dispatch(&mut self, verb: &str, arg: Option<&str>) -> Result<(), MailError> {
        match verb {
            "HELO" => self.cmd_helo(arg).await,
            "EHLO" => self.cmd_ehlo(arg).await,
            "MAIL" => self.cmd_mail(arg).await,
            "RCPT" => self.cmd_rcpt(arg).await,
            "DATA" => self.cmd_data().await,
            "RSET" => self.cmd_rset().await,
            "HELP" => {
                let message = HELP_MESSAGES[self.help_index];
                self.reply(214, message).await
            }
            "AUTH" => self.cmd_auth(arg).await,
            "VRFY" | "TURN" | "SOML" | "SAML" => self.reply(502, "Obsolete command").await,
            _ => self.reply(500, "Unknown command").await,
        }
    }

    /// Send a reply, logging it at `debug` level when `server.debug` is configured, per
    /// SPEC_FULL.md's ambient logging section.
    async fn reply(&mut self, code: u16, text: &str) -> Result<(), MailError> {
        if self.config.debug {
            debug!(code, text, "smtp reply");
        }

        self.io.send(code, text).await
    }

    async fn cmd_helo(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        let Some(host) = arg.map(str::trim).filter(|h| !h.is_empty()) else {
            return self.reply(501, "Argument expected").await;
        };

        self.sender_host = Some(host.to_owned());

        self.reply(OK, &format!("Go ahead, {host}")).await
    }

    async fn cmd_ehlo(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        let Some(host) = arg.map(str::trim).filter(|h| !h.is_empty()) else {
            return self.reply(501, "Argument expected").await;
        };

        self.sender_host = Some(host.to_owned());

        if self.config.debug {
            debug!(code = OK, greeting = %host, "smtp reply: multi-line EHLO");
        }

        let mut batch = self.io.begin_batch(OK);
        batch.send(format!("Hello, {host}")).await?;
        batch.send("HELP").await?;
        batch.send("AUTH").await?;
        batch.end().await
    }

    async fn cmd_mail(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        if self.sender_host.is_none() {
            return self.reply(503, "HELO expected").await;
        }

        let Some(arg) = arg else {
            return self
                .reply(501, "The format is: MAIL FROM:<reverse-path>[ <params>]")
                .await;
        };

        let Some(rest) = strip_prefix_ci(arg, "FROM:") else {
            return self
                .reply(501, "The format is: MAIL FROM:<reverse-path>[ <params>]")
                .await;
        };

        let (path_text, params) = match rest.find(' ') {
            Some(index) => (&rest[..index], Some(rest[index + 1..].trim())),
            None => (rest, None),
        };

        let reverse_path = match Path::parse(path_text) {
            Ok(path) => path,
            Err(_) => return self.reply(501, "Malformed reverse-path").await,
        };

        if self.config.debug {
            if let Some(params) = params.filter(|p| !p.is_empty()) {
                debug!(params, "MAIL params (ignored)");
            }
        }

        self.draft = Some(Mail::new(reverse_path));

        self.reply(OK, "OK").await
    }

    async fn cmd_rcpt(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        if self.draft.is_none() {
            return self.reply(503, "Not in mail mode").await;
        }

        let Some(arg) = arg else {
            return self.reply(501, "The format is: RCPT TO:<forward-path>").await;
        };

        let Some(path_text) = strip_prefix_ci(arg, "TO:") else {
            return self.reply(501, "The format is: RCPT TO:<forward-path>").await;
        };

        let forward_path = match Path::parse(path_text) {
            Ok(path) => path,
            Err(_) => return self.reply(501, "Malformed forward-path").await,
        };

        if !forward_path.hosts.is_empty() {
            return self.reply(551, "This server does not relay").await;
        }

        let Some(address) = &forward_path.address else {
            return self.reply(501, "Malformed forward-path").await;
        };

        if !address.host.eq_ignore_ascii_case(&self.config.hostname) {
            return self.reply(550, "Not a local address").await;
        }

        if !self.config.is_local_recipient(&address.local) {
            return self.reply(550, "Unknown Recipient").await;
        }

        self.draft
            .as_mut()
            .expect("checked above")
            .forward_paths
            .push(forward_path);

        self.reply(OK, "OK").await
    }

    async fn cmd_data(&mut self) -> Result<(), MailError> {
        let Some(draft) = &self.draft else {
            return self.reply(503, "Not in mail mode").await;
        };

        if draft.forward_paths.is_empty() {
            return self.reply(503, "No recipients specified").await;
        }

        let reverse_path = draft.reverse_path.format();

        self.reply(354, "Start mail input, terminate with a dot line (.)")
            .await?;

        let body = match self.io.read_data().await {
            Ok(body) => body,
            Err(MailError::Protocol(reason)) => {
                self.draft = None;
                return self.reply(500, &reason).await;
            }
            Err(err) => return Err(err),
        };

        let sender_host = self.sender_host.as_deref().unwrap_or("unknown");
        let stamped = format!(
            "Return-Path: {reverse_path}\r\nReceived: from {sender_host} by {} ; {}\r\n{body}",
            self.config.hostname,
            chrono::Local::now().to_rfc2822(),
        );

        let draft = self.draft.take().expect("checked above");

        let ok = self.dispatcher.dispatch(&draft, &stamped).await;

        if ok {
            info!("message accepted");
            self.reply(OK, "OK").await
        } else {
            warn!("all recipients rejected");
            self.reply(554, "Transaction failed").await
        }
    }

    async fn cmd_rset(&mut self) -> Result<(), MailError> {
        self.draft = None;
        self.reply(OK, "OK").await
    }

    async fn cmd_auth(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        let Some(arg) = arg else {
            return self.reply(501, "AUTH mechanism expected").await;
        };

        let mut parts = arg.splitn(2, ' ');
        let mechanism = parts.next().unwrap_or_default();
        let Some(payload) = parts.next() else {
            return self.reply(501, "AUTH argument expected").await;
        };

        if mechanism != "PLAIN" {
            return self.reply(504, "Only PLAIN <...> is supported").await;
        }

        if self.authenticated {
            return self.reply(503, "Already authorized").await;
        }

        let (user, password) = match decode_plain_auth(payload) {
            Ok(pair) => pair,
            Err(reason) => return self.reply(501, &reason).await,
        };

        let valid = self
            .config
            .users
            .get(&user)
            .is_some_and(|record| record.verify(&password));

        if !valid {
            return self.reply(535, "Authentication credentials invalid").await;
        }

        self.authenticated = true;
        self.reply(235, "Authentication succeeded").await
    }
}

/// Case-insensitively strip a fixed prefix (e.g. `"FROM:"`) and return the remainder.
fn strip_prefix_ci<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    if input.len() >= prefix.len() && input[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&input[prefix.len()..])
    } else {
        None
    }
}

/// Decode an `AUTH PLAIN` argument: base64 of `\0user\0password`.
fn decode_plain_auth(payload: &str) -> Result<(String, String), String> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| e.to_string())?;
    let decoded = String::from_utf8(decoded).map_err(|e| e.to_string())?;

    let mut parts = decoded.split('\0');
    let _authzid = parts.next();
    let user = parts.next().ok_or("could not parse the auth string")?;
    let password = parts.next().ok_or("could not parse the auth string")?;

    if parts.next().is_some() {
        return Err("could not parse the auth string".to_owned());
    }

    Ok((user.to_owned(), password.to_owned()))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::config::{Credential, UserRecord};

    fn config() -> Arc<Config> {
        let mut config = Config::default();
        config.hostname = "localhost".to_owned();
        config.users.insert(
            "joe".to_owned(),
            UserRecord {
                credential: Credential::Cleartext("123".to_owned()),
                lists: Vec::new(),
            },
        );
        config.maildir = std::env::temp_dir().join(format!(
            "mailsrv-test-smtp-{}-{}",
            std::process::id(),
            chrono::Local::now().timestamp_nanos_opt().unwrap_or(0)
        ));
        Arc::new(config)
    }

    fn session(config: Arc<Config>) -> SmtpSession<tokio::io::BufReader<&'static [u8]>, Vec<u8>> {
        SmtpSession::new(
            tokio::io::BufReader::new(b"".as_slice()),
            Vec::new(),
            Arc::clone(&config),
            Arc::new(Dispatcher::new(config)),
            0,
        )
    }

    #[tokio::test]
    async fn helo_moves_to_identified_and_stashes_host() {
        let mut session = session(config());
        session.cmd_helo(Some("client.example")).await.unwrap();

        assert_eq!(session.sender_host.as_deref(), Some("client.example"));
    }

    #[tokio::test]
    async fn rcpt_to_relay_path_is_refused() {
        let mut session = session(config());
        session.cmd_helo(Some("c")).await.unwrap();
        session.cmd_mail(Some("FROM:<nobody@x>")).await.unwrap();
        session.cmd_rcpt(Some("TO:<@a,@b:x@localhost>")).await.unwrap();

        assert_eq!(
            std::str::from_utf8(session.io.writer()).unwrap().lines().last(),
            Some("551 This server does not relay")
        );
    }

    #[tokio::test]
    async fn rcpt_to_unknown_local_recipient_is_refused() {
        let mut session = session(config());
        session.cmd_helo(Some("c")).await.unwrap();
        session.cmd_mail(Some("FROM:<nobody@x>")).await.unwrap();
        session.cmd_rcpt(Some("TO:<nobody@localhost>")).await.unwrap();

        assert_eq!(
            std::str::from_utf8(session.io.writer()).unwrap().lines().last(),
            Some("550 Unknown Recipient")
        );
    }

    #[tokio::test]
    async fn auth_plain_with_correct_password_succeeds() {
        let mut session = session(config());
        // base64("\0joe\0123")
        session.cmd_auth(Some("PLAIN AGpvZQAxMjM=")).await.unwrap();

        assert!(session.authenticated);
        assert_eq!(
            std::str::from_utf8(session.io.writer()).unwrap().lines().last(),
            Some("235 Authentication succeeded")
        );
    }

    #[tokio::test]
    async fn auth_plain_with_wrong_password_fails() {
        let mut session = session(config());
        // base64("\0joe\0wrong")
        session
            .cmd_auth(Some("PLAIN AGpvZQB3cm9uZw=="))
            .await
            .unwrap();

        assert!(!session.authenticated);
        assert_eq!(
            std::str::from_utf8(session.io.writer()).unwrap().lines().last(),
            Some("535 Authentication credentials invalid")
        );
    }

    #[tokio::test]
    async fn auth_with_no_argument_is_501() {
        let mut session = session(config());
        session.cmd_auth(None).await.unwrap();

        assert_eq!(
            std::str::from_utf8(session.io.writer()).unwrap().lines().last(),
            Some("501 AUTH mechanism expected")
        );
    }
}

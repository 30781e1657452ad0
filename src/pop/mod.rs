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

//! The POP3 session, `Authorization-User -> Authorization-Pass -> Transaction -> Update`.
//!
//! As in [`crate::smtp`], there's no explicit state enum: the three authorization/transaction
//! states collapse naturally onto three optional fields (`username`, `inbox`, `lock`), each state
//! being exactly "the previous fields are set, this one isn't yet".

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::MailError,
    inbox_view::InboxView,
    line_io::LineIO,
    lock_registry::{MailboxLockGuard, MailboxLockRegistry},
    mailbox::Mailbox,
    str::CRLF,
};

/// A POP3 session over one TCP connection.
pub struct PopSession<R, W> {
    io: LineIO<R, W>,
    config: Arc<Config>,
    lock_registry: Arc<MailboxLockRegistry>,
    username: Option<String>,
    inbox: Option<InboxView>,
    lock: Option<MailboxLockGuard>,
}

impl<R, W> PopSession<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Build a session over `reader`/`writer`, not yet authenticated.
    pub fn new(reader: R, writer: W, config: Arc<Config>, lock_registry: Arc<MailboxLockRegistry>) -> Self {
        Self {
            io: LineIO::new(reader, writer),
            config,
            lock_registry,
            username: None,
            inbox: None,
            lock: None,
        }
    }

    /// Run the session to completion: greet, then loop reading and dispatching commands until
    /// `QUIT` or the connection closes.
    ///
    /// # Errors
    ///
    /// [`MailError::Transport`] is swallowed (an abrupt disconnect simply abandons any open
    /// [`InboxView`] without committing, per spec §4.4/§5); other [`MailError`] variants that
    /// escape [`Self::dispatch`] are propagated.
    pub async fn run(mut self) -> Result<(), MailError> {
        self.ok("POP3 server ready").await?;

        loop {
            let read = tokio::time::timeout(crate::timeouts::SERVER_TIMEOUT, self.io.read_command()).await;

            let command = match read {
                Ok(Ok(command)) => command,
                Ok(Err(MailError::Transport)) => return Ok(()),
                Ok(Err(MailError::Protocol(reason))) => {
                    self.err(&reason).await?;
                    continue;
                }
                Ok(Err(err)) => return Err(err),
                Err(_elapsed) => {
                    self.err("Timeout waiting for command").await?;
                    return Ok(());
                }
            };

            if self.config.debug {
                debug!(verb = %command.verb, arg = ?command.arg, "pop command");
            }

            if command.verb == "QUIT" {
                return self.quit().await;
            }

            self.dispatch(&command.verb, command.arg.as_deref()).await?;
        }
    }

    async fn dispatch(&mut self, verb: &str, arg: Option<&str>) -> Result<(), MailError> {
        match verb {
            "USER" => self.cmd_user(arg).await,
            "PASS" => self.cmd_pass(arg).await,
            "STAT" => self.cmd_stat().await,
            "LIST" => self.cmd_list(arg).await,
            "RETR" => self.cmd_retr(arg).await,
            "DELE" => self.cmd_dele(arg).await,
            "NOOP" => self.cmd_noop().await,
            "LAST" => self.cmd_last().await,
            "RSET" => self.cmd_rset().await,
            "UIDL" => self.cmd_uidl(arg).await,
            "TOP" => self.cmd_top(arg).await,
            "RPOP" => self.err("not supported").await,
            _ => self.err("Unknown command").await,
        }
    }

    /// Send a `+OK` reply, logging it at `debug` level when `server.debug` is configured, per
    /// SPEC_FULL.md's ambient logging section.
    async fn ok(&mut self, text: &str) -> Result<(), MailError> {
        if self.config.debug {
            debug!(status = "+OK", text, "pop reply");
        }

        self.io.ok(text).await
    }

    /// Send a `-ERR` reply, logging it at `debug` level when `server.debug` is configured.
    async fn err(&mut self, text: &str) -> Result<(), MailError> {
        if self.config.debug {
            debug!(status = "-ERR", text, "pop reply");
        }

        self.io.err(text).await
    }

    /// Send a multi-line `LIST`/`UIDL` reply, logging it at `debug` level when `server.debug` is
    /// configured.
    async fn send_list(&mut self, lines: Vec<String>) -> Result<(), MailError> {
        if self.config.debug {
            debug!(count = lines.len(), "pop reply: multi-line list");
        }

        self.io.send_list(lines).await
    }

    /// Send a dot-stuffed `RETR`/`TOP` data block, logging it at `debug` level when
    /// `server.debug` is configured.
    async fn send_data(&mut self, text: &str) -> Result<(), MailError> {
        if self.config.debug {
            debug!(bytes = text.len(), "pop reply: data block");
        }

        self.io.send_data(text).await
    }

    async fn cmd_user(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        if self.inbox.is_some() {
            return self.err("Wrong commands order").await;
        }

        let Some(name) = arg.map(str::trim).filter(|n| !n.is_empty()) else {
            return self.err("USER requires a name").await;
        };

        self.username = Some(name.to_owned());
        self.ok("").await
    }

    async fn cmd_pass(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        if self.inbox.is_some() {
            return self.err("Wrong commands order").await;
        }

        let Some(name) = self.username.clone() else {
            return self.err("Wrong commands order").await;
        };

        let password = arg.unwrap_or("");

        let valid = self
            .config
            .users
            .get(&name)
            .is_some_and(|record| record.verify(password));

        if !valid {
            self.username = None;
            return self.err("Authentication credentials invalid").await;
        }

        let mailbox = Mailbox::new(self.config.maildir.join(&name));

        let lock = match self.lock_registry.acquire(mailbox.path().to_path_buf()) {
            Ok(lock) => lock,
            Err(MailError::BusyMailbox(_)) => {
                self.username = None;
                return self.err("Busy").await;
            }
            Err(err) => return Err(err),
        };

        let view = match InboxView::new(mailbox).await {
            Ok(view) => view,
            Err(err) => {
                self.username = None;
                return self.err(&err.reason()).await;
            }
        };

        info!(user = %name, "pop session authenticated");
        self.inbox = Some(view);
        self.lock = Some(lock);

        self.ok("").await
    }

    async fn cmd_noop(&mut self) -> Result<(), MailError> {
        if self.inbox.is_none() {
            return self.err("Unauthorized").await;
        }

        self.ok("").await
    }

    async fn cmd_stat(&mut self) -> Result<(), MailError> {
        let Some(view) = self.inbox.as_ref() else {
            return self.err("Unauthorized").await;
        };

        let (count, size) = view.stat();
        self.ok(&format!("{count} {size}")).await
    }

    async fn cmd_list(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        let Some(view) = self.inbox.as_ref() else {
            return self.err("Unauthorized").await;
        };

        match arg {
            None => {
                let lines = view
                    .entries()
                    .map(|entry| format!("{} {}", entry.id(), entry.message().size()))
                    .collect::<Vec<_>>();
                self.ok("List follows").await?;
                self.send_list(lines).await
            }
            Some(id) => {
                let reply = view
                    .find_by_id(id)
                    .filter(|entry| !entry.is_deleted())
                    .map(|entry| format!("{} {}", entry.id(), entry.message().size()));
                match reply {
                    Some(text) => self.ok(&text).await,
                    None => self.err("no such message").await,
                }
            }
        }
    }

    async fn cmd_retr(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        let Some(view) = self.inbox.as_mut() else {
            return self.err("Unauthorized").await;
        };
        let Some(id) = arg else {
            return self.err("RETR requires a message number").await;
        };

        let Some(entry) = view.find_by_id(id).filter(|entry| !entry.is_deleted()) else {
            return self.err("no such message").await;
        };
        let numeric_id = entry.id();
        let message = entry.message().clone();

        let mailbox = Mailbox::new(self.config.maildir.join(self.username.as_deref().unwrap_or_default()));
        let text = match mailbox.read(&message).await {
            Ok(text) => text,
            Err(err) => return self.err(&err.reason()).await,
        };

        self.ok(&format!("{} octets", message.size())).await?;
        self.send_data(&text).await?;

        self.inbox.as_mut().expect("checked above").mark_retrieved(numeric_id);

        Ok(())
    }

    async fn cmd_dele(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        let Some(view) = self.inbox.as_mut() else {
            return self.err("Unauthorized").await;
        };
        let Some(id) = arg else {
            return self.err("DELE requires a message number").await;
        };

        match view.find_by_id(id) {
            None => self.err("no such message").await,
            Some(entry) if entry.is_deleted() => self.err("message already deleted").await,
            Some(entry) => {
                let numeric_id = entry.id();
                view.mark_deleted(id)?;
                self.ok(&format!("message {numeric_id} deleted")).await
            }
        }
    }

    async fn cmd_last(&mut self) -> Result<(), MailError> {
        let Some(view) = self.inbox.as_ref() else {
            return self.err("Unauthorized").await;
        };

        let last_id = view.last_id();
        self.ok(&last_id.to_string()).await
    }

    async fn cmd_rset(&mut self) -> Result<(), MailError> {
        let Some(view) = self.inbox.as_mut() else {
            return self.err("Unauthorized").await;
        };

        view.reset().await?;
        self.ok("").await
    }

    async fn cmd_uidl(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        let Some(view) = self.inbox.as_ref() else {
            return self.err("Unauthorized").await;
        };

        match arg {
            None => {
                let lines = view
                    .entries()
                    .map(|entry| format!("{} {}", entry.id(), entry.message().filename()))
                    .collect::<Vec<_>>();
                self.ok("").await?;
                self.send_list(lines).await
            }
            Some(id) => {
                let reply = view
                    .find_by_id(id)
                    .filter(|entry| !entry.is_deleted())
                    .map(|entry| format!("{} {}", entry.id(), entry.message().filename()));
                match reply {
                    Some(text) => self.ok(&text).await,
                    None => self.err("no such message").await,
                }
            }
        }
    }

    /// `TOP <id> <n>`: headers through the first blank line, then up to `n` body lines, via the
    /// dot-stuffing writer. Deleted entries are treated uniformly as "no such message", same as
    /// `RETR`/`LIST`, per spec §9's stated principle extended here for consistency.
    async fn cmd_top(&mut self, arg: Option<&str>) -> Result<(), MailError> {
        let Some(view) = self.inbox.as_ref() else {
            return self.err("Unauthorized").await;
        };
        let Some(arg) = arg else {
            return self.err("TOP requires a message number and line count").await;
        };

        let mut parts = arg.split_whitespace();
        let (Some(id), Some(n)) = (parts.next(), parts.next()) else {
            return self.err("TOP requires a message number and line count").await;
        };
        let Ok(n) = n.parse::<usize>() else {
            return self.err("malformed line count").await;
        };

        let Some(entry) = view.find_by_id(id).filter(|entry| !entry.is_deleted()) else {
            return self.err("No such message").await;
        };
        let message = entry.message().clone();

        let mailbox = Mailbox::new(self.config.maildir.join(self.username.as_deref().unwrap_or_default()));
        let text = match mailbox.read(&message).await {
            Ok(text) => text,
            Err(err) => return self.err(&err.reason()).await,
        };

        let out = headers_and_body_lines(&text, n);

        self.ok("").await?;
        self.send_data(&out).await
    }

    /// `QUIT` from any state: in `Transaction`, commits the [`InboxView`] (writing `last` then
    /// applying deletions) before replying; in `Authorization-*`, nothing has been opened to
    /// commit. Either way, the session ends after this reply.
    async fn quit(mut self) -> Result<(), MailError> {
        let Some(view) = self.inbox.take() else {
            return self.ok("").await;
        };

        match view.commit().await {
            Ok(()) => self.ok("").await,
            Err(err) => {
                warn!(error = %err, "pop commit failed");
                self.err(&err.reason()).await
            }
        }
    }
}

/// Split `text` into the header block (through the first blank line, inclusive) plus up to `n`
/// subsequent body lines, re-joined with `CRLF`. Mirrors `TOP`'s contract in spec §4.4.
fn headers_and_body_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.split(CRLF).collect();
    let mut out = String::new();
    let mut i = 0;

    while i < lines.len() {
        out.push_str(lines[i]);
        out.push_str(CRLF);
        if lines[i].is_empty() {
            break;
        }
        i += 1;
    }

    i += 1;
    let mut remaining = n;
    while i < lines.len() && remaining > 0 {
        out.push_str(lines[i]);
        out.push_str(CRLF);
        i += 1;
        remaining -= 1;
    }

    out
}

#[cfg(test)]
mod test {
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

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "mailsrv-test-pop-{name}-{}-{}",
            std::process::id(),
            chrono::Local::now().timestamp_nanos_opt().unwrap_or(0)
        ))
    }

    fn session(
        config: Arc<Config>,
        lock_registry: Arc<MailboxLockRegistry>,
    ) -> PopSession<tokio::io::BufReader<&'static [u8]>, Vec<u8>> {
        PopSession::new(
            tokio::io::BufReader::new(b"".as_slice()),
            Vec::new(),
            config,
            lock_registry,
        )
    }

    fn last_line(session: &PopSession<tokio::io::BufReader<&'static [u8]>, Vec<u8>>) -> String {
        std::str::from_utf8(session.io.writer())
            .unwrap()
            .lines()
            .last()
            .unwrap()
            .to_owned()
    }

    #[tokio::test]
    async fn user_then_pass_with_valid_creds_opens_transaction() {
        let maildir = scratch_dir("happy");
        let config = config(maildir.clone());
        let mut session = session(config, MailboxLockRegistry::new());

        session.cmd_user(Some("joe")).await.unwrap();
        session.cmd_pass(Some("123")).await.unwrap();

        assert!(session.inbox.is_some());
        assert_eq!(last_line(&session), "+OK");

        tokio::fs::remove_dir_all(&maildir).await.ok();
    }

    #[tokio::test]
    async fn pass_with_wrong_password_clears_username() {
        let maildir = scratch_dir("wrong-pass");
        let config = config(maildir.clone());
        let mut session = session(config, MailboxLockRegistry::new());

        session.cmd_user(Some("joe")).await.unwrap();
        session.cmd_pass(Some("wrong")).await.unwrap();

        assert!(session.inbox.is_none());
        assert!(session.username.is_none());
        assert_eq!(last_line(&session), "-ERR Authentication credentials invalid");

        tokio::fs::remove_dir_all(&maildir).await.ok();
    }

    #[tokio::test]
    async fn second_session_on_same_mailbox_is_busy() {
        let maildir = scratch_dir("busy");
        let config = config(maildir.clone());
        let registry = MailboxLockRegistry::new();

        let mut first = session(Arc::clone(&config), Arc::clone(&registry));
        first.cmd_user(Some("joe")).await.unwrap();
        first.cmd_pass(Some("123")).await.unwrap();
        assert!(first.inbox.is_some());

        let mut second = session(config, registry);
        second.cmd_user(Some("joe")).await.unwrap();
        second.cmd_pass(Some("123")).await.unwrap();

        assert_eq!(last_line(&second), "-ERR Busy");
        assert!(second.inbox.is_none());

        tokio::fs::remove_dir_all(&maildir).await.ok();
    }

    #[tokio::test]
    async fn transaction_command_before_auth_is_unauthorized() {
        let maildir = scratch_dir("unauth");
        let config = config(maildir.clone());
        let mut session = session(config, MailboxLockRegistry::new());

        session.dispatch("STAT", None).await.unwrap();

        assert_eq!(last_line(&session), "-ERR Unauthorized");
    }

    #[tokio::test]
    async fn dele_then_quit_removes_only_marked_and_sets_last() {
        let maildir = scratch_dir("dele-quit");
        let config = config(maildir.clone());
        let mailbox = Mailbox::new(maildir.join("joe"));

        let mut messages = Vec::new();
        for body in ["one", "two", "three"] {
            messages.push(mailbox.add(body).await.unwrap());
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let mut session = session(config, MailboxLockRegistry::new());
        session.cmd_user(Some("joe")).await.unwrap();
        session.cmd_pass(Some("123")).await.unwrap();

        session.cmd_retr(Some("2")).await.unwrap();
        session.cmd_dele(Some("1")).await.unwrap();
        session.quit().await.unwrap();

        let remaining = mailbox.list().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(
            mailbox.last_retrieved_message().await.unwrap(),
            Some(messages[1].clone())
        );

        tokio::fs::remove_dir_all(&maildir).await.ok();
    }

    #[tokio::test]
    async fn dele_then_rset_then_list_sees_full_set_again() {
        let maildir = scratch_dir("dele-rset");
        let config = config(maildir.clone());
        let mailbox = Mailbox::new(maildir.join("joe"));

        for body in ["one", "two", "three"] {
            mailbox.add(body).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let mut session = session(config, MailboxLockRegistry::new());
        session.cmd_user(Some("joe")).await.unwrap();
        session.cmd_pass(Some("123")).await.unwrap();

        session.cmd_dele(Some("1")).await.unwrap();
        session.cmd_rset().await.unwrap();

        assert_eq!(session.inbox.as_ref().unwrap().entries().count(), 3);

        tokio::fs::remove_dir_all(&maildir).await.ok();
    }

    #[tokio::test]
    async fn retr_of_deleted_message_is_no_such_message() {
        let maildir = scratch_dir("retr-deleted");
        let config = config(maildir.clone());
        let mailbox = Mailbox::new(maildir.join("joe"));
        mailbox.add("one").await.unwrap();

        let mut session = session(config, MailboxLockRegistry::new());
        session.cmd_user(Some("joe")).await.unwrap();
        session.cmd_pass(Some("123")).await.unwrap();

        session.cmd_dele(Some("1")).await.unwrap();
        session.cmd_retr(Some("1")).await.unwrap();

        assert_eq!(last_line(&session), "-ERR no such message");

        tokio::fs::remove_dir_all(&maildir).await.ok();
    }

    #[tokio::test]
    async fn top_emits_headers_then_n_body_lines() {
        let maildir = scratch_dir("top");
        let config = config(maildir.clone());
        let mailbox = Mailbox::new(maildir.join("joe"));
        mailbox
            .add("From: a\r\nSubject: hi\r\n\r\nline one\r\nline two\r\nline three\r\n")
            .await
            .unwrap();

        let mut session = session(config, MailboxLockRegistry::new());
        session.cmd_user(Some("joe")).await.unwrap();
        session.cmd_pass(Some("123")).await.unwrap();

        session.cmd_top(Some("1 1")).await.unwrap();

        let output = std::str::from_utf8(session.io.writer()).unwrap();
        assert!(output.contains("Subject: hi\r\n\r\nline one\r\n.\r\n"));
        assert!(!output.contains("line two"));

        tokio::fs::remove_dir_all(&maildir).await.ok();
    }
}

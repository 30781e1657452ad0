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

//! The error kinds shared by every session, store, and dispatch component.
//!
//! Every fallible operation in this crate returns [`MailError`]. Session loops match on the
//! variant to pick the wire-level reply code and text; only [`MailError::Transport`] ends a
//! session outright.

use std::path::PathBuf;

/// An error produced while running an SMTP or POP3 session, or the mailbox store underneath one.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// A client sent a malformed command: missing `CRLF`, non-ASCII bytes, or a verb that
    /// doesn't parse.
    #[error("malformed command: {0}")]
    Protocol(String),

    /// A client sent a command that is valid in general, but not in the session's current state.
    #[error("wrong commands order")]
    Sequence,

    /// Authentication failed: unknown user, wrong password, or a malformed `AUTH` argument.
    #[error("authentication credentials invalid")]
    Auth,

    /// An RCPT TO or dispatch target is not a local user or list, or requires relaying.
    #[error("{0}")]
    NotLocal(String),

    /// A filesystem operation backing a mailbox failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A second POP3 session tried to open a mailbox another session already holds.
    #[error("mailbox busy")]
    BusyMailbox(PathBuf),

    /// Every recipient of an SMTP transaction failed to receive the message.
    #[error("transaction failed, all recipients rejected")]
    DispatchFailure,

    /// The underlying connection was closed or failed; the session has nothing left to reply to.
    #[error("transport closed")]
    Transport,
}

impl MailError {
    /// Render this error as a bare reason string, suitable for appending after an SMTP/POP3
    /// status prefix (`"500 "`, `"-ERR "`, …).
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::Protocol(reason) => reason.clone(),
            Self::Sequence => "Wrong commands order".to_owned(),
            Self::Auth => "Authentication credentials invalid".to_owned(),
            Self::NotLocal(reason) => reason.clone(),
            Self::Io(err) => err.to_string(),
            Self::BusyMailbox(_) => "Busy".to_owned(),
            Self::DispatchFailure => "Transaction failed".to_owned(),
            Self::Transport => "connection closed".to_owned(),
        }
    }
}

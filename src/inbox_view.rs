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

//! A POP3 session's transient projection over a [`Mailbox`].
//!
//! [`InboxView`] is the only place POP clients ever see session IDs: a snapshot taken at session
//! start assigns each listed message a dense `1..N` id in filename order, and tracks a
//! session-scoped `deleted` flag and `lastID` pointer that never touch disk until [`Self::commit`].

use crate::{
    error::MailError,
    mailbox::{Mailbox, Message},
};

/// One message as seen through a POP3 session: its session id, the underlying [`Message`], and
/// whether this session has marked it deleted.
#[derive(Debug, Clone)]
pub struct Entry {
    id: usize,
    message: Message,
    deleted: bool,
}

impl Entry {
    /// This entry's 1-based session id. Stable for the life of the session.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// The underlying mailbox message.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Whether this session has marked the entry for deletion. Never persisted directly; only
    /// [`InboxView::commit`] turns this into an actual removal.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// A POP3 session's snapshot over one [`Mailbox`].
pub struct InboxView {
    mailbox: Mailbox,
    entries: Vec<Entry>,
    last_id: usize,
}

impl InboxView {
    /// Build a view by listing `mailbox` and resolving the initial `lastID` from its durable
    /// `last` pointer, per spec §4.3.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] if the mailbox can't be listed or its `last` pointer read.
    pub async fn new(mailbox: Mailbox) -> Result<Self, MailError> {
        let messages = mailbox.list().await?;

        let entries = messages
            .into_iter()
            .enumerate()
            .map(|(index, message)| Entry {
                id: index + 1,
                message,
                deleted: false,
            })
            .collect::<Vec<_>>();

        let last_id = Self::resolve_last_id(&mailbox, &entries).await?;

        Ok(Self {
            mailbox,
            entries,
            last_id,
        })
    }

    /// Resolve the on-disk `last` pointer to a session id among `entries`, or `0` if there is no
    /// `last` message, or it no longer appears in the listing (deleted by another session).
    async fn resolve_last_id(mailbox: &Mailbox, entries: &[Entry]) -> Result<usize, MailError> {
        let Some(last) = mailbox.last_retrieved_message().await? else {
            return Ok(0);
        };

        Ok(entries
            .iter()
            .find(|entry| entry.message.filename() == last.filename())
            .map_or(0, |entry| entry.id))
    }

    /// Every non-deleted entry, in ascending id order.
    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|entry| !entry.deleted)
    }

    /// The current session `lastID`, the id of the highest-numbered message retrieved (via
    /// `RETR`) in this session or a prior one.
    #[must_use]
    pub const fn last_id(&self) -> usize {
        self.last_id
    }

    /// Find an entry by its string session id, deleted or not. Returns `None` if `s` doesn't
    /// parse as an integer or no entry has that id.
    pub fn find_by_id(&self, s: &str) -> Option<&Entry> {
        let id: usize = s.trim().parse().ok()?;

        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Mark the entry named by `s` deleted.
    ///
    /// # Errors
    ///
    /// [`MailError::Protocol`] if `s` doesn't name an existing entry.
    pub fn mark_deleted(&mut self, s: &str) -> Result<(), MailError> {
        let id: usize = s
            .trim()
            .parse()
            .map_err(|_| MailError::Protocol("no such message".to_owned()))?;

        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| MailError::Protocol("no such message".to_owned()))?;

        entry.deleted = true;

        Ok(())
    }

    /// Record that `id` was retrieved this session, advancing `lastID` if it's higher than the
    /// current value.
    pub fn mark_retrieved(&mut self, id: usize) {
        self.last_id = self.last_id.max(id);
    }

    /// Clear every deletion mark and restore `lastID` from the mailbox's on-disk pointer (not to
    /// zero — the on-disk value wins), per spec §4.3.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] if the on-disk `last` pointer can't be read.
    pub async fn reset(&mut self) -> Result<(), MailError> {
        for entry in &mut self.entries {
            entry.deleted = false;
        }

        self.last_id = Self::resolve_last_id(&self.mailbox, &self.entries).await?;

        Ok(())
    }

    /// The `(count, total bytes)` of every non-deleted entry.
    #[must_use]
    pub fn stat(&self) -> (usize, u64) {
        self.entries()
            .fold((0, 0), |(count, size), entry| (count + 1, size + entry.message.size()))
    }

    /// Commit this session's changes: if `lastID > 0`, update the mailbox's `last` pointer, then
    /// remove every entry marked deleted. Order matters — the `last` pointer is written before
    /// any removal, per spec §4.3/§5.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] if updating `last` or removing a message fails. A failure partway
    /// through leaves the mailbox in the documented partial state (possibly-dangling `last`,
    /// some but not all deletions applied), which readers tolerate.
    pub async fn commit(self) -> Result<(), MailError> {
        if self.last_id > 0 {
            if let Some(entry) = self.entries.iter().find(|entry| entry.id == self.last_id) {
                self.mailbox.set_last(&entry.message).await?;
            }
        }

        for entry in &self.entries {
            if entry.deleted {
                self.mailbox.remove(&entry.message).await?;
            }
        }

        Ok(())
    }
}

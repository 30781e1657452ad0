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

//! Directory-backed store of messages for one user.
//!
//! [`Mailbox`] is deliberately stateless with respect to any one POP session: it only knows how
//! to list, read, add, and remove files, plus track the durable `last`-retrieved pointer. All
//! session-local bookkeeping (assigned IDs, deletion marks) lives in [`crate::inbox_view`].

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

use tokio::fs;

use crate::error::MailError;

/// The reserved filename holding the persistent "last retrieved" pointer.
const LAST_FILE: &str = "last";

/// One message stored in a [`Mailbox`]: its filename and size. Does not cache content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    filename: String,
    size: u64,
}

impl Message {
    /// The on-disk filename, also used as the POP3 `UIDL` unique identifier.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The message's size in bytes, as reported by the filesystem at list time.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

/// A directory of [`Message`] files for one user, named after the user, inside a configured root
/// directory.
#[derive(Debug, Clone)]
pub struct Mailbox {
    path: PathBuf,
}

impl Mailbox {
    /// Create a handle over the mailbox directory at `path`. Does not touch the filesystem; the
    /// directory is created lazily on first write, per spec §4.2.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The mailbox's directory path, used as the key into
    /// [`crate::lock_registry::MailboxLockRegistry`].
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// List every non-hidden, non-`last` file in the directory, sorted lexicographically by
    /// filename (which is also delivery order, given the timestamp-prefixed naming scheme).
    ///
    /// A missing directory is treated as an empty mailbox, not an error.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] on any I/O failure other than the directory not existing.
    pub async fn list(&self) -> Result<Vec<Message>, MailError> {
        let mut read_dir = match fs::read_dir(&self.path).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut messages = Vec::new();

        while let Some(entry) = read_dir.next_entry().await? {
            let filename = entry.file_name();
            let Some(filename) = filename.to_str() else {
                continue;
            };

            if filename.starts_with('.') || filename == LAST_FILE {
                continue;
            }

            let size = entry.metadata().await?.len();

            messages.push(Message {
                filename: filename.to_owned(),
                size,
            });
        }

        messages.sort_by(|a, b| a.filename.cmp(&b.filename));

        Ok(messages)
    }

    /// Read the `last` file and resolve it to a [`Message`], if the file it names still exists.
    ///
    /// Returns `Ok(None)` both when `last` is absent and when it names a message that has since
    /// been deleted by another session — the spec treats both as "no last message", not an
    /// error.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] on any I/O failure other than the files involved not existing.
    pub async fn last_retrieved_message(&self) -> Result<Option<Message>, MailError> {
        let filename = match fs::read_to_string(self.path.join(LAST_FILE)).await {
            Ok(content) => content.trim().to_owned(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match fs::metadata(self.path.join(&filename)).await {
            Ok(metadata) => Ok(Some(Message {
                filename,
                size: metadata.len(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically replace the `last` file with `message`'s filename.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] on any I/O failure.
    pub async fn set_last(&self, message: &Message) -> Result<(), MailError> {
        self.write_atomic(LAST_FILE, message.filename.as_bytes())
            .await
    }

    /// Write a new message file containing `text`, returning the [`Message`] it was stored as.
    ///
    /// The filename is `YYYYMMDD-HHMMSS-<hex content-digest>`, per spec §4.2's recommended
    /// scheme: the timestamp prefix keeps filenames sorting in delivery order at second
    /// resolution, and the digest disambiguates concurrent deliveries within one second.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] on any I/O failure.
    pub async fn add(&self, text: &str) -> Result<Message, MailError> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);

        let filename = format!(
            "{}-{:016x}",
            chrono::Local::now().format("%Y%m%d-%H%M%S"),
            hasher.finish()
        );

        self.write_atomic(&filename, text.as_bytes()).await?;

        Ok(Message {
            filename,
            size: text.len() as u64,
        })
    }

    /// Delete `message` from disk.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] if the file is already missing or otherwise can't be removed.
    pub async fn remove(&self, message: &Message) -> Result<(), MailError> {
        fs::remove_file(self.path.join(&message.filename)).await?;

        Ok(())
    }

    /// Read `message`'s full contents.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] on any I/O failure.
    pub async fn read(&self, message: &Message) -> Result<String, MailError> {
        Ok(fs::read_to_string(self.path.join(&message.filename)).await?)
    }

    /// Write `contents` to `name` inside the mailbox directory, atomically with respect to
    /// concurrent readers: written to a temp file in the same directory, then renamed into
    /// place, per spec §4.2 / §9.
    async fn write_atomic(&self, name: &str, contents: &[u8]) -> Result<(), MailError> {
        self.create_dir().await?;

        let target = self.path.join(name);
        let temp = self.path.join(format!(".tmp-{name}-{}", std::process::id()));

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        {
            use tokio::io::AsyncWriteExt;

            let mut file = options.open(&temp).await?;
            file.write_all(contents).await?;
            file.sync_all().await?;
        }

        fs::rename(&temp, &target).await?;

        Ok(())
    }

    /// Create the mailbox directory (mode `0755`) if it doesn't already exist.
    async fn create_dir(&self) -> Result<(), MailError> {
        match fs::create_dir_all(&self.path).await {
            Ok(()) => {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;

                    let permissions = std::fs::Permissions::from_mode(0o755);
                    fs::set_permissions(&self.path, permissions).await?;
                }

                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

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

//! A process-wide registry of which mailbox paths currently have an open POP3 session.
//!
//! Two POP sessions must never mutate the same mailbox at once (spec §5). [`MailboxLockRegistry`]
//! is the only mutable shared state in the server; acquisition is scoped to a session's lifetime
//! via [`MailboxLockGuard`], whose `Drop` releases the lock unconditionally, on every exit path
//! (clean `QUIT`, protocol error, or abrupt disconnect).

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::error::MailError;

/// A `(path -> held)` map guarding concurrent POP3 access to the same mailbox directory.
#[derive(Debug, Default)]
pub struct MailboxLockRegistry {
    held: Mutex<HashSet<PathBuf>>,
}

impl MailboxLockRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the lock for `path`, scoped to the returned guard's lifetime.
    ///
    /// # Errors
    ///
    /// [`MailError::BusyMailbox`] if another session already holds this path.
    pub fn acquire(self: &Arc<Self>, path: PathBuf) -> Result<MailboxLockGuard, MailError> {
        let mut held = self.held.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if !held.insert(path.clone()) {
            return Err(MailError::BusyMailbox(path));
        }

        drop(held);

        Ok(MailboxLockGuard {
            registry: Arc::clone(self),
            path,
        })
    }
}

/// An RAII guard over one locked mailbox path. Releases the lock when dropped, regardless of how
/// the session ended.
pub struct MailboxLockGuard {
    registry: Arc<MailboxLockRegistry>,
    path: PathBuf,
}

impl MailboxLockGuard {
    /// The locked path, for diagnostics.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MailboxLockGuard {
    fn drop(&mut self) {
        let mut held = self
            .registry
            .held
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        held.remove(&self.path);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn second_acquire_of_same_path_is_busy() {
        let registry = MailboxLockRegistry::new();
        let path = PathBuf::from("/tmp/mailsrv-test/joe");

        let _first = registry.acquire(path.clone()).unwrap();

        assert!(matches!(
            registry.acquire(path),
            Err(MailError::BusyMailbox(_))
        ));
    }

    #[test]
    fn dropping_the_guard_releases_the_lock() {
        let registry = MailboxLockRegistry::new();
        let path = PathBuf::from("/tmp/mailsrv-test/amy");

        {
            let _guard = registry.acquire(path.clone()).unwrap();
        }

        assert!(registry.acquire(path).is_ok());
    }
}

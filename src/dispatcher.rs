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

//! Resolves an accepted [`Mail`]'s recipients to mailboxes and appends the message body.
//!
//! List expansion is recursive (a list may itself list other lists) and best-effort: a failed
//! member delivery is logged but doesn't fail the rest of the list. A failed top-level recipient
//! triggers a bounce back to the sender, unless the sender was itself the empty path (preventing
//! bounce loops).

use std::sync::Arc;

use futures_util::{future::BoxFuture, FutureExt};
use tracing::{info, warn};

use crate::{config::Config, error::MailError, mailbox::Mailbox, smtp::Mail};

/// Delivers accepted SMTP mail into local mailboxes, per spec §4.6.
pub struct Dispatcher {
    config: Arc<Config>,
}

impl Dispatcher {
    /// Build a dispatcher over the (immutable, post-startup) user/list configuration.
    #[must_use]
    pub const fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Dispatch `mail`'s body to every recipient. Returns `true` iff at least one recipient
    /// succeeded, matching the `250`/`554 Transaction failed` split at the SMTP `DATA` reply.
    pub async fn dispatch(&self, mail: &Mail, body: &str) -> bool {
        let mut delivered = 0usize;

        for forward_path in &mail.forward_paths {
            let Some(address) = &forward_path.address else {
                continue;
            };

            match self.dispatch_name(&address.local, body).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(recipient = %address.format(), error = %err, "delivery failed");
                    self.bounce(mail, forward_path).await;
                }
            }
        }

        delivered > 0
    }

    /// Resolve `name` to a user or list and append `body` to the matching mailbox(es).
    ///
    /// List expansion is transitive and tolerates a user appearing more than once (no dedup is
    /// required, per spec §3); cycles are not detected, per spec's stated non-goal.
    fn dispatch_name<'a>(&'a self, name: &'a str, body: &'a str) -> BoxFuture<'a, Result<(), MailError>> {
        async move {
            if self.config.users.contains_key(name) {
                let mailbox = Mailbox::new(self.config.maildir.join(name));
                mailbox.add(body).await?;
                info!(user = name, "delivered");
                return Ok(());
            }

            if let Some(members) = self.config.lists.get(name) {
                let mut any_ok = false;

                for member in members {
                    match self.dispatch_name(member, body).await {
                        Ok(()) => any_ok = true,
                        Err(err) => warn!(list = name, member, error = %err, "list member delivery failed"),
                    }
                }

                return if any_ok {
                    Ok(())
                } else {
                    Err(MailError::DispatchFailure)
                };
            }

            Err(MailError::NotLocal(format!("unhandled recipient: {name}")))
        }
        .boxed()
    }

    /// Build and dispatch a bounce notice for a failed `forward_path`, unless the original
    /// reverse-path was itself empty (which would otherwise set up a bounce loop).
    ///
    /// A bounce that fails to deliver is logged and dropped, per spec §4.6/§9 — outbound relay
    /// to foreign hosts is out of scope, so there is nowhere else to send it.
    async fn bounce(&self, mail: &Mail, forward_path: &crate::smtp::path::Path) {
        let Some(sender) = &mail.reverse_path.address else {
            return;
        };

        let body = format!(
            "Date: {date}\r\nFrom: postmaster@{hostname}\r\nTo: {to}\r\nSubject: mail delivery failure\r\n\r\nSorry, your mail could not be delivered to {failed}.\r\n",
            date = chrono::Local::now().to_rfc2822(),
            hostname = self.config.hostname,
            to = sender.format(),
            failed = forward_path.format(),
        );

        if let Err(err) = self.dispatch_name(&sender.local, &body).await {
            warn!(to = %sender.format(), error = %err, "bounce notice itself failed to deliver");
        }
    }
}

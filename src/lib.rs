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

#![warn(clippy::nursery, clippy::pedantic)]
#![cfg_attr(debug_assertions, allow(clippy::missing_errors_doc))]

//! A small mail server: one SMTP listener for inbound submission, one POP3 listener for
//! retrieval, sharing a filesystem-backed mailbox store.
//!
//! See [`listener::listen_smtp`] and [`listener::listen_pop`] for the entry points a binary
//! wires together; [`config::Config`] for the configuration format they're built from.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod inbox_view;
pub mod line_io;
pub mod listener;
pub mod lock_registry;
pub mod mailbox;
pub mod pop;
pub mod smtp;
mod str;
mod timeouts;

#[cfg(test)]
mod test;

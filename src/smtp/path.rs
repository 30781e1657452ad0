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

//! Forward-path and reverse-path parsing, per spec §4.5's grammar:
//! `"<" [ "@"host ( "," "@"host )* ":" ] local "@" host ">"`, plus the empty path `<>`.

use crate::str::max_lengths;

/// A local-part/host pair, like `joe@example.com`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub local: String,
    pub host: String,
}

impl Address {
    /// Format as `local@host`.
    #[must_use]
    pub fn format(&self) -> String {
        format!("{}@{}", self.local, self.host)
    }
}

/// A forward-path or reverse-path: zero or more source-route hosts plus an optional final
/// address. `None` address represents the empty reverse-path `<>`, used for bounce notices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub hosts: Vec<String>,
    pub address: Option<Address>,
}

impl Path {
    /// The empty reverse-path `<>`.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            hosts: Vec::new(),
            address: None,
        }
    }

    /// A plain local address path with no source route.
    #[must_use]
    pub fn local(address: Address) -> Self {
        Self {
            hosts: Vec::new(),
            address: Some(address),
        }
    }

    /// Format back into `"<[@host[,@host]*:]local@host>"` or `"<>"`.
    #[must_use]
    pub fn format(&self) -> String {
        let mut out = String::from("<");

        if !self.hosts.is_empty() {
            for (index, host) in self.hosts.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push('@');
                out.push_str(host);
            }
            out.push(':');
        }

        if let Some(address) = &self.address {
            out.push_str(&address.format());
        }

        out.push('>');
        out
    }

    /// Parse a path from the text following `MAIL FROM:`/`RCPT TO:` (the `FROM:`/`TO:` prefix
    /// must already be stripped by the caller).
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason string on any grammar violation.
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        let inner = input
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(|| "path must be enclosed in '<' '>'".to_owned())?;

        if inner.is_empty() {
            return Ok(Self::empty());
        }

        let mut hosts = Vec::new();
        let mut rest = inner;

        if rest.starts_with('@') {
            loop {
                rest = rest
                    .strip_prefix('@')
                    .ok_or_else(|| "expected '@' in source route".to_owned())?;
                let (name, after) = read_name(rest);

                if name.is_empty() {
                    return Err("empty hostname in source route".to_owned());
                }

                hosts.push(name.to_owned());

                match after.chars().next() {
                    Some(',') => {
                        rest = &after[1..];
                        continue;
                    }
                    Some(':') => {
                        rest = &after[1..];
                        break;
                    }
                    other => {
                        return Err(format!("unexpected character in source route: {other:?}"))
                    }
                }
            }
        }

        let (local, after) = read_name(rest);
        if local.is_empty() {
            return Err("empty local-part".to_owned());
        }

        let after = after
            .strip_prefix('@')
            .ok_or_else(|| "expected '@' after local-part".to_owned())?;
        let (host, after) = read_name(after);

        if host.is_empty() {
            return Err("empty hostname".to_owned());
        }
        if !after.is_empty() {
            return Err(format!("unexpected trailing characters: {after:?}"));
        }
        if local.len() > max_lengths::LOCAL_PART {
            return Err("local-part exceeds RFC 5321 4.5.3.1.1".to_owned());
        }
        if host.len() > max_lengths::DOMAIN {
            return Err("hostname exceeds RFC 5321 4.5.3.1.2".to_owned());
        }
        if input.len() > max_lengths::PATH {
            return Err("path exceeds RFC 5321 4.5.3.1.3".to_owned());
        }

        Ok(Self {
            hosts,
            address: Some(Address {
                local: local.to_owned(),
                host: host.to_owned(),
            }),
        })
    }
}

/// Read a maximal run of alphanumeric/`.`/`-` characters (the grammar's permissive `readName`
/// rule), returning it and the unconsumed remainder.
fn read_name(input: &str) -> (&str, &str) {
    let end = input
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '-'))
        .unwrap_or(input.len());

    input.split_at(end)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_plain_address() {
        let path = Path::parse("<joe@example.com>").unwrap();

        assert_eq!(path.hosts, Vec::<String>::new());
        assert_eq!(
            path.address,
            Some(Address {
                local: "joe".to_owned(),
                host: "example.com".to_owned()
            })
        );
    }

    #[test]
    fn parses_empty_path() {
        assert_eq!(Path::parse("<>").unwrap(), Path::empty());
    }

    #[test]
    fn parses_source_route() {
        let path = Path::parse("<@a,@b:joe@c>").unwrap();

        assert_eq!(path.hosts, vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(path.address.unwrap().format(), "joe@c");
    }

    #[test]
    fn format_round_trips() {
        let text = "<@a,@b:joe@c>";
        assert_eq!(Path::parse(text).unwrap().format(), text);
        assert_eq!(Path::parse("<>").unwrap().format(), "<>");
    }

    #[test]
    fn rejects_missing_brackets() {
        assert!(Path::parse("joe@c").is_err());
    }

    #[test]
    fn rejects_missing_host() {
        assert!(Path::parse("<joe>").is_err());
    }
}

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

//! Configuration file parsing: a text file of sections `name { key value }`.
//!
//! Hand-rolled rather than `serde`-driven — the format isn't self-describing enough to land
//! directly on a struct without writing the same amount of scanning code, and the original
//! implementation this is ported from treats it the same way (a small, bespoke recursive
//! scanner).

use std::{collections::HashMap, net::SocketAddr, path::PathBuf};

/// One user's credentials and list memberships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    /// Cleartext password, or a bcrypt hash (begins with `$`).
    pub credential: Credential,
    /// Names of the lists this user belongs to.
    pub lists: Vec<String>,
}

/// How a user's password is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Cleartext(String),
    BcryptHash(String),
}

impl UserRecord {
    /// Verify `password` against this record's stored credential.
    #[must_use]
    pub fn verify(&self, password: &str) -> bool {
        match &self.credential {
            Credential::Cleartext(expected) => expected == password,
            Credential::BcryptHash(hash) => bcrypt::verify(password, hash).unwrap_or(false),
        }
    }
}

/// The fully parsed configuration for one server process.
#[derive(Debug, Clone)]
pub struct Config {
    pub smtp: Option<SocketAddr>,
    pub pop: Option<SocketAddr>,
    pub maildir: PathBuf,
    pub hostname: String,
    pub debug: bool,
    /// List name -> member usernames (flat; a list may itself be a member of another list).
    pub lists: HashMap<String, Vec<String>>,
    pub users: HashMap<String, UserRecord>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            smtp: None,
            pop: None,
            maildir: PathBuf::from("./mail"),
            hostname: "localhost".to_owned(),
            debug: false,
            lists: HashMap::new(),
            users: HashMap::new(),
        }
    }
}

impl Config {
    /// Parse a config file's contents.
    ///
    /// # Errors
    ///
    /// Returns a human-readable reason string on any parse failure: an unknown `server` key, a
    /// malformed section, or a user referencing an undeclared list.
    pub fn parse(source: &str) -> Result<Self, String> {
        let sections = parse_sections(source)?;
        let mut config = Self::default();

        if let Some(server) = sections.get("server") {
            for (key, value) in server {
                match key.as_str() {
                    "smtp" => {
                        config.smtp = Some(
                            value
                                .parse()
                                .map_err(|e| format!("invalid server.smtp address: {e}"))?,
                        );
                    }
                    "pop" => {
                        config.pop = Some(
                            value
                                .parse()
                                .map_err(|e| format!("invalid server.pop address: {e}"))?,
                        );
                    }
                    "maildir" => config.maildir = PathBuf::from(value),
                    "hostname" => config.hostname = value.clone(),
                    "debug" => config.debug = true,
                    other => return Err(format!("unknown server param: {other}")),
                }
            }
        }

        if let Some(lists) = sections.get("lists") {
            for name in lists.keys() {
                config.lists.insert(name.clone(), Vec::new());
            }
        }

        if let Some(users) = sections.get("users") {
            for (name, spec) in users {
                let (credential, lists) = parse_user_spec(spec)?;

                for list in &lists {
                    config
                        .lists
                        .get_mut(list)
                        .ok_or_else(|| format!("unknown list: {list}"))?
                        .push(name.clone());
                }

                config
                    .users
                    .insert(name.clone(), UserRecord { credential, lists });
            }
        }

        Ok(config)
    }

    /// Read and parse a config file from `path`.
    ///
    /// # Errors
    ///
    /// An I/O failure reading the file, or any error from [`Self::parse`].
    pub async fn read_file(path: impl AsRef<std::path::Path>) -> Result<Self, String> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| e.to_string())?;

        Self::parse(&source)
    }

    /// Whether `name` is a known local recipient (user or list).
    #[must_use]
    pub fn is_local_recipient(&self, name: &str) -> bool {
        self.users.contains_key(name) || self.lists.contains_key(name)
    }
}

type Section = HashMap<String, String>;

/// Parse `name { key value }` sections out of the (comment-stripped) source text.
fn parse_sections(source: &str) -> Result<HashMap<String, Section>, String> {
    let stripped = strip_comments(source);
    let mut chars = stripped.char_indices().peekable();
    let text = stripped.as_str();
    let mut sections = HashMap::new();

    loop {
        skip_whitespace(&mut chars);

        let Some(&(start, _)) = chars.peek() else {
            break;
        };

        let name = read_identifier(&mut chars, text);
        if name.is_empty() {
            return Err(format!("identifier expected near byte {start}"));
        }

        skip_whitespace(&mut chars);
        expect_char(&mut chars, '{')?;
        skip_whitespace(&mut chars);

        let mut section = Section::new();

        loop {
            match chars.peek() {
                Some(&(_, '}')) => {
                    chars.next();
                    break;
                }
                None => return Err("unterminated section, expected '}'".to_owned()),
                _ => {}
            }

            let key = read_identifier(&mut chars, text);
            if key.is_empty() {
                return Err("property name expected".to_owned());
            }

            while matches!(chars.peek(), Some(&(_, ' ' | '\t'))) {
                chars.next();
            }

            let value_start = chars.peek().map_or(text.len(), |&(i, _)| i);
            while !matches!(chars.peek(), None | Some((_, '\n' | '\r'))) {
                chars.next();
            }
            let value_end = chars.peek().map_or(text.len(), |&(i, _)| i);

            let value = text[value_start..value_end].trim().to_owned();
            section.insert(key, if value.is_empty() { "true".to_owned() } else { value });

            skip_whitespace(&mut chars);
        }

        sections.insert(name, section);
    }

    Ok(sections)
}

fn strip_comments(source: &str) -> String {
    source
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("\n")
}

fn skip_whitespace(chars: &mut std::iter::Peekable<std::str::CharIndices>) {
    while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
        chars.next();
    }
}

fn read_identifier(chars: &mut std::iter::Peekable<std::str::CharIndices>, text: &str) -> String {
    let Some(&(start, c)) = chars.peek() else {
        return String::new();
    };
    if !c.is_ascii_alphabetic() {
        return String::new();
    }

    let mut end = start + c.len_utf8();
    chars.next();

    while let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_alphanumeric() || c == '-' {
            end = i + c.len_utf8();
            chars.next();
        } else {
            break;
        }
    }

    text[start..end].to_owned()
}

fn expect_char(chars: &mut std::iter::Peekable<std::str::CharIndices>, expected: char) -> Result<(), String> {
    match chars.next() {
        Some((_, c)) if c == expected => Ok(()),
        Some((_, c)) => Err(format!("expected {expected:?}, got {c:?}")),
        None => Err(format!("expected {expected:?}, got end of input")),
    }
}

/// Parse a `users` section value: either a bcrypt hash (`$...`) or a quoted cleartext password,
/// optionally followed by `[list1,list2,…]`.
fn parse_user_spec(spec: &str) -> Result<(Credential, Vec<String>), String> {
    let spec = spec.trim();
    let mut rest = spec;

    let credential = if let Some(stripped) = rest.strip_prefix('$') {
        let end = stripped.find(char::is_whitespace).unwrap_or(stripped.len());
        let hash = format!("${}", &stripped[..end]);
        rest = stripped[end..].trim_start();
        Credential::BcryptHash(hash)
    } else if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped
            .find('"')
            .ok_or_else(|| "unmatched password quote".to_owned())?;
        let password = stripped[..end].to_owned();
        rest = stripped[end + 1..].trim_start();
        Credential::Cleartext(password)
    } else {
        return Err(format!("malformed user credential: {spec}"));
    };

    let lists = if let Some(inner) = rest.strip_prefix('[') {
        let end = inner
            .find(']')
            .ok_or_else(|| "']' expected".to_owned())?;
        inner[..end]
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    } else {
        Vec::new()
    };

    Ok((credential, lists))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_server_section() {
        let config = Config::parse(
            "server {\n  smtp 0.0.0.0:2525\n  pop 0.0.0.0:1100\n  hostname mail.example\n  debug\n}\n",
        )
        .unwrap();

        assert_eq!(config.hostname, "mail.example");
        assert!(config.debug);
        assert_eq!(config.smtp.unwrap().port(), 2525);
        assert_eq!(config.pop.unwrap().port(), 1100);
    }

    #[test]
    fn parses_users_and_lists() {
        let config = Config::parse(
            "lists {\n  staff\n}\nusers {\n  joe \"hunter2\"[staff]\n  amy $2b$12$abcdefghijklmnopqrstuv\n}\n",
        )
        .unwrap();

        assert_eq!(
            config.users["joe"].credential,
            Credential::Cleartext("hunter2".to_owned())
        );
        assert_eq!(config.users["joe"].lists, vec!["staff".to_owned()]);
        assert_eq!(config.lists["staff"], vec!["joe".to_owned()]);
        assert!(matches!(
            config.users["amy"].credential,
            Credential::BcryptHash(_)
        ));
    }

    #[test]
    fn unknown_list_reference_is_an_error() {
        let result = Config::parse("users {\n  joe \"x\"[ghosts]\n}\n");
        assert!(result.is_err());
    }

    #[test]
    fn strips_comments() {
        let config = Config::parse("# a comment\nserver {\n  hostname x # inline\n}\n").unwrap();
        assert_eq!(config.hostname, "x");
    }
}

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

//! Line-oriented read/write over a connection, shared by [`crate::smtp`] and [`crate::pop`].
//!
//! Both protocols frame commands and replies the same way (`CRLF`-terminated lines, an optional
//! multi-line batch reply, and a dot-stuffed data block), so one generic [`LineIO`] serves both
//! sessions instead of duplicating the read/write plumbing per protocol.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::{error::MailError, str::CRLF};

/// A parsed client command: an uppercased verb plus the verbatim remainder of the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The command verb, folded to upper case (`"RCPT"`, `"USER"`, …).
    pub verb: String,
    /// Everything after the single separating space, verbatim. `None` if there was no argument.
    pub arg: Option<String>,
}

/// Line-oriented I/O over a connection, with `CRLF` framing and the dot-stuffing codec used by
/// `DATA` (SMTP) and `RETR`/`TOP` (POP3).
pub struct LineIO<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> LineIO<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wrap a split reader/writer pair.
    pub const fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Read one `CRLF`-terminated line, including the terminator.
    ///
    /// # Errors
    ///
    /// [`MailError::Transport`] on EOF (zero bytes read); [`MailError::Io`] on any other I/O
    /// failure.
    pub async fn read_line(&mut self) -> Result<String, MailError> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;

        if read == 0 {
            return Err(MailError::Transport);
        }

        Ok(line)
    }

    /// Read a line and parse it as a [`Command`].
    ///
    /// The verb is the maximal leading run of ASCII letters, folded to upper case; the argument
    /// (if any) is everything after the single separating space, verbatim. A line with no
    /// trailing `CRLF` or with more than one space between the verb and argument fails with
    /// [`MailError::Protocol`].
    ///
    /// # Errors
    ///
    /// See [`Self::read_line`]; additionally [`MailError::Protocol`] on a malformed line.
    pub async fn read_command(&mut self) -> Result<Command, MailError> {
        let line = self.read_line().await?;

        if line.len() > crate::str::max_lengths::COMMAND_LINE {
            return Err(MailError::Protocol("command line too long".to_owned()));
        }

        parse_command(&line)
    }

    /// Read raw `DATA` body lines until a line consisting solely of `.CRLF`, dot-unstuffing as
    /// specified in [RFC 5321 §4.5.2](https://www.rfc-editor.org/rfc/rfc5321.html#section-4.5.2).
    ///
    /// Returns the accumulated body text, terminator excluded.
    ///
    /// # Errors
    ///
    /// See [`Self::read_line`].
    pub async fn read_data(&mut self) -> Result<String, MailError> {
        let mut text = String::new();

        loop {
            let line = self.read_line().await?;

            if line.len() > crate::str::max_lengths::TEXT_LINE {
                return Err(MailError::Protocol("data line too long".to_owned()));
            }

            if line == ".\r\n" {
                break;
            }

            if let Some(stripped) = line.strip_prefix('.') {
                text.push_str(stripped);
            } else {
                text.push_str(&line);
            }
        }

        Ok(text)
    }

    /// Send a single reply line: `"<code> <text>\r\n"`.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] from the underlying writer.
    pub async fn send(&mut self, code: u16, text: &str) -> Result<(), MailError> {
        self.writer
            .write_all(format!("{code} {text}{CRLF}").as_bytes())
            .await?;

        Ok(())
    }

    /// Send a POP3 `+OK` reply. `text` may be empty, in which case no trailing space is emitted.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] from the underlying writer.
    pub async fn ok(&mut self, text: &str) -> Result<(), MailError> {
        self.send_status("+OK", text).await
    }

    /// Send a POP3 `-ERR` reply. `text` may be empty.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] from the underlying writer.
    pub async fn err(&mut self, text: &str) -> Result<(), MailError> {
        self.send_status("-ERR", text).await
    }

    async fn send_status(&mut self, status: &str, text: &str) -> Result<(), MailError> {
        let line = if text.is_empty() {
            format!("{status}{CRLF}")
        } else {
            format!("{status} {text}{CRLF}")
        };

        self.writer.write_all(line.as_bytes()).await?;

        Ok(())
    }

    /// Send each of `lines` as a bare `CRLF`-terminated line, followed by the `.CRLF` list
    /// terminator. Used by POP3 `LIST`/`UIDL` with no argument, per spec §4.4.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] from the underlying writer.
    pub async fn send_list(&mut self, lines: impl IntoIterator<Item = String>) -> Result<(), MailError> {
        for line in lines {
            self.writer.write_all(format!("{line}{CRLF}").as_bytes()).await?;
        }

        self.writer.write_all(format!(".{CRLF}").as_bytes()).await?;

        Ok(())
    }

    /// Begin a multi-line reply under `code`. Every line sent through the returned
    /// [`BatchWriter`] except the last is emitted as `"<code>-<text>"`; the last (flushed on
    /// [`BatchWriter::end`] or drop) is emitted as `"<code> <text>"`.
    pub fn begin_batch(&mut self, code: u16) -> BatchWriter<'_, W> {
        BatchWriter {
            writer: &mut self.writer,
            code,
            pending: None,
        }
    }

    /// Borrow the underlying writer, mainly so tests can inspect what was written.
    pub(crate) const fn writer(&self) -> &W {
        &self.writer
    }

    /// Send `text` as a dot-stuffed data block terminated by a lone `.CRLF` line, per spec §4.1.
    /// Used by POP3 `RETR`/`TOP`.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] from the underlying writer.
    pub async fn send_data(&mut self, text: &str) -> Result<(), MailError> {
        let mut lines = text.split(CRLF).peekable();

        while let Some(line) = lines.next() {
            // `split` yields a trailing empty segment after the final `CRLF`, which isn't a real
            // line; every other empty segment is a genuine blank line (e.g. the header/body
            // separator) and must still be written out, per spec §4.1.
            if line.is_empty() && lines.peek().is_none() {
                break;
            }

            if let Some(rest) = line.strip_prefix('.') {
                self.writer
                    .write_all(format!(".{rest}{CRLF}").as_bytes())
                    .await?;
            } else {
                self.writer.write_all(format!("{line}{CRLF}").as_bytes()).await?;
            }
        }

        self.writer.write_all(format!(".{CRLF}").as_bytes()).await?;

        Ok(())
    }
}

/// A buffered multi-line reply under one status code.
///
/// Built so the caller can call [`Self::send`] for every line without knowing ahead of time
/// which one is last; the writer always holds back one line so it can flush it as the final
/// `"<code> <text>"` line on [`Self::end`].
pub struct BatchWriter<'a, W> {
    writer: &'a mut W,
    code: u16,
    pending: Option<String>,
}

impl<'a, W: AsyncWrite + Unpin> BatchWriter<'a, W> {
    /// Queue a line for the batch. If a previous line is pending, it is flushed now as an
    /// intermediate (`"<code>-"`) line.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] from the underlying writer.
    pub async fn send(&mut self, text: impl Into<String>) -> Result<(), MailError> {
        if let Some(previous) = self.pending.replace(text.into()) {
            self.writer
                .write_all(format!("{}-{previous}{CRLF}", self.code).as_bytes())
                .await?;
        }

        Ok(())
    }

    /// Flush the pending line (if any) as the final `"<code> <text>"` line. If no line was ever
    /// sent, this emits nothing.
    ///
    /// # Errors
    ///
    /// [`MailError::Io`] from the underlying writer.
    pub async fn end(mut self) -> Result<(), MailError> {
        self.flush_final().await
    }

    async fn flush_final(&mut self) -> Result<(), MailError> {
        if let Some(last) = self.pending.take() {
            self.writer
                .write_all(format!("{} {last}{CRLF}", self.code).as_bytes())
                .await?;
        }

        Ok(())
    }
}

/// Parse a raw line into a [`Command`], per spec §4.1: NAME is a maximal run of ASCII letters
/// folded to upper case; ARG (if any) runs from the single separating space to the terminator,
/// verbatim.
fn parse_command(line: &str) -> Result<Command, MailError> {
    let body = line
        .strip_suffix(CRLF)
        .ok_or_else(|| MailError::Protocol("no trailing CRLF".to_owned()))?;

    if !body.is_ascii() {
        return Err(MailError::Protocol("non-ASCII command".to_owned()));
    }

    let verb_len = body
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(body.len());

    if verb_len == 0 {
        return Err(MailError::Protocol("command name expected".to_owned()));
    }

    let verb = body[..verb_len].to_ascii_uppercase();
    let rest = &body[verb_len..];

    let arg = if rest.is_empty() {
        None
    } else if let Some(arg) = rest.strip_prefix(' ') {
        Some(arg.to_owned())
    } else {
        return Err(MailError::Protocol(format!(
            "unexpected character after command name: {:?}",
            rest.chars().next()
        )));
    };

    Ok(Command { verb, arg })
}

#[cfg(test)]
mod test {
    use tokio::io::{AsyncReadExt, BufReader};

    use super::*;

    fn io(input: &str) -> LineIO<BufReader<&[u8]>, Vec<u8>> {
        LineIO::new(BufReader::new(input.as_bytes()), Vec::new())
    }

    #[tokio::test]
    async fn parses_verb_and_arg() {
        let mut io = io("RCPT TO:<joe@x>\r\n");
        let command = io.read_command().await.unwrap();

        assert_eq!(command.verb, "RCPT");
        assert_eq!(command.arg.as_deref(), Some("TO:<joe@x>"));
    }

    #[tokio::test]
    async fn parses_verb_with_no_arg() {
        let mut io = io("NOOP\r\n");
        let command = io.read_command().await.unwrap();

        assert_eq!(command.verb, "NOOP");
        assert_eq!(command.arg, None);
    }

    #[tokio::test]
    async fn lowercases_are_folded() {
        let mut io = io("quit\r\n");
        let command = io.read_command().await.unwrap();

        assert_eq!(command.verb, "QUIT");
    }

    #[tokio::test]
    async fn missing_crlf_is_protocol_error() {
        let mut io = io("NOOP\n");

        assert!(matches!(
            io.read_command().await,
            Err(MailError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn send_writes_code_and_text() {
        let mut io = io("");
        io.send(250, "OK").await.unwrap();

        assert_eq!(io.writer, b"250 OK\r\n");
    }

    #[tokio::test]
    async fn batch_writer_emits_dash_then_space() {
        let mut io = io("");
        {
            let mut batch = io.begin_batch(250);
            batch.send("Hello, x").await.unwrap();
            batch.send("AUTH").await.unwrap();
            batch.send("HELP").await.unwrap();
            batch.end().await.unwrap();
        }

        assert_eq!(
            std::str::from_utf8(&io.writer).unwrap(),
            "250-Hello, x\r\n250-AUTH\r\n250 HELP\r\n"
        );
    }

    #[tokio::test]
    async fn batch_writer_emits_nothing_if_empty() {
        let mut io = io("");
        io.begin_batch(250).end().await.unwrap();

        assert!(io.writer.is_empty());
    }

    #[tokio::test]
    async fn send_data_dot_stuffs_and_terminates() {
        let mut io = io("");
        io.send_data("hi\r\n.leading dot\r\nplain")
            .await
            .unwrap();

        assert_eq!(
            std::str::from_utf8(&io.writer).unwrap(),
            "hi\r\n..leading dot\r\nplain\r\n.\r\n"
        );
    }

    #[tokio::test]
    async fn send_data_preserves_interior_blank_lines() {
        let mut io = io("");
        io.send_data("From: a\r\nSubject: hi\r\n\r\nbody\r\n")
            .await
            .unwrap();

        assert_eq!(
            std::str::from_utf8(&io.writer).unwrap(),
            "From: a\r\nSubject: hi\r\n\r\nbody\r\n.\r\n"
        );
    }

    #[tokio::test]
    async fn read_data_unstuffs_and_stops_at_lone_dot() {
        let mut io = io("From: x\r\n..leading\r\n.\r\nafter\r\n");
        let text = io.read_data().await.unwrap();

        assert_eq!(text, "From: x\r\n.leading\r\n");

        // The terminator was consumed; the next raw read sees what follows it.
        let mut rest = String::new();
        io.reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "after\r\n");
    }
}

// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright © 2024 RemasteredArch
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

//! End-to-end scenarios driving a bound [`TcpListener`] with a real [`TcpStream`] client, per
//! spec §8's literal-I/O scenarios (a) and (d).

use std::sync::Arc;

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};

use crate::{
    config::{Config, Credential, UserRecord},
    dispatcher::Dispatcher,
    lock_registry::MailboxLockRegistry,
};

async fn read_reply(stream: &mut TcpStream) -> String {
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    String::from_utf8(buf[..n].to_vec()).unwrap()
}

fn scratch_maildir(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "mailsrv-test-e2e-{name}-{}-{}",
        std::process::id(),
        chrono::Local::now().timestamp_nanos_opt().unwrap_or(0)
    ))
}

// spec §8(a): minimal SMTP accept.
#[tokio::test]
async fn smtp_accepts_a_message_into_the_recipients_mailbox() {
    let maildir = scratch_maildir("smtp-accept");
    let mut config = Config::default();
    config.hostname = "localhost".to_owned();
    config.maildir = maildir.clone();
    config.users.insert(
        "joe".to_owned(),
        UserRecord {
            credential: Credential::Cleartext("x".to_owned()),
            lists: Vec::new(),
        },
    );
    let config = Arc::new(config);
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&config)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let session = crate::smtp::SmtpSession::new(
            BufReader::new(read_half),
            write_half,
            config,
            dispatcher,
            0,
        );
        session.run().await.unwrap();
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(read_reply(&mut client).await.starts_with("220 "));

    for (command, expected_code) in [
        ("HELO c\r\n", "250"),
        ("MAIL FROM:<nobody@x>\r\n", "250"),
        ("RCPT TO:<joe@localhost>\r\n", "250"),
        ("DATA\r\n", "354"),
    ] {
        client.write_all(command.as_bytes()).await.unwrap();
        assert!(read_reply(&mut client).await.starts_with(expected_code));
    }

    client
        .write_all(b"From: x\r\nSubject: hi\r\n\r\nhello\r\n.\r\n")
        .await
        .unwrap();
    assert!(read_reply(&mut client).await.starts_with("250"));

    client.write_all(b"QUIT\r\n").await.unwrap();
    assert!(read_reply(&mut client).await.starts_with("221"));

    let mailbox = crate::mailbox::Mailbox::new(maildir.join("joe"));
    let messages = mailbox.list().await.unwrap();
    assert_eq!(messages.len(), 1);

    let content = mailbox.read(&messages[0]).await.unwrap();
    assert!(content.starts_with("Return-Path: <nobody@x>\r\nReceived: from c by localhost ; "));

    tokio::fs::remove_dir_all(&maildir).await.ok();
}

// spec §8(d): POP3 happy path.
#[tokio::test]
async fn pop_stat_retr_dele_then_quit_commits_deletion_and_last() {
    let maildir = scratch_maildir("pop-happy");
    let mailbox = crate::mailbox::Mailbox::new(maildir.join("joe"));
    let mut filenames = Vec::new();
    for body in ["f1", "f2", "f3"] {
        let message = mailbox.add(body).await.unwrap();
        filenames.push(message.filename().to_owned());
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let mut config = Config::default();
    config.maildir = maildir.clone();
    config.users.insert(
        "joe".to_owned(),
        UserRecord {
            credential: Credential::Cleartext("p".to_owned()),
            lists: Vec::new(),
        },
    );
    let config = Arc::new(config);
    let lock_registry = MailboxLockRegistry::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let session =
            crate::pop::PopSession::new(BufReader::new(read_half), write_half, config, lock_registry);
        session.run().await.unwrap();
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(read_reply(&mut client).await.starts_with("+OK"));

    client.write_all(b"USER joe\r\n").await.unwrap();
    assert!(read_reply(&mut client).await.starts_with("+OK"));
    client.write_all(b"PASS p\r\n").await.unwrap();
    assert!(read_reply(&mut client).await.starts_with("+OK"));

    client.write_all(b"STAT\r\n").await.unwrap();
    assert!(read_reply(&mut client).await.starts_with("+OK 3 "));

    client.write_all(b"LIST\r\n").await.unwrap();
    let list_reply = read_reply(&mut client).await;
    assert_eq!(list_reply.lines().count(), 5); // "+OK ..." + 3 entries + "."

    client.write_all(b"RETR 2\r\n").await.unwrap();
    let retr_reply = read_reply(&mut client).await;
    assert!(retr_reply.starts_with("+OK"));
    assert!(retr_reply.contains("f2"));

    client.write_all(b"DELE 1\r\n").await.unwrap();
    assert!(read_reply(&mut client).await.starts_with("+OK"));

    client.write_all(b"QUIT\r\n").await.unwrap();
    assert!(read_reply(&mut client).await.starts_with("+OK"));

    let remaining = mailbox.list().await.unwrap();
    assert_eq!(remaining.len(), 2);
    assert_eq!(
        mailbox.last_retrieved_message().await.unwrap().unwrap().filename(),
        filenames[1]
    );

    tokio::fs::remove_dir_all(&maildir).await.ok();
}

//! End-to-end tests: a real listener on a loopback port, fed by the SMTP client.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use assert_fs::prelude::*;
use predicates::prelude::*;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use mailcatch::client::{self, SmtpClient};
use mailcatch::error::Result;
use mailcatch::smtp::{Listener, SessionSettings};
use mailcatch::store::attachments::{AttachmentStore, CollisionPolicy};
use mailcatch::store::mailroom::Mailroom;
use mailcatch::store::records::RecordStore;

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn load(name: &str) -> Vec<u8> {
    std::fs::read(fixture(name)).unwrap()
}

struct Server {
    addr: SocketAddr,
    mailroom: Arc<Mailroom>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
    dir: assert_fs::TempDir,
}

impl Server {
    async fn start(policy: CollisionPolicy) -> Self {
        let dir = assert_fs::TempDir::new().unwrap();
        let records = RecordStore::open(dir.path().join("emails.db")).unwrap();
        let attachments = AttachmentStore::new(dir.path().join("attachments"), policy);
        let mailroom = Arc::new(Mailroom::new(attachments, records));

        let settings = SessionSettings {
            hostname: "sink.test".into(),
            ..SessionSettings::default()
        };
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), settings, mailroom.clone())
            .await
            .unwrap();
        let addr = listener.local_addr();
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(rx));

        Self {
            addr,
            mailroom,
            shutdown,
            task,
            dir,
        }
    }

    async fn send(&self, payload: &[u8]) -> mailcatch::smtp::reply::Reply {
        client::send_message(
            self.addr,
            "sender@example.com",
            &["rcpt@example.com".to_string()],
            payload,
        )
        .await
        .unwrap()
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        self.task.await.unwrap().unwrap();
    }
}

// ─── Accepted messages become records with increasing ids ───────────

#[tokio::test]
async fn test_accepted_message_is_listed() {
    let server = Server::start(CollisionPolicy::Rename).await;

    let reply = server.send(&load("plain.eml")).await;
    assert_eq!(reply.code, 250);
    let reply = server.send(&load("plain.eml")).await;
    assert_eq!(reply.code, 250);

    let records = server.mailroom.records().list_all().unwrap();
    assert_eq!(records.len(), 2);
    // Newest first
    assert!(records[0].id > records[1].id);
    let first = &records[1];
    assert_eq!(first.sender, "Alice Example <alice@example.com>");
    assert_eq!(first.recipients, "bob@example.com");
    assert_eq!(first.subject, "Plain hello");
    assert!(first.body.contains("Just checking the sink."));
    assert!(first.attachments.is_empty());

    server.stop().await;
}

// ─── Attachments are split from the body ────────────────────────────

#[tokio::test]
async fn test_two_attachments_and_text_body() {
    let server = Server::start(CollisionPolicy::Rename).await;

    assert_eq!(server.send(&load("two_attachments.eml")).await.code, 250);

    let records = server.mailroom.records().list_all().unwrap();
    let record = &records[0];
    assert_eq!(record.body.trim_end(), "See attached.");
    assert_eq!(record.attachments.len(), 2);
    assert!(record.attachments[0].ends_with("report.pdf"));
    assert!(record.attachments[1].ends_with("data.csv"));

    let att = server.dir.child("attachments");
    att.child("report.pdf")
        .assert(predicate::path::is_file());
    att.child("data.csv")
        .assert(predicate::str::starts_with("a,b"));
    let pdf = std::fs::read(att.child("report.pdf").path()).unwrap();
    assert_eq!(&pdf[..8], b"%PDF-1.4");

    server.stop().await;
}

// ─── Undecodable bytes are replaced, not fatal ──────────────────────

#[tokio::test]
async fn test_invalid_charset_bytes_are_replaced() {
    let server = Server::start(CollisionPolicy::Rename).await;

    assert_eq!(server.send(&load("bad_charset.eml")).await.code, 250);

    let records = server.mailroom.records().list_all().unwrap();
    assert!(records[0].body.starts_with("hi"));
    assert!(records[0].body.contains('\u{FFFD}'));

    server.stop().await;
}

// ─── Malformed payloads are refused ─────────────────────────────────

#[tokio::test]
async fn test_malformed_payload_is_rejected_with_550() {
    let server = Server::start(CollisionPolicy::Rename).await;
    assert_eq!(server.send(&load("plain.eml")).await.code, 250);

    let reply = server.send(b"this is not a message header\r\n").await;
    assert_eq!(reply.code, 550);
    assert!(reply.text().starts_with("Error:"));
    assert_eq!(server.mailroom.records().count().unwrap(), 1);

    server.stop().await;
}

// ─── Protocol sequencing over TCP ───────────────────────────────────

#[tokio::test]
async fn test_data_before_rcpt_gets_503_and_session_continues() {
    let server = Server::start(CollisionPolicy::Rename).await;

    let (mut smtp, greeting) = SmtpClient::connect(server.addr).await.unwrap();
    assert_eq!(greeting.code, 220);
    assert!(greeting.text().starts_with("sink.test"));

    assert_eq!(smtp.command("HELO tester").await.unwrap().code, 250);
    assert_eq!(smtp.command("MAIL FROM:<a@example.com>").await.unwrap().code, 250);
    assert_eq!(smtp.command("DATA").await.unwrap().code, 503);
    assert_eq!(smtp.command("RCPT TO:<b@example.com>").await.unwrap().code, 250);
    assert_eq!(smtp.command("DATA").await.unwrap().code, 354);
    assert_eq!(smtp.send_payload(&load("plain.eml")).await.unwrap().code, 250);
    assert_eq!(smtp.command("QUIT").await.unwrap().code, 221);

    assert_eq!(server.mailroom.records().count().unwrap(), 1);
    server.stop().await;
}

// ─── Filename collisions ────────────────────────────────────────────

#[tokio::test]
async fn test_rename_policy_keeps_both_files() {
    let server = Server::start(CollisionPolicy::Rename).await;

    assert_eq!(server.send(&load("notes_first.eml")).await.code, 250);
    assert_eq!(server.send(&load("notes_second.eml")).await.code, 250);

    let att = server.dir.child("attachments");
    att.child("notes.txt").assert(predicate::str::starts_with("first"));
    att.child("notes_1.txt").assert(predicate::str::starts_with("second"));

    let records = server.mailroom.records().list_all().unwrap();
    assert!(records[0].attachments[0].ends_with("notes_1.txt"));
    assert!(records[1].attachments[0].ends_with("notes.txt"));

    server.stop().await;
}

#[tokio::test]
async fn test_overwrite_policy_replaces_file() {
    let server = Server::start(CollisionPolicy::Overwrite).await;

    assert_eq!(server.send(&load("notes_first.eml")).await.code, 250);
    assert_eq!(server.send(&load("notes_second.eml")).await.code, 250);

    let att = server.dir.child("attachments");
    att.child("notes.txt").assert(predicate::str::starts_with("second"));
    att.child("notes_1.txt").assert(predicate::path::missing());

    server.stop().await;
}

// ─── Concurrent sessions ────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_sessions_get_distinct_ids_and_paths() {
    use std::collections::HashSet;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    const SENDERS: usize = 20;
    let server = Server::start(CollisionPolicy::Rename).await;

    // One client parks in the middle of DATA for the whole test.
    let stalled = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let mut stalled = BufReader::new(stalled);
    let mut line = String::new();
    let opening = [
        "",
        "HELO slow\r\n",
        "MAIL FROM:<slow@example.com>\r\n",
        "RCPT TO:<rcpt@example.com>\r\n",
        "DATA\r\n",
    ];
    for command in opening {
        stalled.write_all(command.as_bytes()).await.unwrap();
        line.clear();
        stalled.read_line(&mut line).await.unwrap();
    }
    assert!(line.starts_with("354"), "got {line}");
    stalled
        .write_all(b"Subject: slow\r\n\r\nstill typing\r\n")
        .await
        .unwrap();

    let payload = load("notes_first.eml");
    let sends = (0..SENDERS).map(|_| server.send(&payload));
    let replies = futures::future::join_all(sends).await;
    assert!(replies.iter().all(|r| r.code == 250));

    let records = server.mailroom.records().list_all().unwrap();
    assert_eq!(records.len(), SENDERS);
    let ids: HashSet<i64> = records.iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), SENDERS);
    assert!(records.windows(2).all(|w| w[0].id > w[1].id));
    let paths: HashSet<&String> = records.iter().flat_map(|r| &r.attachments).collect();
    assert_eq!(paths.len(), SENDERS);

    // The stalled session was never blocked on the others.
    stalled.write_all(b".\r\n").await.unwrap();
    line.clear();
    stalled.read_line(&mut line).await.unwrap();
    assert!(line.starts_with("250"), "got {line}");
    assert_eq!(server.mailroom.records().count().unwrap(), SENDERS + 1);

    drop(stalled);
    server.stop().await;
}

// ─── Shutdown ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_shutdown_notifies_idle_session_and_stops_listener() {
    let server = Server::start(CollisionPolicy::Rename).await;

    let (mut smtp, _) = SmtpClient::connect(server.addr).await.unwrap();
    assert_eq!(smtp.command("NOOP").await.unwrap().code, 250);

    let addr = server.addr;
    server.shutdown.send(true).unwrap();
    let reply = smtp.read_reply().await.unwrap();
    assert_eq!(reply.code, 421);
    server.task.await.unwrap().unwrap();

    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
}

// ─── Records survive a restart ──────────────────────────────────────

#[tokio::test]
async fn test_records_persist_across_reopen() {
    let server = Server::start(CollisionPolicy::Rename).await;
    assert_eq!(server.send(&load("plain.eml")).await.code, 250);
    let db = server.dir.path().join("emails.db");
    let Server {
        shutdown,
        task,
        dir,
        mailroom,
        ..
    } = server;
    shutdown.send(true).unwrap();
    task.await.unwrap().unwrap();
    drop(mailroom);

    let reopened = RecordStore::open(&db).unwrap();
    let records = reopened.list_all().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].subject, "Plain hello");
    drop(dir);
}

//! The persistence path for one received message: decompose, store the
//! attachments, then append the record.

use tracing::{info, warn};

use crate::error::Result;
use crate::model::attachment::AttachmentRef;
use crate::model::mail::{ParsedEmail, RawMessage};
use crate::parser::mime;

use super::attachments::{AttachmentStore, CollisionPolicy};
use super::records::RecordStore;

/// Owns both stores and turns raw DATA payloads into persisted records.
pub struct Mailroom {
    attachments: AttachmentStore,
    records: RecordStore,
}

impl Mailroom {
    pub fn new(attachments: AttachmentStore, records: RecordStore) -> Self {
        Self {
            attachments,
            records,
        }
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Ingest one message and return its record id.
    ///
    /// Nothing is persisted if decomposition fails. If a storage write fails
    /// halfway, attachments already written for this message are removed.
    pub fn deliver(&self, raw: &RawMessage) -> Result<i64> {
        let decomposed = mime::decompose(&raw.content, &raw.envelope)?;

        let mut stored = Vec::with_capacity(decomposed.attachments.len());
        for blob in &decomposed.attachments {
            match self.attachments.put(&blob.filename, &blob.data) {
                Ok(reference) => stored.push(reference),
                Err(e) => {
                    self.roll_back(&stored);
                    return Err(e);
                }
            }
        }

        let email = ParsedEmail {
            sender: decomposed.sender,
            recipients: decomposed.recipients,
            subject: decomposed.subject,
            date: decomposed.date,
            body: decomposed.body,
            attachments: stored,
        };

        let id = match self.records.append(&email) {
            Ok(id) => id,
            Err(e) => {
                self.roll_back(&email.attachments);
                return Err(e);
            }
        };

        info!(
            id,
            sender = %email.sender,
            subject = %email.subject,
            attachments = email.attachments.len(),
            "Saved email"
        );
        Ok(id)
    }

    /// Remove the files written for a message that was not recorded.
    ///
    /// Under [`CollisionPolicy::Overwrite`] the path may belong to an earlier
    /// record, so files are left in place.
    fn roll_back(&self, written: &[AttachmentRef]) {
        if self.attachments.policy() == CollisionPolicy::Overwrite {
            return;
        }
        for reference in written {
            if let Err(e) = self.attachments.remove(reference) {
                warn!(
                    path = %reference.storage_path.display(),
                    error = %e,
                    "Could not remove attachment of a rejected message"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mail::Envelope;

    const WITH_ATTACHMENT: &[u8] = b"From: a@x.test\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello\r\n\
--b\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"x.bin\"\r\n\
\r\n\
xx\r\n\
--b--\r\n";

    /// A file-backed store whose table is dropped behind its back, so the
    /// next `append` fails after the attachments are already written.
    fn broken_records(dir: &std::path::Path) -> RecordStore {
        let path = dir.join("emails.db");
        let store = RecordStore::open(&path).unwrap();
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("DROP TABLE emails;")
            .unwrap();
        store
    }

    fn raw(content: &[u8]) -> RawMessage {
        RawMessage {
            envelope: Envelope {
                mail_from: "a@x.test".into(),
                rcpt_to: vec!["b@y.test".into()],
            },
            content: content.to_vec(),
        }
    }

    #[test]
    fn test_deliver_persists_record_and_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let mailroom = Mailroom::new(
            AttachmentStore::new(dir.path().join("att"), CollisionPolicy::Rename),
            RecordStore::in_memory().unwrap(),
        );

        let id = mailroom
            .deliver(&raw(b"From: a@x.test\r\n\
Subject: report\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
\r\n\
see attached\r\n\
--b\r\n\
Content-Type: text/plain\r\n\
Content-Disposition: attachment; filename=\"r.txt\"\r\n\
\r\n\
numbers\r\n\
--b--\r\n"))
            .unwrap();

        let records = mailroom.records().list_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, id);
        assert_eq!(records[0].subject, "report");
        assert_eq!(records[0].attachments.len(), 1);
        assert!(std::path::Path::new(&records[0].attachments[0]).exists());
    }

    #[test]
    fn test_malformed_message_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let mailroom = Mailroom::new(
            AttachmentStore::new(dir.path().join("att"), CollisionPolicy::Rename),
            RecordStore::in_memory().unwrap(),
        );

        let err = mailroom.deliver(&raw(b"garbage without any header\r\n")).unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(mailroom.records().count().unwrap(), 0);
        assert!(!dir.path().join("att").exists());
    }

    #[test]
    fn test_attachment_write_failure_is_not_malformed() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the attachment directory should be.
        let blocker = dir.path().join("att");
        std::fs::write(&blocker, b"not a dir").unwrap();
        let mailroom = Mailroom::new(
            AttachmentStore::new(&blocker, CollisionPolicy::Rename),
            RecordStore::in_memory().unwrap(),
        );

        let err = mailroom
            .deliver(&raw(b"From: a@x.test\r\n\
Content-Type: multipart/mixed; boundary=\"b\"\r\n\
\r\n\
--b\r\n\
Content-Type: application/octet-stream\r\n\
Content-Disposition: attachment; filename=\"x.bin\"\r\n\
\r\n\
xx\r\n\
--b--\r\n"))
            .unwrap_err();
        assert!(!err.is_malformed());
        assert_eq!(mailroom.records().count().unwrap(), 0);
    }

    #[test]
    fn test_failed_append_removes_written_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let att = dir.path().join("att");
        let mailroom = Mailroom::new(
            AttachmentStore::new(&att, CollisionPolicy::Rename),
            broken_records(dir.path()),
        );

        let err = mailroom.deliver(&raw(WITH_ATTACHMENT)).unwrap_err();
        assert!(!err.is_malformed());
        assert_eq!(std::fs::read_dir(&att).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_append_keeps_files_under_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let att = dir.path().join("att");
        let accepted = Mailroom::new(
            AttachmentStore::new(&att, CollisionPolicy::Overwrite),
            RecordStore::in_memory().unwrap(),
        );
        accepted.deliver(&raw(WITH_ATTACHMENT)).unwrap();

        let failing = Mailroom::new(
            AttachmentStore::new(&att, CollisionPolicy::Overwrite),
            broken_records(dir.path()),
        );
        assert!(failing.deliver(&raw(WITH_ATTACHMENT)).is_err());

        // The accepted record still points at an existing file.
        let records = accepted.records().list_all().unwrap();
        assert!(std::path::Path::new(&records[0].attachments[0]).exists());
    }
}

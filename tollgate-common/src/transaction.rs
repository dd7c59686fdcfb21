//! The envelope + message data for one MAIL FROM .. end-of-DATA cycle.

use mailparse::MailHeaderMap;

use crate::address::Address;
use crate::notes::Notes;

/// One mail transaction. A connection runs any number of these in sequence;
/// RSET or end-of-DATA recycles the current one.
///
/// Invariants: the sender is set before any recipient is added, DATA is only
/// accepted with at least one recipient, and the body is append-only until
/// the transaction completes.
#[derive(Debug, Default)]
pub struct Transaction {
    sender: Option<Address>,
    sender_set: bool,
    recipients: Vec<Address>,
    body: Vec<u8>,
    read_pos: usize,
    pub notes: Notes,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the envelope sender. `None` is the null reverse-path `<>`.
    pub fn set_sender(&mut self, sender: Option<Address>) {
        self.sender = sender;
        self.sender_set = true;
    }

    pub fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    /// True once MAIL FROM has been accepted, even for the `<>` sender.
    pub fn has_sender(&self) -> bool {
        self.sender_set
    }

    pub fn add_recipient(&mut self, rcpt: Address) {
        debug_assert!(self.sender_set, "recipient added before sender");
        self.recipients.push(rcpt);
    }

    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    /// Roll back the most recently added recipient (a RCPT the hook chain
    /// denied).
    pub fn pop_recipient(&mut self) -> Option<Address> {
        self.recipients.pop()
    }

    pub fn append_body(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Total body bytes received so far.
    pub fn data_size(&self) -> usize {
        self.body.len()
    }

    /// The full body, independent of the read cursor.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Rewind the body read cursor to the start. Fingerprinting depends on
    /// every reader starting from position zero.
    pub fn body_reset(&mut self) {
        self.read_pos = 0;
    }

    /// Read up to `buf.len()` body bytes from the cursor, advancing it.
    pub fn body_read(&mut self, buf: &mut [u8]) -> usize {
        let remaining = &self.body[self.read_pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.read_pos += n;
        n
    }

    /// Ordered header list parsed from the body. The header section ends at
    /// the first empty line; continuation lines unfold into their header. A
    /// body that does not parse as a header section has no headers.
    pub fn headers(&self) -> Vec<(String, String)> {
        match mailparse::parse_headers(&self.body) {
            Ok((headers, _)) => headers
                .iter()
                .map(|h| (h.get_key(), h.get_value()))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Value of the first `name:` header (case-insensitive), if present.
    pub fn header(&self, name: &str) -> Option<String> {
        let (headers, _) = mailparse::parse_headers(&self.body).ok()?;
        headers.get_first_value(name)
    }
}

//! Mock transport for testing.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use super::traits::{Inbound, Transport, TransportError};
use crate::protocol::{Command, Reply};

/// Mock transport for unit testing dispatcher logic.
///
/// Clones share state, so a test can keep one handle for inspection while
/// the daemon owns another.
#[derive(Clone, Default)]
pub struct MockTransport {
    /// Queued items returned by `receive`.
    inbound: Arc<Mutex<VecDeque<Inbound>>>,
    /// Queued host transfers returned by `read_bulk`.
    bulk: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured replies.
    replies: Arc<Mutex<Vec<Reply>>>,
    /// Captured raw bulk writes.
    raw_writes: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Whether the host is "connected".
    disconnected: Arc<Mutex<bool>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a command with no argument.
    pub fn queue_command(&self, text: &str) {
        self.queue_command_with(text, 0);
    }

    /// Queue a command carrying a message argument.
    pub fn queue_command_with(&self, text: &str, argument: u64) {
        lock(&self.inbound).push_back(Inbound::Command(Command::new(text, argument)));
    }

    /// Queue an inbound DATA message.
    pub fn queue_data(&self, data: &[u8]) {
        lock(&self.inbound).push_back(Inbound::Data(data.to_vec()));
    }

    /// Queue one host bulk transfer.
    pub fn queue_bulk(&self, data: &[u8]) {
        lock(&self.bulk).push_back(data.to_vec());
    }

    /// All replies sent so far.
    pub fn replies(&self) -> Vec<Reply> {
        lock(&self.replies).clone()
    }

    /// Terminal replies only.
    pub fn terminal_replies(&self) -> Vec<Reply> {
        lock(&self.replies)
            .iter()
            .filter(|r| r.is_terminal())
            .cloned()
            .collect()
    }

    /// All raw bulk writes so far.
    pub fn raw_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.raw_writes).clone()
    }

    pub fn clear(&self) {
        lock(&self.replies).clear();
        lock(&self.raw_writes).clear();
    }

    /// Simulate the host going away.
    pub fn disconnect(&self) {
        *lock(&self.disconnected) = true;
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if *lock(&self.disconnected) {
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn receive(&mut self) -> Result<Inbound, TransportError> {
        self.check_connected()?;
        // A drained queue ends the daemon loop like a vanished device.
        lock(&self.inbound).pop_front().ok_or_else(|| {
            TransportError::ReadFailed(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "mock inbound queue drained",
            ))
        })
    }

    fn send(&mut self, reply: &Reply) -> Result<(), TransportError> {
        self.check_connected()?;
        lock(&self.replies).push(reply.clone());
        Ok(())
    }

    fn read_bulk(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        self.check_connected()?;
        let mut chunk = lock(&self.bulk).pop_front().unwrap_or_default();
        chunk.truncate(max_len);
        Ok(chunk)
    }

    fn write_bulk(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.check_connected()?;
        lock(&self.raw_writes).push(data.to_vec());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_inbound_queue() {
        let mut mock = MockTransport::new();
        mock.queue_command("?");
        mock.queue_data(b"abc");

        assert_eq!(
            mock.receive().unwrap(),
            Inbound::Command(Command::new("?", 0))
        );
        assert_eq!(mock.receive().unwrap(), Inbound::Data(b"abc".to_vec()));

        // Queue is empty now
        assert!(mock.receive().unwrap_err().is_fatal());
    }

    #[test]
    fn test_mock_reply_capture() {
        let mut mock = MockTransport::new();
        let handle = mock.clone();
        mock.send(&Reply::Busy).unwrap();
        mock.send(&Reply::okay()).unwrap();
        mock.write_bulk(b"raw").unwrap();

        assert_eq!(handle.replies(), vec![Reply::Busy, Reply::okay()]);
        assert_eq!(handle.terminal_replies(), vec![Reply::okay()]);
        assert_eq!(handle.raw_writes(), vec![b"raw".to_vec()]);
    }

    #[test]
    fn test_mock_disconnect() {
        let mut mock = MockTransport::new();
        mock.disconnect();
        assert!(matches!(
            mock.send(&Reply::okay()),
            Err(TransportError::Disconnected)
        ));
    }
}

//! Text message sessions, one per remote peer

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageAuthor {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextMessage {
    pub timestamp: DateTime<Utc>,
    pub author: MessageAuthor,
    pub message: String,
    pub unread: bool,
}

/// Conversation with one remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextSession {
    pub id: u64,
    pub remote: SocketAddr,
    pub messages: Vec<TextMessage>,
}

impl TextSession {
    pub fn unread_count(&self) -> usize {
        self.messages.iter().filter(|m| m.unread).count()
    }
}

/// All sessions of one engine
#[derive(Debug, Default)]
pub struct TextSessions {
    sessions: Vec<TextSession>,
    next_id: u64,
}

impl TextSessions {
    /// Append a message to the session with `remote`, opening one if needed.
    /// Returns the session id.
    pub fn record(&mut self, remote: SocketAddr, author: MessageAuthor, message: &str) -> u64 {
        let index = match self.sessions.iter().position(|s| s.remote == remote) {
            Some(index) => index,
            None => {
                self.next_id += 1;
                self.sessions.push(TextSession {
                    id: self.next_id,
                    remote,
                    messages: Vec::new(),
                });
                self.sessions.len() - 1
            }
        };

        let session = &mut self.sessions[index];
        session.messages.push(TextMessage {
            timestamp: Utc::now(),
            author,
            message: message.to_string(),
            unread: author == MessageAuthor::Remote,
        });
        session.id
    }

    /// Mark every message of a session read. Returns false for an unknown id.
    pub fn mark_read(&mut self, session_id: u64) -> bool {
        match self.sessions.iter_mut().find(|s| s.id == session_id) {
            Some(session) => {
                session.messages.iter_mut().for_each(|m| m.unread = false);
                true
            }
            None => false,
        }
    }

    pub fn unread_count(&self) -> usize {
        self.sessions.iter().map(TextSession::unread_count).sum()
    }

    pub fn sessions(&self) -> &[TextSession] {
        &self.sessions
    }

    pub fn get(&self, session_id: u64) -> Option<&TextSession> {
        self.sessions.iter().find(|s| s.id == session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_session_per_peer() {
        let mut sessions = TextSessions::default();
        let a: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:4000".parse().unwrap();

        let first = sessions.record(a, MessageAuthor::Remote, "hello");
        let again = sessions.record(a, MessageAuthor::Local, "hi back");
        let other = sessions.record(b, MessageAuthor::Remote, "yo");

        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(sessions.sessions().len(), 2);
        assert_eq!(sessions.get(first).unwrap().messages.len(), 2);
    }

    #[test]
    fn test_unread_tracking() {
        let mut sessions = TextSessions::default();
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();

        let id = sessions.record(peer, MessageAuthor::Remote, "one");
        sessions.record(peer, MessageAuthor::Remote, "two");
        sessions.record(peer, MessageAuthor::Local, "mine");
        assert_eq!(sessions.unread_count(), 2);

        assert!(sessions.mark_read(id));
        assert_eq!(sessions.unread_count(), 0);
        assert!(!sessions.mark_read(id + 100));
    }
}

use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::core::lock;
use crate::engine::Goal;
use crate::error::ConnectionError;
use crate::meta::Meta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Open,
    Establishing,
    Closed,
    Broken,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectionState::Open => "open",
            ConnectionState::Establishing => "establishing",
            ConnectionState::Closed => "closed",
            ConnectionState::Broken => "broken",
        };
        f.write_str(text)
    }
}

/// A framed message. Replies carry the id of the request they answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub correlation: Option<u64>,
    pub topic: String,
    pub meta: Meta,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: 0,
            correlation: None,
            topic: topic.into(),
            meta: Meta::empty(),
            payload: Vec::new(),
        }
    }

    pub fn with_meta(self, meta: Meta) -> Self {
        Self { meta, ..self }
    }

    pub fn with_payload(self, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            ..self
        }
    }

    /// An empty reply on the same topic.
    pub fn reply(&self) -> Envelope {
        Envelope {
            correlation: Some(self.id),
            ..Envelope::new(self.topic.clone())
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ConnectionError> {
        let mut buffer = Vec::new();
        ciborium::into_writer(self, &mut buffer).map_err(|e| ConnectionError::Codec(e.to_string()))?;
        Ok(buffer)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConnectionError> {
        ciborium::from_reader(bytes).map_err(|e| ConnectionError::Codec(e.to_string()))
    }
}

/// A message channel to some remote party.
pub trait RemoteConnection: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Sends without waiting for an answer. Errors are reported, never
    /// swallowed.
    fn send(&self, message: Envelope) -> Result<(), ConnectionError>;

    /// Sends and waits for the correlated response.
    fn request(&self, message: Envelope) -> Result<Envelope, ConnectionError>;

    fn close(&self);
}

/// Issues `message` as a request once the goal is evaluated.
pub fn request_goal(connection: Arc<dyn RemoteConnection>, message: Envelope) -> Goal<Envelope> {
    Goal::depends_on(())
        .label(format!("request:{}", message.topic))
        .run(move |ctx, ()| {
            ctx.checkpoint()?;
            Ok(connection.request(message)?)
        })
}

type Responder = Box<dyn Fn(&Envelope) -> anyhow::Result<Envelope> + Send + Sync>;

/// An in-process connection answering requests with a closure.
pub struct LoopbackConnection {
    state: Mutex<ConnectionState>,
    next_id: AtomicU64,
    responder: Responder,
    sent: Mutex<Vec<Envelope>>,
}

impl LoopbackConnection {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&Envelope) -> anyhow::Result<Envelope> + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(ConnectionState::Open),
            next_id: AtomicU64::new(1),
            responder: Box::new(responder),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Messages delivered through [`RemoteConnection::send`].
    pub fn sent(&self) -> Vec<Envelope> {
        lock(&self.sent).clone()
    }

    /// Marks the transport as failed.
    pub fn break_off(&self) {
        *lock(&self.state) = ConnectionState::Broken;
    }

    fn stamp(&self, mut message: Envelope) -> Result<Envelope, ConnectionError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(ConnectionError::NotOpen(state));
        }
        message.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(message)
    }
}

impl RemoteConnection for LoopbackConnection {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn send(&self, message: Envelope) -> Result<(), ConnectionError> {
        let message = self.stamp(message)?;
        lock(&self.sent).push(message);
        Ok(())
    }

    fn request(&self, message: Envelope) -> Result<Envelope, ConnectionError> {
        let message = self.stamp(message)?;
        let response =
            (self.responder)(&message).map_err(|e| ConnectionError::Responder(e.to_string()))?;

        match response.correlation {
            Some(id) if id == message.id => Ok(response),
            other => Err(ConnectionError::Correlation {
                sent: message.id,
                received: other.unwrap_or_default(),
            }),
        }
    }

    fn close(&self) {
        *lock(&self.state) = ConnectionState::Closed;
    }
}

/// Message ports connecting the driver to command processors and the MMU.
///
/// A port is a named, bounded FIFO inbox. Delivery into a full inbox fails
/// and hands the message back to the sender, which keeps it at the head of
/// its outbound buffer and retries on a later tick — backpressure is a
/// normal, silent condition, never an error.
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::protocol::Msg;

/// Default inbox depth, matching the small per-port buffers the simulated
/// interconnect provides.
pub const DEFAULT_PORT_CAPACITY: usize = 4;

#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

struct PortInner {
    name: String,
    capacity: usize,
    inbox: Mutex<VecDeque<Msg>>,
}

impl Port {
    pub fn new(name: &str) -> Self {
        Self::with_capacity(name, DEFAULT_PORT_CAPACITY)
    }

    pub fn with_capacity(name: &str, capacity: usize) -> Self {
        Port {
            inner: Arc::new(PortInner {
                name: name.to_string(),
                capacity,
                inbox: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Deposit a message into this port's inbox. Returns the message back
    /// to the caller when the inbox is full.
    pub fn deliver(&self, msg: Msg) -> std::result::Result<(), Msg> {
        let mut inbox = self.inner.inbox.lock().unwrap();
        if inbox.len() >= self.inner.capacity {
            return Err(msg);
        }
        inbox.push_back(msg);
        Ok(())
    }

    /// Pop the oldest pending message, if any.
    pub fn retrieve(&self) -> Option<Msg> {
        self.inner.inbox.lock().unwrap().pop_front()
    }

    /// Whether a message is waiting without consuming it.
    pub fn has_pending(&self) -> bool {
        !self.inner.inbox.lock().unwrap().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.inbox.lock().unwrap().len()
    }

    /// Two handles are the same port iff they share the same inbox.
    pub fn same_port(&self, other: &Port) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port").field("name", &self.inner.name).finish()
    }
}

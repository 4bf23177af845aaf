//! Mailboxes
//!
//! Message passing between tasks, built only from [`Lock`] and
//! [`Condition`]. Each mailbox is a circular byte buffer holding
//! length-prefixed messages: one length byte, then the body. A sender
//! waits on `more_space` while the message does not fit; a receiver waits
//! on `more_data` while the box is empty.
//!
//! Mailboxes are named by a small integer key. Opening one returns a
//! handle allocated from a slab.

use super::Kernel;
use super::lock::{Condition, Lock};
use slab::Slab;
use std::cell::RefCell;
use std::fmt;

/// Number of mailbox keys
pub const MAX_MAILBOXES: usize = 5;
/// Bytes in each mailbox buffer, headers included
pub const MAILBOX_BUFFER_SIZE: usize = 256;
/// Largest body that fits in an empty mailbox
pub const MAX_MESSAGE_SIZE: usize = MAILBOX_BUFFER_SIZE - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxHandle(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// Key outside `0..MAX_MAILBOXES`
    BadKey(usize),
    /// Handle not open
    BadHandle(MailboxHandle),
    /// Body longer than [`MAX_MESSAGE_SIZE`]
    TooLarge { size: usize },
}

impl fmt::Display for MailboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MailboxError::BadKey(key) => write!(f, "no mailbox with key {}", key),
            MailboxError::BadHandle(h) => write!(f, "mailbox handle {} is not open", h.0),
            MailboxError::TooLarge { size } => {
                write!(f, "message of {} bytes exceeds {}", size, MAX_MESSAGE_SIZE)
            }
        }
    }
}

impl std::error::Error for MailboxError {}

/// Messages queued and free bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStat {
    pub count: usize,
    pub space: usize,
}

/// The circular buffer
#[derive(Debug)]
struct Buffer {
    bytes: Vec<u8>,
    head: usize,
    tail: usize,
    used: usize,
    count: usize,
    users: usize,
}

impl Buffer {
    fn new() -> Self {
        Self {
            bytes: vec![0; MAILBOX_BUFFER_SIZE],
            head: 0,
            tail: 0,
            used: 0,
            count: 0,
            users: 0,
        }
    }

    fn space(&self) -> usize {
        MAILBOX_BUFFER_SIZE - self.used
    }

    fn push(&mut self, body: &[u8]) {
        self.put(body.len() as u8);
        for &b in body {
            self.put(b);
        }
        self.count += 1;
    }

    fn put(&mut self, b: u8) {
        self.bytes[self.head] = b;
        self.head = (self.head + 1) % MAILBOX_BUFFER_SIZE;
        self.used += 1;
    }

    fn pop(&mut self) -> Vec<u8> {
        let size = self.take() as usize;
        let body = (0..size).map(|_| self.take()).collect();
        self.count -= 1;
        body
    }

    fn take(&mut self) -> u8 {
        let b = self.bytes[self.tail];
        self.tail = (self.tail + 1) % MAILBOX_BUFFER_SIZE;
        self.used -= 1;
        b
    }
}

struct Mailbox {
    lock: Lock,
    more_data: Condition,
    more_space: Condition,
    buffer: RefCell<Buffer>,
}

/// The mailbox table
pub struct Mailboxes {
    boxes: Vec<Mailbox>,
    handles: RefCell<Slab<usize>>,
}

impl Mailboxes {
    pub fn new(kernel: &Kernel) -> Self {
        let boxes = (0..MAX_MAILBOXES)
            .map(|_| Mailbox {
                lock: Lock::new(kernel),
                more_data: Condition::new(kernel),
                more_space: Condition::new(kernel),
                buffer: RefCell::new(Buffer::new()),
            })
            .collect();
        Self {
            boxes,
            handles: RefCell::new(Slab::new()),
        }
    }

    fn mailbox(&self, handle: MailboxHandle) -> Result<&Mailbox, MailboxError> {
        let key = *self
            .handles
            .borrow()
            .get(handle.0)
            .ok_or(MailboxError::BadHandle(handle))?;
        Ok(&self.boxes[key])
    }

    pub async fn open(&self, key: usize) -> Result<MailboxHandle, MailboxError> {
        let mb = self.boxes.get(key).ok_or(MailboxError::BadKey(key))?;
        mb.lock.acquire().await;
        mb.buffer.borrow_mut().users += 1;
        let handle = MailboxHandle(self.handles.borrow_mut().insert(key));
        mb.lock.release();
        Ok(handle)
    }

    pub async fn close(&self, handle: MailboxHandle) -> Result<(), MailboxError> {
        let mb = self.mailbox(handle)?;
        mb.lock.acquire().await;
        {
            let mut buffer = mb.buffer.borrow_mut();
            buffer.users = buffer.users.saturating_sub(1);
        }
        self.handles.borrow_mut().try_remove(handle.0);
        mb.lock.release();
        Ok(())
    }

    pub async fn stat(&self, handle: MailboxHandle) -> Result<MailboxStat, MailboxError> {
        let mb = self.mailbox(handle)?;
        mb.lock.acquire().await;
        let stat = {
            let buffer = mb.buffer.borrow();
            MailboxStat {
                count: buffer.count,
                space: buffer.space(),
            }
        };
        mb.lock.release();
        Ok(stat)
    }

    /// Queue a message, waiting for room
    pub async fn send(&self, handle: MailboxHandle, body: &[u8]) -> Result<(), MailboxError> {
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(MailboxError::TooLarge { size: body.len() });
        }
        let mb = self.mailbox(handle)?;

        mb.lock.acquire().await;
        while mb.buffer.borrow().space() < body.len() + 1 {
            mb.more_space.wait(&mb.lock).await;
        }
        mb.buffer.borrow_mut().push(body);
        mb.more_data.signal();
        mb.lock.release();
        Ok(())
    }

    /// Take the oldest message, waiting for one to arrive
    pub async fn recv(&self, handle: MailboxHandle) -> Result<Vec<u8>, MailboxError> {
        let mb = self.mailbox(handle)?;

        mb.lock.acquire().await;
        while mb.buffer.borrow().count == 0 {
            mb.more_data.wait(&mb.lock).await;
        }
        let body = mb.buffer.borrow_mut().pop();
        mb.more_space.signal();
        mb.lock.release();
        Ok(body)
    }

    /// Tasks that currently have `key` open
    pub fn users(&self, key: usize) -> usize {
        self.boxes.get(key).map_or(0, |mb| mb.buffer.borrow().users)
    }
}

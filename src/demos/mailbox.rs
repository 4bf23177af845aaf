//! Producer and consumer over one mailbox
//!
//! Messages are large enough that the producer fills the box and has to
//! wait for the consumer to drain it.

use super::Transcript;
use crate::kernel::mailbox::Mailboxes;
use crate::kernel::{Kernel, KernelResult};
use std::rc::Rc;

const KEY: usize = 0;
const MESSAGES: usize = 12;
const DONE: &[u8] = b"done";

fn message(i: usize) -> Vec<u8> {
    let mut body = format!("message {:02} ", i).into_bytes();
    body.resize(16 + i * 8, b'.');
    body
}

pub fn spawn(kernel: &Kernel, transcript: &Transcript) -> KernelResult<()> {
    let boxes = Rc::new(Mailboxes::new(kernel));

    let (b, out) = (boxes.clone(), transcript.clone());
    kernel.spawn_thread("producer", move |_cx| async move {
        let handle = match b.open(KEY).await {
            Ok(h) => h,
            Err(e) => return out.push(format!("producer: {}", e)),
        };
        for i in 0..MESSAGES {
            if let Err(e) = b.send(handle, &message(i)).await {
                return out.push(format!("producer: {}", e));
            }
        }
        let _ = b.send(handle, DONE).await;
        if let Ok(stat) = b.stat(handle).await {
            out.push(format!(
                "producer: sent {}, {} queued, {} bytes free",
                MESSAGES, stat.count, stat.space
            ));
        }
        let _ = b.close(handle).await;
    })?;

    let (b, out) = (boxes, transcript.clone());
    kernel.spawn_thread("consumer", move |_cx| async move {
        let handle = match b.open(KEY).await {
            Ok(h) => h,
            Err(e) => return out.push(format!("consumer: {}", e)),
        };
        let mut received = 0;
        while let Ok(body) = b.recv(handle).await {
            if body == DONE {
                break;
            }
            received += 1;
            out.push(format!(
                "consumer: {} ({} bytes)",
                String::from_utf8_lossy(&body[..10]),
                body.len()
            ));
        }
        out.push(format!("consumer: received {}", received));
        let _ = b.close(handle).await;
    })?;
    Ok(())
}

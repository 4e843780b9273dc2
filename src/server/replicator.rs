// Replication fan-out: every write-class command received by this node
// is queued (by reference, no copy) for each configured peer and
// re-streamed over a dedicated connection. A command writer is reused
// across reconnects via `io_rewind`, so a frame interrupted by a peer
// failure is re-sent from the start on the next connection.

use crate::concurrent::queue::MessageQueue;
use crate::concurrent::registry;
use crate::error::{CacheError, Result};
use crate::protocol::buffers::SharedBuffers;
use crate::protocol::io::{CommandWriter, IoOutcome, StreamDevice};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct ReplicatorService {
    queue: Arc<MessageQueue<Arc<SharedBuffers>>>,
    thread: Option<JoinHandle<()>>,
    slot: usize,
}

impl ReplicatorService {
    pub fn start(peer_address: String, slot: usize) -> Result<Self> {
        let queue = Arc::new(MessageQueue::new(64, 65536));
        let consumer = Arc::clone(&queue);
        let thread = std::thread::Builder::new()
            .name(format!("replicator-{slot}"))
            .spawn(move || {
                let _registration = registry::register_thread(slot);
                run_replicator(consumer, peer_address);
            })
            .map_err(|e| CacheError::Server(format!("cannot spawn replicator thread: {e}")))?;
        Ok(Self {
            queue,
            thread: Some(thread),
            slot,
        })
    }

    pub fn enqueue(&self, frame: Arc<SharedBuffers>) -> Result<()> {
        self.queue.put(frame)
    }

    pub fn stop(&mut self) {
        self.queue.close();
        registry::request_quit(self.slot);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ReplicatorService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn connect(peer: &str) -> Option<StreamDevice<TcpStream>> {
    match TcpStream::connect(peer) {
        Ok(stream) => {
            let _ = stream.set_nodelay(true);
            Some(StreamDevice::new(stream))
        }
        Err(e) => {
            log::warn!("replicator cannot reach '{peer}': {e}");
            None
        }
    }
}

fn run_replicator(queue: Arc<MessageQueue<Arc<SharedBuffers>>>, peer: String) {
    let mut device: Option<StreamDevice<TcpStream>> = None;
    loop {
        let frame = match queue.get_timeout(Duration::from_millis(500)) {
            Some(frame) => frame,
            None => {
                if queue.is_closed() || registry::quit_requested() {
                    return;
                }
                continue;
            }
        };
        let mut writer = CommandWriter::new(frame);
        loop {
            if registry::quit_requested() {
                return;
            }
            if device.is_none() {
                device = connect(&peer);
                if device.is_none() {
                    std::thread::sleep(RECONNECT_DELAY);
                    continue;
                }
            }
            let Some(stream) = device.as_mut() else {
                continue;
            };
            match writer.write(stream) {
                IoOutcome::Done => break,
                IoOutcome::Retry => continue,
                IoOutcome::Eof | IoOutcome::Error => {
                    // drop the connection and replay the frame whole
                    device = None;
                    writer.io_rewind();
                    std::thread::sleep(RECONNECT_DELAY);
                }
            }
        }
    }
}

// Binlog: append-only journal of framed write-class commands, one file
// per store domain. The file format is exactly the wire format, so
// replay is plain re-dispatch and a database dump (`STORE`) is just a
// binlog of synthetic write commands.

use crate::concurrent::queue::MessageQueue;
use crate::concurrent::registry;
use crate::error::{CacheError, Result};
use crate::protocol::buffers::SharedBuffers;
use crate::protocol::io::{CommandWriter, IoOutcome, StreamDevice};
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

enum BinlogMessage {
    Frame(Arc<SharedBuffers>),
    Rotate,
}

/// Handle to one binlog service thread.
pub struct BinlogService {
    queue: Arc<MessageQueue<BinlogMessage>>,
    thread: Option<JoinHandle<()>>,
    slot: usize,
}

impl BinlogService {
    /// Spawns the service on the given registry slot, appending to
    /// `path`.
    pub fn start(path: String, slot: usize) -> Result<Self> {
        let queue = Arc::new(MessageQueue::new(64, 65536));
        let consumer = Arc::clone(&queue);
        let file = open_append(&path)?;
        let thread = std::thread::Builder::new()
            .name(format!("binlog-{slot}"))
            .spawn(move || {
                let _registration = registry::register_thread(slot);
                run_binlog(consumer, path, file);
            })
            .map_err(|e| CacheError::Server(format!("cannot spawn binlog thread: {e}")))?;
        Ok(Self {
            queue,
            thread: Some(thread),
            slot,
        })
    }

    pub fn append(&self, frame: Arc<SharedBuffers>) -> Result<()> {
        self.queue.put(BinlogMessage::Frame(frame))
    }

    pub fn rotate(&self) -> Result<()> {
        self.queue.put(BinlogMessage::Rotate)
    }

    pub fn stop(&mut self) {
        self.queue.close();
        registry::request_quit(self.slot);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for BinlogService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_append(path: &str) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CacheError::Server(format!("cannot open binlog '{path}': {e}")))
}

fn run_binlog(queue: Arc<MessageQueue<BinlogMessage>>, path: String, file: File) {
    let mut device = StreamDevice::new(file);
    loop {
        match queue.get_timeout(Duration::from_millis(500)) {
            Some(BinlogMessage::Frame(frame)) => {
                let mut writer = CommandWriter::new(frame);
                loop {
                    match writer.write(&mut device) {
                        IoOutcome::Done => break,
                        IoOutcome::Retry => continue,
                        IoOutcome::Eof | IoOutcome::Error => {
                            log::error!("binlog '{path}' write failed; frame dropped");
                            break;
                        }
                    }
                }
            }
            Some(BinlogMessage::Rotate) => match rotate_file(&path) {
                Ok(file) => {
                    device = StreamDevice::new(file);
                    log::info!("binlog '{path}' rotated");
                }
                Err(e) => log::error!("binlog rotation failed: {e}"),
            },
            None => {
                if queue.is_closed() || registry::quit_requested() {
                    return;
                }
            }
        }
    }
}

/// Renames the current file with a timestamp suffix and reopens a fresh
/// one under the original name.
fn rotate_file(path: &str) -> Result<File> {
    let rotated = PathBuf::from(format!("{path}.{}", crate::store::timestamp()));
    std::fs::rename(path, &rotated)
        .map_err(|e| CacheError::Server(format!("cannot rename '{path}': {e}")))?;
    open_append(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Domain;
    use crate::protocol::builders::HeaderChunkBuilder;
    use crate::protocol::io::{CommandReader, MemoryDevice};
    use crate::protocol::{AuthLevel, Command};

    fn frame(command: Command) -> Arc<SharedBuffers> {
        let mut sb = SharedBuffers::new(Domain::Global);
        let mut header = HeaderChunkBuilder::command(command, AuthLevel::None, 0, true);
        header.configure(&mut sb, None);
        header.check();
        sb.freeze()
    }

    #[test]
    fn test_append_and_replay_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.blf");
        let path_str = path.to_str().unwrap().to_string();

        let mut service = BinlogService::start(path_str.clone(), 60).unwrap();
        service.append(frame(Command::Ping)).unwrap();
        service.append(frame(Command::Check)).unwrap();
        service.stop();

        // the file is a concatenation of wire frames
        let bytes = std::fs::read(&path).unwrap();
        let mut device = MemoryDevice::new(bytes);
        let mut reader = CommandReader::new(Domain::Global);
        assert_eq!(reader.read(&mut device), IoOutcome::Done);
        assert_eq!(reader.command(), Some(Command::Ping));
        let mut reader = CommandReader::new(Domain::Global);
        assert_eq!(reader.read(&mut device), IoOutcome::Done);
        assert_eq!(reader.command(), Some(Command::Check));
    }

    #[test]
    fn test_rotation_starts_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fpc.blf");
        let path_str = path.to_str().unwrap().to_string();

        let mut service = BinlogService::start(path_str.clone(), 61).unwrap();
        service.append(frame(Command::Ping)).unwrap();
        service.rotate().unwrap();
        // give the service time to process before stopping
        std::thread::sleep(Duration::from_millis(100));
        service.append(frame(Command::Check)).unwrap();
        service.stop();

        let fresh = std::fs::read(&path).unwrap();
        let mut device = MemoryDevice::new(fresh);
        let mut reader = CommandReader::new(Domain::Global);
        assert_eq!(reader.read(&mut device), IoOutcome::Done);
        assert_eq!(reader.command(), Some(Command::Check));
    }
}

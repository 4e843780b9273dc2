// Client side of the wire protocol, used by the `cybercache` admin
// console and by integration tests: builds command frames, drives the
// writer/reader FSMs over a blocking socket, and decodes responses.

use crate::compression::{Compressor, DEFAULT_COMPRESSOR};
use crate::error::{CacheError, Result};
use crate::hashing::{password_hasher, INVALID_HASH_VALUE};
use crate::memory::Domain;
use crate::protocol::buffers::SharedBuffers;
use crate::protocol::builders::{
    HeaderChunkBuilder, HeaderListChunkBuilder, PayloadChunkBuilder,
};
use crate::protocol::chunks::{ChunkType, PayloadReader};
use crate::protocol::io::{CommandWriter, IoOutcome, ResponseReader, StreamDevice};
use crate::protocol::{
    AuthLevel, CleanMode, Command, ResponseType, UserAgent, DEFAULT_COMPRESSION_THRESHOLD,
};
use std::net::TcpStream;

/// Decoded server response
#[derive(Debug, PartialEq, Eq)]
pub enum ServerResponse {
    Ok,
    /// `DATA` carrying bytes (decompressed)
    Data(Vec<u8>),
    /// `DATA` carrying a bare number in its header
    Number(i64),
    List(Vec<Vec<u8>>),
    Error(String),
}

/// Client-side connection settings
#[derive(Clone)]
pub struct ClientOptions {
    pub user_password: Option<String>,
    pub admin_password: Option<String>,
    pub marker: bool,
    pub compressor: Compressor,
    pub compression_threshold: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            user_password: None,
            admin_password: None,
            marker: true,
            compressor: DEFAULT_COMPRESSOR,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

enum Arg<'a> {
    Number(i64),
    String(&'a [u8]),
    List(&'a [Vec<u8>]),
}

pub struct CacheClient {
    device: StreamDevice<TcpStream>,
    options: ClientOptions,
}

impl CacheClient {
    pub fn connect(address: &str, options: ClientOptions) -> Result<Self> {
        let stream = TcpStream::connect(address)
            .map_err(|e| CacheError::Network(format!("cannot connect to '{address}': {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            device: StreamDevice::new(stream),
            options,
        })
    }

    fn auth_for(&self, command: Command) -> (AuthLevel, u64) {
        let (password, level) = match command.required_auth() {
            AuthLevel::Admin => (&self.options.admin_password, AuthLevel::Admin),
            _ => (&self.options.user_password, AuthLevel::User),
        };
        match password {
            Some(password) if !password.is_empty() => {
                (level, password_hasher().hash(password.as_bytes()))
            }
            _ => (AuthLevel::None, INVALID_HASH_VALUE),
        }
    }

    fn build(&self, command: Command, args: &[Arg<'_>], payload: Option<&[u8]>) -> SharedBuffers {
        let mut sb = SharedBuffers::new(Domain::Global);
        let (level, hash) = self.auth_for(command);

        let body = payload.map(|data| {
            let mut builder = PayloadChunkBuilder::new(
                self.options.compressor,
                self.options.compression_threshold,
            );
            builder.add(
                &mut sb,
                data,
                crate::compression::DataHint::Generic,
            );
            builder
        });

        // header lists are two-phase, so estimate them first
        let mut lists: Vec<HeaderListChunkBuilder> = Vec::new();
        for arg in args {
            if let Arg::List(items) = arg {
                let mut list = HeaderListChunkBuilder::new(Domain::Global.memory());
                for item in *items {
                    list.estimate(item);
                }
                list.configure();
                for item in *items {
                    list.add(item);
                }
                list.check();
                lists.push(list);
            }
        }

        let mut header = HeaderChunkBuilder::command(command, level, hash, self.options.marker);
        let mut list_cursor = 0;
        for arg in args {
            match arg {
                Arg::Number(n) => {
                    header.estimate_number(*n);
                }
                Arg::String(s) => {
                    header.estimate_string(s);
                }
                Arg::List(_) => {
                    header.estimate_list(&lists[list_cursor]);
                    list_cursor += 1;
                }
            }
        }
        header.configure(&mut sb, body.as_ref());
        list_cursor = 0;
        for arg in args {
            match arg {
                Arg::Number(n) => header.add_number(&mut sb, *n),
                Arg::String(s) => header.add_string(&mut sb, s),
                Arg::List(_) => {
                    header.add_list(&mut sb, &lists[list_cursor]);
                    list_cursor += 1;
                }
            }
        }
        header.check();
        sb
    }

    fn roundtrip(
        &mut self,
        command: Command,
        args: &[Arg<'_>],
        payload: Option<&[u8]>,
    ) -> Result<ServerResponse> {
        let sb = self.build(command, args, payload);
        let mut writer = CommandWriter::new(sb.freeze());
        loop {
            match writer.write(&mut self.device) {
                IoOutcome::Done => break,
                IoOutcome::Retry => continue,
                IoOutcome::Eof => {
                    return Err(CacheError::Network("connection closed".to_string()));
                }
                IoOutcome::Error => return Err(CacheError::Network("send failed".to_string())),
            }
        }
        self.read_response()
    }

    fn read_response(&mut self) -> Result<ServerResponse> {
        let mut reader = ResponseReader::new(Domain::Global);
        loop {
            match reader.read(&mut self.device) {
                IoOutcome::Done => break,
                IoOutcome::Retry => continue,
                IoOutcome::Eof => {
                    return Err(CacheError::Network("connection closed".to_string()));
                }
                IoOutcome::Error => {
                    return Err(CacheError::Protocol("malformed response".to_string()));
                }
            }
        }
        decode_response(reader)
    }

    ///////////////////////////////////////////////////////////////////////
    // VERBS
    ///////////////////////////////////////////////////////////////////////

    pub fn ping(&mut self) -> Result<ServerResponse> {
        self.roundtrip(Command::Ping, &[], None)
    }

    pub fn check(&mut self) -> Result<ServerResponse> {
        self.roundtrip(Command::Check, &[], None)
    }

    pub fn info(&mut self, mask: u8) -> Result<ServerResponse> {
        self.roundtrip(Command::Info, &[Arg::Number(mask as i64)], None)
    }

    pub fn stats(&mut self, mask: u8, pattern: &str) -> Result<ServerResponse> {
        self.roundtrip(
            Command::Stats,
            &[Arg::Number(mask as i64), Arg::String(pattern.as_bytes())],
            None,
        )
    }

    pub fn shutdown(&mut self) -> Result<ServerResponse> {
        self.roundtrip(Command::Shutdown, &[], None)
    }

    pub fn load_config(&mut self, path: &str) -> Result<ServerResponse> {
        self.roundtrip(Command::LoadConfig, &[Arg::String(path.as_bytes())], None)
    }

    pub fn restore(&mut self, path: &str) -> Result<ServerResponse> {
        self.roundtrip(Command::Restore, &[Arg::String(path.as_bytes())], None)
    }

    pub fn store(&mut self, mask: u8, path: &str) -> Result<ServerResponse> {
        self.roundtrip(
            Command::Store,
            &[
                Arg::Number(mask as i64),
                Arg::String(path.as_bytes()),
                Arg::Number(UserAgent::Unknown as i64),
                Arg::Number(0),
            ],
            None,
        )
    }

    pub fn get(&mut self, names: &[Vec<u8>]) -> Result<ServerResponse> {
        self.roundtrip(Command::Get, &[Arg::List(names)], None)
    }

    pub fn set(&mut self, line: &str) -> Result<ServerResponse> {
        self.roundtrip(Command::Set, &[Arg::String(line.as_bytes())], None)
    }

    pub fn log(&mut self, message: &str) -> Result<ServerResponse> {
        self.roundtrip(Command::Log, &[Arg::String(message.as_bytes())], None)
    }

    pub fn rotate(&mut self, mask: u8) -> Result<ServerResponse> {
        self.roundtrip(Command::Rotate, &[Arg::Number(mask as i64)], None)
    }

    pub fn read(
        &mut self,
        id: &[u8],
        agent: UserAgent,
        request_id: u32,
    ) -> Result<ServerResponse> {
        self.roundtrip(
            Command::Read,
            &[
                Arg::String(id),
                Arg::Number(agent as i64),
                Arg::Number(request_id as i64),
            ],
            None,
        )
    }

    pub fn write(
        &mut self,
        id: &[u8],
        data: &[u8],
        lifetime: i64,
        agent: UserAgent,
        request_id: u32,
    ) -> Result<ServerResponse> {
        self.roundtrip(
            Command::Write,
            &[
                Arg::String(id),
                Arg::Number(agent as i64),
                Arg::Number(lifetime),
                Arg::Number(request_id as i64),
            ],
            Some(data),
        )
    }

    pub fn destroy(&mut self, id: &[u8]) -> Result<ServerResponse> {
        self.roundtrip(Command::Destroy, &[Arg::String(id)], None)
    }

    pub fn gc(&mut self, seconds: u32) -> Result<ServerResponse> {
        self.roundtrip(Command::Gc, &[Arg::Number(seconds as i64)], None)
    }

    pub fn load(&mut self, id: &[u8], agent: UserAgent) -> Result<ServerResponse> {
        self.roundtrip(
            Command::Load,
            &[Arg::String(id), Arg::Number(agent as i64)],
            None,
        )
    }

    pub fn test(&mut self, id: &[u8], agent: UserAgent) -> Result<ServerResponse> {
        self.roundtrip(
            Command::Test,
            &[Arg::String(id), Arg::Number(agent as i64)],
            None,
        )
    }

    pub fn save(
        &mut self,
        id: &[u8],
        data: &[u8],
        lifetime: i64,
        agent: UserAgent,
        tags: &[Vec<u8>],
    ) -> Result<ServerResponse> {
        self.roundtrip(
            Command::Save,
            &[
                Arg::String(id),
                Arg::Number(agent as i64),
                Arg::Number(lifetime),
                Arg::List(tags),
            ],
            Some(data),
        )
    }

    pub fn remove(&mut self, id: &[u8]) -> Result<ServerResponse> {
        self.roundtrip(Command::Remove, &[Arg::String(id)], None)
    }

    pub fn clean(&mut self, mode: CleanMode, tags: &[Vec<u8>]) -> Result<ServerResponse> {
        self.roundtrip(
            Command::Clean,
            &[Arg::Number(mode as i64), Arg::List(tags)],
            None,
        )
    }

    pub fn get_ids(&mut self) -> Result<ServerResponse> {
        self.roundtrip(Command::GetIds, &[], None)
    }

    pub fn get_tags(&mut self) -> Result<ServerResponse> {
        self.roundtrip(Command::GetTags, &[], None)
    }

    pub fn get_ids_matching_tags(&mut self, tags: &[Vec<u8>]) -> Result<ServerResponse> {
        self.roundtrip(Command::GetIdsMatchingTags, &[Arg::List(tags)], None)
    }

    pub fn get_ids_not_matching_tags(&mut self, tags: &[Vec<u8>]) -> Result<ServerResponse> {
        self.roundtrip(Command::GetIdsNotMatchingTags, &[Arg::List(tags)], None)
    }

    pub fn get_ids_matching_any_tags(&mut self, tags: &[Vec<u8>]) -> Result<ServerResponse> {
        self.roundtrip(Command::GetIdsMatchingAnyTags, &[Arg::List(tags)], None)
    }

    pub fn get_filling_percentage(&mut self) -> Result<ServerResponse> {
        self.roundtrip(Command::GetFillingPercentage, &[], None)
    }

    pub fn get_metadatas(&mut self, id: &[u8]) -> Result<ServerResponse> {
        self.roundtrip(Command::GetMetadatas, &[Arg::String(id)], None)
    }

    pub fn touch(&mut self, id: &[u8], extra: i64) -> Result<ServerResponse> {
        self.roundtrip(
            Command::Touch,
            &[Arg::String(id), Arg::Number(extra)],
            None,
        )
    }
}

fn decode_response(reader: ResponseReader) -> Result<ServerResponse> {
    match reader.response_type() {
        ResponseType::Ok => Ok(ServerResponse::Ok),
        ResponseType::Error => {
            let mut chunks = reader.header_chunks();
            let message = match chunks.next_string() {
                Ok(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                Err(_) => "(no message)".to_string(),
            };
            Ok(ServerResponse::Error(message))
        }
        ResponseType::Data => {
            let mut chunks = reader.header_chunks();
            if chunks.next_chunk_type() == ChunkType::Number {
                return Ok(ServerResponse::Number(chunks.next_number()?));
            }
            drop(chunks);
            if !reader.has_payload_field() {
                // a DATA response with neither header chunks nor a
                // payload slot is malformed
                return Err(CacheError::Protocol(
                    "DATA response with no content".to_string(),
                ));
            }
            let info = reader.payload_info();
            if info.has_errors {
                return Err(CacheError::Protocol("bad payload description".to_string()));
            }
            let data = reader
                .shared_buffers()
                .clone_payload_bytes()
                .unwrap_or_default();
            let payload = PayloadReader::new(
                data,
                info.compressor,
                info.usize,
                Domain::Global.memory(),
            )?;
            Ok(ServerResponse::Data(payload.as_slice().to_vec()))
        }
        ResponseType::List => {
            let count = {
                let mut chunks = reader.header_chunks();
                chunks.next_number()?.max(0) as u32
            };
            let info = reader.payload_info();
            let data = reader
                .shared_buffers()
                .clone_payload_bytes()
                .unwrap_or_default();
            let mut payload = PayloadReader::new(
                data,
                info.compressor,
                info.usize,
                Domain::Global.memory(),
            )?;
            Ok(ServerResponse::List(payload.read_strings(count)?))
        }
    }
}

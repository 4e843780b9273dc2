// # Server Core
//
// Command dispatch over the session and FPC stores, with binlog and
// replication fan-out for write-class commands. One received frame can
// feed the executor, a binlog service, and a replication peer at the
// same time: its `SharedBuffers` is frozen into an `Arc` and every
// consumer runs its own writer over the same immutable bytes.

pub mod binlog;
pub mod optimizer;
pub mod replicator;

use crate::compression::Compressor;
use crate::config::SharedConfig;
use crate::concurrent::registry;
use crate::error::{CacheError, Result};
use crate::memory::Domain;
use crate::protocol::buffers::{BorrowedPayload, SharedBuffers};
use crate::protocol::builders::{
    HeaderChunkBuilder, PayloadChunkBuilder, PayloadListChunkBuilder,
};
use crate::protocol::io::{
    CommandReader, IoOutcome, ResponseWriter, StreamDevice,
};
use crate::protocol::{
    AuthLevel, CleanMode, Command, ResponseType, UserAgent, DM_FPC, DM_GLOBAL, DM_SESSION,
};
use crate::hashing::INVALID_HASH_VALUE;
use crate::store::session_store::SessionReadOutcome;
use crate::store::tags::TagMatch;
use crate::store::{timestamp, PageStore, SessionStore, NEVER_EXPIRES};
use binlog::BinlogService;
use replicator::ReplicatorService;
use bytes::Bytes;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub struct CacheServer {
    config: SharedConfig,
    pub sessions: Arc<SessionStore>,
    pub pages: Arc<PageStore>,
    session_binlog: Option<BinlogService>,
    fpc_binlog: Option<BinlogService>,
    session_replicator: Option<ReplicatorService>,
    fpc_replicator: Option<ReplicatorService>,
    shutdown: AtomicBool,
    started_at: u32,
}

impl CacheServer {
    pub fn new(config: SharedConfig) -> Result<Self> {
        let (session_binlog_path, fpc_binlog_path, session_peer, fpc_peer) = {
            let cfg = config.read();
            (
                cfg.session_binlog_path.clone(),
                cfg.fpc_binlog_path.clone(),
                cfg.session_replicator_address.clone(),
                cfg.fpc_replicator_address.clone(),
            )
        };
        let session_binlog = session_binlog_path
            .map(|path| BinlogService::start(path, registry::TI_SESSION_BINLOG))
            .transpose()?;
        let fpc_binlog = fpc_binlog_path
            .map(|path| BinlogService::start(path, registry::TI_FPC_BINLOG))
            .transpose()?;
        let session_replicator = session_peer
            .map(|peer| ReplicatorService::start(peer, registry::TI_SESSION_REPLICATOR))
            .transpose()?;
        let fpc_replicator = fpc_peer
            .map(|peer| ReplicatorService::start(peer, registry::TI_FPC_REPLICATOR))
            .transpose()?;
        Ok(Self {
            sessions: Arc::new(SessionStore::new(Arc::clone(&config))),
            pages: Arc::new(PageStore::new(Arc::clone(&config))),
            config,
            session_binlog,
            fpc_binlog,
            session_replicator,
            fpc_replicator,
            shutdown: AtomicBool::new(false),
            started_at: timestamp(),
        })
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Starts the optimizer-slot maintenance services (FPC payload
    /// re-compression and session expiry). Called once by the server
    /// binary; embedded test servers skip it.
    pub fn start_maintenance(&self) -> Result<Vec<optimizer::MaintenanceService>> {
        let pages = Arc::clone(&self.pages);
        let fpc = optimizer::MaintenanceService::start(
            "fpc-optimizer",
            registry::TI_FPC_OPTIMIZER,
            optimizer::OPTIMIZER_INTERVAL_MS,
            move || {
                let upgraded = pages.optimize_pass(optimizer::OPTIMIZER_LEVEL);
                if upgraded > 0 {
                    log::info!("optimizer upgraded {upgraded} page payloads");
                }
            },
        )?;
        let sessions = Arc::clone(&self.sessions);
        let session = optimizer::MaintenanceService::start(
            "session-optimizer",
            registry::TI_SESSION_OPTIMIZER,
            optimizer::OPTIMIZER_INTERVAL_MS,
            move || {
                let expired = sessions.gc(0);
                if expired > 0 {
                    log::info!("expired {expired} stale sessions");
                }
            },
        )?;
        Ok(vec![fpc, session])
    }

    ///////////////////////////////////////////////////////////////////////
    // RESPONSE BUILDERS
    ///////////////////////////////////////////////////////////////////////

    fn marker(&self) -> bool {
        self.config.read().response_integrity_check
    }

    fn ok_response(&self) -> ResponseWriter {
        let mut sb = SharedBuffers::new(Domain::Global);
        let mut header = HeaderChunkBuilder::response(ResponseType::Ok, self.marker());
        header.configure(&mut sb, None);
        header.check();
        ResponseWriter::new(sb)
    }

    fn error_response(&self, message: &str) -> ResponseWriter {
        let mut sb = SharedBuffers::new(Domain::Global);
        let mut header = HeaderChunkBuilder::response(ResponseType::Error, self.marker());
        header.estimate_string(message.as_bytes());
        header.configure(&mut sb, None);
        header.add_string(&mut sb, message.as_bytes());
        header.check();
        ResponseWriter::new(sb)
    }

    fn data_number_response(&self, number: i64) -> ResponseWriter {
        let mut sb = SharedBuffers::new(Domain::Global);
        let mut header = HeaderChunkBuilder::response(ResponseType::Data, self.marker());
        header.estimate_number(number);
        header.configure(&mut sb, None);
        header.add_number(&mut sb, number);
        header.check();
        ResponseWriter::new(sb)
    }

    fn data_payload_response(&self, payload: BorrowedPayload) -> ResponseWriter {
        let mut sb = SharedBuffers::new(Domain::Global);
        let threshold = self.config.read().compression_threshold;
        let mut body = PayloadChunkBuilder::new(Compressor::None, threshold);
        body.add_record_payload(&mut sb, payload);
        let mut header = HeaderChunkBuilder::response(ResponseType::Data, self.marker());
        header.configure(&mut sb, Some(&body));
        header.check();
        ResponseWriter::new(sb)
    }

    fn list_response(&self, items: &[Vec<u8>]) -> ResponseWriter {
        let mut sb = SharedBuffers::new(Domain::Global);
        let cfg = self.config.read();
        let (compressor, threshold) = (cfg.fpc_compressor, cfg.compression_threshold);
        drop(cfg);
        let mut list = PayloadListChunkBuilder::new(
            Domain::Global.memory(),
            items.len() as u32,
            items.len() as u32,
            16,
        );
        for item in items {
            list.add(item);
        }
        let mut body = PayloadChunkBuilder::new(compressor, threshold);
        body.add_list(&mut sb, &list);
        let mut header = HeaderChunkBuilder::response(ResponseType::List, self.marker());
        header.estimate_number(list.count() as i64);
        header.configure(&mut sb, Some(&body));
        header.add_number(&mut sb, list.count() as i64);
        header.check();
        ResponseWriter::new(sb)
    }

    ///////////////////////////////////////////////////////////////////////
    // AUTHENTICATION
    ///////////////////////////////////////////////////////////////////////

    fn authenticate(&self, command: Command, level: AuthLevel, hash: Option<u64>) -> Result<()> {
        let cfg = self.config.read();
        let required = command.required_auth();
        let required_hash = cfg.password_hash_for(required);
        if required_hash == INVALID_HASH_VALUE {
            // no password configured at the required level
            return Ok(());
        }
        // The three passwords are independent, not tiered: the peer must
        // present exactly the level the command requires, and its hash
        // is compared against that level's password only. Anything else
        // (missing hash, wrong level, wrong hash) is rejected alike.
        match hash {
            Some(presented) if level == required && presented == required_hash => Ok(()),
            _ => Err(CacheError::Auth("authentication required".to_string())),
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // FAN-OUT
    ///////////////////////////////////////////////////////////////////////

    /// Hands a write-class frame to the domain's binlog and replication
    /// services by reference.
    fn fan_out(&self, domain: Domain, frame: Arc<SharedBuffers>) {
        let (binlog, replicator) = match domain {
            Domain::Session => (&self.session_binlog, &self.session_replicator),
            _ => (&self.fpc_binlog, &self.fpc_replicator),
        };
        if let Some(binlog) = binlog {
            if let Err(e) = binlog.append(Arc::clone(&frame)) {
                log::error!("binlog fan-out failed: {e}");
            }
        }
        if let Some(replicator) = replicator {
            if let Err(e) = replicator.enqueue(frame) {
                log::error!("replication fan-out failed: {e}");
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // DISPATCH
    ///////////////////////////////////////////////////////////////////////

    /// Executes one received command and builds its response. `trusted`
    /// skips authentication (binlog replay and store restore paths).
    pub fn execute(&self, reader: CommandReader, trusted: bool) -> ResponseWriter {
        let command = match reader.command() {
            Some(command) => command,
            None => return self.error_response("unknown command"),
        };
        crate::store::STORE_COMMANDS_EXECUTED.increment();
        if !trusted {
            let (level, hash) = reader.auth();
            if let Err(error) = self.authenticate(command, level, hash) {
                return self.error_response(&error.to_string());
            }
        }
        match self.run_command(command, reader) {
            Ok(response) => response,
            Err(error) => self.error_response(&error.to_string()),
        }
    }

    fn run_command(&self, command: Command, reader: CommandReader) -> Result<ResponseWriter> {
        match command {
            Command::Ping | Command::Check => Ok(self.ok_response()),

            Command::Info => {
                let mut chunks = reader.header_chunks();
                let mask = if chunks.has_more_chunks() {
                    chunks.next_number()? as u8
                } else {
                    DM_GLOBAL | DM_SESSION | DM_FPC
                };
                Ok(self.list_response(&self.info_lines(mask)))
            }

            Command::Stats => {
                let mut chunks = reader.header_chunks();
                let _mask = chunks.next_number().unwrap_or(7);
                let pattern = if chunks.has_more_chunks() {
                    chunks.next_string()?.to_vec()
                } else {
                    b"*".to_vec()
                };
                Ok(self.list_response(&self.stats_lines(&pattern)))
            }

            Command::Shutdown => {
                log::info!("shutdown requested by peer");
                self.shutdown.store(true, Ordering::Relaxed);
                Ok(self.ok_response())
            }

            Command::LoadConfig => {
                let mut chunks = reader.header_chunks();
                let path = String::from_utf8_lossy(chunks.next_string()?).into_owned();
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    CacheError::Configuration(format!("cannot read '{path}': {e}"))
                })?;
                let applied = self.config.write().apply_config_text(&text)?;
                log::info!("loaded {applied} options from '{path}'");
                Ok(self.ok_response())
            }

            Command::Restore => {
                let mut chunks = reader.header_chunks();
                let path = String::from_utf8_lossy(chunks.next_string()?).into_owned();
                let replayed = self.replay_binlog(&path)?;
                log::info!("replayed {replayed} commands from '{path}'");
                Ok(self.ok_response())
            }

            Command::Store => {
                let mut chunks = reader.header_chunks();
                let mask = chunks.next_number()? as u8;
                let path = String::from_utf8_lossy(chunks.next_string()?).into_owned();
                // user agent and sync-mode arguments only affect
                // scheduling in a clustered setup; the dump itself is
                // synchronous here
                let written = self.dump_store(mask, &path)?;
                log::info!("stored {written} records to '{path}'");
                Ok(self.ok_response())
            }

            Command::Get => {
                let mut chunks = reader.header_chunks();
                let mut list = chunks.next_list()?;
                let names = list.collect_strings()?;
                let cfg = self.config.read();
                let lines: Vec<Vec<u8>> = names
                    .iter()
                    .map(|name| {
                        let name = String::from_utf8_lossy(name).into_owned();
                        let value = cfg
                            .get_option(&name)
                            .unwrap_or_else(|| "(unknown option)".to_string());
                        format!("{name} {value}").into_bytes()
                    })
                    .collect();
                drop(cfg);
                Ok(self.list_response(&lines))
            }

            Command::Set => {
                let mut chunks = reader.header_chunks();
                let line = String::from_utf8_lossy(chunks.next_string()?).into_owned();
                let (name, value) = line
                    .trim()
                    .split_once(char::is_whitespace)
                    .map(|(n, v)| (n.trim(), v.trim()))
                    .unwrap_or((line.trim(), ""));
                self.config.write().apply_option(name, value)?;
                Ok(self.ok_response())
            }

            Command::Log => {
                let mut chunks = reader.header_chunks();
                let message = String::from_utf8_lossy(chunks.next_string()?).into_owned();
                log::info!(target: "peer", "{message}");
                Ok(self.ok_response())
            }

            Command::Rotate => {
                let mut chunks = reader.header_chunks();
                let mask = chunks.next_number().unwrap_or((DM_SESSION | DM_FPC) as i64) as u8;
                if mask & DM_SESSION != 0 {
                    if let Some(binlog) = &self.session_binlog {
                        binlog.rotate()?;
                    }
                }
                if mask & DM_FPC != 0 {
                    if let Some(binlog) = &self.fpc_binlog {
                        binlog.rotate()?;
                    }
                }
                Ok(self.ok_response())
            }

            Command::Read => {
                let (id, agent, request_id) = {
                    let mut chunks = reader.header_chunks();
                    let id = chunks.next_string()?.to_vec();
                    let agent = parse_agent(chunks.next_number()?)?;
                    let request_id = if chunks.has_more_chunks() {
                        chunks.next_number()? as u32
                    } else {
                        0
                    };
                    (id, agent, request_id)
                };
                match self.sessions.read(&id, agent, request_id) {
                    SessionReadOutcome::Found(payload) => Ok(self.data_payload_response(payload)),
                    SessionReadOutcome::Missing => Ok(self.ok_response()),
                }
            }

            Command::Write => {
                let (id, agent, lifetime, request_id) = {
                    let mut chunks = reader.header_chunks();
                    let id = chunks.next_string()?.to_vec();
                    let agent = parse_agent(chunks.next_number()?)?;
                    let lifetime = chunks.next_number()?;
                    let request_id = if chunks.has_more_chunks() {
                        chunks.next_number()? as u32
                    } else {
                        0
                    };
                    (id, agent, lifetime, request_id)
                };
                let info = reader.payload();
                let mut sb = reader.into_shared_buffers();
                let data = sb.take_payload(Domain::Session);
                if let Some(bytes) = &data {
                    // re-attach the same refcounted bytes so binlog and
                    // replication writers stream them without a copy
                    sb.attach_payload(BorrowedPayload::new(
                        bytes.clone(),
                        info.usize,
                        info.compressor,
                        None,
                    ));
                }
                self.sessions.write(
                    &id,
                    data,
                    info.usize,
                    info.compressor,
                    lifetime,
                    agent,
                    request_id,
                );
                self.fan_out(Domain::Session, sb.freeze());
                Ok(self.ok_response())
            }

            Command::Destroy => {
                let id = reader.header_chunks().next_string()?.to_vec();
                self.sessions.destroy(&id);
                self.fan_out(Domain::Session, reader.into_shared_buffers().freeze());
                Ok(self.ok_response())
            }

            Command::Gc => {
                let seconds = reader.header_chunks().next_number()?;
                let removed = self.sessions.gc(seconds.clamp(0, u32::MAX as i64) as u32);
                log::debug!("session gc removed {removed} records");
                self.fan_out(Domain::Session, reader.into_shared_buffers().freeze());
                Ok(self.ok_response())
            }

            Command::Load => {
                let (id, agent) = {
                    let mut chunks = reader.header_chunks();
                    let id = chunks.next_string()?.to_vec();
                    let agent = parse_agent(chunks.next_number()?)?;
                    (id, agent)
                };
                match self.pages.load(&id, agent) {
                    Some(payload) => Ok(self.data_payload_response(payload)),
                    None => Ok(self.ok_response()),
                }
            }

            Command::Test => {
                let id = reader.header_chunks().next_string()?.to_vec();
                match self.pages.test(&id) {
                    Some(mtime) => Ok(self.data_number_response(mtime as i64)),
                    None => Ok(self.ok_response()),
                }
            }

            Command::Save => {
                let (id, agent, lifetime, tags) = {
                    let mut chunks = reader.header_chunks();
                    let id = chunks.next_string()?.to_vec();
                    let agent = parse_agent(chunks.next_number()?)?;
                    let lifetime = chunks.next_number()?;
                    let tags = chunks.next_list()?.collect_strings()?;
                    (id, agent, lifetime, tags)
                };
                let info = reader.payload();
                let mut sb = reader.into_shared_buffers();
                let data = sb.take_payload(Domain::Fpc);
                if let Some(bytes) = &data {
                    sb.attach_payload(BorrowedPayload::new(
                        bytes.clone(),
                        info.usize,
                        info.compressor,
                        None,
                    ));
                }
                self.pages.save(
                    &id,
                    data,
                    info.usize,
                    info.compressor,
                    lifetime,
                    agent,
                    &tags,
                );
                self.fan_out(Domain::Fpc, sb.freeze());
                Ok(self.ok_response())
            }

            Command::Remove => {
                let id = reader.header_chunks().next_string()?.to_vec();
                self.pages.remove(&id);
                self.fan_out(Domain::Fpc, reader.into_shared_buffers().freeze());
                Ok(self.ok_response())
            }

            Command::Clean => {
                let (mode, tags) = {
                    let mut chunks = reader.header_chunks();
                    let mode = chunks.next_number()?;
                    let mode = CleanMode::from_byte(mode.clamp(0, 255) as u8)
                        .ok_or_else(|| CacheError::Protocol("invalid CLEAN mode".to_string()))?;
                    let tags = if chunks.has_more_chunks() {
                        chunks.next_list()?.collect_strings()?
                    } else {
                        Vec::new()
                    };
                    (mode, tags)
                };
                let removed = self.pages.clean(mode, &tags);
                log::debug!("clean removed {removed} pages");
                self.fan_out(Domain::Fpc, reader.into_shared_buffers().freeze());
                Ok(self.ok_response())
            }

            Command::GetIds => Ok(self.list_response(&self.pages.ids())),

            Command::GetTags => Ok(self.list_response(&self.pages.tag_names())),

            Command::GetIdsMatchingTags
            | Command::GetIdsNotMatchingTags
            | Command::GetIdsMatchingAnyTags => {
                let tags = {
                    let mut chunks = reader.header_chunks();
                    if chunks.has_more_chunks() {
                        chunks.next_list()?.collect_strings()?
                    } else {
                        Vec::new()
                    }
                };
                let mode = match command {
                    Command::GetIdsMatchingTags => TagMatch::All,
                    Command::GetIdsNotMatchingTags => TagMatch::NotAny,
                    _ => TagMatch::Any,
                };
                Ok(self.list_response(&self.pages.ids_matching(mode, &tags)))
            }

            Command::GetFillingPercentage => {
                Ok(self.data_number_response(self.pages.filling_percentage() as i64))
            }

            Command::GetMetadatas => {
                let id = reader.header_chunks().next_string()?.to_vec();
                match self.pages.metadata(&id) {
                    Some(metadata) => {
                        let mut lines = Vec::with_capacity(metadata.tags.len() + 2);
                        lines.push(format!("expire {}", metadata.expire).into_bytes());
                        lines.push(format!("mtime {}", metadata.mtime).into_bytes());
                        lines.extend(metadata.tags);
                        Ok(self.list_response(&lines))
                    }
                    None => Ok(self.ok_response()),
                }
            }

            Command::Touch => {
                let (id, extra) = {
                    let mut chunks = reader.header_chunks();
                    let id = chunks.next_string()?.to_vec();
                    let extra = chunks.next_number()?;
                    (id, extra)
                };
                self.pages.touch(&id, extra);
                self.fan_out(Domain::Fpc, reader.into_shared_buffers().freeze());
                Ok(self.ok_response())
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // ADMIN SUPPORT
    ///////////////////////////////////////////////////////////////////////

    fn info_lines(&self, mask: u8) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        lines.push(format!("version {}", crate::VERSION).into_bytes());
        lines.push(format!("uptime {}", timestamp().saturating_sub(self.started_at)).into_bytes());
        if mask & DM_GLOBAL != 0 {
            let memory = Domain::Global.memory();
            lines.push(
                format!(
                    "global memory {} of {}",
                    memory.get_used_size(),
                    memory.get_quota()
                )
                .into_bytes(),
            );
        }
        if mask & DM_SESSION != 0 {
            let memory = Domain::Session.memory();
            lines.push(format!("session records {}", self.sessions.len()).into_bytes());
            lines.push(
                format!(
                    "session memory {} of {}",
                    memory.get_used_size(),
                    memory.get_quota()
                )
                .into_bytes(),
            );
        }
        if mask & DM_FPC != 0 {
            let memory = Domain::Fpc.memory();
            lines.push(format!("fpc records {}", self.pages.len()).into_bytes());
            lines.push(format!("fpc tags {}", self.pages.tag_names().len()).into_bytes());
            lines.push(
                format!(
                    "fpc memory {} of {}",
                    memory.get_used_size(),
                    memory.get_quota()
                )
                .into_bytes(),
            );
        }
        lines
    }

    fn stats_lines(&self, pattern: &[u8]) -> Vec<Vec<u8>> {
        let pattern = String::from_utf8_lossy(pattern);
        let matches = |name: &str| pattern == "*" || name.contains(pattern.trim_matches('*'));
        crate::store::all_counters()
            .iter()
            .filter(|counter| matches(counter.name))
            .map(|counter| format!("{} {}", counter.name, counter.get()).into_bytes())
            .collect()
    }

    /// Replays a binlog (or database dump) file by re-dispatching every
    /// framed command.
    pub fn replay_binlog(&self, path: &str) -> Result<u32> {
        let file = std::fs::File::open(path)
            .map_err(|e| CacheError::Server(format!("cannot open '{path}': {e}")))?;
        let mut device = StreamDevice::new(file);
        let mut replayed = 0;
        'frames: loop {
            let mut reader = CommandReader::new(Domain::Global);
            loop {
                match reader.read(&mut device) {
                    IoOutcome::Done => break,
                    IoOutcome::Retry => continue,
                    IoOutcome::Eof => break 'frames,
                    IoOutcome::Error => {
                        return Err(CacheError::Server(format!(
                            "corrupt frame in '{path}' after {replayed} commands"
                        )));
                    }
                }
            }
            let _ = self.execute(reader, true);
            replayed += 1;
        }
        Ok(replayed)
    }

    /// Dumps matching records as framed write commands; the output file
    /// is a binlog and is loaded back with `RESTORE`.
    pub fn dump_store(&self, mask: u8, path: &str) -> Result<u32> {
        let file = std::fs::File::create(path)
            .map_err(|e| CacheError::Server(format!("cannot create '{path}': {e}")))?;
        let marker = self.config.read().file_integrity_check;
        let mut device = StreamDevice::new(file);
        let mut written = 0;
        let now = timestamp();

        if mask & DM_SESSION != 0 {
            for record in self.sessions.snapshot() {
                let (payload, lifetime, agent) = {
                    let guard = record.lock_body();
                    let lifetime = remaining_lifetime(guard.exp_time, now);
                    (
                        clone_stored_payload(&guard.payload),
                        lifetime,
                        guard.user_agent,
                    )
                };
                let Some((data, usize, compressor)) = payload else {
                    continue;
                };
                let mut sb = SharedBuffers::new(Domain::Global);
                let mut body = PayloadChunkBuilder::new(compressor, u32::MAX);
                body.add_record_payload(
                    &mut sb,
                    BorrowedPayload::new(data, usize, compressor, None),
                );
                let mut header =
                    HeaderChunkBuilder::command(Command::Write, AuthLevel::None, 0, marker);
                header.estimate_string(record.name());
                header.estimate_number(agent as i64);
                header.estimate_number(lifetime);
                header.configure(&mut sb, Some(&body));
                header.add_string(&mut sb, record.name());
                header.add_number(&mut sb, agent as i64);
                header.add_number(&mut sb, lifetime);
                header.check();
                write_frame(&mut device, sb, path)?;
                written += 1;
            }
        }

        if mask & DM_FPC != 0 {
            for record in self.pages.snapshot() {
                let tags = self.pages.tags_of(&record);
                let (payload, lifetime, agent) = {
                    let guard = record.lock_body();
                    let lifetime = remaining_lifetime(guard.exp_time, now);
                    (
                        clone_stored_payload(&guard.payload),
                        lifetime,
                        guard.user_agent,
                    )
                };
                let Some((data, usize, compressor)) = payload else {
                    continue;
                };
                let mut sb = SharedBuffers::new(Domain::Global);
                let mut body = PayloadChunkBuilder::new(compressor, u32::MAX);
                body.add_record_payload(
                    &mut sb,
                    BorrowedPayload::new(data, usize, compressor, None),
                );
                let mut tag_list =
                    crate::protocol::builders::HeaderListChunkBuilder::new(Domain::Global.memory());
                for tag in &tags {
                    tag_list.estimate(tag);
                }
                tag_list.configure();
                for tag in &tags {
                    tag_list.add(tag);
                }
                tag_list.check();
                let mut header =
                    HeaderChunkBuilder::command(Command::Save, AuthLevel::None, 0, marker);
                header.estimate_string(record.name());
                header.estimate_number(agent as i64);
                header.estimate_number(lifetime);
                header.estimate_list(&tag_list);
                header.configure(&mut sb, Some(&body));
                header.add_string(&mut sb, record.name());
                header.add_number(&mut sb, agent as i64);
                header.add_number(&mut sb, lifetime);
                header.add_list(&mut sb, &tag_list);
                header.check();
                write_frame(&mut device, sb, path)?;
                written += 1;
            }
        }
        Ok(written)
    }

    ///////////////////////////////////////////////////////////////////////
    // CONNECTION HANDLING
    ///////////////////////////////////////////////////////////////////////

    /// Serves one connection until the peer disconnects or the server
    /// shuts down.
    pub fn serve_connection(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let mut device = StreamDevice::new(stream);
        loop {
            if self.shutdown_requested() {
                return;
            }
            let mut reader = CommandReader::new(Domain::Global);
            loop {
                match reader.read(&mut device) {
                    IoOutcome::Done => break,
                    IoOutcome::Retry => continue,
                    IoOutcome::Eof => return,
                    IoOutcome::Error => {
                        log::warn!("dropping connection after a malformed frame");
                        return;
                    }
                }
            }
            let mut response = self.execute(reader, false);
            loop {
                match response.write(&mut device) {
                    IoOutcome::Done => break,
                    IoOutcome::Retry => continue,
                    IoOutcome::Eof | IoOutcome::Error => return,
                }
            }
        }
    }

    /// Accept loop; spawns one worker thread per connection, bounded by
    /// the worker slot pool.
    pub fn run(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        listener
            .set_nonblocking(true)
            .map_err(|e| CacheError::Server(format!("listener setup failed: {e}")))?;
        log::info!("listening on {}", listener.local_addr().map_err(CacheError::Io)?);
        loop {
            if self.shutdown_requested() {
                registry::request_quit_all();
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nonblocking(false);
                    let server = Arc::clone(self);
                    let spawned = std::thread::Builder::new()
                        .name(format!("worker-{peer}"))
                        .spawn(move || match registry::register_worker_thread() {
                            Some(_registration) => server.serve_connection(stream),
                            None => {
                                log::warn!("connection from {peer} refused: worker pool exhausted");
                            }
                        });
                    if let Err(e) = spawned {
                        log::error!("cannot spawn worker for {peer}: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    log::error!("accept failed: {e}");
                    std::thread::sleep(Duration::from_millis(50));
                }
            }
        }
    }
}

fn parse_agent(value: i64) -> Result<UserAgent> {
    UserAgent::from_byte(value.clamp(0, 255) as u8)
        .ok_or_else(|| CacheError::Protocol(format!("invalid user agent {value}")))
}

fn remaining_lifetime(exp_time: u32, now: u32) -> i64 {
    if exp_time == NEVER_EXPIRES {
        -1
    } else {
        (exp_time.saturating_sub(now)).max(1) as i64
    }
}

fn clone_stored_payload(
    payload: &crate::store::StoredPayload,
) -> Option<(Bytes, u32, Compressor)> {
    use crate::store::StoredPayload;
    match payload {
        StoredPayload::None => None,
        StoredPayload::Zero => Some((Bytes::new(), 0, Compressor::None)),
        StoredPayload::Data {
            data,
            usize,
            compressor,
        } => Some((data.clone(), *usize, *compressor)),
    }
}

fn write_frame(
    device: &mut StreamDevice<std::fs::File>,
    sb: SharedBuffers,
    path: &str,
) -> Result<()> {
    let mut writer = crate::protocol::io::CommandWriter::new(sb.freeze());
    loop {
        match writer.write(device) {
            IoOutcome::Done => return Ok(()),
            IoOutcome::Retry => continue,
            IoOutcome::Eof | IoOutcome::Error => {
                return Err(CacheError::Server(format!(
                    "writing store dump '{path}' failed"
                )));
            }
        }
    }
}

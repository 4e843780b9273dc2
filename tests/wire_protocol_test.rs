// End-to-end conformance tests: a live server on a loopback socket,
// driven through the console client.

use cybercache::concurrent::registry;
use cybercache::config::{self, ServerConfig};
use cybercache::console::{CacheClient, ClientOptions, ServerResponse};
use cybercache::hashing::password_hasher;
use cybercache::memory::Domain;
use cybercache::protocol::buffers::SharedBuffers;
use cybercache::protocol::builders::HeaderChunkBuilder;
use cybercache::protocol::io::{
    CommandReader, CommandWriter, IoOutcome, MemoryDevice, ResponseReader,
};
use cybercache::protocol::{AuthLevel, CleanMode, Command, ResponseType, UserAgent, DM_ALL};
use cybercache::server::CacheServer;
use once_cell::sync::Lazy;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct TestServer {
    address: String,
    #[allow(dead_code)]
    server: Arc<CacheServer>,
}

fn start_server(config: ServerConfig, slot: usize) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let server = Arc::new(CacheServer::new(config::shared(config)).unwrap());
    let runner = Arc::clone(&server);
    std::thread::spawn(move || {
        let _registration = registry::register_thread(slot);
        let _ = runner.run(listener);
    });
    TestServer { address, server }
}

static SHARED: Lazy<TestServer> =
    Lazy::new(|| start_server(ServerConfig::default(), registry::TI_LISTENER));

fn client() -> CacheClient {
    CacheClient::connect(&SHARED.address, ClientOptions::default()).unwrap()
}

#[test]
fn test_ping_and_check() {
    let mut client = client();
    assert_eq!(client.ping().unwrap(), ServerResponse::Ok);
    assert_eq!(client.check().unwrap(), ServerResponse::Ok);
}

#[test]
fn test_ping_with_auth() {
    // dedicated server so the password does not disturb other tests
    let mut config = ServerConfig::default();
    config.apply_option("user_password", "secret").unwrap();
    config.apply_option("admin_password", "topsecret").unwrap();
    let server = start_server(config, registry::TI_SIGNAL_HANDLER);

    // wrong password is rejected
    let options = ClientOptions {
        user_password: Some("wrong".to_string()),
        ..ClientOptions::default()
    };
    let mut unauthorized = CacheClient::connect(&server.address, options).unwrap();
    assert!(matches!(
        unauthorized.ping().unwrap(),
        ServerResponse::Error(_)
    ));

    // no password at all is rejected too
    let mut anonymous =
        CacheClient::connect(&server.address, ClientOptions::default()).unwrap();
    assert!(matches!(anonymous.ping().unwrap(), ServerResponse::Error(_)));

    // the right password gets OK
    let options = ClientOptions {
        user_password: Some("secret".to_string()),
        admin_password: Some("topsecret".to_string()),
        ..ClientOptions::default()
    };
    let mut authorized = CacheClient::connect(&server.address, options).unwrap();
    assert_eq!(authorized.ping().unwrap(), ServerResponse::Ok);
    assert_eq!(authorized.info(DM_ALL).map(kind), Ok("list"));
}

/// Hand-builds a `LOG` frame with arbitrary auth bits and runs it
/// through the full wire FSMs against an in-process server, the way a
/// peer crafting its own frames would.
fn execute_raw(
    server: &CacheServer,
    level: AuthLevel,
    hash: u64,
    message: &str,
) -> ResponseType {
    let mut sb = SharedBuffers::new(Domain::Global);
    let mut header = HeaderChunkBuilder::command(Command::Log, level, hash, true);
    header.estimate_string(message.as_bytes());
    header.configure(&mut sb, None);
    header.add_string(&mut sb, message.as_bytes());
    header.check();

    let mut writer = CommandWriter::new(sb.freeze());
    let mut wire = MemoryDevice::new(Vec::new());
    assert_eq!(writer.write(&mut wire), IoOutcome::Done);

    let mut reader = CommandReader::new(Domain::Global);
    let mut input = MemoryDevice::new(wire.output.clone());
    assert_eq!(reader.read(&mut input), IoOutcome::Done);

    let mut response = server.execute(reader, false);
    let mut out = MemoryDevice::new(Vec::new());
    assert_eq!(response.write(&mut out), IoOutcome::Done);
    let mut response_reader = ResponseReader::new(Domain::Global);
    let mut response_input = MemoryDevice::new(out.output.clone());
    assert_eq!(response_reader.read(&mut response_input), IoOutcome::Done);
    response_reader.response_type()
}

#[test]
fn test_bulk_credentials_cannot_run_admin_commands() {
    // the three passwords are independent: a frame whose descriptor
    // claims BULK auth must not clear an admin-gated command, even when
    // it presents the correct bulk hash
    let mut config = ServerConfig::default();
    config.apply_option("admin_password", "admin-secret").unwrap();
    config.apply_option("bulk_password", "bulk-secret").unwrap();
    let server = CacheServer::new(config::shared(config)).unwrap();
    let admin_hash = password_hasher().hash(b"admin-secret");
    let bulk_hash = password_hasher().hash(b"bulk-secret");

    // exact level with the right hash is accepted
    assert_eq!(
        execute_raw(&server, AuthLevel::Admin, admin_hash, "hello"),
        ResponseType::Ok
    );
    // bulk level with the bulk hash is rejected for admin commands
    assert_eq!(
        execute_raw(&server, AuthLevel::Bulk, bulk_hash, "escalation"),
        ResponseType::Error
    );
    // the bulk hash does not pass at the admin level either
    assert_eq!(
        execute_raw(&server, AuthLevel::Admin, bulk_hash, "bad hash"),
        ResponseType::Error
    );
    // and a missing hash is rejected outright
    assert_eq!(
        execute_raw(&server, AuthLevel::None, 0, "anonymous"),
        ResponseType::Error
    );
}

fn kind(response: ServerResponse) -> &'static str {
    match response {
        ServerResponse::Ok => "ok",
        ServerResponse::Data(_) => "data",
        ServerResponse::Number(_) => "number",
        ServerResponse::List(_) => "list",
        ServerResponse::Error(_) => "error",
    }
}

#[test]
fn test_write_then_read_session() {
    let mut client = client();
    assert_eq!(
        client
            .write(b"sid-1", b"hello", 60, UserAgent::User, 0)
            .unwrap(),
        ServerResponse::Ok
    );
    assert_eq!(
        client.read(b"sid-1", UserAgent::User, 0).unwrap(),
        ServerResponse::Data(b"hello".to_vec())
    );
    // absent session reads back as plain OK
    assert_eq!(
        client.read(b"sid-absent", UserAgent::User, 0).unwrap(),
        ServerResponse::Ok
    );
}

#[test]
fn test_large_payload_round_trip() {
    // 64 KiB of 'a' crosses the compression threshold; the payload goes
    // over the wire compressed and must come back intact
    let mut client = client();
    let page = vec![b'a'; 64 * 1024];
    assert_eq!(
        client
            .save(b"big-page", &page, 3600, UserAgent::User, &[])
            .unwrap(),
        ServerResponse::Ok
    );
    assert_eq!(
        client.load(b"big-page", UserAgent::User).unwrap(),
        ServerResponse::Data(page)
    );
    client.remove(b"big-page").unwrap();
}

#[test]
fn test_save_with_tags_and_matching() {
    let mut client = client();
    let tags = vec![b"t1".to_vec(), b"t2".to_vec()];
    assert_eq!(
        client
            .save(b"p1", &vec![b'a'; 65536], 3600, UserAgent::User, &tags)
            .unwrap(),
        ServerResponse::Ok
    );
    match client.get_ids_matching_tags(&[b"t2".to_vec()]).unwrap() {
        ServerResponse::List(ids) => {
            assert!(ids.contains(&b"p1".to_vec()));
        }
        other => panic!("expected a list, got {other:?}"),
    }
    match client.get_metadatas(b"p1").unwrap() {
        ServerResponse::List(lines) => {
            assert!(lines.iter().any(|l| l.starts_with(b"expire ")));
            assert!(lines.contains(&b"t1".to_vec()));
            assert!(lines.contains(&b"t2".to_vec()));
        }
        other => panic!("expected metadata list, got {other:?}"),
    }
    client.remove(b"p1").unwrap();
}

#[test]
fn test_clean_matchnot_with_empty_tags_removes_nothing() {
    let mut client = client();
    let tags = vec![b"keepme".to_vec()];
    client
        .save(b"pk", b"payload", 3600, UserAgent::User, &tags)
        .unwrap();
    assert_eq!(
        client.clean(CleanMode::NotMatchingAnyTag, &[]).unwrap(),
        ServerResponse::Ok
    );
    // the record is still there
    assert!(matches!(
        client.load(b"pk", UserAgent::User).unwrap(),
        ServerResponse::Data(_)
    ));
    client.remove(b"pk").unwrap();
}

#[test]
fn test_session_lock_break() {
    let mut admin = client();
    admin.set("session_lock_wait_time 150").unwrap();

    let mut first = client();
    first
        .write(b"locked-session", b"state", 60, UserAgent::User, 0)
        .unwrap();
    // request 1 takes the session lock and keeps it (no closing WRITE)
    assert!(matches!(
        first.read(b"locked-session", UserAgent::User, 1).unwrap(),
        ServerResponse::Data(_)
    ));

    let broken_before = broken_locks(&mut admin);

    // request 2 must wait out the 150 ms and then break the lock
    let mut second = client();
    let start = Instant::now();
    assert!(matches!(
        second.read(b"locked-session", UserAgent::User, 2).unwrap(),
        ServerResponse::Data(_)
    ));
    assert!(start.elapsed() >= Duration::from_millis(140));

    assert_eq!(broken_locks(&mut admin), broken_before + 1);
    admin.set("session_lock_wait_time 8000").unwrap();
    first.destroy(b"locked-session").unwrap();
}

fn broken_locks(client: &mut CacheClient) -> u64 {
    match client.stats(DM_ALL, "session_broken_locks").unwrap() {
        ServerResponse::List(lines) => {
            let line = String::from_utf8(lines[0].clone()).unwrap();
            line.rsplit(' ').next().unwrap().parse().unwrap()
        }
        other => panic!("expected stats list, got {other:?}"),
    }
}

#[test]
fn test_option_get_set_round_trip() {
    let mut client = client();
    client.set("compression_threshold 4096").unwrap();
    match client.get(&[b"compression_threshold".to_vec()]).unwrap() {
        ServerResponse::List(lines) => {
            assert_eq!(lines[0], b"compression_threshold 4096".to_vec());
        }
        other => panic!("expected list, got {other:?}"),
    }
    client.set("compression_threshold 2048").unwrap();
    // unknown option is an error
    assert!(matches!(
        client.set("bogus_option 1").unwrap(),
        ServerResponse::Error(_)
    ));
}

#[test]
fn test_store_dump_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("cache.db");
    let dump = dump.to_str().unwrap();

    let mut client = client();
    client
        .write(b"dump-sid", b"session state", 600, UserAgent::User, 0)
        .unwrap();
    client
        .save(
            b"dump-page",
            b"page body",
            3600,
            UserAgent::Warmer,
            &[b"dump-tag".to_vec()],
        )
        .unwrap();

    assert_eq!(client.store(DM_ALL, dump).unwrap(), ServerResponse::Ok);

    // wipe and reload
    client.destroy(b"dump-sid").unwrap();
    client.remove(b"dump-page").unwrap();
    assert_eq!(
        client.read(b"dump-sid", UserAgent::User, 0).unwrap(),
        ServerResponse::Ok
    );
    assert_eq!(client.restore(dump).unwrap(), ServerResponse::Ok);

    assert_eq!(
        client.read(b"dump-sid", UserAgent::User, 0).unwrap(),
        ServerResponse::Data(b"session state".to_vec())
    );
    assert_eq!(
        client.load(b"dump-page", UserAgent::User).unwrap(),
        ServerResponse::Data(b"page body".to_vec())
    );
    match client.get_metadatas(b"dump-page").unwrap() {
        ServerResponse::List(lines) => assert!(lines.contains(&b"dump-tag".to_vec())),
        other => panic!("expected metadata list, got {other:?}"),
    }
    client.destroy(b"dump-sid").unwrap();
    client.remove(b"dump-page").unwrap();
}

#[test]
fn test_filling_percentage_and_touch() {
    let mut client = client();
    match client.get_filling_percentage().unwrap() {
        ServerResponse::Number(pct) => assert!((0..=100).contains(&pct)),
        other => panic!("expected a number, got {other:?}"),
    }
    client
        .save(b"touch-page", b"x", 60, UserAgent::User, &[])
        .unwrap();
    assert_eq!(client.touch(b"touch-page", 600).unwrap(), ServerResponse::Ok);
    match client.test(b"touch-page", UserAgent::User).unwrap() {
        ServerResponse::Number(mtime) => assert!(mtime > 0),
        other => panic!("expected mtime, got {other:?}"),
    }
    client.remove(b"touch-page").unwrap();
}

// # CyberCache Console
//
// Administrative console speaking the server's binary wire protocol.
// Runs a single command with `--command`, or an interactive loop reading
// verbs from stdin. Exit code is 0 on success (including interactive
// exit) and 1 when a batch command fails or `--exit` is set and any
// error occurred.

use clap::Parser;
use cybercache::console::{CacheClient, ClientOptions, ServerResponse};
use cybercache::protocol::{CleanMode, UserAgent, DM_ALL};
use cybercache::{CacheError, Result, VERSION};
use std::io::{BufRead, Write};

#[derive(Parser)]
#[command(name = "cybercache", version = VERSION, about = "CyberCache console")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8120")]
    server: String,

    /// User-level password
    #[arg(short = 'u', long)]
    user_password: Option<String>,

    /// Admin-level password
    #[arg(short = 'a', long)]
    admin_password: Option<String>,

    /// Execute a single command and exit
    #[arg(short, long)]
    command: Option<String>,

    /// Exit with status 1 as soon as any command fails
    #[arg(short, long)]
    exit: bool,
}

fn main() {
    let args = Args::parse();
    let options = ClientOptions {
        user_password: args.user_password.clone(),
        admin_password: args.admin_password.clone(),
        ..ClientOptions::default()
    };

    let mut client = match CacheClient::connect(&args.server, options) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    if let Some(command) = &args.command {
        let failed = !run_line(&mut client, command);
        std::process::exit(if failed { 1 } else { 0 });
    }

    // interactive loop
    let stdin = std::io::stdin();
    let mut had_errors = false;
    loop {
        print!("cybercache> ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        if !run_line(&mut client, line) {
            had_errors = true;
            if args.exit {
                std::process::exit(1);
            }
        }
    }
    std::process::exit(if had_errors && args.exit { 1 } else { 0 });
}

/// Executes one console line; returns `false` on any error.
fn run_line(client: &mut CacheClient, line: &str) -> bool {
    match dispatch(client, line) {
        Ok(response) => {
            print_response(&response);
            !matches!(response, ServerResponse::Error(_))
        }
        Err(e) => {
            eprintln!("error: {e}");
            false
        }
    }
}

fn dispatch(client: &mut CacheClient, line: &str) -> Result<ServerResponse> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or("").to_ascii_lowercase();
    let rest: Vec<&str> = words.collect();
    let arg = |i: usize| -> Result<&str> {
        rest.get(i)
            .copied()
            .ok_or_else(|| CacheError::InvalidArgument(format!("'{verb}' needs more arguments")))
    };
    let tags_from = |start: usize| -> Vec<Vec<u8>> {
        rest.iter()
            .skip(start)
            .map(|t| t.as_bytes().to_vec())
            .collect()
    };

    match verb.as_str() {
        "ping" => client.ping(),
        "check" => client.check(),
        "info" => client.info(DM_ALL),
        "stats" => client.stats(DM_ALL, rest.first().copied().unwrap_or("*")),
        "shutdown" => client.shutdown(),
        "loadconfig" => client.load_config(arg(0)?),
        "restore" => client.restore(arg(0)?),
        "store" => client.store(DM_ALL, arg(0)?),
        "get" => client.get(&tags_from(0)),
        "set" => client.set(&rest.join(" ")),
        "log" => client.log(&rest.join(" ")),
        "rotate" => client.rotate(DM_ALL),
        "read" => client.read(arg(0)?.as_bytes(), UserAgent::User, 0),
        "write" => client.write(arg(0)?.as_bytes(), arg(1)?.as_bytes(), 0, UserAgent::User, 0),
        "destroy" => client.destroy(arg(0)?.as_bytes()),
        "gc" => client.gc(arg(0)?.parse().unwrap_or(0)),
        "load" => client.load(arg(0)?.as_bytes(), UserAgent::User),
        "test" => client.test(arg(0)?.as_bytes(), UserAgent::User),
        "save" => client.save(
            arg(0)?.as_bytes(),
            arg(1)?.as_bytes(),
            0,
            UserAgent::User,
            &tags_from(2),
        ),
        "remove" => client.remove(arg(0)?.as_bytes()),
        "clean" => {
            let mode = match arg(0)? {
                "all" => CleanMode::All,
                "old" => CleanMode::Old,
                "matchall" => CleanMode::MatchingAllTags,
                "matchnot" => CleanMode::NotMatchingAnyTag,
                "matchany" => CleanMode::MatchingAnyTag,
                other => {
                    return Err(CacheError::InvalidArgument(format!(
                        "unknown clean mode '{other}'"
                    )));
                }
            };
            client.clean(mode, &tags_from(1))
        }
        "getids" => client.get_ids(),
        "gettags" => client.get_tags(),
        "getidsmatchingtags" => client.get_ids_matching_tags(&tags_from(0)),
        "getidsnotmatchingtags" => client.get_ids_not_matching_tags(&tags_from(0)),
        "getidsmatchinganytags" => client.get_ids_matching_any_tags(&tags_from(0)),
        "getfillingpercentage" => client.get_filling_percentage(),
        "getmetadatas" => client.get_metadatas(arg(0)?.as_bytes()),
        "touch" => client.touch(arg(0)?.as_bytes(), arg(1)?.parse().unwrap_or(0)),
        other => Err(CacheError::InvalidArgument(format!(
            "unknown command '{other}'"
        ))),
    }
}

fn print_response(response: &ServerResponse) {
    match response {
        ServerResponse::Ok => println!("OK"),
        ServerResponse::Number(number) => println!("{number}"),
        ServerResponse::Data(data) => match std::str::from_utf8(data) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("({} bytes of binary data)", data.len()),
        },
        ServerResponse::List(items) => {
            println!("{} entries:", items.len());
            for item in items {
                println!("  {}", String::from_utf8_lossy(item));
            }
        }
        ServerResponse::Error(message) => println!("ERROR: {message}"),
    }
}

//! CLI entry point: argument parsing, logger construction, config loading and key
//! tooling, delegating the event loop itself to `kcptun_core::Server`.

use clap::{App, Arg};
use kcptun_core::config;
use kcptun_core::logging::{self, error, info, Verbosity};
use kcptun_core::{crypto, Role, Server};
use std::io::{self, BufRead, Write};
use std::process::exit;

fn main() {
    let matches = App::new("kcptun")
        .version("0.1.0")
        .about("Reliable, obfuscatable, AEAD-sealed tunnel over UDP via KCP.")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Path to the JSON configuration file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("server")
                .short("s")
                .long("server")
                .help("Run in server mode"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .help("Increase logging verbosity (-v debug, -vv trace)"),
        )
        .arg(
            Arg::with_name("very_verbose")
                .short("V")
                .help("Shortcut for maximum verbosity (trace)"),
        )
        .arg(
            Arg::with_name("genpsk")
                .long("genpsk")
                .value_name("METHOD")
                .takes_value(true)
                .help("Print a freshly generated base64 PSK for METHOD and exit"),
        )
        .arg(
            Arg::with_name("sign")
                .long("sign")
                .value_name("METHOD")
                .takes_value(true)
                .help("Derive and print the key implied by a password read from stdin"),
        )
        .get_matches();

    if let Some(method) = matches.value_of("genpsk") {
        exit(genpsk(method));
    }
    if let Some(method) = matches.value_of("sign") {
        exit(sign(method));
    }

    let verbosity = if matches.is_present("very_verbose") {
        Verbosity::Trace
    } else {
        Verbosity::from_flag_count(matches.occurrences_of("verbose"))
    };
    let log = logging::root_logger(verbosity);

    let config_path = match matches.value_of("config") {
        Some(p) => p,
        None => {
            error!(log, "missing required -c <config.json>");
            exit(1);
        }
    };

    let cfg = match config::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(log, "configuration error"; "error" => e.to_string());
            exit(1);
        }
    };
    let effective_verbosity = if matches.occurrences_of("verbose") > 0 || matches.is_present("very_verbose") {
        verbosity
    } else {
        Verbosity::from_config_str(&cfg.loglevel)
    };
    let log = logging::root_logger(effective_verbosity);

    let role = if matches.is_present("server") {
        Role::Server
    } else {
        Role::Client
    };

    let mut server = match Server::bind(role, cfg, log.clone()) {
        Ok(s) => s,
        Err(e) => {
            error!(log, "failed to bind"; "error" => e.to_string());
            exit(1);
        }
    };

    info!(log, "kcptun started"; "role" => format!("{:?}", role));
    loop {
        if let Err(e) = server.tick() {
            error!(log, "fatal event loop error"; "error" => e.to_string());
            exit(1);
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
}

fn genpsk(method: &str) -> i32 {
    if !is_supported_method(method) {
        eprintln!("unsupported method: {}", method);
        return 1;
    }
    let key = crypto::generate_key();
    println!("{}", crypto::encode_psk(&key));
    0
}

fn sign(method: &str) -> i32 {
    if !is_supported_method(method) {
        eprintln!("unsupported method: {}", method);
        return 1;
    }
    let stdin = io::stdin();
    let mut line = String::new();
    if stdin.lock().read_line(&mut line).is_err() {
        eprintln!("failed to read password from stdin");
        return 1;
    }
    let password = line.trim_end_matches(['\n', '\r'].as_ref());
    match crypto::derive_key(password) {
        Ok(key) => {
            println!("{}", crypto::encode_psk(&key));
            io::stdout().flush().ok();
            0
        }
        Err(e) => {
            eprintln!("key derivation failed: {}", e);
            1
        }
    }
}

fn is_supported_method(method: &str) -> bool {
    method == "chacha20-poly1305-ietf"
}

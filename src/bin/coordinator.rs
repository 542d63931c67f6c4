//!
//! coordinator (bin)
//! Coordinator process. Binds the datagram port, replays the durable log
//! to quiescence, then reads submissions from stdin, one per line:
//!
//!     <file_name> <content_path> [<address:source>...]
//!
//! where `content_path` is a local file holding the artifact bytes and
//! each source tuple names a participant address and one of its files.
//!
#[macro_use]
extern crate log;
extern crate collage_2pc;
extern crate ctrlc;

use std::fs;
use std::io;
use std::io::prelude::*;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use collage_2pc::coordinator::Coordinator;
use collage_2pc::tpcoptions::TPCOptions;
use collage_2pc::transport::UdpTransport;

fn main() {
    let opts = TPCOptions::coordinator();
    opts.init_logging();

    let transport = match UdpTransport::bind(opts.port) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("cannot bind port {}: {}", opts.port, e);
            process::exit(1);
        }
    };

    ctrlc::set_handler(move || {
        info!("coordinator shutting down");
        process::exit(0);
    })
    .expect("error setting Ctrl-C handler");

    let coordinator = Coordinator::new(
        transport,
        PathBuf::from(&opts.work_dir),
        Duration::from_millis(opts.vote_window_ms),
        Duration::from_millis(opts.ack_window_ms),
    );
    coordinator.spawn_dispatcher();
    coordinator.recover();
    info!("coordinator listening on port {}", opts.port);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 2 {
            error!("usage: <file_name> <content_path> [<address:source>...]");
            continue;
        }
        let content = match fs::read(fields[1]) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("cannot read {}: {}", fields[1], e);
                continue;
            }
        };
        let sources: Vec<String> = fields[2..].iter().map(|s| s.to_string()).collect();
        match coordinator.start_commit(fields[0], content, &sources) {
            Ok(_) => info!("submitted {}", fields[0]),
            Err(e) => error!("refused {}: {}", fields[0], e),
        }
    }
}

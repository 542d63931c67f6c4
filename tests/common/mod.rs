//!
//! Shared scaffolding for the end-to-end tests: participants on worker
//! threads, a coordinator with shortened windows, and an in-memory lossy
//! network, all inside per-test temporary directories.
//!
#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use collage_2pc::coordinator::Coordinator;
use collage_2pc::participant::Participant;
use collage_2pc::sim::SimHub;
use tempfile::TempDir;

pub const COORD: &'static str = "coordinator";

pub const VOTE_WINDOW: Duration = Duration::from_millis(600);
pub const ACK_WINDOW: Duration = Duration::from_millis(250);

/// One participant's place in the world: its address and its directory.
pub struct Node {
    pub addr: String,
    pub dir: TempDir,
}

impl Node {
    /// (id, directory) pair in the shape the checker wants.
    pub fn entry(&self) -> (String, PathBuf) {
        (self.addr.clone(), self.dir.path().to_path_buf())
    }
}

pub fn seed_files(dir: &Path, names: &[&str]) {
    for name in names {
        fs::write(dir.join(name), format!("pixels of {}", name)).unwrap();
    }
}

///
/// boot_participant()
/// Recovers a participant from whatever its directory holds and serves
/// the protocol on a worker thread. Used both for fresh starts and for
/// restarts after a simulated crash.
///
pub fn boot_participant(hub: &SimHub, addr: &str, dir: &Path, approve: bool) {
    let endpoint = hub.endpoint(addr);
    let mut p = Participant::new(
        addr,
        dir.to_path_buf(),
        Arc::new(endpoint),
        Box::new(move |_content: &[u8], _sources: &[String]| approve),
    );
    p.recover();
    thread::spawn(move || p.protocol());
}

///
/// start_participant()
/// Fresh participant with the given files in a new temporary directory.
///
pub fn start_participant(hub: &SimHub, addr: &str, files: &[&str], approve: bool) -> Node {
    let dir = TempDir::new().unwrap();
    seed_files(dir.path(), files);
    boot_participant(hub, addr, dir.path(), approve);
    Node {
        addr: addr.to_string(),
        dir: dir,
    }
}

///
/// boot_coordinator()
/// Coordinator over the hub with shortened windows: dispatcher running,
/// recovery driven to quiescence. Submissions may follow immediately.
///
pub fn boot_coordinator(hub: &SimHub, dir: &Path) -> Coordinator {
    let endpoint = hub.endpoint(COORD);
    let coordinator = Coordinator::new(Arc::new(endpoint), dir.to_path_buf(), VOTE_WINDOW, ACK_WINDOW);
    coordinator.spawn_dispatcher();
    coordinator.recover();
    coordinator
}

pub fn tuples(src: &[&str]) -> Vec<String> {
    src.iter().map(|s| s.to_string()).collect()
}

///
/// await_quiescent()
/// Polls until no transaction is live. Panics after ten seconds; the
/// windows in use here are far shorter than that.
///
pub fn await_quiescent(coordinator: &Coordinator) {
    wait_until("coordinator quiescence", || coordinator.in_flight() == 0);
}

///
/// wait_until()
/// Polls a condition that a worker thread will make true shortly.
///
pub fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {}", what);
}

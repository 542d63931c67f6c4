//!
//! coordinator.rs
//! Coordinator side of the collage 2PC: the shared context handed to every
//! transaction worker, the submission entry point, the dispatcher loop that
//! routes inbound datagrams to their transaction, and startup recovery.
//!
extern crate atomic_counter;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use self::atomic_counter::AtomicCounter;
use self::atomic_counter::ConsistentCounter;

use message::Message;
use oplog::CoordDecision;
use oplog::CoordRecord;
use oplog::OpLog;
use transaction::Transaction;
use transaction::TxnMode;
use transport::Transport;

/// Coordinator log file, colocated with the coordinator process.
pub const COORD_LOG_NAME: &'static str = "log";

type Inbox = mpsc::Sender<(String, Message)>;

///
/// CoordContext
/// Process-wide coordinator state: the transport handle, the durable log,
/// the live-transaction map, and the monotonic transaction id counter.
/// Built once at startup and passed to every worker explicitly.
///
pub struct CoordContext {
    pub transport: Arc<dyn Transport>,
    pub dir: PathBuf,
    pub vote_window: Duration,
    pub ack_window: Duration,
    log: Mutex<OpLog<CoordRecord>>,
    live: Mutex<HashMap<String, Inbox>>,
    next_id: ConsistentCounter,
}

impl CoordContext {
    /// Append one record and make it durable. Serialized across workers.
    pub fn log_append(&self, rec: CoordRecord) {
        self.log.lock().unwrap().append(&rec);
    }

    /// Drop a finished transaction from the live map.
    pub fn retire(&self, file_name: &str) {
        self.live.lock().unwrap().remove(file_name);
    }
}

///
/// SubmitError
/// Reasons a submission is refused before any protocol work happens.
///
#[derive(Debug)]
pub enum SubmitError {
    /// A transaction with this fingerprint is still live.
    InFlight(String),
    /// A source tuple is not of the form `address:filename`.
    BadSource(String),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SubmitError::InFlight(ref name) => {
                write!(f, "transaction {} is already in flight", name)
            }
            SubmitError::BadSource(ref src) => {
                write!(f, "malformed source tuple {:?}, want address:filename", src)
            }
        }
    }
}

impl Error for SubmitError {}

///
/// group_sources()
/// Splits each `address:filename` tuple on its last colon (addresses are
/// host:port) and groups the file names per participant, keeping
/// first-seen order within each group.
///
pub fn group_sources(sources: &[String]) -> Result<BTreeMap<String, Vec<String>>, SubmitError> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for src in sources {
        let mut split = src.rsplitn(2, ':');
        let file = split.next().unwrap_or("");
        let addr = split.next().unwrap_or("");
        if addr.is_empty() || file.is_empty() {
            return Err(SubmitError::BadSource(src.clone()));
        }
        map.entry(addr.to_string()).or_insert_with(Vec::new).push(file.to_string());
    }
    Ok(map)
}

///
/// Coordinator
/// Public handle for a coordinator process: construct, spawn the
/// dispatcher, recover, then submit.
///
pub struct Coordinator {
    ctx: Arc<CoordContext>,
}

impl Coordinator {

    pub fn new(
        transport: Arc<dyn Transport>,
        dir: PathBuf,
        vote_window: Duration,
        ack_window: Duration) -> Coordinator {

        let log = OpLog::open(dir.join(COORD_LOG_NAME));
        Coordinator {
            ctx: Arc::new(CoordContext {
                transport: transport,
                dir: dir,
                vote_window: vote_window,
                ack_window: ack_window,
                log: Mutex::new(log),
                live: Mutex::new(HashMap::new()),
                next_id: ConsistentCounter::new(1),
            }),
        }
    }

    ///
    /// spawn_dispatcher()
    /// Single receive loop: decode each datagram and hand the envelope to
    /// the live transaction owning its fingerprint. Unknown fingerprints
    /// and malformed datagrams are dropped.
    ///
    pub fn spawn_dispatcher(&self) -> thread::JoinHandle<()> {
        let ctx = self.ctx.clone();
        thread::spawn(move || loop {
            let (from, raw) = match ctx.transport.recv() {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("dispatcher: receive failed, stopping: {}", e);
                    break;
                }
            };
            let msg = match Message::decode(&raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!("dispatcher: dropping malformed datagram from {}: {}", from, e);
                    continue;
                }
            };
            let live = ctx.live.lock().unwrap();
            match live.get(&msg.file_name) {
                Some(tx) => {
                    let _ = tx.send((from, msg));
                }
                None => {
                    trace!(
                        "dispatcher: no live transaction for {}, dropping {:?} from {}",
                        msg.file_name, msg.mtype, from
                    );
                }
            }
        })
    }

    ///
    /// start_commit()
    /// Submission entry point. Groups the sources, registers the
    /// fingerprint, and hands the transaction to a worker thread; the
    /// call returns as soon as the worker is spawned.
    ///
    pub fn start_commit(
        &self,
        file_name: &str,
        content: Vec<u8>,
        sources: &[String]) -> Result<(), SubmitError> {

        let participants = group_sources(sources)?;
        let (tx, rx) = mpsc::channel();
        {
            let mut live = self.ctx.live.lock().unwrap();
            if live.contains_key(file_name) {
                return Err(SubmitError::InFlight(file_name.to_string()));
            }
            live.insert(file_name.to_string(), tx);
        }
        let txn = Transaction::new(
            TxnMode::Fresh,
            self.ctx.next_id.inc(),
            file_name.to_string(),
            content,
            participants,
            rx,
        );
        let ctx = self.ctx.clone();
        thread::spawn(move || txn.run(&ctx));
        Ok(())
    }

    ///
    /// recover()
    /// Replays the durable log in file order. Every transaction that
    /// reached `commit` resends its commit decision; every proposal with
    /// no terminal record aborts unilaterally. Redo workers run while the
    /// dispatcher routes their acks; once all of them reach quiescence
    /// the log is truncated and reopened. Call after spawn_dispatcher()
    /// and before accepting submissions.
    ///
    pub fn recover(&self) {
        let records = OpLog::<CoordRecord>::replay(&self.ctx.dir.join(COORD_LOG_NAME));
        let mut to_abort: HashMap<usize, CoordRecord> = HashMap::new();
        let mut to_commit: HashMap<usize, CoordRecord> = HashMap::new();
        let mut high = 0;
        for rec in records {
            if rec.trans_id > high {
                high = rec.trans_id;
            }
            match rec.decision {
                CoordDecision::Prepare => {
                    to_abort.insert(rec.trans_id, rec);
                }
                CoordDecision::Commit => {
                    to_abort.remove(&rec.trans_id);
                    to_commit.insert(rec.trans_id, rec);
                }
                CoordDecision::Abort => {
                    if !to_abort.contains_key(&rec.trans_id) {
                        to_abort.insert(rec.trans_id, rec);
                    }
                }
                CoordDecision::Finished => {
                    to_abort.remove(&rec.trans_id);
                    to_commit.remove(&rec.trans_id);
                }
            }
        }
        // keep ids monotonic across the restart
        self.ctx.next_id.add(high);

        if !to_commit.is_empty() || !to_abort.is_empty() {
            info!(
                "recovery: {} commit(s) to resend, {} proposal(s) to abort",
                to_commit.len(),
                to_abort.len()
            );
            let mut workers = Vec::new();
            for (_, rec) in to_commit {
                workers.push(self.spawn_redo(TxnMode::RedoCommit, rec));
            }
            for (_, rec) in to_abort {
                workers.push(self.spawn_redo(TxnMode::RedoAbort, rec));
            }
            for w in workers {
                let _ = w.join();
            }
        }
        self.ctx.log.lock().unwrap().reset();
    }

    fn spawn_redo(&self, mode: TxnMode, rec: CoordRecord) -> thread::JoinHandle<()> {
        let (tx, rx) = mpsc::channel();
        self.ctx.live.lock().unwrap().insert(rec.file_name.clone(), tx);
        let txn = Transaction::new(mode, rec.trans_id, rec.file_name, Vec::new(), rec.participants, rx);
        let ctx = self.ctx.clone();
        thread::spawn(move || txn.run(&ctx))
    }

    /// Number of transactions still live. Zero means quiescent.
    pub fn in_flight(&self) -> usize {
        self.ctx.live.lock().unwrap().len()
    }
}

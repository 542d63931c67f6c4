//!
//! participant.rs
//! Participant side of the collage 2PC. Votes on proposals against the
//! local filesystem and the lock set, applies decisions idempotently, and
//! recovers its promises from the durable log on restart. All handling is
//! single-threaded: one message at a time, in arrival order.
//!
use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use message::Message;
use message::MessageType;
use oplog::OpLog;
use oplog::PartDecision;
use oplog::PartRecord;
use transport::Transport;

/// Approval oracle consulted before a participant promises its sources.
pub type Oracle = Box<dyn Fn(&[u8], &[String]) -> bool + Send>;

///
/// Participant
/// Per-process participant state. `lock_set` holds every local file
/// currently promised to some live transaction; a locked file never
/// takes part in a second proposal.
///
pub struct Participant {
    id: String,
    dir: PathBuf,
    transport: Arc<dyn Transport>,
    log: OpLog<PartRecord>,
    log_path: PathBuf,
    lock_set: Mutex<HashSet<String>>,
    pending: HashMap<String, Vec<String>>,
    finished: HashSet<String>,
    oracle: Oracle,
    commits: u64,
    aborts: u64,
}

impl Participant {

    pub fn new(id: &str, dir: PathBuf, transport: Arc<dyn Transport>, oracle: Oracle) -> Participant {
        let log_path = dir.join(format!("log_{}.txt", id));
        Participant {
            id: id.to_string(),
            dir: dir,
            transport: transport,
            log: OpLog::open(log_path.clone()),
            log_path: log_path,
            lock_set: Mutex::new(HashSet::new()),
            pending: HashMap::new(),
            finished: HashSet::new(),
            oracle: oracle,
            commits: 0,
            aborts: 0,
        }
    }

    ///
    /// recover()
    /// Folds the durable log down to the last record per fingerprint. An
    /// `Agree` with no terminal record is a standing promise: its locks
    /// are restored and the coordinator's retransmitted decision will
    /// resolve it. A `COMMIT` or `ABORT` is re-applied. The log is then
    /// truncated and rewritten with one record per fingerprint that still
    /// matters, so a second crash recovers the same state.
    ///
    pub fn recover(&mut self) {
        let mut last: HashMap<String, PartRecord> = HashMap::new();
        for rec in OpLog::<PartRecord>::replay(&self.log_path) {
            last.insert(rec.file_name.clone(), rec);
        }

        let mut promised: Vec<PartRecord> = Vec::new();
        let mut completed: Vec<String> = Vec::new();
        for (_, rec) in last {
            match rec.decision {
                PartDecision::Agree => {
                    info!("{}: restoring promise for {}", self.id, rec.file_name);
                    let mut locks = self.lock_set.lock().unwrap();
                    for src in rec.sources.iter() {
                        locks.insert(src.clone());
                    }
                    drop(locks);
                    self.pending.insert(rec.file_name.clone(), rec.sources.clone());
                    promised.push(rec);
                }
                PartDecision::Commit => {
                    info!("{}: replaying commit for {}", self.id, rec.file_name);
                    for src in rec.sources.iter() {
                        self.delete_source(src);
                    }
                    completed.push(rec.file_name);
                }
                PartDecision::Abort => {
                    info!("{}: replaying abort for {}", self.id, rec.file_name);
                    completed.push(rec.file_name);
                }
                PartDecision::Finish | PartDecision::Reject => {}
            }
        }

        self.log.reset();
        for rec in promised.iter() {
            self.log.append(rec);
        }
        for file_name in completed {
            self.log.append(&PartRecord {
                decision: PartDecision::Finish,
                file_name: file_name.clone(),
                sources: Vec::new(),
            });
            self.finished.insert(file_name);
        }
    }

    ///
    /// protocol()
    /// Handler loop: receive, decode, dispatch. Runs until the transport
    /// closes.
    ///
    pub fn protocol(&mut self) {
        loop {
            let (from, raw) = match self.transport.recv() {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("{}: receive failed, stopping: {}", self.id, e);
                    break;
                }
            };
            match Message::decode(&raw) {
                Ok(msg) => self.handle(&from, msg),
                Err(e) => warn!("{}: dropping malformed datagram from {}: {}", self.id, from, e),
            }
        }
        self.report_status();
    }

    ///
    /// handle()
    /// Applies one inbound message. Public so tests and embedders can
    /// deliver messages without the receive loop.
    ///
    pub fn handle(&mut self, from: &str, msg: Message) {
        match msg.mtype {
            MessageType::Prepare => self.handle_prepare(from, msg),
            MessageType::CommitSuc => self.handle_decision(from, msg, true),
            MessageType::CommitFail => self.handle_decision(from, msg, false),
            _ => trace!("{}: dropping unexpected {:?} from {}", self.id, msg.mtype, from),
        }
    }

    fn handle_prepare(&mut self, from: &str, msg: Message) {
        if self.pending.contains_key(&msg.file_name) {
            // the transport may duplicate a proposal we already promised
            trace!("{}: duplicate proposal for {}, re-voting commit", self.id, msg.file_name);
            self.reply(from, MessageType::VoteCommit, &msg.file_name);
            return;
        }

        let locked = {
            let locks = self.lock_set.lock().unwrap();
            msg.sources.iter().any(|src| locks.contains(src))
        };
        let missing = msg.sources.iter().any(|src| !self.dir.join(src).is_file());
        if locked || missing || !(self.oracle)(&msg.content, &msg.sources) {
            info!("{}: voting abort on {}", self.id, msg.file_name);
            self.log.append(&PartRecord {
                decision: PartDecision::Reject,
                file_name: msg.file_name.clone(),
                sources: msg.sources.clone(),
            });
            self.reply(from, MessageType::VoteAbort, &msg.file_name);
            return;
        }

        {
            let mut locks = self.lock_set.lock().unwrap();
            for src in msg.sources.iter() {
                locks.insert(src.clone());
            }
        }
        self.pending.insert(msg.file_name.clone(), msg.sources.clone());
        // the promise is durable before the vote leaves this process
        self.log.append(&PartRecord {
            decision: PartDecision::Agree,
            file_name: msg.file_name.clone(),
            sources: msg.sources.clone(),
        });
        info!("{}: voting commit on {}", self.id, msg.file_name);
        self.reply(from, MessageType::VoteCommit, &msg.file_name);
    }

    fn handle_decision(&mut self, from: &str, msg: Message, commit: bool) {
        if self.finished.contains(&msg.file_name) {
            trace!("{}: {} already finished, re-acking", self.id, msg.file_name);
            self.reply(from, MessageType::Ack, &msg.file_name);
            return;
        }

        self.log.append(&PartRecord {
            decision: if commit { PartDecision::Commit } else { PartDecision::Abort },
            file_name: msg.file_name.clone(),
            sources: msg.sources.clone(),
        });
        {
            let mut locks = self.lock_set.lock().unwrap();
            for src in msg.sources.iter() {
                locks.remove(src);
            }
        }
        if commit {
            for src in msg.sources.iter() {
                self.delete_source(src);
            }
            self.commits += 1;
            info!("{}: committed {}", self.id, msg.file_name);
        } else {
            self.aborts += 1;
            info!("{}: aborted {}", self.id, msg.file_name);
        }
        self.reply(from, MessageType::Ack, &msg.file_name);
        self.log.append(&PartRecord {
            decision: PartDecision::Finish,
            file_name: msg.file_name.clone(),
            sources: Vec::new(),
        });
        self.pending.remove(&msg.file_name);
        self.finished.insert(msg.file_name);
    }

    /// Best-effort and idempotent: a file already gone is fine.
    fn delete_source(&self, name: &str) {
        match fs::remove_file(self.dir.join(name)) {
            Ok(_) => debug!("{}: deleted {}", self.id, name),
            Err(e) => debug!("{}: delete of {} skipped: {}", self.id, name, e),
        }
    }

    fn reply(&self, to: &str, t: MessageType, file_name: &str) {
        self.transport.send(to, &Message::control(t, file_name).encode());
    }

    pub fn holds_lock(&self, name: &str) -> bool {
        self.lock_set.lock().unwrap().contains(name)
    }

    pub fn is_finished(&self, file_name: &str) -> bool {
        self.finished.contains(file_name)
    }

    ///
    /// report_status()
    /// Aggregate commit/abort counts for this participant.
    ///
    pub fn report_status(&self) {
        println!("{}:\tC:{}\tA:{}", self.id, self.commits, self.aborts);
    }
}

#[cfg(test)]
mod tests {
    extern crate tempfile;

    use std::io;

    use super::*;

    /// Captures outbound messages instead of delivering them.
    struct TestNet {
        sent: Mutex<Vec<(String, Message)>>,
    }

    impl TestNet {
        fn new() -> Arc<TestNet> {
            Arc::new(TestNet {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<(String, Message)> {
            self.sent.lock().unwrap().drain(..).collect()
        }
    }

    impl Transport for TestNet {
        fn send(&self, to: &str, payload: &[u8]) {
            let msg = Message::decode(payload).unwrap();
            self.sent.lock().unwrap().push((to.to_string(), msg));
        }

        fn recv(&self) -> io::Result<(String, Vec<u8>)> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "test net has no inbound path"))
        }
    }

    fn approve_all() -> Oracle {
        Box::new(|_content: &[u8], _sources: &[String]| true)
    }

    fn reject_all() -> Oracle {
        Box::new(|_content: &[u8], _sources: &[String]| false)
    }

    fn seed(dir: &tempfile::TempDir, names: &[&str]) {
        for name in names {
            fs::write(dir.path().join(name), b"pixels".to_vec()).unwrap();
        }
    }

    fn prepare(file_name: &str, sources: &[&str]) -> Message {
        Message::new(
            MessageType::Prepare,
            file_name,
            b"collage bytes".to_vec(),
            sources.iter().map(|s| s.to_string()).collect(),
        )
    }

    fn decision(t: MessageType, file_name: &str, sources: &[&str]) -> Message {
        Message::new(t, file_name, Vec::new(), sources.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn promises_and_locks_on_prepare() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, &["a1.jpg", "a2.jpg"]);
        let net = TestNet::new();
        let mut p = Participant::new("p0", dir.path().to_path_buf(), net.clone(), approve_all());

        p.handle("coordinator", prepare("out.jpg", &["a1.jpg", "a2.jpg"]));

        let sent = net.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "coordinator");
        assert_eq!(sent[0].1.mtype, MessageType::VoteCommit);
        assert!(p.holds_lock("a1.jpg"));
        assert!(p.holds_lock("a2.jpg"));
    }

    #[test]
    fn missing_source_votes_abort() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, &["a1.jpg"]);
        let net = TestNet::new();
        let mut p = Participant::new("p0", dir.path().to_path_buf(), net.clone(), approve_all());

        p.handle("coordinator", prepare("out.jpg", &["a1.jpg", "ghost.jpg"]));

        let sent = net.take();
        assert_eq!(sent[0].1.mtype, MessageType::VoteAbort);
        assert!(!p.holds_lock("a1.jpg"));
    }

    #[test]
    fn locked_source_votes_abort() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, &["a1.jpg", "a2.jpg"]);
        let net = TestNet::new();
        let mut p = Participant::new("p0", dir.path().to_path_buf(), net.clone(), approve_all());

        p.handle("coordinator", prepare("first.jpg", &["a1.jpg"]));
        p.handle("coordinator", prepare("second.jpg", &["a1.jpg", "a2.jpg"]));

        let sent = net.take();
        assert_eq!(sent[0].1.mtype, MessageType::VoteCommit);
        assert_eq!(sent[1].1.mtype, MessageType::VoteAbort);
        // the refused proposal took no locks of its own
        assert!(!p.holds_lock("a2.jpg"));
    }

    #[test]
    fn oracle_refusal_votes_abort() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, &["a1.jpg"]);
        let net = TestNet::new();
        let mut p = Participant::new("p0", dir.path().to_path_buf(), net.clone(), reject_all());

        p.handle("coordinator", prepare("out.jpg", &["a1.jpg"]));

        assert_eq!(net.take()[0].1.mtype, MessageType::VoteAbort);
        assert!(!p.holds_lock("a1.jpg"));
    }

    #[test]
    fn duplicate_prepare_revotes_commit() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, &["a1.jpg"]);
        let net = TestNet::new();
        let mut p = Participant::new("p0", dir.path().to_path_buf(), net.clone(), approve_all());

        p.handle("coordinator", prepare("out.jpg", &["a1.jpg"]));
        p.handle("coordinator", prepare("out.jpg", &["a1.jpg"]));

        let sent = net.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1.mtype, MessageType::VoteCommit);
        // one Agree record, not two
        let records = OpLog::<PartRecord>::replay(&dir.path().join("log_p0.txt"));
        let agrees = records.iter().filter(|r| r.decision == PartDecision::Agree).count();
        assert_eq!(agrees, 1);
    }

    #[test]
    fn commit_deletes_acks_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, &["a1.jpg", "a2.jpg"]);
        let net = TestNet::new();
        let mut p = Participant::new("p0", dir.path().to_path_buf(), net.clone(), approve_all());

        p.handle("coordinator", prepare("out.jpg", &["a1.jpg", "a2.jpg"]));
        net.take();
        let suc = decision(MessageType::CommitSuc, "out.jpg", &["a1.jpg", "a2.jpg"]);
        p.handle("coordinator", suc.clone());
        p.handle("coordinator", suc.clone());
        p.handle("coordinator", suc);

        // every delivery discharges exactly one ack
        let sent = net.take();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|s| s.1.mtype == MessageType::Ack));
        assert!(!dir.path().join("a1.jpg").exists());
        assert!(!dir.path().join("a2.jpg").exists());
        assert!(!p.holds_lock("a1.jpg"));
        assert!(p.is_finished("out.jpg"));
        // the duplicates added no records: Agree, COMMIT, Finish
        let records = OpLog::<PartRecord>::replay(&dir.path().join("log_p0.txt"));
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].decision, PartDecision::Commit);
        assert_eq!(records[2].decision, PartDecision::Finish);
    }

    #[test]
    fn abort_releases_locks_and_keeps_files() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, &["a1.jpg"]);
        let net = TestNet::new();
        let mut p = Participant::new("p0", dir.path().to_path_buf(), net.clone(), approve_all());

        p.handle("coordinator", prepare("out.jpg", &["a1.jpg"]));
        net.take();
        p.handle("coordinator", decision(MessageType::CommitFail, "out.jpg", &["a1.jpg"]));

        assert_eq!(net.take()[0].1.mtype, MessageType::Ack);
        assert!(dir.path().join("a1.jpg").exists());
        assert!(!p.holds_lock("a1.jpg"));
        assert!(p.is_finished("out.jpg"));
    }

    #[test]
    fn recovery_restores_standing_promise() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, &["a1.jpg"]);
        {
            let net = TestNet::new();
            let mut p = Participant::new("p0", dir.path().to_path_buf(), net, approve_all());
            p.handle("coordinator", prepare("out.jpg", &["a1.jpg"]));
        }

        let net = TestNet::new();
        let mut p = Participant::new("p0", dir.path().to_path_buf(), net.clone(), approve_all());
        p.recover();
        assert!(p.holds_lock("a1.jpg"));

        // the retransmitted decision resolves the promise
        p.handle("coordinator", decision(MessageType::CommitSuc, "out.jpg", &["a1.jpg"]));
        assert!(!dir.path().join("a1.jpg").exists());
        assert_eq!(net.take()[0].1.mtype, MessageType::Ack);
    }

    #[test]
    fn recovery_survives_a_second_crash() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, &["a1.jpg"]);
        {
            let net = TestNet::new();
            let mut p = Participant::new("p0", dir.path().to_path_buf(), net, approve_all());
            p.handle("coordinator", prepare("out.jpg", &["a1.jpg"]));
        }
        {
            let net = TestNet::new();
            let mut p = Participant::new("p0", dir.path().to_path_buf(), net, approve_all());
            p.recover();
        }

        let net = TestNet::new();
        let mut p = Participant::new("p0", dir.path().to_path_buf(), net, approve_all());
        p.recover();
        assert!(p.holds_lock("a1.jpg"));
    }

    #[test]
    fn recovery_replays_unfinished_commit() {
        let dir = tempfile::tempdir().unwrap();
        seed(&dir, &["a1.jpg"]);
        {
            let mut log: OpLog<PartRecord> =
                OpLog::open(dir.path().join("log_p0.txt"));
            log.append(&PartRecord {
                decision: PartDecision::Agree,
                file_name: "out.jpg".to_string(),
                sources: vec!["a1.jpg".to_string()],
            });
            log.append(&PartRecord {
                decision: PartDecision::Commit,
                file_name: "out.jpg".to_string(),
                sources: vec!["a1.jpg".to_string()],
            });
        }

        let net = TestNet::new();
        let mut p = Participant::new("p0", dir.path().to_path_buf(), net.clone(), approve_all());
        p.recover();

        assert!(!dir.path().join("a1.jpg").exists());
        assert!(!p.holds_lock("a1.jpg"));
        // a late duplicate decision is still acknowledged
        p.handle("coordinator", decision(MessageType::CommitSuc, "out.jpg", &["a1.jpg"]));
        assert_eq!(net.take()[0].1.mtype, MessageType::Ack);
        let records = OpLog::<PartRecord>::replay(&dir.path().join("log_p0.txt"));
        assert_eq!(records[0].decision, PartDecision::Finish);
    }
}

//!
//! transaction.rs
//! Per-fingerprint coordinator worker. A fresh transaction drives the full
//! protocol: propose, collect votes under the voting window, persist the
//! artifact and the decision, then retransmit the decision until every
//! participant has acknowledged it. Redo transactions are rebuilt from the
//! durable log after a crash and only rerun the retransmission half.
//!
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::io::prelude::*;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Instant;

use coordinator::CoordContext;
use message::Message;
use message::MessageType;
use oplog::CoordDecision;
use oplog::CoordRecord;

///
/// TxnPhase
/// States of the coordinator side of the 2PC state machine. The phase
/// only ever advances: Voting, then one of Committed/Aborted, then
/// Finished once the acks are in.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnPhase {
    Voting,
    Committed,
    Aborted,
    Finished,
}

///
/// TxnMode
/// Fresh runs the whole protocol. RedoCommit and RedoAbort come from
/// recovery replay: the decision is already durable, so they skip voting
/// and resume retransmission.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxnMode {
    Fresh,
    RedoCommit,
    RedoAbort,
}

pub struct Transaction {
    trans_id: usize,
    file_name: String,
    mode: TxnMode,
    content: Vec<u8>,
    participants: BTreeMap<String, Vec<String>>,
    phase: TxnPhase,
    pending_acks: HashSet<String>,
    inbox: mpsc::Receiver<(String, Message)>,
}

impl Transaction {

    pub fn new(
        mode: TxnMode,
        trans_id: usize,
        file_name: String,
        content: Vec<u8>,
        participants: BTreeMap<String, Vec<String>>,
        inbox: mpsc::Receiver<(String, Message)>) -> Transaction {

        Transaction {
            trans_id: trans_id,
            file_name: file_name,
            mode: mode,
            content: content,
            participants: participants,
            phase: TxnPhase::Voting,
            pending_acks: HashSet::new(),
            inbox: inbox,
        }
    }

    ///
    /// run()
    /// Drives the transaction to Finished and retires it from the live
    /// map. Runs on its own worker thread.
    ///
    pub fn run(mut self, ctx: &CoordContext) {
        match self.mode {
            TxnMode::Fresh => self.run_fresh(ctx),
            TxnMode::RedoCommit => {
                self.phase = TxnPhase::Committed;
                self.redo(ctx);
            }
            TxnMode::RedoAbort => {
                self.phase = TxnPhase::Aborted;
                self.redo(ctx);
            }
        }
        ctx.retire(&self.file_name);
    }

    fn run_fresh(&mut self, ctx: &CoordContext) {
        // Phase 1: each participant gets the artifact bytes and its own
        // share of the sources.
        for (addr, files) in self.participants.iter() {
            let m = Message::new(
                MessageType::Prepare,
                &self.file_name,
                self.content.clone(),
                files.clone(),
            );
            ctx.transport.send(addr, &m.encode());
        }
        ctx.log_append(self.record(CoordDecision::Prepare));
        info!(
            "txn {} ({}): proposed to {} participant(s)",
            self.trans_id,
            self.file_name,
            self.participants.len()
        );

        if self.collect_votes(ctx) {
            self.commit(ctx);
        } else {
            self.abort(ctx);
        }
    }

    ///
    /// collect_votes()
    /// Blocks on the inbox until every participant has voted commit, any
    /// participant votes abort, or the voting window elapses. A missing
    /// vote counts as an abort.
    ///
    fn collect_votes(&mut self, ctx: &CoordContext) -> bool {
        let deadline = Instant::now() + ctx.vote_window;
        let mut agreed: HashSet<String> = HashSet::new();
        while agreed.len() < self.participants.len() {
            let now = Instant::now();
            if now >= deadline {
                info!("txn {} ({}): voting window elapsed", self.trans_id, self.file_name);
                return false;
            }
            match self.inbox.recv_timeout(deadline - now) {
                Ok((from, msg)) => match msg.mtype {
                    MessageType::VoteCommit => {
                        if self.participants.contains_key(&from) {
                            trace!("txn {}: commit vote from {}", self.trans_id, from);
                            agreed.insert(from);
                        }
                    }
                    MessageType::VoteAbort => {
                        info!("txn {} ({}): abort vote from {}", self.trans_id, self.file_name, from);
                        return false;
                    }
                    _ => {
                        trace!("txn {}: dropping stray {:?} from {}", self.trans_id, msg.mtype, from);
                    }
                },
                Err(RecvTimeoutError::Timeout) => {
                    info!("txn {} ({}): voting window elapsed", self.trans_id, self.file_name);
                    return false;
                }
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
        true
    }

    fn commit(&mut self, ctx: &CoordContext) {
        // The artifact must be on disk before the commit record is
        // durable; recovery may otherwise announce a commit for a file
        // that does not exist.
        if let Err(e) = self.write_artifact(ctx) {
            error!(
                "txn {} ({}): artifact write failed, aborting: {}",
                self.trans_id, self.file_name, e
            );
            self.abort(ctx);
            return;
        }
        ctx.log_append(self.record(CoordDecision::Commit));
        self.phase = TxnPhase::Committed;
        info!("txn {} ({}): committed", self.trans_id, self.file_name);
        self.finish(ctx);
    }

    fn abort(&mut self, ctx: &CoordContext) {
        ctx.log_append(self.record(CoordDecision::Abort));
        self.phase = TxnPhase::Aborted;
        info!("txn {} ({}): aborted", self.trans_id, self.file_name);
        self.finish(ctx);
    }

    fn redo(&mut self, ctx: &CoordContext) {
        info!(
            "txn {} ({}): resending {:?} decision to {} participant(s)",
            self.trans_id,
            self.file_name,
            self.phase,
            self.participants.len()
        );
        self.finish(ctx);
    }

    /// Broadcast the standing decision and collect acks until none remain.
    fn finish(&mut self, ctx: &CoordContext) {
        self.pending_acks = self.participants.keys().cloned().collect();
        self.broadcast_decision(ctx);
        self.collect_acks(ctx);
    }

    fn broadcast_decision(&self, ctx: &CoordContext) {
        let mtype = if self.phase == TxnPhase::Committed {
            MessageType::CommitSuc
        } else {
            MessageType::CommitFail
        };
        for addr in self.pending_acks.iter() {
            let m = Message::new(mtype, &self.file_name, Vec::new(), self.participants[addr].clone());
            ctx.transport.send(addr, &m.encode());
        }
    }

    ///
    /// collect_acks()
    /// Drains the inbox until every participant has acknowledged the
    /// decision. If the retransmission window passes with no progress,
    /// the decision is resent to every still-pending address and the
    /// window restarts. Duplicate acks and late votes are dropped.
    ///
    fn collect_acks(&mut self, ctx: &CoordContext) {
        let mut deadline = Instant::now() + ctx.ack_window;
        while !self.pending_acks.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                debug!(
                    "txn {} ({}): {} ack(s) outstanding, resending decision",
                    self.trans_id,
                    self.file_name,
                    self.pending_acks.len()
                );
                self.broadcast_decision(ctx);
                deadline = Instant::now() + ctx.ack_window;
                continue;
            }
            match self.inbox.recv_timeout(deadline - now) {
                Ok((from, msg)) => {
                    if msg.mtype == MessageType::Ack && self.pending_acks.remove(&from) {
                        trace!("txn {}: ack from {}", self.trans_id, from);
                        deadline = Instant::now() + ctx.ack_window;
                    } else {
                        trace!("txn {}: dropping {:?} from {}", self.trans_id, msg.mtype, from);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("txn {} ({}): inbox closed before all acks", self.trans_id, self.file_name);
                    return;
                }
            }
        }
        ctx.log_append(self.record(CoordDecision::Finished));
        self.phase = TxnPhase::Finished;
        info!("txn {} ({}): finished", self.trans_id, self.file_name);
    }

    fn write_artifact(&self, ctx: &CoordContext) -> io::Result<()> {
        let path = ctx.dir.join(&self.file_name);
        let mut f = File::create(&path)?;
        f.write_all(&self.content)?;
        f.sync_all()
    }

    fn record(&self, decision: CoordDecision) -> CoordRecord {
        CoordRecord {
            trans_id: self.trans_id,
            decision: decision,
            file_name: self.file_name.clone(),
            participants: self.participants.clone(),
        }
    }
}

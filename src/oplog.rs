//!
//! oplog.rs
//! Append-only durable logs for the coordinator and the participants, one
//! serde_json record per line, synced to disk after every append. The log
//! is the sole source of recovery truth on both sides: nothing externally
//! visible may depend on a record that has not been flushed.
//!
extern crate serde;
extern crate serde_json;

use std::collections::BTreeMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufReader;
use std::io::prelude::*;
use std::marker::PhantomData;
use std::path::Path;
use std::path::PathBuf;
use std::process;

///
/// CoordDecision
/// Decision values recorded by the coordinator. `prepare` marks the
/// proposal broadcast, `commit`/`abort` the durable decision, `finished`
/// the point where every participant has acknowledged it.
///
#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordDecision {
    #[serde(rename = "prepare")]
    Prepare,
    #[serde(rename = "commit")]
    Commit,
    #[serde(rename = "abort")]
    Abort,
    #[serde(rename = "finished")]
    Finished,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct CoordRecord {
    pub trans_id: usize,
    pub decision: CoordDecision,
    pub file_name: String,
    pub participants: BTreeMap<String, Vec<String>>,
}

///
/// PartDecision
/// Decision values recorded by a participant. `Agree`/`Reject` are the
/// phase 1 votes, `COMMIT`/`ABORT` the decision as learned from the
/// coordinator, `Finish` the completed application of that decision.
///
#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartDecision {
    Agree,
    Reject,
    #[serde(rename = "COMMIT")]
    Commit,
    #[serde(rename = "ABORT")]
    Abort,
    Finish,
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct PartRecord {
    pub decision: PartDecision,
    pub file_name: String,
    pub sources: Vec<String>,
}

///
/// OpLog
/// One append-only log file of line-delimited records. Appends are fatal
/// on failure: a coordinator or participant that cannot make its next
/// record durable must not take the action that depends on it.
///
#[derive(Debug)]
pub struct OpLog<R> {
    path: PathBuf,
    lf: File,
    _rec: PhantomData<R>,
}

impl<R: serde::Serialize + serde::de::DeserializeOwned> OpLog<R> {

    ///
    /// open(path)
    /// Opens the log for appending, creating it if absent. Existing
    /// records are left in place for replay.
    ///
    pub fn open(path: PathBuf) -> OpLog<R> {
        let lf = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .expect("cannot open log for appending");
        OpLog {
            path: path,
            lf: lf,
            _rec: PhantomData,
        }
    }

    ///
    /// replay(path)
    /// Reads every record currently in the log, in file order. A missing
    /// file is an empty log. The final line may be a torn crash prefix;
    /// it is dropped with a warning and replay stops there.
    ///
    pub fn replay(path: &Path) -> Vec<R> {
        let mut records = Vec::new();
        let lf = match File::open(path) {
            Ok(f) => f,
            Err(_) => return records,
        };
        let mut reader = BufReader::new(&lf);
        let mut line = String::new();
        loop {
            line.clear();
            let len = reader.read_line(&mut line).expect("cannot read log");
            if len == 0 {
                break;
            }
            match serde_json::from_str::<R>(&line) {
                Ok(rec) => records.push(rec),
                Err(e) => {
                    warn!("dropping torn log line in {:?}: {}", path, e);
                    break;
                }
            }
        }
        records
    }

    ///
    /// append(rec)
    /// Appends one record and makes it durable before returning. A failed
    /// write is fatal to the whole process, not just the calling worker.
    ///
    pub fn append(&mut self, rec: &R) {
        if let Err(e) = self.try_append(rec) {
            error!("cannot write log record to {:?}: {}", self.path, e);
            process::abort();
        }
    }

    fn try_append(&mut self, rec: &R) -> io::Result<()> {
        serde_json::to_writer(&mut self.lf, rec)?;
        writeln!(&mut self.lf)?;
        self.lf.sync_all()
    }

    ///
    /// reset()
    /// Truncates the log and reopens it for appending. Called once replay
    /// has driven every recorded transaction to quiescence.
    ///
    pub fn reset(&mut self) {
        self.lf = File::create(&self.path).expect("cannot truncate log");
    }
}

//!
//! checker.rs
//! Tools for checking the durable logs left behind by a coordinator and a
//! set of participants. Exports a single public function called check_run
//! that accepts the coordinator's working directory and one (id, directory)
//! pair per participant, loads both sides' logs, and checks a handful of
//! correctness invariants against them and the filesystem.
//!
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use coordinator::COORD_LOG_NAME;
use oplog::CoordDecision;
use oplog::CoordRecord;
use oplog::OpLog;
use oplog::PartDecision;
use oplog::PartRecord;

///
/// check_participant()
///
/// Given one participant's log and the coordinator's committed/aborted
/// fingerprint sets, check that the participant never learned a decision
/// the coordinator did not durably make, that it voted for everything it
/// committed, and that every committed source is gone from its directory.
///
/// <params>
///     id: participant identifier (label)
///     committed: fingerprints the coordinator durably committed
///     aborted: fingerprints the coordinator durably aborted
///     records: the participant's log records, in file order
///     dir: the participant's working directory
///
fn check_participant(
    id: &str,
    committed: &HashSet<String>,
    aborted: &HashSet<String>,
    records: &[PartRecord],
    dir: &Path) -> bool {

    let mut result = true;

    let mut promised: HashMap<&str, &PartRecord> = HashMap::new();
    let mut num_commit = 0;
    let mut num_abort = 0;
    for rec in records.iter() {
        match rec.decision {
            PartDecision::Agree => {
                promised.insert(&rec.file_name, rec);
            }
            PartDecision::Commit => {
                num_commit += 1;
                // agreement: a participant commits only what the
                // coordinator durably committed, and only after its own
                // vote
                result &= committed.contains(&rec.file_name);
                assert!(committed.contains(&rec.file_name));
                result &= promised.contains_key(rec.file_name.as_str());
                assert!(promised.contains_key(rec.file_name.as_str()));
                for src in rec.sources.iter() {
                    result &= !dir.join(src).exists();
                    assert!(!dir.join(src).exists());
                }
            }
            PartDecision::Abort => {
                num_abort += 1;
                result &= !committed.contains(&rec.file_name);
                assert!(!committed.contains(&rec.file_name));
            }
            PartDecision::Reject | PartDecision::Finish => {}
        }
    }

    result &= num_commit <= committed.len();
    assert!(num_commit <= committed.len());

    println!(
        "{} OK: committed: {} <= {} (coordinator), aborted: {} <= {} (coordinator)",
        id,
        num_commit,
        committed.len(),
        num_abort,
        aborted.len()
    );
    result
}

///
/// check_run()
///
/// Loads the coordinator log from `coord_dir` and one participant log per
/// (id, directory) pair, and checks the run's invariants: a durable commit
/// record implies the artifact exists on the coordinator, a terminal
/// record implies a logged decision, and every participant agrees with the
/// coordinator's decisions.
///
pub fn check_run(coord_dir: &Path, participants: &[(String, PathBuf)]) -> bool {
    let records = OpLog::<CoordRecord>::replay(&coord_dir.join(COORD_LOG_NAME));

    let mut committed: HashSet<String> = HashSet::new();
    let mut aborted: HashSet<String> = HashSet::new();
    let mut finished: HashSet<String> = HashSet::new();
    for rec in records.iter() {
        match rec.decision {
            CoordDecision::Commit => {
                committed.insert(rec.file_name.clone());
            }
            CoordDecision::Abort => {
                aborted.insert(rec.file_name.clone());
            }
            CoordDecision::Finished => {
                finished.insert(rec.file_name.clone());
            }
            CoordDecision::Prepare => {}
        }
    }

    info!(
        "checking run: {} committed, {} aborted, {} finished",
        committed.len(),
        aborted.len(),
        finished.len()
    );

    let mut result = true;
    for file_name in committed.iter() {
        result &= coord_dir.join(file_name).is_file();
        assert!(coord_dir.join(file_name).is_file());
    }
    for file_name in finished.iter() {
        let decided = committed.contains(file_name) || aborted.contains(file_name);
        result &= decided;
        assert!(decided);
    }

    for (id, dir) in participants.iter() {
        let plog = OpLog::<PartRecord>::replay(&dir.join(format!("log_{}.txt", id)));
        result &= check_participant(id, &committed, &aborted, &plog, dir);
    }
    result
}

//!
//! TPCOptions
//! A simple tool for managing command line options and trace/log/debug
//! instrumentation for the collage 2PC binaries. Exports a constructor
//! pair for a struct that represents the options of the coordinator and
//! participant processes, uses the clap crate to collect command line
//! options, and uses the log and stderrlog crates to initialize the
//! application to use trace!(), debug!(), info!() etc macros from the log
//! crate.
//!
extern crate clap;
extern crate shellexpand;
extern crate stderrlog;

use self::clap::{App, Arg};

#[derive(Clone, Debug)]
pub struct TPCOptions {
    pub port: u16,             // UDP port this process binds
    pub num: String,           // Participant identifier, names the participant log file
    pub verbosity: usize,      // Integer verbosity level. experiment with 0 (default) to 5 (fire-hose of output)
    pub work_dir: String,      // Directory holding the durable log and the files under transaction
    pub vote_window_ms: u64,   // How long the coordinator waits for votes
    pub ack_window_ms: u64,    // How long before an unacknowledged decision is resent
    pub approve_prob: f64,     // Probability the participant approves a proposal
}

impl TPCOptions {

    ///
    /// coordinator()
    /// Options for the coordinator binary: one required positional arg,
    /// the port to bind.
    ///
    pub fn coordinator() -> TPCOptions {
        TPCOptions::parse(true)
    }

    ///
    /// participant()
    /// Options for the participant binary: two required positional args,
    /// the port to bind and the participant identifier.
    ///
    pub fn participant() -> TPCOptions {
        TPCOptions::parse(false)
    }

    fn parse(coordinator: bool) -> TPCOptions {

        // Default values for CLI options
        let default_verbosity = "0";
        let default_work_dir = ".";
        let default_vote_window_ms = "3000";
        let default_ack_window_ms = "2000";
        let default_approve_prob = "1.0";

        let name = if coordinator {
            "collage-coordinator"
        } else {
            "collage-participant"
        };

        // Set-Up clap
        let mut app = App::new(name)
            .version("0.1.0")
            .about("Atomic collage construction over two-phase commit")
            .arg(Arg::with_name("port")
                    .required(true)
                    .takes_value(true)
                    .help("UDP port to bind"))
            .arg(Arg::with_name("verbosity")
                    .short("v")
                    .required(false)
                    .takes_value(true)
                    .help("Output verbosity: 0->No Output, 5->Output Everything"))
            .arg(Arg::with_name("work_dir")
                    .short("d")
                    .long("dir")
                    .required(false)
                    .takes_value(true)
                    .help("Directory holding the durable log and the files under transaction"))
            .arg(Arg::with_name("vote_window_ms")
                    .long("vote_window")
                    .required(false)
                    .takes_value(true)
                    .help("Milliseconds the coordinator waits for votes"))
            .arg(Arg::with_name("ack_window_ms")
                    .long("ack_window")
                    .required(false)
                    .takes_value(true)
                    .help("Milliseconds before an unacknowledged decision is resent"));
        if !coordinator {
            app = app
                .arg(Arg::with_name("num")
                        .required(true)
                        .takes_value(true)
                        .help("Participant identifier, names the participant log file"))
                .arg(Arg::with_name("approve_prob")
                        .short("s")
                        .required(false)
                        .takes_value(true)
                        .help("Probability the participant approves a proposal"));
        }
        let matches = app.get_matches();

        // Parse CLI options and take default values if none given
        let port = matches.value_of("port").unwrap().parse::<u16>().unwrap();
        let num = matches.value_of("num").unwrap_or("").to_string();
        let verbosity = matches.value_of("verbosity").unwrap_or(default_verbosity).parse::<usize>().unwrap();
        let work_dir = shellexpand::full(matches.value_of("work_dir").unwrap_or(default_work_dir)).unwrap().to_string();
        let vote_window_ms = matches.value_of("vote_window_ms").unwrap_or(default_vote_window_ms).parse::<u64>().unwrap();
        let ack_window_ms = matches.value_of("ack_window_ms").unwrap_or(default_ack_window_ms).parse::<u64>().unwrap();
        let approve_prob = matches.value_of("approve_prob").unwrap_or(default_approve_prob).parse::<f64>().unwrap();

        TPCOptions {
            port: port,
            num: num,
            verbosity: verbosity,
            work_dir: work_dir,
            vote_window_ms: vote_window_ms,
            ack_window_ms: ack_window_ms,
            approve_prob: approve_prob,
        }
    }

    ///
    /// init_logging()
    /// Point the log macros at stderr at the requested verbosity.
    ///
    pub fn init_logging(&self) {
        stderrlog::new()
            .quiet(false)
            .timestamp(stderrlog::Timestamp::Millisecond)
            .verbosity(self.verbosity)
            .init()
            .unwrap();
    }
}

//!
//! participant (bin)
//! Participant process. Binds the datagram port, recovers its promises
//! from the durable log, then serves proposals and decisions until
//! interrupted. Approval is decided by coin flip at the configured
//! probability (default 1.0, approve everything).
//!
#[macro_use]
extern crate log;
extern crate collage_2pc;
extern crate ctrlc;
extern crate rand;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use collage_2pc::participant::Participant;
use collage_2pc::tpcoptions::TPCOptions;
use collage_2pc::transport::UdpTransport;

fn main() {
    let opts = TPCOptions::participant();
    opts.init_logging();

    let transport = match UdpTransport::bind(opts.port) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("cannot bind port {}: {}", opts.port, e);
            process::exit(1);
        }
    };

    ctrlc::set_handler(move || {
        info!("participant shutting down");
        process::exit(0);
    })
    .expect("error setting Ctrl-C handler");

    let approve_prob = opts.approve_prob;
    let oracle = Box::new(move |_content: &[u8], _sources: &[String]| {
        rand::random::<f64>() <= approve_prob
    });

    let mut participant = Participant::new(&opts.num, PathBuf::from(&opts.work_dir), transport, oracle);
    participant.recover();
    info!("participant {} listening on port {}", opts.num, opts.port);
    participant.protocol();
}

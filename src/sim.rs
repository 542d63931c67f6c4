//!
//! sim.rs
//! In-memory lossy transport for tests and protocol simulation. A hub owns
//! one inbox per address; every send crosses the hub, where it can be
//! dropped or duplicated, either at a configured probability or through a
//! targeted rule (drop the next N datagrams of one type on one link).
//!
extern crate rand;

use std::collections::HashMap;
use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;

use message::Message;
use message::MessageType;
use transport::Transport;

use self::rand::random;

struct DropRule {
    from: String,
    to: String,
    mtype: MessageType,
    remaining: u32,
}

struct HubInner {
    inboxes: HashMap<String, mpsc::Sender<(String, Vec<u8>)>>,
    drop_prob: f64,
    dup_prob: f64,
    rules: Vec<DropRule>,
    sends: u64,
}

///
/// SimHub
/// The shared switchboard. Clone handles freely; endpoints and test code
/// all talk to the same inner state.
///
#[derive(Clone)]
pub struct SimHub {
    inner: Arc<Mutex<HubInner>>,
}

impl SimHub {
    pub fn new() -> SimHub {
        SimHub::with_loss(0.0, 0.0)
    }

    ///
    /// with_loss(drop_prob, dup_prob)
    /// A hub where every datagram is independently dropped with
    /// probability `drop_prob` and duplicated with probability `dup_prob`.
    ///
    pub fn with_loss(drop_prob: f64, dup_prob: f64) -> SimHub {
        SimHub {
            inner: Arc::new(Mutex::new(HubInner {
                inboxes: HashMap::new(),
                drop_prob: drop_prob,
                dup_prob: dup_prob,
                rules: Vec::new(),
                sends: 0,
            })),
        }
    }

    ///
    /// endpoint(addr)
    /// Registers `addr` on the hub and returns its transport handle.
    /// Re-registering an address replaces the previous inbox, which is how
    /// a restarted process rejoins the network.
    ///
    pub fn endpoint(&self, addr: &str) -> SimEndpoint {
        let (tx, rx) = mpsc::channel();
        self.inner.lock().unwrap().inboxes.insert(addr.to_string(), tx);
        SimEndpoint {
            addr: addr.to_string(),
            hub: self.clone(),
            rx: Mutex::new(rx),
        }
    }

    ///
    /// drop_next(from, to, mtype, count)
    /// Deterministically swallows the next `count` datagrams of type
    /// `mtype` sent from `from` to `to`.
    ///
    pub fn drop_next(&self, from: &str, to: &str, mtype: MessageType, count: u32) {
        self.inner.lock().unwrap().rules.push(DropRule {
            from: from.to_string(),
            to: to.to_string(),
            mtype: mtype,
            remaining: count,
        });
    }

    /// Total send attempts observed, delivered or not.
    pub fn sends(&self) -> u64 {
        self.inner.lock().unwrap().sends
    }
}

///
/// SimEndpoint
/// One address's view of the hub.
///
pub struct SimEndpoint {
    addr: String,
    hub: SimHub,
    rx: Mutex<mpsc::Receiver<(String, Vec<u8>)>>,
}

impl Transport for SimEndpoint {
    fn send(&self, to: &str, payload: &[u8]) {
        let mut inner = self.hub.inner.lock().unwrap();
        inner.sends += 1;
        if let Ok(msg) = Message::decode(payload) {
            let addr = &self.addr;
            if let Some(rule) = inner
                .rules
                .iter_mut()
                .find(|r| r.remaining > 0 && r.from == *addr && r.to == to && r.mtype == msg.mtype)
            {
                rule.remaining -= 1;
                trace!("sim: dropping {:?} {} -> {}", msg.mtype, addr, to);
                return;
            }
        }
        if inner.drop_prob > 0.0 && random::<f64>() < inner.drop_prob {
            return;
        }
        let duplicate = inner.dup_prob > 0.0 && random::<f64>() < inner.dup_prob;
        if let Some(tx) = inner.inboxes.get(to) {
            let _ = tx.send((self.addr.clone(), payload.to_vec()));
            if duplicate {
                let _ = tx.send((self.addr.clone(), payload.to_vec()));
            }
        }
    }

    fn recv(&self) -> io::Result<(String, Vec<u8>)> {
        let rx = self.rx.lock().unwrap();
        rx.recv()
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "hub disconnected"))
    }
}

//! The resolver engine.
//!
//! All mutable state lives in [`Core`] behind a single mutex inside
//! [`ResolverInner`]. Requests move from the waiting queue to the inflight
//! queue when capacity permits, get transmitted on their server's socket,
//! and complete when a matching reply arrives or the retry budget runs
//! out. Server receive loops, per-request timeout timers, probe timers,
//! and writability watchers are tokio tasks holding a weak handle to the
//! inner resolver; they lock the core, do their work, and go back to
//! sleep.
//!
//! Lock order: the core mutex first, then a server's health mutex. Health
//! is never held across a core acquisition.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::base::header::Header;
use crate::base::iana::Rtype;
use crate::base::MAX_PACKET;
use super::ns::{probe_delay, AddServerError, Nameserver, WeakInner, PROBE_BACKOFF};
use super::request::{
    build_query, parse_answers, pick_transaction_id, Completion, Request, UNASSIGNED_ID,
};
use super::search::{SearchState, SearchStep};
use super::{Answer, Error};

//------------ Limits --------------------------------------------------------

/// The engine's tunables.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    /// How many requests may be inflight at once.
    pub max_inflight: usize,

    /// How long to wait for a reply before retransmitting.
    pub timeout: Duration,

    /// Transmissions per issue before the request times out for good.
    pub max_retransmits: u32,

    /// How often a request may move to a different server.
    pub max_reissues: u32,

    /// Consecutive timeouts before a server is considered down.
    pub max_server_timeouts: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_inflight: 64,
            timeout: Duration::from_secs(5),
            max_retransmits: 3,
            max_reissues: 1,
            max_server_timeouts: 3,
        }
    }
}

/// The name probe queries ask for unless configured otherwise.
const DEFAULT_PROBE_NAME: &str = "www.google.com";

//------------ Core ----------------------------------------------------------

/// All mutable resolver state.
#[derive(Debug)]
pub struct Core {
    /// Requests waiting for inflight capacity, in submission order.
    pub waiting: VecDeque<Request>,

    /// Requests out on the wire, in submission order.
    pub inflight: Vec<Request>,

    /// The configured nameservers.
    pub servers: Vec<Arc<Nameserver>>,

    /// The round-robin cursor into `servers`.
    pub cursor: usize,

    /// The number of servers currently believed up.
    pub good_servers: usize,

    /// The current search configuration.
    pub search: Arc<SearchState>,

    /// The engine tunables.
    pub limits: Limits,

    /// The name probes query for.
    pub probe_name: Box<str>,

    /// Source of request identities for timers.
    next_id: u64,

    /// The resolver has been shut down; no new requests are accepted.
    pub shut_down: bool,
}

impl Core {
    pub fn new() -> Self {
        Core {
            waiting: VecDeque::new(),
            inflight: Vec::new(),
            servers: Vec::new(),
            cursor: 0,
            good_servers: 0,
            search: Arc::new(SearchState::new()),
            limits: Limits::default(),
            probe_name: DEFAULT_PROBE_NAME.into(),
            next_id: 0,
            shut_down: false,
        }
    }

    /// Hands out the next request identity.
    pub fn next_request_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Picks the server for the next request.
    ///
    /// Round-robin over the pool, skipping servers that are down. If no
    /// server is up, the cursor still advances and the next server is
    /// returned anyway: attempting something beats attempting nothing.
    pub fn pick_server(&mut self) -> Option<Arc<Nameserver>> {
        if self.servers.is_empty() {
            return None;
        }
        let len = self.servers.len();
        if self.good_servers == 0 {
            self.cursor = (self.cursor + 1) % len;
            return Some(self.servers[self.cursor].clone());
        }
        for _ in 0..len {
            let ns = self.servers[self.cursor % len].clone();
            self.cursor = (self.cursor + 1) % len;
            if ns.is_up() {
                return Some(ns);
            }
        }
        let ns = self.servers[self.cursor % len].clone();
        self.cursor = (self.cursor + 1) % len;
        Some(ns)
    }
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

//------------ ResolverInner -------------------------------------------------

/// The shared innards of a resolver.
#[derive(Debug)]
pub struct ResolverInner {
    pub core: Mutex<Core>,
}

impl ResolverInner {
    pub fn new() -> Self {
        ResolverInner {
            core: Mutex::new(Core::new()),
        }
    }
}

/// # The request life cycle
impl ResolverInner {
    /// Places a new request into the engine.
    ///
    /// If there is inflight capacity and a server to send to, the request
    /// is assigned an id and a server and transmitted right away.
    /// Otherwise it joins the waiting queue unassigned.
    pub fn submit(self: &Arc<Self>, core: &mut Core, mut req: Request) {
        if core.inflight.len() < core.limits.max_inflight {
            if let Some(ns) = core.pick_server() {
                req.ns = Some(ns);
                let xid = pick_transaction_id(&core.inflight);
                req.set_xid(xid);
                let id = req.id;
                core.inflight.push(req);
                self.transmit(core, id);
                return;
            }
        }
        req.ns = None;
        core.waiting.push_back(req);
    }

    /// Promotes waiting requests while there is capacity.
    pub fn pump(self: &Arc<Self>, core: &mut Core) {
        while core.inflight.len() < core.limits.max_inflight && !core.waiting.is_empty() {
            let ns = match core.pick_server() {
                Some(ns) => ns,
                None => break,
            };
            let mut req = core.waiting.pop_front().expect("checked non-empty");
            req.ns = Some(ns);
            let xid = pick_transaction_id(&core.inflight);
            req.set_xid(xid);
            let id = req.id;
            core.inflight.push(req);
            self.transmit(core, id);
            self.flush_transmits(core);
        }
    }

    /// Sends every request still flagged for transmission.
    fn flush_transmits(self: &Arc<Self>, core: &mut Core) {
        let ids: Vec<u64> = core
            .inflight
            .iter()
            .filter(|req| req.transmit_me)
            .map(|req| req.id)
            .collect();
        for id in ids {
            self.transmit(core, id);
        }
    }

    /// Tries to put a request on the wire.
    ///
    /// A would-block or short write marks the server choked and leaves the
    /// request flagged for transmission once the socket drains. Any other
    /// send error fails the server, but the request still arms its timeout
    /// so the retry machinery will eventually move it along.
    fn transmit(self: &Arc<Self>, core: &mut Core, id: u64) {
        let pos = match core.inflight.iter().position(|req| req.id == id) {
            Some(pos) => pos,
            None => return,
        };
        core.inflight[pos].transmit_me = true;
        debug_assert!(core.inflight[pos].xid != UNASSIGNED_ID);
        let ns = match core.inflight[pos].ns.clone() {
            Some(ns) => ns,
            None => return,
        };
        if ns.health.lock().expect("poisoned").choked {
            return;
        }
        let full = core.inflight[pos].packet.len();
        let result = ns.socket.try_send(&core.inflight[pos].packet);
        match result {
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                self.choke(&ns);
            }
            Ok(sent) if sent < full => {
                self.choke(&ns);
            }
            result => {
                if let Err(err) = result {
                    self.fail_server(core, &ns, &err.to_string());
                }
                let timeout = core.limits.timeout;
                if let Some(pos) = core.inflight.iter().position(|req| req.id == id) {
                    let req = &mut core.inflight[pos];
                    req.tx_count += 1;
                    req.transmit_me = false;
                    req.disarm_timeout();
                    let weak = Arc::downgrade(self);
                    req.timeout_task = Some(tokio::spawn(async move {
                        tokio::time::sleep(timeout).await;
                        if let Some(inner) = weak.upgrade() {
                            inner.handle_timeout(id);
                        }
                    }));
                }
            }
        }
    }

    /// The per-request timer fired.
    pub fn handle_timeout(self: &Arc<Self>, id: u64) {
        let mut guard = self.core.lock().expect("poisoned");
        let core = &mut *guard;
        let pos = match core.inflight.iter().position(|req| req.id == id) {
            Some(pos) => pos,
            None => return,
        };
        debug!(id, "request timed out");
        if let Some(ns) = core.inflight[pos].ns.clone() {
            let failed = {
                let mut health = ns.health.lock().expect("poisoned");
                health.timedout += 1;
                if health.timedout > core.limits.max_server_timeouts {
                    health.timedout = 0;
                    true
                } else {
                    false
                }
            };
            if failed {
                self.fail_server(core, &ns, "request timed out");
            }
        }
        if core.inflight[pos].tx_count >= core.limits.max_retransmits {
            self.finish(core, pos, Err(Error::Timeout));
        } else {
            self.transmit(core, id);
        }
    }

    /// Moves a request to a different server after a bad response.
    ///
    /// Returns whether the request was actually reissued. If the pool
    /// hands back the same server there is no point in trying again.
    fn reissue(self: &Arc<Self>, core: &mut Core, pos: usize) -> bool {
        let last = core.inflight[pos].ns.clone();
        let next = core.pick_server();
        let (last, next) = match (last, next) {
            (Some(last), Some(next)) => (last, next),
            _ => return false,
        };
        if Arc::ptr_eq(&last, &next) {
            return false;
        }
        let id = {
            let req = &mut core.inflight[pos];
            req.ns = Some(next);
            req.reissue_count += 1;
            req.tx_count = 0;
            req.transmit_me = true;
            req.id
        };
        self.transmit(core, id);
        true
    }

    /// Completes the request at `pos` and promotes waiting work.
    fn finish(self: &Arc<Self>, core: &mut Core, pos: usize, result: Result<Answer, Error>) {
        let req = core.inflight.remove(pos);
        self.complete(core, req, result);
        self.pump(core);
    }

    /// Delivers a request's outcome.
    fn complete(self: &Arc<Self>, core: &mut Core, mut req: Request, result: Result<Answer, Error>) {
        req.disarm_timeout();
        match req.done.take() {
            Some(Completion::User(tx)) => {
                let _ = tx.send(result);
            }
            Some(Completion::Probe(ns)) => match result {
                Ok(_) | Err(Error::NotExist) => Self::server_up(core, &ns),
                _ => self.probe_failed(&ns),
            },
            None => {}
        }
    }
}

/// # Reply dispatch
impl ResolverInner {
    /// Handles one datagram received on a server's socket.
    pub fn process_datagram(self: &Arc<Self>, ns: &Arc<Nameserver>, packet: &[u8]) {
        let mut guard = self.core.lock().expect("poisoned");
        let core = &mut *guard;
        {
            // Any datagram at all is evidence of life.
            let mut health = ns.health.lock().expect("poisoned");
            if health.timedout > 0 {
                health.timedout = 0;
            }
        }
        let header = match Header::parse(packet) {
            Ok(header) => header,
            Err(_) => return,
        };
        let pos = match core.inflight.iter().position(|req| req.xid == header.id) {
            Some(pos) => pos,
            None => return,
        };
        if !header.is_answer() {
            return;
        }
        if header.flags & Header::ERROR_MASK != 0 {
            self.reply_handle(core, pos, header.flags, None);
            return;
        }
        let reply = match parse_answers(packet, &header, core.inflight[pos].qtype) {
            Ok(reply) => reply,
            Err(_) => return,
        };
        self.reply_handle(core, pos, header.flags, reply);
    }

    /// Acts on a parsed reply for the request at `pos`.
    fn reply_handle(
        self: &Arc<Self>,
        core: &mut Core,
        pos: usize,
        flags: u16,
        reply: Option<Answer>,
    ) {
        let req_ns = core.inflight[pos].ns.clone();
        let reply = match reply {
            Some(reply) if flags & Header::ERROR_MASK == 0 => reply,
            _ => {
                let error = if flags & Header::TC != 0 {
                    Error::Truncated
                } else {
                    Error::from_rcode(flags & Header::RCODE_MASK)
                };
                match error {
                    Error::ServerFailed | Error::NotImpl | Error::Refused => {
                        // The server is to blame; move the request along
                        // if it still has budget for that.
                        if core.inflight[pos].reissue_count < core.limits.max_reissues {
                            if let Some(ns) = req_ns.as_ref() {
                                self.fail_server(core, ns, &format!("bad response ({})", error));
                            }
                            if self.reissue(core, pos) {
                                return;
                            }
                        }
                    }
                    _ => {
                        if let Some(ns) = req_ns.as_ref() {
                            Self::server_up(core, ns);
                        }
                    }
                }
                if error == Error::NotExist
                    && core.inflight[pos].qtype != Rtype::Ptr
                    && core.inflight[pos].search.is_some()
                    && self.search_try_next(core, pos)
                {
                    return;
                }
                self.finish(core, pos, Err(error));
                return;
            }
        };
        if let Some(ns) = req_ns.as_ref() {
            Self::server_up(core, ns);
        }
        self.finish(core, pos, Ok(reply));
    }

    /// Moves a searched request on to its next candidate name.
    ///
    /// Returns false when the candidates are exhausted and the current
    /// result should be delivered instead.
    fn search_try_next(self: &Arc<Self>, core: &mut Core, pos: usize) -> bool {
        let step = match core.inflight[pos].search.as_mut() {
            Some(ctx) => ctx.advance(),
            None => return false,
        };
        let name = match step {
            SearchStep::Next(name) => name,
            SearchStep::Raw(name) => {
                // Last try: if this one fails too, the failure is final.
                core.inflight[pos].search = None;
                name
            }
            SearchStep::Done => return false,
        };
        let packet = match build_query(&name, UNASSIGNED_ID, core.inflight[pos].qtype) {
            Ok(packet) => packet,
            Err(_) => return false,
        };
        debug!(name = %name, "search: trying next candidate");
        let mut req = core.inflight.remove(pos);
        req.disarm_timeout();
        req.reset_query(packet);
        self.submit(core, req);
        true
    }
}

/// # Server health
impl ResolverInner {
    /// Takes a server out of the rotation.
    ///
    /// Arms the probe timer and hands requests that were bound to this
    /// server but not yet sent to a different one.
    fn fail_server(self: &Arc<Self>, core: &mut Core, ns: &Arc<Nameserver>, why: &str) {
        if !core.servers.iter().any(|s| Arc::ptr_eq(s, ns)) {
            // The server left the pool while this event was queued.
            return;
        }
        {
            let mut health = ns.health.lock().expect("poisoned");
            if !health.up {
                return;
            }
            health.up = false;
            health.failed_times = 1;
            if let Some(task) = health.probe_task.take() {
                task.abort();
            }
            let weak = Arc::downgrade(self);
            let probed = ns.clone();
            health.probe_task = Some(tokio::spawn(async move {
                tokio::time::sleep(PROBE_BACKOFF[0]).await;
                if let Some(inner) = weak.upgrade() {
                    inner.send_probe(&probed);
                }
            }));
        }
        warn!(server = %ns.address, why, "nameserver failed");
        core.good_servers -= 1;
        if core.good_servers == 0 {
            warn!("all nameservers have failed");
            return;
        }
        for pos in 0..core.inflight.len() {
            let unsent_here = core.inflight[pos].tx_count == 0
                && matches!(
                    core.inflight[pos].ns.as_ref(),
                    Some(cur) if Arc::ptr_eq(cur, ns)
                );
            if unsent_here {
                let next = core.pick_server();
                core.inflight[pos].ns = next;
            }
        }
    }

    /// Puts a server back into the rotation.
    fn server_up(core: &mut Core, ns: &Arc<Nameserver>) {
        if !core.servers.iter().any(|s| Arc::ptr_eq(s, ns)) {
            return;
        }
        let mut health = ns.health.lock().expect("poisoned");
        if health.up {
            return;
        }
        info!(server = %ns.address, "nameserver is back up");
        health.up = true;
        health.failed_times = 0;
        health.timedout = 0;
        if let Some(task) = health.probe_task.take() {
            task.abort();
        }
        drop(health);
        core.good_servers += 1;
    }

    /// Sends a probe query to a down server.
    ///
    /// The probe is an ordinary request except that it is forced into the
    /// inflight queue no matter the capacity and reports to the server's
    /// health instead of a user.
    pub fn send_probe(self: &Arc<Self>, ns: &Arc<Nameserver>) {
        let mut guard = self.core.lock().expect("poisoned");
        let core = &mut *guard;
        if core.shut_down || !core.servers.iter().any(|s| Arc::ptr_eq(s, ns)) {
            return;
        }
        debug!(server = %ns.address, "sending probe");
        let packet = match build_query(&core.probe_name, UNASSIGNED_ID, Rtype::A) {
            Ok(packet) => packet,
            Err(_) => return,
        };
        let id = core.next_request_id();
        let mut req = Request::new(id, packet, Rtype::A, Completion::Probe(ns.clone()));
        let xid = pick_transaction_id(&core.inflight);
        req.set_xid(xid);
        req.ns = Some(ns.clone());
        core.inflight.push(req);
        self.transmit(core, id);
    }

    /// A probe went unanswered or came back with a bad code.
    fn probe_failed(self: &Arc<Self>, ns: &Arc<Nameserver>) {
        let mut health = ns.health.lock().expect("poisoned");
        if health.up {
            // The server started sending good replies on its own in the
            // meantime.
            return;
        }
        let delay = probe_delay(health.failed_times);
        health.failed_times += 1;
        if let Some(task) = health.probe_task.take() {
            task.abort();
        }
        let weak = Arc::downgrade(self);
        let probed = ns.clone();
        health.probe_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.send_probe(&probed);
            }
        }));
    }

    /// Marks a server's socket as backpressured.
    ///
    /// The first choke arms a watcher that flushes unsent requests once
    /// the socket accepts writes again.
    fn choke(self: &Arc<Self>, ns: &Arc<Nameserver>) {
        let mut health = ns.health.lock().expect("poisoned");
        health.choked = true;
        if !health.write_waiting {
            health.write_waiting = true;
            let weak = Arc::downgrade(self);
            let choked = ns.clone();
            health.write_task = Some(tokio::spawn(async move {
                if choked.socket.writable().await.is_ok() {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_writable(&choked);
                    }
                }
            }));
        }
    }

    /// The socket of a choked server became writable.
    fn handle_writable(self: &Arc<Self>, ns: &Arc<Nameserver>) {
        let mut guard = self.core.lock().expect("poisoned");
        {
            let mut health = ns.health.lock().expect("poisoned");
            health.choked = false;
            health.write_waiting = false;
            health.write_task = None;
        }
        self.flush_transmits(&mut guard);
    }
}

/// # Pool management
impl ResolverInner {
    /// Adds a server to the pool and starts its receive loop.
    pub async fn add_server(self: &Arc<Self>, address: SocketAddrV4) -> Result<(), AddServerError> {
        {
            let core = self.core.lock().expect("poisoned");
            if core.servers.iter().any(|s| s.address == address) {
                return Err(AddServerError::Duplicate);
            }
        }
        let ns = Arc::new(Nameserver::connect(address).await?);
        let weak = Arc::downgrade(self);
        let reader = ns.clone();
        let task = tokio::spawn(recv_loop(weak, reader));
        *ns.recv_task.lock().expect("poisoned") = Some(task);

        let mut guard = self.core.lock().expect("poisoned");
        let core = &mut *guard;
        if core.servers.iter().any(|s| s.address == address) {
            // Somebody added the same address while we were connecting.
            ns.stop_tasks();
            return Err(AddServerError::Duplicate);
        }
        debug!(server = %address, "added nameserver");
        core.servers.push(ns);
        core.good_servers += 1;
        self.pump(core);
        Ok(())
    }

    /// Drops all servers and parks every request in the waiting queue.
    ///
    /// Suspended inflight requests keep their completion and search state
    /// but lose transaction id, server, and counters. They are placed ahead of the
    /// previously waiting requests, preserving overall FIFO order.
    pub fn clear_and_suspend(self: &Arc<Self>) {
        let mut guard = self.core.lock().expect("poisoned");
        let core = &mut *guard;
        for ns in core.servers.drain(..) {
            ns.stop_tasks();
        }
        core.good_servers = 0;
        core.cursor = 0;
        let inflight: Vec<Request> = core.inflight.drain(..).collect();
        for mut req in inflight.into_iter().rev() {
            req.disarm_timeout();
            req.xid = UNASSIGNED_ID;
            req.ns = None;
            req.tx_count = 0;
            req.reissue_count = 0;
            req.transmit_me = false;
            core.waiting.push_front(req);
        }
    }

    /// Starts promoting waiting requests again after a suspend.
    pub fn resume(self: &Arc<Self>) {
        let mut guard = self.core.lock().expect("poisoned");
        self.pump(&mut guard);
    }

    /// Tears the resolver down.
    ///
    /// Pending requests complete with [`Error::Shutdown`] if
    /// `fail_requests` is set and are silently discarded otherwise.
    pub fn shutdown(self: &Arc<Self>, fail_requests: bool) {
        let mut guard = self.core.lock().expect("poisoned");
        let core = &mut *guard;
        core.shut_down = true;
        let pending: Vec<Request> = core
            .inflight
            .drain(..)
            .chain(core.waiting.drain(..))
            .collect();
        for mut req in pending {
            req.disarm_timeout();
            if let Some(Completion::User(tx)) = req.done.take() {
                if fail_requests {
                    let _ = tx.send(Err(Error::Shutdown));
                }
            }
        }
        for ns in core.servers.drain(..) {
            ns.stop_tasks();
        }
        core.good_servers = 0;
        core.search = Arc::new(SearchState::new());
    }
}

impl Default for ResolverInner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ResolverInner {
    fn drop(&mut self) {
        if let Ok(core) = self.core.get_mut() {
            for ns in core.servers.drain(..) {
                ns.stop_tasks();
            }
            for req in core.inflight.iter_mut() {
                req.disarm_timeout();
            }
        }
    }
}

//------------ recv_loop -----------------------------------------------------

/// Drains a nameserver's socket for as long as the resolver lives.
async fn recv_loop(weak: WeakInner, ns: Arc<Nameserver>) {
    let mut buf = [0u8; MAX_PACKET];
    loop {
        match ns.socket.recv(&mut buf).await {
            Ok(len) => {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                inner.process_datagram(&ns, &buf[..len]);
            }
            Err(err) => {
                // Likely an ICMP unreachable bounced back by the kernel.
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                let mut guard = inner.core.lock().expect("poisoned");
                inner.fail_server(&mut guard, &ns, &err.to_string());
            }
        }
    }
}

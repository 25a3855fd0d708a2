use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::buffer::Buffer;
use super::event::{Event, EventPayload};
use super::query::Query;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PadDirection {
    Src,
    Sink,
}

/// Anything that travels downstream with the data: buffers, events and
/// serialized queries.
#[derive(Clone, Debug, PartialEq)]
pub enum FlowItem {
    Buffer(Buffer),
    Event(Event),
    Query(Query),
}

impl FlowItem {
    pub fn kind(&self) -> &'static str {
        match self {
            FlowItem::Buffer(_) => "buffer",
            FlowItem::Event(event) => event.kind(),
            FlowItem::Query(_) => "query",
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            FlowItem::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn is_flush(&self) -> bool {
        self.as_event().is_some_and(Event::is_flush)
    }
}

pub type ProbeId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeVerdict {
    Pass,
    Drop,
}

type ProbeFn = Arc<dyn Fn(&Arc<Pad>, &mut FlowItem) -> ProbeVerdict + Send + Sync>;
type ChainFn = Arc<dyn Fn(&Arc<Pad>, FlowItem) + Send + Sync>;
type EventFn = Arc<dyn Fn(&Arc<Pad>, Event) -> bool + Send + Sync>;
type QueryFn = Arc<dyn Fn(&Arc<Pad>, &mut Query) -> bool + Send + Sync>;
type FilterFn = Arc<dyn Fn(&Arc<Pad>, FlowItem) -> Option<FlowItem> + Send + Sync>;

#[derive(Default)]
struct PadLinks {
    peer: Weak<Pad>,
    /// Ghost-pad target: where this pad proxies to/from.
    target: Option<Arc<Pad>>,
    /// Back-pointer: the ghost pad this pad is the current target of.
    ghost: Weak<Pad>,
    active: bool,
    /// Seek stashed while the pad had no target to forward it to.
    pending_seek: Option<Event>,
}

/// A connection point in the stream graph.
///
/// Pads carry data downstream (`push`) and events/queries upstream
/// (`send_event`, `query`). Ghosting is expressed with a `target`: items
/// leaving the target surface on the ghost, and upstream traffic entering
/// the ghost descends into the target. Probes observe and may drop or
/// rewrite anything passing through; translation hooks (`set_filter`)
/// rewrite items in place as they cross an object boundary.
pub struct Pad {
    name: String,
    direction: PadDirection,
    links: Mutex<PadLinks>,
    probes: Mutex<Vec<(ProbeId, ProbeFn)>>,
    next_probe_id: AtomicU64,
    chain_fn: Mutex<Option<ChainFn>>,
    event_fn: Mutex<Option<EventFn>>,
    query_fn: Mutex<Option<QueryFn>>,
    filter_fn: Mutex<Option<FilterFn>>,
}

impl fmt::Debug for Pad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pad")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .finish_non_exhaustive()
    }
}

impl Pad {
    pub fn new(name: impl Into<String>, direction: PadDirection) -> Arc<Pad> {
        Arc::new(Pad {
            name: name.into(),
            direction,
            links: Mutex::new(PadLinks {
                active: true,
                ..PadLinks::default()
            }),
            probes: Mutex::new(Vec::new()),
            next_probe_id: AtomicU64::new(1),
            chain_fn: Mutex::new(None),
            event_fn: Mutex::new(None),
            query_fn: Mutex::new(None),
            filter_fn: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> PadDirection {
        self.direction
    }

    pub fn is_active(&self) -> bool {
        self.links.lock().active
    }

    pub fn set_active(&self, active: bool) {
        self.links.lock().active = active;
    }

    pub fn peer(&self) -> Option<Arc<Pad>> {
        self.links.lock().peer.upgrade()
    }

    pub fn target(&self) -> Option<Arc<Pad>> {
        self.links.lock().target.clone()
    }

    pub fn is_linked(&self) -> bool {
        self.peer().is_some()
    }

    /// Link a src pad to a sink pad.
    pub fn link(src: &Arc<Pad>, sink: &Arc<Pad>) {
        debug_assert_eq!(src.direction, PadDirection::Src);
        debug_assert_eq!(sink.direction, PadDirection::Sink);
        src.links.lock().peer = Arc::downgrade(sink);
        sink.links.lock().peer = Arc::downgrade(src);
        trace!(src = src.name, sink = sink.name, "linked pads");
    }

    pub fn unlink(&self) {
        if let Some(peer) = self.peer() {
            peer.links.lock().peer = Weak::new();
        }
        self.links.lock().peer = Weak::new();
    }

    /// Point a ghost pad at a new target (or clear it). Setting a target
    /// flushes any seek stashed while the pad was targetless.
    pub fn set_target(self: &Arc<Pad>, target: Option<Arc<Pad>>) {
        let pending = {
            let mut links = self.links.lock();
            if let Some(old) = links.target.take() {
                old.links.lock().ghost = Weak::new();
            }
            match target {
                Some(target) => {
                    target.links.lock().ghost = Arc::downgrade(self);
                    links.target = Some(target);
                    links.pending_seek.take()
                }
                None => {
                    links.pending_seek = None;
                    None
                }
            }
        };
        if let Some(seek) = pending {
            trace!(pad = self.name, "pushing stashed seek into new target");
            self.send_event(seek);
        }
    }

    pub fn stash_pending_seek(&self, event: Event) {
        self.links.lock().pending_seek = Some(event);
    }

    pub fn add_probe(
        &self,
        probe: impl Fn(&Arc<Pad>, &mut FlowItem) -> ProbeVerdict + Send + Sync + 'static,
    ) -> ProbeId {
        let id = self.next_probe_id.fetch_add(1, Ordering::Relaxed);
        self.probes.lock().push((id, Arc::new(probe)));
        id
    }

    pub fn remove_probe(&self, id: ProbeId) {
        self.probes.lock().retain(|(probe_id, _)| *probe_id != id);
    }

    pub fn set_chain(&self, chain: impl Fn(&Arc<Pad>, FlowItem) + Send + Sync + 'static) {
        *self.chain_fn.lock() = Some(Arc::new(chain));
    }

    pub fn set_event_handler(
        &self,
        handler: impl Fn(&Arc<Pad>, Event) -> bool + Send + Sync + 'static,
    ) {
        *self.event_fn.lock() = Some(Arc::new(handler));
    }

    pub fn set_query_handler(
        &self,
        handler: impl Fn(&Arc<Pad>, &mut Query) -> bool + Send + Sync + 'static,
    ) {
        *self.query_fn.lock() = Some(Arc::new(handler));
    }

    /// Install the downstream rewrite hook run on every item crossing this
    /// pad, before probes see it.
    pub fn set_filter(
        &self,
        filter: impl Fn(&Arc<Pad>, FlowItem) -> Option<FlowItem> + Send + Sync + 'static,
    ) {
        *self.filter_fn.lock() = Some(Arc::new(filter));
    }

    /// Push an item downstream through this pad.
    pub fn push(self: &Arc<Pad>, item: FlowItem) -> bool {
        if !self.is_active() {
            trace!(pad = self.name, kind = item.kind(), "inactive pad, dropping");
            return false;
        }

        let mut item = item;
        if let Some(filter) = self.filter_fn.lock().clone() {
            match filter(self, item) {
                Some(rewritten) => item = rewritten,
                None => return false,
            }
        }

        let probes: Vec<ProbeFn> = self
            .probes
            .lock()
            .iter()
            .map(|(_, probe)| Arc::clone(probe))
            .collect();
        for probe in probes {
            if probe(self, &mut item) == ProbeVerdict::Drop {
                trace!(pad = self.name, kind = item.kind(), "probe dropped item");
                return false;
            }
        }

        if let Some(chain) = self.chain_fn.lock().clone() {
            chain(self, item);
            return true;
        }

        let (target, ghost, peer) = {
            let links = self.links.lock();
            (links.target.clone(), links.ghost.upgrade(), links.peer.upgrade())
        };
        match self.direction {
            // Sink side: descend into the ghost target (the wrapped
            // element's real sink).
            PadDirection::Sink => {
                if let Some(target) = target {
                    return target.push(item);
                }
            }
            // Src side: surface on the ghost that proxies us, else cross
            // the link.
            PadDirection::Src => {
                if let Some(ghost) = ghost {
                    return ghost.push(item);
                }
                if let Some(peer) = peer {
                    return peer.push(item);
                }
            }
        }

        trace!(pad = self.name, kind = item.kind(), "unlinked pad, dropping");
        false
    }

    /// Send an event upstream into this pad.
    pub fn send_event(self: &Arc<Pad>, event: Event) -> bool {
        if let Some(handler) = self.event_fn.lock().clone() {
            return handler(self, event);
        }
        self.route_event_upstream(event)
    }

    /// Default upstream routing, also used by custom event handlers after
    /// they have rewritten the event.
    pub fn route_event_upstream(self: &Arc<Pad>, event: Event) -> bool {
        let (target, ghost, peer) = {
            let links = self.links.lock();
            (links.target.clone(), links.ghost.upgrade(), links.peer.upgrade())
        };
        match self.direction {
            PadDirection::Src => {
                if let Some(target) = target {
                    return target.send_event(event);
                }
                if let EventPayload::Seek(_) = event.payload {
                    trace!(pad = self.name, "no target yet, stashing seek");
                    self.stash_pending_seek(event);
                    return true;
                }
            }
            PadDirection::Sink => {
                if let Some(ghost) = ghost {
                    return ghost.send_event(event);
                }
                if let Some(peer) = peer {
                    return peer.send_event(event);
                }
            }
        }
        warn!(pad = self.name, kind = event.kind(), "upstream event had nowhere to go");
        false
    }

    /// Run a query against this pad (upstream direction).
    pub fn query(self: &Arc<Pad>, query: &mut Query) -> bool {
        if let Some(handler) = self.query_fn.lock().clone() {
            return handler(self, query);
        }
        self.route_query_upstream(query)
    }

    pub fn route_query_upstream(self: &Arc<Pad>, query: &mut Query) -> bool {
        let (target, ghost, peer) = {
            let links = self.links.lock();
            (links.target.clone(), links.ghost.upgrade(), links.peer.upgrade())
        };
        match self.direction {
            PadDirection::Src => {
                if let Some(target) = target {
                    return target.query(query);
                }
            }
            PadDirection::Sink => {
                if let Some(ghost) = ghost {
                    return ghost.query(query);
                }
                if let Some(peer) = peer {
                    return peer.query(query);
                }
            }
        }
        false
    }

    /// Query the downstream peer of this (src) pad.
    pub fn peer_query(self: &Arc<Pad>, query: &mut Query) -> bool {
        match self.peer() {
            Some(peer) => peer.query(query),
            None => false,
        }
    }
}

//! Pending-request and ready-LLE queues kept by every quantum node.
//!
//! Both containers are per-port FIFOs with OLDEST/YOUNGEST pop policies and
//! lookup by flow or LLE identity. `RequestQueue` additionally supports a
//! cross-port view: when no port is given, entries from all ports are treated
//! as one FIFO ordered by insertion time, ties broken by insertion order.

use std::cell::RefCell;
use std::rc::Rc;

use crate::config::FlowId;
use crate::messages::{EntanglementGenPacket, EntanglementRequestPacket, LleId, SimTime};

/// Which end of a FIFO a scan starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PopPolicy {
    #[default]
    Oldest,
    Youngest,
}

#[derive(Debug)]
struct ReqEntry {
    req: EntanglementRequestPacket,
    time: SimTime,
    seq: u64,
}

/// Per-out-port FIFOs of requests waiting for an LLE.
#[derive(Debug, Default)]
pub struct RequestQueue {
    ports: Vec<(&'static str, Vec<ReqEntry>)>,
    next_seq: u64,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue::default()
    }

    fn port_mut(&mut self, out_port: &'static str) -> &mut Vec<ReqEntry> {
        if let Some(idx) = self.ports.iter().position(|(p, _)| *p == out_port) {
            &mut self.ports[idx].1
        } else {
            self.ports.push((out_port, Vec::new()));
            let last = self.ports.len() - 1;
            &mut self.ports[last].1
        }
    }

    /// Append a request to the FIFO of `out_port`.
    pub fn add_request(
        &mut self,
        req: EntanglementRequestPacket,
        out_port: &'static str,
        time: SimTime,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.port_mut(out_port).push(ReqEntry { req, time, seq });
    }

    /// Locate the first matching entry under `policy`, scanning one port or
    /// the merged cross-port FIFO.
    fn find(
        &self,
        out_port: Option<&str>,
        policy: PopPolicy,
        matches: impl Fn(&EntanglementRequestPacket) -> bool,
    ) -> Option<(usize, usize)> {
        let mut best: Option<(usize, usize, SimTime, u64)> = None;
        for (pi, (port, entries)) in self.ports.iter().enumerate() {
            if out_port.is_some_and(|p| p != *port) {
                continue;
            }
            let found = match policy {
                PopPolicy::Oldest => entries.iter().position(|e| matches(&e.req)),
                PopPolicy::Youngest => entries.iter().rposition(|e| matches(&e.req)),
            };
            if let Some(ei) = found {
                let key = (entries[ei].time, entries[ei].seq);
                let better = match (&best, policy) {
                    (None, _) => true,
                    (Some((_, _, t, s)), PopPolicy::Oldest) => key < (*t, *s),
                    (Some((_, _, t, s)), PopPolicy::Youngest) => key > (*t, *s),
                };
                if better {
                    best = Some((pi, ei, key.0, key.1));
                }
            }
        }
        best.map(|(pi, ei, _, _)| (pi, ei))
    }

    /// Remove and return the first request of `flow_id` under `policy`.
    pub fn pop_request(
        &mut self,
        flow_id: FlowId,
        out_port: Option<&str>,
        policy: PopPolicy,
    ) -> Option<(EntanglementRequestPacket, SimTime)> {
        let (pi, ei) = self.find(out_port, policy, |r| r.flow_id == flow_id)?;
        let entry = self.ports[pi].1.remove(ei);
        Some((entry.req, entry.time))
    }

    /// Remove and return the request bound to the given LLE.
    pub fn pop_from_lle(&mut self, lle_id: &LleId) -> Option<(EntanglementRequestPacket, SimTime)> {
        let (pi, ei) = self.find(None, PopPolicy::Oldest, |r| {
            r.lle_id.as_ref() == Some(lle_id)
        })?;
        let entry = self.ports[pi].1.remove(ei);
        Some((entry.req, entry.time))
    }

    /// Non-destructive counterpart of [`pop_request`]; `flow_id` is optional.
    pub fn peek_request(
        &self,
        flow_id: Option<FlowId>,
        out_port: Option<&str>,
        policy: PopPolicy,
    ) -> Option<(&EntanglementRequestPacket, SimTime)> {
        let (pi, ei) = self.find(out_port, policy, |r| {
            flow_id.is_none_or(|f| r.flow_id == f)
        })?;
        let entry = &self.ports[pi].1[ei];
        Some((&entry.req, entry.time))
    }

    /// Purge every request of the given flow.
    pub fn delete_requests(&mut self, flow_id: FlowId) {
        for (_, entries) in &mut self.ports {
            entries.retain(|e| e.req.flow_id != flow_id);
        }
    }

    /// Number of queued requests, optionally restricted by flow and/or port.
    pub fn length(&self, flow_id: Option<FlowId>, out_port: Option<&str>) -> usize {
        self.ports
            .iter()
            .filter(|(p, _)| out_port.is_none_or(|q| q == *p))
            .map(|(_, entries)| {
                entries
                    .iter()
                    .filter(|e| flow_id.is_none_or(|f| e.req.flow_id == f))
                    .count()
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.length(None, None)
    }

    pub fn is_empty(&self, flow_id: Option<FlowId>, out_port: Option<&str>) -> bool {
        self.length(flow_id, out_port) == 0
    }

    /// Queue depth used by the AQM sampler.
    ///
    /// Per-request weights are currently uniform, so this is the plain count
    /// on `out_port` as a float.
    pub fn weighted_length(&self, out_port: &str) -> f64 {
        self.length(None, Some(out_port)) as f64
    }
}

/// Read-only view of a node's request queue, handed to the adjacent link
/// controller at wiring time. Stands in for an instantaneous, always-fresh
/// queue report.
#[derive(Clone)]
pub struct QueueView {
    inner: Rc<RefCell<RequestQueue>>,
}

impl QueueView {
    pub fn new(inner: Rc<RefCell<RequestQueue>>) -> Self {
        QueueView { inner }
    }

    pub fn length(&self) -> usize {
        self.inner.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    /// Flow id of the oldest request queued on `out_port`, if any.
    pub fn peek_oldest(&self, out_port: &str) -> Option<(FlowId, SimTime)> {
        self.inner
            .borrow()
            .peek_request(None, Some(out_port), PopPolicy::Oldest)
            .map(|(req, time)| (req.flow_id, time))
    }
}

#[derive(Debug)]
struct LleEntry {
    lle: EntanglementGenPacket,
    time: SimTime,
}

/// Per-port FIFOs of link-level entangled pairs ready for swapping.
#[derive(Debug)]
pub struct LLEManager {
    ports: Vec<(&'static str, Vec<LleEntry>)>,
}

impl LLEManager {
    pub fn new(port_names: &[&'static str]) -> Self {
        LLEManager {
            ports: port_names.iter().map(|p| (*p, Vec::new())).collect(),
        }
    }

    fn port(&self, port_name: &str) -> &[LleEntry] {
        self.ports
            .iter()
            .find(|(p, _)| *p == port_name)
            .map(|(_, e)| e.as_slice())
            .unwrap_or(&[])
    }

    fn port_mut(&mut self, port_name: &str) -> Option<&mut Vec<LleEntry>> {
        self.ports
            .iter_mut()
            .find(|(p, _)| *p == port_name)
            .map(|(_, e)| e)
    }

    pub fn add_lle(&mut self, lle: EntanglementGenPacket, port_name: &'static str, time: SimTime) {
        match self.port_mut(port_name) {
            Some(entries) => entries.push(LleEntry { lle, time }),
            None => self.ports.push((port_name, vec![LleEntry { lle, time }])),
        }
    }

    /// Remove and return the LLE the given request is bound to.
    pub fn pop_from_req(
        &mut self,
        req: &EntanglementRequestPacket,
    ) -> Option<(EntanglementGenPacket, SimTime)> {
        let lle_id = req.lle_id.as_ref()?;
        for (_, entries) in &mut self.ports {
            if let Some(i) = entries
                .iter()
                .position(|e| e.lle.flow_id == req.flow_id && e.lle.lle_id == *lle_id)
            {
                let entry = entries.remove(i);
                return Some((entry.lle, entry.time));
            }
        }
        None
    }

    /// Non-destructive counterpart of [`pop_from_req`].
    pub fn peek_from_req(
        &self,
        req: &EntanglementRequestPacket,
    ) -> Option<(&EntanglementGenPacket, SimTime)> {
        let lle_id = req.lle_id.as_ref()?;
        for (_, entries) in &self.ports {
            if let Some(e) = entries
                .iter()
                .find(|e| e.lle.flow_id == req.flow_id && e.lle.lle_id == *lle_id)
            {
                return Some((&e.lle, e.time));
            }
        }
        None
    }

    fn find_on_port(
        &self,
        port_name: &str,
        flow_id: Option<FlowId>,
        owner_only: bool,
        policy: PopPolicy,
    ) -> Option<usize> {
        let matches = |e: &LleEntry| {
            flow_id.is_none_or(|f| e.lle.flow_id == f) && (!owner_only || e.lle.owner)
        };
        let entries = self.port(port_name);
        match policy {
            PopPolicy::Oldest => entries.iter().position(matches),
            PopPolicy::Youngest => entries.iter().rposition(matches),
        }
    }

    /// Remove an LLE available on `port_name` under `policy`, optionally
    /// restricted to one flow and/or to owned entries.
    pub fn pop_lle(
        &mut self,
        port_name: &str,
        flow_id: Option<FlowId>,
        owner_only: bool,
        policy: PopPolicy,
    ) -> Option<(EntanglementGenPacket, SimTime)> {
        let i = self.find_on_port(port_name, flow_id, owner_only, policy)?;
        let entry = self.port_mut(port_name)?.remove(i);
        Some((entry.lle, entry.time))
    }

    /// Non-destructive counterpart of [`pop_lle`].
    pub fn peek_lle(
        &self,
        port_name: &str,
        flow_id: Option<FlowId>,
        owner_only: bool,
        policy: PopPolicy,
    ) -> Option<(&EntanglementGenPacket, SimTime)> {
        let i = self.find_on_port(port_name, flow_id, owner_only, policy)?;
        let entry = &self.port(port_name)[i];
        Some((&entry.lle, entry.time))
    }

    /// Purge every LLE of the given flow.
    pub fn delete_lles(&mut self, flow_id: FlowId) {
        for (_, entries) in &mut self.ports {
            entries.retain(|e| e.lle.flow_id != flow_id);
        }
    }

    pub fn is_empty(&self, port_name: &str, flow_id: Option<FlowId>) -> bool {
        self.port(port_name)
            .iter()
            .filter(|e| flow_id.is_none_or(|f| e.lle.flow_id == f))
            .count()
            == 0
    }

    pub fn len(&self) -> usize {
        self.ports.iter().map(|(_, e)| e.len()).sum()
    }

    pub fn length(&self, port_name: &str) -> usize {
        self.port(port_name).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Direction;
    use crate::qstate::WernerState;

    fn req(flow_id: FlowId, req_id: u64, lle: Option<LleId>) -> EntanglementRequestPacket {
        EntanglementRequestPacket {
            destination: "qn1".into(),
            req_id,
            flow_id,
            lle_id: lle,
            gen_time: 0.0,
            wait_times: Vec::new(),
            direction: Direction::Upstream,
            success_probs: vec![1.0],
            congested: false,
            qstate: WernerState::with_fidelity(1.0),
            src_decoherence_rate: 0.0,
        }
    }

    fn lle(flow_id: FlowId, seq: u64, owner: bool) -> EntanglementGenPacket {
        EntanglementGenPacket {
            flow_id,
            lle_id: LleId::new("lc0", seq),
            sender_name: "lc0".into(),
            owner,
        }
    }

    #[test]
    fn fifo_order_per_port() {
        let mut q = RequestQueue::new();
        q.add_request(req(0, 0, None), "q1", 1.0);
        q.add_request(req(0, 1, None), "q1", 2.0);
        q.add_request(req(0, 2, None), "q1", 3.0);

        let (oldest, t) = q.pop_request(0, Some("q1"), PopPolicy::Oldest).unwrap();
        assert_eq!((oldest.req_id, t), (0, 1.0));
        let (youngest, t) = q.pop_request(0, Some("q1"), PopPolicy::Youngest).unwrap();
        assert_eq!((youngest.req_id, t), (2, 3.0));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn cross_port_pop_takes_global_oldest() {
        let mut q = RequestQueue::new();
        q.add_request(req(0, 0, None), "q1", 5.0);
        q.add_request(req(0, 1, None), "q0", 2.0);

        let (popped, _) = q.pop_request(0, None, PopPolicy::Oldest).unwrap();
        assert_eq!(popped.req_id, 1);
        // removed from its true port
        assert_eq!(q.length(None, Some("q0")), 0);
        assert_eq!(q.length(None, Some("q1")), 1);
    }

    #[test]
    fn equal_timestamps_tie_break_on_insertion_order() {
        let mut q = RequestQueue::new();
        q.add_request(req(0, 10, None), "q1", 4.0);
        q.add_request(req(0, 11, None), "q0", 4.0);

        let (first, _) = q.pop_request(0, None, PopPolicy::Oldest).unwrap();
        assert_eq!(first.req_id, 10);
        let (second, _) = q.pop_request(0, None, PopPolicy::Oldest).unwrap();
        assert_eq!(second.req_id, 11);
    }

    #[test]
    fn pop_skips_other_flows() {
        let mut q = RequestQueue::new();
        q.add_request(req(7, 0, None), "q1", 1.0);
        q.add_request(req(3, 0, None), "q1", 2.0);

        let (popped, _) = q.pop_request(3, Some("q1"), PopPolicy::Oldest).unwrap();
        assert_eq!(popped.flow_id, 3);
        assert!(q.pop_request(3, Some("q1"), PopPolicy::Oldest).is_none());
    }

    #[test]
    fn pop_from_lle_matches_binding() {
        let mut q = RequestQueue::new();
        let id = LleId::new("lc0", 9);
        q.add_request(req(0, 0, None), "q1", 1.0);
        q.add_request(req(0, 1, Some(id.clone())), "q1", 2.0);

        let (popped, _) = q.pop_from_lle(&id).unwrap();
        assert_eq!(popped.req_id, 1);
        assert!(q.pop_from_lle(&id).is_none());
    }

    #[test]
    fn peek_does_not_remove() {
        let mut q = RequestQueue::new();
        q.add_request(req(0, 0, None), "q1", 1.0);
        assert!(q.peek_request(Some(0), None, PopPolicy::Oldest).is_some());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn delete_purges_flow() {
        let mut q = RequestQueue::new();
        q.add_request(req(0, 0, None), "q1", 1.0);
        q.add_request(req(1, 0, None), "q0", 2.0);
        q.delete_requests(0);
        assert_eq!(q.length(Some(0), None), 0);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn length_sums_ports() {
        let mut q = RequestQueue::new();
        q.add_request(req(0, 0, None), "q1", 1.0);
        q.add_request(req(0, 1, None), "q0", 1.0);
        q.add_request(req(1, 0, None), "q0", 1.0);
        assert_eq!(
            q.len(),
            q.length(None, Some("q0")) + q.length(None, Some("q1"))
        );
        assert!(!q.is_empty(None, None));
        assert_eq!(q.weighted_length("q0"), 2.0);
    }

    #[test]
    fn lle_owner_filter() {
        let mut m = LLEManager::new(&["q0", "q1"]);
        m.add_lle(lle(0, 0, false), "q1", 1.0);
        m.add_lle(lle(0, 1, true), "q1", 2.0);
        m.add_lle(lle(0, 2, false), "q1", 3.0);

        let (owned, _) = m.pop_lle("q1", Some(0), true, PopPolicy::Youngest).unwrap();
        assert!(owned.owner);
        assert_eq!(owned.lle_id.seq, 1);
        assert!(m.pop_lle("q1", Some(0), true, PopPolicy::Youngest).is_none());
        assert_eq!(m.length("q1"), 2);
    }

    #[test]
    fn lle_pop_policies() {
        let mut m = LLEManager::new(&["q0", "q1"]);
        m.add_lle(lle(0, 0, true), "q0", 1.0);
        m.add_lle(lle(0, 1, true), "q0", 2.0);

        let (oldest, _) = m.peek_lle("q0", None, false, PopPolicy::Oldest).unwrap();
        assert_eq!(oldest.lle_id.seq, 0);
        let (youngest, _) = m.pop_lle("q0", None, false, PopPolicy::Youngest).unwrap();
        assert_eq!(youngest.lle_id.seq, 1);
    }

    #[test]
    fn lle_consumed_at_most_once() {
        let mut m = LLEManager::new(&["q0", "q1"]);
        m.add_lle(lle(0, 5, true), "q1", 1.0);
        let mut r = req(0, 0, Some(LleId::new("lc0", 5)));

        assert!(m.peek_from_req(&r).is_some());
        assert!(m.pop_from_req(&r).is_some());
        assert!(m.pop_from_req(&r).is_none());
        assert!(m.peek_from_req(&r).is_none());

        r.lle_id = None;
        assert!(m.pop_from_req(&r).is_none());
    }

    #[test]
    fn lle_delete_purges_flow() {
        let mut m = LLEManager::new(&["q0", "q1"]);
        m.add_lle(lle(0, 0, true), "q0", 1.0);
        m.add_lle(lle(4, 1, true), "q1", 1.0);
        m.delete_lles(4);
        assert!(m.is_empty("q1", None));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn queue_view_reads_through() {
        let q = Rc::new(RefCell::new(RequestQueue::new()));
        let view = QueueView::new(q.clone());
        assert!(view.is_empty());

        q.borrow_mut().add_request(req(2, 0, None), "q1", 3.0);
        assert_eq!(view.length(), 1);
        assert_eq!(view.peek_oldest("q1"), Some((2, 3.0)));
        assert_eq!(view.peek_oldest("q0"), None);
    }
}

// portal.rs — Timed control messages between work units
//
// A portal holds a set of receivers. Sending a message resolves, for each
// receiver, whether it lies downstream or upstream of the sender, and turns
// the requested latency into the exact point in the receiver's own execution
// sequence at which the message must be handled.
//
// Preconditions: the latency graph was built for the program that owns the
//                sender and receivers.
// Postconditions: every accepted message sits in its receiver's queue keyed
//                 by (delivery index, send order).
// Failure modes: InvalidLatency, NoRelationship, NoPath, MissedDelivery.
// Side effects: none.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::diag::{Result, ScheduleError};
use crate::latency::LatencyGraph;
use crate::sdep::SdepData;
use crate::stream::StreamGraph;
use crate::topology::WorkUnit;

/// Identifies a message handler on the receiving unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandlerId(pub u32);

/// Requested latency, in sender executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencyWindow {
    pub min: u64,
    pub max: u64,
}

impl LatencyWindow {
    pub fn new(min: u64, max: u64) -> Result<Self> {
        if min > max {
            return Err(ScheduleError::InvalidLatency { min, max });
        }
        Ok(LatencyWindow { min, max })
    }

    /// Exactly `latency` executions.
    pub fn exact(latency: u64) -> Self {
        LatencyWindow {
            min: latency,
            max: latency,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Downstream,
    Upstream,
}

/// How one receiver relates to a sender.
#[derive(Debug, Clone)]
pub struct Route {
    pub receiver: WorkUnit,
    pub direction: MessageDirection,
    /// Oriented upstream → downstream.
    pub sdep: SdepData,
}

/// Routes from one sender to every registered receiver.
#[derive(Debug, Clone, Default)]
pub struct SdepInfo {
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub seq: u64,
    pub sender: WorkUnit,
    pub receiver: WorkUnit,
    pub handler: HandlerId,
    pub args: serde_json::Value,
    pub window: LatencyWindow,
    pub direction: MessageDirection,
    /// The message is handled once the receiver has completed exactly this
    /// many executions, before it starts the next one.
    pub delivery: u64,
}

/// Pending messages of one receiver, in delivery order.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    receiver: String,
    pending: BTreeMap<(u64, u64), Message>,
}

impl MessageQueue {
    fn new(receiver: String) -> Self {
        MessageQueue {
            receiver,
            pending: BTreeMap::new(),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.pending.insert((message.delivery, message.seq), message);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn next_delivery(&self) -> Option<u64> {
        self.pending.keys().next().map(|&(delivery, _)| delivery)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.pending.values()
    }

    /// Remove the messages due after `completed` executions, in send order.
    pub fn take_due(&mut self, completed: u64) -> Result<Vec<Message>> {
        if let Some(due) = self.next_delivery() {
            if due < completed {
                return Err(ScheduleError::MissedDelivery {
                    receiver: self.receiver.clone(),
                    due,
                    current: completed,
                });
            }
        }
        let mut due = Vec::new();
        while let Some(entry) = self.pending.first_entry() {
            if entry.key().0 != completed {
                break;
            }
            due.push(entry.remove());
        }
        Ok(due)
    }
}

/// Message dispatcher for one compiled program.
pub struct Portal<'a> {
    graph: &'a StreamGraph,
    latency: &'a LatencyGraph,
    receivers: Vec<WorkUnit>,
    queues: HashMap<WorkUnit, MessageQueue>,
    cache: HashMap<WorkUnit, SdepInfo>,
    next_seq: u64,
}

impl<'a> Portal<'a> {
    pub fn new(graph: &'a StreamGraph, latency: &'a LatencyGraph) -> Self {
        Portal {
            graph,
            latency,
            receivers: Vec::new(),
            queues: HashMap::new(),
            cache: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Add a receiver. Cached routes no longer cover every receiver, so the
    /// cache is dropped.
    pub fn register(&mut self, receiver: WorkUnit) -> Result<()> {
        self.latency.node_index(receiver)?;
        if !self.receivers.contains(&receiver) {
            self.receivers.push(receiver);
            self.queues
                .insert(receiver, MessageQueue::new(receiver.name(self.graph)));
            self.cache.clear();
        }
        Ok(())
    }

    pub fn receivers(&self) -> &[WorkUnit] {
        &self.receivers
    }

    pub fn queue(&self, receiver: WorkUnit) -> Option<&MessageQueue> {
        self.queues.get(&receiver)
    }

    /// Routes from `sender` to every receiver, computed once per sender.
    pub fn routes(&mut self, sender: WorkUnit) -> Result<&SdepInfo> {
        if !self.cache.contains_key(&sender) {
            let mut info = SdepInfo::default();
            for &receiver in &self.receivers {
                let route = if self.latency.is_downstream_path(sender, receiver)? {
                    Route {
                        receiver,
                        direction: MessageDirection::Downstream,
                        sdep: self.latency.compute_sdep(sender, receiver)?,
                    }
                } else if self.latency.is_upstream_path(sender, receiver)? {
                    Route {
                        receiver,
                        direction: MessageDirection::Upstream,
                        sdep: self.latency.compute_sdep(receiver, sender)?,
                    }
                } else {
                    return Err(ScheduleError::NoRelationship {
                        sender: sender.name(self.graph),
                        receiver: receiver.name(self.graph),
                    });
                };
                info.routes.push(route);
            }
            self.cache.insert(sender, info);
        }
        self.cache
            .get(&sender)
            .ok_or_else(|| ScheduleError::internal("route cache lost an entry"))
    }

    /// Send a message from `sender`, which has completed `sender_executions`
    /// executions, to every receiver. Returns the accepted messages.
    pub fn send(
        &mut self,
        sender: WorkUnit,
        sender_executions: u64,
        handler: HandlerId,
        args: serde_json::Value,
        window: LatencyWindow,
    ) -> Result<Vec<Message>> {
        if window.min > window.max {
            return Err(ScheduleError::InvalidLatency {
                min: window.min,
                max: window.max,
            });
        }
        let target = sender_executions + window.max + 1;
        let graph = self.graph;
        let routes = self.routes(sender)?.routes.clone();

        let mut sent = Vec::with_capacity(routes.len());
        for route in routes {
            let delivery = match route.direction {
                MessageDirection::Downstream => route
                    .sdep
                    .dst_for_src(target)
                    .map(|n| n.saturating_sub(1))
                    .ok_or_else(|| ScheduleError::NoPath {
                        upstream: sender.name(graph),
                        downstream: route.receiver.name(graph),
                    })?,
                MessageDirection::Upstream => route.sdep.src_for_dst(target),
            };
            let message = Message {
                seq: self.next_seq,
                sender,
                receiver: route.receiver,
                handler,
                args: args.clone(),
                window,
                direction: route.direction,
                delivery,
            };
            self.next_seq += 1;
            debug!(
                sender = %sender.name(graph),
                receiver = %route.receiver.name(graph),
                direction = ?route.direction,
                delivery,
                "message queued"
            );
            let queue = self.queues.get_mut(&route.receiver).ok_or_else(|| {
                ScheduleError::internal(format!(
                    "receiver {} has no queue",
                    route.receiver.name(graph)
                ))
            })?;
            queue.push(message.clone());
            sent.push(message);
        }
        Ok(sent)
    }

    /// Messages `receiver` must handle now that it has completed `completed`
    /// executions.
    pub fn take_due(&mut self, receiver: WorkUnit, completed: u64) -> Result<Vec<Message>> {
        match self.queues.get_mut(&receiver) {
            Some(queue) => queue.take_due(completed),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Joiner, Rate, Splitter, StreamGraphBuilder};
    use crate::topology::Topology;
    use serde_json::json;

    fn program() -> StreamGraph {
        let mut b = StreamGraphBuilder::new();
        let src = b.filter("Src", Rate::new(0, 0, 1));
        let up = b.filter("Up", Rate::new(1, 1, 2));
        let x = b.filter("X", Rate::new(1, 1, 1));
        let y = b.filter("Y", Rate::new(1, 1, 1));
        let sj = b.split_join("SJ", Splitter::Duplicate, Joiner::new(vec![1, 1]), vec![x, y]);
        let sink = b.filter("Sink", Rate::new(1, 1, 0));
        let main = b.pipeline("Main", vec![src, up, sj, sink]);
        b.build(main).unwrap()
    }

    fn unit(g: &StreamGraph, name: &str) -> WorkUnit {
        WorkUnit::find(g, name).unwrap()
    }

    #[test]
    fn downstream_delivery_uses_max_latency() {
        let g = program();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();
        let mut portal = Portal::new(&g, &lat);
        portal.register(unit(&g, "Sink")).unwrap();
        let sent = portal
            .send(
                unit(&g, "Src"),
                3,
                HandlerId(0),
                json!({"gain": 2}),
                LatencyWindow::new(1, 2).unwrap(),
            )
            .unwrap();
        // Each Src execution feeds four Sink executions; Src execution 6
        // first reaches Sink at its 21st.
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].direction, MessageDirection::Downstream);
        assert_eq!(sent[0].delivery, 20);
    }

    #[test]
    fn upstream_delivery_uses_guaranteed_executions() {
        let g = program();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();
        let mut portal = Portal::new(&g, &lat);
        let src = unit(&g, "Src");
        portal.register(src).unwrap();
        let sent = portal
            .send(unit(&g, "Sink"), 4, HandlerId(1), json!(null), LatencyWindow::exact(3))
            .unwrap();
        // Sink execution 8 needs 2 Src executions.
        assert_eq!(sent[0].direction, MessageDirection::Upstream);
        assert_eq!(sent[0].delivery, 2);
        assert_eq!(portal.take_due(src, 2).unwrap().len(), 1);
        assert!(portal.queue(src).unwrap().is_empty());
    }

    #[test]
    fn loop_path_sender_reaches_receiver_after_the_loop() {
        let mut b = StreamGraphBuilder::new();
        let src = b.filter("Src", Rate::new(0, 0, 1));
        let body = b.filter("Body", Rate::new(2, 2, 2));
        let back = b.filter("Back", Rate::new(1, 1, 1));
        let fl = b.feedback_loop(
            "Echo",
            Joiner::new(vec![1, 1]),
            body,
            Splitter::RoundRobin(vec![1, 1]),
            back,
            1,
        );
        let sink = b.filter("Sink", Rate::new(1, 1, 0));
        let main = b.pipeline("Main", vec![src, fl, sink]);
        let g = b.build(main).unwrap();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();
        let mut portal = Portal::new(&g, &lat);
        portal.register(unit(&g, "Sink")).unwrap();
        let sent = portal
            .send(unit(&g, "Back"), 2, HandlerId(0), json!(null), LatencyWindow::exact(1))
            .unwrap();
        // Sink execution n needs n - 1 Back executions, so Back execution 4
        // is first seen by Sink's fifth.
        assert_eq!(sent[0].direction, MessageDirection::Downstream);
        assert_eq!(sent[0].delivery, 4);
    }

    #[test]
    fn sibling_branches_are_unrelated() {
        let g = program();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();
        let mut portal = Portal::new(&g, &lat);
        portal.register(unit(&g, "Y")).unwrap();
        let err = portal
            .send(unit(&g, "X"), 0, HandlerId(0), json!(null), LatencyWindow::exact(0))
            .unwrap_err();
        assert!(matches!(err, ScheduleError::NoRelationship { .. }));
    }

    #[test]
    fn inverted_window_is_rejected() {
        assert!(matches!(
            LatencyWindow::new(4, 1),
            Err(ScheduleError::InvalidLatency { min: 4, max: 1 })
        ));
    }

    #[test]
    fn registering_clears_cached_routes() {
        let g = program();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();
        let mut portal = Portal::new(&g, &lat);
        let src = unit(&g, "Src");
        portal.register(unit(&g, "Sink")).unwrap();
        assert_eq!(portal.routes(src).unwrap().routes.len(), 1);
        portal.register(unit(&g, "X")).unwrap();
        assert_eq!(portal.routes(src).unwrap().routes.len(), 2);
    }

    #[test]
    fn queue_delivers_in_send_order_and_detects_misses() {
        let g = program();
        let lat = LatencyGraph::build(&g, &Topology::build(&g)).unwrap();
        let mut portal = Portal::new(&g, &lat);
        let sink = unit(&g, "Sink");
        let src = unit(&g, "Src");
        portal.register(sink).unwrap();
        for handler in 0..2 {
            portal
                .send(src, 0, HandlerId(handler), json!(handler), LatencyWindow::exact(0))
                .unwrap();
        }
        portal
            .send(src, 4, HandlerId(9), json!(null), LatencyWindow::exact(0))
            .unwrap();
        // Src execution 1 feeds Sink executions 1 through 4: due after 0 completed.
        let due = portal.take_due(sink, 0).unwrap();
        assert_eq!(
            due.iter().map(|m| m.handler).collect::<Vec<_>>(),
            vec![HandlerId(0), HandlerId(1)]
        );
        assert_eq!(portal.queue(sink).unwrap().next_delivery(), Some(16));
        let err = portal.take_due(sink, 20).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::MissedDelivery { due: 16, current: 20, .. }
        ));
    }
}

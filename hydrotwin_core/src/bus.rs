//! Topic-based publish/subscribe message bus.
//!
//! # Delivery model
//!
//! ```text
//!   publish(msg) ──► queue[msg.topic] ──┐
//!                                       │   dispatch()
//!                                       ▼
//!            ┌─────────────────────────────────────────────┐
//!            │ 1. snapshot topics with pending messages    │
//!            │ 2. per topic: take the whole queue          │
//!            │ 3. per message: specific ∪ wildcard subs    │
//!            │    (deduplicated, specific first)           │
//!            │ 4. sink.deliver(sub, msg, outbox)           │
//!            │ 5. absorb outbox (new publishes/subscribes) │
//!            └─────────────────────────────────────────────┘
//! ```
//!
//! The bus never owns agents. It hands each delivery to a [`DeliverySink`]
//! (the kernel's registry), which runs the subscriber's handler and reports
//! the outcome. Anything the handler publishes is buffered in an [`Outbox`]
//! and appended to the queues as soon as the handler returns, so a message
//! aimed at a topic that was already taken in this call waits for the next
//! dispatch.
//!
//! A topic is forgotten once its queue is drained and nobody subscribes to
//! it; publishing to it again starts it over at the end of the dispatch
//! order.

use crate::error::KernelError;
use crate::message::{topics, Message};
use hydrotwin_env::AgentId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Outcome of handing one message to one subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The subscriber's handler ran and returned normally
    Delivered,

    /// The subscriber is not RUNNING (faulted, stopped, not yet set up)
    Skipped,

    /// The handler failed; the subscriber has been moved to FAULT
    Failed(String),
}

/// Receives deliveries on behalf of subscribers.
pub trait DeliverySink {
    /// Delivers `message` to `subscriber`.
    ///
    /// Runtime failures are reported as `Delivery::Failed`. Returning `Err`
    /// is reserved for wiring errors, which abort the dispatch.
    fn deliver(
        &mut self,
        subscriber: &AgentId,
        message: &Message,
        outbox: &mut Outbox,
    ) -> Result<Delivery, KernelError>;
}

#[derive(Debug, Clone, PartialEq)]
enum SubscriptionChange {
    Subscribe(AgentId, String),
    Unsubscribe(AgentId, String),
}

/// Buffered bus operations issued while an agent hook is running.
///
/// Also carries a snapshot of the queue lengths taken when the hook started.
#[derive(Debug, Default)]
pub struct Outbox {
    published: Vec<Message>,
    changes: Vec<SubscriptionChange>,
    queue_lengths: Arc<BTreeMap<String, usize>>,
}

impl Outbox {
    /// Creates an empty outbox with no queue snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a message for publication.
    pub fn publish(&mut self, message: Message) {
        self.published.push(message);
    }

    /// Queues a subscription.
    pub fn subscribe(&mut self, agent: &AgentId, topic: &str) -> Result<(), KernelError> {
        if topic.is_empty() {
            return Err(KernelError::EmptyTopic);
        }
        self.changes
            .push(SubscriptionChange::Subscribe(agent.clone(), topic.to_string()));
        Ok(())
    }

    /// Queues an unsubscription.
    pub fn unsubscribe(&mut self, agent: &AgentId, topic: &str) {
        self.changes
            .push(SubscriptionChange::Unsubscribe(agent.clone(), topic.to_string()));
    }

    /// Pending message counts per topic when the outbox was opened.
    pub fn queue_lengths(&self) -> &BTreeMap<String, usize> {
        &self.queue_lengths
    }

    pub fn is_empty(&self) -> bool {
        self.published.is_empty() && self.changes.is_empty()
    }
}

/// A delivery that failed during dispatch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryFailure {
    pub subscriber: AgentId,
    pub topic: String,
    pub reason: String,
}

/// Summary of one `dispatch()` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    /// Topics taken for processing
    pub topics: usize,

    /// Successful (subscriber, message) deliveries
    pub delivered: usize,

    /// Deliveries skipped because the subscriber was not RUNNING
    pub skipped: usize,

    /// Messages dropped because their topic had no subscribers
    pub discarded: usize,

    /// Failed deliveries, in order of occurrence
    pub failures: Vec<DeliveryFailure>,
}

/// Cumulative bus counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub skipped: u64,
    pub discarded: u64,
    pub delivery_failures: u64,
    pub dispatch_calls: u64,
}

/// Owns subscription tables and per-topic pending queues.
#[derive(Debug, Default)]
pub struct MessageBus {
    /// topic -> subscribers in subscription order (no duplicates)
    subscriptions: HashMap<String, Vec<AgentId>>,

    /// topic -> pending messages in arrival order
    queues: HashMap<String, VecDeque<Message>>,

    /// Topics in order of first publication (dispatch order)
    topic_order: Vec<String>,

    /// Queue lengths shared by outboxes until the next queue change
    snapshot: Option<Arc<BTreeMap<String, usize>>>,

    stats: BusStats,
}

impl MessageBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `agent` under `topic`.
    ///
    /// Idempotent: re-subscribing is not an error and never produces
    /// duplicate delivery. Returns true if the subscription is new.
    pub fn subscribe(&mut self, agent: &AgentId, topic: &str) -> Result<bool, KernelError> {
        if topic.is_empty() {
            return Err(KernelError::EmptyTopic);
        }

        let subscribers = self.subscriptions.entry(topic.to_string()).or_default();
        if subscribers.contains(agent) {
            return Ok(false);
        }

        debug!("{} subscribed to '{}'", agent, topic);
        subscribers.push(agent.clone());
        Ok(true)
    }

    /// Removes `agent` from `topic`. Returns true if it was subscribed.
    pub fn unsubscribe(&mut self, agent: &AgentId, topic: &str) -> bool {
        let Some(subscribers) = self.subscriptions.get_mut(topic) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s != agent);
        let removed = subscribers.len() != before;

        if subscribers.is_empty() {
            self.subscriptions.remove(topic);
        }

        removed
    }

    /// Appends a message to its topic queue. Never inspects subscribers.
    pub fn publish(&mut self, message: Message) {
        let topic = message.topic().to_string();
        if !self.queues.contains_key(&topic) {
            self.topic_order.push(topic.clone());
        }

        self.queues.entry(topic).or_default().push_back(message);
        self.snapshot = None;
        self.stats.published += 1;
    }

    /// Resolves the recipients of a topic: specific subscribers first, then
    /// wildcard subscribers, each at most once.
    pub fn subscribers(&self, topic: &str) -> Vec<AgentId> {
        let mut recipients: Vec<AgentId> = Vec::new();

        let specific = self.subscriptions.get(topic).into_iter().flatten();
        let wildcard = self.subscriptions.get(topics::WILDCARD).into_iter().flatten();

        for agent in specific.chain(wildcard) {
            if !recipients.contains(agent) {
                recipients.push(agent.clone());
            }
        }

        recipients
    }

    /// Delivers every message pending at the start of the call.
    ///
    /// Topics are selected up front. For each, the whole queue is taken at
    /// once and its messages delivered in arrival order. Subscriber failures
    /// are recorded and never interrupt delivery to other subscribers.
    ///
    /// Drained topics without subscribers are pruned afterwards.
    ///
    /// # Errors
    /// Only wiring errors raised by the sink. The message in flight and the
    /// rest of its batch are put back at the front of the topic queue, so
    /// subscribers that already handled the message in flight receive it
    /// again on the next dispatch.
    pub fn dispatch(&mut self, sink: &mut dyn DeliverySink) -> Result<DispatchReport, KernelError> {
        self.stats.dispatch_calls += 1;
        let mut report = DispatchReport::default();

        let pending: Vec<String> = self
            .topic_order
            .iter()
            .filter(|topic| self.queues.get(*topic).is_some_and(|q| !q.is_empty()))
            .cloned()
            .collect();

        for topic in pending {
            let mut batch = match self.queues.get_mut(&topic) {
                Some(queue) => std::mem::take(queue),
                None => continue,
            };
            self.snapshot = None;
            if batch.is_empty() {
                continue;
            }
            report.topics += 1;

            let recipients = self.subscribers(&topic);
            if recipients.is_empty() {
                warn!(
                    "No subscribers for topic '{}', discarding {} message(s)",
                    topic,
                    batch.len()
                );
                report.discarded += batch.len();
                self.stats.discarded += batch.len() as u64;
                continue;
            }

            while let Some(message) = batch.pop_front() {
                for subscriber in &recipients {
                    let mut outbox = self.outbox();
                    let outcome = sink.deliver(subscriber, &message, &mut outbox);
                    self.absorb(outbox);

                    match outcome {
                        Ok(Delivery::Delivered) => {
                            report.delivered += 1;
                            self.stats.delivered += 1;
                        }
                        Ok(Delivery::Skipped) => {
                            report.skipped += 1;
                            self.stats.skipped += 1;
                        }
                        Ok(Delivery::Failed(reason)) => {
                            error!(
                                "Delivery of '{}' to {} failed: {}",
                                topic, subscriber, reason
                            );
                            self.stats.delivery_failures += 1;
                            report.failures.push(DeliveryFailure {
                                subscriber: subscriber.clone(),
                                topic: topic.clone(),
                                reason,
                            });
                        }
                        Err(err) => {
                            batch.push_front(message);
                            self.requeue_front(&topic, batch);
                            return Err(err);
                        }
                    }
                }
            }
        }

        self.prune_idle_topics();
        Ok(report)
    }

    /// Pending message counts per known topic (zero entries included).
    ///
    /// Drained topics nobody subscribes to drop out after each dispatch.
    pub fn topic_queue_lengths(&self) -> BTreeMap<String, usize> {
        self.topic_order
            .iter()
            .map(|topic| {
                let len = self.queues.get(topic).map_or(0, VecDeque::len);
                (topic.clone(), len)
            })
            .collect()
    }

    /// Total number of pending messages across all topics.
    pub fn pending_count(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    /// Opens an outbox carrying the current queue snapshot.
    ///
    /// The snapshot is rebuilt only after the queues have changed.
    pub fn outbox(&mut self) -> Outbox {
        let queue_lengths = match &self.snapshot {
            Some(snapshot) => Arc::clone(snapshot),
            None => {
                let snapshot = Arc::new(self.topic_queue_lengths());
                self.snapshot = Some(Arc::clone(&snapshot));
                snapshot
            }
        };

        Outbox {
            queue_lengths,
            ..Outbox::default()
        }
    }

    /// Applies everything buffered in an outbox, in issue order.
    pub fn absorb(&mut self, outbox: Outbox) {
        for change in outbox.changes {
            match change {
                SubscriptionChange::Subscribe(agent, topic) => {
                    // Topic was validated when the change was queued
                    let _ = self.subscribe(&agent, &topic);
                }
                SubscriptionChange::Unsubscribe(agent, topic) => {
                    self.unsubscribe(&agent, &topic);
                }
            }
        }

        for message in outbox.published {
            self.publish(message);
        }
    }

    fn requeue_front(&mut self, topic: &str, remainder: VecDeque<Message>) {
        let queue = self.queues.entry(topic.to_string()).or_default();
        for message in remainder.into_iter().rev() {
            queue.push_front(message);
        }
        self.snapshot = None;
    }

    /// Drops topics with an empty queue and no specific or wildcard
    /// subscribers.
    fn prune_idle_topics(&mut self) {
        if self.subscriptions.contains_key(topics::WILDCARD) {
            return;
        }

        let queues = &mut self.queues;
        let subscriptions = &self.subscriptions;
        let before = self.topic_order.len();

        self.topic_order.retain(|topic| {
            let idle = queues.get(topic).map_or(true, VecDeque::is_empty)
                && !subscriptions.contains_key(topic);
            if idle {
                queues.remove(topic);
            }
            !idle
        });

        if self.topic_order.len() != before {
            self.snapshot = None;
        }
    }
}

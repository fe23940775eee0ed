// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process middleware: a broker where samples never leave the agent.
//!
//! Topics are keyed by `(domain_id, name)`. Writers and readers bind to a
//! topic through their representation text. Each reader owns a bounded
//! sample queue; a write fans out to every matching reader, dropping the
//! sample for readers whose queue is full.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::MiddlewareError;
use crate::protocol::Representation;
use crate::types::{ClientKey, ObjectId};

use super::Middleware;

/// Per-reader queue depth; a slow reader loses newest samples first.
const READER_QUEUE_DEPTH: usize = 128;

#[derive(Debug)]
enum Entity {
    Participant {
        domain_id: i16,
    },
    Topic {
        domain_id: i16,
        #[allow(dead_code)] // Kept for debugging and future matching.
        name: String,
    },
    Publisher {
        participant: ObjectId,
    },
    Subscriber {
        participant: ObjectId,
    },
    Writer {
        domain_id: i16,
        topic: String,
    },
    Reader {
        domain_id: i16,
        topic: String,
        rx: Receiver<Vec<u8>>,
    },
}

struct ReaderSlot {
    client: ClientKey,
    id: ObjectId,
    tx: Sender<Vec<u8>>,
}

#[derive(Default)]
struct Broker {
    entities: HashMap<(ClientKey, u16), Entity>,
    /// Readers subscribed per `(domain_id, topic name)`.
    subscriptions: HashMap<(i16, String), Vec<ReaderSlot>>,
}

impl Broker {
    fn domain_of(&self, client: ClientKey, id: ObjectId) -> Option<i16> {
        match self.entities.get(&(client, id.raw()))? {
            Entity::Participant { domain_id } => Some(*domain_id),
            Entity::Topic { domain_id, .. } => Some(*domain_id),
            Entity::Publisher { participant } | Entity::Subscriber { participant } => {
                self.domain_of(client, *participant)
            }
            _ => None,
        }
    }

    fn unsubscribe(&mut self, client: ClientKey, id: ObjectId) {
        for slots in self.subscriptions.values_mut() {
            slots.retain(|s| !(s.client == client && s.id == id));
        }
        self.subscriptions.retain(|_, slots| !slots.is_empty());
    }
}

/// The in-process broker, selected by `--middleware ced`.
#[derive(Default)]
pub struct CedMiddleware {
    broker: Mutex<Broker>,
}

impl CedMiddleware {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The topic a writer/reader representation binds to. For the
    /// in-process broker the representation text is the topic name.
    fn topic_name(repr: &Representation) -> String {
        repr.text().to_string()
    }
}

impl Middleware for CedMiddleware {
    fn create_participant(
        &self,
        client: ClientKey,
        id: ObjectId,
        domain_id: i16,
        _repr: &Representation,
    ) -> Result<(), MiddlewareError> {
        let mut broker = self.broker.lock();
        broker
            .entities
            .insert((client, id.raw()), Entity::Participant { domain_id });
        debug!(%client, %id, domain_id, "ced: participant created");
        Ok(())
    }

    fn create_topic(
        &self,
        client: ClientKey,
        id: ObjectId,
        participant: ObjectId,
        repr: &Representation,
    ) -> Result<(), MiddlewareError> {
        let mut broker = self.broker.lock();
        let domain_id = broker
            .domain_of(client, participant)
            .ok_or(MiddlewareError::UnknownEntity(participant))?;
        let name = Self::topic_name(repr);
        broker
            .entities
            .insert((client, id.raw()), Entity::Topic { domain_id, name });
        Ok(())
    }

    fn create_publisher(
        &self,
        client: ClientKey,
        id: ObjectId,
        participant: ObjectId,
    ) -> Result<(), MiddlewareError> {
        let mut broker = self.broker.lock();
        if broker.domain_of(client, participant).is_none() {
            return Err(MiddlewareError::UnknownEntity(participant));
        }
        broker
            .entities
            .insert((client, id.raw()), Entity::Publisher { participant });
        Ok(())
    }

    fn create_subscriber(
        &self,
        client: ClientKey,
        id: ObjectId,
        participant: ObjectId,
    ) -> Result<(), MiddlewareError> {
        let mut broker = self.broker.lock();
        if broker.domain_of(client, participant).is_none() {
            return Err(MiddlewareError::UnknownEntity(participant));
        }
        broker
            .entities
            .insert((client, id.raw()), Entity::Subscriber { participant });
        Ok(())
    }

    fn create_datawriter(
        &self,
        client: ClientKey,
        id: ObjectId,
        publisher: ObjectId,
        repr: &Representation,
    ) -> Result<(), MiddlewareError> {
        let mut broker = self.broker.lock();
        let domain_id = broker
            .domain_of(client, publisher)
            .ok_or(MiddlewareError::UnknownEntity(publisher))?;
        let topic = Self::topic_name(repr);
        broker.entities.insert(
            (client, id.raw()),
            Entity::Writer { domain_id, topic },
        );
        Ok(())
    }

    fn create_datareader(
        &self,
        client: ClientKey,
        id: ObjectId,
        subscriber: ObjectId,
        repr: &Representation,
    ) -> Result<(), MiddlewareError> {
        let mut broker = self.broker.lock();
        let domain_id = broker
            .domain_of(client, subscriber)
            .ok_or(MiddlewareError::UnknownEntity(subscriber))?;
        let topic = Self::topic_name(repr);
        let (tx, rx) = channel::bounded(READER_QUEUE_DEPTH);
        broker
            .subscriptions
            .entry((domain_id, topic.clone()))
            .or_default()
            .push(ReaderSlot { client, id, tx });
        broker.entities.insert(
            (client, id.raw()),
            Entity::Reader {
                domain_id,
                topic,
                rx,
            },
        );
        Ok(())
    }

    fn create_requester(
        &self,
        client: ClientKey,
        id: ObjectId,
        participant: ObjectId,
        repr: &Representation,
    ) -> Result<(), MiddlewareError> {
        // A requester is a writer on the request topic; replies come back
        // through a paired reader created under the same id space by the
        // registry. The broker models it as a writer.
        self.create_datawriter(client, id, participant, repr)
    }

    fn create_replier(
        &self,
        client: ClientKey,
        id: ObjectId,
        participant: ObjectId,
        repr: &Representation,
    ) -> Result<(), MiddlewareError> {
        self.create_datareader(client, id, participant, repr)
    }

    fn delete_entity(&self, client: ClientKey, id: ObjectId) -> Result<(), MiddlewareError> {
        let mut broker = self.broker.lock();
        broker.unsubscribe(client, id);
        broker.entities.remove(&(client, id.raw()));
        Ok(())
    }

    fn delete_client(&self, client: ClientKey) {
        let mut broker = self.broker.lock();
        for slots in broker.subscriptions.values_mut() {
            slots.retain(|s| s.client != client);
        }
        broker.subscriptions.retain(|_, slots| !slots.is_empty());
        broker.entities.retain(|&(owner, _), _| owner != client);
    }

    fn write_data(
        &self,
        client: ClientKey,
        writer: ObjectId,
        data: &[u8],
    ) -> Result<(), MiddlewareError> {
        let broker = self.broker.lock();
        let (domain_id, topic) = match broker.entities.get(&(client, writer.raw())) {
            Some(Entity::Writer { domain_id, topic }) => (*domain_id, topic.clone()),
            _ => return Err(MiddlewareError::UnknownEntity(writer)),
        };
        if let Some(slots) = broker.subscriptions.get(&(domain_id, topic)) {
            for slot in slots {
                match slot.tx.try_send(data.to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        trace!(reader = %slot.id, "ced: reader queue full, sample dropped");
                    }
                    Err(TrySendError::Disconnected(_)) => {}
                }
            }
        }
        Ok(())
    }

    fn read_data(
        &self,
        client: ClientKey,
        reader: ObjectId,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, MiddlewareError> {
        let rx = {
            let broker = self.broker.lock();
            match broker.entities.get(&(client, reader.raw())) {
                Some(Entity::Reader { rx, .. }) => rx.clone(),
                _ => return Err(MiddlewareError::UnknownEntity(reader)),
            }
        };
        // The broker lock is not held across the blocking wait.
        match rx.recv_timeout(timeout) {
            Ok(sample) => Ok(Some(sample)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(MiddlewareError::UnknownEntity(reader)),
        }
    }
}

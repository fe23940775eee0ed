// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Middleware capability layer.
//!
//! The agent never talks to a pub/sub implementation directly; everything
//! goes through the [`Middleware`] trait: create/delete entities described
//! by reference or XML, write bytes, read bytes with a timeout. The
//! in-process [`CedMiddleware`] broker ships with the agent; DDS backends
//! plug in by implementing the trait and handing the instance to the
//! server builder.

pub mod ced;
pub mod reader;

use std::time::Duration;

use crate::error::MiddlewareError;
use crate::protocol::Representation;
use crate::types::{ClientKey, ObjectId};

pub use ced::CedMiddleware;
pub use reader::{DataNotification, ReadRequest, ReaderPool};

/// Narrow capability interface onto the backing pub/sub middleware.
///
/// Entities are scoped per client key; ids are the XRCE object ids the
/// client chose. Implementations own whatever native handles they need.
pub trait Middleware: Send + Sync {
    fn create_participant(
        &self,
        client: ClientKey,
        id: ObjectId,
        domain_id: i16,
        repr: &Representation,
    ) -> Result<(), MiddlewareError>;

    fn create_topic(
        &self,
        client: ClientKey,
        id: ObjectId,
        participant: ObjectId,
        repr: &Representation,
    ) -> Result<(), MiddlewareError>;

    fn create_publisher(
        &self,
        client: ClientKey,
        id: ObjectId,
        participant: ObjectId,
    ) -> Result<(), MiddlewareError>;

    fn create_subscriber(
        &self,
        client: ClientKey,
        id: ObjectId,
        participant: ObjectId,
    ) -> Result<(), MiddlewareError>;

    fn create_datawriter(
        &self,
        client: ClientKey,
        id: ObjectId,
        publisher: ObjectId,
        repr: &Representation,
    ) -> Result<(), MiddlewareError>;

    fn create_datareader(
        &self,
        client: ClientKey,
        id: ObjectId,
        subscriber: ObjectId,
        repr: &Representation,
    ) -> Result<(), MiddlewareError>;

    fn create_requester(
        &self,
        client: ClientKey,
        id: ObjectId,
        participant: ObjectId,
        repr: &Representation,
    ) -> Result<(), MiddlewareError>;

    fn create_replier(
        &self,
        client: ClientKey,
        id: ObjectId,
        participant: ObjectId,
        repr: &Representation,
    ) -> Result<(), MiddlewareError>;

    /// Delete one entity. Deleting an unknown entity is not an error here;
    /// the object registry is the source of truth for existence.
    fn delete_entity(&self, client: ClientKey, id: ObjectId) -> Result<(), MiddlewareError>;

    /// Drop every entity belonging to a client (proxy teardown).
    fn delete_client(&self, client: ClientKey);

    /// Forward one serialized sample through a data writer.
    fn write_data(
        &self,
        client: ClientKey,
        writer: ObjectId,
        data: &[u8],
    ) -> Result<(), MiddlewareError>;

    /// Read one sample from a data reader, blocking up to `timeout`.
    /// `Ok(None)` on timeout with no data.
    fn read_data(
        &self,
        client: ClientKey,
        reader: ObjectId,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, MiddlewareError>;
}

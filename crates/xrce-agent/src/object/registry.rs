// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Object registry: the creation-mode matrix and cascaded deletion.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::MiddlewareError;
use crate::middleware::Middleware;
use crate::protocol::{ObjectVariant, StatusCode};
use crate::types::{ClientKey, ObjectId, ObjectKind};

use super::{expected_parent_kind, CreationFlags, ObjectEntry};

/// Arena of objects belonging to one proxy client. The caller (ProxyClient)
/// serializes access; the registry itself is single-threaded.
pub struct ObjectRegistry {
    client_key: ClientKey,
    objects: BTreeMap<ObjectId, ObjectEntry>,
}

impl ObjectRegistry {
    #[must_use]
    pub fn new(client_key: ClientKey) -> Self {
        Self {
            client_key,
            objects: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&ObjectEntry> {
        self.objects.get(&id)
    }

    #[must_use]
    pub fn exists(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Apply the creation-mode matrix for a CREATE request.
    pub fn create(
        &mut self,
        flags: CreationFlags,
        id: ObjectId,
        variant: &ObjectVariant,
        middleware: &dyn Middleware,
    ) -> StatusCode {
        // The low nibble of the id must agree with the representation kind.
        if id.kind() != Some(variant.kind) {
            warn!(client = %self.client_key, object = %id, "kind nibble mismatch");
            return StatusCode::ErrInvalidData;
        }

        let exists = self.objects.contains_key(&id);
        if !exists {
            return self.instantiate(id, variant, middleware);
        }

        match (flags.reuse, flags.replace) {
            (false, false) => {
                warn!(client = %self.client_key, object = %id, "error: ALREADY_EXISTS");
                StatusCode::ErrAlreadyExists
            }
            (false, true) => {
                self.delete(id, middleware);
                self.instantiate(id, variant, middleware)
            }
            (true, false) => {
                if self.objects[&id].matches(variant) {
                    StatusCode::OkMatched
                } else {
                    warn!(client = %self.client_key, object = %id, "error: MISMATCH");
                    StatusCode::ErrMismatch
                }
            }
            (true, true) => {
                if self.objects[&id].matches(variant) {
                    StatusCode::OkMatched
                } else {
                    self.delete(id, middleware);
                    self.instantiate(id, variant, middleware)
                }
            }
        }
    }

    /// Delete an object and every descendant. Returns UNKNOWN_REFERENCE
    /// when the id is not registered.
    pub fn delete(&mut self, id: ObjectId, middleware: &dyn Middleware) -> StatusCode {
        if !self.objects.contains_key(&id) {
            warn!(client = %self.client_key, object = %id, "error: UNKNOWN_REFERENCE");
            return StatusCode::ErrUnknownReference;
        }
        // Collect the subtree rooted at `id` by walking parent links.
        let mut doomed = vec![id];
        let mut frontier = vec![id];
        while let Some(parent) = frontier.pop() {
            let children: Vec<ObjectId> = self
                .objects
                .iter()
                .filter(|(_, e)| e.parent == Some(parent))
                .map(|(&child, _)| child)
                .collect();
            for child in children {
                if !doomed.contains(&child) {
                    doomed.push(child);
                    frontier.push(child);
                }
            }
        }
        // Children go before parents so the middleware never sees orphans.
        for &object in doomed.iter().rev() {
            if let Err(e) = middleware.delete_entity(self.client_key, object) {
                warn!(client = %self.client_key, %object, "middleware delete failed: {e}");
            }
            self.objects.remove(&object);
            debug!(client = %self.client_key, %object, "object deleted");
        }
        StatusCode::Ok
    }

    /// Drop every object (client teardown). Middleware cleanup happens via
    /// `Middleware::delete_client`.
    pub fn clear(&mut self) {
        self.objects.clear();
    }

    fn instantiate(
        &mut self,
        id: ObjectId,
        variant: &ObjectVariant,
        middleware: &dyn Middleware,
    ) -> StatusCode {
        // Referential integrity: the named parent must exist and be of the
        // right kind. Participants have no parent.
        let parent = match expected_parent_kind(variant.kind) {
            None => None,
            Some(expected) => {
                let parent_id = variant.parent_id;
                match self.objects.get(&parent_id) {
                    Some(entry) if entry.kind == expected => Some(parent_id),
                    _ => {
                        warn!(
                            client = %self.client_key,
                            object = %id,
                            parent = %parent_id,
                            "error: UNKNOWN_REFERENCE (missing parent)"
                        );
                        return StatusCode::ErrUnknownReference;
                    }
                }
            }
        };

        let created = match variant.kind {
            ObjectKind::Participant => middleware.create_participant(
                self.client_key,
                id,
                variant.domain_id,
                &variant.representation,
            ),
            ObjectKind::Topic => middleware.create_topic(
                self.client_key,
                id,
                variant.parent_id,
                &variant.representation,
            ),
            ObjectKind::Publisher => {
                middleware.create_publisher(self.client_key, id, variant.parent_id)
            }
            ObjectKind::Subscriber => {
                middleware.create_subscriber(self.client_key, id, variant.parent_id)
            }
            ObjectKind::DataWriter => middleware.create_datawriter(
                self.client_key,
                id,
                variant.parent_id,
                &variant.representation,
            ),
            ObjectKind::DataReader => middleware.create_datareader(
                self.client_key,
                id,
                variant.parent_id,
                &variant.representation,
            ),
            ObjectKind::Requester => middleware.create_requester(
                self.client_key,
                id,
                variant.parent_id,
                &variant.representation,
            ),
            ObjectKind::Replier => middleware.create_replier(
                self.client_key,
                id,
                variant.parent_id,
                &variant.representation,
            ),
            other => {
                warn!(client = %self.client_key, object = %id, kind = ?other, "unsupported kind");
                return StatusCode::ErrUnknownReference;
            }
        };

        match created {
            Ok(()) => {
                self.objects.insert(
                    id,
                    ObjectEntry {
                        kind: variant.kind,
                        parent,
                        variant: variant.clone(),
                    },
                );
                debug!(client = %self.client_key, object = %id, "object created");
                StatusCode::Ok
            }
            Err(MiddlewareError::Denied(reason)) => {
                warn!(client = %self.client_key, object = %id, "middleware denied: {reason}");
                StatusCode::ErrDenied
            }
            Err(e) => {
                warn!(client = %self.client_key, object = %id, "error: UNKNOWN_REFERENCE ({e})");
                StatusCode::ErrUnknownReference
            }
        }
    }
}

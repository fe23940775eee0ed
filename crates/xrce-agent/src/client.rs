// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy client: the agent-side stand-in for one connected XRCE client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::middleware::Middleware;
use crate::object::{CreationFlags, ObjectRegistry};
use crate::protocol::{ObjectVariant, StatusCode};
use crate::session::{Session, SessionInfo};
use crate::types::ObjectId;

/// One connected client: its session streams, object graph and liveliness.
pub struct ProxyClient {
    session: Session,
    objects: Mutex<ObjectRegistry>,
    middleware: Arc<dyn Middleware>,
    last_activity: Mutex<Instant>,
}

impl ProxyClient {
    #[must_use]
    pub fn new(info: SessionInfo, middleware: Arc<dyn Middleware>) -> Self {
        Self {
            session: Session::new(info),
            objects: Mutex::new(ObjectRegistry::new(info.client_key)),
            middleware,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    #[inline]
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    #[inline]
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        self.session.info()
    }

    #[inline]
    #[must_use]
    pub fn middleware(&self) -> &Arc<dyn Middleware> {
        &self.middleware
    }

    /// Record activity; resets the liveliness clock.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Whether the client has been silent longer than `dead_time`.
    #[must_use]
    pub fn is_expired(&self, dead_time: Duration) -> bool {
        self.last_activity.lock().elapsed() > dead_time
    }

    /// CREATE: run the creation-mode matrix under the client's object lock.
    pub fn create_object(
        &self,
        flags: CreationFlags,
        id: ObjectId,
        variant: &ObjectVariant,
    ) -> StatusCode {
        self.objects
            .lock()
            .create(flags, id, variant, &*self.middleware)
    }

    /// DELETE: cascade removal under the client's object lock.
    pub fn delete_object(&self, id: ObjectId) -> StatusCode {
        self.objects.lock().delete(id, &*self.middleware)
    }

    /// Whether `id` exists with the given kind nibble intact.
    #[must_use]
    pub fn has_object(&self, id: ObjectId) -> bool {
        self.objects.lock().exists(id)
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    /// Proxy teardown: drop the object graph and middleware entities.
    pub fn release(&self) {
        self.objects.lock().clear();
        self.middleware.delete_client(self.info().client_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::CedMiddleware;
    use crate::protocol::Representation;
    use crate::types::{ClientKey, ObjectKind};

    fn client() -> ProxyClient {
        ProxyClient::new(
            SessionInfo {
                client_key: ClientKey(0xAABBCCDD),
                session_id: 0x81,
                mtu: 512,
            },
            Arc::new(CedMiddleware::new()),
        )
    }

    fn participant_variant() -> ObjectVariant {
        ObjectVariant {
            kind: ObjectKind::Participant,
            domain_id: 0,
            parent_id: ObjectId(0),
            representation: Representation::Ref("default_xrce_participant".into()),
        }
    }

    #[test]
    fn test_create_and_delete() {
        let c = client();
        let id = ObjectId(0x0011);
        assert_eq!(
            c.create_object(CreationFlags::default(), id, &participant_variant()),
            StatusCode::Ok
        );
        assert!(c.has_object(id));
        assert_eq!(c.delete_object(id), StatusCode::Ok);
        assert!(!c.has_object(id));
        assert_eq!(c.delete_object(id), StatusCode::ErrUnknownReference);
    }

    #[test]
    fn test_liveliness() {
        let c = client();
        assert!(!c.is_expired(Duration::from_secs(10)));
        assert!(c.is_expired(Duration::ZERO));
        c.touch();
        assert!(!c.is_expired(Duration::from_secs(10)));
    }

    #[test]
    fn test_release_clears_objects() {
        let c = client();
        c.create_object(
            CreationFlags::default(),
            ObjectId(0x0011),
            &participant_variant(),
        );
        c.release();
        assert_eq!(c.object_count(), 0);
    }
}

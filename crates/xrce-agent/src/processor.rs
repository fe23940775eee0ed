// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The processor: decodes inbound packets, drives sessions and the object
//! graph, and produces the outbound packets the sender transmits.
//!
//! Errors stop at the nearest boundary: a bad submessage becomes a STATUS,
//! a bad packet is dropped, and nothing here panics the worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::client::ProxyClient;
use crate::context::AgentContext;
use crate::error::MiddlewareError;
use crate::message::{InputMessage, OutputMessage};
use crate::middleware::{DataNotification, ReadRequest, ReaderPool};
use crate::object::CreationFlags;
use crate::protocol::{
    parse_payload, CreateClientPayload, DataPayload, GetInfoPayload, InfoPayload, Locator,
    MessageHeader, StatusAgentPayload, StatusCode, StatusPayload, Submessage, SubmessageHeader,
    TimestampPayload, TimestampReplyPayload, WriteDataPayload,
    SESSION_ID_NONE_WITHOUT_CLIENT_KEY, SUBMSG_FRAGMENT,
};
use crate::session::SessionInfo;
use crate::stream::{SendError, StreamAdmit};
use crate::transport::{EndPoint, InputPacket, OutputPacket};
use crate::types::{ClientKey, ObjectId, ObjectKind, SeqNum, STREAM_ID_RELIABLE_CONTROL};

/// Stream id used for reliability control answers (acknacks, heartbeats).
const CONTROL_ANSWER_STREAM: u8 = 0x00;

/// Everything the processor thread consumes from the ingress queue.
pub enum ServerEvent<E> {
    /// A transport frame from a client.
    Packet(InputPacket<E>),
    /// A sample completed by a middleware reader worker.
    ReaderData(DataNotification),
}

/// Endpoint <-> client key bimap, guarded by the server's clients lock.
pub struct ClientMap<E: EndPoint> {
    inner: Mutex<ClientMapInner<E>>,
}

struct ClientMapInner<E> {
    by_source: HashMap<E, ClientKey>,
    by_key: HashMap<ClientKey, E>,
}

impl<E: EndPoint> Default for ClientMap<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EndPoint> ClientMap<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ClientMapInner {
                by_source: HashMap::new(),
                by_key: HashMap::new(),
            }),
        }
    }

    /// Bind `source` to `key`, replacing any previous binding on either
    /// side (a client reconnecting from a new port).
    pub fn bind(&self, source: E, key: ClientKey) {
        let mut inner = self.inner.lock();
        if let Some(old_key) = inner.by_source.remove(&source) {
            inner.by_key.remove(&old_key);
        }
        if let Some(old_source) = inner.by_key.remove(&key) {
            inner.by_source.remove(&old_source);
        }
        inner.by_source.insert(source.clone(), key);
        inner.by_key.insert(key, source);
    }

    pub fn unbind_key(&self, key: ClientKey) {
        let mut inner = self.inner.lock();
        if let Some(source) = inner.by_key.remove(&key) {
            inner.by_source.remove(&source);
        }
    }

    #[must_use]
    pub fn key_of(&self, source: &E) -> Option<ClientKey> {
        self.inner.lock().by_source.get(source).copied()
    }

    #[must_use]
    pub fn endpoint_of(&self, key: ClientKey) -> Option<E> {
        self.inner.lock().by_key.get(&key).cloned()
    }
}

/// Decodes packets and mutates agent state. One per server; the server may
/// run it from a single thread or shard it per client.
pub struct Processor<E: EndPoint> {
    context: Arc<AgentContext>,
    clients: Arc<ClientMap<E>>,
    reader_pool: Arc<ReaderPool>,
    /// Locator advertised in INFO answers.
    advertised: Locator,
}

impl<E: EndPoint> Processor<E> {
    pub fn new(
        context: Arc<AgentContext>,
        clients: Arc<ClientMap<E>>,
        reader_pool: Arc<ReaderPool>,
        advertised: Locator,
    ) -> Self {
        Self {
            context,
            clients,
            reader_pool,
            advertised,
        }
    }

    #[inline]
    #[must_use]
    pub fn context(&self) -> &Arc<AgentContext> {
        &self.context
    }

    /// Handle one event, returning the packets to hand to egress.
    pub fn process(&self, event: ServerEvent<E>) -> Vec<OutputPacket<E>> {
        match event {
            ServerEvent::Packet(packet) => self.process_packet(packet),
            ServerEvent::ReaderData(notification) => self.process_reader_data(notification),
        }
    }

    /// Periodic maintenance: reap dead clients, emit due heartbeats.
    pub fn maintenance(&self, now: Instant) -> Vec<OutputPacket<E>> {
        let mut out = Vec::new();
        for key in self.context.reap_expired() {
            self.clients.unbind_key(key);
        }
        for client in self.context.clients_snapshot() {
            let key = client.info().client_key;
            let Some(destination) = self.clients.endpoint_of(key) else {
                continue;
            };
            for heartbeat in client.session().heartbeats_due(now) {
                self.push_reply(
                    &client,
                    CONTROL_ANSWER_STREAM,
                    &Submessage::Heartbeat(heartbeat),
                    0,
                    &destination,
                    &mut out,
                );
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Packet path
    // -----------------------------------------------------------------------

    fn process_packet(&self, packet: InputPacket<E>) -> Vec<OutputPacket<E>> {
        let mut out = Vec::new();
        let message = match InputMessage::parse(&packet.bytes) {
            Ok(m) => m,
            Err(e) => {
                debug!(source = %packet.source, "unparseable packet dropped: {e}");
                return out;
            }
        };

        // Session-scope submessages (CREATE_CLIENT, GET_INFO) work without
        // an established proxy.
        let client = self.resolve_client(&message, &packet.source);

        match &client {
            Some(client) => {
                client.touch();
                self.run_streams(client, &message, &packet.source, &mut out);
            }
            None => {
                self.run_anonymous(&message, &packet.source, &mut out);
            }
        }
        out
    }

    /// Route the message through its stream, then process everything the
    /// stream releases.
    fn run_streams(
        &self,
        client: &Arc<ProxyClient>,
        message: &InputMessage,
        source: &E,
        out: &mut Vec<OutputPacket<E>>,
    ) {
        match client.session().admit(message) {
            StreamAdmit::Deliver => {
                self.dispatch_message(client, message, source, out);
                let stream_id = message.header().stream_id;
                while let Some(next) = client.session().pop_input_message(stream_id) {
                    self.dispatch_message(client, &next, source, out);
                }
            }
            StreamAdmit::Buffered => {
                trace!(source = %source, seq = %message.header().sequence_nr, "buffered out-of-order");
            }
            StreamAdmit::Dropped => {
                trace!(source = %source, seq = %message.header().sequence_nr, "stale message dropped");
            }
        }
    }

    /// Process every submessage of one delivered message.
    fn dispatch_message(
        &self,
        client: &Arc<ProxyClient>,
        message: &InputMessage,
        source: &E,
        out: &mut Vec<OutputPacket<E>>,
    ) {
        for item in message.submessages() {
            let (subheader, payload) = match item {
                Ok(pair) => pair,
                Err(e) => {
                    debug!(source = %source, "truncated submessage, rest of packet dropped: {e}");
                    return;
                }
            };
            if subheader.submessage_id == SUBMSG_FRAGMENT {
                self.handle_fragment(client, message, &subheader, payload, source, out);
                continue;
            }
            let submsg = match parse_payload(&subheader, payload) {
                Ok(s) => s,
                Err(e) => {
                    debug!(source = %source, id = subheader.submessage_id, "bad payload: {e}");
                    continue;
                }
            };
            self.dispatch_submessage(client, &subheader, submsg, source, out);
        }
    }

    fn handle_fragment(
        &self,
        client: &Arc<ProxyClient>,
        message: &InputMessage,
        subheader: &SubmessageHeader,
        payload: &[u8],
        source: &E,
        out: &mut Vec<OutputPacket<E>>,
    ) {
        let session = client.session();
        session.push_fragment(message, subheader, payload);
        if let Some(reassembled) = session.pop_fragment(message.header().stream_id) {
            // The synthesized message was already sequenced fragment by
            // fragment; dispatch it directly.
            self.dispatch_message(client, &reassembled, source, out);
        }
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch_submessage(
        &self,
        client: &Arc<ProxyClient>,
        subheader: &SubmessageHeader,
        submsg: Submessage,
        source: &E,
        out: &mut Vec<OutputPacket<E>>,
    ) {
        match submsg {
            Submessage::CreateClient(payload) => {
                // Re-create over a live proxy: reset and acknowledge.
                let status = self.context.create_client(SessionInfo {
                    client_key: payload.client_key,
                    session_id: payload.session_id,
                    mtu: usize::from(payload.mtu),
                });
                self.clients.bind(source.clone(), payload.client_key);
                self.answer_create_client(status, &payload, source, out);
            }
            Submessage::Delete(payload) if payload.object_id.kind() == Some(ObjectKind::Client) => {
                // DELETE addressed to the client object tears the proxy down.
                let key = client.info().client_key;
                let status = self.context.delete_client(key);
                self.clients.unbind_key(key);
                self.status_reply(client, payload.request_id, payload.object_id, status, source, out);
            }
            Submessage::Create(payload) => {
                let flags = CreationFlags::from_bits(subheader.flags);
                let status = client.create_object(flags, payload.object_id, &payload.variant);
                self.status_reply(client, payload.request_id, payload.object_id, status, source, out);
            }
            Submessage::Delete(payload) => {
                let status = client.delete_object(payload.object_id);
                self.status_reply(client, payload.request_id, payload.object_id, status, source, out);
            }
            Submessage::WriteData(payload) => {
                let status = self.handle_write(client, &payload);
                // Successful writes are not acknowledged; data flows are
                // too hot for a STATUS per sample.
                if !status.is_ok() {
                    self.status_reply(client, payload.request_id, payload.object_id, status, source, out);
                }
            }
            Submessage::ReadData(payload) => {
                let status = if client.has_object(payload.object_id) {
                    self.reader_pool.spawn(ReadRequest {
                        client_key: client.info().client_key,
                        stream_id: STREAM_ID_RELIABLE_CONTROL,
                        request_id: payload.request_id,
                        object_id: payload.object_id,
                        max_samples: payload.max_samples,
                        max_elapsed: std::time::Duration::from_millis(u64::from(
                            payload.max_elapsed_time_ms,
                        )),
                    });
                    StatusCode::Ok
                } else {
                    StatusCode::ErrUnknownReference
                };
                self.status_reply(client, payload.request_id, payload.object_id, status, source, out);
            }
            Submessage::Heartbeat(payload) => {
                let acknack = client.session().on_heartbeat(&payload);
                self.push_reply(
                    client,
                    CONTROL_ANSWER_STREAM,
                    &Submessage::Acknack(acknack),
                    0,
                    source,
                    out,
                );
            }
            Submessage::Acknack(payload) => {
                let (retransmit, heartbeat) = client.session().on_acknack(&payload);
                for bytes in retransmit {
                    out.push(OutputPacket {
                        destination: source.clone(),
                        bytes,
                    });
                }
                if let Some(hb) = heartbeat {
                    self.push_reply(
                        client,
                        CONTROL_ANSWER_STREAM,
                        &Submessage::Heartbeat(hb),
                        0,
                        source,
                        out,
                    );
                }
            }
            Submessage::Reset => {
                client.session().reset();
            }
            Submessage::GetInfo(payload) => {
                self.answer_get_info(&payload, source, out);
            }
            Submessage::Timestamp(payload) => {
                let reply = self.timestamp_reply(&payload);
                self.push_reply(
                    client,
                    CONTROL_ANSWER_STREAM,
                    &Submessage::TimestampReply(reply),
                    0,
                    source,
                    out,
                );
            }
            Submessage::Fragment(_) => {
                // Routed in dispatch_message; unreachable via parse_payload.
            }
            Submessage::StatusAgent(_)
            | Submessage::Status(_)
            | Submessage::Info(_)
            | Submessage::Data(_)
            | Submessage::TimestampReply(_) => {
                debug!(source = %source, id = submsg.id(), "agent-bound submessage ignored");
            }
        }
    }

    fn handle_write(&self, client: &Arc<ProxyClient>, payload: &WriteDataPayload) -> StatusCode {
        if !client.has_object(payload.object_id) {
            return StatusCode::ErrUnknownReference;
        }
        match client.middleware().write_data(
            client.info().client_key,
            payload.object_id,
            &payload.data,
        ) {
            Ok(()) => StatusCode::Ok,
            Err(MiddlewareError::Timeout) => StatusCode::ErrDenied,
            Err(MiddlewareError::UnknownEntity(_)) => StatusCode::ErrUnknownReference,
            Err(e) => {
                warn!("write failed: {e}");
                StatusCode::ErrDds
            }
        }
    }

    // -----------------------------------------------------------------------
    // Anonymous path (no established proxy)
    // -----------------------------------------------------------------------

    fn run_anonymous(&self, message: &InputMessage, source: &E, out: &mut Vec<OutputPacket<E>>) {
        for item in message.submessages() {
            let Ok((subheader, payload)) = item else {
                return;
            };
            let Ok(submsg) = parse_payload(&subheader, payload) else {
                continue;
            };
            match submsg {
                Submessage::CreateClient(payload) => {
                    let status = self.context.create_client(SessionInfo {
                        client_key: payload.client_key,
                        session_id: payload.session_id,
                        mtu: usize::from(payload.mtu),
                    });
                    if status.is_ok() {
                        self.clients.bind(source.clone(), payload.client_key);
                    }
                    self.answer_create_client(status, &payload, source, out);
                }
                Submessage::GetInfo(payload) => {
                    self.answer_get_info(&payload, source, out);
                }
                other => {
                    debug!(source = %source, id = other.id(), "submessage for unknown client dropped");
                }
            }
        }
    }

    fn resolve_client(&self, message: &InputMessage, source: &E) -> Option<Arc<ProxyClient>> {
        let key = match message.header().client_key {
            Some(key) => Some(key),
            None => self.clients.key_of(source),
        }?;
        self.context.get_client(key)
    }

    // -----------------------------------------------------------------------
    // Reader data path
    // -----------------------------------------------------------------------

    fn process_reader_data(&self, n: DataNotification) -> Vec<OutputPacket<E>> {
        let mut out = Vec::new();
        let Some(client) = self.context.get_client(n.client_key) else {
            return out;
        };
        let Some(destination) = self.clients.endpoint_of(n.client_key) else {
            return out;
        };
        self.push_reply(
            &client,
            n.stream_id,
            &Submessage::Data(DataPayload {
                request_id: n.request_id,
                object_id: n.object_id,
                data: n.data,
            }),
            0,
            &destination,
            &mut out,
        );
        out
    }

    // -----------------------------------------------------------------------
    // Reply helpers
    // -----------------------------------------------------------------------

    fn status_reply(
        &self,
        client: &Arc<ProxyClient>,
        request_id: u16,
        object_id: ObjectId,
        status: StatusCode,
        source: &E,
        out: &mut Vec<OutputPacket<E>>,
    ) {
        self.push_reply(
            client,
            STREAM_ID_RELIABLE_CONTROL,
            &Submessage::Status(StatusPayload {
                request_id,
                object_id,
                status,
            }),
            0,
            source,
            out,
        );
    }

    fn push_reply(
        &self,
        client: &Arc<ProxyClient>,
        stream_id: u8,
        submsg: &Submessage,
        extra_flags: u8,
        destination: &E,
        out: &mut Vec<OutputPacket<E>>,
    ) {
        match client
            .session()
            .push_output_submessage(stream_id, submsg, extra_flags)
        {
            Ok(frames) => {
                for bytes in frames {
                    out.push(OutputPacket {
                        destination: destination.clone(),
                        bytes,
                    });
                }
            }
            Err(SendError::WindowFull) => {
                warn!(client = %client.info().client_key, stream_id, "error: RESOURCES (window full), reply dropped");
            }
            Err(e) => {
                warn!(client = %client.info().client_key, stream_id, "reply serialization failed: {e}");
            }
        }
    }

    fn answer_create_client(
        &self,
        status: StatusCode,
        payload: &CreateClientPayload,
        source: &E,
        out: &mut Vec<OutputPacket<E>>,
    ) {
        // STATUS_AGENT goes back on the anonymous session; the proxy's own
        // streams start clean.
        let header = MessageHeader {
            session_id: SESSION_ID_NONE_WITHOUT_CLIENT_KEY,
            stream_id: 0,
            sequence_nr: SeqNum::ZERO,
            client_key: None,
        };
        let mut message = OutputMessage::new(header, usize::from(payload.mtu).max(64));
        let reply = Submessage::StatusAgent(StatusAgentPayload {
            status,
            session_id: payload.session_id,
            mtu: payload.mtu,
        });
        if message.push_submessage(&reply, 0).is_ok() {
            out.push(OutputPacket {
                destination: source.clone(),
                bytes: message.into_bytes(),
            });
        }
    }

    fn answer_get_info(
        &self,
        _payload: &GetInfoPayload,
        source: &E,
        out: &mut Vec<OutputPacket<E>>,
    ) {
        let header = MessageHeader {
            session_id: SESSION_ID_NONE_WITHOUT_CLIENT_KEY,
            stream_id: 0,
            sequence_nr: SeqNum::ZERO,
            client_key: None,
        };
        let mut message = OutputMessage::new(header, 128);
        let info = Submessage::Info(InfoPayload {
            availability: 1,
            locator: self.advertised,
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        if message.push_submessage(&info, 0).is_ok() {
            out.push(OutputPacket {
                destination: source.clone(),
                bytes: message.into_bytes(),
            });
        }
    }

    fn timestamp_reply(&self, request: &TimestampPayload) -> TimestampReplyPayload {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let sec = now.as_secs() as i32;
        let nsec = now.subsec_nanos();
        TimestampReplyPayload {
            transmit_sec: request.transmit_sec,
            transmit_nsec: request.transmit_nsec,
            receive_sec: sec,
            receive_nsec: nsec,
            originate_sec: sec,
            originate_nsec: nsec,
        }
    }
}

//! In-memory broker for exercising the chat client without a network.
//!
//! [`MockConnector`] hands out connections that answer the MQTT subset the
//! client speaks. Behaviour knobs (refused CONNECTs, dropped transports,
//! a broker that stops answering) are set up front; [`BrokerLog`] records what the client sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use jobpilot_core::AppError;
use tokio::sync::mpsc;

use crate::inbound::{InboundEvent, InboundHandler};
use crate::mqtt::{ConnAck, Connect, Packet, Publish, QoS, SubAck};
use crate::transport::{ConnectRequest, Connection, Connector};

// ---------------------------------------------------------------------------
// BrokerLog
// ---------------------------------------------------------------------------

/// Everything the client sent to the broker, across connections.
#[derive(Debug, Clone, Default)]
pub struct BrokerLog {
    pub requests: Vec<ConnectRequest>,
    pub connects: Vec<Connect>,
    pub subscriptions: Vec<String>,
    /// PUBLISH packets received from the client, including unacknowledged ones.
    pub publishes: Vec<Publish>,
    /// Packet ids the client acknowledged for broker-initiated publishes.
    pub client_acks: Vec<u16>,
    pub pings: usize,
    pub disconnects: usize,
    pub refused_transports: usize,
}

#[derive(Default)]
struct BrokerState {
    log: BrokerLog,
    refuse_codes: VecDeque<u8>,
    fail_transports: usize,
    drop_after_acks: Option<usize>,
    silent: bool,
    injector: Option<mpsc::UnboundedSender<Packet>>,
}

// ---------------------------------------------------------------------------
// MockConnector
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<Mutex<BrokerState>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next CONNECTs with these CONNACK return codes.
    pub fn refuse_connects(self, codes: &[u8]) -> Self {
        self.state.lock().unwrap().refuse_codes.extend(codes);
        self
    }

    /// Fail the next `n` transport opens before any MQTT traffic.
    pub fn fail_transports(self, n: usize) -> Self {
        self.state.lock().unwrap().fail_transports = n;
        self
    }

    /// Drop the first connection after acknowledging `k` publishes.
    pub fn drop_after_acks(self, k: usize) -> Self {
        self.state.lock().unwrap().drop_after_acks = Some(k);
        self
    }

    /// Let the first connection finish its handshake and then ignore
    /// PUBLISH and PINGREQ, like a half-open socket.
    pub fn go_silent(self) -> Self {
        self.state.lock().unwrap().silent = true;
        self
    }

    pub fn log(&self) -> BrokerLog {
        self.state.lock().unwrap().log.clone()
    }

    /// Push a packet to the current connection as if the broker sent it.
    pub fn inject(&self, packet: Packet) -> bool {
        let state = self.state.lock().unwrap();
        state
            .injector
            .as_ref()
            .is_some_and(|tx| tx.send(packet).is_ok())
    }
}

impl Connector for MockConnector {
    type Conn = MockConnection;

    async fn connect(&self, request: &ConnectRequest) -> Result<MockConnection, AppError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_transports > 0 {
            state.fail_transports -= 1;
            state.log.refused_transports += 1;
            return Err(AppError::NetworkError("connection refused".into()));
        }
        state.log.requests.push(request.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        state.injector = Some(tx);
        let drop_after = state.drop_after_acks.take();
        let silent = std::mem::take(&mut state.silent);
        Ok(MockConnection {
            state: self.state.clone(),
            responses: VecDeque::new(),
            injected: rx,
            acks: 0,
            drop_after,
            silent,
            closed: false,
        })
    }
}

pub struct MockConnection {
    state: Arc<Mutex<BrokerState>>,
    responses: VecDeque<Packet>,
    injected: mpsc::UnboundedReceiver<Packet>,
    acks: usize,
    drop_after: Option<usize>,
    silent: bool,
    closed: bool,
}

impl Connection for MockConnection {
    async fn send(&mut self, packet: &Packet) -> Result<(), AppError> {
        if self.closed {
            return Err(AppError::NetworkError("connection reset".into()));
        }
        let mut state = self.state.lock().unwrap();
        match packet {
            Packet::Connect(connect) => {
                state.log.connects.push(connect.clone());
                let ack = match state.refuse_codes.pop_front() {
                    Some(code) => ConnAck::refused(code),
                    None => ConnAck::accepted(),
                };
                self.responses.push_back(Packet::ConnAck(ack));
            }
            Packet::Subscribe(subscribe) => {
                state
                    .log
                    .subscriptions
                    .extend(subscribe.filters.iter().map(|(f, _)| f.clone()));
                self.responses.push_back(Packet::SubAck(SubAck {
                    packet_id: subscribe.packet_id,
                    return_codes: vec![0; subscribe.filters.len()],
                }));
            }
            Packet::Publish(publish) => {
                state.log.publishes.push(publish.clone());
                if self.drop_after == Some(self.acks) {
                    self.closed = true;
                } else if let (QoS::AtLeastOnce, Some(packet_id), false) =
                    (publish.qos, publish.packet_id, self.silent)
                {
                    self.acks += 1;
                    self.responses.push_back(Packet::PubAck { packet_id });
                }
            }
            Packet::PubAck { packet_id } => state.log.client_acks.push(*packet_id),
            Packet::PingReq => {
                state.log.pings += 1;
                if !self.silent {
                    self.responses.push_back(Packet::PingResp);
                }
            }
            Packet::Disconnect => {
                state.log.disconnects += 1;
                self.closed = true;
            }
            other => {
                return Err(AppError::ProtocolError(format!(
                    "Broker does not accept {} from clients",
                    other.name()
                )));
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Packet>, AppError> {
        if let Some(packet) = self.responses.pop_front() {
            return Ok(Some(packet));
        }
        if self.closed {
            return Ok(None);
        }
        match self.injected.recv().await {
            Some(packet) => Ok(Some(packet)),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

// ---------------------------------------------------------------------------
// MockInboundHandler
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MockInboundHandler {
    events: Arc<Mutex<Vec<InboundEvent>>>,
}

impl MockInboundHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<InboundEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl InboundHandler for MockInboundHandler {
    fn handle(&self, event: &InboundEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

//! Minimal MQTT 3.1.1 ingest endpoint.
//!
//! Speaks just enough of the protocol to feed the [`BrokerHooks`]: the
//! CONNECT/CONNACK handshake, publish acknowledgements, pings and
//! disconnects. Subscriptions are refused; nothing is fanned out.

use crate::admission::Decision;
use crate::config::ListenerConfig;
use crate::error::{ListenerError, PipelineError};
use crate::models::{ConnectionRequest, InboundMessage};
use bytes::BytesMut;
use rumqttc::mqttbytes::v4::{
    self, ConnAck, Connect, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use rumqttc::mqttbytes::{Error as CodecError, Protocol};
use rumqttc::QoS;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PINGRESP: [u8; 2] = [0xD0, 0x00];

/// Callbacks the transport invokes for every client event.
pub trait BrokerHooks: Send + Sync + 'static {
    fn validate_connection(&self, request: &ConnectionRequest) -> Decision;
    fn client_connected(&self, client_id: &str);
    fn intercept_publish(&self, message: InboundMessage);
}

pub struct IngestListener {
    listener: TcpListener,
    max_packet_size: usize,
}

impl IngestListener {
    pub async fn bind(config: &ListenerConfig) -> Result<Self, PipelineError> {
        let listener = TcpListener::bind(&config.address)
            .await
            .map_err(|e| PipelineError::Bind {
                address: config.address.clone(),
                source: e,
            })?;

        Ok(Self {
            listener,
            max_packet_size: config.max_packet_size,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires. Each connection runs in its
    /// own task and is closed on cancellation as well.
    pub async fn run(self, hooks: Arc<dyn BrokerHooks>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let hooks = hooks.clone();
                            let cancel = cancel.clone();
                            let max_packet_size = self.max_packet_size;
                            tokio::spawn(async move {
                                let mut session = Session {
                                    id: Uuid::new_v4(),
                                    stream,
                                    peer_addr,
                                    max_packet_size,
                                    read_buf: BytesMut::with_capacity(4096),
                                    write_buf: BytesMut::with_capacity(64),
                                };
                                if let Err(e) = session.serve(hooks.as_ref(), &cancel).await {
                                    debug!(
                                        "Session {} ({}) closed with error: {}",
                                        session.id, peer_addr, e
                                    );
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Accept error: {}", e);
                        }
                    }
                }
            }
        }

        info!("Ingest listener stopped.");
    }
}

struct Session {
    id: Uuid,
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_packet_size: usize,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl Session {
    async fn serve(&mut self, hooks: &dyn BrokerHooks, cancel: &CancellationToken) -> Result<(), ListenerError> {
        let connect = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            packet = self.next_packet(Some(CONNECT_TIMEOUT)) => match packet? {
                Some(Packet::Connect(connect)) => connect,
                Some(_) => return Err(ListenerError::ExpectedConnect),
                None => return Ok(()),
            },
        };

        // The v4 codec also accepts protocol level 5 but then reads the
        // payload with the v4 layout, so the client id cannot be trusted.
        if !matches!(connect.protocol, Protocol::V4) {
            warn!("Refusing {:?} connection from {}.", connect.protocol, self.peer_addr);
            return self.refuse(ConnectReturnCode::RefusedProtocolVersion).await;
        }

        // The client id is the VIN every reading is stored under.
        if connect.client_id.is_empty() {
            warn!("Refusing connection without client id from {}.", self.peer_addr);
            return self.refuse(ConnectReturnCode::BadClientId).await;
        }

        let request = self.connection_request(&connect);
        let decision = hooks.validate_connection(&request);

        ConnAck::new(decision.reason.into(), false).write(&mut self.write_buf)?;
        self.flush().await?;

        if !decision.accepted {
            info!("Connection rejected - VIN: {} ({:?})", request.client_id, decision.reason);
            return Ok(());
        }

        let client_id = request.client_id;
        hooks.client_connected(&client_id);

        // 1.5x the negotiated keep-alive, 0 disables the check.
        let idle_limit = match connect.keep_alive {
            0 => None,
            secs => Some(Duration::from_millis(u64::from(secs) * 1500)),
        };

        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                packet = self.next_packet(idle_limit) => match packet? {
                    Some(packet) => packet,
                    None => {
                        debug!("Client {} closed connection.", client_id);
                        return Ok(());
                    }
                },
            };

            match packet {
                Packet::Publish(publish) => {
                    let (qos, pkid) = (publish.qos, publish.pkid);
                    hooks.intercept_publish(InboundMessage::new(
                        client_id.as_str(),
                        publish.topic,
                        publish.payload,
                    ));
                    match qos {
                        QoS::AtMostOnce => {}
                        QoS::AtLeastOnce => {
                            PubAck::new(pkid).write(&mut self.write_buf)?;
                        }
                        QoS::ExactlyOnce => {
                            PubRec::new(pkid).write(&mut self.write_buf)?;
                        }
                    }
                }
                Packet::PubRel(pubrel) => {
                    PubComp::new(pubrel.pkid).write(&mut self.write_buf)?;
                }
                Packet::PingReq => {
                    self.write_buf.extend_from_slice(&PINGRESP);
                }
                Packet::Subscribe(subscribe) => {
                    debug!("Refusing subscription from {} on ingest endpoint.", client_id);
                    let codes = subscribe
                        .filters
                        .iter()
                        .map(|_| SubscribeReasonCode::Failure)
                        .collect();
                    SubAck::new(subscribe.pkid, codes).write(&mut self.write_buf)?;
                }
                Packet::Unsubscribe(unsubscribe) => {
                    UnsubAck::new(unsubscribe.pkid).write(&mut self.write_buf)?;
                }
                Packet::Disconnect => {
                    info!("Client disconnected: {}", client_id);
                    return Ok(());
                }
                Packet::Connect(_) => {
                    warn!("Second CONNECT from {} on open session, closing.", client_id);
                    return Ok(());
                }
                other => {
                    debug!("Ignoring packet from {}: {:?}", client_id, other);
                }
            }

            self.flush().await?;
        }
    }

    async fn refuse(&mut self, code: ConnectReturnCode) -> Result<(), ListenerError> {
        ConnAck::new(code, false).write(&mut self.write_buf)?;
        self.flush().await
    }

    fn connection_request(&self, connect: &Connect) -> ConnectionRequest {
        ConnectionRequest {
            client_id: connect.client_id.clone(),
            peer_addr: Some(self.peer_addr),
            username: connect.login.as_ref().map(|login| login.username.clone()),
            keep_alive_secs: connect.keep_alive,
            clean_session: connect.clean_session,
        }
    }

    /// Reads until one full packet is buffered. `Ok(None)` on a clean EOF.
    async fn next_packet(&mut self, idle_limit: Option<Duration>) -> Result<Option<Packet>, ListenerError> {
        loop {
            match v4::read(&mut self.read_buf, self.max_packet_size) {
                Ok(packet) => return Ok(Some(packet)),
                Err(CodecError::InsufficientBytes(_)) => {}
                Err(e) => return Err(e.into()),
            }

            let read = match idle_limit {
                Some(limit) => timeout(limit, self.stream.read_buf(&mut self.read_buf))
                    .await
                    .map_err(|_| ListenerError::KeepAliveTimeout)??,
                None => self.stream.read_buf(&mut self.read_buf).await?,
            };

            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    async fn flush(&mut self) -> Result<(), ListenerError> {
        if !self.write_buf.is_empty() {
            self.stream.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ReasonCode;
    use std::sync::Mutex;
    use tokio::net::TcpStream;

    #[derive(Default)]
    struct Recorder {
        accept: bool,
        connected: Mutex<Vec<String>>,
        published: Mutex<Vec<InboundMessage>>,
    }

    impl BrokerHooks for Recorder {
        fn validate_connection(&self, _request: &ConnectionRequest) -> Decision {
            if self.accept {
                Decision::accept()
            } else {
                Decision::reject(ReasonCode::NotAuthorized)
            }
        }

        fn client_connected(&self, client_id: &str) {
            self.connected.lock().unwrap().push(client_id.to_string());
        }

        fn intercept_publish(&self, message: InboundMessage) {
            self.published.lock().unwrap().push(message);
        }
    }

    async fn spawn_listener(hooks: Arc<Recorder>) -> (SocketAddr, CancellationToken) {
        spawn_listener_with_limit(hooks, 65536).await
    }

    async fn spawn_listener_with_limit(
        hooks: Arc<Recorder>,
        max_packet_size: usize,
    ) -> (SocketAddr, CancellationToken) {
        let listener = IngestListener::bind(&ListenerConfig {
            address: "127.0.0.1:0".to_string(),
            max_packet_size,
        })
        .await
        .unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(listener.run(hooks, cancel.clone()));
        (addr, cancel)
    }

    fn connect_bytes(client_id: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        Connect::new(client_id).write(&mut buf).unwrap();
        buf
    }

    /// Opens a session and completes the CONNECT/CONNACK handshake.
    async fn open_session(addr: SocketAddr, client_id: &str) -> (TcpStream, BytesMut) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&connect_bytes(client_id)).await.unwrap();
        let mut buf = BytesMut::new();
        match read_packet(&mut stream, &mut buf).await {
            Packet::ConnAck(ack) => assert_eq!(ack.code, ConnectReturnCode::Success),
            other => panic!("expected CONNACK, got {:?}", other),
        }
        (stream, buf)
    }

    async fn send_publish(stream: &mut TcpStream, topic: &str, qos: QoS, pkid: u16, payload: Vec<u8>) {
        let mut out = BytesMut::new();
        let mut publish = v4::Publish::new(topic, qos, payload);
        publish.pkid = pkid;
        publish.write(&mut out).unwrap();
        stream.write_all(&out).await.unwrap();
    }

    async fn assert_closed(stream: &mut TcpStream, within: Duration) {
        let mut sink = [0u8; 16];
        let n = timeout(within, stream.read(&mut sink))
            .await
            .expect("connection should be closed")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    async fn read_packet(stream: &mut TcpStream, buf: &mut BytesMut) -> Packet {
        loop {
            match v4::read(buf, 65536) {
                Ok(packet) => return packet,
                Err(CodecError::InsufficientBytes(_)) => {}
                Err(e) => panic!("codec error {:?}", e),
            }
            let n = timeout(Duration::from_secs(2), stream.read_buf(buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "connection closed early");
        }
    }

    #[tokio::test]
    async fn publish_before_connect_closes_connection() {
        let hooks = Arc::new(Recorder { accept: true, ..Default::default() });
        let (addr, cancel) = spawn_listener(hooks.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = BytesMut::new();
        rumqttc::mqttbytes::v4::Publish::new("motas/alerta", QoS::AtMostOnce, "x")
            .write(&mut buf)
            .unwrap();
        stream.write_all(&buf).await.unwrap();

        let mut sink = [0u8; 16];
        let n = timeout(Duration::from_secs(2), stream.read(&mut sink))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(hooks.published.lock().unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn rejected_client_gets_connack_code_and_is_closed() {
        let hooks = Arc::new(Recorder { accept: false, ..Default::default() });
        let (addr, cancel) = spawn_listener(hooks.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&connect_bytes("VIN123")).await.unwrap();

        let mut buf = BytesMut::new();
        match read_packet(&mut stream, &mut buf).await {
            Packet::ConnAck(ack) => {
                assert_eq!(ack.code, rumqttc::mqttbytes::v4::ConnectReturnCode::NotAuthorized)
            }
            other => panic!("expected CONNACK, got {:?}", other),
        }
        let mut sink = [0u8; 16];
        let n = timeout(Duration::from_secs(2), stream.read(&mut sink))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(hooks.connected.lock().unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn accepted_client_publishes_and_pings() {
        let hooks = Arc::new(Recorder { accept: true, ..Default::default() });
        let (addr, cancel) = spawn_listener(hooks.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&connect_bytes("VIN123")).await.unwrap();
        let mut buf = BytesMut::new();
        assert!(matches!(read_packet(&mut stream, &mut buf).await, Packet::ConnAck(_)));

        let mut out = BytesMut::new();
        let mut publish = rumqttc::mqttbytes::v4::Publish::new("motas/alerta", QoS::AtLeastOnce, "low battery");
        publish.pkid = 7;
        publish.write(&mut out).unwrap();
        stream.write_all(&out).await.unwrap();

        match read_packet(&mut stream, &mut buf).await {
            Packet::PubAck(ack) => assert_eq!(ack.pkid, 7),
            other => panic!("expected PUBACK, got {:?}", other),
        }

        stream.write_all(&[0xC0, 0x00]).await.unwrap();
        assert!(matches!(read_packet(&mut stream, &mut buf).await, Packet::PingResp));

        assert_eq!(*hooks.connected.lock().unwrap(), vec!["VIN123".to_string()]);
        let published = hooks.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].client_id, "VIN123");
        assert_eq!(published[0].topic, "motas/alerta");
        assert_eq!(published[0].payload_text(), "low battery");
        cancel.cancel();
    }

    #[tokio::test]
    async fn mqtt5_connect_is_refused_before_admission() {
        let hooks = Arc::new(Recorder { accept: true, ..Default::default() });
        let (addr, cancel) = spawn_listener(hooks.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut connect = vec![0x10, 0x13, 0x00, 0x04];
        connect.extend_from_slice(b"MQTT");
        connect.extend_from_slice(&[0x05, 0x02, 0x00, 0x3c, 0x00, 0x00, 0x06]);
        connect.extend_from_slice(b"VIN123");
        stream.write_all(&connect).await.unwrap();

        let mut buf = BytesMut::new();
        match read_packet(&mut stream, &mut buf).await {
            Packet::ConnAck(ack) => assert_eq!(ack.code, ConnectReturnCode::RefusedProtocolVersion),
            other => panic!("expected CONNACK, got {:?}", other),
        }
        assert_closed(&mut stream, Duration::from_secs(2)).await;
        assert!(hooks.connected.lock().unwrap().is_empty());
        assert!(hooks.published.lock().unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn empty_client_id_is_refused() {
        let hooks = Arc::new(Recorder { accept: true, ..Default::default() });
        let (addr, cancel) = spawn_listener(hooks.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&connect_bytes("")).await.unwrap();

        let mut buf = BytesMut::new();
        match read_packet(&mut stream, &mut buf).await {
            Packet::ConnAck(ack) => assert_eq!(ack.code, ConnectReturnCode::BadClientId),
            other => panic!("expected CONNACK, got {:?}", other),
        }
        assert_closed(&mut stream, Duration::from_secs(2)).await;
        assert!(hooks.connected.lock().unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn qos2_publish_completes_handshake() {
        let hooks = Arc::new(Recorder { accept: true, ..Default::default() });
        let (addr, cancel) = spawn_listener(hooks.clone()).await;
        let (mut stream, mut buf) = open_session(addr, "VIN123").await;

        send_publish(&mut stream, "motas/alerta", QoS::ExactlyOnce, 3, b"tilt".to_vec()).await;
        match read_packet(&mut stream, &mut buf).await {
            Packet::PubRec(rec) => assert_eq!(rec.pkid, 3),
            other => panic!("expected PUBREC, got {:?}", other),
        }

        let mut out = BytesMut::new();
        v4::PubRel::new(3).write(&mut out).unwrap();
        stream.write_all(&out).await.unwrap();
        match read_packet(&mut stream, &mut buf).await {
            Packet::PubComp(comp) => assert_eq!(comp.pkid, 3),
            other => panic!("expected PUBCOMP, got {:?}", other),
        }

        assert_eq!(hooks.published.lock().unwrap().len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn subscriptions_are_refused() {
        let hooks = Arc::new(Recorder { accept: true, ..Default::default() });
        let (addr, cancel) = spawn_listener(hooks.clone()).await;
        let (mut stream, mut buf) = open_session(addr, "VIN123").await;

        let mut out = BytesMut::new();
        let mut subscribe = v4::Subscribe::new("motas/#", QoS::AtMostOnce);
        subscribe.pkid = 5;
        subscribe.write(&mut out).unwrap();
        stream.write_all(&out).await.unwrap();

        match read_packet(&mut stream, &mut buf).await {
            Packet::SubAck(ack) => {
                assert_eq!(ack.pkid, 5);
                assert_eq!(ack.return_codes.len(), 1);
                assert!(matches!(ack.return_codes[0], SubscribeReasonCode::Failure));
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn idle_client_is_dropped_after_one_and_a_half_keep_alives() {
        let hooks = Arc::new(Recorder { accept: true, ..Default::default() });
        let (addr, cancel) = spawn_listener(hooks.clone()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut connect = Connect::new("VIN123");
        connect.keep_alive = 1;
        let mut out = BytesMut::new();
        connect.write(&mut out).unwrap();
        stream.write_all(&out).await.unwrap();

        let mut buf = BytesMut::new();
        assert!(matches!(read_packet(&mut stream, &mut buf).await, Packet::ConnAck(_)));

        let started = std::time::Instant::now();
        assert_closed(&mut stream, Duration::from_secs(5)).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1200), "closed too early: {:?}", elapsed);
        cancel.cancel();
    }

    #[tokio::test]
    async fn oversize_frame_closes_only_that_session() {
        let hooks = Arc::new(Recorder { accept: true, ..Default::default() });
        let (addr, cancel) = spawn_listener_with_limit(hooks.clone(), 1024).await;

        let (mut healthy, mut healthy_buf) = open_session(addr, "VIN-OK").await;
        let (mut noisy, _) = open_session(addr, "VIN-BIG").await;

        let mut out = BytesMut::new();
        let mut publish = v4::Publish::new("motas/alerta", QoS::AtLeastOnce, vec![b'x'; 4096]);
        publish.pkid = 1;
        publish.write(&mut out).unwrap();
        let _ = noisy.write_all(&out).await;
        assert_closed(&mut noisy, Duration::from_secs(2)).await;

        // Garbage on a third session is also contained.
        let (mut garbled, _) = open_session(addr, "VIN-BAD").await;
        garbled.write_all(&[0x00, 0x00]).await.unwrap();
        assert_closed(&mut garbled, Duration::from_secs(2)).await;

        send_publish(&mut healthy, "motas/alerta", QoS::AtLeastOnce, 9, b"ok".to_vec()).await;
        match read_packet(&mut healthy, &mut healthy_buf).await {
            Packet::PubAck(ack) => assert_eq!(ack.pkid, 9),
            other => panic!("expected PUBACK, got {:?}", other),
        }

        let published = hooks.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].client_id, "VIN-OK");
        cancel.cancel();
    }

    #[tokio::test]
    async fn publishes_reach_hooks_in_client_order() {
        let hooks = Arc::new(Recorder { accept: true, ..Default::default() });
        let (addr, cancel) = spawn_listener(hooks.clone()).await;
        let (mut stream, mut buf) = open_session(addr, "VIN123").await;

        for i in 0..20u16 {
            send_publish(&mut stream, "motas/status", QoS::AtMostOnce, 0, i.to_string().into_bytes()).await;
        }
        stream.write_all(&[0xC0, 0x00]).await.unwrap();
        assert!(matches!(read_packet(&mut stream, &mut buf).await, Packet::PingResp));

        let texts: Vec<String> = hooks
            .published
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.payload_text())
            .collect();
        let expected: Vec<String> = (0..20).map(|i: u16| i.to_string()).collect();
        assert_eq!(texts, expected);
        cancel.cancel();
    }
}

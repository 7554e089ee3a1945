//! tokio 기반 피어 클라이언트
//!
//! [`PeerSession`]을 실제 TCP/UDP 소켓에 연결한다.
//! - TCP 읽기/쓰기 태스크
//! - 현재 UDP 소켓 수신 태스크 (그룹 이탈 시 소켓은 재활용 레지스트리로)
//! - 주기 틱 태스크
//!
//! 세션 호출 뒤에는 항상 `pump`로 송신 지시를 비운다.
//! 락 순서: 펌프 락 → 세션 락

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::group::GroupId;
use crate::member::MemberId;
use crate::message::{ClientMessage, ServerMessage};
use crate::session::{ClientTransmit, PeerSession, SessionEvent};
use crate::socket_pool::PortRecycleRegistry;
use crate::{Config, Error, Result};

/// 현재 사용 중인 UDP 소켓
struct UdpHandle {
    socket: Arc<UdpSocket>,
    port: u16,
    task: JoinHandle<()>,
}

struct Inner {
    session: Mutex<PeerSession>,
    transmits: Receiver<ClientTransmit>,
    session_events: Receiver<SessionEvent>,
    pump_lock: Mutex<()>,
    tcp_tx: mpsc::UnboundedSender<ClientMessage>,
    /// 릴레이 연결이 끊기면 비워서 `next_event`가 None을 돌려주게 한다
    events_tx: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    udp: Mutex<Option<UdpHandle>>,
    parked: PortRecycleRegistry<Arc<UdpSocket>>,
    local_ip: IpAddr,
    max_frame_len: usize,
}

impl Inner {
    fn pump(self: &Arc<Self>) {
        let _guard = self.pump_lock.lock();
        while let Ok(transmit) = self.transmits.try_recv() {
            match transmit {
                ClientTransmit::Tcp(message) => {
                    if self.tcp_tx.send(message).is_err() {
                        debug!("TCP writer 종료됨, 메시지 폐기");
                    }
                }
                ClientTransmit::Udp { to, datagram } => self.send_udp(to, &datagram),
                ClientTransmit::OpenUdpSocket => match self.open_udp() {
                    Ok(local) => self.session.lock().on_udp_socket_opened(local, Instant::now()),
                    Err(e) => warn!("UDP 소켓 준비 실패: {}", e),
                },
                ClientTransmit::ParkUdpSocket => self.park_udp(),
            }
        }

        let events_tx = self.events_tx.lock();
        for event in self.session_events.try_iter() {
            if let Some(tx) = events_tx.as_ref() {
                let _ = tx.send(event);
            }
        }
    }

    fn send_udp(&self, to: SocketAddr, datagram: &Bytes) {
        let udp = self.udp.lock();
        let Some(handle) = udp.as_ref() else {
            trace!("UDP 소켓 없음, {} 행 데이터그램 폐기", to);
            return;
        };
        if let Err(e) = handle.socket.try_send_to(datagram, to) {
            debug!("UDP 송신 실패 -> {}: {}", to, e);
        }
    }

    /// 보관된 소켓이 있으면 재사용, 없으면 새로 바인드
    fn open_udp(self: &Arc<Self>) -> Result<SocketAddr> {
        let socket = match self.parked.take_latest() {
            Some((port, socket)) => {
                info!("보관된 UDP 소켓 재사용: port {}", port);
                socket
            }
            None => {
                let std_socket = std::net::UdpSocket::bind((self.local_ip, 0))?;
                std_socket.set_nonblocking(true)?;
                Arc::new(UdpSocket::from_std(std_socket)?)
            }
        };
        let local = socket.local_addr()?;

        let task = tokio::spawn(udp_recv_loop(Arc::clone(self), Arc::clone(&socket)));
        let previous = self.udp.lock().replace(UdpHandle {
            socket,
            port: local.port(),
            task,
        });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(local)
    }

    fn park_udp(&self) {
        let Some(handle) = self.udp.lock().take() else {
            return;
        };
        handle.task.abort();
        debug!("UDP 소켓 보관: port {}", handle.port);
        if let Some((port, _evicted)) = self.parked.park(handle.port, handle.socket) {
            debug!("보관 한도 초과, port {} 소켓 닫음", port);
        }
    }
}

/// 피어 클라이언트
pub struct PeerClient {
    inner: Arc<Inner>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerClient {
    /// 릴레이에 연결
    pub async fn connect(config: Config, relay_addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(relay_addr).await?;
        stream.set_nodelay(true)?;
        let local_ip = stream.local_addr()?.ip();
        info!("릴레이 연결: {} (local {})", relay_addr, local_ip);

        let (reader, writer) = stream.into_split();
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let tick_interval = config.link.tick_interval;
        let max_frame_len = config.relay.max_frame_len;
        let capacity = config.relay.recycle_registry_capacity;
        let (session, transmits, session_events) = PeerSession::new(config);

        let inner = Arc::new(Inner {
            session: Mutex::new(session),
            transmits,
            session_events,
            pump_lock: Mutex::new(()),
            tcp_tx,
            events_tx: Mutex::new(Some(events_tx)),
            udp: Mutex::new(None),
            parked: PortRecycleRegistry::new(capacity),
            local_ip,
            max_frame_len,
        });

        let tasks = vec![
            tokio::spawn(write_loop(writer, tcp_rx, max_frame_len)),
            tokio::spawn(read_loop(Arc::clone(&inner), reader)),
            tokio::spawn(tick_loop(Arc::clone(&inner), tick_interval)),
        ];

        Ok(Self {
            inner,
            events,
            tasks,
        })
    }

    pub fn member_id(&self) -> Option<MemberId> {
        self.inner.session.lock().member_id()
    }

    pub fn join(&self, group: GroupId) {
        self.inner.session.lock().join_group(group);
        self.inner.pump();
    }

    pub fn leave(&self) {
        self.inner.session.lock().leave_group();
        self.inner.pump();
    }

    /// 신뢰 전송
    pub fn send(&self, peer: MemberId, payload: &[u8]) -> Result<()> {
        let result = self
            .inner
            .session
            .lock()
            .send_reliable(peer, payload, Instant::now());
        self.inner.pump();
        result
    }

    /// 비신뢰 전송
    pub fn send_unreliable(&self, peer: MemberId, payload: Bytes) -> Result<()> {
        let result = self.inner.session.lock().send_unreliable(peer, payload);
        self.inner.pump();
        result
    }

    pub fn disconnect_direct(&self, peer: MemberId) -> Result<()> {
        let result = self.inner.session.lock().disconnect_direct(peer);
        self.inner.pump();
        result
    }

    pub fn is_direct(&self, peer: MemberId) -> bool {
        self.inner.session.lock().is_direct(peer)
    }

    /// 현재 UDP 소켓 로컬 포트
    pub fn udp_port(&self) -> Option<u16> {
        self.inner.udp.lock().as_ref().map(|handle| handle.port)
    }

    /// 다음 세션 이벤트. 연결이 끊기면 None
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// 모든 태스크 종료
    pub fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(handle) = self.inner.udp.lock().take() {
            handle.task.abort();
        }
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(inner: Arc<Inner>, mut reader: OwnedReadHalf) {
    loop {
        match codec::read_frame::<_, ServerMessage>(&mut reader, inner.max_frame_len).await {
            Ok(message) => {
                inner.session.lock().on_server_message(message, Instant::now());
                inner.pump();
            }
            Err(Error::ConnectionClosed) => {
                info!("릴레이 연결 종료");
                break;
            }
            Err(e) if e.is_transport_fatal() => {
                warn!("릴레이 전송 오류, 연결 종료: {}", e);
                break;
            }
            Err(e) => debug!("릴레이 메시지 무시: {}", e),
        }
    }

    inner.pump();
    inner.events_tx.lock().take();
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<ClientMessage>,
    max_frame_len: usize,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = codec::write_frame(&mut writer, &message, max_frame_len).await {
            warn!("릴레이 TCP 송신 실패: {}", e);
            break;
        }
    }
}

async fn udp_recv_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; 65535];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, src)) => {
                inner
                    .session
                    .lock()
                    .on_datagram(src, &buf[..len], Instant::now());
                inner.pump();
            }
            Err(e) => debug!("UDP 수신 오류: {}", e),
        }
    }
}

async fn tick_loop(inner: Arc<Inner>, interval: std::time::Duration) {
    let mut interval = tokio::time::interval(interval);
    loop {
        interval.tick().await;
        inner.session.lock().tick(Instant::now());
        inner.pump();
    }
}

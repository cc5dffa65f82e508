// UDPブロードキャスト送受信
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::usrtcp232::frame::{self, CommandFrame, ParsedFrame};
use crate::usrtcp232::CommandCode;
use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// 受信バッファの大きさ
pub const RECEIVE_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(r#"bind "{addr}" failed: {source}"#)]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(r#"i/o "{0}""#)]
    Io(#[from] io::Error),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("cancelled")]
    Cancelled,
}

/// データグラムの送受信
pub trait Datagram {
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

impl Datagram for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }
}

/// 1回の実行の締め切りと中止要求
#[derive(Debug, Clone)]
pub struct RunControl {
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl RunControl {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// 締め切りを過ぎたか、中止要求があればエラー
    pub fn check(&self) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            Err(TransportError::Cancelled)
        } else if Instant::now() >= self.deadline {
            Err(TransportError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}

/// 受信したフレーム
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub source: SocketAddr,
    pub command: CommandCode,
    pub payload: Vec<u8>,
}

impl ReceivedFrame {
    fn new(source: SocketAddr, parsed: &ParsedFrame<'_>) -> Self {
        Self {
            source,
            command: parsed.command,
            payload: parsed.payload.to_vec(),
        }
    }
}

/// ブロードキャストでコマンドを送り応答を待つ
#[derive(Debug)]
pub struct Transport<S = UdpSocket> {
    socket: S,
    broadcast: SocketAddrV4,
    echo_sources: Vec<IpAddr>,
}

impl Transport<UdpSocket> {
    /// ブロードキャスト用のソケットを開く
    ///
    /// 同じポート番号で待ち受けるのでアドレスの再利用を許可する。
    pub fn open(broadcast: Ipv4Addr, port: u16) -> Result<Self, TransportError> {
        let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let bind_failed = |source| TransportError::BindFailed {
            addr: bind_addr,
            source,
        };
        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_failed)?;
        socket.set_reuse_address(true).map_err(bind_failed)?;
        socket.set_broadcast(true).map_err(bind_failed)?;
        socket.set_nonblocking(true).map_err(bind_failed)?;
        socket.bind(&bind_addr.into()).map_err(bind_failed)?;
        let socket = UdpSocket::from_std(socket.into()).map_err(bind_failed)?;
        tracing::debug!("bound {} for broadcast to {}:{}", bind_addr, broadcast, port);
        Ok(Self::with_socket(socket, SocketAddrV4::new(broadcast, port)))
    }
}

impl<S: Datagram> Transport<S> {
    pub fn with_socket(socket: S, broadcast: SocketAddrV4) -> Self {
        Self {
            socket,
            broadcast,
            echo_sources: vec![IpAddr::V4(*broadcast.ip())],
        }
    }

    /// 自分の送信が返ってくる送信元アドレスを追加する
    pub fn ignore_source(&mut self, addr: IpAddr) {
        if !self.echo_sources.contains(&addr) {
            self.echo_sources.push(addr);
        }
    }

    #[inline]
    pub fn broadcast(&self) -> SocketAddrV4 {
        self.broadcast
    }

    #[inline]
    pub fn socket(&self) -> &S {
        &self.socket
    }

    fn is_echo(&self, source: &SocketAddr) -> bool {
        self.echo_sources.contains(&source.ip())
    }

    /// フレームを送信して `matcher` を満たす応答を待つ
    ///
    /// `per_attempt` の間に応答がなければ同じフレームを再送する。
    /// 再送回数に上限はなく `control` の締め切りか中止要求で終わる。
    /// 自分の送信の折り返し、解析できないフレーム、期待と違うフレームは読み捨てる。
    pub async fn send_and_await<F>(
        &self,
        frame: &CommandFrame,
        matcher: F,
        per_attempt: Duration,
        control: &RunControl,
    ) -> Result<ReceivedFrame, TransportError>
    where
        F: Fn(&ParsedFrame<'_>) -> bool,
    {
        let target = SocketAddr::V4(self.broadcast);
        let mut buf = [0u8; RECEIVE_BUFFER_SIZE];
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            control.check()?;
            self.socket.send_to(frame.as_bytes(), target).await?;
            tracing::trace!(target:"Tx->", "#{} {}", attempt, frame);
            let resend_at = Instant::now() + per_attempt;

            // 応答待ち
            loop {
                let received = tokio::select! {
                    biased;
                    _ = control.cancel.cancelled() => return Err(TransportError::Cancelled),
                    _ = time::sleep_until(control.deadline) => {
                        return Err(TransportError::DeadlineExceeded)
                    }
                    _ = time::sleep_until(resend_at) => None,
                    r = self.socket.recv_from(&mut buf) => Some(r?),
                };
                let Some((len, source)) = received else {
                    tracing::debug!("no reply to {} within {:?}, resend", frame.command(), per_attempt);
                    break;
                };
                let data = &buf[..len];
                tracing::trace!(target:"<-Rx", "{} [{}]", source, frame::dump(data));
                if self.is_echo(&source) {
                    continue;
                }
                match frame::decode(data) {
                    Ok(parsed) if matcher(&parsed) => return Ok(ReceivedFrame::new(source, &parsed)),
                    Ok(parsed) => tracing::debug!("unexpected frame from {}: {}", source, parsed),
                    Err(e) => tracing::debug!("discarded frame from {}: {}", source, e),
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Datagram;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    type Responder = Box<dyn Fn(&[u8]) -> Vec<(Vec<u8>, SocketAddr)> + Send + Sync>;

    /// 送信を記録して、決められた応答を返すデータグラム
    pub struct FakeLink {
        sent: Mutex<Vec<Vec<u8>>>,
        tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
        rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
        responder: Responder,
    }

    impl FakeLink {
        pub fn new<F>(responder: F) -> Self
        where
            F: Fn(&[u8]) -> Vec<(Vec<u8>, SocketAddr)> + Send + Sync + 'static,
        {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                sent: Mutex::new(vec![]),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                responder: Box::new(responder),
            }
        }

        /// 何も応答しない
        pub fn silent() -> Self {
            Self::new(|_| vec![])
        }

        /// 送信とは無関係に受信させる
        pub fn inject(&self, data: Vec<u8>, source: SocketAddr) {
            let _ = self.tx.send((data, source));
        }

        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }

        /// 送信したフレームのコマンドコード
        pub fn sent_commands(&self) -> Vec<u8> {
            self.sent().iter().map(|f| f[2]).collect()
        }
    }

    impl Datagram for FakeLink {
        async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
            self.sent.lock().unwrap().push(buf.to_vec());
            for reply in (self.responder)(buf) {
                let _ = self.tx.send(reply);
            }
            Ok(buf.len())
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some((data, source)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), source))
                }
                None => std::future::pending().await,
            }
        }
    }

    /// 実行後に送信内容を調べるために共有する
    impl Datagram for Arc<FakeLink> {
        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            self.as_ref().send_to(buf, target).await
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            self.as_ref().recv_from(buf).await
        }
    }
}

#[cfg(test)]
use testing::FakeLink;

#[cfg(test)]
const BROADCAST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::BROADCAST, 1500);

#[cfg(test)]
fn device_addr() -> SocketAddr {
    "192.168.1.200:1500".parse().unwrap()
}

#[cfg(test)]
fn is_basic_set_ack(f: &ParsedFrame<'_>) -> bool {
    f.command == CommandCode::BasicSet && f.payload.is_empty()
}

#[tokio::test(start_paused = true)]
async fn test1() {
    // 応答があれば再送しない
    let link = FakeLink::new(|sent| {
        if sent[2] == CommandCode::BasicSet.code() {
            vec![(vec![0xFF, 0x01, 0x05, 0x06], device_addr())]
        } else {
            vec![]
        }
    });
    let transport = Transport::with_socket(link, BROADCAST);
    let control = RunControl::new(Duration::from_secs(10), CancellationToken::new());
    let frame = frame::encode(CommandCode::BasicSet, &[1, 2, 3]);

    let started = Instant::now();
    let received = transport
        .send_and_await(&frame, is_basic_set_ack, Duration::from_secs(2), &control)
        .await
        .unwrap();
    assert_eq!(received.source, device_addr());
    assert_eq!(received.command, CommandCode::BasicSet);
    assert!(received.payload.is_empty());
    assert_eq!(transport.socket().sent().len(), 1);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test2() {
    // 2秒ごとに再送して締め切りで終わる
    let transport = Transport::with_socket(FakeLink::silent(), BROADCAST);
    let control = RunControl::new(Duration::from_secs(10), CancellationToken::new());
    let frame = frame::encode(CommandCode::Scan, &[]);

    let result = transport
        .send_and_await(&frame, |_| true, Duration::from_secs(2), &control)
        .await;
    assert!(matches!(result, Err(TransportError::DeadlineExceeded)));
    let sent = transport.socket().sent();
    assert_eq!(sent.len(), 5);
    assert!(sent.iter().all(|f| f == frame.as_bytes()));
}

#[tokio::test(start_paused = true)]
async fn test3() {
    // ブロードキャストアドレスからの折り返しは読み捨てて、再送もしない
    let link = FakeLink::new(|sent| {
        vec![
            (sent.to_vec(), SocketAddr::V4(BROADCAST)),
            (vec![0xFF, 0x01, 0x05, 0x06], device_addr()),
        ]
    });
    let transport = Transport::with_socket(link, BROADCAST);
    let control = RunControl::new(Duration::from_secs(10), CancellationToken::new());
    // 折り返しのフレームもBasicSetの応答と同じ形にしておく
    let frame = frame::encode(CommandCode::BasicSet, &[]);

    let received = transport
        .send_and_await(&frame, is_basic_set_ack, Duration::from_secs(2), &control)
        .await
        .unwrap();
    assert_eq!(received.source, device_addr());
    assert_eq!(transport.socket().sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test4() {
    // 追加した送信元からの折り返しも読み捨てる
    let local: SocketAddr = "192.168.1.102:1500".parse().unwrap();
    let link = FakeLink::new(move |sent| vec![(sent.to_vec(), local)]);
    let mut transport = Transport::with_socket(link, BROADCAST);
    transport.ignore_source(local.ip());
    let control = RunControl::new(Duration::from_secs(3), CancellationToken::new());
    let frame = frame::encode(CommandCode::BasicSet, &[]);

    let result = transport
        .send_and_await(&frame, is_basic_set_ack, Duration::from_secs(2), &control)
        .await;
    assert!(matches!(result, Err(TransportError::DeadlineExceeded)));
    assert_eq!(transport.socket().sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test5() {
    // 壊れたフレームと違うフレームは読み捨てて待ち続ける
    let link = FakeLink::silent();
    link.inject(vec![0xFF, 0x01], device_addr());
    link.inject(vec![0xFF, 0x01, 0x05, 0x07], device_addr());
    link.inject(vec![0xFF, 0x01, 0x06, 0x07], device_addr());
    link.inject(vec![0xFF, 0x01, 0x05, 0x06], device_addr());
    let transport = Transport::with_socket(link, BROADCAST);
    let control = RunControl::new(Duration::from_secs(10), CancellationToken::new());
    let frame = frame::encode(CommandCode::BasicSet, &[9]);

    let received = transport
        .send_and_await(&frame, is_basic_set_ack, Duration::from_secs(2), &control)
        .await
        .unwrap();
    assert_eq!(received.command, CommandCode::BasicSet);
    assert_eq!(transport.socket().sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test6() {
    // 中止要求で受信待ちを打ち切る
    let transport = Transport::with_socket(FakeLink::silent(), BROADCAST);
    let cancel = CancellationToken::new();
    let control = RunControl::new(Duration::from_secs(10), cancel.clone());
    let frame = frame::encode(CommandCode::Scan, &[]);

    tokio::spawn(async move {
        time::sleep(Duration::from_millis(4500)).await;
        cancel.cancel();
    });
    let started = Instant::now();
    let result = transport
        .send_and_await(&frame, |_| true, Duration::from_secs(2), &control)
        .await;
    assert!(matches!(result, Err(TransportError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(transport.socket().sent().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test7() {
    // 中止済みなら送信しない
    let transport = Transport::with_socket(FakeLink::silent(), BROADCAST);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let control = RunControl::new(Duration::from_secs(10), cancel);
    let frame = frame::encode(CommandCode::Scan, &[]);

    let result = transport
        .send_and_await(&frame, |_| true, Duration::from_secs(2), &control)
        .await;
    assert!(matches!(result, Err(TransportError::Cancelled)));
    assert!(transport.socket().sent().is_empty());
}

// 機器探索から設定、再起動までの一連の手順
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::local_interface::{self, LocalInterface, LocalInterfaceError, StaticIpv4Config};
use crate::provisioning_settings::ProvisioningSettings;
use crate::usrtcp232::address::{self, AddressError, MacAddress};
use crate::usrtcp232::frame::{self, FrameError, ParsedFrame};
use crate::usrtcp232::payload::{BasicSetting, ComSetting, Credentials, RebootRequest, Request, ScanReply};
use crate::usrtcp232::transport::{Datagram, RunControl, Transport, TransportError};
use crate::usrtcp232::CommandCode;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// 入力項目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    DeviceIp,
    LocalIp,
    Gateway,
    SubnetMask,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Field::DeviceIp => write!(f, "device ip"),
            Field::LocalIp => write!(f, "local ip"),
            Field::Gateway => write!(f, "gateway"),
            Field::SubnetMask => write!(f, "subnet mask"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is empty")]
    Empty(Field),
    #[error(r#"{0} "{1}" is not an IPv4 address"#)]
    Malformed(Field, String),
}

impl ValidationError {
    pub fn field(&self) -> Field {
        match self {
            ValidationError::Empty(field) => *field,
            ValidationError::Malformed(field, _) => *field,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(r#"binary encode "{0}""#)]
    Encode(#[from] bincode::error::EncodeError),
    #[error(r#"address "{0}""#)]
    Address(#[from] AddressError),
    #[error(r#"frame "{0}""#)]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(r#"validation "{0}""#)]
    Validation(#[from] ValidationError),
    #[error(r#"precondition "{0}""#)]
    Precondition(#[from] LocalInterfaceError),
    #[error(r#"protocol "{0}""#)]
    Protocol(#[from] ProtocolError),
    #[error(r#"transport "{0}""#)]
    Transport(TransportError),
    #[error("no reply within the deadline")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

impl From<TransportError> for ProvisionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::DeadlineExceeded => ProvisionError::Timeout,
            TransportError::Cancelled => ProvisionError::Cancelled,
            e => ProvisionError::Transport(e),
        }
    }
}

impl From<bincode::error::EncodeError> for ProvisionError {
    fn from(e: bincode::error::EncodeError) -> Self {
        ProvisionError::Protocol(e.into())
    }
}

impl From<AddressError> for ProvisionError {
    fn from(e: AddressError) -> Self {
        ProvisionError::Protocol(e.into())
    }
}

impl ProvisionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ProvisionError::Validation(_) => FailureKind::Validation,
            ProvisionError::Precondition(_) => FailureKind::Precondition,
            ProvisionError::Protocol(_) => FailureKind::Protocol,
            ProvisionError::Transport(_) => FailureKind::Transport,
            ProvisionError::Timeout => FailureKind::Timeout,
            ProvisionError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// 失敗の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Validation,
    Precondition,
    Protocol,
    Transport,
    Timeout,
    Cancelled,
}

/// 状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Idle,
    Discovering,
    ConfiguringBasic,
    ConfiguringSerial,
    Rebooting,
    Done,
    Failed(FailureKind),
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProvisioningState::Failed(kind) => write!(f, "Failed({:?})", kind),
            state => write!(f, "{:?}", state),
        }
    }
}

/// 1回の実行結果
#[derive(Debug)]
pub enum ProvisioningOutcome {
    Success { device: MacAddress },
    Failure(ProvisionError),
}

impl ProvisioningOutcome {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, ProvisioningOutcome::Success { .. })
    }
}

impl fmt::Display for ProvisioningOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProvisioningOutcome::Success { device } => write!(f, "success, device {}", device),
            ProvisioningOutcome::Failure(e) => write!(f, "failure, {}", e),
        }
    }
}

/// 入力されたままの設定値
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningForm {
    pub device_ip: String,
    pub local_ip: String,
    pub gateway: String,
    pub subnet_mask: String,
}

impl Default for ProvisioningForm {
    fn default() -> Self {
        Self {
            device_ip: "192.168.1.101".to_string(),
            local_ip: "192.168.1.102".to_string(),
            gateway: "192.168.1.1".to_string(),
            subnet_mask: "255.255.255.0".to_string(),
        }
    }
}

/// 検査済みの設定値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkParameters {
    pub device_ip: [u8; 4],
    pub local_ip: [u8; 4],
    pub gateway: [u8; 4],
    pub subnet_mask: [u8; 4],
}

impl NetworkParameters {
    /// シリアルポート設定に書き込む接続先(自端末)のIPアドレス文字列
    pub fn server_ip(&self) -> Result<[u8; 30], AddressError> {
        address::to_ascii_padded(&Ipv4Addr::from(self.local_ip).to_string())
    }
}

/// 入力を先頭の項目から順に検査する
pub fn validate(form: &ProvisioningForm) -> Result<NetworkParameters, ValidationError> {
    let check = |field: Field, text: &str| {
        let text = text.trim();
        if text.is_empty() {
            Err(ValidationError::Empty(field))
        } else {
            address::parse_ipv4(text).map_err(|_| ValidationError::Malformed(field, text.to_string()))
        }
    };
    Ok(NetworkParameters {
        device_ip: check(Field::DeviceIp, &form.device_ip)?,
        local_ip: check(Field::LocalIp, &form.local_ip)?,
        gateway: check(Field::Gateway, &form.gateway)?,
        subnet_mask: check(Field::SubnetMask, &form.subnet_mask)?,
    })
}

/// 機器探索の応答は32バイトのペイロードを持つ
fn is_scan_reply(f: &ParsedFrame<'_>) -> bool {
    f.command == CommandCode::Scan && f.payload.len() == ScanReply::PAYLOAD_LEN
}

/// ペイロードのない4バイトの応答
fn acknowledges(command: CommandCode) -> impl Fn(&ParsedFrame<'_>) -> bool {
    move |f| f.command == command && f.payload.is_empty()
}

/// ブロードキャストで機器を探してMACアドレスを得る
#[tracing::instrument(skip_all)]
pub async fn discover<S: Datagram>(
    transport: &Transport<S>,
    per_attempt: Duration,
    control: &RunControl,
) -> Result<MacAddress, ProvisionError> {
    let scan = frame::encode(CommandCode::Scan, &[]);
    let received = transport
        .send_and_await(&scan, is_scan_reply, per_attempt, control)
        .await?;
    let reply = ScanReply::parse(&received.payload).map_err(ProtocolError::from)?;
    tracing::info!("found {} at {}", reply.device, received.source);
    Ok(reply.device)
}

/// 1台の機器を設定する
#[derive(Debug)]
pub struct Provisioner {
    settings: ProvisioningSettings,
    credentials: Credentials,
    state: ProvisioningState,
    transitions: Vec<ProvisioningState>,
    device: Option<MacAddress>,
}

impl Provisioner {
    pub fn new(settings: ProvisioningSettings) -> Self {
        Self {
            settings,
            credentials: Credentials::FACTORY,
            state: ProvisioningState::Idle,
            transitions: vec![],
            device: None,
        }
    }

    #[inline]
    pub fn state(&self) -> ProvisioningState {
        self.state
    }

    /// Idle以降に通過した状態
    #[inline]
    pub fn transitions(&self) -> &[ProvisioningState] {
        &self.transitions
    }

    /// 探索で見つけた機器
    #[inline]
    pub fn device(&self) -> Option<MacAddress> {
        self.device
    }

    fn enter(&mut self, next: ProvisioningState) {
        tracing::info!("{} -> {}", self.state, next);
        self.state = next;
        self.transitions.push(next);
    }

    /// 最後まで実行して結果を返す
    ///
    /// `open` は入力の検査と自端末の設定が済んでから呼ぶ。
    /// ソケットはこの呼び出しの中で閉じる。
    #[tracing::instrument(skip_all)]
    pub async fn run<L, S, F>(
        &mut self,
        form: &ProvisioningForm,
        local: &L,
        open: F,
        cancel: CancellationToken,
    ) -> ProvisioningOutcome
    where
        L: LocalInterface,
        S: Datagram,
        F: FnOnce() -> Result<Transport<S>, TransportError>,
    {
        match self.execute(form, local, open, &cancel).await {
            Ok(device) => {
                self.enter(ProvisioningState::Done);
                ProvisioningOutcome::Success { device }
            }
            Err(e) => {
                tracing::error!("provisioning failed: {}", e);
                self.enter(ProvisioningState::Failed(e.kind()));
                ProvisioningOutcome::Failure(e)
            }
        }
    }

    async fn execute<L, S, F>(
        &mut self,
        form: &ProvisioningForm,
        local: &L,
        open: F,
        cancel: &CancellationToken,
    ) -> Result<MacAddress, ProvisionError>
    where
        L: LocalInterface,
        S: Datagram,
        F: FnOnce() -> Result<Transport<S>, TransportError>,
    {
        let params = validate(form)?;
        let server_ip = params.server_ip()?;

        // 自端末を機器と同じネットワークに置く
        let config = StaticIpv4Config {
            address: Ipv4Addr::from(params.local_ip),
            gateway: Ipv4Addr::from(params.gateway),
            subnet_mask: Ipv4Addr::from(params.subnet_mask),
            dns: self.settings.Dns,
            backup_dns: self.settings.BackupDns,
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            r = local_interface::configure(local, &config) => r?,
        }
        // インターフェースが使えるようになるまで待つ
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProvisionError::Cancelled),
            _ = time::sleep(self.settings.settle_delay()) => {}
        }

        let mut transport = open()?;
        transport.ignore_source(IpAddr::V4(config.address));
        let per_attempt = self.settings.receive_timeout();
        let control = RunControl::new(self.settings.overall_timeout(), cancel.clone());

        self.enter(ProvisioningState::Discovering);
        let device = discover(&transport, per_attempt, &control).await?;
        self.device = Some(device);

        self.enter(ProvisioningState::ConfiguringBasic);
        let basic = BasicSetting::new(
            device,
            self.credentials,
            params.device_ip,
            params.gateway,
            params.subnet_mask,
        );
        transport
            .send_and_await(
                &basic.to_frame()?,
                acknowledges(CommandCode::BasicSet),
                per_attempt,
                &control,
            )
            .await?;

        self.enter(ProvisioningState::ConfiguringSerial);
        let com = ComSetting::new(device, self.credentials, server_ip);
        transport
            .send_and_await(
                &com.to_frame()?,
                acknowledges(CommandCode::ComSet),
                per_attempt,
                &control,
            )
            .await?;

        self.enter(ProvisioningState::Rebooting);
        let reboot = RebootRequest {
            device,
            credentials: self.credentials,
        };
        // 機器は再起動要求にもシリアルポート設定のコマンドコードで応答する
        transport
            .send_and_await(
                &reboot.to_frame()?,
                acknowledges(CommandCode::ComSet),
                per_attempt,
                &control,
            )
            .await?;

        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usrtcp232::transport::testing::FakeLink;
    use std::io;
    use std::net::{SocketAddr, SocketAddrV4};
    use std::sync::Arc;
    use tokio::time::Instant;

    const BROADCAST: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::BROADCAST, 1500);
    const MAC: MacAddress = MacAddress([0x9C, 0xA5, 0x25, 0x01, 0xAB, 0x0F]);

    fn device_addr() -> SocketAddr {
        "192.168.1.200:1500".parse().unwrap()
    }

    fn scan_reply() -> Vec<u8> {
        let mut payload = [0u8; 32];
        payload[5..11].copy_from_slice(&MAC.0);
        frame::encode(CommandCode::Scan, &payload).as_bytes().to_vec()
    }

    fn ack(command: CommandCode) -> Vec<u8> {
        frame::encode(command, &[]).as_bytes().to_vec()
    }

    /// 実機と同じように応答する
    fn device(sent: &[u8]) -> Vec<(Vec<u8>, SocketAddr)> {
        let reply = match CommandCode::try_from(sent[2]) {
            Ok(CommandCode::Scan) => scan_reply(),
            Ok(CommandCode::BasicSet) => ack(CommandCode::BasicSet),
            Ok(CommandCode::ComSet) | Ok(CommandCode::Reboot) => ack(CommandCode::ComSet),
            _ => return vec![],
        };
        vec![(reply, device_addr())]
    }

    fn open(link: &Arc<FakeLink>) -> impl FnOnce() -> Result<Transport<Arc<FakeLink>>, TransportError> {
        let link = Arc::clone(link);
        move || Ok(Transport::with_socket(link, BROADCAST))
    }

    struct Refuses;

    impl LocalInterface for Refuses {
        async fn set_ethernet_config(&self, _config: &StaticIpv4Config) -> io::Result<i32> {
            Ok(1)
        }
    }

    #[test]
    fn test1() {
        let params = validate(&ProvisioningForm::default()).unwrap();
        assert_eq!(params.device_ip, [192, 168, 1, 101]);
        assert_eq!(params.local_ip, [192, 168, 1, 102]);
        assert_eq!(&params.server_ip().unwrap()[..14], b"192.168.1.102\0");

        let form = ProvisioningForm {
            device_ip: " ".to_string(),
            gateway: "abc".to_string(),
            ..Default::default()
        };
        assert_eq!(validate(&form), Err(ValidationError::Empty(Field::DeviceIp)));

        let form = ProvisioningForm {
            gateway: "abc".to_string(),
            subnet_mask: "".to_string(),
            ..Default::default()
        };
        let e = validate(&form).unwrap_err();
        assert_eq!(e.field(), Field::Gateway);
        assert_eq!(e, ValidationError::Malformed(Field::Gateway, "abc".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test2() {
        // 正常に最後まで進む
        let link = Arc::new(FakeLink::new(device));
        let mut provisioner = Provisioner::new(ProvisioningSettings::default());
        let outcome = provisioner
            .run(
                &ProvisioningForm::default(),
                &local_interface::Unmanaged,
                open(&link),
                CancellationToken::new(),
            )
            .await;

        assert!(outcome.is_success());
        assert!(matches!(outcome, ProvisioningOutcome::Success { device } if device == MAC));
        assert_eq!(provisioner.device(), Some(MAC));
        assert_eq!(provisioner.state(), ProvisioningState::Done);
        assert_eq!(
            provisioner.transitions(),
            &[
                ProvisioningState::Discovering,
                ProvisioningState::ConfiguringBasic,
                ProvisioningState::ConfiguringSerial,
                ProvisioningState::Rebooting,
                ProvisioningState::Done,
            ]
        );
        assert_eq!(link.sent_commands(), vec![0x01, 0x05, 0x06, 0x02]);

        let sent = link.sent();
        assert_eq!(sent[0], vec![0xFF, 0x01, 0x01, 0x02]);
        // 基本設定とシリアルポート設定に見つけた機器のMACアドレスが入る
        assert_eq!(&sent[1][3..9], &MAC.0);
        assert_eq!(&sent[2][3..9], &MAC.0);
        assert_eq!(&sent[3][3..9], &MAC.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test3() {
        // ブロードキャストと自端末からの折り返しで再送しない
        let local: SocketAddr = "192.168.1.102:1500".parse().unwrap();
        let link = Arc::new(FakeLink::new(move |sent| {
            let mut replies = vec![
                (sent.to_vec(), SocketAddr::V4(BROADCAST)),
                (sent.to_vec(), local),
            ];
            replies.extend(device(sent));
            replies
        }));
        let mut provisioner = Provisioner::new(ProvisioningSettings::default());
        let outcome = provisioner
            .run(
                &ProvisioningForm::default(),
                &local_interface::Unmanaged,
                open(&link),
                CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(link.sent_commands(), vec![0x01, 0x05, 0x06, 0x02]);
    }

    #[tokio::test(start_paused = true)]
    async fn test4() {
        // 応答がなければ締め切りで失敗する
        let link = Arc::new(FakeLink::silent());
        let mut provisioner = Provisioner::new(ProvisioningSettings::default());
        let started = Instant::now();
        let outcome = provisioner
            .run(
                &ProvisioningForm::default(),
                &local_interface::Unmanaged,
                open(&link),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, ProvisioningOutcome::Failure(ProvisionError::Timeout)));
        assert_eq!(provisioner.state(), ProvisioningState::Failed(FailureKind::Timeout));
        assert_eq!(provisioner.device(), None);
        // 待機2秒と全体の締め切り10秒
        assert!(started.elapsed() >= Duration::from_secs(12));
        assert!(started.elapsed() < Duration::from_secs(13));
        assert!(link.sent_commands().iter().all(|c| *c == 0x01));
        assert_eq!(link.sent().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test5() {
        // 入力が空ならソケットを開かない
        let mut opened = false;
        let mut provisioner = Provisioner::new(ProvisioningSettings::default());
        let form = ProvisioningForm {
            device_ip: String::new(),
            ..Default::default()
        };
        let outcome = provisioner
            .run(
                &form,
                &local_interface::Unmanaged,
                || -> Result<Transport<FakeLink>, TransportError> {
                    opened = true;
                    Ok(Transport::with_socket(FakeLink::silent(), BROADCAST))
                },
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            outcome,
            ProvisioningOutcome::Failure(ProvisionError::Validation(ValidationError::Empty(
                Field::DeviceIp
            )))
        ));
        assert_eq!(
            provisioner.transitions(),
            &[ProvisioningState::Failed(FailureKind::Validation)]
        );
        assert!(!opened);
    }

    #[tokio::test(start_paused = true)]
    async fn test6() {
        // 自端末の設定に失敗したら探索しない
        let link = Arc::new(FakeLink::new(device));
        let mut provisioner = Provisioner::new(ProvisioningSettings::default());
        let outcome = provisioner
            .run(
                &ProvisioningForm::default(),
                &Refuses,
                open(&link),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            outcome,
            ProvisioningOutcome::Failure(ProvisionError::Precondition(
                LocalInterfaceError::Rejected { code: 1, .. }
            ))
        ));
        assert_eq!(provisioner.state(), ProvisioningState::Failed(FailureKind::Precondition));
        assert!(link.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test7() {
        // 再起動要求への応答が再起動のコマンドコードだと受け付けない
        let link = Arc::new(FakeLink::new(|sent| match CommandCode::try_from(sent[2]) {
            Ok(CommandCode::Reboot) => vec![(ack(CommandCode::Reboot), device_addr())],
            _ => device(sent),
        }));
        let mut provisioner = Provisioner::new(ProvisioningSettings::default());
        let outcome = provisioner
            .run(
                &ProvisioningForm::default(),
                &local_interface::Unmanaged,
                open(&link),
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(outcome, ProvisioningOutcome::Failure(ProvisionError::Timeout)));
        assert_eq!(
            provisioner.transitions(),
            &[
                ProvisioningState::Discovering,
                ProvisioningState::ConfiguringBasic,
                ProvisioningState::ConfiguringSerial,
                ProvisioningState::Rebooting,
                ProvisioningState::Failed(FailureKind::Timeout),
            ]
        );
        let commands = link.sent_commands();
        assert_eq!(&commands[..4], &[0x01, 0x05, 0x06, 0x02]);
        assert!(commands[4..].iter().all(|c| *c == 0x02));
        assert!(commands.len() > 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test8() {
        // 探索中の中止
        let link = Arc::new(FakeLink::silent());
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_secs(5)).await;
            canceller.cancel();
        });
        let mut provisioner = Provisioner::new(ProvisioningSettings::default());
        let outcome = provisioner
            .run(
                &ProvisioningForm::default(),
                &local_interface::Unmanaged,
                open(&link),
                cancel,
            )
            .await;
        assert!(matches!(outcome, ProvisioningOutcome::Failure(ProvisionError::Cancelled)));
        assert_eq!(provisioner.state(), ProvisioningState::Failed(FailureKind::Cancelled));
        // 待機2秒の後、0秒と2秒に送信して5秒で中止
        assert_eq!(link.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test9() {
        // 壊れたフレームは読み捨てて進む
        let link = Arc::new(FakeLink::new(|sent| {
            let mut replies = vec![
                (vec![0xFF, 0x01], device_addr()),
                (vec![0xFF, 0x21, 0x01, 0x00, 0x00], device_addr()),
            ];
            let mut corrupt = scan_reply();
            corrupt[20] ^= 0x55;
            replies.push((corrupt, device_addr()));
            replies.extend(device(sent));
            replies
        }));
        let mut provisioner = Provisioner::new(ProvisioningSettings::default());
        let outcome = provisioner
            .run(
                &ProvisioningForm::default(),
                &local_interface::Unmanaged,
                open(&link),
                CancellationToken::new(),
            )
            .await;
        assert!(outcome.is_success());
        assert_eq!(link.sent_commands(), vec![0x01, 0x05, 0x06, 0x02]);
    }

    #[tokio::test(start_paused = true)]
    async fn test10() {
        // 探索だけ
        let link = FakeLink::new(device);
        let transport = Transport::with_socket(link, BROADCAST);
        let control = RunControl::new(Duration::from_secs(10), CancellationToken::new());
        let found = discover(&transport, Duration::from_secs(2), &control).await.unwrap();
        assert_eq!(found, MAC);
        assert_eq!(found.to_string(), "9C:A5:25:01:AB:0F");
    }
}

// USR-TCP232 設定プロトコルのペイロード
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
// 多バイト値はリトルエンディアン、IPv4アドレスは下位オクテットが先頭
//
use crate::usrtcp232::address::{MacAddress, to_wire_order};
use crate::usrtcp232::{CommandCode, CommandFrame, FrameError};
use bincode;
use core::result;
use nom::Parser;
use nom::bytes::complete::take;
use nom::combinator::{all_consuming, map};
use std::fmt;

/// 固定長整数、リトルエンディアン
pub fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

/// 応答を受け取るコマンド
pub trait Request: bincode::Encode + Sized {
    const COMMAND: CommandCode;

    /// ペイロードを符号化してフレームにする
    fn to_frame(&self) -> result::Result<CommandFrame, bincode::error::EncodeError> {
        let payload = bincode::encode_to_vec(self, wire_config())?;
        Ok(CommandFrame::new(Self::COMMAND, &payload))
    }
}

impl bincode::Encode for MacAddress {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.0, encoder)
    }
}

/// 認証情報(ユーザー名とパスワード)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Credentials([u8; 12]);

impl Credentials {
    /// 工場出荷時の "admin" / "admin"
    pub const FACTORY: Self = Self(*b"admin\0admin\0");

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl Default for Credentials {
    #[inline]
    fn default() -> Self {
        Self::FACTORY
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Credentials(############)")
    }
}

impl bincode::Encode for Credentials {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.0, encoder)
    }
}

/// 0x02 再起動
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RebootRequest {
    pub device: MacAddress,
    pub credentials: Credentials,
}

impl Request for RebootRequest {
    const COMMAND: CommandCode = CommandCode::Reboot;
}

impl bincode::Encode for RebootRequest {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.device, encoder)?;
        bincode::Encode::encode(&self.credentials, encoder)?;
        Ok(())
    }
}

/// 0x05 基本設定
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BasicSetting {
    pub device: MacAddress,
    pub credentials: Credentials,
    pub flags: u8,
    pub http_port: u16,
    pub ip: [u8; 4],
    pub gateway: [u8; 4],
    pub subnet_mask: [u8; 4],
    pub module_name: [u8; 14],
    pub device_id: u16,
    pub dns: [u8; 4],
    pub short_connection_timeout: u8,
}

impl BasicSetting {
    pub const VENDOR_BLOCK: [u8; 3] = [0x95, 0x63, 0x03];
    pub const FLAG_STATIC_IP: u8 = 0x80; // 0:DHCP, 1:静的IP
    pub const FLAG_SHORT_CONNECTION: u8 = 0x20; // 0:長時間接続, 1:短時間接続
    pub const FLAG_CLEAR_CACHE: u8 = 0x10; // 0:キャッシュを残す, 1:キャッシュを消す
    pub const MODULE_NAME: [u8; 14] = *b"USR-TCP232-S1\0";
    pub const ID_TYPE: u8 = 0xB0;
    pub const DEFAULT_DNS: [u8; 4] = [208, 67, 222, 222];

    /// 静的IPアドレスを設定する
    pub fn new(
        device: MacAddress,
        credentials: Credentials,
        ip: [u8; 4],
        gateway: [u8; 4],
        subnet_mask: [u8; 4],
    ) -> Self {
        Self {
            device,
            credentials,
            flags: Self::FLAG_STATIC_IP,
            http_port: 80,
            ip,
            gateway,
            subnet_mask,
            module_name: Self::MODULE_NAME,
            device_id: 0,
            dns: Self::DEFAULT_DNS,
            short_connection_timeout: 3,
        }
    }
}

impl Request for BasicSetting {
    const COMMAND: CommandCode = CommandCode::BasicSet;
}

impl bincode::Encode for BasicSetting {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.device, encoder)?;
        bincode::Encode::encode(&self.credentials, encoder)?;
        bincode::Encode::encode(&Self::VENDOR_BLOCK, encoder)?;
        bincode::Encode::encode(&self.flags, encoder)?;
        bincode::Encode::encode(&[0u8; 2], encoder)?; // 固定値
        bincode::Encode::encode(&self.http_port, encoder)?;
        bincode::Encode::encode(&0u8, encoder)?; // 固定値
        bincode::Encode::encode(&to_wire_order(self.ip), encoder)?;
        bincode::Encode::encode(&to_wire_order(self.gateway), encoder)?;
        bincode::Encode::encode(&to_wire_order(self.subnet_mask), encoder)?;
        bincode::Encode::encode(&self.module_name, encoder)?;
        bincode::Encode::encode(&[0u8; 2], encoder)?; // 固定値
        bincode::Encode::encode(&self.credentials, encoder)?;
        bincode::Encode::encode(&0u8, encoder)?; // 固定値
        bincode::Encode::encode(&self.device_id, encoder)?;
        bincode::Encode::encode(&Self::ID_TYPE, encoder)?;
        bincode::Encode::encode(&self.device, encoder)?;
        bincode::Encode::encode(&to_wire_order(self.dns), encoder)?;
        bincode::Encode::encode(&self.short_connection_timeout, encoder)?;
        bincode::Encode::encode(&[0u8; 3], encoder)?; // 固定値
        Ok(())
    }
}

/// 0x06 シリアルポート設定
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ComSetting {
    pub device: MacAddress,
    pub credentials: Credentials,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: u8,
    pub stop_bits: u8,
    pub local_port: u16,
    pub remote_port: u16,
    pub server_ip: [u8; 30],
}

impl ComSetting {
    pub const TRAILER: [u8; 6] = [0x28, 0x01, 0x00, 0x04, 0x10, 0x0E];
    pub const TRAILER2: [u8; 7] = [0x00, 0x00, 0x00, 0x90, 0x01, 0x00, 0x00];

    /// 115200bps 8-1-1, ローカルポート20108, リモートポート10000
    pub fn new(device: MacAddress, credentials: Credentials, server_ip: [u8; 30]) -> Self {
        Self {
            device,
            credentials,
            baud_rate: 115200,
            data_bits: 8,
            parity: 1,
            stop_bits: 1,
            local_port: 20108,
            remote_port: 10000,
            server_ip,
        }
    }
}

impl Request for ComSetting {
    const COMMAND: CommandCode = CommandCode::ComSet;
}

impl bincode::Encode for ComSetting {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.device, encoder)?;
        bincode::Encode::encode(&self.credentials, encoder)?;
        bincode::Encode::encode(&self.baud_rate, encoder)?;
        bincode::Encode::encode(&self.data_bits, encoder)?;
        bincode::Encode::encode(&self.parity, encoder)?;
        bincode::Encode::encode(&self.stop_bits, encoder)?;
        bincode::Encode::encode(&[0u8; 5], encoder)?; // 固定値
        bincode::Encode::encode(&self.local_port, encoder)?;
        bincode::Encode::encode(&self.remote_port, encoder)?;
        bincode::Encode::encode(&self.server_ip, encoder)?;
        bincode::Encode::encode(&[0u8; 4], encoder)?; // 固定値
        bincode::Encode::encode(&Self::TRAILER, encoder)?;
        bincode::Encode::encode(&Self::TRAILER2, encoder)?;
        Ok(())
    }
}

/// 0x01 機器探索の応答
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ScanReply {
    pub header: [u8; 5],
    pub device: MacAddress,
    pub rest: Vec<u8>,
}

impl ScanReply {
    pub const PAYLOAD_LEN: usize = 32;

    /// ペイロード5バイト目からの6バイトがMACアドレス
    pub fn parse(payload: &[u8]) -> result::Result<Self, FrameError> {
        if payload.len() != Self::PAYLOAD_LEN {
            return Err(FrameError::Malformed);
        }
        scan_reply(payload)
            .map(|(_rest, reply)| reply)
            .map_err(|_| FrameError::Malformed)
    }
}

fn scan_reply(input: &[u8]) -> nom::IResult<&[u8], ScanReply> {
    let parser = all_consuming((
        take(5usize),
        take(6usize),
        take(ScanReply::PAYLOAD_LEN - 11),
    ));
    map(parser, |(header, mac, rest): (&[u8], &[u8], &[u8])| {
        let mut h = [0u8; 5];
        h.copy_from_slice(header);
        let mut m = [0u8; 6];
        m.copy_from_slice(mac);
        ScanReply {
            header: h,
            device: MacAddress(m),
            rest: rest.to_vec(),
        }
    })
    .parse(input)
}

#[cfg(test)]
const MAC: MacAddress = MacAddress([0x9C, 0xA5, 0x25, 0x01, 0xAB, 0x0F]);

#[test]
fn test1() {
    let reboot = RebootRequest {
        device: MAC,
        credentials: Credentials::FACTORY,
    };
    let frame = reboot.to_frame().unwrap();
    assert_eq!(frame.command(), CommandCode::Reboot);
    assert_eq!(frame.payload().len(), 18);
    assert_eq!(&frame.payload()[..6], &MAC.0);
    assert_eq!(&frame.payload()[6..], b"admin\0admin\0");
}

#[test]
fn test2() {
    let setting = BasicSetting::new(
        MAC,
        Credentials::FACTORY,
        [192, 168, 1, 101],
        [192, 168, 1, 1],
        [255, 255, 255, 0],
    );
    let frame = setting.to_frame().unwrap();
    assert_eq!(frame.command(), CommandCode::BasicSet);

    let mut expected: Vec<u8> = vec![];
    expected.extend_from_slice(&MAC.0);
    expected.extend_from_slice(b"admin\0admin\0");
    expected.extend_from_slice(&[0x95, 0x63, 0x03]);
    expected.push(0x80);
    expected.extend_from_slice(&[0x00, 0x00]);
    expected.extend_from_slice(&[0x50, 0x00]);
    expected.push(0x00);
    expected.extend_from_slice(&[101, 1, 168, 192]);
    expected.extend_from_slice(&[1, 1, 168, 192]);
    expected.extend_from_slice(&[0, 255, 255, 255]);
    expected.extend_from_slice(&[
        0x55, 0x53, 0x52, 0x2D, 0x54, 0x43, 0x50, 0x32, 0x33, 0x32, 0x2D, 0x53, 0x31, 0x00,
    ]);
    expected.extend_from_slice(&[0x00, 0x00]);
    expected.extend_from_slice(b"admin\0admin\0");
    expected.push(0x00);
    expected.extend_from_slice(&[0x00, 0x00]);
    expected.push(0xB0);
    expected.extend_from_slice(&MAC.0);
    expected.extend_from_slice(&[0xDE, 0xDE, 0x43, 0xD0]);
    expected.push(0x03);
    expected.extend_from_slice(&[0x00, 0x00, 0x00]);

    assert_eq!(expected.len(), 85);
    assert_eq!(frame.payload(), &expected[..]);
    assert_eq!(frame.len(), 89);
    assert_eq!(frame.as_bytes()[1], 86);
}

#[test]
fn test3() {
    let server_ip = crate::usrtcp232::address::to_ascii_padded("192.168.1.102").unwrap();
    let setting = ComSetting::new(MAC, Credentials::FACTORY, server_ip);
    let frame = setting.to_frame().unwrap();
    assert_eq!(frame.command(), CommandCode::ComSet);

    let mut expected: Vec<u8> = vec![];
    expected.extend_from_slice(&MAC.0);
    expected.extend_from_slice(b"admin\0admin\0");
    expected.extend_from_slice(&[0x00, 0xC2, 0x01, 0x00]);
    expected.extend_from_slice(&[0x08, 0x01, 0x01]);
    expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00]);
    expected.extend_from_slice(&[0x8C, 0x4E]);
    expected.extend_from_slice(&[0x10, 0x27]);
    expected.extend_from_slice(b"192.168.1.102");
    expected.extend_from_slice(&[0u8; 17]);
    expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]);
    expected.extend_from_slice(&[0x28, 0x01, 0x00, 0x04, 0x10, 0x0E]);
    expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x90, 0x01, 0x00, 0x00]);

    assert_eq!(expected.len(), 81);
    assert_eq!(frame.payload(), &expected[..]);
}

#[test]
fn test4() {
    let mut payload = [0u8; 32];
    payload[..5].copy_from_slice(&[0x01, 0x02, 0x03, 0x04, 0x05]);
    payload[5..11].copy_from_slice(&MAC.0);
    payload[11] = 0xEE;
    let reply = ScanReply::parse(&payload).unwrap();
    assert_eq!(reply.device, MAC);
    assert_eq!(reply.header, [0x01, 0x02, 0x03, 0x04, 0x05]);
    assert_eq!(reply.rest.len(), 21);
    assert_eq!(reply.rest[0], 0xEE);

    assert_eq!(ScanReply::parse(&payload[..31]), Err(FrameError::Malformed));
    assert_eq!(ScanReply::parse(&[]), Err(FrameError::Malformed));
}

#[test]
fn test5() {
    assert_eq!(format!("{:?}", Credentials::FACTORY), "Credentials(############)");
    assert_eq!(Credentials::default().as_bytes(), b"admin\0admin\0");
}

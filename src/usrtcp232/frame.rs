// USR-TCP232 設定プロトコルのフレーム
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
// [0xFF][length][command][payload...][checksum]
//   length   = payload長 + 1 (コマンドコード分)
//   checksum = length から payload 末尾までの総和(下位8ビット)
//
use crate::usrtcp232::CommandCode;
use nom::Parser;
use nom::bytes::complete::tag;
use nom::combinator::{eof, map};
use nom::multi::length_data;
use nom::number::complete::u8 as byte;
use std::fmt;
use thiserror::Error;

/// フレーム先頭のマーカー
pub const FRAME_MARKER: u8 = 0xFF;

/// マーカー + length + command + checksum
pub const FRAME_OVERHEAD: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("checksum mismatch, expected 0x{expected:02X} but 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("malformed frame")]
    Malformed,
    #[error("unknown command code 0x{0:02X}")]
    UnknownCommand(u8),
}

/// 送信用フレーム
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CommandFrame {
    command: CommandCode,
    bytes: Vec<u8>,
}

impl CommandFrame {
    /// フレームを組み立てる
    ///
    /// length は1バイトなのでペイロードは254バイトまで。
    pub fn new(command: CommandCode, payload: &[u8]) -> Self {
        debug_assert!(payload.len() < u8::MAX as usize);
        let mut bytes = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
        bytes.push(FRAME_MARKER);
        bytes.push((payload.len() + 1) as u8);
        bytes.push(command.code());
        bytes.extend_from_slice(payload);
        let sum = checksum(&bytes, 1, bytes.len() - 1);
        bytes.push(sum);
        Self { command, bytes }
    }

    #[inline]
    pub fn command(&self) -> CommandCode {
        self.command
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.bytes[3..self.bytes.len() - 1]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Display for CommandFrame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}]", self.command, dump(&self.bytes))
    }
}

/// 受信フレームの解析結果
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ParsedFrame<'a> {
    pub command: CommandCode,
    pub payload: &'a [u8],
}

impl<'a> ParsedFrame<'a> {
    /// フレーム全体の長さ
    #[inline]
    pub fn frame_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

impl<'a> fmt::Display for ParsedFrame<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} payload=[{}]", self.command, dump(self.payload))
    }
}

/// フレームを組み立てる
#[inline]
pub fn encode(command: CommandCode, payload: &[u8]) -> CommandFrame {
    CommandFrame::new(command, payload)
}

/// チェックサム(offsetからlenバイトの総和の下位8ビット)
///
/// # Panics
/// `offset + len` が `bytes` の長さを超えるとパニックする。
pub fn checksum(bytes: &[u8], offset: usize, len: usize) -> u8 {
    bytes[offset..offset + len]
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

// [0xFF] [length] [length バイト] [checksum] EOF
fn frame_layout(input: &[u8]) -> nom::IResult<&[u8], (&[u8], u8)> {
    const MARKER: &[u8] = &[FRAME_MARKER];
    let parser = (tag(MARKER), length_data(byte), byte, eof);
    map(parser, |(_marker, body, sum, _eof)| (body, sum)).parse(input)
}

/// 受信したデーターをフレームとして解析する
pub fn decode(bytes: &[u8]) -> Result<ParsedFrame<'_>, FrameError> {
    if bytes.len() < FRAME_OVERHEAD {
        return Err(FrameError::TooShort(bytes.len()));
    }
    let actual = bytes[bytes.len() - 1];
    let expected = checksum(bytes, 1, bytes.len() - 2);
    if expected != actual {
        return Err(FrameError::ChecksumMismatch { expected, actual });
    }
    let (_rest, (body, _sum)) = frame_layout(bytes).map_err(|_| FrameError::Malformed)?;
    match body {
        [code, payload @ ..] => {
            let command = CommandCode::try_from(*code).map_err(FrameError::UnknownCommand)?;
            Ok(ParsedFrame { command, payload })
        }
        [] => Err(FrameError::Malformed),
    }
}

/// ログ出力用の16進ダンプ
pub fn dump(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect::<String>()
}

#[test]
fn test1() {
    // 機器探索コマンドはペイロードなし
    let scan = encode(CommandCode::Scan, &[]);
    assert_eq!(scan.as_bytes(), &[0xFF, 0x01, 0x01, 0x02]);
    assert_eq!(scan.payload(), &[] as &[u8]);

    let decoded = decode(scan.as_bytes()).unwrap();
    assert_eq!(decoded.command, CommandCode::Scan);
    assert!(decoded.payload.is_empty());
    assert_eq!(decoded.frame_len(), 4);
}

#[test]
fn test2() {
    let payload: Vec<u8> = (0..=200u8).collect();
    for (command, payload) in [
        (CommandCode::Reboot, &payload[..18]),
        (CommandCode::BasicSet, &payload[..85]),
        (CommandCode::ComSet, &payload[..]),
    ] {
        let frame = encode(command, payload);
        assert_eq!(frame.len(), payload.len() + FRAME_OVERHEAD);
        assert_eq!(frame.as_bytes()[1] as usize, payload.len() + 1);
        let decoded = decode(frame.as_bytes()).unwrap();
        assert_eq!(decoded.command, command);
        assert_eq!(decoded.payload, payload);
    }
}

#[test]
fn test3() {
    assert_eq!(decode(&[]), Err(FrameError::TooShort(0)));
    assert_eq!(decode(&[0xFF]), Err(FrameError::TooShort(1)));
    assert_eq!(decode(&[0xFF, 0x01]), Err(FrameError::TooShort(2)));
    assert_eq!(decode(&[0xFF, 0x01, 0x01]), Err(FrameError::TooShort(3)));
}

#[test]
fn test4() {
    // ペイロードのどの1バイトを変えてもチェックサムが合わなくなる
    let frame = encode(CommandCode::Reboot, b"\x01\x02\x03\x04\x05\x06admin\0admin\0");
    for index in 3..frame.len() - 1 {
        let mut corrupted = frame.as_bytes().to_vec();
        corrupted[index] = corrupted[index].wrapping_add(0x5A);
        assert!(
            matches!(decode(&corrupted), Err(FrameError::ChecksumMismatch { .. })),
            "index {index}"
        );
    }
}

#[test]
fn test5() {
    // マーカー違い
    assert_eq!(decode(&[0xFE, 0x01, 0x01, 0x02]), Err(FrameError::Malformed));
    // length がデーター長と一致しない
    assert_eq!(decode(&[0xFF, 0x02, 0x01, 0x03]), Err(FrameError::Malformed));
    assert_eq!(
        decode(&[0xFF, 0x01, 0x01, 0x00, 0x02]),
        Err(FrameError::Malformed)
    );
    // length = 0 (コマンドコードがない)
    assert_eq!(decode(&[0xFF, 0x00, 0x00, 0x00]), Err(FrameError::Malformed));
    // 未知のコマンドコード
    assert_eq!(
        decode(&[0xFF, 0x01, 0x04, 0x05]),
        Err(FrameError::UnknownCommand(0x04))
    );
}

#[test]
fn test6() {
    // 8ビットで桁あふれする
    assert_eq!(checksum(&[0xFF, 0xFF, 0x03], 0, 3), 0x01);
    assert_eq!(checksum(&[0xAA, 0x10, 0x20, 0xBB], 1, 2), 0x30);
    assert_eq!(checksum(&[0xAA], 0, 0), 0x00);
}

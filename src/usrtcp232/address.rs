// IPv4アドレスとMACアドレスの変換
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use nom::Parser;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::combinator::{eof, map, map_res};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error(r#"malformed address "{0}""#)]
    Malformed(String),
    #[error("{len} bytes exceeds {width} bytes field")]
    TooLong { len: usize, width: usize },
}

// 10進数(1～3桁, 0～255)
fn octet(input: &str) -> nom::IResult<&str, u8> {
    map_res(take_while_m_n(1, 3, |c: char| c.is_ascii_digit()), |s: &str| {
        s.parse::<u8>()
    })
    .parse(input)
}

// 192.168.1.101
fn dotted_decimal(input: &str) -> nom::IResult<&str, [u8; 4]> {
    let parser = (
        octet,
        tag("."),
        octet,
        tag("."),
        octet,
        tag("."),
        octet,
        eof,
    );
    map(parser, |(a, _, b, _, c, _, d, _)| [a, b, c, d]).parse(input)
}

/// ドット区切り10進数表記のIPv4アドレスを解析する
pub fn parse_ipv4(text: &str) -> Result<[u8; 4], AddressError> {
    dotted_decimal(text)
        .map(|(_rest, octets)| octets)
        .map_err(|_| AddressError::Malformed(text.to_owned()))
}

/// 送信順に並べ替える(下位オクテットが先頭)
#[inline]
pub fn to_wire_order(octets: [u8; 4]) -> [u8; 4] {
    let [a, b, c, d] = octets;
    [d, c, b, a]
}

/// ASCII文字列を固定長フィールドに詰めて残りを0で埋める
pub fn to_ascii_padded<const WIDTH: usize>(text: &str) -> Result<[u8; WIDTH], AddressError> {
    if !text.is_ascii() {
        return Err(AddressError::Malformed(text.to_owned()));
    }
    let bytes = text.as_bytes();
    if bytes.len() > WIDTH {
        return Err(AddressError::TooLong {
            len: bytes.len(),
            width: WIDTH,
        });
    }
    let mut field = [0u8; WIDTH];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// MACアドレス
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    #[inline]
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for MacAddress {
    #[inline]
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl FromStr for MacAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddressError::Malformed(s.to_owned());
        let octets = s
            .split([':', '-'])
            .map(|hex| match hex.as_bytes() {
                [h, l] if h.is_ascii_hexdigit() && l.is_ascii_hexdigit() => {
                    u8::from_str_radix(hex, 16).map_err(|_| malformed())
                }
                _ => Err(malformed()),
            })
            .collect::<Result<Vec<u8>, _>>()?;
        octets.try_into().map(Self).map_err(|_| malformed())
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MacAddress({})", self)
    }
}

#[test]
fn test1() {
    assert_eq!(parse_ipv4("192.168.1.101"), Ok([192, 168, 1, 101]));
    assert_eq!(parse_ipv4("255.255.255.0"), Ok([255, 255, 255, 0]));
    assert_eq!(parse_ipv4("0.0.0.0"), Ok([0, 0, 0, 0]));
    // 先頭の0は許容する
    assert_eq!(parse_ipv4("010.001.01.9"), Ok([10, 1, 1, 9]));

    for bad in [
        "256.1.1.1",
        "abc",
        "",
        "1.2.3",
        "1.2.3.4.5",
        "1.2.3.4.",
        "1..2.3",
        "1.2.3.1000",
        " 1.2.3.4",
        "1.2.3.4 ",
        "-1.2.3.4",
        "１.2.3.4",
    ] {
        assert_eq!(
            parse_ipv4(bad),
            Err(AddressError::Malformed(bad.to_owned())),
            "{bad:?}"
        );
    }
}

#[test]
fn test2() {
    assert_eq!(to_wire_order([192, 168, 1, 101]), [101, 1, 168, 192]);
    for octets in [[0, 0, 0, 0], [1, 2, 3, 4], [255, 255, 255, 0], [10, 0, 0, 1]] {
        assert_eq!(to_wire_order(to_wire_order(octets)), octets);
    }
}

#[test]
fn test3() {
    let field: [u8; 30] = to_ascii_padded("192.168.1.102").unwrap();
    assert_eq!(&field[..13], b"192.168.1.102");
    assert!(field[13..].iter().all(|b| *b == 0));

    let exact: [u8; 4] = to_ascii_padded("abcd").unwrap();
    assert_eq!(&exact, b"abcd");

    assert_eq!(
        to_ascii_padded::<4>("abcde"),
        Err(AddressError::TooLong { len: 5, width: 4 })
    );
    assert!(matches!(
        to_ascii_padded::<30>("ＩＰ"),
        Err(AddressError::Malformed(_))
    ));
}

#[test]
fn test4() {
    let mac = MacAddress([0x9C, 0xA5, 0x25, 0x01, 0xAB, 0x0F]);
    assert_eq!(mac.to_string(), "9C:A5:25:01:AB:0F");
    assert_eq!("9C:A5:25:01:AB:0F".parse::<MacAddress>(), Ok(mac));
    assert_eq!("9c-a5-25-01-ab-0f".parse::<MacAddress>(), Ok(mac));
    assert!("9C:A5:25:01:AB".parse::<MacAddress>().is_err());
    assert!("9C:A5:25:01:AB:0F:00".parse::<MacAddress>().is_err());
    assert!("9C:A5:25:01:AB:G0".parse::<MacAddress>().is_err());
}

// USR-TCP232 設定プロトコルのコマンドコード
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    Scan = 0x01,         // 機器探索
    Reboot = 0x02,       // 再起動
    ReadSettings = 0x03, // 設定読み出し
    BasicSet = 0x05,     // 基本設定
    ComSet = 0x06,       // シリアルポート設定
}

impl CommandCode {
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(Self::Scan),
            0x02 => Ok(Self::Reboot),
            0x03 => Ok(Self::ReadSettings),
            0x05 => Ok(Self::BasicSet),
            0x06 => Ok(Self::ComSet),
            other => Err(other),
        }
    }
}

impl From<CommandCode> for u8 {
    #[inline]
    fn from(code: CommandCode) -> u8 {
        code.code()
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Scan => "Scan",
            Self::Reboot => "Reboot",
            Self::ReadSettings => "ReadSettings",
            Self::BasicSet => "BasicSet",
            Self::ComSet => "ComSet",
        };
        write!(f, "{}(0x{:02X})", name, self.code())
    }
}

#[test]
fn test1() {
    for code in [
        CommandCode::Scan,
        CommandCode::Reboot,
        CommandCode::ReadSettings,
        CommandCode::BasicSet,
        CommandCode::ComSet,
    ] {
        assert_eq!(CommandCode::try_from(code.code()), Ok(code));
    }
    assert_eq!(CommandCode::try_from(0x04), Err(0x04));
    assert_eq!(CommandCode::try_from(0xFF), Err(0xFF));
    assert_eq!(CommandCode::BasicSet.to_string(), "BasicSet(0x05)");
}

// 設定ファイル
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

/// 設定情報
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
#[allow(non_snake_case)]
pub struct ProvisioningSettings {
    pub BroadcastAddress: Ipv4Addr,
    pub Port: u16,
    pub ReceiveTimeoutMillis: u64,
    pub OverallTimeoutMillis: u64,
    pub SettleDelayMillis: u64,
    pub Dns: Ipv4Addr,
    pub BackupDns: Ipv4Addr,
    pub LocalInterface: Option<LocalInterfaceCommands>,
}

/// 自端末のネットワーク設定に使う外部コマンド
///
/// 引数中の `{address}` `{prefix}` `{netmask}` `{gateway}` `{dns}` `{backup_dns}` を置き換える。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[allow(non_snake_case)]
pub struct LocalInterfaceCommands {
    #[serde(default)]
    pub Prepare: Option<Vec<String>>,
    pub Configure: Vec<String>,
}

impl Default for ProvisioningSettings {
    fn default() -> Self {
        Self {
            BroadcastAddress: Ipv4Addr::BROADCAST,
            Port: 1500,
            ReceiveTimeoutMillis: 2000,
            OverallTimeoutMillis: 10000,
            SettleDelayMillis: 2000,
            Dns: Ipv4Addr::new(8, 8, 8, 8),
            BackupDns: Ipv4Addr::new(4, 4, 4, 4),
            LocalInterface: None,
        }
    }
}

impl ProvisioningSettings {
    #[inline]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.ReceiveTimeoutMillis)
    }

    #[inline]
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_millis(self.OverallTimeoutMillis)
    }

    #[inline]
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.SettleDelayMillis)
    }
}

#[test]
fn test1() {
    let settings = toml::from_str::<ProvisioningSettings>("").unwrap();
    assert_eq!(settings, ProvisioningSettings::default());
    assert_eq!(settings.receive_timeout(), Duration::from_secs(2));
    assert_eq!(settings.overall_timeout(), Duration::from_secs(10));
}

#[test]
fn test2() {
    let text = r#"
BroadcastAddress = "192.168.1.255"
OverallTimeoutMillis = 30000

[LocalInterface]
Configure = ["nmcli", "con", "mod", "eth0", "ipv4.addresses", "{address}/{prefix}"]
"#;
    let settings = toml::from_str::<ProvisioningSettings>(text).unwrap();
    assert_eq!(settings.BroadcastAddress, Ipv4Addr::new(192, 168, 1, 255));
    assert_eq!(settings.Port, 1500);
    assert_eq!(settings.overall_timeout(), Duration::from_secs(30));
    let commands = settings.LocalInterface.unwrap();
    assert_eq!(commands.Prepare, None);
    assert_eq!(commands.Configure.len(), 6);
}

#[test]
fn test3() {
    let settings = ProvisioningSettings {
        LocalInterface: Some(LocalInterfaceCommands {
            Prepare: Some(vec!["true".to_string()]),
            Configure: vec!["ip".to_string(), "{address}".to_string()],
        }),
        ..Default::default()
    };
    let text = toml::to_string_pretty(&settings).unwrap();
    assert_eq!(toml::from_str::<ProvisioningSettings>(&text).unwrap(), settings);
}

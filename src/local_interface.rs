// 自端末のネットワーク設定
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::provisioning_settings::LocalInterfaceCommands;
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;
use tokio::process::Command;

/// 成功を表す結果コード
pub const SUCCESS_CODE: i32 = 0;

#[derive(Debug, Error)]
pub enum LocalInterfaceError {
    #[error(r#""{step}" returned code {code}"#)]
    Rejected { step: &'static str, code: i32 },
    #[error(r#""{step}" failed: {source}"#)]
    Io {
        step: &'static str,
        #[source]
        source: io::Error,
    },
}

/// 静的IPアドレス設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticIpv4Config {
    pub address: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub backup_dns: Ipv4Addr,
}

impl StaticIpv4Config {
    /// サブネットマスクのプレフィックス長
    pub fn prefix_len(&self) -> u32 {
        u32::from(self.subnet_mask).leading_ones()
    }
}

/// 自端末のネットワークインターフェースを設定するサービス
///
/// どちらも結果コードを返し `SUCCESS_CODE` 以外は失敗。
pub trait LocalInterface {
    /// 設定変更の権限を得る
    fn prepare(&self) -> impl Future<Output = io::Result<i32>> + Send {
        async { Ok(SUCCESS_CODE) }
    }

    /// 静的IPアドレスを設定する
    fn set_ethernet_config(
        &self,
        config: &StaticIpv4Config,
    ) -> impl Future<Output = io::Result<i32>> + Send;
}

/// 設定済みの自端末をそのまま使う
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmanaged;

impl LocalInterface for Unmanaged {
    async fn set_ethernet_config(&self, config: &StaticIpv4Config) -> io::Result<i32> {
        tracing::info!("local interface is left as is ({})", config.address);
        Ok(SUCCESS_CODE)
    }
}

/// 外部コマンドで設定する
#[derive(Debug, Clone)]
pub struct CommandInterface {
    commands: LocalInterfaceCommands,
}

impl CommandInterface {
    pub fn new(commands: LocalInterfaceCommands) -> Self {
        Self { commands }
    }
}

/// 引数中の置き換え文字列を展開する
pub fn expand_args(args: &[String], config: &StaticIpv4Config) -> Vec<String> {
    let replacements = [
        ("{address}", config.address.to_string()),
        ("{prefix}", config.prefix_len().to_string()),
        ("{netmask}", config.subnet_mask.to_string()),
        ("{gateway}", config.gateway.to_string()),
        ("{dns}", config.dns.to_string()),
        ("{backup_dns}", config.backup_dns.to_string()),
    ];
    args.iter()
        .map(|arg| {
            replacements
                .iter()
                .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
        })
        .collect()
}

async fn run_command(args: &[String]) -> io::Result<i32> {
    let Some((program, rest)) = args.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty command"));
    };
    tracing::debug!("exec {:?}", args);
    let status = Command::new(program).args(rest).status().await?;
    // シグナルで終了した場合は -1
    Ok(status.code().unwrap_or(-1))
}

impl LocalInterface for CommandInterface {
    async fn prepare(&self) -> io::Result<i32> {
        match &self.commands.Prepare {
            Some(args) => run_command(args).await,
            None => Ok(SUCCESS_CODE),
        }
    }

    async fn set_ethernet_config(&self, config: &StaticIpv4Config) -> io::Result<i32> {
        let args = expand_args(&self.commands.Configure, config);
        run_command(&args).await
    }
}

/// 権限を得てから静的IPアドレスを設定する
#[tracing::instrument(skip_all)]
pub async fn configure<L: LocalInterface>(
    service: &L,
    config: &StaticIpv4Config,
) -> Result<(), LocalInterfaceError> {
    let check = |step: &'static str, result: io::Result<i32>| match result {
        Ok(SUCCESS_CODE) => Ok(()),
        Ok(code) => Err(LocalInterfaceError::Rejected { step, code }),
        Err(source) => Err(LocalInterfaceError::Io { step, source }),
    };
    check("prepare", service.prepare().await)?;
    check("set ethernet config", service.set_ethernet_config(config).await)?;
    tracing::info!(
        "local interface {}/{} gw {} configured",
        config.address,
        config.prefix_len(),
        config.gateway
    );
    Ok(())
}

#[cfg(test)]
fn sample_config() -> StaticIpv4Config {
    StaticIpv4Config {
        address: Ipv4Addr::new(192, 168, 1, 102),
        gateway: Ipv4Addr::new(192, 168, 1, 1),
        subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
        dns: Ipv4Addr::new(8, 8, 8, 8),
        backup_dns: Ipv4Addr::new(4, 4, 4, 4),
    }
}

#[test]
fn test1() {
    let config = sample_config();
    assert_eq!(config.prefix_len(), 24);
    let args = [
        "nmcli",
        "con",
        "mod",
        "eth0",
        "ipv4.addresses",
        "{address}/{prefix}",
        "ipv4.gateway",
        "{gateway}",
        "ipv4.dns",
        "{dns} {backup_dns}",
        "{netmask}",
    ]
    .map(String::from);
    assert_eq!(
        expand_args(&args, &config),
        [
            "nmcli",
            "con",
            "mod",
            "eth0",
            "ipv4.addresses",
            "192.168.1.102/24",
            "ipv4.gateway",
            "192.168.1.1",
            "ipv4.dns",
            "8.8.8.8 4.4.4.4",
            "255.255.255.0",
        ]
    );
}

#[tokio::test]
async fn test2() {
    struct Refuses;
    impl LocalInterface for Refuses {
        async fn set_ethernet_config(&self, _config: &StaticIpv4Config) -> io::Result<i32> {
            Ok(7)
        }
    }
    let config = sample_config();
    assert!(configure(&Unmanaged, &config).await.is_ok());
    assert!(matches!(
        configure(&Refuses, &config).await,
        Err(LocalInterfaceError::Rejected { code: 7, .. })
    ));
}

#[tokio::test]
async fn test3() {
    let config = sample_config();
    let empty = CommandInterface::new(LocalInterfaceCommands::default());
    assert!(matches!(
        configure(&empty, &config).await,
        Err(LocalInterfaceError::Io {
            step: "set ethernet config",
            ..
        })
    ));
}

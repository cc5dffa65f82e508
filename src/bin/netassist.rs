// USR-TCP232 をLANから設定する。
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use anyhow::{Context, anyhow};
use clap::{Args, Parser, Subcommand};
use netassist::local_interface::{CommandInterface, Unmanaged};
use netassist::usrtcp232::payload::ScanReply;
use netassist::usrtcp232::transport::{RunControl, Transport};
use netassist::usrtcp232::{CommandCode, frame};
use netassist::{ProvisioningForm, ProvisioningSettings, Provisioner, discover};
use nom::Parser as _;
use nom::bytes::complete::take_while_m_n;
use nom::character::complete::one_of;
use nom::combinator::{all_consuming, map_res, opt};
use nom::multi::many1;
use nom::sequence::terminated;
use std::fs;
use std::io;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// USR-TCP232 を探して設定する。
#[derive(Parser, Debug)]
#[command(name = "netassist")]
#[command(version, about, long_about = None)]
struct Cli {
    /// 設定ファイル名
    #[arg(short = 'S', long, default_value = "netassist.toml")]
    config_file: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 機器を探して、基本設定、シリアルポート設定、再起動をする
    Provision(ProvisionArgs),
    /// 機器を探してMACアドレスを表示する
    Scan,
    /// 16進数で与えたフレームを解析する
    Decode {
        /// 例: "FF 01 01 02"
        hex: String,
    },
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    /// 機器に設定するIPアドレス
    #[arg(long, env = "CONTROL_BOX_IP", default_value = "192.168.1.101")]
    control_box_ip: String,
    /// 自端末のIPアドレス
    #[arg(long, env = "SCREEN_IP", default_value = "192.168.1.102")]
    screen_ip: String,
    /// ゲートウェイ
    #[arg(long, env = "GATEWAY", default_value = "192.168.1.1")]
    gateway: String,
    /// サブネットマスク
    #[arg(long, env = "SUBNET_MASK", default_value = "255.255.255.0")]
    subnet_mask: String,
    /// 自端末のネットワーク設定をしない
    #[arg(long)]
    skip_local_interface: bool,
}

/// 設定ファイルを読む、ファイルがなければ既定値
fn load_settings(path: &str) -> anyhow::Result<ProvisioningSettings> {
    match fs::read_to_string(path) {
        Ok(text) => toml::from_str::<ProvisioningSettings>(&text)
            .with_context(|| format!(r#"setting file "{}" parse error."#, path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(r#"setting file "{}" not found, use defaults."#, path);
            Ok(ProvisioningSettings::default())
        }
        Err(e) => Err(e).with_context(|| format!(r#"setting file "{}" read error."#, path)),
    }
}

/// "FF 01 01 02", "FF:01:01:02", "FF010102" のどれでもよい
fn hex_bytes(input: &str) -> nom::IResult<&str, Vec<u8>> {
    let hex_byte = map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |s: &str| u8::from_str_radix(s, 16),
    );
    all_consuming(many1(terminated(hex_byte, opt(one_of(" :-"))))).parse(input)
}

async fn exec_provision(
    cli: &Cli,
    args: &ProvisionArgs,
    cancel: CancellationToken,
) -> anyhow::Result<ExitCode> {
    let settings = load_settings(&cli.config_file)?;
    let form = ProvisioningForm {
        device_ip: args.control_box_ip.clone(),
        local_ip: args.screen_ip.clone(),
        gateway: args.gateway.clone(),
        subnet_mask: args.subnet_mask.clone(),
    };
    let (broadcast, port) = (settings.BroadcastAddress, settings.Port);
    let open = || Transport::open(broadcast, port);

    let mut provisioner = Provisioner::new(settings.clone());
    let outcome = match settings.LocalInterface {
        Some(commands) if !args.skip_local_interface => {
            let local = CommandInterface::new(commands);
            provisioner.run(&form, &local, open, cancel).await
        }
        _ => provisioner.run(&form, &Unmanaged, open, cancel).await,
    };

    println!("{}", outcome);
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn exec_scan(cli: &Cli, cancel: CancellationToken) -> anyhow::Result<ExitCode> {
    let settings = load_settings(&cli.config_file)?;
    let transport = Transport::open(settings.BroadcastAddress, settings.Port)
        .context("Failed to open socket.")?;
    let control = RunControl::new(settings.overall_timeout(), cancel);
    let device = discover(&transport, settings.receive_timeout(), &control).await?;
    println!("{}", device);
    Ok(ExitCode::SUCCESS)
}

fn exec_decode(hex: &str) -> anyhow::Result<ExitCode> {
    let (_rest, bytes) = hex_bytes(hex.trim()).map_err(|_| anyhow!(r#"invalid hex "{}""#, hex))?;
    match frame::decode(&bytes) {
        Ok(parsed) => {
            println!("{}", parsed);
            println!("checksum ok, {} bytes", parsed.frame_len());
            if parsed.command == CommandCode::Scan && parsed.payload.len() == ScanReply::PAYLOAD_LEN {
                let reply = ScanReply::parse(parsed.payload)?;
                println!("device {}", reply.device);
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            println!("{}", e);
            Ok(ExitCode::FAILURE)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    // プログラムの情報
    let app_info = format!("{} / {}", built_info::PKG_NAME, built_info::PKG_VERSION);

    // デバッグレベルは RUST_LOG 環境変数で設定できる
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(tracing_subscriber::fmt::time::LocalTime::rfc_3339())
                .with_file(false)
                .with_line_number(false)
                .with_thread_names(false)
                .with_thread_ids(false),
        )
        .init();

    // コマンドライン引数
    let cli = Cli::parse();
    tracing::info!("{app_info} started.");

    // Ctrl-C で中止する
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted.");
            canceller.cancel();
        }
    });

    let result = match &cli.command {
        Commands::Provision(args) => exec_provision(&cli, args, cancel).await,
        Commands::Scan => exec_scan(&cli, cancel).await,
        Commands::Decode { hex } => exec_decode(hex),
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{app_info} aborted, reason: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[test]
fn test1() {
    assert_eq!(hex_bytes("FF 01 01 02").unwrap().1, vec![0xFF, 0x01, 0x01, 0x02]);
    assert_eq!(hex_bytes("ff:01:01:02").unwrap().1, vec![0xFF, 0x01, 0x01, 0x02]);
    assert_eq!(hex_bytes("FF010102").unwrap().1, vec![0xFF, 0x01, 0x01, 0x02]);
    assert!(hex_bytes("FF0").is_err());
    assert!(hex_bytes("GG").is_err());
    assert!(hex_bytes("").is_err());
}

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc::unbounded_channel;

use mini_pbx::calls::CallManager;
use mini_pbx::config::Config;
use mini_pbx::http::{spawn_admin_server, AdminContext};
use mini_pbx::logging;
use mini_pbx::rtp::{run_rtp_relay_loop, RtpRelay};
use mini_pbx::sip::{EngineConfig, SipCore};
use mini_pbx::transport::{run_sip_udp_loop, SipInput, TransportSendRequest};
use mini_pbx::users::UserRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let cfg = Config::from_env()?;

    // --- ソケット準備 (SIP/RTPポートは環境変数で指定) ---
    let sip_sock = UdpSocket::bind((cfg.sip_host.as_str(), cfg.sip_port)).await?;
    let rtp_sock = UdpSocket::bind((cfg.rtp_host.as_str(), cfg.rtp_port)).await?;
    log::info!(
        "Listening SIP UDP on {}, RTP on {}, extensions {}-{}",
        sip_sock.local_addr()?,
        rtp_sock.local_addr()?,
        cfg.ext_min,
        cfg.ext_max
    );

    // --- 共有状態 ---
    let users = Arc::new(UserRegistry::new());
    let calls = Arc::new(CallManager::new(cfg.call_setup_timeout));
    let relay = Arc::new(RtpRelay::new());

    // packet層 → SIP処理ループ へのチャネルと、SIP → transport 送信指示
    let (sip_tx, mut sip_rx) = unbounded_channel::<SipInput>();
    let (send_tx, send_rx) = unbounded_channel::<TransportSendRequest>();

    // SIP 受信ループ
    tokio::spawn(async move {
        if let Err(e) = run_sip_udp_loop(sip_sock, sip_tx, send_rx).await {
            log::error!("[sip] loop error: {:?}", e);
        }
    });

    // RTP リレーループ
    {
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = run_rtp_relay_loop(rtp_sock, relay).await {
                log::error!("[rtp] loop error: {:?}", e);
            }
        });
    }

    // 管理HTTP
    spawn_admin_server(
        &cfg.admin_http_addr,
        AdminContext {
            users: users.clone(),
            calls: calls.clone(),
            relay: relay.clone(),
            extensions: cfg.extensions(),
        },
    )
    .await;

    // 期限切れバインディングと応答待ちタイムアウトの定期クリーンアップ
    {
        let users = users.clone();
        let calls = calls.clone();
        let relay = relay.clone();
        let interval = cfg.cleanup_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // 初回は即時に発火するので読み捨てる
            loop {
                tick.tick().await;
                let expired = users.cleanup();
                let timed_out = calls.cleanup();
                for call_id in &timed_out {
                    relay.remove(call_id);
                }
                if !expired.is_empty() || !timed_out.is_empty() {
                    log::info!(
                        "[cleanup] expired_registrations={:?} timed_out_calls={:?}",
                        expired,
                        timed_out
                    );
                }
            }
        });
    }

    let core = SipCore::new(
        EngineConfig {
            server_ip: cfg.server_address.clone(),
            sip_port: cfg.sip_port,
            rtp_port: cfg.rtp_port,
            extensions: cfg.extensions(),
            default_expires_secs: cfg.registration_timeout_secs,
        },
        send_tx,
        users,
        calls,
        relay,
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = &mut shutdown => {
                if let Err(err) = res {
                    log::warn!("[main] shutdown signal error: {:?}", err);
                }
                log::info!("[main] shutting down");
                break;
            }
            Some(input) = sip_rx.recv() => {
                core.handle_input(&input);
            }
            else => break,
        }
    }

    Ok(())
}

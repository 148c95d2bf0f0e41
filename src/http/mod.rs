//! 管理用のシンプルなHTTPサーバ。レジストラ・通話表・RTPリレーの読み出しと、
//! 登録解除などの少数の操作だけを JSON で扱う。

use std::ops::RangeInclusive;
use std::sync::Arc;

use log::info;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::calls::CallManager;
use crate::rtp::RtpRelay;
use crate::users::UserRegistry;

#[derive(Clone)]
pub struct AdminContext {
    pub users: Arc<UserRegistry>,
    pub calls: Arc<CallManager>,
    pub relay: Arc<RtpRelay>,
    pub extensions: RangeInclusive<u32>,
}

pub async fn spawn_admin_server(bind: &str, ctx: AdminContext) {
    let bind = bind.to_string();
    tokio::spawn(async move {
        if let Err(e) = run(&bind, ctx).await {
            log::error!("[admin] server error: {:?}", e);
        }
    });
}

async fn run(bind: &str, ctx: AdminContext) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    log::info!("[admin] serving on {}", bind);

    loop {
        let (mut socket, _) = listener.accept().await?;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _ = handle_conn(&mut socket, &ctx).await;
        });
    }
}

async fn handle_conn(
    socket: &mut tokio::net::TcpStream,
    ctx: &AdminContext,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 4096];
    let mut read_len = 0usize;
    loop {
        let n = socket.read(&mut buf[read_len..]).await?;
        if n == 0 {
            return Ok(());
        }
        read_len += n;
        if read_len >= 4 && buf[..read_len].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if read_len == buf.len() {
            buf.resize(buf.len() + 4096, 0);
        }
        if read_len > 64 * 1024 {
            return write_json(socket, 413, "Payload Too Large", &json!({"error": "too large"}))
                .await;
        }
    }

    let request = String::from_utf8_lossy(&buf[..read_len]);
    let first_line = request.lines().next().unwrap_or("");
    let mut parts = first_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let target = parts.next().unwrap_or("");
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };

    let (status, body) = dispatch(ctx, method, path, query);
    log_admin_response(status, method, path);
    write_json(socket, status, reason_for(status), &body).await
}

fn dispatch(
    ctx: &AdminContext,
    method: &str,
    path: &str,
    query: Option<&str>,
) -> (u16, serde_json::Value) {
    match (method, path) {
        ("GET", "/api/users") => (200, json!({ "users": ctx.users.list() })),
        ("GET", "/api/extensions") => {
            let extensions: Vec<serde_json::Value> = ctx
                .extensions
                .clone()
                .map(|n| {
                    let number = n.to_string();
                    json!({
                        "extension": number,
                        "registered": ctx.users.is_registered(&number),
                    })
                })
                .collect();
            (200, json!({ "extensions": extensions }))
        }
        ("GET", "/api/calls") => (200, json!({ "calls": ctx.calls.active_calls() })),
        ("GET", "/api/history") => {
            let limit = query_param(query, "limit").unwrap_or(100);
            let offset = query_param(query, "offset").unwrap_or(0);
            (200, json!({ "history": ctx.calls.history(limit, offset) }))
        }
        ("GET", "/api/registrations") => {
            let limit = query_param(query, "limit").unwrap_or(100);
            let offset = query_param(query, "offset").unwrap_or(0);
            (200, json!({ "registrations": ctx.users.history(limit, offset) }))
        }
        ("GET", "/api/streams") => {
            // 表向きには片方向ずつ 2 エントリで見せる
            let mut entries = Vec::new();
            for stream in ctx.relay.list() {
                entries.push(json!({
                    "key": stream.call_id,
                    "from": stream.caller,
                    "to": stream.callee,
                }));
                entries.push(json!({
                    "key": format!("{}_reverse", stream.call_id),
                    "from": stream.callee,
                    "to": stream.caller,
                }));
            }
            (200, json!({ "streams": entries }))
        }
        ("GET", "/api/stats") => (
            200,
            json!({
                "registered_users": ctx.users.len(),
                "calls": ctx.calls.statistics(),
                "rtp_streams": ctx.relay.len(),
            }),
        ),
        ("POST", "/api/calls/clear") => (200, json!({ "cleared": ctx.calls.clear() })),
        ("POST", "/api/users/clear") => (200, json!({ "cleared": ctx.users.clear() })),
        ("POST", path) => {
            if let Some(number) = path
                .strip_prefix("/api/users/")
                .and_then(|rest| rest.strip_suffix("/unregister"))
            {
                let removed = ctx.users.unregister(number);
                let status = if removed { 200 } else { 404 };
                (status, json!({ "extension": number, "unregistered": removed }))
            } else {
                (404, json!({ "error": "not found" }))
            }
        }
        _ => (404, json!({ "error": "not found" })),
    }
}

fn query_param(query: Option<&str>, name: &str) -> Option<usize> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .and_then(|(_, v)| v.parse().ok())
}

fn reason_for(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        413 => "Payload Too Large",
        _ => "Error",
    }
}

async fn write_json(
    socket: &mut tokio::net::TcpStream,
    status: u16,
    reason: &str,
    body: &serde_json::Value,
) -> std::io::Result<()> {
    let payload = body.to_string();
    let mut resp = Vec::new();
    resp.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    resp.extend_from_slice(b"Content-Type: application/json\r\n");
    resp.extend_from_slice(b"Access-Control-Allow-Origin: *\r\n");
    resp.extend_from_slice(format!("Content-Length: {}\r\n", payload.len()).as_bytes());
    resp.extend_from_slice(b"Connection: close\r\n\r\n");
    resp.extend_from_slice(payload.as_bytes());
    socket.write_all(&resp).await
}

fn log_admin_response(status: u16, method: &str, path: &str) {
    info!("admin_access status={} method={} path={}", status, method, path);
}

use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::Arc;

use log::{debug, info, warn};
use rand::Rng;

use crate::calls::{Call, CallManager, CallState, EndReason, PreservedHeaders};
use crate::error::EngineError;
use crate::rtp::RtpRelay;
use crate::sdp;
use crate::sip::builder::{response_simple_from_request, SipRequestBuilder, SipResponseBuilder};
use crate::sip::message::{SipMessage, SipMethod, SipRequest, SipResponse};
use crate::sip::parse::parse_sip_message;
use crate::sip::validate::{validate_bye, validate_invite, validate_register};
use crate::transport::{SipInput, TransportSendRequest, TransportSendTx};
use crate::users::UserRegistry;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// SDP / Via / Contact に埋め込む外向きアドレス
    pub server_ip: String,
    pub sip_port: u16,
    pub rtp_port: u16,
    pub extensions: RangeInclusive<u32>,
    /// Expires ヘッダが無い REGISTER に適用する既定の有効期限
    pub default_expires_secs: u64,
}

/// SIP 処理のエントリポイント。レジストラ・通話表・RTP リレーを束ねて
/// メソッドごとの振り分けと両レッグへの中継を行う。
pub struct SipCore {
    cfg: EngineConfig,
    transport_tx: TransportSendTx,
    users: Arc<UserRegistry>,
    calls: Arc<CallManager>,
    relay: Arc<RtpRelay>,
}

fn generate_branch() -> String {
    let mut rng = rand::thread_rng();
    format!("z9hG4bK-{}", rng.gen::<u64>())
}

fn via_branch(via: &str) -> Option<&str> {
    via.split(';')
        .skip(1)
        .map(str::trim)
        .find_map(|param| param.strip_prefix("branch="))
}

fn has_sdp_body(req: &SipRequest) -> bool {
    !req.body.is_empty()
        && req
            .header_value("Content-Type")
            .map(|v| v.to_ascii_lowercase().contains("application/sdp"))
            .unwrap_or(false)
}

impl SipCore {
    pub fn new(
        cfg: EngineConfig,
        transport_tx: TransportSendTx,
        users: Arc<UserRegistry>,
        calls: Arc<CallManager>,
        relay: Arc<RtpRelay>,
    ) -> Self {
        Self {
            cfg,
            transport_tx,
            users,
            calls,
            relay,
        }
    }

    pub fn handle_input(&self, input: &SipInput) {
        let Ok(text) = std::str::from_utf8(&input.data) else {
            warn!("[sip] non-UTF8 datagram from {}, dropped", input.src);
            return;
        };

        match parse_sip_message(text) {
            Ok(SipMessage::Request(req)) => self.handle_request(req, input.src),
            Ok(SipMessage::Response(resp)) => self.handle_response(&resp, input.src),
            Err(err) => {
                warn!("[sip] failed to parse datagram from {}: {}", input.src, err);
            }
        }
    }

    fn handle_request(&self, req: SipRequest, src: SocketAddr) {
        let result = match &req.method {
            SipMethod::Register => self.handle_register(&req, src),
            SipMethod::Invite => self.handle_invite(&req, src),
            SipMethod::Ack => self.handle_ack(&req, src),
            SipMethod::Bye => self.handle_bye(&req, src),
            SipMethod::Unknown(token) => {
                debug!("[sip] unsupported method {} from {}, dropped", token, src);
                Ok(())
            }
        };

        if let Err(err) = result {
            self.reply_error(&req, src, &err);
        }
    }

    fn reply_error(&self, req: &SipRequest, src: SocketAddr, err: &EngineError) {
        let (code, reason) = match err {
            EngineError::Validation(errors) => {
                info!("[sip] {} rejected: {:?}", req.method.as_str(), errors);
                (400, "Bad Request")
            }
            EngineError::Unregistered(number) => {
                info!("[sip] {} rejected: {} not registered", req.method.as_str(), number);
                (404, "Not Found")
            }
            EngineError::Busy(number) => {
                info!("[sip] {} rejected: {} busy", req.method.as_str(), number);
                (486, "Busy Here")
            }
            EngineError::UnknownDialog(call_id) => {
                warn!("[sip] no dialog for Call-ID {}, dropped", call_id);
                return;
            }
            EngineError::Internal(msg) => {
                warn!("[sip] internal error handling {}: {}", req.method.as_str(), msg);
                (500, "Internal Server Error")
            }
        };

        match response_simple_from_request(req, code, reason) {
            Some(resp) => self.send(src, resp.to_bytes()),
            None => warn!(
                "[sip] cannot build {} reply for {} (missing headers), dropped",
                code, src
            ),
        }
    }

    fn handle_register(&self, req: &SipRequest, src: SocketAddr) -> Result<(), EngineError> {
        let info =
            validate_register(req, &self.cfg.extensions).map_err(EngineError::Validation)?;
        let expires = info.expires.unwrap_or(self.cfg.default_expires_secs);

        let binding = self
            .users
            .register(&info.number, &info.contact_uri, src, expires);
        info!(
            "[register] {} -> {} expires={} count={}",
            info.number, src, expires, binding.registration_count
        );

        let core = req
            .core_headers()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let contact = req.header_value("Contact").unwrap_or_default().to_string();
        let resp = SipResponseBuilder::new(200, "OK")
            .header("Via", core.via)
            .header("From", core.from)
            .header("To", core.to)
            .header("Call-ID", core.call_id)
            .header("CSeq", core.cseq)
            .header("Contact", contact)
            .header("Expires", expires.to_string())
            .build();
        self.send(src, resp.to_bytes());
        Ok(())
    }

    fn handle_invite(&self, req: &SipRequest, src: SocketAddr) -> Result<(), EngineError> {
        let info = validate_invite(req, &self.cfg.extensions).map_err(EngineError::Validation)?;
        let core = req
            .core_headers()
            .map_err(|e| EngineError::Internal(e.to_string()))?;

        if self.calls.get(&core.call_id).is_some() {
            debug!("[invite] retransmission for call_id={}, dropped", core.call_id);
            return Ok(());
        }

        if !self.users.is_registered(&info.from_number) {
            return Err(EngineError::Unregistered(info.from_number));
        }
        let callee = self
            .users
            .lookup(&info.to_number)
            .ok_or_else(|| EngineError::Unregistered(info.to_number.clone()))?;
        if self.calls.is_number_busy(&info.to_number) {
            return Err(EngineError::Busy(info.to_number));
        }
        self.users.update_last_seen(&info.from_number);

        let contact = req.header_value("Contact").unwrap_or_default().to_string();
        let preserved = PreservedHeaders {
            via: core.via.clone(),
            from: core.from.clone(),
            to: core.to.clone(),
            cseq: core.cseq.clone(),
            contact: contact.clone(),
        };
        self.calls
            .create(&core.call_id, &info.from_number, &info.to_number, src, preserved)
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        info!(
            "[invite] {} -> {} call_id={}",
            info.from_number, info.to_number, core.call_id
        );

        if let Some(trying) = response_simple_from_request(req, 100, "Trying") {
            self.send(src, trying.to_bytes());
        }

        let mut body = Vec::new();
        let with_sdp = has_sdp_body(req);
        if with_sdp {
            let sdp_text = std::str::from_utf8(&req.body)
                .map_err(|_| EngineError::Internal("SDP body is not valid UTF-8".to_string()))?;
            if let Some(port) = sdp::audio_port(sdp_text) {
                let _ = self.calls.set_from_rtp_port(&core.call_id, port);
            }
            body = sdp::rewrite(sdp_text, &self.cfg.server_ip, self.cfg.rtp_port).into_bytes();
        }

        // 新しい Via を先頭に積み、発側の Via はその後ろに残す
        let mut builder = SipRequestBuilder::new(
            SipMethod::Invite,
            format!("sip:{}@{}", info.to_number, callee.transport),
        )
        .header(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};branch={}",
                self.cfg.server_ip,
                self.cfg.sip_port,
                generate_branch()
            ),
        )
        .header("Via", core.via)
        .header("Max-Forwards", "70")
        .header("From", core.from)
        .header("To", core.to)
        .header("Call-ID", core.call_id.clone())
        .header("CSeq", core.cseq)
        .header("Contact", contact);
        if with_sdp {
            builder = builder.body(body, Some("application/sdp"));
        }
        self.send(callee.transport, builder.build().to_bytes());
        // 着側トランスポートの確定（RINGING への遷移）は着側からの最初の
        // 応答で行う。応答が無いままなら INITIATED のままタイムアウトする。
        Ok(())
    }

    fn handle_ack(&self, req: &SipRequest, src: SocketAddr) -> Result<(), EngineError> {
        let call_id = req
            .header_value("Call-ID")
            .ok_or_else(|| EngineError::UnknownDialog("<missing>".to_string()))?
            .to_string();
        let Some(call) = self.calls.get(&call_id) else {
            return Err(EngineError::UnknownDialog(call_id));
        };
        let Some(to_transport) = call.to_transport else {
            warn!("[ack] call_id={} has no target leg yet, dropped", call_id);
            return Ok(());
        };

        // 受信 Via の branch があれば引き継ぐ
        let branch = req
            .header_value("Via")
            .and_then(via_branch)
            .map(str::to_string)
            .unwrap_or_else(generate_branch);

        let mut builder = SipRequestBuilder::new(
            SipMethod::Ack,
            format!("sip:{}@{}", call.to_number, to_transport),
        )
        .header(
            "Via",
            format!(
                "SIP/2.0/UDP {}:{};branch={}",
                self.cfg.server_ip, self.cfg.sip_port, branch
            ),
        )
        .header("Max-Forwards", "70");
        for name in ["From", "To", "Call-ID", "CSeq", "Contact"] {
            if let Some(value) = req.header_value(name) {
                builder = builder.header(name, value);
            }
        }
        if !req.body.is_empty() {
            let content_type = req.header_value("Content-Type").map(str::to_string);
            builder = builder.body(req.body.clone(), content_type.as_deref());
        }
        self.send(to_transport, builder.build().to_bytes());
        debug!("[ack] forwarded call_id={} {} -> {}", call_id, src, to_transport);

        let _ = self.calls.ack_received(&call_id);
        Ok(())
    }

    fn handle_bye(&self, req: &SipRequest, src: SocketAddr) -> Result<(), EngineError> {
        validate_bye(req, &self.cfg.extensions).map_err(EngineError::Validation)?;
        let core = req
            .core_headers()
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        let Some(call) = self.calls.get(&core.call_id) else {
            return Err(EngineError::UnknownDialog(core.call_id));
        };

        // 送信元と一致しない側が転送先
        let (peer_number, peer_transport) = if src == call.from_transport {
            (call.to_number.clone(), call.to_transport)
        } else {
            (call.from_number.clone(), Some(call.from_transport))
        };

        self.relay.remove(&core.call_id);

        match peer_transport {
            Some(dst) => {
                let bye = SipRequestBuilder::new(
                    SipMethod::Bye,
                    format!("sip:{}@{}", peer_number, dst),
                )
                .header(
                    "Via",
                    format!(
                        "SIP/2.0/UDP {}:{};branch={}",
                        self.cfg.server_ip,
                        self.cfg.sip_port,
                        generate_branch()
                    ),
                )
                .header("Max-Forwards", "70")
                .header("From", core.from)
                .header("To", core.to)
                .header("Call-ID", core.call_id.clone())
                .header("CSeq", core.cseq)
                .build();
                self.send(dst, bye.to_bytes());
                let _ = self.calls.mark_terminating(&core.call_id);
                info!("[bye] call_id={} terminating, forwarded to {}", core.call_id, dst);
            }
            None => {
                // まだ着側が居ない通話への BYE はその場で閉じる
                if let Some(record) = self.calls.end(&core.call_id, EndReason::Normal) {
                    info!(
                        "[bye] call_id={} ended before target leg, duration={}s",
                        record.call_id, record.duration_seconds
                    );
                }
            }
        }

        if let Some(ok) = response_simple_from_request(req, 200, "OK") {
            self.send(src, ok.to_bytes());
        }
        Ok(())
    }

    fn handle_response(&self, resp: &SipResponse, src: SocketAddr) {
        let Some(call_id) = resp.header_value("Call-ID") else {
            warn!("[sip] response without Call-ID from {}, dropped", src);
            return;
        };
        let Some(mut call) = self.calls.get(call_id) else {
            warn!("[sip] response {} for unknown dialog {}, dropped", resp.status_code, call_id);
            return;
        };

        match resp.status_code {
            200 if call.state == CallState::Terminating => {
                self.relay.remove(&call.call_id);
                if let Some(record) = self.calls.end(&call.call_id, EndReason::Normal) {
                    info!(
                        "[bye] call_id={} closed, duration={}s",
                        record.call_id, record.duration_seconds
                    );
                }
            }
            200 => {
                self.install_target(&mut call, src);
                self.relay_answer(&call, resp);
            }
            404 | 486 | 487 => self.relay_failure(&call, resp),
            100..=199 => {
                // 発側には自前の 100 Trying を返しているので中継はしない
                self.install_target(&mut call, src);
                debug!(
                    "[sip] provisional {} from callee for call_id={}, not relayed",
                    resp.status_code, call_id
                );
            }
            other => {
                warn!("[sip] unhandled response {} for call_id={}, dropped", other, call_id);
            }
        }
    }

    /// 着側からの最初の応答で、その送信元を着側トランスポートとして確定する。
    fn install_target(&self, call: &mut Call, src: SocketAddr) {
        if call.to_transport.is_some() {
            return;
        }
        match self.calls.set_target(&call.call_id, src) {
            Ok(()) => {
                call.to_transport = Some(src);
                call.state = CallState::Ringing;
                info!("[invite] call_id={} ringing, callee at {}", call.call_id, src);
            }
            Err(err) => {
                warn!("[sip] cannot install target for call_id={}: {}", call.call_id, err);
            }
        }
    }

    /// 着側の 200 OK を発側へ中継する。ヘッダは INVITE 受信時に写し取った値、
    /// Contact はサーバ経由で ACK/BYE が届くようこちらを指す。
    fn relay_answer(&self, call: &Call, resp: &SipResponse) {
        let call_id = &call.call_id;
        let mut to_rtp = call.to_rtp_port;
        let mut body = Vec::new();
        if !resp.body.is_empty() {
            match std::str::from_utf8(&resp.body) {
                Ok(sdp_text) => {
                    if let Some(port) = sdp::audio_port(sdp_text) {
                        to_rtp = Some(port);
                        let _ = self.calls.set_to_rtp_port(call_id, port);
                    }
                    body =
                        sdp::rewrite(sdp_text, &self.cfg.server_ip, self.cfg.rtp_port).into_bytes();
                }
                Err(_) => {
                    warn!("[sip] non-UTF8 SDP in 200 OK for call_id={}, body dropped", call_id);
                }
            }
        }

        let mut builder = SipResponseBuilder::new(200, "OK")
            .header("Via", call.preserved.via.clone())
            .header("From", call.preserved.from.clone())
            .header("To", call.preserved.to.clone())
            .header("Call-ID", call_id.clone())
            .header("CSeq", call.preserved.cseq.clone())
            .header(
                "Contact",
                format!(
                    "<sip:{}@{}:{}>",
                    call.to_number, self.cfg.server_ip, self.cfg.sip_port
                ),
            );
        if let Some(ct) = resp.header_value("Content-Type") {
            builder = builder.header("Content-Type", ct);
        }
        if !body.is_empty() {
            builder = builder.body(body, None);
        }
        self.send(call.from_transport, builder.build().to_bytes());

        if let (Some(from_port), Some(to_port), Some(to_transport)) =
            (call.from_rtp_port, to_rtp, call.to_transport)
        {
            let caller = SocketAddr::new(call.from_transport.ip(), from_port);
            let callee = SocketAddr::new(to_transport.ip(), to_port);
            self.relay.install(call_id, caller, callee);
            info!("[rtp] stream installed call_id={} {} <-> {}", call_id, caller, callee);
        }

        if call.state != CallState::Established {
            if let Err(err) = self.calls.answer(call_id) {
                warn!("[sip] cannot mark call_id={} established: {}", call_id, err);
            } else {
                info!("[invite] call_id={} established", call_id);
            }
        }
    }

    /// 着側からの失敗応答を同じコードで発側へ返し、通話を閉じる。
    fn relay_failure(&self, call: &Call, resp: &SipResponse) {
        let upstream = SipResponseBuilder::new(resp.status_code, resp.reason_phrase.clone())
            .header("Via", call.preserved.via.clone())
            .header("From", call.preserved.from.clone())
            .header("To", call.preserved.to.clone())
            .header("Call-ID", call.call_id.clone())
            .header("CSeq", call.preserved.cseq.clone())
            .build();
        self.send(call.from_transport, upstream.to_bytes());

        self.relay.remove(&call.call_id);
        if let Some(record) = self
            .calls
            .end(&call.call_id, EndReason::Rejected(resp.status_code))
        {
            info!(
                "[invite] call_id={} rejected with {} by callee",
                record.call_id, resp.status_code
            );
        }
    }

    fn send(&self, dst: SocketAddr, payload: Vec<u8>) {
        if let Some(first_line) = payload
            .split(|b| *b == b'\n')
            .next()
            .and_then(|line| std::str::from_utf8(line).ok())
        {
            debug!("[sip ->] {} {}", dst, first_line.trim());
        }
        if self
            .transport_tx
            .send(TransportSendRequest { dst, payload })
            .is_err()
        {
            warn!("[sip ->] transport channel closed, dropping payload for {}", dst);
        }
    }
}

//! エンジンを公開入力（SipInput）から叩いて、登録→発呼→確立→切断の
//! 一連の流れと境界動作を検める。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use mini_pbx::calls::{CallManager, CallState, EndReason};
use mini_pbx::rtp::RtpRelay;
use mini_pbx::sip::{
    parse_sip_message, EngineConfig, SipCore, SipMessage, SipMethod, SipRequest,
    SipRequestBuilder, SipResponse, SipResponseBuilder,
};
use mini_pbx::transport::{SipInput, TransportSendRequest};
use mini_pbx::users::UserRegistry;

const SERVER_IP: &str = "192.168.0.42";
const CALLER: &str = "10.0.0.5:5061";
const CALLEE: &str = "10.0.0.6:5060";

struct Harness {
    core: SipCore,
    rx: UnboundedReceiver<TransportSendRequest>,
    users: Arc<UserRegistry>,
    calls: Arc<CallManager>,
    relay: Arc<RtpRelay>,
}

fn harness_with_timeout(setup_timeout: Duration) -> Harness {
    let (tx, rx) = unbounded_channel();
    let users = Arc::new(UserRegistry::new());
    let calls = Arc::new(CallManager::new(setup_timeout));
    let relay = Arc::new(RtpRelay::new());
    let core = SipCore::new(
        EngineConfig {
            server_ip: SERVER_IP.to_string(),
            sip_port: 5060,
            rtp_port: 10000,
            extensions: 100..=110,
            default_expires_secs: 3600,
        },
        tx,
        users.clone(),
        calls.clone(),
        relay.clone(),
    );
    Harness {
        core,
        rx,
        users,
        calls,
        relay,
    }
}

fn harness() -> Harness {
    harness_with_timeout(Duration::from_secs(30))
}

impl Harness {
    fn feed(&self, src: &str, data: Vec<u8>) {
        self.core.handle_input(&SipInput {
            src: src.parse().unwrap(),
            data,
        });
    }

    fn next(&mut self) -> (SocketAddr, SipMessage) {
        let sent = self.rx.try_recv().expect("outbound message");
        let text = String::from_utf8(sent.payload).expect("utf8");
        (sent.dst, parse_sip_message(&text).expect("parse outbound"))
    }

    fn next_response(&mut self) -> (SocketAddr, SipResponse) {
        match self.next() {
            (dst, SipMessage::Response(resp)) => (dst, resp),
            (_, SipMessage::Request(req)) => panic!("expected response, got {:?}", req.method),
        }
    }

    fn next_request(&mut self) -> (SocketAddr, SipRequest) {
        match self.next() {
            (dst, SipMessage::Request(req)) => (dst, req),
            (_, SipMessage::Response(resp)) => {
                panic!("expected request, got {}", resp.status_code)
            }
        }
    }

    fn assert_quiet(&mut self) {
        assert!(self.rx.try_recv().is_err(), "unexpected outbound message");
    }

    fn register(&mut self, user: &str, src: &str) {
        let req = SipRequestBuilder::new(
            SipMethod::Register,
            format!("sip:{}@{}:5060", user, SERVER_IP),
        )
        .header("Via", format!("SIP/2.0/UDP {};branch=z9hG4bK-reg-{}", src, user))
        .header("From", format!("<sip:{}@{}>", user, SERVER_IP))
        .header("To", format!("<sip:{}@{}>", user, SERVER_IP))
        .header("Call-ID", format!("reg-{}", user))
        .header("CSeq", "1 REGISTER")
        .header("Contact", format!("<sip:{}@{}>", user, src))
        .header("Expires", "3600")
        .build();
        self.feed(src, req.to_bytes());
        let (_, resp) = self.next_response();
        assert_eq!(resp.status_code, 200);
    }
}

fn caller_sdp() -> String {
    "v=0\r\n\
o=100 1234 1 IN IP4 10.0.0.5\r\n\
s=call\r\n\
c=IN IP4 10.0.0.5\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n"
        .to_string()
}

fn callee_sdp() -> String {
    "v=0\r\n\
o=101 5678 1 IN IP4 10.0.0.6\r\n\
s=call\r\n\
c=IN IP4 10.0.0.6\r\n\
t=0 0\r\n\
m=audio 41000 RTP/AVP 0\r\n\
a=rtpmap:0 PCMU/8000\r\n"
        .to_string()
}

fn invite(call_id: &str, from: &str, to: &str, src: &str, sdp: &str) -> SipRequest {
    SipRequestBuilder::new(SipMethod::Invite, format!("sip:{}@{}:5060", to, SERVER_IP))
        .header("Via", format!("SIP/2.0/UDP {};branch=z9hG4bK-inv-{}", src, call_id))
        .header("From", format!("<sip:{}@{}>;tag=caller-{}", from, SERVER_IP, from))
        .header("To", format!("<sip:{}@{}>", to, SERVER_IP))
        .header("Call-ID", call_id)
        .header("CSeq", "1 INVITE")
        .header("Contact", format!("<sip:{}@{}>", from, src))
        .body(sdp.as_bytes().to_vec(), Some("application/sdp"))
        .build()
}

fn callee_ok(call_id: &str, sdp: &str) -> SipResponse {
    SipResponseBuilder::new(200, "OK")
        .header("Via", format!("SIP/2.0/UDP {}:5060;branch=z9hG4bK-srv", SERVER_IP))
        .header("From", format!("<sip:100@{}>;tag=caller-100", SERVER_IP))
        .header("To", format!("<sip:101@{}>;tag=callee-101", SERVER_IP))
        .header("Call-ID", call_id)
        .header("CSeq", "1 INVITE")
        .header("Contact", "<sip:101@10.0.0.6:5060>")
        .body(sdp.as_bytes().to_vec(), Some("application/sdp"))
        .build()
}

/// シナリオ1: 登録が 200 で折り返り、バインディングに送信元が入る。
#[test]
fn register_installs_binding_with_observed_transport() {
    let mut h = harness();
    let req = SipRequestBuilder::new(SipMethod::Register, format!("sip:100@{}:5060", SERVER_IP))
        .header("Via", "SIP/2.0/UDP 10.0.0.5:5061;branch=z9hG4bK-1")
        .header("From", format!("<sip:100@{}>", SERVER_IP))
        .header("To", format!("<sip:100@{}>", SERVER_IP))
        .header("Call-ID", "reg-100")
        .header("CSeq", "1 REGISTER")
        .header("Contact", "<sip:100@10.0.0.5:5061>")
        .header("Expires", "3600")
        .build();
    h.feed(CALLER, req.to_bytes());

    let (dst, resp) = h.next_response();
    assert_eq!(dst, CALLER.parse::<SocketAddr>().unwrap());
    assert_eq!(resp.status_code, 200);
    assert_eq!(
        resp.header_value("Via"),
        Some("SIP/2.0/UDP 10.0.0.5:5061;branch=z9hG4bK-1")
    );
    assert_eq!(resp.header_value("Call-ID"), Some("reg-100"));
    assert_eq!(resp.header_value("CSeq"), Some("1 REGISTER"));
    assert_eq!(resp.header_value("Contact"), Some("<sip:100@10.0.0.5:5061>"));
    assert_eq!(resp.header_value("Expires"), Some("3600"));

    let binding = h.users.lookup("100").expect("binding");
    assert_eq!(binding.transport, CALLER.parse::<SocketAddr>().unwrap());
    assert_eq!(binding.contact_uri, "sip:100@10.0.0.5:5061");
}

/// シナリオ2: ダイヤルプラン外の登録は 400 で、バインディングは作らない。
#[test]
fn register_for_invalid_extension_is_rejected() {
    let mut h = harness();
    let req = SipRequestBuilder::new(SipMethod::Register, format!("sip:099@{}:5060", SERVER_IP))
        .header("Via", "SIP/2.0/UDP 10.0.0.5:5061;branch=z9hG4bK-2")
        .header("From", format!("<sip:099@{}>", SERVER_IP))
        .header("To", format!("<sip:099@{}>", SERVER_IP))
        .header("Call-ID", "reg-099")
        .header("CSeq", "1 REGISTER")
        .header("Contact", "<sip:099@10.0.0.5:5061>")
        .build();
    h.feed(CALLER, req.to_bytes());

    let (_, resp) = h.next_response();
    assert_eq!(resp.status_code, 400);
    assert!(h.users.lookup("099").is_none());
}

/// シナリオ3: 発呼成功。SDP が書き換わり、両方向の RTP ストリームが張られる。
#[test]
fn call_setup_rewrites_sdp_and_installs_streams() {
    let mut h = harness();
    h.register("100", CALLER);
    h.register("101", CALLEE);

    h.feed(CALLER, invite("call-1", "100", "101", CALLER, &caller_sdp()).to_bytes());

    // 発側へ 100 Trying
    let (dst, trying) = h.next_response();
    assert_eq!(dst, CALLER.parse::<SocketAddr>().unwrap());
    assert_eq!(trying.status_code, 100);

    // 着側へ書き換え済み INVITE
    let (dst, downstream) = h.next_request();
    assert_eq!(dst, CALLEE.parse::<SocketAddr>().unwrap());
    assert_eq!(downstream.method, SipMethod::Invite);
    assert_eq!(downstream.uri, format!("sip:101@{}", CALLEE));
    let body = String::from_utf8(downstream.body.clone()).unwrap();
    assert!(body.contains(&format!("c=IN IP4 {}\r\n", SERVER_IP)));
    assert!(body.contains("m=audio 10000 RTP/AVP 0\r\n"));
    // 新しい Via が先頭、発側の Via がその後ろ
    let vias: Vec<&str> = downstream
        .headers
        .iter()
        .filter(|hdr| hdr.name == "Via")
        .map(|hdr| hdr.value.as_str())
        .collect();
    assert_eq!(vias.len(), 2);
    assert!(vias[0].starts_with(&format!("SIP/2.0/UDP {}:5060;branch=z9hG4bK-", SERVER_IP)));

    // まだ応答が無いので INITIATED のまま
    assert_eq!(h.calls.get("call-1").unwrap().state, CallState::Initiated);

    // 着側 200 OK → 発側へ中継
    h.feed(CALLEE, callee_ok("call-1", &callee_sdp()).to_bytes());
    let (dst, ok) = h.next_response();
    assert_eq!(dst, CALLER.parse::<SocketAddr>().unwrap());
    assert_eq!(ok.status_code, 200);
    // ヘッダは INVITE 受信時に写し取った値
    assert_eq!(
        ok.header_value("Via"),
        Some("SIP/2.0/UDP 10.0.0.5:5061;branch=z9hG4bK-inv-call-1")
    );
    assert_eq!(ok.header_value("CSeq"), Some("1 INVITE"));
    assert_eq!(
        ok.header_value("Contact"),
        Some(format!("<sip:101@{}:5060>", SERVER_IP).as_str())
    );
    let ok_body = String::from_utf8(ok.body.clone()).unwrap();
    assert!(ok_body.contains("m=audio 10000 RTP/AVP 0\r\n"));
    assert!(ok_body.contains(&format!("c=IN IP4 {}\r\n", SERVER_IP)));

    // 通話状態とメディアポート
    let call = h.calls.get("call-1").expect("call");
    assert_eq!(call.state, CallState::Established);
    assert_eq!(call.from_rtp_port, Some(40000));
    assert_eq!(call.to_rtp_port, Some(41000));
    assert!(call.waiting_for_ack);

    // 両方向のストリーム
    let (_, dst) = h
        .relay
        .forward_target("10.0.0.5:40000".parse().unwrap())
        .expect("caller stream");
    assert_eq!(dst, "10.0.0.6:41000".parse::<SocketAddr>().unwrap());
    let (_, back) = h
        .relay
        .forward_target("10.0.0.6:41000".parse().unwrap())
        .expect("callee stream");
    assert_eq!(back, "10.0.0.5:40000".parse::<SocketAddr>().unwrap());
}

fn established_call(h: &mut Harness) {
    h.register("100", CALLER);
    h.register("101", CALLEE);
    h.feed(CALLER, invite("call-1", "100", "101", CALLER, &caller_sdp()).to_bytes());
    let _ = h.next_response(); // 100 Trying
    let _ = h.next_request(); // downstream INVITE
    h.feed(CALLEE, callee_ok("call-1", &callee_sdp()).to_bytes());
    let _ = h.next_response(); // relayed 200
}

/// シナリオ4: ACK はサーバの Via と引き継いだ branch で着側へ渡る。
#[test]
fn ack_transits_the_server_with_fresh_via() {
    let mut h = harness();
    established_call(&mut h);

    let ack = SipRequestBuilder::new(SipMethod::Ack, format!("sip:101@{}:5060", SERVER_IP))
        .header("Via", format!("SIP/2.0/UDP {};branch=z9hG4bK-ack-1", CALLER))
        .header("From", format!("<sip:100@{}>;tag=caller-100", SERVER_IP))
        .header("To", format!("<sip:101@{}>;tag=callee-101", SERVER_IP))
        .header("Call-ID", "call-1")
        .header("CSeq", "1 ACK")
        .build();
    h.feed(CALLER, ack.to_bytes());

    let (dst, forwarded) = h.next_request();
    assert_eq!(dst, CALLEE.parse::<SocketAddr>().unwrap());
    assert_eq!(forwarded.method, SipMethod::Ack);
    assert_eq!(forwarded.uri, format!("sip:101@{}", CALLEE));
    assert_eq!(
        forwarded.header_value("Via"),
        Some(format!("SIP/2.0/UDP {}:5060;branch=z9hG4bK-ack-1", SERVER_IP).as_str())
    );
    assert!(!h.calls.get("call-1").unwrap().waiting_for_ack);
}

fn bye(call_id: &str, src: &str, from_tag: &str, to_tag: &str) -> SipRequest {
    SipRequestBuilder::new(SipMethod::Bye, format!("sip:101@{}:5060", SERVER_IP))
        .header("Via", format!("SIP/2.0/UDP {};branch=z9hG4bK-bye-1", src))
        .header("From", format!("<sip:100@{}>;tag={}", SERVER_IP, from_tag))
        .header("To", format!("<sip:101@{}>;tag={}", SERVER_IP, to_tag))
        .header("Call-ID", call_id)
        .header("CSeq", "2 BYE")
        .build()
}

/// シナリオ5: BYE で反対レッグへ転送、200 で通話と RTP エントリが消える。
#[test]
fn bye_tears_down_call_and_streams() {
    let mut h = harness();
    established_call(&mut h);
    assert_eq!(h.relay.len(), 1);

    h.feed(CALLER, bye("call-1", CALLER, "caller-100", "callee-101").to_bytes());

    // 反対レッグ（着側）へ BYE
    let (dst, forwarded) = h.next_request();
    assert_eq!(dst, CALLEE.parse::<SocketAddr>().unwrap());
    assert_eq!(forwarded.method, SipMethod::Bye);
    // 送信者には 200 OK
    let (dst, ok) = h.next_response();
    assert_eq!(dst, CALLER.parse::<SocketAddr>().unwrap());
    assert_eq!(ok.status_code, 200);

    // ストリームは即時に外れ、通話は TERMINATING で残る
    assert_eq!(h.relay.len(), 0);
    assert_eq!(h.calls.get("call-1").unwrap().state, CallState::Terminating);

    // 着側の 200 OK で完全に閉じる
    let closing = SipResponseBuilder::new(200, "OK")
        .header("Via", format!("SIP/2.0/UDP {}:5060;branch=z9hG4bK-bye-f", SERVER_IP))
        .header("From", format!("<sip:100@{}>;tag=caller-100", SERVER_IP))
        .header("To", format!("<sip:101@{}>;tag=callee-101", SERVER_IP))
        .header("Call-ID", "call-1")
        .header("CSeq", "2 BYE")
        .build();
    h.feed(CALLEE, closing.to_bytes());

    assert!(h.calls.get("call-1").is_none());
    let history = h.calls.history(10, 0);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, EndReason::Normal);
    h.assert_quiet();
}

/// 着側から切られた場合は発側へ BYE が転送される。
#[test]
fn bye_from_callee_targets_caller_leg() {
    let mut h = harness();
    established_call(&mut h);

    h.feed(CALLEE, bye("call-1", CALLEE, "caller-100", "callee-101").to_bytes());

    let (dst, forwarded) = h.next_request();
    assert_eq!(dst, CALLER.parse::<SocketAddr>().unwrap());
    assert_eq!(forwarded.method, SipMethod::Bye);
    let (dst, ok) = h.next_response();
    assert_eq!(dst, CALLEE.parse::<SocketAddr>().unwrap());
    assert_eq!(ok.status_code, 200);
}

/// シナリオ6: 応答が無い INVITE はタイムアウトで閉じる。
#[test]
fn unanswered_invite_times_out() {
    let mut h = harness_with_timeout(Duration::from_millis(0));
    h.register("100", CALLER);
    h.register("101", CALLEE);

    h.feed(CALLER, invite("call-1", "100", "101", CALLER, &caller_sdp()).to_bytes());
    let _ = h.next_response(); // 100 Trying
    let _ = h.next_request(); // downstream INVITE
    assert_eq!(h.calls.get("call-1").unwrap().state, CallState::Initiated);

    let timed_out = h.calls.cleanup();
    assert_eq!(timed_out, vec!["call-1".to_string()]);
    assert!(h.calls.get("call-1").is_none());
    let history = h.calls.history(10, 0);
    assert_eq!(history[0].reason, EndReason::Timeout);
}

/// 通話中の内線への INVITE は 486。
#[test]
fn invite_to_busy_callee_is_rejected() {
    let mut h = harness();
    established_call(&mut h);
    h.register("102", "10.0.0.7:5062");

    h.feed(
        "10.0.0.7:5062",
        invite("call-2", "102", "101", "10.0.0.7:5062", &caller_sdp()).to_bytes(),
    );

    let (dst, resp) = h.next_response();
    assert_eq!(dst, "10.0.0.7:5062".parse::<SocketAddr>().unwrap());
    assert_eq!(resp.status_code, 486);
    assert!(h.calls.get("call-2").is_none());
}

/// 自分自身への発呼は 400。
#[test]
fn self_call_is_rejected_with_400() {
    let mut h = harness();
    h.register("100", CALLER);

    h.feed(CALLER, invite("call-3", "100", "100", CALLER, &caller_sdp()).to_bytes());

    let (_, resp) = h.next_response();
    assert_eq!(resp.status_code, 400);
}

/// 着側が 486 を返したら同じコードを発側へ返し、通話を閉じる。
#[test]
fn callee_failure_is_relayed_upstream() {
    let mut h = harness();
    h.register("100", CALLER);
    h.register("101", CALLEE);
    h.feed(CALLER, invite("call-4", "100", "101", CALLER, &caller_sdp()).to_bytes());
    let _ = h.next_response();
    let _ = h.next_request();

    let busy = SipResponseBuilder::new(486, "Busy Here")
        .header("Via", format!("SIP/2.0/UDP {}:5060;branch=z9hG4bK-b", SERVER_IP))
        .header("From", format!("<sip:100@{}>;tag=caller-100", SERVER_IP))
        .header("To", format!("<sip:101@{}>;tag=callee-101", SERVER_IP))
        .header("Call-ID", "call-4")
        .header("CSeq", "1 INVITE")
        .build();
    h.feed(CALLEE, busy.to_bytes());

    let (dst, resp) = h.next_response();
    assert_eq!(dst, CALLER.parse::<SocketAddr>().unwrap());
    assert_eq!(resp.status_code, 486);
    assert!(h.calls.get("call-4").is_none());
    assert_eq!(h.calls.history(10, 0)[0].reason, EndReason::Rejected(486));
}

/// 180 は発側へは中継しないが、着側トランスポートの確定には使う。
#[test]
fn provisional_ringing_installs_target_without_relay() {
    let mut h = harness();
    h.register("100", CALLER);
    h.register("101", CALLEE);
    h.feed(CALLER, invite("call-5", "100", "101", CALLER, &caller_sdp()).to_bytes());
    let _ = h.next_response();
    let _ = h.next_request();

    let ringing = SipResponseBuilder::new(180, "Ringing")
        .header("Via", format!("SIP/2.0/UDP {}:5060;branch=z9hG4bK-r", SERVER_IP))
        .header("From", format!("<sip:100@{}>;tag=caller-100", SERVER_IP))
        .header("To", format!("<sip:101@{}>;tag=callee-101", SERVER_IP))
        .header("Call-ID", "call-5")
        .header("CSeq", "1 INVITE")
        .build();
    h.feed(CALLEE, ringing.to_bytes());

    h.assert_quiet();
    let call = h.calls.get("call-5").unwrap();
    assert_eq!(call.state, CallState::Ringing);
    assert_eq!(call.to_transport, Some(CALLEE.parse().unwrap()));
    // RINGING になった時点で両者とも busy
    assert!(h.calls.is_number_busy("100"));
    assert!(h.calls.is_number_busy("101"));
}

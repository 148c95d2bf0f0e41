// Request or Response の種別
#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String, // とりあえず String, 後で構造化しても良い
    pub version: String,
    pub headers: Vec<SipHeader>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: Vec<SipHeader>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Unknown(String),
}

impl SipMethod {
    pub fn as_str(&self) -> &str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Unknown(token) => token.as_str(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SipHeader {
    pub name: String,
    pub value: String,
}

impl SipHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

fn find_header<'a>(headers: &'a [SipHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

impl SipRequest {
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// よく使う基本ヘッダをまとめて返す（存在しない場合は Err）
    pub fn core_headers(&self) -> anyhow::Result<CoreHeaders> {
        core_headers_from(&self.headers)
    }
}

impl SipResponse {
    pub fn header_value(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// 応答の組み立てに使う基本ヘッダ一式。値は受信したままの文字列で保持する。
#[derive(Debug, Clone)]
pub struct CoreHeaders {
    pub via: String,
    pub from: String,
    pub to: String,
    pub call_id: String,
    pub cseq: String,
}

fn core_headers_from(headers: &[SipHeader]) -> anyhow::Result<CoreHeaders> {
    let get = |name: &str| {
        find_header(headers, name)
            .map(|v| v.to_string())
            .ok_or_else(|| anyhow::anyhow!("missing {} header", name))
    };

    Ok(CoreHeaders {
        via: get("Via")?,
        from: get("From")?,
        to: get("To")?,
        call_id: get("Call-ID")?,
        cseq: get("CSeq")?,
    })
}

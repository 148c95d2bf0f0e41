use std::ops::RangeInclusive;

use crate::sip::message::SipRequest;

/// `sip:<内線番号>@host[:port]` を分解した結果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionUri {
    pub number: String,
    pub domain: String,
    pub port: Option<u16>,
}

/// display-name 付きヘッダから URI 部分だけを取り出す。
/// `<...>` があればその中身、なければ全体を trim して返す。
pub fn extract_uri(header: &str) -> &str {
    let trimmed = header.trim();
    if let (Some(start), Some(end)) = (trimmed.find('<'), trimmed.rfind('>')) {
        if start < end {
            return &trimmed[start + 1..end];
        }
    }
    trimmed
}

/// 内線 URI のパース。番号がダイヤルプラン外なら Err。
pub fn parse_extension_uri(
    input: &str,
    extensions: &RangeInclusive<u32>,
) -> Result<ExtensionUri, String> {
    let rest = input
        .trim()
        .strip_prefix("sip:")
        .ok_or_else(|| format!("URI must use sip scheme: {}", input.trim()))?;

    let (user, host_part) = rest
        .split_once('@')
        .ok_or_else(|| format!("URI missing user part: {}", input.trim()))?;

    if user.is_empty() || !user.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("URI user part must be numeric: {}", user));
    }
    let value: u32 = user
        .parse()
        .map_err(|_| format!("URI user part out of range: {}", user))?;
    if !extensions.contains(&value) {
        return Err(format!(
            "extension {} outside dial plan {}-{}",
            user,
            extensions.start(),
            extensions.end()
        ));
    }

    let host_part = host_part.split(';').next().unwrap_or(host_part);
    let (domain, port) = match host_part.split_once(':') {
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| format!("invalid URI port: {}", port_str))?;
            (host, Some(port))
        }
        None => (host_part, None),
    };
    if domain.is_empty() {
        return Err("URI host is empty".to_string());
    }

    Ok(ExtensionUri {
        number: user.to_string(),
        domain: domain.to_string(),
        port,
    })
}

fn check_call_id(value: &str) -> Result<(), String> {
    let valid_chars = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    };
    let mut parts = value.splitn(2, '@');
    let local = parts.next().unwrap_or("");
    let host = parts.next();
    if !valid_chars(local) || host.map(|h| !valid_chars(h)).unwrap_or(false) {
        return Err(format!("malformed Call-ID: {}", value));
    }
    Ok(())
}

fn check_cseq(value: &str) -> Result<(), String> {
    let mut parts = value.split_whitespace();
    let num_ok = parts
        .next()
        .map(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    let method_ok = parts
        .next()
        .map(|m| !m.is_empty() && m.chars().all(|c| c.is_ascii_uppercase()))
        .unwrap_or(false);
    if !num_ok || !method_ok || parts.next().is_some() {
        return Err(format!("malformed CSeq: {}", value));
    }
    Ok(())
}

fn check_via(value: &str) -> Result<(), String> {
    let rest = value
        .trim()
        .strip_prefix("SIP/2.0/UDP ")
        .ok_or_else(|| format!("malformed Via: {}", value))?;
    let sent_by = rest.split(';').next().unwrap_or("").trim();
    let (host, port) = sent_by
        .rsplit_once(':')
        .ok_or_else(|| format!("Via missing port: {}", value))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(format!("malformed Via sent-by: {}", value));
    }
    Ok(())
}

const RTP_PORT_RANGE: RangeInclusive<u16> = 1024..=65535;

/// SDP ボディの形式チェック。必須行の存在と最初の m= 行だけを見る。
pub fn validate_sdp(body: &str) -> Vec<String> {
    let mut errors = Vec::new();

    for prefix in ["v=", "o=", "s=", "c=", "t=", "m="] {
        if !body.lines().any(|l| l.starts_with(prefix)) {
            errors.push(format!("SDP missing {} line", prefix));
        }
    }

    if let Some(media) = body.lines().find(|l| l.starts_with("m=")) {
        match media.strip_prefix("m=audio ") {
            Some(rest) => {
                let port = rest.split_whitespace().next().unwrap_or("");
                match port.parse::<u16>() {
                    Ok(p) if RTP_PORT_RANGE.contains(&p) => {}
                    _ => errors.push(format!("invalid audio port in SDP: {}", port)),
                }
            }
            None => errors.push(format!("unsupported media type: {}", media)),
        }
    }

    errors
}

#[derive(Debug, Clone)]
pub struct RegisterInfo {
    pub number: String,
    pub contact_uri: String,
    pub expires: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct InviteInfo {
    pub from_number: String,
    pub to_number: String,
}

const MAX_EXPIRES_SECS: u64 = 86_400;

fn check_required(req: &SipRequest, names: &[&str], errors: &mut Vec<String>) {
    for name in names {
        if req.header_value(name).is_none() {
            errors.push(format!("missing {} header", name));
        }
    }
}

fn check_common_shapes(req: &SipRequest, errors: &mut Vec<String>) {
    if let Some(call_id) = req.header_value("Call-ID") {
        if let Err(e) = check_call_id(call_id) {
            errors.push(e);
        }
    }
    if let Some(cseq) = req.header_value("CSeq") {
        if let Err(e) = check_cseq(cseq) {
            errors.push(e);
        }
    }
    if let Some(via) = req.header_value("Via") {
        if let Err(e) = check_via(via) {
            errors.push(e);
        }
    }
}

pub fn validate_register(
    req: &SipRequest,
    extensions: &RangeInclusive<u32>,
) -> Result<RegisterInfo, Vec<String>> {
    let mut errors = Vec::new();
    check_required(req, &["To", "From", "Call-ID", "CSeq", "Contact"], &mut errors);
    check_common_shapes(req, &mut errors);

    let to = req
        .header_value("To")
        .map(|v| parse_extension_uri(extract_uri(v), extensions));
    let from = req
        .header_value("From")
        .map(|v| parse_extension_uri(extract_uri(v), extensions));

    let number = match (&to, &from) {
        (Some(Ok(to_uri)), Some(Ok(from_uri))) => {
            if to_uri.number != from_uri.number {
                errors.push(format!(
                    "REGISTER To/From user mismatch: {} vs {}",
                    to_uri.number, from_uri.number
                ));
            }
            Some(to_uri.number.clone())
        }
        _ => {
            if let Some(Err(e)) = to {
                errors.push(format!("To: {}", e));
            }
            if let Some(Err(e)) = from {
                errors.push(format!("From: {}", e));
            }
            None
        }
    };

    let expires = match req.header_value("Expires") {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(v) if v <= MAX_EXPIRES_SECS => Some(v),
            _ => {
                errors.push(format!("invalid Expires: {}", raw));
                None
            }
        },
        None => None,
    };

    let contact_uri = req
        .header_value("Contact")
        .map(|v| extract_uri(v).to_string());

    match (number, contact_uri) {
        (Some(number), Some(contact_uri)) if errors.is_empty() => Ok(RegisterInfo {
            number,
            contact_uri,
            expires,
        }),
        _ => Err(errors),
    }
}

pub fn validate_invite(
    req: &SipRequest,
    extensions: &RangeInclusive<u32>,
) -> Result<InviteInfo, Vec<String>> {
    let mut errors = Vec::new();
    check_required(req, &["To", "From", "Call-ID", "CSeq", "Contact"], &mut errors);
    check_common_shapes(req, &mut errors);

    let to = req
        .header_value("To")
        .map(|v| parse_extension_uri(extract_uri(v), extensions));
    let from = req
        .header_value("From")
        .map(|v| parse_extension_uri(extract_uri(v), extensions));

    let numbers = match (&to, &from) {
        (Some(Ok(to_uri)), Some(Ok(from_uri))) => {
            if to_uri.number == from_uri.number {
                errors.push(format!("self-call rejected: {}", to_uri.number));
            }
            Some((from_uri.number.clone(), to_uri.number.clone()))
        }
        _ => {
            if let Some(Err(e)) = to {
                errors.push(format!("To: {}", e));
            }
            if let Some(Err(e)) = from {
                errors.push(format!("From: {}", e));
            }
            None
        }
    };

    let has_sdp = req
        .header_value("Content-Type")
        .map(|v| v.to_ascii_lowercase().contains("application/sdp"))
        .unwrap_or(false);
    if has_sdp {
        match std::str::from_utf8(&req.body) {
            Ok(body) => errors.extend(validate_sdp(body)),
            Err(_) => errors.push("SDP body is not valid UTF-8".to_string()),
        }
    }

    match numbers {
        Some((from_number, to_number)) if errors.is_empty() => Ok(InviteInfo {
            from_number,
            to_number,
        }),
        _ => Err(errors),
    }
}

pub fn validate_bye(
    req: &SipRequest,
    extensions: &RangeInclusive<u32>,
) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    check_required(req, &["To", "From", "Call-ID", "CSeq"], &mut errors);
    check_common_shapes(req, &mut errors);

    for name in ["To", "From"] {
        if let Some(value) = req.header_value(name) {
            if let Err(e) = parse_extension_uri(extract_uri(value), extensions) {
                errors.push(format!("{}: {}", name, e));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

//! SDP の書き換え。c=/o= のアドレスと m=audio のポートをリレー側に向ける。
//! 入力の他の行には手を付けない純粋関数なので、二度適用しても結果は変わらない。

/// `c=`/`o=`/`m=audio` をサーバのメディアエンドポイントに書き換える。
pub fn rewrite(sdp: &str, server_ip: &str, rtp_port: u16) -> String {
    let newline = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let mut rewritten = Vec::new();

    for line in sdp.lines() {
        if line.starts_with("c=IN IP4 ") {
            rewritten.push(format!("c=IN IP4 {}", server_ip));
            continue;
        }
        if let Some(rest) = line.strip_prefix("o=") {
            let mut tokens: Vec<&str> = rest.split_whitespace().collect();
            if tokens.len() >= 6 && tokens[3] == "IN" && tokens[4] == "IP4" {
                tokens[5] = server_ip;
                rewritten.push(format!("o={}", tokens.join(" ")));
                continue;
            }
        }
        if let Some(rest) = line.strip_prefix("m=audio ") {
            let mut parts = rest.splitn(2, ' ');
            let _old_port = parts.next();
            match parts.next() {
                Some(tail) => rewritten.push(format!("m=audio {} {}", rtp_port, tail)),
                None => rewritten.push(format!("m=audio {}", rtp_port)),
            }
            continue;
        }
        rewritten.push(line.to_string());
    }

    let mut out = rewritten.join(newline);
    if sdp.ends_with('\n') {
        out.push_str(newline);
    }
    out
}

/// 最初の `m=audio` 行からメディアポートを取り出す。
pub fn audio_port(sdp: &str) -> Option<u16> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("m=audio "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|port| port.parse().ok())
}

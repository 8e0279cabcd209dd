/// Stratum line rewriting for the miner->pool direction.
///
/// Messages are newline-terminated JSON objects. Bytes are buffered per
/// connection and only complete lines are touched; a partial object is
/// never rewritten. The only content change is `mining.authorize`
/// params[0]; everything else passes through (re-serialized when it
/// parses, verbatim when it does not).
use serde_json::Value;

/// What the framing layer hands back for one chunk of miner bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// Opaque bytes (TLS passthrough). Forward untouched.
    Raw(Vec<u8>),
    /// One complete line, terminator included.
    Line(Vec<u8>),
}

/// Per-connection NDJSON framing with TLS detection on the first
/// non-empty read. Once passthrough is chosen it is sticky for the
/// connection's lifetime.
pub struct MinerStream {
    buf: Vec<u8>,
    passthrough: bool,
    first_chunk: bool,
}

impl Default for MinerStream {
    fn default() -> Self {
        Self::new()
    }
}

impl MinerStream {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            passthrough: false,
            first_chunk: true,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Feed one read's worth of bytes, get back frames ready to forward.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        if chunk.is_empty() {
            return Vec::new();
        }
        if self.first_chunk {
            self.first_chunk = false;
            // TLS record layer: handshake (0x16), protocol version 3.x
            if chunk.len() >= 2 && chunk[0] == 0x16 && chunk[1] == 0x03 {
                self.passthrough = true;
            }
        }
        if self.passthrough {
            return vec![Frame::Raw(chunk.to_vec())];
        }

        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let rest = self.buf.split_off(pos + 1);
            let line = std::mem::replace(&mut self.buf, rest);
            frames.push(Frame::Line(line));
        }
        frames
    }

    /// Remaining bytes at EOF, if the peer closed mid-line.
    pub fn take_tail(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buf))
        }
    }
}

/// `login.worker` split on the first dot. The worker part may be empty
/// ("acct." -> "") or absent ("acct" -> None).
pub fn split_credential(cred: &str) -> (&str, Option<&str>) {
    match cred.split_once('.') {
        Some((login, worker)) => (login, Some(worker)),
        None => (cred, None),
    }
}

/// The upstream credential before uniquification: `alias.worker`, or the
/// bare alias when the miner sent no worker.
pub fn base_credential(alias: &str, worker: Option<&str>) -> String {
    match worker {
        Some(w) if !w.is_empty() => format!("{}.{}", alias, w),
        _ => alias.to_string(),
    }
}

/// Uniquified upstream credential for index `k` (1-based).
pub fn uniquified_credential(alias: &str, worker: Option<&str>, k: u32) -> String {
    let worker = worker.filter(|w| !w.is_empty());
    if k <= 1 {
        return base_credential(alias, worker);
    }
    match worker {
        Some(w) => format!("{}.{}-{}", alias, w, k),
        None => format!("{}-{}", alias, k),
    }
}

/// Result of processing one complete miner line.
pub struct LineOutcome {
    /// Bytes to place on the upstream socket.
    pub bytes: Vec<u8>,
    /// Set when the line was a mining.authorize: the worker suffix of the
    /// original credential (empty when the miner sent none).
    pub authorized_worker: Option<String>,
}

/// Rewrite one complete line. `claim` is consulted exactly once per
/// authorize to obtain the uniquification index for the desired base
/// credential; it is called before the rewritten bytes are returned.
pub fn rewrite_line(
    line: &[u8],
    alias: &str,
    claim: impl FnOnce(&str) -> u32,
) -> LineOutcome {
    let verbatim = |line: &[u8]| LineOutcome {
        bytes: line.to_vec(),
        authorized_worker: None,
    };

    let trimmed = trim_line(line);
    if trimmed.is_empty() {
        return verbatim(line);
    }
    let mut obj: Value = match serde_json::from_slice(trimmed) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => return verbatim(line),
    };

    let method = obj.get("method").and_then(|m| m.as_str()).unwrap_or("");
    if method != "mining.authorize" {
        return LineOutcome {
            bytes: serialize_line(&obj),
            authorized_worker: None,
        };
    }

    let original = match obj
        .get("params")
        .and_then(|p| p.as_array())
        .and_then(|p| p.first())
        .and_then(|v| v.as_str())
    {
        Some(s) => s.to_string(),
        None => {
            return LineOutcome {
                bytes: serialize_line(&obj),
                authorized_worker: None,
            }
        }
    };

    let (_login, worker) = split_credential(&original);
    let worker_owned = worker.unwrap_or("").to_string();

    if alias.is_empty() {
        // Nothing to substitute; still claim the original credential so
        // concurrent-session accounting and device offline tracking work.
        claim(&original);
        return LineOutcome {
            bytes: line.to_vec(),
            authorized_worker: Some(worker_owned),
        };
    }

    let base = base_credential(alias, worker);
    let k = claim(&base);
    let rewritten = uniquified_credential(alias, worker, k);

    if let Some(params) = obj.get_mut("params").and_then(|p| p.as_array_mut()) {
        params[0] = Value::String(rewritten);
    }
    LineOutcome {
        bytes: serialize_line(&obj),
        authorized_worker: Some(worker_owned),
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn serialize_line(obj: &Value) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(obj).unwrap_or_default();
    bytes.push(b'\n');
    bytes
}

/// Classification of a pool->miner line, for logging only.
#[derive(Debug, PartialEq, Eq)]
pub enum PoolDiag {
    /// Routine rejects the pool sends under normal churn.
    Benign(String),
    /// Anything else the pool flags as an error.
    Error(String),
}

const BENIGN_ERRORS: [&str; 2] = ["stale-work", "unknown-work"];

/// Inspect one pool line; bytes are forwarded verbatim regardless.
pub fn classify_pool_line(line: &[u8]) -> Option<PoolDiag> {
    let trimmed = trim_line(line);
    if trimmed.is_empty() {
        return None;
    }
    let obj: Value = serde_json::from_slice(trimmed).ok()?;
    let err = obj.get("error")?;
    if err.is_null() {
        return None;
    }
    let message = match err {
        // Classic stratum triple: [code, "message", traceback]
        Value::Array(parts) => parts
            .get(1)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        Value::Object(map) => map
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if BENIGN_ERRORS.contains(&message.as_str()) {
        Some(PoolDiag::Benign(message))
    } else {
        Some(PoolDiag::Error(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim_k(k: u32) -> impl FnOnce(&str) -> u32 {
        move |_| k
    }

    #[test]
    fn test_authorize_rewrite_first_index() {
        let line = br#"{"id":1,"method":"mining.authorize","params":["ivan_worker.rig01","x"]}
"#;
        let out = rewrite_line(line, "poolacct", claim_k(1));
        assert_eq!(
            out.bytes,
            br#"{"id":1,"method":"mining.authorize","params":["poolacct.rig01","x"]}
"#
        );
        assert_eq!(out.authorized_worker.as_deref(), Some("rig01"));
    }

    #[test]
    fn test_authorize_rewrite_second_index() {
        let line = br#"{"id":1,"method":"mining.authorize","params":["ivan_worker.rig01","x"]}
"#;
        let out = rewrite_line(line, "poolacct", claim_k(2));
        let v: Value = serde_json::from_slice(&out.bytes).unwrap();
        assert_eq!(v["params"][0], "poolacct.rig01-2");
    }

    #[test]
    fn test_authorize_without_worker() {
        let line = br#"{"id":1,"method":"mining.authorize","params":["ivan_worker","x"]}
"#;
        let out = rewrite_line(line, "poolacct", claim_k(1));
        let v: Value = serde_json::from_slice(&out.bytes).unwrap();
        assert_eq!(v["params"][0], "poolacct");
        assert_eq!(out.authorized_worker.as_deref(), Some(""));

        let out = rewrite_line(line, "poolacct", claim_k(3));
        let v: Value = serde_json::from_slice(&out.bytes).unwrap();
        assert_eq!(v["params"][0], "poolacct-3");
    }

    #[test]
    fn test_authorize_with_empty_alias_is_verbatim() {
        let line = br#"{"id":1,"method":"mining.authorize","params":["ivan_worker.rig01","x"]}
"#;
        let mut claimed = None;
        let out = rewrite_line(line, "", |base| {
            claimed = Some(base.to_string());
            1
        });
        assert_eq!(out.bytes, line.to_vec());
        assert_eq!(claimed.as_deref(), Some("ivan_worker.rig01"));
        assert_eq!(out.authorized_worker.as_deref(), Some("rig01"));
    }

    #[test]
    fn test_submit_worker_is_not_rewritten() {
        let line = br#"{"id":4,"method":"mining.submit","params":["ivan_worker.rig01","job1","nonce"]}
"#;
        let out = rewrite_line(line, "poolacct", |_| panic!("must not claim"));
        let v: Value = serde_json::from_slice(&out.bytes).unwrap();
        assert_eq!(v["params"][0], "ivan_worker.rig01");
        assert!(out.authorized_worker.is_none());
    }

    #[test]
    fn test_non_json_is_forwarded_verbatim() {
        let line = b"not json at all\n";
        let out = rewrite_line(line, "poolacct", |_| panic!("must not claim"));
        assert_eq!(out.bytes, line.to_vec());
    }

    #[test]
    fn test_reserialized_line_keeps_json_value() {
        let line = b"{\"method\": \"mining.subscribe\", \"id\": 1, \"params\": []}\r\n";
        let out = rewrite_line(line, "poolacct", |_| panic!("must not claim"));
        let before: Value = serde_json::from_slice(trim_line(line)).unwrap();
        let after: Value = serde_json::from_slice(&out.bytes).unwrap();
        assert_eq!(before, after);
        assert_eq!(*out.bytes.last().unwrap(), b'\n');
    }

    #[test]
    fn test_rewrite_matches_credential_pattern() {
        // ^alias(\.worker(-\d+)?)?$ for every k
        for k in 1..5u32 {
            let cred = uniquified_credential("acct", Some("rig"), k);
            if k == 1 {
                assert_eq!(cred, "acct.rig");
            } else {
                assert_eq!(cred, format!("acct.rig-{}", k));
            }
            let bare = uniquified_credential("acct", None, k);
            if k == 1 {
                assert_eq!(bare, "acct");
            } else {
                assert_eq!(bare, format!("acct-{}", k));
            }
        }
    }

    #[test]
    fn test_framing_buffers_partial_lines() {
        let mut stream = MinerStream::new();
        assert!(stream.feed(b"{\"id\":1,\"meth").is_empty());
        let frames = stream.feed(b"od\":\"mining.subscribe\"}\n{\"id\":2");
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Frame::Line(line) => {
                let v: Value = serde_json::from_slice(trim_line(line)).unwrap();
                assert_eq!(v["method"], "mining.subscribe");
            }
            other => panic!("expected a line, got {:?}", other),
        }
        assert_eq!(stream.take_tail(), Some(b"{\"id\":2".to_vec()));
    }

    #[test]
    fn test_framing_accepts_crlf() {
        let mut stream = MinerStream::new();
        let frames = stream.feed(b"{\"id\":1}\r\n{\"id\":2}\r\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::Line(b"{\"id\":1}\r\n".to_vec()));
    }

    #[test]
    fn test_tls_detection_is_sticky() {
        let mut stream = MinerStream::new();
        let frames = stream.feed(&[0x16, 0x03, 0x01, 0x02, 0x00]);
        assert!(stream.is_passthrough());
        assert_eq!(frames, vec![Frame::Raw(vec![0x16, 0x03, 0x01, 0x02, 0x00])]);

        // even newline-bearing data stays opaque now
        let frames = stream.feed(b"{\"id\":1}\n");
        assert_eq!(frames, vec![Frame::Raw(b"{\"id\":1}\n".to_vec())]);
    }

    #[test]
    fn test_tls_detection_only_on_first_read() {
        let mut stream = MinerStream::new();
        stream.feed(b"{\"id\":1}\n");
        let frames = stream.feed(&[0x16, 0x03, 0x01]);
        assert!(!stream.is_passthrough());
        // mid-stream binary goes into the line buffer instead
        assert!(frames.is_empty());
    }

    #[test]
    fn test_pool_diagnostics() {
        assert_eq!(classify_pool_line(b"{\"id\":1,\"result\":true,\"error\":null}\n"), None);
        assert_eq!(
            classify_pool_line(b"{\"id\":1,\"result\":null,\"error\":[21,\"stale-work\",null]}\n"),
            Some(PoolDiag::Benign("stale-work".to_string()))
        );
        assert_eq!(
            classify_pool_line(b"{\"id\":1,\"result\":null,\"error\":[20,\"unauthorized\",null]}\n"),
            Some(PoolDiag::Error("unauthorized".to_string()))
        );
        assert_eq!(
            classify_pool_line(
                b"{\"id\":1,\"error\":{\"code\":-1,\"message\":\"unknown-work\"}}\n"
            ),
            Some(PoolDiag::Benign("unknown-work".to_string()))
        );
        assert_eq!(classify_pool_line(b"mining.notify gibberish\n"), None);
    }
}

//! HTTP front for the match engine.
//!
//! Serves `GET /api` and `POST /api/match` over plain HTTP/1.1, one request
//! per connection. Every connection gets its own task and every match
//! request its own engine invocation; nothing bounds how many run at once.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::config::ServerConfig;
use crate::engine::{EngineOutput, MatchEngine, MatchRequest, SCORE_KEY};
use crate::error::{MarketError, Result};

pub const GREETING: &str = "Industrial AI Marketplace API";
pub const LEDGER_STATUS: &str = "preparing full blockchain ledger";

const MAX_LINE: usize = 8 * 1024;
const MAX_HEADERS: usize = 100;
const MAX_BODY: usize = 1024 * 1024;
/// Time a client gets to deliver the whole request.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn json(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, json!({ "error": message }))
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            404 => "Not Found",
            408 => "Request Timeout",
            413 => "Payload Too Large",
            431 => "Request Header Fields Too Large",
            501 => "Not Implemented",
            _ => "Internal Server Error",
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let body = self.body.to_string();
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.reason(),
            body.len(),
            body
        )
        .into_bytes()
    }
}

struct Request {
    method: String,
    path: String,
    body: Vec<u8>,
}

enum ReadError {
    Closed,
    Bad(Response),
    Io(std::io::Error),
}

/// Record whose digest is returned as `transactionHash`.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransactionRecord<'a> {
    buyer_id: &'a Value,
    seller_id: &'a Value,
    timestamp: String,
    score: &'a Value,
}

/// Lowercase hex SHA-256 of the JSON-encoded transaction record.
pub fn transaction_hash(
    request: &MatchRequest,
    score: &Value,
    timestamp: DateTime<Utc>,
) -> Result<String> {
    let record = TransactionRecord {
        buyer_id: request.buyer.get("id").unwrap_or(&Value::Null),
        seller_id: request.seller.get("id").unwrap_or(&Value::Null),
        timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        score,
    };
    let encoded = serde_json::to_vec(&record)?;
    Ok(format!("{:x}", Sha256::digest(&encoded)))
}

/// Add `transactionHash` and `blockchainStatus` to an engine result.
pub fn attach_receipt(
    output: &mut EngineOutput,
    request: &MatchRequest,
    timestamp: DateTime<Utc>,
) -> Result<()> {
    let score = output.get(SCORE_KEY).cloned().unwrap_or(Value::Null);
    let hash = transaction_hash(request, &score, timestamp)?;
    output.insert("transactionHash".to_string(), Value::String(hash));
    output.insert(
        "blockchainStatus".to_string(),
        Value::String(LEDGER_STATUS.to_string()),
    );
    Ok(())
}

async fn handle_match(body: &[u8], engine: &dyn MatchEngine) -> Response {
    let request: MatchRequest = match serde_json::from_slice(body) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "rejecting malformed match request");
            return Response::error(400, "Invalid JSON body");
        }
    };

    match engine.predict(&request).await {
        Ok(mut output) => match attach_receipt(&mut output, &request, Utc::now()) {
            Ok(()) => Response::json(200, Value::Object(output)),
            Err(e) => {
                tracing::error!(error = %e, "failed to build transaction record");
                Response::error(500, "Failed to parse AI result")
            }
        },
        Err(MarketError::EngineOutput { message }) => {
            tracing::error!(engine = engine.name(), %message, "unparseable engine output");
            Response::error(500, "Failed to parse AI result")
        }
        Err(e) => {
            let details = match e {
                MarketError::Engine { message } => message,
                other => other.to_string(),
            };
            tracing::error!(engine = engine.name(), %details, "match engine failed");
            Response::json(
                500,
                json!({ "error": "AI matching failed", "details": details }),
            )
        }
    }
}

pub async fn route(method: &str, path: &str, body: &[u8], engine: &dyn MatchEngine) -> Response {
    let path = path.split('?').next().unwrap_or(path);
    match (method, path) {
        ("GET", "/api") => Response::json(200, json!({ "message": GREETING })),
        ("POST", "/api/match") => handle_match(body, engine).await,
        _ => Response::error(404, "Not found"),
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::result::Result<String, ReadError> {
    let mut line = String::new();
    let n = reader
        .take(MAX_LINE as u64)
        .read_line(&mut line)
        .await
        .map_err(ReadError::Io)?;
    if n == MAX_LINE && !line.ends_with('\n') {
        return Err(ReadError::Bad(Response::error(431, "Header line too long")));
    }
    Ok(line)
}

async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::result::Result<Request, ReadError> {
    let request_line = read_line(reader).await?;
    if request_line.is_empty() {
        return Err(ReadError::Closed);
    }

    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v)) if v.starts_with("HTTP/") => (m.to_string(), p.to_string()),
        _ => return Err(ReadError::Bad(Response::error(400, "Malformed request line"))),
    };

    let mut content_length = 0usize;
    let mut chunked = false;
    let mut headers = 0;
    loop {
        let line = read_line(reader).await?;
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        headers += 1;
        if headers > MAX_HEADERS {
            return Err(ReadError::Bad(Response::error(431, "Too many headers")));
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().map_err(|_| {
                    ReadError::Bad(Response::error(400, "Invalid Content-Length"))
                })?;
            } else if name.eq_ignore_ascii_case("transfer-encoding") {
                let codings: Vec<String> = value
                    .split(',')
                    .map(|c| c.trim().to_ascii_lowercase())
                    .filter(|c| !c.is_empty())
                    .collect();
                match codings.as_slice() {
                    [] => {}
                    [only] if only == "chunked" => chunked = true,
                    _ => {
                        return Err(ReadError::Bad(Response::error(
                            501,
                            "Unsupported Transfer-Encoding",
                        )));
                    }
                }
            }
        }
    }

    // Chunked framing wins over Content-Length when both are sent.
    let body = if chunked {
        read_chunked_body(reader).await?
    } else {
        if content_length > MAX_BODY {
            return Err(ReadError::Bad(Response::error(413, "Request body too large")));
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await.map_err(ReadError::Io)?;
        body
    };

    Ok(Request { method, path, body })
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::result::Result<Vec<u8>, ReadError> {
    let mut body = Vec::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            return Err(ReadError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        let size_field = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| ReadError::Bad(Response::error(400, "Invalid chunk size")))?;

        if size == 0 {
            // Trailer section, ignored.
            loop {
                let trailer = read_line(reader).await?;
                if trailer.trim_end_matches(['\r', '\n']).is_empty() {
                    return Ok(body);
                }
            }
        }

        if size > MAX_BODY - body.len() {
            return Err(ReadError::Bad(Response::error(413, "Request body too large")));
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .map_err(ReadError::Io)?;

        let terminator = read_line(reader).await?;
        if terminator != "\r\n" && terminator != "\n" {
            return Err(ReadError::Bad(Response::error(400, "Malformed chunk")));
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    engine: Arc<dyn MatchEngine>,
    read_timeout: Duration,
) -> std::io::Result<()> {
    let started = Instant::now();
    let mut reader = BufReader::new(stream);

    let read = match tokio::time::timeout(read_timeout, read_request(&mut reader)).await {
        Ok(read) => read,
        Err(_) => Err(ReadError::Bad(Response::error(408, "Request timeout"))),
    };

    let response = match read {
        Ok(request) => {
            let response = route(&request.method, &request.path, &request.body, engine.as_ref()).await;
            tracing::info!(
                method = %request.method,
                path = %request.path,
                status = response.status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request handled"
            );
            response
        }
        Err(ReadError::Closed) => return Ok(()),
        Err(ReadError::Bad(response)) => {
            tracing::debug!(status = response.status, "bad request");
            response
        }
        Err(ReadError::Io(e)) => return Err(e),
    };

    let stream = reader.get_mut();
    stream.write_all(&response.to_bytes()).await?;
    stream.shutdown().await
}

/// Accept connections until the listener fails.
pub async fn serve(listener: TcpListener, engine: Arc<dyn MatchEngine>) -> Result<()> {
    accept_loop(listener, engine, READ_TIMEOUT).await
}

async fn accept_loop(
    listener: TcpListener,
    engine: Arc<dyn MatchEngine>,
    read_timeout: Duration,
) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, engine, read_timeout).await {
                tracing::warn!(%peer, error = %e, "connection error");
            }
        });
    }
}

/// Bind from config and serve until Ctrl-C.
pub async fn run(config: &ServerConfig, engine: Arc<dyn MatchEngine>) -> Result<()> {
    let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        engine = engine.name(),
        "match server listening"
    );

    tokio::select! {
        result = serve(listener, engine) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{HeuristicEngine, RemoteEngine};
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct FailingEngine {
        parse_error: bool,
    }

    #[async_trait]
    impl MatchEngine for FailingEngine {
        async fn predict(&self, _request: &MatchRequest) -> Result<EngineOutput> {
            if self.parse_error {
                Err(MarketError::EngineOutput {
                    message: "garbage".to_string(),
                })
            } else {
                Err(MarketError::engine("script exited with 1"))
            }
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    async fn start(engine: Arc<dyn MatchEngine>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, engine));
        format!("http://{}", addr)
    }

    fn sample_request() -> MatchRequest {
        MatchRequest {
            buyer: json!({"id": "buyer1", "industry": "Steel", "waste_type": "steel", "quantity": 1000}),
            seller: json!({"id": "seller1", "material_needed": "steel", "capabilities": ["smelting"]}),
        }
    }

    #[test]
    fn test_transaction_hash_is_stable() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let request = sample_request();
        let a = transaction_hash(&request, &json!(0.5), ts).unwrap();
        let b = transaction_hash(&request, &json!(0.5), ts).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let c = transaction_hash(&request, &json!(0.6), ts).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_transaction_hash_matches_record_encoding() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let request = sample_request();
        let record = r#"{"buyerId":"buyer1","sellerId":"seller1","timestamp":"2024-05-01T12:00:00.000Z","score":0.5}"#;
        let expected = format!("{:x}", Sha256::digest(record.as_bytes()));
        assert_eq!(transaction_hash(&request, &json!(0.5), ts).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_route_table() {
        let engine = HeuristicEngine;
        let greeting = route("GET", "/api?x=1", b"", &engine).await;
        assert_eq!(greeting.status, 200);
        assert_eq!(greeting.body["message"], GREETING);

        assert_eq!(route("GET", "/api/match", b"", &engine).await.status, 404);
        assert_eq!(route("DELETE", "/api", b"", &engine).await.status, 404);

        let bad = route("POST", "/api/match", b"{not json", &engine).await;
        assert_eq!(bad.status, 400);
    }

    #[tokio::test]
    async fn test_engine_failures_are_500() {
        let failing = FailingEngine { parse_error: false };
        let body = serde_json::to_vec(&sample_request()).unwrap();
        let response = route("POST", "/api/match", &body, &failing).await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body["error"], "AI matching failed");
        assert_eq!(response.body["details"], "script exited with 1");

        let garbled = FailingEngine { parse_error: true };
        let response = route("POST", "/api/match", &body, &garbled).await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body, json!({"error": "Failed to parse AI result"}));
    }

    #[tokio::test]
    async fn test_http_end_to_end() {
        let base = start(Arc::new(HeuristicEngine)).await;
        let client = reqwest::Client::new();

        let greeting: Value = client
            .get(format!("{}/api", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(greeting, json!({"message": GREETING}));

        let response = client
            .post(format!("{}/api/match", base))
            .json(&sample_request())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["blockchainStatus"], LEDGER_STATUS);
        assert_eq!(body["transactionHash"].as_str().unwrap().len(), 64);
        let score = body[SCORE_KEY].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&score));

        let missing = client.get(format!("{}/nowhere", base)).send().await.unwrap();
        assert_eq!(missing.status(), 404);

        let malformed = client
            .post(format!("{}/api/match", base))
            .header("Content-Type", "application/json")
            .body("{\"buyer\":")
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), 400);
    }

    async fn start_raw(engine: Arc<dyn MatchEngine>, read_timeout: Duration) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(accept_loop(listener, engine, read_timeout));
        addr
    }

    async fn exchange(addr: std::net::SocketAddr, request: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn chunked_head() -> String {
        "POST /api/match HTTP/1.1\r\nHost: test\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n"
            .to_string()
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let addr = start_raw(Arc::new(HeuristicEngine), READ_TIMEOUT).await;
        let head = format!(
            "POST /api/match HTTP/1.1\r\nHost: test\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY + 1
        );
        let response = exchange(addr, head.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 413 "), "{}", response);
        assert!(response.ends_with(r#"{"error":"Request body too large"}"#));
    }

    #[tokio::test]
    async fn test_chunked_body_accepted() {
        let addr = start_raw(Arc::new(HeuristicEngine), READ_TIMEOUT).await;
        let first = r#"{"buyer":{"id":"b"},"#;
        let second = r#""seller":{"id":"s"}}"#;
        let request = format!(
            "{}{:x};note=1\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
            chunked_head(),
            first.len(),
            first,
            second.len(),
            second
        );
        let response = exchange(addr, request.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);

        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["transactionHash"].as_str().unwrap().len(), 64);
        assert_eq!(body["blockchainStatus"], LEDGER_STATUS);
    }

    #[tokio::test]
    async fn test_chunked_framing_errors() {
        let addr = start_raw(Arc::new(HeuristicEngine), READ_TIMEOUT).await;

        let too_big = format!("{}{:x}\r\n", chunked_head(), MAX_BODY + 1);
        let response = exchange(addr, too_big.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 413 "), "{}", response);

        let bad_size = format!("{}zz\r\n", chunked_head());
        let response = exchange(addr, bad_size.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 400 "), "{}", response);

        let gzip = "POST /api/match HTTP/1.1\r\nHost: test\r\nTransfer-Encoding: gzip, chunked\r\n\r\n";
        let response = exchange(addr, gzip.as_bytes()).await;
        assert!(response.starts_with("HTTP/1.1 501 "), "{}", response);
    }

    #[tokio::test]
    async fn test_stalled_request_times_out() {
        let addr = start_raw(Arc::new(HeuristicEngine), Duration::from_millis(200)).await;
        let started = Instant::now();
        let response = exchange(
            addr,
            b"POST /api/match HTTP/1.1\r\nHost: test\r\nContent-Length: 40\r\n\r\n{\"buyer\"",
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 408 "), "{}", response);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_remote_engine_against_server() {
        let base = start(Arc::new(HeuristicEngine)).await;
        let remote = RemoteEngine::new(format!("{}/api/match", base), None).unwrap();
        let out = remote.predict(&sample_request()).await.unwrap();
        assert!(out.contains_key(SCORE_KEY));
        assert!(out.contains_key("transactionHash"));

        let failing = start(Arc::new(FailingEngine { parse_error: false })).await;
        let remote = RemoteEngine::new(format!("{}/api/match", failing), None).unwrap();
        let err = remote.predict(&sample_request()).await.unwrap_err();
        assert!(matches!(err, MarketError::Engine { .. }));
        assert!(err.to_string().contains("500"));
    }
}

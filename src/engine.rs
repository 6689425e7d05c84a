use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EngineConfig, EngineKind};
use crate::error::{MarketError, Result};
use crate::scoring::{quality_label, token_similarity};

/// Body of `POST /api/match`. Both sides are free-form objects; engines pick
/// out the fields they understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRequest {
    #[serde(default)]
    pub buyer: Value,
    #[serde(default)]
    pub seller: Value,
}

pub type EngineOutput = Map<String, Value>;

/// Key every engine result is expected to carry.
pub const SCORE_KEY: &str = "revolutionary_score";

// --- Engine trait ---

#[async_trait]
pub trait MatchEngine: Send + Sync {
    async fn predict(&self, request: &MatchRequest) -> Result<EngineOutput>;
    fn name(&self) -> &str;
}

pub fn create_engine(config: &EngineConfig) -> Result<Arc<dyn MatchEngine>> {
    let timeout = config.timeout_secs.map(Duration::from_secs);
    match config.kind {
        EngineKind::Script => Ok(Arc::new(ScriptEngine::new(
            config.program.clone(),
            config.script.clone(),
            timeout,
        ))),
        EngineKind::Remote => {
            let url = config.url.clone().ok_or_else(|| MarketError::Config {
                message: "engine.url is required for the remote engine".to_string(),
            })?;
            Ok(Arc::new(RemoteEngine::new(url, timeout)?))
        }
        EngineKind::Heuristic => Ok(Arc::new(HeuristicEngine)),
    }
}

fn into_object(value: Value) -> Result<EngineOutput> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(MarketError::EngineOutput {
            message: format!("expected a JSON object, got {}", other),
        }),
    }
}

// --- Script engine (shells out, one process per request) ---

#[derive(Debug)]
pub struct ScriptEngine {
    program: String,
    script: Option<String>,
    timeout: Option<Duration>,
}

impl ScriptEngine {
    pub fn new(program: String, script: Option<String>, timeout: Option<Duration>) -> Self {
        Self {
            program,
            script,
            timeout,
        }
    }
}

#[async_trait]
impl MatchEngine for ScriptEngine {
    async fn predict(&self, request: &MatchRequest) -> Result<EngineOutput> {
        let payload = serde_json::to_string(request)?;

        let mut command = tokio::process::Command::new(&self.program);
        if let Some(script) = &self.script {
            command.arg(script);
        }
        command
            .arg(&payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(program = %self.program, script = ?self.script, "spawning match script");

        let child = command.output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child).await.map_err(|_| {
                MarketError::engine(format!("match script timed out after {:?}", limit))
            })?,
            None => child.await,
        }
        .map_err(|e| MarketError::engine(format!("failed to run '{}': {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MarketError::engine(format!(
                "match script exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8(output.stdout).map_err(|e| MarketError::EngineOutput {
            message: format!("invalid UTF-8 in script output: {}", e),
        })?;

        let first_line = stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| MarketError::EngineOutput {
                message: "empty response from match script".to_string(),
            })?;

        let value: Value =
            serde_json::from_str(first_line.trim()).map_err(|e| MarketError::EngineOutput {
                message: e.to_string(),
            })?;
        into_object(value)
    }

    fn name(&self) -> &str {
        "script"
    }
}

// --- Remote engine (another /api/match endpoint) ---

#[derive(Debug)]
pub struct RemoteEngine {
    url: String,
    client: reqwest::Client,
}

impl RemoteEngine {
    pub fn new(url: String, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(limit) = timeout {
            builder = builder.timeout(limit);
        }
        let client = builder.build()?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl MatchEngine for RemoteEngine {
    async fn predict(&self, request: &MatchRequest) -> Result<EngineOutput> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| MarketError::engine(format!("request to {} failed: {}", self.url, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(MarketError::engine(format!(
                "match endpoint returned {}: {}",
                status, error_text
            )));
        }

        let value: Value = response.json().await.map_err(|e| MarketError::EngineOutput {
            message: e.to_string(),
        })?;
        into_object(value)
    }

    fn name(&self) -> &str {
        "remote"
    }
}

// --- Built-in heuristic engine ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Buyer {
    industry: Option<String>,
    waste_type: Option<String>,
    quantity: Option<f64>,
    distance_to_seller: Option<f64>,
    carbon_footprint: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Seller {
    material_needed: Option<String>,
    capabilities: Vec<String>,
    carbon_footprint: Option<f64>,
}

const DEFAULT_DISTANCE_KM: f64 = 50.0;
const DEFAULT_QUANTITY: f64 = 1000.0;
const MAX_DISTANCE_KM: f64 = 500.0;

/// kg CO2 avoided per kg of diverted material.
fn emission_factor(waste_type: &str) -> f64 {
    match waste_type.trim().to_lowercase().as_str() {
        "cement" => 0.95,
        "steel" => 1.85,
        "plastic" => 3.5,
        "textiles" => 2.1,
        "chemicals" => 1.7,
        "metals" => 1.9,
        _ => 1.0,
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

/// In-process engine: token overlap stands in for semantic similarity,
/// combined with distance, material and carbon terms.
#[derive(Debug, Default)]
pub struct HeuristicEngine;

impl HeuristicEngine {
    pub fn score(&self, request: &MatchRequest) -> Result<EngineOutput> {
        let buyer: Buyer = parse_side(&request.buyer, "buyer")?;
        let seller: Seller = parse_side(&request.seller, "seller")?;

        let waste_type = buyer.waste_type.as_deref().unwrap_or("");
        let buyer_text = format!("{} {}", buyer.industry.as_deref().unwrap_or(""), waste_type);
        let seller_text = format!(
            "{} {}",
            seller.material_needed.as_deref().unwrap_or(""),
            seller.capabilities.join(" ")
        );
        let semantic = token_similarity(&buyer_text, &seller_text);

        let distance = buyer.distance_to_seller.unwrap_or(DEFAULT_DISTANCE_KM).max(0.0);
        let distance_score = (1.0 - distance / MAX_DISTANCE_KM).max(0.0);
        let material_score = match seller.material_needed.as_deref() {
            Some(needed)
                if !waste_type.trim().is_empty()
                    && needed.trim().eq_ignore_ascii_case(waste_type.trim()) =>
            {
                1.0
            }
            _ => 0.0,
        };
        let carbon = buyer.carbon_footprint.unwrap_or(0.0) + seller.carbon_footprint.unwrap_or(0.0);
        let carbon_score = (carbon / 10_000.0).clamp(0.0, 1.0);
        let sustainability = 0.4 * distance_score + 0.4 * material_score + 0.2 * carbon_score;

        let composite = 0.7 * semantic + 0.3 * sustainability;
        let quantity = buyer.quantity.unwrap_or(DEFAULT_QUANTITY).max(0.0);
        let co2_saved_kg = emission_factor(waste_type) * distance * (quantity / 1000.0);

        let mut out = EngineOutput::new();
        out.insert("semantic_score".to_string(), json!(round3(semantic)));
        out.insert("sustainability_score".to_string(), json!(round3(sustainability)));
        out.insert(SCORE_KEY.to_string(), json!(round3(composite)));
        out.insert("match_quality".to_string(), json!(quality_label(composite)));
        out.insert("co2_saved_kg".to_string(), json!(round3(co2_saved_kg)));
        Ok(out)
    }
}

fn parse_side<T: serde::de::DeserializeOwned + Default>(value: &Value, side: &str) -> Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone())
        .map_err(|e| MarketError::engine(format!("invalid {}: {}", side, e)))
}

#[async_trait]
impl MatchEngine for HeuristicEngine {
    async fn predict(&self, request: &MatchRequest) -> Result<EngineOutput> {
        self.score(request)
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

use serde_json::{Value, json};

use crate::db::Database;
use crate::engine::{EngineOutput, MatchEngine, MatchRequest, SCORE_KEY};
use crate::error::{MarketError, Result};
use crate::models::{AiRecommendation, Company, CompanyProfile, NewRecommendation};

const DEFAULT_QUANTITY: f64 = 1000.0;

/// Buyer/seller pair for a company's own profile: it offers what it lists as
/// materials of interest and asks the engine who would take them.
pub fn build_request(company: &Company, profile: &CompanyProfile) -> MatchRequest {
    let interests = profile.materials_of_interest.clone().unwrap_or_default();
    MatchRequest {
        buyer: json!({
            "id": company.id,
            "industry": profile.organization_type.map(|t| t.as_str()),
            "waste_type": interests,
            "quantity": DEFAULT_QUANTITY,
            "location": profile.location,
        }),
        seller: json!({
            "material_needed": interests,
            "capabilities": Vec::<String>::new(),
            "location": profile.location,
        }),
    }
}

pub fn recommendation_from(company_id: i64, output: &EngineOutput) -> NewRecommendation {
    let score = output.get(SCORE_KEY).and_then(Value::as_f64).unwrap_or(0.0);
    let quality = output
        .get("match_quality")
        .and_then(Value::as_str)
        .unwrap_or("Unrated");
    let token = format!("rec_{}", chrono::Utc::now().timestamp_millis());

    NewRecommendation {
        company_id,
        kind: "match".to_string(),
        title: "Industrial Symbiosis Match".to_string(),
        description: format!("Found {} match for your materials", quality),
        confidence: (score * 100.0).clamp(0.0, 100.0),
        action_url: Some(format!("/match/{}", token)),
    }
}

/// Ask the engine for a match on the company's profile and store the result.
/// Engine failures are logged and produce no recommendation.
pub async fn generate(
    db: &Database,
    engine: &dyn MatchEngine,
    company_id: i64,
) -> Result<Vec<AiRecommendation>> {
    let company = db.get_company(company_id)?.ok_or(MarketError::NotFound {
        entity: "Company",
        id: company_id,
    })?;
    let profile = db.get_profile(company_id)?.unwrap_or(CompanyProfile {
        company_id,
        ..Default::default()
    });

    let request = build_request(&company, &profile);
    let output = match engine.predict(&request).await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!(company_id, engine = engine.name(), error = %e, "recommendation failed");
            return Ok(Vec::new());
        }
    };

    let rec = recommendation_from(company_id, &output);
    let id = db.insert_recommendation(&rec)?;
    tracing::info!(company_id, recommendation_id = id, confidence = rec.confidence, "stored recommendation");

    Ok(db.get_recommendation(id)?.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::HeuristicEngine;
    use crate::models::OrganizationType;
    use async_trait::async_trait;

    struct DownEngine;

    #[async_trait]
    impl MatchEngine for DownEngine {
        async fn predict(&self, _request: &MatchRequest) -> Result<EngineOutput> {
            Err(MarketError::engine("connection refused"))
        }

        fn name(&self) -> &str {
            "down"
        }
    }

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        let id = db.create_company("Gulf Steel", "ops@gulfsteel.ae").unwrap();
        db.upsert_profile(&CompanyProfile {
            company_id: id,
            location: Some("Dubai".to_string()),
            organization_type: Some(OrganizationType::Manufacturing),
            materials_of_interest: Some("steel".to_string()),
            ..Default::default()
        })
        .unwrap();
        (db, id)
    }

    #[test]
    fn test_build_request_uses_profile() {
        let (db, id) = setup();
        let company = db.get_company(id).unwrap().unwrap();
        let profile = db.get_profile(id).unwrap().unwrap();
        let request = build_request(&company, &profile);
        assert_eq!(request.buyer["id"], json!(id));
        assert_eq!(request.buyer["industry"], "manufacturing");
        assert_eq!(request.buyer["waste_type"], "steel");
        assert_eq!(request.seller["material_needed"], "steel");
        assert_eq!(request.seller["location"], "Dubai");
    }

    #[test]
    fn test_recommendation_from_output() {
        let mut output = EngineOutput::new();
        output.insert(SCORE_KEY.to_string(), json!(0.64));
        output.insert("match_quality".to_string(), json!("High Value"));
        let rec = recommendation_from(7, &output);
        assert_eq!(rec.description, "Found High Value match for your materials");
        assert!((rec.confidence - 64.0).abs() < 1e-9);
        assert!(rec.action_url.unwrap().starts_with("/match/rec_"));

        let empty = recommendation_from(7, &EngineOutput::new());
        assert_eq!(empty.confidence, 0.0);
        assert!(empty.description.contains("Unrated"));
    }

    #[tokio::test]
    async fn test_generate_stores_recommendation() {
        let (db, id) = setup();
        let recs = generate(&db, &HeuristicEngine, id).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].kind, "match");
        assert_eq!(recs[0].status, "pending");
        assert_eq!(recs[0].company_id, id);
        assert_eq!(db.list_recommendations(id).unwrap().len(), 1);

        // A second run returns only the new row.
        let again = generate(&db, &HeuristicEngine, id).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].id, recs[0].id);
        assert_eq!(db.list_recommendations(id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_generate_swallows_engine_failure() {
        let (db, id) = setup();
        let recs = generate(&db, &DownEngine, id).await.unwrap();
        assert!(recs.is_empty());
        assert!(db.list_recommendations(id).unwrap().is_empty());

        assert!(generate(&db, &DownEngine, 999).await.is_err());
    }
}

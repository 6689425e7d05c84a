use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{MarketError, Result};
use crate::models::{
    AiRecommendation, Company, CompanyProfile, Match, MatchDecision, MatchDetails, MatchStatus,
    Material, MaterialKind, NewMaterial, NewRecommendation, Role,
};
use crate::scoring;

pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

const MATERIAL_COLUMNS: &str = "m.id, m.company_id, c.name, m.material_name, m.quantity, m.unit,
     m.type, m.description, m.created_at
     FROM materials m
     LEFT JOIN companies c ON m.company_id = c.id";

const RECOMMENDATION_COLUMNS: &str =
    "id, company_id, type, title, description, confidence, action_url, status, created_at
     FROM ai_recommendations";

/// `%term%` for a LIKE ... ESCAPE '\' clause, with wildcards in `term` taken literally.
/// Blank terms give no pattern.
fn like_pattern(term: &str) -> Option<String> {
    let term = term.trim();
    if term.is_empty() {
        return None;
    }
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    Some(format!("%{}%", escaped))
}

const MATCH_COLUMNS: &str = "x.id, x.waste_id, x.consumer_id, x.score, x.details, x.status,
     x.created_at, w.material_name, s.name, c.name
     FROM matches x
     JOIN materials w ON x.waste_id = w.id
     LEFT JOIN companies s ON w.company_id = s.id
     LEFT JOIN companies c ON x.consumer_id = c.id";

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::configure(&conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self { conn, path: None })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                role TEXT NOT NULL DEFAULT 'user' CHECK (role IN ('user', 'admin')),
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS company_profiles (
                company_id INTEGER PRIMARY KEY REFERENCES companies(id) ON DELETE CASCADE,
                role TEXT,
                location TEXT,
                organization_type TEXT,
                materials_of_interest TEXT,
                sustainability_goals TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS materials (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                material_name TEXT NOT NULL,
                quantity REAL NOT NULL CHECK (quantity >= 0),
                unit TEXT NOT NULL,
                type TEXT NOT NULL CHECK (type IN ('waste', 'requirement')),
                description TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS matches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                waste_id INTEGER NOT NULL REFERENCES materials(id) ON DELETE CASCADE,
                consumer_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                score REAL NOT NULL CHECK (score >= 0 AND score <= 1),
                details TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'accepted', 'rejected')),
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (waste_id, consumer_id)
            );

            CREATE TABLE IF NOT EXISTS ai_recommendations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                type TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL,
                confidence REAL NOT NULL,
                action_url TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_materials_company ON materials(company_id);
            CREATE INDEX IF NOT EXISTS idx_materials_type ON materials(type);
            CREATE INDEX IF NOT EXISTS idx_matches_consumer ON matches(consumer_id);
            CREATE INDEX IF NOT EXISTS idx_recommendations_company ON ai_recommendations(company_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='matches'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(MarketError::invalid(
                "database not initialized. Run 'symbiosis init' first.",
            ));
        }
        Ok(())
    }

    // --- Company operations ---

    pub fn create_company(&self, name: &str, email: &str) -> Result<i64> {
        let name = name.trim();
        let email = email.trim();
        if name.is_empty() {
            return Err(MarketError::invalid("company name must not be empty"));
        }
        if !email.contains('@') {
            return Err(MarketError::invalid(format!("'{}' is not an email address", email)));
        }
        self.conn.execute(
            "INSERT INTO companies (name, email) VALUES (?1, ?2)",
            [name, email],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_company(&self, id: i64) -> Result<Option<Company>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, email, role, created_at FROM companies WHERE id = ?1",
                [id],
                Self::row_to_company,
            )
            .optional()?)
    }

    fn require_company(&self, id: i64) -> Result<Company> {
        self.get_company(id)?.ok_or(MarketError::NotFound {
            entity: "Company",
            id,
        })
    }

    /// `search` matches name, organization type or materials of interest, case-insensitively.
    pub fn list_companies(&self, search: Option<&str>) -> Result<Vec<Company>> {
        let mut sql = "SELECT c.id, c.name, c.email, c.role, c.created_at
             FROM companies c
             LEFT JOIN company_profiles p ON p.company_id = c.id
             WHERE 1=1"
            .to_string();
        let mut values: Vec<Value> = vec![];

        if let Some(pattern) = search.and_then(like_pattern) {
            sql.push_str(
                " AND (c.name LIKE ?1 ESCAPE '\\'
                   OR p.organization_type LIKE ?1 ESCAPE '\\'
                   OR p.materials_of_interest LIKE ?1 ESCAPE '\\')",
            );
            values.push(Value::Text(pattern));
        }

        sql.push_str(" ORDER BY c.created_at DESC, c.id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::row_to_company)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Flip `user` <-> `admin` and return the new role.
    pub fn toggle_company_role(&self, id: i64) -> Result<Role> {
        let company = self.require_company(id)?;
        let role = company.role.toggled();
        self.conn.execute(
            "UPDATE companies SET role = ?1 WHERE id = ?2",
            params![role, id],
        )?;
        tracing::info!(company_id = id, from = %company.role, to = %role, "toggled company role");
        Ok(role)
    }

    /// Unknown companies are simply not admins.
    pub fn is_admin(&self, id: i64) -> Result<bool> {
        Ok(self
            .get_company(id)?
            .is_some_and(|company| company.role == Role::Admin))
    }

    fn row_to_company(row: &rusqlite::Row) -> rusqlite::Result<Company> {
        Ok(Company {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            role: row.get(3)?,
            created_at: row.get(4)?,
        })
    }

    // --- Profile operations ---

    pub fn upsert_profile(&self, profile: &CompanyProfile) -> Result<()> {
        self.require_company(profile.company_id)?;
        self.conn.execute(
            "INSERT INTO company_profiles
                 (company_id, role, location, organization_type, materials_of_interest, sustainability_goals)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(company_id) DO UPDATE SET
                 role = excluded.role,
                 location = excluded.location,
                 organization_type = excluded.organization_type,
                 materials_of_interest = excluded.materials_of_interest,
                 sustainability_goals = excluded.sustainability_goals,
                 updated_at = datetime('now')",
            params![
                profile.company_id,
                profile.role,
                profile.location,
                profile.organization_type,
                profile.materials_of_interest,
                profile.sustainability_goals,
            ],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, company_id: i64) -> Result<Option<CompanyProfile>> {
        Ok(self
            .conn
            .query_row(
                "SELECT company_id, role, location, organization_type, materials_of_interest,
                        sustainability_goals
                 FROM company_profiles WHERE company_id = ?1",
                [company_id],
                |row| {
                    let org: Option<String> = row.get(3)?;
                    Ok(CompanyProfile {
                        company_id: row.get(0)?,
                        role: row.get(1)?,
                        location: row.get(2)?,
                        // Unknown labels count as absent.
                        organization_type: org.and_then(|o| o.parse().ok()),
                        materials_of_interest: row.get(4)?,
                        sustainability_goals: row.get(5)?,
                    })
                },
            )
            .optional()?)
    }

    // --- Material operations ---

    pub fn add_material(&self, material: &NewMaterial) -> Result<i64> {
        if material.material_name.trim().is_empty() {
            return Err(MarketError::invalid("material name must not be empty"));
        }
        if !material.quantity.is_finite() || material.quantity < 0.0 {
            return Err(MarketError::invalid(format!(
                "quantity must be a non-negative number, got {}",
                material.quantity
            )));
        }
        self.require_company(material.company_id)?;

        self.conn.execute(
            "INSERT INTO materials (company_id, material_name, quantity, unit, type, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                material.company_id,
                material.material_name.trim(),
                material.quantity,
                material.unit.trim(),
                material.kind,
                material.description,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_material(&self, id: i64) -> Result<Option<Material>> {
        let sql = format!("SELECT {} WHERE m.id = ?1", MATERIAL_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [id], Self::row_to_material)
            .optional()?)
    }

    pub fn list_materials(
        &self,
        company_id: Option<i64>,
        kind: Option<MaterialKind>,
        search: Option<&str>,
    ) -> Result<Vec<Material>> {
        let mut sql = format!("SELECT {} WHERE 1=1", MATERIAL_COLUMNS);
        let mut values: Vec<Value> = vec![];

        if let Some(id) = company_id {
            sql.push_str(&format!(" AND m.company_id = ?{}", values.len() + 1));
            values.push(Value::Integer(id));
        }

        if let Some(k) = kind {
            sql.push_str(&format!(" AND m.type = ?{}", values.len() + 1));
            values.push(Value::Text(k.as_str().to_string()));
        }

        if let Some(pattern) = search.and_then(like_pattern) {
            let n = values.len() + 1;
            sql.push_str(&format!(
                " AND (m.material_name LIKE ?{n} ESCAPE '\\'
                   OR m.description LIKE ?{n} ESCAPE '\\'
                   OR c.name LIKE ?{n} ESCAPE '\\')"
            ));
            values.push(Value::Text(pattern));
        }

        sql.push_str(" ORDER BY m.created_at DESC, m.id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::row_to_material)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Returns false when there was nothing to delete. Matches on the material go with it.
    pub fn delete_material(&self, id: i64) -> Result<bool> {
        let changed = self.conn.execute("DELETE FROM materials WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    fn row_to_material(row: &rusqlite::Row) -> rusqlite::Result<Material> {
        Ok(Material {
            id: row.get(0)?,
            company_id: row.get(1)?,
            company_name: row.get(2)?,
            material_name: row.get(3)?,
            quantity: row.get(4)?,
            unit: row.get(5)?,
            kind: row.get(6)?,
            description: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    // --- Match operations ---

    pub fn insert_match(
        &self,
        waste_id: i64,
        consumer_id: i64,
        score: f64,
        details: &MatchDetails,
    ) -> Result<i64> {
        if !(0.0..=1.0).contains(&score) {
            return Err(MarketError::invalid(format!(
                "match score must be within 0..=1, got {}",
                score
            )));
        }
        if self.get_material(waste_id)?.is_none() {
            return Err(MarketError::NotFound {
                entity: "Material",
                id: waste_id,
            });
        }
        self.require_company(consumer_id)?;

        let details = serde_json::to_string(details)?;
        self.conn.execute(
            "INSERT INTO matches (waste_id, consumer_id, score, details) VALUES (?1, ?2, ?3, ?4)",
            params![waste_id, consumer_id, score, details],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_match(&self, id: i64) -> Result<Option<Match>> {
        let sql = format!("SELECT {} WHERE x.id = ?1", MATCH_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], Self::row_to_match).optional()?)
    }

    /// Matches where the company supplies the waste or is the consumer, newest first.
    pub fn list_matches_for_company(&self, company_id: i64) -> Result<Vec<Match>> {
        let sql = format!(
            "SELECT {} WHERE w.company_id = ?1 OR x.consumer_id = ?1
             ORDER BY x.created_at DESC, x.id DESC",
            MATCH_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([company_id], Self::row_to_match)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Decide a pending match. Decided matches stay decided.
    pub fn update_match_status(&self, id: i64, decision: MatchDecision) -> Result<Match> {
        let target = decision.target();
        let changed = self.conn.execute(
            "UPDATE matches SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![target, id, MatchStatus::Pending],
        )?;

        let current = self
            .get_match(id)?
            .ok_or(MarketError::NotFound { entity: "Match", id })?;

        if changed == 0 {
            return Err(MarketError::InvalidTransition {
                id,
                status: current.status.to_string(),
            });
        }

        tracing::info!(match_id = id, status = %target, "match decided");
        Ok(current)
    }

    fn match_exists(&self, waste_id: i64, consumer_id: i64) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM matches WHERE waste_id = ?1 AND consumer_id = ?2",
            [waste_id, consumer_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Score a waste listing against other companies' requirements and record
    /// a pending match for every consumer whose best requirement clears `min_score`.
    pub fn find_material_matches(&self, waste_id: i64, min_score: f64) -> Result<Vec<Match>> {
        let waste = self.get_material(waste_id)?.ok_or(MarketError::NotFound {
            entity: "Material",
            id: waste_id,
        })?;
        if waste.kind != MaterialKind::Waste {
            return Err(MarketError::invalid(format!(
                "material #{} is a requirement, not a waste listing",
                waste_id
            )));
        }

        let requirements = self.list_materials(None, Some(MaterialKind::Requirement), None)?;

        // Best candidate per consuming company.
        let mut best: HashMap<i64, (f64, MatchDetails)> = HashMap::new();
        for requirement in requirements
            .iter()
            .filter(|r| r.company_id != waste.company_id)
        {
            let score = scoring::material_score(&waste, requirement) / 100.0;
            if score < min_score {
                continue;
            }
            let replace = best
                .get(&requirement.company_id)
                .is_none_or(|(existing, _)| score > *existing);
            if replace {
                best.insert(
                    requirement.company_id,
                    (score, scoring::match_details(&waste, requirement)),
                );
            }
        }

        let mut created = Vec::new();
        for (consumer_id, (score, details)) in best {
            if self.match_exists(waste_id, consumer_id)? {
                tracing::debug!(waste_id, consumer_id, "match already recorded, skipping");
                continue;
            }
            let id = self.insert_match(waste_id, consumer_id, score, &details)?;
            if let Some(m) = self.get_match(id)? {
                created.push(m);
            }
        }

        created.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.consumer_id.cmp(&b.consumer_id))
        });
        tracing::info!(waste_id, created = created.len(), "material matching finished");
        Ok(created)
    }

    fn row_to_match(row: &rusqlite::Row) -> rusqlite::Result<Match> {
        let details: String = row.get(4)?;
        let details: MatchDetails = serde_json::from_str(&details)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
        Ok(Match {
            id: row.get(0)?,
            waste_id: row.get(1)?,
            consumer_id: row.get(2)?,
            score: row.get(3)?,
            details,
            status: row.get(5)?,
            created_at: row.get(6)?,
            material_name: row.get(7)?,
            supplier_name: row.get(8)?,
            consumer_name: row.get(9)?,
        })
    }

    // --- Recommendation operations ---

    pub fn insert_recommendation(&self, rec: &NewRecommendation) -> Result<i64> {
        self.require_company(rec.company_id)?;
        self.conn.execute(
            "INSERT INTO ai_recommendations (company_id, type, title, description, confidence, action_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.company_id,
                rec.kind,
                rec.title,
                rec.description,
                rec.confidence,
                rec.action_url,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_recommendation(&self, id: i64) -> Result<Option<AiRecommendation>> {
        let sql = format!("SELECT {} WHERE id = ?1", RECOMMENDATION_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, [id], Self::row_to_recommendation)
            .optional()?)
    }

    pub fn list_recommendations(&self, company_id: i64) -> Result<Vec<AiRecommendation>> {
        let sql = format!(
            "SELECT {} WHERE company_id = ?1 ORDER BY created_at DESC, id DESC",
            RECOMMENDATION_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([company_id], Self::row_to_recommendation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn row_to_recommendation(row: &rusqlite::Row) -> rusqlite::Result<AiRecommendation> {
        Ok(AiRecommendation {
            id: row.get(0)?,
            company_id: row.get(1)?,
            kind: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            confidence: row.get(5)?,
            action_url: row.get(6)?,
            status: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrganizationType;

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    fn material(db: &Database, company_id: i64, name: &str, qty: f64, kind: MaterialKind) -> i64 {
        db.add_material(&NewMaterial {
            company_id,
            material_name: name.to_string(),
            quantity: qty,
            unit: "tons".to_string(),
            kind,
            description: None,
        })
        .unwrap()
    }

    #[test]
    fn test_ensure_initialized() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.ensure_initialized().is_err());
        db.init().unwrap();
        db.init().unwrap();
        assert!(db.ensure_initialized().is_ok());
    }

    #[test]
    fn test_open_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("market.db");
        {
            let db = Database::open(&path).unwrap();
            db.init().unwrap();
            db.create_company("Gulf Steel", "ops@gulfsteel.ae").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        db.ensure_initialized().unwrap();
        assert_eq!(db.list_companies(None).unwrap().len(), 1);
    }

    #[test]
    fn test_company_validation() {
        let db = setup();
        assert!(db.create_company("  ", "a@b.c").is_err());
        assert!(db.create_company("Acme", "not-an-email").is_err());
        db.create_company("Acme", "a@acme.com").unwrap();
        assert!(db.create_company("Acme Again", "a@acme.com").is_err());
    }

    #[test]
    fn test_toggle_role_twice_restores() {
        let db = setup();
        let id = db.create_company("Acme", "a@acme.com").unwrap();
        assert_eq!(db.get_company(id).unwrap().unwrap().role, Role::User);
        assert!(!db.is_admin(id).unwrap());

        assert_eq!(db.toggle_company_role(id).unwrap(), Role::Admin);
        assert!(db.is_admin(id).unwrap());
        assert_eq!(db.toggle_company_role(id).unwrap(), Role::User);
        assert_eq!(db.get_company(id).unwrap().unwrap().role, Role::User);

        assert!(matches!(
            db.toggle_company_role(999),
            Err(MarketError::NotFound { .. })
        ));
        assert!(!db.is_admin(999).unwrap());
    }

    #[test]
    fn test_profile_upsert() {
        let db = setup();
        let id = db.create_company("Acme", "a@acme.com").unwrap();
        assert!(db.get_profile(id).unwrap().is_none());

        let mut profile = CompanyProfile {
            company_id: id,
            location: Some("Dubai".to_string()),
            organization_type: Some(OrganizationType::Recycling),
            materials_of_interest: Some("plastic, glass".to_string()),
            ..Default::default()
        };
        db.upsert_profile(&profile).unwrap();
        profile.location = Some("Sharjah".to_string());
        db.upsert_profile(&profile).unwrap();

        let stored = db.get_profile(id).unwrap().unwrap();
        assert_eq!(stored.location.as_deref(), Some("Sharjah"));
        assert_eq!(stored.organization_type, Some(OrganizationType::Recycling));

        profile.company_id = 42;
        assert!(db.upsert_profile(&profile).is_err());
    }

    #[test]
    fn test_unknown_org_type_reads_as_none() {
        let db = setup();
        let id = db.create_company("Acme", "a@acme.com").unwrap();
        db.conn
            .execute(
                "INSERT INTO company_profiles (company_id, organization_type) VALUES (?1, 'alchemy')",
                [id],
            )
            .unwrap();
        assert_eq!(db.get_profile(id).unwrap().unwrap().organization_type, None);
    }

    #[test]
    fn test_material_crud_and_filters() {
        let db = setup();
        let a = db.create_company("Acme", "a@acme.com").unwrap();
        let b = db.create_company("Beta", "b@beta.com").unwrap();
        let w = material(&db, a, "Steel scrap", 10.0, MaterialKind::Waste);
        material(&db, b, "Steel", 5.0, MaterialKind::Requirement);

        assert_eq!(db.list_materials(None, None, None).unwrap().len(), 2);
        assert_eq!(db.list_materials(Some(a), None, None).unwrap().len(), 1);
        assert_eq!(
            db.list_materials(Some(a), Some(MaterialKind::Requirement), None).unwrap().len(),
            0
        );

        let stored = db.get_material(w).unwrap().unwrap();
        assert_eq!(stored.company_name.as_deref(), Some("Acme"));
        assert_eq!(stored.kind, MaterialKind::Waste);

        assert!(db.delete_material(w).unwrap());
        assert!(!db.delete_material(w).unwrap());
    }

    #[test]
    fn test_material_search() {
        let db = setup();
        let a = db.create_company("Acme Foundry", "a@acme.com").unwrap();
        let b = db.create_company("Beta Cement", "b@beta.com").unwrap();
        material(&db, a, "Steel scrap", 10.0, MaterialKind::Waste);
        db.add_material(&NewMaterial {
            company_id: b,
            material_name: "Fly ash".to_string(),
            quantity: 40.0,
            unit: "tons".to_string(),
            kind: MaterialKind::Requirement,
            description: Some("Clinker substitute, 50% blend".to_string()),
        })
        .unwrap();

        let names = |search: &str, kind: Option<MaterialKind>| -> Vec<String> {
            db.list_materials(None, kind, Some(search))
                .unwrap()
                .into_iter()
                .map(|m| m.material_name)
                .collect()
        };

        assert_eq!(names("STEEL", None), vec!["Steel scrap"]);
        assert_eq!(names("clinker", None), vec!["Fly ash"]);
        assert_eq!(names("foundry", None), vec!["Steel scrap"]);
        assert_eq!(names("ash", Some(MaterialKind::Waste)), Vec::<String>::new());
        // Wildcards are literal.
        assert_eq!(names("50%", None), vec!["Fly ash"]);
        assert_eq!(names("%", None), vec!["Fly ash"]);
        assert!(names("_", None).is_empty());
        assert_eq!(names("   ", None).len(), 2);
    }

    #[test]
    fn test_company_search() {
        let db = setup();
        let a = db.create_company("Acme Foundry", "a@acme.com").unwrap();
        let b = db.create_company("Beta Labs", "b@beta.com").unwrap();
        db.upsert_profile(&CompanyProfile {
            company_id: b,
            organization_type: Some(OrganizationType::WasteManagement),
            materials_of_interest: Some("glass, PET".to_string()),
            ..Default::default()
        })
        .unwrap();

        let ids = |search: &str| -> Vec<i64> {
            db.list_companies(Some(search)).unwrap().into_iter().map(|c| c.id).collect()
        };

        assert_eq!(ids("acme"), vec![a]);
        assert_eq!(ids("waste_man"), vec![b]);
        assert_eq!(ids("pet"), vec![b]);
        assert!(ids("copper").is_empty());
        assert_eq!(db.list_companies(None).unwrap().len(), 2);
    }

    #[test]
    fn test_material_validation() {
        let db = setup();
        let a = db.create_company("Acme", "a@acme.com").unwrap();
        let mut new = NewMaterial {
            company_id: a,
            material_name: "Slag".to_string(),
            quantity: -1.0,
            unit: "tons".to_string(),
            kind: MaterialKind::Waste,
            description: None,
        };
        assert!(db.add_material(&new).is_err());
        new.quantity = f64::NAN;
        assert!(db.add_material(&new).is_err());
        new.quantity = 0.0;
        new.company_id = 77;
        assert!(matches!(
            db.add_material(&new),
            Err(MarketError::NotFound { entity: "Company", .. })
        ));
    }

    #[test]
    fn test_insert_match_requires_references() {
        let db = setup();
        let a = db.create_company("Acme", "a@acme.com").unwrap();
        let w = material(&db, a, "Slag", 10.0, MaterialKind::Waste);
        let details = MatchDetails::default();

        assert!(matches!(
            db.insert_match(999, a, 0.5, &details),
            Err(MarketError::NotFound { entity: "Material", .. })
        ));
        assert!(matches!(
            db.insert_match(w, 999, 0.5, &details),
            Err(MarketError::NotFound { entity: "Company", .. })
        ));
        assert!(db.insert_match(w, a, 1.5, &details).is_err());
        assert!(db.insert_match(w, a, 0.5, &details).is_ok());
    }

    #[test]
    fn test_list_matches_for_both_sides() {
        let db = setup();
        let supplier = db.create_company("Supplier", "s@x.com").unwrap();
        let consumer = db.create_company("Consumer", "c@x.com").unwrap();
        let other = db.create_company("Other", "o@x.com").unwrap();
        let w1 = material(&db, supplier, "Slag", 10.0, MaterialKind::Waste);
        let w2 = material(&db, other, "Ash", 10.0, MaterialKind::Waste);

        let m1 = db.insert_match(w1, consumer, 0.9, &MatchDetails::default()).unwrap();
        let m2 = db.insert_match(w2, consumer, 0.8, &MatchDetails::default()).unwrap();
        let m3 = db.insert_match(w2, supplier, 0.7, &MatchDetails::default()).unwrap();

        let ids = |company| -> Vec<i64> {
            db.list_matches_for_company(company)
                .unwrap()
                .iter()
                .map(|m| m.id)
                .collect()
        };
        assert_eq!(ids(consumer), vec![m2, m1]);
        assert_eq!(ids(supplier), vec![m3, m1]);
        assert_eq!(ids(other), vec![m3, m2]);

        let m = db.get_match(m1).unwrap().unwrap();
        assert_eq!(m.material_name.as_deref(), Some("Slag"));
        assert_eq!(m.supplier_name.as_deref(), Some("Supplier"));
        assert_eq!(m.consumer_name.as_deref(), Some("Consumer"));
        assert_eq!(m.status, MatchStatus::Pending);
    }

    #[test]
    fn test_status_is_one_way() {
        let db = setup();
        let a = db.create_company("Acme", "a@acme.com").unwrap();
        let b = db.create_company("Beta", "b@beta.com").unwrap();
        let w = material(&db, a, "Slag", 10.0, MaterialKind::Waste);
        let id = db.insert_match(w, b, 0.9, &MatchDetails::default()).unwrap();

        let decided = db.update_match_status(id, MatchDecision::Accept).unwrap();
        assert_eq!(decided.status, MatchStatus::Accepted);

        let err = db.update_match_status(id, MatchDecision::Reject).unwrap_err();
        assert!(matches!(err, MarketError::InvalidTransition { .. }));
        assert_eq!(
            db.get_match(id).unwrap().unwrap().status,
            MatchStatus::Accepted
        );

        assert!(matches!(
            db.update_match_status(404, MatchDecision::Accept),
            Err(MarketError::NotFound { entity: "Match", .. })
        ));
    }

    #[test]
    fn test_find_material_matches() {
        let db = setup();
        let supplier = db.create_company("Supplier", "s@x.com").unwrap();
        let steelworks = db.create_company("Steelworks", "st@x.com").unwrap();
        let bakery = db.create_company("Bakery", "b@x.com").unwrap();

        let waste = material(&db, supplier, "Steel scrap", 100.0, MaterialKind::Waste);
        material(&db, supplier, "Steel", 100.0, MaterialKind::Requirement); // own listing
        material(&db, steelworks, "steel", 50.0, MaterialKind::Requirement);
        material(&db, steelworks, "Steel scrap", 100.0, MaterialKind::Requirement);
        material(&db, bakery, "Flour", 50.0, MaterialKind::Requirement);

        let created = db.find_material_matches(waste, 0.7).unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].consumer_id, steelworks);
        assert_eq!(created[0].score, 1.0);
        assert_eq!(created[0].details.category_match, 1.0);

        // Bakery clears a lower bar; steelworks is not matched twice.
        let again = db.find_material_matches(waste, 0.6).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].consumer_id, bakery);
        assert_eq!(again[0].score, 0.65);

        let requirement = db.list_materials(Some(bakery), None, None).unwrap()[0].id;
        assert!(db.find_material_matches(requirement, 0.0).is_err());
    }

    #[test]
    fn test_recommendations() {
        let db = setup();
        let a = db.create_company("Acme", "a@acme.com").unwrap();
        let rec = NewRecommendation {
            company_id: a,
            kind: "match".to_string(),
            title: "Industrial Symbiosis Match".to_string(),
            description: "Found High Value match for your materials".to_string(),
            confidence: 64.0,
            action_url: Some("/match/rec_1".to_string()),
        };
        let id = db.insert_recommendation(&rec).unwrap();
        let stored = db.list_recommendations(a).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, "pending");
        assert_eq!(stored[0].confidence, 64.0);

        let one = db.get_recommendation(id).unwrap().unwrap();
        assert_eq!(one.id, id);
        assert_eq!(one.action_url.as_deref(), Some("/match/rec_1"));
        assert!(db.get_recommendation(id + 1).unwrap().is_none());

        assert!(db.insert_recommendation(&NewRecommendation { company_id: 9, ..rec }).is_err());
    }
}

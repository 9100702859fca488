//! Statement Service
//! Mission: Draft, freeze with a content hash, void, export
//!
//! A frozen statement is immutable: regeneration without the explicit flag
//! returns it untouched, and its snapshot hash never changes no matter what
//! happens to the upstream settlements afterwards.

use crate::audit::{AuditLog, AuditRecord};
use crate::clock::Clock;
use crate::db::Db;
use crate::errors::CoreError;
use crate::settlement::store::SettlementStore;
use crate::statements::models::{
    ExportFormat, Statement, StatementItem, StatementStatus,
};
use crate::statements::render::ReportRenderer;
use crate::statements::store::StatementStore;
use crate::stats::timekey::{Granularity, TimeKey};
use anyhow::{Context, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Who is acting, for the audit trail.
#[derive(Debug, Clone)]
pub struct Actor {
    pub tenant_id: String,
    pub subject: String,
    pub role: String,
}

pub struct StatementService {
    db: Db,
    store: StatementStore,
    settlements: SettlementStore,
    renderer: Arc<dyn ReportRenderer>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    default_currency: String,
}

impl StatementService {
    pub fn new(
        db: Db,
        store: StatementStore,
        settlements: SettlementStore,
        renderer: Arc<dyn ReportRenderer>,
        audit: AuditLog,
        clock: Arc<dyn Clock>,
        default_currency: String,
    ) -> Self {
        Self {
            db,
            store,
            settlements,
            renderer,
            audit,
            clock,
            default_currency,
        }
    }

    /// Build (or return) the statement for `(station, month, category)`.
    /// `month` is a `YYYYMM` key.
    pub fn generate(
        &self,
        actor: &Actor,
        station_id: &str,
        month: &str,
        category: &str,
        regenerate: bool,
    ) -> Result<Statement> {
        let month_key = TimeKey::parse(Granularity::Month, month)?;
        if station_id.is_empty() || category.is_empty() {
            return Err(CoreError::validation("station_id and category are required").into());
        }

        if !regenerate {
            if let Some(existing) =
                self.store
                    .find_current(&actor.tenant_id, station_id, month, category)?
            {
                debug!(statement = %existing.id, "existing statement returned");
                return Ok(existing);
            }
        }

        let version = self
            .store
            .max_version(&actor.tenant_id, station_id, month, category)?
            + 1;

        let days = self.settlements.list_range(
            &actor.tenant_id,
            station_id,
            month_key.period_start,
            month_key.period_end(),
        )?;
        let id = Uuid::new_v4();
        let items: Vec<StatementItem> = days
            .iter()
            .map(|s| StatementItem {
                statement_id: id,
                day_start: s.day_start,
                energy_kwh: s.energy_kwh,
                amount: s.amount,
                currency: s.currency.clone(),
            })
            .collect();

        let currency = items
            .first()
            .map(|i| i.currency.clone())
            .unwrap_or_else(|| self.default_currency.clone());
        let statement = Statement {
            id,
            tenant_id: actor.tenant_id.clone(),
            station_id: station_id.to_string(),
            month: month.to_string(),
            category: category.to_string(),
            status: StatementStatus::Draft,
            version,
            total_energy_kwh: items.iter().map(|i| i.energy_kwh).sum(),
            total_amount: items.iter().map(|i| i.amount).sum(),
            currency,
            snapshot_hash: None,
            frozen_at: None,
            void_reason: None,
            voided_at: None,
            created_at: self.clock.now(),
        };

        {
            let mut conn = self.db.lock();
            let tx = conn.transaction().context("begin statement tx")?;
            StatementStore::insert_with_items_tx(&tx, &statement, &items)?;
            tx.commit().context("commit statement tx")?;
        }

        self.audit_action(
            actor,
            "statement.generate",
            &statement,
            Some(json!({"month": month, "category": category, "version": version})),
        )?;
        info!(
            statement = %statement.id,
            station = station_id,
            month,
            version,
            items = items.len(),
            "statement drafted"
        );
        Ok(statement)
    }

    /// Freeze a draft. Frozen is a no-op returning the stored row; voided is
    /// a conflict.
    pub fn freeze(&self, actor: &Actor, id: Uuid) -> Result<Statement> {
        let statement = self.must_get(&actor.tenant_id, id)?;
        match statement.status {
            StatementStatus::Voided => {
                Err(CoreError::Conflict(format!("statement {} is voided", id)).into())
            }
            StatementStatus::Frozen => Ok(statement),
            StatementStatus::Draft => {
                let items = self.store.items(id)?;
                let hash = snapshot_hash(&statement, &items);
                let now = self.clock.now();
                self.store.freeze(id, &hash, now)?;

                self.audit_action(
                    actor,
                    "statement.freeze",
                    &statement,
                    Some(json!({"snapshot_hash": hash})),
                )?;
                info!(statement = %id, hash, "statement frozen");
                self.must_get(&actor.tenant_id, id)
            }
        }
    }

    /// Void a statement. Already voided is a no-op.
    pub fn void(&self, actor: &Actor, id: Uuid, reason: &str) -> Result<Statement> {
        let statement = self.must_get(&actor.tenant_id, id)?;
        if statement.status == StatementStatus::Voided {
            return Ok(statement);
        }
        let now = self.clock.now();
        self.store.void(id, reason, now)?;
        self.audit_action(actor, "statement.void", &statement, Some(json!({"reason": reason})))?;
        info!(statement = %id, reason, "statement voided");
        self.must_get(&actor.tenant_id, id)
    }

    /// Render an export through the renderer port.
    pub fn export(&self, actor: &Actor, id: Uuid, format: ExportFormat) -> Result<Vec<u8>> {
        let statement = self.must_get(&actor.tenant_id, id)?;
        let items = self.store.items(id)?;
        let bytes = match format {
            ExportFormat::Pdf => self.renderer.pdf(&statement, &items)?,
            ExportFormat::Xlsx => self.renderer.xlsx(&statement, &items)?,
        };
        self.audit_action(actor, "statement.export", &statement, None)?;
        Ok(bytes)
    }

    pub fn get(&self, tenant_id: &str, id: Uuid) -> Result<Option<Statement>> {
        self.store.get(tenant_id, id)
    }

    fn must_get(&self, tenant_id: &str, id: Uuid) -> Result<Statement> {
        self.store
            .get(tenant_id, id)?
            .ok_or_else(|| CoreError::not_found(format!("statement {}", id)).into())
    }

    fn audit_action(
        &self,
        actor: &Actor,
        action: &str,
        statement: &Statement,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        self.audit.write(
            AuditRecord {
                tenant_id: actor.tenant_id.clone(),
                actor: actor.subject.clone(),
                role: actor.role.clone(),
                action: action.to_string(),
                resource_type: "statement".to_string(),
                resource_id: statement.id.to_string(),
                station_id: Some(statement.station_id.clone()),
                metadata_json: metadata.map(|m| m.to_string()),
                ..Default::default()
            },
            self.clock.now(),
        )?;
        Ok(())
    }
}

/// SHA-256 over the canonical JSON of the header (hash and lifecycle stamps
/// excluded) plus items sorted by day. Key order is stable because the JSON
/// map sorts lexicographically.
pub fn snapshot_hash(statement: &Statement, items: &[StatementItem]) -> String {
    let mut sorted: Vec<&StatementItem> = items.iter().collect();
    sorted.sort_by_key(|i| i.day_start);

    let canonical = json!({
        "id": statement.id.to_string(),
        "tenant_id": statement.tenant_id,
        "station_id": statement.station_id,
        "month": statement.month,
        "category": statement.category,
        "version": statement.version,
        "currency": statement.currency,
        "total_energy_kwh": statement.total_energy_kwh,
        "total_amount": statement.total_amount,
        "items": sorted
            .iter()
            .map(|i| {
                json!({
                    "day_start": i.day_start.timestamp(),
                    "energy_kwh": i.energy_kwh,
                    "amount": i.amount,
                    "currency": i.currency,
                })
            })
            .collect::<Vec<_>>(),
    });
    hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::open_memory_db;
    use crate::statements::render::PlainReportRenderer;
    use chrono::{TimeZone, Utc};

    struct Fixture {
        db: Db,
        service: StatementService,
        clock: ManualClock,
        audit: AuditLog,
    }

    fn fixture() -> Fixture {
        let db = open_memory_db().unwrap();
        let store = StatementStore::new(db.clone()).unwrap();
        let settlements = SettlementStore::new(db.clone()).unwrap();
        let audit = AuditLog::new(db.clone()).unwrap();
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2026, 9, 1, 8, 0, 0).unwrap());
        let service = StatementService::new(
            db.clone(),
            store,
            settlements,
            Arc::new(PlainReportRenderer),
            audit.clone(),
            Arc::new(clock.clone()),
            "CNY".to_string(),
        );
        Fixture {
            db,
            service,
            clock,
            audit,
        }
    }

    fn actor() -> Actor {
        Actor {
            tenant_id: "t1".into(),
            subject: "ops@acme".into(),
            role: "admin".into(),
        }
    }

    fn seed_settlement(f: &Fixture, day: u32, energy: f64, amount: f64) {
        let conn = f.db.lock();
        SettlementStore::upsert_calculated_tx(
            &conn,
            "t1",
            "station-S",
            Utc.with_ymd_and_hms(2026, 8, day, 0, 0, 0).unwrap(),
            energy,
            amount,
            "CNY",
        )
        .unwrap();
    }

    #[test]
    fn test_generate_builds_items_from_settlements() {
        let f = fixture();
        seed_settlement(&f, 1, 72.0, 86.4);
        seed_settlement(&f, 2, 10.0, 12.0);

        let statement = f
            .service
            .generate(&actor(), "station-S", "202608", "energy", false)
            .unwrap();
        assert_eq!(statement.status, StatementStatus::Draft);
        assert_eq!(statement.version, 1);
        assert_eq!(statement.total_energy_kwh, 82.0);
        assert!((statement.total_amount - 98.4).abs() < 1e-9);
    }

    #[test]
    fn test_generate_without_flag_returns_existing() {
        let f = fixture();
        seed_settlement(&f, 1, 72.0, 86.4);

        let first = f
            .service
            .generate(&actor(), "station-S", "202608", "energy", false)
            .unwrap();
        // Upstream changes after the draft.
        seed_settlement(&f, 2, 10.0, 12.0);
        let second = f
            .service
            .generate(&actor(), "station-S", "202608", "energy", false)
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.total_energy_kwh, 72.0, "draft untouched");

        // Regeneration picks the next version with the fresh data.
        let third = f
            .service
            .generate(&actor(), "station-S", "202608", "energy", true)
            .unwrap();
        assert_ne!(third.id, first.id);
        assert_eq!(third.version, 2);
        assert_eq!(third.total_energy_kwh, 82.0);
    }

    #[test]
    fn test_freeze_is_idempotent_and_hash_survives_upstream_change() {
        let f = fixture();
        seed_settlement(&f, 1, 72.0, 86.4);
        let draft = f
            .service
            .generate(&actor(), "station-S", "202608", "energy", false)
            .unwrap();

        let frozen = f.service.freeze(&actor(), draft.id).unwrap();
        let hash = frozen.snapshot_hash.clone().unwrap();
        assert_eq!(frozen.status, StatementStatus::Frozen);

        // Settlements move on; the frozen snapshot must not.
        seed_settlement(&f, 1, 99.0, 118.8);
        f.clock.advance(chrono::Duration::days(1));
        let again = f.service.freeze(&actor(), draft.id).unwrap();
        assert_eq!(again.snapshot_hash.as_deref(), Some(hash.as_str()));
        assert_eq!(again.frozen_at, frozen.frozen_at);
    }

    #[test]
    fn test_void_flow() {
        let f = fixture();
        seed_settlement(&f, 1, 72.0, 86.4);
        let draft = f
            .service
            .generate(&actor(), "station-S", "202608", "energy", false)
            .unwrap();

        let voided = f
            .service
            .void(&actor(), draft.id, "wrong tariff applied")
            .unwrap();
        assert_eq!(voided.status, StatementStatus::Voided);
        assert_eq!(voided.void_reason.as_deref(), Some("wrong tariff applied"));

        // Void is a no-op the second time and freezing a voided one fails.
        let again = f.service.void(&actor(), draft.id, "other").unwrap();
        assert_eq!(again.void_reason.as_deref(), Some("wrong tariff applied"));
        let err = f.service.freeze(&actor(), draft.id).unwrap_err();
        assert!(matches!(
            crate::errors::as_core(&err),
            Some(CoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_snapshot_hash_depends_only_on_content_order_free() {
        let f = fixture();
        seed_settlement(&f, 1, 72.0, 86.4);
        seed_settlement(&f, 2, 10.0, 12.0);
        let draft = f
            .service
            .generate(&actor(), "station-S", "202608", "energy", false)
            .unwrap();
        let items = StatementStore::new(f.db.clone()).unwrap().items(draft.id).unwrap();

        let forward = snapshot_hash(&draft, &items);
        let mut reversed = items.clone();
        reversed.reverse();
        assert_eq!(forward, snapshot_hash(&draft, &reversed));

        // Lifecycle fields don't participate.
        let mut frozen_copy = draft.clone();
        frozen_copy.status = StatementStatus::Frozen;
        frozen_copy.frozen_at = Some(Utc::now());
        assert_eq!(forward, snapshot_hash(&frozen_copy, &items));

        // Content does.
        let mut changed = items.clone();
        changed[0].amount += 0.01;
        assert_ne!(forward, snapshot_hash(&draft, &changed));
    }

    #[test]
    fn test_exports_are_byte_equal_and_audited() {
        let f = fixture();
        seed_settlement(&f, 1, 72.0, 86.4);
        let draft = f
            .service
            .generate(&actor(), "station-S", "202608", "energy", false)
            .unwrap();
        f.service.freeze(&actor(), draft.id).unwrap();

        let pdf1 = f.service.export(&actor(), draft.id, ExportFormat::Pdf).unwrap();
        let pdf2 = f.service.export(&actor(), draft.id, ExportFormat::Pdf).unwrap();
        assert_eq!(pdf1, pdf2);
        let xlsx1 = f.service.export(&actor(), draft.id, ExportFormat::Xlsx).unwrap();
        let xlsx2 = f.service.export(&actor(), draft.id, ExportFormat::Xlsx).unwrap();
        assert_eq!(xlsx1, xlsx2);

        let actions: Vec<String> = f
            .audit
            .list_recent("t1", 20)
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert!(actions.contains(&"statement.generate".to_string()));
        assert!(actions.contains(&"statement.freeze".to_string()));
        assert!(actions.iter().filter(|a| *a == "statement.export").count() >= 4);
    }

    #[test]
    fn test_cross_tenant_statement_is_invisible() {
        let f = fixture();
        seed_settlement(&f, 1, 72.0, 86.4);
        let draft = f
            .service
            .generate(&actor(), "station-S", "202608", "energy", false)
            .unwrap();

        let other = Actor {
            tenant_id: "t2".into(),
            subject: "spy@other".into(),
            role: "admin".into(),
        };
        let err = f.service.freeze(&other, draft.id).unwrap_err();
        assert!(matches!(
            crate::errors::as_core(&err),
            Some(CoreError::NotFound(_))
        ));
    }
}

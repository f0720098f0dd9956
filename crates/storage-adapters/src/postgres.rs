//! # PostgreSQL Store
//!
//! Implements the persistence ports on top of `sqlx`. Offer and pixel
//! definitions are stored as JSONB next to the columns used for lookups;
//! events are plain rows so cap counts stay index-only.

use std::fmt::Display;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use domains::errors::{DomainError, Result};
use domains::models::{
    Conversion, Lead, LeadStatus, NewLead, Offer, OfferKind, OfferRef, Path, PathOffers, PayoutType,
    Pixel, PostingData, SessionContext, Skip, SoiGroup, StoredConversion, VisitorData,
};
use domains::ports::{
    CapCounter, EventStore, OfferRepository, PixelRepository, SessionStore, VerificationCache,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::info;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "database pool created");
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(storage)?;
        Ok(())
    }
}

fn storage(e: impl Display) -> DomainError {
    DomainError::Storage(e.to_string())
}

fn offer_from_row(row: &PgRow, kind: OfferKind) -> Result<Offer> {
    let Json(mut offer): Json<Offer> = row.try_get("definition").map_err(storage)?;
    offer.id = row.try_get("id").map_err(storage)?;
    offer.kind = kind;
    offer.enabled = row.try_get("enabled").map_err(storage)?;
    Ok(offer)
}

fn parse_status(raw: &str) -> Result<LeadStatus> {
    match raw {
        "Delivered" => Ok(LeadStatus::Delivered),
        "Rejected" => Ok(LeadStatus::Rejected),
        "Flagged" => Ok(LeadStatus::Flagged),
        other => Err(DomainError::Storage(format!("unknown lead status {other:?}"))),
    }
}

fn payout_type_str(payout_type: PayoutType) -> &'static str {
    match payout_type {
        PayoutType::Cpc => "cpc",
        PayoutType::Cpa => "cpa",
    }
}

fn parse_payout_type(raw: &str) -> Result<PayoutType> {
    match raw {
        "cpc" => Ok(PayoutType::Cpc),
        "cpa" => Ok(PayoutType::Cpa),
        other => Err(DomainError::Storage(format!("unknown payout type {other:?}"))),
    }
}

fn limit(row: &PgRow, column: &str) -> Result<Option<u32>> {
    let raw: Option<i32> = row.try_get(column).map_err(storage)?;
    Ok(raw.and_then(|v| u32::try_from(v).ok()))
}

#[async_trait]
impl OfferRepository for PgStore {
    async fn path_offers(&self, path_id: i64) -> Result<Option<PathOffers>> {
        let Some(row) = sqlx::query(
            "SELECT id, slug, max_sois_shown_per_question, max_linkouts_shown
             FROM paths WHERE id = $1",
        )
        .bind(path_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?
        else {
            return Ok(None);
        };

        let path = Path {
            id: row.try_get("id").map_err(storage)?,
            slug: row.try_get("slug").map_err(storage)?,
            max_sois_shown_per_question: limit(&row, "max_sois_shown_per_question")?,
            max_linkouts_shown: limit(&row, "max_linkouts_shown")?,
        };

        let soi_rows = sqlx::query(
            "SELECT ps.question_id, o.id, o.enabled, o.definition
             FROM path_sois ps
             JOIN offers o ON o.kind = 'soi' AND o.id = ps.soi_id
             WHERE ps.path_id = $1
             ORDER BY ps.question_id, ps.position",
        )
        .bind(path_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        let mut soi_groups: Vec<SoiGroup> = Vec::new();
        for row in &soi_rows {
            let question_id: i64 = row.try_get("question_id").map_err(storage)?;
            let offer = offer_from_row(row, OfferKind::Soi)?;
            match soi_groups.last_mut() {
                Some(group) if group.question_id == question_id => group.offers.push(offer),
                _ => soi_groups.push(SoiGroup {
                    question_id,
                    offers: vec![offer],
                }),
            }
        }

        let linkouts = sqlx::query(
            "SELECT o.id, o.enabled, o.definition
             FROM path_linkouts pl
             JOIN offers o ON o.kind = 'linkout' AND o.id = pl.linkout_id
             WHERE pl.path_id = $1
             ORDER BY pl.position",
        )
        .bind(path_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?
        .iter()
        .map(|row| offer_from_row(row, OfferKind::Linkout))
        .collect::<Result<Vec<_>>>()?;

        Ok(Some(PathOffers {
            path,
            soi_groups,
            linkouts,
        }))
    }

    async fn find_offer(&self, offer: OfferRef) -> Result<Option<Offer>> {
        let row = sqlx::query(
            "SELECT id, enabled, definition FROM offers WHERE kind = $1 AND id = $2",
        )
        .bind(offer.kind.as_str())
        .bind(offer.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;
        row.map(|r| offer_from_row(&r, offer.kind)).transpose()
    }
}

#[async_trait]
impl CapCounter for PgStore {
    async fn count_events(&self, offer: OfferRef, since: Option<NaiveDateTime>) -> Result<u64> {
        let sql = match offer.kind {
            OfferKind::Soi => {
                "SELECT COUNT(*) FROM leads
                 WHERE soi_id = $1 AND status = 'Delivered'
                   AND ($2::timestamp IS NULL OR created_at >= $2)"
            }
            OfferKind::Linkout => {
                "SELECT COUNT(*) FROM conversions
                 WHERE linkout_id = $1 AND ($2::timestamp IS NULL OR created_at >= $2)"
            }
        };
        let count: i64 = sqlx::query_scalar(sql)
            .bind(offer.id)
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl VerificationCache for PgStore {
    async fn email_verified(&self, email: &str) -> Result<Option<bool>> {
        sqlx::query_scalar("SELECT valid FROM email_verifications WHERE email = lower($1)")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)
    }
}

#[async_trait]
impl PixelRepository for PgStore {
    async fn enabled_pixels(&self, location: &str, cpa_partner: bool) -> Result<Vec<Pixel>> {
        let rows = sqlx::query(
            "SELECT id, definition FROM pixels
             WHERE enabled AND location = $1 AND is_cpa_partner = $2
             ORDER BY id",
        )
        .bind(location)
        .bind(cpa_partner)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;

        rows.iter()
            .map(|row| {
                let Json(mut pixel): Json<Pixel> = row.try_get("definition").map_err(storage)?;
                pixel.id = row.try_get("id").map_err(storage)?;
                pixel.location = location.to_string();
                pixel.enabled = true;
                pixel.is_cpa_partner = cpa_partner;
                Ok(pixel)
            })
            .collect()
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn load(&self, session_id: &str) -> Result<SessionContext> {
        let row = sqlx::query(
            "SELECT revenue_bucket, soi_revenue, linkout_revenue
             FROM sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        let Some(row) = row else {
            return Ok(SessionContext::new(session_id));
        };
        Ok(SessionContext {
            session_id: session_id.to_string(),
            revenue_bucket: row.try_get("revenue_bucket").map_err(storage)?,
            soi_revenue: row.try_get("soi_revenue").map_err(storage)?,
            linkout_revenue: row.try_get("linkout_revenue").map_err(storage)?,
        })
    }

    async fn save(&self, session: &SessionContext) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions
                (session_id, revenue_bucket, soi_revenue, linkout_revenue, updated_at)
             VALUES ($1, $2, $3, $4, NOW())
             ON CONFLICT (session_id) DO UPDATE SET
                revenue_bucket = EXCLUDED.revenue_bucket,
                soi_revenue = EXCLUDED.soi_revenue,
                linkout_revenue = EXCLUDED.linkout_revenue,
                updated_at = NOW()",
        )
        .bind(&session.session_id)
        .bind(session.revenue_bucket)
        .bind(session.soi_revenue)
        .bind(session.linkout_revenue)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgStore {
    async fn record_lead(&self, lead: &NewLead) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO leads (soi_id, soi_label, advertiser_id, advertiser, path_id, cost, status,
                                posting_data, platform, submission_response, question_id, answer_id,
                                traffic_source, visitor, ip, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
             RETURNING id",
        )
        .bind(lead.soi_id)
        .bind(&lead.soi_label)
        .bind(lead.advertiser_id)
        .bind(&lead.advertiser)
        .bind(lead.path_id)
        .bind(lead.cost)
        .bind(lead.status.as_str())
        .bind(Json(&lead.posting_data))
        .bind(&lead.platform)
        .bind(&lead.submission_response)
        .bind(lead.question_id)
        .bind(lead.answer_id)
        .bind(&lead.traffic_source)
        .bind(Json(&lead.visitor))
        .bind(&lead.ip)
        .bind(lead.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)
    }

    async fn find_lead(&self, id: i64) -> Result<Option<Lead>> {
        let Some(row) = sqlx::query("SELECT * FROM leads WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
        else {
            return Ok(None);
        };

        let status: String = row.try_get("status").map_err(storage)?;
        let Json(posting_data): Json<PostingData> = row.try_get("posting_data").map_err(storage)?;
        let Json(visitor): Json<VisitorData> = row.try_get("visitor").map_err(storage)?;
        Ok(Some(Lead {
            id,
            record: NewLead {
                soi_id: row.try_get("soi_id").map_err(storage)?,
                soi_label: row.try_get("soi_label").map_err(storage)?,
                advertiser_id: row.try_get("advertiser_id").map_err(storage)?,
                advertiser: row.try_get("advertiser").map_err(storage)?,
                path_id: row.try_get("path_id").map_err(storage)?,
                cost: row.try_get("cost").map_err(storage)?,
                status: parse_status(&status)?,
                posting_data,
                platform: row.try_get("platform").map_err(storage)?,
                submission_response: row.try_get("submission_response").map_err(storage)?,
                question_id: row.try_get("question_id").map_err(storage)?,
                answer_id: row.try_get("answer_id").map_err(storage)?,
                traffic_source: row.try_get("traffic_source").map_err(storage)?,
                visitor,
                ip: row.try_get("ip").map_err(storage)?,
                created_at: row.try_get("created_at").map_err(storage)?,
            },
        }))
    }

    async fn update_lead_submission(
        &self,
        id: i64,
        status: LeadStatus,
        submission_response: &str,
    ) -> Result<()> {
        let updated =
            sqlx::query("UPDATE leads SET status = $2, submission_response = $3 WHERE id = $1")
                .bind(id)
                .bind(status.as_str())
                .bind(submission_response)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        if updated.rows_affected() == 0 {
            return Err(DomainError::not_found("lead", id));
        }
        Ok(())
    }

    async fn record_conversion(&self, conversion: &Conversion) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO conversions (linkout_id, payout_type, cost, session_id, path_id, platform,
                                      traffic_source, visitor, created_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING id",
        )
        .bind(conversion.linkout_id)
        .bind(payout_type_str(conversion.payout_type))
        .bind(conversion.cost)
        .bind(&conversion.session_id)
        .bind(conversion.path_id)
        .bind(&conversion.platform)
        .bind(&conversion.traffic_source)
        .bind(Json(&conversion.visitor))
        .bind(conversion.created_at)
        .bind(conversion.completed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)
    }

    async fn find_conversion(&self, id: i64) -> Result<Option<StoredConversion>> {
        let Some(row) = sqlx::query("SELECT * FROM conversions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
        else {
            return Ok(None);
        };

        let payout_type: String = row.try_get("payout_type").map_err(storage)?;
        let Json(visitor): Json<VisitorData> = row.try_get("visitor").map_err(storage)?;
        Ok(Some(StoredConversion {
            id,
            record: Conversion {
                linkout_id: row.try_get("linkout_id").map_err(storage)?,
                payout_type: parse_payout_type(&payout_type)?,
                cost: row.try_get("cost").map_err(storage)?,
                session_id: row.try_get("session_id").map_err(storage)?,
                path_id: row.try_get("path_id").map_err(storage)?,
                platform: row.try_get("platform").map_err(storage)?,
                traffic_source: row.try_get("traffic_source").map_err(storage)?,
                visitor,
                created_at: row.try_get("created_at").map_err(storage)?,
                completed_at: row.try_get("completed_at").map_err(storage)?,
            },
        }))
    }

    async fn complete_conversion(
        &self,
        id: i64,
        cost: f64,
        completed_at: NaiveDateTime,
    ) -> Result<()> {
        let updated =
            sqlx::query("UPDATE conversions SET cost = $2, completed_at = $3 WHERE id = $1")
                .bind(id)
                .bind(cost)
                .bind(completed_at)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        if updated.rows_affected() == 0 {
            return Err(DomainError::not_found("conversion", id));
        }
        Ok(())
    }

    async fn record_skip(&self, skip: &Skip) -> Result<i64> {
        sqlx::query_scalar(
            "INSERT INTO skips (offer_kind, offer_id, advertiser_id, path_id, visitor, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(skip.offer.kind.as_str())
        .bind(skip.offer.id)
        .bind(skip.advertiser_id)
        .bind(skip.path_id)
        .bind(Json(&skip.visitor))
        .bind(skip.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lead_status_round_trips_through_text() {
        for status in [LeadStatus::Delivered, LeadStatus::Rejected, LeadStatus::Flagged] {
            assert_eq!(parse_status(status.as_str()).unwrap(), status);
        }
        assert!(parse_status("Pending").is_err());
    }

    #[test]
    fn payout_type_round_trips_through_text() {
        for payout_type in [PayoutType::Cpc, PayoutType::Cpa] {
            assert_eq!(parse_payout_type(payout_type_str(payout_type)).unwrap(), payout_type);
        }
        assert!(parse_payout_type("cpm").is_err());
    }
}

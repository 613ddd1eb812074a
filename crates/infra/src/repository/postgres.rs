//! Postgres-backed repository.
//!
//! Tables: `email_campaigns`, `email_templates`, `business_contacts`,
//! `company_emails`, `campaign_recipients`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, instrument};
use uuid::Uuid;

use outreach_campaigns::{
    CampaignCounters, CampaignSnapshot, CampaignStatus, FlagChange, Lead, LeadEmail, LeadFilter,
    Recipient, Template, TrackingEventType, TrackingId,
};
use outreach_core::{CampaignId, ExpectedVersion, LeadId, RecipientId, TemplateId};

use super::{CampaignStore, LeadSource, RecipientStore, RepositoryError, TemplateStore};
use crate::db::{describe, is_foreign_key_violation, is_unique_violation, non_negative};

const CAMPAIGN_COLUMNS: &str = "id, name, template_id, subject, target_filter, status, \
     total_recipients, scheduled_at, started_at, completed_at, cancelled_at, created_at, version";

const COUNTER_COLUMNS: &str = "sent_count, opened_count, clicked_count, replied_count, bounced_count";

const TEMPLATE_COLUMNS: &str = "id, name, subject, body, variables, is_active, created_at";

const RECIPIENT_COLUMNS: &str = "id, campaign_id, lead_id, email, first_name, last_name, \
     company_name, industry, city, tracking_id, sent_at, opened_at, clicked_at, replied_at, \
     bounced_at, bounce_reason, created_at";

const LEAD_COLUMNS: &str = "id, company_name, first_name, last_name, industry, city, state, \
     country, company_size, status, source, tags, quality_score";

#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_recipient(
        tx: &mut Transaction<'_, Postgres>,
        id: RecipientId,
    ) -> Result<Option<Recipient>, RepositoryError> {
        let sql = format!("SELECT {RECIPIENT_COLUMNS} FROM campaign_recipients WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_recipient", e))?;
        row.map(|r| decode_recipient(&r)).transpose()
    }
}

/// Recipient timestamp column and campaign counter column for a flag.
fn flag_columns(event_type: TrackingEventType) -> (&'static str, &'static str) {
    match event_type {
        TrackingEventType::Sent => ("sent_at", "sent_count"),
        TrackingEventType::Opened => ("opened_at", "opened_count"),
        TrackingEventType::Clicked => ("clicked_at", "clicked_count"),
        TrackingEventType::Replied => ("replied_at", "replied_count"),
        TrackingEventType::Bounced => ("bounced_at", "bounced_count"),
    }
}

#[async_trait]
impl CampaignStore for PostgresRepository {
    #[instrument(skip(self, campaign), fields(campaign_id = %campaign.id), err)]
    async fn insert_campaign(&self, campaign: &CampaignSnapshot) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO email_campaigns
                (id, name, template_id, subject, target_filter, status, total_recipients,
                 scheduled_at, started_at, completed_at, cancelled_at, created_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(campaign.id.as_uuid())
        .bind(&campaign.name)
        .bind(campaign.template_id.map(Uuid::from))
        .bind(campaign.subject.as_deref())
        .bind(Json(&campaign.target_filter))
        .bind(campaign.status.as_str())
        .bind(campaign.total_recipients as i64)
        .bind(campaign.scheduled_at)
        .bind(campaign.started_at)
        .bind(campaign.completed_at)
        .bind(campaign.cancelled_at)
        .bind(campaign.created_at)
        .bind(campaign.version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Duplicate("campaign")
            } else {
                map_sqlx_error("insert_campaign", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_campaign(&self, id: CampaignId) -> Result<Option<CampaignSnapshot>, RepositoryError> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM email_campaigns WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_campaign", e))?;
        row.map(|r| decode_campaign(&r)).transpose()
    }

    #[instrument(skip(self, campaign), fields(campaign_id = %campaign.id, version = campaign.version), err)]
    async fn save_campaign(
        &self,
        campaign: &CampaignSnapshot,
        expected: ExpectedVersion,
    ) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("save_campaign.begin", e))?;

        let stored: Option<i64> =
            sqlx::query_scalar("SELECT version FROM email_campaigns WHERE id = $1 FOR UPDATE")
                .bind(campaign.id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("save_campaign.lock", e))?;
        let stored = stored.ok_or(RepositoryError::not_found("campaign"))?;
        let actual: u64 = non_negative(stored, "version")
            .map_err(|e| map_sqlx_error("save_campaign.version", e))?;

        if !expected.matches(actual) {
            return Err(RepositoryError::Conflict { expected, actual });
        }

        sqlx::query(
            r#"
            UPDATE email_campaigns
            SET name = $2,
                template_id = $3,
                subject = $4,
                target_filter = $5,
                status = $6,
                total_recipients = $7,
                scheduled_at = $8,
                started_at = $9,
                completed_at = $10,
                cancelled_at = $11,
                version = $12
            WHERE id = $1
            "#,
        )
        .bind(campaign.id.as_uuid())
        .bind(&campaign.name)
        .bind(campaign.template_id.map(Uuid::from))
        .bind(campaign.subject.as_deref())
        .bind(Json(&campaign.target_filter))
        .bind(campaign.status.as_str())
        .bind(campaign.total_recipients as i64)
        .bind(campaign.scheduled_at)
        .bind(campaign.started_at)
        .bind(campaign.completed_at)
        .bind(campaign.cancelled_at)
        .bind(campaign.version as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("save_campaign.update", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("save_campaign.commit", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_campaigns_by_status(
        &self,
        status: CampaignStatus,
    ) -> Result<Vec<CampaignSnapshot>, RepositoryError> {
        let sql = format!("SELECT {CAMPAIGN_COLUMNS} FROM email_campaigns WHERE status = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_campaigns_by_status", e))?;
        rows.iter().map(decode_campaign).collect()
    }

    #[instrument(skip(self), err)]
    async fn campaign_counters(&self, id: CampaignId) -> Result<CampaignCounters, RepositoryError> {
        let sql = format!("SELECT {COUNTER_COLUMNS} FROM email_campaigns WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("campaign_counters", e))?
            .ok_or(RepositoryError::not_found("campaign"))?;
        decode_counters(&row)
    }

    #[instrument(skip(self), err)]
    async fn list_campaigns(&self) -> Result<Vec<(CampaignSnapshot, CampaignCounters)>, RepositoryError> {
        let sql = format!(
            "SELECT {CAMPAIGN_COLUMNS}, {COUNTER_COLUMNS} FROM email_campaigns \
             ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_campaigns", e))?;
        rows.iter()
            .map(|row| Ok((decode_campaign(row)?, decode_counters(row)?)))
            .collect()
    }
}

#[async_trait]
impl TemplateStore for PostgresRepository {
    #[instrument(skip(self, template), fields(template_id = %template.id), err)]
    async fn insert_template(&self, template: &Template) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO email_templates (id, name, subject, body, variables, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(template.id.as_uuid())
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.body)
        .bind(Json(&template.variables))
        .bind(template.is_active)
        .bind(template.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Duplicate("template")
            } else {
                map_sqlx_error("insert_template", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_template(&self, id: TemplateId) -> Result<Option<Template>, RepositoryError> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM email_templates WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_template", e))?;
        row.map(|r| decode_template(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_templates(&self) -> Result<Vec<Template>, RepositoryError> {
        let sql = format!("SELECT {TEMPLATE_COLUMNS} FROM email_templates ORDER BY created_at DESC, id DESC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_templates", e))?;
        rows.iter().map(decode_template).collect()
    }

    #[instrument(skip(self, template), fields(template_id = %template.id), err)]
    async fn update_template(&self, template: &Template) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE email_templates
            SET name = $2, subject = $3, body = $4, variables = $5, is_active = $6
            WHERE id = $1
            "#,
        )
        .bind(template.id.as_uuid())
        .bind(&template.name)
        .bind(&template.subject)
        .bind(&template.body)
        .bind(Json(&template.variables))
        .bind(template.is_active)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_template", e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("template"));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_template(&self, id: TemplateId) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM email_templates WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_foreign_key_violation(&e) {
                    RepositoryError::InUse("template")
                } else {
                    map_sqlx_error("delete_template", e)
                }
            })?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::not_found("template"));
        }
        debug!(template_id = %id, "template deleted");
        Ok(())
    }
}

#[async_trait]
impl LeadSource for PostgresRepository {
    /// Attribute equality is pushed into SQL; email preference, tags and
    /// score are applied by [`LeadFilter::matches`] on the loaded rows.
    #[instrument(skip(self, filter), err)]
    async fn find_leads(&self, filter: &LeadFilter) -> Result<Vec<Lead>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {LEAD_COLUMNS}
            FROM business_contacts
            WHERE ($1::text IS NULL OR industry = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR city = $3)
              AND ($4::text IS NULL OR state = $4)
              AND ($5::text IS NULL OR country = $5)
              AND ($6::text IS NULL OR company_size = $6)
              AND ($7::text IS NULL OR source = $7)
            ORDER BY id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(filter.industry.as_deref())
            .bind(filter.status.as_deref())
            .bind(filter.city.as_deref())
            .bind(filter.state.as_deref())
            .bind(filter.country.as_deref())
            .bind(filter.company_size.as_deref())
            .bind(filter.source.as_deref())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_leads", e))?;

        let mut leads = rows
            .iter()
            .map(decode_lead)
            .collect::<Result<Vec<_>, _>>()?;
        if leads.is_empty() {
            return Ok(leads);
        }

        let ids: Vec<Uuid> = leads.iter().map(|l| Uuid::from(l.id)).collect();
        let email_rows = sqlx::query(
            r#"
            SELECT contact_id, email, is_primary, is_validated
            FROM company_emails
            WHERE contact_id = ANY($1)
            ORDER BY contact_id, id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_leads.emails", e))?;

        let mut emails: HashMap<Uuid, Vec<LeadEmail>> = HashMap::new();
        for row in &email_rows {
            let decode = || -> Result<(Uuid, LeadEmail), sqlx::Error> {
                Ok((
                    row.try_get("contact_id")?,
                    LeadEmail {
                        address: row.try_get("email")?,
                        is_primary: row.try_get("is_primary")?,
                        is_validated: row.try_get("is_validated")?,
                    },
                ))
            };
            let (contact_id, email) = decode().map_err(|e| map_sqlx_error("decode_email", e))?;
            emails.entry(contact_id).or_default().push(email);
        }

        for lead in &mut leads {
            lead.emails = emails.remove(lead.id.as_uuid()).unwrap_or_default();
        }
        leads.retain(|l| filter.matches(l));
        debug!(matched = leads.len(), "leads selected");
        Ok(leads)
    }
}

#[async_trait]
impl RecipientStore for PostgresRepository {
    #[instrument(skip(self, recipients), fields(count = recipients.len()), err)]
    async fn insert_recipients(
        &self,
        recipients: Vec<Recipient>,
    ) -> Result<Vec<Recipient>, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("insert_recipients.begin", e))?;
        let select = format!(
            "SELECT {RECIPIENT_COLUMNS} FROM campaign_recipients WHERE campaign_id = $1 AND lead_id = $2"
        );

        let mut stored = Vec::with_capacity(recipients.len());
        for r in &recipients {
            sqlx::query(
                r#"
                INSERT INTO campaign_recipients
                    (id, campaign_id, lead_id, email, first_name, last_name, company_name,
                     industry, city, tracking_id, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (campaign_id, lead_id) DO NOTHING
                "#,
            )
            .bind(r.id.as_uuid())
            .bind(r.campaign_id.as_uuid())
            .bind(r.lead_id.as_uuid())
            .bind(&r.email)
            .bind(r.first_name.as_deref())
            .bind(r.last_name.as_deref())
            .bind(r.company_name.as_deref())
            .bind(r.industry.as_deref())
            .bind(r.city.as_deref())
            .bind(r.tracking_id.as_str())
            .bind(r.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    RepositoryError::Duplicate("tracking id")
                } else {
                    map_sqlx_error("insert_recipients", e)
                }
            })?;

            let row = sqlx::query(&select)
                .bind(r.campaign_id.as_uuid())
                .bind(r.lead_id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_recipients.select", e))?;
            stored.push(decode_recipient(&row)?);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("insert_recipients.commit", e))?;
        Ok(stored)
    }

    #[instrument(skip(self), err)]
    async fn get_recipient(&self, id: RecipientId) -> Result<Option<Recipient>, RepositoryError> {
        let sql = format!("SELECT {RECIPIENT_COLUMNS} FROM campaign_recipients WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_recipient", e))?;
        row.map(|r| decode_recipient(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_by_tracking_id(
        &self,
        tracking_id: &TrackingId,
    ) -> Result<Option<Recipient>, RepositoryError> {
        let sql = format!("SELECT {RECIPIENT_COLUMNS} FROM campaign_recipients WHERE tracking_id = $1");
        let row = sqlx::query(&sql)
            .bind(tracking_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_tracking_id", e))?;
        row.map(|r| decode_recipient(&r)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_recipients(&self, campaign_id: CampaignId) -> Result<Vec<Recipient>, RepositoryError> {
        let sql = format!(
            "SELECT {RECIPIENT_COLUMNS} FROM campaign_recipients WHERE campaign_id = $1 ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(campaign_id.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_recipients", e))?;
        rows.iter().map(decode_recipient).collect()
    }

    #[instrument(skip(self, reason), err)]
    async fn mark_recipient(
        &self,
        id: RecipientId,
        event_type: TrackingEventType,
        at: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<FlagChange, RepositoryError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("mark_recipient.begin", e))?;

        let mut recipient = Self::lock_recipient(&mut tx, id)
            .await?
            .ok_or(RepositoryError::not_found("recipient"))?;
        let change = recipient.mark(event_type, at, reason);
        if change != FlagChange::Set {
            return Ok(change);
        }

        let (flag_column, counter_column) = flag_columns(event_type);
        let sql = format!(
            "UPDATE campaign_recipients SET {flag_column} = $2, bounce_reason = $3 WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(at)
            .bind(recipient.bounce_reason.as_deref())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_recipient.flag", e))?;

        let sql = format!(
            "UPDATE email_campaigns SET {counter_column} = {counter_column} + 1 WHERE id = $1"
        );
        sqlx::query(&sql)
            .bind(recipient.campaign_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("mark_recipient.counter", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("mark_recipient.commit", e))?;
        Ok(change)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RepositoryError {
    RepositoryError::Storage(describe(operation, &err))
}

fn decode_err(err: outreach_core::DomainError) -> sqlx::Error {
    sqlx::Error::Decode(err.to_string().into())
}

fn decode_campaign(row: &PgRow) -> Result<CampaignSnapshot, RepositoryError> {
    let decode = || -> Result<CampaignSnapshot, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let Json(target_filter): Json<LeadFilter> = row.try_get("target_filter")?;
        Ok(CampaignSnapshot {
            id: CampaignId::from_uuid(row.try_get("id")?),
            name: row.try_get("name")?,
            template_id: row
                .try_get::<Option<Uuid>, _>("template_id")?
                .map(TemplateId::from_uuid),
            subject: row.try_get("subject")?,
            target_filter,
            status: status.parse().map_err(decode_err)?,
            total_recipients: non_negative(row.try_get("total_recipients")?, "total_recipients")?,
            scheduled_at: row.try_get("scheduled_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            cancelled_at: row.try_get("cancelled_at")?,
            created_at: row.try_get("created_at")?,
            version: non_negative(row.try_get("version")?, "version")?,
        })
    };
    decode().map_err(|e| map_sqlx_error("decode_campaign", e))
}

fn decode_counters(row: &PgRow) -> Result<CampaignCounters, RepositoryError> {
    let decode = || -> Result<CampaignCounters, sqlx::Error> {
        Ok(CampaignCounters {
            sent: non_negative(row.try_get("sent_count")?, "sent_count")?,
            opened: non_negative(row.try_get("opened_count")?, "opened_count")?,
            clicked: non_negative(row.try_get("clicked_count")?, "clicked_count")?,
            replied: non_negative(row.try_get("replied_count")?, "replied_count")?,
            bounced: non_negative(row.try_get("bounced_count")?, "bounced_count")?,
        })
    };
    decode().map_err(|e| map_sqlx_error("decode_counters", e))
}

fn decode_template(row: &PgRow) -> Result<Template, RepositoryError> {
    let decode = || -> Result<Template, sqlx::Error> {
        let Json(variables): Json<Vec<String>> = row.try_get("variables")?;
        Ok(Template {
            id: TemplateId::from_uuid(row.try_get("id")?),
            name: row.try_get("name")?,
            subject: row.try_get("subject")?,
            body: row.try_get("body")?,
            variables,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
        })
    };
    decode().map_err(|e| map_sqlx_error("decode_template", e))
}

fn decode_recipient(row: &PgRow) -> Result<Recipient, RepositoryError> {
    let decode = || -> Result<Recipient, sqlx::Error> {
        let tracking_id: String = row.try_get("tracking_id")?;
        Ok(Recipient {
            id: RecipientId::from_uuid(row.try_get("id")?),
            campaign_id: CampaignId::from_uuid(row.try_get("campaign_id")?),
            lead_id: LeadId::from_uuid(row.try_get("lead_id")?),
            email: row.try_get("email")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            company_name: row.try_get("company_name")?,
            industry: row.try_get("industry")?,
            city: row.try_get("city")?,
            tracking_id: tracking_id.parse().map_err(decode_err)?,
            sent_at: row.try_get("sent_at")?,
            opened_at: row.try_get("opened_at")?,
            clicked_at: row.try_get("clicked_at")?,
            replied_at: row.try_get("replied_at")?,
            bounced_at: row.try_get("bounced_at")?,
            bounce_reason: row.try_get("bounce_reason")?,
            created_at: row.try_get("created_at")?,
        })
    };
    decode().map_err(|e| map_sqlx_error("decode_recipient", e))
}

fn decode_lead(row: &PgRow) -> Result<Lead, RepositoryError> {
    let decode = || -> Result<Lead, sqlx::Error> {
        Ok(Lead {
            id: LeadId::from_uuid(row.try_get("id")?),
            company_name: row.try_get("company_name")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            industry: row.try_get("industry")?,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            country: row.try_get("country")?,
            company_size: row.try_get("company_size")?,
            status: row.try_get("status")?,
            source: row.try_get("source")?,
            tags: row.try_get("tags")?,
            quality_score: row.try_get("quality_score")?,
            emails: Vec::new(),
        })
    };
    decode().map_err(|e| map_sqlx_error("decode_lead", e))
}

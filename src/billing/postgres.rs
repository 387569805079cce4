use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::models::{BillingItem, BillingItemUpdate, BillingStatus};
use super::{invoice_payable, BillingError, BillingStore, INVOICE_PAID};

// key: billing-postgres -> tblinvoices,tblinvoiceitems,tblorders
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn item_from_row(row: &PgRow) -> Result<BillingItem, BillingError> {
    let status: String = row.try_get("status")?;
    Ok(BillingItem {
        id: row.try_get("id")?,
        invoice_id: row.try_get("invoiceid")?,
        client_id: row.try_get("userid")?,
        description: row.try_get("description")?,
        status: status.parse::<BillingStatus>().map_err(BillingError::Corrupt)?,
        notes: row.try_get("notes")?,
        ip_address: row.try_get("ipaddress")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_billing_item(&self, id: i32) -> Result<BillingItem, BillingError> {
        let row = sqlx::query(
            r#"
            SELECT id, invoiceid, userid, description, status, notes, ipaddress, updated_at
            FROM tblinvoiceitems
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => item_from_row(&row),
            None => Err(BillingError::NotFound(id)),
        }
    }

    async fn update_billing_item(
        &self,
        id: i32,
        update: &BillingItemUpdate,
    ) -> Result<(), BillingError> {
        let result = sqlx::query(
            r#"
            UPDATE tblinvoiceitems
            SET status = $2,
                notes = COALESCE($3, notes),
                ipaddress = COALESCE($4, ipaddress),
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(update.notes.as_deref())
        .bind(update.ip_address.as_deref())
        .bind(update.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(id));
        }
        Ok(())
    }

    async fn apply_invoice_paid(
        &self,
        invoice_id: i32,
        managed_note: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<i32>, BillingError> {
        let mut tx = self.pool.begin().await?;
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM tblinvoices WHERE id = $1 FOR UPDATE")
                .bind(invoice_id)
                .fetch_optional(&mut tx)
                .await?;
        let Some(status) = status else {
            return Err(BillingError::InvoiceNotFound(invoice_id));
        };
        if status == INVOICE_PAID {
            tracing::info!(invoice = invoice_id, "invoice already paid; cascade skipped");
            return Ok(Vec::new());
        }
        if !invoice_payable(&status) {
            return Err(BillingError::InvoiceNotPayable { invoice_id, status });
        }

        sqlx::query("UPDATE tblinvoices SET status = $2 WHERE id = $1")
            .bind(invoice_id)
            .bind(INVOICE_PAID)
            .execute(&mut tx)
            .await?;

        let mut item_ids: Vec<i32> = sqlx::query_scalar(
            r#"
            UPDATE tblinvoiceitems
            SET notes = $2, status = 'Paid', updated_at = $3
            WHERE invoiceid = $1
            RETURNING id
            "#,
        )
        .bind(invoice_id)
        .bind(managed_note)
        .bind(at)
        .fetch_all(&mut tx)
        .await?;

        sqlx::query("UPDATE tblorders SET status = 'Active' WHERE invoiceid = $1")
            .bind(invoice_id)
            .execute(&mut tx)
            .await?;
        tx.commit().await?;

        item_ids.sort_unstable();
        Ok(item_ids)
    }

    async fn items_for_client(&self, client_id: i32) -> Result<Vec<BillingItem>, BillingError> {
        let rows = sqlx::query(
            r#"
            SELECT id, invoiceid, userid, description, status, notes, ipaddress, updated_at
            FROM tblinvoiceitems
            WHERE userid = $1
            ORDER BY id
            "#,
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }
}

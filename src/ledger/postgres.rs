use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::hypervisor::{GuestHandle, GuestKind, UsageSample};

use super::models::{
    idempotency_key, Allocation, AllocationId, AllocationSpec, AllocationStatus,
    ClusterConnection, ClusterHealth, ClusterSettings, ResourceUsage, UsageFreshness,
};
use super::{LedgerError, ResourceLedger};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

const ALLOCATION_COLUMNS: &str = r#"
    id,
    billing_item_id,
    cluster_id,
    guest_node,
    guest_vmid,
    guest_kind,
    idempotency_key,
    cpus,
    memory_mib,
    storage_gib,
    status,
    termination_requested,
    suspension_requested,
    notes,
    created_at,
    transitioned_at,
    updated_at
"#;

// key: ledger-postgres -> mod_proxmox_info,mod_proxmox_resource,mod_proxmox_usage
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn sql_error_code(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn to_i32(value: u32, field: &str) -> Result<i32, LedgerError> {
    i32::try_from(value).map_err(|_| LedgerError::InvalidSpec(format!("{field} is out of range")))
}

fn to_u32(value: i32, field: &str) -> Result<u32, LedgerError> {
    u32::try_from(value).map_err(|_| LedgerError::Corrupt(format!("negative {field}: {value}")))
}

fn allocation_from_row(row: &PgRow) -> Result<Allocation, LedgerError> {
    let status: String = row.try_get("status")?;
    let status = status.parse::<AllocationStatus>().map_err(LedgerError::Corrupt)?;
    let kind: String = row.try_get("guest_kind")?;
    let kind = kind.parse::<GuestKind>().map_err(LedgerError::Corrupt)?;

    let guest_node: Option<String> = row.try_get("guest_node")?;
    let guest_vmid: Option<i32> = row.try_get("guest_vmid")?;
    let guest = match (guest_node, guest_vmid) {
        (Some(node), Some(vmid)) => Some(GuestHandle {
            node,
            vmid: to_u32(vmid, "guest_vmid")?,
            kind,
        }),
        _ => None,
    };

    Ok(Allocation {
        id: row.try_get("id")?,
        billing_item_id: row.try_get("billing_item_id")?,
        cluster_id: row.try_get("cluster_id")?,
        status,
        spec: AllocationSpec {
            kind,
            cpus: to_u32(row.try_get("cpus")?, "cpus")?,
            memory_mib: to_u32(row.try_get("memory_mib")?, "memory_mib")?,
            storage_gib: to_u32(row.try_get("storage_gib")?, "storage_gib")?,
        },
        guest,
        idempotency_key: row.try_get("idempotency_key")?,
        termination_requested: row.try_get("termination_requested")?,
        suspension_requested: row.try_get("suspension_requested")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        transitioned_at: row.try_get("transitioned_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn cluster_from_row(row: &PgRow) -> Result<ClusterConnection, LedgerError> {
    let status: String = row.try_get("status")?;
    Ok(ClusterConnection {
        id: row.try_get("id")?,
        hostname: row.try_get("hostname")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        status: ClusterHealth::parse(&status),
        active: row.try_get("active")?,
        updated_at: row.try_get("updated_at")?,
        notes: row.try_get("notes")?,
    })
}

fn usage_from_row(row: &PgRow) -> Result<ResourceUsage, LedgerError> {
    let memory: i64 = row.try_get("memory_used_bytes")?;
    let storage: i64 = row.try_get("storage_used_bytes")?;
    let freshness: String = row.try_get("status")?;
    Ok(ResourceUsage {
        allocation_id: row.try_get("allocation_id")?,
        cpu_load: row.try_get("cpu_load")?,
        memory_used_bytes: u64::try_from(memory).unwrap_or(0),
        storage_used_bytes: u64::try_from(storage).unwrap_or(0),
        freshness: UsageFreshness::parse(&freshness),
        updated_at: row.try_get("updated_at")?,
        notes: row.try_get("notes")?,
    })
}

#[async_trait]
impl ResourceLedger for PgLedger {
    async fn create_allocation(
        &self,
        billing_item_id: i32,
        cluster_id: i32,
        spec: &AllocationSpec,
    ) -> Result<AllocationId, LedgerError> {
        spec.validate().map_err(LedgerError::InvalidSpec)?;
        if let Some(existing) = self.find_live_by_billing_item(billing_item_id).await? {
            return Err(LedgerError::DuplicateAllocation {
                billing_item_id,
                existing: existing.id,
            });
        }

        let id = AllocationId::new_v4();
        let key = idempotency_key(&id, spec);
        let inserted = sqlx::query(
            r#"
            INSERT INTO mod_proxmox_resource (
                id,
                billing_item_id,
                cluster_id,
                guest_kind,
                idempotency_key,
                cpus,
                memory_mib,
                storage_gib,
                status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending')
            "#,
        )
        .bind(id)
        .bind(billing_item_id)
        .bind(cluster_id)
        .bind(spec.kind.as_str())
        .bind(&key)
        .bind(to_i32(spec.cpus, "cpus")?)
        .bind(to_i32(spec.memory_mib, "memory_mib")?)
        .bind(to_i32(spec.storage_gib, "storage_gib")?)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(id),
            Err(error) if sql_error_code(&error).as_deref() == Some(UNIQUE_VIOLATION) => {
                // Lost a race against a concurrent insert for the same item.
                match self.find_live_by_billing_item(billing_item_id).await? {
                    Some(existing) => Err(LedgerError::DuplicateAllocation {
                        billing_item_id,
                        existing: existing.id,
                    }),
                    None => Err(LedgerError::Storage(error)),
                }
            }
            Err(error) => Err(LedgerError::Storage(error)),
        }
    }

    async fn update_status(
        &self,
        id: AllocationId,
        next: AllocationStatus,
    ) -> Result<Allocation, LedgerError> {
        let mut tx = self.pool.begin().await?;
        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM mod_proxmox_resource WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut tx)
                .await?;
        let current = current
            .ok_or(LedgerError::NotFound(id))?
            .parse::<AllocationStatus>()
            .map_err(LedgerError::Corrupt)?;

        if !current.can_transition_to(next) {
            tracing::warn!(allocation = %id, from = %current, to = %next, "rejected illegal status transition");
            return Err(LedgerError::InvalidTransition {
                id,
                from: current,
                to: next,
            });
        }

        let row = sqlx::query(&format!(
            "UPDATE mod_proxmox_resource SET status = $2, transitioned_at = NOW(), updated_at = NOW() WHERE id = $1 RETURNING {ALLOCATION_COLUMNS}"
        ))
        .bind(id)
        .bind(next.as_str())
        .fetch_one(&mut tx)
        .await?;
        let allocation = allocation_from_row(&row)?;
        tx.commit().await?;

        tracing::debug!(allocation = %id, from = %current, to = %next, "allocation status updated");
        Ok(allocation)
    }

    async fn get_allocation(&self, id: AllocationId) -> Result<Allocation, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM mod_proxmox_resource WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => allocation_from_row(&row),
            None => Err(LedgerError::NotFound(id)),
        }
    }

    async fn find_live_by_billing_item(
        &self,
        billing_item_id: i32,
    ) -> Result<Option<Allocation>, LedgerError> {
        let row = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM mod_proxmox_resource WHERE billing_item_id = $1 AND status <> 'terminated' LIMIT 1"
        ))
        .bind(billing_item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(allocation_from_row).transpose()
    }

    async fn list_by_status(
        &self,
        status: AllocationStatus,
    ) -> Result<Vec<Allocation>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM mod_proxmox_resource WHERE status = $1 ORDER BY transitioned_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(allocation_from_row).collect()
    }

    async fn list_for_billing_items(
        &self,
        billing_item_ids: &[i32],
    ) -> Result<Vec<Allocation>, LedgerError> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM mod_proxmox_resource WHERE billing_item_id = ANY($1) ORDER BY created_at DESC"
        ))
        .bind(billing_item_ids.to_vec())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(allocation_from_row).collect()
    }

    async fn record_guest(
        &self,
        id: AllocationId,
        guest: Option<&GuestHandle>,
    ) -> Result<(), LedgerError> {
        let (node, vmid) = match guest {
            Some(handle) => (Some(handle.node.clone()), Some(to_i32(handle.vmid, "vmid")?)),
            None => (None, None),
        };
        let result = sqlx::query(
            "UPDATE mod_proxmox_resource SET guest_node = $2, guest_vmid = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(node)
        .bind(vmid)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id));
        }
        Ok(())
    }

    async fn set_notes(&self, id: AllocationId, notes: &str) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE mod_proxmox_resource SET notes = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(notes)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id));
        }
        Ok(())
    }

    async fn request_termination(&self, id: AllocationId) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE mod_proxmox_resource SET termination_requested = TRUE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id));
        }
        Ok(())
    }

    async fn set_suspension_requested(
        &self,
        id: AllocationId,
        requested: bool,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE mod_proxmox_resource SET suspension_requested = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(requested)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id));
        }
        Ok(())
    }

    async fn purge(&self, id: AllocationId) -> Result<(), LedgerError> {
        let allocation = self.get_allocation(id).await?;
        if allocation.status != AllocationStatus::Terminated {
            return Err(LedgerError::NotPurgeable(id));
        }
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM mod_proxmox_usage WHERE allocation_id = $1")
            .bind(id)
            .execute(&mut tx)
            .await?;
        sqlx::query("DELETE FROM mod_proxmox_resource WHERE id = $1 AND status = 'terminated'")
            .bind(id)
            .execute(&mut tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_usage(
        &self,
        id: AllocationId,
        sample: &UsageSample,
        sampled_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO mod_proxmox_usage (
                allocation_id,
                cpu_load,
                memory_used_bytes,
                storage_used_bytes,
                status,
                updated_at,
                notes
            ) VALUES ($1, $2, $3, $4, 'fresh', $5, '')
            ON CONFLICT (allocation_id)
            DO UPDATE SET
                cpu_load = EXCLUDED.cpu_load,
                memory_used_bytes = EXCLUDED.memory_used_bytes,
                storage_used_bytes = EXCLUDED.storage_used_bytes,
                status = 'fresh',
                updated_at = EXCLUDED.updated_at,
                notes = ''
            "#,
        )
        .bind(id)
        .bind(sample.cpu_load)
        .bind(i64::try_from(sample.memory_used_bytes).unwrap_or(i64::MAX))
        .bind(i64::try_from(sample.storage_used_bytes).unwrap_or(i64::MAX))
        .bind(sampled_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if sql_error_code(&error).as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                Err(LedgerError::NotFound(id))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn mark_usage(
        &self,
        id: AllocationId,
        freshness: UsageFreshness,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO mod_proxmox_usage (
                allocation_id,
                cpu_load,
                memory_used_bytes,
                storage_used_bytes,
                status,
                updated_at,
                notes
            ) VALUES ($1, 0, 0, 0, $2, $3, $4)
            ON CONFLICT (allocation_id)
            DO UPDATE SET
                status = EXCLUDED.status,
                notes = EXCLUDED.notes
            "#,
        )
        .bind(id)
        .bind(freshness.as_str())
        .bind(at)
        .bind(note)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(error) if sql_error_code(&error).as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
                Err(LedgerError::NotFound(id))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn get_usage(&self, id: AllocationId) -> Result<Option<ResourceUsage>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT allocation_id, cpu_load, memory_used_bytes, storage_used_bytes, status, updated_at, notes
            FROM mod_proxmox_usage
            WHERE allocation_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(usage_from_row).transpose()
    }

    async fn upsert_cluster(
        &self,
        settings: &ClusterSettings,
    ) -> Result<ClusterConnection, LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO mod_proxmox_info (hostname, username, password, notes)
            VALUES ($1, $2, $3, COALESCE($4, ''))
            ON CONFLICT (hostname)
            DO UPDATE SET
                username = EXCLUDED.username,
                password = COALESCE(EXCLUDED.password, mod_proxmox_info.password),
                notes = COALESCE($4, mod_proxmox_info.notes),
                active = TRUE,
                updated_at = NOW()
            RETURNING id, hostname, username, password, status, active, updated_at, notes
            "#,
        )
        .bind(settings.hostname.trim())
        .bind(settings.username.trim())
        .bind(settings.password.as_deref())
        .bind(settings.notes.as_deref())
        .fetch_one(&self.pool)
        .await?;
        cluster_from_row(&row)
    }

    async fn get_cluster(&self, id: i32) -> Result<ClusterConnection, LedgerError> {
        let row = sqlx::query(
            "SELECT id, hostname, username, password, status, active, updated_at, notes FROM mod_proxmox_info WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => cluster_from_row(&row),
            None => Err(LedgerError::ClusterNotFound(id)),
        }
    }

    async fn list_clusters(&self) -> Result<Vec<ClusterConnection>, LedgerError> {
        let rows = sqlx::query(
            "SELECT id, hostname, username, password, status, active, updated_at, notes FROM mod_proxmox_info ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(cluster_from_row).collect()
    }

    async fn record_health(
        &self,
        id: i32,
        health: ClusterHealth,
        note: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE mod_proxmox_info SET status = $2, notes = $3, updated_at = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(health.as_str())
        .bind(note)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::ClusterNotFound(id));
        }
        Ok(())
    }

    async fn deactivate_cluster(&self, id: i32) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE mod_proxmox_info SET active = FALSE, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::ClusterNotFound(id));
        }
        Ok(())
    }
}

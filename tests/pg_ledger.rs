use chrono::Utc;
use pve_billing_bridge::billing::{
    BillingError, BillingItemUpdate, BillingStatus, BillingStore, PgBillingStore,
};
use pve_billing_bridge::hypervisor::{GuestHandle, GuestKind, UsageSample};
use pve_billing_bridge::ledger::{
    AllocationSpec, AllocationStatus, ClusterHealth, ClusterSettings, LedgerError, PgLedger,
    ResourceLedger, UsageFreshness,
};
use sqlx::PgPool;

// key: postgres-tests -> ledger constraints,invoice cascade

fn spec() -> AllocationSpec {
    AllocationSpec {
        kind: GuestKind::Qemu,
        cpus: 1,
        memory_mib: 1024,
        storage_gib: 10,
    }
}

async fn cluster(ledger: &PgLedger) -> i32 {
    ledger
        .upsert_cluster(&ClusterSettings {
            hostname: "pve.baonq.me".to_string(),
            username: "root@pam".to_string(),
            password: Some("secret".to_string()),
            notes: None,
        })
        .await
        .unwrap()
        .id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn allocation_lifecycle_is_enforced(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let ledger = PgLedger::new(pool.clone());
    let cluster_id = cluster(&ledger).await;

    let id = ledger.create_allocation(42, cluster_id, &spec()).await.unwrap();
    let duplicate = ledger.create_allocation(42, cluster_id, &spec()).await;
    assert!(matches!(
        duplicate,
        Err(LedgerError::DuplicateAllocation { existing, .. }) if existing == id
    ));

    let illegal = ledger.update_status(id, AllocationStatus::Active).await;
    assert!(matches!(illegal, Err(LedgerError::InvalidTransition { .. })));

    ledger
        .update_status(id, AllocationStatus::Provisioning)
        .await
        .unwrap();
    let guest = GuestHandle {
        node: "pve".to_string(),
        vmid: 105,
        kind: GuestKind::Qemu,
    };
    ledger.record_guest(id, Some(&guest)).await.unwrap();
    let active = ledger.update_status(id, AllocationStatus::Active).await.unwrap();
    assert_eq!(active.guest, Some(guest));

    let live = ledger.find_live_by_billing_item(42).await.unwrap().unwrap();
    assert_eq!(live.id, id);
    assert_eq!(
        ledger
            .list_by_status(AllocationStatus::Active)
            .await
            .unwrap()
            .len(),
        1
    );
    assert!(matches!(
        ledger.purge(id).await,
        Err(LedgerError::NotPurgeable(_))
    ));

    ledger.request_termination(id).await.unwrap();
    ledger
        .update_status(id, AllocationStatus::Terminating)
        .await
        .unwrap();
    let terminated = ledger
        .update_status(id, AllocationStatus::Terminated)
        .await
        .unwrap();
    assert!(terminated.termination_requested);
    assert!(ledger.find_live_by_billing_item(42).await.unwrap().is_none());

    // The item is free again once the previous allocation is terminated.
    ledger.create_allocation(42, cluster_id, &spec()).await.unwrap();
    ledger.purge(id).await.unwrap();
    assert!(matches!(
        ledger.get_allocation(id).await,
        Err(LedgerError::NotFound(_))
    ));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn usage_and_cluster_health_round_trip(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let ledger = PgLedger::new(pool.clone());
    let cluster_id = cluster(&ledger).await;
    let id = ledger.create_allocation(7, cluster_id, &spec()).await.unwrap();

    let sample = UsageSample {
        cpu_load: 0.75,
        memory_used_bytes: 2048,
        storage_used_bytes: 4096,
    };
    ledger.upsert_usage(id, &sample, Utc::now()).await.unwrap();
    ledger
        .mark_usage(id, UsageFreshness::Stale, "timeout", Utc::now())
        .await
        .unwrap();
    let usage = ledger.get_usage(id).await.unwrap().unwrap();
    assert_eq!(usage.freshness, UsageFreshness::Stale);
    assert_eq!(usage.memory_used_bytes, 2048);
    assert_eq!(usage.notes, "timeout");

    ledger
        .record_health(cluster_id, ClusterHealth::Unreachable, "no route", Utc::now())
        .await
        .unwrap();
    let cluster = ledger.get_cluster(cluster_id).await.unwrap();
    assert_eq!(cluster.status, ClusterHealth::Unreachable);

    ledger.deactivate_cluster(cluster_id).await.unwrap();
    assert!(!ledger.get_cluster(cluster_id).await.unwrap().active);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn invoice_paid_cascade_updates_items_and_orders(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    sqlx::query("INSERT INTO tblinvoices (id, userid) VALUES (10, 7)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO tblinvoiceitems (id, invoiceid, userid, description, notes) VALUES (1, 10, 7, 'VPS', ''), (2, 10, 7, 'VPS', '')",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("INSERT INTO tblorders (id, userid, invoiceid, status) VALUES (5, 7, 10, 'Pending')")
        .execute(&pool)
        .await
        .unwrap();

    let store = PgBillingStore::new(pool.clone());
    let items = store
        .apply_invoice_paid(10, "Managed by Proxmox addon", Utc::now())
        .await
        .unwrap();
    assert_eq!(items, vec![1, 2]);

    let item = store.get_billing_item(1).await.unwrap();
    assert_eq!(item.status, BillingStatus::Paid);
    assert_eq!(item.notes, "Managed by Proxmox addon");
    let order_status: String = sqlx::query_scalar("SELECT status FROM tblorders WHERE id = 5")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(order_status, "Active");
    let invoice_status: String = sqlx::query_scalar("SELECT status FROM tblinvoices WHERE id = 10")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(invoice_status, "Paid");
    assert!(store
        .apply_invoice_paid(10, "Managed by Proxmox addon", Utc::now())
        .await
        .unwrap()
        .is_empty());

    store
        .update_billing_item(
            1,
            &BillingItemUpdate::status(BillingStatus::Active, Utc::now())
                .with_ip_address(Some("10.0.0.5".to_string())),
        )
        .await
        .unwrap();
    let item = store.get_billing_item(1).await.unwrap();
    assert_eq!(item.ip_address.as_deref(), Some("10.0.0.5"));
    assert_eq!(store.items_for_client(7).await.unwrap().len(), 2);

    assert!(matches!(
        store.apply_invoice_paid(99, "note", Utc::now()).await,
        Err(BillingError::InvoiceNotFound(99))
    ));

    sqlx::query("INSERT INTO tblinvoices (id, userid, status) VALUES (11, 7, 'Cancelled')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO tblinvoiceitems (id, invoiceid, userid, description, notes) VALUES (3, 11, 7, 'VPS', '')",
    )
    .execute(&pool)
    .await
    .unwrap();
    assert!(matches!(
        store.apply_invoice_paid(11, "note", Utc::now()).await,
        Err(BillingError::InvoiceNotPayable { invoice_id: 11, .. })
    ));
    let item = store.get_billing_item(3).await.unwrap();
    assert_eq!(item.status, BillingStatus::Pending);
}

mod common;

use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use axum::http::StatusCode;
use common::{acquire_db_lock, expect_error, read_json, TestApp};
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::PgConnection;
use docledger::models::{AuditLog, Company, NewCompany};
use docledger::records::audit::{audited, AuditEntry, AuditLogFilter, EntityType};
use docledger::records::{audit, companies, RecordError, Role};
use docledger::schema::{audit_logs, companies as companies_table};
use serde_json::json;
use uuid::Uuid;

fn counts(conn: &mut PgConnection) -> Result<(i64, i64)> {
    let companies: i64 = companies_table::table.select(count_star()).first(conn)?;
    let logs: i64 = audit_logs::table.select(count_star()).first(conn)?;
    Ok((companies, logs))
}

#[tokio::test]
async fn mutation_and_audit_row_commit_together() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let admin = app.insert_user("admin", "pw", Role::Admin).await?;

    app.with_conn(move |conn| {
        // Entity written, then the process dies before the audit write.
        let crashed: Result<Company, RecordError> = audited(conn, &admin, |conn| {
            diesel::insert_into(companies_table::table)
                .values(&NewCompany {
                    id: Uuid::new_v4(),
                    name: "Ghost Ltd".into(),
                })
                .execute(conn)?;
            Err(RecordError::validation("simulated crash"))
        });
        assert!(crashed.is_err());
        assert_eq!(counts(conn)?, (0, 0));

        // Entity written, audit write itself fails.
        let audit_failed: Result<Company, RecordError> = audited(conn, &admin, |conn| {
            let company: Company = diesel::insert_into(companies_table::table)
                .values(&NewCompany {
                    id: Uuid::new_v4(),
                    name: "Phantom Ltd".into(),
                })
                .get_result(conn)?;
            let entry = AuditEntry::created(EntityType::Company, "x".repeat(500), &company)?;
            Ok((company, entry))
        });
        assert!(audit_failed.is_err());
        assert_eq!(counts(conn)?, (0, 0));

        let company = companies::create_company(conn, &admin, "Real Ltd")?;
        assert_eq!(counts(conn)?, (1, 1));
        let log: AuditLog = audit_logs::table.first(conn)?;
        assert_eq!(log.entity_type, "Company");
        assert_eq!(log.entity_id, company.id.to_string());
        assert_eq!(log.action, "create");
        assert_eq!(log.performed_by, admin.user_id);
        assert!(log.old_value.is_none());
        Ok(())
    })
    .await?;

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn each_mutation_leaves_exactly_one_entry() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let admin = app.insert_user("admin", "pw", Role::Admin).await?;

    app.with_conn(move |conn| {
        let company = companies::create_company(conn, &admin, "Northwind")?;
        companies::update_company(conn, &admin, company.id, "Northwind Traders")?;
        // Unchanged name: no entry.
        companies::update_company(conn, &admin, company.id, "Northwind Traders")?;
        companies::delete_company(conn, &admin, company.id)?;

        let history = audit::entity_history(conn, EntityType::Company, &company.id.to_string())?;
        let actions: Vec<&str> = history.iter().map(|log| log.action.as_str()).collect();
        assert_eq!(actions, vec!["create", "update", "delete"]);
        assert_eq!(history[1].old_value, Some(json!({ "name": "Northwind" })));
        assert_eq!(history[1].new_value, Some(json!({ "name": "Northwind Traders" })));
        assert!(history[2].new_value.is_none());

        let filtered = audit::list_audit_logs(
            conn,
            &AuditLogFilter {
                action: Some("update".into()),
                ..Default::default()
            },
        )?;
        assert_eq!(filtered.len(), 1);
        Ok(())
    })
    .await?;

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn audit_log_is_read_only_over_http() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let fixture = app.seed().await?;
    let admin_token = app.login_token("admin", "pw").await?;
    let editor_token = app.login_token("editor", "pw").await?;

    let response = app.get("/api/audit-logs?entity_type=Document", Some(&editor_token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let logs: Vec<serde_json::Value> = read_json(response).await?;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["entity_id"], fixture.document.id.to_string());
    let log_id = logs[0]["id"].as_str().unwrap_or_default().to_string();

    let response = app
        .get(&format!("/api/audit-logs/{log_id}"), Some(&editor_token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .post_json(
            "/api/audit-logs",
            &json!({ "entity_type": "Document", "entity_id": "x", "action": "create" }),
            Some(&admin_token),
        )
        .await?;
    assert_eq!(
        expect_error(response, StatusCode::METHOD_NOT_ALLOWED).await?,
        "immutability_violation"
    );

    let response = app
        .patch_json(
            &format!("/api/audit-logs/{log_id}"),
            &json!({ "action": "delete" }),
            Some(&admin_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = app
        .delete(&format!("/api/audit-logs/{log_id}"), Some(&admin_token))
        .await?;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let response = app.get("/api/audit-logs?action=purge", Some(&admin_token)).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    app.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_renames_chain_old_and_new_values() -> Result<()> {
    let _lock = acquire_db_lock().await;
    let app = TestApp::new().await?;
    let admin = app.insert_user("admin", "pw", Role::Admin).await?;
    let pool = app.state.pool.clone();

    let (company_id, final_name) = app
        .with_conn(move |conn| {
            let company = companies::create_company(conn, &admin, "A")?;
            let company_id = company.id;

            let renamers = conn.transaction::<_, anyhow::Error, _>(|conn| {
                companies_table::table
                    .find(company_id)
                    .for_update()
                    .first::<Company>(conn)?;

                let mut renamers = Vec::new();
                for name in ["B", "C"] {
                    let pool = pool.clone();
                    let admin = admin.clone();
                    renamers.push(thread::spawn(move || -> Result<()> {
                        let mut conn = pool.get()?;
                        companies::update_company(&mut conn, &admin, company_id, name)?;
                        Ok(())
                    }));
                    thread::sleep(Duration::from_millis(50));
                }
                thread::sleep(Duration::from_millis(150));
                Ok(renamers)
            })?;
            for renamer in renamers {
                renamer
                    .join()
                    .map_err(|_| anyhow!("rename thread panicked"))??;
            }

            let company = companies::get_company(conn, company_id)?;
            Ok((company_id, company.name))
        })
        .await?;

    let updates: Vec<AuditLog> = app
        .with_conn(move |conn| {
            Ok(
                audit::entity_history(conn, EntityType::Company, &company_id.to_string())?
                    .into_iter()
                    .filter(|log| log.action == "update")
                    .collect(),
            )
        })
        .await?;
    assert_eq!(updates.len(), 2);

    let renamed_from =
        |log: &AuditLog| log.old_value.as_ref().map(|value| value["name"].clone());
    let renamed_to =
        |log: &AuditLog| log.new_value.as_ref().map(|value| value["name"].clone());
    let (first, second) = if renamed_from(&updates[0]) == Some(json!("A")) {
        (&updates[0], &updates[1])
    } else {
        (&updates[1], &updates[0])
    };
    assert_eq!(renamed_from(first), Some(json!("A")));
    assert_eq!(renamed_from(second), renamed_to(first));
    assert_eq!(renamed_to(second), Some(json!(final_name)));

    app.cleanup().await?;
    Ok(())
}

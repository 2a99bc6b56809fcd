use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::NaiveDate;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::PgConnection;
use docledger::auth::jwt::JwtService;
use docledger::auth::password::hash_password;
use docledger::config::AppConfig;
use docledger::db::{self, PgPool};
use docledger::models::{Company, Document, NewUser, Project};
use docledger::records::documents::{create_document, CreateDocument};
use docledger::records::projects::{add_member, create_project, CreateProject};
use docledger::records::{companies, Actor, Role};
use docledger::routes;
use docledger::state::AppState;
use docledger::storage::ObjectStorage;
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tower::util::ServiceExt;
use uuid::Uuid;

static DB_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[allow(dead_code)]
#[derive(Clone)]
pub struct StoredObject {
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

#[derive(Default)]
pub struct FakeStorage {
    objects: Mutex<HashMap<String, StoredObject>>,
}

#[async_trait]
impl ObjectStorage for FakeStorage {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
        content_disposition: Option<String>,
    ) -> Result<()> {
        let stored = StoredObject {
            key: key.to_string(),
            bytes,
            content_type,
            content_disposition,
        };
        let mut guard = self.objects.lock().await;
        guard.insert(stored.key.clone(), stored);
        Ok(())
    }

    async fn presign_get_object(&self, key: &str, expires_in: Duration) -> Result<String> {
        let guard = self.objects.lock().await;
        ensure!(guard.contains_key(key), "object {key} missing");
        Ok(format!(
            "https://fake-storage/{key}?expires_in={}",
            expires_in.as_secs()
        ))
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let guard = self.objects.lock().await;
        guard
            .get(key)
            .map(|obj| obj.bytes.clone())
            .ok_or_else(|| anyhow!("object {key} missing"))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut guard = self.objects.lock().await;
        guard.remove(key);
        Ok(())
    }
}

impl FakeStorage {
    #[allow(dead_code)]
    pub async fn get(&self, key: &str) -> Option<StoredObject> {
        let guard = self.objects.lock().await;
        guard.get(key).cloned()
    }

    #[allow(dead_code)]
    pub async fn object_count(&self) -> usize {
        let guard = self.objects.lock().await;
        guard.len()
    }
}

/// Company, project and document created through the domain layer,
/// plus an admin and a member editor.
#[allow(dead_code)]
pub struct Fixture {
    pub admin: Actor,
    pub editor: Actor,
    pub company: Company,
    pub project: Project,
    pub document: Document,
}

pub struct TestApp {
    pub state: AppState,
    router: Router,
    storage: Arc<FakeStorage>,
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        let database_url = env::var("TEST_DATABASE_URL")
            .context("TEST_DATABASE_URL must be set for integration tests")?;

        let config = AppConfig {
            database_url: database_url.clone(),
            database_max_pool_size: 4,
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            jwt_secret: "test-secret".to_string(),
            jwt_issuer: "test-issuer".to_string(),
            jwt_audience: "test-audience".to_string(),
            jwt_expiry_minutes: 60,
            cors_allowed_origin: None,
            aws_endpoint_url: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            aws_region: "us-east-1".to_string(),
            s3_bucket: "test-bucket".to_string(),
            version_create_max_attempts: 3,
            version_create_retry_delay_ms: 10,
            max_upload_bytes: 1024 * 1024,
        };

        let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;
        prepare_database(&pool).await?;

        let storage = Arc::new(FakeStorage::default());
        let storage_for_state: Arc<dyn ObjectStorage> = storage.clone();
        let jwt = JwtService::from_config(&config)?;
        let state = AppState::new(pool.clone(), config, storage_for_state, jwt);
        let router = routes::create_router(state.clone())?;

        Ok(Self {
            state,
            router,
            storage,
        })
    }

    pub async fn cleanup(&self) -> Result<()> {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get cleanup connection: {err}"))?;
            truncate_all(&mut conn)?;
            Ok(())
        })
        .await
        .context("cleanup task panicked")?
    }

    #[allow(dead_code)]
    pub fn storage(&self) -> Arc<FakeStorage> {
        self.storage.clone()
    }

    pub async fn insert_user(&self, username: &str, password: &str, role: Role) -> Result<Actor> {
        let username = username.to_string();
        let password = password.to_string();
        self.with_conn(move |conn| {
            let user = NewUser {
                id: Uuid::new_v4(),
                username: username.clone(),
                password_hash: hash_password(&password)?,
                role: role.as_str().to_string(),
            };
            diesel::insert_into(docledger::schema::users::table)
                .values(&user)
                .execute(conn)
                .context("failed to insert user")?;
            Ok(Actor::new(user.id, username, role))
        })
        .await
    }

    pub async fn login_token(&self, username: &str, password: &str) -> Result<String> {
        #[derive(Serialize)]
        struct LoginPayload<'a> {
            username: &'a str,
            password: &'a str,
        }

        let response = self
            .post_json(
                "/api/auth/login",
                &LoginPayload { username, password },
                None,
            )
            .await?;

        ensure!(
            response.status() == StatusCode::OK,
            "login failed with status {}",
            response.status()
        );

        #[derive(serde::Deserialize)]
        struct LoginResponse {
            access_token: String,
        }
        let parsed: LoginResponse = read_json(response).await?;
        Ok(parsed.access_token)
    }

    /// Inserts a user and logs them in.
    #[allow(dead_code)]
    pub async fn user_with_token(&self, username: &str, role: Role) -> Result<(Actor, String)> {
        let actor = self.insert_user(username, "pw", role).await?;
        let token = self.login_token(username, "pw").await?;
        Ok((actor, token))
    }

    /// Seeds a company, an active project, an editor who is a member of it
    /// and one draft document.
    #[allow(dead_code)]
    pub async fn seed(&self) -> Result<Fixture> {
        let admin = self.insert_user("admin", "pw", Role::Admin).await?;
        let editor = self.insert_user("editor", "pw", Role::Editor).await?;
        let (admin_for_seed, editor_id) = (admin.clone(), editor.user_id);
        let (company, project, document) = self
            .with_conn(move |conn| {
                let company = companies::create_company(conn, &admin_for_seed, "Acme Engineering")?;
                let project = create_project(
                    conn,
                    &admin_for_seed,
                    CreateProject {
                        company_id: company.id,
                        code: "PRJ-1".into(),
                        name: "Water Treatment Plant".into(),
                        status: None,
                        start_date: NaiveDate::from_ymd_opt(2024, 1, 1)
                            .ok_or_else(|| anyhow!("bad date"))?,
                        end_date: None,
                    },
                )?;
                add_member(conn, &admin_for_seed, project.id, editor_id)?;
                let document = create_document(
                    conn,
                    &admin_for_seed,
                    CreateDocument {
                        project_id: project.id,
                        document_number: "MEC-001".into(),
                        title: "Pump layout".into(),
                        discipline: "MEC".into(),
                        doc_type: "DWG".into(),
                    },
                )?;
                Ok((company, project, document))
            })
            .await?;

        Ok(Fixture {
            admin,
            editor,
            company,
            project,
            document,
        })
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::POST, path, payload, token).await
    }

    #[allow(dead_code)]
    pub async fn patch_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        self.send_json(Method::PATCH, path, payload, token).await
    }

    async fn send_json<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        payload: &T,
        token: Option<&str>,
    ) -> Result<hyper::Response<Body>> {
        let body = serde_json::to_vec(payload)?;
        let mut builder = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn get(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    #[allow(dead_code)]
    pub async fn delete(&self, path: &str, token: Option<&str>) -> Result<hyper::Response<Body>> {
        let builder = Request::builder().method(Method::DELETE).uri(path);
        let builder = if let Some(token) = token {
            builder.header("authorization", format!("Bearer {token}"))
        } else {
            builder
        };
        let request = builder.body(Body::empty())?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    /// Multipart upload of `data` as the `file` field, with optional extra text fields.
    #[allow(dead_code)]
    pub async fn upload_version(
        &self,
        document_id: Uuid,
        filename: &str,
        data: &[u8],
        extra_fields: &[(&str, &str)],
        token: &str,
    ) -> Result<hyper::Response<Body>> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend(b"Content-Type: application/pdf\r\n\r\n");
        body.extend(data);
        body.extend(b"\r\n");

        for (name, value) in extra_fields {
            body.extend(format!("--{boundary}\r\n").as_bytes());
            body.extend(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            );
            body.extend(value.as_bytes());
            body.extend(b"\r\n");
        }

        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let builder = Request::builder()
            .method(Method::POST)
            .uri(format!("/api/documents/{document_id}/versions"))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .header("authorization", format!("Bearer {token}"));

        let request = builder.body(Body::from(body))?;
        Ok(self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("infallible response"))
    }

    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.state.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|err| anyhow!("failed to get database connection: {err}"))?;
            f(&mut conn)
        })
        .await
        .context("connection task panicked")?
    }
}

pub async fn acquire_db_lock() -> tokio::sync::MutexGuard<'static, ()> {
    DB_LOCK.lock().await
}

pub async fn body_to_vec(body: Body) -> Result<Vec<u8>> {
    let collected = body
        .collect()
        .await
        .map_err(|err| anyhow!("failed to read response body: {err}"))?;
    Ok(collected.to_bytes().to_vec())
}

#[allow(dead_code)]
pub async fn read_json<T: DeserializeOwned>(response: hyper::Response<Body>) -> Result<T> {
    let body = body_to_vec(response.into_body()).await?;
    serde_json::from_slice(&body).with_context(|| {
        format!(
            "unexpected response body: {}",
            String::from_utf8_lossy(&body)
        )
    })
}

/// Asserts the status and returns the `code` of an error body.
#[allow(dead_code)]
pub async fn expect_error(response: hyper::Response<Body>, status: StatusCode) -> Result<String> {
    ensure!(
        response.status() == status,
        "expected {status}, got {}",
        response.status()
    );
    let body: serde_json::Value = read_json(response).await?;
    body.get("code")
        .and_then(|code| code.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("error body without code: {body}"))
}

async fn prepare_database(pool: &PgPool) -> Result<()> {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut conn = pool
            .get()
            .map_err(|err| anyhow!("failed to acquire connection: {err}"))?;
        db::run_migrations(&mut conn)?;
        truncate_all(&mut conn)?;
        Ok(())
    })
    .await
    .context("migration task panicked")?
}

fn truncate_all(conn: &mut PgConnection) -> Result<()> {
    conn.batch_execute(
        "TRUNCATE TABLE audit_logs, document_versions, documents, project_members, projects, companies, users RESTART IDENTITY CASCADE;",
    )
    .context("failed to truncate tables")?;
    Ok(())
}

//! Read-only views of data owned by other services: accounts (identity
//! service) and pay-per-view listings (content service).

use crate::domain::ContentKind;
use crate::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountRole {
    Fan,
    Creator,
    Admin,
}

impl AccountRole {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "fan" | "user" => Some(AccountRole::Fan),
            "creator" => Some(AccountRole::Creator),
            "admin" => Some(AccountRole::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub role: AccountRole,
    pub is_active: bool,
    pub is_verified: bool,
}

impl Account {
    pub fn is_active_creator(&self) -> bool {
        self.is_active && self.role == AccountRole::Creator
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_account(&self, id: Uuid) -> ServiceResult<Option<Account>>;

    /// The account, or `NotFound` naming `what`
    async fn require_account(&self, id: Uuid, what: &str) -> ServiceResult<Account> {
        self.find_account(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("{} {}", what, id)))
    }
}

/// A piece of content sold pay-per-view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentListing {
    pub id: Uuid,
    pub kind: ContentKind,
    pub owner_id: Uuid,
    /// `None` when the content is not for sale
    pub price: Option<i64>,
    pub currency: String,
}

#[async_trait]
pub trait ContentCatalog: Send + Sync {
    async fn find_listing(&self, id: Uuid, kind: ContentKind)
        -> ServiceResult<Option<ContentListing>>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[derive(Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_account(&self, id: Uuid) -> ServiceResult<Option<Account>> {
        let row: Option<(Uuid, String, bool, bool)> = sqlx::query_as(
            r#"
            SELECT id, role, is_active, is_verified
            FROM users
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, role, is_active, is_verified)| {
            let role = AccountRole::parse(&role).ok_or_else(|| {
                ServiceError::Internal(format!("user {} has unknown role '{}'", id, role))
            })?;
            Ok(Account {
                id,
                role,
                is_active,
                is_verified,
            })
        })
        .transpose()
    }
}

#[derive(Clone)]
pub struct PgContentCatalog {
    pool: PgPool,
}

impl PgContentCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn table(kind: ContentKind) -> &'static str {
        match kind {
            ContentKind::Post => "posts",
            ContentKind::ShortVideo => "short_videos",
            ContentKind::Message => "messages",
        }
    }
}

#[async_trait]
impl ContentCatalog for PgContentCatalog {
    async fn find_listing(
        &self,
        id: Uuid,
        kind: ContentKind,
    ) -> ServiceResult<Option<ContentListing>> {
        let sql = format!(
            "SELECT creator_id, ppv_price, ppv_currency FROM {} WHERE id = $1 AND deleted_at IS NULL",
            Self::table(kind)
        );
        let row: Option<(Uuid, Option<i64>, Option<String>)> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(owner_id, price, currency)| ContentListing {
            id,
            kind,
            owner_id,
            price,
            currency: currency.unwrap_or_else(|| "USD".to_string()),
        }))
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Default)]
pub struct MemoryUserDirectory {
    accounts: RwLock<HashMap<Uuid, Account>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account: Account) {
        self.accounts.write().insert(account.id, account);
    }

    /// Register an active, verified account with `role` and return its id
    pub fn add(&self, role: AccountRole) -> Uuid {
        let id = Uuid::new_v4();
        self.insert(Account {
            id,
            role,
            is_active: true,
            is_verified: true,
        });
        id
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_account(&self, id: Uuid) -> ServiceResult<Option<Account>> {
        Ok(self.accounts.read().get(&id).cloned())
    }
}

#[derive(Default)]
pub struct MemoryContentCatalog {
    listings: RwLock<HashMap<(Uuid, ContentKind), ContentListing>>,
}

impl MemoryContentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, listing: ContentListing) {
        self.listings
            .write()
            .insert((listing.id, listing.kind), listing);
    }
}

#[async_trait]
impl ContentCatalog for MemoryContentCatalog {
    async fn find_listing(
        &self,
        id: Uuid,
        kind: ContentKind,
    ) -> ServiceResult<Option<ContentListing>> {
        Ok(self.listings.read().get(&(id, kind)).cloned())
    }
}

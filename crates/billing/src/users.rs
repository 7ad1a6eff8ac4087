//! User directory
//!
//! Reads the profile fields reconciliation needs and clears the one-shot offer flag.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::UserProfile;

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>>;

    /// Clear the pending offer. Returns `true` only for the caller that cleared it.
    async fn clear_offer(&self, user_id: Uuid) -> BillingResult<bool>;
}

pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    user_id: Uuid,
    email: String,
    display_name: Option<String>,
    has_offer: bool,
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>> {
        let row: Option<ProfileRow> = sqlx::query_as(
            "SELECT user_id, email, display_name, has_offer FROM user_profiles WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| UserProfile {
            user_id: r.user_id,
            email: r.email,
            display_name: r.display_name,
            has_offer: r.has_offer,
        }))
    }

    async fn clear_offer(&self, user_id: Uuid) -> BillingResult<bool> {
        let cleared: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE user_profiles
            SET has_offer = FALSE, updated_at = NOW()
            WHERE user_id = $1 AND has_offer
            RETURNING user_id
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(cleared.is_some())
    }
}

/// Directory backed by a map, for tests and local runs
#[derive(Default)]
pub struct InMemoryUserDirectory {
    profiles: Mutex<HashMap<Uuid, UserProfile>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, profile: UserProfile) {
        self.profiles.lock().await.insert(profile.user_id, profile);
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>> {
        Ok(self.profiles.lock().await.get(&user_id).cloned())
    }

    async fn clear_offer(&self, user_id: Uuid) -> BillingResult<bool> {
        let mut profiles = self.profiles.lock().await;
        match profiles.get_mut(&user_id) {
            Some(profile) if profile.has_offer => {
                profile.has_offer = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_cleared_once() {
        let directory = InMemoryUserDirectory::new();
        let user_id = Uuid::new_v4();
        directory
            .insert(UserProfile {
                user_id,
                email: "ada@example.com".into(),
                display_name: Some("Ada".into()),
                has_offer: true,
            })
            .await;

        assert!(directory.clear_offer(user_id).await.unwrap());
        assert!(!directory.clear_offer(user_id).await.unwrap());
        assert!(!directory.get_profile(user_id).await.unwrap().unwrap().has_offer);
    }
}

use sqlx::PgPool;
use uuid::Uuid;

use super::paging::PageRequest;
use crate::{
    db::{is_foreign_key_violation, is_unique_violation},
    error::TenantError,
    models::user::{
        AddTenantUserRequest, CreateUserRequest, ListUsersQuery, TenantUser, TenantUserPage,
        UpdateUserRequest, User, UserPage,
    },
};

const MAX_EMAIL_LEN: usize = 254;

/// Users and tenant memberships, stored in the control database.
pub struct UserService;

impl UserService {
    pub async fn create(pool: &PgPool, req: &CreateUserRequest) -> Result<User, TenantError> {
        let email = normalize_email(&req.email)?;
        let display_name = require_display_name(&req.display_name)?;

        sqlx::query_as::<_, User>(
            "INSERT INTO users (email, display_name)
             VALUES ($1, $2)
             RETURNING *",
        )
        .bind(&email)
        .bind(display_name)
        .fetch_one(pool)
        .await
        .map_err(|e| email_conflict(&email, e))
    }

    pub async fn get(pool: &PgPool, id: Uuid) -> Result<User, TenantError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or_else(|| user_not_found(id))
    }

    pub async fn list(pool: &PgPool, query: &ListUsersQuery) -> Result<UserPage, TenantError> {
        let page = PageRequest::parse(query.page_size, query.page_token.as_deref())?;

        let total_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(pool)
            .await?;
        let users = sqlx::query_as::<_, User>(
            "SELECT * FROM users
             ORDER BY created_at DESC, email
             LIMIT $1 OFFSET $2",
        )
        .bind(page.size)
        .bind(page.offset)
        .fetch_all(pool)
        .await?;

        Ok(UserPage {
            next_page_token: page.next_token(users.len(), total_count),
            users,
            total_count,
        })
    }

    pub async fn update(pool: &PgPool, id: Uuid, req: &UpdateUserRequest) -> Result<User, TenantError> {
        let email = req.email.as_deref().map(normalize_email).transpose()?;
        let display_name = req
            .display_name
            .as_deref()
            .map(require_display_name)
            .transpose()?;

        sqlx::query_as::<_, User>(
            "UPDATE users SET
               email        = COALESCE($2, email),
               display_name = COALESCE($3, display_name),
               updated_at   = NOW()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(&email)
        .bind(display_name)
        .fetch_optional(pool)
        .await
        .map_err(|e| email_conflict(email.as_deref().unwrap_or_default(), e))?
        .ok_or_else(|| user_not_found(id))
    }

    /// Removes the user and every membership they hold.
    pub async fn delete(pool: &PgPool, id: Uuid) -> Result<(), TenantError> {
        let deleted = sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(user_not_found(id));
        }
        Ok(())
    }

    /// Adds the user to the tenant, or updates role and status if they are
    /// already a member. Deleted tenants accept no members.
    pub async fn add_to_tenant(
        pool: &PgPool,
        tenant_id: Uuid,
        req: &AddTenantUserRequest,
    ) -> Result<TenantUser, TenantError> {
        let membership = sqlx::query_as::<_, TenantUser>(
            "INSERT INTO tenant_users (tenant_id, user_id, role, status)
             SELECT t.id, $2, $3, $4 FROM tenants t
             WHERE t.id = $1 AND t.status <> 'deleted'
             ON CONFLICT (tenant_id, user_id) DO UPDATE SET
               role       = EXCLUDED.role,
               status     = EXCLUDED.status,
               updated_at = NOW()
             RETURNING *",
        )
        .bind(tenant_id)
        .bind(req.user_id)
        .bind(req.role)
        .bind(req.status)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                user_not_found(req.user_id)
            } else {
                e.into()
            }
        })?;

        membership.ok_or_else(|| TenantError::tenant_not_found(tenant_id))
    }

    pub async fn remove_from_tenant(pool: &PgPool, tenant_id: Uuid, user_id: Uuid) -> Result<(), TenantError> {
        let removed = sqlx::query("DELETE FROM tenant_users WHERE tenant_id = $1 AND user_id = $2")
            .bind(tenant_id)
            .bind(user_id)
            .execute(pool)
            .await?;
        if removed.rows_affected() == 0 {
            return Err(TenantError::NotFound(format!(
                "user {user_id} is not a member of tenant {tenant_id}"
            )));
        }
        Ok(())
    }

    pub async fn list_tenant_users(
        pool: &PgPool,
        tenant_id: Uuid,
        query: &ListUsersQuery,
    ) -> Result<TenantUserPage, TenantError> {
        let page = PageRequest::parse(query.page_size, query.page_token.as_deref())?;

        let total_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM tenant_users WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(pool)
                .await?;
        let members = sqlx::query_as::<_, TenantUser>(
            "SELECT * FROM tenant_users
             WHERE tenant_id = $1
             ORDER BY created_at, user_id
             LIMIT $2 OFFSET $3",
        )
        .bind(tenant_id)
        .bind(page.size)
        .bind(page.offset)
        .fetch_all(pool)
        .await?;

        Ok(TenantUserPage {
            next_page_token: page.next_token(members.len(), total_count),
            members,
            total_count,
        })
    }
}

fn user_not_found(id: Uuid) -> TenantError {
    TenantError::NotFound(format!("user not found: {id}"))
}

fn email_conflict(email: &str, err: sqlx::Error) -> TenantError {
    if is_unique_violation(&err) {
        TenantError::Conflict(format!("a user with email '{email}' already exists"))
    } else {
        err.into()
    }
}

/// Trims and lowercases; emails compare case-insensitively.
fn normalize_email(email: &str) -> Result<String, TenantError> {
    let email = email.trim().to_lowercase();
    let valid = email.len() <= MAX_EMAIL_LEN
        && !email.chars().any(char::is_whitespace)
        && matches!(
            email.split_once('@'),
            Some((local, domain))
                if !local.is_empty()
                    && !domain.contains('@')
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
        );
    if !valid {
        return Err(TenantError::InvalidInput(format!("invalid email address: {email:?}")));
    }
    Ok(email)
}

fn require_display_name(name: &str) -> Result<&str, TenantError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TenantError::InvalidInput("display_name must not be empty".into()));
    }
    Ok(name)
}

use crate::common::models::{from_millis, Profile, Role, User, UserSummary};
use crate::server::database::Database;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;

const USER_COLUMNS: &str = "id, username, email, role, avatar, bio, is_online, created_at";

fn row_to_user(row: &SqliteRow) -> User {
    let role: String = row.get("role");
    User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        role: Role::parse(&role).unwrap_or(Role::Client),
        profile: Profile {
            avatar: row.get("avatar"),
            bio: row.get("bio"),
        },
        is_online: row.get::<i64, _>("is_online") != 0,
        created_at: from_millis(row.get("created_at")),
    }
}

pub async fn find_user(db: &Database, user_id: &str) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS))
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.as_ref().map(row_to_user))
}

pub async fn find_id_by_email(db: &Database, email: &str) -> Result<Option<String>, sqlx::Error> {
    let row = sqlx::query("SELECT id FROM users WHERE email = ?")
        .bind(email)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.map(|r| r.get("id")))
}

pub async fn exists(db: &Database, user_id: &str) -> Result<bool, sqlx::Error> {
    let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(&db.pool)
        .await?;
    Ok(row.is_some())
}

/// Resolves a set of user ids to their summaries. Unknown ids are left out.
pub async fn summaries<'a, I>(db: &Database, ids: I) -> Result<HashMap<String, UserSummary>, sqlx::Error>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut wanted: Vec<&str> = ids.into_iter().collect();
    wanted.sort_unstable();
    wanted.dedup();
    if wanted.is_empty() {
        return Ok(HashMap::new());
    }

    let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(format!("SELECT {} FROM users WHERE id IN (", USER_COLUMNS));
    let mut sep = qb.separated(", ");
    for id in &wanted {
        sep.push_bind(*id);
    }
    sep.push_unseparated(")");

    let rows = qb.build().fetch_all(&db.pool).await?;
    Ok(rows
        .iter()
        .map(row_to_user)
        .map(|u| (u.id.clone(), UserSummary::from(u)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn summaries_skip_unknown_ids() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("INSERT INTO users (id, username, email, role, created_at) VALUES ('u1', 'ann', 'ann@x.io', 'freelancer', 0)")
            .execute(&db.pool)
            .await
            .unwrap();

        let found = summaries(&db, ["u1", "ghost", "u1"]).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["u1"].username, "ann");
        assert!(!found["u1"].is_online);
        assert!(summaries(&db, Vec::<&str>::new()).await.unwrap().is_empty());

        let user = find_user(&db, "u1").await.unwrap().unwrap();
        assert_eq!(user.role, Role::Freelancer);
        assert!(exists(&db, "u1").await.unwrap());
        assert!(!exists(&db, "ghost").await.unwrap());
    }
}

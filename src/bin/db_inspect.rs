use bidhub::server::config::ServerConfig;
use bidhub::server::database::Database;
use sqlx::Row;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    println!("Connecting to {}", config.database_url);
    let db = Database::connect(&config.database_url).await?;

    println!("\n-- projects --");
    let rows = sqlx::query("SELECT id, title, client_id, freelancer_id, budget, status, version FROM projects ORDER BY created_at DESC")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let title: String = r.try_get("title").unwrap_or_default();
        let client_id: String = r.try_get("client_id").unwrap_or_default();
        let freelancer_id: Option<String> = r.try_get("freelancer_id").unwrap_or(None);
        let budget: f64 = r.try_get("budget").unwrap_or(0.0);
        let status: String = r.try_get("status").unwrap_or_default();
        let version: i64 = r.try_get("version").unwrap_or(0);
        println!(
            "id={} title={:?} client={} freelancer={} budget={:.2} status={} v{}",
            id,
            title,
            client_id,
            freelancer_id.as_deref().unwrap_or("-"),
            budget,
            status,
            version
        );
    }

    println!("\n-- bids --");
    let rows = sqlx::query("SELECT id, project_id, freelancer_id, amount, status FROM bids ORDER BY submitted_at DESC")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let project_id: String = r.try_get("project_id").unwrap_or_default();
        let freelancer_id: String = r.try_get("freelancer_id").unwrap_or_default();
        let amount: f64 = r.try_get("amount").unwrap_or(0.0);
        let status: String = r.try_get("status").unwrap_or_default();
        println!("id={} project={} freelancer={} amount={:.2} status={}", id, project_id, freelancer_id, amount, status);
    }

    println!("\n-- conversations --");
    let rows = sqlx::query(
        "SELECT c.id, c.participant_key, c.project_id, COUNT(m.id) AS messages \
         FROM conversations c LEFT JOIN messages m ON m.conversation_id = c.id GROUP BY c.id ORDER BY c.updated_at DESC",
    )
    .fetch_all(&db.pool)
    .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let participants: String = r.try_get("participant_key").unwrap_or_default();
        let project_id: String = r.try_get("project_id").unwrap_or_default();
        let messages: i64 = r.try_get("messages").unwrap_or(0);
        println!("id={} participants={} project={} messages={}", id, participants, project_id, messages);
    }

    println!("\n-- payments --");
    let rows = sqlx::query("SELECT id, project_id, amount, fee, total, status, card_last4 FROM payments ORDER BY created_at DESC")
        .fetch_all(&db.pool)
        .await?;
    for r in rows.iter() {
        let id: String = r.try_get("id").unwrap_or_default();
        let project_id: String = r.try_get("project_id").unwrap_or_default();
        let amount: f64 = r.try_get("amount").unwrap_or(0.0);
        let fee: f64 = r.try_get("fee").unwrap_or(0.0);
        let total: f64 = r.try_get("total").unwrap_or(0.0);
        let status: String = r.try_get("status").unwrap_or_default();
        let last4: Option<String> = r.try_get("card_last4").unwrap_or(None);
        println!(
            "id={} project={} amount={:.2} fee={:.2} total={:.2} status={} card=****{}",
            id,
            project_id,
            amount,
            fee,
            total,
            status,
            last4.as_deref().unwrap_or("----")
        );
    }

    Ok(())
}

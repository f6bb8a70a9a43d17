use std::env;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use dead_letter::{DeadLetterFilter, DeadLetterStore, SqlxDeadLetterStore};
use transactional_outbox::{reprocess_dead_letter, SqlxOutboxStore};

fn usage() -> ! {
    eprintln!("Usage:");
    eprintln!("  outbox-cli replay-since <rfc3339_ts> <DATABASE_URL>");
    eprintln!("  outbox-cli replay-range <from_uuid> <to_uuid> <DATABASE_URL>");
    eprintln!("  outbox-cli dlq-list <service_name> <DATABASE_URL>");
    eprintln!("  outbox-cli dlq-reprocess <dlq_uuid> <DATABASE_URL> [notes]");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
    }

    let cmd = args[1].as_str();

    match cmd {
        "replay-since" if args.len() == 4 => {
            let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&args[2])?.with_timezone(&Utc);
            let pool = PgPool::connect(&args[3]).await?;
            let store = SqlxOutboxStore::new(pool);
            let count = store.replay_since(ts).await?;
            println!("Replayed {} entries since {}", count, ts);
        }
        "replay-range" if args.len() == 5 => {
            let from = Uuid::parse_str(&args[2])?;
            let to = Uuid::parse_str(&args[3])?;
            let pool = PgPool::connect(&args[4]).await?;
            let store = SqlxOutboxStore::new(pool);
            let count = store.replay_range(from, to).await?;
            println!("Replayed {} entries between {} and {}", count, from, to);
        }
        "dlq-list" if args.len() == 4 => {
            let pool = PgPool::connect(&args[3]).await?;
            let dlq = SqlxDeadLetterStore::new(pool);
            let entries = dlq
                .list(DeadLetterFilter {
                    service_name: Some(args[2].clone()),
                    ..Default::default()
                })
                .await?;
            for entry in entries {
                println!(
                    "{}  {}  {}  attempts={}  moved={}",
                    entry.id,
                    entry.event_type,
                    entry.failure_reason,
                    entry.total_attempts,
                    entry.moved_to_dlq_at.to_rfc3339()
                );
            }
        }
        "dlq-reprocess" if args.len() >= 4 => {
            let id = Uuid::parse_str(&args[2])?;
            let pool = PgPool::connect(&args[3]).await?;
            let notes = args.get(4).cloned();
            let dlq = SqlxDeadLetterStore::new(pool.clone());
            let outbox = SqlxOutboxStore::new(pool.clone());
            let event_id = reprocess_dead_letter(&pool, &dlq, &outbox, id, notes).await?;
            println!("Entry {} queued for republication as event {}", id, event_id);
        }
        _ => usage(),
    }

    Ok(())
}

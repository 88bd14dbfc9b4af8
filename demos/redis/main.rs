//! Queue, lock and cron against a real Redis.
//!
//! Prerequisites:
//! - Redis server running on localhost:6379 (override with `REDIS_URL`)
//!
//! Run with: `cargo run -p demo-redis`
//! Start it twice to watch two processes share the work.

use fleet::{Fleet, JobError, JobResult, LockOptions, Payload};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// Payment processing job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PaymentJob {
    order_id: String,
    amount: f64,
    currency: String,
}

async fn process_payment(id: String, payload: Payload) -> JobResult {
    let job: PaymentJob = payload
        .decode()?
        .ok_or_else(|| JobError::new("missing payment payload"))?;

    println!(
        "[payment] id={} order={} amount={:.2} {}",
        id,
        job.order_id,
        job.amount,
        job.currency.to_uppercase()
    );
    tokio::time::sleep(Duration::from_millis(800)).await;
    Ok(())
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

#[tokio::main]
async fn main() -> fleet::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,fleet_core=debug".into()),
        )
        .init();

    let fleet = match Fleet::from_env().await {
        Ok(fleet) => fleet,
        Err(e) => {
            eprintln!("Failed to connect: {}", e);
            eprintln!("Make sure Redis is running: docker run -d -p 6379:6379 redis");
            return Err(e);
        }
    };

    // Queue
    let queue = fleet.queue("payments");
    let worker = fleet.worker(&queue);
    let payments = worker.on("process_payment", process_payment);

    for (n, amount) in [99.99, 149.50].into_iter().enumerate() {
        let job = PaymentJob {
            order_id: format!("ORD-{:03}", n + 1),
            amount,
            currency: "usd".to_string(),
        };
        payments.push(&job.order_id, Payload::new(&job)?).await?;
    }
    println!("pending: {}", queue.pending_len().await?);

    // Lock
    let locks = fleet.locks().clone();
    let total = locks
        .start("daily-report", LockOptions::default(), || async {
            println!("[lock] building report");
            tokio::time::sleep(Duration::from_millis(300)).await;
            2
        })
        .await?;
    println!("[lock] report covered {} orders", total);

    // Cron
    let cron = fleet.cron(&worker, "demo-v1");
    let every_five = cron.on("*/5 * * * * *", || async {
        println!("[cron] tick");
        Ok(())
    })?;
    let throttled = cron.on("* * * * * *", move || {
        let locks = locks.clone();
        async move {
            locks
                .throttle("sms", Duration::from_secs(3), || async {
                    println!("[cron] throttled sms");
                })
                .await?;
            Ok::<(), JobError>(())
        }
    })?;
    println!("cron schedules: {}, {}", every_five, throttled);

    println!("\nPress Ctrl+C to stop\n");
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = stop_tx.send(true);
    });

    let (consumed, ()) = tokio::join!(
        worker.run_until(wait_for(stop_rx.clone())),
        cron.run_until(wait_for(stop_rx)),
    );
    consumed?;

    println!("\nDone");
    Ok(())
}

//! Background scheduler against a real runtime.

use std::sync::Arc;
use std::time::Duration;

use elis_sync::store::EventStore;
use elis_sync::{EventFilter, RetryConfig, RetryQueue, RetryScheduler};
use elis_sync_testkit::{memory_store, sqlite_on_disk, TestFixture};

fn fast_config() -> RetryConfig {
    RetryConfig {
        cycle_interval: Duration::from_millis(20),
        attempt_timeout: Duration::from_secs(1),
        ..RetryConfig::default()
    }
}

async fn wait_until_empty<S, A, R>(queue: &RetryQueue<S, A, R>) -> anyhow::Result<()>
where
    S: EventStore + 'static,
    A: elis_sync::delivery::DeliveryAttempter + 'static,
    R: elis_sync::delivery::SubjectResolver + 'static,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if queue.list_events(&EventFilter::all()).await?.is_empty() {
                return anyhow::Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?
}

#[tokio::test]
async fn scheduler_delivers_and_stops() -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let queue = Arc::new(
        RetryQueue::new(
            memory_store(),
            fx.attempter.clone(),
            fx.resolver.clone(),
            fast_config(),
        )
        .with_clock(fx.clock()),
    );

    queue.admit(fx.test_order(1)).await?;
    queue.admit(fx.lab_test(2, "CBC")).await?;

    let scheduler = RetryScheduler::start(Arc::clone(&queue));
    assert!(scheduler.is_running());

    wait_until_empty(&queue).await?;
    assert_eq!(fx.attempter.call_count(), 2);

    scheduler.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn scheduler_recovers_interrupted_events_on_start() -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let (store, _dir) = sqlite_on_disk();
    let queue = Arc::new(
        RetryQueue::new(store, fx.attempter.clone(), fx.resolver.clone(), fast_config())
            .with_clock(fx.clock()),
    );

    let id = queue.admit(fx.patient(7, "P-007", 1)).await?.id();
    queue.store().claim(id, fx.now()).await?;

    let scheduler = RetryScheduler::start(Arc::clone(&queue));
    wait_until_empty(&queue).await?;
    scheduler.shutdown().await?;

    assert!(queue.get_event(id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn disabled_scheduler_leaves_events() -> anyhow::Result<()> {
    let fx = TestFixture::new();
    let config = RetryConfig {
        enabled: false,
        ..fast_config()
    };
    let queue = Arc::new(
        RetryQueue::new(memory_store(), fx.attempter.clone(), fx.resolver.clone(), config)
            .with_clock(fx.clock()),
    );
    let id = queue.admit(fx.test_order(1)).await?.id();

    let scheduler = RetryScheduler::start(Arc::clone(&queue));
    tokio::time::sleep(Duration::from_millis(100)).await;
    scheduler.shutdown().await?;

    assert_eq!(fx.attempter.call_count(), 0);
    assert!(queue.get_event(id).await?.is_some());
    Ok(())
}
